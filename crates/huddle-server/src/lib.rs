//! Huddle chat relay server.
//!
//! Clients connect over TCP, register a unique username, and exchange short
//! text messages that are broadcast to every registered client and persisted
//! for replay when users come back.
//!
//! # Architecture
//!
//! - [`Session`]: per-connection state machine (pure logic, no I/O)
//! - [`SessionRegistry`]: active sessions with atomic username claims
//! - [`BroadcastHub`]: ordering section for admission, publish and departure
//! - [`Supervisor`]: read loop and writer task per transport
//! - [`Storage`]: persistence port with memory, Redb and fault-injecting
//!   backends
//! - [`Server`]: TCP accept loop and graceful shutdown

#![forbid(unsafe_code)]

mod env;
mod error;
mod hub;
mod registry;
mod session;
pub mod storage;
mod supervisor;

use std::{future::Future, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

pub use env::{Environment, ManualEnv, SystemEnv, Timestamp};
pub use error::ServerError;
use huddle_proto::{DEFAULT_PORT, ServerLine};
pub use hub::{Admission, BroadcastHub, DEFAULT_HISTORY_LIMIT, FanOut};
pub use registry::{Delivery, Recipient, RegistryError, SessionHandle, SessionId, SessionRegistry};
pub use session::{Session, SessionAction, SessionError, SessionState};
pub use storage::{
    ChaoticStorage, ChatMessage, MemoryStorage, RedbStorage, Storage, StorageError, UserRecord,
};
pub use supervisor::{CloseReason, SessionConfig, Supervisor};
use tokio::{net::TcpListener, task::JoinSet};

/// Notice broadcast to every session before the server stops.
pub const SHUTDOWN_NOTICE: &str = "Server is shutting down.";

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Where users and history are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// Lost on exit
    InMemory,
    /// Durable Redb database
    Redb {
        /// Database file
        path: PathBuf,
        /// Delete the file before opening it
        fresh: bool,
    },
}

impl StorageBackend {
    /// Open the Redb backend.
    ///
    /// # Errors
    ///
    /// - `ServerError::Config` if called on `InMemory` or the stale database
    ///   cannot be removed
    /// - `ServerError::Storage` if the database cannot be opened
    pub fn open_redb(&self) -> Result<RedbStorage, ServerError> {
        let Self::Redb { path, fresh } = self else {
            return Err(ServerError::Config("not a Redb backend".to_string()));
        };

        if *fresh {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::info!(path = %path.display(), "removed existing database"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => {
                    return Err(ServerError::Config(format!(
                        "cannot remove {}: {e}",
                        path.display()
                    )));
                },
            }
        }

        Ok(RedbStorage::open(path)?)
    }
}

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to (e.g., "127.0.0.1:42424")
    pub bind_address: String,
    /// Persistence backend
    pub storage: StorageBackend,
    /// Maximum concurrent connections; extra connections are closed at once
    pub max_connections: usize,
    /// Time sessions get to close after the shutdown notice
    pub shutdown_grace: Duration,
    /// Per-session limits
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: format!("127.0.0.1:{DEFAULT_PORT}"),
            storage: StorageBackend::Redb { path: PathBuf::from("huddle.redb"), fresh: false },
            max_connections: 1024,
            shutdown_grace: Duration::from_secs(5),
            session: SessionConfig::default(),
        }
    }
}

/// Production Huddle server.
///
/// Owns the listener and a [`Supervisor`] that runs every accepted
/// connection as its own task.
pub struct Server<E: Environment, S: Storage> {
    listener: TcpListener,
    supervisor: Arc<Supervisor<E, S>>,
    env: E,
    max_connections: usize,
    shutdown_grace: Duration,
}

impl<E: Environment, S: Storage> Server<E, S> {
    /// Create and bind a new server.
    ///
    /// # Errors
    ///
    /// `ServerError::Transport` if the address cannot be bound.
    pub async fn bind(config: ServerConfig, env: E, storage: S) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.bind_address).await?;

        let hub = BroadcastHub::new(env.clone(), storage, config.session.history_limit);
        let supervisor = Arc::new(Supervisor::new(Arc::new(hub), config.session));

        Ok(Self {
            listener,
            supervisor,
            env,
            max_connections: config.max_connections.max(1),
            shutdown_grace: config.shutdown_grace,
        })
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// The hub shared by all sessions.
    pub fn hub(&self) -> &Arc<BroadcastHub<E, S>> {
        self.supervisor.hub()
    }

    /// Run until Ctrl-C.
    ///
    /// If the signal handler cannot be installed the server shuts down right
    /// away rather than run without a way to stop it gracefully.
    ///
    /// # Errors
    ///
    /// See [`Server::run_until`].
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
        })
        .await
    }

    /// Accept connections until `shutdown` completes, then stop gracefully.
    ///
    /// On shutdown every active session receives [`SHUTDOWN_NOTICE`], then all
    /// sessions are closed and their tasks joined within the grace period.
    ///
    /// # Errors
    ///
    /// Accept failures are logged and retried, so this currently always
    /// returns `Ok`.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let mut shutdown = std::pin::pin!(shutdown);
        let mut tasks = JoinSet::new();

        tracing::info!(addr = ?self.listener.local_addr().ok(), "accepting connections");

        loop {
            tokio::select! {
                () = &mut shutdown => break,

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if tasks.len() >= self.max_connections {
                            tracing::warn!(%peer, limit = self.max_connections, "connection limit reached");
                            drop(stream);
                            continue;
                        }
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(%peer, error = %e, "failed to set TCP_NODELAY");
                        }

                        let supervisor = Arc::clone(&self.supervisor);
                        tasks.spawn(async move { supervisor.serve(stream, Some(peer)).await });
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        self.env.sleep(ACCEPT_BACKOFF).await;
                    },
                },

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined
                        && e.is_panic()
                    {
                        tracing::error!(error = %e, "session task panicked");
                    }
                },
            }
        }

        tracing::info!(sessions = self.hub().registry().len(), "shutting down");
        self.hub().announce(&ServerLine::Notice(SHUTDOWN_NOTICE.to_string()));
        self.supervisor.shutdown();

        let drain = async { while tasks.join_next().await.is_some() {} };
        if tokio::time::timeout(self.shutdown_grace, drain).await.is_err() {
            tracing::warn!(remaining = tasks.len(), "sessions did not close in time, aborting");
            tasks.abort_all();
        }

        tracing::info!("server stopped");
        Ok(())
    }
}

/// Build the configured storage and run a server on the system clock until
/// Ctrl-C.
///
/// # Errors
///
/// Any startup failure: storage cannot be opened or the address cannot be
/// bound.
pub async fn run_configured(config: ServerConfig) -> Result<(), ServerError> {
    match &config.storage {
        StorageBackend::InMemory => {
            tracing::warn!("using in-memory storage, history is lost on exit");
            serve(config, MemoryStorage::new()).await
        },
        backend @ StorageBackend::Redb { path, .. } => {
            tracing::info!(path = %path.display(), "opening database");
            let storage = backend.open_redb()?;
            serve(config, storage).await
        },
    }
}

async fn serve<S: Storage>(config: ServerConfig, storage: S) -> Result<(), ServerError> {
    let server = Server::bind(config, SystemEnv::new(), storage).await?;
    tracing::info!("Server listening on {}", server.local_addr()?);
    server.run().await
}
