//! Connection supervisor.
//!
//! Drives one transport per session: a read loop feeding frames through the
//! [`Session`] state machine, and a writer task draining the session's bounded
//! outbound queue onto the transport. The read loop never writes to the
//! transport itself; everything a peer sees goes through its queue, in the
//! order the hub produced it.
//!
//! Teardown runs exactly once per session regardless of why the loop ended:
//! the departure is announced, the outbound queue is closed, and the writer
//! gets `flush_timeout` to drain before it is aborted.

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use huddle_proto::{Command, ErrorKind, FrameSplitter, ServerLine};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{Notify, mpsc, watch},
};
use tracing::Instrument;

use crate::{
    env::Environment,
    hub::{BroadcastHub, DEFAULT_HISTORY_LIMIT},
    registry::{RegistryError, SessionHandle, SessionId},
    session::{Session, SessionAction},
    storage::Storage,
};

/// Per-session limits.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bytes requested per transport read
    pub read_buffer_size: usize,
    /// Longest accepted frame
    pub max_frame_len: usize,
    /// Outbound lines buffered per session before it counts as slow
    pub outbound_queue_depth: usize,
    /// Recent messages replayed on registration
    pub history_limit: usize,
    /// Time the writer gets to drain after the session closes
    pub flush_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 1024,
            max_frame_len: 64 * 1024,
            outbound_queue_depth: 256,
            history_limit: DEFAULT_HISTORY_LIMIT,
            flush_timeout: Duration::from_secs(2),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed its side
    EndOfStream,
    /// Peer sent `DISCONNECT`
    Disconnect,
    /// Error line sent to the peer
    Rejected(ErrorKind),
    /// Read failed
    Transport(std::io::ErrorKind),
    /// Writer failed, so the peer can no longer be reached
    WriteFailed,
    /// Outbound queue overflowed
    Evicted,
    /// Server is shutting down
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EndOfStream => f.write_str("end of stream"),
            Self::Disconnect => f.write_str("disconnect"),
            Self::Rejected(kind) => write!(f, "rejected ({})", kind.as_str()),
            Self::Transport(kind) => write!(f, "transport error ({kind})"),
            Self::WriteFailed => f.write_str("write failed"),
            Self::Evicted => f.write_str("evicted slow consumer"),
            Self::Shutdown => f.write_str("server shutdown"),
        }
    }
}

/// Accepts transports and runs their sessions.
pub struct Supervisor<E: Environment, S: Storage> {
    hub: Arc<BroadcastHub<E, S>>,
    config: SessionConfig,
    next_id: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl<E: Environment, S: Storage> Supervisor<E, S> {
    /// Create a supervisor feeding sessions into `hub`.
    pub fn new(hub: Arc<BroadcastHub<E, S>>, config: SessionConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self { hub, config, next_id: AtomicU64::new(1), shutdown }
    }

    /// The hub sessions publish into.
    pub fn hub(&self) -> &Arc<BroadcastHub<E, S>> {
        &self.hub
    }

    /// Ask every running session to close. Sessions started afterwards close
    /// immediately.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Run one session over `transport` until it closes.
    pub async fn serve<T>(&self, transport: T, peer: Option<SocketAddr>) -> CloseReason
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = SessionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let span = tracing::info_span!(
            "session",
            session_id = %id,
            peer = peer.map(tracing::field::display),
            username = tracing::field::Empty,
        );

        self.run_session(id, transport).instrument(span).await
    }

    async fn run_session<T>(&self, id: SessionId, transport: T) -> CloseReason
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        tracing::debug!("session opened");

        let (tx, rx) = mpsc::channel(self.config.outbound_queue_depth.max(1));
        let kick = Arc::new(Notify::new());
        let handle = SessionHandle::new(tx, Arc::clone(&kick));

        let (mut reader, writer) = tokio::io::split(transport);
        let mut writer_task = tokio::spawn(write_loop(writer, rx).in_current_span());
        let mut writer_done = false;

        let mut shutdown = self.shutdown.subscribe();
        let mut session = Session::new(id);
        let mut splitter = FrameSplitter::new(self.config.max_frame_len);
        let mut buf = vec![0u8; self.config.read_buffer_size.max(1)];

        let reason = loop {
            if *shutdown.borrow_and_update() {
                break CloseReason::Shutdown;
            }

            tokio::select! {
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break CloseReason::EndOfStream,
                    Ok(n) => {
                        let filled = n == buf.len();
                        if let Some(reason) =
                            self.process_read(&mut session, &handle, &mut splitter, &buf[..n], filled)
                        {
                            break reason;
                        }
                    },
                    Err(e) => break CloseReason::Transport(e.kind()),
                },
                () = kick.notified() => break CloseReason::Evicted,
                result = &mut writer_task => {
                    writer_done = true;
                    if let Ok(Err(e)) = result {
                        tracing::debug!(error = %e, "write failed");
                    }
                    break CloseReason::WriteFailed;
                },
                _ = shutdown.changed() => break CloseReason::Shutdown,
            }
        };

        if let Some(username) = session.close()
            && self.hub.depart(id).is_some()
        {
            tracing::info!(username = %username, reason = %reason, "user left");
        } else {
            tracing::debug!(reason = %reason, "session closed");
        }

        // Registry clone is gone after depart; dropping ours closes the queue
        drop(handle);
        if !writer_done {
            match tokio::time::timeout(self.config.flush_timeout, &mut writer_task).await {
                Ok(Ok(Err(e))) => tracing::debug!(error = %e, "final flush failed"),
                Ok(_) => {},
                Err(_) => {
                    tracing::debug!("writer did not drain in time");
                    writer_task.abort();
                },
            }
        }

        reason
    }

    /// Feed one read through the splitter and the state machine.
    ///
    /// Returns `Some` when the session must close. Frames after a closing one
    /// in the same read are discarded.
    fn process_read(
        &self,
        session: &mut Session,
        handle: &SessionHandle,
        splitter: &mut FrameSplitter,
        chunk: &[u8],
        filled: bool,
    ) -> Option<CloseReason> {
        let mut frames = Vec::new();
        let split = splitter.push_read(chunk, filled, &mut frames);

        for frame in frames {
            let decoded = Command::decode(&frame);
            if let Err(e) = &decoded {
                tracing::debug!(error = %e, "undecodable frame");
            }

            let action = session.handle(decoded);
            if let Some(reason) = self.execute(session, handle, action) {
                return Some(reason);
            }
        }

        if let Err(e) = split {
            tracing::debug!(error = %e, "unusable frame");
            let action = session.handle(Err(e));
            return self.execute(session, handle, action);
        }

        None
    }

    fn execute(
        &self,
        session: &mut Session,
        handle: &SessionHandle,
        action: SessionAction,
    ) -> Option<CloseReason> {
        match action {
            SessionAction::Register { username } => {
                match self.hub.admit(session.id(), &username, handle.clone()) {
                    Ok(admission) => {
                        tracing::Span::current().record("username", username.as_str());
                        tracing::info!(
                            recent = admission.recent,
                            unread = admission.unread,
                            "user joined"
                        );
                        if let Err(e) = session.activate(username) {
                            tracing::error!(error = %e, "admitted session could not activate");
                        }
                        None
                    },
                    Err(RegistryError::NameTaken(_)) => {
                        tracing::info!(username = %username, "username already taken");
                        session.close();
                        Some(reject(handle, ErrorKind::UsernameTaken))
                    },
                    Err(e @ RegistryError::SessionAlreadyRegistered(_)) => {
                        tracing::error!(error = %e, "registration out of sequence");
                        session.close();
                        Some(reject(handle, ErrorKind::UnknownProtocol))
                    },
                }
            },
            SessionAction::Publish { body } => {
                if let Some(username) = session.username() {
                    let report = self.hub.publish(username, &body);
                    tracing::trace!(delivered = report.delivered, dropped = report.dropped, "published");
                }
                None
            },
            SessionAction::Leave => Some(CloseReason::Disconnect),
            SessionAction::Reject(kind) => Some(reject(handle, kind)),
            SessionAction::Ignore => None,
        }
    }
}

fn reject(handle: &SessionHandle, kind: ErrorKind) -> CloseReason {
    handle.deliver(ServerLine::Error(kind).to_bytes());
    CloseReason::Rejected(kind)
}

/// Drain the outbound queue onto the transport until every sender is gone,
/// then shut down the write side.
async fn write_loop<W>(mut writer: W, mut outbound: mpsc::Receiver<Bytes>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(bytes) = outbound.recv().await {
        writer.write_all(&bytes).await?;
    }
    writer.shutdown().await
}
