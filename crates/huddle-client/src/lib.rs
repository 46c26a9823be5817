//! Huddle client.
//!
//! Async client for the Huddle chat relay: connect, register a username,
//! receive the backlog, then exchange lines with everyone else in the room.
//!
//! ```no_run
//! # async fn demo() -> Result<(), huddle_client::ClientError> {
//! use huddle_client::ChatClient;
//!
//! let (mut client, backlog) = ChatClient::connect("127.0.0.1:42424", "alice").await?;
//! for line in backlog {
//!     println!("{line}");
//! }
//! client.send_message("hello").await?;
//! while let Some(line) = client.next_line().await? {
//!     println!("{line}");
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod client;
mod error;

pub use client::ChatClient;
pub use error::ClientError;
pub use huddle_proto::{ErrorKind, ServerLine};
