//! TCP chat client.

use huddle_proto::{Command, ServerLine};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
        TcpStream, ToSocketAddrs,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};

use crate::error::ClientError;

/// A registered connection to a Huddle server.
///
/// Reading and writing are independent: [`ChatClient::next_line`] is cancel
/// safe, so it can sit in a `select!` next to user input.
#[derive(Debug)]
pub struct ChatClient {
    username: String,
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl ChatClient {
    /// Connect and register as `username`.
    ///
    /// Returns the client and everything the server sent before the user's
    /// own join notice: recent history followed by unread messages.
    ///
    /// # Errors
    ///
    /// - `ClientError::InvalidUsername` for empty or multi-line usernames, and
    ///   for usernames containing `": "`, whose join notice reads as a chat
    ///   line
    /// - `ClientError::Rejected` if the server refuses the registration
    /// - `ClientError::ClosedDuringRegistration` if the server hangs up first
    /// - `ClientError::Io` on socket failure
    pub async fn connect(
        addr: impl ToSocketAddrs,
        username: &str,
    ) -> Result<(Self, Vec<ServerLine>), ClientError> {
        let username = username.trim_end();
        if username.is_empty() || username.contains(['\n', '\r']) || username.contains(": ") {
            return Err(ClientError::InvalidUsername(username.to_string()));
        }

        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        let mut client =
            Self { username: username.to_string(), lines: BufReader::new(reader).lines(), writer };
        client.send(&Command::Connect { username: client.username.clone() }).await?;

        let mut backlog = Vec::new();
        loop {
            match client.next_line().await? {
                None => return Err(ClientError::ClosedDuringRegistration),
                Some(ServerLine::Error(kind)) => return Err(ClientError::Rejected(kind)),
                Some(ServerLine::Joined { username }) if username == client.username => break,
                Some(line) => backlog.push(line),
            }
        }

        tracing::debug!(username = %client.username, backlog = backlog.len(), "registered");
        Ok((client, backlog))
    }

    /// Username this client registered with.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Publish a chat message.
    ///
    /// # Errors
    ///
    /// `ClientError::MultilineMessage` if `body` contains a line break, since
    /// the server would read it as several frames.
    pub async fn send_message(&mut self, body: &str) -> Result<(), ClientError> {
        if body.contains(['\n', '\r']) {
            return Err(ClientError::MultilineMessage);
        }
        self.send(&Command::Message { body: body.to_string() }).await
    }

    /// Next line from the server. `None` once the server closed the connection.
    ///
    /// # Errors
    ///
    /// `ClientError::Io` on socket failure or non-UTF-8 data.
    pub async fn next_line(&mut self) -> Result<Option<ServerLine>, ClientError> {
        Ok(self.lines.next_line().await?.map(|line| ServerLine::parse(&line)))
    }

    /// Leave gracefully and close the write side.
    ///
    /// # Errors
    ///
    /// `ClientError::Io` if the goodbye cannot be written.
    pub async fn disconnect(mut self) -> Result<(), ClientError> {
        self.send(&Command::Disconnect).await?;
        self.writer.shutdown().await?;
        Ok(())
    }

    async fn send(&mut self, command: &Command) -> Result<(), ClientError> {
        self.writer.write_all(&command.to_vec()).await?;
        Ok(())
    }
}
