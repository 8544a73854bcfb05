use std::{net::SocketAddr, sync::Arc, time::Instant};

use courier_common::{
    Signal, error::SessionError, incoming, internal, outgoing, status::Status,
    timeouts::ServerTimeouts,
};
use courier_validator::normalize;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream},
    sync::broadcast,
};

use crate::{
    auth::Credentials,
    command::Command,
    mime,
    policy::{RecipientPolicy, SenderPolicy},
    relay::{OutboundMessage, RelayTransport},
    state::{Envelope, Protocol, Reply, Step},
};

/// Longest command line accepted, including CRLF.
const MAX_COMMAND_LINE: u64 = 4096;

/// Reads during DATA are chunked to this size; longer lines are still
/// accepted, just in several pieces.
const DATA_CHUNK: u64 = 64 * 1024;

/// Everything a session needs that outlives it.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub credentials: Credentials,
    pub banner: String,
    pub max_message_size: usize,
    pub timeouts: ServerTimeouts,
    pub recipients: RecipientPolicy,
    pub senders: SenderPolicy,
    pub relay: Arc<dyn RelayTransport>,
}

enum Line {
    Complete(Vec<u8>),
    TooLong,
    Closed,
}

enum Input {
    Line(Line),
    Shutdown,
    TimedOut,
}

/// One client connection.
pub struct Session<Stream> {
    peer: SocketAddr,
    stream: BufStream<Stream>,
    protocol: Protocol,
    config: Arc<SessionConfig>,
    started: Instant,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    pub fn new(stream: Stream, peer: SocketAddr, config: Arc<SessionConfig>) -> Self {
        Self {
            peer,
            stream: BufStream::new(stream),
            protocol: Protocol::new(
                config.credentials.clone(),
                config.banner.clone(),
                config.max_message_size,
            ),
            config,
            started: Instant::now(),
        }
    }

    /// Drives the connection until the client quits, the protocol closes it,
    /// or `signal` asks us to stop.
    ///
    /// # Errors
    ///
    /// Returns a [`SessionError`] on I/O failure or timeout.
    #[tracing::instrument(level = "trace", skip_all, fields(peer = %self.peer))]
    pub async fn run(mut self, mut signal: broadcast::Receiver<Signal>) -> Result<(), SessionError> {
        internal!("Connected");
        let result = self.converse(&mut signal).await;
        internal!("Connection closed");
        result
    }

    async fn converse(
        &mut self,
        signal: &mut broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        let greeting = self.protocol.greeting();
        self.send(&greeting).await?;

        while !self.protocol.is_closed() {
            let Some(remaining) = self
                .config
                .timeouts
                .connection()
                .checked_sub(self.started.elapsed())
            else {
                tracing::warn!(
                    peer = %self.peer,
                    max_secs = self.config.timeouts.connection_secs,
                    "Connection exceeded maximum lifetime, closing"
                );
                self.send_quietly(Reply::new(
                    Status::Unavailable,
                    "4.4.2 Connection time limit exceeded",
                ))
                .await;
                return Err(SessionError::Timeout(self.config.timeouts.connection_secs));
            };

            let timeout = self.config.timeouts.command().min(remaining);
            let input = tokio::select! {
                _ = signal.recv() => Input::Shutdown,
                line = tokio::time::timeout(timeout, read_line(&mut self.stream, MAX_COMMAND_LINE)) => {
                    match line {
                        Ok(line) => Input::Line(line?),
                        Err(_) => Input::TimedOut,
                    }
                }
            };

            match input {
                Input::Shutdown => {
                    internal!(level = DEBUG, "Shutdown requested, closing session");
                    self.send_quietly(Reply::new(Status::Unavailable, "4.3.2 Server shutting down"))
                        .await;
                    return Ok(());
                }
                Input::TimedOut => {
                    tracing::warn!(
                        peer = %self.peer,
                        state = %self.protocol.state(),
                        timeout_secs = timeout.as_secs(),
                        "Client connection timed out"
                    );
                    self.send_quietly(Reply::new(
                        Status::Unavailable,
                        "4.4.2 Timeout waiting for command",
                    ))
                    .await;
                    return Err(SessionError::Timeout(timeout.as_secs()));
                }
                Input::Line(Line::Closed) => return Ok(()),
                Input::Line(Line::TooLong) => {
                    self.send(&Reply::new(Status::SyntaxError, "5.5.2 Line too long").closing())
                        .await?;
                    return Ok(());
                }
                Input::Line(Line::Complete(line)) => self.handle_line(&line).await?,
            }
        }

        Ok(())
    }

    async fn handle_line(&mut self, line: &[u8]) -> Result<(), SessionError> {
        if self.protocol.expects_auth_response() {
            incoming!("<auth response>");
            let text = String::from_utf8_lossy(line);
            let reply = self.protocol.auth_response(text.trim_end_matches(['\r', '\n']));
            return self.send(&reply).await;
        }

        let command = Command::try_from(line).unwrap_or_else(|invalid| invalid);
        incoming!("{command}");

        match self.protocol.command(command) {
            Step::Reply(reply) => self.send(&reply).await,
            Step::Verify(address) => {
                let verdict = self.config.recipients.assess(&address).await;
                internal!(level = DEBUG, "Recipient {address}: {verdict:?}");
                let reply = self.protocol.recipient(address, verdict);
                self.send(&reply).await
            }
            Step::ReadData(reply) => {
                self.send(&reply).await?;

                let reply = match self.read_data().await? {
                    Some(body) => {
                        let envelope = self.protocol.finish_data();
                        self.deliver(envelope, &body).await
                    }
                    None => self.protocol.data_too_large(),
                };
                self.send(&reply).await
            }
        }
    }

    /// Reads a dot-terminated message body, undoing dot-stuffing.
    ///
    /// Returns `None` if the body outgrew the size limit; the rest of it is
    /// still read so the connection stays in sync.
    async fn read_data(&mut self) -> Result<Option<Vec<u8>>, SessionError> {
        let limit = self.protocol.max_message_size();
        let timeout = self.config.timeouts.data_block();

        let mut body = Vec::new();
        let mut overflow = false;
        let mut at_line_start = true;

        loop {
            let mut chunk = Vec::new();
            let read = tokio::time::timeout(
                timeout,
                (&mut self.stream)
                    .take(DATA_CHUNK)
                    .read_until(b'\n', &mut chunk),
            )
            .await
            .map_err(|_| SessionError::Timeout(timeout.as_secs()))??;

            if read == 0 {
                return Err(SessionError::Protocol(String::from(
                    "Connection closed during DATA",
                )));
            }

            let starts_line = at_line_start;
            at_line_start = chunk.ends_with(b"\n");

            if starts_line && (chunk == b".\r\n" || chunk == b".\n") {
                break;
            }

            let content = if starts_line {
                chunk
                    .strip_prefix(b".".as_slice())
                    .unwrap_or(chunk.as_slice())
            } else {
                chunk.as_slice()
            };

            if overflow {
                continue;
            }
            if body.len().saturating_add(content.len()) > limit {
                overflow = true;
                body = Vec::new();
            } else {
                body.extend_from_slice(content);
            }
        }

        incoming!("<{} bytes of message data>", body.len());
        Ok((!overflow).then_some(body))
    }

    /// Parses the submitted message and hands it to the relay.
    async fn deliver(&self, envelope: Envelope, body: &[u8]) -> Reply {
        let parsed = match mime::parse(body) {
            Ok(parsed) => parsed,
            Err(err) => {
                return Reply::new(
                    Status::TransactionFailed,
                    format!("5.6.0 {}", one_line(&err.to_string())),
                );
            }
        };

        let to = if parsed.to.is_empty() {
            envelope.recipients.clone()
        } else {
            parsed.to
        };

        if self
            .config
            .recipients
            .shield()
            .protects_any(to.iter().map(String::as_str))
        {
            internal!(
                level = WARN,
                "Message addressed to a protected mailbox; accepted without relaying"
            );
            return Reply::new(Status::Ok, "2.0.0 Ok: accepted");
        }

        let accepted: Vec<String> = envelope.recipients.iter().map(|r| normalize(r)).collect();
        if let Some(stray) = to.iter().find(|addr| !accepted.contains(&normalize(addr))) {
            return Reply::new(
                Status::TransactionFailed,
                format!("5.7.1 Recipient {} was not accepted", one_line(stray)),
            );
        }

        let message = OutboundMessage {
            from: self
                .config
                .senders
                .authoritative_from(envelope.sender.as_deref())
                .to_string(),
            to,
            subject: parsed.subject,
            text: parsed.text,
            html: parsed.html,
            message_id: parsed.message_id,
        };

        match self.config.relay.relay(&message).await {
            Ok(receipt) => {
                internal!(level = INFO, "Relayed {}", receipt.message_id);
                Reply::new(
                    Status::Ok,
                    format!("2.0.0 Ok: queued as {}", receipt.message_id),
                )
            }
            Err(err) if err.is_temporary() => {
                internal!(level = WARN, "Relay failed: {err}");
                Reply::new(
                    Status::ActionUnavailable,
                    format!("4.4.1 {}", one_line(&err.to_string())),
                )
            }
            Err(err) => {
                internal!(level = WARN, "Relay failed: {err}");
                Reply::new(
                    Status::TransactionFailed,
                    format!("5.4.0 {}", one_line(&err.to_string())),
                )
            }
        }
    }

    async fn send(&mut self, reply: &Reply) -> Result<(), SessionError> {
        outgoing!("{reply}");

        self.stream
            .write_all(format!("{reply}\r\n").as_bytes())
            .await
            .map_err(|err| {
                internal!(level = ERROR, "{err}");
                SessionError::Protocol(format!("Failed to send response: {err}"))
            })?;
        self.stream.flush().await?;

        Ok(())
    }

    /// Best-effort reply on a connection we are about to drop anyway.
    async fn send_quietly(&mut self, reply: Reply) {
        if let Err(err) = self.send(&reply.closing()).await {
            internal!(level = DEBUG, "Unable to send final reply: {err}");
        }
    }
}

async fn read_line<Stream: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut BufStream<Stream>,
    limit: u64,
) -> Result<Line, SessionError> {
    let mut line = Vec::new();
    let read = stream.take(limit).read_until(b'\n', &mut line).await?;

    Ok(if read == 0 {
        Line::Closed
    } else if line.ends_with(b"\n") {
        Line::Complete(line)
    } else if u64::try_from(read).is_ok_and(|read| read >= limit) {
        Line::TooLong
    } else {
        Line::Closed
    })
}

/// Keeps reply text on a single line.
fn one_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}

impl<Stream> std::fmt::Debug for Session<Stream> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("state", self.protocol.state())
            .finish_non_exhaustive()
    }
}
