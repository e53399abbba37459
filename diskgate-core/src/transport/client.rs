//! The calling side of the transport, used by unprivileged front ends.
use super::Endpoint;
use crate::codec::{deserialize, Message, Opcode, ReplyRecord, FRAME_LEN};
use crate::error::TransportError;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;

/// Bound on writing one request frame.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on waiting for a reply. Longer than the helper's own callback bound,
/// so a slow OS shows up as a helper-side `CallbackTimeout` rather than a
/// lost reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(45);

/// Pause before the first liveness probe, giving a just-launched helper time
/// to bind.
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_millis(250);

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub endpoint: Endpoint,
    pub send_timeout: Duration,
    pub reply_timeout: Duration,
    pub startup_grace: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            startup_grace: DEFAULT_STARTUP_GRACE,
        }
    }
}

/// A connection to the helper.
///
/// After a timeout the connection is in an unknown state (a late reply may
/// still arrive), so it is dropped and the next call reconnects.
pub struct Client {
    config: ClientConfig,
    stream: Option<UnixStream>,
}

impl Client {
    /// Connects to the helper endpoint.
    pub fn connect(config: ClientConfig) -> Result<Self, TransportError> {
        let stream = open(&config)?;
        tracing::debug!(endpoint = %config.endpoint, "connected to helper");
        Ok(Self {
            config,
            stream: Some(stream),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Waits out the startup grace period, then checks the helper answers.
    pub fn probe(&mut self) -> Result<(), TransportError> {
        thread::sleep(self.config.startup_grace);
        let reply = self.send_with_reply(&Message::empty(Opcode::Ping))?;
        match reply.opcode() {
            Ok(Opcode::Pong) => Ok(()),
            Ok(Opcode::Reply) => {
                let record: ReplyRecord = deserialize(&reply)?;
                match record.error_kind()? {
                    Some(kind) => Err(TransportError::Refused(kind)),
                    None => Err(TransportError::UnexpectedReply(reply.opcode)),
                }
            }
            _ => Err(TransportError::UnexpectedReply(reply.opcode)),
        }
    }

    /// Sends one request and blocks until its reply arrives or a timeout
    /// expires.
    ///
    /// The helper closes connections that stay idle. If the kept connection
    /// turns out to be closed, the request is sent once more on a fresh one;
    /// the helper only closes a connection between requests, so nothing was
    /// acted on.
    pub fn send_with_reply(&mut self, request: &Message) -> Result<Message, TransportError> {
        if let Some(mut stream) = self.stream.take() {
            match self.exchange(&mut stream, request) {
                Ok(reply) => {
                    self.stream = Some(stream);
                    return Ok(reply);
                }
                Err((e, _)) if is_disconnect(&e) => {
                    tracing::debug!(error = %e, "helper closed the connection, reconnecting");
                }
                Err((e, bound)) => return Err(timeout_or(e, bound)),
            }
        }

        let mut stream = open(&self.config)?;
        let reply = self
            .exchange(&mut stream, request)
            .map_err(|(e, bound)| timeout_or(e, bound))?;
        self.stream = Some(stream);
        Ok(reply)
    }

    fn exchange(
        &self,
        stream: &mut UnixStream,
        request: &Message,
    ) -> Result<Message, (io::Error, Duration)> {
        stream
            .write_all(&request.to_frame())
            .map_err(|e| (e, self.config.send_timeout))?;
        let mut frame = [0u8; FRAME_LEN];
        stream
            .read_exact(&mut frame)
            .map_err(|e| (e, self.config.reply_timeout))?;
        Ok(Message::from_frame(&frame))
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

fn open(config: &ClientConfig) -> Result<UnixStream, TransportError> {
    let endpoint_failed = |source: io::Error| TransportError::EndpointCreateFailed {
        endpoint: config.endpoint.path().to_path_buf(),
        source,
    };
    let stream = UnixStream::connect(config.endpoint.path()).map_err(endpoint_failed)?;
    stream
        .set_write_timeout(Some(config.send_timeout))
        .map_err(endpoint_failed)?;
    stream
        .set_read_timeout(Some(config.reply_timeout))
        .map_err(endpoint_failed)?;
    Ok(stream)
}

fn timeout_or(err: io::Error, bound: Duration) -> TransportError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => TransportError::ReplyTimeout(bound),
        _ => TransportError::Io(err),
    }
}
