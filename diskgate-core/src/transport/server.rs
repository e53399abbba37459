//! The listening side of the transport, run by the privileged helper.
use super::Endpoint;
use crate::auth::PeerCredentials;
use crate::codec::{serialize, Message, Opcode, ReplyRecord, FRAME_LEN};
use crate::error::{ErrorKind, TransportError};
use std::io::{self, Read, Write};
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How long a connected peer may stay silent before it is disconnected.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Most peers served at once. Connections beyond this are closed at accept.
pub const DEFAULT_MAX_PEERS: usize = 32;

/// Handles decoded requests on behalf of the server.
///
/// Implementations must always produce a reply; the server never drops a
/// request on the floor.
pub trait MessageHandler: Send + Sync + 'static {
    /// State kept for one connection.
    type Peer: Send;

    /// Called once per connection with the credentials the kernel recorded
    /// when the peer connected.
    fn connect(&self, credentials: PeerCredentials) -> Self::Peer;

    /// Handles one request from `peer`.
    fn handle(&self, peer: &mut Self::Peer, request: &Message) -> Message;
}

/// A bound helper endpoint.
pub struct Server<H> {
    listener: UnixListener,
    endpoint: Endpoint,
    handler: Arc<H>,
    idle_timeout: Duration,
    max_peers: usize,
    active_peers: Arc<AtomicUsize>,
}

/// One of the server's limited peer slots. Released when dropped.
struct PeerSlot {
    active: Arc<AtomicUsize>,
}

impl PeerSlot {
    fn acquire(active: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| Self {
                active: Arc::clone(active),
            })
    }
}

impl Drop for PeerSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<H: MessageHandler> Server<H> {
    /// Binds the listener.
    ///
    /// A stale socket left behind by a previous helper is replaced; a socket
    /// that still accepts connections means another helper is running, and
    /// binding fails.
    pub fn bind(endpoint: &Endpoint, handler: H) -> Result<Self, TransportError> {
        let path = endpoint.path();
        let bind_failed = |source: io::Error| TransportError::BindFailed {
            endpoint: path.to_path_buf(),
            source,
        };

        if let Ok(meta) = std::fs::symlink_metadata(path) {
            if !meta.file_type().is_socket() {
                return Err(bind_failed(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "endpoint path exists and is not a socket",
                )));
            }
            if UnixStream::connect(path).is_ok() {
                return Err(bind_failed(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    "another helper is already listening",
                )));
            }
            tracing::debug!(endpoint = %endpoint, "removing stale socket");
            std::fs::remove_file(path).map_err(bind_failed)?;
        }

        let listener = UnixListener::bind(path).map_err(bind_failed)?;
        // Access control is identity based; anyone may knock.
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))
            .map_err(bind_failed)?;

        tracing::info!(endpoint = %endpoint, "helper listening");
        Ok(Self {
            listener,
            endpoint: endpoint.clone(),
            handler: Arc::new(handler),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_peers: DEFAULT_MAX_PEERS,
            active_peers: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Sets how long a peer may stay silent, mid-frame or between frames.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Sets how many peers are served at once.
    pub fn with_max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Accepts peers forever, one handler thread per connection.
    pub fn run(self) -> Result<(), TransportError> {
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let Some(slot) = PeerSlot::acquire(&self.active_peers, self.max_peers) else {
                        tracing::warn!(max_peers = self.max_peers, "refusing peer over the connection limit");
                        continue;
                    };
                    let bounded = stream
                        .set_read_timeout(Some(self.idle_timeout))
                        .and_then(|()| stream.set_write_timeout(Some(self.idle_timeout)));
                    if let Err(e) = bounded {
                        tracing::warn!(error = %e, "could not bound peer connection");
                        continue;
                    }

                    let handler = Arc::clone(&self.handler);
                    let spawned = thread::Builder::new()
                        .name("diskgate-peer".into())
                        .spawn(move || {
                            let _slot = slot;
                            serve_peer(stream, handler.as_ref());
                        });
                    if let Err(e) = spawned {
                        tracing::error!(error = %e, "could not spawn peer thread");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    // Avoid spinning when out of descriptors.
                    thread::sleep(Duration::from_millis(50));
                }
            }
        }
        Ok(())
    }
}

/// Reads frames from one peer until it disconnects or goes idle, answering
/// each.
fn serve_peer<H: MessageHandler>(mut stream: UnixStream, handler: &H) {
    let mut peer = match PeerCredentials::from_stream(&stream) {
        Ok(credentials) => {
            tracing::debug!(uid = credentials.uid, pid = ?credentials.pid, "peer connected");
            Ok((credentials, handler.connect(credentials)))
        }
        Err(e) => {
            tracing::warn!(error = %e, "peer connected without credentials");
            Err(e)
        }
    };

    let mut frame = [0u8; FRAME_LEN];
    loop {
        match stream.read_exact(&mut frame) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                tracing::debug!("peer idle, disconnecting");
                break;
            }
            Err(e) => {
                tracing::debug!(error = %e, "peer read failed");
                break;
            }
        }

        let request = Message::from_frame(&frame);
        let reply = match &mut peer {
            Ok((credentials, state)) => dispatch(handler, credentials, state, &request),
            Err(e) => failure_reply(e.kind(), &e.to_string()),
        };

        if let Err(e) = stream.write_all(&reply.to_frame()) {
            tracing::debug!(error = %e, "peer write failed");
            break;
        }
    }
    tracing::debug!("peer disconnected");
}

/// Runs the handler, turning a panic into a generic failure reply.
fn dispatch<H: MessageHandler>(
    handler: &H,
    credentials: &PeerCredentials,
    peer: &mut H::Peer,
    request: &Message,
) -> Message {
    match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(peer, request))) {
        Ok(reply) => reply,
        Err(_) => {
            tracing::error!(uid = credentials.uid, opcode = request.opcode, "message handler panicked");
            failure_reply(ErrorKind::Internal, "internal error")
        }
    }
}

/// A reply carrying only an error kind and a short message.
pub(crate) fn failure_reply(kind: ErrorKind, message: &str) -> Message {
    let record = ReplyRecord::failure(kind, None, Some(message));
    // A reply record always fits the payload.
    serialize(Opcode::Reply, &record).unwrap_or_else(|_| Message::empty(Opcode::Reply))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::deserialize;
    use std::path::Path;

    struct Echo;

    impl MessageHandler for Echo {
        type Peer = PeerCredentials;

        fn connect(&self, credentials: PeerCredentials) -> PeerCredentials {
            credentials
        }

        fn handle(&self, _peer: &mut PeerCredentials, request: &Message) -> Message {
            if request.opcode == 99 {
                panic!("scripted panic");
            }
            request.clone()
        }
    }

    fn endpoint(dir: &Path) -> Endpoint {
        Endpoint::for_service("io.diskgate.test", dir)
    }

    fn round_trip(stream: &mut UnixStream, message: &Message) -> Message {
        stream.write_all(&message.to_frame()).unwrap();
        let mut frame = [0u8; FRAME_LEN];
        stream.read_exact(&mut frame).unwrap();
        Message::from_frame(&frame)
    }

    #[test]
    fn panicking_handler_gets_internal_reply_and_server_survives() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::bind(&endpoint(dir.path()), Echo).unwrap();
        let path = server.endpoint().path().to_path_buf();
        thread::spawn(move || server.run());

        let mut stream = UnixStream::connect(&path).unwrap();
        let mut poison = Message::empty(Opcode::Ping);
        poison.opcode = 99;
        let reply = round_trip(&mut stream, &poison);
        assert_eq!(reply.opcode, Opcode::Reply as i32);
        let record: ReplyRecord = deserialize(&reply).unwrap();
        assert_eq!(record.error_kind().unwrap(), Some(ErrorKind::Internal));

        // Same connection keeps working.
        let ping = Message::empty(Opcode::Ping);
        assert_eq!(round_trip(&mut stream, &ping), ping);
    }

    fn start(server: Server<Echo>) -> std::path::PathBuf {
        let path = server.endpoint().path().to_path_buf();
        thread::spawn(move || server.run());
        path
    }

    fn connect(path: &Path) -> UnixStream {
        let stream = UnixStream::connect(path).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
    }

    #[test]
    fn silent_peer_is_disconnected() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::bind(&endpoint(dir.path()), Echo)
            .unwrap()
            .with_idle_timeout(Duration::from_millis(100));
        let path = start(server);

        let mut idle = connect(&path);
        let mut buf = [0u8; 8];
        assert_eq!(idle.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn peers_over_the_limit_are_refused_until_a_slot_frees() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::bind(&endpoint(dir.path()), Echo)
            .unwrap()
            .with_max_peers(1);
        let path = start(server);
        let ping = Message::empty(Opcode::Ping);

        let mut first = connect(&path);
        assert_eq!(round_trip(&mut first, &ping), ping);

        let mut second = connect(&path);
        let mut buf = [0u8; 8];
        assert_eq!(second.read(&mut buf).unwrap(), 0);

        drop(first);
        let mut served = false;
        for _ in 0..100 {
            let mut third = connect(&path);
            if third.write_all(&ping.to_frame()).is_ok() {
                let mut frame = [0u8; FRAME_LEN];
                if third.read_exact(&mut frame).is_ok() {
                    assert_eq!(Message::from_frame(&frame), ping);
                    served = true;
                    break;
                }
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert!(served);
    }

    #[test]
    fn stale_socket_is_replaced_but_live_one_is_not() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = endpoint(dir.path());

        // A bound-then-dropped listener leaves a stale socket file.
        drop(UnixListener::bind(endpoint.path()).unwrap());
        let server = Server::bind(&endpoint, Echo).unwrap();

        let second = Server::bind(&endpoint, Echo);
        assert!(matches!(second, Err(TransportError::BindFailed { .. })));
        drop(server);
    }

    #[test]
    fn bind_refuses_to_clobber_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = endpoint(dir.path());
        std::fs::write(endpoint.path(), b"not a socket").unwrap();
        assert!(matches!(
            Server::bind(&endpoint, Echo),
            Err(TransportError::BindFailed { .. })
        ));
    }
}
