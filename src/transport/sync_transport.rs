//! Sync transport implementation using std
//!
//! A [`Connection`] owns one stream socket, TCP or Unix, in either the client or
//! the server role. Reads are line framed and can run in blocking or non-blocking
//! mode; bytes of an incomplete line survive across reads.

use crate::endpoint::Endpoint;
use crate::error::{QmpError, Result};
use crate::protocol::Message;
use crate::transport::codec;
use serde::Serialize;
use std::io::{self, BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use nix::sys::socket::{self, Backlog};
use std::os::fd::AsFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// Pending connections a listener queues; a session serves exactly one peer
const LISTEN_BACKLOG: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Result of one framed read
#[derive(Debug)]
pub enum Frame {
    Message(Message),
    /// Non-blocking mode and no complete line is queued
    NotReady,
    /// The peer shut the connection down
    Closed,
}

enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    fn try_clone(&self) -> io::Result<Stream> {
        match self {
            Stream::Tcp(s) => s.try_clone().map(Stream::Tcp),
            Stream::Unix(s) => s.try_clone().map(Stream::Unix),
        }
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_nonblocking(nonblocking),
            Stream::Unix(s) => s.set_nonblocking(nonblocking),
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_read_timeout(timeout),
            Stream::Unix(s) => s.set_read_timeout(timeout),
        }
    }

    fn shutdown(&self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.shutdown(Shutdown::Both),
            Stream::Unix(s) => s.shutdown(Shutdown::Both),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::Unix(s) => s.flush(),
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

enum State {
    Unconnected,
    Listening(Listener),
    Connected {
        reader: BufReader<Stream>,
        writer: Stream,
    },
    Closed,
}

/// One end of a QMP channel
pub struct Connection {
    endpoint: Endpoint,
    role: Role,
    state: State,
    blocking: bool,
    read_timeout: Option<Duration>,
    partial: Vec<u8>,
    // Socket file created by listen(), removed again on close
    socket_file: Option<PathBuf>,
}

impl Connection {
    /// Create an unconnected connection; no I/O happens until connect or listen
    pub fn new(endpoint: Endpoint, role: Role) -> Self {
        Self {
            endpoint,
            role,
            state: State::Unconnected,
            blocking: true,
            read_timeout: None,
            partial: Vec::new(),
            socket_file: None,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_local(&self) -> bool {
        self.endpoint.is_local()
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, State::Connected { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// Connect to the peer (client role)
    pub fn connect(&mut self) -> Result<()> {
        self.expect_state(Role::Client, "connect")?;

        let stream = match &self.endpoint {
            Endpoint::Tcp { host, port } => {
                TcpStream::connect((host.as_str(), *port)).map(Stream::Tcp)
            }
            Endpoint::Unix { path } => UnixStream::connect(path).map(Stream::Unix),
        }
        .map_err(|e| self.connect_error(e))?;

        debug!("Connected to {}", self.endpoint);
        self.install(stream)
    }

    /// Bind and listen on the endpoint (server role)
    pub fn listen(&mut self) -> Result<()> {
        self.expect_state(Role::Server, "listen")?;

        let listener = match &self.endpoint {
            Endpoint::Tcp { host, port } => TcpListener::bind((host.as_str(), *port))
                .map(Listener::Tcp)
                .map_err(|e| self.connect_error(e))?,
            Endpoint::Unix { path } => {
                // Remove a stale socket file left behind by a previous run
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = UnixListener::bind(path).map_err(|e| self.connect_error(e))?;
                self.socket_file = Some(path.clone());
                Listener::Unix(listener)
            }
        };

        match &listener {
            Listener::Tcp(l) => limit_backlog(l)?,
            Listener::Unix(l) => limit_backlog(l)?,
        }

        debug!("Listening on {}", self.endpoint);
        self.state = State::Listening(listener);
        Ok(())
    }

    /// Accept exactly one peer on a listening connection
    pub fn accept(&mut self) -> Result<()> {
        let stream = match &self.state {
            State::Listening(Listener::Tcp(listener)) => {
                listener.accept().map(|(s, _)| Stream::Tcp(s))
            }
            State::Listening(Listener::Unix(listener)) => {
                listener.accept().map(|(s, _)| Stream::Unix(s))
            }
            State::Closed => return Err(QmpError::ConnectionClosed),
            _ => {
                return Err(QmpError::ProtocolViolation(
                    "accept() requires a listening connection".to_string(),
                ));
            }
        }
        .map_err(|e| self.connect_error(e))?;

        debug!("Accepted peer on {}", self.endpoint);
        self.install(stream)
    }

    pub fn listen_and_accept(&mut self) -> Result<()> {
        self.listen()?;
        self.accept()
    }

    /// The address actually bound, which differs from the requested one for TCP port 0
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        match &self.state {
            State::Listening(Listener::Tcp(listener)) => {
                let addr = listener.local_addr()?;
                Ok(Endpoint::tcp(addr.ip().to_string(), addr.port()))
            }
            State::Connected {
                writer: Stream::Tcp(stream),
                ..
            } => {
                let addr = stream.local_addr()?;
                Ok(Endpoint::tcp(addr.ip().to_string(), addr.port()))
            }
            _ => Ok(self.endpoint.clone()),
        }
    }

    /// Toggle whether `read_line` waits for data
    pub fn set_blocking(&mut self, blocking: bool) -> Result<()> {
        match &self.state {
            State::Connected { writer, .. } => writer.set_nonblocking(!blocking)?,
            State::Closed => return Err(QmpError::ConnectionClosed),
            _ => {}
        }
        self.blocking = blocking;
        Ok(())
    }

    /// Bound how long a blocking read may wait; `None` waits forever
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        match &self.state {
            State::Connected { writer, .. } => writer.set_read_timeout(timeout)?,
            State::Closed => return Err(QmpError::ConnectionClosed),
            _ => {}
        }
        self.read_timeout = timeout;
        Ok(())
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    /// Read the next complete line and decode it
    pub fn read_line(&mut self) -> Result<Frame> {
        let reader = match &mut self.state {
            State::Connected { reader, .. } => reader,
            state => return Err(not_connected(state)),
        };

        loop {
            match reader.read_until(b'\n', &mut self.partial) {
                Ok(0) => {
                    let line = std::mem::take(&mut self.partial);
                    if line.trim_ascii().is_empty() {
                        return Ok(Frame::Closed);
                    }
                    // Unterminated final line before EOF
                    if let Some(message) = codec::decode_message(&line)? {
                        debug!("<- {}", String::from_utf8_lossy(line.trim_ascii()));
                        return Ok(Frame::Message(message));
                    }
                }
                Ok(_) => {
                    if !self.partial.ends_with(b"\n") {
                        // EOF in the middle of a line; the next read reports it
                        continue;
                    }
                    let line = std::mem::take(&mut self.partial);
                    if let Some(message) = codec::decode_message(&line)? {
                        debug!("<- {}", String::from_utf8_lossy(line.trim_ascii()));
                        return Ok(Frame::Message(message));
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return if self.blocking {
                        Err(QmpError::Timeout)
                    } else {
                        Ok(Frame::NotReady)
                    };
                }
                Err(e) => return Err(QmpError::Io(e)),
            }
        }
    }

    /// Serialize one message and write it as a single line
    pub fn write_message<T: Serialize + ?Sized>(&mut self, message: &T) -> Result<()> {
        let encoded = codec::encode_message(message)?;
        debug!("-> {}", String::from_utf8_lossy(encoded.trim_ascii_end()));
        self.write_raw(&encoded)
    }

    /// Write bytes exactly as given
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let writer = match &mut self.state {
            State::Connected { writer, .. } => writer,
            state => return Err(not_connected(state)),
        };

        // Writes always complete, even while reads are non-blocking
        if !self.blocking {
            writer.set_nonblocking(false)?;
        }
        let result = writer.write_all(bytes).and_then(|_| writer.flush());
        if !self.blocking {
            writer.set_nonblocking(true)?;
        }

        result.map_err(|e| match e.kind() {
            ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
                QmpError::Connect {
                    target: self.endpoint.to_string(),
                    source: e,
                }
            }
            _ => QmpError::Io(e),
        })
    }

    /// Release the socket. Safe to call more than once.
    pub fn close(&mut self) {
        if let State::Connected { writer, .. } = std::mem::replace(&mut self.state, State::Closed)
        {
            // The peer may already be gone
            let _ = writer.shutdown();
            debug!("Closed connection to {}", self.endpoint);
        }
        self.partial.clear();

        if let Some(path) = self.socket_file.take()
            && path.exists()
            && let Err(e) = std::fs::remove_file(&path)
        {
            warn!("Failed to remove socket file {}: {}", path.display(), e);
        }
    }

    fn install(&mut self, stream: Stream) -> Result<()> {
        let writer = stream.try_clone()?;
        writer.set_nonblocking(!self.blocking)?;
        writer.set_read_timeout(self.read_timeout)?;
        self.partial.clear();
        self.state = State::Connected {
            reader: BufReader::new(stream),
            writer,
        };
        Ok(())
    }

    fn expect_state(&self, role: Role, operation: &str) -> Result<()> {
        if self.role != role {
            return Err(QmpError::ProtocolViolation(format!(
                "{operation}() is not available in the {:?} role",
                self.role
            )));
        }
        match self.state {
            State::Unconnected => Ok(()),
            State::Closed => Err(QmpError::ConnectionClosed),
            _ => Err(QmpError::ProtocolViolation(format!(
                "{operation}() on a connection that is already in use"
            ))),
        }
    }

    fn connect_error(&self, source: io::Error) -> QmpError {
        QmpError::Connect {
            target: self.endpoint.to_string(),
            source,
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Re-issue listen(2) on a bound listener so only one peer can queue
fn limit_backlog<F: AsFd>(listener: &F) -> io::Result<()> {
    let backlog = Backlog::new(LISTEN_BACKLOG).map_err(io::Error::from)?;
    socket::listen(listener, backlog).map_err(io::Error::from)
}

fn not_connected(state: &State) -> QmpError {
    match state {
        State::Closed => QmpError::ConnectionClosed,
        _ => QmpError::ProtocolViolation("connection is not established".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, MessageKind, Response};
    use serde_json::json;
    use std::time::Instant;

    /// Create a connected (server, client) pair over a Unix socket in a temp dir
    fn unix_pair(dir: &tempfile::TempDir) -> (Connection, Connection) {
        let endpoint = Endpoint::unix(dir.path().join("qmp.sock"));
        let mut server = Connection::new(endpoint.clone(), Role::Server);
        server.listen().unwrap();

        let mut client = Connection::new(endpoint, Role::Client);
        client.connect().unwrap();
        server.accept().unwrap();
        (server, client)
    }

    fn expect_message(frame: Frame) -> Message {
        match frame {
            Frame::Message(message) => message,
            other => panic!("Expected a message, got {other:?}"),
        }
    }

    #[test]
    fn test_unconnected_connection() {
        let mut conn = Connection::new(Endpoint::unix("/tmp/never.sock"), Role::Client);
        assert!(!conn.is_connected());
        assert!(matches!(
            conn.read_line(),
            Err(QmpError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_connect_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = Connection::new(Endpoint::unix(dir.path().join("absent.sock")), Role::Client);
        assert!(matches!(conn.connect(), Err(QmpError::Connect { .. })));
    }

    #[test]
    fn test_roles_are_enforced() {
        let mut conn = Connection::new(Endpoint::unix("/tmp/x.sock"), Role::Server);
        assert!(matches!(conn.connect(), Err(QmpError::ProtocolViolation(_))));
    }

    #[test]
    fn test_message_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, mut client) = unix_pair(&dir);

        client
            .write_message(&Command::new("query-status"))
            .unwrap();
        let received = expect_message(server.read_line().unwrap());
        assert_eq!(received.kind(), MessageKind::Command);
        assert_eq!(
            received.into_command().unwrap(),
            Command::new("query-status")
        );

        server
            .write_message(&Response::ok(json!({"running": true})))
            .unwrap();
        let reply = expect_message(client.read_line().unwrap());
        assert_eq!(
            reply.into_response().unwrap(),
            Response::ok(json!({"running": true}))
        );
    }

    #[test]
    fn test_non_blocking_keeps_partial_line() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, mut client) = unix_pair(&dir);
        client.set_blocking(false).unwrap();

        let start = Instant::now();
        assert!(matches!(client.read_line().unwrap(), Frame::NotReady));
        assert!(start.elapsed() < Duration::from_secs(1));

        server.write_raw(b"{\"event\": \"ST").unwrap();
        assert!(matches!(client.read_line().unwrap(), Frame::NotReady));

        server.write_raw(b"OP\"}\n").unwrap();
        client.set_blocking(true).unwrap();
        let message = expect_message(client.read_line().unwrap());
        assert_eq!(message.into_event().unwrap().name, "STOP");
    }

    #[test]
    fn test_blank_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, mut client) = unix_pair(&dir);

        server.write_raw(b"\n\r\n{\"return\": {}}\n").unwrap();
        let message = expect_message(client.read_line().unwrap());
        assert_eq!(message.kind(), MessageKind::Response);
    }

    #[test]
    fn test_peer_close_reports_closed() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, mut client) = unix_pair(&dir);

        server.close();
        assert!(matches!(client.read_line().unwrap(), Frame::Closed));
    }

    #[test]
    fn test_unterminated_final_line() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, mut client) = unix_pair(&dir);

        server.write_raw(b"{\"return\": 7}").unwrap();
        server.close();
        let message = expect_message(client.read_line().unwrap());
        assert_eq!(message.get("return"), Some(&json!(7)));
        assert!(matches!(client.read_line().unwrap(), Frame::Closed));
    }

    #[test]
    fn test_malformed_line() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, mut client) = unix_pair(&dir);

        server.write_raw(b"this is not json\n").unwrap();
        assert!(matches!(
            client.read_line(),
            Err(QmpError::MalformedMessage { .. })
        ));
    }

    #[test]
    fn test_read_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let (_server, mut client) = unix_pair(&dir);

        client
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        assert!(matches!(client.read_line(), Err(QmpError::Timeout)));
    }

    #[test]
    fn test_write_to_closed_peer() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, mut client) = unix_pair(&dir);

        server.close();
        drop(server);
        let result = client.write_message(&Command::new("cont"));
        assert!(matches!(result, Err(QmpError::Connect { .. })));
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, mut client) = unix_pair(&dir);

        client.close();
        client.close();
        assert!(client.is_closed());
        assert!(matches!(client.read_line(), Err(QmpError::ConnectionClosed)));
        assert!(matches!(
            client.write_message(&Command::new("cont")),
            Err(QmpError::ConnectionClosed)
        ));
        assert!(matches!(
            client.set_blocking(false),
            Err(QmpError::ConnectionClosed)
        ));

        let socket = dir.path().join("qmp.sock");
        assert!(socket.exists());
        server.close();
        assert!(!socket.exists());
    }

    #[test]
    fn test_backlog_limit_applies_to_bound_listeners() {
        let tcp = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        limit_backlog(&tcp).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backlog.sock");
        let unix = UnixListener::bind(&path).unwrap();
        limit_backlog(&unix).unwrap();

        // Still accepts after the listen queue has been shrunk
        let _client = UnixStream::connect(&path).unwrap();
        unix.accept().unwrap();
    }

    #[test]
    fn test_tcp_listener_on_ephemeral_port() {
        let mut server = Connection::new(Endpoint::tcp("127.0.0.1", 0), Role::Server);
        server.listen().unwrap();
        let bound = server.local_endpoint().unwrap();
        assert!(matches!(bound, Endpoint::Tcp { port, .. } if port != 0));

        let mut client = Connection::new(bound, Role::Client);
        client.connect().unwrap();
        server.accept().unwrap();
        assert!(!client.is_local());

        server.write_message(&Response::ok(json!({}))).unwrap();
        let message = expect_message(client.read_line().unwrap());
        assert_eq!(message.kind(), MessageKind::Response);
    }
}
