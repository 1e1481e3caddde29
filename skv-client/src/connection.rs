//! # Connection
//!
//! Purpose: Own one TCP session to one server and sequence strict
//! request/reply exchanges over it.
//!
//! ## Design Principles
//! 1. **Exclusive Use**: Every I/O method takes `&mut self`; a second caller
//!    cannot interleave frames on the same stream.
//! 2. **Terminal Failure**: Any hard failure tears the socket down and parks
//!    the instance in `Disconnected`; it is never reused.
//! 3. **No Retry**: Errors surface immediately, resubmission belongs to the caller.
//! 4. **Buffer Reuse**: Line and frame buffers live on the connection.
//!
//! ## Lifecycle
//!
//! ```text
//! Fresh --open--> Connected --(secret)--> Authenticating --> Ready
//!   any state --failure / close--> Disconnected (terminal)
//! ```

use std::fmt;
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::pool::PoolLink;
use crate::resp::{encode_command, encode_streamed_header, read_reply, Command, ReplyValue};

/// Chunk size used by the raw upload path.
pub const RAW_CHUNK_SIZE: usize = 64 * 1024;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Fresh,
    Connected,
    Authenticating,
    Ready,
    Disconnected,
}

/// Lifecycle notifications emitted by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// Socket established and handshake (if any) succeeded.
    Opened,
    /// Lease ended; the caller handed the connection back.
    Released,
    /// Socket torn down by failure or explicit close.
    Disconnected,
}

/// Who a connection talks to, plus its unique instance id.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionIdentity {
    pub id: Uuid,
    pub host: String,
    pub port: u16,
    pub secret: Option<String>,
}

impl ConnectionIdentity {
    /// Builds an identity with a freshly generated instance id.
    pub fn new(host: impl Into<String>, port: u16, secret: Option<String>) -> Self {
        ConnectionIdentity {
            id: Uuid::new_v4(),
            host: host.into(),
            port,
            secret,
        }
    }
}

// The secret never reaches logs.
impl fmt::Debug for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionIdentity")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

struct Io {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

/// Single TCP session with reusable buffers.
pub struct Connection {
    identity: ConnectionIdentity,
    config: ClientConfig,
    state: ConnectionState,
    io: Option<Io>,
    line_buf: Vec<u8>,
    write_buf: Vec<u8>,
    link: Option<PoolLink>,
}

impl Connection {
    /// Creates an unopened connection.
    pub fn new(identity: ConnectionIdentity, config: &ClientConfig) -> Self {
        Connection {
            identity,
            config: config.clone(),
            state: ConnectionState::Fresh,
            io: None,
            line_buf: Vec::with_capacity(128),
            write_buf: Vec::with_capacity(256),
            link: None,
        }
    }

    pub(crate) fn with_link(mut self, link: PoolLink) -> Self {
        self.link = Some(link);
        self
    }

    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    pub fn id(&self) -> Uuid {
        self.identity.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// Connects the socket and runs the AUTH handshake when a non-blank
    /// secret is set.
    ///
    /// Any failure leaves the connection `Disconnected`.
    pub fn open(&mut self) -> ClientResult<()> {
        if self.state != ConnectionState::Fresh {
            return Err(ClientError::connection(format!(
                "cannot open a connection in state {:?}",
                self.state
            )));
        }

        match self.establish() {
            Ok(()) => {
                self.state = ConnectionState::Ready;
                info!(
                    id = %self.identity.id,
                    host = %self.identity.host,
                    port = self.identity.port,
                    "connection opened"
                );
                self.notify(LifecycleEvent::Opened);
                Ok(())
            }
            Err(err) => {
                warn!(
                    id = %self.identity.id,
                    host = %self.identity.host,
                    port = self.identity.port,
                    error = %err,
                    "failed to open connection"
                );
                self.teardown();
                Err(err)
            }
        }
    }

    /// Writes one encoded command frame.
    pub fn send(&mut self, command: &Command) -> ClientResult<()> {
        self.ensure_ready()?;
        let result = self.write_frame(command);
        self.check(result)
    }

    /// Reads exactly one reply.
    pub fn read_reply(&mut self) -> ClientResult<ReplyValue> {
        self.ensure_ready()?;
        let result = self.read_frame();
        self.check(result)
    }

    /// Sends a command and waits for its reply.
    pub fn exec(&mut self, command: &Command) -> ClientResult<ReplyValue> {
        self.send(command)?;
        self.read_reply()
    }

    /// Streams `source` to the socket in fixed-size chunks followed by CRLF.
    ///
    /// Returns the number of payload bytes written. The caller must already
    /// have sent a header announcing the payload, see [`Connection::send_with_payload`].
    pub fn send_raw<R: Read>(&mut self, source: &mut R) -> ClientResult<u64> {
        self.ensure_ready()?;
        let result = self.copy_raw(source);
        self.check(result)
    }

    /// Sends `command` with one extra trailing argument of `payload_len`
    /// bytes streamed from `source`.
    pub fn send_with_payload<R: Read>(
        &mut self,
        command: &Command,
        payload_len: u64,
        source: &mut R,
    ) -> ClientResult<()> {
        self.ensure_ready()?;
        let result = self.write_streamed(command, payload_len, source);
        self.check(result)
    }

    /// Best-effort graceful shutdown. Idempotent and safe from any state.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }

        if self.state == ConnectionState::Ready {
            // QUIT reply is deliberately not read.
            let _ = self.write_frame(&Command::new("QUIT"));
        }
        debug!(id = %self.identity.id, "closing connection");
        self.teardown();
    }

    fn establish(&mut self) -> ClientResult<()> {
        let stream = connect_stream(&self.identity, &self.config)?;
        self.configure(stream)
            .map_err(|err| err.into_connection("socket setup failed"))?;
        self.state = ConnectionState::Connected;

        // A blank secret means no AUTH, same as `None`.
        let secret = self.identity.secret.clone().filter(|s| !s.trim().is_empty());
        if let Some(secret) = secret {
            self.state = ConnectionState::Authenticating;
            self.authenticate(&secret)?;
        }
        Ok(())
    }

    fn configure(&mut self, stream: TcpStream) -> ClientResult<()> {
        // Disable Nagle to keep request latency low for small frames.
        stream.set_nodelay(true)?;
        stream.set_read_timeout(self.config.read_timeout)?;
        stream.set_write_timeout(self.config.write_timeout)?;

        let read_half = stream.try_clone()?;
        let capacity = self.config.io_buffer_size.max(1);
        self.io = Some(Io {
            reader: BufReader::with_capacity(capacity, read_half),
            writer: BufWriter::with_capacity(capacity, stream),
        });
        Ok(())
    }

    fn authenticate(&mut self, secret: &str) -> ClientResult<()> {
        let command = Command::new("AUTH").arg(secret);
        self.write_frame(&command)
            .map_err(|err| err.into_connection("authentication failed"))?;
        let reply = self
            .read_frame()
            .map_err(|err| err.into_connection("authentication failed"))?;

        match reply {
            ReplyValue::SimpleString(_) => Ok(()),
            ReplyValue::Error(message) => {
                let message = message.strip_prefix("ERR ").unwrap_or(&message);
                Err(ClientError::connection(format!(
                    "authentication rejected: {message}"
                )))
            }
            other => Err(ClientError::connection(format!(
                "unexpected authentication reply: {other:?}"
            ))),
        }
    }

    fn write_frame(&mut self, command: &Command) -> ClientResult<()> {
        let io = self.io.as_mut().ok_or_else(ClientError::not_connected)?;
        self.write_buf.clear();
        encode_command(command, &mut self.write_buf);
        io.writer.write_all(&self.write_buf)?;
        io.writer.flush()?;
        Ok(())
    }

    fn read_frame(&mut self) -> ClientResult<ReplyValue> {
        let io = self.io.as_mut().ok_or_else(ClientError::not_connected)?;
        read_reply(&mut io.reader, &mut self.line_buf)
    }

    fn copy_raw<R: Read>(&mut self, source: &mut R) -> ClientResult<u64> {
        let io = self.io.as_mut().ok_or_else(ClientError::not_connected)?;
        let mut chunk = vec![0u8; RAW_CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let read = match source.read(&mut chunk) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            };
            io.writer.write_all(&chunk[..read])?;
            total += read as u64;
        }
        io.writer.write_all(b"\r\n")?;
        io.writer.flush()?;
        Ok(total)
    }

    fn write_streamed<R: Read>(
        &mut self,
        command: &Command,
        payload_len: u64,
        source: &mut R,
    ) -> ClientResult<()> {
        let io = self.io.as_mut().ok_or_else(ClientError::not_connected)?;
        self.write_buf.clear();
        encode_streamed_header(command, payload_len, &mut self.write_buf);
        io.writer.write_all(&self.write_buf)?;

        let mut limited = source.take(payload_len);
        let sent = self.copy_raw(&mut limited)?;
        if sent != payload_len {
            return Err(ClientError::protocol(format!(
                "payload ended after {sent} of {payload_len} bytes"
            )));
        }
        Ok(())
    }

    fn ensure_ready(&self) -> ClientResult<()> {
        if self.state == ConnectionState::Ready {
            Ok(())
        } else {
            Err(ClientError::not_connected())
        }
    }

    fn check<T>(&mut self, result: ClientResult<T>) -> ClientResult<T> {
        if let Err(err) = &result {
            warn!(
                id = %self.identity.id,
                host = %self.identity.host,
                port = self.identity.port,
                error = %err,
                "connection failed, marking disconnected"
            );
            self.teardown();
        }
        result
    }

    fn teardown(&mut self) {
        if let Some(io) = self.io.take() {
            // Unflushed bytes are discarded with the socket.
            let (stream, _) = io.writer.into_parts();
            let _ = stream.shutdown(Shutdown::Both);
        }
        let previous = std::mem::replace(&mut self.state, ConnectionState::Disconnected);
        if previous != ConnectionState::Disconnected {
            self.notify(LifecycleEvent::Disconnected);
        }
    }

    fn notify(&self, event: LifecycleEvent) {
        debug!(id = %self.identity.id, ?event, "connection lifecycle event");
        if let Some(link) = &self.link {
            link.notify(&self.identity, event);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("identity", &self.identity)
            .field("state", &self.state)
            .finish()
    }
}

fn connect_stream(identity: &ConnectionIdentity, config: &ClientConfig) -> ClientResult<TcpStream> {
    let target = (identity.host.as_str(), identity.port);
    let addrs = target.to_socket_addrs().map_err(|err| ClientError::Connection {
        message: format!("cannot resolve {}:{}", identity.host, identity.port),
        source: Some(err),
    })?;

    let mut last_err = None;
    for addr in addrs {
        let attempt = match config.connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }

    Err(ClientError::Connection {
        message: format!("cannot connect to {}:{}", identity.host, identity.port),
        source: last_err,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, BufRead};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn test_config() -> ClientConfig {
        ClientConfig::default().with_timeout(Duration::from_secs(2))
    }

    /// Accepts one client and forwards every line it sends until EOF.
    fn spawn_recorder() -> (u16, mpsc::Receiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream);
            loop {
                let mut line = Vec::new();
                match reader.read_until(b'\n', &mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        (port, rx)
    }

    #[test]
    fn starts_fresh() {
        let conn = Connection::new(ConnectionIdentity::new("127.0.0.1", 1, None), &test_config());
        assert_eq!(conn.state(), ConnectionState::Fresh);
        assert!(!conn.is_ready());
    }

    #[test]
    fn io_before_open_fails_fast() {
        let mut conn =
            Connection::new(ConnectionIdentity::new("127.0.0.1", 1, None), &test_config());
        let err = conn.send(&Command::new("PING")).unwrap_err();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::NotConnected));
        assert_eq!(conn.state(), ConnectionState::Fresh);
    }

    #[test]
    fn open_failure_is_connection_error_and_terminal() {
        // Bind then drop to obtain a port with no listener.
        let port = TcpListener::bind("127.0.0.1:0")
            .expect("bind")
            .local_addr()
            .expect("addr")
            .port();
        let mut conn =
            Connection::new(ConnectionIdentity::new("127.0.0.1", port, None), &test_config());
        let err = conn.open().unwrap_err();
        assert!(matches!(err, ClientError::Connection { .. }));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(matches!(conn.open(), Err(ClientError::Connection { .. })));
    }

    #[test]
    fn read_after_send_failure_fails_fast() {
        let (port, _lines) = spawn_recorder();
        let mut conn =
            Connection::new(ConnectionIdentity::new("127.0.0.1", port, None), &test_config());
        conn.open().expect("open");

        // Shut our own write half so the next flush fails deterministically.
        conn.io
            .as_ref()
            .expect("io")
            .writer
            .get_ref()
            .shutdown(Shutdown::Write)
            .expect("shutdown");

        let err = conn.send(&Command::new("PING")).unwrap_err();
        assert!(matches!(err, ClientError::Transport(_)));
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        let err = conn.read_reply().unwrap_err();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::NotConnected));
    }

    /// Yields one chunk, then fails.
    struct FailingSource {
        served: bool,
    }

    impl Read for FailingSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.served {
                return Err(io::Error::new(io::ErrorKind::Other, "source broke"));
            }
            self.served = true;
            let chunk = b"partial";
            buf[..chunk.len()].copy_from_slice(chunk);
            Ok(chunk.len())
        }
    }

    #[test]
    fn raw_source_failure_disconnects() {
        let (port, _lines) = spawn_recorder();
        let mut conn =
            Connection::new(ConnectionIdentity::new("127.0.0.1", port, None), &test_config());
        conn.open().expect("open");

        let err = conn.send_raw(&mut FailingSource { served: false }).unwrap_err();
        assert!(matches!(err, ClientError::Transport(_)));
        assert_eq!(err.io_kind(), Some(io::ErrorKind::Other));
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        let err = conn.read_reply().unwrap_err();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::NotConnected));
    }

    #[test]
    fn blank_secret_skips_auth() {
        let (port, lines) = spawn_recorder();
        let mut conn = Connection::new(
            ConnectionIdentity::new("127.0.0.1", port, Some("  ".into())),
            &test_config(),
        );
        conn.open().expect("open");
        assert!(conn.is_ready());

        conn.close();

        // Only QUIT reached the wire.
        let received: Vec<Vec<u8>> = lines.iter().collect();
        assert_eq!(received.concat(), b"*1\r\n$4\r\nQUIT\r\n");
    }

    #[test]
    fn close_sends_quit_and_is_idempotent() {
        let (port, lines) = spawn_recorder();
        let mut conn =
            Connection::new(ConnectionIdentity::new("127.0.0.1", port, None), &test_config());
        conn.open().expect("open");
        conn.close();
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        let received: Vec<Vec<u8>> = lines.iter().collect();
        assert_eq!(received.concat(), b"*1\r\n$4\r\nQUIT\r\n");
    }

    #[test]
    fn close_on_fresh_connection_is_safe() {
        let mut conn =
            Connection::new(ConnectionIdentity::new("127.0.0.1", 1, None), &test_config());
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn identity_debug_redacts_secret() {
        let identity = ConnectionIdentity::new("db", 6379, Some("hunter2".to_string()));
        let rendered = format!("{identity:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn identities_are_unique() {
        let a = ConnectionIdentity::new("db", 6379, None);
        let b = ConnectionIdentity::new("db", 6379, None);
        assert_ne!(a.id, b.id);
    }
}
