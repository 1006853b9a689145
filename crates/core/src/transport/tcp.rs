use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crate::error::{ParseErrorKind, RtspError};
use crate::mount::Mount;
use crate::protocol::{MethodHandler, RtspRequest, RtspResponse};
use crate::server::ServerConfig;
use crate::session::SessionManager;
use crate::transport::interleaved::{INTERLEAVED_HEADER_LEN, INTERLEAVED_MAGIC, SharedWriter};

/// Largest request header block accepted before the connection is dropped.
pub const MAX_HEADER_BYTES: usize = 64 * 1024;
/// Largest request body accepted.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// How often a blocked read wakes up to check the `running` flag.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(250);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`crate::server::Server::stop`] can terminate it promptly.
pub fn accept_loop(
    listener: TcpListener,
    session_manager: SessionManager,
    mount: Arc<Mount>,
    config: Arc<ServerConfig>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let sm = session_manager.clone();
                let r = running.clone();
                let m = mount.clone();
                let c = config.clone();
                thread::spawn(move || {
                    Connection::handle(stream, sm, m, c, r);
                });
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

/// One unit read off an RTSP control connection.
#[derive(Debug)]
pub enum Message {
    /// A complete request, body included.
    Request(RtspRequest),
    /// A `$` frame sent by the client (typically RTCP receiver reports).
    Interleaved { channel: u8, payload: Vec<u8> },
    /// A request that could not be parsed. Its bytes have been consumed.
    Malformed(RtspError),
}

/// Splits the inbound byte stream of a control connection into RTSP
/// requests and interleaved binary frames.
pub struct MessageReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: Read> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(4096),
        }
    }

    /// Read the next message.
    ///
    /// Returns `Ok(None)` when the peer closed the connection. Read
    /// timeouts surface as `WouldBlock`/`TimedOut` errors; buffered partial
    /// input is kept, so the call can simply be retried.
    pub fn next_message(&mut self) -> io::Result<Option<Message>> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(message) = self.parse_buffered() {
                return Ok(Some(message));
            }
            let n = self.inner.read(&mut chunk)?;
            if n == 0 {
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn parse_buffered(&mut self) -> Option<Message> {
        // Stray line breaks between messages are allowed.
        let skip = self
            .buf
            .iter()
            .take_while(|b| **b == b'\r' || **b == b'\n')
            .count();
        self.buf.drain(..skip);

        if self.buf.first() == Some(&INTERLEAVED_MAGIC) {
            return self.parse_interleaved();
        }

        let Some(header_end) = find_header_end(&self.buf) else {
            if self.buf.len() > MAX_HEADER_BYTES {
                self.buf.clear();
                return Some(Message::Malformed(RtspError::Parse {
                    kind: ParseErrorKind::MessageTooLarge,
                }));
            }
            return None;
        };

        let head = String::from_utf8_lossy(&self.buf[..header_end]).into_owned();
        let parsed = RtspRequest::parse(&head).and_then(|request| {
            let len = request.content_length()?;
            if len > MAX_BODY_BYTES {
                return Err(RtspError::Parse {
                    kind: ParseErrorKind::MessageTooLarge,
                });
            }
            Ok((request, len))
        });

        match parsed {
            Ok((request, body_len)) => {
                if self.buf.len() < header_end + body_len {
                    return None;
                }
                let body = self.buf[header_end..header_end + body_len].to_vec();
                self.buf.drain(..header_end + body_len);
                Some(Message::Request(request.with_body(body)))
            }
            Err(e) => {
                self.buf.drain(..header_end);
                Some(Message::Malformed(e))
            }
        }
    }

    fn parse_interleaved(&mut self) -> Option<Message> {
        if self.buf.len() < INTERLEAVED_HEADER_LEN {
            return None;
        }
        let channel = self.buf[1];
        let len = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
        let total = INTERLEAVED_HEADER_LEN + len;
        if self.buf.len() < total {
            return None;
        }
        let payload = self.buf[INTERLEAVED_HEADER_LEN..total].to_vec();
        self.buf.drain(..total);
        Some(Message::Interleaved { channel, payload })
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 4)
        .or_else(|| buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2))
}

/// A single RTSP client connection with its own lifecycle.
struct Connection {
    reader: MessageReader<TcpStream>,
    writer: SharedWriter,
    handler: MethodHandler,
    session_manager: SessionManager,
    peer_addr: SocketAddr,
    connection_id: u64,
}

impl Connection {
    /// Entry point: set up a connection and run its request loop.
    pub fn handle(
        stream: TcpStream,
        session_manager: SessionManager,
        mount: Arc<Mount>,
        config: Arc<ServerConfig>,
        running: Arc<AtomicBool>,
    ) {
        let (Ok(peer_addr), Ok(local_addr)) = (stream.peer_addr(), stream.local_addr()) else {
            return;
        };

        if let Err(e) = stream
            .set_read_timeout(Some(READ_POLL_INTERVAL))
            .and_then(|_| stream.set_write_timeout(Some(config.tcp_write_timeout)))
        {
            tracing::warn!(%peer_addr, error = %e, "failed to configure socket timeouts");
            return;
        }
        let _ = stream.set_nodelay(true);

        let writer = match SharedWriter::for_stream(&stream) {
            Ok(writer) => writer,
            Err(e) => {
                tracing::warn!(%peer_addr, error = %e, "failed to clone connection for writing");
                return;
            }
        };

        let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::info!(%peer_addr, connection_id, "client connected");

        let handler = MethodHandler::new(
            session_manager.clone(),
            mount,
            config,
            peer_addr,
            local_addr,
            connection_id,
            writer.clone(),
        );

        let mut conn = Connection {
            reader: MessageReader::new(stream),
            writer,
            handler,
            session_manager,
            peer_addr,
            connection_id,
        };

        let reason = conn.run(&running);
        conn.cleanup();

        tracing::info!(%peer_addr, connection_id, reason, "client disconnected");
    }

    /// RTSP request/response loop. Returns the reason for exiting.
    fn run(&mut self, running: &Arc<AtomicBool>) -> &'static str {
        while running.load(Ordering::SeqCst) {
            let message = match self.reader.next_message() {
                Ok(Some(message)) => message,
                Ok(None) => return "connection closed by client",
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    continue;
                }
                Err(_) => return "read error",
            };

            match message {
                Message::Request(request) => {
                    tracing::debug!(
                        peer = %self.peer_addr,
                        method = %request.method,
                        uri = %request.uri,
                        version = %request.version,
                        "request"
                    );

                    let response = self.handler.handle(&request);

                    tracing::debug!(
                        peer = %self.peer_addr,
                        status = response.status_code,
                        "response"
                    );

                    if self.writer.write_all(response.serialize().as_bytes()).is_err() {
                        return "write error";
                    }
                }
                Message::Interleaved { channel, payload } => {
                    tracing::trace!(peer = %self.peer_addr, channel, len = payload.len(), "interleaved data from client");
                    if let Some(session) = self
                        .session_manager
                        .find_by_channel(self.connection_id, channel)
                    {
                        session.touch();
                    }
                }
                Message::Malformed(e) => {
                    tracing::warn!(peer = %self.peer_addr, error = %e, "parse error");
                    let response = RtspResponse::from_error(&e);
                    if self.writer.write_all(response.serialize().as_bytes()).is_err() {
                        return "write error";
                    }
                    if matches!(
                        e,
                        RtspError::Parse {
                            kind: ParseErrorKind::MessageTooLarge
                        }
                    ) {
                        return "message too large";
                    }
                }
            }
        }

        "server shutting down"
    }

    /// Tear down sessions owned by this connection.
    fn cleanup(&self) {
        let removed = self.session_manager.remove_connection(self.connection_id);
        if removed > 0 {
            tracing::info!(peer = %self.peer_addr, removed, "cleaned up sessions on disconnect");
        }
    }
}
