//! `$`-framed binary data on the RTSP control connection (RFC 2326 §10.12).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   '$' (0x24)  |    channel    |         length (BE u16)       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       payload (length bytes)                  |
//! ```
//!
//! RTP for an interleaved session never touches the socket from the fan-out
//! thread. Each session owns an [`InterleavedSender`]: a bounded packet
//! queue drained by a dedicated writer thread.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use parking_lot::{Condvar, Mutex};

pub const INTERLEAVED_MAGIC: u8 = b'$';
pub const INTERLEAVED_HEADER_LEN: usize = 4;
/// Largest payload one frame can carry.
pub const MAX_INTERLEAVED_PAYLOAD: usize = u16::MAX as usize;

/// Build one interleaved frame.
pub fn encode_frame(channel: u8, payload: &[u8]) -> io::Result<Vec<u8>> {
    let len = u16::try_from(payload.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("interleaved payload of {} bytes exceeds 65535", payload.len()),
        )
    })?;
    let mut frame = Vec::with_capacity(INTERLEAVED_HEADER_LEN + payload.len());
    frame.push(INTERLEAVED_MAGIC);
    frame.push(channel);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Write half of an RTSP connection, shared between the connection's
/// request loop (responses) and the writer threads of its interleaved
/// sessions (`$` frames).
///
/// Every write takes the lock for the whole message so a response can never
/// land in the middle of an RTP frame.
#[derive(Clone)]
pub struct SharedWriter {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
    stream: Option<Arc<TcpStream>>,
    broken: Arc<AtomicBool>,
}

impl SharedWriter {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
            stream: None,
            broken: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Writer over `writer` that shuts `stream` down when a write fails.
    pub fn with_shutdown<W: Write + Send + 'static>(writer: W, stream: TcpStream) -> Self {
        Self {
            stream: Some(Arc::new(stream)),
            ..Self::new(writer)
        }
    }

    /// Writer over a TCP control connection.
    pub fn for_stream(stream: &TcpStream) -> io::Result<Self> {
        Ok(Self::with_shutdown(stream.try_clone()?, stream.try_clone()?))
    }

    /// Write a complete message.
    ///
    /// A failed write may leave part of a message on the wire, after which
    /// the peer can no longer find message boundaries. The writer is then
    /// marked broken, the connection is shut down in both directions and
    /// every later write fails with `BrokenPipe`.
    pub fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.inner.lock();
        if self.is_broken() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "control connection already failed",
            ));
        }
        let result = writer.write_all(bytes).and_then(|()| writer.flush());
        if let Err(e) = &result {
            self.break_connection(e);
        }
        result
    }

    /// Write one RTP or RTCP packet as an interleaved frame.
    pub fn write_interleaved(&self, channel: u8, payload: &[u8]) -> io::Result<()> {
        let frame = encode_frame(channel, payload)?;
        self.write_all(&frame)
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    fn break_connection(&self, error: &io::Error) {
        if self.broken.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::warn!(error = %error, "control connection write failed, shutting it down");
        if let Some(stream) = &self.stream {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Outcome of [`InterleavedSender::send_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Every packet of the unit was queued.
    All,
    /// The queue had no room; nothing was queued.
    Full,
}

#[derive(Debug)]
struct OutboundState {
    frames: VecDeque<Vec<u8>>,
    closed: bool,
    failed: bool,
}

#[derive(Debug)]
struct Outbound {
    state: Mutex<OutboundState>,
    available: Condvar,
    capacity: usize,
}

/// Bounded outbound RTP queue of one interleaved session.
///
/// A writer thread moves frames from the queue onto the shared control
/// connection. Dropping the sender stops the thread and discards whatever
/// is still queued.
pub struct InterleavedSender {
    outbound: Arc<Outbound>,
    channel: u8,
}

impl InterleavedSender {
    /// Start the writer thread for RTP `channel`, queueing at most
    /// `capacity` packets.
    pub fn spawn(writer: SharedWriter, channel: u8, capacity: usize) -> io::Result<Self> {
        let outbound = Arc::new(Outbound {
            state: Mutex::new(OutboundState {
                frames: VecDeque::new(),
                closed: false,
                failed: false,
            }),
            available: Condvar::new(),
            capacity: capacity.max(1),
        });

        let worker = outbound.clone();
        thread::Builder::new()
            .name(format!("rtsp-interleaved-{channel}"))
            .spawn(move || drain(&worker, &writer))?;

        Ok(Self { outbound, channel })
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Queue every packet of one access unit, or none of them.
    ///
    /// A unit that does not fit next to what is already queued is refused
    /// whole. An empty queue always takes the unit, so an access unit with
    /// more packets than the capacity still goes out. Fails once the writer
    /// thread has given up on the connection.
    pub fn send_all(&self, packets: &[Vec<u8>]) -> io::Result<Enqueued> {
        let frames = packets
            .iter()
            .map(|packet| encode_frame(self.channel, packet))
            .collect::<io::Result<Vec<_>>>()?;

        let mut state = self.outbound.state.lock();
        if state.failed || state.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "interleaved writer stopped",
            ));
        }
        if !state.frames.is_empty() && state.frames.len() + frames.len() > self.outbound.capacity {
            return Ok(Enqueued::Full);
        }
        state.frames.extend(frames);
        drop(state);
        self.outbound.available.notify_one();
        Ok(Enqueued::All)
    }

    /// Frames waiting for the writer thread.
    pub fn queued(&self) -> usize {
        self.outbound.state.lock().frames.len()
    }
}

impl Drop for InterleavedSender {
    fn drop(&mut self) {
        let mut state = self.outbound.state.lock();
        state.closed = true;
        state.frames.clear();
        drop(state);
        self.outbound.available.notify_all();
    }
}

fn drain(outbound: &Outbound, writer: &SharedWriter) {
    loop {
        let frame = {
            let mut state = outbound.state.lock();
            while state.frames.is_empty() && !state.closed {
                outbound.available.wait(&mut state);
            }
            if state.closed {
                return;
            }
            match state.frames.pop_front() {
                Some(frame) => frame,
                None => return,
            }
        };

        if let Err(e) = writer.write_all(&frame) {
            tracing::debug!(error = %e, "interleaved writer stopped");
            let mut state = outbound.state.lock();
            state.failed = true;
            state.frames.clear();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::time::{Duration, Instant};

    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Accepts a couple of bytes, then times out.
    struct StallingWriter {
        budget: usize,
    }

    impl Write for StallingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out"));
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct SlowWriter(Duration);

    impl Write for SlowWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            thread::sleep(self.0);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn frame_layout() {
        let frame = encode_frame(2, &[0xaa; 300]).unwrap();
        assert_eq!(&frame[..4], &[b'$', 2, 0x01, 0x2c]);
        assert_eq!(frame.len(), 304);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let err = encode_frame(0, &vec![0u8; MAX_INTERLEAVED_PAYLOAD + 1]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn responses_and_frames_share_one_stream() {
        let sink = Sink::default();
        let writer = SharedWriter::new(sink.clone());
        writer.write_all(b"RTSP/1.0 200 OK\r\n\r\n").unwrap();
        writer.write_interleaved(0, &[1, 2, 3]).unwrap();

        let bytes = sink.0.lock().clone();
        assert!(bytes.starts_with(b"RTSP/1.0 200 OK\r\n\r\n"));
        assert!(bytes.ends_with(&[b'$', 0, 0, 3, 1, 2, 3]));
    }

    #[test]
    fn partial_frame_write_shuts_the_connection_down() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, _) = listener.accept().unwrap();

        let writer = SharedWriter::with_shutdown(StallingWriter { budget: 2 }, server_side);
        let err = writer.write_interleaved(0, &[0x80; 100]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(writer.is_broken());

        let err = writer.write_all(b"RTSP/1.0 200 OK\r\n\r\n").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);

        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).unwrap(), 0, "peer sees EOF");
    }

    #[test]
    fn sender_does_not_wait_for_a_slow_socket() {
        let writer = SharedWriter::new(SlowWriter(Duration::from_millis(300)));
        let sender = InterleavedSender::spawn(writer, 0, 16).unwrap();

        let start = Instant::now();
        for _ in 0..3 {
            assert_eq!(sender.send_all(&[vec![0x80; 20]]).unwrap(), Enqueued::All);
        }
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn full_queue_refuses_the_whole_unit() {
        let writer = SharedWriter::new(SlowWriter(Duration::from_millis(300)));
        let sender = InterleavedSender::spawn(writer, 0, 2).unwrap();
        let unit = [vec![0x80; 20], vec![0x80; 20]];

        assert_eq!(sender.send_all(&unit).unwrap(), Enqueued::All);
        // At most one frame has left the queue while the writer sleeps.
        assert_eq!(sender.send_all(&unit).unwrap(), Enqueued::Full);
        assert!(sender.queued() <= 2);
    }

    #[test]
    fn frames_reach_the_connection_in_order() {
        let sink = Sink::default();
        let sender = InterleavedSender::spawn(SharedWriter::new(sink.clone()), 4, 8).unwrap();
        sender.send_all(&[vec![1], vec![2]]).unwrap();

        assert!(wait_until(|| sink.0.lock().len() == 10));
        assert_eq!(
            sink.0.lock().as_slice(),
            &[b'$', 4, 0, 1, 1, b'$', 4, 0, 1, 2]
        );
    }

    #[test]
    fn sender_fails_after_the_writer_gives_up() {
        let writer = SharedWriter::new(StallingWriter { budget: 0 });
        let sender = InterleavedSender::spawn(writer.clone(), 0, 8).unwrap();
        assert_eq!(sender.send_all(&[vec![0x80]]).unwrap(), Enqueued::All);

        assert!(wait_until(|| sender.send_all(&[vec![0x80]]).is_err()));
        assert!(writer.is_broken());
    }
}
