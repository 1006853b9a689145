use std::net::{SocketAddr, TcpListener};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::encoder::{Encoder, FrameSender};
use crate::error::{Result, RtspError};
use crate::media::NalUnit;
use crate::media::h264::DEFAULT_MAX_PACKET_SIZE;
use crate::media::rtp::RTP_HEADER_LEN;
use crate::mount::{DEFAULT_FRAME_QUEUE_CAPACITY, DEFAULT_MOUNT_PATH, Mount};
use crate::pipeline::FanOut;
use crate::session::{DEFAULT_SESSION_TIMEOUT_SECS, SessionManager};
use crate::transport::interleaved::MAX_INTERLEAVED_PAYLOAD;
use crate::transport::tcp;

/// Default RTSP port.
pub const DEFAULT_PORT: u16 = 8554;

/// Accepted values of [`ServerConfig::max_packet_size`]. The upper bound
/// keeps a full RTP packet inside one interleaved frame.
pub const PACKET_SIZE_RANGE: RangeInclusive<usize> =
    64..=MAX_INTERLEAVED_PAYLOAD - RTP_HEADER_LEN;

const REAPER_INTERVAL: Duration = Duration::from_secs(1);

/// Server-level configuration used by protocol handlers and the media path.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Public host advertised in SDP `o=` and `c=` lines.
    /// When `None`, the local address the client connected to is used.
    pub public_host: Option<String>,
    /// Path of the single served stream.
    pub mount_path: String,
    /// SDP origin username field (`o=<username> ...`).
    pub sdp_username: String,
    /// SDP origin session id field (`o=... <session-id> ...`).
    pub sdp_session_id: String,
    /// SDP origin session version field (`o=... ... <session-version> ...`).
    pub sdp_session_version: String,
    /// SDP session name (`s=`).
    pub sdp_session_name: String,
    /// Upper bound on forwarded frames per second. `0` forwards everything.
    pub target_fps: u32,
    /// Largest RTP payload before FU-A fragmentation kicks in. Must lie in
    /// [`PACKET_SIZE_RANGE`].
    pub max_packet_size: usize,
    /// How long DESCRIBE waits for SPS/PPS.
    pub describe_timeout: Duration,
    /// Idle time after which a session is reaped.
    pub session_timeout: Duration,
    /// Inclusive range server RTP/RTCP port pairs are taken from.
    pub rtp_port_range: (u16, u16),
    /// Encoder units buffered ahead of fan-out.
    pub frame_queue_capacity: usize,
    /// RTP packets buffered per interleaved session before it counts as
    /// lagging and skips to the next key frame.
    pub interleaved_queue_packets: usize,
    /// Write timeout on control connections (bounds interleaved stalls).
    pub tcp_write_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            public_host: None,
            mount_path: DEFAULT_MOUNT_PATH.to_string(),
            sdp_username: "-".to_string(),
            sdp_session_id: "0".to_string(),
            sdp_session_version: "0".to_string(),
            sdp_session_name: "Live Stream".to_string(),
            target_fps: 30,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            describe_timeout: Duration::from_secs(5),
            session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
            rtp_port_range: (5000, 65534),
            frame_queue_capacity: DEFAULT_FRAME_QUEUE_CAPACITY,
            interleaved_queue_packets: 256,
            tcp_write_timeout: Duration::from_secs(2),
        }
    }
}

impl ServerConfig {
    /// Reject settings the media path cannot honor.
    pub fn validate(&self) -> Result<()> {
        if !PACKET_SIZE_RANGE.contains(&self.max_packet_size) {
            return Err(RtspError::InvalidConfig(format!(
                "max_packet_size {} outside {}..={}",
                self.max_packet_size,
                PACKET_SIZE_RANGE.start(),
                PACKET_SIZE_RANGE.end()
            )));
        }
        if self.rtp_port_range.0 >= self.rtp_port_range.1 {
            return Err(RtspError::InvalidConfig(format!(
                "empty RTP port range {}-{}",
                self.rtp_port_range.0, self.rtp_port_range.1
            )));
        }
        if self.frame_queue_capacity == 0 || self.interleaved_queue_packets == 0 {
            return Err(RtspError::InvalidConfig("queue capacities must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// High-level RTSP server orchestrator.
///
/// Owns the session table and the mount (codec config, governor, bound
/// encoder, frame queue). [`start`](Self::start) spawns three kinds
/// of threads: the TCP accept loop (plus one thread per connection), the
/// media fan-out and the idle-session reaper.
pub struct Server {
    session_manager: SessionManager,
    mount: Arc<Mount>,
    running: Arc<AtomicBool>,
    bind_addr: String,
    local_addr: Option<SocketAddr>,
    config: Arc<ServerConfig>,
    threads: Vec<JoinHandle<()>>,
}

impl Server {
    pub fn new(bind_addr: &str) -> Self {
        Self::with_config(bind_addr, ServerConfig::default())
    }

    pub fn with_config(bind_addr: &str, config: ServerConfig) -> Self {
        Self {
            session_manager: SessionManager::new(config.rtp_port_range, config.session_timeout),
            mount: Arc::new(Mount::with_frame_queue(
                &config.mount_path,
                config.target_fps,
                config.frame_queue_capacity,
            )),
            running: Arc::new(AtomicBool::new(false)),
            bind_addr: bind_addr.to_string(),
            local_addr: None,
            config: Arc::new(config),
            threads: Vec::new(),
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RtspError::AlreadyRunning);
        }
        self.config.validate()?;

        let listener = TcpListener::bind(&self.bind_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        self.running.store(true, Ordering::SeqCst);

        tracing::info!(
            addr = %local_addr,
            mount = %self.mount.path(),
            target_fps = self.config.target_fps,
            "RTSP server listening"
        );

        let running = self.running.clone();
        let session_manager = self.session_manager.clone();
        let mount = self.mount.clone();
        let config = self.config.clone();
        self.threads.push(thread::spawn(move || {
            tcp::accept_loop(listener, session_manager, mount, config, running);
        }));

        let running = self.running.clone();
        let fan_out = FanOut::new(self.mount.clone(), self.session_manager.clone());
        self.threads.push(thread::spawn(move || {
            fan_out.run(&running);
        }));

        let running = self.running.clone();
        let session_manager = self.session_manager.clone();
        self.threads.push(thread::spawn(move || {
            reap_idle_sessions(&session_manager, &running);
        }));

        Ok(())
    }

    /// Stop all server threads and drop every session.
    ///
    /// Connection threads notice the flag within their read poll interval
    /// and exit on their own.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("server stopping");
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("server thread panicked");
            }
        }
        self.session_manager.clear();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Attach an encoder instance and return the queue to push its output into.
    ///
    /// Codec config, governor state and the frame queue of any previous
    /// instance are discarded. SPS/PPS are taken from the encoder's declared
    /// output format when it carries them. Works whether or not the previous
    /// instance has already closed its queue.
    pub fn bind_encoder(&self, encoder: Arc<dyn Encoder>) -> FrameSender {
        self.mount.bind_encoder(encoder)
    }

    /// Producer half of the current frame queue.
    pub fn frame_sender(&self) -> FrameSender {
        self.mount.frame_sender()
    }

    /// Queue one encoder unit for fan-out.
    pub fn push(&self, unit: NalUnit) -> Result<()> {
        if !self.is_running() {
            return Err(RtspError::NotStarted);
        }
        self.mount.frame_sender().send(unit)
    }

    /// Sessions currently in PLAYING state.
    pub fn viewers(&self) -> Vec<Viewer> {
        self.session_manager
            .playing_sessions()
            .iter()
            .map(|session| Viewer {
                session_id: session.id.clone(),
                uri: session.uri.clone(),
                transport: session.transport.to_string(),
                peer_addr: session.peer_addr,
                packets_sent: session.packets_sent(),
            })
            .collect()
    }

    pub fn session_manager(&self) -> &SessionManager {
        &self.session_manager
    }

    pub fn mount(&self) -> &Arc<Mount> {
        &self.mount
    }

    /// Returns the server's configuration.
    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reap_idle_sessions(session_manager: &SessionManager, running: &AtomicBool) {
    let mut last_sweep = Instant::now();
    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
        if last_sweep.elapsed() >= REAPER_INTERVAL {
            last_sweep = Instant::now();
            session_manager.reap_idle(last_sweep);
        }
    }
    tracing::debug!("session reaper exited");
}

/// Information about a connected viewer (client in PLAY state).
#[derive(Debug, Clone)]
pub struct Viewer {
    pub session_id: String,
    pub uri: String,
    /// e.g. `udp 192.168.1.20:50000` or `tcp interleaved 0-1`.
    pub transport: String,
    pub peer_addr: SocketAddr,
    pub packets_sent: u64,
}
