//! RTSP session management (RFC 2326 §3, §12.37).
//!
//! An RTSP session is a server-side state object created during SETUP and
//! destroyed by TEARDOWN, by its control connection closing, by a delivery
//! failure or by the idle reaper. It tracks:
//!
//! - A unique session ID (16 random hex digits, returned in the `Session`
//!   header).
//! - The playback state: Init -> Ready <-> Playing.
//! - The transport negotiated during SETUP (UDP port pair or interleaved
//!   channels on the control connection).
//! - Its own RTP packetizer: SSRC, sequence numbers and timestamp base are
//!   never shared between sessions.
//! - A timeout (default 60s, per RFC 2326 §12.37). Any request carrying the
//!   session id refreshes it.
//!
//! ## Session lifecycle (RFC 2326 §A.1)
//!
//! ```text
//! SETUP          -> Init -> Ready
//! PLAY           -> Playing
//! PAUSE          -> Ready
//! TEARDOWN       -> (removed)
//! TCP disconnect -> (removed, via cleanup)
//! idle timeout   -> (removed, via reaper)
//! ```

pub mod transport;

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::error::{Result, RtspError};
use crate::media::H264Packetizer;
use crate::transport::udp::PortAllocator;
pub use transport::{Sent, Transport, TransportHeader};

/// Default session timeout in seconds (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;

/// RTSP session state machine (RFC 2326 §A.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport being negotiated.
    Init,
    /// Transport allocated, not delivering.
    Ready,
    /// Media is being delivered.
    Playing,
}

/// What [`Session::deliver`] did with one access unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivered {
    /// RTP packets handed to the transport.
    Packets(usize),
    /// Nothing sent: the session still waits for a key frame.
    AwaitingKeyFrame,
    /// The client fell behind and the frame was dropped. Delivery resumes
    /// at the next key frame.
    Dropped,
}

#[derive(Debug)]
struct SessionMedia {
    packetizer: H264Packetizer,
    key_frame_sent: bool,
    packets_sent: u64,
}

/// A single RTSP session (RFC 2326 §3).
#[derive(Debug)]
pub struct Session {
    /// Unique session identifier (16-char hex string).
    pub id: String,
    /// The RTSP URI this session was set up for.
    pub uri: String,
    /// Remote address of the control connection that created the session.
    pub peer_addr: SocketAddr,
    /// Id of the control connection that created the session.
    pub connection_id: u64,
    pub transport: Transport,
    /// Session timeout in seconds (included in the `Session` response header).
    pub timeout_secs: u64,
    state: RwLock<SessionState>,
    media: Mutex<SessionMedia>,
    last_activity: Mutex<Instant>,
}

impl Session {
    fn new(
        id: String,
        uri: &str,
        peer_addr: SocketAddr,
        connection_id: u64,
        transport: Transport,
        packetizer: H264Packetizer,
        timeout_secs: u64,
    ) -> Self {
        Session {
            id,
            uri: uri.to_string(),
            peer_addr,
            connection_id,
            transport,
            timeout_secs,
            state: RwLock::new(SessionState::Init),
            media: Mutex::new(SessionMedia {
                packetizer,
                key_frame_sent: false,
                packets_sent: 0,
            }),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Transition to a new playback state.
    pub fn set_state(&self, state: SessionState) {
        let mut current = self.state.write();
        if *current != state {
            tracing::debug!(session_id = %self.id, old_state = ?*current, new_state = ?state, "state transition");
            *current = state;
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Whether this session is actively receiving media.
    pub fn is_playing(&self) -> bool {
        self.state() == SessionState::Playing
    }

    /// Whether the session still waits for its first key frame.
    pub fn awaiting_key_frame(&self) -> bool {
        !self.media.lock().key_frame_sent
    }

    /// Refresh the idle timer.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last control activity.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_activity.lock())
    }

    pub fn ssrc(&self) -> u32 {
        self.media.lock().packetizer.ssrc()
    }

    pub fn packets_sent(&self) -> u64 {
        self.media.lock().packets_sent
    }

    /// `(seq, rtptime)` the next packet will carry for `pts_us`, for `RTP-Info`.
    pub fn rtp_info(&self, presentation_time_us: u64) -> (u16, u32) {
        let media = self.media.lock();
        (
            media.packetizer.next_sequence(),
            media.packetizer.rtp_timestamp_for(presentation_time_us),
        )
    }

    /// Packetize one access unit and hand it to this session's transport.
    ///
    /// Until a key frame has gone out, non-key frames are skipped so the
    /// client starts on a decodable picture. The same happens again after a
    /// frame had to be dropped because the client fell behind. The media
    /// lock is released before the transport is called, and the transport
    /// itself never blocks.
    pub fn deliver(
        &self,
        nal_units: &[&[u8]],
        presentation_time_us: u64,
        is_key_frame: bool,
    ) -> io::Result<Delivered> {
        let packets = {
            let mut media = self.media.lock();
            if !media.key_frame_sent {
                if !is_key_frame {
                    return Ok(Delivered::AwaitingKeyFrame);
                }
                media.key_frame_sent = true;
                tracing::debug!(session_id = %self.id, "key frame, starting delivery");
            }
            media.packetizer.packetize(nal_units, presentation_time_us)
        };

        match self.transport.send_packets(&packets)? {
            Sent::All => {
                self.media.lock().packets_sent += packets.len() as u64;
                Ok(Delivered::Packets(packets.len()))
            }
            Sent::Congested => {
                self.media.lock().key_frame_sent = false;
                tracing::debug!(
                    session_id = %self.id,
                    presentation_time_us,
                    "client fell behind, dropping frames until the next key frame"
                );
                Ok(Delivered::Dropped)
            }
        }
    }

    /// Format the `Session` response header value per RFC 2326 §12.37.
    ///
    /// Example: `"3F2A9C01D4E5B678;timeout=60"`
    pub fn session_header_value(&self) -> String {
        format!("{};timeout={}", self.id, self.timeout_secs)
    }
}

/// Thread-safe registry of active sessions.
///
/// Backed by `parking_lot::RwLock`: the fan-out thread reads it on every
/// frame, control threads write it only on SETUP and teardown.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    ports: Arc<PortAllocator>,
    timeout: Duration,
}

impl SessionManager {
    pub fn new(rtp_port_range: (u16, u16), timeout: Duration) -> Self {
        SessionManager {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            ports: Arc::new(PortAllocator::new(rtp_port_range.0, rtp_port_range.1)),
            timeout,
        }
    }

    /// Register a new session for `uri` with an already negotiated transport.
    ///
    /// The session is returned in [`SessionState::Ready`].
    pub fn create_session(
        &self,
        uri: &str,
        peer_addr: SocketAddr,
        connection_id: u64,
        transport: Transport,
        packetizer: H264Packetizer,
    ) -> Arc<Session> {
        let mut sessions = self.sessions.write();
        let id = loop {
            let candidate = format!("{:016X}", rand::random::<u64>());
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };

        let session = Arc::new(Session::new(
            id.clone(),
            uri,
            peer_addr,
            connection_id,
            transport,
            packetizer,
            self.timeout.as_secs(),
        ));
        sessions.insert(id.clone(), session.clone());
        let total = sessions.len();
        drop(sessions);

        session.set_state(SessionState::Ready);
        tracing::info!(
            session_id = %id,
            uri,
            transport = %session.transport,
            ssrc = format_args!("{:08X}", session.ssrc()),
            total_sessions = total,
            "session created"
        );
        session
    }

    /// Give an existing session a new transport (SETUP naming a known
    /// session).
    ///
    /// The session keeps its id, URI and control connection and restarts in
    /// [`SessionState::Ready`] with `packetizer`. The old transport is
    /// released once in-flight references to the previous session are gone.
    /// Playing sessions are refused with
    /// [`RtspError::MethodNotValidInState`].
    pub fn reopen_session(
        &self,
        id: &str,
        transport: Transport,
        packetizer: H264Packetizer,
    ) -> Result<Arc<Session>> {
        let mut sessions = self.sessions.write();
        let current = sessions
            .get(id)
            .ok_or_else(|| RtspError::SessionNotFound(id.to_string()))?;
        if current.is_playing() {
            return Err(RtspError::MethodNotValidInState(format!(
                "session {id} is playing"
            )));
        }

        let session = Arc::new(Session::new(
            id.to_string(),
            &current.uri,
            current.peer_addr,
            current.connection_id,
            transport,
            packetizer,
            self.timeout.as_secs(),
        ));
        sessions.insert(id.to_string(), session.clone());
        drop(sessions);

        session.set_state(SessionState::Ready);
        tracing::info!(session_id = %id, transport = %session.transport, "session transport replaced");
        Ok(session)
    }

    /// Look up a session by ID.
    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Remove and return a session by ID.
    pub fn remove_session(&self, id: &str) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write();
        let removed = sessions.remove(id);
        if removed.is_some() {
            tracing::info!(session_id = %id, total_sessions = sessions.len(), "session removed");
        }
        removed
    }

    /// Remove multiple sessions at once (used during TCP disconnect cleanup).
    pub fn remove_sessions(&self, ids: &[String]) -> usize {
        let mut sessions = self.sessions.write();
        let mut removed = 0;
        for id in ids {
            if sessions.remove(id).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(removed, remaining = sessions.len(), "batch session cleanup");
        }
        removed
    }

    /// Remove every session owned by a control connection.
    pub fn remove_connection(&self, connection_id: u64) -> usize {
        let ids: Vec<String> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.connection_id == connection_id)
            .map(|s| s.id.clone())
            .collect();
        self.remove_sessions(&ids)
    }

    /// Drop sessions idle for longer than the session timeout.
    pub fn reap_idle(&self, now: Instant) -> Vec<String> {
        let mut sessions = self.sessions.write();
        let expired: Vec<String> = sessions
            .values()
            .filter(|s| s.idle_for(now) > self.timeout)
            .map(|s| s.id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
            tracing::info!(session_id = %id, "session timed out");
        }
        expired
    }

    /// Bind a server RTP/RTCP socket pair for a UDP session.
    pub fn allocate_udp_pair(&self, client_ip: IpAddr) -> Result<(UdpSocket, UdpSocket)> {
        self.ports.allocate(client_ip)
    }

    /// Returns all sessions currently in the [`SessionState::Playing`] state.
    pub fn playing_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.is_playing())
            .cloned()
            .collect()
    }

    /// Session attached to a connection that owns interleaved `channel`.
    pub fn find_by_channel(&self, connection_id: u64, channel: u8) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .find(|s| s.connection_id == connection_id && s.transport.owns_channel(channel))
            .cloned()
    }

    pub fn clear(&self) {
        self.sessions.write().clear();
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(
            (5000, 65534),
            Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
        )
    }
}
