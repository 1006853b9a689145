use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::{ParseErrorKind, Result, RtspError};
use crate::media::H264Packetizer;
use crate::mount::Mount;
use crate::protocol::request::{RtspMethod, RtspRequest};
use crate::protocol::response::RtspResponse;
use crate::protocol::sdp::{self, SdpOrigin};
use crate::server::ServerConfig;
use crate::session::transport::client_udp_addrs;
use crate::session::{Session, SessionManager, SessionState, Transport, TransportHeader};
use crate::transport::interleaved::{InterleavedSender, SharedWriter};
use crate::transport::udp::UdpSocketPair;

/// Handles RTSP method requests for a single TCP connection.
///
/// Sessions created here are tagged with the connection id so they can be
/// torn down when the connection drops.
pub struct MethodHandler {
    session_manager: SessionManager,
    mount: Arc<Mount>,
    config: Arc<ServerConfig>,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    connection_id: u64,
    writer: SharedWriter,
}

impl MethodHandler {
    pub fn new(
        session_manager: SessionManager,
        mount: Arc<Mount>,
        config: Arc<ServerConfig>,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        connection_id: u64,
        writer: SharedWriter,
    ) -> Self {
        MethodHandler {
            session_manager,
            mount,
            config,
            peer_addr,
            local_addr,
            connection_id,
            writer,
        }
    }

    pub fn handle(&mut self, request: &RtspRequest) -> RtspResponse {
        let cseq = request.cseq().unwrap_or("0");

        let named = request
            .session_id()
            .and_then(|id| self.session_manager.get_session(id));
        if let Some(session) = &named {
            session.touch();
        }

        let result = match &request.method {
            RtspMethod::Options => Ok(self.handle_options()),
            RtspMethod::Describe => self.handle_describe(&request.uri),
            RtspMethod::Setup => self.handle_setup(request),
            RtspMethod::Play => self.handle_play(request),
            RtspMethod::Pause => self.handle_pause(request),
            RtspMethod::Teardown => self.handle_teardown(request),
            RtspMethod::GetParameter | RtspMethod::SetParameter => self.handle_keepalive(request),
            RtspMethod::Unknown(method) => {
                tracing::warn!(%method, %cseq, "unsupported RTSP method");
                Ok(RtspResponse::not_implemented())
            }
        };

        match result {
            Ok(response) => {
                let response = match &named {
                    Some(session)
                        if response.get_header("Session").is_none()
                            && self.session_manager.get_session(&session.id).is_some() =>
                    {
                        response.add_header("Session", &session.session_header_value())
                    }
                    _ => response,
                };
                response.add_header("CSeq", cseq)
            }
            Err(e) => {
                tracing::warn!(
                    peer = %self.peer_addr,
                    method = %request.method,
                    %cseq,
                    error = %e,
                    "request failed"
                );
                RtspResponse::from_error(&e).add_header("CSeq", cseq)
            }
        }
    }

    fn handle_options(&self) -> RtspResponse {
        RtspResponse::ok().add_header("Public", &RtspMethod::public_header())
    }

    fn require_mount(&self, uri: &str) -> Result<()> {
        if self.mount.matches_uri(uri) {
            Ok(())
        } else {
            Err(RtspError::MountNotFound(uri.to_string()))
        }
    }

    /// Address advertised in SDP: the configured public host, otherwise the
    /// local address the client reached us on.
    fn sdp_address(&self) -> String {
        match &self.config.public_host {
            Some(host) => host.clone(),
            None => self.local_addr.ip().to_string(),
        }
    }

    /// Blocks for at most `describe_timeout` while the codec config is
    /// still incomplete.
    fn handle_describe(&self, uri: &str) -> Result<RtspResponse> {
        self.require_mount(uri)?;

        let codec_config = self
            .mount
            .codec_config()
            .wait_ready(self.config.describe_timeout)
            .ok_or(RtspError::CodecConfigUnavailable)?;

        let address = self.sdp_address();
        let origin = SdpOrigin {
            address: &address,
            username: &self.config.sdp_username,
            session_id: &self.config.sdp_session_id,
            session_version: &self.config.sdp_session_version,
            session_name: &self.config.sdp_session_name,
        };
        let body = sdp::generate_sdp(&origin, &codec_config).ok_or(RtspError::CodecConfigUnavailable)?;

        let content_base = if uri.ends_with('/') {
            uri.to_string()
        } else {
            format!("{uri}/")
        };

        Ok(RtspResponse::ok()
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", &content_base)
            .with_body(body))
    }

    /// SETUP without a Session header creates a session. SETUP naming a
    /// known session replaces that session's transport and keeps its id;
    /// this is refused while the session is playing.
    fn handle_setup(&self, request: &RtspRequest) -> Result<RtspResponse> {
        self.require_mount(&request.uri)?;

        let existing = match request.session_id() {
            Some(id) => {
                let session = self
                    .session_manager
                    .get_session(id)
                    .ok_or_else(|| RtspError::SessionNotFound(id.to_string()))?;
                if session.is_playing() {
                    return Err(RtspError::MethodNotValidInState(format!(
                        "SETUP on playing session {id}"
                    )));
                }
                Some(session)
            }
            None => None,
        };

        let header = request.get_header("Transport").ok_or(RtspError::Parse {
            kind: ParseErrorKind::InvalidHeader,
        })?;
        let requested = TransportHeader::parse(header)?;
        let transport = self.open_transport(requested, existing.as_deref())?;
        let packetizer = H264Packetizer::with_random_state(self.config.max_packet_size);

        let session = match existing {
            Some(session) => self
                .session_manager
                .reopen_session(&session.id, transport, packetizer)?,
            None => self.session_manager.create_session(
                &request.uri,
                self.peer_addr,
                self.connection_id,
                transport,
                packetizer,
            ),
        };

        Ok(RtspResponse::ok()
            .add_header("Transport", &session.transport.response_header())
            .add_header("Session", &session.session_header_value()))
    }

    /// Channels held by `replacing` count as free: that session gives its
    /// transport up.
    fn open_transport(&self, requested: TransportHeader, replacing: Option<&Session>) -> Result<Transport> {
        match requested {
            TransportHeader::Udp {
                client_rtp_port,
                client_rtcp_port,
            } => {
                let (rtp, rtcp) = self.session_manager.allocate_udp_pair(self.peer_addr.ip())?;
                let (client_rtp, client_rtcp) =
                    client_udp_addrs(self.peer_addr, client_rtp_port, client_rtcp_port);
                Ok(Transport::Udp(UdpSocketPair::new(
                    rtp,
                    rtcp,
                    client_rtp,
                    client_rtcp,
                )))
            }
            TransportHeader::Interleaved {
                rtp_channel,
                rtcp_channel,
            } => {
                let taken = [rtp_channel, rtcp_channel].into_iter().any(|channel| {
                    self.session_manager
                        .find_by_channel(self.connection_id, channel)
                        .is_some_and(|owner| replacing.is_none_or(|s| s.id != owner.id))
                });
                if taken {
                    return Err(RtspError::UnsupportedTransport(format!(
                        "interleaved channels {rtp_channel}-{rtcp_channel} already in use"
                    )));
                }
                let sender = InterleavedSender::spawn(
                    self.writer.clone(),
                    rtp_channel,
                    self.config.interleaved_queue_packets,
                )?;
                Ok(Transport::Interleaved {
                    rtp_channel,
                    rtcp_channel,
                    sender,
                })
            }
        }
    }

    fn lookup_session(&self, request: &RtspRequest) -> Result<Arc<Session>> {
        let id = request
            .session_id()
            .ok_or_else(|| RtspError::SessionNotFound(String::new()))?;
        self.session_manager
            .get_session(id)
            .ok_or_else(|| RtspError::SessionNotFound(id.to_string()))
    }

    fn handle_play(&self, request: &RtspRequest) -> Result<RtspResponse> {
        let session = self.lookup_session(request)?;
        session.set_state(SessionState::Playing);
        if session.awaiting_key_frame() {
            self.mount.request_key_frame();
        }
        tracing::info!(session_id = %session.id, transport = %session.transport, "session started playing");

        let (seq, rtptime) = session.rtp_info(self.mount.last_presentation_time_us());
        let rtp_info = format!("url={};seq={};rtptime={}", session.uri, seq, rtptime);

        Ok(RtspResponse::ok()
            .add_header("Session", &session.session_header_value())
            .add_header("Range", "npt=0.000-")
            .add_header("RTP-Info", &rtp_info))
    }

    fn handle_pause(&self, request: &RtspRequest) -> Result<RtspResponse> {
        let session = self.lookup_session(request)?;
        session.set_state(SessionState::Ready);
        tracing::info!(session_id = %session.id, "session paused");
        Ok(RtspResponse::ok().add_header("Session", &session.session_header_value()))
    }

    fn handle_teardown(&self, request: &RtspRequest) -> Result<RtspResponse> {
        let session = self.lookup_session(request)?;
        self.session_manager.remove_session(&session.id);
        tracing::info!(session_id = %session.id, "session terminated via TEARDOWN");
        Ok(RtspResponse::ok().add_header("Session", &session.id))
    }

    /// GET_PARAMETER / SET_PARAMETER are used by clients (e.g. VLC) as a
    /// keepalive (RFC 2326 §10.8, §10.9). The session was already touched.
    fn handle_keepalive(&self, request: &RtspRequest) -> Result<RtspResponse> {
        tracing::trace!(method = %request.method, "keepalive");
        match request.session_id() {
            Some(_) => {
                let session = self.lookup_session(request)?;
                Ok(RtspResponse::ok().add_header("Session", &session.session_header_value()))
            }
            None => Ok(RtspResponse::ok()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::time::Duration;

    const CSD: [&[u8]; 2] = [&[0x67, 0x42, 0xc0, 0x1f], &[0x68, 0xce, 0x3c, 0x80]];

    fn handler_with(mount: Arc<Mount>, config: ServerConfig) -> (MethodHandler, SessionManager) {
        let sessions = SessionManager::new(config.rtp_port_range, config.session_timeout);
        let handler = MethodHandler::new(
            sessions.clone(),
            mount,
            Arc::new(config),
            "127.0.0.1:50000".parse().unwrap(),
            "127.0.0.1:8554".parse().unwrap(),
            1,
            SharedWriter::new(io::sink()),
        );
        (handler, sessions)
    }

    fn ready_handler() -> (MethodHandler, SessionManager) {
        let mount = Arc::new(Mount::new("/stream", 30));
        mount.codec_config().update_from_buffers(&CSD);
        handler_with(mount, ServerConfig::default())
    }

    fn request(method: &str, uri: &str, headers: &[(&str, &str)]) -> RtspRequest {
        let mut raw = format!("{method} {uri} RTSP/1.0\r\nCSeq: 7\r\n");
        for (name, value) in headers {
            raw.push_str(&format!("{name}: {value}\r\n"));
        }
        raw.push_str("\r\n");
        RtspRequest::parse(&raw).unwrap()
    }

    fn setup_tcp(handler: &mut MethodHandler) -> String {
        let resp = handler.handle(&request(
            "SETUP",
            "rtsp://127.0.0.1:8554/stream/track1",
            &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1")],
        ));
        assert_eq!(resp.status_code, 200);
        let session = resp.get_header("Session").unwrap();
        session.split(';').next().unwrap().to_string()
    }

    #[test]
    fn options_lists_methods() {
        let (mut handler, _) = ready_handler();
        let resp = handler.handle(&request("OPTIONS", "*", &[]));
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.get_header("CSeq"), Some("7"));
        assert!(resp.get_header("Public").unwrap().contains("GET_PARAMETER"));
    }

    #[test]
    fn describe_returns_sdp() {
        let (mut handler, _) = ready_handler();
        let resp = handler.handle(&request("DESCRIBE", "rtsp://127.0.0.1:8554/stream", &[]));
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.get_header("Content-Type"), Some("application/sdp"));
        assert_eq!(
            resp.get_header("Content-Base"),
            Some("rtsp://127.0.0.1:8554/stream/")
        );
        let body = resp.body.unwrap();
        assert!(body.contains("c=IN IP4 127.0.0.1\r\n"));
        assert!(body.contains("sprop-parameter-sets=Z0LAHw==,aM48gA=="));
    }

    #[test]
    fn describe_unknown_mount_is_404() {
        let (mut handler, _) = ready_handler();
        let resp = handler.handle(&request("DESCRIBE", "rtsp://127.0.0.1:8554/other", &[]));
        assert_eq!(resp.status_code, 404);
    }

    #[test]
    fn describe_without_codec_config_times_out() {
        let config = ServerConfig {
            describe_timeout: Duration::from_millis(20),
            ..ServerConfig::default()
        };
        let (mut handler, _) = handler_with(Arc::new(Mount::new("/stream", 30)), config);
        let resp = handler.handle(&request("DESCRIBE", "rtsp://127.0.0.1:8554/stream", &[]));
        assert_eq!(resp.status_code, 500);
    }

    #[test]
    fn setup_play_pause_teardown() {
        let (mut handler, sessions) = ready_handler();
        let id = setup_tcp(&mut handler);
        let session = sessions.get_session(&id).unwrap();
        assert_eq!(session.state(), SessionState::Ready);

        let resp = handler.handle(&request("PLAY", "rtsp://127.0.0.1:8554/stream/", &[("Session", id.as_str())]));
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.get_header("Range"), Some("npt=0.000-"));
        assert!(resp.get_header("RTP-Info").unwrap().contains(";seq="));
        assert_eq!(session.state(), SessionState::Playing);

        let resp = handler.handle(&request("PAUSE", "rtsp://127.0.0.1:8554/stream/", &[("Session", id.as_str())]));
        assert_eq!(resp.status_code, 200);
        assert_eq!(session.state(), SessionState::Ready);

        let resp = handler.handle(&request("TEARDOWN", "rtsp://127.0.0.1:8554/stream/", &[("Session", id.as_str())]));
        assert_eq!(resp.status_code, 200);
        assert!(sessions.get_session(&id).is_none());
    }

    #[test]
    fn unknown_session_is_454() {
        let (mut handler, _) = ready_handler();
        for method in ["PLAY", "PAUSE", "TEARDOWN"] {
            let resp = handler.handle(&request(method, "rtsp://h/stream", &[("Session", "DEADBEEF")]));
            assert_eq!(resp.status_code, 454, "{method}");
        }
        let resp = handler.handle(&request("PLAY", "rtsp://h/stream", &[]));
        assert_eq!(resp.status_code, 454);
    }

    #[test]
    fn unsupported_transport_is_461() {
        let (mut handler, sessions) = ready_handler();
        let resp = handler.handle(&request(
            "SETUP",
            "rtsp://h/stream/track1",
            &[("Transport", "RTP/AVP;multicast")],
        ));
        assert_eq!(resp.status_code, 461);
        assert!(sessions.is_empty());
    }

    #[test]
    fn setup_without_transport_is_400() {
        let (mut handler, _) = ready_handler();
        let resp = handler.handle(&request("SETUP", "rtsp://h/stream/track1", &[]));
        assert_eq!(resp.status_code, 400);
    }

    #[test]
    fn interleaved_channels_cannot_be_reused() {
        let (mut handler, _) = ready_handler();
        setup_tcp(&mut handler);
        let resp = handler.handle(&request(
            "SETUP",
            "rtsp://h/stream/track1",
            &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1")],
        ));
        assert_eq!(resp.status_code, 461);
    }

    #[test]
    fn keepalive_refreshes_session() {
        let (mut handler, sessions) = ready_handler();
        let id = setup_tcp(&mut handler);
        let resp = handler.handle(&request("GET_PARAMETER", "rtsp://h/stream", &[("Session", id.as_str())]));
        assert_eq!(resp.status_code, 200);
        assert!(sessions.get_session(&id).unwrap().idle_for(std::time::Instant::now()) < Duration::from_secs(1));

        let resp = handler.handle(&request("SET_PARAMETER", "rtsp://h/stream", &[]));
        assert_eq!(resp.status_code, 200);
    }

    #[test]
    fn setup_on_existing_session_keeps_its_id() {
        let (mut handler, sessions) = ready_handler();
        let id = setup_tcp(&mut handler);

        let resp = handler.handle(&request(
            "SETUP",
            "rtsp://127.0.0.1:8554/stream/track1",
            &[
                ("Session", id.as_str()),
                ("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1"),
            ],
        ));
        assert_eq!(resp.status_code, 200);
        assert!(resp.get_header("Session").unwrap().starts_with(&id));
        assert_eq!(sessions.len(), 1);

        let resp = handler.handle(&request(
            "SETUP",
            "rtsp://127.0.0.1:8554/stream/track1",
            &[
                ("Session", id.as_str()),
                ("Transport", "RTP/AVP/TCP;unicast;interleaved=2-3"),
            ],
        ));
        assert_eq!(resp.status_code, 200);
        assert_eq!(sessions.len(), 1);
        assert!(sessions.find_by_channel(1, 0).is_none());
        assert_eq!(sessions.find_by_channel(1, 2).unwrap().id, id);
    }

    #[test]
    fn setup_on_playing_session_is_455() {
        let (mut handler, sessions) = ready_handler();
        let id = setup_tcp(&mut handler);
        handler.handle(&request("PLAY", "rtsp://127.0.0.1:8554/stream/", &[("Session", id.as_str())]));

        let resp = handler.handle(&request(
            "SETUP",
            "rtsp://127.0.0.1:8554/stream/track1",
            &[
                ("Session", id.as_str()),
                ("Transport", "RTP/AVP/TCP;unicast;interleaved=2-3"),
            ],
        ));
        assert_eq!(resp.status_code, 455);
        assert_eq!(sessions.len(), 1);
        assert!(sessions.get_session(&id).unwrap().is_playing());
    }

    #[test]
    fn session_header_is_echoed_on_any_method() {
        let (mut handler, _) = ready_handler();
        let id = setup_tcp(&mut handler);

        let resp = handler.handle(&request("OPTIONS", "*", &[("Session", id.as_str())]));
        assert_eq!(resp.status_code, 200);
        assert!(resp.get_header("Session").unwrap().starts_with(&id));

        let resp = handler.handle(&request("OPTIONS", "*", &[]));
        assert!(resp.get_header("Session").is_none());
    }

    #[test]
    fn unknown_method_is_501() {
        let (mut handler, _) = ready_handler();
        let resp = handler.handle(&request("RECORD", "rtsp://h/stream", &[]));
        assert_eq!(resp.status_code, 501);
        assert_eq!(resp.get_header("CSeq"), Some("7"));
    }
}
