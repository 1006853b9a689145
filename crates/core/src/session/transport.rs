use std::fmt;
use std::io;
use std::net::SocketAddr;

use crate::error::{ParseErrorKind, Result, RtspError};
use crate::transport::interleaved::{Enqueued, InterleavedSender};
use crate::transport::udp::UdpSocketPair;

/// Negotiated RTP/RTCP transport for a session (RFC 2326 §12.39).
///
/// ## Wire format examples
///
/// ```text
/// Client → Server:
///   Transport: RTP/AVP;unicast;client_port=8000-8001
/// Server → Client:
///   Transport: RTP/AVP;unicast;client_port=8000-8001;server_port=5000-5001
///
/// Client → Server:
///   Transport: RTP/AVP/TCP;unicast;interleaved=0-1
/// Server → Client:
///   Transport: RTP/AVP/TCP;unicast;interleaved=0-1
/// ```
pub enum Transport {
    /// RTP over UDP from a server-owned port pair to the client's ports.
    Udp(UdpSocketPair),
    /// RTP framed with `$` onto the RTSP control connection (RFC 2326 §10.12).
    Interleaved {
        rtp_channel: u8,
        rtcp_channel: u8,
        sender: InterleavedSender,
    },
}

/// Outcome of [`Transport::send_packets`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sent {
    All,
    /// The client could not keep up; the unit was dropped in full or in part.
    Congested,
}

impl Transport {
    /// Hand the RTP packets of one access unit to the client without blocking.
    ///
    /// Errors mean the transport is unusable and the session should go.
    pub fn send_packets(&self, packets: &[Vec<u8>]) -> io::Result<Sent> {
        match self {
            Self::Udp(pair) => {
                for packet in packets {
                    match pair.send_rtp(packet) {
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Sent::Congested),
                        Err(e) => return Err(e),
                    }
                }
                Ok(Sent::All)
            }
            Self::Interleaved { sender, .. } => match sender.send_all(packets)? {
                Enqueued::All => Ok(Sent::All),
                Enqueued::Full => Ok(Sent::Congested),
            },
        }
    }

    /// `Transport` header value echoed in the SETUP response.
    pub fn response_header(&self) -> String {
        match self {
            Self::Udp(pair) => {
                let (server_rtp, server_rtcp) = pair.server_ports();
                format!(
                    "RTP/AVP;unicast;client_port={}-{};server_port={}-{};ssrc_mode=sender",
                    pair.client_rtp().port(),
                    pair.client_rtcp().port(),
                    server_rtp,
                    server_rtcp
                )
            }
            Self::Interleaved {
                rtp_channel,
                rtcp_channel,
                ..
            } => format!(
                "RTP/AVP/TCP;unicast;interleaved={}-{}",
                rtp_channel, rtcp_channel
            ),
        }
    }

    pub fn is_interleaved(&self) -> bool {
        matches!(self, Self::Interleaved { .. })
    }

    /// Whether a `$` frame on `channel` belongs to this transport.
    pub fn owns_channel(&self, channel: u8) -> bool {
        match self {
            Self::Interleaved {
                rtp_channel,
                rtcp_channel,
                ..
            } => channel == *rtp_channel || channel == *rtcp_channel,
            Self::Udp(_) => false,
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp(pair) => f
                .debug_struct("Udp")
                .field("client_rtp", &pair.client_rtp())
                .field("server_ports", &pair.server_ports())
                .finish(),
            Self::Interleaved {
                rtp_channel,
                rtcp_channel,
                ..
            } => f
                .debug_struct("Interleaved")
                .field("rtp_channel", rtp_channel)
                .field("rtcp_channel", rtcp_channel)
                .finish(),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp(pair) => write!(f, "udp {}", pair.client_rtp()),
            Self::Interleaved {
                rtp_channel,
                rtcp_channel,
                ..
            } => write!(f, "tcp interleaved {}-{}", rtp_channel, rtcp_channel),
        }
    }
}

/// Client transport request parsed from the RTSP `Transport` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportHeader {
    /// `RTP/AVP[/UDP];unicast;client_port=RTP-RTCP`
    Udp {
        client_rtp_port: u16,
        client_rtcp_port: u16,
    },
    /// `RTP/AVP/TCP;interleaved=N-M`
    Interleaved { rtp_channel: u8, rtcp_channel: u8 },
}

impl TransportHeader {
    /// Parse the `Transport` header value (RFC 2326 §12.39).
    ///
    /// The header may list several comma-separated alternatives; the first
    /// supported one is chosen. Multicast and non-RTP/AVP profiles yield
    /// [`RtspError::UnsupportedTransport`]. A supported UDP profile with no
    /// usable `client_port` is a malformed request.
    ///
    /// ## Examples
    ///
    /// ```
    /// use live_rtsp::session::transport::TransportHeader;
    ///
    /// let th = TransportHeader::parse("RTP/AVP;unicast;client_port=8000-8001").unwrap();
    /// assert_eq!(
    ///     th,
    ///     TransportHeader::Udp { client_rtp_port: 8000, client_rtcp_port: 8001 }
    /// );
    ///
    /// let th = TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=2-3").unwrap();
    /// assert_eq!(th, TransportHeader::Interleaved { rtp_channel: 2, rtcp_channel: 3 });
    ///
    /// assert!(TransportHeader::parse("RAW/RAW/UDP;unicast").is_err());
    /// ```
    pub fn parse(header: &str) -> Result<Self> {
        let mut first_error = None;
        for spec in header.split(',') {
            match Self::parse_one(spec.trim()) {
                Ok(parsed) => return Ok(parsed),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        Err(first_error.unwrap_or_else(|| RtspError::UnsupportedTransport(header.to_string())))
    }

    fn parse_one(spec: &str) -> Result<Self> {
        let mut params = spec.split(';').map(str::trim);
        let profile = params.next().unwrap_or("");

        let tcp = match profile.to_ascii_uppercase().as_str() {
            "RTP/AVP" | "RTP/AVP/UDP" => false,
            "RTP/AVP/TCP" => true,
            _ => return Err(RtspError::UnsupportedTransport(spec.to_string())),
        };

        let mut client_ports = None;
        let mut interleaved = None;
        for param in params {
            if param.eq_ignore_ascii_case("multicast") {
                return Err(RtspError::UnsupportedTransport(spec.to_string()));
            } else if let Some(ports) = param.strip_prefix("client_port=") {
                client_ports = parse_range::<u16>(ports);
            } else if let Some(channels) = param.strip_prefix("interleaved=") {
                let channels = parse_range::<u8>(channels).ok_or(RtspError::Parse {
                    kind: ParseErrorKind::InvalidHeader,
                })?;
                interleaved = Some(channels);
            }
        }

        if tcp {
            // The server may pick channels when the client leaves them out.
            let (rtp_channel, rtcp_channel) = interleaved.unwrap_or((0, 1));
            return Ok(Self::Interleaved {
                rtp_channel,
                rtcp_channel,
            });
        }

        match client_ports {
            Some((client_rtp_port, client_rtcp_port)) if client_rtp_port != 0 => Ok(Self::Udp {
                client_rtp_port,
                client_rtcp_port,
            }),
            _ => Err(RtspError::Parse {
                kind: ParseErrorKind::InvalidHeader,
            }),
        }
    }
}

/// `a-b` or a lone `a` (meaning `a-(a+1)`).
fn parse_range<T>(value: &str) -> Option<(T, T)>
where
    T: std::str::FromStr + Copy + TryFrom<u32>,
    u32: From<T>,
{
    let mut parts = value.splitn(2, '-');
    let first: T = parts.next()?.trim().parse().ok()?;
    let second = match parts.next() {
        Some(s) => s.trim().parse().ok()?,
        None => T::try_from(u32::from(first) + 1).ok()?,
    };
    Some((first, second))
}

/// Resolve the client's RTP/RTCP destinations for a UDP transport request.
pub fn client_udp_addrs(peer: SocketAddr, rtp_port: u16, rtcp_port: u16) -> (SocketAddr, SocketAddr) {
    (
        SocketAddr::new(peer.ip(), rtp_port),
        SocketAddr::new(peer.ip(), rtcp_port),
    )
}
