use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use parking_lot::Mutex;

use crate::error::{Result, RtspError};

/// Server-side RTP/RTCP socket pair of one UDP session.
///
/// The RTP socket is bound to an even port and the RTCP socket to the next
/// odd port (RFC 3550 §11). Both are released when the pair is dropped,
/// i.e. when the session is torn down.
#[derive(Debug)]
pub struct UdpSocketPair {
    rtp: UdpSocket,
    rtcp: UdpSocket,
    client_rtp: SocketAddr,
    client_rtcp: SocketAddr,
}

impl UdpSocketPair {
    pub fn new(rtp: UdpSocket, rtcp: UdpSocket, client_rtp: SocketAddr, client_rtcp: SocketAddr) -> Self {
        Self {
            rtp,
            rtcp,
            client_rtp,
            client_rtcp,
        }
    }

    /// `(rtp, rtcp)` ports the server sends from.
    pub fn server_ports(&self) -> (u16, u16) {
        let port = |s: &UdpSocket| s.local_addr().map(|a| a.port()).unwrap_or(0);
        (port(&self.rtp), port(&self.rtcp))
    }

    pub fn client_rtp(&self) -> SocketAddr {
        self.client_rtp
    }

    pub fn client_rtcp(&self) -> SocketAddr {
        self.client_rtcp
    }

    /// Fire-and-forget send of one RTP packet to the client.
    ///
    /// The socket is non-blocking: a full send buffer surfaces as
    /// `WouldBlock` instead of stalling the caller.
    pub fn send_rtp(&self, packet: &[u8]) -> io::Result<usize> {
        self.rtp.send_to(packet, self.client_rtp)
    }
}

/// Hands out even/odd UDP port pairs from a fixed range.
///
/// Allocation walks the range from where the previous one stopped, skipping
/// ports that are already taken, and wraps at the end. When no pair in the
/// whole range can be bound the request fails with
/// [`RtspError::PortRangeExhausted`].
#[derive(Debug)]
pub struct PortAllocator {
    min: u16,
    max: u16,
    next: Mutex<u16>,
}

impl PortAllocator {
    pub fn new(min: u16, max: u16) -> Self {
        // RTP ports are even; round the lower bound up.
        let min = min.saturating_add(min % 2);
        Self {
            min,
            max,
            next: Mutex::new(min),
        }
    }

    fn pair_count(&self) -> usize {
        if self.max <= self.min {
            0
        } else {
            (self.max as usize - self.min as usize + 1) / 2
        }
    }

    /// Bind an RTP/RTCP socket pair on the unspecified address of the
    /// client's address family.
    pub fn allocate(&self, client_ip: IpAddr) -> Result<(UdpSocket, UdpSocket)> {
        let bind_ip: IpAddr = match client_ip {
            IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };

        let mut next = self.next.lock();
        for _ in 0..self.pair_count() {
            let rtp_port = *next;
            *next = if rtp_port as u32 + 3 > self.max as u32 {
                self.min
            } else {
                rtp_port + 2
            };

            let Ok(rtp) = UdpSocket::bind((bind_ip, rtp_port)) else {
                tracing::trace!(rtp_port, "RTP port busy");
                continue;
            };
            let Ok(rtcp) = UdpSocket::bind((bind_ip, rtp_port + 1)) else {
                tracing::trace!(rtcp_port = rtp_port + 1, "RTCP port busy");
                continue;
            };

            rtp.set_nonblocking(true)?;
            rtcp.set_nonblocking(true)?;
            tracing::trace!(rtp_port, rtcp_port = rtp_port + 1, "allocated server ports");
            return Ok((rtp, rtcp));
        }

        tracing::error!(min = self.min, max = self.max, "no free RTP/RTCP port pair");
        Err(RtspError::PortRangeExhausted {
            min: self.min,
            max: self.max,
        })
    }
}
