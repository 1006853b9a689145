//! Network transport layer for RTSP signaling and RTP media delivery.
//!
//! RTSP uses a split transport model:
//!
//! - **TCP** ([`tcp`]): carries RTSP request/response signaling. One TCP
//!   connection per client, with a thread per connection.
//!
//! - **UDP** ([`udp`]): carries RTP media packets for sessions that asked
//!   for `RTP/AVP`. Each such session owns an even/odd server port pair.
//!
//! - **Interleaved** ([`interleaved`]): sessions that asked for
//!   `RTP/AVP/TCP` get their RTP multiplexed onto the RTSP TCP connection
//!   using `$` framing (RFC 2326 §10.12), queued per session and written
//!   by a per-session writer thread.
//!
//! The fan-out thread never blocks on a client: UDP sockets are
//! non-blocking and interleaved RTP only goes into a bounded queue.

pub mod interleaved;
pub mod tcp;
pub mod udp;

pub use interleaved::{InterleavedSender, SharedWriter};
pub use udp::{PortAllocator, UdpSocketPair};
