//! Media plane: H.264 units, RTP packetization and frame-level policy.
//!
//! ## RTP overview (RFC 3550)
//!
//! Each encoded video frame is split into one or more RTP packets.
//! Every RTP packet carries a 12-byte fixed header ([`rtp::RtpHeader`])
//! containing:
//!
//! - **Sequence number** (16-bit, wrapping): used for reordering and loss detection.
//! - **Timestamp** (32-bit): 90 kHz media clock derived from the
//!   presentation time of the frame.
//! - **SSRC** (32-bit): randomly chosen to identify the sender.
//! - **Marker bit**: set on the last packet of an access unit (frame).
//!
//! ## Components
//!
//! | Module | Role |
//! |--------|------|
//! | [`h264`] | NAL helpers and the RFC 6184 packetizer |
//! | [`rtp`] | RTP fixed header state |
//! | [`codec_config`] | SPS/PPS cache surfaced through SDP |
//! | [`governor`] | Timestamp-based frame-rate limiting |
//! | [`color`] | YUV plane reformatting for buffer-mode encoders |

pub mod codec_config;
pub mod color;
pub mod governor;
pub mod h264;
pub mod rtp;

pub use codec_config::{CodecConfig, CodecConfigCache};
pub use color::{ColorFormat, ColorPlaneConverter, YuvFrame, YuvPlane};
pub use governor::FrameRateGovernor;
pub use h264::H264Packetizer;

/// One encoder output unit.
///
/// `data` is either a single raw NAL unit or an access unit made of several
/// NAL units with Annex B start codes. Produced by the encoder adapter and
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NalUnit {
    pub data: Vec<u8>,
    /// Presentation time in microseconds.
    pub presentation_time_us: u64,
    pub is_key_frame: bool,
    /// Carries SPS/PPS rather than picture data.
    pub is_codec_config: bool,
}

impl NalUnit {
    pub fn new(data: Vec<u8>, presentation_time_us: u64) -> Self {
        Self {
            data,
            presentation_time_us,
            is_key_frame: false,
            is_codec_config: false,
        }
    }

    pub fn key_frame(data: Vec<u8>, presentation_time_us: u64) -> Self {
        Self {
            is_key_frame: true,
            ..Self::new(data, presentation_time_us)
        }
    }

    pub fn codec_config(data: Vec<u8>) -> Self {
        Self {
            is_codec_config: true,
            ..Self::new(data, 0)
        }
    }
}
