//! SDP (Session Description Protocol) generation (RFC 4566 / RFC 8866).
//!
//! Produces the SDP body returned by DESCRIBE responses. The format:
//!
//! ```text
//! v=0                                          ← protocol version
//! o=<user> <sess-id> <sess-ver> IN IP4 <addr>  ← origin
//! s=<session-name>                             ← session name
//! c=IN IP4 <addr>                              ← connection address
//! t=0 0                                        ← timing (live stream)
//! a=tool:live-rtsp                             ← server software (§6)
//! a=sendonly                                   ← direction (§6)
//! m=video 0 RTP/AVP 96                         ← media description
//! a=rtpmap:96 H264/90000                       ← codec/clock rate
//! a=fmtp:96 packetization-mode=1;sprop-parameter-sets=<sps>,<pps>;profile-level-id=<hex>
//! a=control:track1                             ← track control URL
//! ```
//!
//! Session/origin fields come from [`ServerConfig`](crate::ServerConfig);
//! the parameter sets come from the current [`CodecConfig`] snapshot.

use crate::media::CodecConfig;
use crate::media::h264::{profile_level_id, sprop_parameter_sets};
use crate::media::rtp::{H264_PAYLOAD_TYPE, VIDEO_CLOCK_RATE};

/// Control attribute of the single video track.
pub const TRACK_CONTROL: &str = "track1";

/// Session-level SDP fields.
#[derive(Debug, Clone)]
pub struct SdpOrigin<'a> {
    pub address: &'a str,
    pub username: &'a str,
    pub session_id: &'a str,
    pub session_version: &'a str,
    pub session_name: &'a str,
}

/// Generate the SDP description of the H.264 track.
///
/// Returns `None` when the codec config is not complete; a partial
/// SPS/PPS pair is never advertised.
pub fn generate_sdp(origin: &SdpOrigin<'_>, codec_config: &CodecConfig) -> Option<String> {
    let (sps, pps) = codec_config.parameter_sets()?;
    let addr_type = if origin.address.contains(':') {
        "IP6"
    } else {
        "IP4"
    };

    let mut fmtp = format!(
        "a=fmtp:{} packetization-mode=1;sprop-parameter-sets={}",
        H264_PAYLOAD_TYPE,
        sprop_parameter_sets(sps, pps)
    );
    if let Some(profile) = profile_level_id(sps) {
        fmtp.push_str(";profile-level-id=");
        fmtp.push_str(&profile);
    }

    let sdp = [
        "v=0".to_string(),
        format!(
            "o={} {} {} IN {} {}",
            origin.username, origin.session_id, origin.session_version, addr_type, origin.address
        ),
        format!("s={}", origin.session_name),
        format!("c=IN {} {}", addr_type, origin.address),
        "t=0 0".to_string(),
        "a=tool:live-rtsp".to_string(),
        "a=sendonly".to_string(),
        format!("m=video 0 RTP/AVP {}", H264_PAYLOAD_TYPE),
        format!("a=rtpmap:{} H264/{}", H264_PAYLOAD_TYPE, VIDEO_CLOCK_RATE),
        fmtp,
        format!("a=control:{}", TRACK_CONTROL),
    ];

    tracing::debug!("SDP: {}", sdp.join("\r\n"));

    Some(format!("{}\r\n", sdp.join("\r\n")))
}
