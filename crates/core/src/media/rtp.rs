/// RTP clock rate for video (RFC 6184 §8.1).
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Dynamic payload type advertised for H.264.
pub const H264_PAYLOAD_TYPE: u8 = 96;

/// Size of the fixed RTP header written by [`RtpHeader::write`].
pub const RTP_HEADER_LEN: usize = 12;

/// Convert a presentation time to a 90 kHz RTP timestamp offset by `base`.
///
/// Truncated to 32 bits; wraps around every ~13.25 hours.
pub fn rtp_timestamp(presentation_time_us: u64, base: u32) -> u32 {
    let ticks = presentation_time_us.wrapping_mul(90) / 1000;
    base.wrapping_add(ticks as u32)
}

/// RTP fixed header state (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// One instance per session. It manages:
/// - **Sequence number**: 16-bit, wrapping, incremented on every packet.
/// - **Timestamp**: set once per access unit from the presentation time,
///   offset by a per-session random base.
/// - **SSRC**: randomly generated per RFC 3550 §8.1.
///
/// Version is always 2. Padding, extension, and CSRC count are always 0.
#[derive(Debug)]
pub struct RtpHeader {
    /// RTP payload type (7-bit, RFC 3551).
    pub pt: u8,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    /// Added to every derived timestamp.
    pub timestamp_base: u32,
    sequence: u16,
    timestamp: u32,
}

impl RtpHeader {
    pub fn new(pt: u8, ssrc: u32, initial_sequence: u16, timestamp_base: u32) -> Self {
        tracing::debug!(
            pt,
            ssrc = format_args!("{:#010X}", ssrc),
            initial_sequence,
            "RTP header state created"
        );
        Self {
            pt,
            ssrc,
            timestamp_base,
            sequence: initial_sequence,
            timestamp: timestamp_base,
        }
    }

    /// Random SSRC, initial sequence number and timestamp base.
    ///
    /// RFC 3550 §5.1 asks for random initial values so that independent
    /// sessions are not trivially correlated.
    pub fn with_random_state(pt: u8) -> Self {
        Self::new(pt, rand::random(), rand::random(), rand::random())
    }

    /// Sequence number the next [`write`](Self::write) call will use.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Timestamp written into the next packet.
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Set the timestamp for the access unit about to be written.
    pub fn set_presentation_time(&mut self, presentation_time_us: u64) {
        self.timestamp = rtp_timestamp(presentation_time_us, self.timestamp_base);
    }

    /// Serialize a 12-byte RTP fixed header and advance the sequence number.
    ///
    /// The `marker` bit (RFC 3550 §5.1) signals the last packet of a frame.
    /// For H.264, it is set on the last RTP packet of an access unit
    /// (RFC 6184 §5.1).
    pub fn write(&mut self, marker: bool) -> [u8; RTP_HEADER_LEN] {
        let first_byte: u8 = 2 << 6;
        let second_byte: u8 = ((marker as u8) << 7) | (self.pt & 0x7f);

        let mut header = [0u8; RTP_HEADER_LEN];
        header[0] = first_byte;
        header[1] = second_byte;
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        self.sequence = self.sequence.wrapping_add(1);
        header
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_header() -> RtpHeader {
        RtpHeader::new(96, 0xAABBCCDD, 0, 0)
    }

    #[test]
    fn version_is_2() {
        let mut h = make_header();
        let buf = h.write(false);
        assert_eq!(buf[0] >> 6, 2);
        assert_eq!(buf[0] & 0x3f, 0, "P, X and CC must be zero");
    }

    #[test]
    fn marker_bit() {
        let mut h = make_header();
        let no_marker = h.write(false);
        assert_eq!(no_marker[1] & 0x80, 0);

        let with_marker = h.write(true);
        assert_eq!(with_marker[1] & 0x80, 0x80);
    }

    #[test]
    fn payload_type() {
        let mut h = make_header();
        let buf = h.write(false);
        assert_eq!(buf[1] & 0x7f, 96);
    }

    #[test]
    fn sequence_wraps() {
        let mut h = RtpHeader::new(96, 1, u16::MAX, 0);
        let buf = h.write(false);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), u16::MAX);
        assert_eq!(h.sequence(), 0);
    }

    #[test]
    fn ssrc_written() {
        let mut h = make_header();
        let buf = h.write(false);
        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        assert_eq!(ssrc, 0xAABBCCDD);
    }

    #[test]
    fn timestamp_from_presentation_time() {
        let mut h = RtpHeader::new(96, 1, 0, 1000);
        h.set_presentation_time(1_000_000);
        assert_eq!(h.timestamp(), 1000 + 90_000);
        let buf = h.write(true);
        assert_eq!(
            u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            91_000
        );
    }

    #[test]
    fn timestamp_truncates_to_32_bits() {
        // 2^32 ticks at 90 kHz is 47721.858... seconds
        assert_eq!(rtp_timestamp(47_721_858_846, 0), 0);
        assert_eq!(rtp_timestamp(0, u32::MAX), u32::MAX);
        assert_eq!(rtp_timestamp(12, u32::MAX), 0);
    }
}
