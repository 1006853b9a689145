use base64::prelude::{BASE64_STANDARD, Engine as _};

use super::rtp::{H264_PAYLOAD_TYPE, RTP_HEADER_LEN, RtpHeader};

/// Largest RTP payload produced by default, keeping packets under common MTUs.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1400;

/// NAL unit type of a Sequence Parameter Set.
pub const NAL_TYPE_SPS: u8 = 7;
/// NAL unit type of a Picture Parameter Set.
pub const NAL_TYPE_PPS: u8 = 8;
/// NAL unit type of an IDR slice.
pub const NAL_TYPE_IDR: u8 = 5;
/// NAL unit type of an access unit delimiter.
pub const NAL_TYPE_AUD: u8 = 9;
/// FU-A payload type (RFC 6184 §5.8).
pub const NAL_TYPE_FU_A: u8 = 28;

const FU_START: u8 = 0x80;
const FU_END: u8 = 0x40;

/// Low 5 bits of the NAL header byte.
pub fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & 0x1f)
}

/// Split an H.264 Annex B bitstream into NAL units.
///
/// Scans for start codes (both 4-byte `00 00 00 01` and 3-byte
/// `00 00 01`) and returns the NAL data between them, excluding
/// the start codes themselves.
///
/// The start code length is tracked per-NAL so boundaries between
/// adjacent NALs are computed correctly when mixed 3-byte and 4-byte
/// start codes appear.
pub fn extract_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut nal_units = Vec::new();
    let mut i = 0usize;

    // (nal_data_start_index, start_code_length)
    let mut start_entries: Vec<(usize, usize)> = Vec::new();

    while i < data.len() {
        if i + 3 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
            start_entries.push((i + 4, 4));
            i += 4;
        } else if i + 2 < data.len() && data[i..i + 3] == [0, 0, 1] {
            start_entries.push((i + 3, 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    for (idx, &(start, _)) in start_entries.iter().enumerate() {
        let end = if idx + 1 < start_entries.len() {
            let (next_start, next_sc_len) = start_entries[idx + 1];
            next_start - next_sc_len
        } else {
            data.len()
        };

        if start < end {
            nal_units.push(&data[start..end]);
        }
    }

    nal_units
}

/// NAL units of one encoder output buffer.
///
/// Encoders hand out either Annex B access units or bare NAL units; a buffer
/// without any start code is taken as a single NAL unit.
pub fn split_access_unit(data: &[u8]) -> Vec<&[u8]> {
    let nals = extract_nal_units(data);
    if nals.is_empty() && !data.is_empty() {
        return vec![data];
    }
    nals
}

/// `profile-level-id` for SDP (RFC 6184 §8.1): SPS bytes 1–3 are
/// profile_idc, constraint flags and level_idc.
pub fn profile_level_id(sps: &[u8]) -> Option<String> {
    if sps.len() < 4 {
        return None;
    }
    Some(format!("{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]))
}

/// `sprop-parameter-sets` value: base64 SPS and PPS joined by a comma.
pub fn sprop_parameter_sets(sps: &[u8], pps: &[u8]) -> String {
    format!(
        "{},{}",
        BASE64_STANDARD.encode(sps),
        BASE64_STANDARD.encode(pps)
    )
}

/// H.264 RTP packetizer (RFC 6184), one per session.
///
/// Supports the two packetization modes needed for `packetization-mode=1`:
///
/// - **Single NAL Unit** (§5.6): NALs that fit within `max_packet_size`
///   are sent as-is in a single RTP packet (12-byte header + NAL bytes).
///
/// - **FU-A Fragmentation** (§5.8): larger NALs are split across multiple
///   RTP packets. Each fragment carries a 2-byte FU header before the NAL
///   payload:
///
///   ```text
///   FU indicator:  [F|NRI|Type=28]     (1 byte)
///   FU header:     [S|E|R|NAL_Type]    (1 byte)
///   Fragment data: [...]               (up to max_packet_size - 2 bytes)
///   ```
///
/// SPS/PPS NAL units that an encoder interleaves in-band are packetized
/// like any other NAL unit.
///
/// ## Marker bit
///
/// Per RFC 6184 §5.1, the RTP marker bit is set on the last RTP packet
/// of an access unit and on no other packet.
#[derive(Debug)]
pub struct H264Packetizer {
    header: RtpHeader,
    max_packet_size: usize,
}

impl H264Packetizer {
    /// Create with explicit RTP state.
    pub fn new(header: RtpHeader, max_packet_size: usize) -> Self {
        Self {
            header,
            // FU-A needs room for its two header bytes plus at least one payload byte.
            max_packet_size: max_packet_size.max(3),
        }
    }

    /// Random SSRC, initial sequence and timestamp base (RFC 3550 §5.1).
    pub fn with_random_state(max_packet_size: usize) -> Self {
        Self::new(
            RtpHeader::with_random_state(H264_PAYLOAD_TYPE),
            max_packet_size,
        )
    }

    pub fn ssrc(&self) -> u32 {
        self.header.ssrc
    }

    pub fn payload_type(&self) -> u8 {
        self.header.pt
    }

    /// Sequence number of the next packet (for `RTP-Info`).
    pub fn next_sequence(&self) -> u16 {
        self.header.sequence()
    }

    /// RTP timestamp corresponding to a presentation time (for `RTP-Info`).
    pub fn rtp_timestamp_for(&self, presentation_time_us: u64) -> u32 {
        super::rtp::rtp_timestamp(presentation_time_us, self.header.timestamp_base)
    }

    /// Packetize one access unit.
    ///
    /// All packets share the timestamp derived from `presentation_time_us`;
    /// the marker bit is set only on the final packet of the last NAL unit.
    pub fn packetize(&mut self, nal_units: &[&[u8]], presentation_time_us: u64) -> Vec<Vec<u8>> {
        self.header.set_presentation_time(presentation_time_us);

        let mut packets = Vec::new();
        let last_index = nal_units.iter().rposition(|nal| !nal.is_empty());
        for (i, nal) in nal_units.iter().enumerate() {
            packets.append(&mut self.packetize_nal(nal, Some(i) == last_index));
        }

        tracing::trace!(
            nal_count = nal_units.len(),
            rtp_packets = packets.len(),
            seq = self.header.sequence(),
            ts = self.header.timestamp(),
            "access unit packetized"
        );

        packets
    }

    /// Packetize a single NAL unit into one or more RTP packets.
    ///
    /// If the NAL fits within `max_packet_size`, it is sent as a Single NAL
    /// Unit packet (RFC 6184 §5.6). Otherwise, FU-A fragmentation is used
    /// (RFC 6184 §5.8).
    pub fn packetize_nal(&mut self, nal_unit: &[u8], end_of_access_unit: bool) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();

        if nal_unit.is_empty() {
            return packets;
        }

        if nal_unit.len() <= self.max_packet_size {
            let hdr = self.header.write(end_of_access_unit);
            let mut packet = Vec::with_capacity(RTP_HEADER_LEN + nal_unit.len());
            packet.extend_from_slice(&hdr);
            packet.extend_from_slice(nal_unit);
            packets.push(packet);
            return packets;
        }

        let nal_header = nal_unit[0];
        let nal_type = nal_header & 0x1f;
        // FU indicator keeps F and NRI from the original header.
        let fu_indicator = (nal_header & 0xe0) | NAL_TYPE_FU_A;
        let payload = &nal_unit[1..];

        let max_fragment = self.max_packet_size - 2;
        let mut offset = 0usize;

        while offset < payload.len() {
            let remaining = payload.len() - offset;
            let last_fragment = remaining <= max_fragment;
            let chunk_size = remaining.min(max_fragment);
            let chunk = &payload[offset..offset + chunk_size];

            let start_bit = if offset == 0 { FU_START } else { 0 };
            let end_bit = if last_fragment { FU_END } else { 0 };
            let fu_header = start_bit | end_bit | nal_type;

            let hdr = self.header.write(end_of_access_unit && last_fragment);

            let mut packet = Vec::with_capacity(RTP_HEADER_LEN + 2 + chunk.len());
            packet.extend_from_slice(&hdr);
            packet.push(fu_indicator);
            packet.push(fu_header);
            packet.extend_from_slice(chunk);
            packets.push(packet);

            offset += chunk_size;
        }

        tracing::trace!(
            nal_type,
            nal_size = nal_unit.len(),
            fragments = packets.len(),
            "FU-A fragmented NAL unit"
        );

        packets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_packetizer() -> H264Packetizer {
        H264Packetizer::new(RtpHeader::new(96, 0xAABBCCDD, 0, 0), DEFAULT_MAX_PACKET_SIZE)
    }

    fn seq(packet: &[u8]) -> u16 {
        u16::from_be_bytes([packet[2], packet[3]])
    }

    fn marker(packet: &[u8]) -> bool {
        packet[1] & 0x80 != 0
    }

    /// Rebuild NAL units from single-NAL and FU-A packets in emission order.
    fn depacketize(packets: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let mut nals = Vec::new();
        let mut current: Option<Vec<u8>> = None;
        for p in packets {
            let payload = &p[RTP_HEADER_LEN..];
            if payload[0] & 0x1f != NAL_TYPE_FU_A {
                nals.push(payload.to_vec());
                continue;
            }
            let (indicator, header) = (payload[0], payload[1]);
            if header & FU_START != 0 {
                current = Some(vec![(indicator & 0xe0) | (header & 0x1f)]);
            }
            let buf = current.as_mut().expect("fragment without start");
            buf.extend_from_slice(&payload[2..]);
            if header & FU_END != 0 {
                nals.push(current.take().unwrap());
            }
        }
        nals
    }

    // --- NAL extraction ---

    #[test]
    fn extract_single_nal_4byte_sc() {
        let data = [0, 0, 0, 1, 0x65, 0xAA, 0xBB];
        let nals = extract_nal_units(&data);
        assert_eq!(nals, vec![&[0x65, 0xAA, 0xBB][..]]);
    }

    #[test]
    fn extract_mixed_start_codes() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42];
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        let nals = extract_nal_units(&data);
        assert_eq!(nals.len(), 2);
        assert_eq!(nals[0], &[0x67, 0x42]);
        assert_eq!(nals[1], &[0x68, 0xCE]);
    }

    #[test]
    fn extract_no_start_code() {
        assert!(extract_nal_units(&[0xFF, 0xFE]).is_empty());
        assert!(extract_nal_units(&[]).is_empty());
    }

    #[test]
    fn split_raw_nal_without_start_code() {
        let raw = [0x41, 0x9a, 0x01];
        assert_eq!(split_access_unit(&raw), vec![&raw[..]]);
        assert!(split_access_unit(&[]).is_empty());
    }

    #[test]
    fn nal_type_and_profile() {
        assert_eq!(nal_type(&[0x67, 0x42]), Some(NAL_TYPE_SPS));
        assert_eq!(nal_type(&[]), None);
        assert_eq!(
            profile_level_id(&[0x67, 0x42, 0xc0, 0x1f]).as_deref(),
            Some("42c01f")
        );
        assert_eq!(profile_level_id(&[0x67, 0x42]), None);
    }

    #[test]
    fn sprop_encodes_base64() {
        assert_eq!(
            sprop_parameter_sets(&[0x67, 0x42, 0x00, 0x1e], &[0x68, 0xce, 0x38, 0x80]),
            "Z0IAHg==,aM44gA=="
        );
    }

    // --- Packetization ---

    #[test]
    fn small_nal_single_packet() {
        let mut p = make_packetizer();
        let nal = vec![0x65, 0xAA, 0xBB, 0xCC];
        let packets = p.packetize_nal(&nal, true);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), 12 + 4);
        assert_eq!(&packets[0][12..], &nal[..]);
        assert!(marker(&packets[0]));
    }

    #[test]
    fn nal_of_exactly_max_size_is_not_fragmented() {
        let mut p = make_packetizer();
        let mut nal = vec![0x41];
        nal.resize(DEFAULT_MAX_PACKET_SIZE, 0x11);
        assert_eq!(p.packetize_nal(&nal, true).len(), 1);
    }

    #[test]
    fn large_nal_fragmented() {
        let mut p = make_packetizer();
        let mut nal = vec![0x65];
        nal.extend(vec![0xAA; DEFAULT_MAX_PACKET_SIZE + 500]);
        let packets = p.packetize_nal(&nal, true);
        assert_eq!(packets.len(), 2);

        assert_eq!(packets[0][12], 0x60 | 28, "FU indicator keeps NRI");
        assert_eq!(packets[0][13], 0x80 | 5, "start bit and original type");
        assert!(!marker(&packets[0]));

        let last = packets.last().unwrap();
        assert_eq!(last[13], 0x40 | 5, "end bit and original type");
        assert!(marker(last));
        assert!(packets.iter().all(|p| p.len() <= 12 + DEFAULT_MAX_PACKET_SIZE));
    }

    #[test]
    fn middle_fragments_clear_start_and_end() {
        let mut p = H264Packetizer::new(RtpHeader::new(96, 1, 0, 0), 100);
        let mut nal = vec![0x41];
        nal.extend((0..450).map(|i| i as u8));
        let packets = p.packetize_nal(&nal, true);
        assert_eq!(packets.len(), 5);
        for middle in &packets[1..packets.len() - 1] {
            assert_eq!(middle[13] & 0xc0, 0);
            assert!(!marker(middle));
        }
    }

    #[test]
    fn fragmentation_round_trip() {
        let mut p = make_packetizer();
        let mut nal = vec![0x65];
        nal.extend((0..2 * DEFAULT_MAX_PACKET_SIZE).map(|i| (i * 7 % 251) as u8));
        assert_eq!(nal.len(), 2 * DEFAULT_MAX_PACKET_SIZE + 1);

        let packets = p.packetize(&[&nal], 0);
        assert_eq!(packets.len(), 3);
        assert_eq!(depacketize(&packets), vec![nal]);
    }

    #[test]
    fn marker_only_on_last_packet_of_access_unit() {
        let mut p = make_packetizer();
        let sps = [0x67, 0x42, 0x00, 0x1e];
        let pps = [0x68, 0xce, 0x38, 0x80];
        let mut idr = vec![0x65];
        idr.extend(vec![0x55; 3000]);

        let packets = p.packetize(&[&sps, &pps, &idr], 40_000);
        let markers: Vec<bool> = packets.iter().map(|p| marker(p)).collect();
        assert_eq!(markers.iter().filter(|m| **m).count(), 1);
        assert!(*markers.last().unwrap());
        assert_eq!(depacketize(&packets), vec![sps.to_vec(), pps.to_vec(), idr]);
    }

    #[test]
    fn sequence_increments_per_packet() {
        let mut p = H264Packetizer::new(RtpHeader::new(96, 1, u16::MAX - 1, 0), 100);
        let mut nal = vec![0x41];
        nal.extend(vec![0u8; 250]);
        let packets = p.packetize(&[&nal], 0);
        let seqs: Vec<u16> = packets.iter().map(|p| seq(p)).collect();
        assert_eq!(seqs, vec![u16::MAX - 1, u16::MAX, 0]);
        assert_eq!(p.next_sequence(), 1);
    }

    #[test]
    fn access_unit_shares_timestamp() {
        let mut p = H264Packetizer::new(RtpHeader::new(96, 1, 0, 500), 100);
        let nal = vec![0x41; 300];
        let packets = p.packetize(&[&nal], 2_000_000);
        for packet in &packets {
            let ts = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
            assert_eq!(ts, 500 + 180_000);
        }
        assert_eq!(p.rtp_timestamp_for(2_000_000), 180_500);
    }

    #[test]
    fn empty_nal_no_packets() {
        let mut p = make_packetizer();
        assert!(p.packetize_nal(&[], true).is_empty());
        assert!(p.packetize(&[], 0).is_empty());
    }

    #[test]
    fn trailing_empty_nal_does_not_steal_marker() {
        let mut p = make_packetizer();
        let packets = p.packetize(&[&[0x41, 0x01], &[]], 0);
        assert_eq!(packets.len(), 1);
        assert!(marker(&packets[0]));
    }
}
