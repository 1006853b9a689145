//! Media fan-out: from the encoder queue to every playing session.
//!
//! For each unit pulled off the queue:
//!
//! 1. Codec-config units feed the SPS/PPS cache and stop there.
//! 2. The unit is split into NAL units once. While the cache is still
//!    incomplete, in-band SPS/PPS are absorbed from ordinary frames too.
//! 3. The frame-rate governor decides once, for all sessions.
//! 4. Every PLAYING session packetizes the frame with its own packetizer
//!    and hands it to its own transport. A send failure removes that
//!    session and nothing else. A session whose transport is backed up
//!    loses the frame and waits for the next key frame, which is requested
//!    from the encoder.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::encoder::Received;
use crate::media::NalUnit;
use crate::media::h264::split_access_unit;
use crate::mount::Mount;
use crate::session::{Delivered, SessionManager};

const RECV_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What happened to one unit.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// The unit was codec config and only updated the cache.
    pub codec_config: bool,
    /// The governor dropped the frame.
    pub dropped: bool,
    /// Sessions that received at least one packet.
    pub sessions: usize,
    /// RTP packets handed to transports across all sessions.
    pub packets: usize,
    /// Sessions that were too far behind to take the frame.
    pub congested: usize,
    /// Sessions removed because sending to them failed.
    pub removed: Vec<String>,
}

pub struct FanOut {
    mount: Arc<Mount>,
    sessions: SessionManager,
}

impl FanOut {
    pub fn new(mount: Arc<Mount>, sessions: SessionManager) -> Self {
        Self { mount, sessions }
    }

    pub fn process(&self, unit: &NalUnit) -> Delivery {
        if unit.is_codec_config {
            self.mount.absorb_codec_config(unit);
            return Delivery {
                codec_config: true,
                ..Delivery::default()
            };
        }

        let nal_units = split_access_unit(&unit.data);

        if !self.mount.codec_config().is_ready()
            && self.mount.codec_config().update_from_buffers(&nal_units)
        {
            tracing::info!(mount = %self.mount.path(), "codec config taken from in-band parameter sets");
        }

        if !self.mount.admit(unit) {
            tracing::trace!(
                presentation_time_us = unit.presentation_time_us,
                "frame dropped by governor"
            );
            return Delivery {
                dropped: true,
                ..Delivery::default()
            };
        }

        let mut delivery = Delivery::default();
        for session in self.sessions.playing_sessions() {
            match session.deliver(&nal_units, unit.presentation_time_us, unit.is_key_frame) {
                Ok(Delivered::Packets(0)) | Ok(Delivered::AwaitingKeyFrame) => {}
                Ok(Delivered::Packets(packets)) => {
                    delivery.sessions += 1;
                    delivery.packets += packets;
                }
                Ok(Delivered::Dropped) => delivery.congested += 1,
                Err(e) => {
                    tracing::warn!(
                        session_id = %session.id,
                        transport = %session.transport,
                        error = %e,
                        "RTP delivery failed, removing session"
                    );
                    self.sessions.remove_session(&session.id);
                    delivery.removed.push(session.id.clone());
                }
            }
        }

        if delivery.congested > 0 {
            self.mount.request_key_frame();
        }

        tracing::trace!(
            presentation_time_us = unit.presentation_time_us,
            key_frame = unit.is_key_frame,
            sessions = delivery.sessions,
            packets = delivery.packets,
            congested = delivery.congested,
            "frame delivered"
        );
        delivery
    }

    /// Drain the mount's frame queue until the server stops.
    ///
    /// When an encoder instance closes its queue the encoder is unbound and
    /// the loop idles until a new instance is bound, then follows the new
    /// queue.
    pub fn run(&self, running: &AtomicBool) {
        let mut receiver = self.mount.frame_receiver();
        while running.load(Ordering::SeqCst) {
            let current = self.mount.frame_receiver();
            if !Arc::ptr_eq(&current, &receiver) {
                tracing::debug!(mount = %self.mount.path(), "following new encoder queue");
                receiver = current;
            }

            match receiver.recv_timeout(RECV_POLL_INTERVAL) {
                Received::Unit(unit) => {
                    self.process(&unit);
                }
                Received::Timeout => {}
                Received::Closed => {
                    self.mount.release_closed_feed(&receiver);
                    thread::sleep(RECV_POLL_INTERVAL);
                }
            }
        }
        tracing::debug!("fan-out loop exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{Encoder, OutputFormat};
    use crate::media::H264Packetizer;
    use crate::session::{Session, SessionState, Transport};
    use crate::transport::interleaved::{InterleavedSender, SharedWriter};
    use std::io;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    const SPS: [u8; 4] = [0x67, 0x42, 0xc0, 0x1f];
    const PPS: [u8; 4] = [0x68, 0xce, 0x3c, 0x80];

    struct FailingWriter;

    impl io::Write for FailingWriter {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct SlowWriter;

    impl io::Write for SlowWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            thread::sleep(Duration::from_millis(400));
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingEncoder {
        key_frame_requests: AtomicUsize,
    }

    impl Encoder for CountingEncoder {
        fn output_format(&self) -> Option<OutputFormat> {
            Some(OutputFormat {
                codec_specific_data: vec![SPS.to_vec(), PPS.to_vec()],
                ..OutputFormat::default()
            })
        }

        fn request_key_frame(&self) {
            self.key_frame_requests.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fan_out(target_fps: u32) -> (FanOut, SessionManager, Arc<Mount>) {
        let mount = Arc::new(Mount::new("/stream", target_fps));
        let sessions = SessionManager::default();
        (FanOut::new(mount.clone(), sessions.clone()), sessions, mount)
    }

    fn playing_with_queue(
        sessions: &SessionManager,
        connection_id: u64,
        writer: SharedWriter,
        capacity: usize,
    ) -> Arc<Session> {
        let session = sessions.create_session(
            "rtsp://127.0.0.1/stream/track1",
            "127.0.0.1:40000".parse().unwrap(),
            connection_id,
            Transport::Interleaved {
                rtp_channel: 0,
                rtcp_channel: 1,
                sender: InterleavedSender::spawn(writer, 0, capacity).unwrap(),
            },
            H264Packetizer::with_random_state(1400),
        );
        session.set_state(SessionState::Playing);
        session
    }

    fn playing(sessions: &SessionManager, connection_id: u64, writer: SharedWriter) -> Arc<Session> {
        playing_with_queue(sessions, connection_id, writer, 64)
    }

    fn annex_b(nals: &[&[u8]]) -> Vec<u8> {
        nals.iter()
            .flat_map(|nal| [&[0u8, 0, 0, 1][..], *nal].concat())
            .collect()
    }

    #[test]
    fn codec_config_units_are_not_forwarded() {
        let (fan_out, sessions, mount) = fan_out(30);
        let session = playing(&sessions, 1, SharedWriter::new(io::sink()));
        let delivery = fan_out.process(&NalUnit::codec_config(annex_b(&[&SPS, &PPS])));
        assert!(delivery.codec_config);
        assert!(mount.codec_config().is_ready());
        assert_eq!(session.packets_sent(), 0);
    }

    #[test]
    fn in_band_parameter_sets_fill_the_cache() {
        let (fan_out, _, mount) = fan_out(30);
        let frame = annex_b(&[&SPS, &PPS, &[0x65, 0x88, 0x84]]);
        fan_out.process(&NalUnit::key_frame(frame, 0));
        assert!(mount.codec_config().is_ready());
    }

    #[test]
    fn every_playing_session_gets_the_frame() {
        let (fan_out, sessions, _) = fan_out(0);
        let a = playing(&sessions, 1, SharedWriter::new(io::sink()));
        let b = playing(&sessions, 2, SharedWriter::new(io::sink()));
        let paused = playing(&sessions, 3, SharedWriter::new(io::sink()));
        paused.set_state(SessionState::Ready);

        let delivery = fan_out.process(&NalUnit::key_frame(annex_b(&[&SPS, &PPS, &[0x65, 0x88]]), 0));
        assert_eq!(delivery.sessions, 2);
        assert_eq!(delivery.packets, 6);
        assert_eq!(a.packets_sent(), 3);
        assert_eq!(b.packets_sent(), 3);
        assert_eq!(paused.packets_sent(), 0);
    }

    #[test]
    fn governor_decides_once_per_frame() {
        let (fan_out, sessions, _) = fan_out(10);
        let session = playing(&sessions, 1, SharedWriter::new(io::sink()));
        assert!(!fan_out.process(&NalUnit::key_frame(vec![0x65, 0x88], 0)).dropped);
        assert!(fan_out.process(&NalUnit::new(vec![0x41, 0x9a], 40_000)).dropped);
        assert!(!fan_out.process(&NalUnit::new(vec![0x41, 0x9a], 100_000)).dropped);
        assert_eq!(session.packets_sent(), 2);
    }

    #[test]
    fn failing_session_is_removed_without_affecting_others() {
        let (fan_out, sessions, _) = fan_out(0);
        let healthy = playing(&sessions, 1, SharedWriter::new(io::sink()));
        let broken = playing(&sessions, 2, SharedWriter::new(FailingWriter));

        // The first write fails on the broken session's writer thread; the
        // failure surfaces on a later frame.
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut pts = 0;
        loop {
            let delivery = fan_out.process(&NalUnit::key_frame(vec![0x65, 0x88], pts));
            if !delivery.removed.is_empty() {
                assert_eq!(delivery.removed, vec![broken.id.clone()]);
                break;
            }
            assert!(Instant::now() < deadline, "broken session never removed");
            pts += 33_000;
            thread::sleep(Duration::from_millis(10));
        }
        assert!(sessions.get_session(&broken.id).is_none());

        let before = healthy.packets_sent();
        fan_out.process(&NalUnit::new(vec![0x41, 0x9a], pts + 33_000));
        assert_eq!(healthy.packets_sent(), before + 1);
    }

    #[test]
    fn slow_session_does_not_hold_up_the_others() {
        let (fan_out, sessions, mount) = fan_out(0);
        let encoder = Arc::new(CountingEncoder::default());
        mount.bind_encoder(encoder.clone());
        let slow = playing_with_queue(&sessions, 1, SharedWriter::new(SlowWriter), 1);
        let healthy = playing(&sessions, 2, SharedWriter::new(io::sink()));
        let requests_after_bind = encoder.key_frame_requests.load(Ordering::SeqCst);

        let started = Instant::now();
        let mut congested = 0;
        for i in 0..3u64 {
            congested += fan_out.process(&NalUnit::key_frame(vec![0x65, 0x88], i * 33_000)).congested;
        }
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(healthy.packets_sent(), 3);
        assert!(slow.packets_sent() < 3);
        assert!(congested > 0);
        assert!(encoder.key_frame_requests.load(Ordering::SeqCst) > requests_after_bind);
    }

    #[test]
    fn run_follows_a_rebound_encoder() {
        let (fan_out, sessions, mount) = fan_out(0);
        let session = playing(&sessions, 1, SharedWriter::new(io::sink()));

        let first = mount.bind_encoder(Arc::new(CountingEncoder::default()));
        first.send(NalUnit::key_frame(vec![0x65, 0x88], 0)).unwrap();
        first.close();

        let running = AtomicBool::new(true);
        thread::scope(|s| {
            s.spawn(|| fan_out.run(&running));

            let deadline = Instant::now() + Duration::from_secs(2);
            while mount.is_bound() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            assert!(!mount.is_bound(), "closed queue should unbind the encoder");
            assert_eq!(session.packets_sent(), 1);

            let second = mount.bind_encoder(Arc::new(CountingEncoder::default()));
            second.send(NalUnit::new(vec![0x41, 0x9a], 33_000)).unwrap();
            while session.packets_sent() < 2 && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            running.store(false, Ordering::SeqCst);
        });
        assert_eq!(session.packets_sent(), 2);
    }
}
