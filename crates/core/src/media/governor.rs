//! Explicit, timestamp-based frame-rate limiting.
//!
//! Hardware encoders treat frame-rate settings as hints, so the decision to
//! forward or drop is made here, once per frame and upstream of fan-out.

/// Decides per frame whether to forward or drop, based on presentation time.
#[derive(Debug, Clone)]
pub struct FrameRateGovernor {
    target_fps: u32,
    min_frame_interval_us: u64,
    last_sent_presentation_time_us: Option<u64>,
}

impl FrameRateGovernor {
    /// `target_fps == 0` disables governance: every frame is accepted.
    pub fn new(target_fps: u32) -> Self {
        let min_frame_interval_us = if target_fps == 0 {
            0
        } else {
            1_000_000 / target_fps as u64
        };
        Self {
            target_fps,
            min_frame_interval_us,
            last_sent_presentation_time_us: None,
        }
    }

    pub fn target_fps(&self) -> u32 {
        self.target_fps
    }

    pub fn min_frame_interval_us(&self) -> u64 {
        self.min_frame_interval_us
    }

    /// Forget the last sent timestamp (new encoder instance).
    pub fn reset(&mut self) {
        self.last_sent_presentation_time_us = None;
    }

    /// Returns `true` if the frame should be forwarded.
    ///
    /// Keyframes are always accepted and restart the interval. A timestamp
    /// that goes backwards means the upstream clock restarted, so the frame
    /// is accepted and becomes the new reference.
    pub fn should_send(&mut self, presentation_time_us: u64, is_key_frame: bool) -> bool {
        let accept = match self.last_sent_presentation_time_us {
            _ if is_key_frame => true,
            None => true,
            Some(last) if presentation_time_us < last => {
                tracing::debug!(
                    last,
                    presentation_time_us,
                    "presentation time went backwards, resyncing"
                );
                true
            }
            Some(last) => presentation_time_us - last >= self.min_frame_interval_us,
        };

        if accept {
            self.last_sent_presentation_time_us = Some(presentation_time_us);
        } else {
            tracing::trace!(presentation_time_us, "frame dropped by rate governor");
        }
        accept
    }
}
