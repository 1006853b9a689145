use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::encoder::{Encoder, FrameFeed, FrameReceiver, FrameSender};
use crate::media::{CodecConfigCache, FrameRateGovernor, NalUnit};

pub const DEFAULT_MOUNT_PATH: &str = "/stream";
pub const DEFAULT_FRAME_QUEUE_CAPACITY: usize = 64;

/// The served stream endpoint (e.g. `/stream`).
///
/// Owns the per-encoder singletons: the codec-config cache, the frame-rate
/// governor, the frame queue and the handle of the bound encoder instance.
/// Sessions never share packetizer state through the mount; each session
/// has its own.
pub struct Mount {
    path: String,
    codec_config: CodecConfigCache,
    governor: Mutex<FrameRateGovernor>,
    encoder: RwLock<Option<Arc<dyn Encoder>>>,
    feed: FrameFeed,
    last_presentation_time_us: AtomicU64,
}

impl Mount {
    pub fn new(path: &str, target_fps: u32) -> Self {
        Self::with_frame_queue(path, target_fps, DEFAULT_FRAME_QUEUE_CAPACITY)
    }

    pub fn with_frame_queue(path: &str, target_fps: u32, queue_capacity: usize) -> Self {
        Self {
            path: path.to_string(),
            codec_config: CodecConfigCache::new(),
            governor: Mutex::new(FrameRateGovernor::new(target_fps)),
            encoder: RwLock::new(None),
            feed: FrameFeed::new(queue_capacity),
            last_presentation_time_us: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn codec_config(&self) -> &CodecConfigCache {
        &self.codec_config
    }

    /// Whether an RTSP URI addresses this mount (track suffixes allowed).
    pub fn matches_uri(&self, uri: &str) -> bool {
        let requested = extract_mount_path(uri).trim_end_matches('/');
        requested == self.path.trim_end_matches('/')
    }

    /// Bind a new encoder instance and return the queue it feeds.
    ///
    /// SPS/PPS, the governor state and the frame queue belong to the
    /// previous instance and are discarded; its queue is closed. The
    /// declared output format is then inspected for codec-specific data
    /// (eager path). If that yields nothing, a key frame is requested so the
    /// in-band codec config arrives sooner (lazy path).
    pub fn bind_encoder(&self, encoder: Arc<dyn Encoder>) -> FrameSender {
        let mut bound = self.encoder.write();
        self.codec_config.reset();
        self.governor.lock().reset();

        let eager = encoder
            .output_format()
            .map(|format| {
                self.codec_config
                    .update_from_buffers(&format.codec_specific_data)
            })
            .unwrap_or(false);

        if eager {
            tracing::info!(mount = %self.path, "codec config taken from encoder output format");
        } else {
            tracing::info!(
                mount = %self.path,
                "encoder output format has no codec config, waiting for in-band SPS/PPS"
            );
            encoder.request_key_frame();
        }

        let frames = self.feed.replace();
        *bound = Some(encoder);
        frames
    }

    /// Forget the encoder whose queue `receiver` drained, once that queue
    /// reported closed.
    ///
    /// Does nothing when another instance has been bound in the meantime.
    /// Returns whether an encoder was unbound.
    pub fn release_closed_feed(&self, receiver: &Arc<FrameReceiver>) -> bool {
        let mut bound = self.encoder.write();
        if !self.feed.is_current(receiver) || bound.is_none() {
            return false;
        }
        *bound = None;
        tracing::info!(mount = %self.path, "encoder disconnected, waiting for a new instance");
        true
    }

    pub fn is_bound(&self) -> bool {
        self.encoder.read().is_some()
    }

    /// Producer half of the current frame queue.
    pub fn frame_sender(&self) -> FrameSender {
        self.feed.sender()
    }

    /// Consumer half of the current frame queue.
    pub fn frame_receiver(&self) -> Arc<FrameReceiver> {
        self.feed.receiver()
    }

    pub fn request_key_frame(&self) {
        if let Some(encoder) = self.encoder.read().as_ref() {
            tracing::debug!(mount = %self.path, "requesting key frame");
            encoder.request_key_frame();
        }
    }

    /// Feed the lazy codec-config path with a unit flagged as codec config.
    pub fn absorb_codec_config(&self, unit: &NalUnit) -> bool {
        let completed = self.codec_config.update_from_buffers(&[&unit.data]);
        if completed {
            tracing::info!(mount = %self.path, "codec config taken from codec-config unit");
        }
        completed
    }

    /// Governor decision for a picture unit. Runs once per frame, before fan-out.
    pub fn admit(&self, unit: &NalUnit) -> bool {
        let accepted = self
            .governor
            .lock()
            .should_send(unit.presentation_time_us, unit.is_key_frame);
        if accepted {
            self.last_presentation_time_us
                .store(unit.presentation_time_us, Ordering::Relaxed);
        }
        accepted
    }

    /// Presentation time of the most recently admitted frame.
    pub fn last_presentation_time_us(&self) -> u64 {
        self.last_presentation_time_us.load(Ordering::Relaxed)
    }
}

/// Extract the mount path from an RTSP URI.
///
/// `rtsp://host:8554/stream/track1` → `/stream`
/// `rtsp://host:8554/stream`        → `/stream`
/// `rtsp://host:8554/`              → `/`
/// `rtsp://host:8554`               → `/stream` (default)
/// `*`                               → `/stream` (default)
pub fn extract_mount_path(uri: &str) -> &str {
    let path = if let Some(after) = uri
        .strip_prefix("rtsp://")
        .or_else(|| uri.strip_prefix("rtsps://"))
    {
        match after.find('/') {
            Some(slash) => &after[slash..],
            None => DEFAULT_MOUNT_PATH,
        }
    } else if uri.starts_with('/') {
        uri
    } else {
        DEFAULT_MOUNT_PATH
    };

    // Query strings are not part of the mount.
    let path = path.split('?').next().unwrap_or(path);

    // Strip track suffix: /stream/track1 → /stream
    if let Some(pos) = path.rfind("/track") {
        &path[..pos]
    } else {
        path
    }
}
