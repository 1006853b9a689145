//! SPS/PPS cache shared between the media pipeline and DESCRIBE handlers.
//!
//! Writers publish a whole new [`CodecConfig`] snapshot through an
//! [`ArcSwap`], so readers never observe an SPS from one encoder instance
//! paired with a PPS from another. A condition variable lets DESCRIBE block
//! (with a deadline) until both parameter sets are present.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};

use super::h264::{self, NAL_TYPE_PPS, NAL_TYPE_SPS};

/// Immutable SPS/PPS snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodecConfig {
    /// SPS NAL unit without start code.
    pub sps: Option<Vec<u8>>,
    /// PPS NAL unit without start code.
    pub pps: Option<Vec<u8>>,
    /// Bumped every time a new encoder instance is bound.
    pub generation: u64,
}

impl CodecConfig {
    /// Both parameter sets are present.
    pub fn is_complete(&self) -> bool {
        self.sps.is_some() && self.pps.is_some()
    }

    /// `(sps, pps)` when complete.
    pub fn parameter_sets(&self) -> Option<(&[u8], &[u8])> {
        match (&self.sps, &self.pps) {
            (Some(sps), Some(pps)) => Some((sps, pps)),
            _ => None,
        }
    }
}

/// Holds the most recent codec configuration for the bound encoder.
///
/// Once both SPS and PPS are present they stay fixed until
/// [`reset`](Self::reset) is called for a new encoder instance.
pub struct CodecConfigCache {
    current: ArcSwap<CodecConfig>,
    // Serializes writers and backs the readiness condvar.
    write_lock: Mutex<()>,
    ready: Condvar,
}

impl CodecConfigCache {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(CodecConfig::default()),
            write_lock: Mutex::new(()),
            ready: Condvar::new(),
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<CodecConfig> {
        self.current.load_full()
    }

    pub fn is_ready(&self) -> bool {
        self.current.load().is_complete()
    }

    /// Drop both parameter sets; called when a new encoder instance is bound.
    pub fn reset(&self) {
        let _guard = self.write_lock.lock();
        let generation = self.current.load().generation + 1;
        self.current.store(Arc::new(CodecConfig {
            sps: None,
            pps: None,
            generation,
        }));
        tracing::debug!(generation, "codec config reset");
    }

    /// Replace both parameter sets in one step.
    pub fn replace(&self, sps: Vec<u8>, pps: Vec<u8>) {
        let _guard = self.write_lock.lock();
        let generation = self.current.load().generation;
        self.current.store(Arc::new(CodecConfig {
            sps: Some(sps),
            pps: Some(pps),
            generation,
        }));
        tracing::debug!(generation, "codec config replaced");
        self.ready.notify_all();
    }

    /// Absorb SPS/PPS NAL units found in `buffers`.
    ///
    /// Each buffer may be a bare NAL unit or Annex B data holding several.
    /// Buffers that are neither SPS nor PPS are ignored. A complete
    /// configuration is never overwritten. Returns `true` when this call
    /// completed the configuration.
    pub fn update_from_buffers<B: AsRef<[u8]>>(&self, buffers: &[B]) -> bool {
        let mut sps = None;
        let mut pps = None;
        for buffer in buffers {
            for nal in h264::split_access_unit(buffer.as_ref()) {
                match h264::nal_type(nal) {
                    Some(NAL_TYPE_SPS) => sps = Some(nal.to_vec()),
                    Some(NAL_TYPE_PPS) => pps = Some(nal.to_vec()),
                    _ => {}
                }
            }
        }
        if sps.is_none() && pps.is_none() {
            return false;
        }

        let _guard = self.write_lock.lock();
        let current = self.current.load_full();
        if current.is_complete() {
            tracing::trace!("codec config already complete, ignoring new parameter sets");
            return false;
        }

        let next = CodecConfig {
            sps: sps.or_else(|| current.sps.clone()),
            pps: pps.or_else(|| current.pps.clone()),
            generation: current.generation,
        };
        let complete = next.is_complete();
        tracing::debug!(
            has_sps = next.sps.is_some(),
            has_pps = next.pps.is_some(),
            generation = next.generation,
            "codec config updated"
        );
        self.current.store(Arc::new(next));

        if complete {
            self.ready.notify_all();
        }
        complete
    }

    /// Block until both SPS and PPS are present or `timeout` elapses.
    pub fn wait_ready(&self, timeout: Duration) -> Option<Arc<CodecConfig>> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.write_lock.lock();
        loop {
            let snapshot = self.current.load_full();
            if snapshot.is_complete() {
                return Some(snapshot);
            }
            if self.ready.wait_until(&mut guard, deadline).timed_out() {
                let snapshot = self.current.load_full();
                return snapshot.is_complete().then_some(snapshot);
            }
        }
    }
}

impl Default for CodecConfigCache {
    fn default() -> Self {
        Self::new()
    }
}
