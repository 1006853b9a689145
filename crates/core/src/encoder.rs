//! Boundary to the upstream H.264 encoder.
//!
//! The encoder itself is external. It is seen through two surfaces:
//!
//! - [`Encoder`]: queried once at bind time for its declared output format
//!   (the eager SPS/PPS path) and asked for key frames on demand.
//! - [`FrameSender`]: the producer half of a bounded queue that the encoder
//!   adapter pushes [`NalUnit`]s into. The fan-out thread drains the
//!   [`FrameReceiver`] half.
//!
//! The queue never blocks the producer. When it is full, the oldest
//! non-keyframe entry is dropped to make room; if only keyframes are queued
//! the oldest one goes.
//!
//! Every bound encoder instance gets a queue of its own ([`FrameFeed`]).
//! Closing it ends that instance only; binding the next instance opens a
//! fresh queue that the fan-out thread switches to.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::media::NalUnit;

/// Output format an encoder declares after it has been configured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputFormat {
    pub width: u32,
    pub height: u32,
    /// Codec-specific data buffers, typically SPS then PPS, with or without
    /// Annex B start codes. Empty when the encoder only emits them in-band.
    pub codec_specific_data: Vec<Vec<u8>>,
    /// Raw input color formats the encoder accepts, by name.
    pub color_formats: Vec<String>,
}

/// Control surface of the bound encoder instance.
pub trait Encoder: Send + Sync {
    /// Currently declared output format, if the encoder has published one.
    fn output_format(&self) -> Option<OutputFormat>;

    /// Ask for a sync frame as soon as possible. Advisory.
    fn request_key_frame(&self) {}
}

#[derive(Debug)]
struct QueueState {
    frames: VecDeque<NalUnit>,
    closed: bool,
    dropped: u64,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<QueueState>,
    available: Condvar,
    capacity: usize,
}

/// Create a bounded frame queue holding at most `capacity` units.
pub fn frame_queue(capacity: usize) -> (FrameSender, FrameReceiver) {
    let shared = Arc::new(Shared {
        state: Mutex::new(QueueState {
            frames: VecDeque::with_capacity(capacity.max(1)),
            closed: false,
            dropped: 0,
        }),
        available: Condvar::new(),
        capacity: capacity.max(1),
    });
    (
        FrameSender {
            shared: shared.clone(),
        },
        FrameReceiver { shared },
    )
}

/// Producer half, held by the encoder adapter. Cheap to clone.
#[derive(Debug, Clone)]
pub struct FrameSender {
    shared: Arc<Shared>,
}

impl FrameSender {
    /// Queue a unit without blocking.
    ///
    /// Returns [`RtspError::EncoderDisconnected`](crate::RtspError::EncoderDisconnected)
    /// once the queue has been closed.
    pub fn send(&self, unit: NalUnit) -> crate::Result<()> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(crate::RtspError::EncoderDisconnected);
        }

        if state.frames.len() >= self.shared.capacity {
            let victim = state
                .frames
                .iter()
                .position(|f| !f.is_key_frame && !f.is_codec_config)
                .unwrap_or(0);
            if let Some(dropped) = state.frames.remove(victim) {
                state.dropped += 1;
                tracing::debug!(
                    presentation_time_us = dropped.presentation_time_us,
                    key_frame = dropped.is_key_frame,
                    total_dropped = state.dropped,
                    "frame queue full, dropped oldest entry"
                );
            }
        }

        state.frames.push_back(unit);
        drop(state);
        self.shared.available.notify_one();
        Ok(())
    }

    /// Signal that the encoder is gone. Queued units are still delivered.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.available.notify_all();
    }

    /// Number of units dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.shared.state.lock().dropped
    }
}

/// The queue of the currently bound encoder instance.
#[derive(Debug)]
pub struct FrameFeed {
    capacity: usize,
    current: Mutex<(FrameSender, Arc<FrameReceiver>)>,
}

impl FrameFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = frame_queue(capacity);
        Self {
            capacity,
            current: Mutex::new((sender, Arc::new(receiver))),
        }
    }

    pub fn sender(&self) -> FrameSender {
        self.current.lock().0.clone()
    }

    pub fn receiver(&self) -> Arc<FrameReceiver> {
        self.current.lock().1.clone()
    }

    /// Whether `receiver` is the current queue's consumer half.
    pub fn is_current(&self, receiver: &Arc<FrameReceiver>) -> bool {
        Arc::ptr_eq(&self.current.lock().1, receiver)
    }

    /// Open a new queue and close the previous one.
    pub fn replace(&self) -> FrameSender {
        let (sender, receiver) = frame_queue(self.capacity);
        let mut current = self.current.lock();
        let previous = std::mem::replace(&mut current.0, sender.clone());
        current.1 = Arc::new(receiver);
        drop(current);
        previous.close();
        sender
    }
}

/// Consumer half, owned by the fan-out thread.
#[derive(Debug)]
pub struct FrameReceiver {
    shared: Arc<Shared>,
}

/// Outcome of [`FrameReceiver::recv_timeout`].
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    Unit(NalUnit),
    Timeout,
    Closed,
}

impl FrameReceiver {
    /// Wait up to `timeout` for the next unit.
    pub fn recv_timeout(&self, timeout: Duration) -> Received {
        let mut state = self.shared.state.lock();
        if state.frames.is_empty() && !state.closed {
            self.shared.available.wait_for(&mut state, timeout);
        }
        match state.frames.pop_front() {
            Some(unit) => Received::Unit(unit),
            None if state.closed => Received::Closed,
            None => Received::Timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
