//! Annex B `.h264` file played back as if it were a live encoder.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use live_rtsp::media::h264::{
    NAL_TYPE_AUD, NAL_TYPE_IDR, NAL_TYPE_PPS, NAL_TYPE_SPS, extract_nal_units, nal_type,
};
use live_rtsp::{Encoder, FrameSender, NalUnit, OutputFormat};

const NAL_TYPE_SEI: u8 = 6;

/// One frame worth of NAL units, re-serialized with start codes.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub data: Vec<u8>,
    pub is_key_frame: bool,
}

/// Pre-parsed elementary stream.
#[derive(Debug)]
pub struct FileSource {
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
    access_units: Vec<AccessUnit>,
    skip_to_key_frame: AtomicBool,
}

impl FileSource {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(Self::parse(&bytes))
    }

    pub fn parse(bytes: &[u8]) -> Self {
        let nals = extract_nal_units(bytes);
        let sps = nals
            .iter()
            .find(|n| nal_type(n) == Some(NAL_TYPE_SPS))
            .map(|n| n.to_vec());
        let pps = nals
            .iter()
            .find(|n| nal_type(n) == Some(NAL_TYPE_PPS))
            .map(|n| n.to_vec());

        Self {
            sps,
            pps,
            access_units: group_access_units(&nals),
            skip_to_key_frame: AtomicBool::new(false),
        }
    }

    pub fn access_units(&self) -> &[AccessUnit] {
        &self.access_units
    }

    /// Feed access units into `frames` at `fps` until `running` is cleared.
    ///
    /// Presentation times keep increasing across loops. When not looping,
    /// the queue is closed at end of file.
    pub fn play(&self, frames: &FrameSender, fps: f64, looping: bool, running: &AtomicBool) {
        if self.access_units.is_empty() {
            tracing::error!("input contains no access units");
            frames.close();
            return;
        }

        let frame_interval = Duration::from_secs_f64(1.0 / fps.max(0.1));
        let start = Instant::now();
        let mut frame_index: u32 = 0;

        'outer: loop {
            let mut i = 0;
            while i < self.access_units.len() {
                if !running.load(Ordering::SeqCst) {
                    break 'outer;
                }

                if self.skip_to_key_frame.swap(false, Ordering::SeqCst)
                    && let Some(offset) = self.access_units[i..].iter().position(|au| au.is_key_frame)
                {
                    tracing::debug!(skipped = offset, "jumping to next key frame");
                    i += offset;
                }

                let due = start + frame_interval * frame_index;
                if let Some(wait) = due.checked_duration_since(Instant::now()) {
                    thread::sleep(wait);
                }

                let au = &self.access_units[i];
                let pts = (frame_interval * frame_index).as_micros() as u64;
                let unit = if au.is_key_frame {
                    NalUnit::key_frame(au.data.clone(), pts)
                } else {
                    NalUnit::new(au.data.clone(), pts)
                };
                if frames.send(unit).is_err() {
                    break 'outer;
                }

                frame_index += 1;
                i += 1;
            }

            if !looping {
                tracing::info!(frames = frame_index, "end of input");
                frames.close();
                break;
            }
            tracing::debug!("looping input");
        }
    }
}

impl Encoder for FileSource {
    fn output_format(&self) -> Option<OutputFormat> {
        let codec_specific_data = match (&self.sps, &self.pps) {
            (Some(sps), Some(pps)) => vec![sps.clone(), pps.clone()],
            _ => Vec::new(),
        };
        Some(OutputFormat {
            codec_specific_data,
            ..OutputFormat::default()
        })
    }

    fn request_key_frame(&self) {
        self.skip_to_key_frame.store(true, Ordering::SeqCst);
    }
}

fn is_vcl(nal_type: u8) -> bool {
    (1..=NAL_TYPE_IDR).contains(&nal_type)
}

/// `first_mb_in_slice == 0` is coded as a single `1` bit (ue(v)).
fn starts_picture(nal: &[u8]) -> bool {
    nal.get(1).is_some_and(|b| b & 0x80 != 0)
}

/// Split a NAL sequence into access units (H.264 §7.4.1.2.3, simplified):
/// a new unit begins at an AUD, at SEI/SPS/PPS following picture data, or at
/// a slice whose `first_mb_in_slice` is zero.
pub fn group_access_units(nals: &[&[u8]]) -> Vec<AccessUnit> {
    let mut units = Vec::new();
    let mut current: Vec<&[u8]> = Vec::new();
    let mut has_picture = false;

    for nal in nals {
        let Some(t) = nal_type(nal) else { continue };
        let boundary = if is_vcl(t) {
            has_picture && starts_picture(nal)
        } else {
            t == NAL_TYPE_AUD
                || (has_picture && matches!(t, NAL_TYPE_SEI | NAL_TYPE_SPS | NAL_TYPE_PPS))
        };

        if boundary && !current.is_empty() {
            units.push(build_access_unit(&current));
            current.clear();
            has_picture = false;
        }
        current.push(nal);
        has_picture |= is_vcl(t);
    }

    if has_picture {
        units.push(build_access_unit(&current));
    }
    units
}

fn build_access_unit(nals: &[&[u8]]) -> AccessUnit {
    let mut data = Vec::with_capacity(nals.iter().map(|n| n.len() + 4).sum());
    for nal in nals {
        data.extend_from_slice(&[0, 0, 0, 1]);
        data.extend_from_slice(nal);
    }
    AccessUnit {
        data,
        is_key_frame: nals.iter().any(|n| nal_type(n) == Some(NAL_TYPE_IDR)),
    }
}
