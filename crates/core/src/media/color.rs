//! YUV 4:2:0 plane reformatting for encoders fed from CPU buffers.
//!
//! Cameras hand out three planes with independent row and pixel strides.
//! Buffer-mode encoders want one contiguous frame in the layout they
//! negotiated:
//!
//! ```text
//! NV12:  YYYYYYYY... UVUVUV...
//! NV21:  YYYYYYYY... VUVUVU...
//! I420:  YYYYYYYY... UUUU... VVVV...
//! ```
//!
//! Reads that fall outside a source plane yield neutral chroma (128) or
//! black luma instead of failing, so a short or oddly padded camera buffer
//! still produces a full-size frame.

use crate::encoder::OutputFormat;

/// Byte layout required by the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorFormat {
    /// Semi-planar, chroma interleaved U,V.
    Nv12,
    /// Semi-planar, chroma interleaved V,U.
    Nv21,
    /// Fully planar Y, U, V.
    I420,
}

const NEUTRAL_CHROMA: u8 = 128;
const BLACK_LUMA: u8 = 16;

impl ColorFormat {
    /// Parse one advertised color-format name.
    ///
    /// Returns `None` for names that do not pin down a single layout
    /// (flexible/opaque formats, unknown vendor names).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "nv12" | "yuv420sp" | "yuv420semiplanar" | "yuv420packedsemiplanar" => {
                Some(Self::Nv12)
            }
            "nv21" | "yuv420sp_vu" | "yvu420semiplanar" => Some(Self::Nv21),
            "i420" | "iyuv" | "yuv420p" | "yuv420planar" | "yuv420packedplanar" => {
                Some(Self::I420)
            }
            _ => None,
        }
    }

    /// Pick the layout from the formats an encoder advertises.
    ///
    /// The first unambiguous entry wins. When nothing is recognized the
    /// result is NV12, the native format of most hardware encoders.
    pub fn detect<S: AsRef<str>>(advertised: &[S]) -> Self {
        let detected = advertised
            .iter()
            .find_map(|name| Self::from_name(name.as_ref()));
        match detected {
            Some(format) => format,
            None => {
                tracing::debug!(
                    advertised = advertised.len(),
                    "no unambiguous color format advertised, defaulting to NV12"
                );
                Self::Nv12
            }
        }
    }

    /// Output size in bytes for a `width` x `height` frame.
    pub fn frame_size(self, width: usize, height: usize) -> usize {
        let (cw, ch) = chroma_dimensions(width, height);
        width * height + 2 * cw * ch
    }
}

fn chroma_dimensions(width: usize, height: usize) -> (usize, usize) {
    (width.div_ceil(2), height.div_ceil(2))
}

/// One camera plane.
#[derive(Debug, Clone, Copy)]
pub struct YuvPlane<'a> {
    pub data: &'a [u8],
    /// Bytes between the starts of consecutive rows.
    pub row_stride: usize,
    /// Bytes between consecutive samples in a row.
    pub pixel_stride: usize,
}

impl<'a> YuvPlane<'a> {
    /// Tightly packed plane: one byte per sample.
    pub fn packed(data: &'a [u8], row_stride: usize) -> Self {
        Self {
            data,
            row_stride,
            pixel_stride: 1,
        }
    }

    fn sample(&self, x: usize, y: usize) -> Option<u8> {
        self.data
            .get(y * self.row_stride + x * self.pixel_stride)
            .copied()
    }
}

/// A 4:2:0 camera frame as three planes.
#[derive(Debug, Clone, Copy)]
pub struct YuvFrame<'a> {
    pub width: usize,
    pub height: usize,
    pub y: YuvPlane<'a>,
    pub u: YuvPlane<'a>,
    pub v: YuvPlane<'a>,
}

/// Reformats camera planes into the encoder's negotiated layout.
#[derive(Debug, Clone, Copy)]
pub struct ColorPlaneConverter {
    format: ColorFormat,
}

impl ColorPlaneConverter {
    pub fn new(format: ColorFormat) -> Self {
        Self { format }
    }

    /// Converter for whichever layout the encoder advertises.
    pub fn for_advertised<S: AsRef<str>>(advertised: &[S]) -> Self {
        Self::new(ColorFormat::detect(advertised))
    }

    /// Converter matching the input formats in an encoder's declared output
    /// format.
    pub fn for_output_format(format: &OutputFormat) -> Self {
        Self::for_advertised(&format.color_formats)
    }

    pub fn format(&self) -> ColorFormat {
        self.format
    }

    /// Write the converted frame into `out`, replacing its contents.
    pub fn convert_into(&self, frame: &YuvFrame<'_>, out: &mut Vec<u8>) {
        out.clear();
        out.reserve(self.format.frame_size(frame.width, frame.height));

        copy_luma(frame, out);
        match self.format {
            ColorFormat::Nv12 => interleave_chroma(frame, &frame.u, &frame.v, out),
            ColorFormat::Nv21 => interleave_chroma(frame, &frame.v, &frame.u, out),
            ColorFormat::I420 => {
                copy_chroma_plane(frame, &frame.u, out);
                copy_chroma_plane(frame, &frame.v, out);
            }
        }
    }

    pub fn convert(&self, frame: &YuvFrame<'_>) -> Vec<u8> {
        let mut out = Vec::new();
        self.convert_into(frame, &mut out);
        out
    }
}

fn copy_luma(frame: &YuvFrame<'_>, out: &mut Vec<u8>) {
    let plane = &frame.y;
    for row in 0..frame.height {
        let start = row * plane.row_stride;
        // Fast path: contiguous row fully inside the buffer.
        if plane.pixel_stride == 1
            && let Some(src) = plane.data.get(start..start + frame.width)
        {
            out.extend_from_slice(src);
            continue;
        }
        out.extend((0..frame.width).map(|x| plane.sample(x, row).unwrap_or(BLACK_LUMA)));
    }
}

fn interleave_chroma(
    frame: &YuvFrame<'_>,
    first: &YuvPlane<'_>,
    second: &YuvPlane<'_>,
    out: &mut Vec<u8>,
) {
    let (cw, ch) = chroma_dimensions(frame.width, frame.height);
    for row in 0..ch {
        for x in 0..cw {
            out.push(first.sample(x, row).unwrap_or(NEUTRAL_CHROMA));
            out.push(second.sample(x, row).unwrap_or(NEUTRAL_CHROMA));
        }
    }
}

fn copy_chroma_plane(frame: &YuvFrame<'_>, plane: &YuvPlane<'_>, out: &mut Vec<u8>) {
    let (cw, ch) = chroma_dimensions(frame.width, frame.height);
    for row in 0..ch {
        out.extend((0..cw).map(|x| plane.sample(x, row).unwrap_or(NEUTRAL_CHROMA)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 4x2 frame: Y = 0..8, U = [100, 101], V = [200, 201]
    const Y: [u8; 8] = [0, 1, 2, 3, 4, 5, 6, 7];
    const U: [u8; 2] = [100, 101];
    const V: [u8; 2] = [200, 201];

    fn packed_frame() -> YuvFrame<'static> {
        YuvFrame {
            width: 4,
            height: 2,
            y: YuvPlane::packed(&Y, 4),
            u: YuvPlane::packed(&U, 2),
            v: YuvPlane::packed(&V, 2),
        }
    }

    #[test]
    fn converter_follows_declared_output_format() {
        let format = OutputFormat {
            width: 4,
            height: 2,
            color_formats: vec!["Surface".to_string(), "YUV420Planar".to_string()],
            ..OutputFormat::default()
        };
        let converter = ColorPlaneConverter::for_output_format(&format);
        assert_eq!(converter.format(), ColorFormat::I420);
        assert_eq!(&converter.convert(&packed_frame())[8..], &[100, 101, 200, 201]);

        let silent = ColorPlaneConverter::for_output_format(&OutputFormat::default());
        assert_eq!(silent.format(), ColorFormat::Nv12);
    }

    #[test]
    fn nv12_interleaves_u_first() {
        let out = ColorPlaneConverter::new(ColorFormat::Nv12).convert(&packed_frame());
        assert_eq!(out, vec![0, 1, 2, 3, 4, 5, 6, 7, 100, 200, 101, 201]);
    }

    #[test]
    fn nv21_interleaves_v_first() {
        let out = ColorPlaneConverter::new(ColorFormat::Nv21).convert(&packed_frame());
        assert_eq!(&out[8..], &[200, 100, 201, 101]);
    }

    #[test]
    fn i420_is_fully_planar() {
        let out = ColorPlaneConverter::new(ColorFormat::I420).convert(&packed_frame());
        assert_eq!(&out[8..], &[100, 101, 200, 201]);
        assert_eq!(out.len(), ColorFormat::I420.frame_size(4, 2));
    }

    #[test]
    fn respects_row_and_pixel_strides() {
        // Y rows padded to 6 bytes; chroma semi-planar source (pixel stride 2).
        let y = [0, 1, 2, 3, 99, 99, 4, 5, 6, 7, 99, 99];
        let uv = [100, 200, 101, 201];
        let frame = YuvFrame {
            width: 4,
            height: 2,
            y: YuvPlane::packed(&y, 6),
            u: YuvPlane {
                data: &uv,
                row_stride: 4,
                pixel_stride: 2,
            },
            v: YuvPlane {
                data: &uv[1..],
                row_stride: 4,
                pixel_stride: 2,
            },
        };
        let out = ColorPlaneConverter::new(ColorFormat::Nv12).convert(&frame);
        assert_eq!(out, vec![0, 1, 2, 3, 4, 5, 6, 7, 100, 200, 101, 201]);
    }

    #[test]
    fn out_of_bounds_chroma_is_neutral() {
        let frame = YuvFrame {
            u: YuvPlane::packed(&U[..1], 2),
            v: YuvPlane::packed(&[], 2),
            ..packed_frame()
        };
        let out = ColorPlaneConverter::new(ColorFormat::Nv12).convert(&frame);
        assert_eq!(&out[8..], &[100, 128, 128, 128]);
    }

    #[test]
    fn odd_dimensions_round_chroma_up() {
        assert_eq!(ColorFormat::Nv12.frame_size(3, 3), 9 + 2 * 2 * 2);
        let y = [10u8; 9];
        let frame = YuvFrame {
            width: 3,
            height: 3,
            y: YuvPlane::packed(&y, 3),
            u: YuvPlane::packed(&[], 2),
            v: YuvPlane::packed(&[], 2),
        };
        let out = ColorPlaneConverter::new(ColorFormat::I420).convert(&frame);
        assert_eq!(out.len(), 17);
    }

    #[test]
    fn detect_advertised_format() {
        assert_eq!(ColorFormat::detect(&["flexible", "I420"]), ColorFormat::I420);
        assert_eq!(ColorFormat::detect(&["NV21"]), ColorFormat::Nv21);
        assert_eq!(ColorFormat::detect(&["flexible"]), ColorFormat::Nv12);
        assert_eq!(ColorFormat::detect::<&str>(&[]), ColorFormat::Nv12);
        assert_eq!(
            ColorPlaneConverter::for_advertised(&["yuv420planar"]).format(),
            ColorFormat::I420
        );
    }
}
