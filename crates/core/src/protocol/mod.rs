//! RTSP 1.0 control plane.
//!
//! One [`MethodHandler`] per control connection turns parsed
//! [`RtspRequest`]s into [`RtspResponse`]s. The handler owns nothing media
//! related: it creates and updates sessions in the shared table and asks
//! the mount for codec config (DESCRIBE) or a fresh key frame (PLAY).
//!
//! Handled methods: OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN, plus
//! GET_PARAMETER and SET_PARAMETER as keep-alives. Other methods get
//! `501 Not Implemented`; see [`RtspMethod`].
//!
//! A DESCRIBE answer for the default mount looks like:
//!
//! ```text
//! RTSP/1.0 200 OK
//! CSeq: 2
//! Content-Base: rtsp://10.0.0.5:8554/stream/
//! Content-Type: application/sdp
//! Content-Length: 231
//! ```

pub mod handler;
pub mod request;
pub mod response;
pub mod sdp;

pub use handler::MethodHandler;
pub use request::{RtspMethod, RtspRequest};
pub use response::RtspResponse;
