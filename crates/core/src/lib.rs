//! Live H.264 RTSP server.
//!
//! Takes the output of an external H.264 encoder and serves it to any
//! number of RTSP clients over RTP, either on per-session UDP port pairs
//! or interleaved on the RTSP TCP connection.
//!
//! ```no_run
//! use live_rtsp::{NalUnit, Server};
//!
//! let mut server = Server::new("0.0.0.0:8554");
//! server.start()?;
//! let frames = server.frame_sender();
//! frames.send(NalUnit::key_frame(vec![0, 0, 0, 1, 0x65, 0x88], 0))?;
//! # Ok::<(), live_rtsp::RtspError>(())
//! ```

pub mod encoder;
pub mod error;
pub mod media;
pub mod mount;
pub mod pipeline;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

pub use encoder::{Encoder, FrameSender, OutputFormat};
pub use error::{Result, RtspError};
pub use media::NalUnit;
pub use server::{PACKET_SIZE_RANGE, Server, ServerConfig, Viewer};
