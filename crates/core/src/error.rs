//! Error types for the live RTSP server.

use std::fmt;

/// Errors that can occur in the RTSP server library.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Protocol**: [`Parse`](Self::Parse), [`UnsupportedTransport`](Self::UnsupportedTransport)
///   for malformed or unsupported RTSP requests.
/// - **Transport**: [`Io`](Self::Io) for socket and network failures.
/// - **Session**: [`SessionNotFound`](Self::SessionNotFound).
/// - **Encoder state**: [`CodecConfigUnavailable`](Self::CodecConfigUnavailable),
///   [`EncoderDisconnected`](Self::EncoderDisconnected).
/// - **Resources**: [`PortRangeExhausted`](Self::PortRangeExhausted).
/// - **Server**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning).
/// - **Mount**: [`MountNotFound`](Self::MountNotFound).
/// - **State**: [`MethodNotValidInState`](Self::MethodNotValidInState).
/// - **Configuration**: [`InvalidConfig`](Self::InvalidConfig).
///
/// [`status`](Self::status) turns any of these into the RTSP status line
/// sent back to the client.
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No session with the given ID exists in the [`SessionManager`](crate::session::SessionManager).
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The `Transport` header asked for something other than unicast UDP
    /// or TCP interleaved RTP/AVP.
    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// SPS/PPS were not available before the DESCRIBE wait expired.
    #[error("codec configuration (SPS/PPS) not available")]
    CodecConfigUnavailable,

    /// The upstream encoder closed its frame queue.
    #[error("encoder disconnected")]
    EncoderDisconnected,

    /// [`Server::start`](crate::Server::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// No even/odd UDP port pair could be bound inside the configured range.
    #[error("no free RTP/RTCP port pair in {min}-{max}")]
    PortRangeExhausted { min: u16, max: u16 },

    /// Request URI does not address the served mount.
    #[error("mount not found: {0}")]
    MountNotFound(String),

    /// The request is well formed but not allowed in the session's state,
    /// e.g. changing the transport of a playing session.
    #[error("method not valid in this state: {0}")]
    MethodNotValidInState(String),

    /// A [`ServerConfig`](crate::ServerConfig) value outside what the server can serve.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RtspError {
    /// RTSP status code and reason phrase reported to the client for this error.
    pub fn status(&self) -> (u16, &'static str) {
        match self {
            Self::Parse { .. } => (400, "Bad Request"),
            Self::MountNotFound(_) => (404, "Not Found"),
            Self::SessionNotFound(_) => (454, "Session Not Found"),
            Self::MethodNotValidInState(_) => (455, "Method Not Valid in This State"),
            Self::UnsupportedTransport(_) => (461, "Unsupported Transport"),
            Self::PortRangeExhausted { .. } | Self::NotStarted | Self::EncoderDisconnected => {
                (503, "Service Unavailable")
            }
            Self::Io(_)
            | Self::CodecConfigUnavailable
            | Self::AlreadyRunning
            | Self::InvalidConfig(_) => {
                (500, "Internal Server Error")
            }
        }
    }
}

/// Specific kind of RTSP parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// `Content-Length` was present but not a number.
    InvalidContentLength,
    /// Header block or body exceeded the per-message limit.
    MessageTooLarge,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidContentLength => write!(f, "invalid Content-Length"),
            Self::MessageTooLarge => write!(f, "message too large"),
        }
    }
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        let parse = RtspError::Parse {
            kind: ParseErrorKind::InvalidRequestLine,
        };
        assert_eq!(parse.status().0, 400);
        assert_eq!(RtspError::SessionNotFound("x".into()).status().0, 454);
        assert_eq!(RtspError::UnsupportedTransport("x".into()).status().0, 461);
        assert_eq!(RtspError::MethodNotValidInState("x".into()).status().0, 455);
        assert_eq!(RtspError::CodecConfigUnavailable.status().0, 500);
        assert_eq!(
            RtspError::PortRangeExhausted { min: 5000, max: 5001 }.status().0,
            503
        );
    }
}
