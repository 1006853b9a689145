use std::fmt;

use crate::error::{ParseErrorKind, RtspError};

/// RTSP method (RFC 2326 §10).
///
/// Closed set of what the server understands; anything else parses to
/// [`Unknown`](Self::Unknown) and is answered `501 Not Implemented`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtspMethod {
    Options,
    Describe,
    Setup,
    Play,
    Pause,
    Teardown,
    GetParameter,
    SetParameter,
    Unknown(String),
}

impl RtspMethod {
    /// Methods advertised in the `Public` header of OPTIONS responses.
    pub const SUPPORTED: [RtspMethod; 8] = [
        Self::Options,
        Self::Describe,
        Self::Setup,
        Self::Play,
        Self::Pause,
        Self::Teardown,
        Self::GetParameter,
        Self::SetParameter,
    ];

    pub fn parse(token: &str) -> Self {
        match token {
            "OPTIONS" => Self::Options,
            "DESCRIBE" => Self::Describe,
            "SETUP" => Self::Setup,
            "PLAY" => Self::Play,
            "PAUSE" => Self::Pause,
            "TEARDOWN" => Self::Teardown,
            "GET_PARAMETER" => Self::GetParameter,
            "SET_PARAMETER" => Self::SetParameter,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Options => "OPTIONS",
            Self::Describe => "DESCRIBE",
            Self::Setup => "SETUP",
            Self::Play => "PLAY",
            Self::Pause => "PAUSE",
            Self::Teardown => "TEARDOWN",
            Self::GetParameter => "GET_PARAMETER",
            Self::SetParameter => "SET_PARAMETER",
            Self::Unknown(method) => method,
        }
    }

    /// Comma-separated list for the `Public` header.
    pub fn public_header() -> String {
        Self::SUPPORTED
            .iter()
            .map(RtspMethod::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for RtspMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed RTSP request (RFC 2326 §6).
///
/// RTSP requests follow HTTP/1.1 syntax:
///
/// ```text
/// Method SP Request-URI SP RTSP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// [body]
/// ```
///
/// Header lookup is case-insensitive per RFC 2326 §4.2. The body, if any,
/// is read by the connection according to `Content-Length` and attached
/// with [`with_body`](Self::with_body).
#[derive(Debug)]
pub struct RtspRequest {
    pub method: RtspMethod,
    /// Request-URI (e.g. `rtsp://host:port/stream/track1`).
    pub uri: String,
    /// Protocol version (expected: `RTSP/1.0`).
    pub version: String,
    /// Headers as ordered (name, value) pairs. Names are stored as-received;
    /// lookups via [`get_header`](Self::get_header) are case-insensitive.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RtspRequest {
    /// Parse the request line and headers.
    ///
    /// Expects the header block up to and including the blank line. Returns
    /// [`RtspError::Parse`] on malformed input.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let mut lines = raw.lines();

        let request_line = lines
            .by_ref()
            .find(|line| !line.trim().is_empty())
            .ok_or(RtspError::Parse {
                kind: ParseErrorKind::EmptyRequest,
            })?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        let [method, uri, version] = parts[..] else {
            return Err(RtspError::Parse {
                kind: ParseErrorKind::InvalidRequestLine,
            });
        };

        if !version.starts_with("RTSP/") {
            return Err(RtspError::Parse {
                kind: ParseErrorKind::InvalidRequestLine,
            });
        }
        if version != "RTSP/1.0" {
            tracing::warn!(version, "client sent non-RTSP/1.0 version");
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }

            let (name, value) = line.split_once(':').ok_or(RtspError::Parse {
                kind: ParseErrorKind::InvalidHeader,
            })?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(RtspRequest {
            method: RtspMethod::parse(method),
            uri: uri.to_string(),
            version: version.to_string(),
            headers,
            body: Vec::new(),
        })
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Look up a header value by name (case-insensitive, per RFC 2326 §4.2).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Returns the CSeq header value, which numbers and orders RTSP
    /// request/response pairs (RFC 2326 §12.17).
    pub fn cseq(&self) -> Option<&str> {
        self.get_header("CSeq")
    }

    /// Announced body length. A missing header means no body.
    pub fn content_length(&self) -> crate::error::Result<usize> {
        match self.get_header("Content-Length") {
            None => Ok(0),
            Some(value) => value.parse().map_err(|_| RtspError::Parse {
                kind: ParseErrorKind::InvalidContentLength,
            }),
        }
    }

    /// Session id from the `Session` header, without parameters such as
    /// `;timeout=`.
    pub fn session_id(&self) -> Option<&str> {
        self.get_header("Session")
            .and_then(|value| value.split(';').next())
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}
