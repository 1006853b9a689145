use std::fmt::Write;

use crate::error::RtspError;

/// Response to one RTSP request.
///
/// Headers keep insertion order. `Server` is always first, `Content-Length`
/// is derived from the body at serialization time.
#[must_use]
#[derive(Debug)]
pub struct RtspResponse {
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// `Server` header value.
pub const SERVER_AGENT: &str = concat!("live-rtsp/", env!("CARGO_PKG_VERSION"));

impl RtspResponse {
    pub fn new(status_code: u16, status_text: &str) -> Self {
        Self {
            status_code,
            status_text: status_text.to_string(),
            headers: vec![("Server".to_string(), SERVER_AGENT.to_string())],
            body: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    /// Method outside [`RtspMethod::SUPPORTED`](super::RtspMethod::SUPPORTED).
    pub fn not_implemented() -> Self {
        Self::new(501, "Not Implemented")
    }

    /// Response carrying the status an error maps to.
    pub fn from_error(error: &RtspError) -> Self {
        let (code, text) = error.status();
        Self::new(code, text)
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Wire form: status line, headers, blank line, then the body if any.
    pub fn serialize(&self) -> String {
        let mut out = format!("RTSP/1.0 {} {}\r\n", self.status_code, self.status_text);
        for (name, value) in &self.headers {
            let _ = write!(out, "{name}: {value}\r\n");
        }
        match &self.body {
            Some(body) => {
                let _ = write!(out, "Content-Length: {}\r\n\r\n{body}", body.len());
            }
            None => out.push_str("\r\n"),
        }
        out
    }
}
