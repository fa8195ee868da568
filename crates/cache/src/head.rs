//! HTTP response heads
//!
//! Field order matters here: the stored and signed forms of a head are byte
//! deterministic, so headers live in an ordered list, not a map, and
//! canonicalization produces a fixed ordering.

use cachecraft_core::{Error, Result};

/// Cache-protocol header names.
pub mod field {
    pub const VERSION: &str = "X-Ouinet-Version";
    pub const URI: &str = "X-Ouinet-URI";
    pub const INJECTION: &str = "X-Ouinet-Injection";
    pub const BSIGS: &str = "X-Ouinet-BSigs";
    pub const SIG0: &str = "X-Ouinet-Sig0";
    pub const SIG1: &str = "X-Ouinet-Sig1";
    pub const DATA_SIZE: &str = "X-Ouinet-Data-Size";
    pub const DIGEST: &str = "Digest";
}

/// Protocol version carried in `X-Ouinet-Version`.
pub const PROTOCOL_VERSION: u32 = 3;

/// Hop-by-hop and framing fields; never stored, never signed.
const STRIPPED_FIELDS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// An HTTP response head with ordered fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn new(status: u16) -> Self {
        Self { status, reason: reason_phrase(status).to_string(), headers: Vec::new() }
    }

    /// Parse from raw bytes; returns the head and the number of bytes it
    /// occupied (through the blank line).
    pub fn parse(raw: &[u8]) -> Result<(Self, usize)> {
        let mut header_buf = [httparse::EMPTY_HEADER; 64];
        let mut response = httparse::Response::new(&mut header_buf);
        let consumed = match response.parse(raw) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => {
                return Err(Error::protocol("incomplete response head"))
            }
            Err(err) => return Err(Error::protocol(err)),
        };
        let status = response.code.ok_or_else(|| Error::protocol("missing status code"))?;
        let reason = response.reason.unwrap_or_default().to_string();
        let headers = response
            .headers
            .iter()
            .map(|h| {
                let value = std::str::from_utf8(h.value)
                    .map_err(|_| Error::protocol("non-ascii header value"))?;
                Ok((h.name.to_string(), value.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((Self { status, reason, headers }, consumed))
    }

    /// Serialize as `HTTP/1.1 <status> <reason>` plus fields and the blank
    /// line.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", self.status, self.reason).as_bytes());
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    /// First value of a field, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace a field, or append it when absent.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some((_, v)) => *v = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// The canonical head: hop-by-hop and framing fields stripped, the
    /// protocol's own fields first in a fixed order, everything else sorted
    /// by lowercased name (stable for repeated fields).
    pub fn canonical(&self) -> ResponseHead {
        let leading = [field::VERSION, field::URI, field::INJECTION];
        let mut headers: Vec<(String, String)> = Vec::new();
        for name in leading {
            for (n, v) in &self.headers {
                if n.eq_ignore_ascii_case(name) {
                    headers.push((name.to_string(), v.clone()));
                }
            }
        }
        let mut rest: Vec<(String, String)> = self
            .headers
            .iter()
            .filter(|(n, _)| {
                let lower = n.to_ascii_lowercase();
                !STRIPPED_FIELDS.contains(&lower.as_str())
                    && !leading.iter().any(|l| l.eq_ignore_ascii_case(n))
                    && !n.eq_ignore_ascii_case(field::BSIGS)
                    && !n.eq_ignore_ascii_case(field::SIG0)
                    && !n.eq_ignore_ascii_case(field::SIG1)
                    && !n.eq_ignore_ascii_case(field::DATA_SIZE)
                    && !n.eq_ignore_ascii_case(field::DIGEST)
            })
            .cloned()
            .collect();
        rest.sort_by(|(a, _), (b, _)| a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase()));
        headers.extend(rest);
        ResponseHead { status: self.status, reason: self.reason.clone(), headers }
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "",
    }
}
