//! W3C `traceparent` header handling.
//!
//! Incoming requests and event payloads may carry a trace context; we keep
//! only the pieces the log pipeline stores (trace id, parent span id, flags).

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TraceParseError {
    #[error("traceparent must have four dash-separated fields")]
    FieldCount,
    #[error("invalid field length")]
    FieldLength,
    #[error("non-hexadecimal characters in traceparent")]
    NotHex,
    #[error("version ff is forbidden")]
    ForbiddenVersion,
    #[error("all-zero trace or span id")]
    ZeroId,
}

/// A parsed `traceparent` value: `00-<32 hex trace>-<16 hex span>-<2 hex flags>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceParent {
    pub version: u8,
    pub trace_id: String,
    pub span_id: String,
    pub flags: u8,
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

impl TraceParent {
    /// Parses a header value. Unknown versions other than `ff` are accepted,
    /// per the W3C forward-compatibility rule.
    pub fn parse(value: &str) -> Result<Self, TraceParseError> {
        let mut parts = value.trim().splitn(4, '-');
        let (version, trace_id, span_id, flags) = match (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) {
            (Some(v), Some(t), Some(s), Some(f)) => (v, t, s, f),
            _ => return Err(TraceParseError::FieldCount),
        };

        if version.len() != 2 || trace_id.len() != 32 || span_id.len() != 16 || flags.len() < 2 {
            return Err(TraceParseError::FieldLength);
        }
        if ![version, trace_id, span_id, &flags[..2]]
            .iter()
            .all(|s| is_lower_hex(s))
        {
            return Err(TraceParseError::NotHex);
        }
        if version == "ff" {
            return Err(TraceParseError::ForbiddenVersion);
        }
        if trace_id.bytes().all(|b| b == b'0') || span_id.bytes().all(|b| b == b'0') {
            return Err(TraceParseError::ZeroId);
        }

        Ok(Self {
            version: u8::from_str_radix(version, 16).map_err(|_| TraceParseError::NotHex)?,
            trace_id: trace_id.to_owned(),
            span_id: span_id.to_owned(),
            flags: u8::from_str_radix(&flags[..2], 16).map_err(|_| TraceParseError::NotHex)?,
        })
    }
}

impl fmt::Display for TraceParent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}-{}-{}-{:02x}",
            self.version, self.trace_id, self.span_id, self.flags
        )
    }
}
