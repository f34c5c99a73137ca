//! Typed broker-header values.
//!
//! AMQP (and most broker wire formats) represent headers as a dynamically
//! typed union. The retry engine only cares about one thing reliably: the
//! running retry count, which different producers may have stamped as an
//! int, a long, a float, or (legacy) a numeric string.

use std::fmt;

/// A broker header value, narrowed to the variants the retry engine and
/// consumer actually need to read.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Int(i32),
    Long(i64),
    Float(f64),
    Str(String),
    Other,
}

impl HeaderValue {
    /// Interpret this value as a retry count. Unknown types, negative
    /// numbers, and unparseable strings all default to `0` rather than
    /// failing the message: a malformed header must never block delivery.
    pub fn as_retry_count(&self) -> u32 {
        match self {
            HeaderValue::Int(n) => (*n).max(0) as u32,
            HeaderValue::Long(n) => (*n).max(0) as u32,
            HeaderValue::Float(f) => {
                if *f <= 0.0 || !f.is_finite() {
                    0
                } else {
                    *f as u32
                }
            }
            HeaderValue::Str(s) => s.trim().parse::<i64>().map(|n| n.max(0) as u32).unwrap_or(0),
            HeaderValue::Other => 0,
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Int(n) => write!(f, "{n}"),
            HeaderValue::Long(n) => write!(f, "{n}"),
            HeaderValue::Float(n) => write!(f, "{n}"),
            HeaderValue::Str(s) => write!(f, "{s}"),
            HeaderValue::Other => write!(f, "<unsupported>"),
        }
    }
}
