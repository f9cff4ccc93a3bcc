//! UTF-8 validation for text messages and close reasons

use crate::error::{Error, Result};

/// Validate that the input is well-formed UTF-8.
#[inline]
pub fn validate_utf8(data: &[u8]) -> bool {
    simdutf8::basic::from_utf8(data).is_ok()
}

/// Validate and borrow the input as a `&str`.
#[inline]
pub fn parse_utf8(data: &[u8]) -> Result<&str> {
    simdutf8::basic::from_utf8(data).map_err(|_| Error::InvalidUtf8)
}
