//! Unique connection names: `":1."` followed by the decimal connection id.

use crate::error::{WireError, WireResult};

pub const UNIQUE_NAME_PREFIX: &str = ":1.";

/// Parses a bus name into a connection id.
///
/// Returns `Ok(None)` for names without the unique prefix (well-known names)
/// and an error when the prefix is present but the remainder is not a plain
/// decimal `u64`.
pub fn parse_unique_name(name: &str) -> WireResult<Option<u64>> {
    let Some(digits) = name.strip_prefix(UNIQUE_NAME_PREFIX) else {
        return Ok(None);
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(WireError::BadUniqueName(name.to_owned()));
    }
    digits
        .parse::<u64>()
        .map(Some)
        .map_err(|_| WireError::BadUniqueName(name.to_owned()))
}

/// Renders a connection id as its unique name.
pub fn format_unique_name(id: u64) -> String {
    format!("{UNIQUE_NAME_PREFIX}{id}")
}
