use thiserror::Error;

pub type WireResult<T> = Result<T, WireError>;

/// Errors raised while decoding kernel records.
///
/// Encoding never fails: writers are sized up front and overrunning them is a
/// programming error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("record truncated: need {need} bytes at offset {offset}, have {have}")]
    Truncated {
        offset: usize,
        need: usize,
        have: usize,
    },

    #[error("item at offset {offset} declares invalid size {size}")]
    BadItemSize { offset: usize, size: u64 },

    #[error("item {tag:#x} carries a string that is not NUL-terminated UTF-8")]
    BadString { tag: u64 },

    #[error("{0:?} starts with \":1.\" but is not followed by a decimal id")]
    BadUniqueName(String),

    #[error("item {tag:#x} payload is {len} bytes, expected at least {expected}")]
    ShortPayload {
        tag: u64,
        len: usize,
        expected: usize,
    },
}
