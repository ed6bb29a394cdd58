//! Aligned, heap-backed buffers for kernel records.
//!
//! The kernel requires every command and message to start on an 8-byte
//! boundary. Backing the buffer with `u64` words gives that alignment without
//! a custom allocator while still exposing a plain byte view.

use crate::abi::{align8, ALIGN};
use std::mem;

/// Byte buffer whose start address is 8-byte aligned.
///
/// The logical length may be shorter than the allocation; the writer trims
/// the length once the actual record size is known.
#[derive(Clone, Default)]
pub struct KmsgBuf {
    words: Vec<u64>,
    len: usize,
}

impl KmsgBuf {
    /// Allocates a zeroed buffer of `len` bytes.
    ///
    /// Returns `None` when the allocation cannot be satisfied, letting callers
    /// report out-of-memory before any kernel call is made.
    pub fn try_zeroed(len: usize) -> Option<Self> {
        let words_len = align8(len) / ALIGN;
        let mut words = Vec::new();
        words.try_reserve_exact(words_len).ok()?;
        words.resize(words_len, 0);
        Some(Self { words, len })
    }

    /// Allocates a zeroed buffer, aborting on allocation failure like `Vec`.
    pub fn zeroed(len: usize) -> Self {
        Self {
            words: vec![0; align8(len) / ALIGN],
            len,
        }
    }

    /// Copies `bytes` into a fresh aligned buffer.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = Self::zeroed(bytes.len());
        buf.as_mut_bytes().copy_from_slice(bytes);
        buf
    }

    /// Logical length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes available before the allocation has to grow.
    pub fn capacity(&self) -> usize {
        self.words.len() * mem::size_of::<u64>()
    }

    /// Shrinks the logical length; the allocation is retained.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds the capacity.
    pub fn truncate(&mut self, len: usize) {
        assert!(
            len <= self.capacity(),
            "cannot set length {len} beyond capacity {}",
            self.capacity()
        );
        self.len = len;
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.words.as_ptr() as *const u8
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.words.as_mut_ptr() as *mut u8
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: `words` owns at least `len` initialised bytes and u8 has no
        // alignment requirement.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len) }
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        let len = self.len;
        // SAFETY: see `as_bytes`; the mutable borrow of `self` is exclusive.
        unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr(), len) }
    }
}

impl std::fmt::Debug for KmsgBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KmsgBuf")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}
