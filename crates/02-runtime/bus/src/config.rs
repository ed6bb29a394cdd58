//! Connection tunables.

use bitflags::bitflags;
use kdbus_wire::abi::{
    HELLO_ACCEPT_FD, NAME_ALLOW_REPLACEMENT, NAME_QUEUE, NAME_REPLACE_EXISTING, POOL_SIZE,
};
use serde::{Deserialize, Serialize};

use crate::error::{BusError, BusResult};
use crate::message::CredsMask;

/// Bounds of the per-connection memfd [`crate::SegmentCache`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentCacheConfig {
    /// Maximum number of idle segments kept for reuse.
    pub capacity: usize,
    /// Segments larger than this are shrunk (page aligned) when cached.
    pub item_size_max: usize,
}

impl Default for SegmentCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 32,
            item_size_max: 128 * 1024,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Receive pool size requested in the hello.
    pub pool_size: u64,
    /// Connection flags passed to the hello (`HELLO_*`).
    pub hello_flags: u64,
    /// Credentials the application wants attached to received messages.
    pub creds_mask: CredsMask,
    /// Upper bound of the delivery queue.
    pub max_queued: usize,
    pub memfd_cache: SegmentCacheConfig,
    /// Payloads at least this large are placed in a memfd instead of inline.
    pub memfd_min_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            pool_size: POOL_SIZE,
            hello_flags: HELLO_ACCEPT_FD,
            creds_mask: CredsMask::empty(),
            max_queued: 64 * 1024,
            memfd_cache: SegmentCacheConfig::default(),
            memfd_min_size: 512 * 1024,
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> BusResult<()> {
        if self.pool_size == 0 || self.pool_size % page_size() as u64 != 0 {
            return Err(BusError::InvalidConfig(
                "pool_size must be a non-zero multiple of the page size",
            ));
        }
        if self.max_queued == 0 {
            return Err(BusError::InvalidConfig("max_queued must be non-zero"));
        }
        if self.memfd_cache.item_size_max == 0 {
            return Err(BusError::InvalidConfig("memfd_cache.item_size_max must be non-zero"));
        }
        if self.memfd_min_size == 0 {
            return Err(BusError::InvalidConfig("memfd_min_size must be non-zero"));
        }
        Ok(())
    }

    /// Attach flags requested from the kernel for the configured mask.
    pub fn attach_flags(&self) -> u64 {
        self.creds_mask.attach_flags()
    }
}

bitflags! {
    /// Flags of a well-known name request, as applications express them.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct RequestNameFlags: u64 {
        const ALLOW_REPLACEMENT = 1 << 0;
        const REPLACE_EXISTING = 1 << 1;
        const DO_NOT_QUEUE = 1 << 2;
    }
}

impl RequestNameFlags {
    /// Kernel `NAME_*` flags. Requests queue unless told not to.
    pub fn kernel_flags(self) -> u64 {
        let mut flags = 0;
        if self.contains(Self::ALLOW_REPLACEMENT) {
            flags |= NAME_ALLOW_REPLACEMENT;
        }
        if self.contains(Self::REPLACE_EXISTING) {
            flags |= NAME_REPLACE_EXISTING;
        }
        if !self.contains(Self::DO_NOT_QUEUE) {
            flags |= NAME_QUEUE;
        }
        flags
    }
}

pub(crate) fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

pub(crate) fn page_align(len: usize) -> usize {
    let page = page_size();
    len.div_ceil(page) * page
}
