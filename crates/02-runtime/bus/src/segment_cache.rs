//! Bounded pool of reusable memfd segments.
//!
//! Large payloads travel in memfds; creating and mapping one per message is
//! costly, so released segments are parked here for the next writer. The
//! lock only guards the entry list. Kernel calls and `munmap` happen with it
//! released, which is why [`SegmentCache::release`] reserves its slot before
//! shrinking an oversized segment.

use std::io;
use std::os::fd::{AsFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};

use parking_lot::Mutex;

use crate::config::{page_align, SegmentCacheConfig};
use crate::error::BusResult;
use crate::kernel::Kernel;
use crate::memfd::Mapping;

/// A memfd plus its (optional) mapping in this process.
#[derive(Debug)]
pub struct Segment {
    memfd: OwnedFd,
    map: Option<Mapping>,
    size: usize,
}

impl Segment {
    /// Wraps a fresh, unmapped memfd.
    pub fn new(memfd: OwnedFd) -> Self {
        Self {
            memfd,
            map: None,
            size: 0,
        }
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.memfd.as_fd()
    }

    /// Bytes currently mapped; 0 while unmapped.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn mapping(&self) -> Option<&Mapping> {
        self.map.as_ref()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.map.as_ref().map_or(&[], |map| &map.as_slice()[..self.size])
    }

    /// Makes at least `len` bytes writable, growing the memfd if needed, and
    /// returns the first `len` of them.
    pub fn reserve<K: Kernel + ?Sized>(&mut self, kernel: &K, len: usize) -> BusResult<&mut [u8]> {
        let size = self.size;
        let map = match self.map.take() {
            Some(map) if size >= len => map,
            _ => {
                self.size = 0;
                kernel.memfd_set_size(self.memfd.as_fd(), len as u64)?;
                let map = Mapping::map(self.memfd.as_fd(), len, true)?;
                self.size = len;
                map
            }
        };
        Ok(&mut self.map.insert(map).as_mut_slice()[..len])
    }

    /// Maps the first `len` bytes read-only unless already mapped.
    pub fn map_readonly(&mut self, len: usize) -> BusResult<()> {
        if self.map.is_none() && len > 0 {
            self.map = Some(Mapping::map(self.memfd.as_fd(), len, false)?);
            self.size = len;
        }
        Ok(())
    }

    fn shrink<K: Kernel + ?Sized>(&mut self, kernel: &K, cap: usize) -> io::Result<()> {
        kernel.memfd_set_size(self.memfd.as_fd(), cap as u64)?;
        if let Some(map) = self.map.as_mut() {
            map.truncate(cap)?;
        }
        self.size = cap;
        Ok(())
    }

    /// Unmaps and hands the descriptor back without closing it.
    pub fn into_raw_fd(self) -> RawFd {
        drop(self.map);
        self.memfd.into_raw_fd()
    }
}

/// What [`SegmentCache::release`] did with a segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Released {
    /// The cache was full; the segment was unmapped and closed.
    Closed,
    Cached,
    /// Cached after shrinking from `from` bytes to the per-entry maximum.
    Capped { from: usize, to: usize },
}

#[derive(Default)]
struct CacheState {
    entries: Vec<Segment>,
    /// Slots promised to releases that are shrinking outside the lock.
    reserved: usize,
}

pub struct SegmentCache {
    config: SegmentCacheConfig,
    state: Mutex<CacheState>,
}

impl SegmentCache {
    pub fn new(config: SegmentCacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn config(&self) -> SegmentCacheConfig {
        self.config
    }

    /// Number of idle segments held.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes the most recently cached segment, or a fresh unmapped memfd from
    /// the kernel when none is idle.
    pub fn acquire<K: Kernel + ?Sized>(&self, kernel: &K) -> BusResult<Segment> {
        if let Some(segment) = self.state.lock().entries.pop() {
            log::trace!("segment cache hit ({} bytes mapped)", segment.size);
            return Ok(segment);
        }
        let memfd = kernel.memfd_new()?;
        log::trace!("segment cache miss, new memfd");
        Ok(Segment::new(memfd))
    }

    /// Returns a segment for reuse.
    pub fn release<K: Kernel + ?Sized>(&self, kernel: &K, mut segment: Segment) -> Released {
        {
            let mut state = self.state.lock();
            if state.entries.len() + state.reserved >= self.config.capacity {
                drop(state);
                log::trace!("segment cache full, closing segment");
                drop(segment);
                return Released::Closed;
            }
            state.reserved += 1;
        }

        let cap = page_align(self.config.item_size_max);
        let mut outcome = Released::Cached;
        if segment.size > cap {
            let from = segment.size;
            match segment.shrink(kernel, cap) {
                Ok(()) => outcome = Released::Capped { from, to: cap },
                Err(err) => {
                    log::warn!("failed to shrink cached segment from {from} bytes: {err}");
                    self.state.lock().reserved -= 1;
                    drop(segment);
                    return Released::Closed;
                }
            }
        }

        let mut state = self.state.lock();
        state.reserved -= 1;
        state.entries.push(segment);
        outcome
    }

    /// Closes every idle segment; returns how many were dropped.
    pub fn flush(&self) -> usize {
        let entries = std::mem::take(&mut self.state.lock().entries);
        entries.len()
    }
}

impl std::fmt::Debug for SegmentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SegmentCache")
            .field("config", &self.config)
            .field("entries", &state.entries.len())
            .field("reserved", &state.reserved)
            .finish()
    }
}
