//! Receive pool mapping and the leases guarding references into it.
//!
//! Received messages point into the pool instead of copying. Each kernel
//! buffer handed out by a receive is tracked as a lease with a fresh
//! generation; body parts remember that generation. Releasing the lease
//! retires the generation, so later reads through a stale part fail with
//! [`BusError::StalePoolRef`] instead of seeing whatever the kernel placed
//! there next.

use std::collections::HashMap;
use std::os::fd::BorrowedFd;
use std::sync::Arc;

use memmap2::{Mmap, MmapOptions};
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::error::{BusError, BusResult};
use crate::message::PartSource;

/// A body part's bytes inside the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolSpan {
    pub generation: u64,
    pub offset: u64,
    pub len: usize,
}

#[derive(Debug, Default)]
struct LeaseTable {
    next_generation: u64,
    /// Live generation → offset of the kernel buffer.
    live: HashMap<u64, u64>,
    /// Buffers whose lease was dropped and still need a kernel FREE.
    pending_free: SmallVec<[u64; 4]>,
}

/// Read-only mapping of a connection's receive pool.
#[derive(Debug)]
pub struct Pool {
    map: Mmap,
    leases: Arc<Mutex<LeaseTable>>,
}

impl Pool {
    /// Maps the first `size` bytes of `fd` read-only.
    pub fn map(fd: BorrowedFd<'_>, size: u64) -> BusResult<Self> {
        let len = usize::try_from(size).map_err(|_| BusError::Unsupported("pool size"))?;
        // SAFETY: the kernel owns the pool contents; this process only ever
        // reads them, and only inside buffers it currently holds a lease on.
        let map = unsafe { MmapOptions::new().len(len).map(&fd)? };
        Ok(Self {
            map,
            leases: Arc::new(Mutex::new(LeaseTable::default())),
        })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    /// Starts tracking the kernel buffer at `offset`.
    pub(crate) fn lease(&self, offset: u64) -> PoolLease {
        let mut table = self.leases.lock();
        table.next_generation += 1;
        let generation = table.next_generation;
        table.live.insert(generation, offset);
        PoolLease {
            offset,
            generation,
            table: Arc::clone(&self.leases),
        }
    }

    /// Number of kernel buffers currently held.
    pub fn live_leases(&self) -> usize {
        self.leases.lock().live.len()
    }

    /// Offsets of buffers whose lease was dropped since the last call.
    pub(crate) fn take_pending_frees(&self) -> SmallVec<[u64; 4]> {
        std::mem::take(&mut self.leases.lock().pending_free)
    }

    pub fn span_bytes(&self, span: &PoolSpan) -> BusResult<&[u8]> {
        if !self.leases.lock().live.contains_key(&span.generation) {
            return Err(BusError::StalePoolRef);
        }
        let start = usize::try_from(span.offset).map_err(|_| BusError::Malformed("pool span"))?;
        start
            .checked_add(span.len)
            .and_then(|end| self.map.get(start..end))
            .ok_or(BusError::Malformed("pool span outside the pool"))
    }
}

impl PartSource for Pool {
    fn pool_bytes(&self, span: &PoolSpan) -> BusResult<&[u8]> {
        self.span_bytes(span)
    }
}

/// Claim on one kernel buffer in the pool.
///
/// Dropping the lease retires its generation and queues the buffer for
/// FREE on the connection's next call; [`crate::Connection::release`] frees
/// it right away.
#[derive(Debug)]
pub struct PoolLease {
    offset: u64,
    generation: u64,
    table: Arc<Mutex<LeaseTable>>,
}

impl PoolLease {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn span(&self, offset: u64, len: usize) -> PoolSpan {
        PoolSpan {
            generation: self.generation,
            offset,
            len,
        }
    }

    /// Retires the generation and returns the buffer offset to free.
    pub(crate) fn release(self) -> u64 {
        self.table.lock().live.remove(&self.generation);
        self.offset
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        if table.live.remove(&self.generation).is_some() {
            table.pending_free.push(self.offset);
        }
    }
}
