//! Cursor-based builder for kernel item lists.
//!
//! Callers size the buffer exactly up front (see [`crate::abi::item_footprint`])
//! and then append one item per call. Each append aligns the cursor to 8
//! bytes, writes `{size, type}` followed by the payload, and advances by the
//! item's unpadded size. Running past the buffer is a sizing bug in the caller
//! and panics.

use crate::abi::{
    align8, item_size, ItemType, AUDIT_PAYLOAD_SIZE, BLOOM_SIZE, CREDS_PAYLOAD_SIZE,
    ID_CHANGE_PAYLOAD_SIZE, ITEM_HEADER_SIZE, KMSG_HEADER_SIZE, MEMFD_PAYLOAD_SIZE,
    NAME_CHANGE_FIXED_SIZE, TIMESTAMP_PAYLOAD_SIZE, VEC_PAYLOAD_SIZE,
};
use crate::buf::KmsgBuf;
use std::os::fd::RawFd;

/// Process credentials as carried by a creds item.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ItemCreds {
    pub uid: u64,
    pub gid: u64,
    pub pid: u64,
    pub tid: u64,
    /// Process start time in nanoseconds.
    pub starttime: u64,
}

/// Receive timestamps as carried by a timestamp item.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ItemTimestamp {
    pub monotonic_ns: u64,
    pub realtime_ns: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ItemAudit {
    pub sessionid: u64,
    pub loginuid: u64,
}

/// Fixed header of a `kdbus_msg`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KmsgHeader {
    pub size: u64,
    pub flags: u64,
    pub dst_id: u64,
    pub src_id: u64,
    pub payload_type: u64,
    pub cookie: u64,
    /// `timeout_ns` on send, `cookie_reply` on kernel notifications.
    pub timeout_or_reply: u64,
}

impl KmsgHeader {
    /// Writes the header into the first [`KMSG_HEADER_SIZE`] bytes of `out`.
    pub fn write(&self, out: &mut [u8]) {
        let fields = [
            self.size,
            self.flags,
            self.dst_id,
            self.src_id,
            self.payload_type,
            self.cookie,
            self.timeout_or_reply,
        ];
        for (i, value) in fields.into_iter().enumerate() {
            put_u64(out, i * 8, value);
        }
    }
}

/// Appends aligned items to a pre-sized [`KmsgBuf`].
pub struct ItemWriter {
    buf: KmsgBuf,
    cursor: usize,
}

impl ItemWriter {
    /// Starts writing items at `start` within `buf`.
    pub fn new(buf: KmsgBuf, start: usize) -> Self {
        assert!(start <= buf.len(), "start {start} beyond buffer");
        Self { buf, cursor: start }
    }

    /// Allocates a zeroed message buffer of `bound` bytes with the cursor
    /// placed right after the kmsg header. `None` on allocation failure.
    pub fn for_kmsg(bound: usize) -> Option<Self> {
        let buf = KmsgBuf::try_zeroed(bound.max(KMSG_HEADER_SIZE))?;
        Some(Self::new(buf, KMSG_HEADER_SIZE))
    }

    /// Offset one past the last byte written so far.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Trims the buffer to the bytes actually written and hands it back.
    pub fn finish(mut self) -> KmsgBuf {
        self.buf.truncate(self.cursor);
        self.buf
    }

    fn begin(&mut self, ty: ItemType, payload_len: usize) -> &mut [u8] {
        let start = align8(self.cursor);
        let size = item_size(payload_len);
        let end = start + size;
        assert!(
            end <= self.buf.len(),
            "item writer overflow: {ty:?} needs {start}..{end}, buffer holds {}",
            self.buf.len()
        );
        let bytes = self.buf.as_mut_bytes();
        put_u64(bytes, start, size as u64);
        put_u64(bytes, start + 8, ty as u64);
        self.cursor = end;
        &mut bytes[start + ITEM_HEADER_SIZE..end]
    }

    fn push_u64s(&mut self, ty: ItemType, values: &[u64]) {
        let payload = self.begin(ty, values.len() * 8);
        for (i, value) in values.iter().enumerate() {
            put_u64(payload, i * 8, *value);
        }
    }

    /// Appends a vector pointing at `data` in this process.
    pub fn push_payload_vec(&mut self, data: &[u8]) {
        self.push_vec_raw(data.as_ptr() as u64, data.len() as u64);
    }

    /// Appends a vector with a null address: `size` bytes of zeroes the
    /// kernel passes through without reading memory.
    pub fn push_zero_vec(&mut self, size: u64) {
        self.push_vec_raw(0, size);
    }

    fn push_vec_raw(&mut self, address: u64, size: u64) {
        debug_assert_eq!(VEC_PAYLOAD_SIZE, 16);
        self.push_u64s(ItemType::PayloadVec, &[size, address]);
    }

    /// Appends a payload slice as delivered by the kernel: `offset` is
    /// relative to the start of the message in the receiver's pool, or
    /// [`crate::abi::PAYLOAD_OFF_ZERO`] for zero padding.
    pub fn push_payload_off(&mut self, offset: u64, size: u64) {
        self.push_u64s(ItemType::PayloadOff, &[size, offset]);
    }

    pub fn push_payload_memfd(&mut self, fd: RawFd, size: u64) {
        let payload = self.begin(ItemType::PayloadMemfd, MEMFD_PAYLOAD_SIZE);
        put_u64(payload, 0, size);
        payload[8..12].copy_from_slice(&fd.to_ne_bytes());
    }

    /// Appends a NUL-terminated string item (destination, make name, comm, ...).
    pub fn push_str(&mut self, ty: ItemType, value: &str) {
        let payload = self.begin(ty, value.len() + 1);
        payload[..value.len()].copy_from_slice(value.as_bytes());
        payload[value.len()] = 0;
    }

    pub fn push_dst_name(&mut self, name: &str) {
        self.push_str(ItemType::DstName, name);
    }

    /// Appends an item carrying opaque bytes (cmdline, caps, name lists).
    pub fn push_bytes(&mut self, ty: ItemType, value: &[u8]) {
        self.begin(ty, value.len()).copy_from_slice(value);
    }

    /// Reserves a bloom item and returns its [`BLOOM_SIZE`] byte filter for
    /// the caller to fill in place.
    pub fn push_bloom(&mut self) -> &mut [u8] {
        self.begin(ItemType::Bloom, BLOOM_SIZE)
    }

    pub fn push_fds(&mut self, fds: &[RawFd]) {
        let payload = self.begin(ItemType::Fds, fds.len() * 4);
        for (chunk, fd) in payload.chunks_exact_mut(4).zip(fds) {
            chunk.copy_from_slice(&fd.to_ne_bytes());
        }
    }

    pub fn push_creds(&mut self, creds: &ItemCreds) {
        debug_assert_eq!(CREDS_PAYLOAD_SIZE, 40);
        self.push_u64s(
            ItemType::Creds,
            &[creds.uid, creds.gid, creds.pid, creds.tid, creds.starttime],
        );
    }

    pub fn push_timestamp(&mut self, ts: &ItemTimestamp) {
        debug_assert_eq!(TIMESTAMP_PAYLOAD_SIZE, 16);
        self.push_u64s(ItemType::Timestamp, &[ts.monotonic_ns, ts.realtime_ns]);
    }

    pub fn push_audit(&mut self, audit: &ItemAudit) {
        debug_assert_eq!(AUDIT_PAYLOAD_SIZE, 16);
        self.push_u64s(ItemType::Audit, &[audit.sessionid, audit.loginuid]);
    }

    /// Appends a name add/remove/change notification.
    pub fn push_name_change(
        &mut self,
        ty: ItemType,
        old_id: u64,
        new_id: u64,
        flags: u64,
        name: &str,
    ) {
        let payload = self.begin(ty, NAME_CHANGE_FIXED_SIZE + name.len() + 1);
        put_u64(payload, 0, old_id);
        put_u64(payload, 8, new_id);
        put_u64(payload, 16, flags);
        let name_at = NAME_CHANGE_FIXED_SIZE;
        payload[name_at..name_at + name.len()].copy_from_slice(name.as_bytes());
        payload[name_at + name.len()] = 0;
    }

    /// Appends an id add/remove notification.
    pub fn push_id_change(&mut self, ty: ItemType, id: u64, flags: u64) {
        debug_assert_eq!(ID_CHANGE_PAYLOAD_SIZE, 16);
        self.push_u64s(ty, &[id, flags]);
    }

    /// Appends an item without payload (reply timeout / reply dead).
    pub fn push_empty(&mut self, ty: ItemType) {
        self.begin(ty, 0);
    }
}

#[inline]
pub(crate) fn put_u64(out: &mut [u8], offset: usize, value: u64) {
    out[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
}
