//! Control command buffers: hello and bus/namespace creation.
//!
//! Commands share the item encoding of messages: a fixed header followed by
//! items. Each administrative command here carries exactly one string item
//! and is sized exactly for it.

use crate::abi::{align8, item_size, ItemType, BLOOM_SIZE};
use crate::buf::KmsgBuf;
use crate::error::WireResult;
use crate::reader::{read_u64, Item, ItemIter};
use crate::writer::{put_u64, ItemWriter};

/// Fixed part of `kdbus_cmd_hello`:
/// size, conn_flags, attach_flags, bus_flags, id, bloom_size, pool_size, id128.
pub const HELLO_FIXED_SIZE: usize = 72;

/// Fixed part of `kdbus_cmd_bus_make`: size, flags, bus_flags, bloom_size.
pub const BUS_MAKE_FIXED_SIZE: usize = 32;

/// Fixed part of `kdbus_cmd_ns_make`: size, flags.
pub const NS_MAKE_FIXED_SIZE: usize = 16;

const HELLO_CONN_FLAGS: usize = 8;
const HELLO_ATTACH_FLAGS: usize = 16;
const HELLO_BUS_FLAGS: usize = 24;
const HELLO_ID: usize = 32;
const HELLO_BLOOM_SIZE: usize = 40;
const HELLO_POOL_SIZE: usize = 48;
const HELLO_ID128: usize = 56;

/// Values the kernel writes back into a hello command.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HelloReply {
    pub conn_flags: u64,
    pub bus_flags: u64,
    pub id: u64,
    pub bloom_size: u64,
    pub id128: [u8; 16],
}

/// In/out buffer for the hello ioctl.
#[derive(Debug, Clone)]
pub struct HelloCmd {
    buf: KmsgBuf,
}

impl HelloCmd {
    /// Hello for an ordinary connection.
    pub fn new(conn_flags: u64, attach_flags: u64, pool_size: u64) -> Self {
        Self::build(conn_flags, attach_flags, pool_size, None)
    }

    /// Hello registering an activator that holds `name` until the real
    /// service connects.
    pub fn starter(conn_flags: u64, pool_size: u64, name: &str) -> Self {
        Self::build(conn_flags, 0, pool_size, Some(name))
    }

    fn build(conn_flags: u64, attach_flags: u64, pool_size: u64, name: Option<&str>) -> Self {
        let items_len = name.map_or(0, |name| item_size(name.len() + 1));
        let size = align8(HELLO_FIXED_SIZE + items_len);
        let mut writer = ItemWriter::new(KmsgBuf::zeroed(size), HELLO_FIXED_SIZE);
        if let Some(name) = name {
            writer.push_str(ItemType::StarterName, name);
        }
        let mut buf = writer.finish();
        buf.truncate(size);
        let bytes = buf.as_mut_bytes();
        put_u64(bytes, 0, size as u64);
        put_u64(bytes, HELLO_CONN_FLAGS, conn_flags);
        put_u64(bytes, HELLO_ATTACH_FLAGS, attach_flags);
        put_u64(bytes, HELLO_POOL_SIZE, pool_size);
        Self { buf }
    }

    /// Wraps a command received by a kernel implementation.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            buf: KmsgBuf::from_bytes(bytes),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buf.as_bytes()
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        self.buf.as_mut_bytes()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.buf.as_mut_ptr()
    }

    pub fn size(&self) -> u64 {
        self.field(0)
    }

    pub fn conn_flags(&self) -> u64 {
        self.field(HELLO_CONN_FLAGS)
    }

    pub fn attach_flags(&self) -> u64 {
        self.field(HELLO_ATTACH_FLAGS)
    }

    pub fn pool_size(&self) -> u64 {
        self.field(HELLO_POOL_SIZE)
    }

    /// Name carried by a starter hello, if any.
    pub fn starter_name(&self) -> WireResult<Option<&str>> {
        for raw in ItemIter::new(self.as_bytes(), HELLO_FIXED_SIZE) {
            if let Item::StarterName(name) = raw?.decode()? {
                return Ok(Some(name));
            }
        }
        Ok(None)
    }

    /// Reads the fields the kernel filled in.
    pub fn reply(&self) -> HelloReply {
        let mut id128 = [0u8; 16];
        id128.copy_from_slice(&self.as_bytes()[HELLO_ID128..HELLO_ID128 + 16]);
        HelloReply {
            conn_flags: self.field(HELLO_CONN_FLAGS),
            bus_flags: self.field(HELLO_BUS_FLAGS),
            id: self.field(HELLO_ID),
            bloom_size: self.field(HELLO_BLOOM_SIZE),
            id128,
        }
    }

    /// Stores a reply; used by kernel implementations.
    pub fn set_reply(&mut self, reply: &HelloReply) {
        let bytes = self.buf.as_mut_bytes();
        put_u64(bytes, HELLO_CONN_FLAGS, reply.conn_flags);
        put_u64(bytes, HELLO_BUS_FLAGS, reply.bus_flags);
        put_u64(bytes, HELLO_ID, reply.id);
        put_u64(bytes, HELLO_BLOOM_SIZE, reply.bloom_size);
        bytes[HELLO_ID128..HELLO_ID128 + 16].copy_from_slice(&reply.id128);
    }

    fn field(&self, offset: usize) -> u64 {
        read_u64(self.as_bytes(), offset).unwrap_or_default()
    }
}

/// Which object a [`MakeCmd`] creates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MakeKind {
    Bus,
    Namespace,
}

impl MakeKind {
    fn fixed_size(self) -> usize {
        match self {
            MakeKind::Bus => BUS_MAKE_FIXED_SIZE,
            MakeKind::Namespace => NS_MAKE_FIXED_SIZE,
        }
    }
}

/// In/out buffer for the bus and namespace make ioctls.
#[derive(Debug, Clone)]
pub struct MakeCmd {
    kind: MakeKind,
    buf: KmsgBuf,
}

impl MakeCmd {
    /// Bus creation request; the bloom size is always this crate's fixed size.
    pub fn bus(name: &str, flags: u64) -> Self {
        let mut cmd = Self::build(MakeKind::Bus, name, flags);
        put_u64(cmd.buf.as_mut_bytes(), 24, BLOOM_SIZE as u64);
        cmd
    }

    pub fn namespace(name: &str, flags: u64) -> Self {
        Self::build(MakeKind::Namespace, name, flags)
    }

    fn build(kind: MakeKind, name: &str, flags: u64) -> Self {
        let fixed = kind.fixed_size();
        let size = align8(fixed + item_size(name.len() + 1));
        let mut writer = ItemWriter::new(KmsgBuf::zeroed(size), fixed);
        writer.push_str(ItemType::MakeName, name);
        let mut buf = writer.finish();
        buf.truncate(size);
        let bytes = buf.as_mut_bytes();
        put_u64(bytes, 0, size as u64);
        put_u64(bytes, 8, flags);
        Self { kind, buf }
    }

    /// Wraps a command received by a kernel implementation.
    pub fn from_bytes(kind: MakeKind, bytes: &[u8]) -> Self {
        Self {
            kind,
            buf: KmsgBuf::from_bytes(bytes),
        }
    }

    pub fn kind(&self) -> MakeKind {
        self.kind
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buf.as_bytes()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.buf.as_mut_ptr()
    }

    pub fn size(&self) -> u64 {
        read_u64(self.as_bytes(), 0).unwrap_or_default()
    }

    /// Flags as submitted, or as updated by the kernel after the call.
    pub fn flags(&self) -> u64 {
        read_u64(self.as_bytes(), 8).unwrap_or_default()
    }

    pub fn set_flags(&mut self, flags: u64) {
        put_u64(self.buf.as_mut_bytes(), 8, flags);
    }

    pub fn bloom_size(&self) -> Option<u64> {
        match self.kind {
            MakeKind::Bus => read_u64(self.as_bytes(), 24).ok(),
            MakeKind::Namespace => None,
        }
    }

    pub fn name(&self) -> WireResult<Option<&str>> {
        for raw in ItemIter::new(self.as_bytes(), self.kind.fixed_size()) {
            if let Item::MakeName(name) = raw?.decode()? {
                return Ok(Some(name));
            }
        }
        Ok(None)
    }
}
