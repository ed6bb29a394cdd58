//! Zero-copy views over kernel records.
//!
//! [`KmsgView`] borrows a message in place (typically inside the receive
//! pool) and walks its items the way the kernel lays them out: each item
//! starts at the previous item's start plus its size rounded up to 8.

use crate::abi::{
    align8, ItemType, AUDIT_PAYLOAD_SIZE, CREDS_PAYLOAD_SIZE, ID_CHANGE_PAYLOAD_SIZE,
    ITEM_HEADER_SIZE, KMSG_HEADER_SIZE, MEMFD_PAYLOAD_SIZE, NAME_CHANGE_FIXED_SIZE,
    TIMESTAMP_PAYLOAD_SIZE, VEC_PAYLOAD_SIZE,
};
use crate::error::{WireError, WireResult};
use crate::writer::{ItemAudit, ItemCreds, ItemTimestamp, KmsgHeader};
use std::os::fd::RawFd;

/// Reads a native-endian `u64` at `offset`.
pub fn read_u64(bytes: &[u8], offset: usize) -> WireResult<u64> {
    let end = offset.checked_add(8).filter(|&end| end <= bytes.len()).ok_or(
        WireError::Truncated {
            offset,
            need: 8,
            have: bytes.len().saturating_sub(offset),
        },
    )?;
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[offset..end]);
    Ok(u64::from_ne_bytes(word))
}

impl KmsgHeader {
    /// Decodes the fixed header at the start of `bytes`.
    pub fn read(bytes: &[u8]) -> WireResult<Self> {
        Ok(Self {
            size: read_u64(bytes, 0)?,
            flags: read_u64(bytes, 8)?,
            dst_id: read_u64(bytes, 16)?,
            src_id: read_u64(bytes, 24)?,
            payload_type: read_u64(bytes, 32)?,
            cookie: read_u64(bytes, 40)?,
            timeout_or_reply: read_u64(bytes, 48)?,
        })
    }
}

/// Borrowed kernel message.
#[derive(Clone, Copy, Debug)]
pub struct KmsgView<'a> {
    bytes: &'a [u8],
    header: KmsgHeader,
}

impl<'a> KmsgView<'a> {
    /// Interprets `bytes` as one message; trailing bytes beyond the declared
    /// size are ignored.
    pub fn new(bytes: &'a [u8]) -> WireResult<Self> {
        let header = KmsgHeader::read(bytes)?;
        let size = header.size;
        if size < KMSG_HEADER_SIZE as u64 || size > bytes.len() as u64 {
            return Err(WireError::BadItemSize { offset: 0, size });
        }
        Ok(Self {
            bytes: &bytes[..size as usize],
            header,
        })
    }

    /// Views the message the kernel placed at `offset` inside `pool`.
    pub fn in_pool(pool: &'a [u8], offset: u64) -> WireResult<Self> {
        let start = usize::try_from(offset)
            .ok()
            .filter(|&start| start <= pool.len())
            .ok_or(WireError::Truncated {
                offset: offset as usize,
                need: KMSG_HEADER_SIZE,
                have: 0,
            })?;
        Self::new(&pool[start..])
    }

    pub fn header(&self) -> &KmsgHeader {
        &self.header
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn items(&self) -> ItemIter<'a> {
        ItemIter::new(self.bytes, KMSG_HEADER_SIZE)
    }
}

/// Iterator over the items of a record, starting at a fixed offset.
///
/// Yields an error and stops when an item header is inconsistent with the
/// record bounds.
#[derive(Clone, Debug)]
pub struct ItemIter<'a> {
    bytes: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> ItemIter<'a> {
    pub fn new(bytes: &'a [u8], start: usize) -> Self {
        Self {
            bytes,
            offset: start,
            failed: false,
        }
    }
}

impl<'a> Iterator for ItemIter<'a> {
    type Item = WireResult<RawItem<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset + ITEM_HEADER_SIZE > self.bytes.len() {
            return None;
        }
        let offset = self.offset;
        let parsed = read_u64(self.bytes, offset).and_then(|size| {
            let end = (offset as u64)
                .checked_add(size)
                .filter(|&end| size >= ITEM_HEADER_SIZE as u64 && end <= self.bytes.len() as u64)
                .ok_or(WireError::BadItemSize { offset, size })?;
            let tag = read_u64(self.bytes, offset + 8)?;
            Ok(RawItem {
                offset,
                tag,
                payload: &self.bytes[offset + ITEM_HEADER_SIZE..end as usize],
            })
        });
        match &parsed {
            Ok(item) => self.offset = align8(item.offset + ITEM_HEADER_SIZE + item.payload.len()),
            Err(_) => self.failed = true,
        }
        Some(parsed)
    }
}

/// One undecoded item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawItem<'a> {
    /// Offset of the item header within the record.
    pub offset: usize,
    pub tag: u64,
    pub payload: &'a [u8],
}

/// Descriptors carried by an fds item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FdList<'a> {
    bytes: &'a [u8],
}

impl<'a> FdList<'a> {
    pub fn len(&self) -> usize {
        self.bytes.len() / 4
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = RawFd> + 'a {
        self.bytes
            .chunks_exact(4)
            .map(|chunk| RawFd::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
    }
}

/// Name ownership notification payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NameChange<'a> {
    pub old_id: u64,
    pub new_id: u64,
    pub flags: u64,
    pub name: &'a str,
}

/// Peer lifecycle notification payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdChange {
    pub id: u64,
    pub flags: u64,
}

/// Decoded item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Item<'a> {
    PayloadVec { address: u64, size: u64 },
    PayloadOff { offset: u64, size: u64 },
    PayloadMemfd { fd: RawFd, size: u64 },
    Fds(FdList<'a>),
    Bloom(&'a [u8]),
    DstName(&'a str),
    MakeName(&'a str),
    StarterName(&'a str),
    Timestamp(ItemTimestamp),
    Creds(ItemCreds),
    PidComm(&'a str),
    TidComm(&'a str),
    Exe(&'a str),
    /// NUL-separated argv, kept raw.
    Cmdline(&'a [u8]),
    Cgroup(&'a str),
    Caps(&'a [u8]),
    Seclabel(&'a str),
    Audit(ItemAudit),
    /// NUL-separated well-known names, kept raw.
    Names(&'a [u8]),
    NameAdd(NameChange<'a>),
    NameRemove(NameChange<'a>),
    NameChange(NameChange<'a>),
    IdAdd(IdChange),
    IdRemove(IdChange),
    ReplyTimeout,
    ReplyDead,
    /// Tag this crate does not interpret (including `Name` and `Priority`).
    Unknown(u64),
}

impl<'a> RawItem<'a> {
    pub fn item_type(&self) -> Option<ItemType> {
        ItemType::from_u64(self.tag)
    }

    /// Decodes the payload according to the tag.
    pub fn decode(&self) -> WireResult<Item<'a>> {
        let Some(ty) = self.item_type() else {
            return Ok(Item::Unknown(self.tag));
        };
        Ok(match ty {
            ItemType::PayloadVec => {
                let [size, address] = self.words::<2>(VEC_PAYLOAD_SIZE)?;
                Item::PayloadVec { address, size }
            }
            ItemType::PayloadOff => {
                let [size, offset] = self.words::<2>(VEC_PAYLOAD_SIZE)?;
                Item::PayloadOff { offset, size }
            }
            ItemType::PayloadMemfd => {
                let [size] = self.words::<1>(MEMFD_PAYLOAD_SIZE)?;
                let p = self.payload;
                Item::PayloadMemfd {
                    fd: RawFd::from_ne_bytes([p[8], p[9], p[10], p[11]]),
                    size,
                }
            }
            ItemType::Fds => Item::Fds(FdList {
                bytes: self.payload,
            }),
            ItemType::Bloom => Item::Bloom(self.payload),
            ItemType::DstName => Item::DstName(self.str()?),
            ItemType::MakeName => Item::MakeName(self.str()?),
            ItemType::StarterName => Item::StarterName(self.str()?),
            ItemType::Timestamp => {
                let [monotonic_ns, realtime_ns] = self.words::<2>(TIMESTAMP_PAYLOAD_SIZE)?;
                Item::Timestamp(ItemTimestamp {
                    monotonic_ns,
                    realtime_ns,
                })
            }
            ItemType::Creds => {
                let [uid, gid, pid, tid, starttime] = self.words::<5>(CREDS_PAYLOAD_SIZE)?;
                Item::Creds(ItemCreds {
                    uid,
                    gid,
                    pid,
                    tid,
                    starttime,
                })
            }
            ItemType::PidComm => Item::PidComm(self.str()?),
            ItemType::TidComm => Item::TidComm(self.str()?),
            ItemType::Exe => Item::Exe(self.str()?),
            ItemType::Cmdline => Item::Cmdline(self.payload),
            ItemType::Cgroup => Item::Cgroup(self.str()?),
            ItemType::Caps => Item::Caps(self.payload),
            ItemType::Seclabel => Item::Seclabel(self.str()?),
            ItemType::Audit => {
                let [sessionid, loginuid] = self.words::<2>(AUDIT_PAYLOAD_SIZE)?;
                Item::Audit(ItemAudit {
                    sessionid,
                    loginuid,
                })
            }
            ItemType::Names => Item::Names(self.payload),
            ItemType::NameAdd => Item::NameAdd(self.name_change()?),
            ItemType::NameRemove => Item::NameRemove(self.name_change()?),
            ItemType::NameChange => Item::NameChange(self.name_change()?),
            ItemType::IdAdd => Item::IdAdd(self.id_change()?),
            ItemType::IdRemove => Item::IdRemove(self.id_change()?),
            ItemType::ReplyTimeout => Item::ReplyTimeout,
            ItemType::ReplyDead => Item::ReplyDead,
            ItemType::Name | ItemType::Priority => Item::Unknown(self.tag),
        })
    }

    fn expect_len(&self, expected: usize) -> WireResult<()> {
        if self.payload.len() < expected {
            return Err(WireError::ShortPayload {
                tag: self.tag,
                len: self.payload.len(),
                expected,
            });
        }
        Ok(())
    }

    fn words<const N: usize>(&self, expected: usize) -> WireResult<[u64; N]> {
        self.expect_len(expected.max(N * 8))?;
        let mut out = [0u64; N];
        for (i, word) in out.iter_mut().enumerate() {
            *word = read_u64(self.payload, i * 8)?;
        }
        Ok(out)
    }

    fn str(&self) -> WireResult<&'a str> {
        c_str(self.payload).ok_or(WireError::BadString { tag: self.tag })
    }

    fn name_change(&self) -> WireResult<NameChange<'a>> {
        self.expect_len(NAME_CHANGE_FIXED_SIZE + 1)?;
        let [old_id, new_id, flags] = self.words::<3>(NAME_CHANGE_FIXED_SIZE)?;
        let name = c_str(&self.payload[NAME_CHANGE_FIXED_SIZE..])
            .ok_or(WireError::BadString { tag: self.tag })?;
        Ok(NameChange {
            old_id,
            new_id,
            flags,
            name,
        })
    }

    fn id_change(&self) -> WireResult<IdChange> {
        let [id, flags] = self.words::<2>(ID_CHANGE_PAYLOAD_SIZE)?;
        Ok(IdChange { id, flags })
    }
}

/// Returns the UTF-8 string before the first NUL, if there is one.
pub fn c_str(bytes: &[u8]) -> Option<&str> {
    let nul = bytes.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&bytes[..nul]).ok()
}
