//! Binary ABI shared with the kdbus kernel module.
//!
//! Every record handed to or received from the kernel is a sequence of
//! 8-byte aligned items:
//!
//! ```text
//! item:  [u64 size (incl. 16-byte header)][u64 type][payload ...][pad → 8]
//! kmsg:  [u64 size][u64 flags][u64 dst_id][u64 src_id][u64 payload_type]
//!        [u64 cookie][u64 timeout_ns | cookie_reply][items ...]
//! ```
//!
//! All integers are native-endian, matching the ioctl interface.

/// Alignment applied to every item and command buffer.
pub const ALIGN: usize = 8;

/// Bytes occupied by `size` + `type` at the start of each item.
pub const ITEM_HEADER_SIZE: usize = 16;

/// Fixed part of a `kdbus_msg` before its item list.
pub const KMSG_HEADER_SIZE: usize = 56;

/// Payload of a vec / off item: `[u64 size][u64 address | offset]`.
pub const VEC_PAYLOAD_SIZE: usize = 16;

/// Payload of a memfd item: `[u64 size][i32 fd][u32 pad]`.
pub const MEMFD_PAYLOAD_SIZE: usize = 16;

/// Payload of a creds item: uid, gid, pid, tid, starttime.
pub const CREDS_PAYLOAD_SIZE: usize = 40;

/// Payload of a timestamp item: monotonic, realtime.
pub const TIMESTAMP_PAYLOAD_SIZE: usize = 16;

/// Payload of an audit item: session id, login uid.
pub const AUDIT_PAYLOAD_SIZE: usize = 16;

/// Fixed part of a name-change notification before the NUL-terminated name.
pub const NAME_CHANGE_FIXED_SIZE: usize = 24;

/// Payload of an id-change notification: id, flags.
pub const ID_CHANGE_PAYLOAD_SIZE: usize = 16;

/// Size in bytes of the broadcast bloom filter negotiated with the bus.
pub const BLOOM_SIZE: usize = 64;

/// Default size of the receive pool requested during hello.
pub const POOL_SIZE: u64 = 16 * 1024 * 1024;

/// `dst_id` telling the kernel to resolve the destination by name.
pub const DST_ID_NAME: u64 = 0;

/// `dst_id` addressing every connection subscribed via bloom match.
pub const DST_ID_BROADCAST: u64 = u64::MAX;

/// `src_id` of messages originated by the kernel itself.
pub const SRC_ID_KERNEL: u64 = 0;

/// `offset` of a payload-off item that stands for a run of zero bytes.
pub const PAYLOAD_OFF_ZERO: u64 = u64::MAX;

/// Payload type of kernel notifications.
pub const PAYLOAD_KERNEL: u64 = 0;

/// Payload type of D-Bus v1 marshalled messages ("DBusDBus").
pub const PAYLOAD_DBUS1: u64 = 0x4442_7573_4442_7573;

/// Flag words with any bit above this mask are "incompatible" and refused.
pub const COMPAT_FLAGS_MASK: u64 = 0xFFFF_FFFF;

/// kmsg flag: the sender expects a reply.
pub const MSG_FLAGS_EXPECT_REPLY: u64 = 1 << 0;
/// kmsg flag: do not activate the destination.
pub const MSG_FLAGS_NO_AUTO_START: u64 = 1 << 1;

/// Hello flag: the connection accepts passed file descriptors.
pub const HELLO_ACCEPT_FD: u64 = 1 << 0;
/// Hello flag: the connection is an activator placeholder for a name.
pub const HELLO_STARTER: u64 = 1 << 1;

/// Make flag: no policy restrictions on the new bus.
pub const MAKE_POLICY_OPEN: u64 = 1 << 0;
/// Make flag: device node accessible by the creator's group.
pub const MAKE_ACCESS_GROUP: u64 = 1 << 1;
/// Make flag: device node accessible by everyone.
pub const MAKE_ACCESS_WORLD: u64 = 1 << 2;

/// Name flags understood by the kernel when acquiring a well-known name.
pub const NAME_REPLACE_EXISTING: u64 = 1 << 0;
pub const NAME_QUEUE: u64 = 1 << 1;
pub const NAME_ALLOW_REPLACEMENT: u64 = 1 << 2;

/// Attach flags selecting the metadata the kernel appends to received messages.
pub const ATTACH_TIMESTAMP: u64 = 1 << 0;
pub const ATTACH_CREDS: u64 = 1 << 1;
pub const ATTACH_NAMES: u64 = 1 << 2;
pub const ATTACH_COMM: u64 = 1 << 3;
pub const ATTACH_EXE: u64 = 1 << 4;
pub const ATTACH_CMDLINE: u64 = 1 << 5;
pub const ATTACH_CGROUP: u64 = 1 << 6;
pub const ATTACH_CAPS: u64 = 1 << 7;
pub const ATTACH_SECLABEL: u64 = 1 << 8;
pub const ATTACH_AUDIT: u64 = 1 << 9;

/// Monitor command flag enabling eavesdropping on the whole bus.
pub const MONITOR_ENABLE: u64 = 1 << 0;

/// Item type tags.
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ItemType {
    PayloadVec = 1,
    PayloadOff = 2,
    PayloadMemfd = 3,
    Fds = 4,
    Bloom = 5,
    DstName = 6,
    Priority = 7,
    MakeName = 8,

    Name = 0x400,
    StarterName = 0x401,
    Timestamp = 0x402,
    Creds = 0x403,
    PidComm = 0x404,
    TidComm = 0x405,
    Exe = 0x406,
    Cmdline = 0x407,
    Cgroup = 0x408,
    Caps = 0x409,
    Seclabel = 0x40a,
    Audit = 0x40b,
    Names = 0x40c,

    NameAdd = 0x800,
    NameRemove = 0x801,
    NameChange = 0x802,
    IdAdd = 0x803,
    IdRemove = 0x804,
    ReplyTimeout = 0x805,
    ReplyDead = 0x806,
}

/// First tag of the kernel notification range.
pub const ITEM_KERNEL_BASE: u64 = 0x800;

impl ItemType {
    pub fn from_u64(value: u64) -> Option<Self> {
        use ItemType::*;
        Some(match value {
            1 => PayloadVec,
            2 => PayloadOff,
            3 => PayloadMemfd,
            4 => Fds,
            5 => Bloom,
            6 => DstName,
            7 => Priority,
            8 => MakeName,
            0x400 => Name,
            0x401 => StarterName,
            0x402 => Timestamp,
            0x403 => Creds,
            0x404 => PidComm,
            0x405 => TidComm,
            0x406 => Exe,
            0x407 => Cmdline,
            0x408 => Cgroup,
            0x409 => Caps,
            0x40a => Seclabel,
            0x40b => Audit,
            0x40c => Names,
            0x800 => NameAdd,
            0x801 => NameRemove,
            0x802 => NameChange,
            0x803 => IdAdd,
            0x804 => IdRemove,
            0x805 => ReplyTimeout,
            0x806 => ReplyDead,
            _ => return None,
        })
    }

    /// Returns true for notification items the kernel emits on its own.
    pub fn is_kernel_notification(self) -> bool {
        self as u64 >= ITEM_KERNEL_BASE
    }
}

/// Rounds `len` up to the next multiple of [`ALIGN`].
#[inline]
pub const fn align8(len: usize) -> usize {
    (len + ALIGN - 1) & !(ALIGN - 1)
}

/// Total (unpadded) size of an item carrying `payload_len` bytes.
#[inline]
pub const fn item_size(payload_len: usize) -> usize {
    ITEM_HEADER_SIZE + payload_len
}

/// Space an item carrying `payload_len` bytes occupies in a list.
#[inline]
pub const fn item_footprint(payload_len: usize) -> usize {
    align8(item_size(payload_len))
}

/// Space taken by one payload vec or memfd item; both share the same footprint.
pub const PAYLOAD_ITEM_FOOTPRINT: usize = item_footprint(VEC_PAYLOAD_SIZE);

const _: () = assert!(item_footprint(VEC_PAYLOAD_SIZE) == item_footprint(MEMFD_PAYLOAD_SIZE));
const _: () = assert!(BLOOM_SIZE % ALIGN == 0);
