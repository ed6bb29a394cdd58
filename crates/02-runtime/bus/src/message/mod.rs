//! Minimal D-Bus message model.
//!
//! Covers exactly what the kernel transport needs: building a message from
//! header fields and body parts, sealing it, reading basic arguments back
//! through a cursor, and reconstructing messages from received headers.
//! Container types are not marshalled.

mod body;
pub mod creds;
mod header;
mod marshal;

use std::os::fd::{IntoRawFd, OwnedFd};

use kdbus_wire::KmsgBuf;

pub use body::{part_bytes, Cursor, NoPool, PartSource};
pub use creds::{Creds, CredsMask};
pub use header::{HeaderFlags, MessageType};
pub use marshal::Value;

pub(crate) use header::{message_size, parse as parse_header, FIXED_HEADER_SIZE};
use header::{HeaderFields, ParsedHeader};

use crate::error::{BusError, BusResult};
use crate::pool::{PoolLease, PoolSpan};
use crate::segment_cache::Segment;

/// Well-known name of the bus itself.
pub const BUS_SERVICE: &str = "org.freedesktop.DBus";
pub const BUS_PATH: &str = "/org/freedesktop/DBus";
pub const BUS_INTERFACE: &str = "org.freedesktop.DBus";
pub const ERROR_SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
pub const ERROR_NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";

/// Longest body signature; its length travels in one byte.
pub const SIGNATURE_MAX: usize = 255;

/// Serial stamped on messages synthesized locally.
pub const SYNTHETIC_SERIAL: u32 = u32::MAX;

/// One contiguous piece of a message body.
#[derive(Debug)]
pub enum BodyPart {
    Inline(Vec<u8>),
    /// `n` zero bytes without backing storage.
    Zero(usize),
    /// Bytes inside the receive pool, valid while their lease is live.
    Pool(PoolSpan),
    Memfd {
        segment: Segment,
        len: usize,
        /// Sealed memfds are immutable and can be passed to peers as is.
        sealed: bool,
    },
}

impl BodyPart {
    pub fn len(&self) -> usize {
        match self {
            BodyPart::Inline(bytes) => bytes.len(),
            BodyPart::Zero(len) => *len,
            BodyPart::Pool(span) => span.len,
            BodyPart::Memfd { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receive timestamps, in microseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timestamps {
    pub monotonic_usec: u64,
    pub realtime_usec: u64,
}

#[derive(Debug)]
pub struct Message {
    kind: MessageType,
    flags: HeaderFlags,
    serial: u32,
    timeout_usec: u64,
    fields: HeaderFields,
    /// Rendered header and fields, padded to the body start.
    header: Vec<u8>,
    parts: Vec<BodyPart>,
    body_len: usize,
    creds: Creds,
    timestamps: Option<Timestamps>,
    fds: Vec<OwnedFd>,
    lease: Option<PoolLease>,
    kmsg: Option<KmsgBuf>,
    sealed: bool,
    cursor: Cursor,
}

impl Message {
    fn new(kind: MessageType, fields: HeaderFields) -> Self {
        Self {
            kind,
            flags: HeaderFlags::empty(),
            serial: 0,
            timeout_usec: 0,
            fields,
            header: Vec::new(),
            parts: Vec::new(),
            body_len: 0,
            creds: Creds::default(),
            timestamps: None,
            fds: Vec::new(),
            lease: None,
            kmsg: None,
            sealed: false,
            cursor: Cursor::default(),
        }
    }

    pub fn method_call(
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
        member: &str,
    ) -> Self {
        Self::new(
            MessageType::MethodCall,
            HeaderFields {
                destination: destination.map(str::to_owned),
                path: Some(path.to_owned()),
                interface: interface.map(str::to_owned),
                member: Some(member.to_owned()),
                ..Default::default()
            },
        )
    }

    pub fn signal(path: &str, interface: &str, member: &str) -> Self {
        let mut msg = Self::new(
            MessageType::Signal,
            HeaderFields {
                path: Some(path.to_owned()),
                interface: Some(interface.to_owned()),
                member: Some(member.to_owned()),
                ..Default::default()
            },
        );
        msg.flags = HeaderFlags::NO_REPLY_EXPECTED;
        msg
    }

    pub fn method_return(reply_serial: u32) -> Self {
        let mut msg = Self::new(
            MessageType::MethodReturn,
            HeaderFields {
                reply_serial: Some(reply_serial),
                ..Default::default()
            },
        );
        msg.flags = HeaderFlags::NO_REPLY_EXPECTED;
        msg
    }

    /// Error reply carrying `text` as its single string argument.
    pub fn error(reply_serial: u32, name: &str, text: &str) -> BusResult<Self> {
        let mut msg = Self::new(
            MessageType::Error,
            HeaderFields {
                reply_serial: Some(reply_serial),
                error_name: Some(name.to_owned()),
                ..Default::default()
            },
        );
        msg.flags = HeaderFlags::NO_REPLY_EXPECTED;
        msg.push_value(&Value::Str(text.to_owned()))?;
        Ok(msg)
    }

    /// Rebuilds an already sealed message from a received header.
    pub(crate) fn from_header(bytes: &[u8]) -> BusResult<Self> {
        let ParsedHeader {
            kind,
            flags,
            serial,
            fields,
            body_begin,
            ..
        } = parse_header(bytes)?;
        let mut msg = Self::new(kind, fields);
        msg.flags = flags;
        msg.serial = serial;
        msg.header = bytes[..body_begin].to_vec();
        msg.sealed = true;
        Ok(msg)
    }

    fn ensure_mutable(&self) -> BusResult<()> {
        if self.sealed {
            return Err(BusError::Sealed);
        }
        Ok(())
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn flags(&self) -> HeaderFlags {
        self.flags
    }

    /// 0 until sealed.
    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn timeout_usec(&self) -> u64 {
        self.timeout_usec
    }

    pub fn path(&self) -> Option<&str> {
        self.fields.path.as_deref()
    }

    pub fn interface(&self) -> Option<&str> {
        self.fields.interface.as_deref()
    }

    pub fn member(&self) -> Option<&str> {
        self.fields.member.as_deref()
    }

    pub fn error_name(&self) -> Option<&str> {
        self.fields.error_name.as_deref()
    }

    pub fn reply_serial(&self) -> Option<u32> {
        self.fields.reply_serial
    }

    pub fn destination(&self) -> Option<&str> {
        self.fields.destination.as_deref()
    }

    pub fn sender(&self) -> Option<&str> {
        self.fields.sender.as_deref()
    }

    pub fn signature(&self) -> &str {
        &self.fields.signature
    }

    pub fn unix_fds(&self) -> Option<u32> {
        self.fields.unix_fds
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Header and field bytes up to the body start; empty until sealed.
    pub fn header_bytes(&self) -> &[u8] {
        &self.header
    }

    pub fn parts(&self) -> &[BodyPart] {
        &self.parts
    }

    pub fn body_len(&self) -> usize {
        self.body_len
    }

    pub fn creds(&self) -> &Creds {
        &self.creds
    }

    pub fn timestamps(&self) -> Option<Timestamps> {
        self.timestamps
    }

    pub fn fds(&self) -> &[OwnedFd] {
        &self.fds
    }

    /// Takes ownership of the attached descriptors.
    pub fn take_fds(&mut self) -> Vec<OwnedFd> {
        std::mem::take(&mut self.fds)
    }

    /// Generation and offset of the kernel buffer backing a received message.
    pub fn lease(&self) -> Option<&PoolLease> {
        self.lease.as_ref()
    }

    pub fn set_destination(&mut self, destination: Option<&str>) -> BusResult<()> {
        self.ensure_mutable()?;
        self.fields.destination = destination.map(str::to_owned);
        Ok(())
    }

    pub fn set_sender(&mut self, sender: Option<&str>) -> BusResult<()> {
        self.ensure_mutable()?;
        self.fields.sender = sender.map(str::to_owned);
        Ok(())
    }

    pub fn set_flags(&mut self, flags: HeaderFlags) -> BusResult<()> {
        self.ensure_mutable()?;
        self.flags = flags;
        Ok(())
    }

    /// Reply timeout for method calls; 0 leaves it to the kernel.
    pub fn set_timeout_usec(&mut self, timeout_usec: u64) -> BusResult<()> {
        self.ensure_mutable()?;
        self.timeout_usec = timeout_usec;
        Ok(())
    }

    /// Appends one basic argument.
    pub fn append(&mut self, value: Value) -> BusResult<()> {
        self.ensure_mutable()?;
        self.push_value(&value)
    }

    /// Appends a byte array argument (`ay`) stored inline.
    pub fn append_bytes(&mut self, bytes: &[u8]) -> BusResult<()> {
        self.begin_byte_array(bytes.len())?;
        self.push_part(BodyPart::Inline(bytes.to_vec()));
        Ok(())
    }

    /// Writes the signature and length prefix of an `ay` argument whose
    /// `len` element bytes are appended next as a raw part.
    pub(crate) fn begin_byte_array(&mut self, len: usize) -> BusResult<()> {
        self.ensure_mutable()?;
        let len = u32::try_from(len).map_err(|_| BusError::Unsupported("array larger than 4 GiB"))?;
        self.extend_signature(b"ay")?;
        let mut prefix = Vec::new();
        marshal::put(&mut prefix, self.body_len, &Value::Uint32(len))?;
        self.push_inline(&prefix);
        Ok(())
    }

    /// Appends raw body bytes. The signature is left to the caller.
    pub fn append_raw(&mut self, bytes: &[u8]) -> BusResult<()> {
        self.ensure_mutable()?;
        self.push_inline(bytes);
        Ok(())
    }

    /// Appends `len` zero bytes that are never materialised.
    pub fn append_zero(&mut self, len: usize) -> BusResult<()> {
        self.ensure_mutable()?;
        self.push_part(BodyPart::Zero(len));
        Ok(())
    }

    /// Appends a prepared body part (for example a memfd segment).
    pub fn append_part(&mut self, part: BodyPart) -> BusResult<()> {
        self.ensure_mutable()?;
        self.push_part(part);
        Ok(())
    }

    /// Attaches a descriptor and returns its index for a `h` argument.
    pub fn push_fd(&mut self, fd: OwnedFd) -> BusResult<u32> {
        self.ensure_mutable()?;
        self.fds.push(fd);
        Ok(self.fds.len() as u32 - 1)
    }

    fn push_value(&mut self, value: &Value) -> BusResult<()> {
        let mut encoded = Vec::new();
        marshal::put(&mut encoded, self.body_len, value)?;
        self.extend_signature(&[value.type_code()])?;
        self.push_inline(&encoded);
        Ok(())
    }

    fn extend_signature(&mut self, codes: &[u8]) -> BusResult<()> {
        if self.fields.signature.len() + codes.len() > SIGNATURE_MAX {
            return Err(BusError::Unsupported("signature longer than 255 bytes"));
        }
        self.fields.signature.extend(codes.iter().copied().map(char::from));
        Ok(())
    }

    fn push_inline(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.body_len += bytes.len();
        if let Some(BodyPart::Inline(tail)) = self.parts.last_mut() {
            tail.extend_from_slice(bytes);
        } else {
            self.parts.push(BodyPart::Inline(bytes.to_vec()));
        }
    }

    pub(crate) fn push_part(&mut self, part: BodyPart) {
        self.body_len += part.len();
        self.parts.push(part);
    }

    /// Stamps `serial`, renders the header and freezes the message.
    pub fn seal(&mut self, serial: u32) -> BusResult<()> {
        self.ensure_mutable()?;
        if serial == 0 {
            return Err(BusError::Malformed("zero serial"));
        }
        let body_len = u32::try_from(self.body_len)
            .map_err(|_| BusError::Unsupported("body larger than 4 GiB"))?;
        if self.fields.signature.len() > SIGNATURE_MAX {
            return Err(BusError::Unsupported("signature longer than 255 bytes"));
        }
        self.fields.unix_fds = (!self.fds.is_empty()).then_some(self.fds.len() as u32);
        self.header = header::render(self.kind, self.flags, serial, body_len, &self.fields)?;
        self.serial = serial;
        self.sealed = true;
        self.cursor = Cursor::default();
        Ok(())
    }

    pub(crate) fn parts_mut(&mut self) -> &mut [BodyPart] {
        &mut self.parts
    }

    /// Removes the body parts, for recycling their segments.
    pub(crate) fn take_parts(&mut self) -> Vec<BodyPart> {
        self.body_len = 0;
        self.kmsg = None;
        std::mem::take(&mut self.parts)
    }

    pub(crate) fn creds_mut(&mut self) -> &mut Creds {
        &mut self.creds
    }

    pub(crate) fn set_timestamps(&mut self, timestamps: Timestamps) {
        self.timestamps = Some(timestamps);
    }

    pub(crate) fn set_fds(&mut self, fds: Vec<OwnedFd>) {
        self.fds = fds;
    }

    pub(crate) fn set_lease(&mut self, lease: PoolLease) {
        self.lease = Some(lease);
    }

    pub(crate) fn take_lease(&mut self) -> Option<PoolLease> {
        self.lease.take()
    }

    pub(crate) fn set_received_sender(&mut self, sender: String) {
        self.fields.sender = Some(sender);
    }

    pub(crate) fn set_received_destination(&mut self, destination: String) {
        self.fields.destination = Some(destination);
    }

    /// Kernel buffer built by an earlier send, if any.
    pub(crate) fn take_kmsg(&mut self) -> Option<KmsgBuf> {
        self.kmsg.take()
    }

    pub(crate) fn store_kmsg(&mut self, kmsg: KmsgBuf) -> &KmsgBuf {
        self.kmsg.insert(kmsg)
    }

    /// Gives up ownership of every descriptor the message holds without
    /// closing them, so that whoever owns the raw values closes them once.
    pub(crate) fn detach_descriptors(&mut self) {
        for part in self.parts.drain(..) {
            if let BodyPart::Memfd { segment, .. } = part {
                let _ = segment.into_raw_fd();
            }
        }
        for fd in self.fds.drain(..) {
            let _ = fd.into_raw_fd();
        }
        self.body_len = 0;
    }
}
