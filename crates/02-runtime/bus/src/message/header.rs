//! Fixed header and header-field array of a D-Bus v1 message.
//!
//! ```text
//! [endian 'l'][type][flags][version 1][u32 body_len][u32 serial]
//! [u32 fields_len][fields: (code, signature, value) each 8-aligned][pad → 8]
//! ```
//! The body begins at `16 + align8(fields_len)`.

use bitflags::bitflags;

use super::marshal::{self, align_up, pad_to, put, slice_fetch, Value};
use crate::error::{BusError, BusResult};

pub(crate) const FIXED_HEADER_SIZE: usize = 16;
const PROTOCOL_VERSION: u8 = 1;

const FIELD_PATH: u8 = 1;
const FIELD_INTERFACE: u8 = 2;
const FIELD_MEMBER: u8 = 3;
const FIELD_ERROR_NAME: u8 = 4;
const FIELD_REPLY_SERIAL: u8 = 5;
const FIELD_DESTINATION: u8 = 6;
const FIELD_SENDER: u8 = 7;
const FIELD_SIGNATURE: u8 = 8;
const FIELD_UNIX_FDS: u8 = 9;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => MessageType::MethodCall,
            2 => MessageType::MethodReturn,
            3 => MessageType::Error,
            4 => MessageType::Signal,
            _ => return None,
        })
    }

    /// Name used for the `message-type` bloom entry and match rules.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::MethodCall => "method_call",
            MessageType::MethodReturn => "method_return",
            MessageType::Error => "error",
            MessageType::Signal => "signal",
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct HeaderFlags: u8 {
        const NO_REPLY_EXPECTED = 1 << 0;
        const NO_AUTO_START = 1 << 1;
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct HeaderFields {
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub reply_serial: Option<u32>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    pub signature: String,
    pub unix_fds: Option<u32>,
}

impl HeaderFields {
    fn entries(&self) -> impl Iterator<Item = (u8, Value)> + '_ {
        let text = |code, v: &Option<String>, f: fn(String) -> Value| {
            v.as_ref().map(|s| (code, f(s.clone())))
        };
        [
            text(FIELD_PATH, &self.path, Value::ObjectPath),
            text(FIELD_INTERFACE, &self.interface, Value::Str),
            text(FIELD_MEMBER, &self.member, Value::Str),
            text(FIELD_ERROR_NAME, &self.error_name, Value::Str),
            self.reply_serial
                .map(|v| (FIELD_REPLY_SERIAL, Value::Uint32(v))),
            text(FIELD_DESTINATION, &self.destination, Value::Str),
            text(FIELD_SENDER, &self.sender, Value::Str),
            (!self.signature.is_empty())
                .then(|| (FIELD_SIGNATURE, Value::Signature(self.signature.clone()))),
            self.unix_fds.map(|v| (FIELD_UNIX_FDS, Value::Uint32(v))),
        ]
        .into_iter()
        .flatten()
    }

    fn assign(&mut self, code: u8, value: Value) -> BusResult<()> {
        let wrong = BusError::Malformed("header field has the wrong type");
        match (code, value) {
            (FIELD_PATH, Value::ObjectPath(v)) => self.path = Some(v),
            (FIELD_INTERFACE, Value::Str(v)) => self.interface = Some(v),
            (FIELD_MEMBER, Value::Str(v)) => self.member = Some(v),
            (FIELD_ERROR_NAME, Value::Str(v)) => self.error_name = Some(v),
            (FIELD_REPLY_SERIAL, Value::Uint32(v)) => self.reply_serial = Some(v),
            (FIELD_DESTINATION, Value::Str(v)) => self.destination = Some(v),
            (FIELD_SENDER, Value::Str(v)) => self.sender = Some(v),
            (FIELD_SIGNATURE, Value::Signature(v)) => self.signature = v,
            (FIELD_UNIX_FDS, Value::Uint32(v)) => self.unix_fds = Some(v),
            (FIELD_PATH..=FIELD_UNIX_FDS, _) => return Err(wrong),
            (other, _) => log::debug!("ignoring unknown header field {other}"),
        }
        Ok(())
    }
}

/// Header decoded from the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ParsedHeader {
    pub kind: MessageType,
    pub flags: HeaderFlags,
    pub serial: u32,
    pub body_len: usize,
    pub fields: HeaderFields,
    /// Offset of the first body byte; also the header's total length.
    pub body_begin: usize,
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Checks the fixed part and returns `(body_begin, body_len)`.
fn fixed_part(bytes: &[u8]) -> BusResult<(usize, usize)> {
    if bytes.len() < FIXED_HEADER_SIZE {
        return Err(BusError::Malformed("incomplete header"));
    }
    match bytes[0] {
        b'l' => {}
        b'B' => return Err(BusError::Unsupported("big-endian messages")),
        _ => return Err(BusError::Malformed("bad endianness marker")),
    }
    if bytes[3] != PROTOCOL_VERSION {
        return Err(BusError::Unsupported("protocol version"));
    }
    let body_len = u32_at(bytes, 4) as usize;
    let fields_len = u32_at(bytes, 12) as usize;
    Ok((FIXED_HEADER_SIZE + align_up(fields_len, 8), body_len))
}

/// Total message size (header, fields and body) declared by a header.
pub(crate) fn message_size(bytes: &[u8]) -> BusResult<usize> {
    let (body_begin, body_len) = fixed_part(bytes)?;
    Ok(body_begin + body_len)
}

pub(crate) fn parse(bytes: &[u8]) -> BusResult<ParsedHeader> {
    let (body_begin, body_len) = fixed_part(bytes)?;
    if bytes.len() < body_begin {
        return Err(BusError::Malformed("incomplete header"));
    }
    let kind = MessageType::from_u8(bytes[1]).ok_or(BusError::Malformed("unknown message type"))?;
    let flags = HeaderFlags::from_bits_retain(bytes[2]);
    let serial = u32_at(bytes, 8);
    if serial == 0 {
        return Err(BusError::Malformed("zero serial"));
    }

    let end = FIXED_HEADER_SIZE + u32_at(bytes, 12) as usize;
    let mut fetch = slice_fetch(&bytes[..end]);
    let mut fields = HeaderFields::default();
    let mut offset = FIXED_HEADER_SIZE;
    while align_up(offset, 8) < end {
        offset = align_up(offset, 8);
        let code = bytes[offset];
        offset += 1;
        let signature = match marshal::read(b'g', &mut offset, &mut fetch)? {
            Value::Signature(s) if s.len() == 1 => s.as_bytes()[0],
            _ => return Err(BusError::Malformed("header field is not a single basic type")),
        };
        let value = marshal::read(signature, &mut offset, &mut fetch)?;
        fields.assign(code, value)?;
    }

    let required = match kind {
        MessageType::MethodCall => fields.path.is_some() && fields.member.is_some(),
        MessageType::Signal => {
            fields.path.is_some() && fields.interface.is_some() && fields.member.is_some()
        }
        MessageType::Error => fields.error_name.is_some() && fields.reply_serial.is_some(),
        MessageType::MethodReturn => fields.reply_serial.is_some(),
    };
    if !required {
        return Err(BusError::Malformed("missing required header field"));
    }

    Ok(ParsedHeader {
        kind,
        flags,
        serial,
        body_len,
        fields,
        body_begin,
    })
}

pub(crate) fn render(
    kind: MessageType,
    flags: HeaderFlags,
    serial: u32,
    body_len: u32,
    fields: &HeaderFields,
) -> BusResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(128);
    buf.extend_from_slice(&[b'l', kind as u8, flags.bits(), PROTOCOL_VERSION]);
    buf.extend_from_slice(&body_len.to_le_bytes());
    buf.extend_from_slice(&serial.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    for (code, value) in fields.entries() {
        pad_to(&mut buf, 0, 8);
        buf.extend_from_slice(&[code, 1, value.type_code(), 0]);
        put(&mut buf, 0, &value)?;
    }
    let fields_len = (buf.len() - FIXED_HEADER_SIZE) as u32;
    buf[12..16].copy_from_slice(&fields_len.to_le_bytes());
    pad_to(&mut buf, 0, 8);
    Ok(buf)
}
