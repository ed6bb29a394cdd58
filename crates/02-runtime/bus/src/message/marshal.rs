//! Little-endian D-Bus encoding of basic values.

use crate::error::{BusError, BusResult};

/// A basic (non-container) argument.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Byte(u8),
    Bool(bool),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    /// Index into the message's descriptor list.
    UnixFd(u32),
    Str(String),
    ObjectPath(String),
    Signature(String),
}

impl Value {
    pub fn type_code(&self) -> u8 {
        match self {
            Value::Byte(_) => b'y',
            Value::Bool(_) => b'b',
            Value::Int16(_) => b'n',
            Value::Uint16(_) => b'q',
            Value::Int32(_) => b'i',
            Value::Uint32(_) => b'u',
            Value::Int64(_) => b'x',
            Value::Uint64(_) => b't',
            Value::Double(_) => b'd',
            Value::UnixFd(_) => b'h',
            Value::Str(_) => b's',
            Value::ObjectPath(_) => b'o',
            Value::Signature(_) => b'g',
        }
    }

    /// Text of string-like values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::ObjectPath(s) | Value::Signature(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match *self {
            Value::Uint32(v) | Value::UnixFd(v) => Some(v),
            _ => None,
        }
    }
}

pub(crate) fn is_basic(code: u8) -> bool {
    alignment(code).is_some()
}

pub(crate) fn alignment(code: u8) -> Option<usize> {
    Some(match code {
        b'y' | b'g' => 1,
        b'n' | b'q' => 2,
        b'b' | b'i' | b'u' | b'h' | b's' | b'o' => 4,
        b'x' | b't' | b'd' => 8,
        _ => return None,
    })
}

pub(crate) const fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

/// Pads `buf`, whose first byte sits at absolute offset `base`, to `align`.
pub(crate) fn pad_to(buf: &mut Vec<u8>, base: usize, align: usize) {
    let at = base + buf.len();
    buf.resize(buf.len() + (align_up(at, align) - at), 0);
}

/// Appends `value` to `buf` (first byte at absolute offset `base`).
///
/// Fails when a string or signature is too long for its length prefix.
pub(crate) fn put(buf: &mut Vec<u8>, base: usize, value: &Value) -> BusResult<()> {
    let code = value.type_code();
    if let Some(align) = alignment(code) {
        pad_to(buf, base, align);
    }
    match value {
        Value::Byte(v) => buf.push(*v),
        Value::Bool(v) => buf.extend_from_slice(&u32::from(*v).to_le_bytes()),
        Value::Int16(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::Uint16(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::Int32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::Uint32(v) | Value::UnixFd(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::Int64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::Uint64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::Double(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::Str(s) | Value::ObjectPath(s) => {
            let len = u32::try_from(s.len())
                .map_err(|_| BusError::Unsupported("string longer than 4 GiB"))?;
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
            buf.push(0);
        }
        Value::Signature(s) => {
            let len = u8::try_from(s.len())
                .map_err(|_| BusError::Unsupported("signature longer than 255 bytes"))?;
            buf.push(len);
            buf.extend_from_slice(s.as_bytes());
            buf.push(0);
        }
    }
    Ok(())
}

/// Reads one basic value of type `code` at `*offset`, advancing it.
///
/// `fetch(at, out)` fills `out` with the bytes at absolute offset `at`.
pub(crate) fn read<F>(code: u8, offset: &mut usize, mut fetch: F) -> BusResult<Value>
where
    F: FnMut(usize, &mut [u8]) -> BusResult<()>,
{
    let align = alignment(code).ok_or(BusError::Type {
        found: Some(code as char),
    })?;
    let at = align_up(*offset, align);
    let mut word = [0u8; 8];
    let value = match code {
        b's' | b'o' => {
            fetch(at, &mut word[..4])?;
            let len = u32::from_le_bytes([word[0], word[1], word[2], word[3]]) as usize;
            let text = read_text(at + 4, len, &mut fetch)?;
            *offset = at + 4 + len + 1;
            if code == b's' {
                Value::Str(text)
            } else {
                Value::ObjectPath(text)
            }
        }
        b'g' => {
            fetch(at, &mut word[..1])?;
            let len = word[0] as usize;
            let text = read_text(at + 1, len, &mut fetch)?;
            *offset = at + 1 + len + 1;
            Value::Signature(text)
        }
        _ => {
            let size = align;
            fetch(at, &mut word[..size])?;
            *offset = at + size;
            let w4 = [word[0], word[1], word[2], word[3]];
            let w2 = [word[0], word[1]];
            match code {
                b'y' => Value::Byte(word[0]),
                b'b' => match u32::from_le_bytes(w4) {
                    0 => Value::Bool(false),
                    1 => Value::Bool(true),
                    _ => return Err(BusError::Malformed("boolean is neither 0 nor 1")),
                },
                b'n' => Value::Int16(i16::from_le_bytes(w2)),
                b'q' => Value::Uint16(u16::from_le_bytes(w2)),
                b'i' => Value::Int32(i32::from_le_bytes(w4)),
                b'u' => Value::Uint32(u32::from_le_bytes(w4)),
                b'h' => Value::UnixFd(u32::from_le_bytes(w4)),
                b'x' => Value::Int64(i64::from_le_bytes(word)),
                b't' => Value::Uint64(u64::from_le_bytes(word)),
                b'd' => Value::Double(f64::from_le_bytes(word)),
                _ => unreachable!("alignment() accepted {code}"),
            }
        }
    };
    Ok(value)
}

fn read_text<F>(at: usize, len: usize, fetch: &mut F) -> BusResult<String>
where
    F: FnMut(usize, &mut [u8]) -> BusResult<()>,
{
    // The terminator must be readable before the text is allocated.
    let end = at
        .checked_add(len)
        .ok_or(BusError::Malformed("string length overflows"))?;
    fetch(end, &mut [0u8; 1])?;
    let mut raw = vec![0u8; len + 1];
    fetch(at, &mut raw)?;
    if raw.pop() != Some(0) || raw.contains(&0) {
        return Err(BusError::Malformed("string is not NUL-terminated"));
    }
    String::from_utf8(raw).map_err(|_| BusError::Malformed("string is not UTF-8"))
}

/// `fetch` over a contiguous slice.
pub(crate) fn slice_fetch(bytes: &[u8]) -> impl FnMut(usize, &mut [u8]) -> BusResult<()> + '_ {
    move |at, out| {
        let src = at
            .checked_add(out.len())
            .and_then(|end| bytes.get(at..end))
            .ok_or(BusError::Malformed("value runs past the end of the data"))?;
        out.copy_from_slice(src);
        Ok(())
    }
}
