//! Argument cursor over a message body that may be split across parts.

use std::borrow::Cow;

use super::marshal::{self, is_basic, Value};
use super::{BodyPart, Message};
use crate::error::{BusError, BusResult};
use crate::pool::PoolSpan;

/// Resolves pool spans to bytes.
pub trait PartSource {
    fn pool_bytes(&self, span: &PoolSpan) -> BusResult<&[u8]>;
}

/// Source for messages that never reference a pool.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoPool;

impl PartSource for NoPool {
    fn pool_bytes(&self, _span: &PoolSpan) -> BusResult<&[u8]> {
        Err(BusError::StalePoolRef)
    }
}

/// Read position: next signature character and body offset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Cursor {
    sig_index: usize,
    offset: usize,
}

impl Cursor {
    pub fn sig_index(&self) -> usize {
        self.sig_index
    }

    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// Bytes of one body part. Memfd parts must be mapped first
/// (see [`Message::map_parts`]).
pub fn part_bytes<'a, S: PartSource + ?Sized>(
    source: &'a S,
    part: &'a BodyPart,
) -> BusResult<Cow<'a, [u8]>> {
    Ok(match part {
        BodyPart::Inline(bytes) => Cow::Borrowed(bytes.as_slice()),
        BodyPart::Zero(len) => Cow::Owned(vec![0; *len]),
        BodyPart::Pool(span) => Cow::Borrowed(source.pool_bytes(span)?),
        BodyPart::Memfd { segment, len, .. } => {
            let mapped = segment.as_slice();
            if mapped.len() < *len {
                return Err(BusError::Malformed("memfd part is not mapped"));
            }
            Cow::Borrowed(&mapped[..*len])
        }
    })
}

impl Message {
    /// Maps memfd parts that are not mapped yet.
    pub fn map_parts(&mut self) -> BusResult<()> {
        for part in self.parts_mut() {
            if let BodyPart::Memfd { segment, len, .. } = part {
                segment.map_readonly(*len)?;
            }
        }
        Ok(())
    }

    /// Moves the cursor back to the first argument.
    pub fn rewind(&mut self) -> BusResult<()> {
        if !self.sealed {
            return Err(BusError::NotSealed);
        }
        self.map_parts()?;
        self.cursor = Cursor::default();
        Ok(())
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn set_cursor(&mut self, cursor: Cursor) {
        self.cursor = cursor;
    }

    /// Type code of the next argument, `None` at the end of the signature.
    pub fn peek_type(&self) -> Option<char> {
        self.fields
            .signature
            .as_bytes()
            .get(self.cursor.sig_index)
            .map(|&b| b as char)
    }

    /// Reads the next argument, which must be a basic type.
    pub fn read_basic<S: PartSource + ?Sized>(&mut self, source: &S) -> BusResult<Value> {
        let code = self.peek_type().ok_or(BusError::Type { found: None })?;
        if !code.is_ascii() || !is_basic(code as u8) {
            return Err(BusError::Type { found: Some(code) });
        }
        let mut offset = self.cursor.offset;
        let value = marshal::read(code as u8, &mut offset, |at, out| {
            self.copy_out(source, at, out)
        })?;
        self.cursor = Cursor {
            sig_index: self.cursor.sig_index + 1,
            offset,
        };
        Ok(value)
    }

    /// Reads the next argument, which must be a byte array (`ay`).
    pub fn read_byte_array<S: PartSource + ?Sized>(&mut self, source: &S) -> BusResult<Vec<u8>> {
        let sig = self.fields.signature.as_bytes();
        let at = self.cursor.sig_index;
        if sig.get(at..at + 2) != Some(b"ay".as_slice()) {
            return Err(BusError::Type {
                found: self.peek_type(),
            });
        }
        let mut offset = self.cursor.offset;
        let len = match marshal::read(b'u', &mut offset, |at, out| self.copy_out(source, at, out))? {
            Value::Uint32(len) => len as usize,
            _ => unreachable!("'u' decodes as Uint32"),
        };
        let mut bytes = vec![0u8; len];
        self.copy_out(source, offset, &mut bytes)?;
        self.cursor = Cursor {
            sig_index: at + 2,
            offset: offset + len,
        };
        Ok(bytes)
    }

    /// The whole body as one contiguous buffer.
    pub fn body_bytes<S: PartSource + ?Sized>(&self, source: &S) -> BusResult<Vec<u8>> {
        let mut out = vec![0u8; self.body_len];
        self.copy_out(source, 0, &mut out)?;
        Ok(out)
    }

    /// Copies body bytes `[at, at + out.len())` into `out`.
    fn copy_out<S: PartSource + ?Sized>(&self, source: &S, at: usize, out: &mut [u8]) -> BusResult<()> {
        let end = at
            .checked_add(out.len())
            .filter(|&end| end <= self.body_len)
            .ok_or(BusError::Malformed("argument runs past the end of the body"))?;
        let mut part_start = 0;
        for part in &self.parts {
            let part_end = part_start + part.len();
            if part_end > at && part_start < end {
                let from = at.max(part_start);
                let to = end.min(part_end);
                let dst = &mut out[from - at..to - at];
                match part {
                    BodyPart::Zero(_) => dst.fill(0),
                    _ => {
                        let bytes = part_bytes(source, part)?;
                        dst.copy_from_slice(&bytes[from - part_start..to - part_start]);
                    }
                }
            }
            if part_end >= end {
                break;
            }
            part_start = part_end;
        }
        Ok(())
    }
}
