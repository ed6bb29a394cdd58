//! Outbound path: sealed [`Message`] → kernel item list.
//!
//! The buffer is sized to an exact upper bound before anything is written,
//! then trimmed to what was emitted. Vec items point straight at the
//! message's own storage (header bytes, inline parts, pool spans, mapped
//! memfds), so the returned buffer is cached on the message and is only
//! valid while the message is alive and unchanged.

use std::os::fd::AsRawFd;

use kdbus_wire::abi::{
    item_footprint, BLOOM_SIZE, DST_ID_BROADCAST, DST_ID_NAME, KMSG_HEADER_SIZE,
    MSG_FLAGS_EXPECT_REPLY, MSG_FLAGS_NO_AUTO_START, PAYLOAD_DBUS1, PAYLOAD_ITEM_FOOTPRINT,
};
use kdbus_wire::{parse_unique_name, BloomFilter, ItemWriter, KmsgBuf, KmsgHeader};

use crate::error::{BusError, BusResult};
use crate::message::{part_bytes, BodyPart, HeaderFlags, Message, PartSource};

/// At most this many leading string arguments are hashed into the bloom.
pub const BLOOM_MAX_ARGS: usize = 64;

/// Where the kernel routes a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Destination<'a> {
    /// A unique name, addressed by numeric id.
    Id(u64),
    /// A well-known name the kernel resolves.
    Name(&'a str),
    /// Every connection whose match filter accepts the bloom.
    Broadcast,
}

impl Destination<'_> {
    /// `dst_id` field of the kmsg.
    pub fn dst_id(&self) -> u64 {
        match *self {
            Destination::Id(id) => id,
            Destination::Name(_) => DST_ID_NAME,
            Destination::Broadcast => DST_ID_BROADCAST,
        }
    }
}

pub fn destination_of(msg: &Message) -> BusResult<Destination<'_>> {
    let Some(name) = msg.destination() else {
        return Ok(Destination::Broadcast);
    };
    Ok(match parse_unique_name(name)? {
        Some(id) => Destination::Id(id),
        None => Destination::Name(name),
    })
}

/// Builds (or reuses) the kernel buffer for a sealed message.
pub fn prepare<'m, S: PartSource + ?Sized>(
    msg: &'m mut Message,
    source: &S,
) -> BusResult<&'m KmsgBuf> {
    if !msg.is_sealed() {
        return Err(BusError::NotSealed);
    }
    let kmsg = match msg.take_kmsg() {
        Some(kmsg) => kmsg,
        None => build(msg, source)?,
    };
    Ok(msg.store_kmsg(kmsg))
}

fn build<S: PartSource + ?Sized>(msg: &mut Message, source: &S) -> BusResult<KmsgBuf> {
    let broadcast = matches!(destination_of(msg)?, Destination::Broadcast);
    let bloom = if broadcast {
        Some(bloom_for(msg, source)?)
    } else {
        None
    };
    msg.map_parts()?;

    let msg = &*msg;
    let destination = destination_of(msg)?;
    let routed = msg.destination().is_some();

    let mut bound = KMSG_HEADER_SIZE + PAYLOAD_ITEM_FOOTPRINT * (1 + msg.parts().len());
    if let Destination::Name(name) = destination {
        bound += item_footprint(name.len() + 1);
    }
    if bloom.is_some() {
        bound += item_footprint(BLOOM_SIZE);
    }
    if !msg.fds().is_empty() {
        bound += item_footprint(4 * msg.fds().len());
    }

    let mut writer = ItemWriter::for_kmsg(bound).ok_or(BusError::OutOfMemory(bound))?;
    if let Destination::Name(name) = destination {
        writer.push_dst_name(name);
    }
    writer.push_payload_vec(msg.header_bytes());
    for part in msg.parts() {
        match part {
            BodyPart::Zero(len) => writer.push_zero_vec(*len as u64),
            BodyPart::Memfd {
                segment,
                len,
                sealed: true,
            } if routed && *len > 0 => {
                writer.push_payload_memfd(segment.fd().as_raw_fd(), *len as u64);
            }
            _ => writer.push_payload_vec(&part_bytes(source, part)?),
        }
    }
    if let Some(bloom) = bloom {
        bloom.write_to(writer.push_bloom());
    }
    if !msg.fds().is_empty() {
        let fds: Vec<_> = msg.fds().iter().map(AsRawFd::as_raw_fd).collect();
        writer.push_fds(&fds);
    }

    let mut kmsg = writer.finish();
    assert!(kmsg.len() <= bound, "kmsg of {} bytes exceeds its bound {bound}", kmsg.len());

    let mut flags = 0;
    if !msg.flags().contains(HeaderFlags::NO_REPLY_EXPECTED) {
        flags |= MSG_FLAGS_EXPECT_REPLY;
    }
    if msg.flags().contains(HeaderFlags::NO_AUTO_START) {
        flags |= MSG_FLAGS_NO_AUTO_START;
    }
    KmsgHeader {
        size: kmsg.len() as u64,
        flags,
        dst_id: destination.dst_id(),
        src_id: 0,
        payload_type: PAYLOAD_DBUS1,
        cookie: u64::from(msg.serial()),
        timeout_or_reply: msg.timeout_usec().saturating_mul(1000),
    }
    .write(kmsg.as_mut_bytes());
    log::trace!(
        "transcoded serial {} into {} bytes ({} parts, dst {:#x})",
        msg.serial(),
        kmsg.len(),
        msg.parts().len(),
        destination.dst_id()
    );
    Ok(kmsg)
}

/// Broadcast match filter of a sealed message.
///
/// Reads the leading string-like arguments; the read cursor is left where it
/// was, also when reading fails.
pub fn bloom_for<S: PartSource + ?Sized>(msg: &mut Message, source: &S) -> BusResult<BloomFilter> {
    let mut bloom = BloomFilter::new();
    bloom.add_pair("message-type", msg.kind().as_str());
    if let Some(interface) = msg.interface() {
        bloom.add_pair("interface", interface);
    }
    if let Some(member) = msg.member() {
        bloom.add_pair("member", member);
    }
    if let Some(path) = msg.path() {
        bloom.add_pair("path", path);
        bloom.add_pair("path-slash-prefix", path);
        bloom.add_prefixes("path-slash-prefix", path, '/');
    }

    let saved = msg.cursor();
    let result = add_arguments(&mut bloom, msg, source);
    msg.set_cursor(saved);
    result.map(|()| bloom)
}

fn add_arguments<S: PartSource + ?Sized>(
    bloom: &mut BloomFilter,
    msg: &mut Message,
    source: &S,
) -> BusResult<()> {
    msg.rewind()?;
    for index in 0..BLOOM_MAX_ARGS {
        if !matches!(msg.peek_type(), Some('s' | 'o' | 'g')) {
            break;
        }
        let value = msg.read_basic(source)?;
        let Some(text) = value.as_str() else {
            break;
        };
        let key = format!("arg{index}");
        bloom.add_pair(&key, text);
        bloom.add_prefixes(&format!("{key}-dot-prefix"), text, '.');
        bloom.add_prefixes(&format!("{key}-slash-prefix"), text, '/');
    }
    Ok(())
}
