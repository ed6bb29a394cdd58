//! Inbound path: kernel buffer in the pool → [`Message`].
//!
//! Payload offsets in received items are relative to the start of the
//! message inside the pool. Body bytes are never copied: each payload slice
//! past the D-Bus header becomes a [`BodyPart::Pool`] span tagged with the
//! buffer's lease generation.

use std::collections::VecDeque;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use kdbus_wire::abi::{
    DST_ID_BROADCAST, DST_ID_NAME, PAYLOAD_DBUS1, PAYLOAD_KERNEL, PAYLOAD_OFF_ZERO, SRC_ID_KERNEL,
};
use kdbus_wire::{format_unique_name, Item, KmsgView};

use crate::error::{BusError, BusResult};
use crate::kernel::{is_transient, Kernel};
use crate::message::{message_size, BodyPart, CredsMask, Message, Timestamps, BUS_SERVICE};
use crate::notify;
use crate::pool::{Pool, PoolLease};
use crate::segment_cache::Segment;

/// Outcome of one [`crate::Connection::read`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Received {
    /// A message was appended to the delivery queue.
    Queued,
    /// The kernel buffer was consumed without producing a message.
    Dropped,
    /// Nothing to read right now.
    WouldBlock,
}

/// Dequeues one kernel buffer and appends what it translates to onto `queue`.
pub(crate) fn read_message<K: Kernel + ?Sized>(
    kernel: &K,
    pool: &Pool,
    unique_name: &str,
    wanted: CredsMask,
    queue: &mut VecDeque<Message>,
) -> BusResult<Received> {
    let offset = match kernel.recv() {
        Ok(offset) => offset,
        Err(err) if is_transient(&err) => return Ok(Received::WouldBlock),
        Err(err) => return Err(err.into()),
    };
    let view = match KmsgView::in_pool(pool.as_slice(), offset) {
        Ok(view) => view,
        Err(err) => {
            free(kernel, offset);
            return Err(err.into());
        }
    };
    log::trace!(
        "received {} bytes at pool offset {offset:#x}, payload type {:#x}",
        view.header().size,
        view.header().payload_type
    );

    match view.header().payload_type {
        PAYLOAD_DBUS1 => {
            let lease = pool.lease(offset);
            match make_message(pool.as_slice(), &view, &lease, wanted) {
                Ok(mut msg) => {
                    msg.set_lease(lease);
                    queue.push_back(msg);
                    Ok(Received::Queued)
                }
                Err(err) => {
                    lease.release();
                    close_kmsg(kernel, &view, offset);
                    Err(err)
                }
            }
        }
        PAYLOAD_KERNEL => {
            let translated = notify::translate(&view, unique_name);
            close_kmsg(kernel, &view, offset);
            Ok(match translated? {
                Some(msg) => {
                    queue.push_back(msg);
                    Received::Queued
                }
                None => Received::Dropped,
            })
        }
        other => {
            log::debug!("dropping kernel message with unknown payload type {other:#x}");
            close_kmsg(kernel, &view, offset);
            Ok(Received::Dropped)
        }
    }
}

/// Rebuilds the D-Bus message carried by a received kernel buffer.
///
/// `pool` is the whole receive pool; `lease` tags the resulting pool spans.
/// On error no descriptor named by the buffer has been closed.
pub(crate) fn make_message(
    pool: &[u8],
    view: &KmsgView<'_>,
    lease: &PoolLease,
    wanted: CredsMask,
) -> BusResult<Message> {
    let mut header = None;
    let mut total: u64 = 0;
    let mut fds: Vec<RawFd> = Vec::new();
    let mut seclabel = None;
    for raw in view.items() {
        match raw?.decode()? {
            Item::PayloadOff { offset, size } => {
                if header.is_none() {
                    header = Some(pool_slice(pool, lease.offset(), offset, size)?);
                }
                total = total.checked_add(size).ok_or(BusError::Malformed("payload size overflow"))?;
            }
            Item::PayloadMemfd { size, .. } => {
                if header.is_none() {
                    return Err(BusError::Malformed("memfd payload before the header"));
                }
                total = total.checked_add(size).ok_or(BusError::Malformed("payload size overflow"))?;
            }
            Item::Fds(list) => fds.extend(list.iter()),
            Item::Seclabel(label) => seclabel = Some(label),
            _ => {}
        }
    }
    let header = header.ok_or(BusError::Malformed("no message header"))?;
    if message_size(header)? as u64 != total {
        return Err(BusError::Malformed("payload size does not match the header"));
    }
    if fds.iter().any(|&fd| fd < 0) {
        return Err(BusError::Malformed("invalid descriptor in fds item"));
    }

    let mut msg = Message::from_header(header)?;
    // SAFETY: the kernel installed these descriptors for this process and
    // nothing else owns them; on failure ownership is given up again below.
    msg.set_fds(fds.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }).collect());

    if let Err(err) = hydrate(&mut msg, pool, view, lease, seclabel, wanted) {
        msg.detach_descriptors();
        return Err(err);
    }
    Ok(msg)
}

fn hydrate(
    msg: &mut Message,
    pool: &[u8],
    view: &KmsgView<'_>,
    lease: &PoolLease,
    seclabel: Option<&str>,
    wanted: CredsMask,
) -> BusResult<()> {
    let body_begin = msg.header_bytes().len() as u64;
    let mut consumed: u64 = 0;
    let mut dst_name = None;
    let mut mask = CredsMask::empty();

    for raw in view.items() {
        match raw?.decode()? {
            Item::PayloadOff { offset, size } => {
                if consumed + size > body_begin {
                    let skip = body_begin.saturating_sub(consumed);
                    let len = usize::try_from(size - skip)
                        .map_err(|_| BusError::Malformed("payload larger than the pool"))?;
                    if offset == PAYLOAD_OFF_ZERO {
                        msg.push_part(BodyPart::Zero(len));
                    } else {
                        let start = lease
                            .offset()
                            .checked_add(offset)
                            .and_then(|start| start.checked_add(skip))
                            .ok_or(BusError::Malformed("payload offset overflow"))?;
                        pool_slice(pool, start, 0, len as u64)?;
                        msg.push_part(BodyPart::Pool(lease.span(start, len)));
                    }
                }
                consumed += size;
            }
            Item::PayloadMemfd { fd, size } => {
                if consumed < body_begin {
                    return Err(BusError::Malformed("memfd payload overlaps the header"));
                }
                if fd < 0 {
                    return Err(BusError::Malformed("invalid memfd descriptor"));
                }
                let len = usize::try_from(size)
                    .map_err(|_| BusError::Malformed("memfd payload too large"))?;
                // SAFETY: as for fds items; detached again if hydration fails.
                let segment = Segment::new(unsafe { OwnedFd::from_raw_fd(fd) });
                msg.push_part(BodyPart::Memfd {
                    segment,
                    len,
                    sealed: true,
                });
                consumed += size;
            }
            Item::Creds(item) => {
                let creds = msg.creds_mut();
                creds.uid = item.uid as u32;
                creds.gid = item.gid as u32;
                creds.pid = item.pid as u32;
                creds.tid = item.tid as u32;
                creds.pid_starttime = item.starttime / 1000;
                mask |= CredsMask::UID
                    | CredsMask::GID
                    | CredsMask::PID
                    | CredsMask::PID_STARTTIME
                    | CredsMask::TID;
            }
            Item::Timestamp(ts) => msg.set_timestamps(Timestamps {
                monotonic_usec: ts.monotonic_ns / 1000,
                realtime_usec: ts.realtime_ns / 1000,
            }),
            Item::PidComm(comm) => {
                msg.creds_mut().comm = Some(comm.to_owned());
                mask |= CredsMask::COMM;
            }
            Item::TidComm(comm) => {
                msg.creds_mut().tid_comm = Some(comm.to_owned());
                mask |= CredsMask::TID_COMM;
            }
            Item::Exe(exe) => {
                msg.creds_mut().exe = Some(exe.to_owned());
                mask |= CredsMask::EXE;
            }
            Item::Cmdline(cmdline) => {
                msg.creds_mut().cmdline = Some(cmdline.to_vec());
                mask |= CredsMask::CMDLINE;
            }
            Item::Cgroup(cgroup) => {
                msg.creds_mut().cgroup = Some(cgroup.to_owned());
                mask |= CredsMask::CGROUP_DERIVED;
            }
            Item::Audit(audit) => {
                let creds = msg.creds_mut();
                creds.audit_session_id = audit.sessionid as u32;
                creds.audit_login_uid = audit.loginuid as u32;
                mask |= CredsMask::AUDIT;
            }
            Item::Caps(caps) => {
                msg.creds_mut().capability = Some(caps.to_vec());
                mask |= CredsMask::CAPS;
            }
            Item::Names(names) => {
                msg.creds_mut().well_known_names = Some(names.to_vec());
                mask |= CredsMask::WELL_KNOWN_NAMES;
            }
            Item::DstName(name) => dst_name = Some(name),
            Item::Fds(_) | Item::Seclabel(_) => {}
            other => log::debug!("skipping kernel item {other:?}"),
        }
    }

    if let Some(label) = seclabel {
        msg.creds_mut().seclabel = Some(label.to_owned());
        mask |= CredsMask::SELINUX_CONTEXT;
    }

    let header = view.header();
    if header.src_id == SRC_ID_KERNEL {
        msg.set_received_sender(BUS_SERVICE.to_owned());
    } else {
        let sender = format_unique_name(header.src_id);
        msg.creds_mut().unique_name = Some(sender.clone());
        mask |= CredsMask::UNIQUE_NAME;
        msg.set_received_sender(sender);
    }
    if msg.destination().is_none() {
        if let Some(name) = dst_name {
            msg.set_received_destination(name.to_owned());
        } else if header.dst_id != DST_ID_NAME && header.dst_id != DST_ID_BROADCAST {
            msg.set_received_destination(format_unique_name(header.dst_id));
        }
    }
    msg.creds_mut().mask |= mask & wanted;
    Ok(())
}

/// `size` bytes at `base + offset` inside the pool.
fn pool_slice(pool: &[u8], base: u64, offset: u64, size: u64) -> BusResult<&[u8]> {
    let start = base.checked_add(offset).and_then(|start| usize::try_from(start).ok());
    let len = usize::try_from(size).ok();
    start
        .zip(len)
        .and_then(|(start, len)| pool.get(start..start.checked_add(len)?))
        .ok_or(BusError::Malformed("payload outside the pool"))
}

/// Closes every descriptor the kernel passed along with a buffer this
/// process will not turn into a message, then frees the buffer.
pub(crate) fn close_kmsg<K: Kernel + ?Sized>(kernel: &K, view: &KmsgView<'_>, offset: u64) {
    for raw in view.items() {
        match raw.and_then(|raw| raw.decode()) {
            Ok(Item::Fds(list)) => list.iter().for_each(close_raw),
            Ok(Item::PayloadMemfd { fd, .. }) => close_raw(fd),
            Ok(_) => {}
            Err(err) => {
                log::debug!("stopped closing descriptors at a bad item: {err}");
                break;
            }
        }
    }
    free(kernel, offset);
}

fn close_raw(fd: RawFd) {
    if fd >= 0 {
        // SAFETY: the descriptor was installed for this process by the kernel
        // and no owner was ever created for it.
        drop(unsafe { OwnedFd::from_raw_fd(fd) });
    }
}

/// Returns a pool buffer to the kernel; failures are only logged.
pub(crate) fn free<K: Kernel + ?Sized>(kernel: &K, offset: u64) {
    if let Err(err) = kernel.free(offset) {
        log::warn!("failed to free pool buffer at {offset:#x}: {err}");
    }
}
