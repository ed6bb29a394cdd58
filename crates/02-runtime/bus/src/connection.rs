//! One bus connection over the kernel transport.
//!
//! Owns the endpoint, the read-only receive pool, the delivery queue and the
//! memfd [`SegmentCache`]. Every method performs at most one translation and
//! returns; waiting for readiness is the caller's business.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::sync::Arc;

use kdbus_wire::abi::{BLOOM_SIZE, COMPAT_FLAGS_MASK, HELLO_ACCEPT_FD};
use kdbus_wire::{format_unique_name, HelloCmd, HelloReply};

use crate::config::ConnectionConfig;
use crate::error::{BusError, BusResult};
use crate::kernel::{is_transient, Kernel};
use crate::message::{
    self, BodyPart, Message, MessageType, PartSource, BUS_SERVICE, ERROR_SERVICE_UNKNOWN,
    SYNTHETIC_SERIAL,
};
use crate::pool::{Pool, PoolSpan};
use crate::receive::{self, Received};
use crate::segment_cache::SegmentCache;
use crate::transcode;

/// Outcome of [`Connection::send`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sent {
    /// The kernel accepted the message.
    Delivered,
    /// Try again later; nothing was sent.
    WouldBlock,
    /// The destination does not exist and the message is not a method call.
    Dropped,
    /// The destination does not exist; a `ServiceUnknown` error reply to the
    /// call was put on the delivery queue.
    ErrorQueued,
}

/// Rejects hello replies announcing features this crate does not know.
pub(crate) fn check_hello(reply: &HelloReply) -> BusResult<()> {
    if reply.conn_flags > COMPAT_FLAGS_MASK || reply.bus_flags > COMPAT_FLAGS_MASK {
        return Err(BusError::Unsupported("incompatible hello flags"));
    }
    if reply.bloom_size != BLOOM_SIZE as u64 {
        return Err(BusError::Unsupported("bloom size"));
    }
    Ok(())
}

pub struct Connection<K: Kernel> {
    kernel: K,
    config: ConnectionConfig,
    pool: Pool,
    hello: HelloReply,
    unique_name: String,
    cache: Arc<SegmentCache>,
    queue: VecDeque<Message>,
    serial: u32,
}

impl<K: Kernel> Connection<K> {
    /// Performs the hello on `kernel` and maps the receive pool.
    pub fn hello(kernel: K, config: ConnectionConfig) -> BusResult<Self> {
        config.validate()?;
        let mut cmd = HelloCmd::new(config.hello_flags, config.attach_flags(), config.pool_size);
        kernel.hello(&mut cmd)?;
        let hello = cmd.reply();
        check_hello(&hello)?;

        let pool = Pool::map(kernel.pool_fd(), config.pool_size)?;
        let unique_name = format_unique_name(hello.id);
        log::debug!(
            "connected as {unique_name}, bus flags {:#x}, conn flags {:#x}",
            hello.bus_flags,
            hello.conn_flags
        );
        let cache = Arc::new(SegmentCache::new(config.memfd_cache));
        Ok(Self {
            kernel,
            config,
            pool,
            hello,
            unique_name,
            cache,
            queue: VecDeque::new(),
            serial: 0,
        })
    }

    pub fn unique_id(&self) -> u64 {
        self.hello.id
    }

    /// `":1.<id>"`.
    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    /// 128-bit id of the bus.
    pub fn bus_id(&self) -> [u8; 16] {
        self.hello.id128
    }

    pub fn hello_reply(&self) -> &HelloReply {
        &self.hello
    }

    /// Whether descriptors can be passed on this connection.
    pub fn can_fds(&self) -> bool {
        self.hello.conn_flags & HELLO_ACCEPT_FD != 0
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn segment_cache(&self) -> &Arc<SegmentCache> {
        &self.cache
    }

    /// Messages waiting in the delivery queue.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Takes the oldest queued message.
    pub fn pop(&mut self) -> Option<Message> {
        self.queue.pop_front()
    }

    fn next_serial(&mut self) -> u32 {
        self.serial = self.serial.wrapping_add(1);
        if self.serial == 0 || self.serial == SYNTHETIC_SERIAL {
            self.serial = 1;
        }
        self.serial
    }

    /// Seals `msg` with the next serial. Memfd parts are sealed first so the
    /// kernel can hand them to the receiver as they are.
    pub fn seal(&mut self, msg: &mut Message) -> BusResult<()> {
        if msg.is_sealed() {
            return Err(BusError::Sealed);
        }
        for part in msg.parts_mut() {
            if let BodyPart::Memfd { segment, sealed, .. } = part {
                if !*sealed {
                    self.kernel.memfd_seal(segment.fd(), true)?;
                    *sealed = true;
                }
            }
        }
        let serial = self.next_serial();
        msg.seal(serial)
    }

    /// Appends `bytes` as a byte array argument, in a memfd segment when it
    /// is at least `memfd_min_size` long.
    pub fn append_payload(&mut self, msg: &mut Message, bytes: &[u8]) -> BusResult<()> {
        if msg.is_sealed() {
            return Err(BusError::Sealed);
        }
        if bytes.len() < self.config.memfd_min_size {
            return msg.append_bytes(bytes);
        }
        let mut segment = self.cache.acquire(&self.kernel)?;
        match segment.reserve(&self.kernel, bytes.len()) {
            Ok(region) => region.copy_from_slice(bytes),
            Err(err) => {
                self.cache.release(&self.kernel, segment);
                return Err(err);
            }
        }
        msg.begin_byte_array(bytes.len())?;
        msg.push_part(BodyPart::Memfd {
            segment,
            len: bytes.len(),
            sealed: false,
        });
        Ok(())
    }

    fn make_room(&mut self) -> BusResult<()> {
        self.reap();
        if self.queue.len() >= self.config.max_queued {
            return Err(BusError::QueueFull);
        }
        Ok(())
    }

    /// Transcodes and sends a sealed message.
    pub fn send(&mut self, msg: &mut Message) -> BusResult<Sent> {
        self.make_room()?;
        let serial = msg.serial();
        let kmsg = transcode::prepare(msg, &self.pool)?;
        let err = match self.kernel.send(kmsg) {
            Ok(()) => {
                log::trace!("sent serial {serial} ({} bytes)", kmsg.len());
                return Ok(Sent::Delivered);
            }
            Err(err) if is_transient(&err) => return Ok(Sent::WouldBlock),
            Err(err) => err,
        };

        let destination = msg.destination().unwrap_or_default();
        let text = match err.raw_os_error() {
            Some(libc::ENXIO) | Some(libc::ESRCH) => format!("Destination {destination} not known"),
            Some(libc::EADDRNOTAVAIL) => format!("Activation of {destination} not requested"),
            _ => return Err(err.into()),
        };
        if msg.kind() != MessageType::MethodCall {
            log::debug!("dropping message to unknown destination {destination}: {text}");
            return Ok(Sent::Dropped);
        }

        let mut reply = Message::error(serial, ERROR_SERVICE_UNKNOWN, &text)?;
        reply.set_sender(Some(BUS_SERVICE))?;
        reply.set_destination(Some(&self.unique_name))?;
        reply.seal(SYNTHETIC_SERIAL)?;
        self.queue.push_back(reply);
        Ok(Sent::ErrorQueued)
    }

    /// Reads one kernel buffer into the delivery queue.
    pub fn read(&mut self) -> BusResult<Received> {
        self.make_room()?;
        receive::read_message(
            &self.kernel,
            &self.pool,
            &self.unique_name,
            self.config.creds_mask,
            &mut self.queue,
        )
    }

    /// Finishes with a message: the pool buffer of a received message goes
    /// back to the kernel right away, memfd segments of a local one go back
    /// to the cache.
    pub fn release(&mut self, mut msg: Message) {
        match msg.take_lease() {
            Some(lease) => {
                let offset = lease.release();
                receive::free(&self.kernel, offset);
            }
            None => self.recycle(msg),
        }
    }

    /// Returns the memfd segments of a locally built message to the cache,
    /// unsealing them first. Received messages are only dropped.
    pub fn recycle(&mut self, mut msg: Message) {
        if msg.lease().is_some() {
            return;
        }
        for part in msg.take_parts() {
            let BodyPart::Memfd { segment, sealed, .. } = part else {
                continue;
            };
            if sealed {
                if let Err(err) = self.kernel.memfd_seal(segment.fd(), false) {
                    log::debug!("closing memfd that cannot be unsealed: {err}");
                    continue;
                }
            }
            let outcome = self.cache.release(&self.kernel, segment);
            log::trace!("recycled memfd segment: {outcome:?}");
        }
    }

    /// Bytes of one body part of a message built or received here.
    pub fn part_bytes<'a>(&'a self, part: &'a BodyPart) -> BusResult<Cow<'a, [u8]>> {
        message::part_bytes(&self.pool, part)
    }

    /// Switches the connection into monitor mode: it receives every message
    /// on the bus.
    pub fn enable_monitor(&mut self) -> BusResult<()> {
        self.kernel.monitor(true)?;
        Ok(())
    }

    /// Frees pool buffers of received messages dropped without
    /// [`Connection::release`].
    pub fn reap(&mut self) {
        for offset in self.pool.take_pending_frees() {
            receive::free(&self.kernel, offset);
        }
    }
}

impl<K: Kernel> PartSource for Connection<K> {
    fn pool_bytes(&self, span: &PoolSpan) -> BusResult<&[u8]> {
        self.pool.span_bytes(span)
    }
}

impl<K: Kernel> Drop for Connection<K> {
    fn drop(&mut self) {
        for msg in std::mem::take(&mut self.queue) {
            self.release(msg);
        }
        self.reap();
        let flushed = self.cache.flush();
        log::trace!("closing {}, flushed {flushed} cached segments", self.unique_name);
    }
}

impl<K: Kernel> std::fmt::Debug for Connection<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("unique_name", &self.unique_name)
            .field("queued", &self.queue.len())
            .field("serial", &self.serial)
            .field("cache", &self.cache)
            .finish()
    }
}
