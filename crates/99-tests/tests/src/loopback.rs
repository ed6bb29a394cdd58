//! In-process stand-in for the kernel bus.
//!
//! Every endpoint gets a real memfd as its receive pool, so a connection maps
//! it exactly like a kernel pool. Delivery copies vector payloads into the
//! receiver's pool (offsets relative to the delivered message), duplicates
//! memfds and descriptors into the receiver's hands, and attaches the
//! metadata the receiver asked for at hello time.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use kdbus_bus::{ControlDevice, Kernel, RequestNameFlags};
use kdbus_wire::abi::{
    align8, item_footprint, ItemType, ATTACH_COMM, ATTACH_CREDS, ATTACH_NAMES, ATTACH_TIMESTAMP,
    BLOOM_SIZE, CREDS_PAYLOAD_SIZE, DST_ID_BROADCAST, DST_ID_NAME, HELLO_ACCEPT_FD,
    ID_CHANGE_PAYLOAD_SIZE, KMSG_HEADER_SIZE, MSG_FLAGS_NO_AUTO_START, NAME_ALLOW_REPLACEMENT,
    NAME_CHANGE_FIXED_SIZE, NAME_QUEUE, NAME_REPLACE_EXISTING, PAYLOAD_DBUS1, PAYLOAD_ITEM_FOOTPRINT, PAYLOAD_KERNEL, PAYLOAD_OFF_ZERO, SRC_ID_KERNEL,
    TIMESTAMP_PAYLOAD_SIZE,
};
use kdbus_wire::{
    HelloCmd, HelloReply, Item, ItemCreds, ItemTimestamp, ItemWriter, KmsgBuf, KmsgHeader,
    KmsgView, MakeCmd,
};
use parking_lot::Mutex;

/// 128-bit id every loopback bus reports.
pub const BUS_ID: [u8; 16] = *b"loopback-bus-id!";

/// Command name the loopback attaches as comm metadata.
pub const COMM: &str = "loopback";

const START_TIME_NS: u64 = 5_000_000_000;
const REALTIME_BASE_NS: u64 = 1_700_000_000_000_000_000;

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

/// Creates an anonymous memfd of size zero.
pub fn memfd(name: &str) -> io::Result<OwnedFd> {
    let name = CString::new(name).map_err(|_| errno(libc::EINVAL))?;
    // SAFETY: `name` is NUL-terminated and outlives the call.
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: memfd_create returned a fresh descriptor nobody else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn inode(fd: BorrowedFd<'_>) -> io::Result<(u64, u64)> {
    let meta = File::from(fd.try_clone_to_owned()?).metadata()?;
    Ok((meta.dev(), meta.ino()))
}

fn close_raw(fd: RawFd) {
    if fd >= 0 {
        // SAFETY: only called for descriptors installed by delivery that no
        // receiver ever took ownership of.
        drop(unsafe { OwnedFd::from_raw_fd(fd) });
    }
}

/// Values the bus puts into hello replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HelloOverrides {
    pub bloom_size: u64,
    pub bus_flags: u64,
    /// OR'ed into the connection flags the client asked for.
    pub extra_conn_flags: u64,
}

impl Default for HelloOverrides {
    fn default() -> Self {
        Self {
            bloom_size: BLOOM_SIZE as u64,
            bus_flags: 0,
            extra_conn_flags: 0,
        }
    }
}

/// Kernel call counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Send calls, successful or not.
    pub sends: u64,
    /// Messages placed into a receiver's pool by a send.
    pub delivered: u64,
    pub frees: u64,
}

struct NameOwner {
    id: u64,
    activator: bool,
    /// Kernel `NAME_*` flags the owner asked with.
    flags: u64,
    /// Queued requests as (id, flags), next owner first.
    waiting: VecDeque<(u64, u64)>,
}

impl NameOwner {
    fn activator(id: u64) -> Self {
        Self {
            id,
            activator: true,
            flags: 0,
            waiting: VecDeque::new(),
        }
    }
}

struct Peer {
    pool: File,
    pool_size: u64,
    conn_flags: u64,
    attach_flags: u64,
    monitor: bool,
    queue: VecDeque<u64>,
    /// Offset → length of every buffer not yet freed.
    live: BTreeMap<u64, u64>,
}

impl Peer {
    fn alloc(&mut self, len: usize) -> io::Result<u64> {
        let len = align8(len) as u64;
        let mut at = 0;
        for (&start, &size) in &self.live {
            if start - at >= len {
                break;
            }
            at = start + size;
        }
        if at + len > self.pool_size {
            return Err(errno(libc::ENOBUFS));
        }
        self.live.insert(at, len);
        Ok(at)
    }
}

enum Piece<'a> {
    Bytes(&'a [u8]),
    Zero(u64),
    Memfd(BorrowedFd<'a>, u64),
}

/// A sent kmsg, decoded once for delivery to any number of peers.
struct Outgoing<'a> {
    header: KmsgHeader,
    dst_name: Option<&'a str>,
    pieces: Vec<Piece<'a>>,
    fds: Vec<BorrowedFd<'a>>,
}

impl<'a> Outgoing<'a> {
    fn parse(view: &KmsgView<'a>) -> io::Result<Self> {
        let mut out = Outgoing {
            header: *view.header(),
            dst_name: None,
            pieces: Vec::new(),
            fds: Vec::new(),
        };
        for raw in view.items() {
            let item = raw
                .and_then(|raw| raw.decode())
                .map_err(|_| errno(libc::EINVAL))?;
            match item {
                Item::PayloadVec { address: 0, size } => out.pieces.push(Piece::Zero(size)),
                Item::PayloadVec { address, size } => {
                    let len = usize::try_from(size).map_err(|_| errno(libc::EMSGSIZE))?;
                    // SAFETY: the sender's vectors point into memory it keeps
                    // alive and unchanged for the duration of the send call.
                    let bytes = unsafe { std::slice::from_raw_parts(address as *const u8, len) };
                    out.pieces.push(Piece::Bytes(bytes));
                }
                Item::PayloadMemfd { fd, size } => {
                    // SAFETY: the sender keeps its memfd open during the call.
                    out.pieces.push(Piece::Memfd(unsafe { BorrowedFd::borrow_raw(fd) }, size));
                }
                Item::Fds(list) => {
                    for fd in list.iter() {
                        if fd < 0 {
                            return Err(errno(libc::EBADF));
                        }
                        // SAFETY: as for memfds.
                        out.fds.push(unsafe { BorrowedFd::borrow_raw(fd) });
                    }
                }
                Item::DstName(name) => out.dst_name = Some(name),
                Item::Bloom(_) => {}
                other => {
                    log::debug!("loopback rejects item {other:?} in a sent message");
                    return Err(errno(libc::EINVAL));
                }
            }
        }
        Ok(out)
    }
}

enum Meta {
    Timestamp(ItemTimestamp),
    Creds(ItemCreds),
    Comm,
    Names(Vec<u8>),
}

impl Meta {
    fn footprint(&self) -> usize {
        match self {
            Meta::Timestamp(_) => item_footprint(TIMESTAMP_PAYLOAD_SIZE),
            Meta::Creds(_) => item_footprint(CREDS_PAYLOAD_SIZE),
            Meta::Comm => 2 * item_footprint(COMM.len() + 1),
            Meta::Names(names) => item_footprint(names.len()),
        }
    }

    fn write(&self, writer: &mut ItemWriter) {
        match self {
            Meta::Timestamp(ts) => writer.push_timestamp(ts),
            Meta::Creds(creds) => writer.push_creds(creds),
            Meta::Comm => {
                writer.push_str(ItemType::PidComm, COMM);
                writer.push_str(ItemType::TidComm, COMM);
            }
            Meta::Names(names) => writer.push_bytes(ItemType::Names, names),
        }
    }
}

#[derive(Default)]
struct BusState {
    next_id: u64,
    peers: BTreeMap<u64, Peer>,
    names: HashMap<String, NameOwner>,
    /// (device, inode) of sealed memfds.
    sealed: HashSet<(u64, u64)>,
    hello: HelloOverrides,
    announce: bool,
    send_error: Option<i32>,
    stats: Stats,
    clock_ns: u64,
}

impl BusState {
    fn peer(&mut self, id: u64) -> io::Result<&mut Peer> {
        self.peers.get_mut(&id).ok_or(errno(libc::ENXIO))
    }

    fn hello(&mut self, pool: File, cmd: &mut HelloCmd) -> io::Result<u64> {
        let pool_size = cmd.pool_size();
        if pool_size == 0 || pool_size % 4096 != 0 {
            return Err(errno(libc::EINVAL));
        }
        let starter = cmd
            .starter_name()
            .map_err(|_| errno(libc::EINVAL))?
            .map(str::to_owned);
        if starter.as_ref().is_some_and(|name| self.names.contains_key(name)) {
            return Err(errno(libc::EEXIST));
        }
        pool.set_len(pool_size)?;

        self.next_id += 1;
        let id = self.next_id;
        let reply = HelloReply {
            conn_flags: cmd.conn_flags() | self.hello.extra_conn_flags,
            bus_flags: self.hello.bus_flags,
            id,
            bloom_size: self.hello.bloom_size,
            id128: BUS_ID,
        };
        cmd.set_reply(&reply);
        self.peers.insert(
            id,
            Peer {
                pool,
                pool_size,
                conn_flags: reply.conn_flags,
                attach_flags: cmd.attach_flags(),
                monitor: false,
                queue: VecDeque::new(),
                live: BTreeMap::new(),
            },
        );
        if let Some(name) = starter {
            self.names.insert(name, NameOwner::activator(id));
        }
        if self.announce {
            self.announce_id(ItemType::IdAdd, id);
        }
        log::trace!("loopback hello: peer {id}");
        Ok(id)
    }

    fn disconnect(&mut self, id: u64) {
        let Some(peer) = self.peers.remove(&id) else {
            return;
        };
        for offset in peer.queue {
            discard(&peer.pool, offset);
        }
        for owner in self.names.values_mut() {
            owner.waiting.retain(|(waiter, _)| *waiter != id);
        }
        let owned: Vec<String> = self
            .names
            .iter()
            .filter(|(_, owner)| owner.id == id)
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            self.drop_owner(&name);
        }
        if self.announce {
            self.announce_id(ItemType::IdRemove, id);
        }
    }

    fn place(&mut self, dst: u64, bytes: &[u8]) -> io::Result<u64> {
        let peer = self.peer(dst)?;
        let offset = peer.alloc(bytes.len())?;
        if let Err(err) = peer.pool.write_all_at(bytes, offset) {
            peer.live.remove(&offset);
            return Err(err);
        }
        peer.queue.push_back(offset);
        Ok(offset)
    }

    fn kernel_message(
        &mut self,
        dst: u64,
        cookie_reply: u64,
        payload_len: usize,
        build: impl FnOnce(&mut ItemWriter),
    ) -> io::Result<()> {
        let bound = KMSG_HEADER_SIZE + item_footprint(payload_len);
        let mut writer = ItemWriter::for_kmsg(bound).ok_or(errno(libc::ENOMEM))?;
        build(&mut writer);
        let mut kmsg = writer.finish();
        KmsgHeader {
            size: kmsg.len() as u64,
            dst_id: dst,
            src_id: SRC_ID_KERNEL,
            payload_type: PAYLOAD_KERNEL,
            timeout_or_reply: cookie_reply,
            ..Default::default()
        }
        .write(kmsg.as_mut_bytes());
        self.place(dst, kmsg.as_bytes()).map(drop)
    }

    /// Removes the current owner of `name`, handing it to the next waiter.
    fn drop_owner(&mut self, name: &str) {
        let Some(mut owner) = self.names.remove(name) else {
            return;
        };
        let next = owner.waiting.pop_front();
        if let Some((id, flags)) = next {
            self.names.insert(
                name.to_owned(),
                NameOwner {
                    id,
                    activator: false,
                    flags,
                    waiting: owner.waiting,
                },
            );
        }
        if self.announce {
            self.announce_name(name, owner.id, next.map_or(0, |(id, _)| id));
        }
    }

    fn announce_id(&mut self, ty: ItemType, id: u64) {
        let others: Vec<u64> = self.peers.keys().copied().filter(|&peer| peer != id).collect();
        for dst in others {
            let sent = self.kernel_message(dst, 0, ID_CHANGE_PAYLOAD_SIZE, |w| {
                w.push_id_change(ty, id, 0)
            });
            if let Err(err) = sent {
                log::debug!("loopback could not announce peer {id} to {dst}: {err}");
            }
        }
    }

    fn announce_name(&mut self, name: &str, old_id: u64, new_id: u64) {
        let ty = match (old_id, new_id) {
            (0, _) => ItemType::NameAdd,
            (_, 0) => ItemType::NameRemove,
            _ => ItemType::NameChange,
        };
        let len = NAME_CHANGE_FIXED_SIZE + name.len() + 1;
        let peers: Vec<u64> = self.peers.keys().copied().collect();
        for dst in peers {
            let sent = self.kernel_message(dst, 0, len, |w| {
                w.push_name_change(ty, old_id, new_id, 0, name)
            });
            if let Err(err) = sent {
                log::debug!("loopback could not announce {name} to {dst}: {err}");
            }
        }
    }

    fn is_sealed(&self, fd: BorrowedFd<'_>) -> io::Result<bool> {
        Ok(self.sealed.contains(&inode(fd)?))
    }

    fn send(&mut self, src: u64, kmsg: &KmsgBuf) -> io::Result<()> {
        self.stats.sends += 1;
        if let Some(code) = self.send_error.take() {
            return Err(errno(code));
        }
        let view = KmsgView::new(kmsg.as_bytes()).map_err(|_| errno(libc::EINVAL))?;
        let out = Outgoing::parse(&view)?;
        if out.header.payload_type != PAYLOAD_DBUS1 {
            return Err(errno(libc::EINVAL));
        }
        for piece in &out.pieces {
            if let Piece::Memfd(fd, _) = piece {
                if !self.is_sealed(*fd)? {
                    return Err(errno(libc::EPERM));
                }
            }
        }

        let broadcast = out.header.dst_id == DST_ID_BROADCAST;
        let mut targets: Vec<u64> = match out.header.dst_id {
            DST_ID_BROADCAST => self.peers.keys().copied().filter(|&id| id != src).collect(),
            DST_ID_NAME => {
                let name = out.dst_name.ok_or(errno(libc::EINVAL))?;
                match self.names.get(name) {
                    None => return Err(errno(libc::ESRCH)),
                    Some(owner)
                        if owner.activator && out.header.flags & MSG_FLAGS_NO_AUTO_START != 0 =>
                    {
                        return Err(errno(libc::EADDRNOTAVAIL))
                    }
                    Some(owner) => vec![owner.id],
                }
            }
            id if self.peers.contains_key(&id) => vec![id],
            _ => return Err(errno(libc::ENXIO)),
        };
        if !broadcast {
            let monitors = self
                .peers
                .iter()
                .filter(|(id, peer)| peer.monitor && **id != src && !targets.contains(*id))
                .map(|(id, _)| *id)
                .collect::<Vec<_>>();
            targets.extend(monitors);
        }

        for (index, dst) in targets.into_iter().enumerate() {
            match self.deliver(src, dst, &out) {
                Ok(()) => self.stats.delivered += 1,
                // Broadcasts and monitor copies are best effort.
                Err(err) if broadcast || index > 0 => {
                    log::debug!("loopback dropped a copy for {dst}: {err}")
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn metadata(&mut self, src: u64, attach: u64) -> Vec<Meta> {
        let mut meta = Vec::new();
        self.clock_ns += 1_000;
        if attach & ATTACH_TIMESTAMP != 0 {
            meta.push(Meta::Timestamp(ItemTimestamp {
                monotonic_ns: self.clock_ns,
                realtime_ns: REALTIME_BASE_NS + self.clock_ns,
            }));
        }
        if attach & ATTACH_CREDS != 0 {
            // SAFETY: plain getters without failure modes.
            let (uid, gid, pid) = unsafe { (libc::getuid(), libc::getgid(), libc::getpid()) };
            meta.push(Meta::Creds(ItemCreds {
                uid: u64::from(uid),
                gid: u64::from(gid),
                pid: pid as u64,
                tid: pid as u64,
                starttime: START_TIME_NS,
            }));
        }
        if attach & ATTACH_COMM != 0 {
            meta.push(Meta::Comm);
        }
        if attach & ATTACH_NAMES != 0 {
            let mut names: Vec<&String> = self
                .names
                .iter()
                .filter(|(_, owner)| owner.id == src && !owner.activator)
                .map(|(name, _)| name)
                .collect();
            names.sort();
            if !names.is_empty() {
                let mut list = Vec::new();
                for name in names {
                    list.extend_from_slice(name.as_bytes());
                    list.push(0);
                }
                meta.push(Meta::Names(list));
            }
        }
        meta
    }

    fn deliver(&mut self, src: u64, dst: u64, out: &Outgoing<'_>) -> io::Result<()> {
        let peer = self.peer(dst)?;
        if !out.fds.is_empty() && peer.conn_flags & HELLO_ACCEPT_FD == 0 {
            return Err(errno(libc::ECOMM));
        }
        let attach = peer.attach_flags;

        // Installed descriptors are closed again unless delivery succeeds.
        let mut memfds = Vec::new();
        for piece in &out.pieces {
            if let Piece::Memfd(fd, _) = piece {
                memfds.push(fd.try_clone_to_owned()?);
            }
        }
        let fds = out
            .fds
            .iter()
            .map(|fd| fd.try_clone_to_owned())
            .collect::<io::Result<Vec<_>>>()?;
        let meta = self.metadata(src, attach);

        let mut items_len = KMSG_HEADER_SIZE + PAYLOAD_ITEM_FOOTPRINT * out.pieces.len();
        if let Some(name) = out.dst_name {
            items_len += item_footprint(name.len() + 1);
        }
        if !fds.is_empty() {
            items_len += item_footprint(4 * fds.len());
        }
        items_len += meta.iter().map(Meta::footprint).sum::<usize>();

        let mut writer = ItemWriter::for_kmsg(items_len).ok_or(errno(libc::ENOMEM))?;
        if let Some(name) = out.dst_name {
            writer.push_dst_name(name);
        }
        let mut data = Vec::new();
        let mut memfd_iter = memfds.iter();
        for piece in &out.pieces {
            match piece {
                Piece::Bytes(bytes) => {
                    let offset = (items_len + data.len()) as u64;
                    writer.push_payload_off(offset, bytes.len() as u64);
                    data.extend_from_slice(bytes);
                    data.resize(align8(data.len()), 0);
                }
                Piece::Zero(size) => writer.push_payload_off(PAYLOAD_OFF_ZERO, *size),
                Piece::Memfd(_, size) => {
                    let fd = memfd_iter.next().ok_or(errno(libc::EINVAL))?;
                    writer.push_payload_memfd(fd.as_raw_fd(), *size);
                }
            }
        }
        if !fds.is_empty() {
            let raw: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
            writer.push_fds(&raw);
        }
        for item in &meta {
            item.write(&mut writer);
        }

        let items = writer.finish();
        let mut bytes = items.as_bytes().to_vec();
        bytes.resize(items_len, 0);
        bytes.extend_from_slice(&data);
        KmsgHeader {
            size: bytes.len() as u64,
            src_id: src,
            timeout_or_reply: 0,
            ..out.header
        }
        .write(&mut bytes);

        self.place(dst, &bytes)?;
        for fd in memfds.into_iter().chain(fds) {
            let _ = fd.into_raw_fd();
        }
        log::trace!("loopback delivered {} bytes from {src} to {dst}", bytes.len());
        Ok(())
    }
}

/// Closes the descriptors of a delivered but never received message.
fn discard(pool: &File, offset: u64) {
    let mut size = [0u8; 8];
    if pool.read_exact_at(&mut size, offset).is_err() {
        return;
    }
    let mut bytes = vec![0u8; u64::from_ne_bytes(size) as usize];
    if pool.read_exact_at(&mut bytes, offset).is_err() {
        return;
    }
    let Ok(view) = KmsgView::new(&bytes) else {
        return;
    };
    for item in view.items().filter_map(|raw| raw.and_then(|raw| raw.decode()).ok()) {
        match item {
            Item::Fds(list) => list.iter().for_each(close_raw),
            Item::PayloadMemfd { fd, .. } => close_raw(fd),
            _ => {}
        }
    }
}

/// One simulated bus. Clones share it.
#[derive(Clone, Default)]
pub struct LoopbackBus {
    state: Arc<Mutex<BusState>>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a fresh endpoint; it joins the bus at hello.
    pub fn endpoint(&self) -> io::Result<LoopbackEndpoint> {
        Ok(LoopbackEndpoint {
            bus: self.clone(),
            pool: memfd("kdbus-pool")?,
            id: AtomicU64::new(0),
        })
    }

    pub fn set_hello_overrides(&self, overrides: HelloOverrides) {
        self.state.lock().hello = overrides;
    }

    /// Emits id and name notifications as peers come and go.
    pub fn set_announce(&self, announce: bool) {
        self.state.lock().announce = announce;
    }

    /// Makes the next send fail with `code` before anything is delivered.
    pub fn fail_next_send(&self, code: i32) {
        self.state.lock().send_error = Some(code);
    }

    pub fn stats(&self) -> Stats {
        self.state.lock().stats
    }

    pub fn peers(&self) -> Vec<u64> {
        self.state.lock().peers.keys().copied().collect()
    }

    /// Messages delivered to `id` and not yet received.
    pub fn queued(&self, id: u64) -> usize {
        self.state.lock().peers.get(&id).map_or(0, |peer| peer.queue.len())
    }

    /// Pool buffers of `id` not yet freed.
    pub fn live_buffers(&self, id: u64) -> usize {
        self.state.lock().peers.get(&id).map_or(0, |peer| peer.live.len())
    }

    pub fn is_sealed(&self, fd: BorrowedFd<'_>) -> io::Result<bool> {
        self.state.lock().is_sealed(fd)
    }

    /// Owner of a well-known name and whether it is an activator.
    pub fn owner(&self, name: &str) -> Option<(u64, bool)> {
        self.state
            .lock()
            .names
            .get(name)
            .map(|owner| (owner.id, owner.activator))
    }

    /// Requests `name` for `id` the way the kernel does: an activator is
    /// always replaced, a live owner only when it allows replacement and the
    /// request asks for it. Otherwise the request queues or fails with
    /// `EEXIST`. Returns whether `id` owns the name now.
    pub fn acquire_name(&self, id: u64, name: &str, flags: RequestNameFlags) -> io::Result<bool> {
        let flags = flags.kernel_flags();
        let mut state = self.state.lock();
        state.peer(id)?;
        let (old, waiting) = match state.names.get_mut(name) {
            None => (0, VecDeque::new()),
            Some(owner) if owner.activator => (owner.id, VecDeque::new()),
            Some(owner) if owner.id == id => return Err(errno(libc::EALREADY)),
            Some(owner)
                if flags & NAME_REPLACE_EXISTING != 0
                    && owner.flags & NAME_ALLOW_REPLACEMENT != 0 =>
            {
                let mut waiting = std::mem::take(&mut owner.waiting);
                waiting.retain(|(waiter, _)| *waiter != id);
                if owner.flags & NAME_QUEUE != 0 {
                    waiting.push_front((owner.id, owner.flags));
                }
                (owner.id, waiting)
            }
            Some(owner) if flags & NAME_QUEUE != 0 => {
                if !owner.waiting.iter().any(|(waiter, _)| *waiter == id) {
                    owner.waiting.push_back((id, flags));
                }
                return Ok(false);
            }
            Some(_) => return Err(errno(libc::EEXIST)),
        };
        state.names.insert(
            name.to_owned(),
            NameOwner {
                id,
                activator: false,
                flags,
                waiting,
            },
        );
        if state.announce {
            state.announce_name(name, old, id);
        }
        Ok(true)
    }

    /// Gives up `name`; the first queued request takes it over.
    pub fn release_name(&self, id: u64, name: &str) -> io::Result<()> {
        let mut state = self.state.lock();
        match state.names.get(name) {
            Some(owner) if owner.id == id => {}
            _ => return Err(errno(libc::ESRCH)),
        }
        state.drop_owner(name);
        Ok(())
    }

    /// Queues a kernel notification for `dst`; `build` writes its single
    /// item of `payload_len` bytes.
    pub fn inject_kernel(
        &self,
        dst: u64,
        cookie_reply: u64,
        payload_len: usize,
        build: impl FnOnce(&mut ItemWriter),
    ) -> io::Result<()> {
        self.state
            .lock()
            .kernel_message(dst, cookie_reply, payload_len, build)
    }

    /// Tells `dst` that its call with serial `cookie` timed out.
    pub fn reply_timeout(&self, dst: u64, cookie: u64) -> io::Result<()> {
        self.inject_kernel(dst, cookie, 0, |w| w.push_empty(ItemType::ReplyTimeout))
    }

    /// Tells `dst` that the peer handling its call with serial `cookie` died.
    pub fn reply_dead(&self, dst: u64, cookie: u64) -> io::Result<()> {
        self.inject_kernel(dst, cookie, 0, |w| w.push_empty(ItemType::ReplyDead))
    }

    /// Queues raw bytes for `dst` as if the kernel had written them.
    pub fn inject_raw(&self, dst: u64, bytes: &[u8]) -> io::Result<u64> {
        self.state.lock().place(dst, bytes)
    }
}

/// One connection's view of a [`LoopbackBus`].
pub struct LoopbackEndpoint {
    bus: LoopbackBus,
    pool: OwnedFd,
    id: AtomicU64,
}

impl LoopbackEndpoint {
    /// Id assigned at hello; 0 before.
    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Acquire)
    }

    pub fn bus(&self) -> &LoopbackBus {
        &self.bus
    }

    fn connected(&self) -> io::Result<u64> {
        match self.id() {
            0 => Err(errno(libc::ENOTCONN)),
            id => Ok(id),
        }
    }
}

impl Kernel for LoopbackEndpoint {
    fn pool_fd(&self) -> BorrowedFd<'_> {
        self.pool.as_fd()
    }

    fn hello(&self, cmd: &mut HelloCmd) -> io::Result<()> {
        if self.id() != 0 {
            return Err(errno(libc::EBUSY));
        }
        let pool = File::from(self.pool.try_clone()?);
        let id = self.bus.state.lock().hello(pool, cmd)?;
        self.id.store(id, Ordering::Release);
        Ok(())
    }

    fn send(&self, kmsg: &KmsgBuf) -> io::Result<()> {
        let id = self.connected()?;
        self.bus.state.lock().send(id, kmsg)
    }

    fn recv(&self) -> io::Result<u64> {
        let id = self.connected()?;
        let mut state = self.bus.state.lock();
        state.peer(id)?.queue.pop_front().ok_or(errno(libc::EAGAIN))
    }

    fn free(&self, offset: u64) -> io::Result<()> {
        let id = self.connected()?;
        let mut state = self.bus.state.lock();
        state.peer(id)?.live.remove(&offset).ok_or(errno(libc::EINVAL))?;
        state.stats.frees += 1;
        Ok(())
    }

    fn memfd_new(&self) -> io::Result<OwnedFd> {
        memfd("kdbus-memfd")
    }

    fn memfd_set_size(&self, memfd: BorrowedFd<'_>, size: u64) -> io::Result<()> {
        if self.bus.is_sealed(memfd)? {
            return Err(errno(libc::EPERM));
        }
        File::from(memfd.try_clone_to_owned()?).set_len(size)
    }

    fn memfd_seal(&self, memfd: BorrowedFd<'_>, sealed: bool) -> io::Result<()> {
        let key = inode(memfd)?;
        let mut state = self.bus.state.lock();
        if sealed {
            state.sealed.insert(key);
        } else {
            state.sealed.remove(&key);
        }
        Ok(())
    }

    fn monitor(&self, enable: bool) -> io::Result<()> {
        let id = self.connected()?;
        self.bus.state.lock().peer(id)?.monitor = enable;
        Ok(())
    }
}

impl Drop for LoopbackEndpoint {
    fn drop(&mut self) {
        let id = self.id();
        if id != 0 {
            self.bus.state.lock().disconnect(id);
        }
    }
}

impl std::fmt::Debug for LoopbackEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackEndpoint")
            .field("id", &self.id())
            .finish()
    }
}

#[derive(Default)]
struct ControlState {
    buses: HashMap<String, LoopbackBus>,
    namespaces: HashSet<String>,
    make_reply_flags: u64,
}

/// Control node of a set of loopback buses.
#[derive(Clone)]
pub struct LoopbackControl {
    uid: u32,
    state: Arc<Mutex<ControlState>>,
}

impl LoopbackControl {
    pub fn new(uid: u32) -> Self {
        Self {
            uid,
            state: Arc::default(),
        }
    }

    /// The bus created under `name` (without the uid prefix).
    pub fn bus(&self, name: &str) -> Option<LoopbackBus> {
        let key = format!("{}-{name}", self.uid);
        self.state.lock().buses.get(&key).cloned()
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.state.lock().namespaces.contains(name)
    }

    /// Flags OR'ed into every make reply.
    pub fn set_make_reply_flags(&self, flags: u64) {
        self.state.lock().make_reply_flags = flags;
    }

    fn make_name(cmd: &MakeCmd) -> io::Result<String> {
        cmd.name()
            .map_err(|_| errno(libc::EINVAL))?
            .map(str::to_owned)
            .ok_or(errno(libc::EINVAL))
    }
}

impl ControlDevice for LoopbackControl {
    type Endpoint = LoopbackEndpoint;

    fn uid(&self) -> u32 {
        self.uid
    }

    fn bus_make(&self, cmd: &mut MakeCmd) -> io::Result<OwnedFd> {
        let name = Self::make_name(cmd)?;
        if cmd.bloom_size() != Some(BLOOM_SIZE as u64) {
            return Err(errno(libc::EINVAL));
        }
        if !name.starts_with(&format!("{}-", self.uid)) {
            return Err(errno(libc::EPERM));
        }
        let mut state = self.state.lock();
        if state.buses.contains_key(&name) {
            return Err(errno(libc::EEXIST));
        }
        let handle = memfd("kdbus-control")?;
        state.buses.insert(name, LoopbackBus::new());
        cmd.set_flags(cmd.flags() | state.make_reply_flags);
        Ok(handle)
    }

    fn ns_make(&self, cmd: &mut MakeCmd) -> io::Result<OwnedFd> {
        let name = Self::make_name(cmd)?;
        let mut state = self.state.lock();
        if !state.namespaces.insert(name) {
            return Err(errno(libc::EEXIST));
        }
        cmd.set_flags(cmd.flags() | state.make_reply_flags);
        memfd("kdbus-control")
    }

    fn open(&self, path: &Path) -> io::Result<LoopbackEndpoint> {
        let key = path
            .to_str()
            .and_then(|path| path.strip_prefix("/dev/kdbus/"))
            .and_then(|path| path.strip_suffix("/bus"))
            .ok_or(errno(libc::ENOENT))?;
        let bus = self
            .state
            .lock()
            .buses
            .get(key)
            .cloned()
            .ok_or(errno(libc::ENOENT))?;
        bus.endpoint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_allocation_reuses_freed_gaps() {
        let pool = File::from(memfd("alloc-test").expect("memfd"));
        let mut peer = Peer {
            pool,
            pool_size: 4096,
            conn_flags: 0,
            attach_flags: 0,
            monitor: false,
            queue: VecDeque::new(),
            live: BTreeMap::new(),
        };
        assert_eq!(peer.alloc(100).unwrap(), 0);
        assert_eq!(peer.alloc(10).unwrap(), 104);
        assert_eq!(peer.alloc(8).unwrap(), 120);
        peer.live.remove(&0);
        assert_eq!(peer.alloc(64).unwrap(), 0);
        assert_eq!(peer.alloc(4096).unwrap_err().raw_os_error(), Some(libc::ENOBUFS));
    }
}
