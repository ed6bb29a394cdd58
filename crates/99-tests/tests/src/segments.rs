use std::os::fd::AsFd;
use std::sync::Arc;
use std::thread;

use kdbus_bus::{
    BodyPart, ConnectionConfig, Kernel, Message, Released, SegmentCache, SegmentCacheConfig, Sent,
};

use crate::support::{connect, connect_with, receive};
use crate::LoopbackBus;

fn page() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[test]
fn shared_cache_never_holds_more_than_its_capacity() {
    let bus = LoopbackBus::new();
    let kernel = bus.endpoint().unwrap();
    let cache = Arc::new(SegmentCache::new(SegmentCacheConfig {
        capacity: 3,
        item_size_max: page(),
    }));

    thread::scope(|scope| {
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            let kernel = &kernel;
            scope.spawn(move || {
                for round in 0..16 {
                    let mut segment = cache.acquire(kernel).expect("acquire");
                    segment.reserve(kernel, 64 + round).expect("reserve").fill(round as u8);
                    cache.release(kernel, segment);
                    assert!(cache.len() <= 3);
                }
            });
        }
    });
    assert!(cache.len() <= 3);
    assert!(cache.flush() <= 3);
}

#[test]
fn oversized_segments_are_capped_once() {
    let bus = LoopbackBus::new();
    let kernel = bus.endpoint().unwrap();
    let page = page();
    let cache = SegmentCache::new(SegmentCacheConfig {
        capacity: 2,
        item_size_max: page,
    });

    let mut segment = cache.acquire(&kernel).unwrap();
    segment.reserve(&kernel, 3 * page).unwrap()[0] = 9;
    assert_eq!(
        cache.release(&kernel, segment),
        Released::Capped {
            from: 3 * page,
            to: page
        }
    );

    let segment = cache.acquire(&kernel).unwrap();
    assert_eq!(segment.size(), page);
    assert_eq!(segment.mapping().map(|map| map.len()), Some(page));
    assert_eq!(segment.as_slice()[0], 9);
    assert_eq!(cache.release(&kernel, segment), Released::Cached);
}

#[test]
fn sealed_segments_cannot_be_resized() {
    let bus = LoopbackBus::new();
    let kernel = bus.endpoint().unwrap();
    let memfd = kernel.memfd_new().unwrap();
    kernel.memfd_seal(memfd.as_fd(), true).unwrap();
    let err = kernel.memfd_set_size(memfd.as_fd(), 4096).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EPERM));
    kernel.memfd_seal(memfd.as_fd(), false).unwrap();
    kernel.memfd_set_size(memfd.as_fd(), 4096).unwrap();
}

#[test]
fn recycled_payload_segments_are_reused() {
    let bus = LoopbackBus::new();
    let config = ConnectionConfig {
        memfd_min_size: 1024,
        ..Default::default()
    };
    let mut a = connect_with(&bus, config);
    let mut b = connect(&bus);
    let payload = vec![0x5Au8; 8 * 1024];

    for _ in 0..3 {
        let mut msg = Message::method_call(Some(b.unique_name()), "/", None, "Blob");
        a.append_payload(&mut msg, &payload).unwrap();
        a.seal(&mut msg).unwrap();
        assert_eq!(a.send(&mut msg).unwrap(), Sent::Delivered);
        a.recycle(msg);
        assert_eq!(a.segment_cache().len(), 1);

        let mut received = receive(&mut b);
        assert!(received
            .parts()
            .iter()
            .any(|part| matches!(part, BodyPart::Memfd { sealed: true, .. })));
        received.rewind().unwrap();
        assert_eq!(received.read_byte_array(&b).unwrap(), payload);
        b.release(received);
    }
    assert_eq!(bus.live_buffers(b.unique_id()), 0);
}
