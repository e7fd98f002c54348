//! Unit tests for the packet pool

use super::*;
use crate::config::PoolConfig;
use rand::Rng;

fn small_config() -> PoolConfig {
    PoolConfig {
        command_buffers: 1,
        event_buffers: 2,
        acl_buffers: 3,
        sco_buffers: 0,
        acl_payload_size: 27,
        sco_payload_size: 60,
    }
}

#[test]
fn test_acquire_until_exhausted() {
    let mut pool = PacketPool::new(&small_config());

    let a = pool.acquire(PacketType::Acl).unwrap();
    let b = pool.acquire(PacketType::Acl).unwrap();
    let c = pool.acquire(PacketType::Acl).unwrap();
    assert_eq!(pool.in_use(PacketType::Acl), 3);
    assert_eq!(pool.available(PacketType::Acl), 0);

    // A fourth buffer is a normal, non-fatal condition
    assert_eq!(pool.acquire(PacketType::Acl).unwrap_err(), PoolError::Exhausted(PacketType::Acl));

    // Other classes are unaffected
    assert!(pool.acquire(PacketType::Event).is_ok());

    pool.release(b).unwrap();
    let d = pool.acquire(PacketType::Acl).unwrap();
    assert_eq!(pool.in_use(PacketType::Acl), 3);

    pool.release(a).unwrap();
    pool.release(c).unwrap();
    pool.release(d).unwrap();
    assert_eq!(pool.in_use(PacketType::Acl), 0);
}

#[test]
fn test_zero_sized_class_is_always_exhausted() {
    let mut pool = PacketPool::new(&small_config());
    assert_eq!(pool.capacity(PacketType::Sco), 0);
    assert_eq!(pool.acquire(PacketType::Sco).unwrap_err(), PoolError::Exhausted(PacketType::Sco));
}

#[test]
fn test_buffer_capacity_matches_class() {
    let mut pool = PacketPool::new(&small_config());
    let mut buffer = pool.acquire(PacketType::Acl).unwrap();

    assert_eq!(buffer.capacity(), 4 + 27);
    assert!(buffer.is_empty());

    buffer.extend_from_slice(&[0u8; 31]).unwrap();
    assert_eq!(buffer.len(), 31);
    assert_eq!(
        buffer.extend_from_slice(&[0]).unwrap_err(),
        PoolError::Overflow { len: 32, capacity: 31 }
    );

    buffer.fill(&[1, 2, 3]).unwrap();
    assert_eq!(buffer.as_slice(), &[1, 2, 3]);
    pool.release(buffer).unwrap();
}

#[test]
fn test_random_acquire_release_never_exceeds_capacity() {
    let mut rng = rand::thread_rng();
    let mut pool = PacketPool::new(&small_config());
    let mut held: Vec<PacketBuffer> = Vec::new();

    for _ in 0..2000 {
        let packet_type = [PacketType::Command, PacketType::Acl, PacketType::Event][rng.gen_range(0..3)];
        if rng.gen_bool(0.55) {
            match pool.acquire(packet_type) {
                Ok(buffer) => held.push(buffer),
                Err(PoolError::Exhausted(t)) => {
                    assert_eq!(t, packet_type);
                    assert_eq!(pool.in_use(t), pool.capacity(t));
                }
                Err(other) => panic!("unexpected error {:?}", other),
            }
        } else if !held.is_empty() {
            let index = rng.gen_range(0..held.len());
            pool.release(held.swap_remove(index)).unwrap();
        }

        for t in PacketType::ALL {
            assert!(pool.in_use(t) <= pool.capacity(t));
            let outstanding = held.iter().filter(|b| b.packet_type() == t).count();
            assert_eq!(pool.in_use(t), outstanding);
        }
    }

    for buffer in held.drain(..) {
        pool.release(buffer).unwrap();
    }
    for t in PacketType::ALL {
        assert_eq!(pool.in_use(t), 0);
    }
}

#[test]
#[cfg_attr(debug_assertions, should_panic(expected = "invalid release"))]
fn test_release_into_foreign_pool_is_detected() {
    let mut pool_a = PacketPool::new(&small_config());
    let mut pool_b = PacketPool::new(&small_config());

    let buffer = pool_a.acquire(PacketType::Event).unwrap();
    // Slot 0 of pool B is free, so the guard catches the foreign buffer
    let result = pool_b.release(buffer);
    assert_eq!(result, Err(PoolError::InvalidRelease(PacketType::Event, 0)));
}

#[test]
fn test_packet_type_indicator() {
    use std::convert::TryFrom;

    assert_eq!(PacketType::try_from(0x02), Ok(PacketType::Acl));
    assert_eq!(PacketType::try_from(0x04), Ok(PacketType::Event));
    assert_eq!(PacketType::try_from(0x05), Err(0x05));
    assert_eq!(PacketType::Command.indicator(), 0x01);
}
