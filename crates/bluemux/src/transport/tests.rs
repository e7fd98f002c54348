use super::*;
use crate::buffer::{PacketPool, PacketType};
use crate::config::PoolConfig;

fn pool() -> PacketPool {
    PacketPool::new(&PoolConfig::default())
}

/// Feed everything, collecting completed packets as (type, bytes)
fn feed_all(framer: &mut H4Framer, pool: &mut PacketPool, mut data: &[u8]) -> Vec<(PacketType, Vec<u8>)> {
    let mut packets = Vec::new();
    while !data.is_empty() {
        let (consumed, packet) = framer.feed(data, pool);
        if let Some(buffer) = packet {
            packets.push((buffer.packet_type(), buffer.as_slice().to_vec()));
            pool.release(buffer).unwrap();
        }
        assert!(consumed > 0, "framer stalled");
        data = &data[consumed..];
    }
    packets
}

const COMMAND_COMPLETE: [u8; 7] = [0x04, 0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00];
const ACL: [u8; 11] = [0x02, 0x40, 0x20, 0x06, 0x00, 0x02, 0x00, 0x04, 0x00, 0xAA, 0xBB];

#[test]
fn test_frames_split_across_reads() {
    let mut framer = H4Framer::new();
    let mut pool = pool();

    let mut stream = COMMAND_COMPLETE.to_vec();
    stream.extend_from_slice(&ACL);

    // One byte at a time
    let mut packets = Vec::new();
    for byte in &stream {
        let (consumed, packet) = framer.feed(std::slice::from_ref(byte), &mut pool);
        assert_eq!(consumed, 1);
        if let Some(buffer) = packet {
            packets.push((buffer.packet_type(), buffer.as_slice().to_vec()));
            pool.release(buffer).unwrap();
        }
    }

    assert_eq!(packets.len(), 2);
    assert_eq!(packets[0], (PacketType::Event, COMMAND_COMPLETE[1..].to_vec()));
    assert_eq!(packets[1], (PacketType::Acl, ACL[1..].to_vec()));
    assert_eq!(framer.stats().frames, 2);
}

#[test]
fn test_feed_stops_at_frame_end() {
    let mut framer = H4Framer::new();
    let mut pool = pool();

    let mut stream = COMMAND_COMPLETE.to_vec();
    stream.extend_from_slice(&ACL);

    let (consumed, packet) = framer.feed(&stream, &mut pool);
    assert_eq!(consumed, COMMAND_COMPLETE.len());
    assert_eq!(packet.unwrap().packet_type(), PacketType::Event);
}

#[test]
fn test_invalid_indicator_resync() {
    let mut framer = H4Framer::new();
    let mut pool = pool();

    let mut stream = vec![0x00, 0xFF, 0x7E];
    stream.extend_from_slice(&COMMAND_COMPLETE);

    let packets = feed_all(&mut framer, &mut pool, &stream);
    assert_eq!(packets, vec![(PacketType::Event, COMMAND_COMPLETE[1..].to_vec())]);
    assert_eq!(framer.stats().invalid_type_bytes, 3);
    assert_eq!(framer.stats().framing_errors(), 3);
}

#[test]
fn test_oversized_length_resync() {
    let mut framer = H4Framer::new();
    let mut pool = PacketPool::new(&PoolConfig {
        acl_payload_size: 27,
        ..PoolConfig::default()
    });

    // ACL header declaring 200 bytes, followed by a valid event
    let mut stream = vec![0x02, 0x40, 0x00, 200, 0x00];
    stream.extend_from_slice(&COMMAND_COMPLETE);

    let packets = feed_all(&mut framer, &mut pool, &stream);
    assert_eq!(packets, vec![(PacketType::Event, COMMAND_COMPLETE[1..].to_vec())]);
    assert_eq!(framer.stats().oversized_frames, 1);
    assert_eq!(pool.in_use(PacketType::Acl), 0);
}

#[test]
fn test_zero_length_payload() {
    let mut framer = H4Framer::new();
    let mut pool = pool();

    let (consumed, packet) = framer.feed(&[0x04, 0xFF, 0x00], &mut pool);
    assert_eq!(consumed, 3);
    assert_eq!(packet.unwrap().as_slice(), &[0xFF, 0x00]);
}

#[test]
fn test_pool_exhaustion_applies_backpressure() {
    let mut framer = H4Framer::new();
    let mut pool = PacketPool::new(&PoolConfig {
        event_buffers: 1,
        ..PoolConfig::default()
    });

    let held = pool.acquire(PacketType::Event).unwrap();

    let mut stream = COMMAND_COMPLETE.to_vec();
    stream.extend_from_slice(&COMMAND_COMPLETE);

    // The first frame completes but cannot be delivered
    let (consumed, packet) = framer.feed(&stream, &mut pool);
    assert_eq!(consumed, COMMAND_COMPLETE.len());
    assert!(packet.is_none());
    assert!(framer.is_stalled());

    // Nothing more is consumed while stalled
    let (consumed, packet) = framer.feed(&stream[COMMAND_COMPLETE.len()..], &mut pool);
    assert_eq!(consumed, 0);
    assert!(packet.is_none());
    assert_eq!(framer.stats().pool_stalls, 2);

    pool.release(held).unwrap();

    // The held frame comes out first, then the rest of the stream
    let (consumed, packet) = framer.feed(&stream[COMMAND_COMPLETE.len()..], &mut pool);
    assert_eq!(consumed, 0);
    let buffer = packet.unwrap();
    assert_eq!(buffer.as_slice(), &COMMAND_COMPLETE[1..]);
    pool.release(buffer).unwrap();

    let packets = feed_all(&mut framer, &mut pool, &stream[COMMAND_COMPLETE.len()..]);
    assert_eq!(packets.len(), 1);
    assert_eq!(framer.stats().frames, 2);
}

#[test]
fn test_reset_discards_partial_frame() {
    let mut framer = H4Framer::new();
    let mut pool = pool();

    framer.feed(&ACL[..5], &mut pool);
    framer.reset();

    let packets = feed_all(&mut framer, &mut pool, &COMMAND_COMPLETE);
    assert_eq!(packets.len(), 1);
    assert_eq!(framer.stats().framing_errors(), 0);
}
