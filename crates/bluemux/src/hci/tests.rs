//! Unit tests for HCI packet handling and the dispatcher

use super::constants::*;
use super::*;
use crate::buffer::PacketType;
use crate::config::StackConfig;
use crate::gap::{AddressType, BdAddr};
use crate::storage::{KeyStore, LongTermKey, MemoryKeyStore, StoredKey};
use std::time::Duration;

const PEER: [u8; 6] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06];

fn dispatcher() -> HciDispatcher {
    HciDispatcher::new(&StackConfig::default())
}

fn inject(hci: &mut HciDispatcher, keys: &mut MemoryKeyStore, packet_type: PacketType, bytes: &[u8]) -> Option<Inbound> {
    let mut buffer = hci.pool_mut().acquire(packet_type).unwrap();
    buffer.fill(bytes).unwrap();
    hci.handle_incoming(buffer, keys).unwrap()
}

fn event(hci: &mut HciDispatcher, keys: &mut MemoryKeyStore, code: u8, params: &[u8]) -> Option<Inbound> {
    let raw = HciEvent::new(code, params.to_vec());
    inject(hci, keys, PacketType::Event, &raw.to_bytes())
}

fn le_connection_complete(handle: u16) -> Vec<u8> {
    let mut params = vec![EVT_LE_CONN_COMPLETE, HCI_SUCCESS];
    params.extend_from_slice(&handle.to_le_bytes());
    params.push(0x01); // Role: peripheral
    params.push(0x00); // Peer address type: public
    params.extend_from_slice(&PEER);
    params.extend_from_slice(&0x0028u16.to_le_bytes()); // Interval
    params.extend_from_slice(&0x0000u16.to_le_bytes()); // Latency
    params.extend_from_slice(&0x01F4u16.to_le_bytes()); // Supervision timeout
    params.push(0x00); // Clock accuracy
    params
}

fn classic_connection_complete(handle: u16) -> Vec<u8> {
    let mut params = vec![HCI_SUCCESS];
    params.extend_from_slice(&handle.to_le_bytes());
    params.extend_from_slice(&PEER);
    params.push(LINK_TYPE_ACL);
    params.push(0x00); // Encryption disabled
    params
}

fn command_complete(opcode: u16, credits: u8, return_parameters: &[u8]) -> Vec<u8> {
    let mut params = vec![credits];
    params.extend_from_slice(&opcode.to_le_bytes());
    params.extend_from_slice(return_parameters);
    params
}

fn completed_packets(entries: &[(u16, u16)]) -> Vec<u8> {
    let mut params = vec![entries.len() as u8];
    for (handle, count) in entries {
        params.extend_from_slice(&handle.to_le_bytes());
        params.extend_from_slice(&count.to_le_bytes());
    }
    params
}

/// Pop every queued outbound packet, returning type and bytes
fn drain(hci: &mut HciDispatcher) -> Vec<(PacketType, Vec<u8>)> {
    let mut packets = Vec::new();
    while let Some(buffer) = hci.pop_outgoing() {
        packets.push((buffer.packet_type(), buffer.as_slice().to_vec()));
        hci.pool_mut().release(buffer).unwrap();
    }
    packets
}

fn opcode_of(packet: &[u8]) -> u16 {
    u16::from_le_bytes([packet[0], packet[1]])
}

#[test]
fn test_hci_command_serialization() {
    // Reset
    let packet = HciCommand::Reset.to_packet();
    assert_eq!(packet[0], HCI_COMMAND_PKT);
    assert_eq!(u16::from_le_bytes([packet[1], packet[2]]), 0x0C03);
    assert_eq!(packet[3], 0);

    // Disconnect
    let command = HciCommand::Disconnect {
        handle: 0x0040,
        reason: HCI_REMOTE_USER_TERMINATED,
    };
    let bytes = command.to_bytes();
    assert_eq!(opcode_of(&bytes), 0x0406);
    assert_eq!(bytes[2], 3);
    assert_eq!(u16::from_le_bytes([bytes[3], bytes[4]]), 0x0040);
    assert_eq!(bytes[5], 0x13);

    // LE Connection Update
    let command = HciCommand::LeConnectionUpdate {
        handle: 0x0040,
        interval_min: 0x0018,
        interval_max: 0x0028,
        latency: 0,
        supervision_timeout: 0x01F4,
        min_ce_length: 0,
        max_ce_length: 0,
    };
    let bytes = command.to_bytes();
    assert_eq!(opcode_of(&bytes), 0x2013);
    assert_eq!(bytes[2], 14);
    assert_eq!(u16::from_le_bytes([bytes[5], bytes[6]]), 0x0018);
    assert_eq!(u16::from_le_bytes([bytes[11], bytes[12]]), 0x01F4);

    // Raw
    let command = HciCommand::new(OGF_LE, 0x000D, vec![0x01, 0x02, 0x03]);
    let packet = command.to_packet();
    assert_eq!(u16::from_le_bytes([packet[1], packet[2]]), 0x200D);
    assert_eq!(&packet[3..], &[3, 0x01, 0x02, 0x03]);
}

#[test]
fn test_hci_event_parsing() {
    let data = [EVT_CMD_COMPLETE, 4, 1, 0x03, 0x0C, 0x00];
    let raw = HciEvent::parse(&data).unwrap();
    assert_eq!(raw.event_code, EVT_CMD_COMPLETE);
    assert_eq!(raw.parameter_total_length, 4);

    match Event::decode(&raw).unwrap() {
        Event::CommandComplete {
            num_hci_command_packets,
            opcode,
            return_parameters,
        } => {
            assert_eq!(num_hci_command_packets, 1);
            assert_eq!(opcode, OPCODE_RESET);
            assert_eq!(return_parameters, vec![0x00]);
        }
        other => panic!("unexpected event {:?}", other),
    }

    // Invalid data
    assert!(HciEvent::parse(&[]).is_none());
    assert!(HciEvent::parse(&[EVT_CMD_COMPLETE, 10, 1, 2]).is_none());

    // Catalogue event that is too short
    let short = HciEvent::new(EVT_DISCONN_COMPLETE, vec![0x00, 0x40]);
    assert!(Event::decode(&short).is_err());

    // Events outside the catalogue pass through untouched
    let vendor = HciEvent::new(0xFF, vec![0x01, 0x02]);
    assert_eq!(Event::decode(&vendor).unwrap(), Event::Unknown(vendor.clone()));
}

#[test]
fn test_le_connection_complete_parsing() {
    let raw = HciEvent::new(EVT_LE_META_EVENT, le_connection_complete(0x0040));
    match Event::decode(&raw).unwrap() {
        Event::LeConnectionComplete {
            status,
            handle,
            role,
            peer_address_type,
            peer_address,
            interval,
            latency,
            supervision_timeout,
        } => {
            assert_eq!(status, HCI_SUCCESS);
            assert_eq!(handle, 0x0040);
            assert_eq!(role, LeRole::Peripheral);
            assert_eq!(peer_address_type, AddressType::Public);
            assert_eq!(peer_address, BdAddr::new(PEER));
            assert_eq!(interval, 0x0028);
            assert_eq!(latency, 0);
            assert_eq!(supervision_timeout, 0x01F4);
        }
        other => panic!("unexpected event {:?}", other),
    }

    // The enhanced variant carries two resolvable private addresses
    let mut params = vec![EVT_LE_ENHANCED_CONN_COMPLETE, HCI_SUCCESS, 0x41, 0x00, 0x00, 0x01];
    params.extend_from_slice(&PEER);
    params.extend_from_slice(&[0u8; 12]);
    params.extend_from_slice(&[0x18, 0x00, 0x02, 0x00, 0x2C, 0x01, 0x00]);
    let raw = HciEvent::new(EVT_LE_META_EVENT, params);
    match Event::decode(&raw).unwrap() {
        Event::LeConnectionComplete {
            handle,
            role,
            peer_address_type,
            interval,
            latency,
            supervision_timeout,
            ..
        } => {
            assert_eq!(handle, 0x0041);
            assert_eq!(role, LeRole::Central);
            assert_eq!(peer_address_type, AddressType::Random);
            assert_eq!(interval, 0x0018);
            assert_eq!(latency, 2);
            assert_eq!(supervision_timeout, 0x012C);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
fn test_acl_header_flags() {
    let header = AclHeader::new(0x0040, ACL_PB_FIRST_FLUSHABLE, 27);
    let bytes = header.to_bytes();
    assert_eq!(bytes, [0x40, 0x20, 27, 0]);

    let parsed = AclHeader::parse(&bytes).unwrap();
    assert_eq!(parsed, header);
    assert!(parsed.is_start());
    assert!(!AclHeader::new(0x0040, ACL_PB_CONTINUING, 1).is_start());

    // Declared length longer than the data
    assert!(AclPacket::parse(&[0x40, 0x00, 0x05, 0x00, 0xAA]).is_none());
}

#[test]
fn test_command_fifo_respects_credits() {
    let mut hci = dispatcher();
    let mut keys = MemoryKeyStore::new();

    hci.send_command(HciCommand::Reset).unwrap();
    hci.send_command(HciCommand::ReadBufferSize).unwrap();
    hci.send_command(HciCommand::LeReadBufferSize).unwrap();

    // One credit: only the first command leaves
    let sent = drain(&mut hci);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, PacketType::Command);
    assert_eq!(opcode_of(&sent[0].1), OPCODE_RESET);
    assert_eq!(hci.command_credits(), 0);
    assert_eq!(hci.queued_commands(), 2);

    // Completion with zero credits sends nothing
    event(&mut hci, &mut keys, EVT_CMD_COMPLETE, &command_complete(OPCODE_RESET, 0, &[0]));
    assert!(drain(&mut hci).is_empty());

    // A no-op status with a fresh credit releases the next command
    event(&mut hci, &mut keys, EVT_CMD_STATUS, &[HCI_SUCCESS, 1, 0x00, 0x00]);
    let sent = drain(&mut hci);
    assert_eq!(sent.len(), 1);
    assert_eq!(opcode_of(&sent[0].1), OPCODE_READ_BUFFER_SIZE);

    event(&mut hci, &mut keys, EVT_CMD_COMPLETE, &command_complete(OPCODE_READ_BUFFER_SIZE, 1, &[0x01]));
    let sent = drain(&mut hci);
    assert_eq!(sent.len(), 1);
    assert_eq!(opcode_of(&sent[0].1), OPCODE_LE_READ_BUFFER_SIZE);
    assert_eq!(hci.queued_commands(), 0);
}

#[test]
fn test_initialize_sequence() {
    let config = StackConfig {
        event_mask: 0x2000_0000_0000_9FFF,
        ..StackConfig::default()
    };
    let mut hci = HciDispatcher::new(&config);
    let mut keys = MemoryKeyStore::new();

    hci.initialize();
    let sent = drain(&mut hci);
    assert_eq!(sent.len(), 1);
    assert_eq!(opcode_of(&sent[0].1), OPCODE_RESET);

    let mut order = Vec::new();
    let mut last = OPCODE_RESET;
    for _ in 0..3 {
        event(&mut hci, &mut keys, EVT_CMD_COMPLETE, &command_complete(last, 1, &[HCI_SUCCESS]));
        let sent = drain(&mut hci);
        assert_eq!(sent.len(), 1);
        last = opcode_of(&sent[0].1);
        order.push(sent[0].1.clone());
    }

    assert_eq!(
        order.iter().map(|packet| opcode_of(packet)).collect::<Vec<_>>(),
        vec![OPCODE_SET_EVENT_MASK, OPCODE_READ_BUFFER_SIZE, OPCODE_LE_READ_BUFFER_SIZE]
    );
    assert_eq!(order[0][2], 8);
    assert_eq!(&order[0][3..], &0x2000_0000_0000_9FFFu64.to_le_bytes());
    assert_eq!(hci.queued_commands(), 0);
}

#[test]
fn test_invalid_command_length_rejected() {
    let mut hci = dispatcher();
    let result = hci.send_command(HciCommand::new(OGF_LE, 0x0001, vec![0; 300]));
    assert!(matches!(result, Err(crate::error::HciError::InvalidParamLength(300))));
    assert_eq!(hci.queued_commands(), 0);
}

#[test]
fn test_connection_lifecycle() {
    let mut hci = dispatcher();
    let mut keys = MemoryKeyStore::new();

    let inbound = event(&mut hci, &mut keys, EVT_LE_META_EVENT, &le_connection_complete(0x0040));
    assert!(matches!(inbound, Some(Inbound::Event(Event::LeConnectionComplete { .. }))));

    let record = hci.connection(0x0040).unwrap();
    assert_eq!(record.link_type, LinkType::Le);
    assert_eq!(record.role, Some(LeRole::Peripheral));
    assert_eq!(record.address, BdAddr::new(PEER));
    assert_eq!(record.interval, 0x0028);

    let mut update = vec![EVT_LE_CONN_UPDATE_COMPLETE, HCI_SUCCESS, 0x40, 0x00];
    update.extend_from_slice(&[0x50, 0x00, 0x04, 0x00, 0xC8, 0x00]);
    event(&mut hci, &mut keys, EVT_LE_META_EVENT, &update);
    let record = hci.connection(0x0040).unwrap();
    assert_eq!(record.interval, 0x0050);
    assert_eq!(record.latency, 4);
    assert_eq!(record.supervision_timeout, 0x00C8);

    event(&mut hci, &mut keys, EVT_ENCRYPTION_CHANGE, &[HCI_SUCCESS, 0x40, 0x00, 0x01]);
    assert!(hci.connection(0x0040).unwrap().encrypted);

    event(&mut hci, &mut keys, EVT_DISCONN_COMPLETE, &[HCI_SUCCESS, 0x40, 0x00, HCI_REMOTE_USER_TERMINATED]);
    assert!(hci.connection(0x0040).is_none());
    assert!(hci.connections().is_empty());
}

#[test]
fn test_failed_connection_not_recorded() {
    let mut hci = dispatcher();
    let mut keys = MemoryKeyStore::new();

    let mut params = le_connection_complete(0x0040);
    params[1] = 0x3E; // Connection failed to be established
    event(&mut hci, &mut keys, EVT_LE_META_EVENT, &params);
    assert!(hci.connections().is_empty());
}

#[test]
fn test_unknown_handle_acl_dropped() {
    let mut hci = dispatcher();
    let mut keys = MemoryKeyStore::new();

    event(&mut hci, &mut keys, EVT_LE_META_EVENT, &le_connection_complete(0x0040));

    let acl = [0x99, 0x00, 0x06, 0x00, 0x02, 0x00, 0x04, 0x00, 0xAA, 0xBB];
    assert!(inject(&mut hci, &mut keys, PacketType::Acl, &acl).is_none());

    assert_eq!(hci.stats().unknown_handle_acl, 1);
    assert_eq!(hci.pool().in_use(PacketType::Acl), 0);
    assert_eq!(hci.connections().len(), 1);
    assert!(hci.connection(0x0040).is_some());

    // Known handle is handed back with its buffer
    let acl = [0x40, 0x20, 0x06, 0x00, 0x02, 0x00, 0x04, 0x00, 0xAA, 0xBB];
    match inject(&mut hci, &mut keys, PacketType::Acl, &acl) {
        Some(Inbound::Acl { handle, buffer }) => {
            assert_eq!(handle, 0x0040);
            assert_eq!(buffer.as_slice(), &acl);
            hci.release(buffer).unwrap();
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(hci.pool().in_use(PacketType::Acl), 0);
}

#[test]
fn test_unknown_handle_sco_dropped() {
    let mut hci = dispatcher();
    let mut keys = MemoryKeyStore::new();

    assert!(inject(&mut hci, &mut keys, PacketType::Sco, &[0x05, 0x00, 0x02, 0x11, 0x22]).is_none());
    assert_eq!(hci.stats().unknown_handle_sco, 1);
    assert_eq!(hci.pool().in_use(PacketType::Sco), 0);
}

#[test]
fn test_malformed_event_counted() {
    let mut hci = dispatcher();
    let mut keys = MemoryKeyStore::new();

    // Disconnection complete without its reason byte
    assert!(event(&mut hci, &mut keys, EVT_DISCONN_COMPLETE, &[0x00, 0x40, 0x00]).is_none());
    assert_eq!(hci.stats().malformed_packets, 1);
    assert_eq!(hci.pool().in_use(PacketType::Event), 0);
}

#[test]
fn test_completed_packets_release_deferred_acl() {
    let mut hci = dispatcher();
    let mut keys = MemoryKeyStore::new();

    event(&mut hci, &mut keys, EVT_LE_META_EVENT, &le_connection_complete(0x0040));
    assert!(hci.can_send_acl(0x0040));

    // One controller buffer by default
    hci.send_acl(0x0040, &[0x01, 0x00, 0x04, 0x00, 0x11], false).unwrap();
    hci.send_acl(0x0040, &[0x01, 0x00, 0x04, 0x00, 0x22], false).unwrap();
    assert!(!hci.can_send_acl(0x0040));
    assert_eq!(hci.connection(0x0040).unwrap().pending_pdus(), 1);

    let sent = drain(&mut hci);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1[8], 0x11);

    // Nothing more leaves until the controller reports completion
    hci.process_pending();
    assert!(drain(&mut hci).is_empty());

    event(&mut hci, &mut keys, EVT_NUM_COMP_PKTS, &completed_packets(&[(0x0040, 1)]));
    let sent = drain(&mut hci);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1[8], 0x22);
    assert_eq!(hci.connection(0x0040).unwrap().acl_in_flight, 1);

    event(&mut hci, &mut keys, EVT_NUM_COMP_PKTS, &completed_packets(&[(0x0040, 1)]));
    assert!(hci.can_send_acl(0x0040));
    assert_eq!(hci.available_credits(LinkType::Le), 1);
}

#[test]
fn test_acl_fragmentation() {
    let mut hci = dispatcher();
    let mut keys = MemoryKeyStore::new();

    // 27 byte ACL data length, 8 buffers, no SCO flow control
    let mut buffer_size = vec![HCI_SUCCESS];
    buffer_size.extend_from_slice(&27u16.to_le_bytes());
    buffer_size.push(64);
    buffer_size.extend_from_slice(&8u16.to_le_bytes());
    buffer_size.extend_from_slice(&0u16.to_le_bytes());
    event(&mut hci, &mut keys, EVT_CMD_COMPLETE, &command_complete(OPCODE_READ_BUFFER_SIZE, 1, &buffer_size));
    assert_eq!(hci.controller_buffers().acl_data_length, 27);
    assert_eq!(hci.available_credits(LinkType::Classic), 8);

    event(&mut hci, &mut keys, EVT_CONN_COMPLETE, &classic_connection_complete(0x0001));
    assert_eq!(hci.link_type(0x0001), Some(LinkType::Classic));

    let pdu: Vec<u8> = (0..60u8).collect();
    hci.send_acl(0x0001, &pdu, true).unwrap();

    let sent = drain(&mut hci);
    assert_eq!(sent.len(), 3);

    let mut reassembled = Vec::new();
    let expected = [(ACL_PB_FIRST_FLUSHABLE, 27), (ACL_PB_CONTINUING, 27), (ACL_PB_CONTINUING, 6)];
    for ((packet_type, bytes), (boundary, len)) in sent.iter().zip(expected.iter()) {
        assert_eq!(*packet_type, PacketType::Acl);
        let packet = AclPacket::parse(bytes).unwrap();
        assert_eq!(packet.header.handle, 0x0001);
        assert_eq!(packet.header.packet_boundary, *boundary);
        assert_eq!(packet.header.data_length as usize, *len);
        reassembled.extend_from_slice(packet.payload);
    }
    assert_eq!(reassembled, pdu);
    assert_eq!(hci.available_credits(LinkType::Classic), 5);
    assert_eq!(hci.stats().acl_fragments_sent, 3);
}

#[test]
fn test_deferred_acl_round_robin() {
    let mut hci = dispatcher();
    let mut keys = MemoryKeyStore::new();

    event(&mut hci, &mut keys, EVT_LE_META_EVENT, &le_connection_complete(0x0040));
    event(&mut hci, &mut keys, EVT_LE_META_EVENT, &le_connection_complete(0x0041));

    // Use the single credit, then queue two PDUs per connection
    hci.send_acl(0x0040, &[0xA0], false).unwrap();
    hci.send_acl(0x0040, &[0xA1], false).unwrap();
    hci.send_acl(0x0040, &[0xA2], false).unwrap();
    hci.send_acl(0x0041, &[0xB1], false).unwrap();
    hci.send_acl(0x0041, &[0xB2], false).unwrap();
    assert_eq!(drain(&mut hci)[0].1[4], 0xA0);

    let mut order = Vec::new();
    let mut completed = 0x0040;
    for _ in 0..4 {
        event(&mut hci, &mut keys, EVT_NUM_COMP_PKTS, &completed_packets(&[(completed, 1)]));
        let sent = drain(&mut hci);
        assert_eq!(sent.len(), 1);
        let packet = AclPacket::parse(&sent[0].1).unwrap();
        completed = packet.header.handle;
        order.push(packet.payload[0]);
    }
    assert_eq!(order, vec![0xB1, 0xA1, 0xB2, 0xA2]);
}

#[test]
fn test_le_buffer_discovery() {
    let mut hci = dispatcher();
    let mut keys = MemoryKeyStore::new();

    // Zero LE buffers: LE shares the BR/EDR pool
    event(&mut hci, &mut keys, EVT_CMD_COMPLETE, &command_complete(OPCODE_LE_READ_BUFFER_SIZE, 1, &[0, 0, 0, 0]));
    assert_eq!(hci.controller_buffers().le_total, 0);
    assert_eq!(hci.available_credits(LinkType::Le), hci.available_credits(LinkType::Classic));

    event(&mut hci, &mut keys, EVT_CMD_COMPLETE, &command_complete(OPCODE_LE_READ_BUFFER_SIZE, 1, &[0, 27, 0, 4]));
    assert_eq!(hci.controller_buffers().le_data_length, 27);
    assert_eq!(hci.available_credits(LinkType::Le), 4);
}

#[test]
fn test_link_key_request_uses_key_store() {
    let mut hci = dispatcher();
    let mut keys = MemoryKeyStore::new();
    let addr = BdAddr::new(PEER);

    // No key stored: negative reply
    event(&mut hci, &mut keys, EVT_LINK_KEY_REQUEST, &PEER);
    let sent = drain(&mut hci);
    assert_eq!(sent[0].1, HciCommand::LinkKeyRequestNegativeReply { bd_addr: addr }.to_bytes());

    // Notification stores the key
    let mut notification = PEER.to_vec();
    notification.extend_from_slice(&[0x5A; 16]);
    notification.push(0x04);
    event(&mut hci, &mut keys, EVT_LINK_KEY_NOTIFICATION, &notification);
    assert_eq!(
        keys.get(&addr),
        Some(StoredKey::LinkKey {
            key: [0x5A; 16],
            key_type: 0x04
        })
    );

    // Give back the credit used by the negative reply, then ask again
    event(&mut hci, &mut keys, EVT_CMD_COMPLETE, &command_complete(0x040C, 1, &[0]));
    event(&mut hci, &mut keys, EVT_LINK_KEY_REQUEST, &PEER);
    let sent = drain(&mut hci);
    assert_eq!(
        sent[0].1,
        HciCommand::LinkKeyRequestReply {
            bd_addr: addr,
            link_key: [0x5A; 16]
        }
        .to_bytes()
    );
}

#[test]
fn test_long_term_key_request() {
    let mut hci = dispatcher();
    let mut keys = MemoryKeyStore::new();
    keys.put(
        BdAddr::new(PEER),
        StoredKey::LongTermKey(LongTermKey::new([0x33; 16], 0xBEEF, [7; 8], true)),
    );

    event(&mut hci, &mut keys, EVT_LE_META_EVENT, &le_connection_complete(0x0040));

    let mut request = vec![EVT_LE_LTK_REQUEST, 0x40, 0x00];
    request.extend_from_slice(&[7; 8]);
    request.extend_from_slice(&0xBEEFu16.to_le_bytes());
    event(&mut hci, &mut keys, EVT_LE_META_EVENT, &request);

    let sent = drain(&mut hci);
    assert_eq!(
        sent[0].1,
        HciCommand::LeLongTermKeyRequestReply {
            handle: 0x0040,
            long_term_key: [0x33; 16]
        }
        .to_bytes()
    );

    // EDIV mismatch
    event(&mut hci, &mut keys, EVT_CMD_COMPLETE, &command_complete(0x201A, 1, &[0, 0x40, 0x00]));
    let mut request = vec![EVT_LE_LTK_REQUEST, 0x40, 0x00];
    request.extend_from_slice(&[7; 8]);
    request.extend_from_slice(&0x0001u16.to_le_bytes());
    event(&mut hci, &mut keys, EVT_LE_META_EVENT, &request);

    let sent = drain(&mut hci);
    assert_eq!(
        sent[0].1,
        HciCommand::LeLongTermKeyRequestNegativeReply { handle: 0x0040 }.to_bytes()
    );
}

#[test]
fn test_command_timeout_restores_credit() {
    let mut hci = dispatcher();

    hci.send_command(HciCommand::Reset).unwrap();
    hci.send_command(HciCommand::ReadBufferSize).unwrap();
    assert_eq!(drain(&mut hci).len(), 1);

    let deadline = hci.command_deadline().unwrap();
    assert!(hci.handle_timer(HciTimer::CommandTimeout, deadline - Duration::from_millis(1)).is_none());

    let timed_out = hci.handle_timer(HciTimer::CommandTimeout, deadline);
    assert_eq!(timed_out, Some(OPCODE_RESET));
    assert_eq!(hci.stats().command_timeouts, 1);

    // The queue keeps moving
    let sent = drain(&mut hci);
    assert_eq!(sent.len(), 1);
    assert_eq!(opcode_of(&sent[0].1), OPCODE_READ_BUFFER_SIZE);
    assert!(hci.command_deadline().is_some());
}

#[test]
fn test_connection_table_full_disconnects() {
    let config = StackConfig {
        max_connections: 1,
        ..StackConfig::default()
    };
    let mut hci = HciDispatcher::new(&config);
    let mut keys = MemoryKeyStore::new();

    event(&mut hci, &mut keys, EVT_LE_META_EVENT, &le_connection_complete(0x0040));
    event(&mut hci, &mut keys, EVT_LE_META_EVENT, &le_connection_complete(0x0041));

    assert_eq!(hci.connections().len(), 1);
    let sent = drain(&mut hci);
    assert_eq!(
        sent[0].1,
        HciCommand::Disconnect {
            handle: 0x0041,
            reason: HCI_REMOTE_LOW_RESOURCES
        }
        .to_bytes()
    );
}

#[test]
fn test_disconnection_returns_credits() {
    let mut hci = dispatcher();
    let mut keys = MemoryKeyStore::new();

    event(&mut hci, &mut keys, EVT_LE_META_EVENT, &le_connection_complete(0x0040));
    hci.send_acl(0x0040, &[0x01], false).unwrap();
    hci.send_acl(0x0040, &[0x02], false).unwrap();
    drain(&mut hci);
    assert_eq!(hci.available_credits(LinkType::Le), 0);

    event(&mut hci, &mut keys, EVT_DISCONN_COMPLETE, &[HCI_SUCCESS, 0x40, 0x00, 0x08]);
    assert_eq!(hci.available_credits(LinkType::Le), 1);
    assert!(matches!(
        hci.send_acl(0x0040, &[0x03], false),
        Err(crate::error::HciError::UnknownConnectionHandle(0x0040))
    ));
}

#[test]
fn test_reset_link_drops_everything() {
    let mut hci = dispatcher();
    let mut keys = MemoryKeyStore::new();

    event(&mut hci, &mut keys, EVT_LE_META_EVENT, &le_connection_complete(0x0040));
    hci.send_acl(0x0040, &[0x01], false).unwrap();
    hci.send_command(HciCommand::Reset).unwrap();
    assert!(hci.has_outgoing());

    let dropped = hci.reset_link();
    assert_eq!(dropped, vec![0x0040]);
    assert!(!hci.has_outgoing());
    assert_eq!(hci.pool().in_use(PacketType::Acl), 0);
    assert_eq!(hci.pool().in_use(PacketType::Command), 0);
    assert_eq!(hci.command_credits(), 1);
}
