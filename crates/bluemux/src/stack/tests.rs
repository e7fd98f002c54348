use super::*;
use crate::buffer::PacketType;
use crate::hci::constants::*;
use crate::l2cap::constants::L2CAP_ATTRIBUTE_PROTOCOL_CID;
use crate::l2cap::FixedChannelSender;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const LE_HANDLE: u16 = 0x0040;
const PEER: [u8; 6] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];

#[derive(Debug, Default)]
struct MockTransport {
    inbound: VecDeque<Vec<u8>>,
    written: Vec<u8>,
    blocked: bool,
    fail_read: bool,
}

impl Transport for MockTransport {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.blocked {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.written.extend_from_slice(data);
        Ok(data.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.fail_read {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let Some(mut chunk) = self.inbound.pop_front() else {
            return Ok(0);
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            self.inbound.push_front(chunk.split_off(n));
        }
        Ok(n)
    }

    fn wait(&mut self, _timeout: Option<Duration>) -> io::Result<bool> {
        Ok(self.fail_read || !self.inbound.is_empty())
    }

    fn can_send(&self) -> bool {
        !self.blocked
    }
}

fn stack() -> (Stack<MockTransport>, Arc<Mutex<Vec<StackEvent>>>) {
    let mut stack = Stack::new(StackConfig::default(), MockTransport::default()).unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    stack.set_event_callback(move |event| sink.lock().unwrap().push(event.clone()));
    (stack, events)
}

fn event_frame(code: u8, params: &[u8]) -> Vec<u8> {
    let mut frame = vec![HCI_EVENT_PKT, code, params.len() as u8];
    frame.extend_from_slice(params);
    frame
}

fn le_connection_complete(handle: u16) -> Vec<u8> {
    let mut params = vec![EVT_LE_CONN_COMPLETE, HCI_SUCCESS];
    params.extend_from_slice(&handle.to_le_bytes());
    params.push(0x01);
    params.push(0x00);
    params.extend_from_slice(&PEER);
    params.extend_from_slice(&0x0028u16.to_le_bytes());
    params.extend_from_slice(&0x0000u16.to_le_bytes());
    params.extend_from_slice(&0x01F4u16.to_le_bytes());
    params.push(0x00);
    event_frame(EVT_LE_META_EVENT, &params)
}

fn receive(stack: &mut Stack<MockTransport>, bytes: Vec<u8>) {
    stack.transport_mut().inbound.push_back(bytes);
    stack.run_once().unwrap();
}

fn take_written(stack: &mut Stack<MockTransport>) -> Vec<u8> {
    std::mem::take(&mut stack.transport_mut().written)
}

struct AttServer {
    received: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl FixedChannelHandler for AttServer {
    fn receive(&mut self, _handle: u16, data: &[u8]) {
        self.received.lock().unwrap().push(data.to_vec());
    }

    fn can_send_now(&mut self, sender: &mut FixedChannelSender<'_>) {
        // Exchange MTU response, server MTU 23
        sender.send(&[0x03, 0x17, 0x00]).unwrap();
    }
}

#[test]
fn test_invalid_config_rejected() {
    let mut config = StackConfig::default();
    config.max_connections = 0;

    let result = Stack::new(config, MockTransport::default());
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_initialize_writes_commands_in_order() {
    let (mut stack, events) = stack();

    stack.initialize().unwrap();
    assert_eq!(take_written(&mut stack), vec![HCI_COMMAND_PKT, 0x03, 0x0C, 0x00]);
    assert_eq!(stack.timers().len(), 1);

    // Reset completes, the controller grants one credit for the next command
    let mut params = vec![0x01];
    params.extend_from_slice(&OPCODE_RESET.to_le_bytes());
    params.push(HCI_SUCCESS);
    receive(&mut stack, event_frame(EVT_CMD_COMPLETE, &params));

    let mut set_event_mask = vec![HCI_COMMAND_PKT, 0x01, 0x0C, 0x08];
    set_event_mask.extend_from_slice(&HCI_DEFAULT_EVENT_MASK.to_le_bytes());
    assert_eq!(take_written(&mut stack), set_event_mask);
    assert_eq!(stack.timers().len(), 1);

    let mut params = vec![0x01];
    params.extend_from_slice(&OPCODE_SET_EVENT_MASK.to_le_bytes());
    params.push(HCI_SUCCESS);
    receive(&mut stack, event_frame(EVT_CMD_COMPLETE, &params));
    assert_eq!(take_written(&mut stack), vec![HCI_COMMAND_PKT, 0x05, 0x10, 0x00]);

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert!(matches!(
        events[0],
        StackEvent::Hci(Event::CommandComplete {
            opcode: OPCODE_RESET,
            ..
        })
    ));
}

#[test]
fn test_att_exchange_end_to_end() {
    let (mut stack, _) = stack();
    let received = Arc::new(Mutex::new(Vec::new()));
    stack
        .register_fixed_channel(
            L2CAP_ATTRIBUTE_PROTOCOL_CID,
            Box::new(AttServer {
                received: received.clone(),
            }),
        )
        .unwrap();

    receive(&mut stack, le_connection_complete(LE_HANDLE));
    assert!(stack.hci().connection(LE_HANDLE).is_some());

    // Exchange MTU request in one ACL fragment
    receive(
        &mut stack,
        vec![HCI_ACL_PKT, 0x40, 0x20, 0x07, 0x00, 0x03, 0x00, 0x04, 0x00, 0x02, 0x17, 0x00],
    );
    assert_eq!(*received.lock().unwrap(), vec![vec![0x02, 0x17, 0x00]]);
    assert_eq!(stack.hci().pool().in_use(PacketType::Acl), 0);
    take_written(&mut stack);

    stack
        .request_can_send_now(LE_HANDLE, L2CAP_ATTRIBUTE_PROTOCOL_CID)
        .unwrap();

    let written = take_written(&mut stack);
    assert_eq!(written[0], HCI_ACL_PKT);
    assert_eq!(u16::from_le_bytes([written[1], written[2]]) & 0x0FFF, LE_HANDLE);
    assert_eq!(&written[5..], &[0x03, 0x00, 0x04, 0x00, 0x03, 0x17, 0x00]);
}

#[test]
fn test_input_split_across_reads() {
    let (mut stack, events) = stack();
    let frame = le_connection_complete(LE_HANDLE);

    stack.transport_mut().inbound.push_back(frame[..5].to_vec());
    stack.run_once().unwrap();
    assert!(events.lock().unwrap().is_empty());

    receive(&mut stack, frame[5..].to_vec());
    assert_eq!(events.lock().unwrap().len(), 1);
    assert!(stack.hci().connection(LE_HANDLE).is_some());
}

#[test]
fn test_writable_is_edge_triggered() {
    let (mut stack, _) = stack();
    stack.transport_mut().blocked = true;

    stack.initialize().unwrap();
    assert!(!stack.is_writable());
    assert!(stack.transport().written.is_empty());

    stack.transport_mut().blocked = false;
    assert!(stack.on_transport_writable().unwrap());
    assert!(stack.is_writable());
    assert_eq!(take_written(&mut stack), vec![HCI_COMMAND_PKT, 0x03, 0x0C, 0x00]);

    // Already writable: nothing happens
    assert!(!stack.on_transport_writable().unwrap());
    assert!(stack.transport().written.is_empty());
}

#[test]
fn test_command_timeout_reported() {
    let (mut stack, events) = stack();
    stack.initialize().unwrap();
    take_written(&mut stack);

    let fired = stack.process_timers(Instant::now() + Duration::from_secs(3));
    assert_eq!(fired, 1);
    assert_eq!(
        *events.lock().unwrap(),
        vec![StackEvent::CommandTimeout { opcode: OPCODE_RESET }]
    );

    // The credit comes back and the next command is armed
    assert_eq!(stack.hci().outgoing_len(), 1);
    assert_eq!(stack.timers().len(), 1);
}

#[test]
fn test_transport_error_tears_down() {
    let (mut stack, events) = stack();
    receive(&mut stack, le_connection_complete(LE_HANDLE));
    assert_eq!(stack.hci().connections().len(), 1);

    stack.transport_mut().fail_read = true;
    let err = stack.run_once().unwrap_err();
    assert!(matches!(err, Error::Hci(HciError::Io(_))));

    assert_eq!(stack.hci().connections().len(), 0);
    assert_eq!(
        events.lock().unwrap().last(),
        Some(&StackEvent::TransportError(io::ErrorKind::BrokenPipe))
    );
}

#[test]
fn test_sco_data_reaches_handler() {
    let (mut stack, _) = stack();
    let frames = Arc::new(Mutex::new(Vec::new()));
    let sink = frames.clone();
    stack.set_sco_handler(move |handle, data| sink.lock().unwrap().push((handle, data.to_vec())));

    let mut params = vec![HCI_SUCCESS];
    params.extend_from_slice(&0x0050u16.to_le_bytes());
    params.extend_from_slice(&PEER);
    params.push(LINK_TYPE_ESCO);
    receive(&mut stack, event_frame(EVT_SYNC_CONN_COMPLETE, &params));

    receive(&mut stack, vec![HCI_SCO_PKT, 0x50, 0x00, 0x02, 0xAA, 0xBB]);

    assert_eq!(*frames.lock().unwrap(), vec![(0x0050, vec![0xAA, 0xBB])]);
    assert_eq!(stack.hci().pool().in_use(PacketType::Sco), 0);
}
