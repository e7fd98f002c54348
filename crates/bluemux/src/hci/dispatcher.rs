//! HCI dispatcher
//!
//! Owns the connection table and the packet pool. Incoming packets are
//! classified by type: events update the connection table and the credit
//! counters, ACL and SCO data is checked against the table and handed back
//! to the caller. Outgoing commands wait for command credits, outgoing ACL
//! PDUs are cut into fragments that each wait for a controller buffer.
//! Everything ready for the wire collects in an outbound queue the owner
//! drains into the transport.

use crate::buffer::{PacketBuffer, PacketPool, PacketType};
use crate::config::StackConfig;
use crate::error::{HciError, HciResult};
use crate::gap::AddressType;
use crate::hci::connection::{ConnectionRecord, ConnectionTable, LinkType, PendingPdu};
use crate::hci::constants::*;
use crate::hci::event::Event;
use crate::hci::packet::{AclHeader, HciCommand, HciEvent, ScoHeader};
use crate::storage::{KeyStore, StoredKey};
use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, error, info, trace, warn};
use std::collections::VecDeque;
use std::io::Cursor;
use std::time::{Duration, Instant};

/// Data handed back by [`HciDispatcher::handle_incoming`]
#[derive(Debug)]
pub enum Inbound {
    /// A decoded event, already applied to the dispatcher's state
    Event(Event),
    /// ACL data for a known connection; the buffer goes back through
    /// [`HciDispatcher::release`]
    Acl { handle: u16, buffer: PacketBuffer },
    /// SCO data for a known connection
    Sco { handle: u16, buffer: PacketBuffer },
}

/// Timer events owned by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HciTimer {
    /// The oldest command in flight may have timed out
    CommandTimeout,
}

/// Diagnostic counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HciStats {
    /// ACL packets dropped because the handle was unknown
    pub unknown_handle_acl: u64,
    /// SCO packets dropped because the handle was unknown
    pub unknown_handle_sco: u64,
    /// Events and data packets too short for their declared contents
    pub malformed_packets: u64,
    /// Commands the controller never answered
    pub command_timeouts: u64,
    pub commands_sent: u64,
    pub acl_fragments_sent: u64,
    pub sco_packets_sent: u64,
}

/// Controller buffer sizes as reported by Read Buffer Size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerBuffers {
    /// Largest ACL payload the controller accepts
    pub acl_data_length: u16,
    /// Number of BR/EDR ACL buffers
    pub acl_total: u16,
    /// Largest SCO payload the controller accepts
    pub sco_data_length: u8,
    /// Number of SCO buffers, zero when SCO is not flow controlled
    pub sco_total: u16,
    /// Largest LE ACL payload the controller accepts
    pub le_data_length: u16,
    /// Number of LE buffers, zero when LE shares the BR/EDR buffers
    pub le_total: u16,
}

impl ControllerBuffers {
    fn data_length(&self, link_type: LinkType) -> usize {
        match link_type {
            LinkType::Le if self.le_total > 0 => self.le_data_length as usize,
            LinkType::Sco => self.sco_data_length as usize,
            _ => self.acl_data_length as usize,
        }
    }

    fn total(&self, link_type: LinkType) -> u16 {
        match link_type {
            LinkType::Le if self.le_total > 0 => self.le_total,
            LinkType::Sco => self.sco_total,
            _ => self.acl_total,
        }
    }

    fn shares_le(&self) -> bool {
        self.le_total == 0
    }
}

/// Free controller buffers per buffer class
#[derive(Debug, Clone, Copy, Default)]
struct Credits {
    acl: u16,
    le: u16,
    sco: u16,
}

impl Credits {
    fn get(&self, link_type: LinkType, buffers: &ControllerBuffers) -> u16 {
        match link_type {
            LinkType::Le if !buffers.shares_le() => self.le,
            LinkType::Sco => self.sco,
            _ => self.acl,
        }
    }

    fn get_mut(&mut self, link_type: LinkType, buffers: &ControllerBuffers) -> &mut u16 {
        match link_type {
            LinkType::Le if !buffers.shares_le() => &mut self.le,
            LinkType::Sco => &mut self.sco,
            _ => &mut self.acl,
        }
    }
}

#[derive(Debug)]
struct InFlightCommand {
    opcode: u16,
    sent_at: Instant,
}

/// Routes HCI traffic between the transport and the upper layers
pub struct HciDispatcher {
    pool: PacketPool,
    connections: ConnectionTable,
    buffers: ControllerBuffers,
    credits: Credits,
    acl_payload_size: usize,
    command_credits: u8,
    command_timeout: Duration,
    event_mask: u64,
    command_queue: VecDeque<HciCommand>,
    in_flight: VecDeque<InFlightCommand>,
    sco_queue: VecDeque<(u16, Vec<u8>)>,
    outgoing: VecDeque<PacketBuffer>,
    /// Slot the next round-robin pass over deferred ACL starts at
    acl_cursor: usize,
    stats: HciStats,
}

impl HciDispatcher {
    /// Create a dispatcher with its own packet pool
    pub fn new(config: &StackConfig) -> Self {
        let payload = config.pool.acl_payload_size.min(u16::MAX as usize) as u16;
        let buffers = ControllerBuffers {
            acl_data_length: payload,
            acl_total: config.default_acl_credits,
            sco_data_length: config.pool.sco_payload_size.min(u8::MAX as usize) as u8,
            sco_total: config.default_sco_credits,
            le_data_length: payload,
            le_total: 0,
        };

        Self {
            pool: PacketPool::new(&config.pool),
            connections: ConnectionTable::new(config.max_connections),
            buffers,
            credits: Credits {
                acl: buffers.acl_total,
                le: 0,
                sco: buffers.sco_total,
            },
            acl_payload_size: config.pool.acl_payload_size,
            command_credits: 1,
            command_timeout: config.command_timeout,
            event_mask: config.event_mask,
            command_queue: VecDeque::new(),
            in_flight: VecDeque::new(),
            sco_queue: VecDeque::new(),
            outgoing: VecDeque::new(),
            acl_cursor: 0,
            stats: HciStats::default(),
        }
    }

    /// Queue the controller bring-up sequence
    pub fn initialize(&mut self) {
        self.queue_command(HciCommand::Reset);
        self.queue_command(HciCommand::SetEventMask {
            event_mask: self.event_mask,
        });
        self.queue_command(HciCommand::ReadBufferSize);
        self.queue_command(HciCommand::LeReadBufferSize);
        self.process_pending();
    }

    pub fn pool(&self) -> &PacketPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut PacketPool {
        &mut self.pool
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    pub fn connection(&self, handle: u16) -> Option<&ConnectionRecord> {
        self.connections.get(handle)
    }

    pub fn link_type(&self, handle: u16) -> Option<LinkType> {
        self.connections.get(handle).map(|record| record.link_type)
    }

    pub fn controller_buffers(&self) -> &ControllerBuffers {
        &self.buffers
    }

    /// Controller buffers currently free for the given link type
    pub fn available_credits(&self, link_type: LinkType) -> u16 {
        self.credits.get(link_type, &self.buffers)
    }

    /// Commands the controller currently accepts
    pub fn command_credits(&self) -> u8 {
        self.command_credits
    }

    /// Commands waiting for a command credit
    pub fn queued_commands(&self) -> usize {
        self.command_queue.len()
    }

    pub fn stats(&self) -> HciStats {
        self.stats
    }

    /// Classify and process one packet from the transport
    pub fn handle_incoming(&mut self, buffer: PacketBuffer, keys: &mut dyn KeyStore) -> HciResult<Option<Inbound>> {
        trace!("<- {} {}", buffer.packet_type(), hex::encode(buffer.as_slice()));

        match buffer.packet_type() {
            PacketType::Event => {
                let raw = HciEvent::parse(buffer.as_slice());
                self.pool.release(buffer)?;

                let event = match raw.as_ref().map(Event::decode) {
                    Some(Ok(event)) => event,
                    Some(Err(err)) => {
                        self.stats.malformed_packets += 1;
                        warn!("Dropping malformed event: {}", err);
                        return Ok(None);
                    }
                    None => {
                        self.stats.malformed_packets += 1;
                        warn!("Dropping truncated event");
                        return Ok(None);
                    }
                };

                self.apply_event(&event, keys);
                self.process_pending();
                Ok(Some(Inbound::Event(event)))
            }
            PacketType::Acl => {
                let header = match AclHeader::parse(buffer.as_slice()) {
                    Some(header) => header,
                    None => {
                        self.stats.malformed_packets += 1;
                        warn!("Dropping truncated ACL packet");
                        self.pool.release(buffer)?;
                        return Ok(None);
                    }
                };

                if !self.connections.contains(header.handle) {
                    self.stats.unknown_handle_acl += 1;
                    warn!("Dropping ACL data for unknown handle 0x{:04X}", header.handle);
                    self.pool.release(buffer)?;
                    return Ok(None);
                }

                Ok(Some(Inbound::Acl {
                    handle: header.handle,
                    buffer,
                }))
            }
            PacketType::Sco => {
                let header = match ScoHeader::parse(buffer.as_slice()) {
                    Some(header) => header,
                    None => {
                        self.stats.malformed_packets += 1;
                        warn!("Dropping truncated SCO packet");
                        self.pool.release(buffer)?;
                        return Ok(None);
                    }
                };

                if !self.connections.contains(header.handle) {
                    self.stats.unknown_handle_sco += 1;
                    warn!("Dropping SCO data for unknown handle 0x{:04X}", header.handle);
                    self.pool.release(buffer)?;
                    return Ok(None);
                }

                Ok(Some(Inbound::Sco {
                    handle: header.handle,
                    buffer,
                }))
            }
            PacketType::Command => {
                self.pool.release(buffer)?;
                Err(HciError::InvalidPacketType(HCI_COMMAND_PKT))
            }
        }
    }

    /// Queue a command; it is sent once the controller has a command credit
    pub fn send_command(&mut self, command: HciCommand) -> HciResult<()> {
        let len = command.parameters().len();
        if len > HCI_MAX_PARAM_LEN {
            return Err(HciError::InvalidParamLength(len));
        }

        self.queue_command(command);
        self.process_pending();
        Ok(())
    }

    /// Queue an HCI Disconnect for a connection
    pub fn disconnect(&mut self, handle: u16, reason: u8) -> HciResult<()> {
        if !self.connections.contains(handle) {
            return Err(HciError::UnknownConnectionHandle(handle));
        }
        self.send_command(HciCommand::Disconnect { handle, reason })
    }

    /// Queue an L2CAP PDU for a connection
    ///
    /// The PDU is cut into ACL fragments no larger than the controller's data
    /// length. Fragments wait in order for controller buffers and pool
    /// buffers; nothing is dropped while the connection exists.
    pub fn send_acl(&mut self, handle: u16, pdu: &[u8], flushable: bool) -> HciResult<()> {
        let record = self
            .connections
            .get_mut(handle)
            .ok_or(HciError::UnknownConnectionHandle(handle))?;
        if record.link_type == LinkType::Sco {
            return Err(HciError::Unsupported);
        }

        trace!("queue ACL PDU for 0x{:04X}: {}", handle, hex::encode(pdu));
        record.pending.push_back(PendingPdu::new(pdu.to_vec(), flushable));
        self.process_pending();
        Ok(())
    }

    /// Whether a PDU for `handle` would leave immediately
    pub fn can_send_acl(&self, handle: u16) -> bool {
        match self.connections.get(handle) {
            Some(record) => {
                record.link_type != LinkType::Sco
                    && !record.has_pending()
                    && self.credits.get(record.link_type, &self.buffers) > 0
                    && self.pool.available(PacketType::Acl) > 0
            }
            None => false,
        }
    }

    /// Queue one SCO packet
    pub fn send_sco(&mut self, handle: u16, data: &[u8]) -> HciResult<()> {
        if !self.connections.contains(handle) {
            return Err(HciError::UnknownConnectionHandle(handle));
        }
        let capacity = self.pool.buffer_size(PacketType::Sco).saturating_sub(HCI_SCO_HEADER_SIZE);
        if data.len() > capacity || data.len() > u8::MAX as usize {
            return Err(HciError::PacketTooLarge {
                len: data.len(),
                capacity,
            });
        }

        self.sco_queue.push_back((handle, data.to_vec()));
        self.process_pending();
        Ok(())
    }

    /// Next buffer for the transport writer
    pub fn pop_outgoing(&mut self) -> Option<PacketBuffer> {
        self.outgoing.pop_front()
    }

    /// Put back a buffer the transport could not take
    pub fn unpop_outgoing(&mut self, buffer: PacketBuffer) {
        self.outgoing.push_front(buffer);
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    pub fn outgoing_len(&self) -> usize {
        self.outgoing.len()
    }

    /// Return a buffer to the pool and use the freed slot for deferred traffic
    pub fn release(&mut self, buffer: PacketBuffer) -> HciResult<()> {
        self.pool.release(buffer)?;
        self.process_pending();
        Ok(())
    }

    /// When the oldest command in flight times out
    pub fn command_deadline(&self) -> Option<Instant> {
        self.in_flight.front().map(|command| command.sent_at + self.command_timeout)
    }

    /// Handle an expired dispatcher timer
    ///
    /// Returns the opcode of a command that timed out.
    pub fn handle_timer(&mut self, timer: HciTimer, now: Instant) -> Option<u16> {
        match timer {
            HciTimer::CommandTimeout => {
                let deadline = self.command_deadline()?;
                if deadline > now {
                    return None;
                }

                let command = self.in_flight.pop_front()?;
                self.stats.command_timeouts += 1;
                self.command_credits = self.command_credits.max(1);
                warn!("Command 0x{:04X} timed out", command.opcode);
                self.process_pending();
                Some(command.opcode)
            }
        }
    }

    /// Forget every connection after a transport failure
    ///
    /// Queued commands and outgoing buffers are discarded and the credit
    /// counters return to their totals. Returns the handles that were removed.
    pub fn reset_link(&mut self) -> Vec<u16> {
        let handles: Vec<u16> = self.connections.drain().into_iter().map(|record| record.handle).collect();

        self.command_queue.clear();
        self.in_flight.clear();
        self.sco_queue.clear();
        self.command_credits = 1;
        while let Some(buffer) = self.outgoing.pop_front() {
            if let Err(err) = self.pool.release(buffer) {
                error!("Failed to release outgoing buffer: {}", err);
            }
        }
        self.credits = Credits {
            acl: self.buffers.acl_total,
            le: self.buffers.le_total,
            sco: self.buffers.sco_total,
        };

        info!("Link reset, {} connections dropped", handles.len());
        handles
    }

    /// Move whatever the credits and pool allow into the outbound queue
    pub fn process_pending(&mut self) {
        self.send_queued_commands();
        self.send_deferred_sco();
        self.send_deferred_acl();
    }

    fn queue_command(&mut self, command: HciCommand) {
        debug!("Queue command 0x{:04X}", command.opcode());
        self.command_queue.push_back(command);
    }

    fn send_queued_commands(&mut self) {
        while self.command_credits > 0 && !self.command_queue.is_empty() {
            let mut buffer = match self.pool.acquire(PacketType::Command) {
                Ok(buffer) => buffer,
                Err(_) => break,
            };
            let command = match self.command_queue.pop_front() {
                Some(command) => command,
                None => break,
            };

            if let Err(err) = buffer.fill(&command.to_bytes()) {
                error!("Dropping command 0x{:04X}: {}", command.opcode(), err);
                if let Err(err) = self.pool.release(buffer) {
                    error!("Failed to release command buffer: {}", err);
                }
                continue;
            }

            self.command_credits -= 1;
            self.in_flight.push_back(InFlightCommand {
                opcode: command.opcode(),
                sent_at: Instant::now(),
            });
            self.stats.commands_sent += 1;
            trace!("-> command {}", hex::encode(buffer.as_slice()));
            self.outgoing.push_back(buffer);
        }
    }

    fn send_deferred_sco(&mut self) {
        let flow_controlled = self.buffers.sco_total > 0;

        while let Some((handle, _)) = self.sco_queue.front() {
            let handle = *handle;
            if flow_controlled && self.credits.sco == 0 {
                break;
            }
            let record = match self.connections.get_mut(handle) {
                Some(record) => record,
                None => {
                    debug!("Dropping SCO data for closed handle 0x{:04X}", handle);
                    self.sco_queue.pop_front();
                    continue;
                }
            };
            let mut buffer = match self.pool.acquire(PacketType::Sco) {
                Ok(buffer) => buffer,
                Err(_) => break,
            };
            let (_, data) = match self.sco_queue.pop_front() {
                Some(entry) => entry,
                None => break,
            };

            let header = ScoHeader {
                handle,
                packet_status: 0,
                data_length: data.len() as u8,
            };
            let filled = buffer
                .extend_from_slice(&header.to_bytes())
                .and_then(|_| buffer.extend_from_slice(&data));
            if let Err(err) = filled {
                error!("Dropping SCO packet for 0x{:04X}: {}", handle, err);
                if let Err(err) = self.pool.release(buffer) {
                    error!("Failed to release SCO buffer: {}", err);
                }
                continue;
            }

            if flow_controlled {
                self.credits.sco -= 1;
                record.acl_in_flight += 1;
            }
            self.stats.sco_packets_sent += 1;
            self.outgoing.push_back(buffer);
        }
    }

    /// One fragment per connection per pass, so connections share the
    /// controller buffers round-robin
    fn send_deferred_acl(&mut self) {
        let capacity = self.connections.capacity();
        if capacity == 0 {
            return;
        }

        loop {
            let mut progressed = false;
            let start = self.acl_cursor;

            for step in 0..capacity {
                let slot = (start + step) % capacity;
                let record = match self.connections.slot_mut(slot) {
                    Some(record) if record.has_pending() => record,
                    _ => continue,
                };
                let link_type = record.link_type;
                if self.credits.get(link_type, &self.buffers) == 0 {
                    continue;
                }
                if self.pool.available(PacketType::Acl) == 0 {
                    return;
                }

                let max_payload = self
                    .buffers
                    .data_length(link_type)
                    .min(self.acl_payload_size)
                    .max(1);
                match next_fragment(&mut self.pool, record, max_payload) {
                    Ok(buffer) => {
                        record.acl_in_flight += 1;
                        *self.credits.get_mut(link_type, &self.buffers) -= 1;
                        self.stats.acl_fragments_sent += 1;
                        trace!("-> ACL {}", hex::encode(buffer.as_slice()));
                        self.outgoing.push_back(buffer);
                        self.acl_cursor = (slot + 1) % capacity;
                        progressed = true;
                    }
                    Err(err) => {
                        // Pool availability was checked above
                        error!("Failed to build ACL fragment: {}", err);
                        return;
                    }
                }
            }

            if !progressed {
                break;
            }
        }
    }

    fn apply_event(&mut self, event: &Event, keys: &mut dyn KeyStore) {
        match event {
            Event::ConnectionComplete {
                status,
                handle,
                bd_addr,
                link_type,
                encryption_enabled,
            } => {
                if *status != HCI_SUCCESS {
                    debug!("Connection to {} failed: 0x{:02X}", bd_addr, status);
                    return;
                }
                let link = if *link_type == LINK_TYPE_ACL {
                    LinkType::Classic
                } else {
                    LinkType::Sco
                };
                let mut record = ConnectionRecord::new(*handle, *bd_addr, AddressType::Public, link);
                record.encrypted = *encryption_enabled;
                self.add_connection(record);
            }
            Event::SynchronousConnectionComplete {
                status,
                handle,
                bd_addr,
                ..
            } => {
                if *status != HCI_SUCCESS {
                    debug!("Synchronous connection to {} failed: 0x{:02X}", bd_addr, status);
                    return;
                }
                self.add_connection(ConnectionRecord::new(*handle, *bd_addr, AddressType::Public, LinkType::Sco));
            }
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
                if *status != HCI_SUCCESS {
                    debug!("LE connection failed: 0x{:02X}", status);
                    return;
                }
                let mut record = ConnectionRecord::new(*handle, *peer_address, *peer_address_type, LinkType::Le);
                record.role = Some(*role);
                record.interval = *interval;
                record.latency = *latency;
                record.supervision_timeout = *supervision_timeout;
                self.add_connection(record);
            }
            Event::DisconnectionComplete { status, handle, reason } => {
                if *status != HCI_SUCCESS {
                    return;
                }
                if let Some(record) = self.connections.remove(*handle) {
                    // The controller flushes whatever was still in its buffers
                    let returned = record.acl_in_flight;
                    if record.link_type != LinkType::Sco || self.buffers.sco_total > 0 {
                        let credits = self.credits.get_mut(record.link_type, &self.buffers);
                        *credits = credits.saturating_add(returned);
                    }
                    self.sco_queue.retain(|(queued, _)| queued != handle);
                    info!("Connection 0x{:04X} closed, reason 0x{:02X}", handle, reason);
                }
            }
            Event::EncryptionChange { status, handle, enabled } => {
                if *status == HCI_SUCCESS {
                    if let Some(record) = self.connections.get_mut(*handle) {
                        record.encrypted = *enabled;
                    }
                }
            }
            Event::LeConnectionUpdateComplete {
                status,
                handle,
                interval,
                latency,
                supervision_timeout,
            } => {
                if *status != HCI_SUCCESS {
                    return;
                }
                if let Some(record) = self.connections.get_mut(*handle) {
                    record.interval = *interval;
                    record.latency = *latency;
                    record.supervision_timeout = *supervision_timeout;
                    debug!("Connection 0x{:04X} updated, interval {}", handle, interval);
                }
            }
            Event::CommandComplete {
                num_hci_command_packets,
                opcode,
                return_parameters,
            } => {
                self.command_answered(*opcode, *num_hci_command_packets);
                match *opcode {
                    OPCODE_READ_BUFFER_SIZE => self.apply_read_buffer_size(return_parameters),
                    OPCODE_LE_READ_BUFFER_SIZE => self.apply_le_read_buffer_size(return_parameters),
                    _ => {}
                }
            }
            Event::CommandStatus {
                status,
                num_hci_command_packets,
                opcode,
            } => {
                if *status != HCI_SUCCESS {
                    debug!("Command 0x{:04X} failed with status 0x{:02X}", opcode, status);
                }
                self.command_answered(*opcode, *num_hci_command_packets);
            }
            Event::NumberOfCompletedPackets { completed } => {
                for &(handle, count) in completed {
                    self.complete_packets(handle, count);
                }
            }
            Event::LinkKeyRequest { bd_addr } => {
                let command = match keys.get(bd_addr) {
                    Some(StoredKey::LinkKey { key, .. }) => HciCommand::LinkKeyRequestReply {
                        bd_addr: *bd_addr,
                        link_key: key,
                    },
                    _ => HciCommand::LinkKeyRequestNegativeReply { bd_addr: *bd_addr },
                };
                self.queue_command(command);
            }
            Event::LinkKeyNotification {
                bd_addr,
                link_key,
                key_type,
            } => {
                debug!("Storing link key for {}", bd_addr);
                keys.put(
                    *bd_addr,
                    StoredKey::LinkKey {
                        key: *link_key,
                        key_type: *key_type,
                    },
                );
            }
            Event::LeLongTermKeyRequest { handle, random, ediv } => {
                let stored = self
                    .connections
                    .get(*handle)
                    .and_then(|record| keys.get(&record.address));
                let command = match stored {
                    Some(StoredKey::LongTermKey(ltk)) if ltk.matches(*ediv, random) => {
                        HciCommand::LeLongTermKeyRequestReply {
                            handle: *handle,
                            long_term_key: ltk.key,
                        }
                    }
                    _ => HciCommand::LeLongTermKeyRequestNegativeReply { handle: *handle },
                };
                self.queue_command(command);
            }
            Event::Unknown(_) => {}
        }
    }

    fn add_connection(&mut self, record: ConnectionRecord) {
        let handle = record.handle;
        let link_type = record.link_type;
        let address = record.address;

        match self.connections.insert(record) {
            Ok(()) => info!("{} connection 0x{:04X} to {}", link_type, handle, address),
            Err(err) => {
                warn!("Rejecting connection 0x{:04X}: {}", handle, err);
                self.queue_command(HciCommand::Disconnect {
                    handle,
                    reason: HCI_REMOTE_LOW_RESOURCES,
                });
            }
        }
    }

    fn command_answered(&mut self, opcode: u16, credits: u8) {
        self.command_credits = credits;
        // Opcode 0 only updates the credit count
        if opcode != 0 {
            if let Some(position) = self.in_flight.iter().position(|command| command.opcode == opcode) {
                self.in_flight.remove(position);
            }
        }
    }

    fn complete_packets(&mut self, handle: u16, count: u16) {
        let record = match self.connections.get_mut(handle) {
            Some(record) => record,
            None => {
                debug!("Completed packets for unknown handle 0x{:04X}", handle);
                return;
            }
        };

        let returned = count.min(record.acl_in_flight);
        if returned < count {
            warn!(
                "Controller completed {} packets on 0x{:04X} with {} in flight",
                count, handle, record.acl_in_flight
            );
        }
        record.acl_in_flight -= returned;

        let link_type = record.link_type;
        if link_type == LinkType::Sco && self.buffers.sco_total == 0 {
            return;
        }
        let total = self.buffers.total(link_type);
        let credits = self.credits.get_mut(link_type, &self.buffers);
        *credits = credits.saturating_add(returned).min(total.max(*credits));
    }

    fn apply_read_buffer_size(&mut self, params: &[u8]) {
        let parsed = parse_read_buffer_size(params);

        match parsed {
            Ok(Some((acl_data_length, sco_data_length, acl_total, sco_total))) => {
                self.buffers.acl_data_length = acl_data_length;
                self.buffers.sco_data_length = sco_data_length;
                self.buffers.acl_total = acl_total;
                self.buffers.sco_total = sco_total;
                info!(
                    "Controller buffers: ACL {} x {}, SCO {} x {}",
                    acl_total, acl_data_length, sco_total, sco_data_length
                );
                self.recompute_credits();
            }
            Ok(None) => warn!("Read Buffer Size failed"),
            Err(_) => {
                self.stats.malformed_packets += 1;
                warn!("Malformed Read Buffer Size response");
            }
        }
    }

    fn apply_le_read_buffer_size(&mut self, params: &[u8]) {
        let parsed = parse_le_read_buffer_size(params);

        match parsed {
            Ok(Some((le_data_length, le_total))) => {
                if le_data_length == 0 || le_total == 0 {
                    info!("LE shares the BR/EDR controller buffers");
                    self.buffers.le_data_length = self.buffers.acl_data_length;
                    self.buffers.le_total = 0;
                } else {
                    info!("Controller buffers: LE {} x {}", le_total, le_data_length);
                    self.buffers.le_data_length = le_data_length;
                    self.buffers.le_total = le_total as u16;
                }
                self.recompute_credits();
            }
            Ok(None) => warn!("LE Read Buffer Size failed"),
            Err(_) => {
                self.stats.malformed_packets += 1;
                warn!("Malformed LE Read Buffer Size response");
            }
        }
    }

    /// Recompute the free counts from the totals and the packets in flight
    fn recompute_credits(&mut self) {
        let mut in_flight = Credits::default();
        for record in self.connections.iter() {
            let counter = in_flight.get_mut(record.link_type, &self.buffers);
            *counter = counter.saturating_add(record.acl_in_flight);
        }

        self.credits = Credits {
            acl: self.buffers.acl_total.saturating_sub(in_flight.acl),
            le: self.buffers.le_total.saturating_sub(in_flight.le),
            sco: self.buffers.sco_total.saturating_sub(in_flight.sco),
        };
    }
}

/// ACL data length, SCO data length, ACL total, SCO total; `None` on failure status
fn parse_read_buffer_size(params: &[u8]) -> std::io::Result<Option<(u16, u8, u16, u16)>> {
    let mut c = Cursor::new(params);
    if c.read_u8()? != HCI_SUCCESS {
        return Ok(None);
    }
    Ok(Some((
        c.read_u16::<LittleEndian>()?,
        c.read_u8()?,
        c.read_u16::<LittleEndian>()?,
        c.read_u16::<LittleEndian>()?,
    )))
}

/// LE data length and LE total; `None` on failure status
fn parse_le_read_buffer_size(params: &[u8]) -> std::io::Result<Option<(u16, u8)>> {
    let mut c = Cursor::new(params);
    if c.read_u8()? != HCI_SUCCESS {
        return Ok(None);
    }
    Ok(Some((c.read_u16::<LittleEndian>()?, c.read_u8()?)))
}

/// Cut the next fragment of the connection's oldest pending PDU
fn next_fragment(pool: &mut PacketPool, record: &mut ConnectionRecord, max_payload: usize) -> HciResult<PacketBuffer> {
    let handle = record.handle;
    let link_type = record.link_type;
    let pdu = record.pending.front_mut().ok_or(HciError::InvalidPacketFormat)?;

    let remaining = pdu.data.len() - pdu.offset;
    let len = remaining.min(max_payload);
    let packet_boundary = if pdu.started {
        ACL_PB_CONTINUING
    } else if pdu.flushable && link_type == LinkType::Classic {
        ACL_PB_FIRST_FLUSHABLE
    } else {
        ACL_PB_FIRST_NON_FLUSHABLE
    };

    let mut buffer = pool.acquire(PacketType::Acl)?;
    let header = AclHeader::new(handle, packet_boundary, len as u16);
    let filled = buffer
        .extend_from_slice(&header.to_bytes())
        .and_then(|_| buffer.extend_from_slice(&pdu.data[pdu.offset..pdu.offset + len]));
    if let Err(err) = filled {
        pool.release(buffer)?;
        return Err(err.into());
    }

    pdu.offset += len;
    pdu.started = true;
    if pdu.is_done() {
        record.pending.pop_front();
    }
    Ok(buffer)
}
