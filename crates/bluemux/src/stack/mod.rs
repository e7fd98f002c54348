//! Stack glue
//!
//! A [`Stack`] owns one transport, the H4 framer, the HCI dispatcher, the
//! L2CAP manager, the key store and the run loop's timers, and moves data
//! between them. Nothing is shared between two stacks.

use crate::buffer::PacketBuffer;
use crate::config::StackConfig;
use crate::error::{Error, HciError, Result};
use crate::hci::constants::HCI_SCO_HEADER_SIZE;
use crate::hci::{AclPacket, Event, HciCommand, HciDispatcher, HciTimer, Inbound};
use crate::l2cap::{
    CloseReason, FixedChannelHandler, L2capManager, L2capResult, L2capTimer, LeCreditBasedConfig,
};
use crate::run_loop::{RunLoop, TimerId};
use crate::storage::{KeyStore, MemoryKeyStore};
use crate::transport::{H4Framer, Transport};
use log::{debug, error, info, trace, warn};
use std::fmt;
use std::io;
use std::time::Instant;

/// Bytes requested from the transport per read
const READ_CHUNK: usize = 1024;

/// Timer events of every layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackTimer {
    Hci(HciTimer),
    L2cap(L2capTimer),
}

impl From<L2capTimer> for StackTimer {
    fn from(timer: L2capTimer) -> Self {
        Self::L2cap(timer)
    }
}

impl From<HciTimer> for StackTimer {
    fn from(timer: HciTimer) -> Self {
        Self::Hci(timer)
    }
}

/// Stack-level notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackEvent {
    /// An HCI event, after the dispatcher and L2CAP have applied it
    Hci(Event),
    /// The controller never answered a command
    CommandTimeout { opcode: u16 },
    /// The transport failed; every connection was torn down locally
    TransportError(io::ErrorKind),
}

/// Callback for stack events
pub type StackEventCallback = Box<dyn FnMut(&StackEvent)>;

/// Consumer of SCO data: connection handle and payload
pub type ScoHandler = Box<dyn FnMut(u16, &[u8])>;

/// One independent HCI/L2CAP stack on top of a transport
pub struct Stack<T: Transport> {
    transport: T,
    framer: H4Framer,
    hci: HciDispatcher,
    l2cap: L2capManager,
    timers: RunLoop<StackTimer>,
    keys: Box<dyn KeyStore>,
    /// Bytes read but not yet taken by the framer
    rx_pending: Vec<u8>,
    /// H4 frame partially written to the transport
    tx_pending: Vec<u8>,
    writable: bool,
    /// Armed command timeout and the deadline it was armed for
    command_timer: Option<(TimerId, Instant)>,
    event_callback: Option<StackEventCallback>,
    sco_handler: Option<ScoHandler>,
}

impl<T: Transport> fmt::Debug for Stack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("connections", &self.hci.connections().len())
            .field("l2cap", &self.l2cap)
            .field("timers", &self.timers)
            .field("rx_pending", &self.rx_pending.len())
            .field("tx_pending", &self.tx_pending.len())
            .field("writable", &self.writable)
            .finish()
    }
}

impl<T: Transport> Stack<T> {
    /// Build a stack with an in-memory key store
    pub fn new(config: StackConfig, transport: T) -> Result<Self> {
        Self::with_key_store(config, transport, Box::new(MemoryKeyStore::new()))
    }

    /// Build a stack around a caller-provided key store
    pub fn with_key_store(config: StackConfig, transport: T, keys: Box<dyn KeyStore>) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            transport,
            framer: H4Framer::new(),
            hci: HciDispatcher::new(&config),
            l2cap: L2capManager::new(&config),
            timers: RunLoop::new(),
            keys,
            rx_pending: Vec::with_capacity(READ_CHUNK),
            tx_pending: Vec::new(),
            writable: true,
            command_timer: None,
            event_callback: None,
            sco_handler: None,
        })
    }

    /// Queue the controller bring-up commands and start writing them
    pub fn initialize(&mut self) -> Result<()> {
        info!("Initializing controller");
        self.hci.initialize();
        self.pump()
    }

    pub fn hci(&self) -> &HciDispatcher {
        &self.hci
    }

    pub fn l2cap(&self) -> &L2capManager {
        &self.l2cap
    }

    pub fn l2cap_mut(&mut self) -> &mut L2capManager {
        &mut self.l2cap
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn timers(&self) -> &RunLoop<StackTimer> {
        &self.timers
    }

    pub fn key_store(&self) -> &dyn KeyStore {
        self.keys.as_ref()
    }

    /// Whether the last write attempt found the transport writable
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn set_event_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&StackEvent) + 'static,
    {
        self.event_callback = Some(Box::new(callback));
    }

    pub fn set_sco_handler<F>(&mut self, handler: F)
    where
        F: FnMut(u16, &[u8]) + 'static,
    {
        self.sco_handler = Some(Box::new(handler));
    }

    pub fn register_fixed_channel(&mut self, cid: u16, handler: Box<dyn FixedChannelHandler>) -> Result<()> {
        self.l2cap.register_fixed_channel(cid, handler)?;
        Ok(())
    }

    /// Run an L2CAP operation that needs the dispatcher and the timers, then
    /// push out whatever it queued
    pub fn with_l2cap<R, F>(&mut self, operation: F) -> Result<R>
    where
        F: FnOnce(&mut L2capManager, &mut HciDispatcher, &mut RunLoop<StackTimer>) -> L2capResult<R>,
    {
        let result = operation(&mut self.l2cap, &mut self.hci, &mut self.timers)?;
        self.pump()?;
        Ok(result)
    }

    pub fn open_channel(&mut self, handle: u16, psm: u16) -> Result<u16> {
        self.with_l2cap(|l2cap, hci, timers| l2cap.open_channel(hci, timers, handle, psm))
    }

    pub fn open_le_credit_channel(&mut self, handle: u16, le_psm: u16, config: LeCreditBasedConfig) -> Result<u16> {
        self.with_l2cap(|l2cap, hci, timers| l2cap.open_le_credit_channel(hci, timers, handle, le_psm, config))
    }

    pub fn open_enhanced_credit_channels(
        &mut self,
        handle: u16,
        spsm: u16,
        config: LeCreditBasedConfig,
        count: usize,
    ) -> Result<Vec<u16>> {
        self.with_l2cap(|l2cap, hci, timers| l2cap.open_enhanced_credit_channels(hci, timers, handle, spsm, config, count))
    }

    pub fn reconfigure_enhanced_channels(&mut self, handle: u16, local_cids: &[u16], mtu: u16, mps: u16) -> Result<()> {
        self.with_l2cap(|l2cap, hci, timers| l2cap.reconfigure_enhanced_channels(hci, timers, handle, local_cids, mtu, mps))
    }

    pub fn request_echo(&mut self, handle: u16, data: &[u8]) -> Result<()> {
        self.with_l2cap(|l2cap, hci, timers| l2cap.request_echo(hci, timers, handle, data))
    }

    pub fn send_sdu(&mut self, handle: u16, local_cid: u16, data: &[u8]) -> Result<()> {
        self.with_l2cap(|l2cap, hci, _| l2cap.send_sdu(hci, handle, local_cid, data))
    }

    pub fn provide_credits(&mut self, handle: u16, local_cid: u16, credits: u16) -> Result<()> {
        self.with_l2cap(|l2cap, hci, _| l2cap.provide_credits(hci, handle, local_cid, credits))
    }

    pub fn disconnect_channel(&mut self, handle: u16, local_cid: u16) -> Result<()> {
        self.with_l2cap(|l2cap, hci, timers| l2cap.disconnect(hci, timers, handle, local_cid))
    }

    pub fn send_fixed(&mut self, handle: u16, cid: u16, data: &[u8]) -> Result<()> {
        self.with_l2cap(|l2cap, hci, _| l2cap.send_fixed(hci, handle, cid, data))
    }

    /// Ask for a can-send-now callback on a fixed channel
    pub fn request_can_send_now(&mut self, handle: u16, cid: u16) -> Result<()> {
        self.with_l2cap(|l2cap, _, _| l2cap.request_can_send_now(handle, cid))
    }

    pub fn send_command(&mut self, command: HciCommand) -> Result<()> {
        self.hci.send_command(command)?;
        self.pump()
    }

    pub fn send_sco(&mut self, handle: u16, data: &[u8]) -> Result<()> {
        self.hci.send_sco(handle, data)?;
        self.pump()
    }

    /// Disconnect an HCI connection
    pub fn disconnect(&mut self, handle: u16, reason: u8) -> Result<()> {
        self.hci.disconnect(handle, reason)?;
        self.pump()
    }

    /// One run loop iteration
    ///
    /// Waits for the transport until the earliest timer deadline, handles
    /// whatever arrived, fires expired timers and writes queued packets.
    pub fn run_once(&mut self) -> Result<()> {
        let timeout = self.timers.timeout_at(Instant::now());
        let ready = match self.transport.wait(timeout) {
            Ok(ready) => ready,
            Err(err) => return Err(self.transport_failed(err)),
        };

        if ready {
            self.read_transport()?;
        }
        if !self.writable && self.transport.can_send() {
            self.on_transport_writable()?;
        }
        self.process_timers(Instant::now());
        self.pump()
    }

    /// Iterate until the transport fails
    pub fn run(&mut self) -> Result<()> {
        loop {
            self.run_once()?;
        }
    }

    /// The transport became writable again
    ///
    /// Only a not-writable to writable transition does anything. Returns
    /// whether this call was such a transition.
    pub fn on_transport_writable(&mut self) -> Result<bool> {
        if self.writable {
            return Ok(false);
        }
        trace!("Transport writable");
        self.writable = true;
        self.pump()?;
        Ok(true)
    }

    /// Fire every timer that expired by `now`
    pub fn process_timers(&mut self, now: Instant) -> usize {
        let barrier = self.timers.barrier();
        let mut fired = 0;
        while let Some((id, timer)) = self.timers.next_expired(now, barrier) {
            fired += 1;
            match timer {
                StackTimer::Hci(timer) => {
                    if self.command_timer.is_some_and(|(armed, _)| armed == id) {
                        self.command_timer = None;
                    }
                    if let Some(opcode) = self.hci.handle_timer(timer, now) {
                        self.emit(StackEvent::CommandTimeout { opcode });
                    }
                }
                StackTimer::L2cap(timer) => self.l2cap.handle_timer(&mut self.hci, &mut self.timers, timer),
            }
        }
        self.sync_command_timer();
        fired
    }

    /// Read what the transport has and run it through the stack
    fn read_transport(&mut self) -> Result<()> {
        // Stalled input stays with the framer until buffers come back
        if self.rx_pending.is_empty() {
            let mut chunk = [0u8; READ_CHUNK];
            match self.transport.read(&mut chunk) {
                Ok(0) => {}
                Ok(n) => self.rx_pending.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(self.transport_failed(err)),
            }
        }
        self.drain_rx();
        Ok(())
    }

    /// Feed buffered bytes to the framer and dispatch complete packets
    ///
    /// Returns the number of packets dispatched.
    fn drain_rx(&mut self) -> usize {
        let mut offset = 0;
        let mut dispatched = 0;
        while offset < self.rx_pending.len() || self.framer.is_stalled() {
            let (consumed, packet) = self.framer.feed(&self.rx_pending[offset..], self.hci.pool_mut());
            offset += consumed;
            match packet {
                Some(buffer) => {
                    dispatched += 1;
                    self.dispatch(buffer);
                }
                None if consumed == 0 => break,
                None => {}
            }
        }
        self.rx_pending.drain(..offset);
        dispatched
    }

    fn dispatch(&mut self, buffer: PacketBuffer) {
        let inbound = match self.hci.handle_incoming(buffer, self.keys.as_mut()) {
            Ok(Some(inbound)) => inbound,
            Ok(None) => return,
            Err(err) => {
                warn!("Dropping inbound packet: {}", err);
                return;
            }
        };

        match inbound {
            Inbound::Event(event) => {
                self.l2cap.on_hci_event(&mut self.timers, &event);
                self.emit(StackEvent::Hci(event));
            }
            Inbound::Acl { handle, buffer } => {
                match AclPacket::parse(buffer.as_slice()) {
                    Some(packet) => self.l2cap.route(&mut self.hci, &mut self.timers, handle, &packet),
                    None => warn!("ACL packet for 0x{:04X} shorter than its header claims", handle),
                }
                self.release(buffer);
            }
            Inbound::Sco { handle, buffer } => {
                if let Some(handler) = self.sco_handler.as_mut() {
                    handler(handle, buffer.as_slice().get(HCI_SCO_HEADER_SIZE..).unwrap_or_default());
                }
                self.release(buffer);
            }
        }
    }

    fn release(&mut self, buffer: PacketBuffer) {
        if let Err(err) = self.hci.release(buffer) {
            error!("Failed to release inbound buffer: {}", err);
        }
    }

    /// Give fixed channels their turn, write queued packets and pick up
    /// input that waited for buffers
    fn pump(&mut self) -> Result<()> {
        loop {
            self.l2cap.service_fixed_channels(&mut self.hci);
            self.flush_outgoing()?;

            if !self.framer.is_stalled() || self.drain_rx() == 0 {
                break;
            }
        }
        self.sync_command_timer();
        Ok(())
    }

    /// Write queued packets until the transport pushes back
    fn flush_outgoing(&mut self) -> Result<()> {
        while self.writable {
            if self.tx_pending.is_empty() {
                if !self.transport.can_send() {
                    self.writable = false;
                    break;
                }
                let Some(buffer) = self.hci.pop_outgoing() else {
                    break;
                };
                self.tx_pending.push(buffer.packet_type().indicator());
                self.tx_pending.extend_from_slice(buffer.as_slice());
                self.hci.release(buffer)?;
            }

            match self.transport.write(&self.tx_pending) {
                Ok(0) => self.writable = false,
                Ok(n) => {
                    self.tx_pending.drain(..n);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => self.writable = false,
                Err(err) => return Err(self.transport_failed(err)),
            }
        }
        Ok(())
    }

    /// Keep the command timeout timer on the oldest command in flight
    fn sync_command_timer(&mut self) {
        let deadline = self.hci.command_deadline();
        if self.command_timer.map(|(_, armed)| armed) == deadline {
            return;
        }

        if let Some((id, _)) = self.command_timer.take() {
            self.timers.remove_timer(id);
        }
        if let Some(deadline) = deadline {
            let id = self.timers.add_timer_at(deadline, HciTimer::CommandTimeout.into());
            self.command_timer = Some((id, deadline));
        }
    }

    /// Tear everything down after a transport failure
    fn transport_failed(&mut self, err: io::Error) -> Error {
        error!("Transport failed: {}", err);
        self.emit(StackEvent::TransportError(err.kind()));

        for handle in self.hci.reset_link() {
            debug!("Dropping connection 0x{:04X}", handle);
            self.l2cap
                .close_connection(&mut self.timers, handle, CloseReason::LinkDisconnected);
        }
        if let Some((id, _)) = self.command_timer.take() {
            self.timers.remove_timer(id);
        }
        self.framer.reset();
        self.rx_pending.clear();
        self.tx_pending.clear();
        self.writable = true;

        Error::Hci(HciError::Io(err))
    }

    fn emit(&mut self, event: StackEvent) {
        if let Some(callback) = self.event_callback.as_mut() {
            callback(&event);
        }
    }
}

#[cfg(test)]
mod tests;
