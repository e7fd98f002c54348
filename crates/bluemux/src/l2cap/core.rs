//! L2CAP Core Manager implementation
//!
//! This module provides the core L2CAP manager that handles:
//! - ACL recombination and routing by channel ID
//! - Fixed channel handlers and their can-send-now queue
//! - The signaling engine for dynamic channels
//! - Credit-based flow control

use crate::config::StackConfig;
use crate::hci::{AclPacket, Event, HciCommand, HciDispatcher, LeRole, LinkType};
use crate::l2cap::channel::{L2capChannel, L2capChannelType};
use crate::l2cap::constants::*;
use crate::l2cap::fifo::{FixedChannelFifo, FixedChannelKey};
use crate::l2cap::packet::{build_pdu, L2capCommandHeader, L2capHeader};
use crate::l2cap::psm::{is_valid_le_psm, is_valid_psm};
use crate::l2cap::signaling::{ExtendedFeatures, FixedChannels, SignalId, SignalingMessage};
use crate::l2cap::types::*;
use crate::run_loop::{RunLoop, TimerId};
use log::{debug, error, info, trace, warn};
use std::collections::HashMap;
use std::fmt;

/// Timers armed by the L2CAP manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2capTimer {
    /// No response to signaling request `identifier` on `handle`
    Rtx { handle: u16, identifier: SignalId },
}

/// Channel events for callbacks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A dynamic channel is open for data
    Opened {
        handle: u16,
        local_cid: u16,
        psm: u16,
        remote_mtu: u16,
    },
    /// An outgoing or incoming channel closed before it opened
    OpenFailed {
        handle: u16,
        local_cid: u16,
        psm: u16,
        reason: CloseReason,
    },
    /// An open channel closed
    Closed {
        handle: u16,
        local_cid: u16,
        reason: CloseReason,
    },
    /// The peer opened a channel to a registered service
    IncomingConnection { handle: u16, local_cid: u16, psm: u16 },
    /// A complete SDU arrived on a dynamic channel
    Data { handle: u16, local_cid: u16, data: Vec<u8> },
    /// A peripheral asked for new connection parameters
    ConnectionParameterUpdateRequest {
        handle: u16,
        params: ConnectionParameterUpdate,
        accepted: bool,
    },
    /// The central answered our connection parameter request
    ConnectionParameterUpdateResponse { handle: u16, accepted: bool },
    /// The peer answered our Echo Request
    EchoResponse { handle: u16, data: Vec<u8> },
    /// The peer answered our Credit Based Reconfigure Request
    ReconfigureComplete { handle: u16, result: u16 },
    /// The peer changed its MTU and MPS on an enhanced credit-based channel
    Reconfigured {
        handle: u16,
        local_cid: u16,
        remote_mtu: u16,
        remote_mps: u16,
    },
}

/// Callback for channel events like open, close and data
pub type ChannelEventCallback = Box<dyn FnMut(&ChannelEvent)>;

/// Receiver of a fixed channel's traffic (ATT, SM, ...)
pub trait FixedChannelHandler {
    /// A PDU arrived, `data` is the payload without the L2CAP header
    fn receive(&mut self, handle: u16, data: &[u8]);

    /// The channel asked to send and the controller can take a PDU now
    fn can_send_now(&mut self, sender: &mut FixedChannelSender<'_>);
}

/// Send capability handed to [`FixedChannelHandler::can_send_now`]
pub struct FixedChannelSender<'a> {
    hci: &'a mut HciDispatcher,
    key: FixedChannelKey,
    mtu: usize,
    sent: bool,
    again: bool,
}

impl<'a> FixedChannelSender<'a> {
    fn new(hci: &'a mut HciDispatcher, key: FixedChannelKey, mtu: usize) -> Self {
        Self {
            hci,
            key,
            mtu,
            sent: false,
            again: false,
        }
    }

    pub fn handle(&self) -> u16 {
        self.key.handle
    }

    pub fn cid(&self) -> u16 {
        self.key.cid
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Send one PDU on the channel
    pub fn send(&mut self, data: &[u8]) -> L2capResult<()> {
        if self.sent {
            return Err(L2capError::InvalidState);
        }
        if data.len() > self.mtu {
            return Err(L2capError::MtuExceeded {
                len: data.len(),
                mtu: self.mtu,
            });
        }
        self.hci.send_acl(self.key.handle, &build_pdu(self.key.cid, data), true)?;
        self.sent = true;
        Ok(())
    }

    /// Ask for another turn once every other waiting channel had one
    pub fn request_can_send_now(&mut self) {
        self.again = true;
    }
}

/// Local CIDs named by one enhanced credit-based request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CidList {
    cids: [u16; L2CAP_ECBM_MAX_CHANNELS],
    len: usize,
}

impl CidList {
    fn new(cids: &[u16]) -> Self {
        let len = cids.len().min(L2CAP_ECBM_MAX_CHANNELS);
        let mut list = Self {
            cids: [0; L2CAP_ECBM_MAX_CHANNELS],
            len,
        };
        list.cids[..len].copy_from_slice(&cids[..len]);
        list
    }

    fn as_slice(&self) -> &[u16] {
        &self.cids[..self.len]
    }
}

/// What an outstanding signaling request was for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    Connect { local_cid: u16 },
    LeConnect { local_cid: u16 },
    EnhancedConnect { local_cids: CidList },
    Configure { local_cid: u16 },
    Reconfigure { local_cids: CidList, mtu: u16, mps: u16 },
    Disconnect { local_cid: u16, reason: CloseReason },
    Information { info_type: u16 },
    Echo,
    ConnectionParameterUpdate,
}

impl PendingKind {
    /// The single channel the request belongs to
    ///
    /// Requests covering a group of channels outlive any one member.
    fn local_cid(&self) -> Option<u16> {
        match *self {
            Self::Connect { local_cid }
            | Self::LeConnect { local_cid }
            | Self::Configure { local_cid }
            | Self::Disconnect { local_cid, .. } => Some(local_cid),
            _ => None,
        }
    }
}

/// MTU, MPS and credits one side announces for an enhanced credit-based group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CreditParams {
    mtu: u16,
    mps: u16,
    initial_credits: u16,
}

impl CreditParams {
    fn acceptable(&self) -> bool {
        self.mtu >= L2CAP_ECBM_MIN_MTU && self.mps >= L2CAP_ECBM_MIN_MPS && self.mps <= L2CAP_LE_MAX_MPS
    }
}

#[derive(Debug)]
struct PendingRequest {
    kind: PendingKind,
    timer: TimerId,
}

/// ACL recombination state of one connection
#[derive(Debug)]
enum Recombination {
    /// Collecting fragments of a PDU of `expected` bytes (header included)
    Collecting { expected: usize, data: Vec<u8> },
    /// Dropping continuation fragments of a rejected PDU
    Discarding,
}

/// L2CAP Manager responsible for handling L2CAP operations
pub struct L2capManager {
    config: StackConfig,
    /// Dynamic channels by (handle, local CID)
    channels: HashMap<(u16, u16), L2capChannel>,
    /// Classic services by PSM
    services: HashMap<u16, ConnectionPolicy>,
    /// LE credit-based services by LE_PSM
    le_services: HashMap<u16, ConnectionPolicy>,
    /// Enhanced credit-based services by SPSM
    enhanced_services: HashMap<u16, ConnectionPolicy>,
    fixed_handlers: HashMap<u16, Box<dyn FixedChannelHandler>>,
    fifo: FixedChannelFifo,
    /// Outstanding signaling requests by (handle, identifier)
    pending: HashMap<(u16, SignalId), PendingRequest>,
    recombination: HashMap<u16, Recombination>,
    next_identifier: SignalId,
    event_callback: Option<ChannelEventCallback>,
    remote_features: HashMap<u16, ExtendedFeatures>,
    remote_fixed_channels: HashMap<u16, FixedChannels>,
}

impl fmt::Debug for L2capManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("L2capManager")
            .field("channels", &self.channels.len())
            .field("services", &self.services.len())
            .field("le_services", &self.le_services.len())
            .field("enhanced_services", &self.enhanced_services.len())
            .field("fixed_channels", &self.fixed_handlers.keys().collect::<Vec<_>>())
            .field("ready", &self.fifo.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl L2capManager {
    pub fn new(config: &StackConfig) -> Self {
        Self {
            config: config.clone(),
            channels: HashMap::new(),
            services: HashMap::new(),
            le_services: HashMap::new(),
            enhanced_services: HashMap::new(),
            fixed_handlers: HashMap::new(),
            fifo: FixedChannelFifo::new(),
            pending: HashMap::new(),
            recombination: HashMap::new(),
            next_identifier: 1,
            event_callback: None,
            remote_features: HashMap::new(),
            remote_fixed_channels: HashMap::new(),
        }
    }

    /// Set the callback for dynamic channel events
    pub fn set_event_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&ChannelEvent) + 'static,
    {
        self.event_callback = Some(Box::new(callback));
    }

    /// Register the handler of a fixed channel
    pub fn register_fixed_channel(&mut self, cid: u16, handler: Box<dyn FixedChannelHandler>) -> L2capResult<()> {
        if cid == 0
            || cid == L2CAP_SIGNALING_CID
            || cid == L2CAP_LE_SIGNALING_CID
            || cid >= L2CAP_DYNAMIC_CID_MIN
        {
            return Err(L2capError::InvalidParameter(format!("CID 0x{:04X} is not a fixed channel", cid)));
        }
        if self.fixed_handlers.contains_key(&cid) {
            return Err(L2capError::InvalidParameter(format!("CID 0x{:04X} already registered", cid)));
        }
        self.fixed_handlers.insert(cid, handler);
        debug!("Registered fixed channel 0x{:04X}", cid);
        Ok(())
    }

    /// Remove a fixed channel handler and its pending send requests
    pub fn unregister_fixed_channel(&mut self, cid: u16) -> Option<Box<dyn FixedChannelHandler>> {
        self.fifo.remove_cid(cid);
        self.fixed_handlers.remove(&cid)
    }

    /// Register a Classic service for incoming connections
    pub fn register_service(&mut self, psm: u16, policy: ConnectionPolicy) -> L2capResult<()> {
        if !is_valid_psm(psm) {
            return Err(L2capError::InvalidPsm(psm));
        }
        if self.services.contains_key(&psm) {
            return Err(L2capError::InvalidParameter(format!("PSM 0x{:04X} already registered", psm)));
        }
        self.services.insert(psm, policy);
        Ok(())
    }

    pub fn unregister_service(&mut self, psm: u16) -> bool {
        self.services.remove(&psm).is_some()
    }

    /// Register an LE credit-based service for incoming connections
    pub fn register_le_service(&mut self, le_psm: u16, policy: ConnectionPolicy) -> L2capResult<()> {
        if !is_valid_le_psm(le_psm) {
            return Err(L2capError::InvalidPsm(le_psm));
        }
        if self.le_services.contains_key(&le_psm) {
            return Err(L2capError::InvalidParameter(format!("LE_PSM 0x{:04X} already registered", le_psm)));
        }
        self.le_services.insert(le_psm, policy);
        Ok(())
    }

    pub fn unregister_le_service(&mut self, le_psm: u16) -> bool {
        self.le_services.remove(&le_psm).is_some()
    }

    /// Register an enhanced credit-based service for incoming connections
    ///
    /// `spsm` is an LE_PSM on LE links and a PSM on BR/EDR links.
    pub fn register_enhanced_service(&mut self, spsm: u16, policy: ConnectionPolicy) -> L2capResult<()> {
        if !is_valid_le_psm(spsm) && !is_valid_psm(spsm) {
            return Err(L2capError::InvalidPsm(spsm));
        }
        if self.enhanced_services.contains_key(&spsm) {
            return Err(L2capError::InvalidParameter(format!("SPSM 0x{:04X} already registered", spsm)));
        }
        self.enhanced_services.insert(spsm, policy);
        Ok(())
    }

    pub fn unregister_enhanced_service(&mut self, spsm: u16) -> bool {
        self.enhanced_services.remove(&spsm).is_some()
    }

    pub fn channel(&self, handle: u16, local_cid: u16) -> Option<&L2capChannel> {
        self.channels.get(&(handle, local_cid))
    }

    pub fn channels(&self) -> impl Iterator<Item = &L2capChannel> {
        self.channels.values()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Fixed channels waiting for a send opportunity
    pub fn ready_fixed_channels(&self) -> usize {
        self.fifo.len()
    }

    /// Extended features reported by the peer, once asked
    pub fn remote_extended_features(&self, handle: u16) -> Option<ExtendedFeatures> {
        self.remote_features.get(&handle).copied()
    }

    /// Fixed channel mask reported by the peer, once asked
    pub fn remote_fixed_channels(&self, handle: u16) -> Option<FixedChannels> {
        self.remote_fixed_channels.get(&handle).copied()
    }

    /// Fixed channels we announce over BR/EDR
    pub fn local_fixed_channels(&self) -> FixedChannels {
        self.fixed_handlers
            .keys()
            .filter(|cid| **cid != L2CAP_SECURITY_MANAGER_CID)
            .filter_map(|cid| FixedChannels::for_cid(*cid))
            .fold(FixedChannels::SIGNALING, |mask, bit| mask | bit)
    }

    /// Open a basic mode channel to a Classic service
    pub fn open_channel<E: From<L2capTimer>>(
        &mut self,
        hci: &mut HciDispatcher,
        timers: &mut RunLoop<E>,
        handle: u16,
        psm: u16,
    ) -> L2capResult<u16> {
        if !is_valid_psm(psm) {
            return Err(L2capError::InvalidPsm(psm));
        }
        match hci.link_type(handle) {
            Some(LinkType::Classic) => {}
            Some(_) => return Err(L2capError::NotSupported),
            None => return Err(L2capError::NotConnected),
        }

        let local_cid = self.allocate_cid(handle, false)?;
        let mut channel = L2capChannel::new_basic(handle, local_cid, psm, self.config.classic_mtu, true);
        channel.set_state(L2capChannelState::WaitConnectRsp);
        self.channels.insert((handle, local_cid), channel);

        let request = self.start_request(hci, timers, handle, false, PendingKind::Connect { local_cid }, |identifier| {
            SignalingMessage::ConnectionRequest {
                identifier,
                psm,
                source_cid: local_cid,
            }
        });
        if let Err(err) = request {
            self.channels.remove(&(handle, local_cid));
            return Err(err);
        }

        info!("Opening channel 0x{:04X} to PSM 0x{:04X} on 0x{:04X}", local_cid, psm, handle);
        Ok(local_cid)
    }

    /// Open an LE credit-based channel
    pub fn open_le_credit_channel<E: From<L2capTimer>>(
        &mut self,
        hci: &mut HciDispatcher,
        timers: &mut RunLoop<E>,
        handle: u16,
        le_psm: u16,
        config: LeCreditBasedConfig,
    ) -> L2capResult<u16> {
        if !is_valid_le_psm(le_psm) {
            return Err(L2capError::InvalidPsm(le_psm));
        }
        if config.mtu < L2CAP_LE_DEFAULT_MTU || config.mps < L2CAP_LE_DEFAULT_MTU || config.mps > L2CAP_LE_MAX_MPS {
            return Err(L2capError::InvalidParameter(format!(
                "MTU {} / MPS {} out of range",
                config.mtu, config.mps
            )));
        }
        match hci.link_type(handle) {
            Some(LinkType::Le) => {}
            Some(_) => return Err(L2capError::NotSupported),
            None => return Err(L2capError::NotConnected),
        }

        let local_cid = self.allocate_cid(handle, true)?;
        let mut channel = L2capChannel::new_le_credit(handle, local_cid, le_psm, &config, true);
        channel.set_state(L2capChannelState::WaitConnectRsp);
        self.channels.insert((handle, local_cid), channel);

        let request = self.start_request(hci, timers, handle, true, PendingKind::LeConnect { local_cid }, |identifier| {
            SignalingMessage::LeCreditBasedConnectionRequest {
                identifier,
                le_psm,
                source_cid: local_cid,
                mtu: config.mtu,
                mps: config.mps,
                initial_credits: config.initial_credits,
            }
        });
        if let Err(err) = request {
            self.channels.remove(&(handle, local_cid));
            return Err(err);
        }

        info!(
            "Opening credit-based channel 0x{:04X} to LE_PSM 0x{:04X} on 0x{:04X}",
            local_cid, le_psm, handle
        );
        Ok(local_cid)
    }

    /// Open `count` enhanced credit-based channels with one request
    ///
    /// Works on LE and BR/EDR links. Each channel reports its own
    /// [`ChannelEvent::Opened`] or [`ChannelEvent::OpenFailed`].
    pub fn open_enhanced_credit_channels<E: From<L2capTimer>>(
        &mut self,
        hci: &mut HciDispatcher,
        timers: &mut RunLoop<E>,
        handle: u16,
        spsm: u16,
        config: LeCreditBasedConfig,
        count: usize,
    ) -> L2capResult<Vec<u16>> {
        if count == 0 || count > L2CAP_ECBM_MAX_CHANNELS {
            return Err(L2capError::InvalidParameter(format!("cannot open {} channels at once", count)));
        }
        if config.mtu < L2CAP_ECBM_MIN_MTU || config.mps < L2CAP_ECBM_MIN_MPS || config.mps > L2CAP_LE_MAX_MPS {
            return Err(L2capError::InvalidParameter(format!(
                "MTU {} / MPS {} out of range",
                config.mtu, config.mps
            )));
        }
        let is_le = match hci.link_type(handle) {
            Some(LinkType::Le) => true,
            Some(LinkType::Classic) => false,
            Some(_) => return Err(L2capError::NotSupported),
            None => return Err(L2capError::NotConnected),
        };
        let valid = if is_le { is_valid_le_psm(spsm) } else { is_valid_psm(spsm) };
        if !valid {
            return Err(L2capError::InvalidPsm(spsm));
        }

        let mut local_cids = Vec::with_capacity(count);
        for _ in 0..count {
            match self.allocate_cid(handle, is_le) {
                Ok(local_cid) => {
                    let mut channel = L2capChannel::new_enhanced_credit(handle, local_cid, spsm, &config, true);
                    channel.set_state(L2capChannelState::WaitConnectRsp);
                    self.channels.insert((handle, local_cid), channel);
                    local_cids.push(local_cid);
                }
                Err(err) => {
                    self.forget_channels(handle, &local_cids);
                    return Err(err);
                }
            }
        }

        let source_cids = local_cids.clone();
        let kind = PendingKind::EnhancedConnect {
            local_cids: CidList::new(&local_cids),
        };
        let request = self.start_request(hci, timers, handle, is_le, kind, |identifier| {
            SignalingMessage::CreditBasedConnectionRequest {
                identifier,
                spsm,
                mtu: config.mtu,
                mps: config.mps,
                initial_credits: config.initial_credits,
                source_cids,
            }
        });
        if let Err(err) = request {
            self.forget_channels(handle, &local_cids);
            return Err(err);
        }

        info!(
            "Opening {} enhanced credit-based channels {:04X?} to SPSM 0x{:04X} on 0x{:04X}",
            count, local_cids, spsm, handle
        );
        Ok(local_cids)
    }

    /// Change our MTU and MPS on open enhanced credit-based channels
    ///
    /// The MTU may only grow, and the MPS may only shrink when a single
    /// channel is named. The outcome arrives as
    /// [`ChannelEvent::ReconfigureComplete`].
    pub fn reconfigure_enhanced_channels<E: From<L2capTimer>>(
        &mut self,
        hci: &mut HciDispatcher,
        timers: &mut RunLoop<E>,
        handle: u16,
        local_cids: &[u16],
        mtu: u16,
        mps: u16,
    ) -> L2capResult<()> {
        if local_cids.is_empty() || local_cids.len() > L2CAP_ECBM_MAX_CHANNELS {
            return Err(L2capError::InvalidParameter(format!(
                "cannot reconfigure {} channels at once",
                local_cids.len()
            )));
        }
        if mtu < L2CAP_ECBM_MIN_MTU || mps < L2CAP_ECBM_MIN_MPS || mps > L2CAP_LE_MAX_MPS {
            return Err(L2capError::InvalidParameter(format!("MTU {} / MPS {} out of range", mtu, mps)));
        }
        for local_cid in local_cids {
            let channel = self.channels.get(&(handle, *local_cid)).ok_or(L2capError::ChannelNotFound)?;
            if channel.channel_type() != L2capChannelType::EnhancedCreditBased {
                return Err(L2capError::NotSupported);
            }
            if !channel.is_open() {
                return Err(L2capError::InvalidState);
            }
            if mtu < channel.mtu() {
                return Err(L2capError::InvalidParameter("MTU cannot shrink".into()));
            }
            if mps < channel.mps() && local_cids.len() > 1 {
                return Err(L2capError::InvalidParameter("MPS can only shrink on a single channel".into()));
            }
        }

        let is_le = hci.link_type(handle) == Some(LinkType::Le);
        let destination_cids = local_cids.to_vec();
        let kind = PendingKind::Reconfigure {
            local_cids: CidList::new(local_cids),
            mtu,
            mps,
        };
        self.start_request(hci, timers, handle, is_le, kind, |identifier| {
            SignalingMessage::CreditBasedReconfigureRequest {
                identifier,
                mtu,
                mps,
                destination_cids,
            }
        })?;

        // Larger limits hold from now on, a smaller MPS once the peer agrees
        for local_cid in local_cids {
            if let Some(channel) = self.channels.get_mut(&(handle, *local_cid)) {
                let mps = mps.max(channel.mps());
                channel.set_local_mtu_mps(mtu, mps);
            }
        }
        Ok(())
    }

    /// Send an SDU on an open dynamic channel
    ///
    /// Credit-based SDUs that find no credits wait in the channel and leave
    /// as the peer grants more.
    pub fn send_sdu(&mut self, hci: &mut HciDispatcher, handle: u16, local_cid: u16, data: &[u8]) -> L2capResult<()> {
        let channel = self
            .channels
            .get_mut(&(handle, local_cid))
            .ok_or(L2capError::ChannelNotFound)?;
        if !channel.is_open() || channel.remote_cid() == 0 {
            return Err(L2capError::InvalidState);
        }

        match channel.channel_type() {
            L2capChannelType::ConnectionOriented => {
                if data.len() > channel.remote_mtu() as usize {
                    return Err(L2capError::MtuExceeded {
                        len: data.len(),
                        mtu: channel.remote_mtu() as usize,
                    });
                }
                hci.send_acl(handle, &build_pdu(channel.remote_cid(), data), true)?;
            }
            L2capChannelType::LeCreditBased | L2capChannelType::EnhancedCreditBased => {
                channel.queue_sdu(data)?;
                Self::flush_channel(hci, channel)?;
            }
        }
        Ok(())
    }

    /// Grant the peer more credits on a credit-based channel
    pub fn provide_credits(&mut self, hci: &mut HciDispatcher, handle: u16, local_cid: u16, credits: u16) -> L2capResult<()> {
        if credits == 0 {
            return Err(L2capError::InvalidParameter("zero credits".into()));
        }
        let channel = self
            .channels
            .get_mut(&(handle, local_cid))
            .ok_or(L2capError::ChannelNotFound)?;
        if !channel.channel_type().is_credit_based() {
            return Err(L2capError::NotSupported);
        }
        if !channel.is_open() {
            return Err(L2capError::InvalidState);
        }
        channel.grant_rx_credits(credits)?;

        let identifier = self.allocate_identifier();
        let is_le = signals_over_le(hci, handle);
        self.send_signaling(
            hci,
            handle,
            is_le,
            &SignalingMessage::LeFlowControlCredit {
                identifier,
                cid: local_cid,
                credits,
            },
        )
    }

    /// Send a PDU on a fixed channel right away
    pub fn send_fixed(&mut self, hci: &mut HciDispatcher, handle: u16, cid: u16, data: &[u8]) -> L2capResult<()> {
        if cid >= L2CAP_DYNAMIC_CID_MIN {
            return Err(L2capError::InvalidParameter(format!("CID 0x{:04X} is not a fixed channel", cid)));
        }
        let mtu = self.config.fixed_channel_mtu as usize;
        if data.len() > mtu {
            return Err(L2capError::MtuExceeded { len: data.len(), mtu });
        }
        hci.send_acl(handle, &build_pdu(cid, data), true)?;
        Ok(())
    }

    /// Queue a fixed channel for a can-send-now callback
    pub fn request_can_send_now(&mut self, handle: u16, cid: u16) -> L2capResult<()> {
        if !self.fixed_handlers.contains_key(&cid) {
            return Err(L2capError::FixedChannelNotRegistered(cid));
        }
        self.fifo.mark_ready(FixedChannelKey::new(handle, cid));
        Ok(())
    }

    /// Give waiting fixed channels their turn
    ///
    /// Channels are served oldest first, one per free controller buffer.
    /// Returns how many handlers were called.
    pub fn service_fixed_channels(&mut self, hci: &mut HciDispatcher) -> usize {
        let mut serviced = 0;
        let mtu = self.config.fixed_channel_mtu as usize;

        while let Some(key) = self.fifo.next_ready_where(|key| hci.can_send_acl(key.handle)) {
            let Some(handler) = self.fixed_handlers.get_mut(&key.cid) else {
                continue;
            };

            let mut sender = FixedChannelSender::new(hci, key, mtu);
            handler.can_send_now(&mut sender);
            let (sent, again) = (sender.sent, sender.again);
            serviced += 1;

            if again {
                self.fifo.mark_ready(key);
                if !sent {
                    break;
                }
            }
        }

        serviced
    }

    /// Close a dynamic channel
    pub fn disconnect<E: From<L2capTimer>>(
        &mut self,
        hci: &mut HciDispatcher,
        timers: &mut RunLoop<E>,
        handle: u16,
        local_cid: u16,
    ) -> L2capResult<()> {
        let channel = self.channels.get(&(handle, local_cid)).ok_or(L2capError::ChannelNotFound)?;
        match channel.state() {
            L2capChannelState::WaitDisconnect => return Ok(()),
            L2capChannelState::Closed => return Err(L2capError::InvalidState),
            _ => {}
        }

        // Nothing to tell a peer that has not assigned its CID yet
        if channel.remote_cid() == 0 {
            self.close_channel(timers, handle, local_cid, CloseReason::LocalRequest);
            return Ok(());
        }

        self.request_disconnect(hci, timers, handle, local_cid, CloseReason::LocalRequest)
    }

    /// Ask a peer for its extended features or fixed channels
    pub fn request_information<E: From<L2capTimer>>(
        &mut self,
        hci: &mut HciDispatcher,
        timers: &mut RunLoop<E>,
        handle: u16,
        info_type: u16,
    ) -> L2capResult<()> {
        if hci.link_type(handle) != Some(LinkType::Classic) {
            return Err(L2capError::NotSupported);
        }
        self.start_request(hci, timers, handle, false, PendingKind::Information { info_type }, |identifier| {
            SignalingMessage::InformationRequest { identifier, info_type }
        })?;
        Ok(())
    }

    /// Send an Echo Request over BR/EDR signaling
    ///
    /// The answer is reported as [`ChannelEvent::EchoResponse`].
    pub fn request_echo<E: From<L2capTimer>>(
        &mut self,
        hci: &mut HciDispatcher,
        timers: &mut RunLoop<E>,
        handle: u16,
        data: &[u8],
    ) -> L2capResult<()> {
        match hci.link_type(handle) {
            Some(LinkType::Classic) => {}
            Some(_) => return Err(L2capError::NotSupported),
            None => return Err(L2capError::NotConnected),
        }
        let data = data.to_vec();
        self.start_request(hci, timers, handle, false, PendingKind::Echo, |identifier| {
            SignalingMessage::EchoRequest { identifier, data }
        })?;
        Ok(())
    }

    /// Ask the central for new connection parameters (peripheral only)
    pub fn request_connection_parameter_update<E: From<L2capTimer>>(
        &mut self,
        hci: &mut HciDispatcher,
        timers: &mut RunLoop<E>,
        handle: u16,
        params: ConnectionParameterUpdate,
    ) -> L2capResult<()> {
        let record = hci.connection(handle).ok_or(L2capError::NotConnected)?;
        if record.role != Some(LeRole::Peripheral) {
            return Err(L2capError::InvalidState);
        }
        self.start_request(hci, timers, handle, true, PendingKind::ConnectionParameterUpdate, |identifier| {
            SignalingMessage::ConnectionParameterUpdateRequest { identifier, params }
        })?;
        Ok(())
    }

    /// Handle an expired RTX timer
    pub fn handle_timer<E: From<L2capTimer>>(&mut self, hci: &mut HciDispatcher, timers: &mut RunLoop<E>, timer: L2capTimer) {
        let L2capTimer::Rtx { handle, identifier } = timer;
        let Some(request) = self.pending.remove(&(handle, identifier)) else {
            return;
        };

        warn!(
            "Signaling request {} on 0x{:04X} timed out ({:?})",
            identifier, handle, request.kind
        );
        match request.kind {
            PendingKind::Connect { local_cid } | PendingKind::LeConnect { local_cid } => {
                self.close_channel(timers, handle, local_cid, CloseReason::Timeout);
            }
            PendingKind::EnhancedConnect { local_cids } => {
                for local_cid in local_cids.as_slice() {
                    self.close_channel(timers, handle, *local_cid, CloseReason::Timeout);
                }
            }
            PendingKind::Reconfigure { local_cids, .. } => {
                // An unanswered reconfiguration leaves the channels unusable
                for local_cid in local_cids.as_slice() {
                    if !self.channels.contains_key(&(handle, *local_cid)) {
                        continue;
                    }
                    if let Err(err) = self.request_disconnect(hci, timers, handle, *local_cid, CloseReason::Timeout) {
                        error!("Failed to disconnect channel 0x{:04X}: {}", local_cid, err);
                    }
                }
            }
            PendingKind::Configure { local_cid } => {
                // Tell the peer, but do not wait for it
                if let Some(remote_cid) = self.channels.get(&(handle, local_cid)).map(|c| c.remote_cid()) {
                    let message = SignalingMessage::DisconnectionRequest {
                        identifier: self.allocate_identifier(),
                        destination_cid: remote_cid,
                        source_cid: local_cid,
                    };
                    if let Err(err) = self.send_signaling(hci, handle, false, &message) {
                        debug!("Could not send disconnection request: {}", err);
                    }
                }
                self.close_channel(timers, handle, local_cid, CloseReason::Timeout);
            }
            PendingKind::Disconnect { local_cid, reason } => {
                self.close_channel(timers, handle, local_cid, reason);
            }
            PendingKind::ConnectionParameterUpdate => {
                self.emit(ChannelEvent::ConnectionParameterUpdateResponse { handle, accepted: false });
            }
            PendingKind::Information { .. } | PendingKind::Echo => {}
        }
    }

    /// Follow connection state changes reported by the HCI layer
    pub fn on_hci_event<E: From<L2capTimer>>(&mut self, timers: &mut RunLoop<E>, event: &Event) {
        if let Event::DisconnectionComplete { status: 0, handle, .. } = *event {
            self.close_connection(timers, handle, CloseReason::LinkDisconnected);
        }
    }

    /// Forget everything about a connection, without signaling
    pub fn close_connection<E: From<L2capTimer>>(&mut self, timers: &mut RunLoop<E>, handle: u16, reason: CloseReason) {
        let mut local_cids: Vec<u16> = self
            .channels
            .keys()
            .filter(|(h, _)| *h == handle)
            .map(|(_, cid)| *cid)
            .collect();
        local_cids.sort_unstable();

        for local_cid in local_cids {
            self.close_channel(timers, handle, local_cid, reason);
        }

        let stale: Vec<(u16, SignalId)> = self.pending.keys().filter(|(h, _)| *h == handle).copied().collect();
        for key in stale {
            if let Some(request) = self.pending.remove(&key) {
                timers.remove_timer(request.timer);
            }
        }

        self.fifo.remove_handle(handle);
        self.recombination.remove(&handle);
        self.remote_features.remove(&handle);
        self.remote_fixed_channels.remove(&handle);
    }

    /// Take in one ACL packet of a connection
    pub fn route<E: From<L2capTimer>>(
        &mut self,
        hci: &mut HciDispatcher,
        timers: &mut RunLoop<E>,
        handle: u16,
        packet: &AclPacket<'_>,
    ) {
        let payload = packet.payload;

        if !packet.header.is_start() {
            match self.recombination.get_mut(&handle) {
                Some(Recombination::Collecting { expected, data }) => {
                    data.extend_from_slice(payload);
                    if data.len() < *expected {
                        return;
                    }
                    if data.len() > *expected {
                        warn!(
                            "PDU on 0x{:04X} overran its length by {} bytes",
                            handle,
                            data.len() - *expected
                        );
                    }
                }
                Some(Recombination::Discarding) => {
                    trace!("Dropping fragment of discarded PDU on 0x{:04X}", handle);
                    return;
                }
                None => {
                    warn!("Continuation fragment without start on 0x{:04X}", handle);
                    return;
                }
            }

            if let Some(Recombination::Collecting { expected, data }) = self.recombination.remove(&handle) {
                if let Some(header) = L2capHeader::parse(&data) {
                    self.dispatch_pdu(hci, timers, handle, header.channel_id, &data[L2CAP_BASIC_HEADER_SIZE..expected]);
                }
            }
            return;
        }

        if let Some(Recombination::Collecting { data, .. }) = self.recombination.remove(&handle) {
            warn!("Incomplete PDU of {} bytes on 0x{:04X} discarded", data.len(), handle);
        }

        let Some(header) = L2capHeader::parse(payload) else {
            warn!("Start fragment of {} bytes on 0x{:04X} lacks an L2CAP header", payload.len(), handle);
            return;
        };
        let cid = header.channel_id;

        let Some(limit) = self.receive_limit(handle, cid) else {
            warn!("PDU for unknown CID 0x{:04X} on 0x{:04X} dropped", cid, handle);
            self.recombination.insert(handle, Recombination::Discarding);
            return;
        };
        if header.length as usize > limit {
            warn!(
                "PDU of {} bytes on CID 0x{:04X} exceeds limit {}, discarding",
                header.length, cid, limit
            );
            self.recombination.insert(handle, Recombination::Discarding);
            if cid >= L2CAP_DYNAMIC_CID_MIN {
                self.protocol_violation(hci, timers, handle, cid);
            }
            return;
        }

        let expected = header.pdu_size();
        if payload.len() >= expected {
            if payload.len() > expected {
                warn!("Dropping {} trailing bytes on 0x{:04X}", payload.len() - expected, handle);
            }
            self.dispatch_pdu(hci, timers, handle, cid, &payload[L2CAP_BASIC_HEADER_SIZE..expected]);
        } else {
            let mut data = Vec::with_capacity(expected);
            data.extend_from_slice(payload);
            self.recombination.insert(handle, Recombination::Collecting { expected, data });
        }
    }

    fn receive_limit(&self, handle: u16, cid: u16) -> Option<usize> {
        match cid {
            L2CAP_SIGNALING_CID => Some(self.config.classic_mtu as usize),
            L2CAP_LE_SIGNALING_CID => Some(self.config.fixed_channel_mtu as usize),
            cid if cid < L2CAP_DYNAMIC_CID_MIN => self
                .fixed_handlers
                .contains_key(&cid)
                .then_some(self.config.fixed_channel_mtu as usize),
            cid => self.channels.get(&(handle, cid)).map(|channel| channel.receive_limit()),
        }
    }

    fn dispatch_pdu<E: From<L2capTimer>>(
        &mut self,
        hci: &mut HciDispatcher,
        timers: &mut RunLoop<E>,
        handle: u16,
        cid: u16,
        payload: &[u8],
    ) {
        trace!("L2CAP 0x{:04X} CID 0x{:04X}: {}", handle, cid, hex::encode(payload));

        match cid {
            L2CAP_SIGNALING_CID => self.handle_signaling(hci, timers, handle, false, payload),
            L2CAP_LE_SIGNALING_CID => self.handle_signaling(hci, timers, handle, true, payload),
            cid if cid < L2CAP_DYNAMIC_CID_MIN => match self.fixed_handlers.get_mut(&cid) {
                Some(handler) => handler.receive(handle, payload),
                None => debug!("No handler for fixed CID 0x{:04X}", cid),
            },
            cid => self.receive_dynamic(hci, timers, handle, cid, payload),
        }
    }

    fn receive_dynamic<E: From<L2capTimer>>(
        &mut self,
        hci: &mut HciDispatcher,
        timers: &mut RunLoop<E>,
        handle: u16,
        local_cid: u16,
        payload: &[u8],
    ) {
        let Some(channel) = self.channels.get_mut(&(handle, local_cid)) else {
            warn!("PDU for unknown channel 0x{:04X} on 0x{:04X}", local_cid, handle);
            return;
        };
        if !channel.is_open() {
            warn!("PDU for channel 0x{:04X} in state {} dropped", local_cid, channel.state());
            return;
        }

        match channel.channel_type() {
            L2capChannelType::ConnectionOriented => {
                self.emit(ChannelEvent::Data {
                    handle,
                    local_cid,
                    data: payload.to_vec(),
                });
            }
            L2capChannelType::LeCreditBased | L2capChannelType::EnhancedCreditBased => match channel.receive_kframe(payload) {
                Ok(sdu) => {
                    let credits = if self.config.automatic_credits {
                        channel.credits_to_return()
                    } else {
                        None
                    };

                    if let Some(data) = sdu {
                        self.emit(ChannelEvent::Data { handle, local_cid, data });
                    }
                    if let Some(credits) = credits {
                        let identifier = self.allocate_identifier();
                        let message = SignalingMessage::LeFlowControlCredit {
                            identifier,
                            cid: local_cid,
                            credits,
                        };
                        let is_le = signals_over_le(hci, handle);
                        if let Err(err) = self.send_signaling(hci, handle, is_le, &message) {
                            error!("Failed to return credits on 0x{:04X}: {}", local_cid, err);
                        }
                    }
                }
                Err(err) => {
                    warn!("Channel 0x{:04X} on 0x{:04X}: {}", local_cid, handle, err);
                    self.protocol_violation(hci, timers, handle, local_cid);
                }
            },
        }
    }

    fn handle_signaling<E: From<L2capTimer>>(
        &mut self,
        hci: &mut HciDispatcher,
        timers: &mut RunLoop<E>,
        handle: u16,
        is_le: bool,
        payload: &[u8],
    ) {
        let mut offset = 0;

        while offset < payload.len() {
            let Some(header) = L2capCommandHeader::parse(&payload[offset..]) else {
                warn!("Truncated signaling command on 0x{:04X}", handle);
                break;
            };
            let end = offset + header.command_size();
            if end > payload.len() {
                warn!("Signaling command 0x{:02X} overruns its PDU", header.code);
                if header.code != L2CAP_COMMAND_REJECT {
                    self.reject(hci, handle, is_le, header.identifier, L2CAP_REJECT_NOT_UNDERSTOOD, Vec::new());
                }
                break;
            }

            match SignalingMessage::parse(&payload[offset..end]) {
                Ok(message) => {
                    if let Err(err) = self.handle_signal(hci, timers, handle, is_le, message) {
                        warn!("Signaling on 0x{:04X} failed: {}", handle, err);
                    }
                }
                Err(err) => {
                    debug!("Signaling command 0x{:02X} not understood: {}", header.code, err);
                    if header.code != L2CAP_COMMAND_REJECT {
                        self.reject(hci, handle, is_le, header.identifier, L2CAP_REJECT_NOT_UNDERSTOOD, Vec::new());
                    }
                }
            }

            // LE signaling PDUs carry exactly one command
            if is_le {
                break;
            }
            offset = end;
        }
    }

    fn handle_signal<E: From<L2capTimer>>(
        &mut self,
        hci: &mut HciDispatcher,
        timers: &mut RunLoop<E>,
        handle: u16,
        is_le: bool,
        message: SignalingMessage,
    ) -> L2capResult<()> {
        debug!("L2CAP signal on 0x{:04X}: {:?}", handle, message);

        if !allowed_on(&message, is_le) {
            self.reject(hci, handle, is_le, message.identifier(), L2CAP_REJECT_NOT_UNDERSTOOD, Vec::new());
            return Ok(());
        }

        match message {
            SignalingMessage::CommandReject { identifier, reason, .. } => {
                self.on_command_reject(hci, timers, handle, identifier, reason)
            }
            SignalingMessage::ConnectionRequest {
                identifier,
                psm,
                source_cid,
            } => self.on_connection_request(hci, timers, handle, identifier, psm, source_cid),
            SignalingMessage::ConnectionResponse {
                identifier,
                destination_cid,
                result,
                ..
            } => self.on_connection_response(hci, timers, handle, identifier, destination_cid, result),
            SignalingMessage::ConfigureRequest {
                identifier,
                destination_cid,
                flags,
                options,
            } => self.on_configure_request(hci, handle, identifier, destination_cid, flags, options),
            SignalingMessage::ConfigureResponse { identifier, result, .. } => {
                self.on_configure_response(hci, timers, handle, identifier, result)
            }
            SignalingMessage::DisconnectionRequest {
                identifier,
                destination_cid,
                source_cid,
            } => self.on_disconnection_request(hci, timers, handle, is_le, identifier, destination_cid, source_cid),
            SignalingMessage::DisconnectionResponse { identifier, .. } => {
                if let Some(PendingKind::Disconnect { local_cid, reason }) =
                    self.take_pending(timers, handle, identifier, |kind| matches!(kind, PendingKind::Disconnect { .. }))
                {
                    self.close_channel(timers, handle, local_cid, reason);
                }
                Ok(())
            }
            SignalingMessage::EchoRequest { identifier, data } => {
                self.send_signaling(hci, handle, false, &SignalingMessage::EchoResponse { identifier, data })
            }
            SignalingMessage::EchoResponse { identifier, data } => {
                if self
                    .take_pending(timers, handle, identifier, |kind| *kind == PendingKind::Echo)
                    .is_some()
                {
                    debug!("Echo response from 0x{:04X}: {}", handle, hex::encode(&data));
                    self.emit(ChannelEvent::EchoResponse { handle, data });
                }
                Ok(())
            }
            SignalingMessage::InformationRequest { identifier, info_type } => {
                self.on_information_request(hci, handle, identifier, info_type)
            }
            SignalingMessage::InformationResponse {
                identifier,
                info_type,
                result,
                data,
            } => {
                self.on_information_response(timers, handle, identifier, info_type, result, &data);
                Ok(())
            }
            SignalingMessage::ConnectionParameterUpdateRequest { identifier, params } => {
                self.on_connection_parameter_update_request(hci, handle, identifier, params)
            }
            SignalingMessage::ConnectionParameterUpdateResponse { identifier, result } => {
                if self
                    .take_pending(timers, handle, identifier, |kind| {
                        *kind == PendingKind::ConnectionParameterUpdate
                    })
                    .is_some()
                {
                    self.emit(ChannelEvent::ConnectionParameterUpdateResponse {
                        handle,
                        accepted: result == L2CAP_CONNECTION_PARAMETERS_ACCEPTED,
                    });
                }
                Ok(())
            }
            SignalingMessage::LeCreditBasedConnectionRequest {
                identifier,
                le_psm,
                source_cid,
                mtu,
                mps,
                initial_credits,
            } => self.on_le_credit_request(hci, handle, identifier, le_psm, source_cid, mtu, mps, initial_credits),
            SignalingMessage::LeCreditBasedConnectionResponse {
                identifier,
                destination_cid,
                mtu,
                mps,
                initial_credits,
                result,
            } => self.on_le_credit_response(
                hci,
                timers,
                handle,
                identifier,
                destination_cid,
                mtu,
                mps,
                initial_credits,
                result,
            ),
            SignalingMessage::LeFlowControlCredit { cid, credits, .. } => {
                self.on_flow_control_credit(hci, timers, handle, cid, credits)
            }
            SignalingMessage::CreditBasedConnectionRequest {
                identifier,
                spsm,
                mtu,
                mps,
                initial_credits,
                source_cids,
            } => self.on_enhanced_connection_request(
                hci,
                handle,
                is_le,
                identifier,
                spsm,
                CreditParams {
                    mtu,
                    mps,
                    initial_credits,
                },
                &source_cids,
            ),
            SignalingMessage::CreditBasedConnectionResponse {
                identifier,
                mtu,
                mps,
                initial_credits,
                result,
                destination_cids,
            } => self.on_enhanced_connection_response(
                hci,
                timers,
                handle,
                identifier,
                CreditParams {
                    mtu,
                    mps,
                    initial_credits,
                },
                result,
                &destination_cids,
            ),
            SignalingMessage::CreditBasedReconfigureRequest {
                identifier,
                mtu,
                mps,
                destination_cids,
            } => self.on_reconfigure_request(hci, handle, is_le, identifier, mtu, mps, &destination_cids),
            SignalingMessage::CreditBasedReconfigureResponse { identifier, result } => {
                self.on_reconfigure_response(timers, handle, identifier, result);
                Ok(())
            }
        }
    }

    fn on_command_reject<E: From<L2capTimer>>(
        &mut self,
        hci: &mut HciDispatcher,
        timers: &mut RunLoop<E>,
        handle: u16,
        identifier: SignalId,
        reason: u16,
    ) -> L2capResult<()> {
        let Some(kind) = self.take_pending(timers, handle, identifier, |_| true) else {
            debug!("Ignoring command reject with unknown identifier {}", identifier);
            return Ok(());
        };

        warn!("Request {:?} on 0x{:04X} rejected, reason 0x{:04X}", kind, handle, reason);
        match kind {
            PendingKind::Connect { local_cid } | PendingKind::LeConnect { local_cid } => {
                self.close_channel(timers, handle, local_cid, CloseReason::Refused(reason));
            }
            PendingKind::EnhancedConnect { local_cids } => {
                for local_cid in local_cids.as_slice() {
                    self.close_channel(timers, handle, *local_cid, CloseReason::Refused(reason));
                }
            }
            PendingKind::Reconfigure { .. } => {
                self.emit(ChannelEvent::ReconfigureComplete {
                    handle,
                    result: L2CAP_RECONFIGURE_UNACCEPTABLE_PARAMETERS,
                });
            }
            PendingKind::Configure { local_cid } => {
                self.request_disconnect(hci, timers, handle, local_cid, CloseReason::ProtocolError)?;
            }
            PendingKind::Disconnect { local_cid, reason } => {
                self.close_channel(timers, handle, local_cid, reason);
            }
            PendingKind::ConnectionParameterUpdate => {
                self.emit(ChannelEvent::ConnectionParameterUpdateResponse { handle, accepted: false });
            }
            PendingKind::Information { .. } | PendingKind::Echo => {}
        }
        Ok(())
    }

    fn on_connection_request<E: From<L2capTimer>>(
        &mut self,
        hci: &mut HciDispatcher,
        timers: &mut RunLoop<E>,
        handle: u16,
        identifier: SignalId,
        psm: u16,
        source_cid: u16,
    ) -> L2capResult<()> {
        let encrypted = hci.connection(handle).map(|record| record.encrypted).unwrap_or(false);
        let duplicate = self
            .channels
            .values()
            .any(|channel| channel.handle() == handle && channel.remote_cid() == source_cid);

        let accepted = match self.services.get(&psm) {
            _ if source_cid < L2CAP_DYNAMIC_CID_MIN => Err(L2CAP_CONNECTION_REFUSED_INVALID_SOURCE_CID),
            _ if duplicate => Err(L2CAP_CONNECTION_REFUSED_SOURCE_CID_ALREADY_ALLOCATED),
            None => Err(L2CAP_CONNECTION_REFUSED_PSM_NOT_SUPPORTED),
            Some(policy) if !policy.allows(encrypted) => Err(L2CAP_CONNECTION_REFUSED_SECURITY_BLOCK),
            Some(_) => self
                .allocate_cid(handle, false)
                .map_err(|_| L2CAP_CONNECTION_REFUSED_NO_RESOURCES),
        };

        let local_cid = match accepted {
            Ok(local_cid) => local_cid,
            Err(result) => {
                info!("Refusing connection to PSM 0x{:04X} on 0x{:04X}: 0x{:04X}", psm, handle, result);
                return self.send_signaling(
                    hci,
                    handle,
                    false,
                    &SignalingMessage::ConnectionResponse {
                        identifier,
                        destination_cid: 0,
                        source_cid,
                        result,
                        status: 0,
                    },
                );
            }
        };

        let mut channel = L2capChannel::new_basic(handle, local_cid, psm, self.config.classic_mtu, false);
        channel.set_remote_cid(source_cid);
        channel.set_state(L2capChannelState::WaitConfig);
        self.channels.insert((handle, local_cid), channel);

        self.send_signaling(
            hci,
            handle,
            false,
            &SignalingMessage::ConnectionResponse {
                identifier,
                destination_cid: local_cid,
                source_cid,
                result: L2CAP_CONNECTION_SUCCESS,
                status: 0,
            },
        )?;
        self.emit(ChannelEvent::IncomingConnection { handle, local_cid, psm });
        self.send_configure_request(hci, timers, handle, local_cid)
    }

    fn on_connection_response<E: From<L2capTimer>>(
        &mut self,
        hci: &mut HciDispatcher,
        timers: &mut RunLoop<E>,
        handle: u16,
        identifier: SignalId,
        destination_cid: u16,
        result: u16,
    ) -> L2capResult<()> {
        let Some(PendingKind::Connect { local_cid }) =
            self.take_pending(timers, handle, identifier, |kind| matches!(kind, PendingKind::Connect { .. }))
        else {
            debug!("Ignoring connection response with unknown identifier {}", identifier);
            return Ok(());
        };

        match result {
            L2CAP_CONNECTION_SUCCESS => {
                if let Some(channel) = self.channels.get_mut(&(handle, local_cid)) {
                    channel.set_remote_cid(destination_cid);
                    channel.set_state(L2capChannelState::WaitConfig);
                }
                self.send_configure_request(hci, timers, handle, local_cid)
            }
            L2CAP_CONNECTION_PENDING => {
                // Keep waiting under the same identifier
                let timer = timers.add_timer(
                    self.config.signaling_timeout,
                    L2capTimer::Rtx { handle, identifier }.into(),
                );
                self.pending.insert(
                    (handle, identifier),
                    PendingRequest {
                        kind: PendingKind::Connect { local_cid },
                        timer,
                    },
                );
                Ok(())
            }
            result => {
                self.close_channel(timers, handle, local_cid, CloseReason::Refused(result));
                Ok(())
            }
        }
    }

    fn send_configure_request<E: From<L2capTimer>>(
        &mut self,
        hci: &mut HciDispatcher,
        timers: &mut RunLoop<E>,
        handle: u16,
        local_cid: u16,
    ) -> L2capResult<()> {
        let channel = self.channels.get(&(handle, local_cid)).ok_or(L2capError::ChannelNotFound)?;
        let remote_cid = channel.remote_cid();
        let mtu = channel.mtu();

        self.start_request(hci, timers, handle, false, PendingKind::Configure { local_cid }, |identifier| {
            SignalingMessage::ConfigureRequest {
                identifier,
                destination_cid: remote_cid,
                flags: 0,
                options: ConfigOptions {
                    mtu: Some(mtu),
                    ..ConfigOptions::default()
                },
            }
        })?;
        Ok(())
    }

    fn on_configure_request(
        &mut self,
        hci: &mut HciDispatcher,
        handle: u16,
        identifier: SignalId,
        local_cid: u16,
        flags: u16,
        options: ConfigOptions,
    ) -> L2capResult<()> {
        let Some(channel) = self.channels.get_mut(&(handle, local_cid)) else {
            warn!("Configure request for unknown CID 0x{:04X}", local_cid);
            let mut data = local_cid.to_le_bytes().to_vec();
            data.extend_from_slice(&0u16.to_le_bytes());
            self.reject(hci, handle, false, identifier, L2CAP_REJECT_INVALID_CID, data);
            return Ok(());
        };

        let (result, reply) = if !options.unknown.is_empty() {
            let reply = ConfigOptions {
                unknown: options.unknown.clone(),
                ..ConfigOptions::default()
            };
            (L2CAP_CONF_UNKNOWN_OPTIONS, reply)
        } else if options.rfc_mode.is_some_and(|mode| mode != 0) {
            let reply = ConfigOptions {
                rfc_mode: Some(0),
                ..ConfigOptions::default()
            };
            (L2CAP_CONF_UNACCEPTABLE_PARAMS, reply)
        } else if options.mtu.is_some_and(|mtu| mtu < L2CAP_MINIMAL_MTU) {
            let reply = ConfigOptions {
                mtu: Some(L2CAP_MINIMAL_MTU),
                ..ConfigOptions::default()
            };
            (L2CAP_CONF_UNACCEPTABLE_PARAMS, reply)
        } else {
            if let Some(mtu) = options.mtu {
                channel.set_remote_mtu(mtu);
            }
            if flags & L2CAP_CONF_FLAG_CONTINUATION == 0 {
                channel.set_remote_config_done();
            }
            (L2CAP_CONF_SUCCESS, ConfigOptions::default())
        };

        let response = SignalingMessage::ConfigureResponse {
            identifier,
            source_cid: channel.remote_cid(),
            flags: flags & L2CAP_CONF_FLAG_CONTINUATION,
            result,
            options: reply,
        };
        self.send_signaling(hci, handle, false, &response)?;
        self.check_configured(handle, local_cid);
        Ok(())
    }

    fn on_configure_response<E: From<L2capTimer>>(
        &mut self,
        hci: &mut HciDispatcher,
        timers: &mut RunLoop<E>,
        handle: u16,
        identifier: SignalId,
        result: u16,
    ) -> L2capResult<()> {
        let Some(PendingKind::Configure { local_cid }) =
            self.take_pending(timers, handle, identifier, |kind| matches!(kind, PendingKind::Configure { .. }))
        else {
            debug!("Ignoring configure response with unknown identifier {}", identifier);
            return Ok(());
        };

        if result != L2CAP_CONF_SUCCESS {
            warn!("Peer refused configuration of 0x{:04X}: 0x{:04X}", local_cid, result);
            return self.request_disconnect(hci, timers, handle, local_cid, CloseReason::Refused(result));
        }

        if let Some(channel) = self.channels.get_mut(&(handle, local_cid)) {
            channel.set_local_config_done();
        }
        self.check_configured(handle, local_cid);
        Ok(())
    }

    fn check_configured(&mut self, handle: u16, local_cid: u16) {
        let Some(channel) = self.channels.get_mut(&(handle, local_cid)) else {
            return;
        };
        if channel.state() != L2capChannelState::WaitConfig || !channel.is_configured() {
            return;
        }

        channel.set_state(L2capChannelState::Open);
        info!("L2CAP channel 0x{:04X} on 0x{:04X} is OPEN", local_cid, handle);
        let event = ChannelEvent::Opened {
            handle,
            local_cid,
            psm: channel.psm(),
            remote_mtu: channel.remote_mtu(),
        };
        self.emit(event);
    }

    #[allow(clippy::too_many_arguments)]
    fn on_disconnection_request<E: From<L2capTimer>>(
        &mut self,
        hci: &mut HciDispatcher,
        timers: &mut RunLoop<E>,
        handle: u16,
        is_le: bool,
        identifier: SignalId,
        local_cid: u16,
        remote_cid: u16,
    ) -> L2capResult<()> {
        let known = self
            .channels
            .get(&(handle, local_cid))
            .is_some_and(|channel| channel.remote_cid() == remote_cid);
        if !known {
            let mut data = local_cid.to_le_bytes().to_vec();
            data.extend_from_slice(&remote_cid.to_le_bytes());
            self.reject(hci, handle, is_le, identifier, L2CAP_REJECT_INVALID_CID, data);
            return Ok(());
        }

        let response = SignalingMessage::DisconnectionResponse {
            identifier,
            destination_cid: local_cid,
            source_cid: remote_cid,
        };
        let sent = self.send_signaling(hci, handle, is_le, &response);
        self.close_channel(timers, handle, local_cid, CloseReason::RemoteRequest);
        sent
    }

    fn on_information_request(
        &mut self,
        hci: &mut HciDispatcher,
        handle: u16,
        identifier: SignalId,
        info_type: u16,
    ) -> L2capResult<()> {
        let (result, data) = match info_type {
            L2CAP_INFO_EXTENDED_FEATURES => (
                L2CAP_INFO_SUCCESS,
                (ExtendedFeatures::FIXED_CHANNELS | ExtendedFeatures::ENHANCED_CREDIT_BASED)
                    .bits()
                    .to_le_bytes()
                    .to_vec(),
            ),
            L2CAP_INFO_FIXED_CHANNELS => (
                L2CAP_INFO_SUCCESS,
                self.local_fixed_channels().bits().to_le_bytes().to_vec(),
            ),
            _ => (L2CAP_INFO_NOT_SUPPORTED, Vec::new()),
        };

        let response = SignalingMessage::InformationResponse {
            identifier,
            info_type,
            result,
            data,
        };
        self.send_signaling(hci, handle, false, &response)
    }

    fn on_information_response<E: From<L2capTimer>>(
        &mut self,
        timers: &mut RunLoop<E>,
        handle: u16,
        identifier: SignalId,
        info_type: u16,
        result: u16,
        data: &[u8],
    ) {
        if self
            .take_pending(timers, handle, identifier, |kind| {
                *kind == PendingKind::Information { info_type }
            })
            .is_none()
        {
            debug!("Ignoring information response with unknown identifier {}", identifier);
            return;
        }
        if result != L2CAP_INFO_SUCCESS {
            debug!("Peer does not support information type 0x{:04X}", info_type);
            return;
        }

        match info_type {
            L2CAP_INFO_EXTENDED_FEATURES if data.len() >= 4 => {
                let mask = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                self.remote_features
                    .insert(handle, ExtendedFeatures::from_bits_retain(mask));
            }
            L2CAP_INFO_FIXED_CHANNELS if data.len() >= 8 => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&data[..8]);
                self.remote_fixed_channels
                    .insert(handle, FixedChannels::from_bits_retain(u64::from_le_bytes(bytes)));
            }
            _ => warn!("Malformed information response type 0x{:04X}", info_type),
        }
    }

    fn on_connection_parameter_update_request(
        &mut self,
        hci: &mut HciDispatcher,
        handle: u16,
        identifier: SignalId,
        params: ConnectionParameterUpdate,
    ) -> L2capResult<()> {
        // Only the central decides
        if hci.connection(handle).and_then(|record| record.role) != Some(LeRole::Central) {
            self.reject(hci, handle, true, identifier, L2CAP_REJECT_NOT_UNDERSTOOD, Vec::new());
            return Ok(());
        }

        let accepted = params.validate(&self.config.connection_parameter_range);
        let result = if accepted {
            L2CAP_CONNECTION_PARAMETERS_ACCEPTED
        } else {
            L2CAP_CONNECTION_PARAMETERS_REJECTED
        };
        self.send_signaling(
            hci,
            handle,
            true,
            &SignalingMessage::ConnectionParameterUpdateResponse { identifier, result },
        )?;

        if accepted {
            hci.send_command(HciCommand::LeConnectionUpdate {
                handle,
                interval_min: params.conn_interval_min,
                interval_max: params.conn_interval_max,
                latency: params.conn_latency,
                supervision_timeout: params.supervision_timeout,
                min_ce_length: 0,
                max_ce_length: 0,
            })?;
        }

        self.emit(ChannelEvent::ConnectionParameterUpdateRequest {
            handle,
            params,
            accepted,
        });
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn on_le_credit_request(
        &mut self,
        hci: &mut HciDispatcher,
        handle: u16,
        identifier: SignalId,
        le_psm: u16,
        source_cid: u16,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
    ) -> L2capResult<()> {
        let encrypted = hci.connection(handle).map(|record| record.encrypted).unwrap_or(false);
        let duplicate = self
            .channels
            .values()
            .any(|channel| channel.handle() == handle && channel.remote_cid() == source_cid);

        let accepted = match self.le_services.get(&le_psm) {
            _ if mtu < L2CAP_LE_DEFAULT_MTU || mps < L2CAP_LE_DEFAULT_MTU || mps > L2CAP_LE_MAX_MPS => {
                Err(L2CAP_LE_CONNECTION_REFUSED_UNACCEPTABLE_PARAMETERS)
            }
            _ if !(L2CAP_DYNAMIC_CID_MIN..=L2CAP_LE_DYNAMIC_CID_MAX).contains(&source_cid) => {
                Err(L2CAP_LE_CONNECTION_REFUSED_INVALID_SOURCE_CID)
            }
            _ if duplicate => Err(L2CAP_LE_CONNECTION_REFUSED_SOURCE_CID_ALREADY_ALLOCATED),
            None => Err(L2CAP_LE_CONNECTION_REFUSED_PSM_NOT_SUPPORTED),
            Some(policy) if !policy.allows(encrypted) => Err(L2CAP_LE_CONNECTION_REFUSED_INSUFFICIENT_AUTHENTICATION),
            Some(_) => self
                .allocate_cid(handle, true)
                .map_err(|_| L2CAP_LE_CONNECTION_REFUSED_NO_RESOURCES),
        };

        let local_cid = match accepted {
            Ok(local_cid) => local_cid,
            Err(result) => {
                info!(
                    "Refusing credit-based connection to LE_PSM 0x{:04X} on 0x{:04X}: 0x{:04X}",
                    le_psm, handle, result
                );
                return self.send_signaling(
                    hci,
                    handle,
                    true,
                    &SignalingMessage::LeCreditBasedConnectionResponse {
                        identifier,
                        destination_cid: 0,
                        mtu: 0,
                        mps: 0,
                        initial_credits: 0,
                        result,
                    },
                );
            }
        };

        let config = self.config.le_credit;
        let mut channel = L2capChannel::new_le_credit(handle, local_cid, le_psm, &config, false);
        channel.set_remote_credit_params(source_cid, mtu, mps, initial_credits);
        channel.set_state(L2capChannelState::Open);
        self.channels.insert((handle, local_cid), channel);

        self.send_signaling(
            hci,
            handle,
            true,
            &SignalingMessage::LeCreditBasedConnectionResponse {
                identifier,
                destination_cid: local_cid,
                mtu: config.mtu,
                mps: config.mps,
                initial_credits: config.initial_credits,
                result: L2CAP_LE_CONNECTION_SUCCESS,
            },
        )?;

        info!("L2CAP credit-based channel 0x{:04X} on 0x{:04X} is OPEN", local_cid, handle);
        self.emit(ChannelEvent::IncomingConnection {
            handle,
            local_cid,
            psm: le_psm,
        });
        self.emit(ChannelEvent::Opened {
            handle,
            local_cid,
            psm: le_psm,
            remote_mtu: mtu,
        });
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn on_le_credit_response<E: From<L2capTimer>>(
        &mut self,
        hci: &mut HciDispatcher,
        timers: &mut RunLoop<E>,
        handle: u16,
        identifier: SignalId,
        destination_cid: u16,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
        result: u16,
    ) -> L2capResult<()> {
        let Some(PendingKind::LeConnect { local_cid }) =
            self.take_pending(timers, handle, identifier, |kind| matches!(kind, PendingKind::LeConnect { .. }))
        else {
            debug!("Ignoring credit-based connection response with unknown identifier {}", identifier);
            return Ok(());
        };

        if result != L2CAP_LE_CONNECTION_SUCCESS {
            self.close_channel(timers, handle, local_cid, CloseReason::Refused(result));
            return Ok(());
        }

        // A disconnection request needs a valid remote CID to address
        if destination_cid < L2CAP_DYNAMIC_CID_MIN {
            warn!(
                "Credit-based connection response for 0x{:04X} names CID 0x{:04X}",
                local_cid, destination_cid
            );
            self.close_channel(timers, handle, local_cid, CloseReason::ProtocolError);
            return Ok(());
        }

        let Some(channel) = self.channels.get_mut(&(handle, local_cid)) else {
            return Ok(());
        };
        if mtu < L2CAP_LE_DEFAULT_MTU || mps < L2CAP_LE_DEFAULT_MTU || mps > L2CAP_LE_MAX_MPS {
            warn!("Invalid credit-based connection response for 0x{:04X}", local_cid);
            channel.set_remote_cid(destination_cid);
            return self.request_disconnect(hci, timers, handle, local_cid, CloseReason::ProtocolError);
        }

        channel.set_remote_credit_params(destination_cid, mtu, mps, initial_credits);
        channel.set_state(L2capChannelState::Open);
        let psm = channel.psm();
        Self::flush_channel(hci, channel)?;

        info!("L2CAP credit-based channel 0x{:04X} on 0x{:04X} is OPEN", local_cid, handle);
        self.emit(ChannelEvent::Opened {
            handle,
            local_cid,
            psm,
            remote_mtu: mtu,
        });
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn on_enhanced_connection_request(
        &mut self,
        hci: &mut HciDispatcher,
        handle: u16,
        is_le: bool,
        identifier: SignalId,
        spsm: u16,
        remote: CreditParams,
        source_cids: &[u16],
    ) -> L2capResult<()> {
        let encrypted = hci.connection(handle).map(|record| record.encrypted).unwrap_or(false);
        let refused = match self.enhanced_services.get(&spsm) {
            _ if source_cids.is_empty() || source_cids.len() > L2CAP_ECBM_MAX_CHANNELS => {
                Some(L2CAP_ECBM_REFUSED_INVALID_PARAMETERS)
            }
            _ if !remote.acceptable() => Some(L2CAP_ECBM_REFUSED_UNACCEPTABLE_PARAMETERS),
            None => Some(L2CAP_ECBM_REFUSED_SPSM_NOT_SUPPORTED),
            Some(policy) if !policy.allows(encrypted) => Some(L2CAP_ECBM_REFUSED_INSUFFICIENT_AUTHENTICATION),
            Some(_) => None,
        };
        if let Some(result) = refused {
            info!(
                "Refusing enhanced credit-based connection to SPSM 0x{:04X} on 0x{:04X}: 0x{:04X}",
                spsm, handle, result
            );
            return self.send_signaling(
                hci,
                handle,
                is_le,
                &SignalingMessage::CreditBasedConnectionResponse {
                    identifier,
                    mtu: 0,
                    mps: 0,
                    initial_credits: 0,
                    result,
                    destination_cids: vec![0; source_cids.len()],
                },
            );
        }

        let config = self.enhanced_config();
        let max_cid = if is_le {
            L2CAP_LE_DYNAMIC_CID_MAX
        } else {
            L2CAP_DYNAMIC_CID_MAX
        };
        let mut result = L2CAP_ECBM_ALL_SUCCESSFUL;
        let mut destination_cids = Vec::with_capacity(source_cids.len());
        let mut opened = Vec::new();

        for &source_cid in source_cids {
            let duplicate = self
                .channels
                .values()
                .any(|channel| channel.handle() == handle && channel.remote_cid() == source_cid);
            let accepted = if !(L2CAP_DYNAMIC_CID_MIN..=max_cid).contains(&source_cid) {
                Err(L2CAP_ECBM_SOME_REFUSED_INVALID_SOURCE_CID)
            } else if duplicate {
                Err(L2CAP_ECBM_SOME_REFUSED_SOURCE_CID_ALREADY_ALLOCATED)
            } else {
                self.allocate_cid(handle, is_le)
                    .map_err(|_| L2CAP_ECBM_SOME_REFUSED_NO_RESOURCES)
            };

            match accepted {
                Ok(local_cid) => {
                    let mut channel = L2capChannel::new_enhanced_credit(handle, local_cid, spsm, &config, false);
                    channel.set_remote_credit_params(source_cid, remote.mtu, remote.mps, remote.initial_credits);
                    channel.set_state(L2capChannelState::Open);
                    self.channels.insert((handle, local_cid), channel);
                    destination_cids.push(local_cid);
                    opened.push(local_cid);
                }
                Err(refused) => {
                    debug!("Refusing source CID 0x{:04X}: 0x{:04X}", source_cid, refused);
                    result = refused;
                    destination_cids.push(0);
                }
            }
        }

        let response = SignalingMessage::CreditBasedConnectionResponse {
            identifier,
            mtu: config.mtu,
            mps: config.mps,
            initial_credits: config.initial_credits,
            result,
            destination_cids,
        };
        if let Err(err) = self.send_signaling(hci, handle, is_le, &response) {
            self.forget_channels(handle, &opened);
            return Err(err);
        }

        for local_cid in opened {
            info!("L2CAP enhanced credit-based channel 0x{:04X} on 0x{:04X} is OPEN", local_cid, handle);
            self.emit(ChannelEvent::IncomingConnection {
                handle,
                local_cid,
                psm: spsm,
            });
            self.emit(ChannelEvent::Opened {
                handle,
                local_cid,
                psm: spsm,
                remote_mtu: remote.mtu,
            });
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn on_enhanced_connection_response<E: From<L2capTimer>>(
        &mut self,
        hci: &mut HciDispatcher,
        timers: &mut RunLoop<E>,
        handle: u16,
        identifier: SignalId,
        remote: CreditParams,
        result: u16,
        destination_cids: &[u16],
    ) -> L2capResult<()> {
        let Some(PendingKind::EnhancedConnect { local_cids }) = self.take_pending(timers, handle, identifier, |kind| {
            matches!(kind, PendingKind::EnhancedConnect { .. })
        }) else {
            debug!("Ignoring enhanced connection response with unknown identifier {}", identifier);
            return Ok(());
        };

        for (index, &local_cid) in local_cids.as_slice().iter().enumerate() {
            let waiting = self.channels.get(&(handle, local_cid)).is_some_and(|channel| {
                channel.channel_type() == L2capChannelType::EnhancedCreditBased
                    && channel.state() == L2capChannelState::WaitConnectRsp
            });
            if !waiting {
                continue;
            }

            let destination_cid = destination_cids.get(index).copied().unwrap_or(0);
            if destination_cid == 0 {
                let reason = if result == L2CAP_ECBM_ALL_SUCCESSFUL {
                    CloseReason::ProtocolError
                } else {
                    CloseReason::Refused(result)
                };
                self.close_channel(timers, handle, local_cid, reason);
                continue;
            }

            // Nothing can be addressed to a CID that is invalid or taken
            let taken = self
                .channels
                .values()
                .any(|channel| channel.handle() == handle && channel.remote_cid() == destination_cid);
            if destination_cid < L2CAP_DYNAMIC_CID_MIN || taken {
                warn!(
                    "Enhanced connection response for 0x{:04X} names CID 0x{:04X}",
                    local_cid, destination_cid
                );
                self.close_channel(timers, handle, local_cid, CloseReason::ProtocolError);
                continue;
            }

            let Some(channel) = self.channels.get_mut(&(handle, local_cid)) else {
                continue;
            };
            if !remote.acceptable() {
                warn!("Invalid enhanced connection response for 0x{:04X}", local_cid);
                channel.set_remote_cid(destination_cid);
                if let Err(err) = self.request_disconnect(hci, timers, handle, local_cid, CloseReason::ProtocolError) {
                    error!("Failed to disconnect channel 0x{:04X}: {}", local_cid, err);
                }
                continue;
            }

            channel.set_remote_credit_params(destination_cid, remote.mtu, remote.mps, remote.initial_credits);
            channel.set_state(L2capChannelState::Open);
            let psm = channel.psm();

            info!("L2CAP enhanced credit-based channel 0x{:04X} on 0x{:04X} is OPEN", local_cid, handle);
            self.emit(ChannelEvent::Opened {
                handle,
                local_cid,
                psm,
                remote_mtu: remote.mtu,
            });
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn on_reconfigure_request(
        &mut self,
        hci: &mut HciDispatcher,
        handle: u16,
        is_le: bool,
        identifier: SignalId,
        mtu: u16,
        mps: u16,
        remote_cids: &[u16],
    ) -> L2capResult<()> {
        let result = self.reconfigure_result(handle, mtu, mps, remote_cids);
        self.send_signaling(
            hci,
            handle,
            is_le,
            &SignalingMessage::CreditBasedReconfigureResponse { identifier, result },
        )?;
        if result != L2CAP_RECONFIGURE_SUCCESS {
            info!("Refused reconfiguration on 0x{:04X}: 0x{:04X}", handle, result);
            return Ok(());
        }

        let mut reconfigured = Vec::with_capacity(remote_cids.len());
        for channel in self.channels.values_mut() {
            if channel.handle() == handle && remote_cids.contains(&channel.remote_cid()) {
                channel.set_remote_mtu_mps(mtu, mps);
                reconfigured.push(channel.local_cid());
            }
        }
        reconfigured.sort_unstable();

        for local_cid in reconfigured {
            debug!("Channel 0x{:04X} reconfigured to MTU {} MPS {}", local_cid, mtu, mps);
            self.emit(ChannelEvent::Reconfigured {
                handle,
                local_cid,
                remote_mtu: mtu,
                remote_mps: mps,
            });
        }
        Ok(())
    }

    /// Result code for a peer's reconfiguration of `remote_cids`
    fn reconfigure_result(&self, handle: u16, mtu: u16, mps: u16, remote_cids: &[u16]) -> u16 {
        let params = CreditParams {
            mtu,
            mps,
            initial_credits: 0,
        };
        if remote_cids.is_empty() || remote_cids.len() > L2CAP_ECBM_MAX_CHANNELS || !params.acceptable() {
            return L2CAP_RECONFIGURE_UNACCEPTABLE_PARAMETERS;
        }

        for remote_cid in remote_cids {
            let Some(channel) = self.channels.values().find(|channel| {
                channel.handle() == handle
                    && channel.remote_cid() == *remote_cid
                    && channel.channel_type() == L2capChannelType::EnhancedCreditBased
                    && channel.is_open()
            }) else {
                return L2CAP_RECONFIGURE_INVALID_DESTINATION_CID;
            };
            if mtu < channel.remote_mtu() {
                return L2CAP_RECONFIGURE_MTU_REDUCTION_NOT_ALLOWED;
            }
            if mps < channel.remote_mps() {
                if remote_cids.len() > 1 {
                    return L2CAP_RECONFIGURE_MPS_REDUCTION_NOT_ALLOWED;
                }
                // Queued K-frames were cut for the old MPS
                if channel.queued_frames() > 0 {
                    return L2CAP_RECONFIGURE_UNACCEPTABLE_PARAMETERS;
                }
            }
        }
        L2CAP_RECONFIGURE_SUCCESS
    }

    fn on_reconfigure_response<E>(&mut self, timers: &mut RunLoop<E>, handle: u16, identifier: SignalId, result: u16) {
        let Some(PendingKind::Reconfigure { local_cids, mtu, mps }) =
            self.take_pending(timers, handle, identifier, |kind| matches!(kind, PendingKind::Reconfigure { .. }))
        else {
            debug!("Ignoring reconfigure response with unknown identifier {}", identifier);
            return;
        };

        if result == L2CAP_RECONFIGURE_SUCCESS {
            for local_cid in local_cids.as_slice() {
                if let Some(channel) = self.channels.get_mut(&(handle, *local_cid)) {
                    channel.set_local_mtu_mps(mtu, mps);
                }
            }
        } else {
            warn!("Peer refused reconfiguration on 0x{:04X}: 0x{:04X}", handle, result);
        }
        self.emit(ChannelEvent::ReconfigureComplete { handle, result });
    }

    /// Settings offered on enhanced credit-based channels we accept
    fn enhanced_config(&self) -> LeCreditBasedConfig {
        let mut config = self.config.le_credit;
        config.mtu = config.mtu.max(L2CAP_ECBM_MIN_MTU);
        config.mps = config.mps.max(L2CAP_ECBM_MIN_MPS);
        config
    }

    /// Drop channels that never reached the peer
    fn forget_channels(&mut self, handle: u16, local_cids: &[u16]) {
        for local_cid in local_cids {
            self.channels.remove(&(handle, *local_cid));
        }
    }

    fn on_flow_control_credit<E: From<L2capTimer>>(
        &mut self,
        hci: &mut HciDispatcher,
        timers: &mut RunLoop<E>,
        handle: u16,
        remote_cid: u16,
        credits: u16,
    ) -> L2capResult<()> {
        let Some(channel) = self
            .channels
            .values_mut()
            .find(|channel| channel.handle() == handle && channel.remote_cid() == remote_cid && channel.is_open())
        else {
            debug!("Credits for unknown channel 0x{:04X} on 0x{:04X}", remote_cid, handle);
            return Ok(());
        };

        match channel.grant_tx_credits(credits) {
            Ok(()) => {
                trace!(
                    "Channel 0x{:04X} received {} credits, {} available",
                    channel.local_cid(),
                    credits,
                    channel.tx_credits()
                );
                Self::flush_channel(hci, channel)
            }
            Err(_) => {
                let local_cid = channel.local_cid();
                warn!(
                    "Credit grant of {} overflows channel 0x{:04X} holding {}",
                    credits,
                    local_cid,
                    channel.tx_credits()
                );
                self.request_disconnect(hci, timers, handle, local_cid, CloseReason::CreditOverflow)
            }
        }
    }

    /// Send queued K-frames while credits last
    fn flush_channel(hci: &mut HciDispatcher, channel: &mut L2capChannel) -> L2capResult<()> {
        while let Some(frame) = channel.next_kframe() {
            hci.send_acl(channel.handle(), &frame, false)?;
        }
        Ok(())
    }

    /// Tear down a channel whose peer broke the rules
    fn protocol_violation<E: From<L2capTimer>>(
        &mut self,
        hci: &mut HciDispatcher,
        timers: &mut RunLoop<E>,
        handle: u16,
        local_cid: u16,
    ) {
        let Some(channel) = self.channels.get(&(handle, local_cid)) else {
            return;
        };
        if channel.state() == L2capChannelState::WaitDisconnect {
            return;
        }
        if let Err(err) = self.request_disconnect(hci, timers, handle, local_cid, CloseReason::ProtocolError) {
            error!("Failed to disconnect channel 0x{:04X}: {}", local_cid, err);
        }
    }

    /// Send a Disconnection Request and wait for the answer
    fn request_disconnect<E: From<L2capTimer>>(
        &mut self,
        hci: &mut HciDispatcher,
        timers: &mut RunLoop<E>,
        handle: u16,
        local_cid: u16,
        reason: CloseReason,
    ) -> L2capResult<()> {
        let channel = self
            .channels
            .get_mut(&(handle, local_cid))
            .ok_or(L2capError::ChannelNotFound)?;
        let remote_cid = channel.remote_cid();
        let is_le = signals_over_le(hci, handle);
        channel.set_state(L2capChannelState::WaitDisconnect);

        self.cancel_channel_requests(timers, handle, local_cid);
        let request = self.start_request(
            hci,
            timers,
            handle,
            is_le,
            PendingKind::Disconnect { local_cid, reason },
            |identifier| SignalingMessage::DisconnectionRequest {
                identifier,
                destination_cid: remote_cid,
                source_cid: local_cid,
            },
        );
        if let Err(err) = request {
            self.close_channel(timers, handle, local_cid, reason);
            return Err(err);
        }
        Ok(())
    }

    /// Remove a channel and report it
    fn close_channel<E: From<L2capTimer>>(
        &mut self,
        timers: &mut RunLoop<E>,
        handle: u16,
        local_cid: u16,
        reason: CloseReason,
    ) {
        let Some(channel) = self.channels.remove(&(handle, local_cid)) else {
            return;
        };
        self.cancel_channel_requests(timers, handle, local_cid);

        let event = if channel.is_established() {
            info!("L2CAP channel 0x{:04X} on 0x{:04X} closed: {}", local_cid, handle, reason);
            ChannelEvent::Closed {
                handle,
                local_cid,
                reason,
            }
        } else {
            info!("L2CAP channel 0x{:04X} on 0x{:04X} failed to open: {}", local_cid, handle, reason);
            ChannelEvent::OpenFailed {
                handle,
                local_cid,
                psm: channel.psm(),
                reason,
            }
        };
        self.emit(event);
    }

    fn cancel_channel_requests<E>(&mut self, timers: &mut RunLoop<E>, handle: u16, local_cid: u16) {
        let stale: Vec<(u16, SignalId)> = self
            .pending
            .iter()
            .filter(|((h, _), request)| *h == handle && request.kind.local_cid() == Some(local_cid))
            .map(|(key, _)| *key)
            .collect();
        for key in stale {
            if let Some(request) = self.pending.remove(&key) {
                timers.remove_timer(request.timer);
            }
        }
    }

    /// Send a request and arm its RTX timer
    fn start_request<E, F>(
        &mut self,
        hci: &mut HciDispatcher,
        timers: &mut RunLoop<E>,
        handle: u16,
        is_le: bool,
        kind: PendingKind,
        build: F,
    ) -> L2capResult<SignalId>
    where
        E: From<L2capTimer>,
        F: FnOnce(SignalId) -> SignalingMessage,
    {
        let identifier = self.allocate_identifier();
        self.send_signaling(hci, handle, is_le, &build(identifier))?;

        let timer = timers.add_timer(self.config.signaling_timeout, L2capTimer::Rtx { handle, identifier }.into());
        if let Some(stale) = self.pending.insert((handle, identifier), PendingRequest { kind, timer }) {
            timers.remove_timer(stale.timer);
        }
        Ok(identifier)
    }

    /// Remove the pending request answered by `identifier`, if it is of the expected kind
    fn take_pending<E, F>(
        &mut self,
        timers: &mut RunLoop<E>,
        handle: u16,
        identifier: SignalId,
        expected: F,
    ) -> Option<PendingKind>
    where
        F: Fn(&PendingKind) -> bool,
    {
        let matches = self
            .pending
            .get(&(handle, identifier))
            .is_some_and(|request| expected(&request.kind));
        if !matches {
            return None;
        }

        let request = self.pending.remove(&(handle, identifier))?;
        timers.remove_timer(request.timer);
        Some(request.kind)
    }

    fn send_signaling(
        &mut self,
        hci: &mut HciDispatcher,
        handle: u16,
        is_le: bool,
        message: &SignalingMessage,
    ) -> L2capResult<()> {
        let packet = message.to_packet(is_le);
        trace!("L2CAP signal to 0x{:04X}: {:?}", handle, message);
        hci.send_acl(handle, &packet.to_bytes(), true)?;
        Ok(())
    }

    fn reject(&mut self, hci: &mut HciDispatcher, handle: u16, is_le: bool, identifier: SignalId, reason: u16, data: Vec<u8>) {
        let message = SignalingMessage::CommandReject {
            identifier,
            reason,
            data,
        };
        if let Err(err) = self.send_signaling(hci, handle, is_le, &message) {
            error!("Failed to send command reject to 0x{:04X}: {}", handle, err);
        }
    }

    fn allocate_identifier(&mut self) -> SignalId {
        let identifier = self.next_identifier;
        self.next_identifier = if identifier == u8::MAX { 1 } else { identifier + 1 };
        identifier
    }

    fn allocate_cid(&self, handle: u16, is_le: bool) -> L2capResult<u16> {
        if self.channels.len() >= self.config.max_channels {
            return Err(L2capError::ResourceLimitReached);
        }
        let max = if is_le {
            L2CAP_LE_DYNAMIC_CID_MAX
        } else {
            L2CAP_DYNAMIC_CID_MAX
        };
        (L2CAP_DYNAMIC_CID_MIN..=max)
            .find(|cid| !self.channels.contains_key(&(handle, *cid)))
            .ok_or(L2capError::ResourceLimitReached)
    }

    fn emit(&mut self, event: ChannelEvent) {
        if let Some(callback) = self.event_callback.as_mut() {
            callback(&event);
        }
    }
}

/// Whether a command may appear on the Classic or LE signaling channel
fn allowed_on(message: &SignalingMessage, is_le: bool) -> bool {
    match message {
        SignalingMessage::CommandReject { .. }
        | SignalingMessage::DisconnectionRequest { .. }
        | SignalingMessage::DisconnectionResponse { .. }
        | SignalingMessage::LeFlowControlCredit { .. }
        | SignalingMessage::CreditBasedConnectionRequest { .. }
        | SignalingMessage::CreditBasedConnectionResponse { .. }
        | SignalingMessage::CreditBasedReconfigureRequest { .. }
        | SignalingMessage::CreditBasedReconfigureResponse { .. } => true,
        SignalingMessage::ConnectionParameterUpdateRequest { .. }
        | SignalingMessage::ConnectionParameterUpdateResponse { .. }
        | SignalingMessage::LeCreditBasedConnectionRequest { .. }
        | SignalingMessage::LeCreditBasedConnectionResponse { .. } => is_le,
        _ => !is_le,
    }
}

/// Whether a connection's signaling goes over the LE signaling channel
fn signals_over_le(hci: &HciDispatcher, handle: u16) -> bool {
    hci.link_type(handle) == Some(LinkType::Le)
}
