//! L2CAP Channel implementation
//!
//! A dynamic channel is a logical connection between two devices for one
//! service. Basic mode channels carry one SDU per PDU; LE credit-based
//! channels segment SDUs into K-frames and meter them with credits.

use std::collections::VecDeque;
use std::fmt;

use super::constants::*;
use super::packet::segment_sdu;
use super::types::*;

/// Type of dynamic L2CAP channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2capChannelType {
    /// Classic connection-oriented channel in basic mode
    ConnectionOriented,
    /// LE Credit-based connection-oriented channel
    LeCreditBased,
    /// Enhanced credit-based channel, on LE or BR/EDR links
    EnhancedCreditBased,
}

impl L2capChannelType {
    /// Whether SDUs travel as K-frames metered by credits
    pub fn is_credit_based(&self) -> bool {
        matches!(self, Self::LeCreditBased | Self::EnhancedCreditBased)
    }
}

/// A credit counter that refuses to go past 0xFFFF
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreditWindow {
    credits: u16,
}

impl CreditWindow {
    pub fn new(credits: u16) -> Self {
        Self { credits }
    }

    pub fn available(&self) -> u16 {
        self.credits
    }

    pub fn is_empty(&self) -> bool {
        self.credits == 0
    }

    /// Take one credit, if there is one
    pub fn consume(&mut self) -> bool {
        if self.credits == 0 {
            return false;
        }
        self.credits -= 1;
        true
    }

    /// Add credits
    ///
    /// A grant that would push the window past 0xFFFF is refused and leaves
    /// the window unchanged.
    pub fn grant(&mut self, credits: u16) -> L2capResult<()> {
        self.credits = self.credits.checked_add(credits).ok_or(L2capError::CreditOverflow)?;
        Ok(())
    }
}

/// SDU being reassembled from K-frames
#[derive(Debug)]
struct Reassembly {
    sdu_length: usize,
    data: Vec<u8>,
}

/// L2CAP Channel structure
pub struct L2capChannel {
    /// Connection handle the channel lives on
    handle: u16,
    /// Local Channel Identifier (CID)
    local_cid: u16,
    /// Remote Channel Identifier (CID), zero until the peer assigns one
    remote_cid: u16,
    /// Protocol/Service Multiplexer for this channel
    psm: u16,
    /// Channel state
    state: L2capChannelState,
    /// Channel type
    channel_type: L2capChannelType,
    /// Whether we opened the channel
    initiator: bool,
    /// Maximum Transmission Unit we accept
    mtu: u16,
    /// Remote device's MTU
    remote_mtu: u16,
    /// Maximum PDU size we accept (credit-based)
    mps: u16,
    /// Remote maximum PDU size (credit-based)
    remote_mps: u16,
    /// Credits for K-frames we may send
    tx_credits: CreditWindow,
    /// Credits the peer still holds for sending to us
    rx_credits: CreditWindow,
    /// Credits granted when the channel opened
    initial_rx_credits: u16,
    /// Automatic credit return threshold
    low_watermark: u16,
    /// K-frames waiting for credits
    tx_queue: VecDeque<Vec<u8>>,
    /// Segmentation and reassembly buffer
    reassembly: Option<Reassembly>,
    /// Our configuration request was accepted
    local_config_done: bool,
    /// We accepted the peer's configuration request
    remote_config_done: bool,
    /// The channel has been open at some point
    established: bool,
}

impl fmt::Debug for L2capChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("L2capChannel")
            .field("handle", &format_args!("0x{:04X}", self.handle))
            .field("local_cid", &format_args!("0x{:04X}", self.local_cid))
            .field("remote_cid", &format_args!("0x{:04X}", self.remote_cid))
            .field("psm", &format_args!("0x{:04X}", self.psm))
            .field("state", &self.state)
            .field("channel_type", &self.channel_type)
            .field("tx_credits", &self.tx_credits.available())
            .field("rx_credits", &self.rx_credits.available())
            .field("queued", &self.tx_queue.len())
            .finish()
    }
}

impl L2capChannel {
    /// Create a Classic basic mode channel
    pub fn new_basic(handle: u16, local_cid: u16, psm: u16, mtu: u16, initiator: bool) -> Self {
        Self {
            handle,
            local_cid,
            remote_cid: 0,
            psm,
            state: L2capChannelState::Closed,
            channel_type: L2capChannelType::ConnectionOriented,
            initiator,
            mtu,
            remote_mtu: L2CAP_DEFAULT_MTU,
            mps: mtu,
            remote_mps: L2CAP_DEFAULT_MTU,
            tx_credits: CreditWindow::default(),
            rx_credits: CreditWindow::default(),
            initial_rx_credits: 0,
            low_watermark: 0,
            tx_queue: VecDeque::new(),
            reassembly: None,
            local_config_done: false,
            remote_config_done: false,
            established: false,
        }
    }

    /// Create an LE credit-based channel
    ///
    /// The peer starts out holding `config.initial_credits`.
    pub fn new_le_credit(handle: u16, local_cid: u16, le_psm: u16, config: &LeCreditBasedConfig, initiator: bool) -> Self {
        Self::new_credit_based(L2capChannelType::LeCreditBased, handle, local_cid, le_psm, config, initiator)
    }

    /// Create one channel of an enhanced credit-based group
    pub fn new_enhanced_credit(handle: u16, local_cid: u16, spsm: u16, config: &LeCreditBasedConfig, initiator: bool) -> Self {
        Self::new_credit_based(L2capChannelType::EnhancedCreditBased, handle, local_cid, spsm, config, initiator)
    }

    fn new_credit_based(
        channel_type: L2capChannelType,
        handle: u16,
        local_cid: u16,
        le_psm: u16,
        config: &LeCreditBasedConfig,
        initiator: bool,
    ) -> Self {
        Self {
            handle,
            local_cid,
            remote_cid: 0,
            psm: le_psm,
            state: L2capChannelState::Closed,
            channel_type,
            initiator,
            mtu: config.mtu,
            remote_mtu: L2CAP_LE_DEFAULT_MTU,
            mps: config.mps,
            remote_mps: L2CAP_LE_DEFAULT_MTU,
            tx_credits: CreditWindow::default(),
            rx_credits: CreditWindow::new(config.initial_credits),
            initial_rx_credits: config.initial_credits,
            low_watermark: config.low_watermark,
            tx_queue: VecDeque::new(),
            reassembly: None,
            local_config_done: false,
            remote_config_done: false,
            established: false,
        }
    }

    pub fn handle(&self) -> u16 {
        self.handle
    }

    pub fn local_cid(&self) -> u16 {
        self.local_cid
    }

    pub fn remote_cid(&self) -> u16 {
        self.remote_cid
    }

    pub fn psm(&self) -> u16 {
        self.psm
    }

    pub fn state(&self) -> L2capChannelState {
        self.state
    }

    pub fn channel_type(&self) -> L2capChannelType {
        self.channel_type
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn is_open(&self) -> bool {
        self.state == L2capChannelState::Open
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn remote_mtu(&self) -> u16 {
        self.remote_mtu
    }

    pub fn mps(&self) -> u16 {
        self.mps
    }

    pub fn remote_mps(&self) -> u16 {
        self.remote_mps
    }

    /// Credits available for sending
    pub fn tx_credits(&self) -> u16 {
        self.tx_credits.available()
    }

    /// Credits the peer holds for sending to us
    pub fn rx_credits(&self) -> u16 {
        self.rx_credits.available()
    }

    /// K-frames waiting for credits
    pub fn queued_frames(&self) -> usize {
        self.tx_queue.len()
    }

    /// Largest PDU payload this channel accepts from the peer
    pub fn receive_limit(&self) -> usize {
        match self.channel_type {
            L2capChannelType::ConnectionOriented => self.mtu as usize,
            L2capChannelType::LeCreditBased | L2capChannelType::EnhancedCreditBased => self.mps as usize,
        }
    }

    /// Whether the channel reached the open state
    ///
    /// Closing a channel that never opened is reported as a failed open.
    pub fn is_established(&self) -> bool {
        self.established
    }

    pub(crate) fn set_state(&mut self, state: L2capChannelState) {
        if state == L2capChannelState::Open {
            self.established = true;
        }
        self.state = state;
    }

    pub(crate) fn set_remote_cid(&mut self, remote_cid: u16) {
        self.remote_cid = remote_cid;
    }

    pub(crate) fn set_remote_mtu(&mut self, remote_mtu: u16) {
        self.remote_mtu = remote_mtu;
    }

    /// Record the peer's side of a credit-based connection
    pub(crate) fn set_remote_credit_params(&mut self, remote_cid: u16, mtu: u16, mps: u16, credits: u16) {
        self.remote_cid = remote_cid;
        self.remote_mtu = mtu;
        self.remote_mps = mps;
        self.tx_credits = CreditWindow::new(credits);
    }

    /// Adopt new receive limits after a reconfiguration
    pub(crate) fn set_local_mtu_mps(&mut self, mtu: u16, mps: u16) {
        self.mtu = mtu;
        self.mps = mps;
    }

    /// Adopt the peer's new receive limits after it reconfigured
    pub(crate) fn set_remote_mtu_mps(&mut self, mtu: u16, mps: u16) {
        self.remote_mtu = mtu;
        self.remote_mps = mps;
    }

    pub(crate) fn set_local_config_done(&mut self) {
        self.local_config_done = true;
    }

    pub(crate) fn set_remote_config_done(&mut self) {
        self.remote_config_done = true;
    }

    /// Both configuration directions are finished
    pub fn is_configured(&self) -> bool {
        self.local_config_done && self.remote_config_done
    }

    /// Queue an SDU as K-frames
    pub(crate) fn queue_sdu(&mut self, sdu: &[u8]) -> L2capResult<()> {
        if sdu.len() > self.remote_mtu as usize {
            return Err(L2capError::MtuExceeded {
                len: sdu.len(),
                mtu: self.remote_mtu as usize,
            });
        }
        self.tx_queue
            .extend(segment_sdu(self.remote_cid, sdu, self.remote_mps as usize));
        Ok(())
    }

    /// Next K-frame that may go out, consuming a credit
    pub(crate) fn next_kframe(&mut self) -> Option<Vec<u8>> {
        if self.tx_queue.is_empty() || !self.tx_credits.consume() {
            return None;
        }
        self.tx_queue.pop_front()
    }

    /// Add credits granted by the peer
    pub(crate) fn grant_tx_credits(&mut self, credits: u16) -> L2capResult<()> {
        self.tx_credits.grant(credits)
    }

    /// Add credits we hand to the peer
    pub(crate) fn grant_rx_credits(&mut self, credits: u16) -> L2capResult<()> {
        self.rx_credits.grant(credits)
    }

    /// Credits to return automatically, if the peer's window is low
    pub(crate) fn credits_to_return(&mut self) -> Option<u16> {
        let available = self.rx_credits.available();
        if available >= self.low_watermark || available >= self.initial_rx_credits {
            return None;
        }
        let credits = self.initial_rx_credits - available;
        self.rx_credits = CreditWindow::new(self.initial_rx_credits);
        Some(credits)
    }

    /// Take in one K-frame payload
    ///
    /// Returns the SDU once its last K-frame has arrived. Any violation of
    /// the credit or size rules is an error and the partial SDU is dropped.
    pub(crate) fn receive_kframe(&mut self, payload: &[u8]) -> L2capResult<Option<Vec<u8>>> {
        if !self.rx_credits.consume() {
            self.reassembly = None;
            return Err(L2capError::ProtocolError("K-frame received without credit".into()));
        }
        if payload.len() > self.mps as usize {
            self.reassembly = None;
            return Err(L2capError::ProtocolError(format!(
                "K-frame of {} bytes exceeds MPS {}",
                payload.len(),
                self.mps
            )));
        }

        if let Some(reassembly) = self.reassembly.take() {
            return self.continue_reassembly(reassembly, payload);
        }

        if payload.len() < L2CAP_SDU_LENGTH_SIZE {
            return Err(L2capError::ProtocolError("First K-frame lacks SDU length".into()));
        }
        let sdu_length = u16::from_le_bytes([payload[0], payload[1]]) as usize;
        if sdu_length > self.mtu as usize {
            return Err(L2capError::ProtocolError(format!(
                "SDU length {} exceeds MTU {}",
                sdu_length, self.mtu
            )));
        }
        let reassembly = Reassembly {
            sdu_length,
            data: Vec::with_capacity(sdu_length),
        };
        self.continue_reassembly(reassembly, &payload[L2CAP_SDU_LENGTH_SIZE..])
    }

    fn continue_reassembly(&mut self, mut reassembly: Reassembly, data: &[u8]) -> L2capResult<Option<Vec<u8>>> {
        if reassembly.data.len() + data.len() > reassembly.sdu_length {
            return Err(L2capError::ProtocolError(format!(
                "K-frames exceed SDU length {}",
                reassembly.sdu_length
            )));
        }
        reassembly.data.extend_from_slice(data);

        if reassembly.data.len() == reassembly.sdu_length {
            Ok(Some(reassembly.data))
        } else {
            self.reassembly = Some(reassembly);
            Ok(None)
        }
    }
}
