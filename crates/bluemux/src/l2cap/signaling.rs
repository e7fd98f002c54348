//! L2CAP Signaling channel messages
//!
//! This module parses and builds the commands carried on the Classic (0x0001)
//! and LE (0x0005) signaling channels.

use super::constants::*;
use super::packet::*;
use super::types::*;
use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

/// Handle for identifying signaling transactions
pub type SignalId = u8;

bitflags! {
    /// Extended feature mask of an Information Response
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExtendedFeatures: u32 {
        const FLOW_CONTROL = 1 << 0;
        const RETRANSMISSION = 1 << 1;
        const BIDIRECTIONAL_QOS = 1 << 2;
        const ENHANCED_RETRANSMISSION = 1 << 3;
        const STREAMING = 1 << 4;
        const FCS = 1 << 5;
        const EXTENDED_FLOW_SPEC = 1 << 6;
        const FIXED_CHANNELS = 1 << 7;
        const EXTENDED_WINDOW_SIZE = 1 << 8;
        const UNICAST_CONNECTIONLESS = 1 << 9;
        const ENHANCED_CREDIT_BASED = 1 << 15;
    }
}

bitflags! {
    /// Fixed channels supported over BR/EDR, bit N is CID N
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FixedChannels: u64 {
        const SIGNALING = 1 << L2CAP_SIGNALING_CID;
        const CONNECTIONLESS = 1 << L2CAP_CONNECTIONLESS_CID;
        const ATTRIBUTE_PROTOCOL = 1 << L2CAP_ATTRIBUTE_PROTOCOL_CID;
        const SECURITY_MANAGER = 1 << L2CAP_BR_EDR_SECURITY_MANAGER_CID;
    }
}

impl FixedChannels {
    /// Mask bit of a fixed CID, if it has one
    pub fn for_cid(cid: u16) -> Option<Self> {
        if cid < 64 {
            Some(Self::from_bits_retain(1u64 << cid))
        } else {
            None
        }
    }
}

/// L2CAP Signaling message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    /// Command Reject
    CommandReject {
        identifier: SignalId,
        reason: u16,
        data: Vec<u8>,
    },

    /// Connection Request
    ConnectionRequest {
        identifier: SignalId,
        psm: u16,
        source_cid: u16,
    },

    /// Connection Response
    ConnectionResponse {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
        result: u16,
        status: u16,
    },

    /// Configuration Request
    ConfigureRequest {
        identifier: SignalId,
        destination_cid: u16,
        flags: u16,
        options: ConfigOptions,
    },

    /// Configuration Response
    ConfigureResponse {
        identifier: SignalId,
        source_cid: u16,
        flags: u16,
        result: u16,
        options: ConfigOptions,
    },

    /// Disconnection Request
    DisconnectionRequest {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
    },

    /// Disconnection Response
    DisconnectionResponse {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
    },

    /// Echo Request
    EchoRequest { identifier: SignalId, data: Vec<u8> },

    /// Echo Response
    EchoResponse { identifier: SignalId, data: Vec<u8> },

    /// Information Request
    InformationRequest { identifier: SignalId, info_type: u16 },

    /// Information Response
    InformationResponse {
        identifier: SignalId,
        info_type: u16,
        result: u16,
        data: Vec<u8>,
    },

    /// Connection Parameter Update Request (LE only)
    ConnectionParameterUpdateRequest {
        identifier: SignalId,
        params: ConnectionParameterUpdate,
    },

    /// Connection Parameter Update Response (LE only)
    ConnectionParameterUpdateResponse { identifier: SignalId, result: u16 },

    /// LE Credit Based Connection Request
    LeCreditBasedConnectionRequest {
        identifier: SignalId,
        le_psm: u16,
        source_cid: u16,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
    },

    /// LE Credit Based Connection Response
    LeCreditBasedConnectionResponse {
        identifier: SignalId,
        destination_cid: u16,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
        result: u16,
    },

    /// LE Flow Control Credit, also used by enhanced credit-based channels
    LeFlowControlCredit {
        identifier: SignalId,
        cid: u16,
        credits: u16,
    },

    /// Credit Based Connection Request, opens up to five channels at once
    CreditBasedConnectionRequest {
        identifier: SignalId,
        spsm: u16,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
        source_cids: Vec<u16>,
    },

    /// Credit Based Connection Response, one destination CID per requested
    /// channel with zero marking a refused one
    CreditBasedConnectionResponse {
        identifier: SignalId,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
        result: u16,
        destination_cids: Vec<u16>,
    },

    /// Credit Based Reconfigure Request, lists the sender's own CIDs
    CreditBasedReconfigureRequest {
        identifier: SignalId,
        mtu: u16,
        mps: u16,
        destination_cids: Vec<u16>,
    },

    /// Credit Based Reconfigure Response
    CreditBasedReconfigureResponse { identifier: SignalId, result: u16 },
}

fn truncated(_: std::io::Error) -> L2capError {
    L2capError::InvalidParameter("Signaling command truncated".into())
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> L2capResult<u16> {
    cursor.read_u16::<LittleEndian>().map_err(truncated)
}

fn read_cids(cursor: &mut Cursor<&[u8]>) -> L2capResult<Vec<u16>> {
    let rest = read_rest(cursor);
    if rest.len() % 2 != 0 {
        return Err(L2capError::InvalidParameter("CID list has an odd length".into()));
    }
    Ok(rest
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

fn read_rest(cursor: &mut Cursor<&[u8]>) -> Vec<u8> {
    let mut rest = Vec::new();
    // Reading a slice cursor to the end cannot fail
    let _ = cursor.read_to_end(&mut rest);
    rest
}

impl SignalingMessage {
    /// Get the command code for this signaling message
    pub fn command_code(&self) -> u8 {
        match self {
            Self::CommandReject { .. } => L2CAP_COMMAND_REJECT,
            Self::ConnectionRequest { .. } => L2CAP_CONNECTION_REQUEST,
            Self::ConnectionResponse { .. } => L2CAP_CONNECTION_RESPONSE,
            Self::ConfigureRequest { .. } => L2CAP_CONFIGURE_REQUEST,
            Self::ConfigureResponse { .. } => L2CAP_CONFIGURE_RESPONSE,
            Self::DisconnectionRequest { .. } => L2CAP_DISCONNECTION_REQUEST,
            Self::DisconnectionResponse { .. } => L2CAP_DISCONNECTION_RESPONSE,
            Self::EchoRequest { .. } => L2CAP_ECHO_REQUEST,
            Self::EchoResponse { .. } => L2CAP_ECHO_RESPONSE,
            Self::InformationRequest { .. } => L2CAP_INFORMATION_REQUEST,
            Self::InformationResponse { .. } => L2CAP_INFORMATION_RESPONSE,
            Self::ConnectionParameterUpdateRequest { .. } => L2CAP_CONNECTION_PARAMETER_UPDATE_REQUEST,
            Self::ConnectionParameterUpdateResponse { .. } => L2CAP_CONNECTION_PARAMETER_UPDATE_RESPONSE,
            Self::LeCreditBasedConnectionRequest { .. } => L2CAP_LE_CREDIT_BASED_CONNECTION_REQUEST,
            Self::LeCreditBasedConnectionResponse { .. } => L2CAP_LE_CREDIT_BASED_CONNECTION_RESPONSE,
            Self::LeFlowControlCredit { .. } => L2CAP_LE_FLOW_CONTROL_CREDIT,
            Self::CreditBasedConnectionRequest { .. } => L2CAP_CREDIT_BASED_CONNECTION_REQUEST,
            Self::CreditBasedConnectionResponse { .. } => L2CAP_CREDIT_BASED_CONNECTION_RESPONSE,
            Self::CreditBasedReconfigureRequest { .. } => L2CAP_CREDIT_BASED_RECONFIGURE_REQUEST,
            Self::CreditBasedReconfigureResponse { .. } => L2CAP_CREDIT_BASED_RECONFIGURE_RESPONSE,
        }
    }

    /// Get the identifier for this signaling message
    pub fn identifier(&self) -> SignalId {
        match self {
            Self::CommandReject { identifier, .. }
            | Self::ConnectionRequest { identifier, .. }
            | Self::ConnectionResponse { identifier, .. }
            | Self::ConfigureRequest { identifier, .. }
            | Self::ConfigureResponse { identifier, .. }
            | Self::DisconnectionRequest { identifier, .. }
            | Self::DisconnectionResponse { identifier, .. }
            | Self::EchoRequest { identifier, .. }
            | Self::EchoResponse { identifier, .. }
            | Self::InformationRequest { identifier, .. }
            | Self::InformationResponse { identifier, .. }
            | Self::ConnectionParameterUpdateRequest { identifier, .. }
            | Self::ConnectionParameterUpdateResponse { identifier, .. }
            | Self::LeCreditBasedConnectionRequest { identifier, .. }
            | Self::LeCreditBasedConnectionResponse { identifier, .. }
            | Self::LeFlowControlCredit { identifier, .. }
            | Self::CreditBasedConnectionRequest { identifier, .. }
            | Self::CreditBasedConnectionResponse { identifier, .. }
            | Self::CreditBasedReconfigureRequest { identifier, .. }
            | Self::CreditBasedReconfigureResponse { identifier, .. } => *identifier,
        }
    }

    /// Whether this command answers a request
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Self::CommandReject { .. }
                | Self::ConnectionResponse { .. }
                | Self::ConfigureResponse { .. }
                | Self::DisconnectionResponse { .. }
                | Self::EchoResponse { .. }
                | Self::InformationResponse { .. }
                | Self::ConnectionParameterUpdateResponse { .. }
                | Self::LeCreditBasedConnectionResponse { .. }
                | Self::CreditBasedConnectionResponse { .. }
                | Self::CreditBasedReconfigureResponse { .. }
        )
    }

    /// Parse configuration options from raw bytes
    fn parse_config_options(data: &[u8]) -> ConfigOptions {
        let mut options = ConfigOptions::default();
        let mut offset = 0;

        while offset + 2 <= data.len() {
            let raw_type = data[offset];
            let option_type = raw_type & !L2CAP_CONF_HINT;
            let option_length = data[offset + 1] as usize;

            if offset + 2 + option_length > data.len() {
                break;
            }

            let option_data = &data[offset + 2..offset + 2 + option_length];

            match option_type {
                L2CAP_CONF_MTU if option_length == 2 => {
                    options.mtu = Some(u16::from_le_bytes([option_data[0], option_data[1]]));
                }
                L2CAP_CONF_FLUSH_TIMEOUT if option_length == 2 => {
                    options.flush_timeout = Some(u16::from_le_bytes([option_data[0], option_data[1]]));
                }
                L2CAP_CONF_RFC if option_length >= 1 => {
                    options.rfc_mode = Some(option_data[0]);
                }
                // Accepted as sent, basic mode has no use for a flow spec
                L2CAP_CONF_QOS => {}
                _ if raw_type & L2CAP_CONF_HINT == 0 => options.unknown.push(option_type),
                _ => {}
            }

            offset += 2 + option_length;
        }

        options
    }

    /// Serialize configuration options to bytes
    fn serialize_config_options(options: &ConfigOptions) -> Vec<u8> {
        let mut result = Vec::new();

        if let Some(mtu) = options.mtu {
            result.push(L2CAP_CONF_MTU);
            result.push(2);
            result.extend_from_slice(&mtu.to_le_bytes());
        }

        if let Some(timeout) = options.flush_timeout {
            result.push(L2CAP_CONF_FLUSH_TIMEOUT);
            result.push(2);
            result.extend_from_slice(&timeout.to_le_bytes());
        }

        if let Some(mode) = options.rfc_mode {
            // Mode, TxWindow, MaxTransmit, RTX timeout, monitor timeout, MPS
            result.push(L2CAP_CONF_RFC);
            result.push(9);
            result.push(mode);
            result.extend_from_slice(&[0u8; 8]);
        }

        // Unknown options are echoed back with no data
        for option_type in &options.unknown {
            result.push(*option_type);
            result.push(0);
        }

        result
    }

    /// Parse one signaling command, header included
    ///
    /// Unknown command codes yield [`L2capError::NotSupported`] so the caller
    /// can answer with a Command Reject.
    pub fn parse(data: &[u8]) -> L2capResult<Self> {
        let header = L2capCommandHeader::parse(data)
            .ok_or_else(|| L2capError::InvalidParameter("Signaling data too short".into()))?;

        if data.len() < header.command_size() {
            return Err(L2capError::InvalidParameter("Command parameters too short".into()));
        }

        let identifier = header.identifier;
        let params = &data[L2CAP_SIGNALING_HEADER_SIZE..header.command_size()];
        let mut cursor = Cursor::new(params);
        let c = &mut cursor;

        let message = match header.code {
            L2CAP_COMMAND_REJECT => Self::CommandReject {
                identifier,
                reason: read_u16(c)?,
                data: read_rest(c),
            },
            L2CAP_CONNECTION_REQUEST => Self::ConnectionRequest {
                identifier,
                psm: read_u16(c)?,
                source_cid: read_u16(c)?,
            },
            L2CAP_CONNECTION_RESPONSE => Self::ConnectionResponse {
                identifier,
                destination_cid: read_u16(c)?,
                source_cid: read_u16(c)?,
                result: read_u16(c)?,
                status: read_u16(c)?,
            },
            L2CAP_CONFIGURE_REQUEST => Self::ConfigureRequest {
                identifier,
                destination_cid: read_u16(c)?,
                flags: read_u16(c)?,
                options: Self::parse_config_options(&read_rest(c)),
            },
            L2CAP_CONFIGURE_RESPONSE => Self::ConfigureResponse {
                identifier,
                source_cid: read_u16(c)?,
                flags: read_u16(c)?,
                result: read_u16(c)?,
                options: Self::parse_config_options(&read_rest(c)),
            },
            L2CAP_DISCONNECTION_REQUEST => Self::DisconnectionRequest {
                identifier,
                destination_cid: read_u16(c)?,
                source_cid: read_u16(c)?,
            },
            L2CAP_DISCONNECTION_RESPONSE => Self::DisconnectionResponse {
                identifier,
                destination_cid: read_u16(c)?,
                source_cid: read_u16(c)?,
            },
            L2CAP_ECHO_REQUEST => Self::EchoRequest {
                identifier,
                data: read_rest(c),
            },
            L2CAP_ECHO_RESPONSE => Self::EchoResponse {
                identifier,
                data: read_rest(c),
            },
            L2CAP_INFORMATION_REQUEST => Self::InformationRequest {
                identifier,
                info_type: read_u16(c)?,
            },
            L2CAP_INFORMATION_RESPONSE => Self::InformationResponse {
                identifier,
                info_type: read_u16(c)?,
                result: read_u16(c)?,
                data: read_rest(c),
            },
            L2CAP_CONNECTION_PARAMETER_UPDATE_REQUEST => Self::ConnectionParameterUpdateRequest {
                identifier,
                params: ConnectionParameterUpdate {
                    conn_interval_min: read_u16(c)?,
                    conn_interval_max: read_u16(c)?,
                    conn_latency: read_u16(c)?,
                    supervision_timeout: read_u16(c)?,
                },
            },
            L2CAP_CONNECTION_PARAMETER_UPDATE_RESPONSE => Self::ConnectionParameterUpdateResponse {
                identifier,
                result: read_u16(c)?,
            },
            L2CAP_LE_CREDIT_BASED_CONNECTION_REQUEST => Self::LeCreditBasedConnectionRequest {
                identifier,
                le_psm: read_u16(c)?,
                source_cid: read_u16(c)?,
                mtu: read_u16(c)?,
                mps: read_u16(c)?,
                initial_credits: read_u16(c)?,
            },
            L2CAP_LE_CREDIT_BASED_CONNECTION_RESPONSE => Self::LeCreditBasedConnectionResponse {
                identifier,
                destination_cid: read_u16(c)?,
                mtu: read_u16(c)?,
                mps: read_u16(c)?,
                initial_credits: read_u16(c)?,
                result: read_u16(c)?,
            },
            L2CAP_LE_FLOW_CONTROL_CREDIT => Self::LeFlowControlCredit {
                identifier,
                cid: read_u16(c)?,
                credits: read_u16(c)?,
            },
            L2CAP_CREDIT_BASED_CONNECTION_REQUEST => Self::CreditBasedConnectionRequest {
                identifier,
                spsm: read_u16(c)?,
                mtu: read_u16(c)?,
                mps: read_u16(c)?,
                initial_credits: read_u16(c)?,
                source_cids: read_cids(c)?,
            },
            L2CAP_CREDIT_BASED_CONNECTION_RESPONSE => Self::CreditBasedConnectionResponse {
                identifier,
                mtu: read_u16(c)?,
                mps: read_u16(c)?,
                initial_credits: read_u16(c)?,
                result: read_u16(c)?,
                destination_cids: read_cids(c)?,
            },
            L2CAP_CREDIT_BASED_RECONFIGURE_REQUEST => Self::CreditBasedReconfigureRequest {
                identifier,
                mtu: read_u16(c)?,
                mps: read_u16(c)?,
                destination_cids: read_cids(c)?,
            },
            L2CAP_CREDIT_BASED_RECONFIGURE_RESPONSE => Self::CreditBasedReconfigureResponse {
                identifier,
                result: read_u16(c)?,
            },
            _ => return Err(L2capError::NotSupported),
        };

        Ok(message)
    }

    /// Serialize the signaling message to bytes for transmission
    pub fn serialize(&self) -> Vec<u8> {
        let mut params = Vec::new();
        let mut put = |value: u16| params.extend_from_slice(&value.to_le_bytes());

        match self {
            Self::CommandReject { reason, .. } => put(*reason),
            Self::ConnectionRequest { psm, source_cid, .. } => {
                put(*psm);
                put(*source_cid);
            }
            Self::ConnectionResponse {
                destination_cid,
                source_cid,
                result,
                status,
                ..
            } => {
                put(*destination_cid);
                put(*source_cid);
                put(*result);
                put(*status);
            }
            Self::ConfigureRequest {
                destination_cid, flags, ..
            } => {
                put(*destination_cid);
                put(*flags);
            }
            Self::ConfigureResponse {
                source_cid,
                flags,
                result,
                ..
            } => {
                put(*source_cid);
                put(*flags);
                put(*result);
            }
            Self::DisconnectionRequest {
                destination_cid,
                source_cid,
                ..
            }
            | Self::DisconnectionResponse {
                destination_cid,
                source_cid,
                ..
            } => {
                put(*destination_cid);
                put(*source_cid);
            }
            Self::EchoRequest { .. } | Self::EchoResponse { .. } => {}
            Self::InformationRequest { info_type, .. } => put(*info_type),
            Self::InformationResponse { info_type, result, .. } => {
                put(*info_type);
                put(*result);
            }
            Self::ConnectionParameterUpdateRequest { params: update, .. } => {
                put(update.conn_interval_min);
                put(update.conn_interval_max);
                put(update.conn_latency);
                put(update.supervision_timeout);
            }
            Self::ConnectionParameterUpdateResponse { result, .. } => put(*result),
            Self::LeCreditBasedConnectionRequest {
                le_psm,
                source_cid,
                mtu,
                mps,
                initial_credits,
                ..
            } => {
                put(*le_psm);
                put(*source_cid);
                put(*mtu);
                put(*mps);
                put(*initial_credits);
            }
            Self::LeCreditBasedConnectionResponse {
                destination_cid,
                mtu,
                mps,
                initial_credits,
                result,
                ..
            } => {
                put(*destination_cid);
                put(*mtu);
                put(*mps);
                put(*initial_credits);
                put(*result);
            }
            Self::LeFlowControlCredit { cid, credits, .. } => {
                put(*cid);
                put(*credits);
            }
            Self::CreditBasedConnectionRequest {
                spsm,
                mtu,
                mps,
                initial_credits,
                source_cids,
                ..
            } => {
                put(*spsm);
                put(*mtu);
                put(*mps);
                put(*initial_credits);
                source_cids.iter().for_each(|cid| put(*cid));
            }
            Self::CreditBasedConnectionResponse {
                mtu,
                mps,
                initial_credits,
                result,
                destination_cids,
                ..
            } => {
                put(*mtu);
                put(*mps);
                put(*initial_credits);
                put(*result);
                destination_cids.iter().for_each(|cid| put(*cid));
            }
            Self::CreditBasedReconfigureRequest {
                mtu,
                mps,
                destination_cids,
                ..
            } => {
                put(*mtu);
                put(*mps);
                destination_cids.iter().for_each(|cid| put(*cid));
            }
            Self::CreditBasedReconfigureResponse { result, .. } => put(*result),
        }

        // Variable length tails
        match self {
            Self::CommandReject { data, .. }
            | Self::EchoRequest { data, .. }
            | Self::EchoResponse { data, .. }
            | Self::InformationResponse { data, .. } => params.extend_from_slice(data),
            Self::ConfigureRequest { options, .. } | Self::ConfigureResponse { options, .. } => {
                params.extend_from_slice(&Self::serialize_config_options(options))
            }
            _ => {}
        }

        let header = L2capCommandHeader::new(self.command_code(), self.identifier(), params.len() as u16);
        let mut result = Vec::with_capacity(L2CAP_SIGNALING_HEADER_SIZE + params.len());
        result.extend_from_slice(&header.to_bytes());
        result.extend_from_slice(&params);
        result
    }

    /// Create a signaling L2CAP packet from this message
    pub fn to_packet(&self, is_le: bool) -> L2capPacket {
        let channel_id = if is_le { L2CAP_LE_SIGNALING_CID } else { L2CAP_SIGNALING_CID };
        L2capPacket::new(channel_id, self.serialize())
    }
}
