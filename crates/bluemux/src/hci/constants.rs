//! HCI protocol constants
//!
//! This module contains constants used in the Bluetooth HCI protocol.

// HCI packet types (H4 packet indicators)
pub const HCI_COMMAND_PKT: u8 = 0x01;
pub const HCI_ACL_PKT: u8 = 0x02;
pub const HCI_SCO_PKT: u8 = 0x03;
pub const HCI_EVENT_PKT: u8 = 0x04;

// Header sizes, without the packet indicator
pub const HCI_COMMAND_HEADER_SIZE: usize = 3;
pub const HCI_ACL_HEADER_SIZE: usize = 4;
pub const HCI_SCO_HEADER_SIZE: usize = 3;
pub const HCI_EVENT_HEADER_SIZE: usize = 2;

// Maximum size of HCI command parameters
pub const HCI_MAX_PARAM_LEN: usize = 255;

// Connection handles are 12 bits wide
pub const HCI_HANDLE_MASK: u16 = 0x0FFF;

// ACL packet boundary flags
pub const ACL_PB_FIRST_NON_FLUSHABLE: u8 = 0x00;
pub const ACL_PB_CONTINUING: u8 = 0x01;
pub const ACL_PB_FIRST_FLUSHABLE: u8 = 0x02;
pub const ACL_PB_COMPLETE: u8 = 0x03;

// Common OGF (Opcode Group Field) values
pub const OGF_LINK_CTL: u8 = 0x01;
pub const OGF_HOST_CTL: u8 = 0x03;
pub const OGF_INFO_PARAM: u8 = 0x04;
pub const OGF_LE: u8 = 0x08;

// Link Control Commands (OGF: 0x01)
pub const OCF_DISCONNECT: u16 = 0x0006;
pub const OCF_LINK_KEY_REQUEST_REPLY: u16 = 0x000B;
pub const OCF_LINK_KEY_REQUEST_NEGATIVE_REPLY: u16 = 0x000C;

// Host Controller Commands (OGF: 0x03)
pub const OCF_SET_EVENT_MASK: u16 = 0x0001;
pub const OCF_RESET: u16 = 0x0003;

// Informational Parameters (OGF: 0x04)
pub const OCF_READ_BUFFER_SIZE: u16 = 0x0005;

// LE Command OCF values (OGF: 0x08)
pub const OCF_LE_READ_BUFFER_SIZE: u16 = 0x0002;
pub const OCF_LE_CONNECTION_UPDATE: u16 = 0x0013;
pub const OCF_LE_LONG_TERM_KEY_REQUEST_REPLY: u16 = 0x001A;
pub const OCF_LE_LONG_TERM_KEY_REQUEST_NEGATIVE_REPLY: u16 = 0x001B;

/// Events enabled after reset: every BR/EDR event plus LE Meta
pub const HCI_DEFAULT_EVENT_MASK: u64 = 0x3FFF_FFFF_FFFF_FFFF;

// Full opcodes used when matching command complete events
pub const OPCODE_RESET: u16 = ((OGF_HOST_CTL as u16) << 10) | OCF_RESET;
pub const OPCODE_SET_EVENT_MASK: u16 = ((OGF_HOST_CTL as u16) << 10) | OCF_SET_EVENT_MASK;
pub const OPCODE_READ_BUFFER_SIZE: u16 = ((OGF_INFO_PARAM as u16) << 10) | OCF_READ_BUFFER_SIZE;
pub const OPCODE_LE_READ_BUFFER_SIZE: u16 = ((OGF_LE as u16) << 10) | OCF_LE_READ_BUFFER_SIZE;

// HCI Events
pub const EVT_CONN_COMPLETE: u8 = 0x03;
pub const EVT_DISCONN_COMPLETE: u8 = 0x05;
pub const EVT_ENCRYPTION_CHANGE: u8 = 0x08;
pub const EVT_CMD_COMPLETE: u8 = 0x0E;
pub const EVT_CMD_STATUS: u8 = 0x0F;
pub const EVT_NUM_COMP_PKTS: u8 = 0x13;
pub const EVT_LINK_KEY_REQUEST: u8 = 0x17;
pub const EVT_LINK_KEY_NOTIFICATION: u8 = 0x18;
pub const EVT_SYNC_CONN_COMPLETE: u8 = 0x2C;
pub const EVT_LE_META_EVENT: u8 = 0x3E;

// LE Meta Events
pub const EVT_LE_CONN_COMPLETE: u8 = 0x01;
pub const EVT_LE_CONN_UPDATE_COMPLETE: u8 = 0x03;
pub const EVT_LE_LTK_REQUEST: u8 = 0x05;
pub const EVT_LE_ENHANCED_CONN_COMPLETE: u8 = 0x0A;

// Link types reported in connection complete events
pub const LINK_TYPE_SCO: u8 = 0x00;
pub const LINK_TYPE_ACL: u8 = 0x01;
pub const LINK_TYPE_ESCO: u8 = 0x02;

// Status and reason codes
pub const HCI_SUCCESS: u8 = 0x00;
pub const HCI_REMOTE_USER_TERMINATED: u8 = 0x13;
pub const HCI_CONNECTION_TERMINATED_LOCAL_HOST: u8 = 0x16;
pub const HCI_REMOTE_LOW_RESOURCES: u8 = 0x14;
