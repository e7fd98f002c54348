//! L2CAP protocol constants

// Fixed channel identifiers
pub const L2CAP_SIGNALING_CID: u16 = 0x0001;
pub const L2CAP_CONNECTIONLESS_CID: u16 = 0x0002;
pub const L2CAP_ATTRIBUTE_PROTOCOL_CID: u16 = 0x0004;
pub const L2CAP_LE_SIGNALING_CID: u16 = 0x0005;
pub const L2CAP_SECURITY_MANAGER_CID: u16 = 0x0006;
pub const L2CAP_BR_EDR_SECURITY_MANAGER_CID: u16 = 0x0007;

// Dynamic channel identifier ranges
pub const L2CAP_DYNAMIC_CID_MIN: u16 = 0x0040;
pub const L2CAP_DYNAMIC_CID_MAX: u16 = 0xFFFF;
pub const L2CAP_LE_DYNAMIC_CID_MAX: u16 = 0x007F;

// Header sizes
pub const L2CAP_BASIC_HEADER_SIZE: usize = 4;
pub const L2CAP_SIGNALING_HEADER_SIZE: usize = 4;
pub const L2CAP_SDU_LENGTH_SIZE: usize = 2;

// MTU and MPS limits
pub const L2CAP_DEFAULT_MTU: u16 = 672;
pub const L2CAP_MINIMAL_MTU: u16 = 48;
pub const L2CAP_LE_DEFAULT_MTU: u16 = 23;
pub const L2CAP_LE_MAX_MPS: u16 = 65533;
pub const L2CAP_FIXED_CHANNEL_MTU: u16 = 517;

/// Response timeout for signaling requests
pub const L2CAP_RTX_TIMEOUT_MS: u64 = 10_000;

// Signaling command codes
pub const L2CAP_COMMAND_REJECT: u8 = 0x01;
pub const L2CAP_CONNECTION_REQUEST: u8 = 0x02;
pub const L2CAP_CONNECTION_RESPONSE: u8 = 0x03;
pub const L2CAP_CONFIGURE_REQUEST: u8 = 0x04;
pub const L2CAP_CONFIGURE_RESPONSE: u8 = 0x05;
pub const L2CAP_DISCONNECTION_REQUEST: u8 = 0x06;
pub const L2CAP_DISCONNECTION_RESPONSE: u8 = 0x07;
pub const L2CAP_ECHO_REQUEST: u8 = 0x08;
pub const L2CAP_ECHO_RESPONSE: u8 = 0x09;
pub const L2CAP_INFORMATION_REQUEST: u8 = 0x0A;
pub const L2CAP_INFORMATION_RESPONSE: u8 = 0x0B;
pub const L2CAP_CONNECTION_PARAMETER_UPDATE_REQUEST: u8 = 0x12;
pub const L2CAP_CONNECTION_PARAMETER_UPDATE_RESPONSE: u8 = 0x13;
pub const L2CAP_LE_CREDIT_BASED_CONNECTION_REQUEST: u8 = 0x14;
pub const L2CAP_LE_CREDIT_BASED_CONNECTION_RESPONSE: u8 = 0x15;
pub const L2CAP_LE_FLOW_CONTROL_CREDIT: u8 = 0x16;
pub const L2CAP_CREDIT_BASED_CONNECTION_REQUEST: u8 = 0x17;
pub const L2CAP_CREDIT_BASED_CONNECTION_RESPONSE: u8 = 0x18;
pub const L2CAP_CREDIT_BASED_RECONFIGURE_REQUEST: u8 = 0x19;
pub const L2CAP_CREDIT_BASED_RECONFIGURE_RESPONSE: u8 = 0x1A;

// Command reject reasons
pub const L2CAP_REJECT_NOT_UNDERSTOOD: u16 = 0x0000;
pub const L2CAP_REJECT_SIGNALING_MTU_EXCEEDED: u16 = 0x0001;
pub const L2CAP_REJECT_INVALID_CID: u16 = 0x0002;

// Connection response results
pub const L2CAP_CONNECTION_SUCCESS: u16 = 0x0000;
pub const L2CAP_CONNECTION_PENDING: u16 = 0x0001;
pub const L2CAP_CONNECTION_REFUSED_PSM_NOT_SUPPORTED: u16 = 0x0002;
pub const L2CAP_CONNECTION_REFUSED_SECURITY_BLOCK: u16 = 0x0003;
pub const L2CAP_CONNECTION_REFUSED_NO_RESOURCES: u16 = 0x0004;
pub const L2CAP_CONNECTION_REFUSED_INVALID_SOURCE_CID: u16 = 0x0006;
pub const L2CAP_CONNECTION_REFUSED_SOURCE_CID_ALREADY_ALLOCATED: u16 = 0x0007;

// LE credit based connection results
pub const L2CAP_LE_CONNECTION_SUCCESS: u16 = 0x0000;
pub const L2CAP_LE_CONNECTION_REFUSED_PSM_NOT_SUPPORTED: u16 = 0x0002;
pub const L2CAP_LE_CONNECTION_REFUSED_NO_RESOURCES: u16 = 0x0004;
pub const L2CAP_LE_CONNECTION_REFUSED_INSUFFICIENT_AUTHENTICATION: u16 = 0x0005;
pub const L2CAP_LE_CONNECTION_REFUSED_INVALID_SOURCE_CID: u16 = 0x0009;
pub const L2CAP_LE_CONNECTION_REFUSED_SOURCE_CID_ALREADY_ALLOCATED: u16 = 0x000A;
pub const L2CAP_LE_CONNECTION_REFUSED_UNACCEPTABLE_PARAMETERS: u16 = 0x000B;

// Enhanced credit based connection results
pub const L2CAP_ECBM_ALL_SUCCESSFUL: u16 = 0x0000;
pub const L2CAP_ECBM_REFUSED_SPSM_NOT_SUPPORTED: u16 = 0x0002;
pub const L2CAP_ECBM_SOME_REFUSED_NO_RESOURCES: u16 = 0x0004;
pub const L2CAP_ECBM_REFUSED_INSUFFICIENT_AUTHENTICATION: u16 = 0x0005;
pub const L2CAP_ECBM_SOME_REFUSED_INVALID_SOURCE_CID: u16 = 0x0009;
pub const L2CAP_ECBM_SOME_REFUSED_SOURCE_CID_ALREADY_ALLOCATED: u16 = 0x000A;
pub const L2CAP_ECBM_REFUSED_UNACCEPTABLE_PARAMETERS: u16 = 0x000B;
pub const L2CAP_ECBM_REFUSED_INVALID_PARAMETERS: u16 = 0x000C;

// Credit based reconfigure results
pub const L2CAP_RECONFIGURE_SUCCESS: u16 = 0x0000;
pub const L2CAP_RECONFIGURE_MTU_REDUCTION_NOT_ALLOWED: u16 = 0x0001;
pub const L2CAP_RECONFIGURE_MPS_REDUCTION_NOT_ALLOWED: u16 = 0x0002;
pub const L2CAP_RECONFIGURE_INVALID_DESTINATION_CID: u16 = 0x0003;
pub const L2CAP_RECONFIGURE_UNACCEPTABLE_PARAMETERS: u16 = 0x0004;

/// Channels one Credit Based Connection Request may open
pub const L2CAP_ECBM_MAX_CHANNELS: usize = 5;
/// Smallest MTU and MPS of an enhanced credit-based channel
pub const L2CAP_ECBM_MIN_MTU: u16 = 64;
pub const L2CAP_ECBM_MIN_MPS: u16 = 64;

// Configuration options
pub const L2CAP_CONF_MTU: u8 = 0x01;
pub const L2CAP_CONF_FLUSH_TIMEOUT: u8 = 0x02;
pub const L2CAP_CONF_QOS: u8 = 0x03;
pub const L2CAP_CONF_RFC: u8 = 0x04;
/// Set on options the receiver may skip when unknown
pub const L2CAP_CONF_HINT: u8 = 0x80;

// Configuration results
pub const L2CAP_CONF_SUCCESS: u16 = 0x0000;
pub const L2CAP_CONF_UNACCEPTABLE_PARAMS: u16 = 0x0001;
pub const L2CAP_CONF_REJECTED: u16 = 0x0002;
pub const L2CAP_CONF_UNKNOWN_OPTIONS: u16 = 0x0003;

/// Continuation flag of configuration requests
pub const L2CAP_CONF_FLAG_CONTINUATION: u16 = 0x0001;

// Information request types
pub const L2CAP_INFO_CONNECTIONLESS_MTU: u16 = 0x0001;
pub const L2CAP_INFO_EXTENDED_FEATURES: u16 = 0x0002;
pub const L2CAP_INFO_FIXED_CHANNELS: u16 = 0x0003;

// Information response results
pub const L2CAP_INFO_SUCCESS: u16 = 0x0000;
pub const L2CAP_INFO_NOT_SUPPORTED: u16 = 0x0001;

// Connection parameter update results
pub const L2CAP_CONNECTION_PARAMETERS_ACCEPTED: u16 = 0x0000;
pub const L2CAP_CONNECTION_PARAMETERS_REJECTED: u16 = 0x0001;

// LE connection parameter limits (units as on the wire)
pub const LE_CONN_INTERVAL_MIN: u16 = 0x0006;
pub const LE_CONN_INTERVAL_MAX: u16 = 0x0C80;
pub const LE_CONN_LATENCY_MAX: u16 = 0x01F3;
pub const LE_SUPERVISION_TIMEOUT_MIN: u16 = 0x000A;
pub const LE_SUPERVISION_TIMEOUT_MAX: u16 = 0x0C80;
