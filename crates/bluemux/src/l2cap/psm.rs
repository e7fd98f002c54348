//! Protocol/Service Multiplexer (PSM) values
//!
//! Assigned numbers: https://www.bluetooth.com/specifications/assigned-numbers/logical-link-control/

pub const PSM_SDP: u16 = 0x0001;
pub const PSM_RFCOMM: u16 = 0x0003;
pub const PSM_BNEP: u16 = 0x000F;
pub const PSM_HID_CONTROL: u16 = 0x0011;
pub const PSM_HID_INTERRUPT: u16 = 0x0013;
pub const PSM_AVCTP: u16 = 0x0017;
pub const PSM_AVDTP: u16 = 0x0019;
pub const PSM_AVCTP_BROWSING: u16 = 0x001B;
pub const PSM_ATT: u16 = 0x001F;

/// Start of the dynamically assigned Classic PSM range
pub const PSM_DYNAMIC_START: u16 = 0x1001;

/// LE_PSM of the Internet Protocol Support Profile
pub const LE_PSM_IPSP: u16 = 0x0023;
/// LE_PSM of the Object Transfer Service
pub const LE_PSM_OTS: u16 = 0x0025;
/// Start of the dynamically assigned LE_PSM range
pub const LE_PSM_DYNAMIC_START: u16 = 0x0080;
pub const LE_PSM_DYNAMIC_END: u16 = 0x00FF;

/// Whether `psm` is a well-formed Classic PSM
///
/// The least significant bit of the low octet is 1 and the least significant
/// bit of the high octet is 0.
pub fn is_valid_psm(psm: u16) -> bool {
    psm & 0x0001 == 0x0001 && psm & 0x0100 == 0
}

/// Whether `le_psm` lies in the LE_PSM range
pub fn is_valid_le_psm(le_psm: u16) -> bool {
    (0x0001..=LE_PSM_DYNAMIC_END).contains(&le_psm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_psm_validity() {
        assert!(is_valid_psm(PSM_SDP));
        assert!(is_valid_psm(PSM_AVDTP));
        assert!(is_valid_psm(PSM_DYNAMIC_START));
        assert!(!is_valid_psm(0x0002));
        assert!(!is_valid_psm(0x0101));

        assert!(is_valid_le_psm(LE_PSM_IPSP));
        assert!(is_valid_le_psm(LE_PSM_DYNAMIC_START));
        assert!(!is_valid_le_psm(0x0000));
        assert!(!is_valid_le_psm(0x0100));
    }
}
