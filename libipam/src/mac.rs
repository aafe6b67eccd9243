use macaddr::MacAddr6;
use rand::Rng;

use crate::error::IpamError;

/// OUI prefix used for every generated interface address.
pub const MAC_PREFIX: [u8; 3] = [0xfa, 0x16, 0x3e];

/// Generates a random, locally administered unicast MAC under [`MAC_PREFIX`].
pub fn generate_mac_address() -> MacAddr6 {
    let mut rng = rand::rng();
    MacAddr6::new(
        MAC_PREFIX[0],
        MAC_PREFIX[1],
        MAC_PREFIX[2],
        rng.random_range(0x00..=0x7f),
        rng.random(),
        rng.random(),
    )
}

/// Lower-case colon separated form stored on virtual interfaces.
pub fn format_mac(mac: &MacAddr6) -> String {
    let b = mac.as_bytes();
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        b[0], b[1], b[2], b[3], b[4], b[5]
    )
}

pub fn parse_mac(s: &str) -> Result<MacAddr6, IpamError> {
    s.parse().map_err(|_| IpamError::InvalidMac(s.to_string()))
}
