//! Address arithmetic for rknet: subnet carving, fixed-IP pool layout and
//! virtual interface MAC generation. Nothing in this crate touches storage.

pub mod carver;
pub mod error;
pub mod ip;
pub mod mac;
pub mod range;

pub use carver::{CarvedSubnet, SubnetCarver};
pub use error::IpamError;
pub use range::ReservedIps;
