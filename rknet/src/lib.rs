pub mod batch;
pub mod config;
pub mod context;
pub mod create;
pub mod driver;
pub mod error;
pub mod fixed_ip;
pub mod lock;
pub mod manager;
pub mod nw_info;
pub mod router;
pub mod rpc;
pub mod store;
pub mod tasks;
pub mod topology;
pub mod vif;

pub use error::NetworkError;
pub use manager::NetworkManager;

pub type Result<T, E = NetworkError> = std::result::Result<T, E>;
