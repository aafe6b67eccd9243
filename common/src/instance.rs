use serde::{Deserialize, Serialize};

/// Read-only view of a compute instance as the instance catalog reports it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub uuid: String,
    pub display_name: String,
    pub host: Option<String>,
    pub project_id: String,
    pub availability_zone: Option<String>,
    pub security_groups: Vec<String>,
    /// Bandwidth multiplier of the instance flavor.
    pub rxtx_factor: Option<f64>,
    pub deleted: bool,
}
