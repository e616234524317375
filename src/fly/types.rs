//! Response shapes returned by the Fly.io APIs.

use serde::Deserialize;

use crate::backend::MachineStatus;

/// Machine as returned by the Machines API.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(crate) struct Machine {
    pub(crate) id: String,
    #[serde(default)]
    pub(crate) state: String,
}

impl Machine {
    pub(crate) fn status(&self) -> MachineStatus {
        match self.state.as_str() {
            "started" => MachineStatus::Initialized,
            "destroying" | "destroyed" | "failed" | "replaced" => {
                MachineStatus::Terminal(self.state.clone())
            }
            other => MachineStatus::Pending(other.to_owned()),
        }
    }
}

/// GraphQL envelope.
#[derive(Debug, Deserialize)]
pub(crate) struct GraphResponse<T> {
    pub(crate) data: Option<T>,
    #[serde(default)]
    pub(crate) errors: Vec<GraphError>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GraphError {
    pub(crate) message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AllocateIpData {
    #[serde(rename = "allocateIpAddress")]
    pub(crate) allocation: IpAllocation,
}

#[derive(Debug, Deserialize)]
pub(crate) struct IpAllocation {
    #[serde(rename = "ipAddress")]
    pub(crate) ip_address: IpAddressRecord,
}

#[derive(Debug, Deserialize)]
pub(crate) struct IpAddressRecord {
    pub(crate) address: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct NearestRegionData {
    #[serde(rename = "nearestRegion")]
    pub(crate) nearest_region: Region,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Region {
    pub(crate) code: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ViewerData {
    #[serde(rename = "currentUser")]
    pub(crate) current_user: CurrentUser,
    pub(crate) organizations: OrganizationConnection,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CurrentUser {
    pub(crate) email: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OrganizationConnection {
    #[serde(default)]
    pub(crate) nodes: Vec<Organization>,
}

/// Organisation visible to the token owner.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Organization {
    /// Slug used when creating applications.
    pub slug: String,
    /// Display name.
    pub name: String,
    /// `PERSONAL` or `SHARED`.
    #[serde(rename = "type", default)]
    pub kind: String,
}
