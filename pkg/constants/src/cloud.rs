//! Cloud resource naming and tag conventions.

/// Name of the security group attached to every cell.
pub const CELL_SECURITY_GROUP_NAME: &str = "CellSecurityGroup";

/// CIDR matching everything.
pub const PUBLIC_CIDR: &str = "0.0.0.0/0";

/// Port the cell agent's REST API listens on.
pub const CELL_AGENT_PORT: u16 = 6421;

/// Instance tag carrying the deployment's stable controller id. The
/// reconciliation list filters on this tag.
pub const CONTROLLER_TAG_KEY: &str = "KipControllerID";
pub const NAME_TAG_KEY: &str = "Name";
pub const NAMESPACE_TAG_KEY: &str = "KipNamespace";
pub const NAMETAG_TAG_KEY: &str = "KipNametag";
pub const POD_NAME_TAG_KEY: &str = "KipPodName";

pub const PROVIDER_AWS: &str = "aws";
pub const PROVIDER_GCE: &str = "gce";
pub const PROVIDER_AZURE: &str = "azure";
