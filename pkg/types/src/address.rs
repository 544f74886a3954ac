use serde::{Deserialize, Serialize};

/// Kind of address attached to a node or pod.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NetworkAddressType {
    PublicIP,
    PrivateIP,
    PodIP,
    PublicDNS,
    PrivateDNS,
}

/// A single IP address or DNS name of a cloud instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkAddress {
    #[serde(rename = "type")]
    pub address_type: NetworkAddressType,
    pub address: String,
}

impl NetworkAddress {
    pub fn new(address_type: NetworkAddressType, address: &str) -> Self {
        Self {
            address_type,
            address: address.to_string(),
        }
    }
}

/// Pick the first address of the given type from a list.
pub fn get_address(addresses: &[NetworkAddress], t: NetworkAddressType) -> Option<&str> {
    addresses
        .iter()
        .find(|a| a.address_type == t)
        .map(|a| a.address.as_str())
}

/// Address the controller should use to reach the cell agent:
/// private IP first, public IP as a fallback.
pub fn dispatch_address(addresses: &[NetworkAddress]) -> Option<&str> {
    get_address(addresses, NetworkAddressType::PrivateIP)
        .or_else(|| get_address(addresses, NetworkAddressType::PublicIP))
}
