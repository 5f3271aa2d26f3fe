//! Plain data published by the reconciler and returned by the probes.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

/// Interface-level status shown to the user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnlineStatus {
    Online,
    /// Link is up and the campus gateway answers, but the portal has not let us through yet.
    CaptivePortal,
    Offline,
}

/// Classification of one reachability sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Connectivity {
    Online,
    CaptivePortal,
    Offline,
}

/// Snapshot assembled on every refresh tick.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkState {
    pub online_status: OnlineStatus,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Vec<Ipv6Addr>,
    pub mac: Option<String>,
    pub interface_name: Option<String>,
    pub dns: Vec<IpAddr>,
    pub portal_user_id: Option<String>,
    pub devices: Vec<DeviceRecord>,
}

impl NetworkState {
    pub fn offline() -> Self {
        Self {
            online_status: OnlineStatus::Offline,
            ipv4: None,
            ipv6: Vec::new(),
            mac: None,
            interface_name: None,
            dns: Vec::new(),
            portal_user_id: None,
            devices: Vec::new(),
        }
    }
}

/// One entry of the portal's online-device listing.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    pub ip: String,
}

/// Result of pinging the three fixed targets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReachabilityResult {
    pub internet_reachable: bool,
    pub campus_dns_reachable: bool,
    pub campus_gateway_reachable: bool,
}

impl ReachabilityResult {
    pub const UNREACHABLE: Self = Self {
        internet_reachable: false,
        campus_dns_reachable: false,
        campus_gateway_reachable: false,
    };
}

/// What the portal landing page says about us.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Identity {
    pub account_id: Option<String>,
    pub ipv4: Option<Ipv4Addr>,
}

/// Addresses reported by the campus IP lookup page.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublicAddress {
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

/// Outcome of a login/logout request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoginResult {
    pub success: bool,
    /// `result` field of the portal reply, when it could be decoded.
    pub code: Option<i64>,
    pub message: Option<String>,
    pub raw_response_text: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    Wired,
    Wireless,
    Other,
}

impl std::fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterfaceKind::Wired => write!(f, "wired"),
            InterfaceKind::Wireless => write!(f, "wireless"),
            InterfaceKind::Other => write!(f, "other"),
        }
    }
}

/// Facts about one local interface as reported by the OS.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceFacts {
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Vec<Ipv6Addr>,
    pub mac: Option<String>,
    pub dns_servers: Vec<IpAddr>,
    pub is_up: bool,
}

/// Formats raw hardware address bytes as `AA:BB:CC:DD:EE:FF`.
pub fn format_mac(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() || bytes.iter().all(|b| *b == 0) {
        return None;
    }
    Some(
        bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":"),
    )
}

/// Normalizes a textual MAC (`aa:bb:..`, `aa-bb-..`) to upper-case colon form.
pub fn normalize_mac(text: &str) -> Option<String> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let mac = text.replace('-', ":").to_ascii_uppercase();
    if mac.chars().all(|c| c == '0' || c == ':') {
        return None;
    }
    Some(mac)
}
