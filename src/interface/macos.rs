//! macOS: `system_profiler -json SPNetworkDataType`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::process::Command;

use serde::Deserialize;

use super::{is_reportable_ipv6, InterfaceMap};
use crate::error::{Error, Result};
use crate::model::{normalize_mac, InterfaceFacts};

#[derive(Debug, Deserialize)]
struct Report {
    #[serde(rename = "SPNetworkDataType", default)]
    services: Vec<Service>,
}

#[derive(Debug, Deserialize)]
struct Service {
    #[serde(rename = "_name")]
    name: String,
    /// BSD device name (`en0`).
    interface: Option<String>,
    #[serde(rename = "IPv4")]
    ipv4: Option<Addresses>,
    #[serde(rename = "IPv6")]
    ipv6: Option<Addresses>,
    #[serde(rename = "DNS")]
    dns: Option<Dns>,
    #[serde(rename = "Ethernet")]
    ethernet: Option<Ethernet>,
}

#[derive(Debug, Deserialize)]
struct Addresses {
    #[serde(rename = "Addresses", default)]
    addresses: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Dns {
    #[serde(rename = "ServerAddresses", default)]
    server_addresses: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Ethernet {
    #[serde(rename = "MAC Address", alias = "MACAddress")]
    mac: Option<String>,
}

pub(super) fn collect() -> Result<InterfaceMap> {
    let out = Command::new("system_profiler")
        .args(["-json", "SPNetworkDataType"])
        .output()
        .map_err(|source| Error::Subprocess {
            program: "system_profiler",
            source,
        })?;
    parse_system_profiler(&String::from_utf8_lossy(&out.stdout))
}

/// Parse the JSON report into per-service facts keyed by service name (`Wi-Fi`, `Ethernet`).
///
/// Services whose fields do not parse are skipped; a report that is not JSON is an error.
pub fn parse_system_profiler(text: &str) -> Result<InterfaceMap> {
    let report: Report = serde_json::from_str(text)
        .map_err(|e| Error::parse("system_profiler report", e.to_string()))?;

    let mut map = InterfaceMap::new();
    for service in report.services {
        let ipv4 = service
            .ipv4
            .iter()
            .flat_map(|a| a.addresses.iter())
            .find_map(|s| s.trim().parse::<Ipv4Addr>().ok());
        let ipv6 = service
            .ipv6
            .iter()
            .flat_map(|a| a.addresses.iter())
            .filter_map(|s| s.trim().parse::<Ipv6Addr>().ok())
            .filter(is_reportable_ipv6)
            .collect();
        let dns_servers = service
            .dns
            .iter()
            .flat_map(|d| d.server_addresses.iter())
            .filter_map(|s| s.trim().parse::<IpAddr>().ok())
            .collect();
        let mac = service
            .ethernet
            .as_ref()
            .and_then(|e| e.mac.as_deref())
            .and_then(normalize_mac);

        tracing::debug!(
            "system_profiler: {} ({}) ipv4={:?}",
            service.name,
            service.interface.as_deref().unwrap_or("?"),
            ipv4
        );
        map.insert(
            service.name,
            InterfaceFacts {
                ipv4,
                ipv6,
                mac,
                dns_servers,
                is_up: ipv4.is_some(),
            },
        );
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"{
      "SPNetworkDataType": [
        {
          "_name": "Wi-Fi",
          "interface": "en0",
          "hardware": "AirPort",
          "type": "AirPort",
          "IPv4": { "Addresses": ["10.1.2.3"], "SubnetMasks": ["255.255.240.0"] },
          "IPv6": { "Addresses": ["fe80::1", "2001:da8:7001::23"] },
          "DNS": { "ServerAddresses": ["211.64.142.5", "211.64.142.6"] },
          "Ethernet": { "MAC Address": "a4:83:e7:00:11:22" }
        },
        {
          "_name": "Thunderbolt Bridge",
          "interface": "bridge0",
          "Ethernet": { "MAC Address": "36:00:00:00:00:00" }
        }
      ]
    }"#;

    #[test]
    fn parses_services() {
        let map = parse_system_profiler(REPORT).unwrap();
        let wifi = &map["Wi-Fi"];
        assert_eq!(wifi.ipv4, Some(Ipv4Addr::new(10, 1, 2, 3)));
        assert_eq!(wifi.ipv6, vec!["2001:da8:7001::23".parse::<Ipv6Addr>().unwrap()]);
        assert_eq!(wifi.dns_servers.len(), 2);
        assert_eq!(wifi.mac.as_deref(), Some("A4:83:E7:00:11:22"));
        assert!(wifi.is_up);

        let bridge = &map["Thunderbolt Bridge"];
        assert!(!bridge.is_up);
        assert_eq!(bridge.ipv4, None);
    }

    #[test]
    fn rejects_non_json() {
        let err = parse_system_profiler("Network:\n\n    Wi-Fi:\n").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Parse);
    }
}
