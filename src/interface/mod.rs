//! Local interface facts (addresses, MAC, DNS, link state) per operating system.

mod ipconfig;
#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(windows)]
mod win;

use std::collections::BTreeMap;
use std::future::Future;
use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use crate::config::InterfaceConfig;
use crate::error::Result;
use crate::model::{InterfaceFacts, InterfaceKind};

pub use ipconfig::scrape_dns_servers;
#[cfg(target_os = "linux")]
pub use linux::{parse_ip_json, parse_resolv_conf};
#[cfg(target_os = "macos")]
pub use macos::parse_system_profiler;

/// Interface name → facts. Ordered so that name tie-breaks are stable.
pub type InterfaceMap = BTreeMap<String, InterfaceFacts>;

/// Source of local interface facts.
pub trait InterfaceProbe: Send + Sync + 'static {
    /// Never fails: a broken probe yields an empty map, which reads as offline upstream.
    fn collect(&self) -> impl Future<Output = InterfaceMap> + Send;
}

/// Probe backed by the host OS.
#[derive(Clone, Debug)]
pub struct SystemInterfaceProbe {
    markers: Vec<String>,
    dns_anchor: String,
}

impl SystemInterfaceProbe {
    pub fn new(config: &InterfaceConfig) -> Self {
        Self {
            markers: config.markers.clone(),
            dns_anchor: config.dns_anchor.clone(),
        }
    }
}

impl InterfaceProbe for SystemInterfaceProbe {
    async fn collect(&self) -> InterfaceMap {
        let anchor = self.dns_anchor.clone();
        let all = match tokio::task::spawn_blocking(move || collect_platform(&anchor)).await {
            Ok(Ok(map)) => map,
            Ok(Err(e)) => {
                tracing::warn!("Interface probe failed: {}", e);
                return InterfaceMap::new();
            }
            Err(e) => {
                tracing::error!("Interface probe task panicked: {}", e);
                return InterfaceMap::new();
            }
        };
        let total = all.len();
        let kept = retain_marked(all, &self.markers);
        tracing::debug!(
            "Interface probe: {} interface(s), {} match markers",
            total,
            kept.len()
        );
        kept
    }
}

#[cfg(windows)]
fn collect_platform(dns_anchor: &str) -> Result<InterfaceMap> {
    win::collect(dns_anchor)
}

#[cfg(target_os = "macos")]
fn collect_platform(_dns_anchor: &str) -> Result<InterfaceMap> {
    macos::collect()
}

#[cfg(target_os = "linux")]
fn collect_platform(_dns_anchor: &str) -> Result<InterfaceMap> {
    linux::collect()
}

#[cfg(not(any(windows, target_os = "macos", target_os = "linux")))]
fn collect_platform(_dns_anchor: &str) -> Result<InterfaceMap> {
    tracing::warn!("No interface probe for this platform");
    Ok(InterfaceMap::new())
}

/// Keep only interfaces whose display name contains one of `markers` (ASCII case-insensitive).
pub fn retain_marked(map: InterfaceMap, markers: &[String]) -> InterfaceMap {
    map.into_iter()
        .filter(|(name, _)| matches_markers(name, markers))
        .collect()
}

pub fn matches_markers(name: &str, markers: &[String]) -> bool {
    let name = name.to_lowercase();
    markers.iter().any(|m| name.contains(&m.to_lowercase()))
}

/// Guess wired/wireless from a display name. Hypervisor and container
/// switches (`vEthernet (WSL)`, VMware/VirtualBox host-only) count as `Other`.
pub fn interface_kind(name: &str) -> InterfaceKind {
    let name = name.to_lowercase();
    const VIRTUAL: &[&str] = &[
        "vethernet",
        "hyper-v",
        "virtual",
        "vmware",
        "virtualbox",
        "docker",
        "loopback",
    ];
    const WIRELESS: &[&str] = &["wlan", "wi-fi", "wifi", "wireless", "无线", "airport"];
    const WIRED: &[&str] = &["ethernet", "以太网", "有线"];
    if VIRTUAL.iter().any(|m| name.contains(m)) {
        InterfaceKind::Other
    } else if WIRELESS.iter().any(|m| name.contains(m)) {
        InterfaceKind::Wireless
    } else if WIRED.iter().any(|m| name.contains(m)) {
        InterfaceKind::Wired
    } else {
        InterfaceKind::Other
    }
}

/// True for a usable IPv4: present and not 0.0.0.0, loopback or APIPA.
pub fn is_online_candidate(facts: &InterfaceFacts) -> bool {
    facts.ipv4.is_some_and(is_assigned_ipv4)
}

fn is_assigned_ipv4(ip: Ipv4Addr) -> bool {
    !ip.is_unspecified() && !ip.is_loopback() && !ip.is_link_local()
}

/// Global or unique-local IPv6 worth showing (drops `::`, `::1` and `fe80::/10`).
pub fn is_reportable_ipv6(ip: &Ipv6Addr) -> bool {
    !ip.is_unspecified() && !ip.is_loopback() && (ip.segments()[0] & 0xffc0) != 0xfe80
}

/// Interfaces carrying a usable IPv4, in name order.
pub fn online_candidates(map: &InterfaceMap) -> Vec<(&str, &InterfaceFacts)> {
    map.iter()
        .filter(|(_, facts)| is_online_candidate(facts))
        .map(|(name, facts)| (name.as_str(), facts))
        .collect()
}

/// Tie-break when more than one interface is online.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionPolicy {
    #[default]
    PreferWired,
    PreferWireless,
    FirstByName,
}

impl SelectionPolicy {
    fn rank(self, kind: InterfaceKind) -> u8 {
        match (self, kind) {
            (SelectionPolicy::FirstByName, _) => 0,
            (SelectionPolicy::PreferWired, InterfaceKind::Wired)
            | (SelectionPolicy::PreferWireless, InterfaceKind::Wireless) => 0,
            (_, InterfaceKind::Other) => 2,
            _ => 1,
        }
    }

    /// Pick one interface; candidates must already be in name order.
    pub fn select<'a>(
        self,
        candidates: &[(&'a str, &'a InterfaceFacts)],
    ) -> Option<(&'a str, &'a InterfaceFacts)> {
        candidates
            .iter()
            .copied()
            .min_by_key(|(name, _)| self.rank(interface_kind(name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(ipv4: Option<&str>) -> InterfaceFacts {
        InterfaceFacts {
            ipv4: ipv4.map(|s| s.parse().unwrap()),
            is_up: ipv4.is_some(),
            ..InterfaceFacts::default()
        }
    }

    fn markers() -> Vec<String> {
        InterfaceConfig::default().markers
    }

    #[test]
    fn marker_filter_keeps_ethernet_and_wlan() {
        let mut map = InterfaceMap::new();
        map.insert("以太网 2".into(), facts(Some("10.0.0.2")));
        map.insert("WLAN".into(), facts(Some("10.0.0.3")));
        map.insert("Wi-Fi".into(), facts(None));
        map.insert("vEthernet (WSL)".into(), facts(Some("172.20.0.1")));
        map.insert("Loopback Pseudo-Interface 1".into(), facts(Some("127.0.0.1")));
        map.insert("utun3".into(), facts(Some("100.64.0.1")));

        let kept = retain_marked(map, &markers());
        let names: Vec<_> = kept.keys().map(String::as_str).collect();
        assert_eq!(names, ["WLAN", "Wi-Fi", "vEthernet (WSL)", "以太网 2"]);
    }

    #[test]
    fn placeholder_addresses_are_not_candidates() {
        assert!(is_online_candidate(&facts(Some("10.1.2.3"))));
        assert!(!is_online_candidate(&facts(None)));
        assert!(!is_online_candidate(&facts(Some("0.0.0.0"))));
        assert!(!is_online_candidate(&facts(Some("169.254.10.20"))));
        assert!(!is_online_candidate(&facts(Some("127.0.0.1"))));
    }

    #[test]
    fn candidates_are_name_ordered() {
        let mut map = InterfaceMap::new();
        map.insert("WLAN".into(), facts(Some("10.0.0.3")));
        map.insert("Ethernet".into(), facts(None));
        map.insert("Ethernet 2".into(), facts(Some("10.0.0.2")));
        let names: Vec<_> = online_candidates(&map).iter().map(|(n, _)| *n).collect();
        assert_eq!(names, ["Ethernet 2", "WLAN"]);
    }

    #[test]
    fn kind_from_display_name() {
        assert_eq!(interface_kind("以太网"), InterfaceKind::Wired);
        assert_eq!(interface_kind("Ethernet (enp3s0)"), InterfaceKind::Wired);
        assert_eq!(interface_kind("WLAN"), InterfaceKind::Wireless);
        assert_eq!(interface_kind("Wi-Fi"), InterfaceKind::Wireless);
        assert_eq!(interface_kind("utun3"), InterfaceKind::Other);
        assert_eq!(interface_kind("vEthernet (WSL)"), InterfaceKind::Other);
        assert_eq!(interface_kind("vEthernet (Default Switch)"), InterfaceKind::Other);
        assert_eq!(interface_kind("VMware Network Adapter VMnet8"), InterfaceKind::Other);
    }

    #[test]
    fn physical_link_beats_hypervisor_switch() {
        let mut map = InterfaceMap::new();
        map.insert("WLAN".into(), facts(Some("10.1.2.3")));
        map.insert("vEthernet (WSL)".into(), facts(Some("172.20.0.1")));
        let kept = retain_marked(map, &markers());
        let candidates = online_candidates(&kept);

        for policy in [SelectionPolicy::PreferWired, SelectionPolicy::PreferWireless] {
            let picked = policy.select(&candidates).map(|(n, _)| n);
            assert_eq!(picked, Some("WLAN"), "{:?}", policy);
        }
    }

    #[test]
    fn selection_policies() {
        let wifi = facts(Some("10.0.0.3"));
        let wired = facts(Some("10.0.0.2"));
        let candidates = [("WLAN", &wifi), ("以太网", &wired)];

        let pick = |p: SelectionPolicy| p.select(&candidates).map(|(n, _)| n);
        assert_eq!(pick(SelectionPolicy::PreferWired), Some("以太网"));
        assert_eq!(pick(SelectionPolicy::PreferWireless), Some("WLAN"));
        assert_eq!(pick(SelectionPolicy::FirstByName), Some("WLAN"));
        assert_eq!(SelectionPolicy::PreferWired.select(&[]), None);
    }

    #[test]
    fn prefer_wired_falls_back_to_first_wireless() {
        let a = facts(Some("10.0.0.3"));
        let b = facts(Some("10.0.0.4"));
        let candidates = [("WLAN", &a), ("WLAN 2", &b)];
        let picked = SelectionPolicy::PreferWired.select(&candidates).map(|(n, _)| n);
        assert_eq!(picked, Some("WLAN"));
    }

    #[test]
    fn ipv6_reportability() {
        assert!(is_reportable_ipv6(&"2001:da8:7001::1".parse().unwrap()));
        assert!(!is_reportable_ipv6(&"fe80::1c2a:3ff:fe4b:1".parse().unwrap()));
        assert!(!is_reportable_ipv6(&"::1".parse().unwrap()));
        assert!(!is_reportable_ipv6(&"::".parse().unwrap()));
    }
}
