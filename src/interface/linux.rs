//! Linux: `ip -json addr show` plus nameservers from `/etc/resolv.conf`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::process::Command;

use serde::Deserialize;

use super::{is_reportable_ipv6, InterfaceMap};
use crate::error::{Error, Result};
use crate::model::{normalize_mac, InterfaceFacts};

const RESOLV_CONF: &str = "/etc/resolv.conf";

#[derive(Debug, Deserialize)]
struct Link {
    ifname: String,
    operstate: Option<String>,
    address: Option<String>,
    #[serde(default)]
    addr_info: Vec<AddrInfo>,
}

#[derive(Debug, Deserialize)]
struct AddrInfo {
    family: String,
    local: Option<String>,
}

pub(super) fn collect() -> Result<InterfaceMap> {
    let out = Command::new("ip")
        .args(["-json", "addr", "show"])
        .output()
        .map_err(|source| Error::Subprocess {
            program: "ip",
            source,
        })?;
    let dns = match std::fs::read_to_string(RESOLV_CONF) {
        Ok(text) => parse_resolv_conf(&text),
        Err(e) => {
            tracing::debug!("Cannot read {}: {}", RESOLV_CONF, e);
            Vec::new()
        }
    };
    parse_ip_json(&String::from_utf8_lossy(&out.stdout), &dns)
}

/// Build facts from `ip -json addr` output. Display names follow the
/// Windows convention (`Ethernet (enp3s0)`, `WLAN (wlp2s0)`) so the
/// marker filter treats every platform alike.
pub fn parse_ip_json(text: &str, dns: &[IpAddr]) -> Result<InterfaceMap> {
    let links: Vec<Link> =
        serde_json::from_str(text).map_err(|e| Error::parse("ip -json output", e.to_string()))?;

    let mut map = InterfaceMap::new();
    for link in links {
        let is_up = link.operstate.as_deref() == Some("UP");
        let ipv4 = link
            .addr_info
            .iter()
            .filter(|a| a.family == "inet")
            .find_map(|a| a.local.as_deref()?.parse::<Ipv4Addr>().ok());
        let ipv6 = link
            .addr_info
            .iter()
            .filter(|a| a.family == "inet6")
            .filter_map(|a| a.local.as_deref()?.parse::<Ipv6Addr>().ok())
            .filter(is_reportable_ipv6)
            .collect();
        let facts = InterfaceFacts {
            ipv4: if is_up { ipv4 } else { None },
            ipv6,
            mac: link.address.as_deref().and_then(normalize_mac),
            dns_servers: if is_up { dns.to_vec() } else { Vec::new() },
            is_up,
        };
        map.insert(display_name(&link.ifname), facts);
    }
    Ok(map)
}

fn display_name(ifname: &str) -> String {
    if ifname.starts_with("wl") {
        format!("WLAN ({})", ifname)
    } else if ifname.starts_with("en") || ifname.starts_with("eth") {
        format!("Ethernet ({})", ifname)
    } else {
        ifname.to_string()
    }
}

/// `nameserver` entries, in file order.
pub fn parse_resolv_conf(text: &str) -> Vec<IpAddr> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("nameserver") => parts.next()?.parse().ok(),
                _ => None,
            }
        })
        .collect()
}
