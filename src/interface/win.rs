//! Windows: IP Helper `GetAdaptersAddresses` for addresses, MAC and DNS;
//! `ipconfig /all` scraping only when an adapter reports no DNS servers.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::process::Command;

use windows::Win32::Foundation::ERROR_BUFFER_OVERFLOW;
use windows::Win32::NetworkManagement::IpHelper::{
    GetAdaptersAddresses, GAA_FLAG_INCLUDE_PREFIX, IP_ADAPTER_ADDRESSES_LH,
};
use windows::Win32::NetworkManagement::Ndis::IfOperStatusUp;
use windows::Win32::Networking::WinSock::{
    AF_INET, AF_INET6, AF_UNSPEC, SOCKADDR, SOCKADDR_IN, SOCKADDR_IN6,
};

use super::{ipconfig, is_reportable_ipv6, InterfaceMap};
use crate::error::{Error, Result};
use crate::model::{format_mac, InterfaceFacts};

/// Adapter list can grow between the size query and the real call.
const MAX_ATTEMPTS: usize = 3;

pub(super) fn collect(dns_anchor: &str) -> Result<InterfaceMap> {
    let mut map = unsafe { adapter_facts()? };

    let missing_dns: Vec<String> = map
        .iter()
        .filter(|(_, f)| f.is_up && f.ipv4.is_some() && f.dns_servers.is_empty())
        .map(|(name, _)| name.clone())
        .collect();
    if missing_dns.is_empty() {
        return Ok(map);
    }

    tracing::debug!(
        "No DNS from IP Helper for {:?}, falling back to ipconfig /all",
        missing_dns
    );
    let text = match ipconfig_all() {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!("{}", e);
            return Ok(map);
        }
    };
    for name in missing_dns {
        if let Some(facts) = map.get_mut(&name) {
            let anchor = facts
                .ipv4
                .map_or_else(|| dns_anchor.to_string(), |ip| ip.to_string());
            facts.dns_servers = ipconfig::scrape_dns_servers(&text, &anchor);
        }
    }
    Ok(map)
}

fn ipconfig_all() -> Result<String> {
    let out = Command::new("ipconfig")
        .arg("/all")
        .output()
        .map_err(|source| Error::Subprocess {
            program: "ipconfig",
            source,
        })?;
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

/// Walk the adapter list returned by `GetAdaptersAddresses`.
unsafe fn adapter_facts() -> Result<InterfaceMap> {
    let mut size: u32 = 16 * 1024;
    let mut attempt = 0;
    let buffer = loop {
        attempt += 1;
        // u64 backing keeps the buffer aligned for IP_ADAPTER_ADDRESSES_LH
        let mut buffer = vec![0u64; (size as usize).div_ceil(8)];
        let status = GetAdaptersAddresses(
            AF_UNSPEC.0 as u32,
            GAA_FLAG_INCLUDE_PREFIX,
            None,
            Some(buffer.as_mut_ptr().cast::<IP_ADAPTER_ADDRESSES_LH>()),
            &mut size,
        );
        if status == ERROR_BUFFER_OVERFLOW.0 && attempt < MAX_ATTEMPTS {
            continue;
        }
        if status != 0 {
            return Err(Error::Os {
                call: "GetAdaptersAddresses",
                code: status,
            });
        }
        break buffer;
    };

    let mut map = InterfaceMap::new();
    let mut current = buffer.as_ptr().cast::<IP_ADAPTER_ADDRESSES_LH>();
    while !current.is_null() {
        let adapter = &*current;
        current = adapter.Next;

        let name = match adapter.FriendlyName.to_string() {
            Ok(name) if !name.is_empty() => name,
            _ => continue,
        };

        let mut facts = InterfaceFacts {
            is_up: adapter.OperStatus == IfOperStatusUp,
            ..InterfaceFacts::default()
        };
        let mac_len = (adapter.PhysicalAddressLength as usize).min(adapter.PhysicalAddress.len());
        facts.mac = format_mac(&adapter.PhysicalAddress[..mac_len]);

        let mut unicast = adapter.FirstUnicastAddress;
        while !unicast.is_null() {
            let entry = &*unicast;
            match sockaddr_ip(entry.Address.lpSockaddr) {
                Some(IpAddr::V4(ip)) if facts.ipv4.is_none() => facts.ipv4 = Some(ip),
                Some(IpAddr::V6(ip)) if is_reportable_ipv6(&ip) => facts.ipv6.push(ip),
                _ => {}
            }
            unicast = entry.Next;
        }

        let mut dns = adapter.FirstDnsServerAddress;
        while !dns.is_null() {
            let entry = &*dns;
            if let Some(ip) = sockaddr_ip(entry.Address.lpSockaddr) {
                if !facts.dns_servers.contains(&ip) {
                    facts.dns_servers.push(ip);
                }
            }
            dns = entry.Next;
        }

        if !facts.is_up {
            // addresses of a disconnected adapter are stale
            facts.ipv4 = None;
            facts.ipv6.clear();
        }
        map.insert(name, facts);
    }
    Ok(map)
}

unsafe fn sockaddr_ip(addr: *const SOCKADDR) -> Option<IpAddr> {
    if addr.is_null() {
        return None;
    }
    let family = (*addr).sa_family;
    if family == AF_INET {
        let sin = &*addr.cast::<SOCKADDR_IN>();
        let raw = u32::from_be(sin.sin_addr.S_un.S_addr);
        Some(IpAddr::V4(Ipv4Addr::from(raw)))
    } else if family == AF_INET6 {
        let sin6 = &*addr.cast::<SOCKADDR_IN6>();
        Some(IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.u.Byte)))
    } else {
        None
    }
}
