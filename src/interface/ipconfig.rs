//! Text fallback for DNS servers: scrape `ipconfig /all` output.
//!
//! Only used when the IP Helper API reports no DNS servers for an adapter.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::OnceLock;

use regex::Regex;

/// Lines inspected after the anchor line.
const WINDOW: usize = 11;

fn ipv4_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}").expect("valid regex"))
}

/// `anchor` as a whole address: `10.1.2.3` must not match inside `10.1.2.30`.
fn anchor_re(anchor: &str) -> Option<Regex> {
    let pattern = format!(r"(?:^|[^\d.]){}(?:[^\d.]|$)", regex::escape(anchor));
    match Regex::new(&pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!("Bad DNS anchor {:?}: {}", anchor, e);
            None
        }
    }
}

/// Find the last line mentioning `anchor`, then collect the IPv4 on every
/// "DNS" line in the following window (up to the next adapter header) plus
/// the bare addresses continuing it.
pub fn scrape_dns_servers(text: &str, anchor: &str) -> Vec<IpAddr> {
    let Some(anchor) = anchor_re(anchor) else {
        return Vec::new();
    };
    let lines: Vec<&str> = text.lines().collect();
    let Some(start) = lines.iter().rposition(|l| anchor.is_match(l)) else {
        return Vec::new();
    };

    let mut servers: Vec<IpAddr> = Vec::new();
    let mut in_dns_block = false;
    for (i, line) in lines.iter().skip(start).take(WINDOW).enumerate() {
        // adapter headers start in column 0
        if i > 0 && !line.is_empty() && !line.starts_with(char::is_whitespace) {
            break;
        }
        if line.contains("DNS") {
            in_dns_block = true;
            let found = ipv4_re()
                .find(line)
                .and_then(|m| m.as_str().parse::<Ipv4Addr>().ok());
            if let Some(ip) = found {
                push_unique(&mut servers, IpAddr::V4(ip));
            }
        } else if in_dns_block {
            match line.trim().parse::<IpAddr>() {
                Ok(ip) => push_unique(&mut servers, ip),
                Err(_) => in_dns_block = false,
            }
        }
    }
    servers
}

fn push_unique(servers: &mut Vec<IpAddr>, ip: IpAddr) {
    if !servers.contains(&ip) {
        servers.push(ip);
    }
}
