//! ICMP reachability of the public internet, campus DNS and campus gateway

use std::future::Future;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::config::ReachabilityConfig;
use crate::model::{Connectivity, ReachabilityResult};

/// Online iff both campus targets answer; public internet is not required.
pub fn is_online(campus_dns_reachable: bool, campus_gateway_reachable: bool) -> bool {
    campus_dns_reachable && campus_gateway_reachable
}

/// Three-way classification; gateway-only reachability means the portal is holding us.
pub fn classify(result: &ReachabilityResult) -> Connectivity {
    if is_online(result.campus_dns_reachable, result.campus_gateway_reachable) {
        Connectivity::Online
    } else if result.campus_gateway_reachable {
        Connectivity::CaptivePortal
    } else {
        Connectivity::Offline
    }
}

impl ReachabilityResult {
    pub fn is_online(&self) -> bool {
        is_online(self.campus_dns_reachable, self.campus_gateway_reachable)
    }
}

pub trait ReachabilityProbe: Send + Sync + 'static {
    /// Never fails: any error collapses to [`ReachabilityResult::UNREACHABLE`].
    fn check(&self) -> impl Future<Output = ReachabilityResult> + Send;
}

/// Pings each target once via the system `ping`, all three concurrently.
#[derive(Clone, Debug)]
pub struct PingProbe {
    internet: String,
    campus_dns: String,
    campus_gateway: String,
    timeout: Duration,
}

impl PingProbe {
    pub fn new(config: &ReachabilityConfig) -> Self {
        Self {
            internet: config.internet.clone(),
            campus_dns: config.campus_dns.clone(),
            campus_gateway: config.campus_gateway.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

fn spawn_ping(target: &str) -> std::io::Result<Child> {
    let count_flag = if cfg!(windows) { "-n" } else { "-c" };
    tracing::debug!("Start ping {}", target);
    Command::new("ping")
        .args([count_flag, "1", target])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
}

async fn wait_ping(mut child: Child, target: &str, timeout: Duration) -> bool {
    let reachable = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => status.success(),
        Ok(Err(e)) => {
            tracing::warn!("ping {}: wait failed: {}", target, e);
            false
        }
        Err(_) => {
            tracing::debug!("ping {}: no reply within {:?}", target, timeout);
            let _ = child.kill().await;
            false
        }
    };
    tracing::debug!("Finish ping {}: {}", target, reachable);
    reachable
}

impl ReachabilityProbe for PingProbe {
    async fn check(&self) -> ReachabilityResult {
        let spawned = spawn_ping(&self.internet).and_then(|internet| {
            let dns = spawn_ping(&self.campus_dns)?;
            let gateway = spawn_ping(&self.campus_gateway)?;
            Ok((internet, dns, gateway))
        });
        let (internet, dns, gateway) = match spawned {
            Ok(children) => children,
            Err(e) => {
                tracing::error!("Reachability check failed: {}", e);
                return ReachabilityResult::UNREACHABLE;
            }
        };

        let (internet_reachable, campus_dns_reachable, campus_gateway_reachable) = tokio::join!(
            wait_ping(internet, &self.internet, self.timeout),
            wait_ping(dns, &self.campus_dns, self.timeout),
            wait_ping(gateway, &self.campus_gateway, self.timeout),
        );
        let result = ReachabilityResult {
            internet_reachable,
            campus_dns_reachable,
            campus_gateway_reachable,
        };
        tracing::debug!("Reachability: {:?}", result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(internet: bool, dns: bool, gateway: bool) -> ReachabilityResult {
        ReachabilityResult {
            internet_reachable: internet,
            campus_dns_reachable: dns,
            campus_gateway_reachable: gateway,
        }
    }

    #[test]
    fn online_needs_both_campus_targets() {
        assert!(is_online(true, true));
        assert!(!is_online(true, false));
        assert!(!is_online(false, true));
        assert!(!is_online(false, false));
    }

    #[test]
    fn internet_reachability_does_not_matter() {
        for dns in [false, true] {
            for gateway in [false, true] {
                assert_eq!(
                    sample(true, dns, gateway).is_online(),
                    sample(false, dns, gateway).is_online()
                );
            }
        }
    }

    #[test]
    fn classification() {
        assert_eq!(classify(&sample(false, true, true)), Connectivity::Online);
        assert_eq!(classify(&sample(false, false, true)), Connectivity::CaptivePortal);
        assert_eq!(classify(&sample(true, true, false)), Connectivity::Offline);
        assert_eq!(classify(&ReachabilityResult::UNREACHABLE), Connectivity::Offline);
    }

    #[tokio::test]
    async fn unknown_host_is_unreachable() {
        let probe = PingProbe {
            internet: "host.invalid".into(),
            campus_dns: "host.invalid".into(),
            campus_gateway: "host.invalid".into(),
            timeout: Duration::from_secs(5),
        };
        // either ping is missing or it fails to resolve; never reachable
        let result = probe.check().await;
        assert!(!result.is_online());
    }
}
