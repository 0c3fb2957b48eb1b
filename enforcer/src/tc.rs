//! Kernel traffic-control back-end.
//!
//! Compiles profiles into `tc(8)` invocations. Each interface carries
//! two roots: a `1:` prio root for traffic towards the device and the
//! `ffff:` ingress for traffic from it. Each device owns one filter
//! chain per root, so provisioning and deprovisioning are a single
//! chain swap.

use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;

use autopolicy_common::{Dir, Direction, Profile, ProfileError, ServiceSpec, SpecError};

use crate::device::Device;
use crate::sniffer::is_global_unicast;

/// Budget for one `tc` invocation.
const TC_TIMEOUT: Duration = Duration::from_secs(1);

/// Fixed filter preferences on the shared roots.
const PREF_INIT_V4: u32 = 1;
const PREF_INIT_V6: u32 = 2;
const PREF_DEVICE: u32 = 3;
const PREF_LAST_V4: u32 = 4;
const PREF_LAST_V6: u32 = 5;

/// Rate policing slack: allow 2.5% over the configured rate.
const RATE_SLACK: f64 = 1.025;
/// Burst allowance relative to the configured rate.
const BURST_FACTOR: f64 = 3.0;

#[derive(Debug, Error)]
pub enum TcError {
    #[error("tc binary not found in $PATH")]
    NotFound,
    #[error("tc timed out: {args}")]
    Timeout { args: String },
    #[error("tc failed: {stderr}: {args}")]
    Command { args: String, stderr: String },
    #[error("running tc: {0}")]
    Io(#[from] io::Error),
    #[error("profile: {0}")]
    Profile(#[from] ProfileError),
    #[error("profile: {0}")]
    Spec(#[from] SpecError),
}

/// Drives the `tc` CLI. The binary path is resolved once at startup
/// and injected.
pub struct TcDriver {
    tc_path: PathBuf,
}

impl TcDriver {
    pub fn new(tc_path: PathBuf) -> TcDriver {
        TcDriver { tc_path }
    }

    /// Resolve the `tc` binary from `$PATH`.
    pub fn lookup() -> Result<PathBuf, TcError> {
        let path = std::env::var_os("PATH").unwrap_or_default();
        for dir in std::env::split_paths(&path) {
            let candidate = dir.join("tc");
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(TcError::NotFound)
    }

    async fn run(&self, args: Vec<String>) -> Result<(), TcError> {
        tracing::trace!("tc {}", args.join(" "));

        let mut cmd = Command::new(&self.tc_path);
        cmd.args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(TC_TIMEOUT, cmd.output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(TcError::Timeout {
                    args: args.join(" "),
                })
            }
        };

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        // re-adding existing qdiscs and filters is fine
        if stderr.contains("File exists") || stderr.contains("Exclusivity flag on") {
            return Ok(());
        }

        Err(TcError::Command {
            args: args.join(" "),
            stderr,
        })
    }

    /// Tear down both roots; errors mean the roots were not there.
    pub async fn cleanup(&self, iface: &str) -> Result<(), TcError> {
        let root = self
            .run(strings(&["qdisc", "del", "dev", iface, "root", "handle", "1:", "prio"]))
            .await;
        let ingress = self
            .run(strings(&["qdisc", "del", "dev", iface, "handle", "ffff:", "ingress"]))
            .await;
        root.and(ingress)
    }

    /// Prepare one interface: both roots, always-accept filters for
    /// the host's own addresses, trailing drops.
    pub async fn init(&self, iface: &str) -> Result<(), TcError> {
        self.run(strings(&["qdisc", "add", "dev", iface, "root", "handle", "1:", "prio"]))
            .await?;
        self.run(strings(&["qdisc", "add", "dev", iface, "handle", "ffff:", "ingress"]))
            .await?;

        // the device must always reach this host, e.g. for identity
        // fetches
        for addr in host_addrs()? {
            let (protocol, pref) = match addr {
                IpAddr::V4(_) => ("ip", PREF_INIT_V4),
                IpAddr::V6(_) => ("ipv6", PREF_INIT_V6),
            };
            self.run(strings(&[
                "filter", "add", "dev", iface, "parent", "ffff:",
                "pref", &pref.to_string(), "protocol", protocol,
                "flower", "dst_ip", &addr.to_string(),
                "action", "pass",
            ]))
            .await?;
        }

        // if nothing matches, drop all traffic
        self.run(strings(&[
            "filter", "add", "dev", iface, "parent", "ffff:",
            "pref", &PREF_LAST_V4.to_string(), "protocol", "ip",
            "matchall", "action", "drop",
        ]))
        .await?;
        self.run(strings(&[
            "filter", "add", "dev", iface, "parent", "ffff:",
            "pref", &PREF_LAST_V6.to_string(), "protocol", "ipv6",
            "matchall", "action", "drop",
        ]))
        .await
    }

    /// Install the profile for one device, replacing whatever was
    /// there.
    pub async fn provision(&self, device: &Device, profile: &Profile) -> Result<(), TcError> {
        self.deprovision(device).await;

        let iface = device.iface.as_str();
        let chain = device.tc_chain;
        let mac = device.mac.to_string();

        if let Some(rules) = profile.rules(Direction::FromDevice)? {
            // the remote end of device-originated traffic is the
            // destination
            self.install_chain(iface, "ffff:", chain, &rules, Dir::Dst)
                .await?;
            self.run(strings(&[
                "filter", "add", "dev", iface, "parent", "ffff:",
                "handle", &chain.to_string(), "pref", &PREF_DEVICE.to_string(),
                "protocol", "all", "flower", "src_mac", &mac,
                "action", "goto", "chain", &chain.to_string(),
            ]))
            .await?;
        }

        if let Some(rules) = profile.rules(Direction::ToDevice)? {
            self.install_chain(iface, "1:", chain, &rules, Dir::Src)
                .await?;
            self.run(strings(&[
                "filter", "add", "dev", iface, "parent", "1:",
                "handle", &chain.to_string(), "pref", &PREF_DEVICE.to_string(),
                "protocol", "all", "flower", "dst_mac", &mac,
                "action", "goto", "chain", &chain.to_string(),
            ]))
            .await?;
        }

        Ok(())
    }

    /// Remove the device's redirect filters and flush its chains on
    /// both roots. Missing pieces are not an error.
    pub async fn deprovision(&self, device: &Device) {
        let iface = device.iface.as_str();
        let chain = device.tc_chain.to_string();

        for parent in ["ffff:", "1:"] {
            let _ = self
                .run(strings(&[
                    "filter", "del", "dev", iface, "parent", parent,
                    "handle", &chain, "pref", &PREF_DEVICE.to_string(),
                    "protocol", "all", "flower",
                ]))
                .await;
            let _ = self
                .run(strings(&["chain", "del", "dev", iface, "parent", parent, "chain", &chain]))
                .await;
        }
    }

    async fn install_chain(
        &self,
        iface: &str,
        parent: &str,
        chain: u32,
        rules: &autopolicy_common::DeviceRules,
        default_dir: Dir,
    ) -> Result<(), TcError> {
        for tail in compile_rules(rules, default_dir)? {
            let mut args = strings(&[
                "filter", "add", "dev", iface, "parent", parent, "chain", &chain.to_string(),
            ]);
            args.extend(tail);
            self.run(args).await?;
        }
        Ok(())
    }
}

/// Compile one direction's rules into filter argument tails, in
/// installation order with monotonically growing preference:
/// rate police, block drops, allow accepts (flipping the default),
/// trailing matchall with the default action.
fn compile_rules(
    rules: &autopolicy_common::DeviceRules,
    default_dir: Dir,
) -> Result<Vec<Vec<String>>, TcError> {
    let mut out = Vec::new();
    let mut pref = 0u32;
    let mut policy = "pass";

    if let Some(rate) = rules.rate {
        if rate > 0.0 {
            pref += 1;
            out.push(strings(&[
                "pref", &pref.to_string(), "protocol", "all", "matchall",
                "action", "police",
                "rate", &fmt_mbit(rate * RATE_SLACK),
                "burst", &fmt_mbit(rate * BURST_FACTOR),
                "conform-exceed", "drop/continue",
            ]));
        }
    }

    for spec in &rules.block {
        let spec = ServiceSpec::parse(spec)?;
        for (protocol, keys) in expand_spec(&spec, default_dir) {
            pref += 1;
            out.push(filter_tail(pref, &protocol, "flower", &keys, &["drop"]));
        }
    }

    if !rules.allow.is_empty() {
        policy = "drop";
        for spec in &rules.allow {
            let spec = ServiceSpec::parse(spec)?;
            for (protocol, keys) in expand_spec(&spec, default_dir) {
                pref += 1;
                out.push(filter_tail(pref, &protocol, "flower", &keys, &["pass"]));
            }
        }
    }

    pref += 1;
    out.push(filter_tail(pref, "all", "matchall", &[], &[policy]));

    Ok(out)
}

/// Expand one service spec into flower key sets; specs with a port
/// list yield one filter per port entry.
fn expand_spec(spec: &ServiceSpec, default_dir: Dir) -> Vec<(String, Vec<String>)> {
    let dir = spec.dir.unwrap_or(default_dir);
    let protocol = if spec.is_ipv6() { "ipv6" } else { "ip" };

    let mut base = Vec::new();
    if let Some(arg) = spec.prefix.as_ref().and_then(|p| p.match_arg()) {
        base.push(format!("{}_ip", dir.as_str()));
        base.push(arg);
    }
    if let Some(proto) = spec.proto {
        base.push("ip_proto".to_string());
        base.push(proto.as_str());
    }

    if spec.ports.is_empty() {
        return vec![(protocol.to_string(), base)];
    }

    spec.ports
        .iter()
        .map(|port| {
            let mut keys = base.clone();
            keys.push(format!("{}_port", dir.as_str()));
            keys.push(port.match_arg());
            (protocol.to_string(), keys)
        })
        .collect()
}

fn filter_tail(pref: u32, protocol: &str, kind: &str, keys: &[String], action: &[&str]) -> Vec<String> {
    let mut args = strings(&["pref", &pref.to_string(), "protocol", protocol, kind]);
    args.extend(keys.iter().cloned());
    args.push("action".to_string());
    args.extend(action.iter().map(|a| a.to_string()));
    args
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// `tc` rate argument: trim trailing zeros so `30.000` reads `30mbit`.
fn fmt_mbit(value: f64) -> String {
    let mut s = format!("{value:.3}");
    while s.ends_with('0') {
        s.pop();
    }
    if s.ends_with('.') {
        s.pop();
    }
    format!("{s}mbit")
}

/// Every global-unicast address configured on this host.
fn host_addrs() -> Result<Vec<IpAddr>, TcError> {
    let addrs = nix::ifaddrs::getifaddrs().map_err(|e| io::Error::from_raw_os_error(e as i32))?;

    let mut out = Vec::new();
    for ifaddr in addrs {
        let Some(storage) = ifaddr.address else { continue };
        let ip = if let Some(sin) = storage.as_sockaddr_in() {
            IpAddr::V4(sin.ip())
        } else if let Some(sin6) = storage.as_sockaddr_in6() {
            IpAddr::V6(sin6.ip())
        } else {
            continue;
        };
        if is_global_unicast(&ip) {
            out.push(ip);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use autopolicy_common::DeviceRules;

    fn joined(filters: &[Vec<String>]) -> Vec<String> {
        filters.iter().map(|f| f.join(" ")).collect()
    }

    #[test]
    fn test_rate_police_first() {
        let rules = DeviceRules {
            rate: Some(10.0),
            ..Default::default()
        };
        let filters = joined(&compile_rules(&rules, Dir::Dst).unwrap());
        assert_eq!(filters.len(), 2);
        assert_eq!(
            filters[0],
            "pref 1 protocol all matchall action police rate 10.25mbit burst 30mbit conform-exceed drop/continue"
        );
        assert_eq!(filters[1], "pref 2 protocol all matchall action pass");
    }

    #[test]
    fn test_zero_rate_is_skipped() {
        let rules = DeviceRules {
            rate: Some(0.0),
            ..Default::default()
        };
        let filters = joined(&compile_rules(&rules, Dir::Dst).unwrap());
        assert_eq!(filters, vec!["pref 1 protocol all matchall action pass"]);
    }

    #[test]
    fn test_block_keeps_default_pass() {
        let rules = DeviceRules {
            block: vec!["dst 10.0.0.0/8 tcp".into()],
            ..Default::default()
        };
        let filters = joined(&compile_rules(&rules, Dir::Dst).unwrap());
        assert_eq!(
            filters,
            vec![
                "pref 1 protocol ip flower dst_ip 10.0.0.0/8 ip_proto tcp action drop",
                "pref 2 protocol all matchall action pass",
            ]
        );
    }

    #[test]
    fn test_allow_flips_default_to_drop() {
        let rules = DeviceRules {
            allow: vec!["udp".into()],
            ..Default::default()
        };
        let filters = joined(&compile_rules(&rules, Dir::Dst).unwrap());
        assert_eq!(
            filters,
            vec![
                "pref 1 protocol ip flower ip_proto udp action pass",
                "pref 2 protocol all matchall action drop",
            ]
        );
    }

    #[test]
    fn test_full_ordering_and_monotonic_prefs() {
        let rules = DeviceRules {
            rate: Some(4.0),
            allow: vec!["dst 192.168.1.1 tcp 80,443".into()],
            block: vec!["icmp".into()],
        };
        let filters = compile_rules(&rules, Dir::Dst).unwrap();
        let prefs: Vec<&String> = filters.iter().map(|f| &f[1]).collect();
        assert_eq!(prefs, ["1", "2", "3", "4", "5"]);

        let joined = joined(&filters);
        assert!(joined[0].contains("police rate 4.1mbit burst 12mbit"));
        assert!(joined[1].ends_with("ip_proto icmp action drop"));
        assert!(joined[2].contains("dst_ip 192.168.1.1 ip_proto tcp dst_port 80"));
        assert!(joined[3].contains("dst_port 443"));
        assert_eq!(joined[4], "pref 5 protocol all matchall action drop");
    }

    #[test]
    fn test_port_ranges_expand() {
        let rules = DeviceRules {
            allow: vec!["src 10.1.0.0/16 udp 5000-5100".into()],
            ..Default::default()
        };
        let filters = joined(&compile_rules(&rules, Dir::Dst).unwrap());
        assert!(filters[0].contains("src_ip 10.1.0.0/16 ip_proto udp src_port 5000-5100"));
    }

    #[test]
    fn test_implicit_dir_follows_chain_side() {
        let rules = DeviceRules {
            block: vec!["10.0.0.0/8 tcp".into()],
            ..Default::default()
        };
        // from_device chains match the remote end as destination
        let from = joined(&compile_rules(&rules, Dir::Dst).unwrap());
        assert!(from[0].contains("dst_ip 10.0.0.0/8"));
        // to_device chains match it as source
        let to = joined(&compile_rules(&rules, Dir::Src).unwrap());
        assert!(to[0].contains("src_ip 10.0.0.0/8"));
    }

    #[test]
    fn test_ipv6_specs_use_ipv6_ethertype() {
        let rules = DeviceRules {
            block: vec!["dst 2001:db8::/32 tcp".into(), "icmpv6".into()],
            ..Default::default()
        };
        let filters = joined(&compile_rules(&rules, Dir::Dst).unwrap());
        assert!(filters[0].starts_with("pref 1 protocol ipv6 flower dst_ip 2001:db8::/32"));
        assert!(filters[1].starts_with("pref 2 protocol ipv6 flower ip_proto icmpv6"));
    }

    #[test]
    fn test_wildcard_prefix_emits_no_ip_key() {
        let rules = DeviceRules {
            allow: vec!["dst * udp 53".into()],
            ..Default::default()
        };
        let filters = joined(&compile_rules(&rules, Dir::Dst).unwrap());
        assert_eq!(
            filters[0],
            "pref 1 protocol ip flower ip_proto udp dst_port 53 action pass"
        );
    }

    #[test]
    fn test_bad_spec_surfaces_error() {
        let rules = DeviceRules {
            block: vec!["dst not-an-address".into()],
            ..Default::default()
        };
        assert!(matches!(
            compile_rules(&rules, Dir::Dst),
            Err(TcError::Spec(_))
        ));
    }

    #[test]
    fn test_fmt_mbit_trims_zeros() {
        assert_eq!(fmt_mbit(30.0), "30mbit");
        assert_eq!(fmt_mbit(10.25), "10.25mbit");
        assert_eq!(fmt_mbit(4.1), "4.1mbit");
        assert_eq!(fmt_mbit(1.025 * 2.0), "2.05mbit");
    }
}
