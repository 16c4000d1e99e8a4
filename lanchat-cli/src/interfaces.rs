//! Network interface inventory and the multicast join fallback chain.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::net::Ipv4Addr;

use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};
use tracing::{debug, warn};

/// One local interface as far as multicast is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInterface {
    pub name: String,
    pub index: u32,
    pub mac: Option<String>,
    pub ipv4: Vec<Ipv4Addr>,
    pub mtu: Option<u32>,
    pub up: bool,
    pub loopback: bool,
    pub multicast: bool,
}

impl NetInterface {
    /// Usable for step (1): up, not loopback, multicast, owns an IPv4 address.
    fn is_preferred(&self) -> bool {
        self.up && !self.loopback && self.multicast && !self.ipv4.is_empty()
    }

    /// Usable for step (3): up and multicast, loopback allowed.
    fn is_fallback(&self) -> bool {
        self.up && self.multicast && !self.ipv4.is_empty()
    }
}

/// How the group was joined. Shown to the user as network status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinedVia {
    Interface(NetInterface),
    DefaultRoute,
}

impl fmt::Display for JoinedVia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinedVia::DefaultRoute => f.write_str("Default network interface"),
            JoinedVia::Interface(i) => {
                let ips: Vec<String> = i.ipv4.iter().map(|ip| ip.to_string()).collect();
                write!(
                    f,
                    "Interface: {} | IP: {} | MTU: {} | MAC: {}{}",
                    i.name,
                    ips.join(" "),
                    i.mtu.map(|m| m.to_string()).unwrap_or_else(|| "?".into()),
                    i.mac.as_deref().unwrap_or("Unknown"),
                    if i.loopback { " (Loopback)" } else { "" }
                )
            }
        }
    }
}

/// Enumerate local interfaces. Errors yield an empty list; the join chain still tries the default route.
pub fn enumerate() -> Vec<NetInterface> {
    let raw = match NetworkInterface::show() {
        Ok(list) => list,
        Err(e) => {
            warn!("failed to list network interfaces: {}", e);
            return Vec::new();
        }
    };
    let mut by_name: BTreeMap<String, NetInterface> = BTreeMap::new();
    // Keep enumeration order stable: first-seen index decides position.
    let mut order: Vec<String> = Vec::new();
    for iface in raw {
        let entry = by_name.entry(iface.name.clone()).or_insert_with(|| {
            order.push(iface.name.clone());
            NetInterface {
                name: iface.name.clone(),
                index: iface.index,
                mac: iface
                    .mac_addr
                    .as_deref()
                    .filter(|m| !m.is_empty())
                    .map(str::to_uppercase),
                ipv4: Vec::new(),
                mtu: read_mtu(&iface.name),
                up: false,
                loopback: false,
                multicast: false,
            }
        });
        for addr in &iface.addr {
            if let Addr::V4(v4) = addr {
                if !entry.ipv4.contains(&v4.ip) {
                    entry.ipv4.push(v4.ip);
                }
            }
        }
    }
    let mut out: Vec<NetInterface> = order
        .into_iter()
        .filter_map(|n| by_name.remove(&n))
        .collect();
    apply_flags(&mut out);
    out
}

#[cfg(unix)]
fn apply_flags(ifaces: &mut [NetInterface]) {
    use nix::net::if_::InterfaceFlags;

    let addrs = match nix::ifaddrs::getifaddrs() {
        Ok(a) => a,
        Err(e) => {
            debug!("getifaddrs failed, guessing interface flags: {}", e);
            guess_flags(ifaces);
            return;
        }
    };
    let mut flags: BTreeMap<String, InterfaceFlags> = BTreeMap::new();
    for a in addrs {
        *flags.entry(a.interface_name).or_insert(InterfaceFlags::empty()) |= a.flags;
    }
    for iface in ifaces.iter_mut() {
        match flags.get(&iface.name) {
            Some(f) => {
                iface.up = f.contains(InterfaceFlags::IFF_UP);
                iface.loopback = f.contains(InterfaceFlags::IFF_LOOPBACK);
                iface.multicast = f.contains(InterfaceFlags::IFF_MULTICAST);
            }
            None => guess_one(iface),
        }
    }
}

#[cfg(not(unix))]
fn apply_flags(ifaces: &mut [NetInterface]) {
    guess_flags(ifaces);
}

#[cfg_attr(not(unix), allow(dead_code))]
fn guess_flags(ifaces: &mut [NetInterface]) {
    for iface in ifaces.iter_mut() {
        guess_one(iface);
    }
}

/// Without OS flags: listed with an address means up; all-loopback addresses means loopback.
fn guess_one(iface: &mut NetInterface) {
    iface.up = !iface.ipv4.is_empty();
    iface.loopback = !iface.ipv4.is_empty() && iface.ipv4.iter().all(|ip| ip.is_loopback());
    iface.multicast = true;
}

#[cfg(target_os = "linux")]
fn read_mtu(name: &str) -> Option<u32> {
    std::fs::read_to_string(format!("/sys/class/net/{name}/mtu"))
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

#[cfg(not(target_os = "linux"))]
fn read_mtu(_name: &str) -> Option<u32> {
    None
}

/// One attempt in the join chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStep<'a> {
    /// (1) First up, non-loopback, multicast interface with IPv4.
    Preferred(&'a NetInterface),
    /// (2) Let the OS pick.
    DefaultRoute,
    /// (3) Any up, multicast interface, loopback included.
    Fallback(&'a NetInterface),
}

impl JoinStep<'_> {
    /// Local address to pass to `IP_ADD_MEMBERSHIP`.
    pub fn local_addr(&self) -> Ipv4Addr {
        match self {
            JoinStep::Preferred(i) | JoinStep::Fallback(i) => {
                i.ipv4.first().copied().unwrap_or(Ipv4Addr::UNSPECIFIED)
            }
            JoinStep::DefaultRoute => Ipv4Addr::UNSPECIFIED,
        }
    }

    fn joined_via(&self) -> JoinedVia {
        match self {
            JoinStep::Preferred(i) | JoinStep::Fallback(i) => JoinedVia::Interface((*i).clone()),
            JoinStep::DefaultRoute => JoinedVia::DefaultRoute,
        }
    }
}

/// Ordered attempts, first success wins. The preferred interface is not retried in step (3).
pub fn join_plan(ifaces: &[NetInterface]) -> Vec<JoinStep<'_>> {
    let preferred = ifaces.iter().find(|i| i.is_preferred());
    let mut plan = Vec::with_capacity(ifaces.len() + 2);
    if let Some(p) = preferred {
        plan.push(JoinStep::Preferred(p));
    }
    plan.push(JoinStep::DefaultRoute);
    plan.extend(
        ifaces
            .iter()
            .filter(|i| i.is_fallback())
            .filter(|i| preferred.map_or(true, |p| p.name != i.name))
            .map(JoinStep::Fallback),
    );
    plan
}

/// Walk the plan, calling `join` with each step's local address until one succeeds.
pub fn join_with_fallback<F>(ifaces: &[NetInterface], mut join: F) -> Option<JoinedVia>
where
    F: FnMut(Ipv4Addr) -> io::Result<()>,
{
    for step in join_plan(ifaces) {
        let local = step.local_addr();
        match join(local) {
            Ok(()) => return Some(step.joined_via()),
            Err(e) => debug!(?step, %local, "multicast join failed: {}", e),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str, ip: [u8; 4], loopback: bool, up: bool, multicast: bool) -> NetInterface {
        NetInterface {
            name: name.into(),
            index: 1,
            mac: None,
            ipv4: vec![Ipv4Addr::from(ip)],
            mtu: Some(1500),
            up,
            loopback,
            multicast,
        }
    }

    #[test]
    fn plan_prefers_real_interface() {
        let ifaces = vec![
            iface("lo", [127, 0, 0, 1], true, true, true),
            iface("docker0", [172, 17, 0, 1], false, false, true),
            iface("eth0", [192, 168, 1, 5], false, true, true),
            iface("wlan0", [10, 0, 0, 7], false, true, true),
        ];
        let plan = join_plan(&ifaces);
        assert_eq!(plan[0], JoinStep::Preferred(&ifaces[2]));
        assert_eq!(plan[1], JoinStep::DefaultRoute);
        assert_eq!(
            &plan[2..],
            &[JoinStep::Fallback(&ifaces[0]), JoinStep::Fallback(&ifaces[3])]
        );
    }

    #[test]
    fn plan_without_candidates_starts_with_default() {
        let ifaces = vec![iface("lo", [127, 0, 0, 1], true, true, true)];
        let plan = join_plan(&ifaces);
        assert_eq!(
            plan,
            vec![JoinStep::DefaultRoute, JoinStep::Fallback(&ifaces[0])]
        );
        assert_eq!(join_plan(&[]), vec![JoinStep::DefaultRoute]);
    }

    #[test]
    fn interface_without_ipv4_is_skipped() {
        let mut v6_only = iface("eth1", [0, 0, 0, 0], false, true, true);
        v6_only.ipv4.clear();
        let plan = join_plan(std::slice::from_ref(&v6_only));
        assert_eq!(plan, vec![JoinStep::DefaultRoute]);
    }

    #[test]
    fn fallback_chain_stops_at_first_success() {
        let ifaces = vec![
            iface("eth0", [192, 168, 1, 5], false, true, true),
            iface("lo", [127, 0, 0, 1], true, true, true),
        ];
        let mut tried = Vec::new();
        let joined = join_with_fallback(&ifaces, |local| {
            tried.push(local);
            if local.is_loopback() {
                Ok(())
            } else {
                Err(io::Error::new(io::ErrorKind::Other, "no route"))
            }
        });
        assert_eq!(
            tried,
            vec![
                Ipv4Addr::new(192, 168, 1, 5),
                Ipv4Addr::UNSPECIFIED,
                Ipv4Addr::LOCALHOST
            ]
        );
        assert_eq!(joined, Some(JoinedVia::Interface(ifaces[1].clone())));
    }

    #[test]
    fn default_route_used_when_preferred_fails() {
        let ifaces = vec![iface("eth0", [192, 168, 1, 5], false, true, true)];
        let joined = join_with_fallback(&ifaces, |local| {
            if local.is_unspecified() {
                Ok(())
            } else {
                Err(io::Error::new(io::ErrorKind::Other, "denied"))
            }
        });
        assert_eq!(joined, Some(JoinedVia::DefaultRoute));
    }

    #[test]
    fn all_failures_yield_none() {
        let ifaces = vec![iface("eth0", [192, 168, 1, 5], false, true, true)];
        let joined =
            join_with_fallback(&ifaces, |_| Err(io::Error::new(io::ErrorKind::Other, "x")));
        assert_eq!(joined, None);
    }

    #[test]
    fn status_line_mentions_interface_details() {
        let mut i = iface("eth0", [192, 168, 1, 5], false, true, true);
        i.mac = Some("AA:BB:CC:DD:EE:FF".into());
        let s = JoinedVia::Interface(i).to_string();
        assert!(s.contains("eth0"));
        assert!(s.contains("192.168.1.5"));
        assert!(s.contains("MTU: 1500"));
        assert!(s.contains("AA:BB:CC:DD:EE:FF"));
    }
}
