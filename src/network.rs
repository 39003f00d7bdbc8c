//! Container network construction.
//!
//! `isolate_net` runs in the intermediate process, outside the child's
//! network namespace, while the child is still blocked on the sync pipe: it
//! creates the configured links in the host namespace and moves them into
//! the child by pid. `enable_net` runs inside the child's namespace and
//! brings the moved links into service.

use nix::unistd::gettid;

use crate::error::Result;
use crate::netlink::{self, Link, Netlink};
use crate::process::env::TaskEnv;

/// Deterministic locally-administered unicast MAC, stable across restarts:
/// one CRC covers the host identity, the other the link identity.
pub fn derive_hw(host: &str, name: &str) -> String {
    let n = crc32fast::hash(name.as_bytes());
    let h = crc32fast::hash(host.as_bytes());
    format!(
        "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        n & 0xff,
        (h >> 24) & 0xff,
        (h >> 16) & 0xff,
        (h >> 8) & 0xff,
        h & 0xff
    )
}

fn hostname() -> String {
    nix::sys::utsname::uname()
        .expect("uname() failed")
        .nodename()
        .to_string_lossy()
        .into_owned()
}

/// Populate the network namespace of `child_pid` from the parent side.
/// Transient links are created under a tid-derived name so concurrent
/// starts cannot collide, then renamed while moving into the target
/// namespace. On failure the transient is removed before reporting.
pub fn isolate_net(env: &TaskEnv, child_pid: i32) -> Result<()> {
    let nl = Netlink::open()?;

    for host in &env.net.host {
        let index = nl.link_index(&host.dev)?;
        nl.move_link(index, &host.dev, child_pid)
            .map_err(|e| e.wrap(format!("move {} into container", host.dev)))?;
    }

    for ipvlan in &env.net.ipvlan {
        let transient = format!("piv{}", gettid());
        if let Ok(stale) = nl.link_index(&transient) {
            let _ = nl.delete_link(stale);
        }

        let master = nl.link_index(&ipvlan.master)?;
        let mode = netlink::ipvlan_mode(&ipvlan.mode)?;
        nl.add_ipvlan(&transient, master, mode, ipvlan.mtu)
            .map_err(|e| e.wrap(format!("create ipvlan {}@{}", ipvlan.name, ipvlan.master)))?;

        let index = nl.link_index(&transient)?;
        if let Err(e) = nl.move_link(index, &ipvlan.name, child_pid) {
            let _ = nl.delete_link(index);
            return Err(e.wrap(format!("move ipvlan {} into container", ipvlan.name)));
        }
    }

    let host = hostname();

    for mvlan in &env.net.macvlan {
        let transient = format!("pmv{}", gettid());
        if let Ok(stale) = nl.link_index(&transient) {
            let _ = nl.delete_link(stale);
        }

        let hw = if mvlan.hw.is_empty() {
            derive_hw(&host, &format!("{}{}", mvlan.master, mvlan.name))
        } else {
            mvlan.hw.clone()
        };
        log::debug!("using {} for {}@{}", hw, mvlan.name, mvlan.master);

        let master = nl.link_index(&mvlan.master)?;
        let mode = netlink::macvlan_mode(&mvlan.mode)?;
        nl.add_macvlan(&transient, master, mode, &netlink::parse_hw(&hw)?, mvlan.mtu)
            .map_err(|e| e.wrap(format!("create macvlan {}@{}", mvlan.name, mvlan.master)))?;

        let index = nl.link_index(&transient)?;
        if let Err(e) = nl.move_link(index, &mvlan.name, child_pid) {
            let _ = nl.delete_link(index);
            return Err(e.wrap(format!("move macvlan {} into container", mvlan.name)));
        }
    }

    for veth in &env.net.veth {
        let bridge = nl
            .link_index(&veth.bridge)
            .map_err(|e| e.wrap(format!("load bridge {}", veth.bridge)))?;

        let hw = if veth.hw.is_empty() {
            derive_hw(&host, &format!("{}{}", veth.name, veth.peer))
        } else {
            veth.hw.clone()
        };
        log::debug!("using {} for {} -> {}", hw, veth.name, veth.peer);

        nl.add_veth(
            &veth.name,
            &veth.peer,
            &netlink::parse_hw(&hw)?,
            veth.mtu,
            bridge,
            child_pid,
        )
        .map_err(|e| e.wrap(format!("create veth {} -> {}", veth.name, veth.peer)))?;
    }

    Ok(())
}

/// The first link with a real egress queue carries the default route.
fn elect_gateway(links: &[Link]) -> Option<u32> {
    links.iter().find(|l| l.has_queue()).map(|l| l.index)
}

/// Bring up every link visible inside the child's namespace, apply the
/// configured addresses and elect a default gateway device.
pub fn enable_net(env: &TaskEnv) -> Result<()> {
    let nl = Netlink::open()?;

    let links = nl.links()?;
    for link in &links {
        nl.set_link_up(link.index)
            .map_err(|e| e.wrap(format!("bring up {}", link.name)))?;

        if let Some(spec) = env.ip_map.get(&link.name) {
            nl.add_address(link.index, spec.addr, spec.prefix)
                .map_err(|e| e.wrap(format!("address {} on {}", spec.addr, link.name)))?;
        }
    }

    if let Some(gw) = env.default_gw {
        match elect_gateway(&links) {
            Some(index) => nl
                .add_default_route(index, gw)
                .map_err(|e| e.wrap(format!("default gateway {}", gw)))?,
            // The route is only set when an eligible device exists; the
            // container still starts without one.
            None => log::warn!("no device eligible for the default gateway {}", gw),
        }
    }

    Ok(())
}

/// Shaping rate applied to host uplinks when no explicit rate is configured:
/// effectively unlimited, the class exists so per-container classids have a
/// parent to hang from.
const DEFAULT_RATE: u32 = u32::MAX;

/// Install the HTB skeleton on host uplinks so container traffic, classified
/// by net_cls classid, can be shaped: root qdisc, one default class, and a
/// cgroup filter at a fixed priority.
pub fn prepare_shaping() -> Result<()> {
    let nl = Netlink::open()?;
    let root = netlink::tc_handle(1, 0);

    for link in nl.links()? {
        if !link.has_queue() {
            continue;
        }
        if let Err(e) = nl.add_htb_qdisc(link.index, root, 2) {
            // EEXIST from a previous daemon run is fine.
            if e.errno() != libc::EEXIST {
                log::warn!("cannot install qdisc on {}: {}", link.name, e);
            }
            continue;
        }
        if let Err(e) = nl
            .add_htb_class(
                link.index,
                root,
                netlink::tc_handle(1, 2),
                0,
                DEFAULT_RATE,
                DEFAULT_RATE,
            )
            .and_then(|_| nl.add_cgroup_filter(link.index, root))
        {
            log::warn!("cannot install traffic classes on {}: {}", link.name, e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    quickcheck::quickcheck! {
        fn prop_derive_hw_is_pure(host: String, name: String) -> bool {
            derive_hw(&host, &name) == derive_hw(&host, &name)
        }
    }

    #[test]
    fn test_derive_hw_format() {
        let hw = derive_hw("host1", "eth0veth0");
        assert_eq!(hw.len(), 17);
        // locally administered unicast prefix
        assert!(hw.starts_with("02:"));
        assert!(netlink::parse_hw(&hw).is_ok());
    }

    #[test]
    fn test_derive_hw_depends_on_both_inputs() {
        assert_ne!(derive_hw("host1", "eth0"), derive_hw("host2", "eth0"));
        assert_ne!(derive_hw("host1", "eth0"), derive_hw("host1", "eth1"));
    }

    fn link(index: u32, name: &str, qdisc: Option<&str>) -> Link {
        Link {
            index,
            name: name.to_owned(),
            flags: 0,
            qdisc: qdisc.map(str::to_owned),
        }
    }

    #[test]
    fn test_gateway_election_picks_first_queued_link() {
        let links = vec![
            link(1, "lo", Some("noqueue")),
            link(2, "eth0", Some("fq_codel")),
            link(3, "eth1", Some("mq")),
        ];
        assert_eq!(elect_gateway(&links), Some(2));
    }

    #[test]
    fn test_gateway_election_without_candidate_is_none() {
        // Matches the reference behavior: no eligible device means the
        // default route is simply not installed.
        assert_eq!(elect_gateway(&[]), None);
        let links = vec![link(1, "lo", Some("noqueue")), link(2, "dummy0", None)];
        assert_eq!(elect_gateway(&links), None);
    }
}
