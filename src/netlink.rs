//! Route-netlink facade: link creation and movement, addresses, routes and
//! traffic-control objects.
//!
//! Message construction is separated from socket I/O: builders return fully
//! formed `NetlinkMessage` values that tests can serialize and parse back
//! without a socket or privileges. A `Netlink` handle owns one blocking
//! route socket and must not be shared across threads; callers open a fresh
//! handle per operation batch.

use std::cell::Cell;
use std::net::IpAddr;

use netlink_packet_core::{
    NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP, NLM_F_EXCL,
    NLM_F_REQUEST,
};
use netlink_packet_route::address::nlas::Nla as AddressNla;
use netlink_packet_route::link::nlas::{Info, InfoData, InfoIpVlan, InfoKind, InfoMacVlan, Nla as LinkNla, VethInfo};
use netlink_packet_route::route::nlas::Nla as RouteNla;
use netlink_packet_route::tc::nlas::Nla as TcNla;
use netlink_packet_route::{
    AddressMessage, LinkMessage, RouteMessage, RtnlMessage, TcMessage, AF_INET, AF_INET6,
    IFF_UP, RTN_UNICAST, RTPROT_STATIC, RT_SCOPE_UNIVERSE, RT_TABLE_MAIN,
};
use netlink_packet_utils::nla::DefaultNla;
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};

use crate::error::{kind_from_errno, Error, ErrorKind, Result};

/// Handle arithmetic for traffic-control objects: `maj:min`.
pub fn tc_handle(maj: u16, min: u16) -> u32 {
    (u32::from(maj) << 16) | u32::from(min)
}

pub fn tc_major(handle: u32) -> u16 {
    (handle >> 16) as u16
}

/// Kernel sentinel for the root of a qdisc hierarchy.
pub const TC_ROOT_HANDLE: u32 = 0xFFFF_FFFF;

/// Priority of the cgroup classifier attached to container-facing qdiscs.
pub const CGROUP_FILTER_PRIO: u16 = 10;

const TCA_OPTIONS: u16 = 2;
const TCA_HTB_PARMS: u16 = 1;
const TCA_HTB_INIT: u16 = 2;
const HTB_VERSION: u32 = 3;
const HTB_RATE_TO_QUANTUM: u32 = 10;

/// ipvlan operating modes, as the kernel numbers them.
pub fn ipvlan_mode(name: &str) -> Result<u16> {
    match name {
        "l2" => Ok(0),
        "" | "l3" => Ok(1),
        "l3s" => Ok(2),
        _ => Err(Error::new(
            ErrorKind::InvalidValue,
            format!("invalid ipvlan mode {}", name),
        )),
    }
}

/// macvlan operating modes, as the kernel numbers them.
pub fn macvlan_mode(name: &str) -> Result<u32> {
    match name {
        "private" => Ok(1),
        "vepa" => Ok(2),
        "" | "bridge" => Ok(4),
        "passthru" => Ok(8),
        _ => Err(Error::new(
            ErrorKind::InvalidValue,
            format!("invalid macvlan mode {}", name),
        )),
    }
}

/// Parse `aa:bb:cc:dd:ee:ff` into raw bytes.
pub fn parse_hw(hw: &str) -> Result<Vec<u8>> {
    let bytes: Vec<u8> = hw
        .split(':')
        .map(|octet| u8::from_str_radix(octet, 16))
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| Error::new(ErrorKind::InvalidValue, format!("invalid hw address {}", hw)))?;
    if bytes.len() != 6 {
        return Err(Error::new(
            ErrorKind::InvalidValue,
            format!("invalid hw address {}", hw),
        ));
    }
    Ok(bytes)
}

#[derive(Debug, Clone)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub flags: u32,
    pub qdisc: Option<String>,
}

impl Link {
    pub fn is_up(&self) -> bool {
        self.flags & IFF_UP != 0
    }

    /// Links with a real egress queue are default-gateway candidates;
    /// loopback and the like report "noqueue".
    pub fn has_queue(&self) -> bool {
        matches!(self.qdisc.as_deref(), Some(q) if q != "noqueue" && q != "noop")
    }
}

// --- message builders ------------------------------------------------------

fn request(msg: RtnlMessage, flags: u16) -> NetlinkMessage<RtnlMessage> {
    let mut packet = NetlinkMessage::from(msg);
    packet.header.flags = flags;
    packet.finalize();
    packet
}

fn create_flags() -> u16 {
    NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL
}

pub fn build_link_dump() -> NetlinkMessage<RtnlMessage> {
    request(
        RtnlMessage::GetLink(LinkMessage::default()),
        NLM_F_REQUEST | NLM_F_DUMP,
    )
}

pub fn build_link_up(index: u32) -> NetlinkMessage<RtnlMessage> {
    let mut link = LinkMessage::default();
    link.header.index = index;
    link.header.flags |= IFF_UP;
    link.header.change_mask |= IFF_UP;
    request(RtnlMessage::SetLink(link), NLM_F_REQUEST | NLM_F_ACK)
}

/// Rename a link and move it into the network namespace of `ns_pid` in one
/// transaction, so the target namespace never sees the transient name.
pub fn build_link_move(index: u32, new_name: &str, ns_pid: i32) -> NetlinkMessage<RtnlMessage> {
    let mut link = LinkMessage::default();
    link.header.index = index;
    link.nlas.push(LinkNla::IfName(new_name.to_owned()));
    link.nlas.push(LinkNla::NetNsPid(ns_pid as u32));
    request(RtnlMessage::SetLink(link), NLM_F_REQUEST | NLM_F_ACK)
}

pub fn build_link_del(index: u32) -> NetlinkMessage<RtnlMessage> {
    let mut link = LinkMessage::default();
    link.header.index = index;
    request(RtnlMessage::DelLink(link), NLM_F_REQUEST | NLM_F_ACK)
}

pub fn build_ipvlan(
    name: &str,
    master_index: u32,
    mode: u16,
    mtu: Option<u32>,
) -> NetlinkMessage<RtnlMessage> {
    let mut link = LinkMessage::default();
    link.nlas.push(LinkNla::IfName(name.to_owned()));
    link.nlas.push(LinkNla::Link(master_index));
    if let Some(mtu) = mtu {
        link.nlas.push(LinkNla::Mtu(mtu));
    }
    link.nlas.push(LinkNla::Info(vec![
        Info::Kind(InfoKind::IpVlan),
        Info::Data(InfoData::IpVlan(vec![InfoIpVlan::Mode(mode)])),
    ]));
    request(RtnlMessage::NewLink(link), create_flags())
}

pub fn build_macvlan(
    name: &str,
    master_index: u32,
    mode: u32,
    hw: &[u8],
    mtu: Option<u32>,
) -> NetlinkMessage<RtnlMessage> {
    let mut link = LinkMessage::default();
    link.nlas.push(LinkNla::IfName(name.to_owned()));
    link.nlas.push(LinkNla::Link(master_index));
    link.nlas.push(LinkNla::Address(hw.to_vec()));
    if let Some(mtu) = mtu {
        link.nlas.push(LinkNla::Mtu(mtu));
    }
    link.nlas.push(LinkNla::Info(vec![
        Info::Kind(InfoKind::MacVlan),
        Info::Data(InfoData::MacVlan(vec![InfoMacVlan::Mode(mode)])),
    ]));
    request(RtnlMessage::NewLink(link), create_flags())
}

/// Veth pair: `name` is created directly inside the namespace of `ns_pid`
/// with the requested hardware address, `peer` stays on the host enslaved
/// to `bridge_index`.
pub fn build_veth(
    name: &str,
    peer: &str,
    hw: &[u8],
    mtu: Option<u32>,
    bridge_index: u32,
    ns_pid: i32,
) -> NetlinkMessage<RtnlMessage> {
    let mut inner = LinkMessage::default();
    inner.nlas.push(LinkNla::IfName(name.to_owned()));
    inner.nlas.push(LinkNla::Address(hw.to_vec()));
    inner.nlas.push(LinkNla::NetNsPid(ns_pid as u32));
    if let Some(mtu) = mtu {
        inner.nlas.push(LinkNla::Mtu(mtu));
    }

    let mut link = LinkMessage::default();
    link.header.flags |= IFF_UP;
    link.header.change_mask |= IFF_UP;
    link.nlas.push(LinkNla::IfName(peer.to_owned()));
    link.nlas.push(LinkNla::Master(bridge_index));
    if let Some(mtu) = mtu {
        link.nlas.push(LinkNla::Mtu(mtu));
    }
    link.nlas.push(LinkNla::Info(vec![
        Info::Kind(InfoKind::Veth),
        Info::Data(InfoData::Veth(VethInfo::Peer(inner))),
    ]));
    request(RtnlMessage::NewLink(link), create_flags())
}

pub fn build_address(index: u32, addr: IpAddr, prefix: u8) -> NetlinkMessage<RtnlMessage> {
    let mut message = AddressMessage::default();
    message.header.index = index;
    message.header.prefix_len = prefix;
    message.header.scope = RT_SCOPE_UNIVERSE;
    let bytes = match addr {
        IpAddr::V4(v4) => {
            message.header.family = AF_INET as u8;
            v4.octets().to_vec()
        }
        IpAddr::V6(v6) => {
            message.header.family = AF_INET6 as u8;
            v6.octets().to_vec()
        }
    };
    message.nlas.push(AddressNla::Local(bytes.clone()));
    message.nlas.push(AddressNla::Address(bytes));
    request(RtnlMessage::NewAddress(message), create_flags())
}

pub fn build_default_route(index: u32, gw: IpAddr) -> NetlinkMessage<RtnlMessage> {
    let mut message = RouteMessage::default();
    message.header.table = RT_TABLE_MAIN;
    message.header.protocol = RTPROT_STATIC;
    message.header.scope = RT_SCOPE_UNIVERSE;
    message.header.kind = RTN_UNICAST;
    message.header.destination_prefix_length = 0;
    let bytes = match gw {
        IpAddr::V4(v4) => {
            message.header.address_family = AF_INET as u8;
            v4.octets().to_vec()
        }
        IpAddr::V6(v6) => {
            message.header.address_family = AF_INET6 as u8;
            v6.octets().to_vec()
        }
    };
    message.nlas.push(RouteNla::Gateway(bytes));
    message.nlas.push(RouteNla::Oif(index));
    request(
        RtnlMessage::NewRoute(message),
        NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE,
    )
}

// Attribute encoding for HTB objects; the route crate has no typed support
// for qdisc options, so the nested TCA_OPTIONS payload is laid out by hand
// following linux/pkt_sched.h.

fn nested_attr(kind: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    let len = 4 + payload.len() as u16;
    out.extend_from_slice(&len.to_ne_bytes());
    out.extend_from_slice(&kind.to_ne_bytes());
    out.extend_from_slice(payload);
    while out.len() % 4 != 0 {
        out.push(0);
    }
    out
}

/// struct tc_ratespec, with the rate in bytes per second.
fn tc_ratespec(rate: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    out.push(0); // cell_log
    out.push(0); // linklayer
    out.extend_from_slice(&0u16.to_ne_bytes()); // overhead
    out.extend_from_slice(&0i16.to_ne_bytes()); // cell_align
    out.extend_from_slice(&0u16.to_ne_bytes()); // mpu
    out.extend_from_slice(&rate.to_ne_bytes());
    out
}

// One MTU floor so slow classes can still emit full frames.
fn tc_burst(rate: u32) -> u32 {
    (rate / 800).max(1600)
}

pub fn build_htb_qdisc(index: u32, handle: u32, default_minor: u16) -> NetlinkMessage<RtnlMessage> {
    // struct tc_htb_glob
    let mut glob = Vec::with_capacity(20);
    glob.extend_from_slice(&HTB_VERSION.to_ne_bytes());
    glob.extend_from_slice(&HTB_RATE_TO_QUANTUM.to_ne_bytes());
    glob.extend_from_slice(&u32::from(default_minor).to_ne_bytes());
    glob.extend_from_slice(&0u32.to_ne_bytes()); // debug
    glob.extend_from_slice(&0u32.to_ne_bytes()); // direct_pkts

    let mut message = TcMessage::default();
    message.header.index = index as i32;
    message.header.handle = handle;
    message.header.parent = TC_ROOT_HANDLE;
    message.nlas.push(TcNla::Kind("htb".to_owned()));
    message.nlas.push(TcNla::Other(DefaultNla::new(
        TCA_OPTIONS,
        nested_attr(TCA_HTB_INIT, &glob),
    )));
    request(RtnlMessage::NewQueueDiscipline(message), create_flags())
}

pub fn build_htb_class(
    index: u32,
    parent: u32,
    handle: u32,
    prio: u32,
    rate: u32,
    ceil: u32,
) -> NetlinkMessage<RtnlMessage> {
    // struct tc_htb_opt
    let mut opt = Vec::with_capacity(44);
    opt.extend_from_slice(&tc_ratespec(rate));
    opt.extend_from_slice(&tc_ratespec(ceil));
    opt.extend_from_slice(&tc_burst(rate).to_ne_bytes()); // buffer
    opt.extend_from_slice(&tc_burst(ceil).to_ne_bytes()); // cbuffer
    opt.extend_from_slice(&0u32.to_ne_bytes()); // quantum, derived from rate2quantum
    opt.extend_from_slice(&0u32.to_ne_bytes()); // level
    opt.extend_from_slice(&prio.to_ne_bytes());

    let mut message = TcMessage::default();
    message.header.index = index as i32;
    message.header.handle = handle;
    message.header.parent = parent;
    message.nlas.push(TcNla::Kind("htb".to_owned()));
    message.nlas.push(TcNla::Other(DefaultNla::new(
        TCA_OPTIONS,
        nested_attr(TCA_HTB_PARMS, &opt),
    )));
    request(RtnlMessage::NewTrafficClass(message), create_flags())
}

/// Classifier that routes packets to HTB classes by the sender's
/// net_cls.classid.
pub fn build_cgroup_filter(index: u32, parent: u32) -> NetlinkMessage<RtnlMessage> {
    let mut message = TcMessage::default();
    message.header.index = index as i32;
    message.header.parent = parent;
    message.header.info =
        (u32::from(CGROUP_FILTER_PRIO) << 16) | u32::from((libc::ETH_P_ALL as u16).to_be());
    message.nlas.push(TcNla::Kind("cgroup".to_owned()));
    request(RtnlMessage::NewTrafficFilter(message), create_flags())
}

pub fn serialize(message: &NetlinkMessage<RtnlMessage>) -> Vec<u8> {
    let mut buf = vec![0u8; message.buffer_len()];
    message.serialize(&mut buf[..]);
    buf
}

// --- socket ----------------------------------------------------------------

pub struct Netlink {
    socket: Socket,
    seq: Cell<u32>,
}

impl Netlink {
    pub fn open() -> Result<Netlink> {
        let socket = Socket::new(NETLINK_ROUTE)
            .map_err(|e| Error::from(e).wrap("open netlink route socket"))?;
        socket
            .connect(&SocketAddr::new(0, 0))
            .map_err(|e| Error::from(e).wrap("connect netlink route socket"))?;
        Ok(Netlink {
            socket,
            seq: Cell::new(0),
        })
    }

    fn next_seq(&self) -> u32 {
        let seq = self.seq.get().wrapping_add(1);
        self.seq.set(seq);
        seq
    }

    /// Send one request and collect the response: dumped inner messages, a
    /// terminating ack/done, or a kernel error mapped through errno.
    fn request(&self, mut message: NetlinkMessage<RtnlMessage>) -> Result<Vec<RtnlMessage>> {
        message.header.sequence_number = self.next_seq();
        message.finalize();
        let buf = serialize(&message);
        self.socket
            .send(&buf, 0)
            .map_err(|e| Error::from(e).wrap("send netlink request"))?;

        let mut collected = Vec::new();
        loop {
            let mut recv_buf = vec![0u8; 8192];
            let n = self
                .socket
                .recv(&mut &mut recv_buf[..], 0)
                .map_err(|e| Error::from(e).wrap("recv netlink response"))?;

            let mut offset = 0;
            while offset < n {
                let reply = NetlinkMessage::<RtnlMessage>::deserialize(&recv_buf[offset..n])
                    .map_err(|e| {
                        Error::new(ErrorKind::Unknown, format!("parse netlink reply: {}", e))
                    })?;
                let len = reply.header.length as usize;

                match reply.payload {
                    NetlinkPayload::Error(err) if err.code != 0 => {
                        let errno = -err.code;
                        return Err(Error::os(
                            kind_from_errno(errno),
                            errno,
                            "netlink request failed",
                        ));
                    }
                    NetlinkPayload::Error(_) | NetlinkPayload::Ack(_) => return Ok(collected),
                    NetlinkPayload::Done => return Ok(collected),
                    NetlinkPayload::InnerMessage(inner) => collected.push(inner),
                    _ => {}
                }

                if len == 0 {
                    break;
                }
                offset += len;
            }

            // A multipart dump continues in the next datagram.
            if message.header.flags & NLM_F_DUMP == 0 {
                return Ok(collected);
            }
        }
    }

    fn execute(&self, message: NetlinkMessage<RtnlMessage>) -> Result<()> {
        self.request(message).map(|_| ())
    }

    pub fn links(&self) -> Result<Vec<Link>> {
        let replies = self.request(build_link_dump())?;
        let mut links = Vec::new();
        for reply in replies {
            if let RtnlMessage::NewLink(message) = reply {
                let mut name = String::new();
                let mut qdisc = None;
                for nla in &message.nlas {
                    match nla {
                        LinkNla::IfName(n) => name = n.clone(),
                        LinkNla::Qdisc(q) => qdisc = Some(q.clone()),
                        _ => {}
                    }
                }
                links.push(Link {
                    index: message.header.index,
                    name,
                    flags: message.header.flags,
                    qdisc,
                });
            }
        }
        Ok(links)
    }

    pub fn link_index(&self, name: &str) -> Result<u32> {
        self.links()?
            .into_iter()
            .find(|l| l.name == name)
            .map(|l| l.index)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("link {} not found", name)))
    }

    pub fn set_link_up(&self, index: u32) -> Result<()> {
        self.execute(build_link_up(index))
    }

    pub fn move_link(&self, index: u32, new_name: &str, ns_pid: i32) -> Result<()> {
        self.execute(build_link_move(index, new_name, ns_pid))
    }

    pub fn delete_link(&self, index: u32) -> Result<()> {
        self.execute(build_link_del(index))
    }

    pub fn add_ipvlan(&self, name: &str, master: u32, mode: u16, mtu: Option<u32>) -> Result<()> {
        self.execute(build_ipvlan(name, master, mode, mtu))
    }

    pub fn add_macvlan(
        &self,
        name: &str,
        master: u32,
        mode: u32,
        hw: &[u8],
        mtu: Option<u32>,
    ) -> Result<()> {
        self.execute(build_macvlan(name, master, mode, hw, mtu))
    }

    pub fn add_veth(
        &self,
        name: &str,
        peer: &str,
        hw: &[u8],
        mtu: Option<u32>,
        bridge: u32,
        ns_pid: i32,
    ) -> Result<()> {
        self.execute(build_veth(name, peer, hw, mtu, bridge, ns_pid))
    }

    pub fn add_address(&self, index: u32, addr: IpAddr, prefix: u8) -> Result<()> {
        self.execute(build_address(index, addr, prefix))
    }

    pub fn add_default_route(&self, index: u32, gw: IpAddr) -> Result<()> {
        self.execute(build_default_route(index, gw))
    }

    pub fn add_htb_qdisc(&self, index: u32, handle: u32, default_minor: u16) -> Result<()> {
        self.execute(build_htb_qdisc(index, handle, default_minor))
    }

    pub fn add_htb_class(
        &self,
        index: u32,
        parent: u32,
        handle: u32,
        prio: u32,
        rate: u32,
        ceil: u32,
    ) -> Result<()> {
        self.execute(build_htb_class(index, parent, handle, prio, rate, ceil))
    }

    pub fn add_cgroup_filter(&self, index: u32, parent: u32) -> Result<()> {
        self.execute(build_cgroup_filter(index, parent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: NetlinkMessage<RtnlMessage>) -> NetlinkMessage<RtnlMessage> {
        let mut message = message;
        message.finalize();
        let buf = serialize(&message);
        NetlinkMessage::<RtnlMessage>::deserialize(&buf).expect("round trip")
    }

    #[test]
    fn test_tc_handle_arithmetic() {
        assert_eq!(tc_handle(1, 0), 0x0001_0000);
        assert_eq!(tc_handle(1, 2), 0x0001_0002);
        assert_eq!(tc_major(tc_handle(0x1234, 7)), 0x1234);
    }

    #[test]
    fn test_parse_hw() {
        assert_eq!(
            parse_hw("02:aa:bb:cc:dd:ee").unwrap(),
            vec![0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]
        );
        assert!(parse_hw("02:aa:bb").is_err());
        assert!(parse_hw("zz:aa:bb:cc:dd:ee").is_err());
    }

    #[test]
    fn test_link_up_round_trip() {
        let got = round_trip(build_link_up(3));
        match got.payload {
            NetlinkPayload::InnerMessage(RtnlMessage::SetLink(link)) => {
                assert_eq!(link.header.index, 3);
                assert_eq!(link.header.flags & IFF_UP, IFF_UP);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_link_move_renames_into_namespace() {
        let got = round_trip(build_link_move(5, "eth0", 4242));
        match got.payload {
            NetlinkPayload::InnerMessage(RtnlMessage::SetLink(link)) => {
                assert!(link.nlas.contains(&LinkNla::IfName("eth0".into())));
                assert!(link.nlas.contains(&LinkNla::NetNsPid(4242)));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_veth_carries_peer_in_namespace() {
        let hw = parse_hw("02:11:22:33:44:55").unwrap();
        let got = round_trip(build_veth("eth0", "vp0", &hw, Some(1400), 7, 999));
        let link = match got.payload {
            NetlinkPayload::InnerMessage(RtnlMessage::NewLink(link)) => link,
            other => panic!("unexpected payload {:?}", other),
        };
        assert!(link.nlas.contains(&LinkNla::IfName("vp0".into())));
        assert!(link.nlas.contains(&LinkNla::Master(7)));

        let info = link
            .nlas
            .iter()
            .find_map(|nla| match nla {
                LinkNla::Info(info) => Some(info),
                _ => None,
            })
            .expect("link info");
        assert!(info.contains(&Info::Kind(InfoKind::Veth)));
        let peer = info
            .iter()
            .find_map(|i| match i {
                Info::Data(InfoData::Veth(VethInfo::Peer(peer))) => Some(peer),
                _ => None,
            })
            .expect("veth peer");
        assert!(peer.nlas.contains(&LinkNla::IfName("eth0".into())));
        assert!(peer.nlas.contains(&LinkNla::NetNsPid(999)));
        assert!(peer.nlas.contains(&LinkNla::Address(hw)));
        assert!(peer.nlas.contains(&LinkNla::Mtu(1400)));
    }

    #[test]
    fn test_macvlan_mode_and_address() {
        let hw = parse_hw("02:00:00:00:00:01").unwrap();
        let got = round_trip(build_macvlan("pmv1", 2, macvlan_mode("bridge").unwrap(), &hw, None));
        let link = match got.payload {
            NetlinkPayload::InnerMessage(RtnlMessage::NewLink(link)) => link,
            other => panic!("unexpected payload {:?}", other),
        };
        assert!(link.nlas.contains(&LinkNla::Link(2)));
        assert!(link.nlas.contains(&LinkNla::Address(hw)));
        let info = link
            .nlas
            .iter()
            .find_map(|nla| match nla {
                LinkNla::Info(info) => Some(info),
                _ => None,
            })
            .expect("link info");
        assert!(info.contains(&Info::Kind(InfoKind::MacVlan)));
        assert!(info.contains(&Info::Data(InfoData::MacVlan(vec![InfoMacVlan::Mode(4)]))));
    }

    #[test]
    fn test_ipvlan_modes() {
        assert_eq!(ipvlan_mode("l2").unwrap(), 0);
        assert_eq!(ipvlan_mode("").unwrap(), 1);
        assert!(ipvlan_mode("bogus").is_err());

        let got = round_trip(build_ipvlan("piv1", 3, 1, Some(9000)));
        let link = match got.payload {
            NetlinkPayload::InnerMessage(RtnlMessage::NewLink(link)) => link,
            other => panic!("unexpected payload {:?}", other),
        };
        assert!(link.nlas.contains(&LinkNla::Mtu(9000)));
        let info = link
            .nlas
            .iter()
            .find_map(|nla| match nla {
                LinkNla::Info(info) => Some(info),
                _ => None,
            })
            .expect("link info");
        assert!(info.contains(&Info::Kind(InfoKind::IpVlan)));
    }

    #[test]
    fn test_address_v4() {
        let got = round_trip(build_address(4, "192.168.1.10".parse().unwrap(), 24));
        match got.payload {
            NetlinkPayload::InnerMessage(RtnlMessage::NewAddress(message)) => {
                assert_eq!(message.header.index, 4);
                assert_eq!(message.header.prefix_len, 24);
                assert_eq!(message.header.family, AF_INET as u8);
                assert!(message
                    .nlas
                    .contains(&AddressNla::Address(vec![192, 168, 1, 10])));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_default_route_via_gateway() {
        let got = round_trip(build_default_route(4, "192.168.1.1".parse().unwrap()));
        match got.payload {
            NetlinkPayload::InnerMessage(RtnlMessage::NewRoute(message)) => {
                assert_eq!(message.header.destination_prefix_length, 0);
                assert_eq!(message.header.table, RT_TABLE_MAIN);
                assert!(message.nlas.contains(&RouteNla::Gateway(vec![192, 168, 1, 1])));
                assert!(message.nlas.contains(&RouteNla::Oif(4)));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_htb_qdisc_options() {
        let got = round_trip(build_htb_qdisc(2, tc_handle(1, 0), 2));
        match got.payload {
            NetlinkPayload::InnerMessage(RtnlMessage::NewQueueDiscipline(message)) => {
                assert_eq!(message.header.parent, TC_ROOT_HANDLE);
                assert_eq!(message.header.handle, 0x0001_0000);
                assert!(message.nlas.contains(&TcNla::Kind("htb".into())));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_cgroup_filter_prio_and_kind() {
        let got = round_trip(build_cgroup_filter(2, tc_handle(1, 0)));
        match got.payload {
            NetlinkPayload::InnerMessage(RtnlMessage::NewTrafficFilter(message)) => {
                assert!(message.nlas.contains(&TcNla::Kind("cgroup".into())));
                assert_eq!(message.header.info >> 16, u32::from(CGROUP_FILTER_PRIO));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_nested_attr_alignment() {
        let attr = nested_attr(TCA_HTB_INIT, &[1, 2, 3, 4, 5]);
        assert_eq!(attr.len() % 4, 0);
        assert_eq!(u16::from_ne_bytes([attr[0], attr[1]]), 9);
        assert_eq!(u16::from_ne_bytes([attr[2], attr[3]]), TCA_HTB_INIT);
    }
}
