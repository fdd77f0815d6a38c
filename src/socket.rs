// Copyright 2021 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Raw socket lifecycle for the three probe modes.
//!
//! Sockets open lazily, one per target, and close on any error; the engine
//! retries the open on the next tick. All sockets are close-on-exec.
//!
//! Source address selection: an explicit `sourceip` wins; otherwise IPv4
//! takes the device's current address from the interface table (aliases
//! like `eth0:1` show up there by label) and IPv6 asks the kernel by
//! connecting a throwaway datagram socket towards the destination. The
//! result is cached on the target and wiped on errors so a flapping
//! interface gets reprobed.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::ptr;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::arp::LinkIdentity;
use crate::config::ConnectionConfig;

// Not all of these made it into the libc crate; values are the Linux ABI.
const SOL_RAW: libc::c_int = 255;
const IPV6_CHECKSUM: libc::c_int = 7;
const ICMP6_FILTER: libc::c_int = 1;
const IPV6_RECVPKTINFO: libc::c_int = 49;
const IPV6_RECVHOPLIMIT: libc::c_int = 51;
const IPV6_RECVHOPOPTS: libc::c_int = 53;
const IPV6_RECVRTHDR: libc::c_int = 56;
const IPV6_RECVDSTOPTS: libc::c_int = 58;

const ICMP6_DST_UNREACH: u8 = 1;
const ICMP6_PACKET_TOO_BIG: u8 = 2;
const ICMP6_TIME_EXCEEDED: u8 = 3;
const ICMP6_PARAM_PROB: u8 = 4;
const ICMP6_ECHO_REPLY: u8 = 129;

pub enum ProbeSocket {
    IcmpV4(Socket),
    IcmpV6 {
        sock: Socket,
        /// When a device is configured, its ifindex goes out as
        /// `IPV6_PKTINFO` control data on every send.
        ifindex: Option<u32>,
    },
    Arp {
        sock: Socket,
        link: LinkIdentity,
    },
}

impl ProbeSocket {
    pub fn raw(&self) -> &Socket {
        match self {
            ProbeSocket::IcmpV4(sock) => sock,
            ProbeSocket::IcmpV6 { sock, .. } => sock,
            ProbeSocket::Arp { sock, .. } => sock,
        }
    }

    pub fn is_arp(&self) -> bool {
        matches!(self, ProbeSocket::Arp { .. })
    }
}

fn other(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::Other, msg)
}

/// A device name with a `:` is a virtual alias; those cannot be bound with
/// `SO_BINDTODEVICE`, the address bind covers them instead.
fn bindable_device(cfg: &ConnectionConfig) -> Option<&str> {
    match cfg.device.as_deref() {
        Some(dev) if !dev.is_empty() && !dev.contains(':') => Some(dev),
        _ => None,
    }
}

fn setsockopt_i32(fd: libc::c_int, level: libc::c_int, opt: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let res = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if res == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// The ICMPv6 type filter: a 256-bit block mask, set bit = blocked.
struct Icmp6Filter {
    data: [u32; 8],
}

impl Icmp6Filter {
    fn block_all() -> Self {
        Self { data: [!0u32; 8] }
    }

    fn pass(&mut self, ty: u8) {
        self.data[usize::from(ty) >> 5] &= !(1u32 << (u32::from(ty) & 31));
    }

    fn apply(&self, fd: libc::c_int) -> io::Result<()> {
        let res = unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_ICMPV6,
                ICMP6_FILTER,
                self.data.as_ptr() as *const libc::c_void,
                mem::size_of_val(&self.data) as libc::socklen_t,
            )
        };
        if res == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

/// Open and configure the raw echo socket for one connection.
pub fn open_icmp(cfg: &ConnectionConfig, cached_src: &mut Option<IpAddr>) -> io::Result<ProbeSocket> {
    match cfg.resolved {
        IpAddr::V4(dst) => open_icmp_v4(cfg, cached_src, dst),
        IpAddr::V6(dst) => open_icmp_v6(cfg, cached_src, dst),
    }
}

fn open_icmp_v4(
    cfg: &ConnectionConfig,
    cached_src: &mut Option<IpAddr>,
    dst: Ipv4Addr,
) -> io::Result<ProbeSocket> {
    let sock = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;

    if let Some(ttl) = cfg.ttl {
        sock.set_multicast_ttl_v4(ttl)?;
        sock.set_ttl(ttl)?;
    }

    if let Some(device) = bindable_device(cfg) {
        sock.bind_device(Some(device.as_bytes()))?;
    }

    let src = probe_source_v4(cfg, cached_src, dst)?;
    *cached_src = Some(IpAddr::V4(src));
    sock.bind(&SockAddr::from(SocketAddr::new(IpAddr::V4(src), 0)))?;

    Ok(ProbeSocket::IcmpV4(sock))
}

fn open_icmp_v6(
    cfg: &ConnectionConfig,
    cached_src: &mut Option<IpAddr>,
    dst: Ipv6Addr,
) -> io::Result<ProbeSocket> {
    let sock = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6))?;
    let fd = sock.as_raw_fd();

    for opt in [
        IPV6_RECVHOPOPTS,
        IPV6_RECVDSTOPTS,
        IPV6_RECVRTHDR,
        IPV6_RECVPKTINFO,
        IPV6_RECVHOPLIMIT,
    ] {
        setsockopt_i32(fd, libc::IPPROTO_IPV6, opt, 1)?;
    }

    // offset of the checksum field within the echo header; the kernel
    // computes it on send
    setsockopt_i32(fd, SOL_RAW, IPV6_CHECKSUM, 2)?;

    let mut filter = Icmp6Filter::block_all();
    if setsockopt_i32(fd, libc::IPPROTO_IPV6, libc::IPV6_RECVERR, 1).is_err() {
        // kernels without IPV6_RECVERR report errors through the socket
        filter.pass(ICMP6_DST_UNREACH);
        filter.pass(ICMP6_PACKET_TOO_BIG);
        filter.pass(ICMP6_TIME_EXCEEDED);
        filter.pass(ICMP6_PARAM_PROB);
    }
    filter.pass(ICMP6_ECHO_REPLY);
    filter.apply(fd)?;

    if let Some(ttl) = cfg.ttl {
        sock.set_multicast_hops_v6(ttl)?;
        sock.set_unicast_hops_v6(ttl)?;
    }

    let src = probe_source_v6(cfg, cached_src, dst)?;
    *cached_src = Some(IpAddr::V6(src));
    if cfg.source_addr.is_some() {
        sock.bind(&SockAddr::from(SocketAddr::new(IpAddr::V6(src), 0)))?;
    }

    let ifindex = match bindable_device(cfg) {
        Some(device) => Some(
            nix::net::if_::if_nametoindex(device)
                .map_err(|e| other(format!("unknown iface \"{}\": {}", device, e)))?,
        ),
        None => None,
    };

    Ok(ProbeSocket::IcmpV6 { sock, ifindex })
}

/// Open the packet socket for ARP probing. The interface must be up,
/// ARP-capable and carry a 6-byte link-layer address.
pub fn open_arp(cfg: &ConnectionConfig, cached_src: &mut Option<IpAddr>) -> io::Result<ProbeSocket> {
    let dst = match cfg.resolved {
        IpAddr::V4(dst) => dst,
        IpAddr::V6(_) => return Err(other("arp probing needs an ipv4 target".to_string())),
    };
    let device = match cfg.device.as_deref() {
        Some(dev) if !dev.is_empty() => dev,
        _ => return Err(other("arp probing needs a device".to_string())),
    };

    let iface = pnet::datalink::interfaces()
        .into_iter()
        .find(|i| i.name == device)
        .ok_or_else(|| other(format!("unknown iface \"{}\"", device)))?;
    if !iface.is_up() {
        return Err(other(format!("interface \"{}\" is down", device)));
    }
    if iface.flags & (libc::IFF_NOARP | libc::IFF_LOOPBACK) as u32 != 0 {
        return Err(other(format!("interface \"{}\" is not ARPable", device)));
    }

    let sock = Socket::new(Domain::PACKET, Type::DGRAM, None)?;

    let mut bind_sll: libc::sockaddr_ll = unsafe { mem::zeroed() };
    bind_sll.sll_family = libc::AF_PACKET as libc::sa_family_t;
    bind_sll.sll_protocol = (libc::ETH_P_ARP as u16).to_be();
    bind_sll.sll_ifindex = iface.index as libc::c_int;
    sock.bind(&sockaddr_from_ll(&bind_sll))?;

    // read the link-layer identity back from the bound socket
    let local = sock.local_addr()?;
    let me = unsafe { *(local.as_ptr() as *const libc::sockaddr_ll) };
    if me.sll_halen == 0 {
        return Err(other(format!(
            "interface \"{}\" is not ARPable (no ll address)",
            device
        )));
    }
    if me.sll_halen != 6 {
        return Err(other(format!(
            "interface \"{}\" has an unsupported link-layer address length {}",
            device, me.sll_halen
        )));
    }

    let src = probe_source_v4(cfg, cached_src, dst)?;
    if src.is_unspecified() {
        return Err(other(format!("no source address for {}", cfg.name)));
    }
    *cached_src = Some(IpAddr::V4(src));

    let link = LinkIdentity {
        ifindex: iface.index,
        hatype: me.sll_hatype,
        mac: pnet::util::MacAddr::new(
            me.sll_addr[0],
            me.sll_addr[1],
            me.sll_addr[2],
            me.sll_addr[3],
            me.sll_addr[4],
            me.sll_addr[5],
        ),
    };

    Ok(ProbeSocket::Arp { sock, link })
}

/// Hardware-broadcast destination for outgoing ARP requests.
pub fn arp_broadcast_addr(link: &LinkIdentity) -> SockAddr {
    let mut sll: libc::sockaddr_ll = unsafe { mem::zeroed() };
    sll.sll_family = libc::AF_PACKET as libc::sa_family_t;
    sll.sll_protocol = (libc::ETH_P_ARP as u16).to_be();
    sll.sll_ifindex = link.ifindex as libc::c_int;
    sll.sll_halen = 6;
    sll.sll_addr[..6].copy_from_slice(&[0xff; 6]);
    sockaddr_from_ll(&sll)
}

/// Packet type of a received datagram (host, broadcast, ...), if the sender
/// address is a packet-family one.
pub fn packet_type(addr: &SockAddr) -> Option<u8> {
    if i32::from(addr.family()) != libc::AF_PACKET {
        return None;
    }
    let sll = unsafe { &*(addr.as_ptr() as *const libc::sockaddr_ll) };
    Some(sll.sll_pkttype)
}

fn sockaddr_from_ll(sll: &libc::sockaddr_ll) -> SockAddr {
    let len = mem::size_of::<libc::sockaddr_ll>();
    let ((), addr) = unsafe {
        SockAddr::try_init(|storage, storage_len| {
            ptr::copy_nonoverlapping(
                sll as *const libc::sockaddr_ll as *const u8,
                storage as *mut u8,
                len,
            );
            *storage_len = len as libc::socklen_t;
            Ok(())
        })
    }
    .unwrap();
    addr
}

fn probe_source_v4(
    cfg: &ConnectionConfig,
    cached: &Option<IpAddr>,
    dst: Ipv4Addr,
) -> io::Result<Ipv4Addr> {
    if let Some(IpAddr::V4(ip)) = cfg.source_addr {
        return Ok(ip);
    }
    if let Some(IpAddr::V4(ip)) = cached {
        return Ok(*ip);
    }
    if let Some(device) = cfg.device.as_deref().filter(|d| !d.is_empty()) {
        info!("probing IP address of device \"{}\"", device);
        for iface in pnet::datalink::interfaces() {
            if iface.name != device {
                continue;
            }
            for net in &iface.ips {
                if let IpAddr::V4(v4) = net.ip() {
                    info!("device \"{}\" has address \"{}\"", device, v4);
                    return Ok(v4);
                }
            }
        }
        return Err(other(format!("no IPv4 address on device \"{}\"", device)));
    }
    // no device configured: let the routing table pick
    let probe = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    probe.connect(&SockAddr::from(SocketAddr::new(IpAddr::V4(dst), 1025)))?;
    match probe.local_addr()?.as_socket() {
        Some(SocketAddr::V4(local)) => Ok(*local.ip()),
        _ => Err(other("source probe returned no address".to_string())),
    }
}

fn probe_source_v6(
    cfg: &ConnectionConfig,
    cached: &Option<IpAddr>,
    dst: Ipv6Addr,
) -> io::Result<Ipv6Addr> {
    if let Some(IpAddr::V6(ip)) = cfg.source_addr {
        return Ok(ip);
    }
    if let Some(IpAddr::V6(ip)) = cached {
        return Ok(*ip);
    }
    let probe = Socket::new(Domain::IPV6, Type::DGRAM, None)?;
    if let Some(device) = bindable_device(cfg) {
        if let Err(e) = probe.bind_device(Some(device.as_bytes())) {
            info!(
                "source probe interface \"{}\" is ignored for {}: {}",
                device, cfg.name, e
            );
        }
    }
    probe.connect(&SockAddr::from(SocketAddr::new(IpAddr::V6(dst), 1025)))?;
    match probe.local_addr()?.as_socket() {
        Some(SocketAddr::V6(local)) => Ok(*local.ip()),
        _ => Err(other("source probe returned no address".to_string())),
    }
}
