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

//! The probe engine: paced sends, bounded-wait receive, reply demux.
//!
//! Raw ICMP sockets see every ICMP datagram on the host, so a reply for any
//! target can surface on any target's socket. Routing goes through the
//! dense id embedded in the probe payload, never through the socket the
//! datagram happened to arrive on. ARP sockets are per-interface and only
//! ever carry their own target's traffic.

use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr, SocketAddrV6};
use std::os::unix::io::{AsFd, AsRawFd};
use std::time::{Duration, SystemTime};

use nix::errno::Errno;
use nix::sys::select::{select, FdSet};
use nix::sys::time::{TimeVal, TimeValLike};
use socket2::SockAddr;

use crate::arp;
use crate::config::ConnectionConfig;
use crate::icmp::{self, ProbeData};
use crate::socket::{self, ProbeSocket};
use crate::target::Target;
use crate::timeutil;

/// Minimum spacing between sends across the whole target set, keeps a large
/// configuration from bursting onto the wire.
pub const MIN_PERHOST_INTERVAL: Duration = Duration::from_micros(20_000);

/// Ceiling on one receive wait.
pub const DEFAULT_SELECT_WAIT: Duration = Duration::from_millis(10);

// sll_pkttype values (linux/if_packet.h)
const PACKET_HOST: u8 = 0;
const PACKET_BROADCAST: u8 = 1;
const PACKET_MULTICAST: u8 = 2;

pub struct Engine {
    pub ident: u16,
    pub conns: Vec<ConnectionConfig>,
    pub targets: Vec<Target>,
    last_sent: Option<SystemTime>,
    /// Nothing has been sent yet; don't wait for replies that can't exist.
    started: bool,
}

impl Engine {
    pub fn new(conns: Vec<ConnectionConfig>, ident: u16) -> Self {
        let targets = conns
            .iter()
            .enumerate()
            .map(|(i, c)| Target::new(i as u16, c))
            .collect();
        Self {
            ident,
            conns,
            targets,
            last_sent: None,
            started: false,
        }
    }

    /// One pass over all connections: drain replies, then send a probe to
    /// every target whose pacing gates are both open.
    pub fn probe_cycle(&mut self) {
        let mut sent_any = false;
        for i in 0..self.conns.len() {
            if self.started {
                while self.recv_cycle() {}
            }

            let now = SystemTime::now();
            if let Some(last) = self.last_sent {
                if timeutil::less_than(now, last, MIN_PERHOST_INTERVAL) {
                    continue;
                }
            }
            if let Some(last) = self.targets[i].last_send_time {
                if timeutil::less_than(now, last, self.send_interval(i)) {
                    continue;
                }
            }

            self.ensure_socket(i);
            if self.send_probe(i, now) {
                self.last_sent = Some(now);
                self.started = true;
                sent_any = true;
            } else {
                trace!("probe send failed to {}", self.conns[i].name);
            }
        }
        if !self.started && !sent_any {
            // nothing in flight and nothing went out; don't spin while
            // every socket refuses to open
            std::thread::sleep(DEFAULT_SELECT_WAIT);
        }
    }

    /// Per-target send spacing; during an accelerated startup the first
    /// burst of probes goes out at the burst interval instead.
    fn send_interval(&self, i: usize) -> Duration {
        let cfg = &self.conns[i];
        let t = &self.targets[i];
        if cfg.startup_acceleration && t.num_sent < u64::from(cfg.startup_burst_pkts) {
            let us = cfg
                .startup_burst_interval_us
                .max(MIN_PERHOST_INTERVAL.as_micros() as u64);
            Duration::from_micros(us)
        } else {
            Duration::from_millis(u64::from(cfg.interval_ms))
        }
    }

    fn ensure_socket(&mut self, i: usize) {
        if self.targets[i].sock.is_some() {
            return;
        }
        let cfg = &self.conns[i];
        let mut cached = self.targets[i].src;
        let opened = if cfg.check_arp {
            socket::open_arp(cfg, &mut cached)
        } else {
            socket::open_icmp(cfg, &mut cached)
        };
        match opened {
            Ok(sock) => {
                self.targets[i].sock = Some(sock);
                self.targets[i].src = cached;
            }
            Err(e) => {
                debug!("could not open socket for {}: {}", cfg.name, e);
                self.targets[i].src = None;
            }
        }
    }

    /// Send one probe. The log slot is stamped and the sequence advances
    /// whether or not the send went out, so a run of send failures looks
    /// exactly like a run of missing replies.
    fn send_probe(&mut self, i: usize, now: SystemTime) -> bool {
        let cfg = &self.conns[i];
        let t = &mut self.targets[i];
        t.last_send_time = Some(now);

        let data = ProbeData::new(t.id, t.num_sent, now);
        let sent = match (&t.sock, cfg.resolved) {
            (None, _) => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "socket not open",
            )),
            (Some(ProbeSocket::IcmpV4(sock)), IpAddr::V4(dst)) => {
                let packet = icmp::build_echo_request_v4(self.ident, t.seq, &data);
                let addr = SockAddr::from(SocketAddr::new(IpAddr::V4(dst), 0));
                sock.send_to(&packet, &addr).and_then(|n| {
                    if n == packet.len() {
                        Ok(())
                    } else {
                        Err(io::Error::new(io::ErrorKind::Other, "short send"))
                    }
                })
            }
            (Some(ProbeSocket::IcmpV6 { sock, ifindex }), IpAddr::V6(dst)) => {
                let packet = icmp::build_echo_request_v6(self.ident, t.seq, &data);
                send_v6(sock, *ifindex, dst, &packet)
            }
            (Some(ProbeSocket::Arp { sock, link }), IpAddr::V4(dst)) => {
                match t.src {
                    Some(IpAddr::V4(src)) => {
                        let packet = arp::build_request(link, src, dst);
                        let addr = socket::arp_broadcast_addr(link);
                        sock.send_to(&packet, &addr).and_then(|n| {
                            if n == packet.len() {
                                Ok(())
                            } else {
                                Err(io::Error::new(io::ErrorKind::Other, "short send"))
                            }
                        })
                    }
                    _ => Err(io::Error::new(
                        io::ErrorKind::AddrNotAvailable,
                        "no source address",
                    )),
                }
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "socket family does not match target",
            )),
        };

        let error = match sent {
            Ok(()) => false,
            Err(e) => {
                trace!(
                    "probe send failed to {} on {}: {}",
                    cfg.name,
                    cfg.device.as_deref().unwrap_or("-"),
                    e
                );
                t.sock = None;
                true
            }
        };

        t.log.stamp(t.seq, now, error);
        t.advance_seq();
        !error
    }

    /// Wait up to [`DEFAULT_SELECT_WAIT`] for one datagram on any open
    /// probe socket, demultiplex it, and say whether anything arrived. The
    /// caller loops until a quiet wait.
    pub fn recv_cycle(&mut self) -> bool {
        if !self.targets.iter().any(|t| t.sock.is_some()) {
            // nothing to watch; don't spin
            std::thread::sleep(Duration::from_secs(1));
            return false;
        }

        let ready = {
            let mut readfds = FdSet::new();
            let mut max_fd = 0;
            for t in &self.targets {
                if let Some(sock) = &t.sock {
                    let fd = sock.raw().as_fd();
                    max_fd = max_fd.max(sock.raw().as_raw_fd());
                    readfds.insert(fd);
                }
            }
            let mut tv = TimeVal::microseconds(DEFAULT_SELECT_WAIT.as_micros() as i64);
            match select(max_fd + 1, Some(&mut readfds), None, None, Some(&mut tv)) {
                Err(Errno::EINTR) => return false,
                Err(e) => {
                    info!("select failed \"{}\"", e);
                    return false;
                }
                Ok(0) => return false,
                Ok(_) => {
                    let mut found = None;
                    for (i, t) in self.targets.iter().enumerate() {
                        if let Some(sock) = &t.sock {
                            if readfds.contains(sock.raw().as_fd()) {
                                found = Some(i);
                                break;
                            }
                        }
                    }
                    match found {
                        Some(i) => i,
                        None => return false,
                    }
                }
            }
        };

        let mut buf = [MaybeUninit::<u8>::uninit(); 4096];
        let received = match &self.targets[ready].sock {
            Some(sock) => sock.raw().recv_from(&mut buf),
            None => return false,
        };
        let (len, from) = match received {
            Ok(ok) => ok,
            Err(e) => {
                info!(
                    "recvfrom failed with {} \"{}\"",
                    self.conns[ready].name, e
                );
                self.targets[ready].close_socket();
                return false;
            }
        };
        let data = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };
        let now = SystemTime::now();

        let is_arp = self
            .targets[ready]
            .sock
            .as_ref()
            .map(ProbeSocket::is_arp)
            .unwrap_or(false);
        if is_arp {
            self.demux_arp(ready, data, &from, now);
        } else {
            self.demux_echo(data, &from, now);
        }
        true
    }

    /// Route an echo reply through its embedded target id; anything that
    /// fails validation is dropped silently.
    fn demux_echo(&mut self, buf: &[u8], from: &SockAddr, now: SystemTime) {
        match from.as_socket() {
            Some(SocketAddr::V4(_)) => {
                let (ip_src, reply) = match icmp::parse_echo_reply_v4(buf) {
                    Some(parsed) => parsed,
                    None => return,
                };
                if reply.ident != self.ident {
                    return;
                }
                let id = usize::from(reply.data.id);
                if id >= self.targets.len() {
                    return;
                }
                // the reply must come from the probed address itself
                if self.conns[id].resolved != IpAddr::V4(ip_src) {
                    return;
                }
                let t = &mut self.targets[id];
                if t.log.mark_replied(reply.seq, now) {
                    trace!(
                        "received seq = {} from {}, count = {}, target id = {}",
                        reply.seq,
                        ip_src,
                        reply.data.count,
                        reply.data.id
                    );
                } else {
                    trace!("window slot does not hold seq {} anymore", reply.seq);
                }
            }
            Some(SocketAddr::V6(sa)) => {
                let reply = match icmp::parse_echo_reply_v6(buf) {
                    Some(parsed) => parsed,
                    None => return,
                };
                if reply.ident != self.ident {
                    return;
                }
                let id = usize::from(reply.data.id);
                if id >= self.targets.len() {
                    return;
                }
                if self.conns[id].resolved != IpAddr::V6(*sa.ip()) {
                    return;
                }
                let t = &mut self.targets[id];
                if t.log.mark_replied(reply.seq, now) {
                    trace!(
                        "received seq = {} from {}, count = {}, target id = {}",
                        reply.seq,
                        sa.ip(),
                        reply.data.count,
                        reply.data.id
                    );
                } else {
                    trace!("window slot does not hold seq {} anymore", reply.seq);
                }
            }
            None => {
                if socket::packet_type(from).is_none() {
                    info!("reply with unknown address family");
                }
            }
        }
    }

    fn demux_arp(&mut self, i: usize, buf: &[u8], from: &SockAddr, now: SystemTime) {
        let pkttype = match socket::packet_type(from) {
            Some(ty) => ty,
            None => return,
        };
        // wild packet types (outgoing etc.) are not replies
        if pkttype != PACKET_HOST && pkttype != PACKET_BROADCAST && pkttype != PACKET_MULTICAST {
            return;
        }
        let link = match &self.targets[i].sock {
            Some(ProbeSocket::Arp { link, .. }) => *link,
            _ => return,
        };
        let (src, dst) = match (self.targets[i].src, self.conns[i].resolved) {
            (Some(IpAddr::V4(src)), IpAddr::V4(dst)) => (src, dst),
            _ => return,
        };
        if arp::is_expected_reply(buf, &link, src, dst) {
            let t = &mut self.targets[i];
            t.log.mark_latest_replied(t.seq, now);
        }
    }

    /// Recompute every target's derived counters for this tick.
    pub fn update_stats(&mut self, now: SystemTime) {
        for (cfg, t) in self.conns.iter().zip(self.targets.iter_mut()) {
            let timeout = Duration::from_millis(u64::from(cfg.timeout_ms));
            t.counters = t.log.aggregate(t.seq, now, timeout);
            trace!(
                "name = {}, replied = {}, waiting = {}, timeout = {}, late reply = {}, cons rcvd = {}, cons wait = {}, cons miss = {}, avg_rtt = {:.3}, seq = {}",
                cfg.name,
                t.counters.replied,
                t.counters.waiting,
                t.counters.timeout,
                t.counters.reply_late,
                t.counters.consecutive_rcvd,
                t.counters.consecutive_waiting,
                t.counters.consecutive_missing,
                t.counters.avg_rtt_us as f64 / 1000.0,
                t.seq
            );
        }
    }
}

fn send_v6(
    sock: &socket2::Socket,
    ifindex: Option<u32>,
    dst: std::net::Ipv6Addr,
    packet: &[u8],
) -> io::Result<()> {
    let sent = match ifindex {
        None => {
            let addr = SockAddr::from(SocketAddr::V6(SocketAddrV6::new(dst, 0, 0, 0)));
            sock.send_to(packet, &addr)?
        }
        Some(idx) => {
            // steer the datagram out of the configured interface
            use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, SockaddrIn6};
            let mut pktinfo: libc::in6_pktinfo = unsafe { std::mem::zeroed() };
            pktinfo.ipi6_ifindex = idx as libc::c_uint;
            let addr = SockaddrIn6::from(SocketAddrV6::new(dst, 0, 0, 0));
            let iov = [io::IoSlice::new(packet)];
            let cmsg = [ControlMessage::Ipv6PacketInfo(&pktinfo)];
            sendmsg(
                sock.as_raw_fd(),
                &iov,
                &cmsg,
                MsgFlags::empty(),
                Some(&addr),
            )
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?
        }
    };
    if sent == packet.len() {
        Ok(())
    } else {
        Err(io::Error::new(io::ErrorKind::Other, "short send"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use std::time::UNIX_EPOCH;

    fn engine_with(conns_text: &str) -> Engine {
        let cfg = config::load_from_text(conns_text).unwrap();
        Engine::new(cfg.connections, 0x4242)
    }

    fn v4_reply_from(src: [u8; 4], ident: u16, seq: u16, id: u16) -> Vec<u8> {
        let data = ProbeData::new(id, 1, UNIX_EPOCH + Duration::from_secs(1));
        let mut icmp_pkt = icmp::build_echo_request_v4(ident, seq, &data);
        icmp_pkt[0] = 0; // echo reply
        let total = 20 + icmp_pkt.len();
        let mut buf = vec![0u8; total];
        buf[0] = 0x45;
        buf[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        buf[9] = 1;
        buf[12..16].copy_from_slice(&src);
        buf[20..].copy_from_slice(&icmp_pkt);
        buf
    }

    fn from_v4() -> SockAddr {
        SockAddr::from("192.0.2.1:0".parse::<SocketAddr>().unwrap())
    }

    const TWO_TARGETS: &str = "connection {\n name = a\n checkip = 192.0.2.1\n}\n\
                               connection {\n name = b\n checkip = 192.0.2.2\n}\n";

    #[test]
    fn reply_routes_by_embedded_id_not_socket() {
        let mut engine = engine_with(TWO_TARGETS);
        let now = UNIX_EPOCH + Duration::from_secs(2);
        engine.targets[0].log.stamp(5, now, false);
        engine.targets[1].log.stamp(5, now, false);

        // a reply for target 1, arriving on whatever socket was ready
        let buf = v4_reply_from([192, 0, 2, 2], 0x4242, 5, 1);
        engine.demux_echo(&buf, &from_v4(), now + Duration::from_millis(30));
        assert!(!engine.targets[0].log.slot(5).replied);
        assert!(engine.targets[1].log.slot(5).replied);
        assert_eq!(engine.targets[1].log.slot(5).rtt_us, 30_000);
    }

    #[test]
    fn reply_with_foreign_ident_is_dropped() {
        let mut engine = engine_with(TWO_TARGETS);
        let now = UNIX_EPOCH + Duration::from_secs(2);
        engine.targets[0].log.stamp(5, now, false);
        let buf = v4_reply_from([192, 0, 2, 1], 0x1111, 5, 0);
        engine.demux_echo(&buf, &from_v4(), now);
        assert!(!engine.targets[0].log.slot(5).replied);
    }

    #[test]
    fn reply_with_out_of_range_id_is_dropped() {
        let mut engine = engine_with(TWO_TARGETS);
        let now = UNIX_EPOCH + Duration::from_secs(2);
        let buf = v4_reply_from([192, 0, 2, 1], 0x4242, 5, 40);
        engine.demux_echo(&buf, &from_v4(), now);
        // no panic, nothing marked
        assert!(!engine.targets[0].log.slot(5).replied);
        assert!(!engine.targets[1].log.slot(5).replied);
    }

    #[test]
    fn reply_from_wrong_peer_is_dropped() {
        let mut engine = engine_with(TWO_TARGETS);
        let now = UNIX_EPOCH + Duration::from_secs(2);
        engine.targets[0].log.stamp(5, now, false);
        // spoofed source: embedded id 0 but sender is not 192.0.2.1
        let buf = v4_reply_from([203, 0, 113, 9], 0x4242, 5, 0);
        engine.demux_echo(&buf, &from_v4(), now);
        assert!(!engine.targets[0].log.slot(5).replied);
    }

    #[test]
    fn stale_sequence_does_not_mark() {
        let mut engine = engine_with(TWO_TARGETS);
        let now = UNIX_EPOCH + Duration::from_secs(2);
        engine.targets[0].log.stamp(105, now, false); // occupies slot 5
        let buf = v4_reply_from([192, 0, 2, 1], 0x4242, 5, 0);
        engine.demux_echo(&buf, &from_v4(), now);
        assert!(!engine.targets[0].log.slot(5).replied);
    }

    #[test]
    fn startup_burst_shortens_the_send_interval() {
        let text = "connection {\n name = a\n checkip = 192.0.2.1\n interval_ms = 1000\n \
                    startup_acceleration = 1\n startup_burst_pkts = 5\n \
                    startup_burst_interval = 25000\n}\n";
        let mut engine = engine_with(text);
        assert_eq!(engine.send_interval(0), Duration::from_micros(25_000));
        engine.targets[0].num_sent = 5;
        assert_eq!(engine.send_interval(0), Duration::from_millis(1000));
    }

    #[test]
    fn burst_interval_never_undercuts_the_global_gate() {
        let text = "connection {\n name = a\n checkip = 192.0.2.1\n \
                    startup_acceleration = 1\n startup_burst_pkts = 5\n \
                    startup_burst_interval = 1000\n}\n";
        let engine = engine_with(text);
        assert_eq!(engine.send_interval(0), MIN_PERHOST_INTERVAL);
    }

    #[test]
    fn update_stats_fills_counters() {
        let mut engine = engine_with(TWO_TARGETS);
        let base = UNIX_EPOCH + Duration::from_secs(10);
        for k in 0..6u16 {
            let at = base + Duration::from_millis(u64::from(k) * 100);
            engine.targets[0].log.stamp(k, at, false);
            engine.targets[0]
                .log
                .mark_replied(k, at + Duration::from_millis(10));
            engine.targets[0].seq = k + 1;
        }
        engine.update_stats(base + Duration::from_secs(1));
        assert_eq!(engine.targets[0].counters.replied, 6);
        assert_eq!(engine.targets[0].counters.consecutive_rcvd, 5);
        assert_eq!(engine.targets[0].counters.avg_rtt_us, 10_000);
    }
}
