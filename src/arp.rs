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

//! ARP probe wire format (RFC 826 request/reply over a cooked packet
//! socket, so no Ethernet framing here).
//!
//! ARP probing only works against a directly attached IPv4 peer. Replies
//! carry no sequence number, so the engine attributes an accepted reply to
//! the most recent send.

use pnet::packet::arp::{ArpHardwareType, ArpOperations, ArpPacket, MutableArpPacket};
use pnet::packet::ethernet::EtherTypes;
use pnet::util::MacAddr;
use std::net::Ipv4Addr;

/// ARP header plus two hardware/protocol address pairs.
pub const ARP_PACKET_LEN: usize = 28;

/// Link-layer identity of the interface a probe goes out on, read back from
/// the bound packet socket.
#[derive(Debug, Clone, Copy)]
pub struct LinkIdentity {
    pub ifindex: u32,
    pub hatype: u16,
    pub mac: MacAddr,
}

/// FDDI interfaces speak Ethernet-framed ARP.
pub fn wire_hatype(hatype: u16) -> u16 {
    if hatype == libc::ARPHRD_FDDI {
        libc::ARPHRD_ETHER
    } else {
        hatype
    }
}

/// Build an ARP who-has request from `src` for `dst`, hardware-broadcast.
pub fn build_request(link: &LinkIdentity, src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
    let mut buf = vec![0u8; ARP_PACKET_LEN];
    let mut packet = MutableArpPacket::new(&mut buf).unwrap();
    packet.set_hardware_type(ArpHardwareType::new(wire_hatype(link.hatype)));
    packet.set_protocol_type(EtherTypes::Ipv4);
    packet.set_hw_addr_len(6);
    packet.set_proto_addr_len(4);
    packet.set_operation(ArpOperations::Request);
    packet.set_sender_hw_addr(link.mac);
    packet.set_sender_proto_addr(src);
    packet.set_target_hw_addr(MacAddr::broadcast());
    packet.set_target_proto_addr(dst);
    buf
}

/// True when `buf` is the probed peer answering our own request: an ARP
/// reply for IPv4, matching hardware type and address lengths, from `dst`,
/// addressed to `src` at our link-layer address.
pub fn is_expected_reply(buf: &[u8], link: &LinkIdentity, src: Ipv4Addr, dst: Ipv4Addr) -> bool {
    let packet = match ArpPacket::new(buf) {
        Some(p) => p,
        None => return false,
    };
    packet.get_operation() == ArpOperations::Reply
        && packet.get_hardware_type() == ArpHardwareType::new(wire_hatype(link.hatype))
        && packet.get_protocol_type() == EtherTypes::Ipv4
        && packet.get_hw_addr_len() == 6
        && packet.get_proto_addr_len() == 4
        && packet.get_sender_proto_addr() == dst
        && packet.get_target_proto_addr() == src
        && packet.get_target_hw_addr() == link.mac
}
