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

//! Echo request/reply wire format for both IP families.
//!
//! Every probe carries a [`ProbeData`] payload behind the echo header: the
//! dense target id (so one `recvfrom` routes the reply without a reverse
//! lookup, and multiple connections to the same peer stay apart), a
//! monotonic per-target counter and the send timestamp. The layout is fixed
//! big-endian and identical on send and receive.

use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::IcmpTypes;
use pnet::packet::icmpv6::{Icmpv6Code, Icmpv6Packet, Icmpv6Types, MutableIcmpv6Packet};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::Packet;
use pnet::util;
use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Encoded size of [`ProbeData`].
pub const PROBE_DATA_LEN: usize = 22;

/// ICMP echo header (type, code, checksum, identifier, sequence).
pub const ICMP_HEADER_LEN: usize = 8;

/// ICMPv6 base header (type, code, checksum); identifier and sequence live
/// in the first four payload bytes.
pub const ICMPV6_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeData {
    /// Dense target index, routes the reply back to its connection.
    pub id: u16,
    /// Per-target count of probes sent so far.
    pub count: u64,
    pub sent_secs: u64,
    pub sent_micros: u32,
}

impl ProbeData {
    pub fn new(id: u16, count: u64, sent: SystemTime) -> Self {
        let since = sent.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            id,
            count,
            sent_secs: since.as_secs(),
            sent_micros: since.subsec_micros(),
        }
    }

    pub fn encode(&self) -> [u8; PROBE_DATA_LEN] {
        let mut buf = [0u8; PROBE_DATA_LEN];
        buf[0..2].copy_from_slice(&self.id.to_be_bytes());
        buf[2..10].copy_from_slice(&self.count.to_be_bytes());
        buf[10..18].copy_from_slice(&self.sent_secs.to_be_bytes());
        buf[18..22].copy_from_slice(&self.sent_micros.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < PROBE_DATA_LEN {
            return None;
        }
        Some(Self {
            id: u16::from_be_bytes([buf[0], buf[1]]),
            count: u64::from_be_bytes(buf[2..10].try_into().ok()?),
            sent_secs: u64::from_be_bytes(buf[10..18].try_into().ok()?),
            sent_micros: u32::from_be_bytes(buf[18..22].try_into().ok()?),
        })
    }
}

/// A validated echo reply, family independent.
#[derive(Debug, Clone, Copy)]
pub struct EchoReply {
    pub ident: u16,
    pub seq: u16,
    pub data: ProbeData,
}

/// Build an ICMPv4 echo request with the internet checksum filled in.
pub fn build_echo_request_v4(ident: u16, seq: u16, data: &ProbeData) -> Vec<u8> {
    let mut buf = vec![0u8; ICMP_HEADER_LEN + PROBE_DATA_LEN];
    let mut packet = MutableEchoRequestPacket::new(&mut buf).unwrap();
    packet.set_icmp_type(IcmpTypes::EchoRequest);
    packet.set_identifier(ident);
    packet.set_sequence_number(seq);
    packet.set_payload(&data.encode());
    let csum = util::checksum(packet.packet(), 1);
    packet.set_checksum(csum);
    buf
}

/// Build an ICMPv6 echo request. The checksum stays zero; the kernel fills
/// it in through the checksum-offset socket option.
pub fn build_echo_request_v6(ident: u16, seq: u16, data: &ProbeData) -> Vec<u8> {
    let mut buf = vec![0u8; ICMPV6_HEADER_LEN + 4 + PROBE_DATA_LEN];
    let mut packet = MutableIcmpv6Packet::new(&mut buf).unwrap();
    packet.set_icmpv6_type(Icmpv6Types::EchoRequest);
    packet.set_icmpv6_code(Icmpv6Code::new(0));
    let mut payload = [0u8; 4 + PROBE_DATA_LEN];
    payload[0..2].copy_from_slice(&ident.to_be_bytes());
    payload[2..4].copy_from_slice(&seq.to_be_bytes());
    payload[4..].copy_from_slice(&data.encode());
    packet.set_payload(&payload);
    buf
}

/// Parse a datagram read from a raw ICMPv4 socket, which includes the IP
/// header. Returns the IP source address alongside the reply so the caller
/// can verify the peer. Anything that is not a well-formed echo reply with
/// our payload is discarded.
pub fn parse_echo_reply_v4(buf: &[u8]) -> Option<(Ipv4Addr, EchoReply)> {
    let ip = Ipv4Packet::new(buf)?;
    let header_len = usize::from(ip.get_header_length()) * 4;
    let icmp_buf = buf.get(header_len..)?;
    let reply = EchoReplyPacket::new(icmp_buf)?;
    if reply.get_icmp_type() != IcmpTypes::EchoReply {
        return None;
    }
    let data = ProbeData::decode(reply.payload())?;
    Some((
        ip.get_source(),
        EchoReply {
            ident: reply.get_identifier(),
            seq: reply.get_sequence_number(),
            data,
        },
    ))
}

/// Parse a datagram read from a raw ICMPv6 socket; the kernel strips the
/// IPv6 header so the buffer starts at the ICMPv6 header.
pub fn parse_echo_reply_v6(buf: &[u8]) -> Option<EchoReply> {
    let packet = Icmpv6Packet::new(buf)?;
    if packet.get_icmpv6_type() != Icmpv6Types::EchoReply {
        return None;
    }
    let payload = packet.payload();
    if payload.len() < 4 + PROBE_DATA_LEN {
        return None;
    }
    let data = ProbeData::decode(&payload[4..])?;
    Some(EchoReply {
        ident: u16::from_be_bytes([payload[0], payload[1]]),
        seq: u16::from_be_bytes([payload[2], payload[3]]),
        data,
    })
}
