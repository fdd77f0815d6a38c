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

//! Per-connection runtime state owned by the probe engine.

use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{ConnectionConfig, Status};
use crate::pktlog::{Counters, PacketLog, FOLLOWED_PKTS, SEQ_LIMITER};
use crate::socket::ProbeSocket;

pub struct Target {
    /// Dense index into the connection table, embedded in probe payloads.
    pub id: u16,
    /// Next sequence number to send, wraps at `SEQ_LIMITER`.
    pub seq: u16,
    pub num_sent: u64,
    pub log: PacketLog,
    /// Derived counters from the last aggregation tick.
    pub counters: Counters,
    pub status: Status,
    /// Set while the current tick changed this connection's status.
    pub status_change: bool,
    pub down_timestamp: SystemTime,
    /// Window slot recorded when the link went down; when the ring comes
    /// back around to it the whole window has refreshed since the event.
    pub down_seq: u16,
    /// Sequence of the last still-down report, so each window gets one.
    pub down_seq_reported: u16,
    pub last_send_time: Option<SystemTime>,
    /// Raw socket, opened lazily and dropped on any error for reopen.
    pub sock: Option<ProbeSocket>,
    /// Cached source address, probed or configured. Cleared on errors so
    /// the next open reprobes.
    pub src: Option<IpAddr>,
}

impl Target {
    pub fn new(id: u16, cfg: &ConnectionConfig) -> Self {
        Self {
            id,
            seq: 0,
            num_sent: 0,
            log: PacketLog::new(),
            counters: Counters::default(),
            status: cfg.status,
            status_change: false,
            down_timestamp: UNIX_EPOCH,
            down_seq: 0,
            down_seq_reported: 0,
            last_send_time: None,
            sock: None,
            src: None,
        }
    }

    /// Slot index the next send will use.
    pub fn window_slot(&self) -> u16 {
        self.seq % FOLLOWED_PKTS as u16
    }

    pub fn advance_seq(&mut self) {
        self.seq = (self.seq + 1) % SEQ_LIMITER;
        self.num_sent += 1;
    }

    pub fn close_socket(&mut self) {
        self.sock = None;
    }
}

/// Snapshot `(name, status)` pairs ahead of a reload.
pub fn snapshot_statuses(conns: &[ConnectionConfig], targets: &[Target]) -> Vec<(String, Status)> {
    conns
        .iter()
        .zip(targets.iter())
        .map(|(c, t)| (c.name.clone(), t.status))
        .collect()
}

/// Carry saved statuses over to a freshly built target set. Connections
/// that disappeared are dropped; new ones keep their configured status.
pub fn restore_statuses(
    saved: &[(String, Status)],
    conns: &[ConnectionConfig],
    targets: &mut [Target],
) {
    for (name, status) in saved {
        for (c, t) in conns.iter().zip(targets.iter_mut()) {
            if c.name == *name {
                t.status = *status;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    fn conn(name: &str) -> ConnectionConfig {
        let text = format!("connection {{\n name = {}\n checkip = 127.0.0.1\n}}\n", name);
        let cfg = config::load_from_text(&text).unwrap();
        cfg.connections.into_iter().next().unwrap()
    }

    #[test]
    fn sequence_wraps_at_limiter() {
        let c = conn("a");
        let mut t = Target::new(0, &c);
        t.seq = SEQ_LIMITER - 1;
        t.advance_seq();
        assert_eq!(t.seq, 0);
        assert_eq!(t.num_sent, 1);
    }

    #[test]
    fn statuses_survive_an_identical_reload() {
        let conns = vec![conn("a"), conn("b")];
        let mut targets: Vec<Target> = conns
            .iter()
            .enumerate()
            .map(|(i, c)| Target::new(i as u16, c))
            .collect();
        targets[0].status = Status::Up;
        targets[1].status = Status::Down;

        let saved = snapshot_statuses(&conns, &targets);

        // simulate the reload: same config, fresh runtime state
        let mut fresh: Vec<Target> = conns
            .iter()
            .enumerate()
            .map(|(i, c)| Target::new(i as u16, c))
            .collect();
        restore_statuses(&saved, &conns, &mut fresh);
        assert_eq!(fresh[0].status, Status::Up);
        assert_eq!(fresh[1].status, Status::Down);
    }

    #[test]
    fn dropped_connections_do_not_confuse_restore() {
        let conns = vec![conn("a")];
        let targets = vec![Target::new(0, &conns[0])];
        let saved = snapshot_statuses(&conns, &targets);

        let new_conns = vec![conn("b")];
        let mut fresh = vec![Target::new(0, &new_conns[0])];
        restore_statuses(&saved, &new_conns, &mut fresh);
        assert_eq!(fresh[0].status, Status::Unknown);
    }
}
