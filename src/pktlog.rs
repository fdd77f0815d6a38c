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

//! Sliding window of recently sent probes, one ring per target.
//!
//! Every send overwrites the slot `seq % FOLLOWED_PKTS`; replies only land
//! when the slot still holds the matching sequence, so a recycled slot
//! silently drops stale replies. The decision logic never reads the ring
//! directly, it consumes the [`Counters`] recomputed once per tick.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::timeutil;

/// Window size. Must stay below 0x10000 or sequence folding breaks.
pub const FOLLOWED_PKTS: usize = 100;

/// Sequence numbers wrap at a multiple of the window size so that
/// `seq % FOLLOWED_PKTS` stays aligned across the wrap.
pub const SEQ_LIMITER: u16 = ((0x10000 / FOLLOWED_PKTS) * FOLLOWED_PKTS) as u16;

/// One probe in the window.
#[derive(Debug, Clone, Copy)]
pub struct Slot {
    pub seq: u16,
    pub sent_time: SystemTime,
    pub replied_time: SystemTime,
    pub rtt_us: i64,
    pub used: bool,
    pub waiting: bool,
    pub replied: bool,
    pub timeout: bool,
    pub error: bool,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            seq: 0,
            sent_time: UNIX_EPOCH,
            replied_time: UNIX_EPOCH,
            rtt_us: 0,
            used: false,
            waiting: false,
            replied: false,
            timeout: false,
            error: false,
        }
    }
}

/// Derived counters over the window, recomputed each tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub used: u32,
    pub replied: u32,
    pub waiting: u32,
    pub timeout: u32,
    pub reply_late: u32,
    pub consecutive_waiting: u32,
    pub consecutive_missing: u32,
    pub consecutive_rcvd: u32,
    pub avg_rtt_us: i64,
}

#[derive(Debug, Clone)]
pub struct PacketLog {
    slots: [Slot; FOLLOWED_PKTS],
}

impl Default for PacketLog {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketLog {
    pub fn new() -> Self {
        Self {
            slots: [Slot::default(); FOLLOWED_PKTS],
        }
    }

    fn index(seq: u16) -> usize {
        seq as usize % FOLLOWED_PKTS
    }

    pub fn slot(&self, ind: usize) -> &Slot {
        &self.slots[ind]
    }

    /// Record a fresh send, overwriting whatever occupied the slot before.
    /// Failed sends are stamped too, with `error` set; they age into
    /// timeouts like any unanswered probe.
    pub fn stamp(&mut self, seq: u16, now: SystemTime, error: bool) {
        self.slots[Self::index(seq)] = Slot {
            seq,
            sent_time: now,
            replied_time: UNIX_EPOCH,
            rtt_us: 0,
            used: true,
            waiting: true,
            replied: false,
            timeout: false,
            error,
        };
    }

    /// Mark the probe `seq` as answered, provided its slot still holds that
    /// sequence. A reply that arrives after the slot timed out keeps the
    /// timeout flag, which is what the late-reply counter feeds on.
    pub fn mark_replied(&mut self, seq: u16, now: SystemTime) -> bool {
        let slot = &mut self.slots[Self::index(seq)];
        if !slot.used || slot.seq != seq {
            return false;
        }
        slot.replied = true;
        slot.waiting = false;
        slot.replied_time = now;
        slot.rtt_us = timeutil::diff_us(now, slot.sent_time);
        true
    }

    /// ARP replies carry no sequence number; attribute the reply to the most
    /// recent send. `next_seq` is the sequence the next send will use.
    pub fn mark_latest_replied(&mut self, next_seq: u16, now: SystemTime) {
        let ind = (Self::index(next_seq) + FOLLOWED_PKTS - 1) % FOLLOWED_PKTS;
        let slot = &mut self.slots[ind];
        if !slot.used {
            return;
        }
        slot.replied = true;
        slot.waiting = false;
        slot.replied_time = now;
        slot.rtt_us = timeutil::diff_us(now, slot.sent_time);
    }

    /// Recompute the derived counters and promote overdue `waiting` slots to
    /// `timeout`.
    ///
    /// The consecutive counters scan backwards from `next_seq - 2`, skipping
    /// the most recent send whose reply may legitimately still be in flight,
    /// and stop at the first unused slot. They intentionally look at the
    /// timeout flags from before this tick's promotion sweep.
    pub fn aggregate(&mut self, next_seq: u16, now: SystemTime, timeout: Duration) -> Counters {
        let mut c = Counters::default();
        let start = (Self::index(next_seq) + FOLLOWED_PKTS - 2) % FOLLOWED_PKTS;

        let mut ind = start;
        for _ in 0..FOLLOWED_PKTS {
            let slot = &self.slots[ind];
            if !slot.used || !slot.waiting {
                break;
            }
            c.consecutive_waiting += 1;
            ind = (ind + FOLLOWED_PKTS - 1) % FOLLOWED_PKTS;
        }

        let mut ind = start;
        for _ in 0..FOLLOWED_PKTS {
            let slot = &self.slots[ind];
            if !slot.used || !(slot.waiting || slot.timeout) {
                break;
            }
            c.consecutive_missing += 1;
            ind = (ind + FOLLOWED_PKTS - 1) % FOLLOWED_PKTS;
        }

        let mut ind = start;
        for _ in 0..FOLLOWED_PKTS {
            let slot = &self.slots[ind];
            if !slot.used || !(slot.replied && !slot.timeout) {
                break;
            }
            c.consecutive_rcvd += 1;
            ind = (ind + FOLLOWED_PKTS - 1) % FOLLOWED_PKTS;
        }

        let mut rtt_sum: i64 = 0;
        for slot in self.slots.iter_mut() {
            if !slot.used {
                continue;
            }
            if slot.waiting && timeutil::at_least(now, slot.sent_time, timeout) {
                slot.timeout = true;
            }
            if slot.replied && slot.timeout {
                c.reply_late += 1;
            }
            if slot.replied {
                c.replied += 1;
                rtt_sum += slot.rtt_us;
            }
            if slot.timeout {
                c.timeout += 1;
            }
            if slot.waiting {
                c.waiting += 1;
            }
            c.used += 1;
        }
        c.avg_rtt_us = rtt_sum / i64::from(c.replied.max(1));
        c
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(ms)
    }

    const TIMEOUT: Duration = Duration::from_millis(500);

    /// Stamp `n` probes starting at `first_seq`, 100ms apart, replying to
    /// each when `replied` is set. Returns the next sequence number.
    fn fill(log: &mut PacketLog, first_seq: u16, n: u16, base_ms: u64, replied: bool) -> u16 {
        let mut seq = first_seq;
        for k in 0..n {
            let t = base_ms + u64::from(k) * 100;
            log.stamp(seq, at(t), false);
            if replied {
                log.mark_replied(seq, at(t + 10));
            }
            seq = (seq + 1) % SEQ_LIMITER;
        }
        seq
    }

    #[test]
    fn slots_stay_aligned_with_sequence() {
        let mut log = PacketLog::new();
        let mut seq = 0u16;
        for _ in 0..250 {
            log.stamp(seq, at(0), false);
            seq = (seq + 1) % SEQ_LIMITER;
        }
        for ind in 0..FOLLOWED_PKTS {
            let slot = log.slot(ind);
            assert!(slot.used);
            assert_eq!(slot.seq as usize % FOLLOWED_PKTS, ind);
        }
    }

    #[test]
    fn alignment_survives_sequence_wrap() {
        let mut log = PacketLog::new();
        // SEQ_LIMITER is a multiple of the window size, so the slot index
        // continues seamlessly over the wrap.
        let next = fill(&mut log, SEQ_LIMITER - 10, 10, 0, true);
        assert_eq!(next, 0);
        let next = fill(&mut log, next, 10, 1_000, true);
        assert_eq!(next, 10);
        let c = log.aggregate(next, at(2_000), TIMEOUT);
        assert_eq!(c.used, 20);
        assert_eq!(c.replied, 20);
        // the run crosses the wrap without interruption: 9 slots on this
        // side of the wrap (the scan skips the newest send), 10 before it
        assert_eq!(c.consecutive_rcvd, 19);
    }

    #[test]
    fn stale_reply_to_recycled_slot_is_dropped() {
        let mut log = PacketLog::new();
        log.stamp(3, at(0), false);
        log.stamp(103, at(100), false); // recycles slot 3
        assert!(!log.mark_replied(3, at(200)));
        assert!(log.mark_replied(103, at(200)));
    }

    #[test]
    fn late_reply_keeps_timeout_and_counts_as_reply_late() {
        let mut log = PacketLog::new();
        let next = fill(&mut log, 0, 5, 0, true);
        log.stamp(next, at(500), false);
        // tick after the timeout expired: probe 5 is now timed out
        let c = log.aggregate(next + 2, at(1_200), TIMEOUT);
        assert_eq!(c.timeout, 1);
        assert_eq!(c.reply_late, 0);
        // the reply still arrives
        assert!(log.mark_replied(next, at(1_300)));
        let c = log.aggregate(next + 2, at(1_400), TIMEOUT);
        assert_eq!(c.replied, 6);
        assert_eq!(c.timeout, 1);
        assert_eq!(c.reply_late, 1);
        // a late reply does not extend the clean-receive run
        assert_eq!(c.consecutive_rcvd, 0);
    }

    #[test]
    fn consecutive_missing_includes_waiting_and_timeouts() {
        let mut log = PacketLog::new();
        let mut next = fill(&mut log, 0, 10, 0, true);
        next = fill(&mut log, next, 6, 1_000, false);
        let c = log.aggregate(next, at(1_450), TIMEOUT);
        // scan starts at next-2: probes 14 down to 10 are all still waiting
        assert_eq!(c.consecutive_waiting, 5);
        assert_eq!(c.consecutive_missing, 5);
        assert!(c.consecutive_missing >= c.consecutive_waiting);

        // next tick: the early ones are timed out, later ones still waiting
        let c = log.aggregate(next, at(1_550), TIMEOUT);
        assert_eq!(c.consecutive_missing, 5);
        assert!(c.timeout >= 1);
        assert!(c.consecutive_missing >= c.consecutive_waiting);
    }

    #[test]
    fn failed_sends_age_into_timeouts() {
        let mut log = PacketLog::new();
        log.stamp(0, at(0), true);
        log.stamp(1, at(100), true);
        let c = log.aggregate(2, at(1_000), TIMEOUT);
        assert_eq!(c.timeout, 2);
        assert_eq!(c.replied, 0);
        assert!(log.slot(0).error);
    }

    #[test]
    fn aggregate_stops_at_unused_slots() {
        let mut log = PacketLog::new();
        let next = fill(&mut log, 0, 4, 0, true);
        let c = log.aggregate(next, at(500), TIMEOUT);
        assert_eq!(c.used, 4);
        // slots 2, 1, 0 form the run; 3 is skipped as the newest send
        assert_eq!(c.consecutive_rcvd, 3);
    }

    #[test]
    fn avg_rtt_over_replied_only() {
        let mut log = PacketLog::new();
        log.stamp(0, at(0), false);
        log.mark_replied(0, at(10));
        log.stamp(1, at(100), false);
        log.mark_replied(1, at(130));
        log.stamp(2, at(200), false);
        let c = log.aggregate(3, at(300), TIMEOUT);
        assert_eq!(c.avg_rtt_us, (10_000 + 30_000) / 2);
    }

    #[test]
    fn arp_bookkeeping_marks_previous_send() {
        let mut log = PacketLog::new();
        log.stamp(7, at(0), false);
        log.mark_latest_replied(8, at(25));
        let slot = log.slot(7);
        assert!(slot.replied);
        assert!(!slot.waiting);
        assert_eq!(slot.rtt_us, 25_000);
    }
}
