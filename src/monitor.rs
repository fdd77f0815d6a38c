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

//! Per-connection state machine and script dispatch.
//!
//! Decisions run once per second, after aggregation. Going down needs
//! `timeout >= max_packet_loss` or a long enough run of consecutive
//! misses; coming back up needs `timeout <= min_packet_loss` AND a run of
//! clean replies. The config loader enforces `min < max`, which is the
//! hysteresis that keeps a marginal link from flapping.
//!
//! LONG_DOWN is a deepening of DOWN: entering it emits the long-down
//! script set but does not count as a status change, and staying in it is
//! silent. For recovery and still-down reporting it behaves like DOWN.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local};

use crate::config::{ConnectionConfig, GroupConfig, Status};
use crate::exec::{self, ExecQueues};
use crate::pktlog::Counters;
use crate::target::Target;
use crate::timeutil;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Up,
    Down,
    LongDown,
    LongDownToUp,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Up => "up",
            EventKind::Down => "down",
            EventKind::LongDown => "long_down",
            EventKind::LongDownToUp => "long_down_to_up",
        }
    }
}

/// One emitted transition; `prev` is the status the scripts get told the
/// connection was in when the event fired.
#[derive(Debug, Clone, Copy)]
pub struct Transition {
    pub kind: EventKind,
    pub prev: Status,
    pub stamp: SystemTime,
}

/// Run the decision rules for one connection. Mutates the target's status
/// bookkeeping and returns the transitions to dispatch, in firing order.
pub fn evaluate(cfg: &ConnectionConfig, t: &mut Target, now: SystemTime) -> Vec<Transition> {
    let mut events = Vec::new();
    t.status_change = false;
    let c = t.counters;

    if matches!(t.status, Status::Up | Status::Unknown)
        && (c.timeout >= cfg.max_packet_loss
            || c.consecutive_missing >= cfg.max_successive_pkts_lost)
    {
        debug!("link {} down event", cfg.name);
        events.push(Transition {
            kind: EventKind::Down,
            prev: t.status,
            stamp: now,
        });
        t.status_change = true;
        t.status = Status::Down;
        t.down_timestamp = now;
        t.down_seq = t.window_slot();
        t.down_seq_reported = 0;
    }

    if t.status == Status::Down
        && cfg.long_down_time > 0
        && timeutil::at_least(now, t.down_timestamp, Duration::from_secs(cfg.long_down_time))
    {
        debug!("link {} long down event", cfg.name);
        events.push(Transition {
            kind: EventKind::LongDown,
            prev: t.status,
            stamp: t.down_timestamp,
        });
        // still the same outage, so no status_change here
        t.status = Status::LongDown;
    }

    if matches!(t.status, Status::Down | Status::LongDown | Status::Unknown)
        && c.timeout <= cfg.min_packet_loss
        && c.consecutive_rcvd >= cfg.min_successive_pkts_rcvd
    {
        if t.status == Status::LongDown {
            events.push(Transition {
                kind: EventKind::LongDownToUp,
                prev: t.status,
                stamp: now,
            });
        }
        debug!("link {} up event", cfg.name);
        events.push(Transition {
            kind: EventKind::Up,
            prev: t.status,
            stamp: now,
        });
        t.status_change = true;
        t.status = Status::Up;
    }

    events
}

/// The notify script is skipped when a connection merely resolves its
/// startup UNKNOWN into UP, unless the configuration asks for it.
pub fn notify_suppressed(kind: EventKind, prev: Status, unknown_up_notify: bool) -> bool {
    kind == EventKind::Up && prev == Status::Unknown && !unknown_up_notify
}

/// Everything one event's scripts need; connections and groups fill this
/// in their own way.
pub struct ScriptParams<'a> {
    pub event_script: Option<&'a str>,
    pub notify_script: Option<&'a str>,
    pub queue: Option<&'a str>,
    pub kind: EventKind,
    pub name: &'a str,
    pub check_ip: &'a str,
    pub device: &'a str,
    pub email: &'a str,
    pub counters: Counters,
    pub src_text: &'a str,
    pub prev: Status,
    pub stamp: SystemTime,
    pub suppress_notify: bool,
}

/// Fire the scripts for one transition. The event script honours the
/// queue; the notify script always spawns directly.
pub fn dispatch_scripts(p: &ScriptParams, queues: &mut ExecQueues) {
    if let Some(path) = executable(p.event_script) {
        let argv = script_argv(path, p);
        match p.queue {
            Some(queue) if !queue.is_empty() => queues.add(queue, argv),
            _ => {
                if let Err(e) = exec::spawn_script(&argv) {
                    error!("failed to execute \"{}\": {}", path, e);
                }
            }
        }
    }

    if !p.suppress_notify {
        if let Some(path) = executable(p.notify_script) {
            let argv = script_argv(path, p);
            if let Err(e) = exec::spawn_script(&argv) {
                error!("failed to execute \"{}\": {}", path, e);
            }
        }
    }
}

/// Dispatch one connection transition.
pub fn dispatch_connection(
    cfg: &ConnectionConfig,
    t: &Target,
    ev: &Transition,
    queues: &mut ExecQueues,
) {
    let long = matches!(ev.kind, EventKind::LongDown | EventKind::LongDownToUp);
    let email = if long {
        cfg.long_down_email.as_deref()
    } else {
        cfg.warn_email.as_deref()
    };
    let src_text = t.src.map(|ip| ip.to_string());
    let params = ScriptParams {
        event_script: if long {
            cfg.long_down_event_script.as_deref()
        } else {
            cfg.event_script.as_deref()
        },
        notify_script: if long {
            cfg.long_down_notify_script.as_deref()
        } else {
            cfg.notify_script.as_deref()
        },
        queue: cfg.queue.as_deref(),
        kind: ev.kind,
        name: &cfg.name,
        check_ip: &cfg.check_ip,
        device: non_empty_or(cfg.device.as_deref(), "NA"),
        email: non_empty_or(email, "-"),
        counters: t.counters,
        src_text: non_empty_or(src_text.as_deref(), "NA"),
        prev: ev.prev,
        stamp: ev.stamp,
        suppress_notify: notify_suppressed(ev.kind, ev.prev, cfg.unknown_up_notify),
    };
    dispatch_scripts(&params, queues);
}

/// Dispatch one group transition; the per-connection fields ride along as
/// placeholders.
pub fn dispatch_group(g: &GroupConfig, ev: &Transition, queues: &mut ExecQueues) {
    let params = ScriptParams {
        event_script: g.event_script.as_deref(),
        notify_script: g.notify_script.as_deref(),
        queue: g.queue.as_deref(),
        kind: ev.kind,
        name: &g.name,
        check_ip: "NA",
        device: "NA",
        email: non_empty_or(g.warn_email.as_deref(), "-"),
        counters: Counters::default(),
        src_text: "NA",
        prev: ev.prev,
        stamp: ev.stamp,
        suppress_notify: notify_suppressed(ev.kind, ev.prev, g.unknown_up_notify),
    };
    dispatch_scripts(&params, queues);
}

/// The fixed 17-position argument vector every script receives.
pub fn script_argv(path: &str, p: &ScriptParams) -> Vec<String> {
    vec![
        path.to_string(),
        p.kind.as_str().to_string(),
        p.name.to_string(),
        p.check_ip.to_string(),
        p.device.to_string(),
        p.email.to_string(),
        p.counters.replied.to_string(),
        p.counters.waiting.to_string(),
        p.counters.timeout.to_string(),
        p.counters.reply_late.to_string(),
        p.counters.consecutive_rcvd.to_string(),
        p.counters.consecutive_waiting.to_string(),
        p.counters.consecutive_missing.to_string(),
        p.counters.avg_rtt_us.to_string(),
        p.src_text.to_string(),
        p.prev.as_str().to_string(),
        timeutil::epoch_secs(p.stamp).to_string(),
    ]
}

fn non_empty_or<'a>(value: Option<&'a str>, fallback: &'a str) -> &'a str {
    match value {
        Some(v) if !v.is_empty() => v,
        _ => fallback,
    }
}

/// A script is dispatchable when it stats and the owner-execute bit is set.
fn executable(path: Option<&str>) -> Option<&str> {
    let path = path?;
    if path.is_empty() {
        return None;
    }
    match fs::metadata(path) {
        Err(e) => {
            error!("failed to stat event script \"{}\" reason \"{}\"", path, e);
            None
        }
        Ok(meta) => {
            if meta.permissions().mode() & 0o100 == 0 {
                error!(
                    "event script \"{}\" is not executable by owner, please check permissions",
                    path
                );
                None
            } else {
                Some(path)
            }
        }
    }
}

/// A down link gets one "still down" report per refreshed window: when the
/// ring comes back around to the slot recorded at the down event and this
/// sequence has not been reported yet.
pub fn still_down_due(t: &Target) -> bool {
    t.status.is_down()
        && t.down_seq == t.window_slot()
        && t.seq != t.down_seq_reported
        && !t.status_change
}

/// Log still-down reports and, for changed (or dumped) connections, the
/// full counter line plus the per-slot flag rows.
pub fn report_statuses(conns: &[ConnectionConfig], targets: &mut [Target], dump_all: bool) {
    for (cfg, t) in conns.iter().zip(targets.iter_mut()) {
        let still_down = still_down_due(t);
        if still_down {
            let since: DateTime<Local> = t.down_timestamp.into();
            info!(
                "link {} still down since {}",
                cfg.name,
                since.format("%Y-%m-%d %H:%M:%S")
            );
        }
        if dump_all || t.status_change || still_down {
            info!(
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
            log_flag_rows(t);
            t.down_seq_reported = t.seq;
        }
    }
}

fn log_flag_rows(t: &Target) {
    let slot = usize::from(t.window_slot());
    let mut marker = String::from("seq        ");
    for i in 0..crate::pktlog::FOLLOWED_PKTS {
        marker.push(if i == slot { '*' } else { ' ' });
    }
    info!("{}", marker);
    for (label, pick) in [
        ("used       ", flag_used as fn(&crate::pktlog::Slot) -> bool),
        ("wait       ", flag_waiting),
        ("replied    ", flag_replied),
        ("timeout    ", flag_timeout),
        ("error      ", flag_error),
    ] {
        let mut row = String::from(label);
        for i in 0..crate::pktlog::FOLLOWED_PKTS {
            row.push(if pick(t.log.slot(i)) { '1' } else { '0' });
        }
        info!("{}", row);
    }
}

fn flag_used(s: &crate::pktlog::Slot) -> bool {
    s.used
}
fn flag_waiting(s: &crate::pktlog::Slot) -> bool {
    s.waiting
}
fn flag_replied(s: &crate::pktlog::Slot) -> bool {
    s.replied
}
fn flag_timeout(s: &crate::pktlog::Slot) -> bool {
    s.timeout
}
fn flag_error(s: &crate::pktlog::Slot) -> bool {
    s.error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::pktlog::FOLLOWED_PKTS;
    use std::time::{Duration, UNIX_EPOCH};

    const CONN: &str = "connection {\n name = link1\n checkip = 192.0.2.1\n \
                        interval_ms = 100\n timeout_ms = 500\n \
                        min_packet_loss = 0\n min_successive_pkts_rcvd = 5\n \
                        max_packet_loss = 15\n max_successive_pkts_lost = 7\n \
                        long_down_time = 60\n}\n";

    fn connection() -> ConnectionConfig {
        config::load_from_text(CONN)
            .unwrap()
            .connections
            .into_iter()
            .next()
            .unwrap()
    }

    fn at(ms: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(ms)
    }

    /// Stamp one probe per 100ms starting at `base_ms`, replying when
    /// `replied`, and keep the target's sequence in step.
    fn drive(t: &mut Target, n: u32, base_ms: u64, replied: bool) -> u64 {
        for k in 0..n {
            let ts = at(base_ms + u64::from(k) * 100);
            t.log.stamp(t.seq, ts, false);
            if replied {
                t.log.mark_replied(t.seq, at(base_ms + u64::from(k) * 100 + 10));
            }
            t.advance_seq();
        }
        base_ms + u64::from(n) * 100
    }

    fn tick(cfg: &ConnectionConfig, t: &mut Target, now_ms: u64) -> Vec<Transition> {
        let now = at(now_ms);
        t.counters = t
            .log
            .aggregate(t.seq, now, Duration::from_millis(u64::from(cfg.timeout_ms)));
        evaluate(cfg, t, now)
    }

    #[test]
    fn cold_start_reaches_up_after_clean_replies() {
        let cfg = connection();
        let mut t = Target::new(0, &cfg);
        assert_eq!(t.status, Status::Unknown);

        // five probes are not enough: the scan skips the newest send
        drive(&mut t, 5, 0, true);
        let events = tick(&cfg, &mut t, 520);
        assert!(events.is_empty());
        assert_eq!(t.status, Status::Unknown);

        let mut t = Target::new(0, &cfg);
        drive(&mut t, 6, 0, true);
        let events = tick(&cfg, &mut t, 620);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Up);
        assert_eq!(events[0].prev, Status::Unknown);
        assert_eq!(t.status, Status::Up);
        assert!(t.status_change);
        // the startup notify stays quiet by default
        assert!(notify_suppressed(
            events[0].kind,
            events[0].prev,
            cfg.unknown_up_notify
        ));
    }

    #[test]
    fn drop_storm_goes_down_after_consecutive_misses() {
        let cfg = connection();
        let mut t = Target::new(0, &cfg);
        let mut clock = drive(&mut t, 6, 0, true);
        tick(&cfg, &mut t, clock);
        assert_eq!(t.status, Status::Up);

        // unanswered probes accumulate; 8 sends put 7 misses into the scan
        clock = drive(&mut t, 7, clock, false);
        let events = tick(&cfg, &mut t, clock + 600);
        assert!(events.is_empty(), "one more send still needed");

        clock = drive(&mut t, 1, clock + 700, false);
        let now_ms = clock + 600;
        let events = tick(&cfg, &mut t, now_ms);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Down);
        assert_eq!(events[0].prev, Status::Up);
        assert_eq!(t.status, Status::Down);
        assert!(t.status_change);
        assert_eq!(t.down_timestamp, at(now_ms));
        assert_eq!(t.down_seq, t.window_slot());
        assert_eq!(t.down_seq_reported, 0);
        // both scripts would fire on a down event
        assert!(!notify_suppressed(
            events[0].kind,
            events[0].prev,
            cfg.unknown_up_notify
        ));
    }

    #[test]
    fn recovery_needs_clean_window_and_reply_run() {
        let cfg = connection();
        let mut t = Target::new(0, &cfg);
        let mut clock = drive(&mut t, 6, 0, true);
        tick(&cfg, &mut t, clock);
        clock = drive(&mut t, 8, clock, false);
        clock += 600;
        tick(&cfg, &mut t, clock);
        assert_eq!(t.status, Status::Down);

        // replies resume; the reply run is long enough almost immediately,
        // but with min_packet_loss = 0 the timed-out slots also have to be
        // recycled out of the window first
        clock = drive(&mut t, 6, clock, true);
        let events = tick(&cfg, &mut t, clock);
        assert!(events.is_empty());
        assert_eq!(t.status, Status::Down);

        clock = drive(&mut t, FOLLOWED_PKTS as u32, clock, true);
        let events = tick(&cfg, &mut t, clock);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Up);
        assert_eq!(events[0].prev, Status::Down);
        assert_eq!(t.status, Status::Up);
    }

    #[test]
    fn long_down_fires_once_and_stays_silent() {
        let cfg = connection();
        let mut t = Target::new(0, &cfg);
        let mut clock = drive(&mut t, 6, 0, true);
        tick(&cfg, &mut t, clock);
        clock = drive(&mut t, 8, clock, false);
        clock += 600;
        tick(&cfg, &mut t, clock);
        assert_eq!(t.status, Status::Down);
        let down_at = t.down_timestamp;

        // one second later: down, but not long down yet
        let events = tick(&cfg, &mut t, clock + 1_000);
        assert!(events.is_empty());

        // 61 seconds after the down event
        let events = tick(&cfg, &mut t, clock + 61_000);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::LongDown);
        assert_eq!(events[0].prev, Status::Down);
        assert_eq!(events[0].stamp, down_at);
        assert_eq!(t.status, Status::LongDown);
        assert!(!t.status_change, "deepening down is not a status change");

        // staying long down emits nothing further
        let events = tick(&cfg, &mut t, clock + 62_000);
        assert!(events.is_empty());
        assert_eq!(t.status, Status::LongDown);
    }

    #[test]
    fn long_down_recovery_emits_both_events_in_order() {
        let cfg = connection();
        let mut t = Target::new(0, &cfg);
        let mut clock = drive(&mut t, 6, 0, true);
        tick(&cfg, &mut t, clock);
        clock = drive(&mut t, 8, clock, false);
        clock += 600;
        tick(&cfg, &mut t, clock);
        tick(&cfg, &mut t, clock + 61_000);
        assert_eq!(t.status, Status::LongDown);

        let clock = drive(&mut t, 110, clock + 61_000, true);
        let events = tick(&cfg, &mut t, clock);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::LongDownToUp);
        assert_eq!(events[0].prev, Status::LongDown);
        assert_eq!(events[1].kind, EventKind::Up);
        assert_eq!(events[1].prev, Status::LongDown);
        assert_eq!(t.status, Status::Up);
    }

    #[test]
    fn hysteresis_band_changes_nothing() {
        // between the thresholds neither direction may trigger
        let text = "connection {\n name = x\n checkip = 192.0.2.1\n \
                    min_packet_loss = 2\n max_packet_loss = 10\n \
                    max_successive_pkts_lost = 50\n min_successive_pkts_rcvd = 5\n}\n";
        let cfg = config::load_from_text(text)
            .unwrap()
            .connections
            .into_iter()
            .next()
            .unwrap();
        let mut t = Target::new(0, &cfg);
        // 5 timeouts in the window: above min, below max
        let mut clock = drive(&mut t, 5, 0, false);
        clock += 600;
        let mut up = Target::new(0, &cfg);
        up.status = Status::Up;
        up.log = t.log.clone();
        up.seq = t.seq;
        assert!(tick(&cfg, &mut up, clock).is_empty());
        assert_eq!(up.status, Status::Up);

        let mut down = Target::new(0, &cfg);
        down.status = Status::Down;
        down.log = t.log.clone();
        down.seq = t.seq;
        assert!(tick(&cfg, &mut down, clock).is_empty());
        assert_eq!(down.status, Status::Down);
    }

    #[test]
    fn still_down_reports_once_per_window() {
        let cfg = connection();
        let mut t = Target::new(0, &cfg);
        let mut clock = drive(&mut t, 6, 0, true);
        tick(&cfg, &mut t, clock);
        clock = drive(&mut t, 8, clock, false);
        clock += 600;
        tick(&cfg, &mut t, clock);
        assert_eq!(t.status, Status::Down);
        assert!(t.status_change, "fresh transition is not a still-down report");
        assert!(!still_down_due(&t));

        // a full window of further probes brings the ring back around
        drive(&mut t, FOLLOWED_PKTS as u32, clock, false);
        t.status_change = false;
        assert!(still_down_due(&t));
        t.down_seq_reported = t.seq;
        assert!(!still_down_due(&t), "already reported for this sequence");
    }

    #[test]
    fn argv_layout_is_stable() {
        let p = ScriptParams {
            event_script: Some("/etc/scripts/event"),
            notify_script: None,
            queue: None,
            kind: EventKind::Down,
            name: "link1",
            check_ip: "192.0.2.1",
            device: "eth0",
            email: "ops@example.net",
            counters: Counters {
                used: 20,
                replied: 3,
                waiting: 2,
                timeout: 15,
                reply_late: 1,
                consecutive_waiting: 2,
                consecutive_missing: 9,
                consecutive_rcvd: 0,
                avg_rtt_us: 12345,
            },
            src_text: "192.0.2.10",
            prev: Status::Up,
            stamp: at(1_700_000_000_000),
            suppress_notify: false,
        };
        let argv = script_argv("/etc/scripts/event", &p);
        assert_eq!(
            argv,
            vec![
                "/etc/scripts/event",
                "down",
                "link1",
                "192.0.2.1",
                "eth0",
                "ops@example.net",
                "3",
                "2",
                "15",
                "1",
                "0",
                "2",
                "9",
                "12345",
                "192.0.2.10",
                "up",
                "1700000000",
            ]
        );
    }

    #[test]
    fn unknown_up_notify_flag_lifts_the_suppression() {
        assert!(notify_suppressed(EventKind::Up, Status::Unknown, false));
        assert!(!notify_suppressed(EventKind::Up, Status::Unknown, true));
        assert!(!notify_suppressed(EventKind::Up, Status::Down, false));
        assert!(!notify_suppressed(EventKind::Down, Status::Up, false));
        assert!(!notify_suppressed(
            EventKind::LongDownToUp,
            Status::LongDown,
            false
        ));
    }

    #[test]
    fn scripts_need_the_owner_execute_bit() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.sh");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(b"#!/bin/sh\nexit 0\n").unwrap();
        drop(f);
        let path_str = path.to_str().unwrap();

        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        assert!(executable(Some(path_str)).is_none());

        fs::set_permissions(&path, fs::Permissions::from_mode(0o700)).unwrap();
        assert_eq!(executable(Some(path_str)), Some(path_str));

        assert!(executable(Some("/nonexistent/script")).is_none());
        assert!(executable(Some("")).is_none());
        assert!(executable(None).is_none());
    }
}
