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

//! linkmond: probes a set of named connections over ICMP echo or ARP,
//! tracks each one through an UP/DOWN state machine with hysteresis, and
//! runs user-configured scripts on transitions. Designed to sit under a
//! service manager: it stays in the foreground and logs to stderr.

mod arp;
mod config;
mod engine;
mod exec;
mod export;
mod groups;
mod icmp;
mod monitor;
mod pidfile;
mod pktlog;
mod signals;
mod socket;
mod target;
mod timeutil;

#[macro_use]
extern crate log;

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use clap::Parser;

use crate::config::{Config, GroupConfig};
use crate::engine::Engine;
use crate::exec::ExecQueues;
use crate::export::Exporter;

#[derive(Parser)]
#[clap(
    version,
    about = "Link-state monitor: probes connections and runs scripts on state transitions"
)]
struct Opts {
    /// Configuration file
    config: String,
    /// PID file; doubles as the single-instance lock
    pid_file: Option<String>,
    /// Directory the periodic graph/status snapshots are written to
    #[clap(long, default_value = "/var/lib/linkmond")]
    export_dir: String,
}

/// Map the config `debug` level onto the log filter. The numeric scheme
/// predates this implementation: 9 and up means full tracing, 8 is the
/// longstanding default. An explicit `RUST_LOG` overrides the config
/// level entirely.
fn apply_debug_level(debug: u32) {
    if std::env::var_os("RUST_LOG").is_some() {
        return;
    }
    let level = if debug >= 9 {
        log::LevelFilter::Trace
    } else if debug >= 8 {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    log::set_max_level(level);
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    // The logger itself passes everything; the global max level gates per
    // the config `debug` key once that is read, unless RUST_LOG is set, in
    // which case the environment filter stands untouched.
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Trace)
        .parse_default_env()
        .init();
    if std::env::var_os("RUST_LOG").is_none() {
        log::set_max_level(log::LevelFilter::Info);
    }

    let cfg = config::load(&opts.config)
        .with_context(|| format!("error reading config file '{}'", opts.config))?;
    apply_debug_level(cfg.debug);

    if cfg.connections.is_empty() {
        bail!("no connections found in config file");
    }

    let _pid_file = match &opts.pid_file {
        Some(path) => Some(pidfile::create(path)?),
        None => None,
    };

    signals::install().context("failed to install signal handlers")?;

    let ident = (std::process::id() & 0xffff) as u16;
    trace!("my ident is {}", ident);

    let mut daemon = Daemon::new(cfg, ident, PathBuf::from(&opts.export_dir));
    daemon.run(&opts.config);

    info!("shutting down");
    Ok(())
}

struct Daemon {
    engine: Engine,
    groups: Vec<GroupConfig>,
    queues: ExecQueues,
    exporter: Exporter,
    last_decision: Option<SystemTime>,
    wrote_status_export: bool,
}

impl Daemon {
    fn new(cfg: Config, ident: u16, export_dir: PathBuf) -> Self {
        Self {
            engine: Engine::new(cfg.connections, ident),
            groups: cfg.groups,
            queues: ExecQueues::new(),
            exporter: Exporter::new(export_dir),
            last_decision: None,
            wrote_status_export: false,
        }
    }

    fn run(&mut self, config_path: &str) {
        while !signals::stop_requested() {
            if signals::take_reload() {
                self.reload(config_path);
            }
            if signals::take_child() {
                self.queues.reap();
            }
            if signals::take_dump_ifaces() {
                log_interfaces();
            }

            self.engine.probe_cycle();

            let now = SystemTime::now();
            let due = match self.last_decision {
                None => true,
                Some(last) => timeutil::at_least(now, last, Duration::from_secs(1)),
            };
            if due {
                self.last_decision = Some(now);
                self.tick(now);
            }
        }
    }

    /// The once-per-second decision phase: aggregate, decide, report,
    /// aggregate groups, advance the exec queues, export.
    fn tick(&mut self, now: SystemTime) {
        self.engine.update_stats(now);

        let mut changed = false;
        for i in 0..self.engine.conns.len() {
            let cfg = &self.engine.conns[i];
            let events = monitor::evaluate(cfg, &mut self.engine.targets[i], now);
            changed |= !events.is_empty();
            for ev in &events {
                monitor::dispatch_connection(cfg, &self.engine.targets[i], ev, &mut self.queues);
            }
        }

        monitor::report_statuses(
            &self.engine.conns,
            &mut self.engine.targets,
            signals::take_dump(),
        );

        let group_events = groups::evaluate(&mut self.groups, &self.engine.targets, now);
        changed |= !group_events.is_empty();
        for (gi, ev) in &group_events {
            monitor::dispatch_group(&self.groups[*gi], ev, &mut self.queues);
        }

        self.queues.reap();
        self.queues.process();

        self.exporter
            .maybe_export(&self.engine.conns, &self.engine.targets, now);
        if changed || !self.wrote_status_export {
            self.exporter
                .export_statuses(&self.engine.conns, &self.engine.targets);
            self.wrote_status_export = true;
        }
    }

    /// Parse and validate the new configuration before touching anything;
    /// a bad reload keeps the running cycle untouched. On success the new
    /// targets inherit the old statuses by connection name.
    fn reload(&mut self, config_path: &str) {
        info!("reloading configuration from {}", config_path);
        let cfg = match config::load(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                error!("reload config failed, keeping current configuration: {}", e);
                return;
            }
        };
        if cfg.connections.is_empty() {
            error!("reload config failed, no connections found; keeping current configuration");
            return;
        }
        apply_debug_level(cfg.debug);

        let saved = target::snapshot_statuses(&self.engine.conns, &self.engine.targets);
        let ident = self.engine.ident;
        self.engine = Engine::new(cfg.connections, ident);
        self.groups = cfg.groups;
        target::restore_statuses(&saved, &self.engine.conns, &mut self.engine.targets);
        self.wrote_status_export = false;
    }
}

/// SIGUSR2 asks for a snapshot of the interface table in the log.
fn log_interfaces() {
    for iface in pnet::datalink::interfaces() {
        info!(
            "iface {} index {} mac {} up {} addrs {:?}",
            iface.name,
            iface.index,
            iface
                .mac
                .map(|m| m.to_string())
                .unwrap_or_else(|| "-".to_string()),
            iface.is_up(),
            iface.ips
        );
    }
}
