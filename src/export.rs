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

//! Periodic file snapshots of per-connection counters, in the Munin
//! plugin text format, plus a plain `status_export` listing for anything
//! that just wants the current statuses.
//!
//! Files are rewritten atomically (temp file + rename) so a reader never
//! sees a torn snapshot.

use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tempfile::NamedTempFile;

use crate::config::{ConnectionConfig, Status};
use crate::target::Target;
use crate::timeutil;

pub const EXPORT_PERIOD: Duration = Duration::from_secs(300);

pub struct Exporter {
    dir: PathBuf,
    last_export: SystemTime,
}

impl Exporter {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            last_export: SystemTime::now(),
        }
    }

    /// Write the graph snapshot files when the export period has elapsed.
    pub fn maybe_export(&mut self, conns: &[ConnectionConfig], targets: &[Target], now: SystemTime) {
        if !timeutil::at_least(now, self.last_export, EXPORT_PERIOD) {
            return;
        }
        self.last_export += EXPORT_PERIOD;

        self.write_file("config.rtt", &render_rtt_config(conns));
        self.write_file("status.rtt", &render_rtt_values(conns, targets));
        self.write_file("config.counts", &render_counts_config(conns));
        self.write_file("status.counts", &render_counts_values(conns, targets));
        self.write_file("config.status", &render_status_config(conns));
        self.write_file("status.status", &render_status_values(conns, targets));
        self.export_statuses(conns, targets);
    }

    /// Rewrite `status_export`; called with every periodic export and
    /// whenever a tick changed any status.
    pub fn export_statuses(&self, conns: &[ConnectionConfig], targets: &[Target]) {
        self.write_file("status_export", &render_status_export(conns, targets));
    }

    fn write_file(&self, name: &str, body: &str) {
        let result = NamedTempFile::new_in(&self.dir).and_then(|mut tmp| {
            tmp.write_all(body.as_bytes())?;
            tmp.persist(self.dir.join(name))?;
            Ok(())
        });
        if let Err(e) = result {
            error!(
                "failed to write export file {}/{}: {}",
                self.dir.display(),
                name,
                e
            );
        }
    }
}

/// Munin data source names: `_` + connection name, `-` and spaces mapped
/// to `_`.
pub fn munin_name(src: &str) -> String {
    let mut out = String::with_capacity(src.len() + 1);
    out.push('_');
    for ch in src.chars() {
        out.push(match ch {
            '-' | ' ' => '_',
            c => c,
        });
    }
    out
}

fn render_rtt_config(conns: &[ConnectionConfig]) -> String {
    let mut out = String::new();
    out.push_str("graph_title Linkmond Average Ping Latency\n");
    out.push_str("graph_vlabel ms\n");
    out.push_str("graph_info This graph shows Linkmond status\n");
    out.push_str("graph_category network\n");
    out.push_str("graph_args --base 1000 -l 0\n");
    for c in conns {
        let name = munin_name(&c.name);
        out.push_str(&format!("{}_rtt.label {} rtt\n", name, c.name));
        out.push_str(&format!("{}_rtt.type GAUGE\n", name));
    }
    out
}

fn render_rtt_values(conns: &[ConnectionConfig], targets: &[Target]) -> String {
    let mut out = String::new();
    for (c, t) in conns.iter().zip(targets) {
        let rtt_ms = if t.status.is_down() {
            0.0
        } else {
            t.counters.avg_rtt_us as f64 / 1000.0
        };
        out.push_str(&format!("{}_rtt.value {:.2}\n", munin_name(&c.name), rtt_ms));
    }
    out
}

fn render_counts_config(conns: &[ConnectionConfig]) -> String {
    let mut out = String::new();
    out.push_str("graph_title Linkmond packet counts\n");
    out.push_str("graph_vlabel percent\n");
    out.push_str("graph_info This graph shows Linkmond status\n");
    out.push_str("graph_category network\n");
    out.push_str("graph_args --base 1000 -l 0\n");
    for c in conns {
        let name = munin_name(&c.name);
        out.push_str(&format!("{}_timeout.label {} Timed out\n", name, c.name));
        out.push_str(&format!("{}_timeout.type GAUGE\n", name));
        out.push_str(&format!("{}_replied.label {} Replied\n", name, c.name));
        out.push_str(&format!("{}_replied.type GAUGE\n", name));
        out.push_str(&format!("{}_waiting.label {} Waiting\n", name, c.name));
        out.push_str(&format!("{}_waiting.type GAUGE\n", name));
        out.push_str(&format!("{}_latereply.label {} Late replied\n", name, c.name));
        out.push_str(&format!("{}_latereply.type GAUGE\n", name));
        out.push_str(&format!("{}_cwait.label {} Consecutive waiting\n", name, c.name));
        out.push_str(&format!("{}_cwait.type GAUGE\n", name));
        out.push_str(&format!("{}_cmiss.label {} Consecutive missing\n", name, c.name));
        out.push_str(&format!("{}_cmiss.type GAUGE\n", name));
        out.push_str(&format!("{}_crcvd.label {} Consecutive received\n", name, c.name));
        out.push_str(&format!("{}_crcvd.type GAUGE\n", name));
    }
    out
}

fn render_counts_values(conns: &[ConnectionConfig], targets: &[Target]) -> String {
    let mut out = String::new();
    for (c, t) in conns.iter().zip(targets) {
        let name = munin_name(&c.name);
        out.push_str(&format!("{}_timeout.value {}\n", name, t.counters.timeout));
        out.push_str(&format!("{}_replied.value {}\n", name, t.counters.replied));
        out.push_str(&format!("{}_waiting.value {}\n", name, t.counters.waiting));
        out.push_str(&format!("{}_latereply.value {}\n", name, t.counters.reply_late));
        out.push_str(&format!(
            "{}_cwait.value {}\n",
            name, t.counters.consecutive_waiting
        ));
        out.push_str(&format!(
            "{}_cmiss.value {}\n",
            name, t.counters.consecutive_missing
        ));
        out.push_str(&format!(
            "{}_crcvd.value {}\n",
            name, t.counters.consecutive_rcvd
        ));
    }
    out
}

fn render_status_config(conns: &[ConnectionConfig]) -> String {
    let mut out = String::new();
    out.push_str("graph_title Linkmond connection statuses\n");
    out.push_str("graph_vlabel Status\n");
    out.push_str("graph_info This graph shows Linkmond connection statuses\n");
    out.push_str("graph_category network\n");
    out.push_str("graph_info Status: 0 = DOWN, 1 = UP, 2 = UNKNOWN, 3 = LONG_DOWN\n");
    out.push_str("graph_args --base 1000 --lower-limit 0 --upper-limit 3\n");
    for c in conns {
        out.push_str(&format!(
            "{}_status.label {} Status\n",
            munin_name(&c.name),
            c.name
        ));
    }
    out
}

fn render_status_values(conns: &[ConnectionConfig], targets: &[Target]) -> String {
    let mut out = String::new();
    for (c, t) in conns.iter().zip(targets) {
        out.push_str(&format!(
            "{}_status.value {}\n",
            munin_name(&c.name),
            t.status.code()
        ));
    }
    out
}

fn render_status_export(conns: &[ConnectionConfig], targets: &[Target]) -> String {
    let mut out = String::new();
    for (c, t) in conns.iter().zip(targets) {
        out.push_str(&format!("{} {}\n", c.name, t.status.as_str()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    fn fixture() -> (Vec<ConnectionConfig>, Vec<Target>) {
        let text = "connection {\n name = up-link 1\n checkip = 192.0.2.1\n}\n\
                    connection {\n name = wan2\n checkip = 192.0.2.2\n}\n";
        let cfg = config::load_from_text(text).unwrap();
        let mut targets: Vec<Target> = cfg
            .connections
            .iter()
            .enumerate()
            .map(|(i, c)| Target::new(i as u16, c))
            .collect();
        targets[0].status = Status::Up;
        targets[0].counters.avg_rtt_us = 12_340;
        targets[0].counters.replied = 90;
        targets[1].status = Status::LongDown;
        targets[1].counters.avg_rtt_us = 99_999;
        (cfg.connections, targets)
    }

    #[test]
    fn data_source_names_are_mangled() {
        assert_eq!(munin_name("up-link 1"), "_up_link_1");
        assert_eq!(munin_name("wan2"), "_wan2");
    }

    #[test]
    fn rtt_values_zero_out_down_links() {
        let (conns, targets) = fixture();
        let body = render_rtt_values(&conns, &targets);
        assert_eq!(body, "_up_link_1_rtt.value 12.34\n_wan2_rtt.value 0.00\n");
    }

    #[test]
    fn status_values_use_the_numeric_codes() {
        let (conns, targets) = fixture();
        let body = render_status_values(&conns, &targets);
        assert_eq!(body, "_up_link_1_status.value 1\n_wan2_status.value 3\n");
    }

    #[test]
    fn status_export_lists_names_and_strings() {
        let (conns, targets) = fixture();
        let body = render_status_export(&conns, &targets);
        assert_eq!(body, "up-link 1 up\nwan2 long_down\n");
    }

    #[test]
    fn config_bodies_carry_label_and_type() {
        let (conns, _) = fixture();
        let body = render_counts_config(&conns);
        assert!(body.contains("_up_link_1_timeout.label up-link 1 Timed out\n"));
        assert!(body.contains("_up_link_1_timeout.type GAUGE\n"));
        let body = render_rtt_config(&conns);
        assert!(body.starts_with("graph_title "));
        assert!(body.contains("_wan2_rtt.label wan2 rtt\n"));
    }

    #[test]
    fn files_are_written_and_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let (conns, mut targets) = fixture();
        let exporter = Exporter::new(dir.path().to_path_buf());

        exporter.export_statuses(&conns, &targets);
        let path = dir.path().join("status_export");
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "up-link 1 up\nwan2 long_down\n"
        );

        targets[0].status = Status::Down;
        exporter.export_statuses(&conns, &targets);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "up-link 1 down\nwan2 long_down\n"
        );
    }

    #[test]
    fn periodic_export_respects_the_period() {
        let dir = tempfile::tempdir().unwrap();
        let (conns, targets) = fixture();
        let mut exporter = Exporter::new(dir.path().to_path_buf());
        let start = exporter.last_export;

        exporter.maybe_export(&conns, &targets, start + Duration::from_secs(10));
        assert!(!dir.path().join("status.rtt").exists());

        exporter.maybe_export(&conns, &targets, start + EXPORT_PERIOD + Duration::from_secs(1));
        assert!(dir.path().join("status.rtt").exists());
        assert!(dir.path().join("config.rtt").exists());
        assert!(dir.path().join("status.counts").exists());
        assert!(dir.path().join("config.counts").exists());
        assert!(dir.path().join("status.status").exists());
        assert!(dir.path().join("config.status").exists());
        assert!(dir.path().join("status_export").exists());
    }
}
