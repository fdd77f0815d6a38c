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

//! Configuration model and file parser.
//!
//! The file format is plain text with three block kinds, one `key=value`
//! per line:
//!
//! ```text
//! debug = 8
//! defaults {
//!     interval_ms = 1000
//! }
//! connection {
//!     name = uplink1
//!     checkip = 192.0.2.1
//!     device = eth0
//! }
//! group {
//!     name = uplinks
//!     logic = 0
//!     member-connection = uplink1
//! }
//! include /etc/linkmond.d/*.conf
//! -include /etc/linkmond.extra/*.conf
//! ```
//!
//! `#` starts a comment. A `connection` block starts from a copy of the
//! current `defaults`, so defaults must appear before the connections they
//! apply to. `include` fails when nothing matches, `-include` does not;
//! editor backups (`*~`) are never picked up and matches are processed in
//! sorted order.
//!
//! Parsing accumulates every problem it finds (each is logged) and fails as
//! a whole, so a typo never brings up a half-configured monitor.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Connection/group status. The numeric values appear in exported files, in
/// script arguments and in the bitwise group aggregation; do not renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Down = 0,
    Up = 1,
    Unknown = 2,
    LongDown = 3,
}

impl Status {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: i64) -> Option<Status> {
        match code {
            0 => Some(Status::Down),
            1 => Some(Status::Up),
            2 => Some(Status::Unknown),
            3 => Some(Status::LongDown),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Down => "down",
            Status::Up => "up",
            Status::Unknown => "unknown",
            Status::LongDown => "long_down",
        }
    }

    /// LONG_DOWN is a flavour of DOWN everywhere outside its own script set.
    pub fn is_down(self) -> bool {
        matches!(self, Status::Down | Status::LongDown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupLogic {
    Or = 0,
    And = 1,
}

/// One probed connection. Immutable for the lifetime of a monitoring cycle;
/// a reload builds a fresh set.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub name: String,
    pub check_ip: String,
    /// Numeric address `check_ip` resolved to at load time.
    pub resolved: IpAddr,
    pub source_ip: Option<String>,
    pub source_addr: Option<IpAddr>,
    pub device: Option<String>,
    pub check_arp: bool,
    pub ttl: Option<u32>,
    pub interval_ms: u32,
    pub timeout_ms: u32,
    pub max_packet_loss: u32,
    pub max_successive_pkts_lost: u32,
    pub min_packet_loss: u32,
    pub min_successive_pkts_rcvd: u32,
    pub event_script: Option<String>,
    pub notify_script: Option<String>,
    pub unknown_up_notify: bool,
    pub warn_email: Option<String>,
    /// Seconds of continuous DOWN before the long-down event; 0 disables.
    pub long_down_time: u64,
    pub long_down_email: Option<String>,
    pub long_down_event_script: Option<String>,
    pub long_down_notify_script: Option<String>,
    pub queue: Option<String>,
    pub startup_acceleration: bool,
    pub startup_burst_pkts: u32,
    pub startup_burst_interval_us: u64,
    pub status: Status,
}

impl ConnectionConfig {
    /// Built-in defaults, overridable through a `defaults` block.
    fn defaults() -> Self {
        Self {
            name: "defaults".to_string(),
            check_ip: "127.0.0.1".to_string(),
            resolved: IpAddr::V4(Ipv4Addr::LOCALHOST),
            source_ip: None,
            source_addr: None,
            device: None,
            check_arp: false,
            ttl: None,
            interval_ms: 1000,
            timeout_ms: 1000,
            max_packet_loss: 15,
            max_successive_pkts_lost: 7,
            min_packet_loss: 5,
            min_successive_pkts_rcvd: 10,
            event_script: None,
            notify_script: None,
            unknown_up_notify: false,
            warn_email: Some("root".to_string()),
            long_down_time: 0,
            long_down_email: None,
            long_down_event_script: None,
            long_down_notify_script: None,
            queue: None,
            startup_acceleration: false,
            startup_burst_pkts: 0,
            startup_burst_interval_us: 20_000,
            status: Status::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GroupConfig {
    pub name: String,
    pub logic: GroupLogic,
    pub members: Vec<String>,
    /// Member names resolved to connection indices at load time.
    pub member_idx: Vec<usize>,
    pub event_script: Option<String>,
    pub notify_script: Option<String>,
    pub unknown_up_notify: bool,
    pub warn_email: Option<String>,
    pub queue: Option<String>,
    pub status: Status,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub debug: u32,
    pub connections: Vec<ConnectionConfig>,
    pub groups: Vec<GroupConfig>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("can't open config file \"{path}\": {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("{count} error(s) in configuration")]
    Invalid { count: usize },
}

/// Read, parse and validate the whole configuration rooted at `path`.
pub fn load(path: &str) -> Result<Config, ConfigError> {
    let mut parser = Parser::new();
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Open {
        path: path.to_string(),
        source,
    })?;
    parser.parse_text(Path::new(path), &text);
    parser.finish()
}

/// Parse and validate a configuration from a string. Include directives
/// resolve relative to the working directory.
pub fn load_from_text(text: &str) -> Result<Config, ConfigError> {
    let mut parser = Parser::new();
    parser.parse_text(Path::new("<inline>"), text);
    parser.finish()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Top,
    Defaults,
    Connection,
    Group,
}

struct Parser {
    defaults: ConnectionConfig,
    debug: u32,
    connections: Vec<ConnectionConfig>,
    groups: Vec<GroupConfig>,
    errors: usize,
}

impl Parser {
    fn new() -> Self {
        Self {
            defaults: ConnectionConfig::defaults(),
            debug: 8,
            connections: Vec::new(),
            groups: Vec::new(),
            errors: 0,
        }
    }

    fn fail(&mut self, file: &Path, line: usize, msg: &str) {
        error!("{}:{}: {}", file.display(), line, msg);
        self.errors += 1;
    }

    fn parse_text(&mut self, file: &Path, text: &str) {
        let mut mode = Mode::Top;
        for (lineno, raw) in text.lines().enumerate() {
            let lineno = lineno + 1;
            let line = match raw.find('#') {
                Some(pos) => &raw[..pos],
                None => raw,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if mode != Mode::Top {
                if line == "}" {
                    mode = Mode::Top;
                    continue;
                }
                match split_kv(line) {
                    Some((key, value)) => self.block_entry(mode, key, value, file, lineno),
                    None => self.fail(file, lineno, &format!("expected key=value, got \"{}\"", line)),
                }
                continue;
            }

            if let Some(rest) = block_start(line, "defaults") {
                if rest.is_empty() {
                    mode = Mode::Defaults;
                    continue;
                }
            }
            if let Some(rest) = block_start(line, "connection") {
                if rest.is_empty() {
                    mode = Mode::Connection;
                    self.connections.push(self.defaults.clone());
                    continue;
                }
            }
            if let Some(rest) = block_start(line, "group") {
                if rest.is_empty() {
                    mode = Mode::Group;
                    let d = &self.defaults;
                    self.groups.push(GroupConfig {
                        name: d.name.clone(),
                        logic: GroupLogic::Or,
                        members: Vec::new(),
                        member_idx: Vec::new(),
                        event_script: d.event_script.clone(),
                        notify_script: d.notify_script.clone(),
                        unknown_up_notify: d.unknown_up_notify,
                        warn_email: d.warn_email.clone(),
                        queue: d.queue.clone(),
                        status: d.status,
                    });
                    continue;
                }
            }
            if let Some(pattern) = line.strip_prefix("include ") {
                self.include(file, lineno, pattern.trim(), true);
                continue;
            }
            if let Some(pattern) = line.strip_prefix("-include ") {
                self.include(file, lineno, pattern.trim(), false);
                continue;
            }
            match split_kv(line) {
                Some(("debug", value)) => {
                    self.debug = self.parse_int(file, lineno, "debug", value) as u32;
                }
                _ => self.fail(
                    file,
                    lineno,
                    &format!("unrecognised global config option \"{}\"", line),
                ),
            }
        }
        if mode != Mode::Top {
            self.fail(file, 0, "missing closing bracket at end of config file");
        }
    }

    fn block_entry(&mut self, mode: Mode, key: &str, value: &str, file: &Path, lineno: usize) {
        match mode {
            Mode::Defaults => {
                // defaults and connections accept the same keys
                let mut defaults = std::mem::replace(&mut self.defaults, ConnectionConfig::defaults());
                self.connection_entry(&mut defaults, key, value, file, lineno);
                self.defaults = defaults;
            }
            Mode::Connection => {
                let mut conn = self.connections.pop().expect("inside connection block");
                self.connection_entry(&mut conn, key, value, file, lineno);
                self.connections.push(conn);
            }
            Mode::Group => {
                let mut group = self.groups.pop().expect("inside group block");
                self.group_entry(&mut group, key, value, file, lineno);
                self.groups.push(group);
            }
            Mode::Top => unreachable!(),
        }
    }

    fn connection_entry(
        &mut self,
        c: &mut ConnectionConfig,
        key: &str,
        value: &str,
        file: &Path,
        lineno: usize,
    ) {
        match key {
            "name" => c.name = value.to_string(),
            "checkip" => c.check_ip = value.to_string(),
            "sourceip" => c.source_ip = some_string(value),
            "device" => c.device = some_string(value),
            "eventscript" => c.event_script = some_string(value),
            "notifyscript" => c.notify_script = some_string(value),
            "unknown_up_notify" => c.unknown_up_notify = self.parse_int(file, lineno, key, value) != 0,
            "max_packet_loss" => c.max_packet_loss = self.parse_int(file, lineno, key, value) as u32,
            "max_successive_pkts_lost" => {
                c.max_successive_pkts_lost = self.parse_int(file, lineno, key, value) as u32
            }
            "min_packet_loss" => c.min_packet_loss = self.parse_int(file, lineno, key, value) as u32,
            "min_successive_pkts_rcvd" => {
                c.min_successive_pkts_rcvd = self.parse_int(file, lineno, key, value) as u32
            }
            "interval_ms" => c.interval_ms = self.parse_int(file, lineno, key, value) as u32,
            "timeout_ms" => c.timeout_ms = self.parse_int(file, lineno, key, value) as u32,
            "warn_email" => c.warn_email = some_string(value),
            "check_arp" => c.check_arp = self.parse_int(file, lineno, key, value) != 0,
            "ttl" => {
                let ttl = self.parse_int(file, lineno, key, value);
                c.ttl = if ttl > 0 { Some(ttl as u32) } else { None };
            }
            "status" => match Status::from_code(self.parse_int(file, lineno, key, value)) {
                Some(status) => c.status = status,
                None => self.fail(file, lineno, &format!("invalid status \"{}\"", value)),
            },
            "queue" => c.queue = some_string(value),
            "long_down_time" => c.long_down_time = self.parse_int(file, lineno, key, value) as u64,
            "long_down_email" => c.long_down_email = some_string(value),
            "long_down_notifyscript" => c.long_down_notify_script = some_string(value),
            "long_down_eventscript" => c.long_down_event_script = some_string(value),
            "startup_acceleration" => {
                c.startup_acceleration = self.parse_int(file, lineno, key, value) != 0
            }
            "startup_burst_pkts" => {
                c.startup_burst_pkts = self.parse_int(file, lineno, key, value) as u32
            }
            "startup_burst_interval" => {
                c.startup_burst_interval_us = self.parse_int(file, lineno, key, value) as u64
            }
            _ => self.fail(
                file,
                lineno,
                &format!("unrecognised connection config option \"{}\"", key),
            ),
        }
    }

    fn group_entry(
        &mut self,
        g: &mut GroupConfig,
        key: &str,
        value: &str,
        file: &Path,
        lineno: usize,
    ) {
        match key {
            "name" => g.name = value.to_string(),
            "eventscript" => g.event_script = some_string(value),
            "notifyscript" => g.notify_script = some_string(value),
            "unknown_up_notify" => g.unknown_up_notify = self.parse_int(file, lineno, key, value) != 0,
            "warn_email" => g.warn_email = some_string(value),
            "logic" => {
                g.logic = if self.parse_int(file, lineno, key, value) != 0 {
                    GroupLogic::And
                } else {
                    GroupLogic::Or
                }
            }
            "status" => match Status::from_code(self.parse_int(file, lineno, key, value)) {
                Some(status) => g.status = status,
                None => self.fail(file, lineno, &format!("invalid status \"{}\"", value)),
            },
            "queue" => g.queue = some_string(value),
            "member-connection" => g.members.push(value.to_string()),
            _ => self.fail(
                file,
                lineno,
                &format!("unrecognised group config option \"{}\"", key),
            ),
        }
    }

    fn parse_int(&mut self, file: &Path, lineno: usize, key: &str, value: &str) -> i64 {
        match value.parse::<i64>() {
            Ok(v) => v,
            Err(_) => {
                self.fail(
                    file,
                    lineno,
                    &format!("option \"{}\" needs an integer, got \"{}\"", key, value),
                );
                0
            }
        }
    }

    /// Process an `include` directive: split into directory and filename
    /// pattern, pull in every match in sorted order. Editor backups are
    /// skipped. With `must_exist`, zero matches is an error.
    fn include(&mut self, file: &Path, lineno: usize, pattern: &str, must_exist: bool) {
        let full = PathBuf::from(pattern);
        let dir = match full.parent() {
            Some(p) if p.as_os_str().is_empty() => PathBuf::from("."),
            Some(p) => p.to_path_buf(),
            None => PathBuf::from("."),
        };
        let name_pattern = match full.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => {
                self.fail(file, lineno, &format!("bad include pattern \"{}\"", pattern));
                return;
            }
        };

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                if must_exist {
                    self.fail(
                        file,
                        lineno,
                        &format!("can't read directory \"{}\": {}", dir.display(), e),
                    );
                }
                return;
            }
        };

        let mut matches: Vec<PathBuf> = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(n) => n,
                None => continue,
            };
            if glob_match(&name_pattern, name) && !name.ends_with('~') {
                matches.push(entry.path());
            }
        }
        matches.sort();

        if matches.is_empty() {
            if must_exist {
                self.fail(
                    file,
                    lineno,
                    &format!("no config files found for \"{}\"", pattern),
                );
            }
            return;
        }

        for path in matches {
            match fs::read_to_string(&path) {
                Ok(text) => self.parse_text(&path, &text),
                Err(e) => self.fail(
                    file,
                    lineno,
                    &format!("can't open included file \"{}\": {}", path.display(), e),
                ),
            }
        }
    }

    /// Resolve addresses, check parameter sanity and wire group members to
    /// their connections.
    fn finish(mut self) -> Result<Config, ConfigError> {
        for i in 0..self.connections.len() {
            let mut c = self.connections[i].clone();

            if c.check_ip.is_empty() {
                error!("connection \"{}\" has no checkip parameter set", c.name);
                self.errors += 1;
            } else {
                match resolve_host(&c.check_ip) {
                    Ok(addr) => c.resolved = addr,
                    Err(e) => {
                        error!("connection \"{}\" checkip is invalid: {}", c.name, e);
                        self.errors += 1;
                    }
                }
            }

            if let Some(source) = c.source_ip.clone() {
                match resolve_host(&source) {
                    Ok(addr) => {
                        if addr.is_ipv4() != c.resolved.is_ipv4() {
                            error!(
                                "connection \"{}\" sourceip and checkip have unmatching protocol families",
                                c.name
                            );
                            self.errors += 1;
                        }
                        c.source_addr = Some(addr);
                    }
                    Err(e) => {
                        error!("connection \"{}\" sourceip is invalid: {}", c.name, e);
                        self.errors += 1;
                    }
                }
            }

            if c.check_arp && c.resolved.is_ipv6() {
                error!("connection \"{}\" ipv6 and arp probing are not compatible", c.name);
                self.errors += 1;
            }

            if c.max_packet_loss <= c.min_packet_loss {
                error!(
                    "connection \"{}\" max_packet_loss ({}) <= min_packet_loss ({}). that would cause flip-flop effect",
                    c.name, c.max_packet_loss, c.min_packet_loss
                );
                self.errors += 1;
            }

            self.connections[i] = c;
        }

        for g in self.groups.iter_mut() {
            g.member_idx.clear();
            for member in &g.members {
                match self.connections.iter().position(|c| c.name == *member) {
                    Some(idx) => g.member_idx.push(idx),
                    None => {
                        error!("connection group member \"{}\" not found", member);
                        self.errors += 1;
                    }
                }
            }
        }

        if self.errors > 0 {
            return Err(ConfigError::Invalid { count: self.errors });
        }
        Ok(Config {
            debug: self.debug,
            connections: self.connections,
            groups: self.groups,
        })
    }
}

fn some_string(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Split a `key = value` line; whitespace around the first `=` is free.
fn split_kv(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once('=')?;
    Some((key.trim(), value.trim()))
}

/// Recognise a block opener like `connection {`, tolerating missing or
/// extra whitespace before the brace.
fn block_start<'a>(line: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(keyword)?;
    let rest = rest.trim_start();
    rest.strip_prefix('{').map(str::trim)
}

/// Minimal shell-style filename matching: `*` and `?` only, which is all
/// include directives have ever needed.
fn glob_match(pattern: &str, name: &str) -> bool {
    fn inner(p: &[u8], n: &[u8]) -> bool {
        match p.first() {
            None => n.is_empty(),
            Some(b'*') => inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..])),
            Some(b'?') => !n.is_empty() && inner(&p[1..], &n[1..]),
            Some(c) => n.first() == Some(c) && inner(&p[1..], &n[1..]),
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}

/// Turn a literal address or hostname into a numeric address.
fn resolve_host(host: &str) -> Result<IpAddr, String> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    match (host, 1025u16).to_socket_addrs() {
        Ok(mut addrs) => addrs
            .next()
            .map(|a| a.ip())
            .ok_or_else(|| format!("no addresses for \"{}\"", host)),
        Err(e) => Err(e.to_string()),
    }
}
