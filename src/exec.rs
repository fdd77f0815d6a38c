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

//! Serialised execution of transition scripts.
//!
//! Scripts configured with a queue name line up in per-queue FIFOs; each
//! queue runs at most one child at a time and advances when that child is
//! reaped. Scripts without a queue spawn directly and run concurrently
//! with everything.
//!
//! Children are never waited on through their `Child` handle. The SIGCHLD
//! handler only raises a flag; the main loop calls [`ExecQueues::reap`] at
//! its checkpoints, which drains `waitpid(-1)` and removes finished queue
//! entries. Directly spawned children have no entry, their pid just falls
//! through the delete.

use std::collections::VecDeque;
use std::process::{Command, Stdio};

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

/// Environment passed to every script: LANG, PATH and TERM from the
/// daemon's own environment, nothing else.
pub fn script_env() -> Vec<(String, String)> {
    ["LANG", "PATH", "TERM"]
        .iter()
        .map(|key| (key.to_string(), std::env::var(key).unwrap_or_default()))
        .collect()
}

/// Spawn a script with the fixed positional argument vector. The child is
/// intentionally leaked to the global reaper.
pub fn spawn_script(argv: &[String]) -> std::io::Result<u32> {
    let child = Command::new(&argv[0])
        .args(&argv[1..])
        .env_clear()
        .envs(script_env())
        .stdin(Stdio::null())
        .spawn()?;
    let pid = child.id();
    debug!("child process forked with pid {}", pid);
    drop(child);
    Ok(pid)
}

#[derive(Debug)]
struct Entry {
    /// None while queued; set once the entry reaches the head and spawns.
    pid: Option<u32>,
    argv: Vec<String>,
}

#[derive(Debug)]
struct Queue {
    name: String,
    entries: VecDeque<Entry>,
}

#[derive(Debug, Default)]
pub struct ExecQueues {
    queues: Vec<Queue>,
}

impl ExecQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an invocation to the named queue, creating it on first use.
    pub fn add(&mut self, queue: &str, argv: Vec<String>) {
        let entry = Entry { pid: None, argv };
        match self.queues.iter_mut().find(|q| q.name == queue) {
            Some(q) => {
                trace!("found queue {}", queue);
                q.entries.push_back(entry);
            }
            None => {
                trace!("queue {} not found, adding new queue", queue);
                let mut entries = VecDeque::new();
                entries.push_back(entry);
                self.queues.push(Queue {
                    name: queue.to_string(),
                    entries,
                });
            }
        }
    }

    /// Launch the head of every queue that has no running child. Entries
    /// behind the head are not touched.
    pub fn process(&mut self) {
        for q in self.queues.iter_mut() {
            let head = match q.entries.front_mut() {
                Some(head) if head.pid.is_none() => head,
                _ => continue,
            };
            match spawn_script(&head.argv) {
                Ok(pid) => head.pid = Some(pid),
                Err(e) => {
                    // no retry; the transition already stands
                    error!(
                        "queue {}: failed to execute \"{}\": {}",
                        q.name, head.argv[0], e
                    );
                    q.entries.pop_front();
                }
            }
        }
    }

    /// Remove the entry running as `pid`. Unknown pids (directly spawned
    /// notify scripts) are a no-op.
    pub fn delete(&mut self, pid: u32) -> bool {
        for q in self.queues.iter_mut() {
            if let Some(pos) = q.entries.iter().position(|e| e.pid == Some(pid)) {
                q.entries.remove(pos);
                return true;
            }
        }
        trace!("child pid {} not found in any queue", pid);
        false
    }

    /// Drain every exited child and advance the queues they belonged to.
    pub fn reap(&mut self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    if code != 0 {
                        debug!("child script with pid {} exited with value {}", pid, code);
                    } else {
                        trace!("child script with pid {} exited successfully", pid);
                    }
                    self.delete(pid.as_raw() as u32);
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    debug!("child script with pid {} killed by {}", pid, signal);
                    self.delete(pid.as_raw() as u32);
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => continue,
                Err(Errno::ECHILD) => break,
                Err(e) => {
                    trace!("waitpid failed: {}", e);
                    break;
                }
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.queues.iter().map(|q| q.entries.len()).sum()
    }

    #[cfg(test)]
    fn queue(&self, name: &str) -> Option<&Queue> {
        self.queues.iter().find(|q| q.name == name)
    }
}
