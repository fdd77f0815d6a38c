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

//! AND/OR aggregation of member connection statuses.
//!
//! The combination is bitwise over the numeric status codes, which is
//! equivalent to boolean logic because DOWN=0 and UP=1; the accumulator
//! starts at the logic's identity (0 for OR, 1 for AND). LONG_DOWN counts
//! as DOWN, and any UNKNOWN member short-circuits the whole group to
//! UNKNOWN.

use std::time::SystemTime;

use crate::config::{GroupConfig, GroupLogic, Status};
use crate::monitor::{EventKind, Transition};
use crate::target::Target;

/// Fold member statuses into one group status.
fn aggregate_status<I>(logic: GroupLogic, members: I) -> Status
where
    I: IntoIterator<Item = Status>,
{
    let mut acc = logic as u8;
    for status in members {
        if status == Status::Unknown {
            return Status::Unknown;
        }
        let bit = if status.is_down() {
            Status::Down.code()
        } else {
            status.code()
        };
        acc = match logic {
            GroupLogic::Or => acc | bit,
            GroupLogic::And => acc & bit,
        };
    }
    Status::from_code(i64::from(acc)).unwrap_or(Status::Unknown)
}

/// Recompute every group and return the transitions to dispatch. A change
/// to UNKNOWN updates the tracked status silently.
pub fn evaluate(
    groups: &mut [GroupConfig],
    targets: &[Target],
    now: SystemTime,
) -> Vec<(usize, Transition)> {
    let mut events = Vec::new();
    for (gi, g) in groups.iter_mut().enumerate() {
        let status = aggregate_status(g.logic, g.member_idx.iter().map(|&i| targets[i].status));
        if status == g.status {
            continue;
        }
        match status {
            Status::Up => {
                debug!("group {} up event", g.name);
                events.push((
                    gi,
                    Transition {
                        kind: EventKind::Up,
                        prev: g.status,
                        stamp: now,
                    },
                ));
            }
            Status::Down => {
                debug!("group {} down event", g.name);
                events.push((
                    gi,
                    Transition {
                        kind: EventKind::Down,
                        prev: g.status,
                        stamp: now,
                    },
                ));
            }
            _ => {}
        }
        g.status = status;
    }
    events
}
