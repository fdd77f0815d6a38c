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

//! Wall-clock arithmetic used by all the periodic probe and decision logic.
//!
//! Everything here works on `SystemTime` because the send/reply stamps have
//! to survive comparisons against wall-clock data carried in probe payloads
//! and passed to external scripts.

use std::time::{Duration, SystemTime};

/// Signed difference `a - b` in microseconds.
pub fn diff_us(a: SystemTime, b: SystemTime) -> i64 {
    match a.duration_since(b) {
        Ok(d) => d.as_micros() as i64,
        Err(e) => -(e.duration().as_micros() as i64),
    }
}

/// True when more than `d` has elapsed between `b` and `a`.
///
/// A clock that stepped backwards (`a` before `b`) counts as nothing having
/// elapsed.
pub fn at_least(a: SystemTime, b: SystemTime, d: Duration) -> bool {
    match a.duration_since(b) {
        Ok(elapsed) => elapsed > d,
        Err(_) => false,
    }
}

/// True when less than `d` has elapsed between `b` and `a`.
pub fn less_than(a: SystemTime, b: SystemTime, d: Duration) -> bool {
    match a.duration_since(b) {
        Ok(elapsed) => elapsed < d,
        Err(_) => true,
    }
}

/// Seconds since the Unix epoch, as handed to external scripts.
pub fn epoch_secs(t: SystemTime) -> u64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
