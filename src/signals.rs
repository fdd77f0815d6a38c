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

//! Async signal handling.
//!
//! The handler only stores to atomic flags, which keeps it trivially
//! async-signal-safe and leaves errno untouched. The main loop observes
//! the flags at its checkpoints; in particular SIGCHLD reaping is deferred
//! there instead of mutating the exec queues from the handler.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

static STOP: AtomicBool = AtomicBool::new(false);
static RELOAD: AtomicBool = AtomicBool::new(false);
static DUMP: AtomicBool = AtomicBool::new(false);
static DUMP_IFACES: AtomicBool = AtomicBool::new(false);
static CHILD: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(signo: libc::c_int) {
    match signo {
        libc::SIGINT | libc::SIGTERM => STOP.store(true, Ordering::SeqCst),
        libc::SIGHUP => RELOAD.store(true, Ordering::SeqCst),
        libc::SIGUSR1 => DUMP.store(true, Ordering::SeqCst),
        libc::SIGUSR2 => DUMP_IFACES.store(true, Ordering::SeqCst),
        libc::SIGCHLD => CHILD.store(true, Ordering::SeqCst),
        _ => {}
    }
}

/// Install the handlers. SIGTERM behaves like SIGINT so service managers
/// get a clean shutdown too.
pub fn install() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in [
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGHUP,
        Signal::SIGUSR1,
        Signal::SIGUSR2,
    ] {
        unsafe { sigaction(signal, &action)? };
    }
    let child_action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGCHLD, &child_action)? };
    Ok(())
}

pub fn stop_requested() -> bool {
    STOP.load(Ordering::SeqCst)
}

pub fn take_reload() -> bool {
    RELOAD.swap(false, Ordering::SeqCst)
}

pub fn take_dump() -> bool {
    DUMP.swap(false, Ordering::SeqCst)
}

pub fn take_dump_ifaces() -> bool {
    DUMP_IFACES.swap(false, Ordering::SeqCst)
}

pub fn take_child() -> bool {
    CHILD.swap(false, Ordering::SeqCst)
}
