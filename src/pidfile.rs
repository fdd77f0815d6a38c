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

//! PID file handling. The file doubles as the single-instance lock: a
//! second daemon fails to take the lock and exits. The lock lives as long
//! as the returned guard; dropping it removes the file.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use nix::fcntl::{Flock, FlockArg};

pub struct PidFile {
    path: PathBuf,
    _lock: Flock<File>,
}

pub fn create(path: &str) -> Result<PidFile> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(0o640)
        .open(path)
        .with_context(|| format!("can't open pid file {}", path))?;

    let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => lock,
        Err((_, e)) => {
            bail!("can't lock pid file {} (another instance running?): {}", path, e);
        }
    };

    lock.set_len(0)
        .with_context(|| format!("can't truncate pid file {}", path))?;
    let mut writer: &File = &lock;
    writeln!(writer, "{}", std::process::id())
        .with_context(|| format!("can't write pid file {}", path))?;

    Ok(PidFile {
        path: PathBuf::from(path),
        _lock: lock,
    })
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            debug!("could not remove pid file {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_own_pid_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linkmond.pid");
        let path_str = path.to_str().unwrap();

        let guard = create(path_str).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());

        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn second_instance_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linkmond.pid");
        let path_str = path.to_str().unwrap();

        let _guard = create(path_str).unwrap();
        assert!(create(path_str).is_err());
    }
}
