// Copyright 2019 CoreOS, Inc.
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

//! Reboot-triggering diagnostics: a console dump of the tail of the system
//! log, and the reboot call itself. Reads the log file directly and writes
//! to stderr, with no shell interpretation (no `logread | tail` pipe).

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use anyhow::{Context, Result};
use log::warn;

const SYSLOG_PATH: &str = "/var/log/syslog";

/// Writes the last `n` lines of the system log to stderr. Best-effort: if
/// the log can't be read, logs a warning and returns without dumping
/// anything.
pub fn dump_syslog_tail(n: usize) {
    if let Err(e) = dump_tail(Path::new(SYSLOG_PATH), n) {
        warn!("could not dump syslog tail: {e}");
    }
}

fn dump_tail(path: &Path, n: usize) -> Result<()> {
    let f = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = BufReader::new(f);
    let mut ring: std::collections::VecDeque<String> = std::collections::VecDeque::with_capacity(n);
    for line in reader.lines() {
        let line = line.with_context(|| format!("reading {}", path.display()))?;
        if ring.len() == n {
            ring.pop_front();
        }
        ring.push_back(line);
    }
    let stderr = std::io::stderr();
    let mut lock = stderr.lock();
    for line in ring {
        writeln!(lock, "{line}").ok();
    }
    Ok(())
}

/// Syncs filesystems and reboots the device. Fatal if the reboot syscall
/// itself fails -- there is no fallback.
pub fn sync_and_reboot() -> Result<()> {
    unsafe { libc::sync() };
    nix::sys::reboot::reboot(nix::sys::reboot::RebootMode::RB_AUTOBOOT)
        .context("invoking reboot")?;
    unreachable!("reboot() does not return on success");
}
