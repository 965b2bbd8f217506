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

//! Boot-time entry point. Takes no command-line flags: the entire
//! configuration surface is the fixed filesystem layout in
//! [`libsysboot::paths::Paths`].

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info};

use libsysboot::paths::Paths;
use libsysboot::{diagnostics, fsutil, selector};

/// Window given to a prior Supervisor version to finish its own startup
/// before we proceed, matching the outer daemonization protocol's handoff.
const DAEMONIZE_HANDOFF_WINDOW: Duration = Duration::from_secs(5);

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run() {
        error!("{e:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let paths = Paths::default();

    let read_only = paths.is_read_only_mode();
    if !read_only {
        ensure_bind_mounts(&paths)?;
    }

    thread::sleep(DAEMONIZE_HANDOFF_WINDOW);

    let mut prev_exit_code: Option<i32> = None;
    loop {
        if !read_only {
            selector::select(&paths)?;
        }

        match selector::run_one_cycle(&paths, prev_exit_code)? {
            selector::Outcome::CleanExit => {
                info!("Supervisor shut down cleanly");
                std::process::exit(0);
            }
            selector::Outcome::Continue { exit_code } => {
                prev_exit_code = exit_code;
            }
            selector::Outcome::Reboot => {
                diagnostics::dump_syslog_tail(40);
                diagnostics::sync_and_reboot()?;
            }
        }
    }
}

/// Bind-mounts the systems root and the home directory from their backing
/// partitions, and makes sure `/home/root` exists if that filesystem is
/// writable.
fn ensure_bind_mounts(paths: &Paths) -> Result<()> {
    fsutil::bind_mount_if_needed(&paths.systems_root_backing, &paths.systems_root)
        .context("bind-mounting systems root")?;

    let home = std::path::Path::new("/home");
    fsutil::bind_mount_if_needed(&paths.home_backing, home).context("bind-mounting /home")?;

    if home.is_dir() {
        let home_root = home.join("root");
        if !home_root.exists() {
            std::fs::create_dir_all(&home_root)
                .with_context(|| format!("creating {}", home_root.display()))?;
        }
    }
    Ok(())
}
