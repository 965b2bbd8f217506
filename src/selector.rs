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

//! The boot-time decision procedure: pick a system, install the golden
//! image if required, demote/promote around rollback, launch the
//! Supervisor, and interpret its exit code.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::os::unix::process::ExitStatusExt;
use std::process::Command;

use anyhow::{bail, Context, Result};
use log::{info, warn};
use nix::unistd::dup2;

use crate::fsutil;
use crate::install;
use crate::paths::{Paths, SystemName};
use crate::status::{self, Status};
use crate::systems;

/// What the driver should do after one pass through the selector/run cycle.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Loop again, with `exit_code` fed back in as `prev_exit_code` next
    /// time (this replaces a hidden `lastExitCode` global with an explicit
    /// value threaded by the caller).
    Continue { exit_code: Option<i32> },
    /// The Supervisor shut down cleanly; the driver should exit(0).
    CleanExit,
    /// The Supervisor failed or was killed; the driver should dump
    /// diagnostics and reboot.
    Reboot,
}

/// Performs the system-selection half of one cycle: reconciles `current`
/// against the newest non-bad system, installing the golden image or
/// demoting/promoting as needed. Does not run the Supervisor.
pub fn select(paths: &Paths) -> Result<()> {
    systems::reset_unpack_dir(&paths.unpack())?;

    let mut newest = systems::newest_non_bad(paths)?;
    let cur_idx = systems::read_current_index(paths)?;

    if install::should_install_golden(paths, newest)? {
        let installed = install::install_golden(paths, newest)?;
        newest = Some(installed);
    } else if newest != cur_idx {
        reconcile_current(paths, cur_idx, newest)?;
    }

    if paths.ldconfig_needed_marker.is_file() {
        refresh_ldconfig(paths);
    }

    Ok(())
}

/// Handles the `newest != cur_idx` branch: demotes the current current (if
/// any), imports its config into the newest system if it wasn't bad, and
/// promotes the newest system to `current`.
fn reconcile_current(paths: &Paths, cur_idx: Option<u64>, newest: Option<u64>) -> Result<()> {
    let Some(newest_idx) = newest else {
        // No non-bad system exists and the golden installer declined to
        // run; nothing to promote. Leave things as they are.
        return Ok(());
    };

    if let Some(idx) = cur_idx {
        let current = paths.current();
        fsutil::try_lazy_unmount(&current);
        let status = systems::get_status(paths, SystemName::Current)?;
        let demoted = paths.indexed(idx);
        fsutil::rename(&current, &demoted).context("demoting current")?;

        match status {
            Status::Bad => {
                info!("current (system {idx}) is bad, discarding it");
                fsutil::recursive_delete(&demoted);
            }
            Status::Tryable(_) | Status::New => {
                import_config(paths, idx, newest_idx)?;
                info!("current (system {idx}) was unproven, discarding it after harvest");
                fsutil::recursive_delete(&demoted);
            }
            Status::Good => {
                import_config(paths, idx, newest_idx)?;
            }
        }
    }

    promote_to_current(paths, newest_idx)
}

fn import_config(paths: &Paths, from_idx: u64, to_idx: u64) -> Result<()> {
    let src = systems::config_dir(&paths.indexed(from_idx));
    let dst = systems::config_dir(&paths.indexed(to_idx));
    if !src.is_dir() {
        return Ok(());
    }
    copy_tree(&src, &dst).with_context(|| format!("importing config from system {from_idx}"))
}

fn copy_tree(src: &std::path::Path, dst: &std::path::Path) -> Result<()> {
    std::fs::create_dir_all(dst).with_context(|| format!("creating {}", dst.display()))?;
    for entry in std::fs::read_dir(src).with_context(|| format!("reading {}", src.display()))? {
        let entry = entry.with_context(|| format!("reading entry under {}", src.display()))?;
        let file_type = entry
            .file_type()
            .with_context(|| format!("stat {}", entry.path().display()))?;
        let dst_path = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_tree(&entry.path(), &dst_path)?;
        } else if file_type.is_symlink() {
            if !dst_path.exists() {
                let target = std::fs::read_link(entry.path())?;
                std::os::unix::fs::symlink(target, &dst_path)
                    .with_context(|| format!("linking {}", dst_path.display()))?;
            }
        } else if !dst_path.exists() {
            std::fs::copy(entry.path(), &dst_path)
                .with_context(|| format!("copying {}", dst_path.display()))?;
        }
    }
    Ok(())
}

fn promote_to_current(paths: &Paths, idx: u64) -> Result<()> {
    fsutil::rename(&paths.indexed(idx), &paths.current())
        .with_context(|| format!("promoting system {idx} to current"))
}

fn refresh_ldconfig(paths: &Paths) {
    let status = Command::new("/sbin/ldconfig").status();
    match status {
        Ok(s) if s.success() => {
            if let Err(e) = std::fs::remove_file(&paths.ldconfig_needed_marker) {
                warn!("removing ldconfig-needed marker: {e}");
            }
        }
        Ok(s) => warn!("ldconfig exited with {s}"),
        Err(e) => warn!("running ldconfig: {e}"),
    }
}

/// Bumps `current`'s try count (unless the status says otherwise), runs the
/// Supervisor to completion, and classifies the result.
///
/// `prev_exit_code` is the previous cycle's raw Supervisor exit code,
/// threaded explicitly rather than held in a module-level global: it is
/// only consulted for the exit-code-3 "don't bump a proven system" rule.
pub fn run_one_cycle(paths: &Paths, prev_exit_code: Option<i32>) -> Result<Outcome> {
    let status = systems::get_status(paths, SystemName::Current)?;
    match status {
        Status::Bad => bail!("invariant violation: current is Bad at run time"),
        Status::Good => {}
        Status::Tryable(n) => maybe_bump_tries(paths, n, prev_exit_code)?,
        Status::New => maybe_bump_tries(paths, 0, prev_exit_code)?,
    }

    let exit_status = launch_supervisor(paths)?;

    match exit_status.code() {
        Some(0) => Ok(Outcome::CleanExit),
        Some(2) => Ok(Outcome::Continue {
            exit_code: Some(2),
        }),
        Some(3) => Ok(Outcome::Continue {
            exit_code: Some(3),
        }),
        Some(other) => {
            warn!("Supervisor exited with unexpected code {other}");
            Ok(Outcome::Reboot)
        }
        None => {
            warn!(
                "Supervisor killed by signal {:?}",
                exit_status.signal()
            );
            Ok(Outcome::Reboot)
        }
    }
}

/// Writes `tried (n+1)` unless the previous run exited with code 3 and
/// `n > 0` -- i.e. a proven-at-least-once system that the user explicitly
/// asked to restart keeps its try count.
fn maybe_bump_tries(paths: &Paths, n: u32, prev_exit_code: Option<i32>) -> Result<()> {
    if prev_exit_code == Some(3) && n > 0 {
        return Ok(());
    }
    let path = paths.current().join("status");
    fsutil::write_file(&path, &status::emit_tried(n + 1))
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Forks/execs the Supervisor with `--no-daemonize` and waits for it to
/// exit. Before waiting, the parent reopens its own stdin onto `/dev/null`
/// so that only the freshly-spawned child retains the write end of the
/// hand-off pipe used by the outer daemonization protocol.
fn launch_supervisor(paths: &Paths) -> Result<std::process::ExitStatus> {
    let supervisor = paths.current().join("bin/supervisor");
    let mut child = Command::new(&supervisor)
        .arg("--no-daemonize")
        .spawn()
        .with_context(|| format!("executing {}", supervisor.display()))?;

    let null = File::open("/dev/null").context("opening /dev/null")?;
    dup2(null.as_raw_fd(), 0).context("reopening stdin onto /dev/null")?;

    child
        .wait()
        .with_context(|| format!("waiting for {}", supervisor.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::STANDARD_CONFIG_FILES;
    use std::fs;
    use tempfile::tempdir;

    fn make_factory(root: &std::path::Path) -> Paths {
        let factory = root.join("factory");
        fs::create_dir_all(factory.join("bin")).unwrap();
        fs::create_dir_all(factory.join("lib")).unwrap();
        fs::create_dir_all(factory.join("modules")).unwrap();
        fs::create_dir_all(factory.join("config")).unwrap();
        fs::create_dir_all(factory.join("apps")).unwrap();
        for name in STANDARD_CONFIG_FILES {
            fs::write(factory.join("config").join(name), b"cfg").unwrap();
        }
        fs::write(factory.join("version"), b"1.0").unwrap();
        fs::write(factory.join("info.properties"), b"info").unwrap();

        let mut paths = Paths::default();
        paths.factory_root = factory;
        paths.systems_root = root.join("systems");
        paths.app_store = root.join("appStore");
        paths.factory_version_marker = root.join("systems/.installedFactoryVersion");
        paths.ldconfig_needed_marker = root.join("systems/.needsLdconfigRefresh");
        fs::create_dir_all(&paths.systems_root).unwrap();
        fs::create_dir_all(&paths.app_store).unwrap();
        paths
    }

    #[test]
    fn first_select_installs_golden_and_produces_current() {
        let dir = tempdir().unwrap();
        let paths = make_factory(dir.path());
        select(&paths).unwrap();
        assert!(paths.current().is_dir());
    }

    #[test]
    fn tries_bump_on_ordinary_restart() {
        let dir = tempdir().unwrap();
        let paths = make_factory(dir.path());
        select(&paths).unwrap();
        fsutil::write_file(&paths.current().join("status"), b"tried 1").unwrap();
        maybe_bump_tries(&paths, 1, None).unwrap();
        let contents = fs::read(paths.current().join("status")).unwrap();
        assert_eq!(contents, b"tried 2");
    }

    #[test]
    fn exit_code_3_does_not_bump_when_already_tried() {
        let dir = tempdir().unwrap();
        let paths = make_factory(dir.path());
        select(&paths).unwrap();
        fsutil::write_file(&paths.current().join("status"), b"tried 1").unwrap();
        maybe_bump_tries(&paths, 1, Some(3)).unwrap();
        let contents = fs::read(paths.current().join("status")).unwrap();
        assert_eq!(contents, b"tried 1");
    }

    #[test]
    fn exit_code_3_on_new_system_still_bumps() {
        let dir = tempdir().unwrap();
        let paths = make_factory(dir.path());
        select(&paths).unwrap();
        fs::remove_file(paths.current().join("status")).ok();
        maybe_bump_tries(&paths, 0, Some(3)).unwrap();
        let contents = fs::read(paths.current().join("status")).unwrap();
        assert_eq!(contents, b"tried 1");
    }

    #[test]
    fn bad_current_is_demoted_and_deleted_on_reconcile() {
        let dir = tempdir().unwrap();
        let paths = make_factory(dir.path());
        select(&paths).unwrap(); // current = 0, good

        // Stage a second good system by hand and mark current bad.
        fs::create_dir_all(paths.indexed(1)).unwrap();
        fsutil::write_file(&paths.indexed(1).join("index"), b"1").unwrap();
        fsutil::write_file(&paths.indexed(1).join("status"), b"good").unwrap();
        fsutil::write_file(&paths.current().join("status"), b"bad").unwrap();

        let newest = systems::newest_non_bad(&paths).unwrap();
        assert_eq!(newest, Some(1));
        reconcile_current(&paths, Some(0), newest).unwrap();

        assert!(!paths.indexed(0).exists());
        assert_eq!(
            systems::read_index(&paths, SystemName::Current).unwrap(),
            1
        );
    }

    #[test]
    fn tryable_current_harvests_config_before_deletion() {
        let dir = tempdir().unwrap();
        let paths = make_factory(dir.path());
        select(&paths).unwrap(); // current = 0, good -> we'll mark tryable below
        fs::write(paths.current().join("config/extra.cfg"), b"mine").unwrap();
        fsutil::write_file(&paths.current().join("status"), b"tried 3").unwrap();

        fs::create_dir_all(paths.indexed(1)).unwrap();
        fsutil::write_file(&paths.indexed(1).join("index"), b"1").unwrap();
        fsutil::write_file(&paths.indexed(1).join("status"), b"good").unwrap();
        fs::create_dir_all(paths.indexed(1).join("config")).unwrap();

        let newest = systems::newest_non_bad(&paths).unwrap();
        assert_eq!(newest, Some(1));
        reconcile_current(&paths, Some(0), newest).unwrap();

        assert!(!paths.indexed(0).exists());
        assert!(paths.current().join("config/extra.cfg").is_file());
    }

    #[test]
    fn good_current_is_retained_as_rollback_target() {
        let dir = tempdir().unwrap();
        let paths = make_factory(dir.path());
        select(&paths).unwrap(); // current = 0, good

        fs::create_dir_all(paths.indexed(1)).unwrap();
        fsutil::write_file(&paths.indexed(1).join("index"), b"1").unwrap();
        fsutil::write_file(&paths.indexed(1).join("status"), b"good").unwrap();
        fs::create_dir_all(paths.indexed(1).join("config")).unwrap();

        let newest = systems::newest_non_bad(&paths).unwrap();
        reconcile_current(&paths, Some(0), newest).unwrap();

        // The previously-good current survives as a rollback target.
        assert!(paths.indexed(0).is_dir());
        assert_eq!(
            systems::read_index(&paths, SystemName::Current).unwrap(),
            1
        );
    }

    #[test]
    fn importing_config_skips_standard_files_already_present_in_destination() {
        let dir = tempdir().unwrap();
        let paths = make_factory(dir.path());
        select(&paths).unwrap(); // current = 0, good, config/ has the standard symlinks

        // System 1 is a second installer-produced system: its config/ has the
        // same standard config symlinks current's does.
        fs::create_dir_all(paths.indexed(1)).unwrap();
        fsutil::write_file(&paths.indexed(1).join("index"), b"1").unwrap();
        fsutil::write_file(&paths.indexed(1).join("status"), b"good").unwrap();
        let config_1 = paths.indexed(1).join("config");
        fs::create_dir_all(&config_1).unwrap();
        for name in STANDARD_CONFIG_FILES {
            std::os::unix::fs::symlink(paths.factory_config().join(name), config_1.join(name))
                .unwrap();
        }

        let newest = systems::newest_non_bad(&paths).unwrap();
        assert_eq!(newest, Some(1));
        reconcile_current(&paths, Some(0), newest).unwrap();

        assert_eq!(
            systems::read_index(&paths, SystemName::Current).unwrap(),
            1
        );
    }
}
