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

//! The golden (factory) image installer: detects whether the factory image
//! needs to be promoted into the writable area, stages it into `unpack/`,
//! and commits it with a single rename.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;

use anyhow::{Context, Result};
use log::info;

use crate::appstage::{self, NoopHook, WritableUpdateHook};
use crate::fsutil;
use crate::paths::{Paths, SystemName, STANDARD_CONFIG_FILES};
use crate::systems;

/// Decides whether the factory image must be (re-)installed into the
/// writable area.
///
/// 1. No non-bad system exists at all: always install.
/// 2. Otherwise compare the installed-factory-version marker against the
///    factory image's `version` file. A missing marker with a readable
///    factory image counts as differing and triggers install. A malformed
///    factory image never triggers an install, marker or no marker.
pub fn should_install_golden(paths: &Paths, newest: Option<u64>) -> Result<bool> {
    if newest.is_none() {
        return Ok(true);
    }

    let marker = fsutil::read_file(&paths.factory_version_marker, 256)?;
    let factory_version = fsutil::read_file(&paths.factory_version_file(), 256)?;

    match (marker, factory_version) {
        (Some(m), Some(f)) => Ok(m != f),
        (None, Some(_)) => Ok(true),
        (Some(_), None) | (None, None) => Ok(false),
    }
}

fn symlink_config_files(unpack_config: &Path, factory_config: &Path) -> Result<()> {
    for name in STANDARD_CONFIG_FILES {
        let target = factory_config.join(name);
        let link = unpack_config.join(name);
        symlink(&target, &link)
            .with_context(|| format!("linking {} to {}", link.display(), target.display()))?;
    }
    Ok(())
}

fn rebuild_unpack_from_factory(paths: &Paths, golden_index: u64) -> Result<()> {
    let unpack = paths.unpack();
    systems::reset_unpack_dir(&unpack)?;

    fs::create_dir_all(unpack.join("config")).context("creating unpack/config")?;
    fs::create_dir_all(unpack.join("apps")).context("creating unpack/apps")?;
    fs::create_dir_all(unpack.join("appsWriteable")).context("creating unpack/appsWriteable")?;

    symlink(paths.factory_bin(), unpack.join("bin")).context("linking unpack/bin")?;
    symlink(paths.factory_lib(), unpack.join("lib")).context("linking unpack/lib")?;
    symlink(paths.factory_modules(), unpack.join("modules")).context("linking unpack/modules")?;
    symlink_config_files(&unpack.join("config"), &paths.factory_config())?;

    fs::copy(paths.factory_version_file(), unpack.join("version"))
        .context("copying version file")?;
    fs::copy(
        paths.factory_info_properties(),
        unpack.join("info.properties"),
    )
    .context("copying info.properties")?;

    fsutil::write_file(&unpack.join("index"), golden_index.to_string().as_bytes())
        .context("writing unpack/index")?;
    // The factory system is "good by fiat": it is the fallback of last
    // resort, so it can never be allowed to become Bad through the normal
    // try-count mechanism.
    fsutil::write_file(&unpack.join("status"), &crate::status::emit_good())
        .context("writing unpack/status")?;

    Ok(())
}

/// Demotes the current `current/` directory to its own indexed name so it
/// can be harvested from and potentially used as a rollback target.
/// Returns its index and directory path, if `current` existed.
fn demote_current(paths: &Paths) -> Result<Option<(u64, std::path::PathBuf)>> {
    let current = paths.current();
    if !current.is_dir() {
        return Ok(None);
    }
    let index = systems::read_index(paths, SystemName::Current)
        .context("reading current's index before demotion")?;
    fsutil::try_lazy_unmount(&current);
    let dest = paths.indexed(index);
    fsutil::rename(&current, &dest).context("demoting current to its indexed name")?;
    Ok(Some((index, dest)))
}

/// Runs the full golden-install procedure. Returns the index of the new
/// `current`. Every intermediate state before the final rename in step 6
/// is equivalent to "no install attempted": a power loss before that point
/// leaves a prior indexed system, or the previous `current`, bootable.
pub fn install_golden(paths: &Paths, newest: Option<u64>) -> Result<u64> {
    let golden_index = newest.map_or(0, |n| n + 1);

    // Step 1: clear any stale/bad leftover at the target index.
    fsutil::recursive_delete(&paths.indexed(golden_index));

    // Step 2: demote current (if any) so it can be harvested and serve as
    // a rollback target.
    let demoted = demote_current(paths)?;

    // Step 3: rebuild unpack/ from the factory image.
    rebuild_unpack_from_factory(paths, golden_index)?;

    // Step 4: migrate the previous system's config, if one existed.
    if let Some((_, prev_dir)) = &demoted {
        let src_config = systems::config_dir(prev_dir);
        let dst_config = systems::config_dir(&paths.unpack());
        if src_config.is_dir() {
            migrate_config(&src_config, &dst_config)
                .context("migrating previous configuration")?;
        }
    }

    // Step 5: stage every app in the factory image.
    let factory_apps = paths.factory_apps();
    let apps = appstage::list_factory_apps(&factory_apps)?;
    let legacy_root = paths.systems_root.join("legacyApps");
    let hook: &dyn WritableUpdateHook = &NoopHook;
    for app_name in &apps {
        let prev_dir = demoted.as_ref().map(|(_, dir)| dir.as_path());
        appstage::set_up_app(
            &factory_apps,
            &paths.app_store,
            &paths.unpack(),
            &legacy_root,
            app_name,
            prev_dir,
            hook,
        )
        .with_context(|| format!("staging app {app_name}"))?;
    }

    // Step 6: the commit point. Before this rename, every on-disk state is
    // equivalent to "no install attempted".
    fsutil::rename(&paths.unpack(), &paths.current())
        .context("promoting unpack/ to current/")?;

    // Step 7: drop every sibling system now that current/ is the new one.
    systems::delete_all_except_current(paths)?;

    // Step 8: request a dynamic-linker cache refresh.
    fsutil::write_file(&paths.ldconfig_needed_marker, b"")
        .context("writing ldconfig-needed marker")?;

    // Step 9: sync, then record the marker last, so an interrupted install
    // simply re-runs (idempotent modulo config/app-writable migration).
    unsafe { libc::sync() };
    if let Some(version) = fsutil::read_file(&paths.factory_version_file(), 256)? {
        fsutil::write_file(&paths.factory_version_marker, &version)
            .context("writing factory version marker")?;
    }

    info!("golden install complete, current is now system {golden_index}");
    Ok(golden_index)
}

/// Copies a previous system's `config/` tree into the new `unpack/config/`,
/// skipping the standard config files: those are always fresh symlinks into
/// the (possibly new) factory image, already created by
/// `rebuild_unpack_from_factory`, and must not be clobbered by the old
/// system's copies of them.
fn migrate_config(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("creating {}", dst.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("reading {}", src.display()))? {
        let entry = entry.with_context(|| format!("reading entry under {}", src.display()))?;
        if let Some(name) = entry.file_name().to_str() {
            if STANDARD_CONFIG_FILES.contains(&name) {
                continue;
            }
        }
        let file_type = entry
            .file_type()
            .with_context(|| format!("stat {}", entry.path().display()))?;
        let dst_path = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_config_tree(&entry.path(), &dst_path)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            symlink(target, &dst_path)
                .with_context(|| format!("linking {}", dst_path.display()))?;
        } else {
            fs::copy(entry.path(), &dst_path)
                .with_context(|| format!("copying {}", dst_path.display()))?;
        }
    }
    Ok(())
}

fn copy_config_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("creating {}", dst.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("reading {}", src.display()))? {
        let entry = entry.with_context(|| format!("reading entry under {}", src.display()))?;
        let file_type = entry
            .file_type()
            .with_context(|| format!("stat {}", entry.path().display()))?;
        let dst_path = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_config_tree(&entry.path(), &dst_path)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            symlink(target, &dst_path)
                .with_context(|| format!("linking {}", dst_path.display()))?;
        } else {
            fs::copy(entry.path(), &dst_path)
                .with_context(|| format!("copying {}", dst_path.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_factory(root: &Path) -> Paths {
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
    fn should_install_when_no_system_exists() {
        let dir = tempdir().unwrap();
        let paths = make_factory(dir.path());
        assert!(should_install_golden(&paths, None).unwrap());
    }

    #[test]
    fn should_not_install_when_versions_match() {
        let dir = tempdir().unwrap();
        let paths = make_factory(dir.path());
        fs::write(&paths.factory_version_marker, b"1.0").unwrap();
        assert!(!should_install_golden(&paths, Some(0)).unwrap());
    }

    #[test]
    fn should_install_on_version_mismatch() {
        let dir = tempdir().unwrap();
        let paths = make_factory(dir.path());
        fs::write(&paths.factory_version_marker, b"0.9").unwrap();
        assert!(should_install_golden(&paths, Some(0)).unwrap());
    }

    #[test]
    fn missing_marker_with_readable_factory_image_still_installs() {
        let dir = tempdir().unwrap();
        let paths = make_factory(dir.path());
        assert!(should_install_golden(&paths, Some(0)).unwrap());
    }

    #[test]
    fn first_boot_produces_good_current_at_index_zero() {
        let dir = tempdir().unwrap();
        let paths = make_factory(dir.path());

        let idx = install_golden(&paths, None).unwrap();
        assert_eq!(idx, 0);
        assert!(paths.current().is_dir());
        assert_eq!(
            systems::read_index(&paths, SystemName::Current).unwrap(),
            0
        );
        assert_eq!(
            systems::get_status(&paths, SystemName::Current).unwrap(),
            crate::status::Status::Good
        );
        let marker = fs::read(&paths.factory_version_marker).unwrap();
        assert_eq!(marker, b"1.0");
    }

    #[test]
    fn upgrade_demotes_current_and_migrates_config() {
        let dir = tempdir().unwrap();
        let paths = make_factory(dir.path());

        install_golden(&paths, None).unwrap();
        fs::write(paths.current().join("config/extra.cfg"), b"mine").unwrap();

        // Simulate a factory upgrade.
        fs::write(paths.factory_version_file(), b"1.1").unwrap();
        let newest = systems::newest_non_bad(&paths).unwrap();
        assert!(should_install_golden(&paths, newest).unwrap());

        let idx = install_golden(&paths, newest).unwrap();
        assert_eq!(idx, 1);
        assert!(paths.indexed(0).is_dir());
        assert!(paths
            .current()
            .join("config/extra.cfg")
            .exists());
        let marker = fs::read(&paths.factory_version_marker).unwrap();
        assert_eq!(marker, b"1.1");
    }

    #[test]
    fn idempotent_when_run_twice_with_no_external_change() {
        let dir = tempdir().unwrap();
        let paths = make_factory(dir.path());
        install_golden(&paths, None).unwrap();
        let marker_before = fs::read(&paths.factory_version_marker).unwrap();

        let newest = systems::newest_non_bad(&paths).unwrap();
        assert!(!should_install_golden(&paths, newest).unwrap());
        let marker_after = fs::read(&paths.factory_version_marker).unwrap();
        assert_eq!(marker_before, marker_after);
    }
}
