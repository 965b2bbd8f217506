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

//! Per-app staging: content-addressed symlinks into the app store, plus
//! import of writable state from a previous system or a legacy location.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info};

use crate::fsutil;

/// The legacy, pre-index location apps used to keep writable state, for
/// devices upgrading from a system old enough to predate indexed systems.
pub fn legacy_writable_path(legacy_root: &Path, app_name: &str) -> PathBuf {
    legacy_root.join(app_name)
}

/// Callback invoked after an app's writable tree has been populated, to
/// finalize it against the app version that is now current (e.g. running
/// schema migrations). Supplied by the embedding application; opaque here.
pub trait WritableUpdateHook {
    fn update(&self, app_name: &str, writable_dir: &Path) -> Result<()>;
}

/// A hook that does nothing, for callers with no migration step.
pub struct NoopHook;

impl WritableUpdateHook for NoopHook {
    fn update(&self, _app_name: &str, _writable_dir: &Path) -> Result<()> {
        Ok(())
    }
}

/// Reads the content hash an app's symlink in the factory image points at.
/// The app store directory for that hash is created (as a symlink into the
/// factory image's own store) if it does not already exist.
fn ensure_app_store_entry(
    factory_apps: &Path,
    app_store: &Path,
    app_name: &str,
) -> Result<String> {
    let factory_link = factory_apps.join(app_name);
    let target = fs::read_link(&factory_link)
        .with_context(|| format!("reading app symlink {}", factory_link.display()))?;
    let hash = target
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("app symlink {} has no hash component", factory_link.display()))?
        .to_string();

    let store_entry = app_store.join(&hash);
    if !store_entry.exists() {
        // The store entry doesn't exist yet: this app is new to this
        // device. Link it straight into the factory image's own copy.
        symlink(&target, &store_entry).with_context(|| {
            format!(
                "linking app store entry {} to factory image",
                store_entry.display()
            )
        })?;
        info!("created app store entry {hash} for {app_name}");
    }
    Ok(hash)
}

/// Harvests writable state for `app_name` from `src_writable` (if it
/// exists) into `dst_writable`, applying the external `hook` once the copy
/// is complete.
fn harvest_writable(
    src_writable: &Path,
    dst_writable: &Path,
    app_name: &str,
    hook: &dyn WritableUpdateHook,
) -> Result<()> {
    if src_writable.is_dir() {
        copy_tree(src_writable, dst_writable)
            .with_context(|| format!("copying writable state for {app_name}"))?;
    } else {
        fs::create_dir_all(dst_writable)
            .with_context(|| format!("creating {}", dst_writable.display()))?;
    }
    hook.update(app_name, dst_writable)
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("creating {}", dst.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("reading {}", src.display()))? {
        let entry = entry.with_context(|| format!("reading entry under {}", src.display()))?;
        let file_type = entry
            .file_type()
            .with_context(|| format!("stat {}", entry.path().display()))?;
        let dst_path = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_tree(&entry.path(), &dst_path)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            symlink(target, &dst_path).with_context(|| {
                format!("linking {}", dst_path.display())
            })?;
        } else {
            fs::copy(entry.path(), &dst_path)
                .with_context(|| format!("copying {}", dst_path.display()))?;
        }
    }
    Ok(())
}

/// Stages one app into `unpack/apps/<app_name>` and `unpack/appsWriteable/<app_name>`.
///
/// After this returns, `unpack/apps/<app_name>` is a symlink to
/// `<app_store>/<hash>`, and `<app_store>/<hash>` exists. `prev_index` names
/// the previous "modern" (indexed) system to harvest writable state from,
/// or `None` to fall back to the legacy location.
pub fn set_up_app(
    factory_apps: &Path,
    app_store: &Path,
    unpack_dir: &Path,
    legacy_root: &Path,
    app_name: &str,
    prev_system_dir: Option<&Path>,
    hook: &dyn WritableUpdateHook,
) -> Result<()> {
    let hash = ensure_app_store_entry(factory_apps, app_store, app_name)?;

    let app_link = unpack_dir.join("apps").join(app_name);
    let store_entry = app_store.join(&hash);
    symlink(&store_entry, &app_link)
        .with_context(|| format!("linking {}", app_link.display()))?;

    let dst_writable = unpack_dir.join("appsWriteable").join(app_name);
    match prev_system_dir {
        Some(prev_dir) => {
            let src_writable = prev_dir.join("appsWriteable").join(app_name);
            harvest_writable(&src_writable, &dst_writable, app_name, hook)?;
        }
        None => {
            let legacy = legacy_writable_path(legacy_root, app_name);
            if legacy.is_dir() {
                debug!("harvesting legacy writable state for {app_name}");
            }
            harvest_writable(&legacy, &dst_writable, app_name, hook)?;
        }
    }
    Ok(())
}

/// Lists the app names present in the factory image's `apps/` directory.
/// The directory holds both `<name>` symlinks and the `<hash>` store
/// directories they point at as siblings; only the symlinks are apps.
pub fn list_factory_apps(factory_apps: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    if !factory_apps.is_dir() {
        return Ok(names);
    }
    for entry in fs::read_dir(factory_apps)
        .with_context(|| format!("reading {}", factory_apps.display()))?
    {
        let entry = entry.with_context(|| format!("reading entry under {}", factory_apps.display()))?;
        let file_type = entry
            .file_type()
            .with_context(|| format!("stat {}", entry.path().display()))?;
        if !file_type.is_symlink() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}
