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

//! Enumeration of indexed systems under the systems root, and lookups
//! against a single system directory by name.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;

use crate::fsutil;
use crate::paths::{Paths, SystemName, CURRENT, UNPACK};
use crate::status::{self, Status};

/// Reads the integer stored in `<dir>/index`.
pub fn read_index_at(dir: &Path) -> Result<u64> {
    let path = dir.join("index");
    let bytes = fsutil::read_file(&path, 64)
        .with_context(|| format!("reading {}", path.display()))?
        .with_context(|| format!("{} does not exist", path.display()))?;
    let text = std::str::from_utf8(&bytes)
        .with_context(|| format!("{} is not valid UTF-8", path.display()))?
        .trim();
    text.parse::<u64>()
        .with_context(|| format!("{} does not contain a valid index", path.display()))
}

/// Reads the integer stored in `<systems>/<name>/index`.
pub fn read_index(paths: &Paths, name: SystemName) -> Result<u64> {
    read_index_at(&name.path_in(paths))
}

/// Reads and classifies the status file directly under `dir`.
pub fn get_status_at(dir: &Path) -> Result<Status> {
    let path = dir.join("status");
    match fsutil::read_file(&path, 64)? {
        None => {
            debug!("{} has no status file, treating as new", path.display());
            Ok(Status::New)
        }
        Some(bytes) => Ok(status::classify(&bytes)),
    }
}

/// Reads `current`'s index, if `current` exists at all.
pub fn read_current_index(paths: &Paths) -> Result<Option<u64>> {
    if !paths.current().is_dir() {
        return Ok(None);
    }
    Ok(Some(read_index(paths, SystemName::Current)?))
}

/// Reads and classifies the status file of the named system. Absence maps
/// to `Status::New` -- this is the normal "never attempted" case, not an
/// error, and is logged at `debug!`, never `error!`.
pub fn get_status(paths: &Paths, name: SystemName) -> Result<Status> {
    get_status_at(&name.path_in(paths))
}

fn is_candidate_dir_name(name: &str) -> bool {
    !name.starts_with('.') && name != UNPACK && name != CURRENT
}

/// Scans the systems root for indexed systems (skipping dotfiles, `unpack`,
/// and `current`) and returns the highest index whose status is `Good` or
/// `Tryable`/`New`. Returns `-1` (as `None`) if no such system exists.
pub fn newest_non_bad(paths: &Paths) -> Result<Option<u64>> {
    let entries = match fs::read_dir(&paths.systems_root) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("reading {}", paths.systems_root.display()))
        }
    };

    let mut newest: Option<u64> = None;
    for entry in entries {
        let entry = entry.with_context(|| {
            format!("reading entry under {}", paths.systems_root.display())
        })?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if !is_candidate_dir_name(name) {
            continue;
        }
        let is_dir = match entry.file_type() {
            Ok(ft) => ft.is_dir(),
            Err(_) => fs::symlink_metadata(entry.path())
                .map(|m| m.is_dir())
                .unwrap_or(false),
        };
        if !is_dir {
            continue;
        }

        // Read straight from this entry's own directory rather than
        // reconstructing a path from the (untrusted) directory name, in
        // case the name and the contents of `index` ever disagree.
        let index = match read_index_at(&entry.path()) {
            Ok(i) => i,
            Err(e) => {
                debug!("skipping {}: {e}", entry.path().display());
                continue;
            }
        };
        let status = match get_status_at(&entry.path()) {
            Ok(s) => s,
            Err(e) => {
                debug!("skipping {}: {e}", entry.path().display());
                continue;
            }
        };
        if status.is_non_bad() {
            newest = Some(newest.map_or(index, |cur| cur.max(index)));
        }
    }
    Ok(newest)
}

/// Deletes every system directory except `current` and `unpack`.
pub fn delete_all_except_current(paths: &Paths) -> Result<()> {
    let entries = match fs::read_dir(&paths.systems_root) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(e).with_context(|| format!("reading {}", paths.systems_root.display()))
        }
    };
    for entry in entries {
        let entry = entry.with_context(|| {
            format!("reading entry under {}", paths.systems_root.display())
        })?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if name == CURRENT || name == UNPACK || name.starts_with('.') {
            continue;
        }
        fsutil::recursive_delete(&entry.path());
    }
    Ok(())
}

/// Recreates the `unpack/` staging area from scratch. Called at the top of
/// every selector cycle so a stale partial install never lingers.
pub fn reset_unpack_dir(unpack: &Path) -> Result<()> {
    fsutil::recursive_delete(unpack);
    fs::create_dir_all(unpack).with_context(|| format!("creating {}", unpack.display()))?;
    Ok(())
}

pub fn config_dir(system_dir: &Path) -> PathBuf {
    system_dir.join("config")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_system(paths: &Paths, index: u64, status: Option<&[u8]>) {
        let dir = paths.indexed(index);
        fs::create_dir_all(&dir).unwrap();
        fsutil::write_file(&dir.join("index"), index.to_string().as_bytes()).unwrap();
        if let Some(s) = status {
            fsutil::write_file(&dir.join("status"), s).unwrap();
        }
    }

    #[test]
    fn newest_non_bad_skips_bad_and_dotfiles_and_unpack() {
        let dir = tempdir().unwrap();
        let mut paths = Paths::default();
        paths.systems_root = dir.path().to_path_buf();

        make_system(&paths, 0, Some(b"good"));
        make_system(&paths, 1, Some(b"bad"));
        make_system(&paths, 2, Some(b"tried 1"));
        fs::create_dir_all(paths.unpack()).unwrap();
        fs::create_dir_all(dir.path().join(".hidden")).unwrap();

        assert_eq!(newest_non_bad(&paths).unwrap(), Some(2));
    }

    #[test]
    fn newest_non_bad_empty_root_is_none() {
        let dir = tempdir().unwrap();
        let mut paths = Paths::default();
        paths.systems_root = dir.path().to_path_buf();
        assert_eq!(newest_non_bad(&paths).unwrap(), None);
    }

    #[test]
    fn missing_status_file_is_new() {
        let dir = tempdir().unwrap();
        let mut paths = Paths::default();
        paths.systems_root = dir.path().to_path_buf();
        make_system(&paths, 0, None);
        assert_eq!(
            get_status(&paths, SystemName::Index(0)).unwrap(),
            Status::New
        );
    }
}
