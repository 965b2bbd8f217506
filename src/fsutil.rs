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

//! Filesystem primitives the rest of the core is built from. `rename` is the
//! only atomicity primitive available on the target filesystems; the
//! installer and selector are built exclusively out of it plus ordinary
//! reads/writes.

use std::fs::{self, DirEntry, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use anyhow::{Context, Result};
use log::warn;
use nix::mount::{mount, umount2, MntFlags, MsFlags};

use crate::paths::check_path_len;

/// Opens `path` with create+truncate, writes all of `bytes`, and closes it.
/// Does not fsync the directory entry; callers that need durability invoke
/// a global sync themselves.
pub fn write_file(path: &Path, bytes: &[u8]) -> Result<usize> {
    check_path_len(path)?;
    let mut f = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path)
        .with_context(|| format!("opening {} for write", path.display()))?;
    // `Write::write_all` already retries on `ErrorKind::Interrupted`; normal
    // files never return `WouldBlock`.
    f.write_all(bytes)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(bytes.len())
}

/// Reads up to `cap - 1` bytes of `path`. Returns `Ok(None)` if the file does
/// not exist, distinguishing that from any other I/O failure.
pub fn read_file(path: &Path, cap: usize) -> Result<Option<Vec<u8>>> {
    check_path_len(path)?;
    let mut f = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("opening {}", path.display())),
    };
    let mut buf = vec![0u8; cap.saturating_sub(1)];
    let mut total = 0;
    loop {
        if total >= buf.len() {
            break;
        }
        match f.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }
    buf.truncate(total);
    Ok(Some(buf))
}

fn entry_is_dir(entry: &DirEntry) -> Result<bool> {
    match entry.file_type() {
        Ok(ft) => Ok(ft.is_dir()),
        Err(_) => Ok(fs::symlink_metadata(entry.path())
            .with_context(|| format!("stat {}", entry.path().display()))?
            .is_dir()),
    }
}

/// Deletes a directory tree. Never follows symlinks, and refuses to descend
/// into a child directory whose device id differs from the root's (i.e.
/// crossing into another mount). Never fatal: failures are logged and
/// traversal continues on a best-effort basis.
pub fn recursive_delete(path: &Path) {
    let root_dev = match fs::symlink_metadata(path) {
        Ok(meta) => meta.dev(),
        Err(e) if e.kind() == ErrorKind::NotFound => return,
        Err(e) => {
            warn!("stat {} before recursive delete: {e}", path.display());
            return;
        }
    };
    delete_tree(path, root_dev);
}

fn delete_tree(path: &Path, root_dev: u64) {
    let entries = match fs::read_dir(path) {
        Ok(e) => e,
        Err(e) => {
            warn!("reading directory {}: {e}", path.display());
            return;
        }
    };
    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("reading entry under {}: {e}", path.display());
                continue;
            }
        };
        let child = entry.path();
        let is_symlink = match fs::symlink_metadata(&child) {
            Ok(meta) => meta.file_type().is_symlink(),
            Err(e) => {
                warn!("stat {}: {e}", child.display());
                continue;
            }
        };
        if is_symlink {
            if let Err(e) = fs::remove_file(&child) {
                warn!("removing symlink {}: {e}", child.display());
            }
            continue;
        }
        let is_dir = match entry_is_dir(&entry) {
            Ok(v) => v,
            Err(e) => {
                warn!("{e}");
                continue;
            }
        };
        if is_dir {
            let dev = match fs::symlink_metadata(&child) {
                Ok(meta) => meta.dev(),
                Err(e) => {
                    warn!("stat {}: {e}", child.display());
                    continue;
                }
            };
            if dev != root_dev {
                warn!(
                    "refusing to descend into {}: crosses mount point",
                    child.display()
                );
                continue;
            }
            delete_tree(&child, root_dev);
            if let Err(e) = fs::remove_dir(&child) {
                warn!("removing directory {}: {e}", child.display());
            }
        } else if let Err(e) = fs::remove_file(&child) {
            warn!("removing file {}: {e}", child.display());
        }
    }
    if let Err(e) = fs::remove_dir(path) {
        warn!("removing directory {}: {e}", path.display());
    }
}

fn is_nonempty_dir_conflict(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EEXIST) | Some(libc::ENOTEMPTY)
    )
}

/// Renames `src` to `dst`. If `dst` exists as a non-empty directory, deletes
/// it recursively and retries once. Any other failure is fatal.
pub fn rename(src: &Path, dst: &Path) -> Result<()> {
    check_path_len(src)?;
    check_path_len(dst)?;
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if is_nonempty_dir_conflict(&e) => {
            recursive_delete(dst);
            fs::rename(src, dst).with_context(|| {
                format!(
                    "renaming {} to {} after clearing destination",
                    src.display(),
                    dst.display()
                )
            })
        }
        Err(e) => Err(e).with_context(|| format!("renaming {} to {}", src.display(), dst.display())),
    }
}

/// Best-effort lazy unmount. Ignores "not mounted".
pub fn try_lazy_unmount(path: &Path) {
    match umount2(path, MntFlags::MNT_DETACH) {
        Ok(()) => {}
        Err(nix::errno::Errno::EINVAL) => {
            // Not a mount point; nothing to do.
        }
        Err(e) => warn!("lazy unmount of {}: {e}", path.display()),
    }
}

fn is_mount_point(path: &Path) -> Result<bool> {
    let dev = fs::symlink_metadata(path)
        .with_context(|| format!("stat {}", path.display()))?
        .dev();
    let parent = path.parent().unwrap_or(path);
    let parent_dev = fs::symlink_metadata(parent)
        .with_context(|| format!("stat {}", parent.display()))?
        .dev();
    Ok(dev != parent_dev)
}

/// Creates `src` and bind-mounts it onto `dst` unless `dst` is already a
/// mount point. Fatal on mount syscall failure.
pub fn bind_mount_if_needed(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(src).with_context(|| format!("creating {}", src.display()))?;
    if is_mount_point(dst)? {
        return Ok(());
    }
    mount(
        Some(src),
        dst,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .with_context(|| format!("bind-mounting {} onto {}", src.display(), dst.display()))?;
    Ok(())
}
