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

//! Fixed filesystem layout. The core binary takes no command-line flags, so
//! this is the entirety of its configuration surface.

use std::path::{Path, PathBuf};

const DEFAULT_FACTORY_ROOT: &str = "/mnt/flash/system";
const DEFAULT_SYSTEMS_ROOT: &str = "/data/systems";
const DEFAULT_APP_STORE: &str = "/data/appStore";
const DEFAULT_FACTORY_VERSION_MARKER: &str = "/data/systems/.installedFactoryVersion";
const DEFAULT_LDCONFIG_NEEDED_MARKER: &str = "/data/systems/.needsLdconfigRefresh";
const DEFAULT_SYSTEMS_ROOT_BACKING: &str = "/mnt/userdata/systems";
const DEFAULT_HOME_BACKING: &str = "/mnt/userdata/home";

/// The name reserved for the currently-selected system directory.
pub const CURRENT: &str = "current";
/// The name reserved for the install/staging directory.
pub const UNPACK: &str = "unpack";

/// Fixed paths the selector, installer, and app stager operate on.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Root of the read-only (or read-only-in-normal-operation) factory image.
    pub factory_root: PathBuf,
    /// Root of the writable systems area (`current/`, `unpack/`, `0/`, `1/`, ...).
    pub systems_root: PathBuf,
    /// Root of the content-addressed app store.
    pub app_store: PathBuf,
    /// File whose contents equal the factory image's `version` after a
    /// successful golden install.
    pub factory_version_marker: PathBuf,
    /// Sentinel file whose presence tells the selector to refresh the
    /// dynamic linker cache before running the Supervisor.
    pub ldconfig_needed_marker: PathBuf,
    /// Backing partition mount that `systems_root` is bind-mounted from.
    pub systems_root_backing: PathBuf,
    /// Backing partition mount that `/home` is bind-mounted from.
    pub home_backing: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Paths {
            factory_root: PathBuf::from(DEFAULT_FACTORY_ROOT),
            systems_root: PathBuf::from(DEFAULT_SYSTEMS_ROOT),
            app_store: PathBuf::from(DEFAULT_APP_STORE),
            factory_version_marker: PathBuf::from(DEFAULT_FACTORY_VERSION_MARKER),
            ldconfig_needed_marker: PathBuf::from(DEFAULT_LDCONFIG_NEEDED_MARKER),
            systems_root_backing: PathBuf::from(DEFAULT_SYSTEMS_ROOT_BACKING),
            home_backing: PathBuf::from(DEFAULT_HOME_BACKING),
        }
    }
}

impl Paths {
    pub fn current(&self) -> PathBuf {
        self.systems_root.join(CURRENT)
    }

    pub fn unpack(&self) -> PathBuf {
        self.systems_root.join(UNPACK)
    }

    pub fn indexed(&self, index: u64) -> PathBuf {
        self.systems_root.join(index.to_string())
    }

    /// Path to the `read-only` sentinel in the factory image, whose presence
    /// means the device is running directly off the factory partition.
    pub fn read_only_sentinel(&self) -> PathBuf {
        self.factory_root.join("read-only")
    }

    pub fn is_read_only_mode(&self) -> bool {
        self.read_only_sentinel().is_file()
    }

    pub fn factory_bin(&self) -> PathBuf {
        self.factory_root.join("bin")
    }

    pub fn factory_lib(&self) -> PathBuf {
        self.factory_root.join("lib")
    }

    pub fn factory_modules(&self) -> PathBuf {
        self.factory_root.join("modules")
    }

    pub fn factory_config(&self) -> PathBuf {
        self.factory_root.join("config")
    }

    pub fn factory_apps(&self) -> PathBuf {
        self.factory_root.join("apps")
    }

    pub fn factory_version_file(&self) -> PathBuf {
        self.factory_root.join("version")
    }

    pub fn factory_info_properties(&self) -> PathBuf {
        self.factory_root.join("info.properties")
    }
}

/// A system is named either by its decimal index or by the literal `current`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemName {
    Index(u64),
    Current,
}

impl SystemName {
    pub fn path_in(&self, paths: &Paths) -> PathBuf {
        match self {
            SystemName::Index(i) => paths.indexed(*i),
            SystemName::Current => paths.current(),
        }
    }
}

/// The standard config files symlinked from the factory image into every
/// newly-unpacked system.
pub const STANDARD_CONFIG_FILES: &[&str] = &["users.cfg", "system.cfg", "modules.cfg"];

/// Enforce a runtime upper bound on constructed paths. Overflow is fatal:
/// we never silently truncate a path.
pub fn check_path_len(path: &Path) -> anyhow::Result<()> {
    let len = path.as_os_str().len();
    anyhow::ensure!(
        len < libc::PATH_MAX as usize,
        "path exceeds PATH_MAX ({len} >= {})",
        libc::PATH_MAX
    );
    Ok(())
}
