//! Module for application configuration settings.
//!
//! Settings come from an optional TOML file and are then overridden by
//! command-line flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sort_fuse::fs::{SortConfig, SortDirection, SortKey, SortOrder};
use thiserror::Error;
use tracing::debug;

fn sort_fuse_runtime_dir() -> Option<PathBuf> {
    if let Some(path) = dirs::runtime_dir() {
        return Some(path.join("sort-fuse"));
    }

    dirs::home_dir().map(|home| home.join(".local").join("share").join("sort-fuse"))
}

fn default_mount_point() -> PathBuf {
    sort_fuse_runtime_dir().map_or_else(|| PathBuf::from("/tmp/sort-fuse/mnt"), |rd| rd.join("mnt"))
}

fn default_freshness_ms() -> u64 {
    1000
}

/// How directory entries are ordered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SortSettings {
    /// The metadata field to order by.
    #[serde(default)]
    pub key: SortKey,

    /// Ascending or descending.
    #[serde(default)]
    pub direction: SortDirection,

    /// List directories before everything else.
    #[serde(default)]
    pub directories_first: bool,
}

/// Snapshot and attribute caching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheSettings {
    /// How long a directory listing is served before the target is listed again.
    #[serde(default = "default_freshness_ms")]
    pub freshness_ms: u64,

    /// How long the kernel may cache attributes and entries. Defaults to the
    /// freshness window.
    #[serde(default)]
    pub attr_ttl_ms: Option<u64>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            freshness_ms: default_freshness_ms(),
            attr_ttl_ms: None,
        }
    }
}

/// Mount options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MountSettings {
    /// Let users other than the mounting user access the filesystem.
    #[serde(default)]
    pub allow_other: bool,
}

/// Application configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// The directory whose contents are presented.
    #[serde(default)]
    pub target: Option<PathBuf>,

    /// The mount point for the filesystem.
    #[serde(default = "default_mount_point")]
    pub mount_point: PathBuf,

    #[serde(default)]
    pub sort: SortSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub mount: MountSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: None,
            mount_point: default_mount_point(),
            sort: SortSettings::default(),
            cache: CacheSettings::default(),
            mount: MountSettings::default(),
        }
    }
}

/// Values given on the command line. `None`/`false` leaves the file value alone.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub target: Option<PathBuf>,
    pub mount_point: Option<PathBuf>,
    pub sort_key: Option<SortKey>,
    pub reverse: bool,
    pub dirs_first: bool,
    pub freshness_ms: Option<u64>,
    pub allow_other: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Canonicalize the longest existing ancestor of `path` and re-append the
/// components that do not exist yet.
fn canonicalize_existing(path: &Path) -> PathBuf {
    let mut missing = Vec::new();
    let mut current = path;
    loop {
        if let Ok(resolved) = current.canonicalize() {
            return missing
                .iter()
                .rev()
                .fold(resolved, |acc: PathBuf, part| acc.join(part));
        }
        match (current.parent(), current.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                current = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

impl Config {
    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` containing a list of validation error messages otherwise.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        match &self.target {
            None => errors.push(
                "No target directory configured. Pass --target or set `target` in the config \
                 file."
                    .to_owned(),
            ),
            Some(target) if !target.is_dir() => {
                errors.push(format!(
                    "Target '{}' does not exist or is not a directory.",
                    target.display()
                ));
            }
            Some(target) => {
                let target = target.canonicalize().unwrap_or_else(|_| target.clone());
                if canonicalize_existing(&self.mount_point).starts_with(&target) {
                    errors.push(format!(
                        "Mount point '{}' is inside the target '{}'.",
                        self.mount_point.display(),
                        target.display()
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Returns config file paths in descending priority order.
    /// On macOS, skips `dirs::config_dir()` (resolves to ~/Library/Application Support/).
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(not(target_os = "macos"))]
        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("sort-fuse").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("sort-fuse").join("config.toml"));
        }

        paths.push(PathBuf::from("/etc/sort-fuse/config.toml"));

        paths
    }

    /// Finds the first existing config file from search paths.
    fn find_config_file() -> Option<PathBuf> {
        Self::config_search_paths().into_iter().find(|p| p.exists())
    }

    /// Loads config from a single TOML file.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Loads configuration from the external path if given, otherwise from the
    /// first config file found, otherwise the defaults.
    ///
    /// Errors if the chosen file is unreadable or malformed.
    pub fn load(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = external_config_path {
            return Self::load_from_file(path);
        }

        match Self::find_config_file() {
            Some(path) => Self::load_from_file(&path),
            None => {
                debug!("No configuration file found, using defaults.");
                Ok(Self::default())
            }
        }
    }

    /// Apply command-line overrides on top of the file values.
    #[must_use]
    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        if let Some(target) = overrides.target {
            self.target = Some(target);
        }
        if let Some(mount_point) = overrides.mount_point {
            self.mount_point = mount_point;
        }
        if let Some(key) = overrides.sort_key {
            self.sort.key = key;
        }
        if overrides.reverse {
            self.sort.direction = SortDirection::Descending;
        }
        if overrides.dirs_first {
            self.sort.directories_first = true;
        }
        if let Some(freshness_ms) = overrides.freshness_ms {
            self.cache.freshness_ms = freshness_ms;
        }
        if overrides.allow_other {
            self.mount.allow_other = true;
        }
        self
    }

    /// Resolve relative paths against the current directory.
    pub fn absolutize(mut self) -> Result<Self, ConfigError> {
        if let Some(target) = &self.target {
            self.target = Some(std::path::absolute(target)?);
        }
        self.mount_point = std::path::absolute(&self.mount_point)?;
        Ok(self)
    }

    /// The library-level settings for the sorted view.
    #[must_use]
    pub fn sort_config(&self) -> SortConfig {
        SortConfig {
            order: SortOrder {
                key: self.sort.key,
                direction: self.sort.direction,
                directories_first: self.sort.directories_first,
            },
            freshness: Duration::from_millis(self.cache.freshness_ms),
        }
    }

    /// How long the kernel may cache attributes.
    #[must_use]
    pub fn attr_ttl(&self) -> Duration {
        Duration::from_millis(self.cache.attr_ttl_ms.unwrap_or(self.cache.freshness_ms))
    }
}
