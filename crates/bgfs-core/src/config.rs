#![forbid(unsafe_code)]

use bgfs_alloc::AllocatorConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::level_filters::LevelFilter;

/// Errors produced while loading a [`Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config value `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Verbosity of the `tracing` events emitted by the allocator stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    #[must_use]
    pub fn level_filter(self) -> LevelFilter {
        match self {
            Self::Off => LevelFilter::OFF,
            Self::Error => LevelFilter::ERROR,
            Self::Warn => LevelFilter::WARN,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
            Self::Trace => LevelFilter::TRACE,
        }
    }
}

/// Runtime configuration for a mounted filesystem.
///
/// Every field has a default, so an empty TOML document is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub log_level: LogLevel,
    /// Blocks reserved behind each freshly searched block (0 disables).
    pub prealloc_window: u32,
    /// Free blocks a group needs before a non-goal search settles on it.
    pub min_group_free: u32,
    /// Groups compared when the parent's group cannot take a new inode.
    pub inode_search_window: u32,
    /// Run the consistency check at mount; drift mounts read-only.
    pub check_on_mount: bool,
}

impl Default for Config {
    fn default() -> Self {
        let alloc = AllocatorConfig::default();
        Self {
            log_level: LogLevel::default(),
            prealloc_window: alloc.prealloc_window,
            min_group_free: alloc.min_group_free,
            inode_search_window: alloc.inode_search_window,
            check_on_mount: false,
        }
    }
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // The superblock records the window in an 8-bit field.
        if self.prealloc_window > u32::from(u8::MAX) {
            return Err(ConfigError::Invalid {
                field: "prealloc_window",
                reason: "must be at most 255",
            });
        }
        if self.inode_search_window == 0 {
            return Err(ConfigError::Invalid {
                field: "inode_search_window",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn allocator(&self) -> AllocatorConfig {
        AllocatorConfig {
            prealloc_window: self.prealloc_window,
            min_group_free: self.min_group_free,
            inode_search_window: self.inode_search_window,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = Config::from_toml_str("").expect("parse");
        assert_eq!(config, Config::default());
        assert_eq!(config.allocator(), AllocatorConfig::default());
        assert_eq!(config.log_level.level_filter(), LevelFilter::WARN);
    }

    #[test]
    fn partial_document_overrides_named_fields() {
        let config = Config::from_toml_str(
            r#"
            log_level = "trace"
            prealloc_window = 16
            check_on_mount = true
            "#,
        )
        .expect("parse");
        assert_eq!(config.log_level, LogLevel::Trace);
        assert_eq!(config.prealloc_window, 16);
        assert_eq!(config.min_group_free, 16);
        assert!(config.check_on_mount);
    }

    #[test]
    fn unknown_keys_and_bad_values_are_rejected() {
        assert!(matches!(
            Config::from_toml_str("prealloc = 3"),
            Err(ConfigError::Toml(_))
        ));
        assert!(matches!(
            Config::from_toml_str("prealloc_window = 300"),
            Err(ConfigError::Invalid {
                field: "prealloc_window",
                ..
            })
        ));
        assert!(matches!(
            Config::from_toml_str("inode_search_window = 0"),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn load_reads_file_and_reports_missing_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bgfs.toml");
        std::fs::write(&path, "min_group_free = 4\n").expect("write");
        assert_eq!(Config::load(&path).expect("load").min_group_free, 4);

        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            Config::load(&missing),
            Err(ConfigError::Read { .. })
        ));
    }
}
