// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
//! Process-wide settings and logging setup shared by every stratum crate.
//!
//! The [`Config`] is read once by the entry point and handed to the
//! graphics context; nothing in the workspace keeps a global copy.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Settings that must be fixed before the graphics context is created.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Extra instance extensions requested on top of the window-system ones.
    pub instance_extensions: Vec<String>,
    /// Load `VK_LAYER_KHRONOS_validation` and install a debug messenger.
    pub enable_validation_layers: bool,
    /// Abort the process on the first validation error.
    pub abort_on_validation_error: bool,
    /// Emit informational log lines (`warn` and above otherwise).
    pub enable_logging: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            instance_extensions: Vec::new(),
            enable_validation_layers: cfg!(debug_assertions),
            abort_on_validation_error: true,
            enable_logging: true,
        }
    }
}

impl Config {
    pub fn from_toml_str(src: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(src)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        load_toml(path)
    }

    /// Like [`Config::load`], falling back to defaults when the file is
    /// missing or malformed.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        load_or_default(path)
    }

    fn default_directive(&self) -> &'static str {
        if self.enable_logging {
            "info"
        } else {
            "warn"
        }
    }
}

/// Read and deserialize a whole TOML document. Entry points embed
/// [`Config`] in their own settings type and load that through here.
pub fn load_toml<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, ConfigError> {
    let path = path.as_ref();
    let src = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&src).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// [`load_toml`], with a warning and `T::default()` on any failure.
pub fn load_or_default<T: DeserializeOwned + Default>(path: impl AsRef<Path>) -> T {
    match load_toml(path) {
        Ok(v) => v,
        Err(e) => {
            warn!("{e}; using defaults");
            T::default()
        }
    }
}

/// Install the fmt subscriber. `RUST_LOG` overrides the level implied by
/// `cfg.enable_logging`. Safe to call more than once.
pub fn init_tracing(cfg: &Config) {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.default_directive()));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let cfg = Config::from_toml_str("").unwrap();
        assert_eq!(cfg, Config::default());
        assert!(cfg.abort_on_validation_error);
        assert!(cfg.enable_logging);
    }

    #[test]
    fn partial_document_keeps_other_defaults() {
        let cfg = Config::from_toml_str(
            r#"
            enable_validation_layers = false
            instance_extensions = ["VK_KHR_get_surface_capabilities2"]
            "#,
        )
        .unwrap();
        assert!(!cfg.enable_validation_layers);
        assert!(cfg.abort_on_validation_error);
        assert_eq!(cfg.instance_extensions, vec!["VK_KHR_get_surface_capabilities2"]);
    }

    #[test]
    fn logging_switch_picks_filter_level() {
        let mut cfg = Config::default();
        assert_eq!(cfg.default_directive(), "info");
        cfg.enable_logging = false;
        assert_eq!(cfg.default_directive(), "warn");
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = Config::load("/nonexistent/stratum.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert_eq!(
            Config::load_or_default("/nonexistent/stratum.toml"),
            Config::default()
        );
    }

    #[test]
    fn bad_type_is_parse_error() {
        assert!(Config::from_toml_str("enable_logging = 3").is_err());
    }

    #[test]
    fn generic_loader_reads_embedding_types() {
        #[derive(Debug, Default, Deserialize)]
        #[serde(default)]
        struct Outer {
            context: Config,
            label: String,
        }

        let path = std::env::temp_dir().join(format!("stratum-core-{}.toml", std::process::id()));
        fs::write(&path, "label = \"demo\"\n[context]\nenable_logging = false\n").unwrap();
        let outer: Outer = load_toml(&path).unwrap();
        assert_eq!(outer.label, "demo");
        assert!(!outer.context.enable_logging);

        fs::write(&path, "label = 7").unwrap();
        assert!(matches!(load_toml::<Outer>(&path), Err(ConfigError::Parse { .. })));
        let fallback: Outer = load_or_default(&path);
        assert_eq!(fallback.context, Config::default());
        let _ = fs::remove_file(&path);
    }
}
