//! User configuration for the `margin` binary.
//!
//! Read from `$XDG_CONFIG_HOME/margin/config.toml`. Every key is optional and
//! a missing or unparsable file falls back to defaults with a warning.

use std::path::PathBuf;
use std::time::Duration;

use margin_core::{EngineConfig, FilterPolicy};
use serde::Deserialize;

pub const DEFAULT_DATABASE: &str = ".margin/annotations.db";

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Name recorded on new annotations and replies.
    pub author: Option<String>,
    pub database: Option<PathBuf>,
    pub search_radius: Option<usize>,
    pub debounce_ms: Option<u64>,
    pub show_resolved: Option<bool>,
    pub show_archived: Option<bool>,
}

impl Config {
    pub fn database(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE))
    }

    /// Author for new entries: the configured one, then `$USER`.
    pub fn author(&self) -> String {
        self.author
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "anonymous".to_owned())
    }

    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::default();
        if let Some(ms) = self.debounce_ms {
            config = config.with_debounce(Duration::from_millis(ms));
        }
        if let Some(radius) = self.search_radius {
            config.search_radius = radius;
        }
        let defaults = FilterPolicy::default();
        config.filter = FilterPolicy {
            show_resolved: self.show_resolved.unwrap_or(defaults.show_resolved),
            show_archived: self.show_archived.unwrap_or(defaults.show_archived),
        };
        config
    }
}

/// Returns the path to the margin config file.
///
/// Prefers `$XDG_CONFIG_HOME/margin/config.toml`; falls back to
/// `~/.config/margin/config.toml` when the env var is absent.
pub fn config_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        })
        .unwrap_or_else(|| PathBuf::from(".config"));
    base.join("margin").join("config.toml")
}

/// Loads the config file. Never fails; problems are logged and defaults used.
pub fn load(path: &std::path::Path) -> Config {
    let raw = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Config::default(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot read config");
            return Config::default();
        }
    };
    parse(&raw).unwrap_or_else(|e| {
        tracing::warn!(path = %path.display(), error = %e, "config parse error");
        Config::default()
    })
}

fn parse(raw: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(raw)
}
