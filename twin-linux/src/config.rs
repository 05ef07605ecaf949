//! Load daemon config from file and environment.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use twin_core::config::LinkConfig;

/// Daemon configuration. File: $TWINLINK_CONFIG, ~/.config/twinlink/config.toml or
/// /etc/twinlink/config.toml. Env overrides: TWINLINK_LISTEN, TWINLINK_POLL_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP address the controller link connects to (default 127.0.0.1:47100).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Link timeouts and poll interval.
    #[serde(default)]
    pub link: LinkConfig,
}

fn default_listen() -> String {
    "127.0.0.1:47100".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            link: LinkConfig::default(),
        }
    }
}

/// Load config: defaults, then the first config file found, then env vars.
pub fn load() -> anyhow::Result<Config> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => load_file(&path)?,
        None => Config::default(),
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = std::env::var_os("TWINLINK_CONFIG") {
        out.push(PathBuf::from(p));
    }
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/twinlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/twinlink/config.toml"));
    out
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse(&s).with_context(|| format!("parsing {}", path.display()))
}

fn parse(s: &str) -> anyhow::Result<Config> {
    let c = toml::from_str::<Config>(s)?;
    c.link.validate()?;
    Ok(c)
}

fn apply_env<F>(c: &mut Config, var: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(s) = var("TWINLINK_LISTEN") {
        c.listen = s;
    }
    if let Some(s) = var("TWINLINK_POLL_MS") {
        match s.parse::<u32>() {
            Ok(ms) if ms > 0 => c.link.poll_interval_ms = ms,
            _ => tracing::warn!(value = %s, "ignoring invalid TWINLINK_POLL_MS"),
        }
    }
}
