//! Persistent configuration: flat JSON string map under the XDG config dir.
//!
//! Keys the tool does not recognise are kept verbatim so round-tripping the
//! file never loses anything.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Recognised keys; everything else is preserved untouched.
pub const KEY_USER_AGENT: &str = "default-user-agent";
pub const KEY_CONNECTIONS: &str = "default-connections";
pub const KEY_MAX_SPEED: &str = "default-max-speed";
pub const KEY_DIRECTORY: &str = "default-directory";
pub const KEY_CHECK_CERTIFICATE: &str = "check-certificate";

/// Configuration file contents. Flat string-to-string map; typed accessors
/// interpret the recognised keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Config {
    entries: BTreeMap<String, String>,
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("swiftget")?;
    Ok(xdg_dirs.place_config_file("config.json")?)
}

/// Load configuration from disk, creating a default (empty) file if none
/// exists yet.
pub fn load_or_init() -> Result<Config> {
    let path = config_path()?;
    if !path.exists() {
        let cfg = Config::default();
        cfg.save_to(&path)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(cfg);
    }
    Config::load_from(&path)
}

impl Config {
    pub fn load_from(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json(&data).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(data)?;
        let obj = value
            .as_object()
            .context("config root must be a JSON object")?;
        let mut entries = BTreeMap::new();
        for (k, v) in obj {
            // Flat string map; scalar values are coerced for leniency.
            let s = match v {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Bool(b) => b.to_string(),
                serde_json::Value::Number(n) => n.to_string(),
                other => anyhow::bail!("config key {k:?} has non-scalar value {other}"),
            };
            entries.insert(k.clone(), s);
        }
        Ok(Self { entries })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("string map always serialises")
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_json() + "\n")
            .with_context(|| format!("write config {}", path.display()))?;
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path()?)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.entries.insert(key.to_string(), value.to_string());
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn default_user_agent(&self) -> Option<&str> {
        self.get(KEY_USER_AGENT)
    }

    pub fn default_connections(&self) -> Option<usize> {
        self.get(KEY_CONNECTIONS)?.parse().ok()
    }

    pub fn default_max_speed(&self) -> Option<u64> {
        parse_byte_rate(self.get(KEY_MAX_SPEED)?).ok()
    }

    pub fn default_directory(&self) -> Option<PathBuf> {
        self.get(KEY_DIRECTORY).map(PathBuf::from)
    }

    pub fn check_certificate(&self) -> Option<bool> {
        match self.get(KEY_CHECK_CERTIFICATE)? {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        }
    }
}

/// Parses a bytes/sec value with optional `K`/`M` suffix (binary units),
/// e.g. `100K` = 102400.
pub fn parse_byte_rate(s: &str) -> Result<u64> {
    let s = s.trim();
    let (digits, multiplier) = match s.chars().last() {
        Some('k') | Some('K') => (&s[..s.len() - 1], 1024u64),
        Some('m') | Some('M') => (&s[..s.len() - 1], 1024 * 1024),
        _ => (s, 1),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .with_context(|| format!("invalid rate value: {s:?}"))?;
    Ok(value * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_keys_round_trip() {
        let cfg = Config::from_json(
            r#"{"default-connections": "8", "x-experimental": "keep-me"}"#,
        )
        .unwrap();
        assert_eq!(cfg.default_connections(), Some(8));
        assert_eq!(cfg.get("x-experimental"), Some("keep-me"));
        let reparsed = Config::from_json(&cfg.to_json()).unwrap();
        assert_eq!(reparsed, cfg);
    }

    #[test]
    fn scalar_values_are_coerced() {
        let cfg = Config::from_json(
            r#"{"default-connections": 4, "check-certificate": false}"#,
        )
        .unwrap();
        assert_eq!(cfg.default_connections(), Some(4));
        assert_eq!(cfg.check_certificate(), Some(false));
    }

    #[test]
    fn nested_values_are_rejected() {
        assert!(Config::from_json(r#"{"a": {"nested": true}}"#).is_err());
        assert!(Config::from_json(r#"["not", "an", "object"]"#).is_err());
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.json");
        let mut cfg = Config::default();
        cfg.set(KEY_MAX_SPEED, "2M");
        cfg.save_to(&path).unwrap();
        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.default_max_speed(), Some(2 * 1024 * 1024));
    }

    #[test]
    fn byte_rate_suffixes() {
        assert_eq!(parse_byte_rate("102400").unwrap(), 102_400);
        assert_eq!(parse_byte_rate("100K").unwrap(), 102_400);
        assert_eq!(parse_byte_rate("100k").unwrap(), 102_400);
        assert_eq!(parse_byte_rate("2M").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_byte_rate(" 5 K ").unwrap(), 5 * 1024);
        assert!(parse_byte_rate("fast").is_err());
        assert!(parse_byte_rate("").is_err());
    }
}
