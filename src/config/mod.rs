//! Proxy configuration: `{ host, port, cache_limit, blacklist }` loaded from a
//! JSON file, with the same validate-at-startup discipline the rest of this
//! family of proxies uses.

use std::fs;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::core::error::ProxyError;

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8888
}

fn default_cache_limit() -> usize {
    50
}

/// Root configuration structure. Missing keys fall back to the documented
/// defaults rather than failing to load.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    #[validate(range(min = 1))]
    pub port: u16,

    #[serde(default = "default_cache_limit")]
    #[validate(range(min = 1))]
    pub cache_limit: usize,

    #[serde(default)]
    #[validate(custom(function = "validate_blacklist_patterns"))]
    pub blacklist: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cache_limit: default_cache_limit(),
            blacklist: Vec::new(),
        }
    }
}

fn validate_blacklist_patterns(patterns: &[String]) -> Result<(), ValidationError> {
    for pattern in patterns {
        if Regex::new(pattern).is_err() {
            return Err(ValidationError::new("invalid_regex_pattern"));
        }
    }
    Ok(())
}

impl Config {
    /// Loads configuration from a JSON file. Missing keys fall back to
    /// defaults; a missing file is not itself an error at the call site in
    /// `main` (the caller decides whether to fall back to `Config::default()`).
    pub fn load_from_json<P>(path: P) -> Result<Self, ProxyError>
    where
        P: AsRef<Path>,
    {
        let conf_str = fs::read_to_string(&path).map_err(|e| {
            ProxyError::Configuration(format!(
                "unable to read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_json(&conf_str)
    }

    /// Parses a JSON configuration string, validating structural constraints.
    pub fn from_json(conf_str: &str) -> Result<Self, ProxyError> {
        let conf: Config = serde_json::from_str(conf_str)
            .map_err(|e| ProxyError::Configuration(format!("invalid config JSON: {e}")))?;

        conf.validate()
            .map_err(|e| ProxyError::Configuration(format!("config validation failed: {e}")))?;

        Ok(conf)
    }

    /// Writes this configuration back to `path` as pretty-printed JSON,
    /// atomically (write to a temp file, then rename over the target), the
    /// same write-then-rename discipline the cache snapshot uses. This is
    /// the durable half of the control surface's blacklist mutation: once
    /// written, a SIGHUP-triggered reload (or a restart) picks it up.
    pub async fn save_to_json(&self, path: impl AsRef<Path>) -> Result<(), ProxyError> {
        let path = path.as_ref();
        let body = serde_json::to_string_pretty(self)
            .map_err(|e| ProxyError::Configuration(format!("failed to encode config: {e}")))?;

        let tmp_path = {
            let mut p = path.as_os_str().to_owned();
            p.push(".tmp");
            std::path::PathBuf::from(p)
        };
        tokio::fs::write(&tmp_path, body).await.map_err(|e| {
            ProxyError::Configuration(format!("failed to write {}: {e}", tmp_path.display()))
        })?;
        tokio::fs::rename(&tmp_path, path).await.map_err(|e| {
            ProxyError::Configuration(format!(
                "failed to replace {} with {}: {e}",
                path.display(),
                tmp_path.display()
            ))
        })
    }

    /// Compiles the blacklist patterns into regexes. Assumes `validate()` has
    /// already rejected anything that wouldn't compile.
    pub fn compile_blacklist(&self) -> Result<Vec<Regex>, ProxyError> {
        self.blacklist
            .iter()
            .map(|pattern| {
                Regex::new(&format!("(?i){pattern}"))
                    .map_err(|e| ProxyError::Blacklist(format!("bad pattern '{pattern}': {e}")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_keys_missing() {
        let conf = Config::from_json("{}").unwrap();
        assert_eq!(conf.host, "127.0.0.1");
        assert_eq!(conf.port, 8888);
        assert_eq!(conf.cache_limit, 50);
        assert!(conf.blacklist.is_empty());
    }

    #[test]
    fn rejects_invalid_regex() {
        let conf = Config::from_json(r#"{"blacklist": ["ads\\.example", "("]}"#);
        assert!(conf.is_err());
    }

    #[test]
    fn rejects_zero_cache_limit() {
        let conf = Config::from_json(r#"{"cache_limit": 0}"#);
        assert!(conf.is_err());
    }

    #[test]
    fn accepts_full_config() {
        let conf = Config::from_json(
            r#"{"host": "0.0.0.0", "port": 9000, "cache_limit": 100, "blacklist": ["ads\\.example"]}"#,
        )
        .unwrap();
        assert_eq!(conf.host, "0.0.0.0");
        assert_eq!(conf.port, 9000);
        assert_eq!(conf.cache_limit, 100);
        assert_eq!(conf.blacklist, vec!["ads\\.example".to_string()]);
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let conf = Config::from_json(
            r#"{"host": "0.0.0.0", "port": 9000, "cache_limit": 100, "blacklist": ["ads\\.example"]}"#,
        )
        .unwrap();
        conf.save_to_json(&path).await.unwrap();

        let reloaded = Config::load_from_json(&path).unwrap();
        assert_eq!(reloaded.host, conf.host);
        assert_eq!(reloaded.port, conf.port);
        assert_eq!(reloaded.cache_limit, conf.cache_limit);
        assert_eq!(reloaded.blacklist, conf.blacklist);
    }
}
