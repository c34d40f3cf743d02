//! Configuration parsing – reads a KEY=VALUE file (`rewind.conf`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

/// Development server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // ── server ───────────────────────────────────────────────────────
    /// Address the development server listens on.
    pub listen_addr: String,
    /// Optional directory served for every non-API, non-control path
    /// (the client bundle).
    pub static_dir: Option<PathBuf>,

    // ── api proxy ────────────────────────────────────────────────────
    /// Path prefix of the API namespace wrapped by the interceptor.
    pub api_prefix: String,
    /// Base URL of the live API server requests are forwarded to.
    pub api_upstream_url: String,

    // ── storage ──────────────────────────────────────────────────────
    pub recordings_dir: PathBuf,

    // ── images ───────────────────────────────────────────────────────
    /// Base URL used to resolve root-relative image references.
    pub asset_base_url: String,
    pub fetch_timeout_secs: u64,

    // ── replay ───────────────────────────────────────────────────────
    /// Fixed delay between two replayed events (milliseconds).
    pub replay_interval_ms: u64,
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "rewind.conf"
    }

    pub fn replay_interval(&self) -> Duration {
        Duration::from_millis(self.replay_interval_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    fn from_map(map: &HashMap<String, String>) -> Config {
        let get = |key: &str| -> Option<String> { map.get(key).cloned() };
        // Durations; zero is not a usable period.
        let get_u64 = |key: &str, default: u64| -> u64 {
            get(key)
                .and_then(|v| v.parse().ok())
                .filter(|&v| v > 0)
                .unwrap_or(default)
        };

        let mut api_prefix = get("API_PREFIX")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "/api".into());
        if !api_prefix.starts_with('/') {
            api_prefix.insert(0, '/');
        }
        let api_prefix = api_prefix.trim_end_matches('/').to_string();

        Config {
            listen_addr: get("LISTEN_ADDR").unwrap_or_else(|| "127.0.0.1:8080".into()),
            static_dir: get("STATIC_DIR").filter(|s| !s.is_empty()).map(PathBuf::from),

            api_prefix: if api_prefix.is_empty() { "/api".into() } else { api_prefix },
            api_upstream_url: get("API_UPSTREAM_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8081".into()),

            recordings_dir: PathBuf::from(
                get("RECORDINGS_DIR").unwrap_or_else(|| "recordings".into()),
            ),

            asset_base_url: get("ASSET_BASE_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8080".into()),
            fetch_timeout_secs: get_u64("FETCH_TIMEOUT_SECS", 30),

            replay_interval_ms: get_u64("REPLAY_INTERVAL_MS", 1000),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::from_map(&HashMap::new())
    }
}

/// Parse a `KEY=VALUE` configuration file.
///
/// Lines starting with `#` are comments.  Values may be optionally
/// double-quoted.  Unknown keys are silently ignored.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;

    let map = parse_conf(&text);
    info!("Loaded config from {}", path.display());

    Ok(Config::from_map(&map))
}

/// Load `path` when given, otherwise the default path if it exists, otherwise
/// built-in defaults.
pub fn load_or_default(path: Option<&Path>) -> Result<Config> {
    if let Some(path) = path {
        return load(path);
    }
    let default = Path::new(Config::default_path());
    if default.exists() {
        load(default)
    } else {
        info!("No {} found – using built-in defaults", default.display());
        Ok(Config::default())
    }
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_conf() {
        let text = r#"
# comment
LISTEN_ADDR=0.0.0.0:9090
API_UPSTREAM_URL="http://backend:3001"
REPLAY_INTERVAL_MS=250
"#;
        let map = parse_conf(text);
        assert_eq!(map["LISTEN_ADDR"], "0.0.0.0:9090");
        assert_eq!(map["API_UPSTREAM_URL"], "http://backend:3001");
        assert_eq!(map["REPLAY_INTERVAL_MS"], "250");
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.api_prefix, "/api");
        assert_eq!(config.recordings_dir, PathBuf::from("recordings"));
        assert_eq!(config.replay_interval(), Duration::from_secs(1));
        assert!(config.static_dir.is_none());
    }

    #[test]
    fn test_load_normalises_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rewind.conf");
        std::fs::write(&path, "API_PREFIX=backend/\nFETCH_TIMEOUT_SECS=oops\n").unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.api_prefix, "/backend");
        assert_eq!(config.fetch_timeout_secs, 30);
    }

    #[test]
    fn test_zero_durations_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rewind.conf");
        std::fs::write(&path, "REPLAY_INTERVAL_MS=0\nFETCH_TIMEOUT_SECS=0\n").unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.replay_interval(), Duration::from_millis(1000));
        assert_eq!(config.fetch_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_or_default(Some(&dir.path().join("nope.conf"))).is_err());
    }
}
