use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub api_base: String,
    /// Origin serving the static app shell; the API base when unset.
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default = "default_sync_tag")]
    pub sync_tag: String,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub probe: Option<ProbeConfig>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CacheConfig {
    #[serde(default = "default_static_cache")]
    pub static_name: String,
    #[serde(default = "default_api_cache")]
    pub api_name: String,
    #[serde(default = "default_static_manifest")]
    pub static_manifest: Vec<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct TimeoutConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_ms: u64,
    #[serde(default = "default_io_timeout_ms")]
    pub read_ms: u64,
    #[serde(default = "default_io_timeout_ms")]
    pub write_ms: u64,
}

/// Reachability probe feeding the connectivity observer.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ProbeConfig {
    pub url: String,
    #[serde(default = "default_probe_interval_ms")]
    pub interval_ms: u64,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("conectada.db")
}

fn default_sync_tag() -> String {
    "sync-reports".to_string()
}

fn default_static_cache() -> String {
    "cc-static-v2".to_string()
}

fn default_api_cache() -> String {
    "cc-api-v2".to_string()
}

fn default_static_manifest() -> Vec<String> {
    [
        "/",
        "/index.html",
        "/login.html",
        "/register.html",
        "/dashboard.html",
        "/report.html",
        "/css/styles.css",
        "/js/app.js",
        "/manifest.json",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_connect_timeout_ms() -> u64 {
    3_000
}

fn default_io_timeout_ms() -> u64 {
    10_000
}

fn default_probe_interval_ms() -> u64 {
    5_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            static_name: default_static_cache(),
            api_name: default_api_cache(),
            static_manifest: default_static_manifest(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_timeout_ms(),
            read_ms: default_io_timeout_ms(),
            write_ms: default_io_timeout_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn read(&self) -> Duration {
        Duration::from_millis(self.read_ms)
    }

    pub fn write(&self) -> Duration {
        Duration::from_millis(self.write_ms)
    }
}

impl ProbeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

impl ClientConfig {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            origin: None,
            storage_path: default_storage_path(),
            cache: CacheConfig::default(),
            sync_tag: default_sync_tag(),
            timeouts: TimeoutConfig::default(),
            probe: None,
        }
    }

    pub fn origin(&self) -> &str {
        self.origin.as_deref().unwrap_or(&self.api_base)
    }

    pub fn from_toml(input: &str) -> Result<Self, std::io::Error> {
        let config: Self = toml::from_str(input)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    fn validate(&self) -> Result<(), std::io::Error> {
        let base = self.api_base.trim();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("api_base must be an http(s) url, got {base:?}"),
            ));
        }
        if self.cache.static_name == self.cache.api_name {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "static and api cache generations must have different names",
            ));
        }
        Ok(())
    }
}
