//! Layered configuration (§6 configuration table): built-in defaults,
//! then an optional TOML file, then `NZBFS_`-prefixed environment
//! variables, then CLI flags — in ascending precedence, the same layering
//! the teacher applies to its own listener/store options.

use std::path::PathBuf;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid regex {pattern:?} in {field}: {source}")]
    Pattern {
        field: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("{0}")]
    Invalid(String),
}

impl From<ConfigError> for std::io::Error {
    fn from(e: ConfigError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsenetConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub max_conn: usize,
}

impl Default for UsenetConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 563,
            tls: true,
            user: None,
            pass: None,
            max_conn: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub path: PathBuf,
    /// Zero means unlimited.
    pub max_size: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".cache"),
            max_size: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadAheadSettings {
    pub avg_speed_window_secs: f64,
    pub horizon_secs: f64,
    pub min_bytes: u64,
    pub low_water_bytes: u64,
    pub max_bytes: u64,
}

impl Default for ReadAheadSettings {
    fn default() -> Self {
        Self {
            avg_speed_window_secs: 0.5,
            horizon_secs: 1.0,
            min_bytes: 1 << 20,
            low_water_bytes: 1 << 20,
            max_bytes: 16 << 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NzbFilterSettings {
    pub file_blacklist: Vec<String>,
    pub try_read_bytes: u64,
    pub try_read_pct: f64,
    pub healthy_threshold: f64,
}

impl Default for NzbFilterSettings {
    fn default() -> Self {
        Self {
            file_blacklist: vec![r"(?i)\.par2$".to_string()],
            try_read_bytes: 1,
            try_read_pct: 0.0,
            healthy_threshold: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemSettings {
    pub blacklist: Vec<String>,
    pub flatten_max_depth: usize,
    pub fix_filename_threshold: f64,
}

impl Default for FilesystemSettings {
    fn default() -> Self {
        Self {
            blacklist: Vec::new(),
            flatten_max_depth: 1,
            fix_filename_threshold: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenterSettings {
    pub webdav_addr: String,
    pub webdav_user: Option<String>,
    pub webdav_pass: Option<String>,
    pub mount_path: Option<PathBuf>,
    pub mount_allow_other: bool,
}

impl Default for PresenterSettings {
    fn default() -> Self {
        Self {
            webdav_addr: ":8080".to_string(),
            webdav_user: None,
            webdav_pass: None,
            mount_path: None,
            mount_allow_other: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub usenet: UsenetConfig,
    pub cache: CacheConfig,
    pub read_ahead: ReadAheadSettings,
    pub nzb_filter: NzbFilterSettings,
    pub filesystem: FilesystemSettings,
    pub presenters: PresenterSettings,
    /// `.watch` by default; out of scope (§1), kept only so the config
    /// surface matches §6's table.
    pub folder_watcher_path: PathBuf,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            usenet: UsenetConfig::default(),
            cache: CacheConfig::default(),
            read_ahead: ReadAheadSettings::default(),
            nzb_filter: NzbFilterSettings::default(),
            filesystem: FilesystemSettings::default(),
            presenters: PresenterSettings::default(),
            folder_watcher_path: PathBuf::from(".watch"),
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn load(config_file: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let defaults = config::Config::try_from(&Settings::default())?;
        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = config_file {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("NZBFS")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;

        if settings.cache.max_size < 0 {
            return Err(ConfigError::Invalid("cache.max_size must not be negative".into()));
        }
        if settings.usenet.max_conn == 0 {
            return Err(ConfigError::Invalid("usenet.max_conn must be at least 1".into()));
        }

        Ok(settings)
    }

    pub fn compile_blacklist(patterns: &[String], field: &'static str) -> Result<Vec<Regex>, ConfigError> {
        patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|source| ConfigError::Pattern {
                    field,
                    pattern: p.clone(),
                    source,
                })
            })
            .collect()
    }
}
