/*!
 * Configuration structures and defaults for servcore
 */

use crate::error::{Result, ServerError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Log verbosity, mirrored into a `tracing::Level` by `crate::logging`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Connection worker pool configuration (C7).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnPoolConfig {
    pub min_threads: usize,
    pub max_threads: usize,
    pub max_conns: usize,
    pub thread_idle_timeout_secs: u64,
    pub max_consecutive_drops: u32,
    pub url_stats_cache_size: usize,
}

impl Default for ConnPoolConfig {
    fn default() -> Self {
        Self {
            min_threads: 5,
            max_threads: 25,
            max_conns: 1000,
            thread_idle_timeout_secs: 120,
            max_consecutive_drops: 100,
            url_stats_cache_size: 1000,
        }
    }
}

impl ConnPoolConfig {
    pub fn thread_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.thread_idle_timeout_secs)
    }
}

/// Scheduler configuration (C1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    pub max_elapsed_warning_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_elapsed_warning_secs: 5,
        }
    }
}

/// Per-cache configuration (C2). Instantiated once per named cache, not
/// globally -- `servcore::core::cache::CacheRegistry` owns the named map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    pub max_size: usize,
    pub ttl_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 10 * 1024 * 1024,
            ttl_secs: None,
        }
    }
}

/// Per-pool worker-subprocess configuration (C5). Defaults match
/// `nsproxy/nsproxylib.c`'s `GetPool`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyPoolConfig {
    pub exec: PathBuf,
    pub init: Option<String>,
    pub reinit: Option<String>,
    pub min: usize,
    pub max: usize,
    pub get_timeout_ms: u64,
    pub eval_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub recv_timeout_ms: u64,
    pub wait_timeout_ms: u64,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            exec: PathBuf::from("servcore-proxy"),
            init: None,
            reinit: None,
            min: 0,
            max: 5,
            get_timeout_ms: 500,
            eval_timeout_ms: 500,
            send_timeout_ms: 100,
            recv_timeout_ms: 100,
            wait_timeout_ms: 100,
        }
    }
}

impl ProxyPoolConfig {
    pub fn get_timeout(&self) -> Duration {
        Duration::from_millis(self.get_timeout_ms)
    }
    pub fn eval_timeout(&self) -> Duration {
        Duration::from_millis(self.eval_timeout_ms)
    }
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

/// Per-pool database-handle configuration (C6). Defaults match
/// `nsdb/dbinit.c`'s `CreatePool`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandlePoolConfig {
    pub datasource: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub driver: String,
    pub connections: usize,
    pub max_idle_secs: u64,
    pub max_open_secs: u64,
    pub check_interval_secs: u64,
    pub verbose: bool,
    pub log_errors: bool,
}

impl Default for HandlePoolConfig {
    fn default() -> Self {
        Self {
            datasource: String::new(),
            user: None,
            password: None,
            driver: String::new(),
            connections: 2,
            max_idle_secs: 600,
            max_open_secs: 3600,
            check_interval_secs: 600,
            verbose: false,
            log_errors: true,
        }
    }
}

impl HandlePoolConfig {
    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }
    pub fn max_open(&self) -> Duration {
        Duration::from_secs(self.max_open_secs)
    }
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// Per-server interpreter pool configuration (C4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterpPoolConfig {
    pub library: Option<PathBuf>,
    pub init_file: Option<PathBuf>,
    pub lock_on_init: bool,
}

impl Default for InterpPoolConfig {
    fn default() -> Self {
        Self {
            library: None,
            init_file: None,
            lock_on_init: false,
        }
    }
}

/// Top-level server configuration aggregating every subsystem's options.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default)]
    pub conn_pool: ConnPoolConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub interp_pool: InterpPoolConfig,
    #[serde(default)]
    pub proxy_pools: std::collections::HashMap<String, ProxyPoolConfig>,
    #[serde(default)]
    pub handle_pools: std::collections::HashMap<String, HandlePoolConfig>,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub verbose: bool,
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| ServerError::Config(format!("failed to parse config file: {}", e)))
    }

    /// Load configuration with fallback priority:
    /// 1. ./servcore.toml (project-specific)
    /// 2. ~/.servcore/servcore.toml (user defaults)
    /// 3. Built-in defaults
    pub fn load_with_fallback() -> Self {
        if let Ok(config) = Self::load(Path::new("servcore.toml")) {
            return config;
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".servcore").join("servcore.toml");
            if let Ok(config) = Self::load(&user_config) {
                return config;
            }
        }

        Self::default()
    }
}
