use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::fsops::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub paths: PathsConfig,
    pub download: DownloadConfig,
    #[serde(default)]
    pub fs: FsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Where downloaded archives and extracted runtimes are cached
    pub cache: String,
    /// Per-user data directory holding the persistent runtime root
    pub user_data: String,
    /// State directory (logs)
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Client identifier sent with every request; some mirrors reject the default one
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Responses smaller than this are treated as error pages
    #[serde(default = "default_min_size")]
    pub min_size_bytes: u64,
    /// Optional cap on followed redirects (unbounded when unset)
    #[serde(default)]
    pub max_redirects: Option<usize>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Ordered mirror templates, `{file}` is replaced by the archive name
    #[serde(default = "default_mirrors")]
    pub mirrors: Vec<String>,
    /// Short runtime version -> archive file name
    #[serde(default = "default_releases")]
    pub releases: BTreeMap<String, String>,
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/120.0.0.0 Safari/537.36"
        .to_string()
}

fn default_min_size() -> u64 {
    5 * 1024 * 1024 // 5 MiB
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_mirrors() -> Vec<String> {
    vec![
        "https://windows.php.net/downloads/releases/{file}".to_string(),
        "https://windows.php.net/downloads/releases/archives/{file}".to_string(),
    ]
}

fn default_releases() -> BTreeMap<String, String> {
    [
        ("8.3", "php-8.3.12-nts-Win32-vs16-x64.zip"),
        ("8.2", "php-8.2.24-nts-Win32-vs16-x64.zip"),
        ("8.1", "php-8.1.29-nts-Win32-vs16-x64.zip"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            min_size_bytes: default_min_size(),
            max_redirects: None,
            connect_timeout_secs: default_connect_timeout(),
            mirrors: default_mirrors(),
            releases: default_releases(),
        }
    }
}

/// Retry tuning for filesystem mutations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsConfig {
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: usize,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f32,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Extra attempts made by the detached cleanup task after the caller returned
    #[serde(default = "default_background_attempts")]
    pub background_attempts: usize,
}

fn default_retry_attempts() -> usize {
    5
}

fn default_initial_delay() -> u64 {
    200
}

fn default_backoff_factor() -> f32 {
    2.0
}

fn default_max_delay() -> u64 {
    5_000
}

fn default_background_attempts() -> usize {
    10
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            initial_delay_ms: default_initial_delay(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay(),
            background_attempts: default_background_attempts(),
        }
    }
}

impl FsConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            factor: self.backoff_factor,
            max_delay: Duration::from_millis(self.max_delay_ms),
            background_attempts: self.background_attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// How long to wait for the interpreter to announce its port
    #[serde(default = "default_port_timeout")]
    pub port_timeout_ms: u64,
    /// Grace period between the soft stop signal and forced termination
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
}

fn default_port_timeout() -> u64 {
    8_000
}

fn default_shutdown_grace() -> u64 {
    1_500
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port_timeout_ms: default_port_timeout(),
            shutdown_grace_ms: default_shutdown_grace(),
            bind_host: default_bind_host(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Package manager used for install and packaging
    #[serde(default = "default_tool")]
    pub tool: String,
    /// Script passed to `<tool> run`
    #[serde(default = "default_script")]
    pub script: String,
    /// Output directory relative to the project root
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    /// Name of the previously built executable, terminated before clearing output
    #[serde(default)]
    pub executable_name: Option<String>,
    /// Unpacked/debug output variants removed unless `keep_unpacked` is set
    #[serde(default = "default_unpacked_dirs")]
    pub unpacked_dirs: Vec<String>,
    /// Glob patterns (relative to the output dir) of transient metadata files
    #[serde(default = "default_metadata_globs")]
    pub metadata_globs: Vec<String>,
    #[serde(default)]
    pub keep_unpacked: bool,
    /// Wait before cleanup so freshly written files are released
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    /// Per-step limit for install/build subprocesses (unbounded when unset)
    #[serde(default)]
    pub step_timeout_secs: Option<u64>,
}

fn default_tool() -> String {
    "npm".to_string()
}

fn default_script() -> String {
    "build".to_string()
}

fn default_output_dir() -> String {
    "dist".to_string()
}

fn default_unpacked_dirs() -> Vec<String> {
    vec![
        "win-unpacked".to_string(),
        "linux-unpacked".to_string(),
        "mac".to_string(),
    ]
}

fn default_metadata_globs() -> Vec<String> {
    vec![
        "latest*.yml".to_string(),
        "*.blockmap".to_string(),
        "builder-debug.yml".to_string(),
    ]
}

fn default_settle_delay() -> u64 {
    2_000
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            tool: default_tool(),
            script: default_script(),
            output_dir: default_output_dir(),
            executable_name: None,
            unpacked_dirs: default_unpacked_dirs(),
            metadata_globs: default_metadata_globs(),
            keep_unpacked: false,
            settle_delay_ms: default_settle_delay(),
            step_timeout_secs: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether long-running commands log to a file instead of stderr
    #[serde(default)]
    pub to_file: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            to_file: false,
        }
    }
}

impl Config {
    /// Path to the user-level config file, if a config dir exists on this platform
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("deskpack").join("config.toml"))
    }

    pub fn load(config_path: Option<&str>) -> Result<Self> {
        // Start with embedded defaults so deskpack works without config files
        let defaults = Config::default();
        let defaults_json =
            serde_json::to_string(&defaults).context("Failed to serialize default config")?;

        let mut builder = config::Config::builder().add_source(config::File::from_str(
            &defaults_json,
            config::FileFormat::Json,
        ));

        if let Some(user_config) = Self::user_config_path() {
            if user_config.exists() {
                builder = builder.add_source(config::File::from(user_config));
            }
        }

        // Explicit config file (CLI override)
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Environment variables with DESKPACK_ prefix
        builder = builder.add_source(
            config::Environment::with_prefix("DESKPACK")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to load configuration")?;
        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Save config to the user config location
    pub fn save(&self) -> Result<PathBuf> {
        let config_path =
            Self::user_config_path().context("No config directory on this platform")?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create deskpack config directory")?;
        }

        let toml_str = self.to_toml()?;
        std::fs::write(&config_path, toml_str).context("Failed to write config file")?;

        Ok(config_path)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config to TOML")
    }

    pub fn cache_path(&self) -> PathBuf {
        absolutize(&self.paths.cache)
    }

    pub fn user_data_path(&self) -> PathBuf {
        absolutize(&self.paths.user_data)
    }

    pub fn state_path(&self) -> PathBuf {
        absolutize(&self.paths.state)
    }

    /// Get absolute path to logs directory
    pub fn logs_path(&self) -> PathBuf {
        self.state_path().join("logs")
    }
}

fn absolutize(raw: &str) -> PathBuf {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        path
    } else {
        std::env::current_dir().unwrap_or_default().join(path)
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_root = dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("deskpack");

        Self {
            paths: PathsConfig {
                cache: data_root.join("php-cache").to_string_lossy().to_string(),
                user_data: data_root.to_string_lossy().to_string(),
                state: data_root.join("state").to_string_lossy().to_string(),
            },
            download: DownloadConfig::default(),
            fs: FsConfig::default(),
            server: ServerConfig::default(),
            build: BuildConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
