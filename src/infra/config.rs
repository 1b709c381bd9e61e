//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! Secrets may be overridden from the environment (ODOO_API_KEY,
//! SENDCLOUD_PUBLIC_KEY, SENDCLOUD_SECRET_KEY).

use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Warehouse identifier used in logs (e.g., "madrid-dock")
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "warehouse".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderSystemConfig {
    #[serde(default = "default_odoo_url")]
    pub url: String,
    #[serde(default)]
    pub db: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_upstream_timeout_ms")]
    pub timeout_ms: u64,
    /// Sales-team name filter for the recent outbound listing (empty disables)
    #[serde(default = "default_team_filter")]
    pub team_filter: String,
}

impl Default for OrderSystemConfig {
    fn default() -> Self {
        Self {
            url: default_odoo_url(),
            db: String::new(),
            user: String::new(),
            api_key: String::new(),
            timeout_ms: default_upstream_timeout_ms(),
            team_filter: default_team_filter(),
        }
    }
}

fn default_odoo_url() -> String {
    "http://localhost:8069".to_string()
}

fn default_team_filter() -> String {
    "shopify".to_string()
}

fn default_upstream_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorConfig {
    #[serde(default = "default_sendcloud_url")]
    pub api_url: String,
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default = "default_upstream_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
    /// Upper bound on pages followed per listing
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_page_pause_ms")]
    pub page_pause_ms: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            api_url: default_sendcloud_url(),
            public_key: String::new(),
            secret_key: String::new(),
            timeout_ms: default_upstream_timeout_ms(),
            page_limit: default_page_limit(),
            max_pages: default_max_pages(),
            page_pause_ms: default_page_pause_ms(),
        }
    }
}

fn default_sendcloud_url() -> String {
    "https://panel.sendcloud.sc/api/v2".to_string()
}

fn default_page_limit() -> u32 {
    500
}

fn default_max_pages() -> u32 {
    100
}

fn default_page_pause_ms() -> u64 {
    200
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Lookback window for the index build (days)
    #[serde(default = "default_window_days")]
    pub window_days: u32,
    /// Period between scheduled builds; 0 disables the scheduler
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_run_on_start")]
    pub run_on_start: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            window_days: default_window_days(),
            interval_secs: default_sync_interval(),
            run_on_start: default_run_on_start(),
        }
    }
}

fn default_window_days() -> u32 {
    4
}

fn default_sync_interval() -> u64 {
    3600
}

fn default_run_on_start() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { data_dir: default_data_dir() }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Operational HTTP port (0 to disable)
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { port: default_http_port() }
    }
}

fn default_http_port() -> u16 {
    9090
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_client_lookback")]
    pub client_lookback_days: u32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self { client_lookback_days: default_client_lookback() }
    }
}

fn default_client_lookback() -> u32 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Period of the metrics log line
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

fn default_metrics_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub order_system: OrderSystemConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    odoo_url: String,
    odoo_db: String,
    odoo_user: String,
    odoo_api_key: String,
    odoo_timeout_ms: u64,
    odoo_team_filter: String,
    sendcloud_url: String,
    sendcloud_public_key: String,
    sendcloud_secret_key: String,
    sendcloud_timeout_ms: u64,
    sendcloud_page_limit: u32,
    sendcloud_max_pages: u32,
    sendcloud_page_pause_ms: u64,
    sync_window_days: u32,
    sync_interval_secs: u64,
    sync_run_on_start: bool,
    data_dir: PathBuf,
    http_port: u16,
    client_lookback_days: u32,
    metrics_interval_secs: u64,
    log_json: bool,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        let os = toml_config.order_system;
        let agg = toml_config.aggregator;
        Self {
            site_id: toml_config.site.id,
            odoo_url: os.url.trim_end_matches('/').to_string(),
            odoo_db: os.db,
            odoo_user: os.user,
            odoo_api_key: os.api_key,
            odoo_timeout_ms: os.timeout_ms,
            odoo_team_filter: os.team_filter,
            sendcloud_url: agg.api_url.trim_end_matches('/').to_string(),
            sendcloud_public_key: agg.public_key,
            sendcloud_secret_key: agg.secret_key,
            sendcloud_timeout_ms: agg.timeout_ms,
            sendcloud_page_limit: agg.page_limit.max(1),
            sendcloud_max_pages: agg.max_pages.max(1),
            sendcloud_page_pause_ms: agg.page_pause_ms,
            sync_window_days: toml_config.sync.window_days.max(1),
            sync_interval_secs: toml_config.sync.interval_secs,
            sync_run_on_start: toml_config.sync.run_on_start,
            data_dir: toml_config.storage.data_dir,
            http_port: toml_config.http.port,
            client_lookback_days: toml_config.search.client_lookback_days,
            metrics_interval_secs: toml_config.metrics.interval_secs.max(1),
            log_json: toml_config.logging.json,
            config_file,
        }
    }

    /// Determine config file path from an explicit argument or environment
    pub fn resolve_config_path(explicit: Option<&str>) -> String {
        if let Some(path) = explicit {
            return path.to_string();
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load configuration - tries the TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        let config = match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        };
        config.with_env_overrides(|key| env::var(key).ok())
    }

    /// Resolve the path (argument, CONFIG_FILE, default) and load it
    pub fn load(explicit: Option<&str>) -> Self {
        Self::load_from_path(&Self::resolve_config_path(explicit))
    }

    /// Apply secret overrides; `lookup` is `std::env::var` outside of tests
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ODOO_API_KEY").filter(|v| !v.is_empty()) {
            self.odoo_api_key = v;
        }
        if let Some(v) = lookup("SENDCLOUD_PUBLIC_KEY").filter(|v| !v.is_empty()) {
            self.sendcloud_public_key = v;
        }
        if let Some(v) = lookup("SENDCLOUD_SECRET_KEY").filter(|v| !v.is_empty()) {
            self.sendcloud_secret_key = v;
        }
        self
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn odoo_url(&self) -> &str {
        &self.odoo_url
    }

    pub fn odoo_db(&self) -> &str {
        &self.odoo_db
    }

    pub fn odoo_user(&self) -> &str {
        &self.odoo_user
    }

    pub fn odoo_api_key(&self) -> &str {
        &self.odoo_api_key
    }

    pub fn odoo_timeout_ms(&self) -> u64 {
        self.odoo_timeout_ms
    }

    pub fn odoo_team_filter(&self) -> Option<&str> {
        Some(self.odoo_team_filter.as_str()).filter(|t| !t.is_empty())
    }

    pub fn sendcloud_url(&self) -> &str {
        &self.sendcloud_url
    }

    pub fn sendcloud_public_key(&self) -> &str {
        &self.sendcloud_public_key
    }

    pub fn sendcloud_secret_key(&self) -> &str {
        &self.sendcloud_secret_key
    }

    pub fn sendcloud_timeout_ms(&self) -> u64 {
        self.sendcloud_timeout_ms
    }

    pub fn sendcloud_page_limit(&self) -> u32 {
        self.sendcloud_page_limit
    }

    pub fn sendcloud_max_pages(&self) -> u32 {
        self.sendcloud_max_pages
    }

    pub fn sendcloud_page_pause_ms(&self) -> u64 {
        self.sendcloud_page_pause_ms
    }

    pub fn sync_window_days(&self) -> u32 {
        self.sync_window_days
    }

    pub fn sync_interval_secs(&self) -> u64 {
        self.sync_interval_secs
    }

    /// Scheduler period, `None` when scheduled builds are disabled
    pub fn sync_interval(&self) -> Option<std::time::Duration> {
        (self.sync_interval_secs > 0).then(|| std::time::Duration::from_secs(self.sync_interval_secs))
    }

    pub fn sync_run_on_start(&self) -> bool {
        self.sync_run_on_start
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn client_lookback_days(&self) -> u32 {
        self.client_lookback_days
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn log_json(&self) -> bool {
        self.log_json
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to point storage at a temp dir
    #[cfg(test)]
    pub fn with_data_dir(mut self, dir: &Path) -> Self {
        self.data_dir = dir.to_path_buf();
        self
    }
}
