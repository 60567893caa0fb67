//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

/// Top-level pixel-fleet configuration.
///
/// Every section is optional; accessors fall back to built-in defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinator: Option<CoordinatorConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<LinkConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<PreviewConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub planner: Option<PlannerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub guard: Option<GuardConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttle: Option<ThrottleConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,

    /// Where operator state is persisted (tilde-expanded).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_coordinator_url")]
    pub url: String,

    #[serde(default = "default_ws_path")]
    pub ws_path: String,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_coordinator_url() -> String {
    "http://127.0.0.1:8008".into()
}

fn default_ws_path() -> String {
    "/ws/ui".into()
}

fn default_request_timeout_ms() -> u64 {
    15_000
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            url: default_coordinator_url(),
            ws_path: default_ws_path(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Persistent channel tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    #[serde(default = "default_reconnect_multiplier")]
    pub reconnect_multiplier: f64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Serialized frames at or above this size are gzip-wrapped.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold_bytes: usize,

    /// Delay after a successful connect before the preview is refreshed.
    #[serde(default = "default_preview_refresh_delay_ms")]
    pub preview_refresh_delay_ms: u64,
}

fn default_reconnect_base_ms() -> u64 {
    3_000
}

fn default_reconnect_multiplier() -> f64 {
    1.5
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_compression_threshold() -> usize {
    crate::codec::DEFAULT_THRESHOLD
}

fn default_preview_refresh_delay_ms() -> u64 {
    1_500
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_multiplier: default_reconnect_multiplier(),
            reconnect_max_ms: default_reconnect_max_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            compression_threshold_bytes: default_compression_threshold(),
            preview_refresh_delay_ms: default_preview_refresh_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewConfig {
    /// Minimum spacing between two preview fetches.
    #[serde(default = "default_refresh_cooldown_ms")]
    pub refresh_cooldown_ms: u64,

    /// Upper bound for the fit scale, slightly under 1.
    #[serde(default = "default_fit_safety")]
    pub fit_safety: f64,

    /// Vertical room kept for the statistics panel.
    #[serde(default = "default_stats_strip_px")]
    pub stats_strip_px: u32,

    #[serde(default = "default_min_zoom")]
    pub min_zoom: f64,
}

fn default_refresh_cooldown_ms() -> u64 {
    2_000
}

fn default_fit_safety() -> f64 {
    0.95
}

fn default_stats_strip_px() -> u32 {
    120
}

fn default_min_zoom() -> f64 {
    0.5
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            refresh_cooldown_ms: default_refresh_cooldown_ms(),
            fit_safety: default_fit_safety(),
            stats_strip_px: default_stats_strip_px(),
            min_zoom: default_min_zoom(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    #[serde(default = "default_batch_cap")]
    pub batch_cap: u64,
}

fn default_batch_cap() -> u64 {
    10
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            batch_cap: default_batch_cap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Quiet period before an edited Guard config is pushed to the coordinator.
    #[serde(default = "default_save_debounce_ms")]
    pub save_debounce_ms: u64,
}

fn default_save_debounce_ms() -> u64 {
    800
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            save_debounce_ms: default_save_debounce_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    #[serde(default = "default_throttle_ttl_ms")]
    pub default_ttl_ms: u64,

    #[serde(default = "default_throttle_capacity")]
    pub capacity: usize,
}

fn default_throttle_ttl_ms() -> u64 {
    10_000
}

fn default_throttle_capacity() -> usize {
    4096
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: default_throttle_ttl_ms(),
            capacity: default_throttle_capacity(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "pixel_fleet_console=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Substitute `${ENV_VAR}` patterns with their environment values (empty when unset).
fn substitute_env_vars(input: &str) -> String {
    let Ok(re) = regex::Regex::new(r"\$\{([^}]+)\}") else {
        return input.to_string();
    };
    re.replace_all(input, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    ///
    /// A missing file is not an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw);

        json5::from_str(&substituted).map_err(|e| FleetError::Config(e.to_string()))
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn coordinator(&self) -> CoordinatorConfig {
        self.coordinator.clone().unwrap_or_default()
    }

    pub fn link(&self) -> LinkConfig {
        self.link.clone().unwrap_or_default()
    }

    pub fn preview(&self) -> PreviewConfig {
        self.preview.clone().unwrap_or_default()
    }

    pub fn planner(&self) -> PlannerConfig {
        self.planner.clone().unwrap_or_default()
    }

    pub fn guard(&self) -> GuardConfig {
        self.guard.clone().unwrap_or_default()
    }

    pub fn throttle(&self) -> ThrottleConfig {
        self.throttle.clone().unwrap_or_default()
    }

    pub fn logging(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_else(|| LoggingConfig {
            format: default_log_format(),
            level: None,
            filters: Vec::new(),
            output: default_log_output(),
        })
    }

    /// Coordinator base URL without a trailing slash.
    pub fn coordinator_url(&self) -> String {
        self.coordinator().url.trim_end_matches('/').to_string()
    }

    /// WebSocket URL of the operator channel, derived from the HTTP base URL.
    pub fn ws_url(&self) -> String {
        let coordinator = self.coordinator();
        let base = coordinator.url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        let path = coordinator.ws_path;
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.coordinator().request_timeout_ms)
    }

    pub fn batch_cap(&self) -> u64 {
        self.planner().batch_cap
    }

    /// Resolved client-state file path.
    pub fn state_path(&self) -> PathBuf {
        self.state_path
            .as_ref()
            .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
            .unwrap_or_else(|| data_dir().join("state.json"))
    }

    /// Get a config value by dotted path (e.g. "link.reconnect_max_ms").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Set a config value by dotted path, creating intermediate sections.
    pub fn set_path(&mut self, path: &str, value: serde_json::Value) -> Result<()> {
        let mut json = serde_json::to_value(&*self)?;

        let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
        let Some((last, parents)) = segments.split_last() else {
            return Err(FleetError::Config("Empty path".into()));
        };

        let mut current = &mut json;
        for segment in parents {
            let map = current
                .as_object_mut()
                .ok_or_else(|| FleetError::Config(format!("'{segment}' is not a section")))?;
            current = map
                .entry(segment.to_string())
                .or_insert_with(|| serde_json::json!({}));
        }
        let map = current
            .as_object_mut()
            .ok_or_else(|| FleetError::Config(format!("Cannot set '{path}'")))?;
        map.insert(last.to_string(), value);

        *self = serde_json::from_value(json)
            .map_err(|e| FleetError::Config(format!("Invalid value for '{path}': {e}")))?;
        Ok(())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        let coordinator = self.coordinator();
        if !(coordinator.url.starts_with("http://") || coordinator.url.starts_with("https://")) {
            errors.push(format!(
                "Coordinator url must start with http:// or https://: {}",
                coordinator.url
            ));
        }
        if coordinator.request_timeout_ms == 0 {
            errors.push("coordinator.request_timeout_ms cannot be 0".to_string());
        }

        let link = self.link();
        if link.reconnect_multiplier < 1.0 {
            errors.push(format!(
                "link.reconnect_multiplier must be >= 1.0, got {}",
                link.reconnect_multiplier
            ));
        }
        if link.reconnect_base_ms > link.reconnect_max_ms {
            warnings.push(format!(
                "link.reconnect_base_ms ({}) exceeds reconnect_max_ms ({}); every delay will be the cap",
                link.reconnect_base_ms, link.reconnect_max_ms
            ));
        }
        if link.max_reconnect_attempts == 0 {
            warnings.push("link.max_reconnect_attempts is 0; the link will never reconnect".to_string());
        }
        if link.compression_threshold_bytes < 1024 {
            warnings.push(format!(
                "link.compression_threshold_bytes is very small ({}); most frames will be compressed",
                link.compression_threshold_bytes
            ));
        }

        let preview = self.preview();
        if !(preview.fit_safety > 0.0 && preview.fit_safety <= 1.0) {
            errors.push(format!(
                "preview.fit_safety must be in (0, 1], got {}",
                preview.fit_safety
            ));
        }
        if preview.min_zoom <= 0.0 {
            errors.push(format!("preview.min_zoom must be positive, got {}", preview.min_zoom));
        }

        if self.batch_cap() == 0 {
            errors.push("planner.batch_cap cannot be 0".to_string());
        }

        let logging = self.logging();
        if !matches!(logging.format.as_str(), "plain" | "json") {
            warnings.push(format!("Unknown logging.format '{}', using plain", logging.format));
        }

        (warnings, errors)
    }

    /// Save config to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Base directory for pixel-fleet data: `~/.pixel_fleet/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pixel_fleet")
}
