//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Top-level Wavecraft configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_plane: Option<ControlPlaneConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Control-plane API used to obtain per-turn endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    /// Base URL, e.g. `http://localhost:3000/api`.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,

    /// Env var holding the token (default: `AUTH_TOKEN`).
    #[serde(default = "default_auth_token_env", skip_serializing_if = "Option::is_none")]
    pub auth_token_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    #[serde(default = "default_level")]
    pub speed: u8,

    #[serde(default = "default_level")]
    pub volume: u8,

    #[serde(default = "default_level")]
    pub pitch: u8,

    /// Per-request timeout for control-plane calls.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_base_url() -> String {
    "http://localhost:3000/api".into()
}

fn default_auth_token_env() -> Option<String> {
    Some("AUTH_TOKEN".into())
}

fn default_level() -> u8 {
    50
}

fn default_request_timeout_ms() -> u64 {
    15_000
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            auth_token: None,
            auth_token_env: default_auth_token_env(),
            voice: None,
            speed: default_level(),
            volume: default_level(),
            pitch: default_level(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl ControlPlaneConfig {
    pub fn resolve_auth_token(&self) -> Option<String> {
        resolve_secret_field(&self.auth_token, &self.auth_token_env)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Streaming session timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Bound on establishing the transport.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// A session with no uplink, downlink, or playback progress for this
    /// long fails with a timeout.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// How long `close()` waits for each pipeline before aborting it.
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_close_grace_ms() -> u64 {
    2_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            close_grace_ms: default_close_grace_ms(),
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

/// PCM format of the synthesized audio and optional recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_channels")]
    pub channels: u16,

    #[serde(default = "default_bits_per_sample")]
    pub bits_per_sample: u16,

    /// When set, every turn's audio is saved as a WAV file in this directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_dir: Option<String>,
}

fn default_sample_rate() -> u32 {
    16_000
}

fn default_channels() -> u16 {
    1
}

fn default_bits_per_sample() -> u16 {
    16
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            bits_per_sample: default_bits_per_sample(),
            record_dir: None,
        }
    }
}

impl AudioConfig {
    /// Expanded recording directory, if recording is enabled.
    pub fn record_dir(&self) -> Option<PathBuf> {
        self.record_dir
            .as_ref()
            .map(|d| PathBuf::from(shellexpand::tilde(d).as_ref()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "wavecraft_media=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: None,
            filters: Vec::new(),
            output: default_log_output(),
        }
    }
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").unwrap();
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| {
            warn!(var = var_name, "Config references unset environment variable");
            String::new()
        })
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::WavecraftError::Io)?;
        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::WavecraftError::Config(e.to_string()))?;

        debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn control_plane(&self) -> ControlPlaneConfig {
        self.control_plane.clone().unwrap_or_default()
    }

    pub fn session(&self) -> SessionConfig {
        self.session.clone().unwrap_or_default()
    }

    pub fn audio(&self) -> AudioConfig {
        self.audio.clone().unwrap_or_default()
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        let cp = self.control_plane();
        if cp.resolve_auth_token().is_none() {
            warnings.push("Control plane has no auth token configured".to_string());
        }
        if !cp.base_url.starts_with("http://") && !cp.base_url.starts_with("https://") {
            errors.push(format!("Control plane base_url is not http(s): {}", cp.base_url));
        }
        if cp.request_timeout_ms == 0 {
            errors.push("control_plane.request_timeout_ms cannot be 0".to_string());
        }

        let session = self.session();
        for (name, value) in [
            ("connect_timeout_ms", session.connect_timeout_ms),
            ("idle_timeout_ms", session.idle_timeout_ms),
            ("close_grace_ms", session.close_grace_ms),
        ] {
            if value == 0 {
                errors.push(format!("session.{name} cannot be 0"));
            }
        }

        let audio = self.audio();
        if audio.sample_rate == 0 {
            errors.push("audio.sample_rate cannot be 0".to_string());
        }
        if audio.channels == 0 {
            errors.push("audio.channels cannot be 0".to_string());
        }
        if !matches!(audio.bits_per_sample, 8 | 16 | 24 | 32) {
            errors.push(format!(
                "audio.bits_per_sample must be 8, 16, 24 or 32 (got {})",
                audio.bits_per_sample
            ));
        }

        (warnings, errors)
    }
}

/// Base directory for Wavecraft data: `~/.wavecraft/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".wavecraft")
}
