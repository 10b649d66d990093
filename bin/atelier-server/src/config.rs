//! Server configuration.
//!
//! Built in three layers, later layers winning:
//! 1. Built-in defaults.
//! 2. An optional TOML file (`--config <path>` or `ATELIER_CONFIG`).
//! 3. `ATELIER_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Runtime configuration for atelier-server.
///
/// Every field has a default so the server starts without a config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Comma-separated list of allowed CORS origins. Unset means any origin.
    pub cors_allowed_origins: Option<String>,

    pub server: ServerConfig,
    pub model: ModelConfig,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Which engine to run. Only `"procedural"` is built in.
    pub model_id: String,
    pub use_lora: bool,
    pub lora: Option<LoraConfig>,
    /// Step count used when a request does not give one.
    pub num_inference_steps: u32,
    pub use_cpu_offload: bool,
    /// Directory finished images are written to.
    pub output_dir: PathBuf,
    pub width: u32,
    pub height: u32,
    /// Artificial per-step delay for the procedural engine.
    pub step_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LoraConfig {
    pub lora_dir: PathBuf,
    pub weight_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub queue_capacity: usize,
    /// Fail generations that run longer than this. Unset disables the limit.
    pub generation_timeout_secs: Option<u64>,
    /// Seed used when a request does not give one.
    pub default_seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_json: false,
            cors_allowed_origins: None,
            server: ServerConfig::default(),
            model: ModelConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 8000,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_id: "procedural".to_owned(),
            use_lora: false,
            lora: None,
            num_inference_steps: 23,
            use_cpu_offload: true,
            output_dir: PathBuf::from("./output/images"),
            width: 512,
            height: 512,
            step_delay_ms: 0,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            generation_timeout_secs: None,
            default_seed: 42,
        }
    }
}

impl Config {
    /// Load configuration from `path` (or `ATELIER_CONFIG`) and the process
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// Same as [`Config::load`] with an injectable environment lookup.
    pub fn load_with(
        path: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| env("ATELIER_CONFIG").map(PathBuf::from));

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(&env);
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) {
        set_parsed(env, "ATELIER_HOST", &mut self.server.host);
        set_parsed(env, "ATELIER_PORT", &mut self.server.port);

        set_parsed(env, "ATELIER_MODEL_ID", &mut self.model.model_id);
        set_flag(env, "ATELIER_USE_LORA", &mut self.model.use_lora);
        if let Some(lora_dir) = env("ATELIER_LORA_DIR") {
            let weight_name = env("ATELIER_LORA_WEIGHT_NAME")
                .or_else(|| self.model.lora.as_ref().map(|l| l.weight_name.clone()))
                .unwrap_or_default();
            self.model.lora = Some(LoraConfig {
                lora_dir: PathBuf::from(lora_dir),
                weight_name,
            });
        }
        set_parsed(env, "ATELIER_NUM_INFERENCE_STEPS", &mut self.model.num_inference_steps);
        set_flag(env, "ATELIER_USE_CPU_OFFLOAD", &mut self.model.use_cpu_offload);
        set_parsed(env, "ATELIER_OUTPUT_DIR", &mut self.model.output_dir);
        set_parsed(env, "ATELIER_WIDTH", &mut self.model.width);
        set_parsed(env, "ATELIER_HEIGHT", &mut self.model.height);
        set_parsed(env, "ATELIER_STEP_DELAY_MS", &mut self.model.step_delay_ms);

        set_parsed(env, "ATELIER_QUEUE_CAPACITY", &mut self.runtime.queue_capacity);
        if let Some(secs) = env("ATELIER_GENERATION_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.runtime.generation_timeout_secs = Some(secs);
        }
        set_parsed(env, "ATELIER_DEFAULT_SEED", &mut self.runtime.default_seed);

        set_parsed(env, "ATELIER_LOG", &mut self.log_level);
        set_flag(env, "ATELIER_LOG_JSON", &mut self.log_json);
        if let Some(origins) = env("ATELIER_CORS_ORIGINS") {
            self.cors_allowed_origins = Some(origins);
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn generation_timeout(&self) -> Option<Duration> {
        self.runtime
            .generation_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

/// Overwrite `slot` when `key` is set and parses; otherwise leave it alone.
fn set_parsed<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(value) = env(key).and_then(|v| v.parse().ok()) {
        *slot = value;
    }
}

fn set_flag(env: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut bool) {
    if let Some(value) = env(key) {
        *slot = value == "1" || value.eq_ignore_ascii_case("true");
    }
}
