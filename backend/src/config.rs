use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::diagnosis::DegenerateAudioPolicy;

pub const DEFAULT_CONFIG_PATH: &str = "config/service.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceChoice {
    /// CUDA when available, CPU otherwise.
    #[default]
    Auto,
    Cpu,
    Cuda,
}

impl DeviceChoice {
    pub fn resolve(self) -> tch::Device {
        match self {
            DeviceChoice::Auto => tch::Device::cuda_if_available(),
            DeviceChoice::Cpu => tch::Device::Cpu,
            DeviceChoice::Cuda => tch::Device::Cuda(0),
        }
    }
}

impl FromStr for DeviceChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(DeviceChoice::Auto),
            "cpu" => Ok(DeviceChoice::Cpu),
            "cuda" | "gpu" => Ok(DeviceChoice::Cuda),
            other => Err(format!("unknown device '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub model_path: PathBuf,
    pub device: DeviceChoice,
    pub max_upload_bytes: usize,
    pub inference_timeout_secs: u64,
    pub degenerate_audio: DegenerateAudioPolicy,
    pub cors_max_age: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            model_path: PathBuf::from("weights/best_medical_model.safetensors"),
            device: DeviceChoice::Auto,
            max_upload_bytes: 25 * 1024 * 1024,
            inference_timeout_secs: 30,
            degenerate_audio: DegenerateAudioPolicy::Zero,
            cors_max_age: 3600,
        }
    }
}

impl ServiceConfig {
    /// YAML file (if present) first, then environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var("SERVICE_CONFIG").ok();
        let path = explicit.clone().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        let mut config = if explicit.is_some() || Path::new(&path).is_file() {
            Self::from_file(Path::new(&path))?
        } else {
            log::info!("No config file at {}, using defaults", path);
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("PORT") {
            self.port = parse_value("PORT", &port)?;
        }
        if let Some(path) = lookup("MODEL_PATH") {
            self.model_path = PathBuf::from(path);
        }
        if let Some(device) = lookup("DEVICE") {
            self.device = parse_value("DEVICE", &device)?;
        }
        if let Some(bytes) = lookup("MAX_UPLOAD_BYTES") {
            self.max_upload_bytes = parse_value("MAX_UPLOAD_BYTES", &bytes)?;
        }
        if let Some(secs) = lookup("INFERENCE_TIMEOUT_SECS") {
            self.inference_timeout_secs = parse_value("INFERENCE_TIMEOUT_SECS", &secs)?;
        }
        if let Some(policy) = lookup("DEGENERATE_AUDIO_POLICY") {
            self.degenerate_audio = parse_value("DEGENERATE_AUDIO_POLICY", &policy)?;
        }
        if let Some(age) = lookup("CORS_MAX_AGE") {
            self.cors_max_age = parse_value("CORS_MAX_AGE", &age)?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.inference_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "inference_timeout_secs",
                message: "must be at least 1".to_string(),
            });
        }
        if self.max_upload_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_upload_bytes",
                message: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs)
    }
}

fn parse_value<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
        key,
        message: e.to_string(),
    })
}
