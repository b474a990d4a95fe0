use std::fmt;
use std::path::Path;

use frame_scheduler::{DEFAULT_MAX_TILE_EDGE, PerformanceMode, ProgressiveSchedulerConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceSetting {
    Low,
    #[default]
    High,
}

impl From<PerformanceSetting> for PerformanceMode {
    fn from(setting: PerformanceSetting) -> Self {
        match setting {
            PerformanceSetting::Low => PerformanceMode::Low,
            PerformanceSetting::High => PerformanceMode::High,
        }
    }
}

/// Which rendering contexts the viewer attaches at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Software,
    Wgpu,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub performance_mode: PerformanceSetting,
    pub max_tile_edge: u32,
    pub backend: Backend,
    pub context_count: u32,
    pub viewport: [u32; 2],
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            performance_mode: PerformanceSetting::default(),
            max_tile_edge: DEFAULT_MAX_TILE_EDGE,
            backend: Backend::default(),
            context_count: 1,
            viewport: [512, 512],
        }
    }
}

impl ViewerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|error| ConfigError::Io {
            path: path.display().to_string(),
            message: error.to_string(),
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tile_edge == 0 {
            return Err(ConfigError::Invalid {
                field: "max_tile_edge",
                reason: "must be positive",
            });
        }
        if self.context_count > 8 {
            return Err(ConfigError::Invalid {
                field: "context_count",
                reason: "at most 8 rendering contexts are supported",
            });
        }
        Ok(())
    }

    pub fn scheduler_config(&self) -> ProgressiveSchedulerConfig {
        ProgressiveSchedulerConfig {
            performance_mode: self.performance_mode.into(),
            max_tile_edge: self.max_tile_edge,
        }
    }

    pub fn viewport(&self) -> (u32, u32) {
        (self.viewport[0], self.viewport[1])
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io { path: String, message: String },
    Parse(serde_json::Error),
    Invalid { field: &'static str, reason: &'static str },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, message } => {
                write!(formatter, "failed to read config {path}: {message}")
            }
            ConfigError::Parse(error) => write!(formatter, "invalid config json: {error}"),
            ConfigError::Invalid { field, reason } => {
                write!(formatter, "invalid config field {field}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Parse(error) => Some(error),
            _ => None,
        }
    }
}
