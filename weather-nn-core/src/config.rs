use anyhow::{Context, Result, anyhow};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{error::ConfigError, model::Activation};

/// Where the training data lives and how it is windowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub path: PathBuf,
    /// Number of past hourly rows fed to the model.
    pub window_size: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("weather_data.csv"),
            window_size: 4,
        }
    }
}

/// Classifier architecture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub conv1_filters: usize,
    pub conv2_filters: usize,
    pub kernel_size: usize,
    pub dense_units: usize,
    pub dropout: f32,
    pub activation: Activation,
    pub learning_rate: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            conv1_filters: 64,
            conv2_filters: 128,
            kernel_size: 3,
            dense_units: 128,
            dropout: 0.3,
            activation: Activation::Relu,
            learning_rate: 0.001,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    /// Validation epochs without `val_loss` improvement before stopping.
    pub patience: usize,
    pub validation_split: f64,
    pub seed: u64,
    /// Chronological split with the scaler fitted on training rows only.
    pub strict_split: bool,
    /// Optional JSON dump of per-epoch metrics.
    pub history_path: Option<PathBuf>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 100,
            batch_size: 64,
            patience: 10,
            validation_split: 0.2,
            seed: 42,
            strict_split: false,
            history_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub model_path: PathBuf,
    pub calibration_samples: usize,
    /// Also emit the artifact as a C array for firmware builds.
    pub c_header_path: Option<PathBuf>,
    /// Write `<model>.labels.json` next to the artifact.
    pub write_labels: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("weather_forecast_conv1d_esp32s3.wxq"),
            calibration_samples: 100,
            c_header_path: None,
            write_labels: true,
        }
    }
}

/// Top-level configuration stored on disk.
///
/// Example TOML:
/// [data]
/// path = "weather_data.csv"
/// window_size = 4
///
/// [train]
/// epochs = 100
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub data: DataConfig,
    pub model: ModelConfig,
    pub train: TrainConfig,
    pub export: ExportConfig,
}

impl PipelineConfig {
    /// Load config from an explicit file, else the platform config file,
    /// else return defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let path = Self::config_file_path()?;
                if !path.exists() {
                    // First run: no config file, use defaults.
                    return Ok(Self::default());
                }
                path
            }
        };

        Self::from_file(&path)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let cfg: PipelineConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(cfg)
    }

    /// Save config to `path`, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, self.to_toml()?)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }

    /// Path to the config file.
    pub fn config_file_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("dev", "weather-nn", "weather-nn")
            .ok_or_else(|| anyhow!("Could not determine platform config directory"))?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data.window_size == 0 {
            return Err(invalid("data.window_size", "must be positive"));
        }
        if self.model.kernel_size == 0 {
            return Err(invalid("model.kernel_size", "must be positive"));
        }
        if self.model.conv1_filters == 0 || self.model.conv2_filters == 0 {
            return Err(invalid("model.conv*_filters", "must be positive"));
        }
        if self.model.dense_units == 0 {
            return Err(invalid("model.dense_units", "must be positive"));
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            return Err(invalid("model.dropout", "must be in [0, 1)"));
        }
        if !(self.model.learning_rate > 0.0) {
            return Err(invalid("model.learning_rate", "must be positive"));
        }
        if self.train.batch_size == 0 {
            return Err(invalid("train.batch_size", "must be positive"));
        }
        if !(self.train.validation_split > 0.0 && self.train.validation_split < 1.0) {
            return Err(invalid("train.validation_split", "must be in (0, 1)"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}
