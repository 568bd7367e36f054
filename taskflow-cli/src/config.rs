use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use taskflow::EngineConfig;
use tracing::debug;

use crate::cli::{Args, LogFormat, OutputFormat};
use crate::error::{AppError, Result};

/// Contents of the configuration file. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub format: OutputFormat,
    pub log_level: Option<String>,
    pub log_format: LogFormat,
}

impl AppConfig {
    /// Load `path`, or the default location if it exists, or the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(path) if path.is_file() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("taskflow").join("config.toml"))
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| AppError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(|source| AppError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Command-line flags win over file values.
    pub fn apply_args(mut self, args: &Args) -> Self {
        if let Some(workers) = args.workers {
            self.engine.worker_count = workers;
        }
        if let Some(capacity) = args.queue_capacity {
            self.engine.queue_capacity = capacity;
        }
        if let Some(level) = &args.log_level {
            self.output.log_level = Some(level.clone());
        }
        if let Some(format) = args.log_format {
            self.output.log_format = format;
        }
        if let Some(format) = args.output {
            self.output.format = format;
        }
        self
    }
}
