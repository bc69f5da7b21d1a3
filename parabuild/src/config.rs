//! Runner settings.
//!
//! Settings come from `parabuild.toml` in the working directory (or the file
//! named by `PARABUILD_CONFIG`), then environment overrides, then command
//! line flags. A missing file means defaults.

use crate::error::{BuildError, Result};
use parabuild_ipc::{DEFAULT_MAX_PAYLOAD, FrameCodec, LivenessPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default settings file, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "parabuild.toml";

// Environment variable names
pub const ENV_CONFIG_PATH: &str = "PARABUILD_CONFIG";
pub const ENV_JOBS: &str = "PARABUILD_JOBS";
pub const ENV_LOG_LEVEL: &str = "PARABUILD_LOG_LEVEL";
pub const ENV_LIVENESS_TIMEOUT_SECS: &str = "PARABUILD_LIVENESS_TIMEOUT_SECS";
pub const ENV_KEEP_GOING: &str = "PARABUILD_KEEP_GOING";
pub const ENV_MAX_FRAME_BYTES: &str = "PARABUILD_MAX_FRAME_BYTES";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log_level: String,
    pub build: BuildSection,
    pub ipc: IpcSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSection {
    /// Worker processes to run in parallel.
    pub jobs: usize,
    /// Keep dispatching after a task fails.
    pub keep_going: bool,
    /// Output directory for `build`, relative to the manifest.
    pub build_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcSection {
    /// Drop a worker channel silent for this long. Unset waits forever.
    pub liveness_timeout_secs: Option<u64>,
    pub max_frame_bytes: usize,
    /// How long an idle worker gets to exit after its channel is closed.
    pub shutdown_grace_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            build: BuildSection::default(),
            ipc: IpcSection::default(),
        }
    }
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            keep_going: false,
            build_dir: PathBuf::from("build"),
        }
    }
}

impl Default for IpcSection {
    fn default() -> Self {
        Self {
            liveness_timeout_secs: None,
            max_frame_bytes: DEFAULT_MAX_PAYLOAD,
            shutdown_grace_ms: 2000,
        }
    }
}

fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Settings {
    /// Load from `PARABUILD_CONFIG` or `./parabuild.toml`, falling back to
    /// defaults when no file exists, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var(ENV_CONFIG_PATH).ok().map(PathBuf::from);
        let mut settings = match explicit {
            Some(path) => Self::load_file(&path)?,
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::load_file(path)?
                } else {
                    debug!("No {} found, using defaults", DEFAULT_CONFIG_FILE);
                    Self::default()
                }
            }
        };
        settings.merge_env_vars()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load a settings file, apply environment overrides and validate.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut settings = Self::load_file(path)?;
        settings.merge_env_vars()?;
        settings.validate()?;
        Ok(settings)
    }

    fn load_file(path: &Path) -> Result<Self> {
        debug!("Loading settings from: {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|e| {
            BuildError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| BuildError::config(format!("Failed to serialize settings: {}", e)))
    }

    /// Apply overrides from the process environment.
    pub fn merge_env_vars(&mut self) -> Result<()> {
        self.merge_vars(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn merge_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            debug!("Overriding log_level from environment: {}", level);
            self.log_level = level;
        }

        if let Some(jobs) = lookup(ENV_JOBS) {
            self.build.jobs = parse_var(ENV_JOBS, &jobs)?;
            debug!("Overriding jobs from environment: {}", self.build.jobs);
        }

        if let Some(keep_going) = lookup(ENV_KEEP_GOING) {
            self.build.keep_going = parse_bool(ENV_KEEP_GOING, &keep_going)?;
            debug!("Overriding keep_going from environment: {}", self.build.keep_going);
        }

        if let Some(secs) = lookup(ENV_LIVENESS_TIMEOUT_SECS) {
            let secs: u64 = parse_var(ENV_LIVENESS_TIMEOUT_SECS, &secs)?;
            // Zero turns the timeout off.
            self.ipc.liveness_timeout_secs = (secs > 0).then_some(secs);
            debug!("Overriding liveness timeout from environment: {}s", secs);
        }

        if let Some(bytes) = lookup(ENV_MAX_FRAME_BYTES) {
            self.ipc.max_frame_bytes = parse_var(ENV_MAX_FRAME_BYTES, &bytes)?;
            debug!("Overriding max frame size from environment: {}", self.ipc.max_frame_bytes);
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(BuildError::config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        if self.build.jobs == 0 {
            return Err(BuildError::config("jobs must be at least 1"));
        }

        if self.ipc.max_frame_bytes == 0 {
            return Err(BuildError::config("max_frame_bytes must be greater than 0"));
        }

        if self.ipc.max_frame_bytes > u32::MAX as usize {
            return Err(BuildError::config(format!(
                "max_frame_bytes must not exceed {}",
                u32::MAX
            )));
        }

        if self.ipc.liveness_timeout_secs == Some(0) {
            return Err(BuildError::config(
                "liveness_timeout_secs must be greater than 0 (omit it to disable)",
            ));
        }

        Ok(())
    }

    pub fn liveness(&self) -> LivenessPolicy {
        match self.ipc.liveness_timeout_secs {
            Some(secs) => LivenessPolicy::Timeout(Duration::from_secs(secs)),
            None => LivenessPolicy::Disabled,
        }
    }

    pub fn frame_codec(&self) -> FrameCodec {
        FrameCodec::new(self.ipc.max_frame_bytes)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.ipc.shutdown_grace_ms)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| BuildError::config(format!("Invalid {} in environment: {}", key, e)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(BuildError::config(format!(
            "Invalid {} in environment: '{}' is not a boolean",
            key, other
        ))),
    }
}
