//! Error types for the build runner.

use parabuild_ipc::IpcError;
use parabuild_toolchain::ToolchainError;

/// Result type alias for build operations.
pub type Result<T, E = BuildError> = std::result::Result<T, E>;

/// Errors raised while configuring, planning or running a build.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    #[error("toolchain error: {0}")]
    Toolchain(#[from] ToolchainError),

    /// Invalid settings.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid build manifest.
    #[error("manifest error: {0}")]
    Manifest(String),

    /// Invalid task list.
    #[error("invalid task list: {0}")]
    Tasks(String),

    /// A peer sent a message that does not fit the conversation.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl BuildError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn manifest(msg: impl Into<String>) -> Self {
        Self::Manifest(msg.into())
    }

    pub fn tasks(msg: impl Into<String>) -> Self {
        Self::Tasks(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}
