//! Error types for compiler detection and command synthesis.

use crate::vendor::Language;

/// Result type alias for toolchain operations.
pub type Result<T, E = ToolchainError> = std::result::Result<T, E>;

/// Errors raised while probing compilers or building command lines.
#[derive(Debug, thiserror::Error)]
pub enum ToolchainError {
    /// Filesystem or process I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A compiler command string contained no words.
    #[error("empty compiler command")]
    EmptyCommand,

    /// The probe program could not be compiled or run.
    #[error("probe with `{command}` failed: {reason}")]
    ProbeFailed { command: String, reason: String },

    /// The probe program printed something other than the two expected lines.
    #[error("invalid probe output: {0:?}")]
    InvalidProbeOutput(String),

    /// The probe was built as the other language.
    #[error("requested {requested} compiler, found {found}")]
    LanguageMismatch { requested: Language, found: String },

    /// The probe identified a compiler vendor we do not model.
    #[error("unknown compiler vendor: {0}")]
    UnknownVendor(String),

    /// A gcc-compatible version string that is not `major.minor`.
    #[error("invalid {vendor} version: {version}")]
    InvalidVersion { vendor: String, version: String },

    /// Two sources of one binary map to the same object file.
    #[error("sources {first:?} and {second:?} both compile to {object}")]
    DuplicateObject {
        object: String,
        first: std::path::PathBuf,
        second: std::path::PathBuf,
    },

    /// No candidate compiler passed verification.
    #[error("unable to find a suitable {0} compiler")]
    NoCompiler(Language),
}

impl ToolchainError {
    pub fn probe_failed(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProbeFailed {
            command: command.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_version(vendor: impl Into<String>, version: impl Into<String>) -> Self {
        Self::InvalidVersion {
            vendor: vendor.into(),
            version: version.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            ToolchainError::NoCompiler(Language::Cxx).to_string(),
            "unable to find a suitable CXX compiler"
        );
        assert_eq!(
            ToolchainError::LanguageMismatch {
                requested: Language::C,
                found: "CXX".into()
            }
            .to_string(),
            "requested CC compiler, found CXX"
        );
        assert_eq!(
            ToolchainError::probe_failed("cc", "exit status 1").to_string(),
            "probe with `cc` failed: exit status 1"
        );
    }
}
