//! Compiler vendors.
//!
//! The set of vendors is closed. A [`Vendor`] is decided once at detection
//! time and is immutable afterwards; every vendor-specific piece of a
//! command line comes from a pure function of its [`VendorKind`].

use crate::error::{Result, ToolchainError};
use crate::paths::{normalize_path, relative_path};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Source language a compiler is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    #[serde(rename = "CC")]
    C,
    #[serde(rename = "CXX")]
    Cxx,
}

impl Language {
    /// The environment variable naming the compiler, which is also the
    /// marker the probe program prints.
    pub fn env_var(self) -> &'static str {
        match self {
            Self::C => "CC",
            Self::Cxx => "CXX",
        }
    }

    pub fn probe_file_name(self) -> &'static str {
        match self {
            Self::C => "test.c",
            Self::Cxx => "test.cpp",
        }
    }

    pub fn probe_exe_stem(self) -> &'static str {
        match self {
            Self::C => "test",
            Self::Cxx => "testp",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.env_var())
    }
}

/// Host platform, as far as command synthesis cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Mac,
    Windows,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Self::Windows
        } else if cfg!(target_os = "macos") {
            Self::Mac
        } else if cfg!(target_os = "linux") {
            Self::Linux
        } else {
            Self::Other
        }
    }

    pub fn exe_suffix(self) -> &'static str {
        match self {
            Self::Windows => ".exe",
            _ => "",
        }
    }

    pub fn shared_lib_suffix(self) -> &'static str {
        match self {
            Self::Windows => ".dll",
            Self::Mac => ".dylib",
            _ => ".so",
        }
    }
}

/// The compiler families we know how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VendorKind {
    Msvc,
    Gcc,
    Clang,
    #[serde(rename = "sun")]
    SunPro,
}

/// Command-line dialect shared by several vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Behavior {
    Msvc,
    Gcc,
    Sun,
}

impl VendorKind {
    /// Map the first word of the probe output to a vendor.
    pub fn from_probe_name(name: &str) -> Option<Self> {
        match name {
            "msvc" => Some(Self::Msvc),
            "gcc" => Some(Self::Gcc),
            "clang" => Some(Self::Clang),
            "sun" => Some(Self::SunPro),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Msvc => "msvc",
            Self::Gcc => "gcc",
            Self::Clang => "clang",
            Self::SunPro => "sun",
        }
    }

    pub fn behavior(self) -> Behavior {
        match self {
            Self::Msvc => Behavior::Msvc,
            Self::Gcc | Self::Clang => Behavior::Gcc,
            Self::SunPro => Behavior::Sun,
        }
    }

    pub fn object_suffix(self) -> &'static str {
        match self {
            Self::Msvc => ".obj",
            _ => ".o",
        }
    }

    pub fn define_prefix(self) -> &'static str {
        match self {
            Self::Msvc => "/D",
            _ => "-D",
        }
    }

    pub fn pdb_suffix(self) -> Option<&'static str> {
        match self {
            Self::Msvc => Some(".pdb"),
            _ => None,
        }
    }
}

impl fmt::Display for VendorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A detected compiler: vendor, version string and the command used to run
/// it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vendor {
    kind: VendorKind,
    version: String,
    command: String,
}

impl Vendor {
    /// Build a vendor record, validating the version where the vendor's
    /// dialect depends on it.
    pub fn new(kind: VendorKind, version: impl Into<String>, command: impl Into<String>) -> Result<Self> {
        let version = version.into();
        let command = command.into();
        if command.split_whitespace().next().is_none() {
            return Err(ToolchainError::EmptyCommand);
        }
        if kind.behavior() == Behavior::Gcc && parse_major_minor(&version).is_none() {
            return Err(ToolchainError::invalid_version(kind.name(), version));
        }
        Ok(Self {
            kind,
            version,
            command,
        })
    }

    pub fn kind(&self) -> VendorKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn behavior(&self) -> Behavior {
        self.kind.behavior()
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// The command split into argv words.
    pub fn command_argv(&self) -> Vec<String> {
        self.command.split_whitespace().map(str::to_owned).collect()
    }

    pub fn object_suffix(&self) -> &'static str {
        self.kind.object_suffix()
    }

    pub fn define_prefix(&self) -> &'static str {
        self.kind.define_prefix()
    }

    pub fn pdb_suffix(&self) -> Option<&'static str> {
        self.kind.pdb_suffix()
    }

    pub fn is_msvc(&self) -> bool {
        self.kind == VendorKind::Msvc
    }

    pub fn is_gcc_compatible(&self) -> bool {
        self.behavior() == Behavior::Gcc
    }

    /// `(major, minor)` for gcc-compatible vendors.
    pub fn major_minor(&self) -> Option<(u32, u32)> {
        if self.is_gcc_compatible() {
            parse_major_minor(&self.version)
        } else {
            None
        }
    }

    /// Arguments adding `include_path` to the header search path of a
    /// compile whose outputs go to `output_path`.
    ///
    /// MSVC gets a path relative to the output folder when both live under
    /// the same root; everything else gets the normalized path.
    pub fn format_include(&self, output_path: &Path, include_path: &Path) -> Vec<String> {
        match self.kind {
            VendorKind::Msvc => {
                let path = relative_path(include_path, output_path)
                    .unwrap_or_else(|| include_path.to_path_buf());
                vec!["/I".to_owned(), path.display().to_string()]
            }
            _ => vec![
                "-I".to_owned(),
                normalize_path(include_path).display().to_string(),
            ],
        }
    }

    /// Arguments compiling `source` into `object`, including the flag that
    /// makes the compiler report the headers it read.
    pub fn object_args(&self, source: &str, object: &str) -> Vec<String> {
        match self.kind {
            VendorKind::Msvc => vec![
                "/showIncludes".to_owned(),
                "/nologo".to_owned(),
                "/c".to_owned(),
                source.to_owned(),
                format!("/Fo{object}"),
            ],
            _ => vec![
                "-H".to_owned(),
                "-c".to_owned(),
                source.to_owned(),
                "-o".to_owned(),
                object.to_owned(),
            ],
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} (`{}`)", self.kind, self.version, self.command)
    }
}

fn parse_major_minor(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}
