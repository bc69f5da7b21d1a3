//! Finding a working C or C++ compiler.
//!
//! Each candidate is verified by compiling and running a small probe
//! program that prints the vendor and version it was built with, followed by
//! the language it was compiled as. The first candidate that verifies wins.

use crate::error::{Result, ToolchainError};
use crate::vendor::{Language, Platform, Vendor, VendorKind};
use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use tracing::{debug, info};

/// Program compiled to identify a compiler. It prints `"<vendor> <version>"`
/// and then `CC` or `CXX`.
pub const PROBE_SOURCE: &str = r#"
#include <stdio.h>
#include <stdlib.h>

int main()
{
#if defined __ICC
  printf("icc %d\n", __ICC);
#elif defined __clang__
# if defined(__clang_major__) && defined(__clang_minor__)
  printf("clang %d.%d\n", __clang_major__, __clang_minor__);
# else
  printf("clang 1.%d\n", __GNUC_MINOR__);
# endif
#elif defined __GNUC__
  printf("gcc %d.%d\n", __GNUC__, __GNUC_MINOR__);
#elif defined _MSC_VER
  printf("msvc %d\n", _MSC_VER);
#elif defined __TenDRA__
  printf("tendra 0\n");
#elif defined __SUNPRO_C
  printf("sun %x\n", __SUNPRO_C);
#elif defined __SUNPRO_CC
  printf("sun %x\n", __SUNPRO_CC);
#else
#error "Unrecognized compiler!"
#endif
#if defined __cplusplus
  printf("CXX\n");
#else
  printf("CC\n");
#endif
  exit(0);
}
"#;

/// Compiler overrides and flags taken from the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeEnv {
    pub cc: Option<String>,
    pub cxx: Option<String>,
    pub cflags: Vec<String>,
    pub cxxflags: Vec<String>,
}

impl ProbeEnv {
    /// Read `CC`, `CXX`, `CFLAGS` and `CXXFLAGS` from the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(&std::env::vars().collect())
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Self {
        let words = |key: &str| -> Vec<String> {
            vars.get(key)
                .map(|v| v.split_whitespace().map(str::to_owned).collect())
                .unwrap_or_default()
        };
        let command = |key: &str| -> Option<String> {
            vars.get(key)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };
        Self {
            cc: command("CC"),
            cxx: command("CXX"),
            cflags: words("CFLAGS"),
            cxxflags: words("CXXFLAGS"),
        }
    }

    pub fn compiler_override(&self, language: Language) -> Option<&str> {
        match language {
            Language::C => self.cc.as_deref(),
            Language::Cxx => self.cxx.as_deref(),
        }
    }

    /// Flags passed while probing: `CFLAGS` always, `CXXFLAGS` for C++.
    pub fn probe_flags(&self, language: Language) -> Vec<String> {
        let mut flags = self.cflags.clone();
        if language == Language::Cxx {
            flags.extend(self.cxxflags.iter().cloned());
        }
        flags
    }
}

/// Compilers to try, in order.
pub fn candidates(language: Language, platform: Platform, env: &ProbeEnv) -> Vec<String> {
    if let Some(command) = env.compiler_override(language) {
        return vec![command.to_owned()];
    }
    let list: &[&str] = match (language, platform) {
        (Language::C, Platform::Mac) => &["cc", "clang", "gcc", "icc"],
        (Language::C, Platform::Windows) => &["cl"],
        (Language::C, _) => &["cc", "gcc", "clang", "icc"],
        (Language::Cxx, Platform::Mac) => &["c++", "clang++", "g++", "icc"],
        (Language::Cxx, Platform::Windows) => &["cl"],
        (Language::Cxx, _) => &["c++", "g++", "clang++", "icc"],
    };
    list.iter().map(|s| (*s).to_owned()).collect()
}

/// Interpret the probe program's output.
pub fn parse_probe_output(language: Language, command: &str, stdout: &str) -> Result<Vendor> {
    let lines: Vec<&str> = stdout.lines().collect();
    let [ident, lang] = lines.as_slice() else {
        return Err(ToolchainError::InvalidProbeOutput(stdout.to_owned()));
    };
    if *lang != language.env_var() {
        return Err(ToolchainError::LanguageMismatch {
            requested: language,
            found: (*lang).to_owned(),
        });
    }

    let mut words = ident.split(' ');
    let (Some(name), Some(version), None) = (words.next(), words.next(), words.next()) else {
        return Err(ToolchainError::InvalidProbeOutput(stdout.to_owned()));
    };
    let kind = VendorKind::from_probe_name(name)
        .ok_or_else(|| ToolchainError::UnknownVendor(name.to_owned()))?;
    Vendor::new(kind, version, command)
}

/// Compile and run the probe with `command`, in a scratch directory.
pub fn verify_compiler(
    language: Language,
    command: &str,
    env: &ProbeEnv,
    platform: Platform,
) -> Result<Vendor> {
    let scratch = tempfile::Builder::new().prefix("parabuild-probe").tempdir()?;
    verify_in(scratch.path(), language, command, env, platform)
}

fn verify_in(
    dir: &Path,
    language: Language,
    command: &str,
    env: &ProbeEnv,
    platform: Platform,
) -> Result<Vendor> {
    let mut words = command.split_whitespace();
    let program = words.next().ok_or(ToolchainError::EmptyCommand)?;

    let source = language.probe_file_name();
    let executable = format!("{}{}", language.probe_exe_stem(), platform.exe_suffix());
    std::fs::write(dir.join(source), PROBE_SOURCE)?;

    let mut args: Vec<String> = words.map(str::to_owned).collect();
    args.extend(env.probe_flags(language));
    args.extend([source.to_owned(), "-o".to_owned(), executable.clone()]);
    debug!(%language, command = %program, ?args, "Checking compiler");

    let compiled = Command::new(program)
        .args(&args)
        .current_dir(dir)
        .output()
        .map_err(|e| ToolchainError::probe_failed(command, format!("not found: {e}")))?;
    if !compiled.status.success() {
        return Err(ToolchainError::probe_failed(
            command,
            format!("compile failed with {}", compiled.status),
        ));
    }

    let ran = Command::new(dir.join(&executable))
        .current_dir(dir)
        .output()
        .map_err(|e| ToolchainError::probe_failed(command, format!("probe did not run: {e}")))?;
    if !ran.status.success() {
        return Err(ToolchainError::probe_failed(
            command,
            format!("probe exited with {}", ran.status),
        ));
    }

    let vendor = parse_probe_output(language, command, &String::from_utf8_lossy(&ran.stdout))?;
    info!(%language, vendor = vendor.name(), version = vendor.version(), "Found compiler");
    Ok(vendor)
}

/// Find a working compiler for `language` on the current platform.
pub fn detect_compiler(language: Language, env: &ProbeEnv) -> Result<Vendor> {
    detect_compiler_for(language, env, Platform::current())
}

pub fn detect_compiler_for(language: Language, env: &ProbeEnv, platform: Platform) -> Result<Vendor> {
    for command in candidates(language, platform, env) {
        match verify_compiler(language, &command, env, platform) {
            Ok(vendor) => return Ok(vendor),
            Err(e) => debug!(%language, %command, error = %e, "Compiler rejected"),
        }
    }
    Err(ToolchainError::NoCompiler(language))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidates_by_platform() {
        let env = ProbeEnv::default();
        assert_eq!(
            candidates(Language::C, Platform::Linux, &env),
            vec!["cc", "gcc", "clang", "icc"]
        );
        assert_eq!(
            candidates(Language::Cxx, Platform::Mac, &env),
            vec!["c++", "clang++", "g++", "icc"]
        );
        assert_eq!(candidates(Language::Cxx, Platform::Windows, &env), vec!["cl"]);
    }

    #[test]
    fn test_env_override_replaces_search() {
        let vars = HashMap::from([
            ("CC".to_owned(), " ccache gcc ".to_owned()),
            ("CFLAGS".to_owned(), "-m32 -O2".to_owned()),
            ("CXXFLAGS".to_owned(), "-fno-rtti".to_owned()),
        ]);
        let env = ProbeEnv::from_vars(&vars);
        assert_eq!(candidates(Language::C, Platform::Linux, &env), vec!["ccache gcc"]);
        assert_eq!(env.probe_flags(Language::C), vec!["-m32", "-O2"]);
        assert_eq!(env.probe_flags(Language::Cxx), vec!["-m32", "-O2", "-fno-rtti"]);
        assert_eq!(env.cxx, None);
    }

    #[test]
    fn test_parse_probe_output() {
        let v = parse_probe_output(Language::Cxx, "g++", "gcc 12.2\nCXX\n").unwrap();
        assert_eq!(v.kind(), VendorKind::Gcc);
        assert_eq!(v.version(), "12.2");
        assert_eq!(v.command(), "g++");

        let v = parse_probe_output(Language::C, "cl", "msvc 1900\r\nCC\r\n").unwrap();
        assert_eq!(v.kind(), VendorKind::Msvc);
    }

    #[test]
    fn test_parse_probe_output_rejects_bad_output() {
        assert!(matches!(
            parse_probe_output(Language::C, "cc", "gcc 12.2\n"),
            Err(ToolchainError::InvalidProbeOutput(_))
        ));
        assert!(matches!(
            parse_probe_output(Language::C, "c++", "gcc 12.2\nCXX\n"),
            Err(ToolchainError::LanguageMismatch { .. })
        ));
        assert!(matches!(
            parse_probe_output(Language::C, "icc", "icc 1300\nCC\n"),
            Err(ToolchainError::UnknownVendor(name)) if name == "icc"
        ));
        assert!(matches!(
            parse_probe_output(Language::C, "cc", "gcc\nCC\n"),
            Err(ToolchainError::InvalidProbeOutput(_))
        ));
    }

    #[test]
    fn test_missing_compiler_is_rejected() {
        let env = ProbeEnv {
            cc: Some("/nonexistent/cc".to_owned()),
            ..ProbeEnv::default()
        };
        assert!(matches!(
            detect_compiler_for(Language::C, &env, Platform::Linux),
            Err(ToolchainError::NoCompiler(Language::C))
        ));
    }
}
