//! Per-language compile command templates.

use crate::compiler::CompilerConfig;
use crate::vendor::{Language, Vendor};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

static OBJECT_NAME_RE: OnceLock<Regex> = OnceLock::new();

/// Everything on a compile line except the source and object arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEnv {
    language: Language,
    vendor: Vendor,
    base: Vec<String>,
}

impl CommandEnv {
    /// Base argv: command words, flags, defines, then include paths. C++
    /// additionally gets the C++-only flags, defines and includes.
    pub fn new(output_path: &Path, config: &CompilerConfig, language: Language) -> Self {
        let vendor = config.vendor(language).clone();
        let cxx = language == Language::Cxx;
        let prefix = vendor.define_prefix();

        let mut base = vendor.command_argv();
        base.extend(config.cflags.iter().cloned());
        if cxx {
            base.extend(config.cxx_flags.iter().cloned());
        }
        base.extend(config.defines.iter().map(|d| format!("{prefix}{d}")));
        if cxx {
            base.extend(config.cxx_defines.iter().map(|d| format!("{prefix}{d}")));
        }
        for include in &config.includes {
            base.extend(vendor.format_include(output_path, include));
        }
        if cxx {
            for include in &config.cxx_includes {
                base.extend(vendor.format_include(output_path, include));
            }
        }

        Self {
            language,
            vendor,
            base,
        }
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn vendor(&self) -> &Vendor {
        &self.vendor
    }

    pub fn base_argv(&self) -> &[String] {
        &self.base
    }

    /// Full argv compiling `source` into `object`.
    pub fn argv(&self, source: &str, object: &str) -> Vec<String> {
        let mut argv = self.base.clone();
        argv.extend(self.vendor.object_args(source, object));
        argv
    }
}

/// Object file stem for a source path: the extension is dropped and every
/// run of characters outside `[A-Za-z0-9_]` becomes `_`.
pub fn object_name_for(path: &str) -> String {
    let stem = match Path::new(path).extension() {
        Some(ext) => &path[..path.len() - ext.len() - 1],
        None => path,
    };
    OBJECT_NAME_RE
        .get_or_init(|| Regex::new("[^a-zA-Z0-9_]+").expect("valid object name pattern"))
        .replace_all(stem, "_")
        .into_owned()
}
