//! Compiler configuration shared by every binary built from it.

use crate::binary::{BinaryBuilder, BinaryKind};
use crate::vendor::{Language, Vendor};
use std::path::PathBuf;

/// An entry of `link_flags` or `post_link`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkItem {
    /// Passed to the linker verbatim.
    Flag(String),
    /// Passed as `text`, and records that linking depends on `node` (for
    /// example another binary's output).
    Dep { text: String, node: Option<PathBuf> },
}

impl LinkItem {
    pub fn dep(text: impl Into<String>, node: Option<PathBuf>) -> Self {
        Self::Dep {
            text: text.into(),
            node,
        }
    }

    /// The argument placed on the link line.
    pub fn text(&self) -> &str {
        match self {
            Self::Flag(text) | Self::Dep { text, .. } => text,
        }
    }

    pub fn node(&self) -> Option<&PathBuf> {
        match self {
            Self::Flag(_) => None,
            Self::Dep { node, .. } => node.as_ref(),
        }
    }
}

impl From<&str> for LinkItem {
    fn from(flag: &str) -> Self {
        Self::Flag(flag.to_owned())
    }
}

impl From<String> for LinkItem {
    fn from(flag: String) -> Self {
        Self::Flag(flag)
    }
}

/// C and C++ compilers plus the flags applied to everything they build.
///
/// Binaries take a snapshot with [`program`](Self::program) or
/// [`library`](Self::library); later edits to the configuration do not
/// affect binaries already created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerConfig {
    pub cc: Vendor,
    pub cxx: Vendor,
    /// Include paths for C and C++.
    pub includes: Vec<PathBuf>,
    /// Include paths for C++ only.
    pub cxx_includes: Vec<PathBuf>,
    pub cflags: Vec<String>,
    pub cxx_flags: Vec<String>,
    pub defines: Vec<String>,
    pub cxx_defines: Vec<String>,
    pub link_flags: Vec<LinkItem>,
    /// Objects and libraries linked after all link flags.
    pub post_link: Vec<LinkItem>,
    /// Files every compile step depends on without naming them.
    pub source_deps: Vec<PathBuf>,
}

impl CompilerConfig {
    pub fn new(cc: Vendor, cxx: Vendor) -> Self {
        Self {
            cc,
            cxx,
            includes: Vec::new(),
            cxx_includes: Vec::new(),
            cflags: Vec::new(),
            cxx_flags: Vec::new(),
            defines: Vec::new(),
            cxx_defines: Vec::new(),
            link_flags: Vec::new(),
            post_link: Vec::new(),
            source_deps: Vec::new(),
        }
    }

    pub fn vendor(&self, language: Language) -> &Vendor {
        match language {
            Language::C => &self.cc,
            Language::Cxx => &self.cxx,
        }
    }

    pub fn program(&self, name: impl Into<String>) -> BinaryBuilder {
        BinaryBuilder::new(self.clone(), BinaryKind::Program, name)
    }

    pub fn library(&self, name: impl Into<String>) -> BinaryBuilder {
        BinaryBuilder::new(self.clone(), BinaryKind::Library, name)
    }

    /// `link_flags` then `post_link`, as linker arguments.
    pub fn link_args(&self) -> Vec<String> {
        self.link_flags
            .iter()
            .chain(&self.post_link)
            .map(|item| item.text().to_owned())
            .collect()
    }

    /// Nodes the link step depends on through [`LinkItem::Dep`] entries.
    pub fn link_deps(&self) -> Vec<PathBuf> {
        self.link_flags
            .iter()
            .chain(&self.post_link)
            .filter_map(|item| item.node().cloned())
            .collect()
    }
}
