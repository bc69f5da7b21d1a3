//! Build manifests and the task plan derived from them.
//!
//! A manifest is a TOML file with an optional `[compiler]` table and one
//! `[[binary]]` table per program or library:
//!
//! ```toml
//! [compiler]
//! cflags = ["-O2"]
//! includes = ["include"]
//!
//! [[binary]]
//! name = "core"
//! kind = "library"
//! sources = ["core/buffer.c"]
//!
//! [[binary]]
//! name = "app"
//! sources = ["main.cpp"]
//! link = ["core"]
//! ```
//!
//! Relative paths resolve against the manifest's directory. A binary may
//! only link against libraries declared before it, so planning never needs a
//! cycle check.

use crate::error::{BuildError, Result};
use crate::executor::Task;
use crate::protocol::TaskId;
use parabuild_toolchain::{
    BinaryKind, BinaryPlan, BuildContext, CompilerConfig, LinkItem, ProbeEnv, Vendor,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompilerSection {
    /// C compiler command; detected when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cc: Option<String>,
    /// C++ compiler command; detected when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cxx: Option<String>,
    pub includes: Vec<PathBuf>,
    pub cxx_includes: Vec<PathBuf>,
    pub cflags: Vec<String>,
    pub cxx_flags: Vec<String>,
    pub defines: Vec<String>,
    pub cxx_defines: Vec<String>,
    pub link_flags: Vec<String>,
    pub post_link: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BinarySpec {
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: BinaryKind,
    pub sources: Vec<String>,
    /// Libraries, by name, this binary links against.
    #[serde(default)]
    pub link: Vec<String>,
    #[serde(default)]
    pub defines: Vec<String>,
    #[serde(default)]
    pub includes: Vec<PathBuf>,
}

fn default_kind() -> BinaryKind {
    BinaryKind::Program
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    /// Directory sources are resolved against. Defaults to the manifest's
    /// directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_dir: Option<PathBuf>,
    /// Build output directory. Defaults to the runner's `build_dir`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_dir: Option<PathBuf>,
    #[serde(default)]
    pub compiler: CompilerSection,
    #[serde(default, rename = "binary")]
    pub binaries: Vec<BinarySpec>,
    /// Directory holding the manifest file.
    #[serde(skip)]
    pub root: PathBuf,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading manifest from: {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|e| {
            BuildError::manifest(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut manifest = Self::from_toml(&content)?;

        let parent = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        manifest.root = std::fs::canonicalize(parent)?;
        Ok(manifest)
    }

    /// Parse and validate manifest text. The root stays empty, so relative
    /// paths resolve against the working directory.
    pub fn from_toml(content: &str) -> Result<Self> {
        let manifest: Self = toml::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        if self.binaries.is_empty() {
            return Err(BuildError::manifest("no [[binary]] entries"));
        }

        let mut kinds: HashMap<&str, BinaryKind> = HashMap::new();
        for binary in &self.binaries {
            let name = binary.name.as_str();
            if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
                return Err(BuildError::manifest(format!(
                    "invalid binary name '{}'",
                    name
                )));
            }
            if kinds.contains_key(name) {
                return Err(BuildError::manifest(format!(
                    "binary '{}' is declared twice",
                    name
                )));
            }
            if binary.sources.is_empty() {
                return Err(BuildError::manifest(format!(
                    "binary '{}' has no sources",
                    name
                )));
            }

            let mut linked = HashSet::new();
            for dep in &binary.link {
                match kinds.get(dep.as_str()) {
                    Some(BinaryKind::Library) => {}
                    Some(BinaryKind::Program) => {
                        return Err(BuildError::manifest(format!(
                            "binary '{}' links against program '{}'",
                            name, dep
                        )));
                    }
                    None => {
                        return Err(BuildError::manifest(format!(
                            "binary '{}' links against '{}', which is not declared before it",
                            name, dep
                        )));
                    }
                }
                if !linked.insert(dep.as_str()) {
                    return Err(BuildError::manifest(format!(
                        "binary '{}' links against '{}' twice",
                        name, dep
                    )));
                }
            }

            kinds.insert(name, binary.kind);
        }
        Ok(())
    }

    /// `path` resolved against the manifest's directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }

    pub fn source_path(&self) -> PathBuf {
        match &self.source_dir {
            Some(dir) => self.resolve(dir),
            None => self.root.clone(),
        }
    }

    /// Build directory, falling back to `default` when the manifest names
    /// none.
    pub fn build_path(&self, default: &Path) -> PathBuf {
        self.resolve(self.build_dir.as_deref().unwrap_or(default))
    }

    /// Compiler commands from the manifest take precedence over `CC` and
    /// `CXX`.
    pub fn probe_env(&self, mut env: ProbeEnv) -> ProbeEnv {
        if let Some(cc) = &self.compiler.cc {
            env.cc = Some(cc.clone());
        }
        if let Some(cxx) = &self.compiler.cxx {
            env.cxx = Some(cxx.clone());
        }
        env
    }

    /// The shared compiler configuration, with `env` flags ahead of the
    /// manifest's own.
    pub fn compiler_config(&self, cc: Vendor, cxx: Vendor, env: &ProbeEnv) -> CompilerConfig {
        let section = &self.compiler;
        let mut config = CompilerConfig::new(cc, cxx);
        config.cflags = env.cflags.iter().chain(&section.cflags).cloned().collect();
        config.cxx_flags = env
            .cxxflags
            .iter()
            .chain(&section.cxx_flags)
            .cloned()
            .collect();
        config.includes = section.includes.iter().map(|p| self.resolve(p)).collect();
        config.cxx_includes = section
            .cxx_includes
            .iter()
            .map(|p| self.resolve(p))
            .collect();
        config.defines = section.defines.clone();
        config.cxx_defines = section.cxx_defines.clone();
        config.link_flags = section.link_flags.iter().cloned().map(LinkItem::from).collect();
        config.post_link = section.post_link.iter().cloned().map(LinkItem::from).collect();
        config
    }
}

/// Every binary's compile and link commands, in manifest order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildPlan {
    pub binaries: Vec<BinaryPlan>,
    /// Link wave of each binary: libraries it links against are in earlier
    /// waves.
    pub waves: Vec<usize>,
}

/// Plan every binary of `manifest` under `config`.
pub fn plan(manifest: &Manifest, config: &CompilerConfig, cx: &BuildContext) -> Result<BuildPlan> {
    let mut outputs: HashMap<&str, (PathBuf, usize)> = HashMap::new();
    let mut binaries = Vec::with_capacity(manifest.binaries.len());
    let mut waves = Vec::with_capacity(manifest.binaries.len());

    for spec in &manifest.binaries {
        let mut builder = match spec.kind {
            BinaryKind::Program => config.program(&spec.name),
            BinaryKind::Library => config.library(&spec.name),
        };

        let mut wave = 0;
        let binary_config = builder.config_mut();
        binary_config.defines.extend(spec.defines.iter().cloned());
        binary_config
            .includes
            .extend(spec.includes.iter().map(|p| manifest.resolve(p)));
        for dep in &spec.link {
            let (output, dep_wave) = outputs.get(dep.as_str()).ok_or_else(|| {
                BuildError::manifest(format!("'{}' links against unknown '{}'", spec.name, dep))
            })?;
            wave = wave.max(dep_wave + 1);
            binary_config
                .post_link
                .push(LinkItem::dep(output.display().to_string(), Some(output.clone())));
        }
        builder.add_sources(spec.sources.iter().cloned());

        let binary = builder.finish(cx)?;
        outputs.insert(spec.name.as_str(), (binary.output_file_path(), wave));
        binaries.push(binary);
        waves.push(wave);
    }

    Ok(BuildPlan { binaries, waves })
}

impl BuildPlan {
    /// Output folders that must exist before anything runs.
    pub fn output_dirs(&self) -> Vec<&Path> {
        self.binaries.iter().map(|b| b.output_path.as_path()).collect()
    }

    pub fn create_output_dirs(&self) -> Result<()> {
        for dir in self.output_dirs() {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn object_count(&self) -> usize {
        self.binaries.iter().map(|b| b.objects.len()).sum()
    }

    /// One task per object file, numbered from `first_id`. Each runs in its
    /// binary's output folder.
    pub fn compile_tasks(&self, first_id: TaskId) -> Vec<Task> {
        let mut id = first_id;
        let mut tasks = Vec::with_capacity(self.object_count());
        for binary in &self.binaries {
            for object in &binary.objects {
                tasks.push(
                    Task::new(id, object.argv.clone())
                        .with_cwd(&binary.output_path)
                        .with_label(format!(
                            "{} -> {}/{}",
                            object.source.display(),
                            binary.name,
                            object.output
                        )),
                );
                id += 1;
            }
        }
        tasks
    }

    /// Link tasks grouped by wave, numbered from `first_id`. Every task of
    /// a wave may run in parallel once earlier waves succeeded.
    pub fn link_waves(&self, first_id: TaskId) -> Vec<Vec<Task>> {
        let depth = self.waves.iter().max().map_or(0, |w| w + 1);
        let mut waves: Vec<Vec<Task>> = vec![Vec::new(); depth];
        let mut id = first_id;
        for (binary, wave) in self.binaries.iter().zip(&self.waves) {
            waves[*wave].push(
                Task::new(id, binary.link_argv.clone())
                    .with_cwd(&binary.output_path)
                    .with_label(format!("link {}", binary.output_file_path().display())),
            );
            id += 1;
        }
        waves
    }
}
