//! Turning a program or library description into concrete commands.

use crate::command::{CommandEnv, object_name_for};
use crate::compiler::CompilerConfig;
use crate::error::{Result, ToolchainError};
use crate::paths::normalize_path;
use crate::vendor::{Behavior, Language, Platform, Vendor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryKind {
    Program,
    Library,
}

/// Where a binary's sources live and where its outputs go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    /// Absolute root of the build tree.
    pub build_path: PathBuf,
    /// Folder under `build_path` holding this context's binaries.
    pub build_folder: PathBuf,
    /// Directory relative source paths are resolved against.
    pub source_path: PathBuf,
    pub platform: Platform,
}

impl BuildContext {
    pub fn new(build_path: impl Into<PathBuf>, source_path: impl Into<PathBuf>) -> Self {
        Self {
            build_path: build_path.into(),
            build_folder: PathBuf::new(),
            source_path: source_path.into(),
            platform: Platform::current(),
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }
}

/// One compile step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectFile {
    pub source: PathBuf,
    /// Object file name, relative to the binary's output path.
    pub output: String,
    pub argv: Vec<String>,
}

/// Every command needed to produce one binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BinaryPlan {
    pub name: String,
    pub kind: BinaryKind,
    /// Output folder relative to the build root.
    pub output_folder: PathBuf,
    /// Absolute output folder; compile and link steps run here.
    pub output_path: PathBuf,
    pub objects: Vec<ObjectFile>,
    pub linker: Vendor,
    pub link_argv: Vec<String>,
    pub output_file: String,
    pub pdb_file: Option<String>,
    /// Files every compile step depends on.
    pub source_deps: Vec<PathBuf>,
    /// Files the link step depends on.
    pub link_deps: Vec<PathBuf>,
}

impl BinaryPlan {
    /// Path of the linked binary.
    pub fn output_file_path(&self) -> PathBuf {
        self.output_path.join(&self.output_file)
    }
}

/// Collects the sources of one program or library.
#[derive(Debug, Clone)]
pub struct BinaryBuilder {
    config: CompilerConfig,
    kind: BinaryKind,
    name: String,
    sources: Vec<String>,
    linker: Option<Vendor>,
}

impl BinaryBuilder {
    pub fn new(config: CompilerConfig, kind: BinaryKind, name: impl Into<String>) -> Self {
        Self {
            config,
            kind,
            name: name.into(),
            sources: Vec::new(),
            linker: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> BinaryKind {
        self.kind
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut CompilerConfig {
        &mut self.config
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn add_source(&mut self, source: impl Into<String>) -> &mut Self {
        self.sources.push(source.into());
        self
    }

    pub fn add_sources<I, S>(&mut self, sources: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources.extend(sources.into_iter().map(Into::into));
        self
    }

    /// Link with `linker` instead of picking the C or C++ compiler.
    pub fn set_linker(&mut self, linker: Vendor) -> &mut Self {
        self.linker = Some(linker);
        self
    }

    /// Folder, relative to the context's build folder, holding this binary.
    pub fn local_folder(&self) -> &str {
        &self.name
    }

    /// Produce the compile and link commands.
    ///
    /// `.c` sources are compiled as C, everything else as C++. Unless a
    /// linker was set, the C++ compiler links when any C++ source was used.
    pub fn finish(&self, cx: &BuildContext) -> Result<BinaryPlan> {
        let output_folder = cx.build_folder.join(self.local_folder());
        let output_path = cx.build_path.join(&output_folder);
        let c_env = CommandEnv::new(&output_path, &self.config, Language::C);
        let cxx_env = CommandEnv::new(&output_path, &self.config, Language::Cxx);

        let mut used_cxx = false;
        let mut seen: HashMap<String, PathBuf> = HashMap::new();
        let mut objects = Vec::with_capacity(self.sources.len());
        for item in &self.sources {
            let env = if language_of(item) == Language::C {
                &c_env
            } else {
                used_cxx = true;
                &cxx_env
            };

            let source = resolve_source(&cx.source_path, item);
            let output = format!("{}{}", object_name_for(item), env.vendor().object_suffix());
            if let Some(first) = seen.insert(output.clone(), source.clone()) {
                return Err(ToolchainError::DuplicateObject {
                    object: output,
                    first,
                    second: source,
                });
            }

            let argv = env.argv(&source.display().to_string(), &output);
            objects.push(ObjectFile {
                source,
                output,
                argv,
            });
        }

        let linker = match &self.linker {
            Some(linker) => linker.clone(),
            None if used_cxx => self.config.cxx.clone(),
            None => self.config.cc.clone(),
        };

        let mut argv = linker.command_argv();
        argv.extend(objects.iter().map(|obj| obj.output.clone()));
        let output_file = self.link_args(&linker, cx.platform, &mut argv);
        let pdb_file = linker.pdb_suffix().map(|suffix| format!("{}{suffix}", self.name));

        debug!(
            binary = %self.name,
            objects = objects.len(),
            linker = linker.name(),
            "Planned binary"
        );

        Ok(BinaryPlan {
            name: self.name.clone(),
            kind: self.kind,
            output_folder,
            output_path,
            objects,
            link_argv: argv,
            output_file,
            pdb_file,
            source_deps: self.config.source_deps.clone(),
            link_deps: self.config.link_deps(),
            linker,
        })
    }

    /// Append the link flags and output arguments; returns the output name.
    fn link_args(&self, linker: &Vendor, platform: Platform, argv: &mut Vec<String>) -> String {
        let suffix = match self.kind {
            BinaryKind::Program => platform.exe_suffix(),
            BinaryKind::Library => platform.shared_lib_suffix(),
        };
        let output = format!("{}{suffix}", self.name);

        if linker.is_msvc() {
            argv.push("/link".to_owned());
        }
        argv.extend(self.config.link_args());

        match linker.behavior() {
            Behavior::Msvc => {
                argv.push(format!("/OUT:{output}"));
                argv.push("/DEBUG".to_owned());
                argv.push("/nologo".to_owned());
                if self.kind == BinaryKind::Library {
                    argv.push("/DLL".to_owned());
                }
                argv.push(format!("/PDB:\"{}.pdb\"", self.name));
            }
            Behavior::Gcc => {
                if self.kind == BinaryKind::Library {
                    let shared = if platform == Platform::Mac {
                        "-dynamiclib"
                    } else {
                        "-shared"
                    };
                    argv.push(shared.to_owned());
                }
                argv.extend(["-o".to_owned(), output.clone()]);
            }
            Behavior::Sun => {
                if self.kind == BinaryKind::Library {
                    argv.push("-G".to_owned());
                }
                argv.extend(["-o".to_owned(), output.clone()]);
            }
        }
        output
    }
}

fn language_of(source: &str) -> Language {
    match Path::new(source).extension().and_then(|e| e.to_str()) {
        Some("c") => Language::C,
        _ => Language::Cxx,
    }
}

fn resolve_source(source_path: &Path, item: &str) -> PathBuf {
    let path = Path::new(item);
    if path.is_absolute() {
        normalize_path(path)
    } else {
        normalize_path(source_path.join(path))
    }
}
