//! # parabuild-toolchain
//!
//! C and C++ compiler support for parabuild.
//!
//! - [`vendor`]: the closed set of compiler vendors and their command-line
//!   dialects
//! - [`detect`]: finding a working compiler by compiling a probe program
//! - [`compiler`], [`command`], [`binary`]: turning a compiler configuration
//!   and a list of sources into compile and link argv vectors
//!
//! Nothing here runs a build; a [`BinaryPlan`] is plain data handed to a
//! scheduler.
//!
//! ```rust,no_run
//! use parabuild_toolchain::{BuildContext, CompilerConfig, Language, ProbeEnv, detect_compiler};
//!
//! # fn main() -> parabuild_toolchain::Result<()> {
//! let env = ProbeEnv::from_env();
//! let cc = detect_compiler(Language::C, &env)?;
//! let cxx = detect_compiler(Language::Cxx, &env)?;
//!
//! let mut program = CompilerConfig::new(cc, cxx).program("hello");
//! program.add_source("hello.cpp");
//! let plan = program.finish(&BuildContext::new("/tmp/build", "/tmp/src"))?;
//! println!("{}", plan.link_argv.join(" "));
//! # Ok(())
//! # }
//! ```

pub mod binary;
pub mod command;
pub mod compiler;
pub mod detect;
pub mod error;
pub mod paths;
pub mod vendor;

pub use binary::{BinaryBuilder, BinaryKind, BinaryPlan, BuildContext, ObjectFile};
pub use command::{CommandEnv, object_name_for};
pub use compiler::{CompilerConfig, LinkItem};
pub use detect::{ProbeEnv, candidates, detect_compiler, detect_compiler_for, parse_probe_output, verify_compiler};
pub use error::{Result, ToolchainError};
pub use vendor::{Behavior, Language, Platform, Vendor, VendorKind};
