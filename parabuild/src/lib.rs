//! parabuild - parallel C/C++ build runner
//!
//! A single controller process drives a pool of worker processes over
//! framed socket channels. The controller never blocks on one worker: every
//! channel is registered with one epoll message pump, and a listener turns
//! worker responses into the next piece of work.
//!
//! # Architecture
//!
//! - `config` - runner settings (`parabuild.toml` plus environment)
//! - `protocol` - JSON requests and responses carried in channel frames
//! - `worker` - the worker side: run one command per request
//! - `executor` - the controller side: queue, dispatch and collect outcomes
//! - `manifest` - TOML build manifests and the compile/link plan
//! - `commands` - CLI command handlers

pub mod commands;
pub mod config;
pub mod error;
pub mod executor;
pub mod manifest;
pub mod protocol;
pub mod worker;

pub use config::Settings;
pub use error::{BuildError, Result};
pub use executor::{
    BuildReport, Executor, ExecutorOptions, Task, TaskOutcome, TaskStatus, run_tasks,
};
pub use manifest::{BuildPlan, Manifest};
pub use protocol::{TaskId, WorkRequest, WorkResponse};
