//! Task scheduling over a pool of worker processes.
//!
//! The [`Executor`] is the listener for every worker channel. A worker that
//! reports [`WorkResponse::Ready`] or finishes a task is handed the next
//! queued task, or told to exit once the queue is empty or dispatch has been
//! halted by a failure. A worker lost mid-task fails that task. Tasks are
//! never retried.

use crate::config::Settings;
use crate::error::{BuildError, Result};
use crate::protocol::{TaskId, WorkRequest, WorkResponse};
use anyhow::{Context, anyhow, bail};
use bytes::Bytes;
use parabuild_ipc::{
    Channel, ChannelError, ChannelId, DEFAULT_SHUTDOWN_GRACE, ExitReport, FrameCodec, Listener,
    LivenessPolicy, MessagePump, ProcessHost, ProcessManager, Spawn, WorkerId,
};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One command to run on some worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub argv: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Short name for progress output. Defaults to the command line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Task {
    pub fn new(id: TaskId, argv: Vec<String>) -> Self {
        Self {
            id,
            argv,
            cwd: None,
            env: BTreeMap::new(),
            label: None,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn display_name(&self) -> String {
        self.label.clone().unwrap_or_else(|| self.argv.join(" "))
    }

    fn request(&self) -> WorkRequest {
        WorkRequest::Run {
            task_id: self.id,
            argv: self.argv.clone(),
            cwd: self.cwd.clone(),
            env: self.env.clone(),
        }
    }
}

/// Read a JSON array of tasks.
pub fn load_tasks(path: &Path) -> Result<Vec<Task>> {
    let content = std::fs::read_to_string(path)?;
    let tasks: Vec<Task> = serde_json::from_str(&content)?;
    validate_tasks(&tasks)?;
    Ok(tasks)
}

/// Task ids must be unique within a run.
pub fn validate_tasks(tasks: &[Task]) -> Result<()> {
    let mut seen = HashSet::new();
    for task in tasks {
        if !seen.insert(task.id) {
            return Err(BuildError::tasks(format!("duplicate task id {}", task.id)));
        }
    }
    Ok(())
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded,
    /// The command exited non-zero.
    Failed { code: i32 },
    /// No exit status: the command could not be started or its worker was
    /// lost.
    Error { message: String },
    /// Never dispatched.
    Skipped,
}

impl TaskStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Error { .. })
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "ok"),
            Self::Failed { code } => write!(f, "exit code {}", code),
            Self::Error { message } => write!(f, "error: {}", message),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub label: String,
    #[serde(flatten)]
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    /// Worker that produced the outcome.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<u32>,
}

/// Outcomes of one run, in task submission order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub outcomes: Vec<TaskOutcome>,
}

impl BuildReport {
    /// True when every task ran and succeeded.
    pub fn success(&self) -> bool {
        self.outcomes.iter().all(|o| o.status.is_success())
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.status.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.status.is_failure()).count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == TaskStatus::Skipped)
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &TaskOutcome> {
        self.outcomes.iter().filter(|o| o.status.is_failure())
    }

    pub fn get(&self, task_id: TaskId) -> Option<&TaskOutcome> {
        self.outcomes.iter().find(|o| o.task_id == task_id)
    }

    /// Append the outcomes of a later phase.
    pub fn extend(&mut self, other: BuildReport) {
        self.outcomes.extend(other.outcomes);
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub jobs: usize,
    pub keep_going: bool,
    pub liveness: LivenessPolicy,
    pub codec: FrameCodec,
    pub shutdown_grace: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            jobs: 1,
            keep_going: false,
            liveness: LivenessPolicy::Disabled,
            codec: FrameCodec::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl ExecutorOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            jobs: settings.build.jobs,
            keep_going: settings.build.keep_going,
            liveness: settings.liveness(),
            codec: settings.frame_codec(),
            shutdown_grace: settings.shutdown_grace(),
        }
    }
}

#[derive(Debug)]
struct Assignment {
    worker: WorkerId,
    task: Option<TaskId>,
}

#[derive(Debug, Default)]
struct State {
    queue: VecDeque<Task>,
    order: Vec<(TaskId, String)>,
    workers: HashMap<ChannelId, Assignment>,
    outcomes: HashMap<TaskId, TaskOutcome>,
    halted: bool,
}

/// Listener that feeds queued tasks to workers and collects their outcomes.
#[derive(Debug)]
pub struct Executor {
    keep_going: bool,
    state: RefCell<State>,
}

impl Executor {
    pub fn new(tasks: Vec<Task>, keep_going: bool) -> Self {
        let order = tasks.iter().map(|t| (t.id, t.display_name())).collect();
        Self {
            keep_going,
            state: RefCell::new(State {
                queue: tasks.into(),
                order,
                ..State::default()
            }),
        }
    }

    /// Associate a freshly spawned worker with its channel.
    pub fn attach(&self, channel: ChannelId, worker: WorkerId) {
        self.state.borrow_mut().workers.insert(
            channel,
            Assignment {
                worker,
                task: None,
            },
        );
    }

    pub fn total(&self) -> usize {
        self.state.borrow().order.len()
    }

    /// Tasks not yet handed to any worker.
    pub fn queued(&self) -> usize {
        self.state.borrow().queue.len()
    }

    /// Tasks with a recorded outcome.
    pub fn finished(&self) -> usize {
        self.state.borrow().outcomes.len()
    }

    /// True once a failure has stopped dispatch.
    pub fn is_halted(&self) -> bool {
        self.state.borrow().halted
    }

    /// Outcomes in submission order. Tasks that never ran are reported as
    /// skipped.
    pub fn report(&self) -> BuildReport {
        let state = self.state.borrow();
        let outcomes = state
            .order
            .iter()
            .map(|(id, label)| {
                state.outcomes.get(id).cloned().unwrap_or_else(|| TaskOutcome {
                    task_id: *id,
                    label: label.clone(),
                    status: TaskStatus::Skipped,
                    stdout: String::new(),
                    stderr: String::new(),
                    worker: None,
                })
            })
            .collect();
        BuildReport { outcomes }
    }

    fn label_of(state: &State, task_id: TaskId) -> String {
        state
            .order
            .iter()
            .find(|(id, _)| *id == task_id)
            .map(|(_, label)| label.clone())
            .unwrap_or_else(|| format!("task {}", task_id))
    }

    fn record(
        &self,
        channel: ChannelId,
        task_id: TaskId,
        status: TaskStatus,
        stdout: String,
        stderr: String,
    ) -> anyhow::Result<()> {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;

        let assignment = state
            .workers
            .get_mut(&channel)
            .ok_or_else(|| anyhow!("response on unknown channel {}", channel))?;
        if assignment.task != Some(task_id) {
            bail!(
                "worker {} reported task {} but was assigned {:?}",
                assignment.worker,
                task_id,
                assignment.task
            );
        }
        assignment.task = None;
        let worker = assignment.worker;

        let label = Self::label_of(state, task_id);
        let done = state.outcomes.len() + 1;
        let total = state.order.len();
        if status.is_success() {
            info!("[{}/{}] {}", done, total, label);
        } else {
            warn!(worker = %worker, task = task_id, "[{}/{}] {} failed: {}", done, total, label, status);
            if !self.keep_going && !state.halted {
                warn!("Stopping dispatch after first failure");
                state.halted = true;
            }
        }

        state.outcomes.insert(
            task_id,
            TaskOutcome {
                task_id,
                label,
                status,
                stdout,
                stderr,
                worker: Some(worker.0),
            },
        );
        Ok(())
    }

    /// Hand the next task to the worker on `channel`, or release it.
    fn dispatch(&self, channel: &Channel) -> anyhow::Result<()> {
        let request = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            let assignment = state
                .workers
                .get_mut(&channel.id())
                .ok_or_else(|| anyhow!("dispatch on unknown channel {}", channel.id()))?;

            let next = if state.halted {
                None
            } else {
                state.queue.pop_front()
            };
            match next {
                Some(task) => {
                    debug!(worker = %assignment.worker, task = task.id, "Dispatching task");
                    assignment.task = Some(task.id);
                    task.request()
                }
                None => {
                    debug!(worker = %assignment.worker, "No work left, releasing worker");
                    WorkRequest::Exit
                }
            }
        };

        channel.send(&request.to_bytes()?)?;
        Ok(())
    }
}

impl Listener for Executor {
    fn receive_message(&self, channel: &Channel, message: Bytes) -> anyhow::Result<()> {
        let response = WorkResponse::from_bytes(&message).context("malformed worker response")?;
        match response {
            WorkResponse::Ready => {
                let state = self.state.borrow();
                let assignment = state
                    .workers
                    .get(&channel.id())
                    .ok_or_else(|| anyhow!("ready on unknown channel {}", channel.id()))?;
                if let Some(task) = assignment.task {
                    bail!(
                        "worker {} announced itself while running task {}",
                        assignment.worker,
                        task
                    );
                }
                debug!(worker = %assignment.worker, "Worker ready");
            }
            WorkResponse::Completed {
                task_id,
                status,
                stdout,
                stderr,
            } => {
                let status = if status == 0 {
                    TaskStatus::Succeeded
                } else {
                    TaskStatus::Failed { code: status }
                };
                self.record(channel.id(), task_id, status, stdout, stderr)?;
            }
            WorkResponse::Failed { task_id, message } => {
                self.record(
                    channel.id(),
                    task_id,
                    TaskStatus::Error { message },
                    String::new(),
                    String::new(),
                )?;
            }
        }

        self.dispatch(channel)
    }

    fn receive_error(&self, channel: &Channel, error: ChannelError) {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        let Some(assignment) = state.workers.remove(&channel.id()) else {
            return;
        };

        match assignment.task {
            Some(task_id) => {
                warn!(
                    worker = %assignment.worker,
                    task = task_id,
                    error = %error,
                    "Worker lost while running a task"
                );
                let label = Self::label_of(state, task_id);
                state.outcomes.insert(
                    task_id,
                    TaskOutcome {
                        task_id,
                        label,
                        status: TaskStatus::Error {
                            message: format!("worker exited ({})", error),
                        },
                        stdout: String::new(),
                        stderr: String::new(),
                        worker: Some(assignment.worker.0),
                    },
                );
                if !self.keep_going {
                    state.halted = true;
                }
            }
            None if error == ChannelError::Eof => {
                debug!(worker = %assignment.worker, "Worker channel closed");
            }
            None => {
                warn!(worker = %assignment.worker, error = %error, "Idle worker dropped");
            }
        }
    }
}

/// Run `tasks` on up to `options.jobs` workers launched by `spawner`.
///
/// Returns once every worker has been released or lost. Fails only when no
/// worker could be started or the pump itself fails; task failures are
/// reported in the [`BuildReport`].
pub fn run_tasks<S: Spawn>(
    tasks: Vec<Task>,
    options: &ExecutorOptions,
    spawner: S,
) -> Result<BuildReport> {
    validate_tasks(&tasks)?;
    if tasks.is_empty() {
        debug!("No tasks to run");
        return Ok(BuildReport::default());
    }

    let jobs = options.jobs.clamp(1, tasks.len());
    let executor = Rc::new(Executor::new(tasks, options.keep_going));
    let listener: Rc<dyn Listener> = executor.clone();

    let pump = MessagePump::with_liveness(options.liveness)?;
    let mut manager = ProcessManager::new(pump, spawner)
        .with_codec(options.codec)
        .with_shutdown_grace(options.shutdown_grace);

    let mut hosts = HashMap::new();
    let mut last_error = None;
    for n in 1..=jobs {
        let id = WorkerId(n as u32);
        match manager.create_process_and_pipe(id, Rc::clone(&listener)) {
            Ok(host) => {
                executor.attach(host.channel_id(), id);
                hosts.insert(host.channel_id(), host);
            }
            Err(e) => last_error = Some(e),
        }
    }
    if hosts.is_empty() {
        if let Some(e) = last_error {
            return Err(e.into());
        }
    }

    info!(workers = hosts.len(), tasks = executor.total(), "Running tasks");
    let driven = drive(&mut manager, &mut hosts);

    for host in hosts.into_values() {
        log_exit(manager.shutdown_process(host));
    }
    driven?;

    if executor.queued() > 0 && !executor.is_halted() {
        warn!(
            skipped = executor.queued(),
            "All workers exited before the queue drained"
        );
    }
    Ok(executor.report())
}

fn drive<S: Spawn>(
    manager: &mut ProcessManager<S>,
    hosts: &mut HashMap<ChannelId, ProcessHost<S::Process>>,
) -> Result<()> {
    while manager.pump().should_process_events() {
        manager.pump_mut().process_events()?;
        for exit in manager.reap_dropped(|channel| hosts.remove(&channel)) {
            log_exit(exit);
        }
    }
    Ok(())
}

fn log_exit(exit: parabuild_ipc::Result<ExitReport>) {
    match exit {
        Ok(report) if report.success() => {
            debug!(worker = %report.id, lifetime = ?report.lifetime, "Worker exited");
        }
        Ok(report) => warn!(
            worker = %report.id,
            status = %report.status,
            error = ?report.error,
            "Worker exited abnormally"
        ),
        Err(e) => warn!(error = %e, "Failed to reap worker"),
    }
}
