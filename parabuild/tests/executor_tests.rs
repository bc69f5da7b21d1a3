//! End-to-end runs of the task executor.
//!
//! Most tests run workers on threads serving the real protocol over a real
//! socket pair; the rest launch the `parabuild` binary itself as the worker.

use parabuild::error::BuildError;
use parabuild::executor::{ExecutorOptions, Task, TaskStatus, run_tasks};
use parabuild::protocol::WorkResponse;
use parabuild::worker;
use parabuild_ipc::{Channel, CommandSpawner, IpcError, LivenessPolicy, Spawn, WorkerId, WorkerProcess};
use std::collections::HashSet;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct ThreadWorker {
    id: u32,
    handle: Option<JoinHandle<i32>>,
    status: Option<ExitStatus>,
}

impl WorkerProcess for ThreadWorker {
    fn pid(&self) -> u32 {
        self.id
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let code = match self.handle.take() {
            Some(handle) => handle.join().unwrap_or(101),
            None => 0,
        };
        let status = ExitStatus::from_raw(code << 8);
        self.status = Some(status);
        Ok(status)
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        match &self.handle {
            Some(handle) if !handle.is_finished() => Ok(None),
            _ => self.wait().map(Some),
        }
    }

    fn terminate(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Runs `body` on a thread per worker.
struct ThreadSpawner {
    body: fn(Channel) -> i32,
}

impl Spawn for ThreadSpawner {
    type Process = ThreadWorker;

    fn spawn(&mut self, id: WorkerId, endpoint: Channel) -> io::Result<ThreadWorker> {
        let body = self.body;
        Ok(ThreadWorker {
            id: id.0,
            handle: Some(thread::spawn(move || body(endpoint))),
            status: None,
        })
    }
}

struct FailingSpawner;

impl Spawn for FailingSpawner {
    type Process = ThreadWorker;

    fn spawn(&mut self, _id: WorkerId, _endpoint: Channel) -> io::Result<ThreadWorker> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "not allowed"))
    }
}

fn serving(channel: Channel) -> i32 {
    match worker::serve(&channel) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

/// Announces itself, takes one task and dies without answering.
fn crash_on_first_task(channel: Channel) -> i32 {
    channel
        .send(&WorkResponse::Ready.to_bytes().unwrap())
        .unwrap();
    let _ = channel.recv_blocking();
    1
}

fn shell(id: u64, script: &str) -> Task {
    Task::new(id, vec!["sh".to_string(), "-c".to_string(), script.to_string()])
}

fn options(jobs: usize, keep_going: bool) -> ExecutorOptions {
    ExecutorOptions {
        jobs,
        keep_going,
        shutdown_grace: Duration::from_millis(500),
        ..ExecutorOptions::default()
    }
}

#[test]
fn test_all_tasks_succeed_across_workers() {
    let tasks: Vec<Task> = (1..=6).map(|n| shell(n, &format!("echo {n}"))).collect();
    let report = run_tasks(tasks, &options(3, false), ThreadSpawner { body: serving }).unwrap();

    assert!(report.success());
    assert_eq!(report.succeeded(), 6);
    let ids: Vec<u64> = report.outcomes.iter().map(|o| o.task_id).collect();
    assert_eq!(ids, [1, 2, 3, 4, 5, 6]);
    for outcome in &report.outcomes {
        assert_eq!(outcome.stdout, format!("{}\n", outcome.task_id));
    }

    let workers: HashSet<u32> = report.outcomes.iter().filter_map(|o| o.worker).collect();
    assert!(!workers.is_empty() && workers.len() <= 3);
}

#[test]
fn test_first_failure_stops_dispatch() {
    let tasks = vec![shell(1, "true"), shell(2, "exit 4"), shell(3, "true")];
    let report = run_tasks(tasks, &options(1, false), ThreadSpawner { body: serving }).unwrap();

    let statuses: Vec<&TaskStatus> = report.outcomes.iter().map(|o| &o.status).collect();
    assert_eq!(
        statuses,
        [
            &TaskStatus::Succeeded,
            &TaskStatus::Failed { code: 4 },
            &TaskStatus::Skipped
        ]
    );
    assert!(!report.success());
    assert_eq!(report.skipped(), 1);
}

#[test]
fn test_keep_going_runs_everything() {
    let tasks = vec![shell(1, "echo oops >&2; exit 1"), shell(2, "true")];
    let report = run_tasks(tasks, &options(1, true), ThreadSpawner { body: serving }).unwrap();

    assert_eq!(report.failed(), 1);
    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.get(1).unwrap().stderr, "oops\n");
}

#[test]
fn test_unstartable_command_is_an_error_outcome() {
    let tasks = vec![Task::new(1, vec!["/nonexistent/compiler".to_string()])];
    let report = run_tasks(tasks, &options(1, false), ThreadSpawner { body: serving }).unwrap();
    assert!(matches!(report.outcomes[0].status, TaskStatus::Error { .. }));
}

#[test]
fn test_lost_worker_fails_task_without_retry() {
    let tasks = vec![shell(1, "true"), shell(2, "true")];
    let report = run_tasks(
        tasks,
        &options(1, true),
        ThreadSpawner {
            body: crash_on_first_task,
        },
    )
    .unwrap();

    match &report.get(1).unwrap().status {
        TaskStatus::Error { message } => assert!(message.contains("worker exited"), "{message}"),
        other => panic!("unexpected status {other:?}"),
    }
    // The only worker is gone, so nothing else ran.
    assert_eq!(report.get(2).unwrap().status, TaskStatus::Skipped);
}

#[test]
fn test_no_tasks_spawns_nothing() {
    let report = run_tasks(Vec::new(), &options(4, false), FailingSpawner).unwrap();
    assert!(report.outcomes.is_empty());
    assert!(report.success());
}

#[test]
fn test_spawn_failure_is_reported() {
    let err = run_tasks(vec![shell(1, "true")], &options(2, false), FailingSpawner).unwrap_err();
    assert!(matches!(err, BuildError::Ipc(IpcError::Spawn { .. })));
}

#[test]
fn test_duplicate_ids_rejected_before_spawning() {
    let err = run_tasks(
        vec![shell(1, "true"), shell(1, "true")],
        &options(1, false),
        FailingSpawner,
    )
    .unwrap_err();
    assert!(matches!(err, BuildError::Tasks(_)));
}

#[test]
fn test_binary_as_worker_process() {
    let spawner = CommandSpawner::new(env!("CARGO_BIN_EXE_parabuild")).arg("internal-worker");
    let tasks: Vec<Task> = (1..=4).map(|n| shell(n, &format!("echo task-{n}"))).collect();

    let report = run_tasks(tasks, &options(2, false), spawner).unwrap();
    assert!(report.success(), "{report:?}");
    assert_eq!(report.get(3).unwrap().stdout, "task-3\n");
}

#[test]
fn test_silent_worker_dropped_by_liveness_timeout() {
    // Never sends Ready; only the timeout can end the run.
    let spawner = CommandSpawner::new("sh").arg("-c").arg("sleep 30");
    let options = ExecutorOptions {
        liveness: LivenessPolicy::Timeout(Duration::from_millis(200)),
        shutdown_grace: Duration::from_millis(50),
        ..options(1, false)
    };

    let report = run_tasks(vec![shell(1, "true")], &options, spawner).unwrap();
    assert_eq!(report.outcomes[0].status, TaskStatus::Skipped);
}
