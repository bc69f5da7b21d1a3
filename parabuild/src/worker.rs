//! Worker side of the runner.
//!
//! A worker announces itself with [`WorkResponse::Ready`], then runs one
//! command per [`WorkRequest::Run`] and answers with the outcome. It stops on
//! [`WorkRequest::Exit`] or when the runner closes the channel.
//!
//! In a worker process the channel is stdin/stdout, so nothing else may
//! write to stdout; logs go to stderr.

use crate::error::{BuildError, Result};
use crate::protocol::{TaskId, WorkRequest, WorkResponse};
use parabuild_ipc::{Channel, FrameCodec};
use std::collections::BTreeMap;
use std::os::fd::AsFd;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use tracing::{debug, info};

/// Serve requests on `channel` until told to stop.
pub fn serve(channel: &Channel) -> Result<()> {
    channel.send(&WorkResponse::Ready.to_bytes()?)?;

    while let Some(message) = channel.recv_blocking()? {
        match WorkRequest::from_bytes(&message)? {
            WorkRequest::Run {
                task_id,
                argv,
                cwd,
                env,
            } => {
                let response = run_command(task_id, &argv, cwd.as_deref(), &env);
                channel.send(&response.to_bytes()?)?;
            }
            WorkRequest::Exit => {
                debug!("Exit requested");
                return Ok(());
            }
        }
    }

    debug!("Runner closed the channel");
    Ok(())
}

/// Entry point of a worker process: serve on the channel inherited as stdin.
pub fn run_worker_main(codec: FrameCodec) -> Result<()> {
    let fd = std::io::stdin().as_fd().try_clone_to_owned()?;
    let channel = Channel::from_owned_fd(fd, codec);
    info!(pid = std::process::id(), "Worker started");
    serve(&channel).map_err(|e| match e {
        BuildError::Ipc(e) if e.is_disconnect() => {
            BuildError::protocol("runner went away mid-conversation")
        }
        other => other,
    })
}

/// Run one command with captured output.
pub fn run_command(
    task_id: TaskId,
    argv: &[String],
    cwd: Option<&Path>,
    env: &BTreeMap<String, String>,
) -> WorkResponse {
    let Some((program, args)) = argv.split_first() else {
        return WorkResponse::failed(task_id, "empty command");
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    debug!(task_id, ?argv, "Running task");
    match cmd.output() {
        Ok(output) => WorkResponse::Completed {
            task_id,
            status: exit_code(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        },
        Err(e) => WorkResponse::failed(task_id, format!("failed to start {}: {}", program, e)),
    }
}

/// Exit code, or `128 + signal` for a command killed by a signal.
fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}
