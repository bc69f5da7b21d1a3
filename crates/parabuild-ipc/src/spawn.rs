//! Launching workers on the child end of a channel.
//!
//! The process manager never forks or execs itself; it hands the child
//! endpoint to a [`Spawn`] implementation and gets back something that
//! implements [`WorkerProcess`]. [`CommandSpawner`] is the production
//! implementation: it starts a program with the endpoint wired to the
//! child's stdin and stdout.

use crate::channel::Channel;
use crate::error::WorkerId;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};

/// Environment variable carrying the worker id into the spawned process.
pub const WORKER_ID_ENV: &str = "PARABUILD_WORKER_ID";

/// Handle to a running worker.
pub trait WorkerProcess {
    /// Stable identity of the worker (its pid for real processes).
    fn pid(&self) -> u32;

    /// Block until the worker exits.
    fn wait(&mut self) -> io::Result<ExitStatus>;

    /// Non-blocking exit check.
    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>>;

    /// Ask the worker to stop (SIGTERM).
    fn terminate(&mut self) -> io::Result<()>;

    /// Force the worker to stop (SIGKILL).
    fn kill(&mut self) -> io::Result<()>;
}

/// Starts a worker attached to the given child endpoint.
pub trait Spawn {
    type Process: WorkerProcess;

    fn spawn(&mut self, id: WorkerId, endpoint: Channel) -> io::Result<Self::Process>;
}

impl WorkerProcess for Child {
    fn pid(&self) -> u32 {
        self.id()
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        Child::wait(self)
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        Child::try_wait(self)
    }

    fn terminate(&mut self) -> io::Result<()> {
        // Never signal a pid that has already been reaped.
        if Child::try_wait(self)?.is_some() {
            return Ok(());
        }
        match signal::kill(Pid::from_raw(self.id() as i32), Signal::SIGTERM) {
            // Already exited (possibly reaped).
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        match Child::kill(self) {
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }
}

/// Spawns a program with the channel endpoint as its stdin and stdout.
///
/// stderr is inherited so worker diagnostics reach the controller's
/// terminal. The worker id is exported as [`WORKER_ID_ENV`].
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    current_dir: Option<PathBuf>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
        }
    }

    /// Re-run the current executable as the worker.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }

    fn command(&self, id: WorkerId) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        cmd.env(WORKER_ID_ENV, id.0.to_string());
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl Spawn for CommandSpawner {
    type Process = Child;

    fn spawn(&mut self, id: WorkerId, endpoint: Channel) -> io::Result<Child> {
        let fd = endpoint.into_owned_fd();
        let out = fd.try_clone()?;

        let mut cmd = self.command(id);
        cmd.stdin(Stdio::from(fd))
            .stdout(Stdio::from(out))
            .stderr(Stdio::inherit());

        // `cmd` owns the parent's copies of the endpoint and closes them on
        // return, leaving the worker as the only holder.
        cmd.spawn()
    }
}
