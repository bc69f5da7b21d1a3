//! The record binding a worker's identity to its channel and listener.

use crate::channel::{Channel, ChannelId};
use crate::error::{ChannelError, IpcError, Result, WorkerId};
use crate::listener::Listener;
use crate::spawn::WorkerProcess;
use std::fmt;
use std::process::ExitStatus;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Lifecycle of a worker as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// Channel created, worker not launched yet. Only seen inside
    /// [`ProcessManager::create_process_and_pipe`](crate::ProcessManager::create_process_and_pipe);
    /// a [`ProcessHost`] is never handed out in this state.
    Spawning,
    /// Registered with the pump and running.
    Active,
    /// Channel dropped from the pump; waiting to be closed.
    Draining,
    /// Channel released and exit status collected.
    Closed,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Spawning => "spawning",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// A spawned worker: `{id, process handle, channel, listener}`.
///
/// Hosts are only created by
/// [`ProcessManager::create_process_and_pipe`](crate::ProcessManager::create_process_and_pipe)
/// and are consumed by
/// [`ProcessManager::close_process`](crate::ProcessManager::close_process),
/// so a host cannot be closed twice.
pub struct ProcessHost<P> {
    id: WorkerId,
    process: P,
    channel: Rc<Channel>,
    listener: Rc<dyn Listener>,
    spawned_at: Instant,
}

impl<P: WorkerProcess> ProcessHost<P> {
    pub(crate) fn new(
        id: WorkerId,
        process: P,
        channel: Rc<Channel>,
        listener: Rc<dyn Listener>,
    ) -> Self {
        Self {
            id,
            process,
            channel,
            listener,
            spawned_at: Instant::now(),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    /// The controller's endpoint of the worker channel.
    ///
    /// The shared handle stays with the host, so a drained channel cannot be
    /// registered with a pump again.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel.id()
    }

    pub fn listener(&self) -> &Rc<dyn Listener> {
        &self.listener
    }

    /// `Active` while the channel is registered, `Draining` once it has been
    /// dropped. Closing consumes the host, so `Closed` is only reported by
    /// [`ExitReport::state`].
    pub fn state(&self) -> WorkerState {
        if self.channel.is_registered() {
            WorkerState::Active
        } else {
            WorkerState::Draining
        }
    }

    pub fn uptime(&self) -> Duration {
        self.spawned_at.elapsed()
    }

    /// Send one message to the worker.
    pub fn send(&self, message: &[u8]) -> Result<()> {
        self.channel.send(message)
    }

    pub(crate) fn process_mut(&mut self) -> &mut P {
        &mut self.process
    }

    /// Release the channel and reap the worker.
    pub(crate) fn close(self, error: Option<ChannelError>) -> Result<ExitReport> {
        let ProcessHost {
            id,
            mut process,
            channel,
            spawned_at,
            ..
        } = self;
        let pid = process.pid();

        if let Err(e) = channel.close() {
            debug!(worker = %id, error = %e, "Channel shutdown failed");
        }
        drop(channel);

        let status = process
            .wait()
            .map_err(|source| IpcError::Wait { id, source })?;
        info!(worker = %id, pid, %status, error = ?error, "Worker closed");

        Ok(ExitReport {
            id,
            pid,
            status,
            error,
            lifetime: spawned_at.elapsed(),
        })
    }
}

impl<P: WorkerProcess> fmt::Debug for ProcessHost<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHost")
            .field("id", &self.id)
            .field("pid", &self.process.pid())
            .field("channel", &self.channel.id())
            .field("state", &self.state())
            .finish()
    }
}

/// What is left of a host after it was closed.
#[derive(Debug, Clone)]
pub struct ExitReport {
    pub id: WorkerId,
    pub pid: u32,
    pub status: ExitStatus,
    /// The channel error that led to the close, if any.
    pub error: Option<ChannelError>,
    pub lifetime: Duration,
}

impl ExitReport {
    pub fn state(&self) -> WorkerState {
        WorkerState::Closed
    }

    /// The worker exited with status zero and its channel either hung up
    /// cleanly or was dropped by the controller.
    pub fn success(&self) -> bool {
        self.status.success() && matches!(self.error, None | Some(ChannelError::Eof))
    }
}
