//! Spawning and reaping workers.

use crate::channel::{Channel, ChannelId};
use crate::codec::FrameCodec;
use crate::error::{ChannelError, IpcError, Result, WorkerId};
use crate::host::{ExitReport, ProcessHost};
use crate::listener::Listener;
use crate::pump::MessagePump;
use crate::spawn::{Spawn, WorkerProcess};
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default time a worker gets to exit on its own during shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Time between exit checks while waiting out a grace period.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Time a worker gets to honor SIGTERM before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

/// Creates workers, wires each one to the pump, and tears them down.
pub struct ProcessManager<S: Spawn> {
    pump: MessagePump,
    spawner: S,
    codec: FrameCodec,
    shutdown_grace: Duration,
}

impl<S: Spawn> ProcessManager<S> {
    pub fn new(pump: MessagePump, spawner: S) -> Self {
        Self {
            pump,
            spawner,
            codec: FrameCodec::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Frame codec used for every channel created from now on.
    pub fn with_codec(mut self, codec: FrameCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn pump(&self) -> &MessagePump {
        &self.pump
    }

    pub fn pump_mut(&mut self) -> &mut MessagePump {
        &mut self.pump
    }

    pub fn spawner(&self) -> &S {
        &self.spawner
    }

    /// Create a channel pair, register the parent end with the pump under
    /// `listener`, and launch a worker on the child end.
    ///
    /// If the worker cannot be launched the registration is rolled back and
    /// the pump is left exactly as it was.
    pub fn create_process_and_pipe(
        &mut self,
        id: WorkerId,
        listener: Rc<dyn Listener>,
    ) -> Result<ProcessHost<S::Process>> {
        let (parent, child) = Channel::pair_with_codec(self.codec)?;
        let parent = Rc::new(parent);
        debug!(worker = %id, channel = %parent.id(), "Spawning worker");

        self.pump.add_channel(Rc::clone(&parent), Rc::clone(&listener))?;

        let process = match self.spawner.spawn(id, child) {
            Ok(process) => process,
            Err(source) => {
                if let Err(e) = self.pump.drop_channel(&parent) {
                    warn!(worker = %id, error = %e, "Failed to roll back channel registration");
                }
                warn!(worker = %id, error = %source, "Failed to spawn worker");
                return Err(IpcError::Spawn { id, source });
            }
        };

        info!(worker = %id, pid = process.pid(), channel = %parent.id(), "Worker spawned");
        Ok(ProcessHost::new(id, process, parent, listener))
    }

    /// Release a host whose channel is no longer registered and collect the
    /// worker's exit status.
    ///
    /// `error` is the reason the channel went away, or `None` when the
    /// controller dropped it deliberately.
    ///
    /// # Panics
    ///
    /// Panics if the host's channel is still registered with the pump.
    /// Drop it with [`MessagePump::drop_channel`] first.
    pub fn close_process(
        &mut self,
        host: ProcessHost<S::Process>,
        error: Option<ChannelError>,
    ) -> Result<ExitReport> {
        assert!(
            !self.pump.is_registered(host.channel()),
            "worker {} closed while its channel is still registered",
            host.id()
        );
        host.close(error)
    }

    /// Stop a worker that may still be running.
    ///
    /// The channel is dropped if it is still registered and its write side
    /// is shut down so a cooperative worker sees end of stream and exits. A
    /// worker still alive after the grace period gets SIGTERM, then SIGKILL.
    pub fn shutdown_process(&mut self, host: ProcessHost<S::Process>) -> Result<ExitReport> {
        self.stop_process(host, None)
    }

    fn stop_process(
        &mut self,
        mut host: ProcessHost<S::Process>,
        error: Option<ChannelError>,
    ) -> Result<ExitReport> {
        if self.pump.is_registered(host.channel()) {
            self.pump.drop_channel(host.channel())?;
        }
        if let Err(e) = host.channel().shutdown_write() {
            debug!(worker = %host.id(), error = %e, "Channel already shut down");
        }

        let id = host.id();
        let wait_err = |source| IpcError::Wait { id, source };
        let process = host.process_mut();
        if !exited_within(process, self.shutdown_grace).map_err(wait_err)? {
            warn!(
                worker = %id,
                grace = ?self.shutdown_grace,
                "Worker ignored end of stream, terminating"
            );
            process.terminate().map_err(wait_err)?;

            if !exited_within(process, TERMINATE_GRACE).map_err(wait_err)? {
                warn!(worker = %id, "Worker ignored SIGTERM, killing");
                process.kill().map_err(wait_err)?;
            }
        }

        self.close_process(host, error)
    }

    /// Stop every host whose channel the pump dropped since the last call,
    /// the same way [`shutdown_process`](Self::shutdown_process) does, and
    /// record why its channel went away.
    ///
    /// `take_host` maps a dropped channel to the host that owns it; channels
    /// it does not know are skipped. Reports come back in drop order.
    pub fn reap_dropped<F>(&mut self, mut take_host: F) -> Vec<Result<ExitReport>>
    where
        F: FnMut(ChannelId) -> Option<ProcessHost<S::Process>>,
    {
        self.pump
            .take_dropped()
            .into_iter()
            .filter_map(|dropped| {
                let host = take_host(dropped.channel)?;
                Some(self.stop_process(host, Some(dropped.error)))
            })
            .collect()
    }
}

impl<S: Spawn> std::fmt::Debug for ProcessManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessManager")
            .field("pump", &self.pump)
            .field("codec", &self.codec)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish()
    }
}

fn exited_within<P: WorkerProcess>(process: &mut P, grace: Duration) -> std::io::Result<bool> {
    let deadline = Instant::now() + grace;
    loop {
        if process.try_wait()?.is_some() {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        thread::sleep(POLL_INTERVAL);
    }
}
