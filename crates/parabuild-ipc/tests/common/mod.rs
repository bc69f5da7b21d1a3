//! Shared helpers for the IPC integration tests.
//!
//! `RecordingListener` captures every callback in order. `ThreadSpawner`
//! runs a worker body on a thread instead of a process, which keeps the
//! tests hermetic while still exercising the real socket pair and pump.

#![allow(dead_code)]

use bytes::Bytes;
use parabuild_ipc::{Channel, ChannelError, ChannelId, MessagePump, Spawn, WorkerId, WorkerProcess};
use std::cell::RefCell;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// One listener callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Message(ChannelId, Bytes),
    Error(ChannelId, ChannelError),
}

/// Listener that records callbacks and optionally fails on chosen payloads.
#[derive(Default)]
pub struct RecordingListener {
    events: RefCell<Vec<Event>>,
    fail_on: Option<Bytes>,
    panic_on: Option<Bytes>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return an error from `receive_message` when handed `payload`.
    pub fn failing_on(payload: &'static [u8]) -> Self {
        Self {
            fail_on: Some(Bytes::from_static(payload)),
            ..Self::default()
        }
    }

    /// Panic in `receive_message` when handed `payload`.
    pub fn panicking_on(payload: &'static [u8]) -> Self {
        Self {
            panic_on: Some(Bytes::from_static(payload)),
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    pub fn messages(&self, channel: ChannelId) -> Vec<Bytes> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                Event::Message(id, message) if *id == channel => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self, channel: ChannelId) -> Vec<ChannelError> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                Event::Error(id, error) if *id == channel => Some(*error),
                _ => None,
            })
            .collect()
    }
}

impl parabuild_ipc::Listener for RecordingListener {
    fn receive_message(&self, channel: &Channel, message: Bytes) -> anyhow::Result<()> {
        if self.panic_on.as_ref() == Some(&message) {
            panic!("refusing {:?}", message);
        }
        if self.fail_on.as_ref() == Some(&message) {
            anyhow::bail!("refusing {:?}", message);
        }
        self.events
            .borrow_mut()
            .push(Event::Message(channel.id(), message));
        Ok(())
    }

    fn receive_error(&self, channel: &Channel, error: ChannelError) {
        self.events
            .borrow_mut()
            .push(Event::Error(channel.id(), error));
    }
}

type WorkerBody = dyn Fn(WorkerId, Channel) -> i32 + Send + Sync;

/// Spawner whose workers are threads running `body` on the child endpoint.
pub struct ThreadSpawner {
    body: std::sync::Arc<WorkerBody>,
    /// Endpoints kept open after the worker "dies", to model a hung peer.
    retained: Vec<Channel>,
    retain_endpoints: bool,
}

impl ThreadSpawner {
    pub fn new<F>(body: F) -> Self
    where
        F: Fn(WorkerId, Channel) -> i32 + Send + Sync + 'static,
    {
        Self {
            body: std::sync::Arc::new(body),
            retained: Vec::new(),
            retain_endpoints: false,
        }
    }

    /// Workers that exit immediately while the spawner keeps their endpoint
    /// open, so the controller never observes a hangup.
    pub fn hung() -> Self {
        Self {
            retain_endpoints: true,
            ..Self::new(|_, _| 0)
        }
    }
}

impl Spawn for ThreadSpawner {
    type Process = ThreadProcess;

    fn spawn(&mut self, id: WorkerId, endpoint: Channel) -> io::Result<ThreadProcess> {
        let handle = if self.retain_endpoints {
            self.retained.push(endpoint);
            thread::spawn(|| 0)
        } else {
            let body = std::sync::Arc::clone(&self.body);
            thread::spawn(move || body(id, endpoint))
        };
        Ok(ThreadProcess {
            id: id.0,
            handle: Some(handle),
            status: None,
        })
    }
}

/// Thread-backed stand-in for a child process.
pub struct ThreadProcess {
    id: u32,
    handle: Option<JoinHandle<i32>>,
    status: Option<ExitStatus>,
}

impl WorkerProcess for ThreadProcess {
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

/// Spawner that always fails.
pub struct FailingSpawner;

impl Spawn for FailingSpawner {
    type Process = ThreadProcess;

    fn spawn(&mut self, _id: WorkerId, _endpoint: Channel) -> io::Result<ThreadProcess> {
        Err(io::Error::new(io::ErrorKind::NotFound, "no such worker"))
    }
}

/// Run the pump until it has nothing registered, failing the test after
/// `limit`.
pub fn drain(pump: &mut MessagePump, limit: Duration) {
    let deadline = Instant::now() + limit;
    while pump.should_process_events() {
        let left = deadline.saturating_duration_since(Instant::now());
        assert!(!left.is_zero(), "pump still has {} channels after {:?}", pump.len(), limit);
        pump.process_events_timeout(Some(left)).unwrap();
    }
}

/// Run the pump until `done` holds, failing the test after `limit`.
pub fn pump_until(pump: &mut MessagePump, limit: Duration, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while !done() {
        let left = deadline.saturating_duration_since(Instant::now());
        assert!(!left.is_zero(), "condition not met after {:?}", limit);
        pump.process_events_timeout(Some(left)).unwrap();
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("parabuild_ipc=debug")
        .try_init();
}
