//! # parabuild-ipc
//!
//! Event-driven plumbing between a build controller and its worker
//! processes.
//!
//! ## Pieces
//!
//! - [`Channel`]: one end of a framed, duplex Unix socket pair
//! - [`Listener`]: the callbacks a scheduler implements to consume traffic
//! - [`MessagePump`]: an epoll loop that dispatches readiness to listeners
//!   and drops channels on end of stream, read failure or listener fault
//! - [`ProcessManager`]: creates a channel pair per worker, registers the
//!   parent end, spawns the worker on the child end and reaps it afterwards
//!
//! Everything runs on the controller's thread. A listener can reply on the
//! channel it was handed, but never touches the pump; channels the pump
//! dropped are collected afterwards with [`MessagePump::take_dropped`] or
//! [`ProcessManager::reap_dropped`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use parabuild_ipc::{
//!     Channel, ChannelError, CommandSpawner, Listener, MessagePump, ProcessManager, WorkerId,
//! };
//! use std::collections::HashMap;
//! use std::rc::Rc;
//!
//! struct Echo;
//!
//! impl Listener for Echo {
//!     fn receive_message(&self, _channel: &Channel, message: Bytes) -> anyhow::Result<()> {
//!         println!("got {} bytes", message.len());
//!         Ok(())
//!     }
//!
//!     fn receive_error(&self, channel: &Channel, error: ChannelError) {
//!         println!("{} closed: {error}", channel.id());
//!     }
//! }
//!
//! # fn main() -> parabuild_ipc::Result<()> {
//! let mut manager = ProcessManager::new(MessagePump::new()?, CommandSpawner::new("cat"));
//! let host = manager.create_process_and_pipe(WorkerId(1), Rc::new(Echo))?;
//! host.send(b"ping")?;
//! host.channel().shutdown_write()?;
//!
//! let mut hosts = HashMap::from([(host.channel_id(), host)]);
//! while manager.pump().should_process_events() {
//!     manager.pump_mut().process_events()?;
//!     for report in manager.reap_dropped(|id| hosts.remove(&id)) {
//!         println!("worker exited: {}", report?.status);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("parabuild-ipc requires Linux (epoll)");

pub mod channel;
pub mod codec;
pub mod error;
pub mod host;
pub mod listener;
pub mod manager;
pub mod pump;
pub mod spawn;

pub use channel::{Channel, ChannelId, Recv};
pub use codec::{DEFAULT_MAX_PAYLOAD, FrameCodec, HEADER_SIZE};
pub use error::{ChannelError, IpcError, Result, WorkerId};
pub use host::{ExitReport, ProcessHost, WorkerState};
pub use listener::Listener;
pub use manager::{DEFAULT_SHUTDOWN_GRACE, ProcessManager};
pub use pump::{DroppedChannel, LivenessPolicy, MessagePump};
pub use spawn::{CommandSpawner, Spawn, WORKER_ID_ENV, WorkerProcess};
