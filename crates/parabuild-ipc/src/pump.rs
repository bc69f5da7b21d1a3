//! The controller's event loop.
//!
//! [`MessagePump`] multiplexes every registered [`Channel`] through a single
//! epoll instance. One call to [`MessagePump::process_events`] blocks until
//! at least one channel is ready, then services each ready channel once:
//! complete messages go to the channel's [`Listener`], and any terminal
//! condition (end of stream, unreadable stream, hangup, listener fault)
//! drops the channel and notifies its listener exactly once. Nothing a
//! single channel does can abort the iteration for the others.
//!
//! # Liveness
//!
//! epoll only observes descriptors. A worker that dies while its endpoint is
//! still held open somewhere else never produces a hangup, and a pump with
//! no timeout then waits forever. [`LivenessPolicy::Timeout`] bounds that
//! wait: a channel silent for longer than the limit is dropped with
//! [`ChannelError::Timeout`]. The default is [`LivenessPolicy::Disabled`].

use crate::channel::{Channel, ChannelId, Recv};
use crate::error::{ChannelError, IpcError, Result};
use crate::listener::Listener;
use bytes::Bytes;
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use std::any::Any;
use std::collections::HashMap;
use std::os::unix::io::AsFd;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Minimum size of the readiness buffer handed to `epoll_wait`.
const MIN_EVENT_CAPACITY: usize = 16;

/// How long a registered channel may stay silent before the pump gives up
/// on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LivenessPolicy {
    /// Wait for readiness indefinitely.
    #[default]
    Disabled,
    /// Drop channels that produce no readiness event for this long.
    Timeout(Duration),
}

/// A channel the pump dropped by itself, and why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DroppedChannel {
    pub channel: ChannelId,
    pub error: ChannelError,
}

struct Registration {
    channel: Rc<Channel>,
    listener: Rc<dyn Listener>,
    last_activity: Instant,
}

/// Readiness-driven dispatcher over all registered channels.
pub struct MessagePump {
    epoll: Epoll,
    registry: HashMap<ChannelId, Registration>,
    events: Vec<EpollEvent>,
    dropped: Vec<DroppedChannel>,
    liveness: LivenessPolicy,
}

impl MessagePump {
    /// Create an empty pump with its own epoll instance.
    pub fn new() -> Result<Self> {
        Self::with_liveness(LivenessPolicy::Disabled)
    }

    pub fn with_liveness(liveness: LivenessPolicy) -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self {
            epoll,
            registry: HashMap::new(),
            events: vec![EpollEvent::empty(); MIN_EVENT_CAPACITY],
            dropped: Vec::new(),
            liveness,
        })
    }

    pub fn liveness(&self) -> LivenessPolicy {
        self.liveness
    }

    pub fn set_liveness(&mut self, liveness: LivenessPolicy) {
        self.liveness = liveness;
    }

    /// Start watching `channel` for read, error and hangup readiness and
    /// route its traffic to `listener`.
    ///
    /// The channel is switched to non-blocking mode. Registering a channel
    /// that is already registered (here or with another pump) fails and
    /// leaves every registration as it was.
    pub fn add_channel(&mut self, channel: Rc<Channel>, listener: Rc<dyn Listener>) -> Result<()> {
        let id = channel.id();
        if channel.is_registered() || self.registry.contains_key(&id) {
            return Err(IpcError::AlreadyRegistered {
                fd: id.as_raw_fd(),
            });
        }

        let was_nonblocking = channel.is_nonblocking();
        channel.set_nonblocking(true)?;

        let interest = EpollFlags::EPOLLIN
            | EpollFlags::EPOLLRDHUP
            | EpollFlags::EPOLLERR
            | EpollFlags::EPOLLHUP;
        if let Err(errno) = self
            .epoll
            .add(channel.as_fd(), EpollEvent::new(interest, id.as_raw_fd() as u64))
        {
            let _ = channel.set_nonblocking(was_nonblocking);
            return Err(errno.into());
        }

        channel.set_registered(true);
        self.registry.insert(
            id,
            Registration {
                channel,
                listener,
                last_activity: Instant::now(),
            },
        );
        if self.events.len() < self.registry.len() {
            self.events.resize(self.registry.len(), EpollEvent::empty());
        }

        debug!(channel = %id, registered = self.registry.len(), "Channel registered");
        Ok(())
    }

    /// Stop watching `channel`. No message or error is delivered for it
    /// afterwards.
    ///
    /// Fails with [`IpcError::NotRegistered`] if this pump does not hold the
    /// channel, which includes a second drop of the same channel.
    pub fn drop_channel(&mut self, channel: &Channel) -> Result<()> {
        let id = channel.id();
        let owned = self
            .registry
            .get(&id)
            .is_some_and(|reg| std::ptr::eq(Rc::as_ptr(&reg.channel), channel));
        if !owned {
            return Err(IpcError::NotRegistered {
                fd: id.as_raw_fd(),
            });
        }

        if let Some(reg) = self.registry.remove(&id) {
            self.unwatch(&reg.channel);
        }
        debug!(channel = %id, registered = self.registry.len(), "Channel dropped");
        Ok(())
    }

    /// Whether any channel is still registered.
    pub fn should_process_events(&self) -> bool {
        !self.registry.is_empty()
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Whether this pump holds `channel`.
    pub fn is_registered(&self, channel: &Channel) -> bool {
        self.registry
            .get(&channel.id())
            .is_some_and(|reg| std::ptr::eq(Rc::as_ptr(&reg.channel), channel))
    }

    /// Drain the channels the pump dropped on its own since the last call.
    pub fn take_dropped(&mut self) -> Vec<DroppedChannel> {
        std::mem::take(&mut self.dropped)
    }

    /// Run one iteration, waiting as long as it takes for a channel to
    /// become ready (or for the nearest liveness deadline).
    ///
    /// Returns the number of channels serviced. Listener faults and channel
    /// failures never surface here; only a failure of `epoll_wait` itself
    /// does.
    pub fn process_events(&mut self) -> Result<usize> {
        loop {
            // An interrupted wait or an early wakeup services nothing.
            let serviced = self.process_events_timeout(None)?;
            if serviced > 0 || self.registry.is_empty() {
                return Ok(serviced);
            }
        }
    }

    /// Like [`process_events`](Self::process_events) but waits at most
    /// `timeout`. Returns `Ok(0)` when nothing became ready in time.
    pub fn process_events_timeout(&mut self, timeout: Option<Duration>) -> Result<usize> {
        if self.registry.is_empty() {
            return Ok(0);
        }

        let wait = match (timeout, self.until_next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let ready = match self.epoll.wait(&mut self.events, epoll_timeout(wait)) {
            Ok(n) => n,
            Err(Errno::EINTR) => 0,
            Err(errno) => return Err(errno.into()),
        };

        // Copy the readiness set out: servicing mutates the registry.
        let batch: Vec<(ChannelId, EpollFlags)> = self.events[..ready]
            .iter()
            .map(|event| (ChannelId::from_raw(event.data() as i32), event.events()))
            .collect();

        let mut serviced = 0;
        for (id, flags) in batch {
            if self.service(id, flags) {
                serviced += 1;
            }
        }
        serviced += self.expire_stalled();

        Ok(serviced)
    }

    fn service(&mut self, id: ChannelId, flags: EpollFlags) -> bool {
        // Dropped earlier in this iteration.
        let Some(reg) = self.registry.get_mut(&id) else {
            return false;
        };
        reg.last_activity = Instant::now();
        let channel = Rc::clone(&reg.channel);
        let listener = Rc::clone(&reg.listener);

        if flags.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP) {
            loop {
                match channel.recv() {
                    Ok(Recv::Message(message)) => {
                        if let Err(fault) = deliver(listener.as_ref(), &channel, message) {
                            warn!(channel = %id, error = %format!("{fault:#}"), "Listener failed to handle message");
                            self.fail(id, ChannelError::User);
                            return true;
                        }
                    }
                    Ok(Recv::Pending) => break,
                    Ok(Recv::Closed) => {
                        debug!(channel = %id, "Peer closed channel");
                        self.fail(id, ChannelError::Eof);
                        return true;
                    }
                    Err(e) => {
                        error!(channel = %id, error = %e, "Failed to read from channel");
                        self.fail(id, ChannelError::Eof);
                        return true;
                    }
                }
            }
        }

        if flags.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
            debug!(channel = %id, ?flags, "Channel hung up");
            self.fail(id, ChannelError::Eof);
        }
        true
    }

    fn fail(&mut self, id: ChannelId, error: ChannelError) {
        let Some(reg) = self.registry.remove(&id) else {
            return;
        };
        self.unwatch(&reg.channel);
        self.dropped.push(DroppedChannel { channel: id, error });

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            reg.listener.receive_error(&reg.channel, error)
        }));
        if let Err(payload) = outcome {
            warn!(channel = %id, panic = panic_message(payload.as_ref()), "Listener panicked in receive_error");
        }
    }

    fn unwatch(&self, channel: &Channel) {
        channel.set_registered(false);
        if let Err(errno) = self.epoll.delete(channel.as_fd()) {
            warn!(channel = %channel.id(), error = %errno, "epoll_ctl(DEL) failed");
        }
    }

    fn until_next_deadline(&self) -> Option<Duration> {
        let LivenessPolicy::Timeout(limit) = self.liveness else {
            return None;
        };
        let now = Instant::now();
        self.registry
            .values()
            .map(|reg| (reg.last_activity + limit).saturating_duration_since(now))
            .min()
    }

    fn expire_stalled(&mut self) -> usize {
        let LivenessPolicy::Timeout(limit) = self.liveness else {
            return 0;
        };
        let now = Instant::now();
        let stalled: Vec<ChannelId> = self
            .registry
            .iter()
            .filter(|(_, reg)| now.duration_since(reg.last_activity) >= limit)
            .map(|(id, _)| *id)
            .collect();

        for id in &stalled {
            warn!(channel = %id, timeout = ?limit, "Channel exceeded liveness timeout");
            self.fail(*id, ChannelError::Timeout);
        }
        stalled.len()
    }
}

impl std::fmt::Debug for MessagePump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut channels: Vec<_> = self.registry.keys().copied().collect();
        channels.sort();
        f.debug_struct("MessagePump")
            .field("channels", &channels)
            .field("pending_dropped", &self.dropped.len())
            .field("liveness", &self.liveness)
            .finish()
    }
}

fn deliver(listener: &dyn Listener, channel: &Channel, message: Bytes) -> anyhow::Result<()> {
    match panic::catch_unwind(AssertUnwindSafe(|| listener.receive_message(channel, message))) {
        Ok(result) => result,
        Err(payload) => Err(anyhow::anyhow!(
            "listener panicked: {}",
            panic_message(payload.as_ref())
        )),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic>"
    }
}

/// Round up to whole milliseconds so a sub-millisecond deadline does not
/// turn into a busy loop; waits beyond the 16-bit range wake early.
fn wait_millis(wait: Option<Duration>) -> Option<u16> {
    wait.map(|d| {
        let ms = d.as_millis() + u128::from(d.subsec_nanos() % 1_000_000 != 0);
        u16::try_from(ms).unwrap_or(u16::MAX)
    })
}

fn epoll_timeout(wait: Option<Duration>) -> EpollTimeout {
    match wait_millis(wait) {
        None => EpollTimeout::NONE,
        Some(ms) => EpollTimeout::from(ms),
    }
}
