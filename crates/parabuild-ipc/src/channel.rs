//! Duplex message channel over a Unix domain socket pair.
//!
//! A [`Channel`] is one endpoint of a connected `SOCK_STREAM` pair. Messages
//! are framed with [`FrameCodec`]; [`Channel::send`] writes whole frames and
//! [`Channel::recv`] only ever hands back whole frames.
//!
//! Methods take `&self`: the controller shares its endpoint between the
//! owning [`ProcessHost`](crate::ProcessHost) and the pump registry through an
//! `Rc<Channel>`, and listeners reply on the channel from inside a callback.
//! The receive buffer therefore lives in a `RefCell`, which keeps the type
//! `Send` (so a child endpoint can be moved to a worker thread) but `!Sync`.

use crate::codec::FrameCodec;
use crate::error::{IpcError, Result};
use bytes::{Bytes, BytesMut};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// Bytes pulled from the socket per read call.
const READ_CHUNK: usize = 64 * 1024;

/// Stable identity of a channel: its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(RawFd);

impl ChannelId {
    pub(crate) fn from_raw(fd: RawFd) -> Self {
        Self(fd)
    }

    pub fn as_raw_fd(self) -> RawFd {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd {}", self.0)
    }
}

/// Outcome of a single [`Channel::recv`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recv {
    /// One complete message.
    Message(Bytes),
    /// Non-blocking endpoint with no complete frame available yet.
    Pending,
    /// The peer closed its write side and every buffered frame was consumed.
    Closed,
}

/// One endpoint of a framed duplex channel.
pub struct Channel {
    stream: UnixStream,
    codec: FrameCodec,
    rx: RefCell<BytesMut>,
    eof: Cell<bool>,
    nonblocking: Cell<bool>,
    registered: Cell<bool>,
}

impl Channel {
    /// Create a connected `(parent, child)` pair with the default frame limit.
    pub fn pair() -> Result<(Channel, Channel)> {
        Self::pair_with_codec(FrameCodec::default())
    }

    /// Create a connected `(parent, child)` pair using `codec` on both ends.
    pub fn pair_with_codec(codec: FrameCodec) -> Result<(Channel, Channel)> {
        let (parent, child) = UnixStream::pair()?;
        Ok((
            Self::from_stream(parent, codec),
            Self::from_stream(child, codec),
        ))
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: UnixStream, codec: FrameCodec) -> Self {
        Self {
            stream,
            codec,
            rx: RefCell::new(BytesMut::with_capacity(READ_CHUNK)),
            eof: Cell::new(false),
            nonblocking: Cell::new(false),
            registered: Cell::new(false),
        }
    }

    /// Wrap a descriptor known to be a connected stream socket, such as the
    /// endpoint a worker process inherits on its stdin.
    pub fn from_owned_fd(fd: OwnedFd, codec: FrameCodec) -> Self {
        Self::from_stream(UnixStream::from(fd), codec)
    }

    pub fn id(&self) -> ChannelId {
        ChannelId(self.stream.as_raw_fd())
    }

    pub fn codec(&self) -> FrameCodec {
        self.codec
    }

    /// Whether the channel is currently registered with a pump.
    pub fn is_registered(&self) -> bool {
        self.registered.get()
    }

    pub(crate) fn set_registered(&self, registered: bool) {
        self.registered.set(registered);
    }

    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking.get()
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        if self.nonblocking.get() != nonblocking {
            self.stream.set_nonblocking(nonblocking)?;
            self.nonblocking.set(nonblocking);
        }
        Ok(())
    }

    /// Frame and write one message.
    ///
    /// The frame is written completely or an error is returned. On a
    /// non-blocking endpoint the socket is switched to blocking mode for the
    /// duration of the write.
    pub fn send(&self, message: &[u8]) -> Result<()> {
        let mut frame = BytesMut::new();
        self.codec.encode(message, &mut frame)?;
        self.blocking(|| (&self.stream).write_all(&frame).map_err(IpcError::from))
    }

    /// Return the next complete message, [`Recv::Closed`] once the peer has
    /// closed, or [`Recv::Pending`] when a non-blocking read would block.
    ///
    /// A stream that ends inside a frame yields [`IpcError::Truncated`].
    pub fn recv(&self) -> Result<Recv> {
        let mut rx = self.rx.borrow_mut();
        loop {
            if let Some(frame) = self.codec.decode(&mut rx)? {
                return Ok(Recv::Message(frame));
            }
            if self.eof.get() {
                return if rx.is_empty() {
                    Ok(Recv::Closed)
                } else {
                    Err(IpcError::Truncated { buffered: rx.len() })
                };
            }

            let mut chunk = [0u8; READ_CHUNK];
            match (&self.stream).read(&mut chunk) {
                Ok(0) => self.eof.set(true),
                Ok(n) => rx.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Recv::Pending),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Block until a complete message arrives. `None` means the peer closed.
    pub fn recv_blocking(&self) -> Result<Option<Bytes>> {
        self.blocking(|| loop {
            match self.recv()? {
                Recv::Message(message) => return Ok(Some(message)),
                Recv::Closed => return Ok(None),
                Recv::Pending => continue,
            }
        })
    }

    /// Whether an end of stream has been observed on this endpoint.
    pub fn saw_eof(&self) -> bool {
        self.eof.get()
    }

    /// Close the write side; the peer reads end-of-stream once it has
    /// drained what was already sent.
    pub fn shutdown_write(&self) -> Result<()> {
        ignore_not_connected(self.stream.shutdown(Shutdown::Write))
    }

    /// Shut down both directions. The descriptor itself is released when the
    /// last owner drops the channel.
    pub fn close(&self) -> Result<()> {
        ignore_not_connected(self.stream.shutdown(Shutdown::Both))
    }

    /// Give up the endpoint as a raw descriptor, e.g. to wire it to a child
    /// process's stdio. Buffered but unread bytes are discarded.
    pub fn into_owned_fd(self) -> OwnedFd {
        OwnedFd::from(self.stream)
    }

    fn blocking<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let restore = self.nonblocking.get();
        if restore {
            self.stream.set_nonblocking(false)?;
        }
        let result = f();
        if restore {
            self.stream.set_nonblocking(true)?;
        }
        result
    }
}

fn ignore_not_connected(result: io::Result<()>) -> Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other.map_err(IpcError::from),
    }
}

impl AsFd for Channel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .field("registered", &self.registered.get())
            .field("nonblocking", &self.nonblocking.get())
            .field("buffered", &self.rx.try_borrow().map(|rx| rx.len()).ok())
            .field("eof", &self.eof.get())
            .finish()
    }
}
