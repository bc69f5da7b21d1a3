//! Error types for the IPC layer.
//!
//! Two families live here. [`IpcError`] is returned by fallible operations
//! (registering a channel, sending a frame, spawning a worker). [`ChannelError`]
//! is never returned from a call: it is the terminal condition the pump
//! reports to a [`Listener`](crate::Listener) when it drops a channel.

use std::fmt;
use std::os::unix::io::RawFd;

/// Result type alias for IPC operations.
pub type Result<T, E = IpcError> = std::result::Result<T, E>;

/// Errors raised by channel, pump and process-manager operations.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// I/O failure on a socket or in the readiness primitive.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The channel is already registered with a pump.
    #[error("channel {fd} is already registered")]
    AlreadyRegistered { fd: RawFd },

    /// The channel is not registered with this pump.
    #[error("channel {fd} is not registered")]
    NotRegistered { fd: RawFd },

    /// A frame exceeded the configured payload limit.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// The peer closed the stream in the middle of a frame.
    #[error("stream closed with {buffered} bytes of an incomplete frame buffered")]
    Truncated { buffered: usize },

    /// The worker process could not be launched.
    #[error("failed to spawn worker {id}: {source}")]
    Spawn {
        id: WorkerId,
        #[source]
        source: std::io::Error,
    },

    /// Waiting for a worker's exit status failed.
    #[error("failed to reap worker {id}: {source}")]
    Wait {
        id: WorkerId,
        #[source]
        source: std::io::Error,
    },
}

impl From<nix::errno::Errno> for IpcError {
    fn from(errno: nix::errno::Errno) -> Self {
        Self::Io(std::io::Error::from(errno))
    }
}

impl IpcError {
    /// True for errors that mean the peer is gone rather than that the
    /// local side misbehaved.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::UnexpectedEof
            ),
            Self::Truncated { .. } => true,
            _ => false,
        }
    }
}

/// Terminal condition reported for a channel the pump has dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelError {
    /// Peer closed, hung up, or the stream became unreadable.
    Eof,
    /// The listener failed while handling a delivered message.
    User,
    /// The channel stayed silent past the pump's liveness timeout.
    Timeout,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eof => write!(f, "eof"),
            Self::User => write!(f, "listener fault"),
            Self::Timeout => write!(f, "liveness timeout"),
        }
    }
}

/// Caller-chosen identity of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u32> for WorkerId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_classification() {
        let broken: IpcError = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert!(broken.is_disconnect());
        assert!(IpcError::Truncated { buffered: 3 }.is_disconnect());
        assert!(!IpcError::AlreadyRegistered { fd: 4 }.is_disconnect());
    }

    #[test]
    fn test_errno_conversion() {
        let err: IpcError = nix::errno::Errno::EBADF.into();
        match err {
            IpcError::Io(e) => assert_eq!(e.raw_os_error(), Some(nix::errno::Errno::EBADF as i32)),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(ChannelError::Eof.to_string(), "eof");
        assert_eq!(WorkerId(7).to_string(), "#7");
    }
}
