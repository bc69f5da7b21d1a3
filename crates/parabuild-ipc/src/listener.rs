//! The capability a scheduler implements to consume channel traffic.

use crate::channel::Channel;
use crate::error::ChannelError;
use bytes::Bytes;

/// Receiver of messages and terminal errors for the channels it is
/// registered under.
///
/// One listener may serve many channels; it tells them apart with
/// [`Channel::id`]. Callbacks run on the controller's thread from inside
/// [`MessagePump::process_events`](crate::MessagePump::process_events), so a
/// listener can reply on the channel it was handed but cannot touch the pump
/// itself. Hosts whose channel was dropped are collected afterwards through
/// [`MessagePump::take_dropped`](crate::MessagePump::take_dropped).
pub trait Listener {
    /// Handle one complete message. Returning an error (or panicking) is a
    /// listener fault: the pump drops the channel and reports
    /// [`ChannelError::User`].
    fn receive_message(&self, channel: &Channel, message: Bytes) -> anyhow::Result<()>;

    /// Called exactly once when the pump drops `channel` on its own. The
    /// channel is already unregistered when this runs.
    fn receive_error(&self, channel: &Channel, error: ChannelError);
}
