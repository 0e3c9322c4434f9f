/// Private interfaces for the emlcb stack
///
/// Drivers should not use this module.
/// Backward-incompatible changes can be made without major version bump.
use core::task::{Context, Poll};

use crate::message::Message;

pub trait DynamicRx {
    /// Queues a copy of the message or registers the waker when there is no room.
    fn poll_push(&self, cx: &mut Context<'_>, message: &Message) -> Poll<()>;
}
