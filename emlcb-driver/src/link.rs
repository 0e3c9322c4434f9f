//! Channel connecting a transport and the emlcb stack

use core::future::poll_fn;
use core::task::{Context, Poll, Waker};

use crate::internal;
use crate::message::Message;

/// Consumer of received messages
///
/// The transport should push complete messages in arrival order. The channel exerts
/// backpressure: `push` completes only after the stack has queued the message.
pub struct Rx<'a>(&'a dyn internal::DynamicRx);

impl<'a> Rx<'a> {
    /// Asynchronously pushes a message. Safe to drop.
    pub async fn push(&mut self, message: Message) {
        poll_fn(|cx| self.0.poll_push(cx, &message)).await;
    }

    /// Pushes a message if the stack has room for it. Returns the message otherwise.
    pub fn try_push(&mut self, message: Message) -> Result<(), Message> {
        let mut cx = Context::from_waker(Waker::noop());
        match self.0.poll_push(&mut cx, &message) {
            Poll::Ready(()) => Ok(()),
            Poll::Pending => Err(message),
        }
    }
}

/// Channel container. A transport should consume it.
pub struct Link<'a>(&'a dyn internal::DynamicRx);

impl<'a> Link<'a> {
    pub fn new(access: &'a dyn internal::DynamicRx) -> Self {
        Self(access)
    }

    pub fn split(self) -> Rx<'a> {
        Rx(self.0)
    }
}
