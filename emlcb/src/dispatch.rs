//! Typed mask-matching dispatcher
//!
//! The dispatcher owns a bounded inbox and a table of `(value, mask, handler)` bindings. For each
//! inbound message it calls every handler whose binding matches the message key, one at a time,
//! and waits for the handler completion before moving on. A binding matches when
//! `key & mask == value & mask`.
//!
//! Handlers may push back: [`MessageHandler::poll_ready`] lets a handler with limited capacity
//! park the dispatcher until it can take another message.

use core::cell::{Cell, RefCell};
use core::task::{Context, Poll};
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::waitqueue::WakerRegistration;
use emlcb_driver::internal::DynamicRx;
use emlcb_driver::link::Link;

use crate::RegistrationError;
use crate::core::Mti;
use crate::executor::{Notifier, Status, Task, TaskContext};
use crate::flow::{Action, StateFlow};
use crate::message::Message;
use crate::utils::Trigger;

/// Message with an integer-like dispatch key
pub trait Dispatchable {
    type Key: Copy + Eq + core::ops::BitAnd<Output = Self::Key>;

    fn key(&self) -> Self::Key;
}

impl Dispatchable for Message {
    type Key = Mti;

    fn key(&self) -> Mti {
        self.mti
    }
}

pub trait MessageHandler<'a, P> {
    /// Reports whether the handler can take a message now.
    ///
    /// A handler returning `Pending` must keep the waiter and fire it once it becomes ready.
    fn poll_ready(&self, waiter: Notifier<'a>) -> Poll<()> {
        let _ = waiter;
        Poll::Ready(())
    }

    /// Processes the message. The handler must fire `done` once finished, possibly later.
    ///
    /// The message reference is only valid for the duration of the call.
    fn handle_message(&self, message: &P, done: Notifier<'a>);
}

/// Type-erased binding table access
pub trait Registrar<'a, P: Dispatchable> {
    /// Adds a binding. Registering an existing binding again has no effect.
    fn register(
        &self,
        value: P::Key,
        mask: P::Key,
        handler: &'a dyn MessageHandler<'a, P>,
    ) -> Result<(), RegistrationError>;

    /// Removes a binding. Removing an absent binding has no effect.
    fn unregister(&self, value: P::Key, mask: P::Key, handler: &'a dyn MessageHandler<'a, P>);
}

struct Binding<'a, P: Dispatchable> {
    value: P::Key,
    mask: P::Key,
    handler: &'a dyn MessageHandler<'a, P>,
}

impl<P: Dispatchable> Clone for Binding<'_, P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P: Dispatchable> Copy for Binding<'_, P> {}

impl<'a, P: Dispatchable> Binding<'a, P> {
    fn matches(&self, key: P::Key) -> bool {
        key & self.mask == self.value & self.mask
    }

    fn is(&self, value: P::Key, mask: P::Key, handler: &'a dyn MessageHandler<'a, P>) -> bool {
        self.mask == mask
            && self.value & mask == value & mask
            && core::ptr::addr_eq(self.handler, handler)
    }
}

struct Inbox<'a, P, const Q: usize> {
    queue: heapless::Deque<P, Q>,
    entry: Trigger<'a>,
    pusher: WakerRegistration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    Entry,
    IterateNext,
    Reserve,
}

/// Dispatcher with H binding slots and a Q-deep inbox
pub struct Dispatcher<'a, M: RawMutex, P: Dispatchable, const H: usize, const Q: usize> {
    bindings: Mutex<M, RefCell<[Option<Binding<'a, P>>; H]>>,
    inbox: Mutex<M, RefCell<Inbox<'a, P, Q>>>,
    state: Cell<State>,
    current: RefCell<Option<P>>,
    // Binding slot to examine next
    cursor: Cell<usize>,
    selected: Cell<Option<usize>>,
}

impl<'a, M: RawMutex, P: Dispatchable, const H: usize, const Q: usize> Dispatcher<'a, M, P, H, Q> {
    pub fn new() -> Self {
        Self {
            bindings: Mutex::new(RefCell::new([None; H])),
            inbox: Mutex::new(RefCell::new(Inbox {
                queue: heapless::Deque::new(),
                entry: Trigger::new(),
                pusher: WakerRegistration::new(),
            })),
            state: Cell::new(State::Entry),
            current: RefCell::new(None),
            cursor: Cell::new(0),
            selected: Cell::new(None),
        }
    }

    /// Queues a message. Returns the message back if the inbox is full.
    pub fn try_push(&self, message: P) -> Result<(), P> {
        let entry = self.inbox.lock(|inbox| {
            let mut inbox = inbox.borrow_mut();
            inbox.queue.push_back(message)?;
            Ok(inbox.entry.take())
        })?;
        if let Some(entry) = entry {
            entry.notify();
        }
        Ok(())
    }

    /// True while a message is queued or being dispatched
    pub fn is_busy(&self) -> bool {
        self.current.borrow().is_some() || self.inbox.lock(|inbox| !inbox.borrow().queue.is_empty())
    }

    pub fn binding_count(&self) -> usize {
        self.bindings
            .lock(|bindings| bindings.borrow().iter().flatten().count())
    }

    fn next_match(&self, key: P::Key) -> Option<usize> {
        self.bindings.lock(|bindings| {
            let bindings = bindings.borrow();
            let start = self.cursor.get();
            let found = bindings[start.min(H)..]
                .iter()
                .position(|binding| binding.is_some_and(|binding| binding.matches(key)))
                .map(|offset| start + offset);
            self.cursor.set(found.map_or(H, |index| index + 1));
            found
        })
    }

    fn binding(&self, index: usize) -> Option<Binding<'a, P>> {
        self.bindings.lock(|bindings| bindings.borrow()[index])
    }
}

impl<'a, M: RawMutex, P: Dispatchable + Copy, const H: usize, const Q: usize>
    Dispatcher<'a, M, P, H, Q>
{
    fn poll_push_copy(&self, cx: &mut Context<'_>, message: &P) -> Poll<()> {
        let pushed = self.inbox.lock(|inbox| {
            let mut inbox = inbox.borrow_mut();
            if inbox.queue.push_back(*message).is_ok() {
                Some(inbox.entry.take())
            } else {
                inbox.pusher.register(cx.waker());
                None
            }
        });
        match pushed {
            Some(entry) => {
                if let Some(entry) = entry {
                    entry.notify();
                }
                Poll::Ready(())
            }
            None => Poll::Pending,
        }
    }
}

impl<'a, M: RawMutex, const H: usize, const Q: usize> Dispatcher<'a, M, Message, H, Q> {
    /// Creates the transport-facing channel feeding this dispatcher
    pub fn link(&'a self) -> Link<'a> {
        Link::new(self)
    }
}

impl<M: RawMutex, P: Dispatchable, const H: usize, const Q: usize> Default
    for Dispatcher<'_, M, P, H, Q>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, M: RawMutex, P: Dispatchable, const H: usize, const Q: usize> Registrar<'a, P>
    for Dispatcher<'a, M, P, H, Q>
{
    fn register(
        &self,
        value: P::Key,
        mask: P::Key,
        handler: &'a dyn MessageHandler<'a, P>,
    ) -> Result<(), RegistrationError> {
        self.bindings.lock(|bindings| {
            let mut bindings = bindings.borrow_mut();
            if bindings
                .iter()
                .flatten()
                .any(|binding| binding.is(value, mask, handler))
            {
                return Ok(());
            }
            let Some(slot) = bindings.iter_mut().find(|slot| slot.is_none()) else {
                warn!("dispatcher: no binding slot left");
                return Err(RegistrationError::NoSlotLeft);
            };
            *slot = Some(Binding {
                value,
                mask,
                handler,
            });
            Ok(())
        })
    }

    fn unregister(&self, value: P::Key, mask: P::Key, handler: &'a dyn MessageHandler<'a, P>) {
        self.bindings.lock(|bindings| {
            let mut bindings = bindings.borrow_mut();
            for slot in bindings.iter_mut() {
                if slot.is_some_and(|binding| binding.is(value, mask, handler)) {
                    *slot = None;
                }
            }
        })
    }
}

impl<'a, M: RawMutex, P: Dispatchable, const H: usize, const Q: usize> StateFlow<'a>
    for Dispatcher<'a, M, P, H, Q>
{
    type State = State;

    fn state(&self) -> &Cell<State> {
        &self.state
    }

    fn run_state(&'a self, state: State, cx: &mut TaskContext<'a>) -> Action<State> {
        match state {
            State::Entry => {
                let message = self.inbox.lock(|inbox| {
                    let mut inbox = inbox.borrow_mut();
                    let message = inbox.queue.pop_front();
                    if message.is_some() {
                        inbox.pusher.wake();
                    } else {
                        inbox.entry.register(cx.notifier());
                    }
                    message
                });
                let Some(message) = message else {
                    return Action::Wait(State::Entry);
                };
                *self.current.borrow_mut() = Some(message);
                self.cursor.set(0);
                Action::Call(State::IterateNext)
            }
            State::IterateNext => {
                let key = match self.current.borrow().as_ref() {
                    Some(message) => message.key(),
                    None => return Action::Call(State::Entry),
                };
                match self.next_match(key) {
                    Some(index) => {
                        self.selected.set(Some(index));
                        Action::Call(State::Reserve)
                    }
                    None => {
                        self.current.borrow_mut().take();
                        Action::Call(State::Entry)
                    }
                }
            }
            State::Reserve => {
                let index = unwrap!(self.selected.get());
                let key = unwrap!(self.current.borrow().as_ref()).key();
                // The binding may have been removed while waiting for the handler
                let Some(binding) = self.binding(index).filter(|binding| binding.matches(key))
                else {
                    return Action::Call(State::IterateNext);
                };
                if binding.handler.poll_ready(cx.notifier()).is_pending() {
                    return Action::Wait(State::Reserve);
                }
                trace!("dispatcher: calling binding {}", index);
                let current = self.current.borrow();
                binding
                    .handler
                    .handle_message(unwrap!(current.as_ref()), cx.notifier());
                Action::Wait(State::IterateNext)
            }
        }
    }
}

impl<'a, M: RawMutex, P: Dispatchable, const H: usize, const Q: usize> Task<'a>
    for Dispatcher<'a, M, P, H, Q>
{
    fn step(&'a self, _slot: u8, cx: &mut TaskContext<'a>) -> Status {
        self.step_flow(cx)
    }
}

impl<'a, M: RawMutex, const H: usize, const Q: usize> DynamicRx for Dispatcher<'a, M, Message, H, Q> {
    fn poll_push(&self, cx: &mut Context<'_>, message: &Message) -> Poll<()> {
        self.poll_push_copy(cx, message)
    }
}
