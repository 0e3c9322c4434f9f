use core::cell::{Cell, RefCell};
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::event::{EntryPoint, EventHandler, EventReport};
use crate::executor::{Status, TaskContext};
use crate::flow::{self, Action};
use crate::pool::{Pool, PoolHandle};
use crate::utils::Trigger;

/// Pending handler invocation
///
/// The report belongs to the iterator flow that produced the call. It stays unchanged until the
/// call buffer is released.
#[derive(Clone, Copy)]
pub struct DispatchCall<'a> {
    pub report: &'a RefCell<EventReport>,
    pub handler: &'a dyn EventHandler<'a>,
    pub entry: EntryPoint,
}

pub type CallPool<'a, M, const N: usize> = Pool<'a, M, DispatchCall<'a>, N>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CallerState {
    Entry,
    CallDone,
}

struct CallQueue<'a, const N: usize> {
    calls: heapless::Deque<PoolHandle, N>,
    trigger: Trigger<'a>,
}

/// Serializing handler call queue
///
/// Runs queued calls one at a time: a call starts only after the previous handler fired its
/// completion token and the call buffer was released. Capacity matches the call pool, so
/// every allocated call fits.
pub struct EventCallerFlow<'a, M: RawMutex, const N: usize> {
    state: Cell<CallerState>,
    queue: Mutex<M, RefCell<CallQueue<'a, N>>>,
    current: Cell<Option<PoolHandle>>,
}

impl<'a, M: RawMutex, const N: usize> EventCallerFlow<'a, M, N> {
    pub fn new() -> Self {
        Self {
            state: Cell::new(CallerState::Entry),
            queue: Mutex::new(RefCell::new(CallQueue {
                calls: heapless::Deque::new(),
                trigger: Trigger::new(),
            })),
            current: Cell::new(None),
        }
    }

    /// Queues an allocated call
    pub fn send(&self, call: PoolHandle) {
        let trigger = self.queue.lock(|queue| {
            let mut queue = queue.borrow_mut();
            unwrap!(queue.calls.push_back(call));
            queue.trigger.take()
        });
        if let Some(trigger) = trigger {
            trigger.notify();
        }
    }

    /// True while a call runs or waits in the queue
    pub fn is_busy(&self) -> bool {
        self.state.get() != CallerState::Entry
            || self.queue.lock(|queue| !queue.borrow().calls.is_empty())
    }

    pub fn step(&'a self, pool: &'a CallPool<'a, M, N>, cx: &mut TaskContext<'a>) -> Status {
        flow::drive(&self.state, |state| self.run_state(pool, state, cx))
    }

    fn run_state(
        &'a self,
        pool: &'a CallPool<'a, M, N>,
        state: CallerState,
        cx: &mut TaskContext<'a>,
    ) -> Action<CallerState> {
        match state {
            CallerState::Entry => {
                let next = self.queue.lock(|queue| {
                    let mut queue = queue.borrow_mut();
                    let next = queue.calls.pop_front();
                    if next.is_none() {
                        queue.trigger.register(cx.notifier());
                    }
                    next
                });
                let Some(handle) = next else {
                    return Action::Wait(CallerState::Entry);
                };

                let call = pool.with(&handle, |call| *call);
                self.current.set(Some(handle));
                trace!("event caller: invoking {:?}", call.entry);
                let report = call.report.borrow();
                call.entry.invoke(call.handler, &report, cx.notifier());
                Action::Wait(CallerState::CallDone)
            }
            CallerState::CallDone => {
                let handle = unwrap!(self.current.take());
                let _ = pool.release(handle);
                Action::Call(CallerState::Entry)
            }
        }
    }
}

impl<M: RawMutex, const N: usize> Default for EventCallerFlow<'_, M, N> {
    fn default() -> Self {
        Self::new()
    }
}
