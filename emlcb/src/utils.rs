use crate::executor::Notifier;

mod ready_queue;
mod stacked_array;

pub use ready_queue::ReadyQueue;
pub use stacked_array::DuplexArray;

/// Single-waiter wake-up slot
///
/// Registering a new waiter drops the previous one without notification.
#[derive(Default)]
pub struct Trigger<'a> {
    waiter: Option<Notifier<'a>>,
}

impl<'a> Trigger<'a> {
    pub const fn new() -> Self {
        Self { waiter: None }
    }

    pub fn register(&mut self, waiter: Notifier<'a>) {
        self.waiter = Some(waiter);
    }

    pub fn take(&mut self) -> Option<Notifier<'a>> {
        self.waiter.take()
    }
}

/// FIFO of waiters
///
/// When full, registering a waiter evicts the oldest one. The caller must fire the evicted
/// notifier once its lock is released, so the evicted task retries and registers again.
pub struct WaitQueue<'a, const N: usize> {
    waiters: heapless::Deque<Notifier<'a>, N>,
}

impl<'a, const N: usize> WaitQueue<'a, N> {
    pub const fn new() -> Self {
        Self {
            waiters: heapless::Deque::new(),
        }
    }

    /// Queues the waiter. Returns the evicted oldest waiter if the queue was full.
    #[must_use]
    pub fn register(&mut self, waiter: Notifier<'a>) -> Option<Notifier<'a>> {
        match self.waiters.push_back(waiter) {
            Ok(()) => None,
            Err(waiter) => {
                let oldest = self.waiters.pop_front();
                unwrap!(self.waiters.push_back(waiter));
                oldest
            }
        }
    }

    pub fn take_one(&mut self) -> Option<Notifier<'a>> {
        self.waiters.pop_front()
    }
}

impl<const N: usize> Default for WaitQueue<'_, N> {
    fn default() -> Self {
        Self::new()
    }
}
