//! Fixed-capacity buffer pool
//!
//! A pool hands out N slots. Acquisition never blocks: when the pool is exhausted, the caller
//! may leave a notifier that fires once a slot is released. Each slot carries a reference count
//! and an optional done-notifier, fired exactly once when the last reference is released.

use core::cell::RefCell;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::executor::Notifier;
use crate::utils::WaitQueue;

/// Acquirers that can wait for a slot at the same time
pub const MAX_WAITERS: usize = 8;

/// Owning reference to a pool slot
///
/// Neither `Copy` nor `Clone`: extra owners are created with [`Pool::add_ref`] and every owner
/// must be given back with [`Pool::release`].
#[must_use]
#[derive(Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PoolHandle {
    index: u8,
}

struct Slot<'a, T> {
    value: Option<T>,
    refs: u8,
    done: Option<Notifier<'a>>,
}

struct Inner<'a, T, const N: usize> {
    slots: [Slot<'a, T>; N],
    free: heapless::Deque<u8, N>,
    waiters: WaitQueue<'a, MAX_WAITERS>,
}

impl<'a, T, const N: usize> Inner<'a, T, N> {
    fn slot(&mut self, handle: &PoolHandle) -> &mut Slot<'a, T> {
        let slot = &mut self.slots[usize::from(handle.index)];
        assert!(slot.refs > 0);
        slot
    }
}

pub struct Pool<'a, M: RawMutex, T, const N: usize> {
    inner: Mutex<M, RefCell<Inner<'a, T, N>>>,
}

impl<'a, M: RawMutex, T, const N: usize> Pool<'a, M, T, N> {
    const _ASSERT: usize = u8::MAX as usize + 1 - N;

    pub fn new() -> Self {
        let _ = Self::_ASSERT;
        let mut free = heapless::Deque::new();
        for index in 0..N {
            unwrap!(free.push_back(unwrap!(u8::try_from(index))).ok());
        }
        Self {
            inner: Mutex::new(RefCell::new(Inner {
                slots: core::array::from_fn(|_| Slot {
                    value: None,
                    refs: 0,
                    done: None,
                }),
                free,
                waiters: WaitQueue::new(),
            })),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Number of free slots
    pub fn available(&self) -> usize {
        self.inner.lock(|inner| inner.borrow().free.len())
    }

    /// Takes a free slot. Returns the value back if the pool is exhausted.
    pub fn try_acquire(&self, value: T) -> Result<PoolHandle, T> {
        self.inner.lock(|inner| Self::take_slot(&mut inner.borrow_mut(), value))
    }

    /// Takes a free slot or registers the waiter for the next release.
    ///
    /// On success the waiter is dropped without notification.
    pub fn acquire(&self, value: T, waiter: Notifier<'a>) -> Result<PoolHandle, T> {
        let (result, evicted) = self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            let result = Self::take_slot(&mut inner, value);
            let evicted = match result {
                Ok(_) => None,
                Err(_) => inner.waiters.register(waiter),
            };
            (result, evicted)
        });
        if let Some(evicted) = evicted {
            evicted.notify();
        }
        result
    }

    fn take_slot(inner: &mut Inner<'a, T, N>, value: T) -> Result<PoolHandle, T> {
        let Some(index) = inner.free.pop_front() else {
            return Err(value);
        };
        let slot = &mut inner.slots[usize::from(index)];
        slot.value = Some(value);
        slot.refs = 1;
        slot.done = None;
        Ok(PoolHandle { index })
    }

    /// Sets the notifier fired when the slot is freed. Replaces a previous one.
    pub fn set_done(&self, handle: &PoolHandle, done: Notifier<'a>) {
        self.inner.lock(|inner| {
            inner.borrow_mut().slot(handle).done = Some(done);
        })
    }

    /// Gives read access to the slot value. The closure runs under the pool lock.
    pub fn with<R>(&self, handle: &PoolHandle, f: impl FnOnce(&T) -> R) -> R {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            let slot = inner.slot(handle);
            f(unwrap!(slot.value.as_ref()))
        })
    }

    /// Creates another owner of the slot
    pub fn add_ref(&self, handle: &PoolHandle) -> PoolHandle {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            let slot = inner.slot(handle);
            slot.refs = unwrap!(slot.refs.checked_add(1));
        });
        PoolHandle {
            index: handle.index,
        }
    }

    /// Drops one owner of the slot.
    ///
    /// The last release frees the slot, returns its value, fires the done-notifier and wakes
    /// one waiting acquirer.
    pub fn release(&self, handle: PoolHandle) -> Option<T> {
        let freed = self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            let slot = inner.slot(&handle);
            slot.refs -= 1;
            if slot.refs > 0 {
                return None;
            }
            let value = slot.value.take();
            let done = slot.done.take();
            unwrap!(inner.free.push_back(handle.index).ok());
            let waiter = inner.waiters.take_one();
            Some((value, done, waiter))
        });

        let (value, done, waiter) = freed?;
        if let Some(done) = done {
            done.notify();
        }
        if let Some(waiter) = waiter {
            waiter.notify();
        }
        value
    }
}

impl<M: RawMutex, T, const N: usize> Default for Pool<'_, M, T, N> {
    fn default() -> Self {
        Self::new()
    }
}
