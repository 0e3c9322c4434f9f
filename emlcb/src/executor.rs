//! Cooperative run-to-completion executor
//!
//! The executor owns a bounded table of tasks and a prioritized ready queue. A task runs one
//! step at a time; while parked it costs nothing. Any party holding a [`Notifier`] for a task
//! may put it back to the ready queue, including interrupt handlers when the executor uses a
//! `CriticalSectionRawMutex`.

use core::cell::RefCell;
use core::future::poll_fn;
use core::task::Poll;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::waitqueue::WakerRegistration;

use crate::core::Priority;
use crate::utils::ReadyQueue;

/// Outcome of a single task step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Status {
    /// The task is parked until one of its notifiers fires
    Pending,
    /// The task is removed from the executor
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpawnError {
    NoTaskSlotLeft,
}

/// Executor-wide task reference
///
/// The generation tells apart successive tasks occupying the same table entry, so a stale
/// notifier never wakes an unrelated task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TaskId {
    index: u8,
    generation: u16,
}

/// A unit of cooperative work
///
/// One object may host several tasks; `slot` is the value given at spawn time and tells them
/// apart. A step must not block. It should return [`Status::Pending`] after arranging for a
/// notifier to fire once there is more work.
pub trait Task<'a> {
    fn step(&'a self, slot: u8, cx: &mut TaskContext<'a>) -> Status;
}

/// Private scheduler interface behind [`Notifier`] and [`Spawner`]
pub trait DynamicScheduler<'a> {
    fn notify(&self, task: TaskId);
    fn spawn(
        &self,
        task: &'a dyn Task<'a>,
        slot: u8,
        priority: Priority,
    ) -> Result<TaskId, SpawnError>;
}

/// One-shot completion token
///
/// Firing it puts the task back to the ready queue. Dropping it without firing has no effect.
#[must_use]
pub struct Notifier<'a> {
    scheduler: &'a dyn DynamicScheduler<'a>,
    task: TaskId,
}

impl<'a> Notifier<'a> {
    pub fn notify(self) {
        self.scheduler.notify(self.task);
    }

    pub fn task(&self) -> TaskId {
        self.task
    }
}

impl core::fmt::Debug for Notifier<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Notifier").field("task", &self.task).finish()
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Notifier<'_> {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "Notifier {{ task: {} }}", self.task)
    }
}

/// Step context handed to a running task
pub struct TaskContext<'a> {
    scheduler: &'a dyn DynamicScheduler<'a>,
    task: TaskId,
}

impl<'a> TaskContext<'a> {
    pub fn notifier(&self) -> Notifier<'a> {
        Notifier {
            scheduler: self.scheduler,
            task: self.task,
        }
    }

    pub fn spawner(&self) -> Spawner<'a> {
        Spawner(self.scheduler)
    }

    pub fn task(&self) -> TaskId {
        self.task
    }
}

/// Shared handle for spawning tasks
#[derive(Clone, Copy)]
pub struct Spawner<'a>(&'a dyn DynamicScheduler<'a>);

impl<'a> Spawner<'a> {
    pub fn spawn(
        &self,
        task: &'a dyn Task<'a>,
        slot: u8,
        priority: Priority,
    ) -> Result<TaskId, SpawnError> {
        self.0.spawn(task, slot, priority)
    }
}

#[derive(Clone, Copy)]
struct TaskEntry<'a> {
    task: &'a dyn Task<'a>,
    slot: u8,
    priority: Priority,
    generation: u16,
}

struct Inner<'a, const N: usize> {
    tasks: [Option<TaskEntry<'a>>; N],
    generation: u16,
    ready: ReadyQueue<N>,
    waker: WakerRegistration,
}

impl<'a, const N: usize> Inner<'a, N> {
    fn entry(&self, task: TaskId) -> Option<&TaskEntry<'a>> {
        self.tasks[usize::from(task.index)]
            .as_ref()
            .filter(|entry| entry.generation == task.generation)
    }
}

/// Executor with N task slots
pub struct Executor<'a, M: RawMutex, const N: usize> {
    inner: Mutex<M, RefCell<Inner<'a, N>>>,
}

impl<'a, M: RawMutex, const N: usize> Executor<'a, M, N> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Inner {
                tasks: [None; N],
                generation: 0,
                ready: ReadyQueue::new(),
                waker: WakerRegistration::new(),
            })),
        }
    }

    pub fn spawner(&'a self) -> Spawner<'a> {
        Spawner(self)
    }

    /// Adds a task. The task is ready at once.
    pub fn spawn(
        &self,
        task: &'a dyn Task<'a>,
        slot: u8,
        priority: Priority,
    ) -> Result<TaskId, SpawnError> {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            let Some(index) = inner.tasks.iter().position(Option::is_none) else {
                warn!("executor: no task slot left");
                return Err(SpawnError::NoTaskSlotLeft);
            };
            let index = unwrap!(u8::try_from(index));
            let generation = inner.generation;
            inner.generation = generation.wrapping_add(1);
            inner.tasks[usize::from(index)] = Some(TaskEntry {
                task,
                slot,
                priority,
                generation,
            });
            inner.ready.push_back(priority, index);
            inner.waker.wake();
            Ok(TaskId { index, generation })
        })
    }

    /// Runs one step of the highest-priority ready task.
    ///
    /// Returns false if no task was ready.
    pub fn run_once(&'a self) -> bool {
        let next = self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            let index = inner.ready.pop_front()?;
            let entry = *unwrap!(inner.tasks[usize::from(index)].as_ref());
            Some((index, entry))
        });
        let Some((index, entry)) = next else {
            return false;
        };

        let task = TaskId {
            index,
            generation: entry.generation,
        };
        let mut cx = TaskContext {
            scheduler: self,
            task,
        };
        if entry.task.step(entry.slot, &mut cx) == Status::Finished {
            self.inner.lock(|inner| {
                let mut inner = inner.borrow_mut();
                inner.ready.remove(index);
                inner.tasks[usize::from(index)] = None;
            });
        }
        true
    }

    /// Runs steps until no task is ready. Returns the number of steps taken.
    pub fn run_until_stalled(&'a self) -> usize {
        let mut steps = 0;
        while self.run_once() {
            steps += 1;
        }
        steps
    }

    pub fn is_idle(&self) -> bool {
        self.inner.lock(|inner| inner.borrow().ready.is_empty())
    }

    /// Number of live (spawned and not finished) tasks
    pub fn task_count(&self) -> usize {
        self.inner
            .lock(|inner| inner.borrow().tasks.iter().flatten().count())
    }

    /// Runs tasks forever, sleeping while none is ready.
    pub async fn run(&'a self) -> ! {
        loop {
            poll_fn(|cx| {
                self.inner.lock(|inner| {
                    let mut inner = inner.borrow_mut();
                    if inner.ready.is_empty() {
                        inner.waker.register(cx.waker());
                        Poll::Pending
                    } else {
                        Poll::Ready(())
                    }
                })
            })
            .await;
            self.run_until_stalled();
        }
    }
}

impl<M: RawMutex, const N: usize> Default for Executor<'_, M, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, M: RawMutex, const N: usize> DynamicScheduler<'a> for Executor<'a, M, N> {
    fn notify(&self, task: TaskId) {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            let Some(priority) = inner.entry(task).map(|entry| entry.priority) else {
                return;
            };
            if inner.ready.push_back(priority, task.index) {
                inner.waker.wake();
            }
        })
    }

    fn spawn(
        &self,
        task: &'a dyn Task<'a>,
        slot: u8,
        priority: Priority,
    ) -> Result<TaskId, SpawnError> {
        Executor::spawn(self, task, slot, priority)
    }
}
