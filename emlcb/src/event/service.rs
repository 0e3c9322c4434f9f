use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::RegistrationError;
use crate::core::{EventId, Mti, Priority};
use crate::dispatch::Registrar;
use crate::event::EventHandler;
use crate::event::caller_flow::{CallPool, EventCallerFlow};
use crate::event::iterator_flow::EventIteratorFlow;
use crate::event::registry::{EventRegistry, HandlerStorage, TreeEventHandlers, VectorEventHandlers};
use crate::executor::{SpawnError, Spawner, Status, Task, TaskContext};
use crate::message::Message;

/// Message categories served by the iterator flows, as dispatcher `(value, mask)` bindings
pub const CATEGORIES: [(Mti, Mti); 3] = [
    (Mti::EVENT_MASK, Mti::EVENT_MASK),
    (Mti::EVENTS_IDENTIFY_GLOBAL, Mti::EXACT_MASK),
    (Mti::EVENTS_IDENTIFY_ADDRESSED, Mti::EXACT_MASK),
];

const CALLER_SLOT: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EventServiceConfig {
    pub iterator_priority: Priority,
    /// Should not be lower than `iterator_priority`, so queued calls drain first
    pub caller_priority: Priority,
}

impl Default for EventServiceConfig {
    fn default() -> Self {
        Self {
            iterator_priority: Priority::Normal,
            caller_priority: Priority::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ServiceError {
    Spawn(SpawnError),
    Registration(RegistrationError),
}

impl From<SpawnError> for ServiceError {
    fn from(value: SpawnError) -> Self {
        Self::Spawn(value)
    }
}

impl From<RegistrationError> for ServiceError {
    fn from(value: RegistrationError) -> Self {
        Self::Registration(value)
    }
}

/// Event protocol instance
///
/// Owns the handler registry, N dispatch call buffers, the caller flow and one iterator flow
/// per message category. The service object hosts all four flows as executor tasks: slot 0 is
/// the caller, slots 1 to 3 are the iterators in [`CATEGORIES`] order.
pub struct EventService<'a, M: RawMutex, S: HandlerStorage<'a>, const N: usize> {
    registry: EventRegistry<'a, M, S>,
    pool: CallPool<'a, M, N>,
    caller: EventCallerFlow<'a, M, N>,
    iterators: [EventIteratorFlow<'a, M, S::Cursor>; 3],
}

pub type TreeEventService<'a, M, const H: usize, const N: usize> =
    EventService<'a, M, TreeEventHandlers<'a, H>, N>;

pub type VectorEventService<'a, M, const H: usize, const N: usize> =
    EventService<'a, M, VectorEventHandlers<'a, H>, N>;

impl<'a, M: RawMutex, S: HandlerStorage<'a>, const N: usize> EventService<'a, M, S, N> {
    pub fn with_storage(storage: S) -> Self {
        Self {
            registry: EventRegistry::new(storage),
            pool: CallPool::new(),
            caller: EventCallerFlow::new(),
            iterators: CATEGORIES.map(|(mti, mask)| EventIteratorFlow::new(mti, mask)),
        }
    }

    /// Spawns the flows and binds the iterators to the transport dispatcher.
    ///
    /// All flows are spawned before any binding is made. If a binding fails, the bindings made
    /// so far are removed again. Flows spawned before a failure stay in the executor and idle,
    /// so `start` must not be called twice on the same service.
    pub fn start(
        &'a self,
        spawner: Spawner<'a>,
        registrar: &'a dyn Registrar<'a, Message>,
        config: EventServiceConfig,
    ) -> Result<(), ServiceError> {
        spawner.spawn(self, CALLER_SLOT, config.caller_priority)?;
        for slot in (CALLER_SLOT + 1..).take(self.iterators.len()) {
            spawner.spawn(self, slot, config.iterator_priority)?;
        }

        for (bound, iterator) in self.iterators.iter().enumerate() {
            let (mti, mask) = iterator.binding();
            if let Err(err) = registrar.register(mti, mask, iterator) {
                for iterator in &self.iterators[..bound] {
                    let (mti, mask) = iterator.binding();
                    registrar.unregister(mti, mask, iterator);
                }
                return Err(err.into());
            }
        }
        debug!("event service: started with {} call buffers", N);
        Ok(())
    }

    /// Binds the handler to the events selected by `mask`. Set mask bits are significant.
    pub fn register_handler(
        &self,
        event: EventId,
        mask: u64,
        handler: &'a dyn EventHandler<'a>,
    ) -> Result<(), RegistrationError> {
        self.registry.register(event, mask, handler)
    }

    /// Removes the exact binding. No-op if it is not present.
    pub fn unregister_handler(&self, event: EventId, mask: u64, handler: &'a dyn EventHandler<'a>) {
        self.registry.unregister(event, mask, handler)
    }

    pub fn registry(&self) -> &EventRegistry<'a, M, S> {
        &self.registry
    }

    /// True while any message is queued or being dispatched
    pub fn event_processing_pending(&self) -> bool {
        self.caller.is_busy() || self.iterators.iter().any(EventIteratorFlow::is_busy)
    }
}

impl<'a, M: RawMutex, S: HandlerStorage<'a> + Default, const N: usize> EventService<'a, M, S, N> {
    pub fn new() -> Self {
        Self::with_storage(S::default())
    }
}

impl<'a, M: RawMutex, S: HandlerStorage<'a> + Default, const N: usize> Default
    for EventService<'a, M, S, N>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, M: RawMutex, S: HandlerStorage<'a>, const N: usize> Task<'a> for EventService<'a, M, S, N> {
    fn step(&'a self, slot: u8, cx: &mut TaskContext<'a>) -> Status {
        match slot {
            CALLER_SLOT => self.caller.step(&self.pool, cx),
            _ => {
                let iterator = &self.iterators[usize::from(slot - CALLER_SLOT - 1)];
                iterator.step(&self.registry, &self.pool, &self.caller, cx)
            }
        }
    }
}
