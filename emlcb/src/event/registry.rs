use core::cell::RefCell;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::RegistrationError;
use crate::core::EventId;
use crate::event::report::span_matches;
use crate::event::{EventHandler, EventReport};

/// Handler binding
///
/// `mask` selects the significant bits of `event`; the stored event has the other bits cleared.
#[derive(Clone, Copy)]
pub struct Registration<'a> {
    pub event: EventId,
    pub mask: u64,
    pub handler: &'a dyn EventHandler<'a>,
}

impl<'a> Registration<'a> {
    pub fn new(event: EventId, mask: u64, handler: &'a dyn EventHandler<'a>) -> Self {
        Self {
            event: event & mask,
            mask,
            handler,
        }
    }

    fn is(&self, other: &Registration<'a>) -> bool {
        self.event == other.event
            && self.mask == other.mask
            && core::ptr::addr_eq(self.handler, other.handler)
    }
}

impl core::fmt::Debug for Registration<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Registration")
            .field("event", &self.event)
            .field("mask", &self.mask)
            .finish_non_exhaustive()
    }
}

/// Matching key captured by [`EventIterator::begin`]
#[derive(Debug, Clone, Copy)]
pub struct Target {
    event: EventId,
    span: u64,
}

impl Target {
    fn new(report: &EventReport) -> Self {
        Self {
            event: report.event,
            span: report.span(),
        }
    }

    fn matches(&self, registration: &Registration<'_>) -> bool {
        span_matches(self.event, self.span, registration.event, registration.mask)
    }
}

/// Storage of handler registrations
///
/// Implementations differ in lookup cost and memory, not in the set of matches. A cursor must
/// stay valid across insertions and removals: a registration present for the whole iteration
/// is produced exactly once, others at most once.
pub trait HandlerStorage<'a> {
    type Cursor: Copy + Default;

    /// Adds a registration. Adding an existing registration again has no effect.
    fn insert(&mut self, registration: Registration<'a>) -> Result<(), RegistrationError>;

    /// Removes a registration. Removing an absent registration has no effect.
    fn remove(&mut self, registration: &Registration<'a>);

    fn next_match(&self, cursor: &mut Self::Cursor, target: &Target) -> Option<Registration<'a>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Linear-scan storage with N registration slots
///
/// Produces matches in slot order. A freed slot is reused by the next registration.
pub struct VectorEventHandlers<'a, const N: usize> {
    slots: [Option<Registration<'a>>; N],
}

impl<const N: usize> VectorEventHandlers<'_, N> {
    pub const fn new() -> Self {
        Self { slots: [None; N] }
    }
}

impl<const N: usize> Default for VectorEventHandlers<'_, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, const N: usize> HandlerStorage<'a> for VectorEventHandlers<'a, N> {
    type Cursor = usize;

    fn insert(&mut self, registration: Registration<'a>) -> Result<(), RegistrationError> {
        if self
            .slots
            .iter()
            .flatten()
            .any(|entry| entry.is(&registration))
        {
            return Ok(());
        }
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| slot.is_none())
            .ok_or(RegistrationError::NoSlotLeft)?;
        *slot = Some(registration);
        Ok(())
    }

    fn remove(&mut self, registration: &Registration<'a>) {
        for slot in self.slots.iter_mut() {
            if slot.is_some_and(|entry| entry.is(registration)) {
                *slot = None;
            }
        }
    }

    fn next_match(&self, cursor: &mut usize, target: &Target) -> Option<Registration<'a>> {
        while let Some(slot) = self.slots.get(*cursor) {
            *cursor += 1;
            if let Some(entry) = slot
                && target.matches(entry)
            {
                return Some(*entry);
            }
        }
        None
    }

    fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

#[derive(Clone, Copy)]
struct TreeEntry<'a> {
    registration: Registration<'a>,
    seq: u32,
}

impl TreeEntry<'_> {
    fn key(&self) -> TreeKey {
        TreeKey {
            mask: self.registration.mask,
            event: self.registration.event,
            seq: self.seq,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TreeKey {
    mask: u64,
    event: EventId,
    seq: u32,
}

/// Ordered-index storage with N registration slots
///
/// Registrations are kept sorted by mask, then event, then insertion order. For each distinct
/// mask the matching events form a bounded key interval found by binary search, so lookup cost
/// grows with the number of distinct masks rather than the number of registrations.
pub struct TreeEventHandlers<'a, const N: usize> {
    entries: heapless::Vec<TreeEntry<'a>, N>,
    next_seq: u32,
}

impl<const N: usize> TreeEventHandlers<'_, N> {
    pub const fn new() -> Self {
        Self {
            entries: heapless::Vec::new(),
            next_seq: 0,
        }
    }

    fn group(&self, mask: u64, event: EventId) -> core::ops::Range<usize> {
        let key = |entry: &TreeEntry<'_>| (entry.registration.mask, entry.registration.event);
        let start = self.entries.partition_point(|entry| key(entry) < (mask, event));
        let end = self.entries.partition_point(|entry| key(entry) <= (mask, event));
        start..end
    }
}

impl<const N: usize> Default for TreeEventHandlers<'_, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, const N: usize> HandlerStorage<'a> for TreeEventHandlers<'a, N> {
    /// Key of the last produced registration
    type Cursor = Option<TreeKey>;

    fn insert(&mut self, registration: Registration<'a>) -> Result<(), RegistrationError> {
        let group = self.group(registration.mask, registration.event);
        if self.entries[group.clone()]
            .iter()
            .any(|entry| entry.registration.is(&registration))
        {
            return Ok(());
        }
        let seq = self.next_seq;
        self.entries
            .insert(group.end, TreeEntry { registration, seq })
            .map_err(|_| RegistrationError::NoSlotLeft)?;
        self.next_seq = seq.wrapping_add(1);
        Ok(())
    }

    fn remove(&mut self, registration: &Registration<'a>) {
        let group = self.group(registration.mask, registration.event);
        let found = self.entries[group.clone()]
            .iter()
            .position(|entry| entry.registration.is(registration));
        if let Some(offset) = found {
            self.entries.remove(group.start + offset);
        }
    }

    fn next_match(
        &self,
        cursor: &mut Option<TreeKey>,
        target: &Target,
    ) -> Option<Registration<'a>> {
        let entries = self.entries.as_slice();
        let mut index = match cursor {
            Some(last) => entries.partition_point(|entry| entry.key() <= *last),
            None => 0,
        };

        while index < entries.len() {
            let mask = entries[index].registration.mask;
            let group_end = index
                + entries[index..].partition_point(|entry| entry.registration.mask == mask);
            let lowest = target.event & mask & !target.span;
            let highest = lowest | (mask & target.span);

            let group = &entries[index..group_end];
            let first = group.partition_point(|entry| entry.registration.event < lowest);
            let found = group[first..]
                .iter()
                .take_while(|entry| entry.registration.event <= highest)
                .find(|entry| target.matches(&entry.registration));
            if let Some(entry) = found {
                *cursor = Some(entry.key());
                return Some(entry.registration);
            }
            index = group_end;
        }

        if let Some(last) = entries.last() {
            *cursor = Some(last.key());
        }
        None
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Cursor over the registrations matching one report
///
/// [`EventIterator::begin`] binds the iterator to a report and discards any previous progress.
/// Registrations are produced by [`EventRegistry::next_entry`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EventIterator<C> {
    target: Option<Target>,
    cursor: C,
}

impl<C: Copy + Default> EventIterator<C> {
    pub fn new() -> Self {
        Self {
            target: None,
            cursor: C::default(),
        }
    }

    pub fn begin(&mut self, report: &EventReport) {
        self.target = Some(Target::new(report));
        self.cursor = C::default();
    }

    pub fn clear(&mut self) {
        self.target = None;
    }

    pub fn is_active(&self) -> bool {
        self.target.is_some()
    }
}

/// Registry of event handlers
pub struct EventRegistry<'a, M: RawMutex, S: HandlerStorage<'a>> {
    storage: Mutex<M, RefCell<S>>,
    _phantom: core::marker::PhantomData<&'a ()>,
}

impl<'a, M: RawMutex, S: HandlerStorage<'a>> EventRegistry<'a, M, S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage: Mutex::new(RefCell::new(storage)),
            _phantom: core::marker::PhantomData,
        }
    }

    /// Binds the handler to the events selected by `mask`.
    ///
    /// Registering an existing binding again has no effect.
    pub fn register(
        &self,
        event: EventId,
        mask: u64,
        handler: &'a dyn EventHandler<'a>,
    ) -> Result<(), RegistrationError> {
        let result = self.storage.lock(|storage| {
            storage
                .borrow_mut()
                .insert(Registration::new(event, mask, handler))
        });
        if result.is_err() {
            warn!("event registry: no slot left for {:?}/{:?}", event, mask);
        }
        result
    }

    /// Removes the exact binding. No-op if it is not present.
    pub fn unregister(&self, event: EventId, mask: u64, handler: &'a dyn EventHandler<'a>) {
        self.storage.lock(|storage| {
            storage
                .borrow_mut()
                .remove(&Registration::new(event, mask, handler))
        })
    }

    pub fn create_iterator(&self) -> EventIterator<S::Cursor> {
        EventIterator::new()
    }

    /// Produces the next registration matching the report the iterator was begun with.
    ///
    /// Returns `None` once exhausted or if the iterator was never begun.
    pub fn next_entry(&self, iterator: &mut EventIterator<S::Cursor>) -> Option<Registration<'a>> {
        let target = iterator.target?;
        let found = self
            .storage
            .lock(|storage| storage.borrow().next_match(&mut iterator.cursor, &target));
        if found.is_none() {
            iterator.clear();
        }
        found
    }

    /// Iterates over the registrations matching the report
    pub fn matches<'r>(&'r self, report: &EventReport) -> Matches<'r, 'a, M, S> {
        let mut iterator = self.create_iterator();
        iterator.begin(report);
        Matches {
            registry: self,
            iterator,
        }
    }

    pub fn len(&self) -> usize {
        self.storage.lock(|storage| storage.borrow().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<'a, M: RawMutex, S: HandlerStorage<'a> + Default> Default for EventRegistry<'a, M, S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

pub struct Matches<'r, 'a, M: RawMutex, S: HandlerStorage<'a>> {
    registry: &'r EventRegistry<'a, M, S>,
    iterator: EventIterator<S::Cursor>,
}

impl<'a, M: RawMutex, S: HandlerStorage<'a>> Iterator for Matches<'_, 'a, M, S> {
    type Item = Registration<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.registry.next_entry(&mut self.iterator)
    }
}
