use core::cell::{Cell, RefCell};
use core::task::Poll;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::core::{EventState, Mti, event_id_from_bytes};
use crate::dispatch::MessageHandler;
use crate::event::caller_flow::{CallPool, DispatchCall, EventCallerFlow};
use crate::event::registry::{EventIterator, EventRegistry, HandlerStorage};
use crate::event::{EntryPoint, EventHandler, EventReport};
use crate::executor::{Notifier, Status, TaskContext};
use crate::flow::{self, Action};
use crate::message::Message;
use crate::utils::{Trigger, WaitQueue};

/// Inbound messages buffered per iterator flow
pub const INBOX_DEPTH: usize = 2;

/// Recoverable event message defects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecodeError {
    /// Event-carrying message without an 8-byte payload
    InvalidPayloadLength(usize),
    /// Addressed identify-events message without a destination
    MissingDestination,
}

/// Decodes an inbound event-protocol message into the handler entry point and the report.
///
/// Returns `Ok(None)` for an MTI outside the event protocol.
pub fn decode_message(message: &Message) -> Result<Option<(EntryPoint, EventReport)>, DecodeError> {
    let src = message.src;
    let dst = message.dst;
    let mti = message.mti;

    let event = if mti.carries_event() {
        let event = event_id_from_bytes(&message.payload)
            .ok_or(DecodeError::InvalidPayloadLength(message.payload.len()))?;
        Some(event)
    } else {
        None
    };
    let single = || EventReport::single(event.unwrap_or_default(), src, dst);
    let range = || EventReport::range(event.unwrap_or_default(), src, dst);

    let decoded = match mti {
        Mti::EVENT_REPORT => (EntryPoint::EventReport, single()),
        Mti::CONSUMER_IDENTIFY => (EntryPoint::IdentifyConsumer, single()),
        Mti::PRODUCER_IDENTIFY => (EntryPoint::IdentifyProducer, single()),
        Mti::CONSUMER_IDENTIFIED_RANGE => (EntryPoint::ConsumerRangeIdentified, range()),
        Mti::PRODUCER_IDENTIFIED_RANGE => (EntryPoint::ProducerRangeIdentified, range()),
        Mti::CONSUMER_IDENTIFIED_UNKNOWN
        | Mti::CONSUMER_IDENTIFIED_VALID
        | Mti::CONSUMER_IDENTIFIED_INVALID
        | Mti::CONSUMER_IDENTIFIED_RESERVED => (
            EntryPoint::ConsumerIdentified,
            single().with_state(identified_state(mti)),
        ),
        Mti::PRODUCER_IDENTIFIED_UNKNOWN
        | Mti::PRODUCER_IDENTIFIED_VALID
        | Mti::PRODUCER_IDENTIFIED_INVALID
        | Mti::PRODUCER_IDENTIFIED_RESERVED => (
            EntryPoint::ProducerIdentified,
            single().with_state(identified_state(mti)),
        ),
        Mti::EVENTS_IDENTIFY_ADDRESSED if dst.is_none() => {
            return Err(DecodeError::MissingDestination);
        }
        Mti::EVENTS_IDENTIFY_ADDRESSED | Mti::EVENTS_IDENTIFY_GLOBAL => {
            (EntryPoint::IdentifyGlobal, EventReport::all(src, dst))
        }
        _ => return Ok(None),
    };
    Ok(Some(decoded))
}

/// The two low MTI bits of identified messages encode the state
fn identified_state(mti: Mti) -> EventState {
    match mti.into_u16() & 0x3 {
        0 => EventState::Valid,
        1 => EventState::Invalid,
        2 => EventState::Reserved,
        _ => EventState::Unknown,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IteratorState {
    Entry,
    IterateNext,
    Allocate,
}

struct Inbox<'a> {
    messages: heapless::Deque<Message, INBOX_DEPTH>,
    trigger: Trigger<'a>,
    // Dispatchers waiting for room
    pushers: WaitQueue<'a, 2>,
}

/// Per-category event message flow
///
/// Takes messages of one MTI category from the transport dispatcher, decodes each into the
/// shared report and walks the registry, handing every matching handler to the caller flow.
/// The next handler is looked up only after the previous call completed.
pub struct EventIteratorFlow<'a, M: RawMutex, C> {
    mti: Mti,
    mti_mask: Mti,
    state: Cell<IteratorState>,
    inbox: Mutex<M, RefCell<Inbox<'a>>>,
    report: RefCell<EventReport>,
    entry: Cell<EntryPoint>,
    iterator: RefCell<EventIterator<C>>,
    selected: Cell<Option<&'a dyn EventHandler<'a>>>,
}

impl<'a, M: RawMutex, C: Copy + Default> EventIteratorFlow<'a, M, C> {
    pub fn new(mti: Mti, mti_mask: Mti) -> Self {
        Self {
            mti,
            mti_mask,
            state: Cell::new(IteratorState::Entry),
            inbox: Mutex::new(RefCell::new(Inbox {
                messages: heapless::Deque::new(),
                trigger: Trigger::new(),
                pushers: WaitQueue::new(),
            })),
            report: RefCell::new(EventReport::default()),
            entry: Cell::new(EntryPoint::EventReport),
            iterator: RefCell::new(EventIterator::new()),
            selected: Cell::new(None),
        }
    }

    /// MTI value and mask this flow is registered for
    pub fn binding(&self) -> (Mti, Mti) {
        (self.mti, self.mti_mask)
    }

    /// True while a message is queued or being processed
    pub fn is_busy(&self) -> bool {
        self.state.get() != IteratorState::Entry
            || self
                .inbox
                .lock(|inbox| !inbox.borrow().messages.is_empty())
    }

    pub fn step<S, const N: usize>(
        &'a self,
        registry: &'a EventRegistry<'a, M, S>,
        pool: &'a CallPool<'a, M, N>,
        caller: &'a EventCallerFlow<'a, M, N>,
        cx: &mut TaskContext<'a>,
    ) -> Status
    where
        S: HandlerStorage<'a, Cursor = C>,
    {
        flow::drive(&self.state, |state| match state {
            IteratorState::Entry => self.entry(cx),
            IteratorState::IterateNext => self.iterate_next(registry),
            IteratorState::Allocate => self.allocate(pool, caller, cx),
        })
    }

    fn entry(&'a self, cx: &mut TaskContext<'a>) -> Action<IteratorState> {
        let (message, pusher) = self.inbox.lock(|inbox| {
            let mut inbox = inbox.borrow_mut();
            let message = inbox.messages.pop_front();
            if message.is_none() {
                inbox.trigger.register(cx.notifier());
            }
            let pusher = message.and_then(|_| inbox.pushers.take_one());
            (message, pusher)
        });
        if let Some(pusher) = pusher {
            pusher.notify();
        }
        let Some(message) = message else {
            return Action::Wait(IteratorState::Entry);
        };

        match decode_message(&message) {
            Ok(Some((entry, report))) => {
                trace!("event iterator: {:?} for {:?}", entry, report.event);
                *self.report.borrow_mut() = report;
                self.entry.set(entry);
                self.iterator.borrow_mut().begin(&report);
                Action::Call(IteratorState::IterateNext)
            }
            Ok(None) => panic!(
                "event iterator: unexpected MTI {:?} at flow {:?}/{:?}",
                message.mti, self.mti, self.mti_mask
            ),
            Err(DecodeError::InvalidPayloadLength(length)) => {
                info!(
                    "event iterator: invalid event message, payload length {}",
                    length
                );
                Action::Call(IteratorState::Entry)
            }
            Err(DecodeError::MissingDestination) => {
                info!("event iterator: addressed identify events without destination");
                Action::Call(IteratorState::Entry)
            }
        }
    }

    fn iterate_next<S>(&'a self, registry: &'a EventRegistry<'a, M, S>) -> Action<IteratorState>
    where
        S: HandlerStorage<'a, Cursor = C>,
    {
        match registry.next_entry(&mut self.iterator.borrow_mut()) {
            Some(registration) => {
                self.selected.set(Some(registration.handler));
                Action::Call(IteratorState::Allocate)
            }
            None => Action::Call(IteratorState::Entry),
        }
    }

    fn allocate<const N: usize>(
        &'a self,
        pool: &'a CallPool<'a, M, N>,
        caller: &'a EventCallerFlow<'a, M, N>,
        cx: &mut TaskContext<'a>,
    ) -> Action<IteratorState> {
        let call = DispatchCall {
            report: &self.report,
            handler: unwrap!(self.selected.get()),
            entry: self.entry.get(),
        };
        match pool.acquire(call, cx.notifier()) {
            Ok(handle) => {
                pool.set_done(&handle, cx.notifier());
                caller.send(handle);
                self.selected.set(None);
                Action::Wait(IteratorState::IterateNext)
            }
            Err(_) => Action::Wait(IteratorState::Allocate),
        }
    }
}

impl<'a, M: RawMutex, C> MessageHandler<'a, Message> for EventIteratorFlow<'a, M, C> {
    fn poll_ready(&self, waiter: Notifier<'a>) -> Poll<()> {
        let (poll, evicted) = self.inbox.lock(|inbox| {
            let mut inbox = inbox.borrow_mut();
            if inbox.messages.is_full() {
                (Poll::Pending, inbox.pushers.register(waiter))
            } else {
                (Poll::Ready(()), None)
            }
        });
        if let Some(evicted) = evicted {
            evicted.notify();
        }
        poll
    }

    fn handle_message(&self, message: &Message, done: Notifier<'a>) {
        let trigger = self.inbox.lock(|inbox| {
            let mut inbox = inbox.borrow_mut();
            unwrap!(inbox.messages.push_back(*message));
            inbox.trigger.take()
        });
        if let Some(trigger) = trigger {
            trigger.notify();
        }
        done.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{NodeAlias, NodeHandle, NodeId, event_id_to_bytes};
    use crate::message::Payload;

    const SRC: NodeHandle = NodeHandle::new(
        NodeId::from_u64_truncating(0x0501_0101_1801),
        NodeAlias::from_u16_truncating(0x123),
    );
    const DST: NodeHandle = NodeHandle::new(
        NodeId::from_u64_truncating(0x0501_0101_1802),
        NodeAlias::from_u16_truncating(0x456),
    );

    fn message(mti: Mti, dst: Option<NodeHandle>, payload: &[u8]) -> Message {
        Message::new(mti, SRC, dst, Payload::new(payload).unwrap())
    }

    fn event_message(mti: Mti, event: u64) -> Message {
        message(mti, None, &event_id_to_bytes(event))
    }

    #[test]
    fn test_decode_event_report() {
        let (entry, report) = decode_message(&event_message(Mti::EVENT_REPORT, 0x0102_0304_0506_0708))
            .unwrap()
            .unwrap();
        assert_eq!(entry, EntryPoint::EventReport);
        assert_eq!(report.event, 0x0102_0304_0506_0708);
        assert_eq!(report.mask, 1);
        assert_eq!(report.src, SRC);
        assert_eq!(report.dst, None);
        assert_eq!(report.state, None);
    }

    #[test]
    fn test_decode_identified_states() {
        for (mti, entry, state) in [
            (Mti::CONSUMER_IDENTIFIED_VALID, EntryPoint::ConsumerIdentified, EventState::Valid),
            (Mti::CONSUMER_IDENTIFIED_INVALID, EntryPoint::ConsumerIdentified, EventState::Invalid),
            (Mti::CONSUMER_IDENTIFIED_RESERVED, EntryPoint::ConsumerIdentified, EventState::Reserved),
            (Mti::CONSUMER_IDENTIFIED_UNKNOWN, EntryPoint::ConsumerIdentified, EventState::Unknown),
            (Mti::PRODUCER_IDENTIFIED_VALID, EntryPoint::ProducerIdentified, EventState::Valid),
            (Mti::PRODUCER_IDENTIFIED_INVALID, EntryPoint::ProducerIdentified, EventState::Invalid),
            (Mti::PRODUCER_IDENTIFIED_RESERVED, EntryPoint::ProducerIdentified, EventState::Reserved),
            (Mti::PRODUCER_IDENTIFIED_UNKNOWN, EntryPoint::ProducerIdentified, EventState::Unknown),
        ] {
            let decoded = decode_message(&event_message(mti, 42)).unwrap().unwrap();
            assert_eq!(decoded.0, entry);
            assert_eq!(decoded.1.state, Some(state));
            assert_eq!(decoded.1.event, 42);
        }
    }

    #[test]
    fn test_decode_ranges() {
        let (entry, report) =
            decode_message(&event_message(Mti::CONSUMER_IDENTIFIED_RANGE, 0x0505_0000_0000_000F))
                .unwrap()
                .unwrap();
        assert_eq!(entry, EntryPoint::ConsumerRangeIdentified);
        assert_eq!((report.event, report.mask), (0x0505_0000_0000_0000, 0xF));

        let (entry, report) =
            decode_message(&event_message(Mti::PRODUCER_IDENTIFIED_RANGE, 0x0505_0000_0000_0010))
                .unwrap()
                .unwrap();
        assert_eq!(entry, EntryPoint::ProducerRangeIdentified);
        assert_eq!((report.event, report.mask), (0x0505_0000_0000_0010, 0xF));
    }

    #[test]
    fn test_decode_identify() {
        let (entry, _) = decode_message(&event_message(Mti::CONSUMER_IDENTIFY, 1))
            .unwrap()
            .unwrap();
        assert_eq!(entry, EntryPoint::IdentifyConsumer);
        let (entry, _) = decode_message(&event_message(Mti::PRODUCER_IDENTIFY, 1))
            .unwrap()
            .unwrap();
        assert_eq!(entry, EntryPoint::IdentifyProducer);

        let (entry, report) = decode_message(&message(Mti::EVENTS_IDENTIFY_GLOBAL, None, &[]))
            .unwrap()
            .unwrap();
        assert_eq!(entry, EntryPoint::IdentifyGlobal);
        assert_eq!((report.event, report.mask), (0, u64::MAX));

        let (entry, report) =
            decode_message(&message(Mti::EVENTS_IDENTIFY_ADDRESSED, Some(DST), &[]))
                .unwrap()
                .unwrap();
        assert_eq!(entry, EntryPoint::IdentifyGlobal);
        assert_eq!(report.dst, Some(DST));
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(
            decode_message(&message(Mti::EVENT_REPORT, None, &[1, 2, 3, 4])),
            Err(DecodeError::InvalidPayloadLength(4))
        );
        assert_eq!(
            decode_message(&message(Mti::PRODUCER_IDENTIFY, None, &[0; 9])),
            Err(DecodeError::InvalidPayloadLength(9))
        );
        assert_eq!(
            decode_message(&message(Mti::EVENTS_IDENTIFY_ADDRESSED, None, &[])),
            Err(DecodeError::MissingDestination)
        );
        assert_eq!(
            decode_message(&message(Mti::new(0x0490), None, &[])),
            Ok(None)
        );
    }
}
