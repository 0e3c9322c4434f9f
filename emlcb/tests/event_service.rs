use core::cell::{Cell, RefCell};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use emlcb::RegistrationError;
use emlcb::core::{
    EventId, EventState, Mti, NodeAlias, NodeHandle, NodeId, Priority, event_id_to_bytes,
};
use emlcb::dispatch::Dispatcher;
use emlcb::event::{
    EventHandler, EventReport, EventService, EventServiceConfig, HandlerStorage, ServiceError,
    TreeEventHandlers, VectorEventHandlers,
};
use emlcb::executor::{Executor, Notifier, SpawnError};
use emlcb::message::{Message, Payload};
use std::boxed::Box;
use std::vec::Vec;

type TestExecutor = Executor<'static, CriticalSectionRawMutex, 8>;
type TransportDispatcher = Dispatcher<'static, CriticalSectionRawMutex, Message, 4, 4>;
type Tree = TreeEventHandlers<'static, 8>;
type Vector = VectorEventHandlers<'static, 8>;

const SRC: NodeHandle = NodeHandle::new(
    NodeId::from_u64_truncating(0x0501_0101_1801),
    NodeAlias::from_u16_truncating(0x2A5),
);
const LOCAL: NodeHandle = NodeHandle::new(
    NodeId::from_u64_truncating(0x0501_0101_1802),
    NodeAlias::from_u16_truncating(0x5A2),
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    EventReport,
    IdentifyConsumer,
    IdentifyProducer,
    IdentifyGlobal,
    ConsumerIdentified,
    ProducerIdentified,
    ConsumerRangeIdentified,
    ProducerRangeIdentified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Call {
    handler: u8,
    entry: Entry,
    report: EventReport,
}

/// Calls seen by all recorders of a test, plus the in-call marker
#[derive(Default)]
struct Journal {
    calls: RefCell<Vec<Call>>,
    in_call: Cell<bool>,
}

impl Journal {
    fn handlers(&self) -> Vec<u8> {
        self.calls.borrow().iter().map(|call| call.handler).collect()
    }

    fn len(&self) -> usize {
        self.calls.borrow().len()
    }
}

/// Handler recording every call. A suspending recorder keeps the completion token until resumed.
struct Recorder {
    id: u8,
    journal: &'static Journal,
    suspend: bool,
    pending: RefCell<Option<Notifier<'static>>>,
}

impl Recorder {
    fn new(id: u8, journal: &'static Journal) -> &'static Self {
        Box::leak(Box::new(Self {
            id,
            journal,
            suspend: false,
            pending: RefCell::new(None),
        }))
    }

    fn suspending(id: u8, journal: &'static Journal) -> &'static Self {
        Box::leak(Box::new(Self {
            id,
            journal,
            suspend: true,
            pending: RefCell::new(None),
        }))
    }

    fn record(&self, entry: Entry, report: &EventReport, done: Notifier<'static>) {
        assert!(!self.journal.in_call.get(), "handler calls overlap");
        self.journal.calls.borrow_mut().push(Call {
            handler: self.id,
            entry,
            report: *report,
        });
        if self.suspend {
            self.journal.in_call.set(true);
            *self.pending.borrow_mut() = Some(done);
        } else {
            done.notify();
        }
    }

    fn is_suspended(&self) -> bool {
        self.pending.borrow().is_some()
    }

    fn resume(&self) {
        let done = self.pending.borrow_mut().take().unwrap();
        self.journal.in_call.set(false);
        done.notify();
    }
}

impl EventHandler<'static> for Recorder {
    fn handle_event_report(&self, report: &EventReport, done: Notifier<'static>) {
        self.record(Entry::EventReport, report, done);
    }

    fn handle_identify_consumer(&self, report: &EventReport, done: Notifier<'static>) {
        self.record(Entry::IdentifyConsumer, report, done);
    }

    fn handle_identify_producer(&self, report: &EventReport, done: Notifier<'static>) {
        self.record(Entry::IdentifyProducer, report, done);
    }

    fn handle_identify_global(&self, report: &EventReport, done: Notifier<'static>) {
        self.record(Entry::IdentifyGlobal, report, done);
    }

    fn handle_consumer_identified(&self, report: &EventReport, done: Notifier<'static>) {
        self.record(Entry::ConsumerIdentified, report, done);
    }

    fn handle_producer_identified(&self, report: &EventReport, done: Notifier<'static>) {
        self.record(Entry::ProducerIdentified, report, done);
    }

    fn handle_consumer_range_identified(&self, report: &EventReport, done: Notifier<'static>) {
        self.record(Entry::ConsumerRangeIdentified, report, done);
    }

    fn handle_producer_range_identified(&self, report: &EventReport, done: Notifier<'static>) {
        self.record(Entry::ProducerRangeIdentified, report, done);
    }
}

struct Stack<S: HandlerStorage<'static> + 'static, const N: usize> {
    executor: &'static TestExecutor,
    dispatcher: &'static TransportDispatcher,
    service: &'static EventService<'static, CriticalSectionRawMutex, S, N>,
    journal: &'static Journal,
}

impl<S: HandlerStorage<'static> + Default + 'static, const N: usize> Stack<S, N> {
    fn new() -> Self {
        let executor: &'static TestExecutor = Box::leak(Box::new(TestExecutor::new()));
        let dispatcher: &'static TransportDispatcher =
            Box::leak(Box::new(TransportDispatcher::new()));
        let service: &'static EventService<'static, CriticalSectionRawMutex, S, N> =
            Box::leak(Box::new(EventService::new()));
        executor.spawn(dispatcher, 0, Priority::High).unwrap();
        service
            .start(executor.spawner(), dispatcher, EventServiceConfig::default())
            .unwrap();
        executor.run_until_stalled();
        Self {
            executor,
            dispatcher,
            service,
            journal: Box::leak(Box::new(Journal::default())),
        }
    }

    fn send(&self, message: Message) {
        self.dispatcher.try_push(message).unwrap();
        self.executor.run_until_stalled();
    }
}

fn event_message(mti: Mti, event: EventId) -> Message {
    Message::new(
        mti,
        SRC,
        None,
        Payload::new(&event_id_to_bytes(event)).unwrap(),
    )
}

fn identify_message(mti: Mti, dst: Option<NodeHandle>) -> Message {
    Message::new(mti, SRC, dst, Payload::EMPTY)
}

#[test]
fn test_started_service_binds_three_categories() {
    let stack = Stack::<Tree, 2>::new();
    assert_eq!(stack.dispatcher.binding_count(), 3);
    assert_eq!(stack.executor.task_count(), 5);
    assert!(!stack.service.event_processing_pending());
}

fn check_event_report_end_to_end<S: HandlerStorage<'static> + Default + 'static>() {
    let stack = Stack::<S, 2>::new();
    let handler = Recorder::new(1, stack.journal);
    stack
        .service
        .register_handler(0x0102_0304_0506_0708, u64::MAX, handler)
        .unwrap();

    stack.send(event_message(Mti::EVENT_REPORT, 0x0102_0304_0506_0708));
    assert_eq!(
        *stack.journal.calls.borrow(),
        [Call {
            handler: 1,
            entry: Entry::EventReport,
            report: EventReport::single(0x0102_0304_0506_0708, SRC, None),
        }]
    );
    let report = stack.journal.calls.borrow()[0].report;
    assert_eq!(report.event, 0x0102_0304_0506_0708);
    assert_eq!(report.mask, 1);

    stack.send(event_message(Mti::EVENT_REPORT, 0x0102_0304_0506_0709));
    assert_eq!(stack.journal.len(), 1);
    assert!(!stack.service.event_processing_pending());
}

#[test]
fn test_tree_event_report_end_to_end() {
    check_event_report_end_to_end::<Tree>();
}

#[test]
fn test_vector_event_report_end_to_end() {
    check_event_report_end_to_end::<Vector>();
}

#[test]
fn test_malformed_payload_is_dropped() {
    let stack = Stack::<Tree, 2>::new();
    let handler = Recorder::new(1, stack.journal);
    stack.service.register_handler(0, 0, handler).unwrap();

    let message = Message::new(
        Mti::EVENT_REPORT,
        SRC,
        None,
        Payload::new(&[1, 2, 3, 4]).unwrap(),
    );
    stack.send(message);
    assert_eq!(stack.journal.len(), 0);

    // The flow keeps serving after the drop
    stack.send(event_message(Mti::EVENT_REPORT, 5));
    assert_eq!(stack.journal.handlers(), [1]);
}

#[test]
#[should_panic(expected = "unexpected MTI")]
fn test_unexpected_mti_is_fatal() {
    let stack = Stack::<Tree, 2>::new();
    let handler = Recorder::new(1, stack.journal);
    stack.service.register_handler(0, 0, handler).unwrap();

    // Passes the event category binding but names no event message
    stack.send(event_message(Mti::new(0x0004), 1));
}

#[test]
fn test_unexpected_mti_with_short_payload_is_dropped() {
    let stack = Stack::<Tree, 2>::new();
    let handler = Recorder::new(1, stack.journal);
    stack.service.register_handler(0, 0, handler).unwrap();

    let message = Message::new(
        Mti::new(0x0004),
        SRC,
        None,
        Payload::new(&[1, 2, 3, 4]).unwrap(),
    );
    stack.send(message);
    assert_eq!(stack.journal.len(), 0);
    assert!(!stack.service.event_processing_pending());

    stack.send(event_message(Mti::EVENT_REPORT, 5));
    assert_eq!(stack.journal.handlers(), [1]);
}

#[test]
fn test_unregistered_handler_is_not_called() {
    let stack = Stack::<Tree, 2>::new();
    let handler = Recorder::new(1, stack.journal);
    stack.service.register_handler(42, u64::MAX, handler).unwrap();
    stack.service.unregister_handler(42, u64::MAX, handler);
    // Absent binding
    stack.service.unregister_handler(43, u64::MAX, handler);

    stack.send(event_message(Mti::EVENT_REPORT, 42));
    assert_eq!(stack.journal.len(), 0);
}

#[test]
fn test_overlapping_handlers_see_same_report() {
    let stack = Stack::<Tree, 2>::new();
    let exact = Recorder::new(1, stack.journal);
    let block = Recorder::new(2, stack.journal);
    stack.service.register_handler(0x0A00_0000_0000_0042, u64::MAX, exact).unwrap();
    stack
        .service
        .register_handler(0x0A00_0000_0000_0000, 0xFFFF_FFFF_FFFF_FF00, block)
        .unwrap();

    stack.send(event_message(Mti::CONSUMER_IDENTIFIED_INVALID, 0x0A00_0000_0000_0042));

    let calls = stack.journal.calls.borrow();
    let mut handlers: Vec<u8> = calls.iter().map(|call| call.handler).collect();
    handlers.sort();
    assert_eq!(handlers, [1, 2]);
    assert_eq!(calls[0].report, calls[1].report);
    assert_eq!(calls[0].entry, Entry::ConsumerIdentified);
    assert_eq!(calls[0].report.state, Some(EventState::Invalid));
    assert_eq!(calls[0].report.src, SRC);
}

#[test]
fn test_handler_calls_are_serialized() {
    let stack = Stack::<Tree, 4>::new();
    let slow = Recorder::suspending(1, stack.journal);
    let fast = Recorder::new(2, stack.journal);
    stack.service.register_handler(7, u64::MAX, slow).unwrap();
    stack.service.register_handler(7, u64::MAX, fast).unwrap();
    stack.service.register_handler(8, u64::MAX, fast).unwrap();

    stack.send(event_message(Mti::EVENT_REPORT, 7));
    stack.send(event_message(Mti::EVENT_REPORT, 8));
    stack.send(identify_message(Mti::EVENTS_IDENTIFY_GLOBAL, None));

    // Whichever handler runs first, nothing runs while the slow one holds its token
    while slow.is_suspended() {
        let seen = stack.journal.len();
        stack.executor.run_until_stalled();
        assert_eq!(stack.journal.len(), seen);
        assert!(stack.service.event_processing_pending());
        slow.resume();
        stack.executor.run_until_stalled();
    }

    let calls = stack.journal.calls.borrow();
    let count = |handler: u8, entry: Entry| {
        calls
            .iter()
            .filter(|call| call.handler == handler && call.entry == entry)
            .count()
    };
    assert_eq!(count(1, Entry::EventReport), 1);
    assert_eq!(count(2, Entry::EventReport), 2);
    assert_eq!(count(1, Entry::IdentifyGlobal), 1);
    assert_eq!(count(2, Entry::IdentifyGlobal), 2);
    drop(calls);
    assert!(!stack.service.event_processing_pending());
}

#[test]
fn test_range_identified() {
    let stack = Stack::<Tree, 2>::new();
    let inside = Recorder::new(1, stack.journal);
    let outside = Recorder::new(2, stack.journal);
    stack
        .service
        .register_handler(0x0505_0000_0000_0003, u64::MAX, inside)
        .unwrap();
    stack
        .service
        .register_handler(0x0505_0000_0000_0013, u64::MAX, outside)
        .unwrap();

    // Odd marker: 0x0505_0000_0000_0000..=0x0505_0000_0000_000F
    stack.send(event_message(Mti::PRODUCER_IDENTIFIED_RANGE, 0x0505_0000_0000_000F));
    // Even marker: 0x0505_0000_0000_0010..=0x0505_0000_0000_001F
    stack.send(event_message(Mti::CONSUMER_IDENTIFIED_RANGE, 0x0505_0000_0000_0010));
    // Range of 2^48 events
    stack.send(event_message(Mti::CONSUMER_IDENTIFIED_RANGE, 0x0505_0000_0000_0000));

    let calls = stack.journal.calls.borrow();
    assert_eq!(
        calls.iter().map(|call| call.handler).collect::<Vec<_>>(),
        [1, 2, 1, 2]
    );
    assert_eq!(calls[0].entry, Entry::ProducerRangeIdentified);
    assert_eq!(calls[0].report.event, 0x0505_0000_0000_0000);
    assert_eq!(calls[0].report.mask, 0xF);
    assert_eq!(calls[1].entry, Entry::ConsumerRangeIdentified);
    assert_eq!(calls[1].report.event, 0x0505_0000_0000_0010);
    assert_eq!(calls[1].report.mask, 0xF);
    assert_eq!(calls[2].report.mask, 0xFFFF_FFFF_FFFF);
    assert_eq!(calls[2].report, calls[3].report);
}

#[test]
fn test_identify_messages() {
    let stack = Stack::<Tree, 2>::new();
    let handler = Recorder::new(1, stack.journal);
    stack.service.register_handler(9, u64::MAX, handler).unwrap();

    stack.send(event_message(Mti::CONSUMER_IDENTIFY, 9));
    stack.send(event_message(Mti::PRODUCER_IDENTIFY, 9));
    stack.send(event_message(Mti::PRODUCER_IDENTIFIED_VALID, 9));
    let entries: Vec<Entry> = stack.journal.calls.borrow().iter().map(|call| call.entry).collect();
    assert_eq!(
        entries,
        [
            Entry::IdentifyConsumer,
            Entry::IdentifyProducer,
            Entry::ProducerIdentified
        ]
    );
    assert_eq!(
        stack.journal.calls.borrow()[2].report.state,
        Some(EventState::Valid)
    );
}

#[test]
fn test_identify_events() {
    let stack = Stack::<Tree, 2>::new();
    let first = Recorder::new(1, stack.journal);
    let second = Recorder::new(2, stack.journal);
    stack.service.register_handler(1, u64::MAX, first).unwrap();
    stack.service.register_handler(0x8000_0000_0000_0000, u64::MAX, second).unwrap();

    // Addressed without a destination is a protocol violation
    stack.send(identify_message(Mti::EVENTS_IDENTIFY_ADDRESSED, None));
    assert_eq!(stack.journal.len(), 0);

    stack.send(identify_message(Mti::EVENTS_IDENTIFY_ADDRESSED, Some(LOCAL)));
    stack.send(identify_message(Mti::EVENTS_IDENTIFY_GLOBAL, None));

    let calls = stack.journal.calls.borrow();
    assert_eq!(calls.len(), 4);
    assert!(calls.iter().all(|call| call.entry == Entry::IdentifyGlobal));
    assert!(calls.iter().all(|call| call.report.mask == u64::MAX));
    assert_eq!(calls[0].report.dst, Some(LOCAL));
    assert_eq!(calls[3].report.dst, None);
}

#[test]
fn test_single_call_buffer() {
    let stack = Stack::<Vector, 1>::new();
    let slow = Recorder::suspending(1, stack.journal);
    let fast = Recorder::new(2, stack.journal);
    stack.service.register_handler(3, u64::MAX, slow).unwrap();
    stack.service.register_handler(0, 0, fast).unwrap();

    stack.send(event_message(Mti::EVENT_REPORT, 3));
    stack.send(identify_message(Mti::EVENTS_IDENTIFY_GLOBAL, None));
    stack.send(event_message(Mti::EVENT_REPORT, 4));

    let mut rounds = 0;
    while slow.is_suspended() {
        slow.resume();
        stack.executor.run_until_stalled();
        rounds += 1;
        assert!(rounds < 8);
    }

    // Report 3 reaches both, global identify both, report 4 only the catch-all
    let mut handlers = stack.journal.handlers();
    handlers.sort();
    assert_eq!(handlers, [1, 1, 2, 2, 2]);
    assert!(!stack.service.event_processing_pending());
}

#[test]
fn test_handler_registered_during_dispatch() {
    let stack = Stack::<Tree, 2>::new();
    let slow = Recorder::suspending(1, stack.journal);
    let late = Recorder::new(2, stack.journal);
    stack.service.register_handler(11, u64::MAX, slow).unwrap();

    stack.send(event_message(Mti::EVENT_REPORT, 11));
    assert!(slow.is_suspended());
    stack.service.register_handler(11, u64::MAX, late).unwrap();
    slow.resume();
    stack.executor.run_until_stalled();

    // The late handler sees at most the current report and surely the next one
    stack.send(event_message(Mti::EVENT_REPORT, 11));
    if slow.is_suspended() {
        slow.resume();
        stack.executor.run_until_stalled();
    }
    let calls = stack.journal.handlers();
    assert_eq!(calls.iter().filter(|&&id| id == 1).count(), 2);
    assert!(calls.iter().filter(|&&id| id == 2).count() >= 1);
}

#[test]
fn test_identical_services_are_independent() {
    let first = Stack::<Tree, 2>::new();
    let second = Stack::<Tree, 2>::new();
    let handler = Recorder::new(1, first.journal);
    first.service.register_handler(1, u64::MAX, handler).unwrap();

    second.send(event_message(Mti::EVENT_REPORT, 1));
    assert_eq!(first.journal.len(), 0);
    first.send(event_message(Mti::EVENT_REPORT, 1));
    assert_eq!(first.journal.len(), 1);
}

#[test]
fn test_start_spawns_all_flows_before_binding() {
    // One slot short of the caller and three iterators
    let executor: &'static Executor<'static, CriticalSectionRawMutex, 3> =
        Box::leak(Box::new(Executor::new()));
    let dispatcher: &'static TransportDispatcher = Box::leak(Box::new(TransportDispatcher::new()));
    let service: &'static EventService<'static, CriticalSectionRawMutex, Tree, 2> =
        Box::leak(Box::new(EventService::new()));

    assert_eq!(
        service.start(executor.spawner(), dispatcher, EventServiceConfig::default()),
        Err(ServiceError::Spawn(SpawnError::NoTaskSlotLeft))
    );
    assert_eq!(dispatcher.binding_count(), 0);
}

#[test]
fn test_start_removes_bindings_on_failure() {
    let executor: &'static TestExecutor = Box::leak(Box::new(TestExecutor::new()));
    // Room for two of the three categories
    let dispatcher: &'static Dispatcher<'static, CriticalSectionRawMutex, Message, 2, 4> =
        Box::leak(Box::new(Dispatcher::new()));
    let service: &'static EventService<'static, CriticalSectionRawMutex, Tree, 2> =
        Box::leak(Box::new(EventService::new()));

    assert_eq!(
        service.start(executor.spawner(), dispatcher, EventServiceConfig::default()),
        Err(ServiceError::Registration(RegistrationError::NoSlotLeft))
    );
    assert_eq!(dispatcher.binding_count(), 0);
}
