use crate::core::{EventId, EventState, NodeHandle};
use crate::executor::Notifier;

/// Mask of a report naming a single event
pub const SINGLE_EVENT_MASK: u64 = 1;
/// Mask of a report addressing every event
pub const ALL_EVENTS_MASK: u64 = u64::MAX;

/// Decodes an identify-range marker into `(event, mask)`.
///
/// The lowest run of equal bits of the marker spans the range: an odd marker ends with a run of
/// ones, an even marker with a run of zeros. `mask` covers that run minus its top bit; `event`
/// is the marker with the masked bits cleared.
pub const fn decode_range(marker: EventId) -> (EventId, u64) {
    let mask = if marker & 1 == 1 {
        (marker ^ marker.wrapping_add(1)) >> 1
    } else {
        (marker ^ marker.wrapping_sub(1)) >> 1
    };
    (marker & !mask, mask)
}

/// Registration `(event, mask)` against a reported `target` with `span` bits left open
pub(crate) const fn span_matches(target: EventId, span: u64, event: EventId, mask: u64) -> bool {
    (target ^ event) & mask & !span == 0
}

/// Per-dispatch view of an inbound event-protocol message
///
/// `mask` carries the protocol value of the report: [`SINGLE_EVENT_MASK`] for a single event,
/// the decoded range mask for range-identified messages and [`ALL_EVENTS_MASK`] for messages
/// without an event identifier. Matching against registrations relies on the span of event bits
/// the report leaves open, see [`EventReport::span`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EventReport {
    pub event: EventId,
    pub mask: u64,
    pub src: NodeHandle,
    pub dst: Option<NodeHandle>,
    pub state: Option<EventState>,
    span: u64,
}

impl EventReport {
    /// Report naming exactly one event
    pub const fn single(event: EventId, src: NodeHandle, dst: Option<NodeHandle>) -> Self {
        Self {
            event,
            mask: SINGLE_EVENT_MASK,
            src,
            dst,
            state: None,
            span: 0,
        }
    }

    /// Report covering the range encoded by an identify-range marker
    pub const fn range(marker: EventId, src: NodeHandle, dst: Option<NodeHandle>) -> Self {
        let (event, mask) = decode_range(marker);
        Self {
            event,
            mask,
            src,
            dst,
            state: None,
            span: mask,
        }
    }

    /// Report without an event identifier, addressing every registration
    pub const fn all(src: NodeHandle, dst: Option<NodeHandle>) -> Self {
        Self {
            event: 0,
            mask: ALL_EVENTS_MASK,
            src,
            dst,
            state: None,
            span: u64::MAX,
        }
    }

    pub const fn with_state(mut self, state: EventState) -> Self {
        self.state = Some(state);
        self
    }

    /// Event bits the report leaves open: zero for a single event, the range mask for a range
    /// and all ones for a report without an event
    pub const fn span(&self) -> u64 {
        self.span
    }

    /// Checks a registration against the report.
    ///
    /// The registration mask selects the significant bits of the registered event. They must
    /// agree with the report event except where the report span leaves them open.
    pub const fn matches(&self, event: EventId, mask: u64) -> bool {
        span_matches(self.event, self.span, event, mask)
    }
}

impl Default for EventReport {
    fn default() -> Self {
        Self::all(NodeHandle::UNKNOWN, None)
    }
}

/// Event protocol participant
///
/// Every entry point receives the report and a completion token. The handler must fire the
/// token exactly once, either before returning or later from its own flow; no other handler
/// runs in between. The report reference is valid for the call only but its value stays
/// unchanged until the token fires.
///
/// Default implementations complete immediately.
pub trait EventHandler<'a> {
    fn handle_event_report(&self, report: &EventReport, done: Notifier<'a>) {
        let _ = report;
        done.notify();
    }

    fn handle_identify_consumer(&self, report: &EventReport, done: Notifier<'a>) {
        let _ = report;
        done.notify();
    }

    fn handle_identify_producer(&self, report: &EventReport, done: Notifier<'a>) {
        let _ = report;
        done.notify();
    }

    fn handle_identify_global(&self, report: &EventReport, done: Notifier<'a>) {
        let _ = report;
        done.notify();
    }

    fn handle_consumer_identified(&self, report: &EventReport, done: Notifier<'a>) {
        let _ = report;
        done.notify();
    }

    fn handle_producer_identified(&self, report: &EventReport, done: Notifier<'a>) {
        let _ = report;
        done.notify();
    }

    fn handle_consumer_range_identified(&self, report: &EventReport, done: Notifier<'a>) {
        let _ = report;
        done.notify();
    }

    fn handle_producer_range_identified(&self, report: &EventReport, done: Notifier<'a>) {
        let _ = report;
        done.notify();
    }
}

/// Selector of an [`EventHandler`] method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EntryPoint {
    EventReport,
    IdentifyConsumer,
    IdentifyProducer,
    IdentifyGlobal,
    ConsumerIdentified,
    ProducerIdentified,
    ConsumerRangeIdentified,
    ProducerRangeIdentified,
}

impl EntryPoint {
    pub fn invoke<'a>(
        self,
        handler: &dyn EventHandler<'a>,
        report: &EventReport,
        done: Notifier<'a>,
    ) {
        match self {
            EntryPoint::EventReport => handler.handle_event_report(report, done),
            EntryPoint::IdentifyConsumer => handler.handle_identify_consumer(report, done),
            EntryPoint::IdentifyProducer => handler.handle_identify_producer(report, done),
            EntryPoint::IdentifyGlobal => handler.handle_identify_global(report, done),
            EntryPoint::ConsumerIdentified => handler.handle_consumer_identified(report, done),
            EntryPoint::ProducerIdentified => handler.handle_producer_identified(report, done),
            EntryPoint::ConsumerRangeIdentified => {
                handler.handle_consumer_range_identified(report, done)
            }
            EntryPoint::ProducerRangeIdentified => {
                handler.handle_producer_range_identified(report, done)
            }
        }
    }
}
