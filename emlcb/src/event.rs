//! OpenLCB event protocol
//!
//! Inbound event-protocol messages reach the [`EventService`] through the transport dispatcher.
//! Each message category has an iterator flow that decodes the message into an [`EventReport`]
//! and walks the [`EventRegistry`] for matching handlers. Matches are handed over as pooled
//! dispatch calls to a single caller flow, so exactly one [`EventHandler`] call is in progress
//! at a time and every handler observes a stable report.
//!
//! A registration `(event, mask)` matches a report when all event bits selected by `mask` agree
//! with the report event, ignoring the bits the report leaves open: none for a single event, the
//! range bits for a range-identified report and all of them for identify-events messages.

pub mod caller_flow;
pub mod iterator_flow;
pub mod registry;
mod report;
pub mod service;

pub use caller_flow::{CallPool, DispatchCall, EventCallerFlow};
pub use iterator_flow::{DecodeError, EventIteratorFlow, decode_message};
pub use registry::{
    EventIterator, EventRegistry, HandlerStorage, Registration, TreeEventHandlers,
    VectorEventHandlers,
};
pub use report::{
    ALL_EVENTS_MASK, EntryPoint, EventHandler, EventReport, SINGLE_EVENT_MASK, decode_range,
};
pub use service::{
    EventService, EventServiceConfig, ServiceError, TreeEventService, VectorEventService,
};
