//! # emlcb
//!
//! This library implements the event protocol of OpenLCB/NMRAnet \[1\] nodes on top of a
//! cooperative state-flow engine in no_std environments. All storage is sized at compile time;
//! no dynamic memory allocation is required.
//!
//! ## Architecture
//!
//! ```text
//!  ┌───────────┐   ┌────────────┐   ┌──────────────────┐
//!  │ Transport ├──►│ Dispatcher ├──►│ Iterator flow 1  ├──┐
//!  └───────────┘   └─────┬──────┘   ├──────────────────┤  │   ┌──────────┐
//!                        ├─────────►│ Iterator flow 2  ├──┼──►│   Call   │
//!                        │          ├──────────────────┤  │   │   pool   │
//!                        └─────────►│ Iterator flow 3  ├──┘   └────┬─────┘
//!                                   └────────┬─────────┘           ▼
//!                                            │              ┌─────────────┐
//!                                   ┌────────▼─────────┐    │ Caller flow │
//!                                   │  Event registry  │    └──────┬──────┘
//!                                   └──────────────────┘           ▼
//!                                                            ┌──────────┐
//!                                                            │ Handlers │
//!                                                            └──────────┘
//! ```
//! Components:
//! * _Executor_ runs tasks one step at a time in priority order. A parked task is woken by
//!   firing one of its [`executor::Notifier`]s.
//! * _State flow_ is a task written as an explicit state machine, see [`flow`].
//! * _Dispatcher_ receives messages from the transport through a [`emlcb_driver::link::Link`]
//!   and hands each one to every handler whose `(value, mask)` binding matches the MTI.
//! * _Iterator flow_ decodes the messages of one MTI category and walks the registry for
//!   matching event handlers.
//! * _Call pool_ bounds the number of pending handler calls.
//! * _Caller flow_ invokes handlers strictly one at a time.
//! * _Event registry_ stores `(event, mask, handler)` registrations. Two storage flavors trade
//!   lookup cost for memory: an ordered index and a linear slot array.
//!
//! [`event::EventService`] bundles the registry, the pool and the flows of one protocol
//! instance. It is constructed explicitly and started on an executor.
//!
//! ## Concurrency model
//!
//! Every component synchronizes through an `embassy_sync` raw mutex chosen by the user:
//! * _CriticalSectionRawMutex_ lets a transport push messages and fire notifiers from interrupt
//!   context.
//! * _NoopRawMutex_ or _ThreadModeRawMutex_ suit systems where the whole stack runs in one
//!   thread.
//!
//! Critical sections are short and bounded: notifiers always fire after the component lock is
//! released, and handlers never run under a lock.
//!
//! ## Limitations
//!
//! * Handler calls are serialized across the whole protocol instance.
//! * The no_std target supports single-CPU systems only (embassy_sync limitation).
//! * No timeouts; a handler that never completes stalls event dispatch.
//!
//! # References:
//!
//! * \[1\] OpenLCB Standard, Event Transport Protocol
//!   <https://openlcb.org/openlcb-and-lcc-documents/layout-command-control-lcc/>
#![no_std]

pub use emlcb_core as core;
pub use emlcb_driver::{link, message};

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod dispatch;
pub mod event;
pub mod executor;
pub mod flow;
pub mod pool;
#[allow(dead_code)]
mod utils;

/// Binding table has no free slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegistrationError {
    NoSlotLeft,
}
