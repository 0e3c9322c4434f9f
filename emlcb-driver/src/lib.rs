//! emlcb driver interface
//!
//! The crate provides an interface between an OpenLCB transport driver and the emlcb stack.
//! Limited scope facilitates compatibility across versions.
//! Driver crates should depend on this crate. emlcb stack users should depend on
//! the `emlcb` crate instead.
//!
//! A transport (CAN frame reassembly, TCP/GridConnect parsing, a loop-back interface, ...)
//! turns wire data into complete [`message::Message`] values and pushes them into the stack
//! through the `Rx` handle of a [`link::Link`].
//!
//! Like the rest of the stack, the driver side relies on the transport runner to push data.
//! The stack inbox is bounded: `Rx::push` suspends while the inbox is full and resumes once
//! the stack has consumed a queued message.

#![no_std]

pub mod internal;
pub mod link;
pub mod message;
