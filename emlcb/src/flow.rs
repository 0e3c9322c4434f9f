//! State flows
//!
//! A state flow is a task written as an explicit state machine. Each state handler returns an
//! [`Action`] telling the driver loop what to do next:
//! * [`Action::Call`] continues with the given state within the same step,
//! * [`Action::Wait`] records the given state and parks the task until notified,
//! * [`Action::Exit`] finishes the task.
//!
//! A handler that returns `Wait` must have handed out a notifier (to a completion callback, a
//! queue or a pool) beforehand, otherwise the flow never runs again.

use core::cell::Cell;

use crate::executor::{Status, Task, TaskContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Action<S> {
    Call(S),
    Wait(S),
    Exit,
}

/// Runs state handlers until one of them waits or exits
pub fn drive<S: Copy>(state: &Cell<S>, mut handler: impl FnMut(S) -> Action<S>) -> Status {
    loop {
        match handler(state.get()) {
            Action::Call(next) => state.set(next),
            Action::Wait(next) => {
                state.set(next);
                return Status::Pending;
            }
            Action::Exit => return Status::Finished,
        }
    }
}

pub trait StateFlow<'a> {
    type State: Copy;

    /// Storage of the current state
    fn state(&self) -> &Cell<Self::State>;

    fn run_state(&'a self, state: Self::State, cx: &mut TaskContext<'a>) -> Action<Self::State>;

    /// Runs the flow for one executor step
    fn step_flow(&'a self, cx: &mut TaskContext<'a>) -> Status {
        drive(self.state(), |state| self.run_state(state, cx))
    }
}

/// Adapter spawning a stand-alone state flow as an executor task
pub struct FlowTask<F>(F);

impl<F> FlowTask<F> {
    pub const fn new(flow: F) -> Self {
        Self(flow)
    }
}

impl<F> core::ops::Deref for FlowTask<F> {
    type Target = F;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'a, F: StateFlow<'a>> Task<'a> for FlowTask<F> {
    fn step(&'a self, _slot: u8, cx: &mut TaskContext<'a>) -> Status {
        self.0.step_flow(cx)
    }
}
