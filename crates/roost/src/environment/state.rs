//! Process state machine.

use std::fmt;

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::events::{Event, EventBus};

/// Lifecycle state of a workload process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    #[default]
    Offline,
    Starting,
    Running,
    Stopping,
}

impl ProcessState {
    /// Whether `next` is reachable from this state in one step.
    ///
    /// Any state may drop to Offline when a crash or kill is detected.
    pub fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, next),
            (_, Offline) | (Offline, Starting) | (Starting, Running) | (Running, Stopping)
        )
    }

    pub fn is_offline(self) -> bool {
        self == ProcessState::Offline
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessState::Offline => "offline",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid state transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: ProcessState,
    pub to: ProcessState,
}

/// Current state of one environment, observable through a watch channel.
///
/// Every change is also published on the environment's event bus.
#[derive(Debug)]
pub struct StateMachine {
    tx: watch::Sender<ProcessState>,
    events: EventBus,
}

impl StateMachine {
    pub fn new(initial: ProcessState, events: EventBus) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx, events }
    }

    pub fn get(&self) -> ProcessState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.tx.subscribe()
    }

    /// Move to `next`, returning the previous state.
    ///
    /// Moving to the current state is accepted and publishes nothing.
    pub fn transition(&self, next: ProcessState) -> Result<ProcessState, InvalidTransition> {
        let mut outcome = Ok(next);
        let changed = self.tx.send_if_modified(|current| {
            let from = *current;
            if from == next {
                outcome = Ok(from);
                return false;
            }
            if !from.can_transition_to(next) {
                outcome = Err(InvalidTransition { from, to: next });
                return false;
            }
            outcome = Ok(from);
            *current = next;
            true
        });

        if changed {
            debug!("process state {} -> {}", outcome.unwrap_or(next), next);
            self.events.publish(Event::State(next));
        }
        outcome
    }

    /// Put back a previously confirmed state after a failed operation.
    ///
    /// Not validated against the transition table: a rollback returns to
    /// where the operation started.
    pub(crate) fn restore(&self, state: ProcessState) {
        let previous = self.tx.send_replace(state);
        if previous != state {
            debug!("process state restored {} -> {}", previous, state);
            self.events.publish(Event::State(state));
        }
    }

    /// Begin a transition that reverts unless committed.
    pub(crate) fn begin(
        &self,
        next: ProcessState,
    ) -> Result<TransitionGuard<'_>, InvalidTransition> {
        let prior = self.transition(next)?;
        Ok(TransitionGuard {
            machine: self,
            prior,
            armed: true,
        })
    }
}

/// Restores the prior state when dropped without [`TransitionGuard::commit`].
///
/// Covers both error returns and futures dropped mid-operation.
#[must_use = "dropping the guard immediately rolls the transition back"]
pub(crate) struct TransitionGuard<'a> {
    machine: &'a StateMachine,
    prior: ProcessState,
    armed: bool,
}

impl TransitionGuard<'_> {
    pub fn prior(&self) -> ProcessState {
        self.prior
    }

    /// Keep the new state.
    pub fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.machine.restore(self.prior);
        }
    }
}
