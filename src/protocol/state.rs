use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Serialize, Deserialize};
use tracing::{debug, info};

use crate::core::{Error, Result};
use super::events::HandlerList;

/// Lifecycle state of the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    /// No transport connection
    Disconnected,
    /// Transport connect in progress
    Connecting,
    /// Connected, checking the device identity key
    VerifyingKey,
    /// Outbound operations permitted
    Ready,
    /// Connect or verification failed
    Error,
}

impl ControllerState {
    /// Returns true if `self -> to` is a legal transition
    pub fn can_transition_to(self, to: ControllerState) -> bool {
        use ControllerState::*;

        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Connecting, VerifyingKey)
                | (Connecting, Error)
                | (VerifyingKey, Ready)
                | (VerifyingKey, Error)
                | (_, Disconnected)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ControllerState::Disconnected => "disconnected",
            ControllerState::Connecting => "connecting",
            ControllerState::VerifyingKey => "verifying_key",
            ControllerState::Ready => "ready",
            ControllerState::Error => "error",
        }
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A completed state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: ControllerState,
    pub to: ControllerState,
}

/// Information about the current state
#[derive(Debug, Clone)]
pub struct StateInfo {
    pub state: ControllerState,
    /// Time since the last transition
    pub time_in_state: Duration,
    /// Transitions since creation
    pub transitions: u64,
}

struct Inner {
    state: ControllerState,
    entered_at: Instant,
    transitions: u64,
}

/// Shared controller state cell
///
/// Read by the engine to gate outbound sends and written by the control
/// loop and the transport's link callback. Observers run after the lock is
/// released.
pub struct StateMachine {
    inner: RwLock<Inner>,
    observers: HandlerList<StateChange>,
}

impl StateMachine {
    /// Creates a machine in `Disconnected`
    pub fn new(max_handlers: usize) -> Self {
        StateMachine {
            inner: RwLock::new(Inner {
                state: ControllerState::Disconnected,
                entered_at: Instant::now(),
                transitions: 0,
            }),
            observers: HandlerList::new("state", max_handlers),
        }
    }

    /// Current state
    pub fn current(&self) -> ControllerState {
        self.inner.read().state
    }

    pub fn is_ready(&self) -> bool {
        self.current() == ControllerState::Ready
    }

    /// Fails with `NotReady` unless the state is `Ready`
    pub fn ensure_ready(&self) -> Result<()> {
        match self.current() {
            ControllerState::Ready => Ok(()),
            other => Err(Error::NotReady(other)),
        }
    }

    pub fn info(&self) -> StateInfo {
        let inner = self.inner.read();
        StateInfo {
            state: inner.state,
            time_in_state: inner.entered_at.elapsed(),
            transitions: inner.transitions,
        }
    }

    /// Moves to `to`, notifying observers
    ///
    /// Moving to the current state is a no-op for `Disconnected` so that
    /// repeated shutdowns stay quiet; any other illegal move fails with
    /// `InvalidTransition`.
    pub fn transition(&self, to: ControllerState) -> Result<()> {
        let change = {
            let mut inner = self.inner.write();
            let from = inner.state;
            if from == to && to == ControllerState::Disconnected {
                return Ok(());
            }
            if !from.can_transition_to(to) {
                return Err(Error::InvalidTransition { from, to });
            }
            inner.state = to;
            inner.entered_at = Instant::now();
            inner.transitions += 1;
            StateChange { from, to }
        };

        info!(from = %change.from, to = %change.to, "Controller state changed");
        let faults = self.observers.emit(&change);
        if faults > 0 {
            debug!(faults, "State observers faulted");
        }
        Ok(())
    }

    /// Moves to `to` only if the current state is `expected`
    ///
    /// Returns false without notifying if another writer got there first.
    pub fn transition_from(&self, expected: ControllerState, to: ControllerState) -> Result<bool> {
        let change = {
            let mut inner = self.inner.write();
            if inner.state != expected {
                return Ok(false);
            }
            if !expected.can_transition_to(to) {
                return Err(Error::InvalidTransition { from: expected, to });
            }
            inner.state = to;
            inner.entered_at = Instant::now();
            inner.transitions += 1;
            StateChange { from: expected, to }
        };

        info!(from = %change.from, to = %change.to, "Controller state changed");
        self.observers.emit(&change);
        Ok(true)
    }

    /// Registers a state change observer
    pub fn on_change<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&StateChange) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.observers.register(handler)
    }
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("state", &self.current())
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use parking_lot::Mutex;

    #[test]
    fn test_transition_table() {
        use ControllerState::*;

        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(VerifyingKey));
        assert!(Connecting.can_transition_to(Error));
        assert!(VerifyingKey.can_transition_to(Ready));
        assert!(VerifyingKey.can_transition_to(Error));
        assert!(Ready.can_transition_to(Disconnected));
        assert!(Error.can_transition_to(Disconnected));

        assert!(!Disconnected.can_transition_to(Ready));
        assert!(!Connecting.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Connecting));
        assert!(!Error.can_transition_to(Ready));
    }

    #[test]
    fn test_happy_path() {
        let machine = StateMachine::new(4);
        assert_eq!(machine.current(), ControllerState::Disconnected);
        assert!(machine.ensure_ready().is_err());

        machine.transition(ControllerState::Connecting).unwrap();
        machine.transition(ControllerState::VerifyingKey).unwrap();
        machine.transition(ControllerState::Ready).unwrap();
        assert!(machine.is_ready());
        assert!(machine.ensure_ready().is_ok());
        assert_eq!(machine.info().transitions, 3);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let machine = StateMachine::new(4);
        let err = machine.transition(ControllerState::Ready).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition { from: ControllerState::Disconnected, to: ControllerState::Ready }
        ));
        assert_eq!(machine.current(), ControllerState::Disconnected);
    }

    #[test]
    fn test_observers_see_every_transition() {
        let machine = StateMachine::new(4);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        machine
            .on_change(move |change: &StateChange| {
                sink.lock().push((change.from, change.to));
                Ok(())
            })
            .unwrap();

        machine.transition(ControllerState::Connecting).unwrap();
        machine.transition(ControllerState::Error).unwrap();
        machine.transition(ControllerState::Disconnected).unwrap();
        // Repeated shutdown is silent
        machine.transition(ControllerState::Disconnected).unwrap();

        assert_eq!(
            *seen.lock(),
            vec![
                (ControllerState::Disconnected, ControllerState::Connecting),
                (ControllerState::Connecting, ControllerState::Error),
                (ControllerState::Error, ControllerState::Disconnected),
            ]
        );
    }

    #[test]
    fn test_transition_from_guards_races() {
        let machine = StateMachine::new(4);
        assert!(!machine
            .transition_from(ControllerState::Ready, ControllerState::Disconnected)
            .unwrap());

        machine.transition(ControllerState::Connecting).unwrap();
        machine.transition(ControllerState::VerifyingKey).unwrap();
        machine.transition(ControllerState::Ready).unwrap();
        assert!(machine
            .transition_from(ControllerState::Ready, ControllerState::Disconnected)
            .unwrap());
        assert_eq!(machine.current(), ControllerState::Disconnected);
    }

    #[test]
    fn test_display_is_snake_case() {
        assert_eq!(ControllerState::VerifyingKey.to_string(), "verifying_key");
        assert_eq!(serde_json::to_string(&ControllerState::Ready).unwrap(), "\"ready\"");
    }
}
