//! Session state machine.
//!
//! States are a tagged union: each variant carries exactly the context it
//! needs (a backoff, a client id, an unconnect timestamp) rather than one
//! struct with a field that is meaningful in some states and `None` in
//! the rest. Transitions are applied under a single mutex rather than a
//! lock-free CAS loop — contention here is never hot enough to need one,
//! and it keeps the code in the same idiom as the single-slot
//! cancellation state elsewhere in this crate.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

/// The tag half of a [`SessionState`]: what legality and `waitFor` checks
/// compare, independent of any data a state happens to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateTag {
    Disconnected,
    Handshaking,
    Rehandshaking,
    Connecting,
    Connected,
    Unconnected,
    Disconnecting,
    Terminating,
}

impl StateTag {
    /// The fixed legal-transition graph: which states a session may move
    /// to directly from each state.
    pub fn can_transition_to(self, target: StateTag) -> bool {
        use StateTag::*;
        match self {
            Disconnected => matches!(target, Handshaking),
            Handshaking => matches!(target, Connecting | Rehandshaking | Terminating),
            Rehandshaking => matches!(target, Connecting | Rehandshaking | Terminating),
            Connecting => matches!(
                target,
                Connected | Unconnected | Rehandshaking | Disconnecting | Terminating
            ),
            Connected => matches!(
                target,
                Connected | Unconnected | Rehandshaking | Disconnecting | Terminating
            ),
            Unconnected => matches!(target, Connected | Unconnected | Rehandshaking | Terminating),
            Disconnecting => matches!(target, Terminating),
            Terminating => matches!(target, Disconnected),
        }
    }

    /// The implied-state relation used by `waitFor`: a stronger state
    /// implies the weaker states a caller may actually be waiting on.
    pub fn implies(self, target: StateTag) -> bool {
        if self == target {
            return true;
        }
        use StateTag::*;
        match self {
            Connecting => target == Handshaking,
            Connected => matches!(target, Handshaking | Connecting),
            Terminating => target == Disconnecting,
            Disconnected => matches!(target, Disconnecting | Terminating),
            _ => false,
        }
    }
}

/// A session state together with the context it carries.
#[derive(Debug, Clone)]
pub enum SessionState {
    Disconnected,
    Handshaking,
    Rehandshaking { backoff: Duration },
    Connecting { client_id: String },
    Connected { client_id: String },
    Unconnected {
        client_id: String,
        backoff: Duration,
        unconnect_since: Instant,
    },
    Disconnecting { client_id: Option<String> },
    Terminating { abort: bool },
}

impl SessionState {
    pub fn tag(&self) -> StateTag {
        match self {
            SessionState::Disconnected => StateTag::Disconnected,
            SessionState::Handshaking => StateTag::Handshaking,
            SessionState::Rehandshaking { .. } => StateTag::Rehandshaking,
            SessionState::Connecting { .. } => StateTag::Connecting,
            SessionState::Connected { .. } => StateTag::Connected,
            SessionState::Unconnected { .. } => StateTag::Unconnected,
            SessionState::Disconnecting { .. } => StateTag::Disconnecting,
            SessionState::Terminating { .. } => StateTag::Terminating,
        }
    }

    pub fn client_id(&self) -> Option<&str> {
        match self {
            SessionState::Connecting { client_id }
            | SessionState::Connected { client_id }
            | SessionState::Unconnected { client_id, .. } => Some(client_id.as_str()),
            SessionState::Disconnecting { client_id } => client_id.as_deref(),
            _ => None,
        }
    }

    /// The backoff a `Rehandshaking` or `Unconnected` state carries, if any.
    pub fn backoff(&self) -> Option<Duration> {
        match self {
            SessionState::Rehandshaking { backoff } => Some(*backoff),
            SessionState::Unconnected { backoff, .. } => Some(*backoff),
            _ => None,
        }
    }
}

/// Outcome of a single [`StateMachine::update`] call.
pub enum UpdateOutcome {
    /// The proposal was legal and applied.
    Applied { from: StateTag, to: StateTag },
    /// The proposal function returned `None`: no change was requested.
    NoChange,
    /// The proposal was illegal under the transition graph and was
    /// rejected; the state is unchanged.
    Rejected { from: StateTag, attempted: StateTag },
}

impl UpdateOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied { .. })
    }
}

/// The session's single source of truth for its current lifecycle state.
pub struct StateMachine {
    state: Mutex<SessionState>,
    condvar: Condvar,
    updaters_in_flight: Mutex<usize>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::Disconnected),
            condvar: Condvar::new(),
            updaters_in_flight: Mutex::new(0),
        }
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.lock().unwrap().clone()
    }

    pub fn tag(&self) -> StateTag {
        self.state.lock().unwrap().tag()
    }

    /// Atomically proposes and (if legal) applies a new state.
    ///
    /// `propose` sees the current state and returns `Some(next)` to
    /// request a transition or `None` to leave the state untouched. The
    /// whole read-decide-write sequence happens under one lock
    /// acquisition, so no retry loop is needed to guarantee atomicity;
    /// callers that raced simply see whichever proposal's lock they
    /// acquired first evaluated against the latest state.
    pub fn update<F>(&self, propose: F) -> UpdateOutcome
    where
        F: FnOnce(&SessionState) -> Option<SessionState>,
    {
        *self.updaters_in_flight.lock().unwrap() += 1;
        let outcome = {
            let mut guard = self.state.lock().unwrap();
            match propose(&guard) {
                None => UpdateOutcome::NoChange,
                Some(next) => {
                    let from = guard.tag();
                    let to = next.tag();
                    if from.can_transition_to(to) {
                        *guard = next;
                        debug!(?from, ?to, "session state transition");
                        UpdateOutcome::Applied { from, to }
                    } else {
                        debug!(?from, attempted = ?to, "rejected illegal session state transition");
                        UpdateOutcome::Rejected { from, attempted: to }
                    }
                }
            }
        };
        self.leave_update_scope();
        outcome
    }

    /// Marks an update as in flight without performing one, for callers
    /// that need to hold `updaters_in_flight` above zero across a
    /// transition *and* the side effect the transition triggers (e.g.
    /// dispatching a reply to channel listeners once the new state is
    /// live). Pair with [`StateMachine::leave_update_scope`], or better,
    /// use the RAII [`UpdateScope`] returned by
    /// [`StateMachine::enter_update_scope`].
    fn enter_update_scope_raw(&self) {
        *self.updaters_in_flight.lock().unwrap() += 1;
    }

    fn leave_update_scope(&self) {
        let mut in_flight = self.updaters_in_flight.lock().unwrap();
        *in_flight -= 1;
        if *in_flight == 0 {
            self.condvar.notify_all();
        }
    }

    /// Opens an [`UpdateScope`] that keeps `updaters_in_flight` above zero
    /// until it is dropped. A caller that applies a transition and then
    /// runs a notification side effect (dispatching a reply to callbacks
    /// and channel listeners) should hold the scope across both, so a
    /// concurrent `wait_for` cannot observe the new tag until the
    /// notification has actually been delivered — the exact guarantee
    /// SPEC_FULL §4.1 describes for `updatersInFlight`. `update` calls
    /// made while a scope from the same caller is held simply add a nested
    /// increment/decrement pair and do not themselves drop the count to
    /// zero early.
    pub fn enter_update_scope(&self) -> UpdateScope<'_> {
        self.enter_update_scope_raw();
        UpdateScope { machine: self }
    }

    /// Blocks the caller until the state tag equals or implies one of
    /// `targets`, or `deadline` elapses. Only observes the state once no
    /// update is mid-flight, so a waiter never sees a tag whose
    /// notification side effects have not yet run.
    pub fn wait_for(&self, deadline: Duration, targets: &[StateTag]) -> bool {
        let start = Instant::now();
        let mut guard = self.updaters_in_flight.lock().unwrap();
        loop {
            if *guard == 0 {
                let tag = self.state.lock().unwrap().tag();
                if targets.iter().any(|t| tag.implies(*t)) {
                    return true;
                }
            }
            let elapsed = start.elapsed();
            if elapsed >= deadline {
                return false;
            }
            let (g, _) = self
                .condvar
                .wait_timeout(guard, deadline - elapsed)
                .unwrap();
            guard = g;
        }
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard returned by [`StateMachine::enter_update_scope`]. Dropping it
/// decrements `updaters_in_flight` and notifies `wait_for` waiters if it
/// reaches zero.
pub struct UpdateScope<'a> {
    machine: &'a StateMachine,
}

impl Drop for UpdateScope<'_> {
    fn drop(&mut self) {
        self.machine.leave_update_scope();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnected_only_transitions_to_handshaking() {
        assert!(StateTag::Disconnected.can_transition_to(StateTag::Handshaking));
        assert!(!StateTag::Disconnected.can_transition_to(StateTag::Connecting));
        assert!(!StateTag::Disconnected.can_transition_to(StateTag::Terminating));
    }

    #[test]
    fn disconnecting_only_transitions_to_terminating() {
        assert!(StateTag::Disconnecting.can_transition_to(StateTag::Terminating));
        assert!(!StateTag::Disconnecting.can_transition_to(StateTag::Connected));
    }

    #[test]
    fn implied_state_relation() {
        assert!(StateTag::Connecting.implies(StateTag::Handshaking));
        assert!(StateTag::Connected.implies(StateTag::Handshaking));
        assert!(StateTag::Connected.implies(StateTag::Connecting));
        assert!(!StateTag::Connected.implies(StateTag::Unconnected));
        assert!(StateTag::Terminating.implies(StateTag::Disconnecting));
        assert!(StateTag::Disconnected.implies(StateTag::Terminating));
    }

    #[test]
    fn update_applies_legal_transition() {
        let sm = StateMachine::new();
        let outcome = sm.update(|_| Some(SessionState::Handshaking));
        assert!(outcome.applied());
        assert_eq!(sm.tag(), StateTag::Handshaking);
    }

    #[test]
    fn update_rejects_illegal_transition_and_leaves_state_untouched() {
        let sm = StateMachine::new();
        let outcome = sm.update(|_| {
            Some(SessionState::Connected {
                client_id: "c1".into(),
            })
        });
        assert!(!outcome.applied());
        assert_eq!(sm.tag(), StateTag::Disconnected);
    }

    #[test]
    fn disconnect_race_rejects_late_connect_reply() {
        let sm = StateMachine::new();
        sm.update(|_| Some(SessionState::Handshaking));
        sm.update(|_| {
            Some(SessionState::Connecting {
                client_id: "c1".into(),
            })
        });
        sm.update(|_| Some(SessionState::Disconnecting { client_id: Some("c1".into()) }));

        // A connect reply arrives after disconnect() was already issued.
        let outcome = sm.update(|_| {
            Some(SessionState::Connected {
                client_id: "c1".into(),
            })
        });
        assert!(!outcome.applied());
        assert_eq!(sm.tag(), StateTag::Disconnecting);
    }

    #[test]
    fn wait_for_returns_true_once_implied_state_reached() {
        let sm = StateMachine::new();
        sm.update(|_| Some(SessionState::Handshaking));
        sm.update(|_| {
            Some(SessionState::Connecting {
                client_id: "c1".into(),
            })
        });
        assert!(sm.wait_for(Duration::from_millis(10), &[StateTag::Handshaking]));
    }

    #[test]
    fn wait_for_times_out_when_target_never_reached() {
        let sm = StateMachine::new();
        assert!(!sm.wait_for(Duration::from_millis(20), &[StateTag::Connected]));
    }
}
