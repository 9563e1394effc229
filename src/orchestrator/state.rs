//! Range lifecycle state. The status values themselves live on
//! [`crate::model::RangeStatus`] since the registry persists them; this
//! module owns the transition rules the flows consult.

use crate::model::RangeStatus;

/// Events the orchestrator raises against a range's current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeEvent {
    CreateSucceeded,
    CreateFailed,
    DestroyRequested,
    DestroySucceeded,
    DestroyFailed,
}

/// Pure transition function for the lifecycle table. Returns `None` for an
/// event that is not valid from the given status — callers treat that as
/// a logic error, since the orchestrator itself gates which events it
/// raises from which status.
pub fn transition(current: RangeStatus, event: RangeEvent) -> Option<RangeStatus> {
    use RangeEvent::*;
    use RangeStatus::*;
    match (current, event) {
        (Creating, CreateSucceeded) => Some(Active),
        (Creating, CreateFailed) => Some(Error),
        (Active, DestroyRequested) | (Stopped, DestroyRequested) => Some(Stopping),
        (Creating, DestroyRequested) | (Error, DestroyRequested) => Some(Stopping),
        (Stopping, DestroySucceeded) => Some(Destroyed),
        (Stopping, DestroyFailed) => Some(Error),
        _ => None,
    }
}

/// Whether `Destroy` on a range already in this status is a no-op
/// success: destroying an already-DESTROYED range always is.
pub fn destroy_is_noop(status: RangeStatus) -> bool {
    status == RangeStatus::Destroyed
}

/// Whether this status can absorb a `Destroy` request at all without
/// `force` (ACTIVE and STOPPED are the ordinary destroyable states;
/// CREATING/ERROR need `force` since they're non-terminal or already
/// failed mid-flight).
pub fn destroy_allowed(status: RangeStatus, force: bool) -> bool {
    match status {
        RangeStatus::Active | RangeStatus::Stopped => true,
        RangeStatus::Creating | RangeStatus::Error => force,
        RangeStatus::Stopping | RangeStatus::Destroyed => false,
    }
}

/// Whether `Remove` is allowed from this status: DESTROYED/ERROR
/// unconditionally; ACTIVE/CREATING only with `force`, which force-destroys
/// first.
pub fn remove_allowed(status: RangeStatus, force: bool) -> bool {
    match status {
        RangeStatus::Destroyed | RangeStatus::Error => true,
        RangeStatus::Active | RangeStatus::Creating | RangeStatus::Stopped => force,
        RangeStatus::Stopping => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RangeStatus::*;

    #[test]
    fn create_success_reaches_active() {
        assert_eq!(transition(Creating, RangeEvent::CreateSucceeded), Some(Active));
    }

    #[test]
    fn create_failure_reaches_error() {
        assert_eq!(transition(Creating, RangeEvent::CreateFailed), Some(Error));
    }

    #[test]
    fn destroy_from_active_reaches_stopping() {
        assert_eq!(transition(Active, RangeEvent::DestroyRequested), Some(Stopping));
    }

    #[test]
    fn destroy_success_reaches_destroyed() {
        assert_eq!(transition(Stopping, RangeEvent::DestroySucceeded), Some(Destroyed));
    }

    #[test]
    fn destroy_failure_reaches_error() {
        assert_eq!(transition(Stopping, RangeEvent::DestroyFailed), Some(Error));
    }

    #[test]
    fn unknown_transition_returns_none() {
        assert_eq!(transition(Destroyed, RangeEvent::CreateSucceeded), None);
    }

    #[test]
    fn destroyed_range_is_a_destroy_noop() {
        assert!(destroy_is_noop(Destroyed));
        assert!(!destroy_is_noop(Active));
    }

    #[test]
    fn destroy_requires_force_from_creating_and_error() {
        assert!(!destroy_allowed(Creating, false));
        assert!(destroy_allowed(Creating, true));
        assert!(!destroy_allowed(Error, false));
        assert!(destroy_allowed(Active, false));
    }

    #[test]
    fn remove_requires_force_from_non_terminal_states() {
        assert!(remove_allowed(Destroyed, false));
        assert!(remove_allowed(Error, false));
        assert!(!remove_allowed(Active, false));
        assert!(remove_allowed(Active, true));
    }
}
