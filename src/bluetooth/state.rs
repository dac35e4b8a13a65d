//! Connection state machine
//!
//! The manager never assigns a state directly; it feeds a [`Trigger`] through
//! [`next_state`] and applies the side effects itself. Keeping the table free of
//! I/O lets it be checked without a radio.

use crate::bluetooth::types::ConnectionState;

/// Something that happened to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    StartScan,
    StopScan,
    ScanTimedOut,
    /// A scanned candidate is already in the device registry
    KnownCandidate,
    ConnectRequested,
    /// Link, enumeration and subscription all succeeded
    Established,
    AttemptFailed(String),
    DisconnectRequested,
    TeardownComplete,
    LinkLost,
    /// Leave a transient `Failed` state
    Reset,
}

/// Returns the state reached from `from` on `trigger`, or `None` if the
/// trigger does not apply in that state
pub fn next_state(from: &ConnectionState, trigger: &Trigger) -> Option<ConnectionState> {
    use ConnectionState::*;

    let next = match (from, trigger) {
        (Idle | Scanning, Trigger::StartScan) => Scanning,
        (Scanning, Trigger::StopScan | Trigger::ScanTimedOut) => Idle,
        (Scanning, Trigger::KnownCandidate) => Connecting,

        (Idle | Scanning | Disconnecting, Trigger::ConnectRequested) => Connecting,
        (Connecting, Trigger::Established) => Connected,
        (Connecting, Trigger::AttemptFailed(reason)) => Failed(reason.clone()),
        (Failed(_), Trigger::Reset) => Idle,

        (Connecting | Connected, Trigger::DisconnectRequested) => Disconnecting,
        (Disconnecting, Trigger::TeardownComplete) => Idle,
        (Connected, Trigger::LinkLost) => Idle,

        _ => return None,
    };
    Some(next)
}

/// Whether a session exists that a scan would interfere with
pub fn has_session(state: &ConnectionState) -> bool {
    matches!(
        state,
        ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Disconnecting
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    fn walk(start: ConnectionState, triggers: &[Trigger]) -> Option<ConnectionState> {
        triggers
            .iter()
            .try_fold(start, |state, trigger| next_state(&state, trigger))
    }

    #[test]
    fn test_known_candidate_path() {
        assert_eq!(
            walk(Idle, &[Trigger::StartScan, Trigger::KnownCandidate, Trigger::Established]),
            Some(Connected)
        );
    }

    #[test]
    fn test_scan_endings_return_to_idle() {
        assert_eq!(next_state(&Scanning, &Trigger::ScanTimedOut), Some(Idle));
        assert_eq!(next_state(&Scanning, &Trigger::StopScan), Some(Idle));
        assert_eq!(next_state(&Scanning, &Trigger::StartScan), Some(Scanning));
    }

    #[test]
    fn test_failure_passes_through_failed() {
        let failed = next_state(&Connecting, &Trigger::AttemptFailed("link failure".into()));
        assert_eq!(failed, Some(Failed("link failure".into())));
        assert_eq!(next_state(&Failed("x".into()), &Trigger::Reset), Some(Idle));
    }

    #[test]
    fn test_switch_peripheral_goes_through_disconnecting() {
        assert_eq!(
            walk(Connected, &[Trigger::DisconnectRequested, Trigger::ConnectRequested]),
            Some(Connecting)
        );
    }

    #[test]
    fn test_link_loss_only_from_connected() {
        assert_eq!(next_state(&Connected, &Trigger::LinkLost), Some(Idle));
        assert_eq!(next_state(&Connecting, &Trigger::LinkLost), None);
        assert_eq!(next_state(&Idle, &Trigger::LinkLost), None);
    }

    #[test]
    fn test_rejected_triggers() {
        assert_eq!(next_state(&Connected, &Trigger::StartScan), None);
        assert_eq!(next_state(&Idle, &Trigger::Established), None);
        assert_eq!(next_state(&Connected, &Trigger::ConnectRequested), None);
        assert!(has_session(&Connecting));
        assert!(!has_session(&Failed("x".into())));
    }
}
