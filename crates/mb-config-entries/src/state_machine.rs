//! Config Entry State Machine
//!
//! ```text
//! NotLoaded → SetupInProgress → Loaded
//!                            ↘ SetupError → SetupInProgress (reconfigured)
//!                            ↘ SetupRetry → SetupInProgress (after backoff)
//!
//! Loaded/SetupError/SetupRetry → UnloadInProgress → NotLoaded
//!                                                 ↘ FailedUnload (terminal)
//! ```

use std::time::Duration;

use crate::entry::ConfigEntryState;
use thiserror::Error;

/// An invalid state transition was attempted
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid state transition from {from:?} to {to:?}: {reason}")]
pub struct InvalidTransition {
    pub from: ConfigEntryState,
    pub to: ConfigEntryState,
    pub reason: &'static str,
}

impl ConfigEntryState {
    pub fn try_transition(
        self,
        to: ConfigEntryState,
    ) -> Result<ConfigEntryState, InvalidTransition> {
        use ConfigEntryState::*;

        let valid = matches!(
            (self, to),
            (NotLoaded, SetupInProgress)
                | (SetupInProgress, Loaded | SetupError | SetupRetry)
                | (SetupError | SetupRetry, SetupInProgress)
                | (Loaded | SetupError | SetupRetry, UnloadInProgress)
                | (UnloadInProgress, NotLoaded | FailedUnload)
        );

        if valid {
            Ok(to)
        } else {
            Err(InvalidTransition {
                from: self,
                to,
                reason: Self::transition_error_reason(self, to),
            })
        }
    }

    #[cfg(test)]
    fn can_transition_to(self, to: ConfigEntryState) -> bool {
        self.try_transition(to).is_ok()
    }

    fn transition_error_reason(from: ConfigEntryState, to: ConfigEntryState) -> &'static str {
        use ConfigEntryState::*;

        match (from, to) {
            (FailedUnload, _) => "FailedUnload is terminal",
            (SetupInProgress, NotLoaded) => "Setup in progress must finish first",
            (UnloadInProgress, Loaded) => "Unload in progress cannot return to Loaded",
            (NotLoaded, Loaded | SetupError | SetupRetry) => {
                "Setup results require SetupInProgress first"
            }
            (Loaded, NotLoaded) => "Loaded entries must unload first",
            (Loaded, SetupInProgress) => "Already loaded",
            _ => "Invalid state transition",
        }
    }
}

/// Backoff before the next setup attempt
///
/// `2^min(tries, 4) * 5` seconds plus up to 100ms of jitter: 5s, 10s, 20s,
/// 40s, then 80s for every later attempt.
pub fn calculate_retry_delay(tries: u32) -> Duration {
    let base_secs = 2_u64.pow(tries.min(4)) * 5;
    let jitter_ms = rand::random::<u64>() % 100;
    Duration::from_secs(base_secs) + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConfigEntryState::*;

    #[test]
    fn test_setup_outcomes() {
        assert!(NotLoaded.can_transition_to(SetupInProgress));
        assert!(SetupInProgress.can_transition_to(Loaded));
        assert!(SetupInProgress.can_transition_to(SetupError));
        assert!(SetupInProgress.can_transition_to(SetupRetry));
    }

    #[test]
    fn test_failed_setups_can_retry_or_unload() {
        for from in [SetupError, SetupRetry] {
            assert!(from.can_transition_to(SetupInProgress));
            assert!(from.can_transition_to(UnloadInProgress));
            assert!(!from.can_transition_to(Loaded));
        }
    }

    #[test]
    fn test_invalid_jumps() {
        let err = NotLoaded.try_transition(Loaded).unwrap_err();
        assert_eq!(err.from, NotLoaded);
        assert_eq!(err.to, Loaded);

        assert!(!Loaded.can_transition_to(NotLoaded));
        assert!(!Loaded.can_transition_to(SetupInProgress));
        assert!(!SetupInProgress.can_transition_to(NotLoaded));
        assert!(!UnloadInProgress.can_transition_to(Loaded));
    }

    #[test]
    fn test_failed_unload_is_terminal() {
        for to in [
            NotLoaded,
            SetupInProgress,
            Loaded,
            SetupError,
            SetupRetry,
            UnloadInProgress,
        ] {
            let err = FailedUnload.try_transition(to).unwrap_err();
            assert!(err.reason.contains("terminal"));
        }
    }

    #[test]
    fn test_error_display() {
        let msg = NotLoaded.try_transition(Loaded).unwrap_err().to_string();
        assert!(msg.contains("NotLoaded"));
        assert!(msg.contains("SetupInProgress first"));
    }

    #[test]
    fn test_retry_delay_backoff() {
        let expected = [5, 10, 20, 40, 80, 80, 80];
        for (tries, secs) in expected.into_iter().enumerate() {
            let delay = calculate_retry_delay(tries as u32);
            assert!(delay >= Duration::from_secs(secs));
            assert!(delay < Duration::from_secs(secs) + Duration::from_millis(100));
        }
    }

    #[test]
    fn test_retry_then_load_then_unload() {
        let state = NotLoaded
            .try_transition(SetupInProgress)
            .and_then(|s| s.try_transition(SetupRetry))
            .and_then(|s| s.try_transition(SetupInProgress))
            .and_then(|s| s.try_transition(Loaded))
            .and_then(|s| s.try_transition(UnloadInProgress))
            .and_then(|s| s.try_transition(NotLoaded))
            .unwrap();
        assert_eq!(state, NotLoaded);
    }
}
