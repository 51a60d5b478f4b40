//! Round identifiers and coordinator phases
//!
//! A round is one execution of the averaging protocol. Rounds are
//! single-attempt: the phase machine always returns to [`RoundPhase::Idle`].

use core::fmt;

/// Round identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct RoundId(pub u64);

impl RoundId {
    /// Next identifier in the local sequence
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Phase of the round coordinator
///
/// `Idle -> Forming -> Running -> {Succeeded, TimedOut, Cancelled, Errored} -> Idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoundPhase {
    /// No round in flight
    #[default]
    Idle,
    /// Building the peer group
    Forming,
    /// Waiting on the reduction handle
    Running,
    /// Round completed before its deadline
    Succeeded,
    /// Deadline elapsed; handle was cancelled
    TimedOut,
    /// Cancelled from outside (shutdown)
    Cancelled,
    /// Group formation or the primitive failed
    Errored,
}

impl RoundPhase {
    /// Whether this phase ends a round attempt
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RoundPhase::Succeeded | RoundPhase::TimedOut | RoundPhase::Cancelled | RoundPhase::Errored
        )
    }

    /// Whether `next` is a legal transition from this phase
    pub fn can_transition_to(&self, next: RoundPhase) -> bool {
        use RoundPhase::*;
        match (self, next) {
            (Idle, Forming) => true,
            (Forming, Running) | (Forming, Errored) | (Forming, Cancelled) => true,
            (Running, Succeeded) | (Running, TimedOut) | (Running, Cancelled) | (Running, Errored) => {
                true
            }
            (terminal, Idle) => terminal.is_terminal(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_are_legal() {
        use RoundPhase::*;
        let path = [Idle, Forming, Running, Succeeded, Idle];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn running_cannot_skip_back_to_idle() {
        assert!(!RoundPhase::Running.can_transition_to(RoundPhase::Idle));
        assert!(!RoundPhase::Idle.can_transition_to(RoundPhase::Running));
    }

    #[test]
    fn round_ids_increment() {
        assert_eq!(RoundId(4).next(), RoundId(5));
        assert_eq!(RoundId(u64::MAX).next(), RoundId(0));
        assert_eq!(RoundId(3).to_string(), "r3");
    }
}
