//! Round outcomes
//!
//! Exactly one [`RoundOutcome`] is produced per round attempt.

use crate::group::GroupId;
use crate::identity::PeerId;
use crate::round::{RoundId, RoundPhase};
use crate::Error;

/// Result of a successful reduction
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct ReducedUpdate {
    /// Averaged gradients
    pub gradients: Vec<f32>,
    /// Total samples gathered across contributors
    pub samples: u64,
}

/// What the reduction primitive reports for a finished round
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RoundReport {
    /// Peers that took part
    pub participating_peers: Vec<PeerId>,
    /// Peers that dropped out before completion
    pub failed_peers: Vec<PeerId>,
    /// The reduced update
    pub reduction_result: ReducedUpdate,
}

/// Outcome of one round attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RoundOutcome {
    /// Completed before the deadline
    Success {
        round: RoundId,
        group_id: GroupId,
        participating_peers: Vec<PeerId>,
        failed_peers: Vec<PeerId>,
        reduction_result: ReducedUpdate,
    },
    /// Deadline elapsed; the handle was cancelled
    Timeout { round: RoundId },
    /// Cancelled from outside the coordinator
    Cancelled { round: RoundId },
    /// Formation or the primitive failed
    Error { round: RoundId, cause: Error },
}

impl RoundOutcome {
    /// Build a success outcome from a primitive report
    pub fn success(round: RoundId, group_id: GroupId, report: RoundReport) -> Self {
        RoundOutcome::Success {
            round,
            group_id,
            participating_peers: report.participating_peers,
            failed_peers: report.failed_peers,
            reduction_result: report.reduction_result,
        }
    }

    /// Round this outcome belongs to
    pub fn round(&self) -> RoundId {
        match self {
            RoundOutcome::Success { round, .. }
            | RoundOutcome::Timeout { round }
            | RoundOutcome::Cancelled { round }
            | RoundOutcome::Error { round, .. } => *round,
        }
    }

    /// Check if the round succeeded
    pub fn is_success(&self) -> bool {
        matches!(self, RoundOutcome::Success { .. })
    }

    /// Terminal coordinator phase for this outcome
    pub fn phase(&self) -> RoundPhase {
        match self {
            RoundOutcome::Success { .. } => RoundPhase::Succeeded,
            RoundOutcome::Timeout { .. } => RoundPhase::TimedOut,
            RoundOutcome::Cancelled { .. } => RoundPhase::Cancelled,
            RoundOutcome::Error { .. } => RoundPhase::Errored,
        }
    }

    /// Participants that stayed through completion
    pub fn completed_peers(&self) -> Vec<PeerId> {
        match self {
            RoundOutcome::Success {
                participating_peers,
                failed_peers,
                ..
            } => participating_peers
                .iter()
                .filter(|p| !failed_peers.contains(p))
                .copied()
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Failure as an error value, for logging and propagation
    pub fn as_error(&self) -> Option<Error> {
        match self {
            RoundOutcome::Success { .. } => None,
            RoundOutcome::Timeout { round } => Some(Error::Timeout { round: *round }),
            RoundOutcome::Cancelled { .. } => Some(Error::Reduction("round cancelled".into())),
            RoundOutcome::Error { cause, .. } => Some(cause.clone()),
        }
    }
}
