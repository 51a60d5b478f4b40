//! Reduction of peer contributions
//!
//! A round reduces every member's [`Contribution`] into one
//! [`ReducedUpdate`]. The default rule is the sample-weighted mean, so a
//! peer that trained on twice the data pulls twice as hard.

use crate::accumulator::Contribution;
use crate::outcome::ReducedUpdate;
use crate::{Error, Result};

/// Rule for combining contributions into one update
pub trait Aggregator: Send + Sync {
    /// Combine contributions; all must share one dimension
    fn aggregate(&self, contributions: &[Contribution]) -> Result<ReducedUpdate>;
}

/// Sample-weighted mean.
///
/// When every contribution carries zero samples the plain mean is used
/// instead, so a time-triggered round with no local work still reduces.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedMean;

impl Aggregator for WeightedMean {
    fn aggregate(&self, contributions: &[Contribution]) -> Result<ReducedUpdate> {
        weighted_average(contributions)
    }
}

/// Sample-weighted average of `contributions`
pub fn weighted_average(contributions: &[Contribution]) -> Result<ReducedUpdate> {
    let first = contributions
        .first()
        .ok_or_else(|| Error::Reduction("no contributions".into()))?;
    let dim = first.gradients.len();
    if contributions.iter().any(|c| c.gradients.len() != dim) {
        return Err(Error::InvalidGradient);
    }

    let total: u64 = contributions.iter().map(|c| c.samples).fold(0, u64::saturating_add);
    let n = contributions.len() as f32;
    let mut gradients = vec![0.0f32; dim];

    for c in contributions {
        let weight = if total == 0 {
            1.0 / n
        } else {
            c.samples as f32 / total as f32
        };
        for (acc, g) in gradients.iter_mut().zip(&c.gradients) {
            *acc += g * weight;
        }
    }

    if gradients.iter().any(|g| !g.is_finite()) {
        return Err(Error::InvalidGradient);
    }

    Ok(ReducedUpdate {
        gradients,
        samples: total,
    })
}
