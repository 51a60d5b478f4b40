//! Monotonic tag lineage
//!
//! Published tags form a strictly increasing sequence. The guard remembers
//! the highest tag this process has ever observed or committed and refuses
//! anything at or below it.
//!
//! ## Assumptions
//!
//! - The store is append-only: a tag, once listed, is never withdrawn
//! - State is memory-only; a restarted process re-learns the lineage from
//!   its first listing

use crate::{Error, Result};

/// Highest-tag-seen guard
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TagLineage {
    highest: Option<u64>,
}

impl TagLineage {
    /// Create an empty lineage
    pub const fn new() -> Self {
        Self { highest: None }
    }

    /// Highest tag seen so far
    pub fn highest(&self) -> Option<u64> {
        self.highest
    }

    /// Fold a store listing into the lineage.
    ///
    /// Returns the listing's maximum. Fails when that maximum is lower than
    /// a tag already observed, which means the store lost history.
    pub fn observe(&mut self, tags: &[u64]) -> Result<Option<u64>> {
        let listed = tags.iter().copied().max();
        match (listed, self.highest) {
            (Some(observed), Some(highest)) if observed < highest => {
                Err(Error::LineageRegressed { observed, highest })
            }
            (None, Some(highest)) => Err(Error::LineageRegressed {
                observed: 0,
                highest,
            }),
            (Some(observed), _) => {
                self.highest = Some(observed);
                Ok(Some(observed))
            }
            (None, None) => Ok(None),
        }
    }

    /// Whether `tag` would extend the lineage
    pub fn admits(&self, tag: u64) -> bool {
        self.highest.map_or(true, |h| tag > h)
    }

    /// Record a committed tag; rejects anything that does not extend the lineage
    pub fn commit(&mut self, tag: u64) -> Result<()> {
        match self.highest {
            Some(latest) if tag <= latest => Err(Error::PublishConflict {
                attempted: tag,
                latest,
            }),
            _ => {
                self.highest = Some(tag);
                Ok(())
            }
        }
    }
}
