//! Collective reduction substrate
//!
//! This module defines the seam between the recentering algorithms and the
//! parallel runtime that coordinates the worker group. A [`WorkerGroup`] is
//! the explicit ambient-context value (own rank, group size, collective-call
//! handle) passed into every operation; a [`CollectiveChannel`] is the backend
//! that actually moves data between workers.
//!
//! # Backends
//!
//! - [`local::LocalCollective`]: in-process group for single-process harnesses
//!   and tests, one `WorkerGroup` handle per simulated worker
//! - [`hub::HubCollective`]: TCP client for multi-process groups, reduced by a
//!   [`hub::CollectiveHub`]
//!
//! # Determinism
//!
//! Each collective result is computed exactly once per round, folding worker
//! contributions in ascending rank order, and the identical value is handed to
//! every worker. Argmin ties are broken by lowest worker rank, then lowest
//! local index within that worker, which makes the winner a total order over
//! the distributed set.
//!
//! # Blocking
//!
//! Every operation is a synchronizing barrier: no worker proceeds past the
//! call until all workers of the group have contributed and received the
//! result. There is no partial-participation mode and no timeout; a worker
//! that never issues the matching call stalls the whole group.

pub mod hub;
pub mod local;
pub mod protocol;

use crate::error::RecenterError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Local argmin candidate contributed by one worker
///
/// `key` is the scalar being minimized (lower is better), `local_index` is the
/// index of the winning particle within the worker's own slice, and `payload`
/// is the value delivered to every worker if this candidate wins globally.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinCandidate {
    /// Scalar key being minimized
    pub key: f64,
    /// Index of the candidate within the contributing worker's slice
    pub local_index: usize,
    /// Value delivered group-wide if this candidate wins
    pub payload: [f64; 3],
}

/// Globally winning argmin entry, identical on every worker
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinWinner {
    /// Globally minimal key
    pub key: f64,
    /// Payload attached to the winning key
    pub payload: [f64; 3],
    /// Rank of the worker that owns the winning particle
    pub owner_rank: usize,
    /// Index of the winning particle within the owner's slice
    pub owner_index: usize,
}

/// Collective communication backend for one worker group
///
/// Implementations must deliver bit-identical results to every worker of a
/// round and must fold contributions in ascending rank order so the outcome
/// does not depend on arrival order.
///
/// # Thread Safety
///
/// Channels are shared across worker threads (one [`WorkerGroup`] per worker,
/// all pointing at the same channel in the in-process backend), so
/// implementations must be `Send + Sync`.
pub trait CollectiveChannel: Send + Sync {
    /// Number of workers in the group
    fn size(&self) -> usize;

    /// Elementwise global sum of a fixed-size vector
    ///
    /// Every worker must pass a slice of the same length; the summed vector is
    /// returned identically to all of them.
    fn sum(&self, rank: usize, local: &[f64]) -> Result<Vec<f64>>;

    /// Global argmin with attached payload
    ///
    /// `None` means this worker has no candidate (empty local slice). Returns
    /// `None` to every worker only when no worker contributed a candidate.
    fn fold_min(&self, rank: usize, candidate: Option<MinCandidate>) -> Result<Option<MinWinner>>;

    /// Replicate a value from `source_rank` to every worker
    ///
    /// Only the value passed by `source_rank` is used; other workers may pass
    /// `None`.
    fn broadcast(
        &self,
        rank: usize,
        value: Option<Vec<f64>>,
        source_rank: usize,
    ) -> Result<Vec<f64>>;
}

/// One worker's handle on its group: own rank, group size, collective channel
///
/// This is the ambient parallel context made explicit. Algorithms take a
/// `&WorkerGroup` instead of reading process-wide state, which lets a test
/// harness run several simulated workers inside one process.
#[derive(Clone)]
pub struct WorkerGroup {
    /// This worker's rank within the group (0-based)
    rank: usize,

    /// Total number of workers in the group
    size: usize,

    /// Shared collective backend
    channel: Arc<dyn CollectiveChannel>,
}

impl WorkerGroup {
    /// Create a group handle for one worker
    ///
    /// Fails with [`RecenterError::RankOutOfRange`] if `rank` does not fit the
    /// channel's group size.
    pub fn new(rank: usize, channel: Arc<dyn CollectiveChannel>) -> Result<Self> {
        let size = channel.size();
        if rank >= size {
            return Err(RecenterError::RankOutOfRange { rank, size }.into());
        }
        Ok(Self {
            rank,
            size,
            channel,
        })
    }

    /// This worker's rank (0-based)
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of workers in the group
    pub fn size(&self) -> usize {
        self.size
    }

    /// Elementwise global sum across the group (blocking barrier)
    pub fn sum(&self, local: &[f64]) -> Result<Vec<f64>> {
        self.channel.sum(self.rank, local)
    }

    /// Global argmin with payload across the group (blocking barrier)
    pub fn fold_min(&self, candidate: Option<MinCandidate>) -> Result<Option<MinWinner>> {
        self.channel.fold_min(self.rank, candidate)
    }

    /// Broadcast a value from `source_rank` to the whole group (blocking barrier)
    pub fn broadcast(&self, value: Option<Vec<f64>>, source_rank: usize) -> Result<Vec<f64>> {
        self.channel.broadcast(self.rank, value, source_rank)
    }
}

impl std::fmt::Debug for WorkerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerGroup")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

/// Fold rank-ordered candidates into the global winner
///
/// `ranked` must be iterated in ascending rank order. Strict `<` keeps the
/// first (lowest-rank) contributor on equal keys; within one rank the lowest
/// local index was already chosen by the contributing worker's local scan.
pub(crate) fn fold_candidates<I>(ranked: I) -> Option<MinWinner>
where
    I: IntoIterator<Item = (usize, MinCandidate)>,
{
    let mut winner: Option<MinWinner> = None;
    for (rank, candidate) in ranked {
        let replace = match &winner {
            None => true,
            Some(best) => candidate.key < best.key,
        };
        if replace {
            winner = Some(MinWinner {
                key: candidate.key,
                payload: candidate.payload,
                owner_rank: rank,
                owner_index: candidate.local_index,
            });
        }
    }
    winner
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(key: f64, local_index: usize) -> MinCandidate {
        MinCandidate {
            key,
            local_index,
            payload: [key, key, key],
        }
    }

    #[test]
    fn test_fold_candidates_picks_minimum() {
        let winner = fold_candidates(vec![
            (0, candidate(3.0, 0)),
            (1, candidate(-2.0, 4)),
            (2, candidate(1.0, 1)),
        ])
        .unwrap();
        assert_eq!(winner.key, -2.0);
        assert_eq!(winner.owner_rank, 1);
        assert_eq!(winner.owner_index, 4);
        assert_eq!(winner.payload, [-2.0, -2.0, -2.0]);
    }

    #[test]
    fn test_fold_candidates_equal_keys_prefer_lowest_rank() {
        let winner = fold_candidates(vec![
            (0, candidate(5.0, 9)),
            (1, candidate(5.0, 0)),
            (2, candidate(5.0, 3)),
        ])
        .unwrap();
        assert_eq!(winner.owner_rank, 0);
        assert_eq!(winner.owner_index, 9);
    }

    #[test]
    fn test_fold_candidates_empty() {
        assert!(fold_candidates(std::iter::empty()).is_none());
    }

    #[test]
    fn test_fold_candidates_skips_absent_ranks() {
        // Workers with empty slices simply contribute nothing.
        let winner = fold_candidates(vec![(2, candidate(7.0, 2))]).unwrap();
        assert_eq!(winner.owner_rank, 2);
    }
}
