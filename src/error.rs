//! Error taxonomy for the recentering primitives
//!
//! Errors that can be detected from locally available data (degenerate mass,
//! empty particle set, mismatched slice lengths) are reported synchronously on
//! every worker that can detect them. Cross-worker inconsistencies are only
//! reportable where a backend performs an explicit handshake; a worker that
//! simply never issues the matching collective call blocks the whole group, a
//! precondition violation owned by the caller.

use thiserror::Error;

/// Errors reported by the recentering primitives and collective backends
#[derive(Debug, Error)]
pub enum RecenterError {
    /// Total mass across all workers is zero or negative
    ///
    /// The center-of-mass division is undefined. The guard fires on every
    /// worker, since all workers observe the identical reduced mass total.
    #[error("degenerate total mass {total_mass}: center of mass is undefined")]
    DegenerateMass {
        /// Globally reduced mass sum that triggered the guard
        total_mass: f64,
    },

    /// Every worker in the group contributed an empty particle slice
    #[error("empty particle set: no particle on any worker in the group")]
    EmptyParticleSet,

    /// Workers disagree on group membership or on the collective being called
    ///
    /// Raised where a backend can detect the disagreement: at the hub join
    /// handshake (protocol version, group size, rank uniqueness) or inside a
    /// reduction round (op kind or sum-vector length mismatch). Mismatches
    /// that never reach a reduction round manifest as indefinite blocking
    /// instead.
    #[error("worker group mismatch: {detail}")]
    GroupMismatch {
        /// Human-readable description of the disagreement
        detail: String,
    },

    /// A worker passed parallel slices of different lengths
    #[error("local slice mismatch: {scalars} scalar values for {positions} positions")]
    SliceMismatch {
        /// Length of the mass or potential slice
        scalars: usize,
        /// Length of the position slice
        positions: usize,
    },

    /// A worker rank outside `0..size` was used with a collective backend
    #[error("rank {rank} out of range for a group of {size} workers")]
    RankOutOfRange {
        /// Offending rank
        rank: usize,
        /// Group size
        size: usize,
    },
}

impl RecenterError {
    /// Convenience constructor for group-mismatch errors
    pub fn mismatch(detail: impl Into<String>) -> Self {
        RecenterError::GroupMismatch {
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degenerate_mass_display() {
        let err = RecenterError::DegenerateMass { total_mass: 0.0 };
        assert_eq!(
            err.to_string(),
            "degenerate total mass 0: center of mass is undefined"
        );
    }

    #[test]
    fn test_slice_mismatch_display() {
        let err = RecenterError::SliceMismatch {
            scalars: 10,
            positions: 9,
        };
        assert!(err.to_string().contains("10 scalar values"));
        assert!(err.to_string().contains("9 positions"));
    }

    #[test]
    fn test_mismatch_constructor() {
        let err = RecenterError::mismatch("rank 3 joined twice");
        assert_eq!(
            err.to_string(),
            "worker group mismatch: rank 3 joined twice"
        );
    }
}
