//! Most-bound particle location
//!
//! Finds the single particle with the algebraically smallest potential energy
//! (more negative = more bound) across the entire distributed set and hands
//! its position to every worker. One local scan picks this worker's best
//! candidate (lowest index on ties), one argmin-with-payload collective picks
//! the group winner (lowest rank, then lowest local index on ties).

use crate::error::RecenterError;
use crate::group::{MinCandidate, WorkerGroup};
use crate::Result;

/// Position of the globally most-bound particle, identical on every worker
///
/// `potentials` and `positions` describe this worker's local slice; either
/// may be empty as long as some worker in the group holds a particle.
/// Potentials are assumed non-NaN; a NaN never displaces an earlier
/// candidate, though one in the first slot seeds the scan and sticks.
///
/// # Errors
///
/// - [`RecenterError::SliceMismatch`] if the local slices differ in length
/// - [`RecenterError::EmptyParticleSet`] if no worker in the group holds any
///   particle
pub fn most_bound_particle(
    group: &WorkerGroup,
    potentials: &[f64],
    positions: &[[f64; 3]],
) -> Result<[f64; 3]> {
    if potentials.len() != positions.len() {
        return Err(RecenterError::SliceMismatch {
            scalars: potentials.len(),
            positions: positions.len(),
        }
        .into());
    }

    // Strict < keeps the lowest index on equal potentials.
    let mut local_best: Option<(usize, f64)> = None;
    for (index, &potential) in potentials.iter().enumerate() {
        match local_best {
            None => local_best = Some((index, potential)),
            Some((_, best)) if potential < best => local_best = Some((index, potential)),
            _ => {}
        }
    }

    let candidate = local_best.map(|(local_index, key)| MinCandidate {
        key,
        local_index,
        payload: positions[local_index],
    });

    match group.fold_min(candidate)? {
        Some(winner) => Ok(winner.payload),
        None => Err(RecenterError::EmptyParticleSet.into()),
    }
}
