//! Iterative center-of-mass refinement
//!
//! Computes the mass-weighted centroid of the full distributed particle set.
//! Each iteration folds this worker's local partial sums (`Σ mᵢ·xᵢ` and
//! `Σ mᵢ`, packed into a single 4-element sum collective) into group totals
//! and replaces the centroid estimate with the global weighted mean. The loop
//! stops once no coordinate of the estimate moves by the configured tolerance
//! between consecutive iterations, or after `max_iterations` passes,
//! whichever comes first.
//!
//! The partials are recomputed from the particle slice on every pass so that
//! a future shrinking-sphere refinement can exclude particles by distance
//! from the current estimate. With no filter applied the estimate is already
//! stationary after the first refinement, and the second pass only confirms
//! convergence.
//!
//! # Preconditions
//!
//! Every worker of the group must call with the same `max_iterations`, the
//! same `initial_guess`, and a slice of the same global particle set. The
//! convergence test then consumes only group-identical values, so every
//! worker issues the identical number of collective calls.

use crate::config::{RecenterConfig, DEFAULT_TOLERANCE};
use crate::error::RecenterError;
use crate::group::WorkerGroup;
use crate::Result;

/// Compute the center of mass of the distributed particle set
///
/// `masses` and `positions` describe this worker's local slice (either may be
/// empty; a particle-less worker still participates in every collective
/// round). The returned 3-vector is bit-identical on every worker.
///
/// # Errors
///
/// - [`RecenterError::SliceMismatch`] if the local slices differ in length
/// - [`RecenterError::DegenerateMass`] if the global mass total is zero or
///   negative, which leaves the weighted mean undefined
pub fn center_of_mass(
    group: &WorkerGroup,
    masses: &[f64],
    positions: &[[f64; 3]],
    max_iterations: usize,
    initial_guess: [f64; 3],
) -> Result<[f64; 3]> {
    let config = RecenterConfig {
        max_iterations,
        tolerance: DEFAULT_TOLERANCE,
    };
    center_of_mass_with(group, &config, masses, positions, initial_guess)
}

/// [`center_of_mass`] with explicit refinement configuration
pub fn center_of_mass_with(
    group: &WorkerGroup,
    config: &RecenterConfig,
    masses: &[f64],
    positions: &[[f64; 3]],
    initial_guess: [f64; 3],
) -> Result<[f64; 3]> {
    if masses.len() != positions.len() {
        return Err(RecenterError::SliceMismatch {
            scalars: masses.len(),
            positions: positions.len(),
        }
        .into());
    }

    let mut estimate = initial_guess;

    for _ in 0..config.max_iterations {
        // Local partials, recomputed each pass: a shrinking-sphere filter
        // would drop particles by distance from `estimate` here.
        let mut partial = [0.0f64; 4];
        for (mass, position) in masses.iter().zip(positions) {
            partial[0] += mass * position[0];
            partial[1] += mass * position[1];
            partial[2] += mass * position[2];
            partial[3] += mass;
        }

        let total = group.sum(&partial)?;
        let total_mass = total[3];
        if total_mass <= 0.0 {
            return Err(RecenterError::DegenerateMass { total_mass }.into());
        }

        let refined = [
            total[0] / total_mass,
            total[1] / total_mass,
            total[2] / total_mass,
        ];

        let shift = (0..3)
            .map(|axis| (refined[axis] - estimate[axis]).abs())
            .fold(0.0f64, f64::max);
        estimate = refined;

        if shift < config.tolerance {
            break;
        }
    }

    Ok(estimate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::local::sim::run_workers;
    use crate::group::local::LocalCollective;
    use rand::Rng;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    const THRESHOLD: f64 = 1e-6;

    /// Reference 40-point coordinate set (np.random.seed(2024), flattened)
    const COORDS: [f64; 120] = [
        0.58801452, 0.69910875, 0.18815196, 0.04380856, 0.20501895, 0.10606287, 0.72724014,
        0.67940052, 0.4738457, 0.44829582, 0.01910695, 0.75259834, 0.60244854, 0.96177758,
        0.66436865, 0.60662962, 0.44915131, 0.22535416, 0.6701743, 0.73576659, 0.25799564,
        0.09554215, 0.96090974, 0.25176729, 0.28216512, 0.76825393, 0.7979234, 0.5440372,
        0.38270763, 0.38165095, 0.28582739, 0.74026815, 0.23898683, 0.4377217, 0.8835387,
        0.28928114, 0.78450686, 0.75895366, 0.41778538, 0.22576877, 0.42009814, 0.06436369,
        0.59643269, 0.83732372, 0.89248639, 0.20052744, 0.50239523, 0.89538184, 0.25592093,
        0.86723234, 0.01648793, 0.55249695, 0.52790539, 0.92335039, 0.24594844, 0.06401838,
        0.9021047, 0.8740398, 0.16366729, 0.99974131, 0.34680397, 0.31287816, 0.84710402,
        0.8802311, 0.67655865, 0.05367515, 0.55921377, 0.69451294, 0.8241973, 0.31142866,
        0.50523054, 0.84900379, 0.29351563, 0.67711955, 0.4209064, 0.68171271, 0.22122799,
        0.5489977, 0.84884672, 0.7365669, 0.49962259, 0.37966499, 0.78752081, 0.16886931,
        0.58635861, 0.43121067, 0.06191019, 0.28945477, 0.7341454, 0.28865545, 0.39039811,
        0.63561732, 0.83114886, 0.319421, 0.15922479, 0.71166422, 0.87270864, 0.59315637,
        0.69471288, 0.17323332, 0.53173259, 0.87095862, 0.84109027, 0.97205554, 0.78225721,
        0.19703051, 0.61062607, 0.47885551, 0.616637, 0.13993324, 0.41123582, 0.77763034,
        0.93972552, 0.10457941, 0.9384822, 0.79738717, 0.33080272, 0.31178575, 0.29015382,
        0.17388959,
    ];

    /// Reference per-particle masses for the varying-mass scenario
    const MASSES: [f64; 40] = [
        0.88114956, 0.82005649, 0.73665888, 0.84696823, 0.60911562, 0.34423301, 0.22966899,
        0.94462579, 0.29172571, 0.41004459, 0.33766428, 0.9493286, 0.23092893, 0.16947204,
        0.49089763, 0.90475345, 0.88399969, 0.19491159, 0.52021797, 0.17489932, 0.89954588,
        0.37819933, 0.70288128, 0.51174545, 0.63485106, 0.93399494, 0.21049022, 0.33620401,
        0.65946718, 0.41460336, 0.25531344, 0.87560225, 0.40179131, 0.56136793, 0.1716831,
        0.00877794, 0.40878872, 0.10346889, 0.52504683, 0.45986097,
    ];

    fn to_positions(flat: &[f64]) -> Vec<[f64; 3]> {
        flat.chunks_exact(3)
            .map(|xyz| [xyz[0], xyz[1], xyz[2]])
            .collect()
    }

    fn assert_close(result: [f64; 3], expected: [f64; 3]) {
        for axis in 0..3 {
            assert!(
                (result[axis] - expected[axis]).abs() < THRESHOLD,
                "axis {axis}: got {}, expected {}",
                result[axis],
                expected[axis]
            );
        }
    }

    /// 4 workers x 10 particles each, per the reference harness layout
    fn run_reference(masses: &[f64; 40], flat_coords: &[f64; 120]) -> Vec<[f64; 3]> {
        run_workers(4, |group| {
            let start = group.rank() * 10;
            let local_masses = &masses[start..start + 10];
            let local_positions = to_positions(&flat_coords[3 * start..3 * (start + 10)]);
            center_of_mass(&group, local_masses, &local_positions, 100, [0.0; 3]).unwrap()
        })
    }

    #[test]
    fn test_all_zero_positions_uniform_mass() {
        let masses = [1.25; 40];
        let coords = [0.0; 120];
        for result in run_reference(&masses, &coords) {
            assert_close(result, [0.0, 0.0, 0.0]);
        }
    }

    #[test]
    fn test_uniform_offset_uniform_mass() {
        let masses = [1.25; 40];
        let coords = [3.14; 120];
        for result in run_reference(&masses, &coords) {
            assert_close(result, [3.14, 3.14, 3.14]);
        }
    }

    #[test]
    fn test_equal_mass_reference_set() {
        let masses = [1.0; 40];
        for result in run_reference(&masses, &COORDS) {
            assert_close(result, [0.49207988, 0.57682968, 0.49231838]);
        }
    }

    #[test]
    fn test_varying_mass_reference_set() {
        for result in run_reference(&MASSES, &COORDS) {
            assert_close(result, [0.44997152, 0.55214703, 0.49108783]);
        }
    }

    #[test]
    fn test_result_identical_across_workers() {
        let results = run_reference(&MASSES, &COORDS);
        for result in &results[1..] {
            for axis in 0..3 {
                assert_eq!(result[axis].to_bits(), results[0][axis].to_bits());
            }
        }
    }

    #[test]
    fn test_zero_total_mass_is_degenerate() {
        let results = run_workers(4, |group| {
            let masses = [0.0; 10];
            let positions = [[1.0, 2.0, 3.0]; 10];
            center_of_mass(&group, &masses, &positions, 100, [0.0; 3])
        });
        for result in results {
            let err = result.unwrap_err();
            let err = err.downcast_ref::<RecenterError>().unwrap();
            assert!(matches!(err, RecenterError::DegenerateMass { total_mass } if *total_mass == 0.0));
        }
    }

    #[test]
    fn test_slice_mismatch_detected_locally() {
        let groups = LocalCollective::split(1).unwrap();
        let group = &groups[0];
        let err = center_of_mass(group, &[1.0, 1.0], &[[0.0; 3]], 100, [0.0; 3]).unwrap_err();
        let err = err.downcast_ref::<RecenterError>().unwrap();
        assert!(matches!(
            err,
            RecenterError::SliceMismatch {
                scalars: 2,
                positions: 1
            }
        ));
    }

    #[test]
    fn test_converged_result_is_a_fixed_point() {
        let groups = LocalCollective::split(1).unwrap();
        let group = &groups[0];
        let masses = &MASSES[..];
        let positions = to_positions(&COORDS);

        let first = center_of_mass(group, masses, &positions, 100, [0.0; 3]).unwrap();
        let again = center_of_mass(group, masses, &positions, 100, first).unwrap();
        for axis in 0..3 {
            assert_eq!(first[axis].to_bits(), again[axis].to_bits());
        }
    }

    #[test]
    fn test_terminates_after_two_rounds_without_filtering() {
        // Iteration 1 lands on the weighted mean, iteration 2 observes a
        // zero shift and stops; the remaining 98 allowed passes are unused.
        let collective = LocalCollective::new(1).unwrap();
        let group = &collective.groups().unwrap()[0];
        let positions = to_positions(&COORDS);
        center_of_mass(group, &MASSES, &positions, 100, [0.0; 3]).unwrap();
        assert_eq!(collective.rounds_completed(), 2);
    }

    #[test]
    fn test_zero_max_iterations_returns_guess() {
        let collective = LocalCollective::new(1).unwrap();
        let group = &collective.groups().unwrap()[0];
        let guess = [4.0, 5.0, 6.0];
        let result = center_of_mass(group, &[1.0], &[[0.0; 3]], 0, guess).unwrap();
        assert_eq!(result, guess);
        assert_eq!(collective.rounds_completed(), 0);
    }

    #[test]
    fn test_with_config_tolerance() {
        let groups = LocalCollective::split(1).unwrap();
        let group = &groups[0];
        let config = RecenterConfig {
            max_iterations: 3,
            tolerance: 1e-12,
        };
        let positions = to_positions(&COORDS);
        let result =
            center_of_mass_with(group, &config, &MASSES, &positions, [0.0; 3]).unwrap();
        assert_close(result, [0.44997152, 0.55214703, 0.49108783]);
    }

    #[test]
    fn test_partition_invariance() {
        // The weighted mean of a seeded random cloud must not depend on how
        // the particles are split among workers, including uneven splits.
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(2024);
        let count = 60;
        let masses: Vec<f64> = (0..count).map(|_| rng.gen_range(0.1..2.0)).collect();
        let positions: Vec<[f64; 3]> = (0..count)
            .map(|_| {
                [
                    rng.gen_range(-10.0..10.0),
                    rng.gen_range(-10.0..10.0),
                    rng.gen_range(-10.0..10.0),
                ]
            })
            .collect();

        // Direct weighted mean over the whole set.
        let total_mass: f64 = masses.iter().sum();
        let mut expected = [0.0; 3];
        for (mass, position) in masses.iter().zip(&positions) {
            for axis in 0..3 {
                expected[axis] += mass * position[axis] / total_mass;
            }
        }

        for bounds in [
            vec![0, 60],
            vec![0, 30, 60],
            vec![0, 7, 20, 40, 60],
            vec![0, 12, 24, 36, 48, 60],
        ] {
            let size = bounds.len() - 1;
            let masses = &masses;
            let positions = &positions;
            let bounds = &bounds;
            let results = run_workers(size, move |group| {
                let (start, end) = (bounds[group.rank()], bounds[group.rank() + 1]);
                center_of_mass(
                    &group,
                    &masses[start..end],
                    &positions[start..end],
                    100,
                    [0.0; 3],
                )
                .unwrap()
            });
            for result in results {
                assert_close(result, expected);
            }
        }
    }
}
