//! Recenter - Distributed recentering primitives for particle simulations
//!
//! Recenter computes robust aggregate quantities over a particle set that is
//! partitioned disjointly across a fixed group of parallel workers, each
//! holding a private slice of the particles.
//!
//! # Primitives
//!
//! - **Center of mass**: iteratively refined mass-weighted centroid of the
//!   full distributed set, identical on every worker
//! - **Most-bound particle**: position of the single particle with the
//!   globally minimal potential energy, identical on every worker
//!
//! # Architecture
//!
//! - **Collective substrate**: `WorkerGroup` + `CollectiveChannel` wrap the
//!   blocking collective operations (global sum, argmin-with-payload,
//!   broadcast) every worker must invoke in the same order
//! - **Backends**: an in-process collective for single-process worker groups
//!   and a hub-based TCP collective for multi-process groups
//! - **Determinism**: every reduction is computed once, in worker-rank order,
//!   and the identical result is delivered to every worker
//!
//! Every collective call is a synchronizing barrier: all workers in a group
//! must execute the identical sequence of collective calls in the identical
//! order, or the group deadlocks. That is a precondition inherited from the
//! ambient parallel runtime, not a runtime-checked invariant.

pub mod bound;
pub mod center;
pub mod config;
pub mod error;
pub mod group;

// Re-export commonly used types
pub use bound::most_bound_particle;
pub use center::{center_of_mass, center_of_mass_with};
pub use config::RecenterConfig;
pub use error::RecenterError;
pub use group::local::LocalCollective;
pub use group::{CollectiveChannel, MinCandidate, MinWinner, WorkerGroup};

/// Result type used throughout Recenter
pub type Result<T> = anyhow::Result<T>;
