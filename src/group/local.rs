//! In-process collective backend
//!
//! This backend runs a whole worker group inside one process: every simulated
//! worker (usually one thread each) holds a [`WorkerGroup`] handle onto the
//! same shared [`LocalCollective`]. It exists for single-process harnesses and
//! tests, the same way a mock backend stands in for a real one, but it
//! implements the full barrier and determinism contract and is usable as a
//! product backend for intra-process partitioning.
//!
//! # Rendezvous
//!
//! Each collective call is one *round*. A worker deposits its contribution
//! into its rank's slot and blocks; the last depositor folds all slots in
//! ascending rank order and publishes the outcome; every worker picks the
//! outcome up and the last one to leave drains the round so the next can
//! begin. Rounds are therefore strictly serialized, which is exactly the
//! global ordering guarantee collectives must provide.
//!
//! # Mismatch detection
//!
//! Workers disagreeing within a round (different op kinds, different sum
//! lengths, different broadcast sources) poison the round's outcome and every
//! participant receives a `GroupMismatch` error instead of deadlocking.

use super::{fold_candidates, CollectiveChannel, MinCandidate, MinWinner, WorkerGroup};
use crate::error::RecenterError;
use crate::Result;
use std::sync::{Arc, Condvar, Mutex};

/// One worker's contribution to a collective round
#[derive(Debug, Clone)]
enum Contribution {
    Sum(Vec<f64>),
    FoldMin(Option<MinCandidate>),
    Broadcast {
        source: usize,
        value: Option<Vec<f64>>,
    },
}

/// Folded outcome of a completed round
#[derive(Debug, Clone)]
enum Reduced {
    Sum(Vec<f64>),
    FoldMin(Option<MinWinner>),
    Broadcast(Vec<f64>),
}

/// Outcome published to every participant of a round
type Outcome = std::result::Result<Reduced, String>;

/// Mutable rendezvous state, guarded by the collective's mutex
#[derive(Debug)]
struct RoundState {
    /// Per-rank contribution slots for the current round
    slots: Vec<Option<Contribution>>,

    /// Number of slots filled so far this round
    deposited: usize,

    /// Folded outcome, present once the last depositor has reduced
    outcome: Option<Outcome>,

    /// Workers that still have to pick the outcome up before the round drains
    pending_pickup: usize,

    /// Completed rounds since creation (test observability)
    rounds_completed: u64,
}

/// In-process collective for a fixed-size worker group
///
/// Create one per group and hand each simulated worker its own
/// [`WorkerGroup`] via [`LocalCollective::split`].
///
/// # Example
///
/// ```
/// use recenter::LocalCollective;
///
/// let groups = LocalCollective::split(2).unwrap();
/// let handles: Vec<_> = groups
///     .into_iter()
///     .map(|group| {
///         std::thread::spawn(move || group.sum(&[group.rank() as f64 + 1.0]).unwrap())
///     })
///     .collect();
/// for handle in handles {
///     assert_eq!(handle.join().unwrap(), vec![3.0]);
/// }
/// ```
#[derive(Debug)]
pub struct LocalCollective {
    size: usize,
    state: Mutex<RoundState>,
    barrier: Condvar,
}

impl LocalCollective {
    /// Create a collective for a group of `size` workers
    pub fn new(size: usize) -> Result<Arc<Self>> {
        if size == 0 {
            anyhow::bail!("worker group size must be at least 1");
        }
        Ok(Arc::new(Self {
            size,
            state: Mutex::new(RoundState {
                slots: vec![None; size],
                deposited: 0,
                outcome: None,
                pending_pickup: 0,
                rounds_completed: 0,
            }),
            barrier: Condvar::new(),
        }))
    }

    /// Create a group and split it into one [`WorkerGroup`] handle per rank
    ///
    /// Handles are returned in rank order and are meant to be moved onto one
    /// thread each.
    pub fn split(size: usize) -> Result<Vec<WorkerGroup>> {
        Self::new(size)?.groups()
    }

    /// One [`WorkerGroup`] handle per rank, in rank order
    pub fn groups(self: &Arc<Self>) -> Result<Vec<WorkerGroup>> {
        (0..self.size)
            .map(|rank| WorkerGroup::new(rank, Arc::clone(self) as Arc<dyn CollectiveChannel>))
            .collect()
    }

    /// Number of collective rounds completed so far
    pub fn rounds_completed(&self) -> u64 {
        self.state
            .lock()
            .expect("collective state poisoned by a panicked worker")
            .rounds_completed
    }

    /// Run one collective round: deposit, wait for the fold, pick up
    fn run_round(&self, rank: usize, contribution: Contribution) -> Result<Reduced> {
        if rank >= self.size {
            return Err(RecenterError::RankOutOfRange {
                rank,
                size: self.size,
            }
            .into());
        }

        let mut state = self
            .state
            .lock()
            .expect("collective state poisoned by a panicked worker");

        // Wait for the previous round to drain and for our slot to be free.
        while state.pending_pickup > 0 || state.slots[rank].is_some() {
            state = self
                .barrier
                .wait(state)
                .expect("collective state poisoned by a panicked worker");
        }

        state.slots[rank] = Some(contribution);
        state.deposited += 1;

        if state.deposited == self.size {
            // Last depositor folds the round, in ascending rank order.
            let outcome = reduce_round(&state.slots);
            state.outcome = Some(outcome);
            state.pending_pickup = self.size;
            self.barrier.notify_all();
        } else {
            while state.outcome.is_none() {
                state = self
                    .barrier
                    .wait(state)
                    .expect("collective state poisoned by a panicked worker");
            }
        }

        let outcome = state
            .outcome
            .clone()
            .expect("round outcome published before pickup");

        state.pending_pickup -= 1;
        if state.pending_pickup == 0 {
            // Last worker out drains the round so the next one can begin.
            for slot in state.slots.iter_mut() {
                *slot = None;
            }
            state.deposited = 0;
            state.outcome = None;
            state.rounds_completed += 1;
            self.barrier.notify_all();
        }
        drop(state);

        outcome.map_err(|detail| RecenterError::GroupMismatch { detail }.into())
    }
}

impl CollectiveChannel for LocalCollective {
    fn size(&self) -> usize {
        self.size
    }

    fn sum(&self, rank: usize, local: &[f64]) -> Result<Vec<f64>> {
        match self.run_round(rank, Contribution::Sum(local.to_vec()))? {
            Reduced::Sum(total) => Ok(total),
            other => unreachable!("sum round folded to {other:?}"),
        }
    }

    fn fold_min(&self, rank: usize, candidate: Option<MinCandidate>) -> Result<Option<MinWinner>> {
        match self.run_round(rank, Contribution::FoldMin(candidate))? {
            Reduced::FoldMin(winner) => Ok(winner),
            other => unreachable!("fold_min round folded to {other:?}"),
        }
    }

    fn broadcast(
        &self,
        rank: usize,
        value: Option<Vec<f64>>,
        source_rank: usize,
    ) -> Result<Vec<f64>> {
        let contribution = Contribution::Broadcast {
            source: source_rank,
            value,
        };
        match self.run_round(rank, contribution)? {
            Reduced::Broadcast(value) => Ok(value),
            other => unreachable!("broadcast round folded to {other:?}"),
        }
    }
}

/// Fold a complete round of contributions, slots indexed by rank
fn reduce_round(slots: &[Option<Contribution>]) -> Outcome {
    let first = slots[0].as_ref().expect("round reduced before completion");

    match first {
        Contribution::Sum(_) => {
            let mut total: Option<Vec<f64>> = None;
            for (rank, slot) in slots.iter().enumerate() {
                let values = match slot.as_ref().expect("round reduced before completion") {
                    Contribution::Sum(values) => values,
                    other => {
                        return Err(format!(
                            "rank {rank} called {} while rank 0 called sum",
                            op_name(other)
                        ))
                    }
                };
                match &mut total {
                    None => total = Some(values.clone()),
                    Some(total) => {
                        if total.len() != values.len() {
                            return Err(format!(
                                "rank {rank} summed {} elements, previous ranks summed {}",
                                values.len(),
                                total.len()
                            ));
                        }
                        for (acc, value) in total.iter_mut().zip(values) {
                            *acc += value;
                        }
                    }
                }
            }
            Ok(Reduced::Sum(total.expect("round reduced before completion")))
        }

        Contribution::FoldMin(_) => {
            let mut candidates = Vec::new();
            for (rank, slot) in slots.iter().enumerate() {
                match slot.as_ref().expect("round reduced before completion") {
                    Contribution::FoldMin(Some(candidate)) => candidates.push((rank, *candidate)),
                    Contribution::FoldMin(None) => {}
                    other => {
                        return Err(format!(
                            "rank {rank} called {} while rank 0 called fold_min",
                            op_name(other)
                        ))
                    }
                }
            }
            Ok(Reduced::FoldMin(fold_candidates(candidates)))
        }

        Contribution::Broadcast { source, .. } => {
            let source = *source;
            if source >= slots.len() {
                return Err(format!(
                    "broadcast source rank {source} out of range for a group of {}",
                    slots.len()
                ));
            }
            let mut broadcast_value: Option<Vec<f64>> = None;
            for (rank, slot) in slots.iter().enumerate() {
                match slot.as_ref().expect("round reduced before completion") {
                    Contribution::Broadcast {
                        source: this_source,
                        value,
                    } => {
                        if *this_source != source {
                            return Err(format!(
                                "rank {rank} broadcast from source {this_source}, rank 0 from {source}"
                            ));
                        }
                        if rank == source {
                            broadcast_value = value.clone();
                        }
                    }
                    other => {
                        return Err(format!(
                            "rank {rank} called {} while rank 0 called broadcast",
                            op_name(other)
                        ))
                    }
                }
            }
            match broadcast_value {
                Some(value) => Ok(Reduced::Broadcast(value)),
                None => Err(format!("broadcast source rank {source} supplied no value")),
            }
        }
    }
}

fn op_name(contribution: &Contribution) -> &'static str {
    match contribution {
        Contribution::Sum(_) => "sum",
        Contribution::FoldMin(_) => "fold_min",
        Contribution::Broadcast { .. } => "broadcast",
    }
}

/// Multi-worker test harness helpers shared by the algorithm tests
#[cfg(test)]
pub(crate) mod sim {
    use super::*;

    /// Run `body` once per rank on its own thread, returning results in rank
    /// order
    pub(crate) fn run_workers<T, F>(size: usize, body: F) -> Vec<T>
    where
        T: Send,
        F: Fn(WorkerGroup) -> T + Sync,
    {
        let groups = LocalCollective::split(size).unwrap();
        let body = &body;
        crossbeam::thread::scope(|scope| {
            let handles: Vec<_> = groups
                .into_iter()
                .map(|group| scope.spawn(move |_| body(group)))
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect()
        })
        .unwrap()
    }
}
