//! Hub-based TCP collective backend
//!
//! Multi-process worker groups rendezvous through a central hub. The hub
//! accepts exactly one connection per rank, validates the join handshake
//! (protocol version, agreed group size, rank uniqueness), then serves
//! collective rounds: it reads one request per rank, folds the contributions
//! in ascending rank order, and answers every rank with the identical result.
//! Because the hub answers only once the whole group has contributed, a
//! worker blocking on its response is exactly the collective barrier.
//!
//! The hub side is async (tokio); the worker side, [`HubCollective`], is a
//! blocking `std::net` client, since collective calls are synchronous
//! barriers issued from worker threads.
//!
//! The handshake turns the otherwise-undetectable group mismatch (workers
//! disagreeing on group size, duplicate ranks, mixed protocol versions) into
//! a reported `GroupMismatch` error instead of an indefinite block. A worker
//! that joins correctly and then never issues the matching collective call
//! still stalls the group; there is no timeout in this core.

use super::protocol::{
    read_message, read_message_async, write_message, write_message_async, CollectiveOp,
    CollectiveResult, FaultMessage, JoinAckMessage, JoinMessage, Message, RejectMessage,
    RequestMessage, ResponseMessage, PROTOCOL_VERSION,
};
use super::{fold_candidates, CollectiveChannel, MinCandidate, MinWinner, WorkerGroup};
use crate::error::RecenterError;
use crate::Result;
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};

/// Central reduction hub for one multi-process worker group
///
/// Bind, share the address with the workers, then [`serve`](Self::serve)
/// until the group disconnects.
pub struct CollectiveHub {
    listener: TcpListener,
    size: usize,
}

/// One joined worker connection, indexed by rank while serving rounds
struct Member {
    stream: TcpStream,
    node: String,
}

impl CollectiveHub {
    /// Bind the hub listener for a group of `size` workers
    pub async fn bind(addr: &str, size: usize) -> Result<Self> {
        if size == 0 {
            anyhow::bail!("worker group size must be at least 1");
        }
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind hub listener on {addr}"))?;
        Ok(Self { listener, size })
    }

    /// Address the hub is listening on
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to get hub listener address")
    }

    /// Accept the full group, then serve collective rounds until the workers
    /// disconnect
    ///
    /// Returns once every worker has closed its connection after a completed
    /// round; returns an error if a round cannot be completed (a worker died
    /// mid-round or the group disagreed on the operation).
    pub async fn serve(self) -> Result<()> {
        let mut members = self.accept_group().await?;
        let mut sequence = 0u64;

        loop {
            match self.serve_round(&mut members, sequence).await? {
                RoundOutcome::Completed => sequence += 1,
                RoundOutcome::Shutdown => return Ok(()),
            }
        }
    }

    /// Accept connections until every rank has joined
    ///
    /// Bad joins (version skew, size disagreement, duplicate or out-of-range
    /// rank) are rejected with a reason and the slot stays open for a correct
    /// joiner.
    async fn accept_group(&self) -> Result<Vec<Member>> {
        let mut slots: Vec<Option<Member>> = Vec::with_capacity(self.size);
        slots.resize_with(self.size, || None);
        let mut joined = 0;

        while joined < self.size {
            let (mut stream, peer) = self
                .listener
                .accept()
                .await
                .context("Failed to accept worker connection")?;

            let join = match read_message_async(&mut stream).await {
                Ok(Message::Join(join)) => join,
                Ok(_) | Err(_) => continue, // not a joiner, drop it
            };

            if let Some(reason) = self.join_violation(&join, &slots) {
                let reject = Message::Reject(RejectMessage {
                    reason: format!("{reason} (peer {peer})"),
                });
                // Best effort: the worker may already be gone.
                let _ = write_message_async(&mut stream, &reject).await;
                continue;
            }

            write_message_async(
                &mut stream,
                &Message::JoinAck(JoinAckMessage {
                    group_size: self.size,
                }),
            )
            .await
            .with_context(|| format!("Failed to ack join of rank {}", join.rank))?;

            slots[join.rank] = Some(Member {
                stream,
                node: join.node,
            });
            joined += 1;
        }

        Ok(slots
            .into_iter()
            .map(|slot| slot.expect("all ranks joined"))
            .collect())
    }

    /// Check a join request against the hub's group and the ranks already
    /// seated
    fn join_violation(&self, join: &JoinMessage, slots: &[Option<Member>]) -> Option<String> {
        if join.protocol_version != PROTOCOL_VERSION {
            return Some(format!(
                "protocol version {} does not match hub version {}",
                join.protocol_version, PROTOCOL_VERSION
            ));
        }
        if join.group_size != self.size {
            return Some(format!(
                "worker expects a group of {}, hub serves a group of {}",
                join.group_size, self.size
            ));
        }
        if join.rank >= self.size {
            return Some(format!(
                "rank {} out of range for a group of {}",
                join.rank, self.size
            ));
        }
        if let Some(member) = &slots[join.rank] {
            return Some(format!(
                "rank {} already joined from node {}",
                join.rank, member.node
            ));
        }
        None
    }

    /// Serve one collective round across all members
    async fn serve_round(
        &self,
        members: &mut [Member],
        sequence: u64,
    ) -> Result<RoundOutcome> {
        let mut requests: Vec<RequestMessage> = Vec::with_capacity(members.len());
        let mut failure: Option<String> = None;

        for (rank, member) in members.iter_mut().enumerate() {
            match read_message_async(&mut member.stream).await {
                Ok(Message::Request(request)) => requests.push(request),
                Ok(other) => {
                    failure = Some(format!("rank {rank} sent {other:?} instead of a request"));
                    break;
                }
                Err(err) if rank == 0 && is_clean_eof(&err) => {
                    // Rank 0 closed between rounds: the group is done.
                    return Ok(RoundOutcome::Shutdown);
                }
                Err(err) => {
                    failure = Some(format!(
                        "rank {rank} (node {}) dropped mid-round: {err:#}",
                        member.node
                    ));
                    break;
                }
            }
        }

        if let Some(reason) = failure {
            self.fault_all(members, &reason).await;
            anyhow::bail!("{reason}");
        }

        let result = match fold_requests(sequence, &requests) {
            Ok(result) => result,
            Err(reason) => {
                self.fault_all(members, &reason).await;
                anyhow::bail!("collective round {sequence} failed: {reason}");
            }
        };

        for member in members.iter_mut() {
            write_message_async(
                &mut member.stream,
                &Message::Response(ResponseMessage {
                    sequence,
                    result: result.clone(),
                }),
            )
            .await
            .with_context(|| format!("Failed to answer node {}", member.node))?;
        }

        Ok(RoundOutcome::Completed)
    }

    /// Best-effort fault notification to every member
    async fn fault_all(&self, members: &mut [Member], reason: &str) {
        let fault = Message::Fault(FaultMessage {
            reason: reason.to_string(),
        });
        for member in members.iter_mut() {
            let _ = write_message_async(&mut member.stream, &fault).await;
        }
    }
}

enum RoundOutcome {
    Completed,
    Shutdown,
}

/// Whether an error is a plain end-of-stream on an otherwise healthy socket
fn is_clean_eof(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>()
        .map(|io| io.kind() == std::io::ErrorKind::UnexpectedEof)
        .unwrap_or(false)
}

/// Fold a complete round of rank-ordered requests into the group result
fn fold_requests(
    sequence: u64,
    requests: &[RequestMessage],
) -> std::result::Result<CollectiveResult, String> {
    for (rank, request) in requests.iter().enumerate() {
        if request.sequence != sequence {
            return Err(format!(
                "rank {rank} is on round {}, hub is on round {sequence}",
                request.sequence
            ));
        }
        if request.op.kind() != requests[0].op.kind() {
            return Err(format!(
                "rank {rank} called {} while rank 0 called {}",
                request.op.kind(),
                requests[0].op.kind()
            ));
        }
    }

    match &requests[0].op {
        CollectiveOp::Sum { values: first } => {
            let mut total = first.clone();
            for (rank, request) in requests.iter().enumerate().skip(1) {
                let values = match &request.op {
                    CollectiveOp::Sum { values } => values,
                    _ => unreachable!("op kinds verified above"),
                };
                if values.len() != total.len() {
                    return Err(format!(
                        "rank {rank} summed {} elements, rank 0 summed {}",
                        values.len(),
                        total.len()
                    ));
                }
                for (acc, value) in total.iter_mut().zip(values) {
                    *acc += value;
                }
            }
            Ok(CollectiveResult::Sum { values: total })
        }

        CollectiveOp::FoldMin { .. } => {
            let mut candidates: Vec<(usize, MinCandidate)> = Vec::new();
            for (rank, request) in requests.iter().enumerate() {
                let candidate = match &request.op {
                    CollectiveOp::FoldMin { candidate } => candidate,
                    _ => unreachable!("op kinds verified above"),
                };
                if let Some(candidate) = candidate {
                    candidates.push((rank, *candidate));
                }
            }
            Ok(CollectiveResult::FoldMin {
                winner: fold_candidates(candidates),
            })
        }

        CollectiveOp::Broadcast { source, .. } => {
            let source = *source;
            if source >= requests.len() {
                return Err(format!(
                    "broadcast source rank {source} out of range for a group of {}",
                    requests.len()
                ));
            }
            let mut broadcast_value: Option<Vec<f64>> = None;
            for (rank, request) in requests.iter().enumerate() {
                let (this_source, value) = match &request.op {
                    CollectiveOp::Broadcast { source, value } => (source, value),
                    _ => unreachable!("op kinds verified above"),
                };
                if *this_source != source {
                    return Err(format!(
                        "rank {rank} broadcast from source {this_source}, rank 0 from {source}"
                    ));
                }
                if rank == source {
                    broadcast_value = value.clone();
                }
            }
            broadcast_value
                .map(|value| CollectiveResult::Broadcast { value })
                .ok_or_else(|| format!("broadcast source rank {source} supplied no value"))
        }
    }
}

/// Worker-side state behind the channel mutex
struct ClientState {
    stream: std::net::TcpStream,
    sequence: u64,
}

/// Blocking worker endpoint of the hub collective
///
/// One per worker process. Joins at construction, then implements
/// [`CollectiveChannel`] by exchanging one framed request/response pair per
/// collective round.
pub struct HubCollective {
    rank: usize,
    size: usize,
    state: Mutex<ClientState>,
}

impl HubCollective {
    /// Connect to the hub and join the group as `rank`
    pub fn connect(
        addr: impl std::net::ToSocketAddrs,
        rank: usize,
        group_size: usize,
    ) -> Result<Self> {
        if group_size == 0 {
            anyhow::bail!("worker group size must be at least 1");
        }
        if rank >= group_size {
            return Err(RecenterError::RankOutOfRange {
                rank,
                size: group_size,
            }
            .into());
        }

        let mut stream =
            std::net::TcpStream::connect(addr).context("Failed to connect to collective hub")?;
        stream
            .set_nodelay(true)
            .context("Failed to disable Nagle on hub connection")?;

        write_message(
            &mut stream,
            &Message::Join(JoinMessage {
                protocol_version: PROTOCOL_VERSION,
                rank,
                group_size,
                node: node_id(),
            }),
        )
        .context("Failed to send join")?;

        match read_message(&mut stream).context("Failed to read join reply")? {
            Message::JoinAck(ack) => {
                if ack.group_size != group_size {
                    return Err(RecenterError::mismatch(format!(
                        "hub acked a group of {}, worker expects {}",
                        ack.group_size, group_size
                    ))
                    .into());
                }
            }
            Message::Reject(reject) => {
                return Err(RecenterError::mismatch(reject.reason).into());
            }
            other => {
                return Err(RecenterError::mismatch(format!(
                    "unexpected join reply {other:?}"
                ))
                .into());
            }
        }

        Ok(Self {
            rank,
            size: group_size,
            state: Mutex::new(ClientState {
                stream,
                sequence: 0,
            }),
        })
    }

    /// Wrap this endpoint into the [`WorkerGroup`] handle the algorithms take
    pub fn into_group(self) -> Result<WorkerGroup> {
        let rank = self.rank;
        WorkerGroup::new(rank, Arc::new(self))
    }

    /// One blocking request/response exchange (the collective barrier)
    fn exchange(&self, rank: usize, op: CollectiveOp) -> Result<CollectiveResult> {
        if rank != self.rank {
            return Err(RecenterError::mismatch(format!(
                "endpoint joined as rank {}, called as rank {rank}",
                self.rank
            ))
            .into());
        }

        let mut state = self
            .state
            .lock()
            .expect("hub endpoint poisoned by a panicked worker");
        let sequence = state.sequence;

        write_message(
            &mut state.stream,
            &Message::Request(RequestMessage { sequence, op }),
        )
        .context("Failed to send collective request")?;

        match read_message(&mut state.stream).context("Failed to read collective response")? {
            Message::Response(response) => {
                if response.sequence != sequence {
                    return Err(RecenterError::mismatch(format!(
                        "hub answered round {}, worker is on round {sequence}",
                        response.sequence
                    ))
                    .into());
                }
                state.sequence += 1;
                Ok(response.result)
            }
            Message::Fault(fault) => Err(RecenterError::mismatch(fault.reason).into()),
            other => Err(RecenterError::mismatch(format!(
                "unexpected collective reply {other:?}"
            ))
            .into()),
        }
    }
}

impl std::fmt::Debug for HubCollective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubCollective")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

impl CollectiveChannel for HubCollective {
    fn size(&self) -> usize {
        self.size
    }

    fn sum(&self, rank: usize, local: &[f64]) -> Result<Vec<f64>> {
        match self.exchange(
            rank,
            CollectiveOp::Sum {
                values: local.to_vec(),
            },
        )? {
            CollectiveResult::Sum { values } => Ok(values),
            other => Err(RecenterError::mismatch(format!(
                "hub answered a sum round with {other:?}"
            ))
            .into()),
        }
    }

    fn fold_min(&self, rank: usize, candidate: Option<MinCandidate>) -> Result<Option<MinWinner>> {
        match self.exchange(rank, CollectiveOp::FoldMin { candidate })? {
            CollectiveResult::FoldMin { winner } => Ok(winner),
            other => Err(RecenterError::mismatch(format!(
                "hub answered a fold_min round with {other:?}"
            ))
            .into()),
        }
    }

    fn broadcast(
        &self,
        rank: usize,
        value: Option<Vec<f64>>,
        source_rank: usize,
    ) -> Result<Vec<f64>> {
        match self.exchange(
            rank,
            CollectiveOp::Broadcast {
                source: source_rank,
                value,
            },
        )? {
            CollectiveResult::Broadcast { value } => Ok(value),
            other => Err(RecenterError::mismatch(format!(
                "hub answered a broadcast round with {other:?}"
            ))
            .into()),
        }
    }
}

/// Node identifier for the join handshake (hostname, or "unknown")
fn node_id() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_hub(size: usize) -> (SocketAddr, std::thread::JoinHandle<Result<()>>) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let hub = runtime
            .block_on(CollectiveHub::bind("127.0.0.1:0", size))
            .unwrap();
        let addr = hub.local_addr().unwrap();
        let handle = std::thread::spawn(move || runtime.block_on(hub.serve()));
        (addr, handle)
    }

    #[test]
    fn test_hub_round_trip_all_ops() {
        let (addr, hub) = spawn_hub(3);

        let results = crossbeam::thread::scope(|scope| {
            let handles: Vec<_> = (0..3)
                .map(|rank| {
                    scope.spawn(move |_| {
                        let group = HubCollective::connect(addr, rank, 3)
                            .unwrap()
                            .into_group()
                            .unwrap();

                        let total = group.sum(&[rank as f64, 1.0]).unwrap();

                        let candidate = MinCandidate {
                            key: -(rank as f64),
                            local_index: rank,
                            payload: [rank as f64; 3],
                        };
                        let winner = group.fold_min(Some(candidate)).unwrap().unwrap();

                        let value = (rank == 1).then(|| vec![2.71]);
                        let replicated = group.broadcast(value, 1).unwrap();

                        (total, winner, replicated)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect::<Vec<_>>()
        })
        .unwrap();

        for (total, winner, replicated) in &results {
            assert_eq!(total, &vec![3.0, 3.0]);
            assert_eq!(winner.key, -2.0);
            assert_eq!(winner.owner_rank, 2);
            assert_eq!(winner.payload, [2.0; 3]);
            assert_eq!(replicated, &vec![2.71]);
        }

        hub.join().unwrap().unwrap();
    }

    #[test]
    fn test_hub_rejects_wrong_group_size() {
        let (addr, hub) = spawn_hub(2);

        // Wrong expected size: rejected without consuming a rank slot.
        let err = HubCollective::connect(addr, 1, 3).unwrap_err();
        let err = err.downcast_ref::<RecenterError>().unwrap();
        assert!(matches!(err, RecenterError::GroupMismatch { .. }));

        // A correct pair still forms the group and completes a round.
        let results = crossbeam::thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|rank| {
                    scope.spawn(move |_| {
                        let group = HubCollective::connect(addr, rank, 2)
                            .unwrap()
                            .into_group()
                            .unwrap();
                        group.sum(&[1.0]).unwrap()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect::<Vec<_>>()
        })
        .unwrap();
        assert!(results.iter().all(|total| total == &vec![2.0]));

        hub.join().unwrap().unwrap();
    }

    #[test]
    fn test_hub_rejects_duplicate_rank() {
        let (addr, hub) = spawn_hub(2);

        let first = HubCollective::connect(addr, 0, 2).unwrap();
        assert_eq!(
            format!("{first:?}"),
            "HubCollective { rank: 0, size: 2 }"
        );

        let err = HubCollective::connect(addr, 0, 2).unwrap_err();
        let err = err.downcast_ref::<RecenterError>().unwrap();
        assert!(matches!(err, RecenterError::GroupMismatch { .. }));

        let results = crossbeam::thread::scope(|scope| {
            let zero = scope.spawn(move |_| {
                let group = first.into_group().unwrap();
                group.sum(&[0.5]).unwrap()
            });
            let one = scope.spawn(move |_| {
                let group = HubCollective::connect(addr, 1, 2)
                    .unwrap()
                    .into_group()
                    .unwrap();
                group.sum(&[0.25]).unwrap()
            });
            (zero.join().unwrap(), one.join().unwrap())
        })
        .unwrap();
        assert_eq!(results.0, vec![0.75]);
        assert_eq!(results.1, vec![0.75]);

        hub.join().unwrap().unwrap();
    }

    #[test]
    fn test_client_rank_out_of_range() {
        let err = HubCollective::connect("127.0.0.1:1", 4, 4).unwrap_err();
        let err = err.downcast_ref::<RecenterError>().unwrap();
        assert!(matches!(err, RecenterError::RankOutOfRange { rank: 4, size: 4 }));
    }
}
