//! Hub collective wire protocol
//!
//! Message definitions and framing for the TCP collective. Messages are
//! MessagePack-encoded (rmp-serde) and framed with a 4-byte little-endian
//! length prefix:
//!
//! ```text
//! [4 bytes: message length][N bytes: MessagePack-serialized message]
//! ```
//!
//! # Message Flow
//!
//! ```text
//! Worker                          Hub
//!   |                              |
//!   |-------- JOIN --------------->|   (version, rank, group size, node id)
//!   |<------- JOIN_ACK ------------|   (or REJECT on a bad handshake)
//!   |                              |
//!   |-- REQUEST(seq, op) --------->|   (one per collective round)
//!   |        ... hub waits for every rank's request ...
//!   |<- RESPONSE(seq, result) -----|   (or FAULT when the round disagrees)
//!   |                              |
//! ```
//!
//! The hub answers a round only after all ranks have contributed, so a
//! worker blocking on its response is exactly the collective barrier.

use crate::group::{MinCandidate, MinWinner};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version
///
/// Increment on breaking changes; hub and workers must match exactly.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a single framed message
///
/// Collective payloads are tiny (a handful of f64s); anything bigger than
/// this is a corrupted or hostile frame.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Messages exchanged between workers and the hub
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Worker requests group membership
    Join(JoinMessage),
    /// Hub accepted the join
    JoinAck(JoinAckMessage),
    /// Hub refused the join
    Reject(RejectMessage),
    /// One worker's contribution to a collective round
    Request(RequestMessage),
    /// The folded result of a completed round
    Response(ResponseMessage),
    /// The round (or the session) failed group-wide
    Fault(FaultMessage),
}

/// Join handshake sent by each worker after connecting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinMessage {
    /// Must equal [`PROTOCOL_VERSION`]
    pub protocol_version: u32,
    /// Rank this worker claims, must be unique in `0..group_size`
    pub rank: usize,
    /// Group size this worker expects; all joiners must agree
    pub group_size: usize,
    /// Hostname of the joining worker, for diagnostics
    pub node: String,
}

/// Hub's acknowledgement of a successful join
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinAckMessage {
    /// Size of the group the hub is serving
    pub group_size: usize,
}

/// Hub's refusal of a join
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectMessage {
    pub reason: String,
}

/// One worker's contribution to collective round `sequence`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMessage {
    /// Round counter; all ranks must be on the same round
    pub sequence: u64,
    /// The collective operation and this worker's contribution to it
    pub op: CollectiveOp,
}

/// Collective operation carried by a request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CollectiveOp {
    /// Elementwise global sum
    Sum { values: Vec<f64> },
    /// Global argmin with payload; `None` = no local candidate
    FoldMin { candidate: Option<MinCandidate> },
    /// Replicate `value` from rank `source`; non-source ranks pass `None`
    Broadcast {
        source: usize,
        value: Option<Vec<f64>>,
    },
}

impl CollectiveOp {
    /// Operation name for mismatch diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            CollectiveOp::Sum { .. } => "sum",
            CollectiveOp::FoldMin { .. } => "fold_min",
            CollectiveOp::Broadcast { .. } => "broadcast",
        }
    }
}

/// Folded result of round `sequence`, identical for every rank
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub sequence: u64,
    pub result: CollectiveResult,
}

/// Result payload matching the round's [`CollectiveOp`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CollectiveResult {
    Sum { values: Vec<f64> },
    FoldMin { winner: Option<MinWinner> },
    Broadcast { value: Vec<f64> },
}

/// Group-wide failure of a round or session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultMessage {
    pub reason: String,
}

/// Serialize a message with its length prefix
pub fn frame_message(msg: &Message) -> Result<Vec<u8>> {
    let body = rmp_serde::to_vec(msg).context("Failed to serialize message")?;

    let mut framed = Vec::with_capacity(4 + body.len());
    framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
    framed.extend_from_slice(&body);
    Ok(framed)
}

fn decode_length(len_buf: [u8; 4]) -> Result<usize> {
    let msg_len = u32::from_le_bytes(len_buf) as usize;
    if msg_len > MAX_MESSAGE_SIZE {
        anyhow::bail!("Message too large: {} bytes", msg_len);
    }
    Ok(msg_len)
}

/// Read one framed message from a blocking stream (worker side)
pub fn read_message(stream: &mut impl Read) -> Result<Message> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .context("Failed to read message length")?;
    let msg_len = decode_length(len_buf)?;

    let mut msg_buf = vec![0u8; msg_len];
    stream
        .read_exact(&mut msg_buf)
        .context("Failed to read message body")?;

    rmp_serde::from_slice(&msg_buf).context("Failed to deserialize message")
}

/// Write one framed message to a blocking stream (worker side)
pub fn write_message(stream: &mut impl Write, msg: &Message) -> Result<()> {
    let framed = frame_message(msg)?;
    stream.write_all(&framed).context("Failed to write message")?;
    stream.flush().context("Failed to flush stream")?;
    Ok(())
}

/// Read one framed message from an async stream (hub side)
pub async fn read_message_async(stream: &mut (impl AsyncRead + Unpin)) -> Result<Message> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .context("Failed to read message length")?;
    let msg_len = decode_length(len_buf)?;

    let mut msg_buf = vec![0u8; msg_len];
    stream
        .read_exact(&mut msg_buf)
        .await
        .context("Failed to read message body")?;

    rmp_serde::from_slice(&msg_buf).context("Failed to deserialize message")
}

/// Write one framed message to an async stream (hub side)
pub async fn write_message_async(
    stream: &mut (impl AsyncWrite + Unpin),
    msg: &Message,
) -> Result<()> {
    let framed = frame_message(msg)?;
    stream
        .write_all(&framed)
        .await
        .context("Failed to write message")?;
    stream.flush().await.context("Failed to flush stream")?;
    Ok(())
}
