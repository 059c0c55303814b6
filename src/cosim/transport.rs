//! Blocking point-to-point message transport between ranks.
//!
//! The protocol is lock-step: every receive blocks until the matching send
//! arrives, there is no timeout and no retry, and messages between a given
//! pair of ranks are delivered in order. A tag accompanies every message
//! (zero for the startup handshakes, the step number afterwards); a received
//! tag that differs from the expected one is a protocol violation, not
//! something to recover from.

use std::sync::mpsc::{channel, Receiver, Sender};

use thiserror::Error;

use super::Rank;

/// Typed array payload, mirroring the wire formats of the protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    F64(Vec<f64>),
    F32(Vec<f32>),
    I32(Vec<i32>),
    U32(Vec<u32>),
}

impl Payload {
    /// Wire-type name, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::F64(_) => "f64",
            Payload::F32(_) => "f32",
            Payload::I32(_) => "i32",
            Payload::U32(_) => "u32",
        }
    }

    /// Number of array elements.
    pub fn len(&self) -> usize {
        match self {
            Payload::F64(v) => v.len(),
            Payload::F32(v) => v.len(),
            Payload::I32(v) => v.len(),
            Payload::U32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unwrap as an f64 array of exactly `expected` elements.
    pub fn into_f64(self, expected: usize) -> Result<Vec<f64>, TransportError> {
        match self {
            Payload::F64(v) => check_len(v, expected),
            other => Err(TransportError::PayloadKind {
                got: other.kind(),
                expected: "f64",
            }),
        }
    }

    /// Unwrap as an f32 array of exactly `expected` elements.
    pub fn into_f32(self, expected: usize) -> Result<Vec<f32>, TransportError> {
        match self {
            Payload::F32(v) => check_len(v, expected),
            other => Err(TransportError::PayloadKind {
                got: other.kind(),
                expected: "f32",
            }),
        }
    }

    /// Unwrap as an i32 array of exactly `expected` elements.
    pub fn into_i32(self, expected: usize) -> Result<Vec<i32>, TransportError> {
        match self {
            Payload::I32(v) => check_len(v, expected),
            other => Err(TransportError::PayloadKind {
                got: other.kind(),
                expected: "i32",
            }),
        }
    }

    /// Unwrap as a u32 array of exactly `expected` elements.
    pub fn into_u32(self, expected: usize) -> Result<Vec<u32>, TransportError> {
        match self {
            Payload::U32(v) => check_len(v, expected),
            other => Err(TransportError::PayloadKind {
                got: other.kind(),
                expected: "u32",
            }),
        }
    }
}

fn check_len<T>(v: Vec<T>, expected: usize) -> Result<Vec<T>, TransportError> {
    if v.len() == expected {
        Ok(v)
    } else {
        Err(TransportError::Length {
            got: v.len(),
            expected,
        })
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer rank {0} disconnected")]
    Disconnected(Rank),
    #[error("message from rank {src} tagged {got}, expected {expected}")]
    TagMismatch { src: Rank, got: u32, expected: u32 },
    #[error("unexpected payload type: got {got}, expected {expected}")]
    PayloadKind {
        got: &'static str,
        expected: &'static str,
    },
    #[error("unexpected message length: got {got}, expected {expected}")]
    Length { got: usize, expected: usize },
}

/// Point-to-point transport seam. An MPI binding would implement this; the
/// in-process [`Endpoint`] implements it over channels for testing and
/// single-machine runs.
pub trait Transport {
    /// This endpoint's rank.
    fn rank(&self) -> Rank;

    /// Send a tagged message to `dst`.
    fn send(&mut self, dst: Rank, tag: u32, payload: Payload) -> Result<(), TransportError>;

    /// Block until the next message from `src` arrives; its tag must match.
    fn recv(&mut self, src: Rank, tag: u32) -> Result<Payload, TransportError>;

    /// Tear down the whole job. After this call every peer's pending or
    /// future receive fails with [`TransportError::Disconnected`].
    fn abort(&mut self);
}

struct Envelope {
    tag: u32,
    payload: Payload,
}

/// In-process endpoint backed by one ordered channel per directed rank pair.
pub struct Endpoint {
    rank: Rank,
    senders: Vec<Option<Sender<Envelope>>>,
    receivers: Vec<Option<Receiver<Envelope>>>,
}

/// Create the fully connected endpoints for an in-process job of
/// `num_ranks` ranks. Endpoint `i` belongs to rank `i`; move each one into
/// the thread that plays that rank.
pub fn router(num_ranks: usize) -> Vec<Endpoint> {
    let mut endpoints: Vec<Endpoint> = (0..num_ranks)
        .map(|rank| Endpoint {
            rank,
            senders: (0..num_ranks).map(|_| None).collect(),
            receivers: (0..num_ranks).map(|_| None).collect(),
        })
        .collect();

    for src in 0..num_ranks {
        for dst in 0..num_ranks {
            if src == dst {
                continue;
            }
            let (tx, rx) = channel();
            endpoints[src].senders[dst] = Some(tx);
            endpoints[dst].receivers[src] = Some(rx);
        }
    }

    endpoints
}

impl Transport for Endpoint {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn send(&mut self, dst: Rank, tag: u32, payload: Payload) -> Result<(), TransportError> {
        let tx = self
            .senders
            .get(dst)
            .and_then(|t| t.as_ref())
            .ok_or(TransportError::Disconnected(dst))?;
        tx.send(Envelope { tag, payload })
            .map_err(|_| TransportError::Disconnected(dst))
    }

    fn recv(&mut self, src: Rank, tag: u32) -> Result<Payload, TransportError> {
        let rx = self
            .receivers
            .get(src)
            .and_then(|r| r.as_ref())
            .ok_or(TransportError::Disconnected(src))?;
        let envelope = rx.recv().map_err(|_| TransportError::Disconnected(src))?;
        if envelope.tag != tag {
            return Err(TransportError::TagMismatch {
                src,
                got: envelope.tag,
                expected: tag,
            });
        }
        Ok(envelope.payload)
    }

    fn abort(&mut self) {
        // Dropping our ends disconnects every peer's matching channel.
        for tx in &mut self.senders {
            *tx = None;
        }
        for rx in &mut self.receivers {
            *rx = None;
        }
    }
}
