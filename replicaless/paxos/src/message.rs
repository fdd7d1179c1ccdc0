//! Message types exchanged between replicas.
//!
//! This module provides data types for the RPCs a replica sends and
//! receives. The top-level request type is [`Rpc`]; every request has a
//! dedicated reply type. Byte-level framing lives with the transport,
//! not here.

use std::convert::TryInto;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::id::{NodeId, ProposalId};

/// A client operation captured in the replicated log.
///
/// `(origin, seq)` identifies the request for exactly-once application;
/// `op` is opaque to the consensus layer and only ever interpreted by
/// the embedder's state machine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Entry {
    /// The node the request entered the group through.
    pub origin: NodeId,

    /// The origin's request counter, starting at 1. A filler entry the
    /// leader uses to close a log gap carries 0 and is never applied.
    pub seq: u64,

    /// The externally-encoded operation.
    pub op: Bytes,
}

/// A request sent to a replica.
#[derive(Clone, Debug, PartialEq)]
pub enum Rpc {
    /// A candidate soliciting a ballot for a new term.
    Vote(VoteRequest),

    /// A leader learning what a peer has accepted at a slot.
    Prepare(PrepareRequest),

    /// A leader asking a peer to accept a value at a slot.
    Accept(AcceptRequest),

    /// A leader announcing a chosen value, or an empty-value heartbeat.
    Success(SuccessRequest),

    /// A follower forwarding a client request to the leader.
    Request(ClientRequest),
}

/// A request to obtain a ballot for `term`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VoteRequest {
    pub term: ProposalId,
}

/// The response to a [`VoteRequest`]: the peer's term from before the
/// request was processed. The candidate counts a ballot iff this is
/// strictly below its own term.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VoteReply {
    pub term: ProposalId,
}

/// A request for whatever a peer has accepted at `slot`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PrepareRequest {
    pub term: ProposalId,
    pub slot: u64,
}

/// The response to a [`PrepareRequest`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PrepareReply {
    /// The responder's current term. Strictly above the request term
    /// means the requester has been superseded.
    pub term: ProposalId,

    /// The highest proposal accepted at the requested slot, with its
    /// value, if the responder has one.
    pub accepted: Option<(ProposalId, Bytes)>,

    /// The first index past the responder's accepted values, or `None`
    /// when it has accepted nothing at or beyond the requested slot.
    pub next_unaccepted: Option<u64>,
}

/// A request to accept `value` at `slot` under `term`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AcceptRequest {
    pub term: ProposalId,
    pub slot: u64,
    pub value: Bytes,
}

/// The response to an [`AcceptRequest`]: the highest term the responder
/// has seen. Equal to the request term iff the value was accepted.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AcceptReply {
    pub term: ProposalId,
}

/// An announcement that `value` was chosen at `slot`. An empty value
/// chooses nothing and only serves as a leader heartbeat.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SuccessRequest {
    pub term: ProposalId,
    pub slot: u64,
    pub value: Bytes,
}

/// The acknowledgement of a [`SuccessRequest`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SuccessReply;

/// A client request forwarded to the node believed to be leading.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientRequest {
    pub entry: Entry,
}

/// The response to a [`ClientRequest`]. `leading == false` means the
/// responder is not the leader and the caller should retry after the
/// group settles; otherwise `result` holds the applied outcome.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClientReply {
    pub leading: bool,
    pub result: Option<Bytes>,
}

//
// Entry impls
//

impl Entry {
    /// A leader-issued entry that closes a log gap without touching the
    /// state machine.
    pub fn filler(origin: NodeId) -> Self {
        Entry {
            origin,
            seq: 0,
            op: Bytes::new(),
        }
    }

    /// Whether this entry mutates the state machine when applied.
    pub fn is_filler(&self) -> bool {
        self.seq == 0
    }

    /// Serialize to the in-log representation: fixed header fields
    /// followed by the length-prefixed operation bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16 + self.op.len());
        buf.put_u32_ne(self.origin.0);
        buf.put_u64_ne(self.seq);
        buf.put_u32_ne(self.op.len() as u32);
        buf.put_slice(&self.op);
        buf.freeze()
    }

    /// Deserialize from the in-log representation.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < 16 {
            return None;
        }
        let origin = NodeId(u32::from_ne_bytes(buf[0..4].try_into().ok()?));
        let seq = u64::from_ne_bytes(buf[4..12].try_into().ok()?);
        let len = u32::from_ne_bytes(buf[12..16].try_into().ok()?) as usize;
        if buf.len() != 16 + len {
            return None;
        }
        Some(Entry {
            origin,
            seq,
            op: Bytes::copy_from_slice(&buf[16..]),
        })
    }
}

//
// Rpc impls
//

impl fmt::Display for Rpc {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            Rpc::Vote(msg) => fmt::Display::fmt(msg, fmt),
            Rpc::Prepare(msg) => fmt::Display::fmt(msg, fmt),
            Rpc::Accept(msg) => fmt::Display::fmt(msg, fmt),
            Rpc::Success(msg) => fmt::Display::fmt(msg, fmt),
            Rpc::Request(msg) => fmt::Display::fmt(msg, fmt),
        }
    }
}

impl fmt::Display for VoteRequest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { term } = self;
        fmt.debug_struct("Vote")
            .field("term", &format_args!("{}", term))
            .finish()
    }
}

impl fmt::Display for PrepareRequest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { term, slot } = self;
        fmt.debug_struct("Prepare")
            .field("term", &format_args!("{}", term))
            .field("slot", slot)
            .finish()
    }
}

impl fmt::Display for AcceptRequest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { term, slot, value } = self;
        fmt.debug_struct("Accept")
            .field("term", &format_args!("{}", term))
            .field("slot", slot)
            .field("value", &value.len())
            .finish()
    }
}

impl fmt::Display for SuccessRequest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { term, slot, value } = self;
        if value.is_empty() {
            fmt.debug_struct("Heartbeat")
                .field("term", &format_args!("{}", term))
                .finish()
        } else {
            fmt.debug_struct("Success")
                .field("term", &format_args!("{}", term))
                .field("slot", slot)
                .field("value", &value.len())
                .finish()
        }
    }
}

impl fmt::Display for ClientRequest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { entry } = self;
        fmt.debug_struct("Request")
            .field("origin", &format_args!("{}", entry.origin))
            .field("seq", &entry.seq)
            .field("op", &entry.op.len())
            .finish()
    }
}
