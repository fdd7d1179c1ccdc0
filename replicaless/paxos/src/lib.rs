//! Multi-Paxos consensus state for a replicated operation log.
//!
//! This crate holds the passive half of the protocol: proposal
//! identifiers, RPC message types, the slot-indexed replicated log and
//! the per-replica [`core::State`] that folds requests into replies.
//! Everything here is synchronous and deterministic; sockets, threads
//! and timers belong to the embedding service.
//!
//! A group of [`core::State`] values wired together through any message
//! transport converges on a single sequence of chosen values:
//!
//! - candidates bump their term with [`core::State::begin_election`]
//!   and tally [`core::Ballot`]s with [`core::State::conclude_election`];
//! - the winner repairs the log through Prepare, then drives values
//!   through Accept and announces them through Success;
//! - every replica surrenders chosen values strictly in slot order via
//!   [`log::ReplicatedLog::applicable`].

mod id;
pub mod core;
pub mod log;
mod message;

pub use id::{NodeId, ProposalId};
pub use message::{
    AcceptReply, AcceptRequest, ClientReply, ClientRequest, Entry, PrepareReply, PrepareRequest,
    Rpc, SuccessReply, SuccessRequest, VoteReply, VoteRequest,
};
