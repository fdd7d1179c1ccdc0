//! Multi-Paxos replication for arbitrary in-process state machines.
//!
//! A [`Replica`] keeps one copy of an embedder-supplied [`Machine`]
//! consistent with every other node of its group: operations submitted
//! through [`Replica::request`] are sequenced into a replicated log by
//! the consensus engine and applied everywhere in the same order.

mod applier;
pub mod cluster;
mod engine;
pub mod error;
pub mod machine;
pub mod pool;
pub mod protocol;
pub mod server;

pub use cluster::Configuration;
pub use error::Error;
pub use machine::{Machine, Register};
pub use server::{Replica, ReplicaState};
