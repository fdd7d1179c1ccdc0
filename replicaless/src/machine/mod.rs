//! The embedder's replicated data structure.

pub mod register;

pub use register::Register;

/// The user-supplied mutable data structure kept consistent across the
/// group.
///
/// `apply` must be deterministic: every replica applies the same
/// operations in the same order, and all of them must end in the same
/// state. Operation and result encodings are the embedder's business;
/// the replication core never looks inside them.
pub trait Machine: Send {
    /// Apply one encoded operation and return its encoded result.
    fn apply(&mut self, op: &[u8]) -> Vec<u8>;
}
