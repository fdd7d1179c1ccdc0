//! Node and proposal identifiers.

use std::cmp::Ordering;
use std::fmt;

/// The identity of a node within a replication group.
///
/// Node ids are positional: they index the group's shared configuration
/// and are never reused or reassigned.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct NodeId(pub u32);

/// A proposal number, unique across the group for all time.
///
/// Uniqueness comes from the `node` component being the proposer's own
/// id; freshness comes from the `round` component, which a candidate
/// bumps past every round it has seen. Comparison is lexicographic,
/// round first.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct ProposalId {
    /// The election round this proposal belongs to.
    pub round: u32,

    /// The node that issued the proposal.
    pub node: NodeId,
}

//
// NodeId impls
//

impl fmt::Display for NodeId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self(id) = self;
        fmt.debug_tuple("Node").field(id).finish()
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

//
// ProposalId impls
//

impl ProposalId {
    /// The proposal a node holds before it has seen any traffic.
    pub fn initial(node: NodeId) -> Self {
        Self { round: 0, node }
    }

    /// The proposal a candidate issues to supersede this one.
    pub fn bump(self, node: NodeId) -> Self {
        Self {
            round: self
                .round
                .checked_add(1)
                .unwrap_or_else(|| panic!("overflow")),
            node,
        }
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { round, node } = self;
        fmt.debug_tuple("Proposal")
            .field(round)
            .field(&node.0)
            .finish()
    }
}

impl PartialOrd for ProposalId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProposalId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.round, self.node).cmp(&(other.round, other.node))
    }
}
