//! Static group membership.

use std::net::SocketAddr;

use paxos::NodeId;

use crate::error::Error;

/// The ordered peer addresses of a replication group, indexed by node
/// id. Immutable after construction; every node of a group must be
/// constructed with the same value.
#[derive(Clone, Debug)]
pub struct Configuration {
    addrs: Vec<SocketAddr>,
}

impl Configuration {
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        Configuration { addrs }
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// The strict majority of the group.
    pub fn quorum(&self) -> usize {
        self.len() / 2 + 1
    }

    pub fn addr(&self, node: NodeId) -> Option<SocketAddr> {
        self.addrs.get(node.0 as usize).copied()
    }

    /// Every member of the group except `this`, in id order.
    pub fn peers(&self, this: NodeId) -> Vec<(NodeId, SocketAddr)> {
        self.addrs
            .iter()
            .enumerate()
            .map(|(id, addr)| (NodeId(id as u32), *addr))
            .filter(|(id, _)| *id != this)
            .collect()
    }

    /// Fatal at construction: a node must be able to find itself in the
    /// group it is joining.
    pub fn validate(&self, node: NodeId) -> Result<(), Error> {
        if (node.0 as usize) < self.len() {
            Ok(())
        } else {
            Err(Error::NodeOutOfRange {
                node: node.0,
                nodes: self.len(),
            })
        }
    }
}
