use std::fmt::{Display, Formatter};
use std::io;

#[derive(Debug)]
pub enum Error {
    // The local node id does not index the shared configuration
    NodeOutOfRange { node: u32, nodes: usize },
    // The configured listen address could not be bound
    Bind(io::Error),
    // The node's threads did not come up in time
    StartTimeout,
    // The node is tearing down
    ShuttingDown,
    // No leader applied the request within the retry budget
    RetriesExhausted,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NodeOutOfRange { node, nodes } => {
                write!(f, "node {} is not part of a group of {}", node, nodes)
            }
            Self::Bind(err) => write!(f, "could not bind the listen address: {}", err),
            Self::StartTimeout => write!(f, "the node did not start in time"),
            Self::ShuttingDown => write!(f, "the node is shutting down"),
            Self::RetriesExhausted => write!(f, "no leader answered within the retry budget"),
        }
    }
}

impl std::error::Error for Error {}
