use std::fmt::{Display, Formatter};
use std::io;

/// A violation of the wire protocol on a connection. Either kind ends
/// the connection; neither touches consensus state.
#[derive(Debug)]
pub enum ProtocolError {
    // The underlying transport failed or timed out
    Io(io::Error),
    // The frame opened with a discriminator no RPC uses
    UnknownTag(u8),
    // A length prefix exceeded the slab ceiling
    Oversize(u32),
}

impl Display for ProtocolError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "{}", err),
            Self::UnknownTag(tag) => write!(f, "unknown rpc discriminator {}", tag),
            Self::Oversize(len) => write!(f, "length prefix {} exceeds the slab ceiling", len),
        }
    }
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}
