//! Socket pools: outbound connection recycling and the inbound
//! terminal multiplexer.

pub mod inbound;
pub mod outbound;

#[cfg(test)]
mod tests;

pub use inbound::{Demux, TerminalPool};
pub use outbound::ConnectionPool;
