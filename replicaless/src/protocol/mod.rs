//! The wire protocol replicas speak to each other.
//!
//! Every RPC is a single request/reply exchange on one TCP connection.
//! A request opens with a one-byte discriminator, followed by the
//! fields of its body in declaration order, each framed by the rules in
//! [`codec`]. The caller that wrote a request knows which reply shape
//! to read back, so replies carry no discriminator.
//!
//! Any framing violation ends the connection; the failed exchange is
//! reported to the caller as a dropped RPC and consensus state is left
//! untouched.

pub mod codec;
pub mod error;

#[cfg(test)]
mod tests;

use std::io::{Read, Write};

use paxos::{
    AcceptReply, AcceptRequest, ClientReply, ClientRequest, Entry, NodeId, PrepareReply,
    PrepareRequest, Rpc, SuccessReply, SuccessRequest, VoteReply, VoteRequest,
};

use codec::{read_bytes, read_opt, read_value, write_bytes, write_opt, write_value};
pub use error::ProtocolError;

/// Wire discriminators, one per RPC.
pub const VOTE: u8 = 0;
pub const PREPARE: u8 = 1;
pub const ACCEPT: u8 = 2;
pub const SUCCESS: u8 = 3;
pub const REQUEST: u8 = 4;

// the single positive acknowledgement byte
const ACK: u8 = 1;

/// Write one request frame.
pub fn write_request<W: Write>(stream: &mut W, rpc: &Rpc) -> Result<(), ProtocolError> {
    match rpc {
        Rpc::Vote(req) => {
            write_value(stream, &VOTE)?;
            write_value(stream, &req.term)?;
        }
        Rpc::Prepare(req) => {
            write_value(stream, &PREPARE)?;
            write_value(stream, &req.term)?;
            write_value(stream, &req.slot)?;
        }
        Rpc::Accept(req) => {
            write_value(stream, &ACCEPT)?;
            write_value(stream, &req.term)?;
            write_value(stream, &req.slot)?;
            write_bytes(stream, &req.value)?;
        }
        Rpc::Success(req) => {
            write_value(stream, &SUCCESS)?;
            write_value(stream, &req.term)?;
            write_value(stream, &req.slot)?;
            write_bytes(stream, &req.value)?;
        }
        Rpc::Request(req) => {
            write_value(stream, &REQUEST)?;
            write_value(stream, &req.entry.origin.0)?;
            write_value(stream, &req.entry.seq)?;
            write_bytes(stream, &req.entry.op)?;
        }
    }
    stream.flush()?;
    Ok(())
}

/// Read one request frame.
pub fn read_request<R: Read>(stream: &mut R) -> Result<Rpc, ProtocolError> {
    let tag: u8 = read_value(stream)?;
    match tag {
        VOTE => Ok(Rpc::Vote(VoteRequest {
            term: read_value(stream)?,
        })),
        PREPARE => Ok(Rpc::Prepare(PrepareRequest {
            term: read_value(stream)?,
            slot: read_value(stream)?,
        })),
        ACCEPT => Ok(Rpc::Accept(AcceptRequest {
            term: read_value(stream)?,
            slot: read_value(stream)?,
            value: read_bytes(stream)?,
        })),
        SUCCESS => Ok(Rpc::Success(SuccessRequest {
            term: read_value(stream)?,
            slot: read_value(stream)?,
            value: read_bytes(stream)?,
        })),
        REQUEST => Ok(Rpc::Request(ClientRequest {
            entry: Entry {
                origin: NodeId(read_value(stream)?),
                seq: read_value(stream)?,
                op: read_bytes(stream)?,
            },
        })),
        tag => Err(ProtocolError::UnknownTag(tag)),
    }
}

/// A reply with a byte-level encoding, read back by the caller that
/// wrote the matching request.
pub trait WireReply: Sized {
    fn write<W: Write>(&self, stream: &mut W) -> Result<(), ProtocolError>;
    fn read<R: Read>(stream: &mut R) -> Result<Self, ProtocolError>;
}

impl WireReply for VoteReply {
    fn write<W: Write>(&self, stream: &mut W) -> Result<(), ProtocolError> {
        write_value(stream, &self.term)?;
        stream.flush()?;
        Ok(())
    }

    fn read<R: Read>(stream: &mut R) -> Result<Self, ProtocolError> {
        Ok(VoteReply {
            term: read_value(stream)?,
        })
    }
}

impl WireReply for PrepareReply {
    fn write<W: Write>(&self, stream: &mut W) -> Result<(), ProtocolError> {
        write_value(stream, &self.term)?;
        write_opt(stream, &self.accepted, |stream, (proposal, value)| {
            write_value(stream, proposal)?;
            write_bytes(stream, value)?;
            Ok(())
        })?;
        write_opt(stream, &self.next_unaccepted, |stream, index| {
            write_value(stream, index)?;
            Ok(())
        })?;
        stream.flush()?;
        Ok(())
    }

    fn read<R: Read>(stream: &mut R) -> Result<Self, ProtocolError> {
        Ok(PrepareReply {
            term: read_value(stream)?,
            accepted: read_opt(stream, |stream| {
                let proposal = read_value(stream)?;
                let value = read_bytes(stream)?;
                Ok((proposal, value))
            })?,
            next_unaccepted: read_opt(stream, |stream| Ok(read_value(stream)?))?,
        })
    }
}

impl WireReply for AcceptReply {
    fn write<W: Write>(&self, stream: &mut W) -> Result<(), ProtocolError> {
        write_value(stream, &self.term)?;
        stream.flush()?;
        Ok(())
    }

    fn read<R: Read>(stream: &mut R) -> Result<Self, ProtocolError> {
        Ok(AcceptReply {
            term: read_value(stream)?,
        })
    }
}

impl WireReply for SuccessReply {
    fn write<W: Write>(&self, stream: &mut W) -> Result<(), ProtocolError> {
        write_value(stream, &ACK)?;
        stream.flush()?;
        Ok(())
    }

    fn read<R: Read>(stream: &mut R) -> Result<Self, ProtocolError> {
        let ack: u8 = read_value(stream)?;
        if ack == ACK {
            Ok(SuccessReply)
        } else {
            Err(ProtocolError::UnknownTag(ack))
        }
    }
}

impl WireReply for ClientReply {
    fn write<W: Write>(&self, stream: &mut W) -> Result<(), ProtocolError> {
        write_value(stream, &(self.leading as u8))?;
        write_opt(stream, &self.result, |stream, result| {
            write_bytes(stream, result)?;
            Ok(())
        })?;
        stream.flush()?;
        Ok(())
    }

    fn read<R: Read>(stream: &mut R) -> Result<Self, ProtocolError> {
        let leading: u8 = read_value(stream)?;
        Ok(ClientReply {
            leading: leading != 0,
            result: read_opt(stream, |stream| Ok(read_bytes(stream)?))?,
        })
    }
}
