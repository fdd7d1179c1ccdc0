//! Fixed-width value framing.
//!
//! A value of known byte size moves as exactly that many raw bytes in
//! native byte order; the group is homogeneous-architecture by contract
//! and cross-endian interop is a declared non-goal. Variable-length
//! data travels as a `u32` length prefix followed by the slab, and an
//! optional field as a presence byte followed by the value.

use std::convert::TryInto;
use std::io::{self, Read, Write};

use bytes::Bytes;

use paxos::{NodeId, ProposalId};

use super::error::ProtocolError;

/// Ceiling on any length prefix; a peer announcing more is broken.
pub const MAX_SLAB: u32 = 16 * 1024 * 1024;

const SCRATCH: usize = 16;

/// A value with a fixed-size raw wire representation.
pub trait Wire: Sized {
    const SIZE: usize;

    fn put(&self, buf: &mut [u8]);
    fn take(buf: &[u8]) -> Self;
}

impl Wire for u8 {
    const SIZE: usize = 1;

    fn put(&self, buf: &mut [u8]) {
        buf[0] = *self;
    }

    fn take(buf: &[u8]) -> Self {
        buf[0]
    }
}

impl Wire for u32 {
    const SIZE: usize = 4;

    fn put(&self, buf: &mut [u8]) {
        buf.copy_from_slice(&self.to_ne_bytes());
    }

    fn take(buf: &[u8]) -> Self {
        u32::from_ne_bytes(buf.try_into().unwrap_or_default())
    }
}

impl Wire for u64 {
    const SIZE: usize = 8;

    fn put(&self, buf: &mut [u8]) {
        buf.copy_from_slice(&self.to_ne_bytes());
    }

    fn take(buf: &[u8]) -> Self {
        u64::from_ne_bytes(buf.try_into().unwrap_or_default())
    }
}

impl Wire for ProposalId {
    const SIZE: usize = 8;

    fn put(&self, buf: &mut [u8]) {
        self.round.put(&mut buf[..4]);
        self.node.0.put(&mut buf[4..]);
    }

    fn take(buf: &[u8]) -> Self {
        ProposalId {
            round: u32::take(&buf[..4]),
            node: NodeId(u32::take(&buf[4..])),
        }
    }
}

/// Write exactly `T::SIZE` bytes of `value`.
pub fn write_value<W: Write, T: Wire>(stream: &mut W, value: &T) -> io::Result<()> {
    let mut buf = [0u8; SCRATCH];
    value.put(&mut buf[..T::SIZE]);
    stream.write_all(&buf[..T::SIZE])
}

/// Read exactly `T::SIZE` bytes and reinterpret them as a `T`.
pub fn read_value<R: Read, T: Wire>(stream: &mut R) -> io::Result<T> {
    let mut buf = [0u8; SCRATCH];
    stream.read_exact(&mut buf[..T::SIZE])?;
    Ok(T::take(&buf[..T::SIZE]))
}

/// Write a length-prefixed byte slab.
pub fn write_bytes<W: Write>(stream: &mut W, bytes: &[u8]) -> io::Result<()> {
    write_value(stream, &(bytes.len() as u32))?;
    stream.write_all(bytes)
}

/// Read a length-prefixed byte slab.
pub fn read_bytes<R: Read>(stream: &mut R) -> Result<Bytes, ProtocolError> {
    let len: u32 = read_value(stream)?;
    if len > MAX_SLAB {
        return Err(ProtocolError::Oversize(len));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf)?;
    Ok(Bytes::from(buf))
}

/// Write a presence byte, then the value when present.
pub fn write_opt<W, T, F>(stream: &mut W, value: &Option<T>, write: F) -> Result<(), ProtocolError>
where
    W: Write,
    F: FnOnce(&mut W, &T) -> Result<(), ProtocolError>,
{
    match value {
        Some(value) => {
            write_value(stream, &1u8)?;
            write(stream, value)
        }
        None => {
            write_value(stream, &0u8)?;
            Ok(())
        }
    }
}

/// Read a presence byte, then the value when present.
pub fn read_opt<R, T, F>(stream: &mut R, read: F) -> Result<Option<T>, ProtocolError>
where
    R: Read,
    F: FnOnce(&mut R) -> Result<T, ProtocolError>,
{
    let present: u8 = read_value(stream)?;
    match present {
        0 => Ok(None),
        _ => read(stream).map(Some),
    }
}
