//! A signed 64-bit register, the smallest useful [`Machine`].
//!
//! Operations are a tag byte followed by an optional argument. Every
//! operation returns the register value after it ran, so a duplicate
//! `add` is observable and a `get` is just the empty operation.

use std::convert::TryInto;

use bytes::Bytes;

use super::Machine;

const SET: u8 = 1;
const ADD: u8 = 2;
const GET: u8 = 3;

#[derive(Debug, Default)]
pub struct Register {
    value: i64,
}

impl Register {
    pub fn new() -> Self {
        Register::default()
    }

    /// Encode `set(value)`.
    pub fn set(value: i64) -> Bytes {
        Self::op(SET, Some(value))
    }

    /// Encode `add(delta)`.
    pub fn add(delta: i64) -> Bytes {
        Self::op(ADD, Some(delta))
    }

    /// Encode a read.
    pub fn get() -> Bytes {
        Self::op(GET, None)
    }

    /// Decode a result produced by [`apply`](Machine::apply).
    pub fn decode_result(result: &[u8]) -> Option<i64> {
        Some(i64::from_ne_bytes(result.try_into().ok()?))
    }

    fn op(tag: u8, arg: Option<i64>) -> Bytes {
        let mut buf = vec![tag];
        if let Some(arg) = arg {
            buf.extend_from_slice(&arg.to_ne_bytes());
        }
        Bytes::from(buf)
    }

    fn arg(op: &[u8]) -> Option<i64> {
        Some(i64::from_ne_bytes(op.get(1..9)?.try_into().ok()?))
    }
}

impl Machine for Register {
    fn apply(&mut self, op: &[u8]) -> Vec<u8> {
        match (op.first(), Register::arg(op)) {
            (Some(&SET), Some(value)) => self.value = value,
            (Some(&ADD), Some(delta)) => self.value = self.value.wrapping_add(delta),
            // a read, or garbage; either way the state is untouched
            _ => {}
        }
        self.value.to_ne_bytes().to_vec()
    }
}
