//! In-order application of chosen log entries.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, warn};

use paxos::{Entry, NodeId};

use crate::machine::Machine;

/// Owns the replica of the user data structure plus the bookkeeping
/// that makes application exactly-once.
///
/// Entries reach [`apply`] strictly in log order; the per-origin
/// high-water mark then drops any request sequence number already seen.
/// The most recent result per origin is cached so a retry of the latest
/// request answers with the original bytes.
///
/// [`apply`]: Applier::apply
pub(crate) struct Applier {
    machine: Mutex<Box<dyn Machine>>,
    marks: Mutex<HashMap<u32, (u64, Bytes)>>,
    waiters: Mutex<HashMap<(u32, u64), Sender<Bytes>>>,
}

impl Applier {
    pub fn new(machine: Box<dyn Machine>) -> Self {
        Applier {
            machine: Mutex::new(machine),
            marks: Mutex::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// The cached result of `(origin, seq)` when it was already
    /// applied. Duplicates older than the cache are unanswerable and
    /// report the empty result.
    pub fn cached(&self, origin: NodeId, seq: u64) -> Option<Bytes> {
        let marks = lock(&self.marks);
        let (mark, result) = marks.get(&origin.0)?;
        if seq == *mark {
            Some(result.clone())
        } else if seq < *mark {
            debug!("request {}:{} predates the result cache", origin, seq);
            Some(Bytes::new())
        } else {
            None
        }
    }

    /// Register interest in the result of `(origin, seq)` before it is
    /// submitted.
    pub fn subscribe(&self, origin: NodeId, seq: u64) -> Receiver<Bytes> {
        let (tx, rx) = bounded(1);
        lock(&self.waiters).insert((origin.0, seq), tx);
        rx
    }

    /// Drop the interest registered by [`subscribe`](Self::subscribe).
    pub fn unsubscribe(&self, origin: NodeId, seq: u64) {
        lock(&self.waiters).remove(&(origin.0, seq));
    }

    /// Apply the chosen value of one log slot. The caller guarantees
    /// slots arrive in strict index order.
    pub fn apply(&self, index: u64, value: &[u8]) {
        let entry = match Entry::decode(value) {
            Some(entry) => entry,
            None => {
                warn!("slot {} holds an undecodable entry", index);
                return;
            }
        };
        if entry.is_filler() {
            debug!("slot {} is a gap filler", index);
            return;
        }

        let origin = entry.origin.0;
        let result = {
            let mut marks = lock(&self.marks);
            let mark = marks.get(&origin).map(|(seq, _)| *seq).unwrap_or(0);
            if entry.seq <= mark {
                debug!(
                    "dropped duplicate {}:{} at slot {}",
                    entry.origin, entry.seq, index
                );
                // a lost reply may still be waiting on the original
                match marks.get(&origin) {
                    Some((seq, result)) if *seq == entry.seq => result.clone(),
                    _ => return,
                }
            } else {
                let result = {
                    let mut machine = lock(&self.machine);
                    Bytes::from(machine.apply(&entry.op))
                };
                marks.insert(origin, (entry.seq, result.clone()));
                result
            }
        };

        if let Some(tx) = lock(&self.waiters).remove(&(origin, entry.seq)) {
            let _ = tx.send(result);
        }
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
