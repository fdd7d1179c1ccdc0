//! The embedder-facing node.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use log::info;
use mpb::MPB;
use rand::rngs::OsRng;
use rand_core::RngCore;

use paxos::{NodeId, ProposalId};

use crate::cluster::Configuration;
use crate::engine::{self, Engine};
use crate::error::Error;
use crate::machine::Machine;
use crate::pool::TerminalPool;

#[cfg(test)]
mod tests;

const LIFECYCLE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_INBOUND: usize = 16;
const SELECT_INTERVAL: Duration = Duration::from_millis(10);
const INBOUND_IDLE: Duration = Duration::from_secs(300);

/// One node of a replication group, holding a replica of the embedder's
/// data structure and every thread that keeps it consistent.
pub struct Replica {
    engine: Engine,
    state_bus: MPB<ReplicaState>,
    closed: AtomicBool,
}

#[derive(Debug, Eq, PartialEq, Clone)]
pub enum ReplicaState {
    Start,
    Started,
    Stop,
    Stopped,
    Timeout,
}

impl Replica {
    /// Construct node `self_id` of `config` over `machine` and begin
    /// all of its threads.
    pub fn new(
        self_id: u32,
        config: Configuration,
        machine: Box<dyn Machine>,
    ) -> Result<Self, Error> {
        Self::with_random(self_id, config, machine, Box::new(OsRng))
    }

    /// Like [`new`](Self::new) with an injected randomness source for
    /// the election timers.
    pub fn with_random(
        self_id: u32,
        config: Configuration,
        machine: Box<dyn Machine>,
        random: Box<dyn RngCore + Send>,
    ) -> Result<Self, Error> {
        let node = NodeId(self_id);
        config.validate(node)?;

        let engine = Engine::new(node, config.clone(), machine);
        let addr = match config.addr(node) {
            Some(addr) => addr,
            None => {
                return Err(Error::NodeOutOfRange {
                    node: self_id,
                    nodes: config.len(),
                })
            }
        };
        let demux = {
            let engine = engine.clone();
            Arc::new(move |stream: &mut std::net::TcpStream| engine.demux(stream))
        };
        let terminal = TerminalPool::bind(addr, MAX_INBOUND, SELECT_INTERVAL, INBOUND_IDLE, demux)
            .map_err(Error::Bind)?;

        let state_bus = MPB::new();
        Self::supervise(&state_bus, engine.clone(), terminal, random);

        let replica = Replica {
            engine,
            state_bus,
            closed: AtomicBool::new(false),
        };
        match replica.change_state(ReplicaState::Start) {
            Some(ReplicaState::Started) => Ok(replica),
            _ => Err(Error::StartTimeout),
        }
    }

    // the supervisor thread owns the worker threads: it spawns them on
    // Start and dismantles everything on Stop
    fn supervise(
        state_bus: &MPB<ReplicaState>,
        engine: Engine,
        terminal: TerminalPool,
        random: Box<dyn RngCore + Send>,
    ) {
        let state_recv = state_bus.receiver();
        let state_send = state_bus.sender();

        let _ = thread::spawn(move || {
            let mut random = Some(random);
            let mut threads = Vec::new();

            while let Ok(state) = state_recv.recv() {
                match state {
                    ReplicaState::Start => {
                        if let Some(random) = random.take() {
                            threads.push(thread::spawn({
                                let engine = engine.clone();
                                move || engine::election::run(engine, random)
                            }));
                            threads.push(thread::spawn({
                                let engine = engine.clone();
                                move || engine::run_applier(engine)
                            }));
                            let _ = state_send.send(ReplicaState::Started);
                        }
                    }
                    ReplicaState::Stop => {
                        engine.close();
                        terminal.close();
                        for thread in threads {
                            let _ = thread.join();
                        }
                        info!("node {} stopped", engine.node());
                        let _ = state_send.send(ReplicaState::Stopped);
                        return;
                    }
                    _ => {}
                }
            }
        });
    }

    fn change_state(&self, change_to: ReplicaState) -> Option<ReplicaState> {
        let expected = match change_to {
            ReplicaState::Start => ReplicaState::Started,
            ReplicaState::Stop => ReplicaState::Stopped,
            _ => return None,
        };

        // subscribe before signaling so the answer cannot be missed
        let receiver = self.state_bus.receiver();
        let _ = self.state_bus.sender().send(change_to);

        while let Ok(state) = receiver.recv_timeout(LIFECYCLE_TIMEOUT) {
            if state == expected {
                return Some(state);
            }
        }
        Some(ReplicaState::Timeout)
    }

    /// Submit an operation and block until it is applied on the group,
    /// or until the retry budget runs out.
    pub fn request<B: Into<Bytes>>(&self, op: B) -> Result<Bytes, Error> {
        self.engine.request(op.into())
    }

    /// Whether this node currently leads its group.
    pub fn leading(&self) -> bool {
        self.engine.leading()
    }

    /// The current term; its node component names the node this replica
    /// believes is leading.
    pub fn term(&self) -> ProposalId {
        self.engine.term()
    }

    /// Stop every thread and close every socket. Idempotent.
    pub fn teardown(&self) -> Option<ReplicaState> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Some(ReplicaState::Stopped);
        }
        let state = self.change_state(ReplicaState::Stop);
        // the supervisor confirmed and dropped its sender, so closing
        // the bus also reaps its pump thread
        if state == Some(ReplicaState::Stopped) {
            self.state_bus.close();
        }
        state
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}
