//! The threaded consensus engine.
//!
//! One [`Engine`] per node, shared by every thread through a cheap
//! clone. A single mutex guards the consensus [`State`]; the heartbeat
//! and chosen conditions are bound to it. Threads release the mutex
//! around all network work and reacquire it to look at the term.

pub(crate) mod election;
pub(crate) mod leader;

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{bounded, RecvTimeoutError};
use log::debug;
use rand::Rng;

use paxos::core::State;
use paxos::{
    AcceptReply, AcceptRequest, ClientReply, ClientRequest, Entry, NodeId, ProposalId, Rpc,
    SuccessReply, SuccessRequest,
};

use crate::applier::Applier;
use crate::cluster::Configuration;
use crate::error::Error;
use crate::machine::Machine;
use crate::pool::ConnectionPool;
use crate::protocol::{self, ProtocolError, WireReply};

/// Election timers fire uniformly inside this window. Outbound RPCs
/// draw their socket timeouts from the same window before each use.
pub(crate) const ELECTION_TIMEOUT_MIN: Duration = Duration::from_millis(150);
pub(crate) const ELECTION_TIMEOUT_MAX: Duration = Duration::from_millis(300);

/// Leaders remind every follower of themselves well inside the minimum
/// election timeout.
pub(crate) const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(50);

// client requests retry in short steps while the group settles
pub(crate) const RETRY_DELAY: Duration = Duration::from_millis(50);
const REQUEST_RETRIES: usize = 60;
const COMMIT_RETRIES: usize = 3;

// forwarded requests poll for the reply in short steps so a leadership
// change aborts the wait early
const FORWARD_POLL: Duration = Duration::from_millis(100);
const FORWARD_DEADLINE: Duration = Duration::from_secs(3);

// outbound connection recycling
const CULL_INTERVAL: Duration = Duration::from_secs(10);
const IDLE_THRESHOLD: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub(crate) struct Engine {
    inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    node: NodeId,
    config: Configuration,
    state: Mutex<State>,
    // bound to `state`; signaled on traffic from the current leader
    heartbeat: Condvar,
    // bound to `state`; signaled when a value becomes chosen
    chosen: Condvar,
    closing: AtomicBool,
    pool: ConnectionPool,
    applier: Applier,
    // this node's request counter; origin-seq pairs never repeat
    seq: AtomicU64,
    // serializes local submissions so one origin's sequence numbers
    // reach the log in order
    submit_gate: Mutex<()>,
}

impl Engine {
    pub fn new(node: NodeId, config: Configuration, machine: Box<dyn Machine>) -> Self {
        Engine {
            inner: Arc::new(EngineInner {
                node,
                state: Mutex::new(State::new(node, config.len())),
                config,
                heartbeat: Condvar::new(),
                chosen: Condvar::new(),
                closing: AtomicBool::new(false),
                pool: ConnectionPool::new(CULL_INTERVAL, IDLE_THRESHOLD),
                applier: Applier::new(machine),
                seq: AtomicU64::new(0),
                submit_gate: Mutex::new(()),
            }),
        }
    }

    pub fn node(&self) -> NodeId {
        self.inner.node
    }

    pub fn leading(&self) -> bool {
        self.lock_state().leading()
    }

    pub fn term(&self) -> ProposalId {
        self.lock_state().term()
    }

    pub fn closing(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    /// Idempotent: raises the closing flag, wakes every parked thread
    /// and shuts the outbound pool down.
    pub fn close(&self) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let _state = self.lock_state();
            self.inner.heartbeat.notify_all();
            self.inner.chosen.notify_all();
        }
        self.inner.pool.close();
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // forward the wakeup flags a handler may have raised
    fn after_handler(&self, state: &mut State) {
        if state.take_heartbeat() {
            self.inner.heartbeat.notify_all();
        }
        if state.take_newly_chosen() {
            self.inner.chosen.notify_all();
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.lock_state();
        let out = f(&mut state);
        self.after_handler(&mut state);
        out
    }

    /// Handle one inbound exchange on `stream`. Returns whether the
    /// connection is still good for the next one.
    pub fn demux(&self, stream: &mut TcpStream) -> bool {
        if self.closing() {
            return false;
        }
        let rpc = match protocol::read_request(stream) {
            Ok(rpc) => rpc,
            Err(err) => {
                debug!("dropped an inbound connection: {}", err);
                return false;
            }
        };
        match rpc {
            Rpc::Vote(req) => self.with_state(|state| state.handle_vote(req)).write(stream).is_ok(),
            Rpc::Prepare(req) => self
                .with_state(|state| state.handle_prepare(req))
                .write(stream)
                .is_ok(),
            Rpc::Accept(req) => self
                .with_state(|state| state.handle_accept(req))
                .write(stream)
                .is_ok(),
            Rpc::Success(req) => self
                .with_state(|state| state.handle_success(req))
                .write(stream)
                .is_ok(),
            Rpc::Request(req) => {
                let reply = match self.submit(req.entry) {
                    Some(result) => ClientReply {
                        leading: true,
                        result: Some(result),
                    },
                    None => ClientReply {
                        leading: false,
                        result: None,
                    },
                };
                reply.write(stream).is_ok()
            }
        }
    }

    /// Submit an operation entered on this node and block until it is
    /// applied or the retry budget runs out.
    pub fn request(&self, op: Bytes) -> Result<Bytes, Error> {
        if self.closing() {
            return Err(Error::ShuttingDown);
        }
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let entry = Entry {
            origin: self.inner.node,
            seq,
            op,
        };

        for _ in 0..REQUEST_RETRIES {
            if self.closing() {
                return Err(Error::ShuttingDown);
            }
            let (leader, leading) = {
                let state = self.lock_state();
                (state.term().node, state.leading())
            };
            if leader == self.inner.node {
                // ours, or mid-election with our own round on top
                if leading {
                    if let Some(result) = self.submit(entry.clone()) {
                        return Ok(result);
                    }
                }
            } else if let Some(reply) = self.forward(leader, &entry) {
                if reply.leading {
                    if let Some(result) = reply.result {
                        return Ok(result);
                    }
                }
            }
            thread::sleep(RETRY_DELAY);
        }
        Err(Error::RetriesExhausted)
    }

    /// Drive one entry through the log on this node, which must be
    /// leading, and wait for the applier's result.
    fn submit(&self, entry: Entry) -> Option<Bytes> {
        let _gate = self
            .inner
            .submit_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        // a retry of something already applied answers from the cache
        if let Some(result) = self.inner.applier.cached(entry.origin, entry.seq) {
            return Some(result);
        }
        let results = self.inner.applier.subscribe(entry.origin, entry.seq);

        let reserved = {
            let mut state = self.lock_state();
            if state.leading() {
                Some((state.term(), state.reserve_slot()))
            } else {
                None
            }
        };
        let (term, slot) = match reserved {
            Some(reserved) => reserved,
            None => {
                self.inner.applier.unsubscribe(entry.origin, entry.seq);
                return None;
            }
        };

        // the slot is never reused for another value: a retry resends
        // the same bytes, so a transient quorum loss stays safe
        let value = entry.encode();
        let mut committed = false;
        for _ in 0..COMMIT_RETRIES {
            if self.commit(term, slot, value.clone()) {
                committed = true;
                break;
            }
            let state = self.lock_state();
            if !state.leading() || state.term() != term {
                break;
            }
            drop(state);
            thread::sleep(RETRY_DELAY);
        }
        if !committed {
            self.inner.applier.unsubscribe(entry.origin, entry.seq);
            return None;
        }

        let deadline = Instant::now() + FORWARD_DEADLINE;
        loop {
            match results.recv_timeout(FORWARD_POLL) {
                Ok(result) => return Some(result),
                Err(RecvTimeoutError::Timeout) => {
                    let state = self.lock_state();
                    let deposed = !state.leading() || state.term() != term;
                    drop(state);
                    if deposed || self.closing() || Instant::now() >= deadline {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.inner.applier.unsubscribe(entry.origin, entry.seq);
        None
    }

    /// One Accept round, then the Success broadcast once a quorum
    /// accepted. Returns whether the value was chosen.
    pub(crate) fn commit(&self, term: ProposalId, slot: u64, value: Bytes) -> bool {
        {
            let mut state = self.lock_state();
            if !state.leading() || state.term() != term {
                return false;
            }
            // the leader's own acceptance is the first positive
            state.handle_accept(AcceptRequest {
                term,
                slot,
                value: value.clone(),
            });
            self.after_handler(&mut state);
        }

        let request = Rpc::Accept(AcceptRequest {
            term,
            slot,
            value: value.clone(),
        });
        let replies = self.fan_out(rpc_timeout(), move |stream| {
            call::<AcceptReply>(stream, &request)
        });

        let mut positives = 1;
        {
            let mut state = self.lock_state();
            for reply in replies.iter().flatten() {
                if reply.term <= term {
                    positives += 1;
                } else {
                    state.observe_term(reply.term);
                }
            }
            if !state.leading() || state.term() != term {
                return false;
            }
            if positives < state.quorum() {
                debug!("slot {} missed its quorum at {}", slot, term);
                return false;
            }
            state.handle_success(SuccessRequest {
                term,
                slot,
                value: value.clone(),
            });
            self.after_handler(&mut state);
        }

        // a peer that misses the announcement learns the value from the
        // next leader's prepare phase
        let announce = Rpc::Success(SuccessRequest { term, slot, value });
        self.fan_out(rpc_timeout(), move |stream| {
            call::<SuccessReply>(stream, &announce)
        });
        true
    }

    /// Run one exchange against every peer in parallel, collecting the
    /// outcomes over a channel dedicated to the round. Peers that could
    /// not be contacted inside `timeout` report `None`.
    pub(crate) fn fan_out<T, F>(&self, timeout: Duration, exchange: F) -> Vec<Option<T>>
    where
        T: Send + 'static,
        F: Fn(&mut TcpStream) -> Option<T> + Send + Sync + 'static,
    {
        let peers = self.inner.config.peers(self.inner.node);
        let (tx, rx) = bounded(peers.len());
        let exchange = Arc::new(exchange);
        for (_, addr) in peers {
            let engine = self.clone();
            let tx = tx.clone();
            let exchange = exchange.clone();
            thread::spawn(move || {
                let mut outcome = None;
                engine.inner.pool.perform(addr, |stream| {
                    if stream.set_read_timeout(Some(timeout)).is_err()
                        || stream.set_write_timeout(Some(timeout)).is_err()
                    {
                        return false;
                    }
                    outcome = (*exchange)(stream);
                    outcome.is_some()
                });
                let _ = tx.send(outcome);
            });
        }
        drop(tx);
        rx.iter().collect()
    }

    /// Send a client request to the node believed to lead, polling for
    /// the reply so a leadership change aborts the wait.
    fn forward(&self, leader: NodeId, entry: &Entry) -> Option<ClientReply> {
        let addr = self.inner.config.addr(leader)?;
        let engine = self.clone();
        let request = Rpc::Request(ClientRequest {
            entry: entry.clone(),
        });
        let mut reply = None;
        self.inner.pool.perform(addr, |stream| {
            if stream.set_write_timeout(Some(ELECTION_TIMEOUT_MAX)).is_err() {
                return false;
            }
            if protocol::write_request(stream, &request).is_err() {
                return false;
            }
            if stream.set_read_timeout(Some(FORWARD_POLL)).is_err() {
                return false;
            }
            let deadline = Instant::now() + FORWARD_DEADLINE;
            loop {
                match ClientReply::read(stream) {
                    Ok(answer) => {
                        reply = Some(answer);
                        return true;
                    }
                    Err(ProtocolError::Io(err)) if timed_out(&err) => {
                        if engine.closing() || Instant::now() >= deadline {
                            return false;
                        }
                        // the group may have moved on while we waited
                        if engine.lock_state().term().node != leader {
                            return false;
                        }
                    }
                    Err(_) => return false,
                }
            }
        });
        reply
    }
}

/// Thread body for the applier: surrender chosen values strictly in
/// log order, waiting on the chosen condition in between.
pub(crate) fn run_applier(engine: Engine) {
    let mut state = engine.lock_state();
    loop {
        if engine.closing() {
            return;
        }
        while let Some((index, value)) = state.log().applicable() {
            state.log_mut().mark_applied(index);
            drop(state);
            // the user machine runs outside the engine lock
            engine.inner.applier.apply(index, &value);
            state = engine.lock_state();
            if engine.closing() {
                return;
            }
        }
        let (guard, _) = engine
            .inner
            .chosen
            .wait_timeout(state, Duration::from_millis(100))
            .unwrap_or_else(PoisonError::into_inner);
        state = guard;
    }
}

/// One request/reply exchange on an open connection.
pub(crate) fn call<T: WireReply>(stream: &mut TcpStream, rpc: &Rpc) -> Option<T> {
    protocol::write_request(stream, rpc).ok()?;
    T::read(stream).ok()
}

/// Outbound rounds draw their socket timeout from the election window
/// before each use.
pub(crate) fn rpc_timeout() -> Duration {
    let spread = (ELECTION_TIMEOUT_MAX - ELECTION_TIMEOUT_MIN).as_millis() as u64 + 1;
    ELECTION_TIMEOUT_MIN + Duration::from_millis(rand::thread_rng().gen_range(0..spread))
}

fn timed_out(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}
