//! A simple example with a thread per replica, wired over channels.
//!
//! Three replicas elect a leader with randomized timeouts, the leader
//! drives one value through Accept and Success, and every replica
//! prints the value once it is chosen.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use rand_core::{RngCore, SeedableRng};

use paxos::core::{Ballot, State};
use paxos::{
    AcceptReply, AcceptRequest, NodeId, SuccessRequest, VoteReply, VoteRequest,
};
use rand_chacha::ChaChaRng;

const NODES: usize = 3;
const BALLOT_WAIT: Duration = Duration::from_millis(100);

enum Wire {
    Vote(VoteRequest, mpsc::Sender<VoteReply>),
    Accept(AcceptRequest, mpsc::Sender<AcceptReply>),
    Success(SuccessRequest),
}

fn main() {
    let (peers_tx, peers_rx): (Vec<_>, Vec<_>) = (0..NODES).map(|_| mpsc::channel()).unzip();
    let (done_tx, done_rx) = mpsc::channel();

    for (id, rx) in peers_rx.into_iter().enumerate() {
        let network: Vec<mpsc::Sender<Wire>> = peers_tx.clone();
        let done_tx = done_tx.clone();
        thread::spawn(move || run_replica(id, rx, network, done_tx));
    }
    drop((peers_tx, done_tx));

    // wait until the value is chosen everywhere
    let mut remaining = NODES;
    while remaining > 0 {
        let id: usize = done_rx.recv().expect("replica thread died");
        println!("replica {} is done", id);
        remaining -= 1;
    }
}

fn run_replica(
    id: usize,
    rx: mpsc::Receiver<Wire>,
    network: Vec<mpsc::Sender<Wire>>,
    done_tx: mpsc::Sender<usize>,
) {
    let mut state = State::new(NodeId(id as u32), NODES);
    let mut random = ChaChaRng::seed_from_u64(id as u64);
    let mut proposed = false;
    let mut reported = false;

    loop {
        // leaders wake often enough to heartbeat well inside the
        // followers' election window
        let timeout = if state.leading() {
            Duration::from_millis(50)
        } else {
            Duration::from_millis(150 + u64::from(random.next_u32() % 151))
        };
        match rx.recv_timeout(timeout) {
            Ok(Wire::Vote(req, reply_tx)) => {
                let _ = reply_tx.send(state.handle_vote(req));
            }
            Ok(Wire::Accept(req, reply_tx)) => {
                let _ = reply_tx.send(state.handle_accept(req));
            }
            Ok(Wire::Success(req)) => {
                state.handle_success(req);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if state.leading() {
                    // quiet interval: remind the group who leads
                    broadcast_heartbeat(id, &state, &network);
                } else {
                    campaign(id, &mut state, &network);
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => return,
        }

        if state.leading() && !proposed {
            proposed = propose(id, &mut state, &network, Bytes::from_static(b"Hello world!"));
        }

        while let Some((slot, value)) = state.log_mut().applicable() {
            println!(
                "replica {} applied slot {}: {}",
                id,
                slot,
                String::from_utf8_lossy(&value)
            );
            state.log_mut().mark_applied(slot);
            if !reported {
                reported = true;
                let _ = done_tx.send(id);
            }
        }
    }
}

fn campaign(id: usize, state: &mut State, network: &[mpsc::Sender<Wire>]) {
    let term = state.begin_election();
    let (reply_tx, reply_rx) = mpsc::channel();
    let mut ballots = Vec::with_capacity(NODES - 1);

    for (peer, tx) in network.iter().enumerate() {
        if peer != id {
            let _ = tx.send(Wire::Vote(VoteRequest { term }, reply_tx.clone()));
        }
    }
    drop(reply_tx);

    for _ in 0..NODES - 1 {
        match reply_rx.recv_timeout(BALLOT_WAIT) {
            Ok(reply) => ballots.push(Ballot::counted(reply.term)),
            Err(_) => ballots.push(Ballot::absent()),
        }
    }
    state.conclude_election(term, &ballots);
}

fn propose(
    id: usize,
    state: &mut State,
    network: &[mpsc::Sender<Wire>],
    value: Bytes,
) -> bool {
    let term = state.term();
    let slot = state.reserve_slot();
    state.handle_accept(AcceptRequest {
        term,
        slot,
        value: value.clone(),
    });

    let (reply_tx, reply_rx) = mpsc::channel();
    for (peer, tx) in network.iter().enumerate() {
        if peer != id {
            let _ = tx.send(Wire::Accept(
                AcceptRequest {
                    term,
                    slot,
                    value: value.clone(),
                },
                reply_tx.clone(),
            ));
        }
    }
    drop(reply_tx);

    let mut positives = 1;
    for _ in 0..NODES - 1 {
        if let Ok(reply) = reply_rx.recv_timeout(BALLOT_WAIT) {
            if reply.term <= term {
                positives += 1;
            }
            state.observe_term(reply.term);
        }
    }

    if positives >= state.quorum() && state.leading() {
        for tx in network {
            let _ = tx.send(Wire::Success(SuccessRequest {
                term,
                slot,
                value: value.clone(),
            }));
        }
        true
    } else {
        false
    }
}

fn broadcast_heartbeat(id: usize, state: &State, network: &[mpsc::Sender<Wire>]) {
    for (peer, tx) in network.iter().enumerate() {
        if peer != id {
            let _ = tx.send(Wire::Success(SuccessRequest {
                term: state.term(),
                slot: 0,
                value: Bytes::new(),
            }));
        }
    }
}
