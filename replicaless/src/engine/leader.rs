//! The leader side: log repair, then heartbeat pumps until deposed.

use std::net::SocketAddr;
use std::thread;

use bytes::Bytes;
use log::{debug, info};

use paxos::{
    Entry, NodeId, PrepareReply, PrepareRequest, ProposalId, Rpc, SuccessReply, SuccessRequest,
};

use super::{call, rpc_timeout, Engine, ELECTION_TIMEOUT_MIN, HEARTBEAT_INTERVAL, RETRY_DELAY};

enum Repair {
    Retry,
    Commit(Bytes),
    Done,
}

/// Entered with `term.node == self` freshly concluded. Repairs the log
/// left behind by earlier terms, then keeps a heartbeat pump per peer
/// until the term is superseded or the node shuts down. Leadership
/// ends with this call, however it ends.
pub(crate) fn run(engine: &Engine, term: ProposalId) {
    serve(engine, term);
    engine.lock_state().abdicate();
}

fn serve(engine: &Engine, term: ProposalId) {
    if !repair(engine, term) {
        return;
    }

    let pumps: Vec<_> = engine
        .inner
        .config
        .peers(engine.inner.node)
        .into_iter()
        .map(|(peer, addr)| {
            let engine = engine.clone();
            thread::spawn(move || pump(engine, term, peer, addr))
        })
        .collect();

    loop {
        if engine.closing() {
            break;
        }
        {
            let state = engine.lock_state();
            if !state.leading() || state.term() != term {
                break;
            }
        }
        thread::sleep(HEARTBEAT_INTERVAL);
    }
    for pump in pumps {
        let _ = pump.join();
    }
}

/// Walk the unchosen prefix: re-commit whatever earlier terms left
/// behind, close gaps with filler entries, and stop once a quorum
/// reports nothing accepted at or beyond the cursor.
fn repair(engine: &Engine, term: ProposalId) -> bool {
    loop {
        if engine.closing() {
            return false;
        }
        let slot = {
            let state = engine.lock_state();
            if !state.leading() || state.term() != term {
                return false;
            }
            state.log().first_unchosen()
        };

        let request = Rpc::Prepare(PrepareRequest { term, slot });
        let replies: Vec<PrepareReply> = engine
            .fan_out(rpc_timeout(), move |stream| {
                call::<PrepareReply>(stream, &request)
            })
            .into_iter()
            .flatten()
            .collect();

        let step = {
            let mut state = engine.lock_state();
            for reply in &replies {
                state.observe_term(reply.term);
            }
            if !state.leading() || state.term() != term {
                return false;
            }
            if replies.len() + 1 < state.quorum() {
                // not enough answers to learn anything yet
                Repair::Retry
            } else {
                let own = state.log().accepted_at(slot);
                let adopted = replies
                    .iter()
                    .filter_map(|reply| reply.accepted.clone())
                    .chain(own)
                    .max_by_key(|(proposal, _)| *proposal)
                    .map(|(_, value)| value);
                match adopted {
                    Some(value) => {
                        state.resume_at(slot + 1);
                        Repair::Commit(value)
                    }
                    None => {
                        let beyond = replies.iter().any(|reply| {
                            reply
                                .next_unaccepted
                                .map(|next| next > slot)
                                .unwrap_or(false)
                        }) || state.log().next_unaccepted(slot).is_some();
                        if beyond {
                            // nothing here, but values exist further
                            // out; close the gap so the applier can
                            // pass it
                            state.resume_at(slot + 1);
                            Repair::Commit(Entry::filler(engine.inner.node).encode())
                        } else {
                            state.resume_at(slot);
                            Repair::Done
                        }
                    }
                }
            }
        };

        match step {
            Repair::Retry => thread::sleep(RETRY_DELAY),
            Repair::Commit(value) => {
                if !engine.commit(term, slot, value) {
                    return false;
                }
            }
            Repair::Done => {
                info!("log repaired up to slot {}", slot);
                return true;
            }
        }
    }
}

// one pump per peer so a dead destination never delays the others
fn pump(engine: Engine, term: ProposalId, peer: NodeId, addr: SocketAddr) {
    debug!("heartbeat pump for {} up", peer);
    loop {
        if engine.closing() {
            return;
        }
        {
            let state = engine.lock_state();
            if !state.leading() || state.term() != term {
                return;
            }
        }
        let beat = Rpc::Success(SuccessRequest {
            term,
            slot: 0,
            value: Bytes::new(),
        });
        engine.inner.pool.perform(addr, |stream| {
            if stream.set_read_timeout(Some(ELECTION_TIMEOUT_MIN)).is_err()
                || stream.set_write_timeout(Some(ELECTION_TIMEOUT_MIN)).is_err()
            {
                return false;
            }
            call::<SuccessReply>(stream, &beat).is_some()
        });
        thread::sleep(HEARTBEAT_INTERVAL);
    }
}
