//! The election loop.

use std::sync::PoisonError;
use std::time::{Duration, Instant};

use rand_core::RngCore;

use paxos::core::Ballot;
use paxos::{ProposalId, Rpc, VoteReply, VoteRequest};

use super::{call, leader, Engine, ELECTION_TIMEOUT_MAX, ELECTION_TIMEOUT_MIN};

/// Thread body: park on the heartbeat condition under a randomized
/// deadline; campaign when it lapses with no leader traffic; run the
/// leader side after winning. The deadline is drawn once per outer
/// iteration, never on a spurious wake.
pub(crate) fn run(engine: Engine, mut random: Box<dyn RngCore + Send>) {
    let mut state = engine.lock_state();
    loop {
        if engine.closing() {
            return;
        }

        let timeout = election_timeout(random.as_mut());
        let deadline = Instant::now() + timeout;

        // drain stale notifications so the wait below answers whether a
        // heartbeat arrives after this point
        state.take_heartbeat();
        let mut interrupted = false;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = engine
                .inner
                .heartbeat
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
            if engine.closing() {
                return;
            }
            if state.take_heartbeat() {
                interrupted = true;
                break;
            }
        }
        if interrupted {
            continue;
        }

        // silence long enough: campaign, with every outbound ballot
        // bounded by this round's own timeout
        let term = state.begin_election();
        drop(state);
        let ballots = solicit(&engine, term, timeout);
        state = engine.lock_state();
        if state.conclude_election(term, &ballots) {
            drop(state);
            leader::run(&engine, term);
            state = engine.lock_state();
        }
    }
}

fn solicit(engine: &Engine, term: ProposalId, timeout: Duration) -> Vec<Ballot> {
    let request = Rpc::Vote(VoteRequest { term });
    engine
        .fan_out(timeout, move |stream| call::<VoteReply>(stream, &request))
        .into_iter()
        .map(|reply| match reply {
            Some(reply) => Ballot::counted(reply.term),
            None => Ballot::absent(),
        })
        .collect()
}

fn election_timeout(random: &mut dyn RngCore) -> Duration {
    let spread = (ELECTION_TIMEOUT_MAX - ELECTION_TIMEOUT_MIN).as_millis() as u32 + 1;
    ELECTION_TIMEOUT_MIN + Duration::from_millis(u64::from(random.next_u32() % spread))
}
