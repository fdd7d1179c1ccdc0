//! Low-level consensus state of a single replica.
//!
//! [`State`] is purely passive: it owns the term, the leading flag and
//! the replicated log, and turns typed requests into typed replies.
//! Threads, sockets and timers live with the embedding engine, which
//! drives this state under its own lock.

use log::{debug, info};

use crate::id::{NodeId, ProposalId};
use crate::log::ReplicatedLog;
use crate::message::*;

/// The outcome of one solicited ballot, as reported by the transport.
///
/// `contacted == false` means the peer never answered inside the round's
/// timeout and counts neither for nor against the candidate.
#[derive(Clone, Copy, Debug)]
pub struct Ballot {
    pub contacted: bool,
    pub term: ProposalId,
}

impl Ballot {
    /// A ballot from a peer that answered with `term`.
    pub fn counted(term: ProposalId) -> Self {
        Ballot {
            contacted: true,
            term,
        }
    }

    /// A ballot from a peer that could not be reached.
    pub fn absent() -> Self {
        Ballot {
            contacted: false,
            term: ProposalId::default(),
        }
    }
}

/// The complete consensus state of one replica.
pub struct State {
    node: NodeId,
    nodes: usize,

    // the highest proposal this node has taken part in; never decreases
    term: ProposalId,
    leading: bool,

    log: ReplicatedLog,

    // the next slot this node hands out while leading
    next_slot: u64,

    // level-triggered wakeup flags, drained by the embedding engine
    heartbeat: bool,
    newly_chosen: bool,
}

impl State {
    /// A fresh follower at term `(0, node)`.
    pub fn new(node: NodeId, nodes: usize) -> Self {
        Self {
            node,
            nodes,
            term: ProposalId::initial(node),
            leading: false,
            log: ReplicatedLog::new(),
            next_slot: 0,
            heartbeat: false,
            newly_chosen: false,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// The current term. The node component names the group's leader
    /// candidate for the term.
    pub fn term(&self) -> ProposalId {
        self.term
    }

    pub fn leading(&self) -> bool {
        self.leading
    }

    pub fn log(&self) -> &ReplicatedLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut ReplicatedLog {
        &mut self.log
    }

    /// The strict majority of the configured group.
    pub fn quorum(&self) -> usize {
        self.nodes / 2 + 1
    }

    /// Whether a leader heartbeat arrived since the last drain.
    pub fn take_heartbeat(&mut self) -> bool {
        std::mem::take(&mut self.heartbeat)
    }

    /// Whether a value was chosen since the last drain.
    pub fn take_newly_chosen(&mut self) -> bool {
        std::mem::take(&mut self.newly_chosen)
    }

    //
    // candidate side
    //

    /// Start a new election: supersede every round seen so far with a
    /// term of this node's own.
    pub fn begin_election(&mut self) -> ProposalId {
        self.leading = false;
        self.term = self.term.bump(self.node);
        info!("became candidate at {}", self.term);
        self.term
    }

    /// Tally the ballots of the round begun with [`begin_election`].
    ///
    /// Counts this node's own ballot, then every contacted peer whose
    /// reply term was strictly below `term`. Any reply above `term`
    /// concedes the round and advances the local term instead. Returns
    /// whether this node now leads.
    ///
    /// [`begin_election`]: Self::begin_election
    pub fn conclude_election(&mut self, term: ProposalId, ballots: &[Ballot]) -> bool {
        if self.term != term {
            // an inbound RPC advanced the term while ballots were in
            // flight; the round is void
            debug!("abandoned round {} at {}", term, self.term);
            return false;
        }

        let mut votes = 1;
        let mut highest = term;
        for ballot in ballots.iter().filter(|ballot| ballot.contacted) {
            if ballot.term < term {
                votes += 1;
            } else if ballot.term > highest {
                highest = ballot.term;
            }
        }

        if highest > term {
            info!("conceded round {} to {}", term, highest);
            self.term = highest;
            return false;
        }

        if votes >= self.quorum() {
            self.leading = true;
            self.next_slot = self.log.first_unchosen();
            info!(
                "became leader at {} with {} of {} ballots",
                term, votes, self.nodes
            );
            true
        } else {
            info!(
                "lost round {} with {} of {} ballots",
                term, votes, self.nodes
            );
            false
        }
    }

    //
    // leader side
    //

    /// Fold a term seen in a peer's reply into the local term, stepping
    /// down if it proves this node's leadership stale.
    pub fn observe_term(&mut self, seen: ProposalId) {
        if seen > self.term {
            if self.leading {
                info!("stepped down at {} after observing {}", self.term, seen);
            } else {
                debug!("advanced to {} from {}", seen, self.term);
            }
            self.term = seen;
            self.leading = false;
        }
    }

    /// Give leadership up without advancing the term. The leader loop
    /// calls this on its way out, however it ends.
    pub fn abdicate(&mut self) {
        if self.leading {
            info!("abdicated at {}", self.term);
            self.leading = false;
        }
    }

    /// Hand out the next unused slot. Only meaningful while leading.
    pub fn reserve_slot(&mut self) -> u64 {
        let slot = self.next_slot;
        self.next_slot += 1;
        slot
    }

    /// Move the slot cursor past a repaired log prefix.
    pub fn resume_at(&mut self, index: u64) {
        self.next_slot = self.next_slot.max(index);
    }

    //
    // acceptor side
    //

    /// A candidate asks for this node's ballot.
    ///
    /// The reply carries the term from *before* the request was folded
    /// in: the candidate counts the ballot iff that term was strictly
    /// below its own, which grants at most one ballot per term.
    pub fn handle_vote(&mut self, req: VoteRequest) -> VoteReply {
        let prior = self.term;
        if prior < req.term {
            info!("granted ballot for {} at {}", req.term, prior);
            self.observe_term(req.term);
            self.heartbeat = true;
        } else {
            debug!("dismissed ballot for {} at {}", req.term, prior);
        }
        VoteReply { term: prior }
    }

    /// A leader asks what this node has accepted at a slot.
    pub fn handle_prepare(&mut self, req: PrepareRequest) -> PrepareReply {
        if req.term >= self.term {
            self.observe_term(req.term);
            self.heartbeat = true;
            PrepareReply {
                term: self.term,
                accepted: self.log.accepted_at(req.slot),
                next_unaccepted: self.log.next_unaccepted(req.slot),
            }
        } else {
            debug!("dismissed prepare {} at {}", req.term, self.term);
            PrepareReply {
                term: self.term,
                accepted: None,
                next_unaccepted: None,
            }
        }
    }

    /// A leader asks this node to accept a value at a slot.
    pub fn handle_accept(&mut self, req: AcceptRequest) -> AcceptReply {
        if req.term >= self.term {
            self.observe_term(req.term);
            self.heartbeat = true;
            if self.log.accept(req.slot, req.term, req.value) {
                debug!("accepted slot {} at {}", req.slot, self.term);
            }
        } else {
            debug!("dismissed accept {} at {}", req.term, self.term);
        }
        AcceptReply { term: self.term }
    }

    /// A leader announces a chosen value, or heartbeats with an empty
    /// one. Chosen values are recorded regardless of the sender's term:
    /// a quorum accepted them, so the information cannot be stale.
    pub fn handle_success(&mut self, req: SuccessRequest) -> SuccessReply {
        if req.term >= self.term {
            self.observe_term(req.term);
            self.heartbeat = true;
        }
        if !req.value.is_empty() {
            // record the proposal too, so a later repair sees this
            // value at full strength
            self.log.accept(req.slot, req.term, req.value.clone());
            self.log.choose(req.slot, req.value);
            self.newly_chosen = true;
            debug!("chose slot {} at {}", req.slot, self.term);
        }
        SuccessReply
    }
}
