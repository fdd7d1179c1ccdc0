//! The replicated operation log.
//!
//! Slots are filled in arbitrary order as proposals land, but values
//! are surrendered for application strictly in index order. A chosen
//! slot is immutable: `chosen` never reverts and the value under it
//! never changes.

use bytes::Bytes;

use crate::id::ProposalId;

/// A single position in the replicated log.
#[derive(Clone, Debug, Default)]
pub struct Slot {
    /// The highest proposal under which a value was accepted here.
    pub accepted_proposal: Option<ProposalId>,

    /// The value accepted under [`accepted_proposal`](Self::accepted_proposal).
    pub accepted_value: Option<Bytes>,

    /// Whether a quorum is known to have accepted the value.
    pub chosen: bool,

    /// Whether the value has been handed to the state machine.
    pub applied: bool,
}

/// An indexed sequence of [`Slot`]s, growable on demand.
#[derive(Debug, Default)]
pub struct ReplicatedLog {
    slots: Vec<Slot>,
    next_to_apply: u64,
}

impl ReplicatedLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// One past the highest index ever touched.
    pub fn len(&self) -> u64 {
        self.slots.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: u64) -> Option<&Slot> {
        self.slots.get(index as usize)
    }

    fn slot_mut(&mut self, index: u64) -> &mut Slot {
        let index = index as usize;
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, Slot::default);
        }
        &mut self.slots[index]
    }

    /// Record `value` as accepted at `index` under `proposal`.
    ///
    /// A chosen slot refuses any value other than the chosen one; an
    /// unchosen slot refuses proposals below the one already accepted.
    /// Returns whether the value was recorded (or already present).
    pub fn accept(&mut self, index: u64, proposal: ProposalId, value: Bytes) -> bool {
        let slot = self.slot_mut(index);
        if slot.chosen {
            return slot.accepted_value.as_ref() == Some(&value);
        }
        if let Some(prior) = slot.accepted_proposal {
            if proposal < prior {
                return false;
            }
        }
        slot.accepted_proposal = Some(proposal);
        slot.accepted_value = Some(value);
        true
    }

    /// Mark `value` as chosen at `index`. Idempotent; the first choice
    /// wins and later calls with the same value are no-ops.
    pub fn choose(&mut self, index: u64, value: Bytes) {
        let slot = self.slot_mut(index);
        if slot.chosen {
            debug_assert_eq!(slot.accepted_value.as_ref(), Some(&value));
            return;
        }
        slot.accepted_value = Some(value);
        slot.chosen = true;
    }

    pub fn is_chosen(&self, index: u64) -> bool {
        self.get(index).map(|slot| slot.chosen).unwrap_or(false)
    }

    /// The lowest index with no chosen value.
    pub fn first_unchosen(&self) -> u64 {
        self.slots
            .iter()
            .position(|slot| !slot.chosen)
            .map(|index| index as u64)
            .unwrap_or_else(|| self.len())
    }

    /// The accepted proposal and value at `index`, if any.
    pub fn accepted_at(&self, index: u64) -> Option<(ProposalId, Bytes)> {
        let slot = self.get(index)?;
        match (slot.accepted_proposal, &slot.accepted_value) {
            (Some(proposal), Some(value)) => Some((proposal, value.clone())),
            // a slot chosen via Success may have no proposal on record
            (None, Some(value)) if slot.chosen => Some((ProposalId::default(), value.clone())),
            _ => None,
        }
    }

    /// The first index past everything accepted at or beyond `from`, or
    /// `None` when nothing is accepted there at all.
    pub fn next_unaccepted(&self, from: u64) -> Option<u64> {
        let last = self
            .slots
            .iter()
            .enumerate()
            .skip(from as usize)
            .rev()
            .find(|(_, slot)| slot.accepted_value.is_some())
            .map(|(index, _)| index as u64)?;
        Some(last + 1)
    }

    /// The next chosen-but-unapplied value, in strict index order.
    /// Returns `None` while the next slot in line is still unchosen.
    pub fn applicable(&self) -> Option<(u64, Bytes)> {
        let slot = self.get(self.next_to_apply)?;
        if slot.chosen && !slot.applied {
            slot.accepted_value
                .clone()
                .map(|value| (self.next_to_apply, value))
        } else {
            None
        }
    }

    /// Mark the value returned by [`applicable`](Self::applicable) as
    /// handed to the state machine.
    pub fn mark_applied(&mut self, index: u64) {
        debug_assert_eq!(index, self.next_to_apply);
        let slot = self.slot_mut(index);
        debug_assert!(slot.chosen);
        slot.applied = true;
        self.next_to_apply = index + 1;
    }
}
