use crate::actor::Callback;
use crate::commitlog::Index;
use crate::replica::local_state::Term;
use crate::replica::replica_api::{ProposeError, ProposeOutput};
use bytes::Bytes;
use std::collections::BTreeMap;

pub(crate) type ProposeCallback = Callback<ProposeOutput, ProposeError>;

/// ProposalTracker holds the callbacks of clients waiting for their entry to be applied. Several
/// callbacks may wait on one entry when a client retries a request that is still in flight.
pub(crate) struct ProposalTracker {
    pending: BTreeMap<Index, PendingProposal>,
}

struct PendingProposal {
    term: Term,
    callbacks: Vec<ProposeCallback>,
}

impl ProposalTracker {
    pub(crate) fn new() -> Self {
        ProposalTracker {
            pending: BTreeMap::new(),
        }
    }

    pub(crate) fn track(&mut self, entry_id: (Term, Index), callback: ProposeCallback) {
        let (term, index) = entry_id;
        let pending = self.pending.entry(index).or_insert_with(|| PendingProposal {
            term,
            callbacks: Vec::new(),
        });
        if pending.term != term {
            // The slot was reused by a newer entry. Whoever waited on the old one lost it.
            let stale = std::mem::replace(
                pending,
                PendingProposal {
                    term,
                    callbacks: Vec::new(),
                },
            );
            for cb in stale.callbacks {
                cb.send(Err(ProposeError::EntryDiscarded));
            }
        }
        pending.callbacks.push(callback);
    }

    /// Resolves waiters of the entry at `entry_id`'s index once it has been applied.
    pub(crate) fn complete(&mut self, entry_id: (Term, Index), outcome: Result<Bytes, (Term, Index)>) {
        let (term, index) = entry_id;
        let pending = match self.pending.remove(&index) {
            Some(pending) => pending,
            None => return,
        };

        for cb in pending.callbacks {
            if pending.term != term {
                cb.send(Err(ProposeError::EntryDiscarded));
                continue;
            }
            match &outcome {
                Ok(output) => cb.send(Ok(ProposeOutput {
                    entry_id,
                    output: output.clone(),
                })),
                Err(original) => cb.send(Err(ProposeError::DuplicateRequest { original: *original })),
            }
        }
    }

    /// Fails every waiter at or after `index`, whose entries were truncated.
    pub(crate) fn discard_from(&mut self, index: Index) {
        let discarded = self.pending.split_off(&index);
        for (_, pending) in discarded {
            for cb in pending.callbacks {
                cb.send(Err(ProposeError::EntryDiscarded));
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}
