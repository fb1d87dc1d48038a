use crate::replica::peers::ReplicaId;
use crate::storage::PersistentStore;
use std::fmt;
use std::io;

#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub(crate) struct Term(u64);

impl Term {
    pub(crate) fn new(term: u64) -> Self {
        Term(term)
    }

    pub(crate) fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn incr(&mut self) {
        self.0 += 1;
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// LocalState caches the replica's current term and vote. Every mutation is written to the store
/// first and only applied in memory once the write succeeded, so the cache never runs ahead of
/// what a restart would recover.
///
/// Store methods follow a CAS like contract: they return true if state was mutated.
pub(crate) struct LocalState {
    current_term: Term,
    voted_for_this_term: Option<ReplicaId>,
    my_replica_id: ReplicaId,
}

impl LocalState {
    pub(crate) fn new(my_replica_id: ReplicaId, current_term: Term, voted_for: Option<ReplicaId>) -> Self {
        LocalState {
            current_term,
            voted_for_this_term: voted_for,
            my_replica_id,
        }
    }

    pub(crate) fn current_term(&self) -> Term {
        self.current_term
    }

    pub(crate) fn voted_for_current_term(&self) -> (Term, Option<&ReplicaId>) {
        (self.current_term, self.voted_for_this_term.as_ref())
    }

    /// Set current term to `new_term`, clearing the vote, iff it is larger than current term.
    pub(crate) fn store_term_if_increased(
        &mut self,
        store: &mut dyn PersistentStore,
        new_term: Term,
    ) -> io::Result<bool> {
        if new_term <= self.current_term {
            return Ok(false);
        }

        store.store_term_and_vote(new_term, None)?;
        self.current_term = new_term;
        self.voted_for_this_term = None;
        Ok(true)
    }

    /// Store our vote iff `expected_term` is still the current term and we have not voted in it.
    pub(crate) fn store_vote_for_term_if_unvoted(
        &mut self,
        store: &mut dyn PersistentStore,
        expected_term: Term,
        vote: ReplicaId,
    ) -> io::Result<bool> {
        if expected_term != self.current_term || self.voted_for_this_term.is_some() {
            return Ok(false);
        }

        store.store_term_and_vote(expected_term, Some(&vote))?;
        self.voted_for_this_term = Some(vote);
        Ok(true)
    }

    /// Return the new term. Used when transitioning to candidate.
    pub(crate) fn increment_term_and_vote_for_self(&mut self, store: &mut dyn PersistentStore) -> io::Result<Term> {
        let mut new_term = self.current_term;
        new_term.incr();

        store.store_term_and_vote(new_term, Some(&self.my_replica_id))?;
        self.current_term = new_term;
        self.voted_for_this_term = Some(self.my_replica_id.clone());
        Ok(new_term)
    }
}
