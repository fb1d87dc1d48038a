use crate::api::{RaftEntryId, StateMachine};
use crate::commitlog::{EntryPayload, Index, LogEntry};
use crate::replica::local_state::Term;
use crate::replica::membership::ServerConfiguration;
use crate::storage::{ClientSession, Snapshot};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};

/// What applying one committed entry produced.
#[derive(Debug, PartialEq)]
pub(crate) enum Applied {
    Command { output: Bytes },
    /// The entry carried a request id that was already applied. The state machine never saw it.
    Duplicate { original: (Term, Index) },
    Configuration(ServerConfiguration),
    Noop,
}

/// Applier feeds committed entries to the state machine strictly in index order, each one once.
pub(crate) struct Applier {
    logger: slog::Logger,
    state_machine: Box<dyn StateMachine>,
    last_applied: Option<Index>,
    sessions: ClientSessions,
}

impl Applier {
    pub(crate) fn new(logger: slog::Logger, state_machine: Box<dyn StateMachine>, dedup_window: usize) -> Self {
        Applier {
            logger,
            state_machine,
            last_applied: None,
            sessions: ClientSessions::new(dedup_window),
        }
    }

    pub(crate) fn last_applied(&self) -> Option<Index> {
        self.last_applied
    }

    pub(crate) fn next_index(&self) -> Index {
        self.last_applied.map(|i| i.plus(1)).unwrap_or_else(Index::start_index)
    }

    pub(crate) fn sessions(&self) -> &ClientSessions {
        &self.sessions
    }

    pub(crate) fn apply(&mut self, entry: &LogEntry) -> Applied {
        assert_eq!(
            entry.index,
            self.next_index(),
            "Entries must be applied in order without gaps"
        );
        self.last_applied = Some(entry.index);

        match &entry.payload {
            EntryPayload::Command(payload) => {
                if let Some(request_id) = &entry.client_request_id {
                    if let Some(original) = self.sessions.lookup(request_id) {
                        slog::info!(
                            self.logger,
                            "Skipping duplicate of request {:?} at {:?}, first applied at {:?}",
                            request_id,
                            entry.index,
                            original
                        );
                        return Applied::Duplicate { original };
                    }
                    self.sessions.record(request_id.clone(), entry.id());
                }

                let entry_id = RaftEntryId::new(entry.term, entry.index);
                let output = self.state_machine.apply(entry_id, payload);
                Applied::Command { output }
            }
            EntryPayload::ServerConfig(config) => Applied::Configuration(config.clone()),
            EntryPayload::Noop => Applied::Noop,
        }
    }

    /// Serializes the state machine as of `last_applied`.
    pub(crate) fn capture_state(&self) -> Bytes {
        self.state_machine.snapshot()
    }

    pub(crate) fn restore(&mut self, snapshot: &Snapshot) {
        let (_, index) = snapshot.last_included;
        self.state_machine.restore(snapshot.state.clone());
        self.sessions = ClientSessions::from_snapshot(self.sessions.capacity, &snapshot.client_sessions);
        self.last_applied = Some(index);
        slog::info!(self.logger, "Restored state machine from snapshot at {:?}", snapshot.last_included);
    }
}

/// ClientSessions remembers the most recent applied request ids, evicting the oldest first. The
/// eviction order only depends on the applied log, so every replica evicts the same ids.
pub(crate) struct ClientSessions {
    capacity: usize,
    order: VecDeque<String>,
    by_id: HashMap<String, (Term, Index)>,
}

impl ClientSessions {
    pub(crate) fn new(capacity: usize) -> Self {
        ClientSessions {
            capacity,
            order: VecDeque::new(),
            by_id: HashMap::new(),
        }
    }

    fn from_snapshot(capacity: usize, sessions: &[ClientSession]) -> Self {
        let mut restored = Self::new(capacity);
        for session in sessions {
            restored.record(session.client_request_id.clone(), session.entry);
        }
        restored
    }

    pub(crate) fn lookup(&self, client_request_id: &str) -> Option<(Term, Index)> {
        self.by_id.get(client_request_id).cloned()
    }

    fn record(&mut self, client_request_id: String, entry: (Term, Index)) {
        if self.capacity == 0 {
            return;
        }
        if self.by_id.insert(client_request_id.clone(), entry).is_none() {
            self.order.push_back(client_request_id);
        }
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.by_id.remove(&evicted);
            }
        }
    }

    /// Oldest first, so restoring replays the same eviction order.
    pub(crate) fn to_vec(&self) -> Vec<ClientSession> {
        self.order
            .iter()
            .filter_map(|id| {
                self.by_id.get(id).map(|entry| ClientSession {
                    client_request_id: id.clone(),
                    entry: *entry,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{self, snapshot_with, CountingStateMachine};

    fn command(index: u64, request_id: Option<&str>) -> LogEntry {
        LogEntry {
            index: Index::new(index),
            term: Term::new(1),
            client_request_id: request_id.map(String::from),
            payload: EntryPayload::Command(Bytes::from_static(b"incr")),
        }
    }

    #[test]
    fn duplicate_request_is_applied_once() {
        // -- setup --
        let state_machine = CountingStateMachine::default();
        let mut applier = Applier::new(test_utils::test_logger(), Box::new(state_machine.clone()), 10);

        // -- execute --
        let first = applier.apply(&command(1, Some("req-a")));
        let second = applier.apply(&command(2, Some("req-a")));
        let third = applier.apply(&command(3, None));

        // -- verify --
        assert_eq!(first, Applied::Command { output: Bytes::from("1") });
        assert_eq!(
            second,
            Applied::Duplicate {
                original: (Term::new(1), Index::new(1))
            }
        );
        assert_eq!(third, Applied::Command { output: Bytes::from("2") });
        assert_eq!(state_machine.count(), 2);
        assert_eq!(applier.last_applied(), Some(Index::new(3)));
    }

    #[test]
    #[should_panic]
    fn out_of_order_apply_panics() {
        let mut applier = Applier::new(test_utils::test_logger(), Box::new(CountingStateMachine::default()), 10);
        applier.apply(&command(2, None));
    }

    #[test]
    fn sessions_evict_oldest() {
        let mut sessions = ClientSessions::new(2);
        sessions.record("a".into(), (Term::new(1), Index::new(1)));
        sessions.record("b".into(), (Term::new(1), Index::new(2)));
        sessions.record("c".into(), (Term::new(1), Index::new(3)));

        assert_eq!(sessions.lookup("a"), None);
        assert_eq!(sessions.lookup("c"), Some((Term::new(1), Index::new(3))));
        let ids: Vec<_> = sessions.to_vec().into_iter().map(|s| s.client_request_id).collect();
        assert_eq!(ids, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn restore_replaces_state_and_sessions() {
        // -- setup --
        let state_machine = CountingStateMachine::default();
        let mut applier = Applier::new(test_utils::test_logger(), Box::new(state_machine.clone()), 10);
        applier.apply(&command(1, Some("old")));

        let mut snapshot = snapshot_with(Term::new(2), Index::new(40), Bytes::from("7"));
        snapshot.client_sessions = vec![ClientSession {
            client_request_id: "new".into(),
            entry: (Term::new(2), Index::new(39)),
        }];

        // -- execute --
        applier.restore(&snapshot);

        // -- verify --
        assert_eq!(state_machine.count(), 7);
        assert_eq!(applier.last_applied(), Some(Index::new(40)));
        assert_eq!(applier.sessions().lookup("old"), None);
        assert_eq!(applier.sessions().lookup("new"), Some((Term::new(2), Index::new(39))));
        // A retry of a request folded into the snapshot is still recognized.
        assert_eq!(
            applier.apply(&LogEntry {
                index: Index::new(41),
                term: Term::new(2),
                client_request_id: Some("new".into()),
                payload: EntryPayload::Command(Bytes::from_static(b"incr")),
            }),
            Applied::Duplicate {
                original: (Term::new(2), Index::new(39))
            }
        );
    }
}
