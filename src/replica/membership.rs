use crate::commitlog::Index;
use crate::replica::peers::ReplicaId;
use std::net::SocketAddr;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ServerInfo {
    pub(crate) replica_id: ReplicaId,
    pub(crate) addr: SocketAddr,
    // Non voting members receive the log but are not counted toward any quorum.
    pub(crate) voting: bool,
}

/// ServerConfiguration is the member list of a shard. Order is kept stable so configurations
/// compare equal regardless of how they were built.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct ServerConfiguration {
    members: Vec<ServerInfo>,
}

impl ServerConfiguration {
    /// Duplicate ids keep the first occurrence.
    pub(crate) fn new(members: Vec<ServerInfo>) -> Self {
        let mut deduped: Vec<ServerInfo> = Vec::with_capacity(members.len());
        for member in members {
            if !deduped.iter().any(|m| m.replica_id == member.replica_id) {
                deduped.push(member);
            }
        }
        ServerConfiguration { members: deduped }
    }

    pub(crate) fn members(&self) -> &[ServerInfo] {
        &self.members
    }

    pub(crate) fn member(&self, replica_id: &ReplicaId) -> Option<&ServerInfo> {
        self.members.iter().find(|m| &m.replica_id == replica_id)
    }

    pub(crate) fn contains(&self, replica_id: &ReplicaId) -> bool {
        self.member(replica_id).is_some()
    }

    pub(crate) fn is_voting(&self, replica_id: &ReplicaId) -> bool {
        self.member(replica_id).map_or(false, |m| m.voting)
    }

    pub(crate) fn voting_members(&self) -> impl Iterator<Item = &ServerInfo> {
        self.members.iter().filter(|m| m.voting)
    }

    pub(crate) fn num_voting(&self) -> usize {
        self.voting_members().count()
    }

    pub(crate) fn majority(&self) -> usize {
        (self.num_voting() / 2) + 1
    }

    /// Adds `info`, or replaces the existing member with the same id.
    pub(crate) fn with_member(&self, info: ServerInfo) -> Self {
        let mut members = self.members.clone();
        match members.iter_mut().find(|m| m.replica_id == info.replica_id) {
            Some(existing) => *existing = info,
            None => members.push(info),
        }
        ServerConfiguration { members }
    }

    pub(crate) fn without_member(&self, replica_id: &ReplicaId) -> Self {
        ServerConfiguration {
            members: self
                .members
                .iter()
                .filter(|m| &m.replica_id != replica_id)
                .cloned()
                .collect(),
        }
    }
}

/// MembershipState tracks which configuration governs each log position.
///
/// A configuration takes effect as soon as its entry is appended: the quorum for entry N is the
/// one defined by the latest configuration entry at an index below N, or the base configuration
/// if there is none. Because of this a configuration entry is itself committed under the rule of
/// the configuration before it.
pub(crate) struct MembershipState {
    // Latest configuration known to be committed, and the index of the entry that carried it.
    base: ServerConfiguration,
    base_index: Option<Index>,
    // Configuration entries past `base_index`, ascending by index.
    changes: Vec<(Index, ServerConfiguration)>,
}

impl MembershipState {
    pub(crate) fn new(base: ServerConfiguration) -> Self {
        MembershipState {
            base,
            base_index: None,
            changes: Vec::new(),
        }
    }

    /// The configuration in effect for new entries.
    pub(crate) fn latest(&self) -> &ServerConfiguration {
        self.changes.last().map(|(_, config)| config).unwrap_or(&self.base)
    }

    pub(crate) fn has_uncommitted_change(&self, commit_index: Option<Index>) -> bool {
        match self.changes.last() {
            Some((index, _)) => Some(*index) > commit_index,
            None => false,
        }
    }

    pub(crate) fn on_append(&mut self, index: Index, config: ServerConfiguration) {
        if let Some((last, _)) = self.changes.last() {
            assert!(index > *last, "Configuration entries must be appended in order");
        }
        self.changes.push((index, config));
    }

    /// Forgets configuration entries at or after `index`. Returns true if the latest
    /// configuration changed as a result.
    pub(crate) fn on_truncate(&mut self, index: Index) -> bool {
        let before = self.changes.len();
        self.changes.retain(|(i, _)| *i < index);
        before != self.changes.len()
    }

    /// Folds configuration entries at or below `commit_index` into the base.
    pub(crate) fn on_commit(&mut self, commit_index: Index) {
        while let Some((index, _)) = self.changes.first() {
            if *index > commit_index {
                break;
            }
            let (index, config) = self.changes.remove(0);
            self.base = config;
            self.base_index = Some(index);
        }
    }

    /// Replaces all state with `config`, committed at or before `index`. Used after a snapshot.
    pub(crate) fn reset(&mut self, config: ServerConfiguration, index: Option<Index>) {
        self.base = config;
        self.base_index = index;
        self.changes.clear();
    }

    /// The configuration whose quorum decides whether entry `index` is committed.
    pub(crate) fn config_for(&self, index: Index) -> &ServerConfiguration {
        self.changes
            .iter()
            .rev()
            .find(|(change_index, _)| *change_index < index)
            .map(|(_, config)| config)
            .unwrap_or(&self.base)
    }

    /// Splits `[from, to]` into runs of indexes that share a governing configuration.
    pub(crate) fn segments(&self, from: Index, to: Index) -> Vec<(Index, Index, &ServerConfiguration)> {
        let mut segments = Vec::new();
        if from > to {
            return segments;
        }

        let mut start = from;
        let mut config = self.config_for(from);
        for (change_index, change_config) in self.changes.iter() {
            if *change_index < start {
                continue;
            }
            if *change_index >= to {
                break;
            }
            segments.push((start, *change_index, config));
            start = change_index.plus(1);
            config = change_config;
        }
        segments.push((start, to, config));

        segments
    }
}

/// The highest index replicated on a majority of `config`'s voting members.
pub(crate) fn quorum_match_index<F>(config: &ServerConfiguration, match_index_of: F) -> Option<Index>
where
    F: Fn(&ReplicaId) -> Option<Index>,
{
    let mut matched: Vec<u64> = config
        .voting_members()
        .map(|m| match_index_of(&m.replica_id).map(|i| i.as_u64()).unwrap_or(0))
        .collect();
    if matched.is_empty() {
        return None;
    }

    matched.sort_unstable_by(|a, b| b.cmp(a));
    Index::from_u64(matched[config.majority() - 1])
}
