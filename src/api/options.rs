use std::convert::TryFrom;
use tokio::time::Duration;

#[derive(Clone, Debug, Default)]
pub struct RaftOptions {
    pub leader_heartbeat_duration: Option<Duration>,
    pub follower_min_timeout: Option<Duration>,
    pub follower_max_timeout: Option<Duration>,
    pub leader_append_entries_timeout: Option<Duration>,
    /// Most entries in one AppendEntries request.
    pub max_append_entries: Option<usize>,
    /// Soft cap on the payload bytes of one AppendEntries request. A single larger entry is
    /// still sent on its own.
    pub max_append_bytes: Option<usize>,
    /// Snapshot once this many entries were applied since the last one.
    pub snapshot_batch_count: Option<u64>,
    /// Snapshot once the in-memory log holds this many bytes.
    pub snapshot_data_threshold: Option<usize>,
    pub snapshot_chunk_size: Option<usize>,
    /// How long `propose` waits for its entry to be applied.
    pub proposal_timeout: Option<Duration>,
    /// How many applied client request ids are remembered for deduplication.
    pub dedup_window: Option<usize>,
    pub actor_queue_size: Option<usize>,
}

#[derive(Clone, Debug)]
pub(crate) struct RaftOptionsValidated {
    pub(crate) leader_heartbeat_duration: Duration,
    pub(crate) follower_min_timeout: Duration,
    pub(crate) follower_max_timeout: Duration,
    pub(crate) leader_append_entries_timeout: Duration,
    pub(crate) max_append_entries: usize,
    pub(crate) max_append_bytes: usize,
    pub(crate) snapshot_batch_count: u64,
    pub(crate) snapshot_data_threshold: usize,
    pub(crate) snapshot_chunk_size: usize,
    pub(crate) proposal_timeout: Duration,
    pub(crate) dedup_window: usize,
    pub(crate) actor_queue_size: usize,
}

impl RaftOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.leader_heartbeat_duration >= self.follower_min_timeout {
            return Err("Follower minimum timeout must be greater than leader's heartbeat");
        }
        if self.follower_min_timeout >= self.follower_max_timeout {
            return Err("Follower minimum timeout must be less than maximum timeout");
        }
        if self.leader_append_entries_timeout >= self.follower_min_timeout {
            return Err("Leader's AppendEntries RPC timeout must be less than the follower's heartbeat timeout");
        }
        if self.max_append_entries == 0 {
            return Err("Max entries per AppendEntries must be positive");
        }
        if self.snapshot_batch_count == 0 {
            return Err("Snapshot batch count must be positive");
        }
        if self.snapshot_chunk_size == 0 {
            return Err("Snapshot chunk size must be positive");
        }
        if self.dedup_window == 0 {
            return Err("Dedup window must be positive");
        }
        if self.actor_queue_size == 0 {
            return Err("Actor queue size must be positive");
        }

        Ok(())
    }
}

impl TryFrom<RaftOptions> for RaftOptionsValidated {
    type Error = &'static str;

    fn try_from(options: RaftOptions) -> Result<Self, Self::Error> {
        let values = RaftOptionsValidated {
            leader_heartbeat_duration: options.leader_heartbeat_duration.unwrap_or(Duration::from_millis(100)),
            follower_min_timeout: options.follower_min_timeout.unwrap_or(Duration::from_millis(500)),
            follower_max_timeout: options.follower_max_timeout.unwrap_or(Duration::from_millis(1500)),
            leader_append_entries_timeout: options
                .leader_append_entries_timeout
                .unwrap_or(Duration::from_millis(300)),
            max_append_entries: options.max_append_entries.unwrap_or(128),
            max_append_bytes: options.max_append_bytes.unwrap_or(1024 * 1024),
            snapshot_batch_count: options.snapshot_batch_count.unwrap_or(20_000),
            snapshot_data_threshold: options.snapshot_data_threshold.unwrap_or(64 * 1024 * 1024),
            snapshot_chunk_size: options.snapshot_chunk_size.unwrap_or(512 * 1024),
            proposal_timeout: options.proposal_timeout.unwrap_or(Duration::from_secs(5)),
            dedup_window: options.dedup_window.unwrap_or(10_000),
            actor_queue_size: options.actor_queue_size.unwrap_or(64),
        };

        values.validate()?;
        Ok(values)
    }
}
