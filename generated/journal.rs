// Durable records. Every record carries a format version so newer binaries can still read
// what older ones wrote.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JournalRecord {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(oneof = "journal_record::Record", tags = "2, 3, 4, 5, 6")]
    pub record: ::core::option::Option<journal_record::Record>,
}
/// Nested message and enum types in `JournalRecord`.
pub mod journal_record {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Record {
        #[prost(message, tag = "2")]
        LogEntry(super::LogEntryRecord),
        #[prost(message, tag = "3")]
        TermVote(super::TermVoteRecord),
        #[prost(message, tag = "4")]
        DeleteEntries(super::DeleteEntriesRecord),
        #[prost(message, tag = "5")]
        TruncateEntries(super::TruncateEntriesRecord),
        #[prost(message, tag = "6")]
        CommitIndex(super::CommitIndexRecord),
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerMemberRecord {
    #[prost(string, tag = "1")]
    pub replica_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub addr: ::prost::alloc::string::String,
    #[prost(bool, tag = "3")]
    pub voting: bool,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerConfigRecord {
    #[prost(message, repeated, tag = "1")]
    pub members: ::prost::alloc::vec::Vec<ServerMemberRecord>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NoopRecord {}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogEntryRecord {
    #[prost(uint64, tag = "1")]
    pub index: u64,
    #[prost(uint64, tag = "2")]
    pub term: u64,
    #[prost(string, tag = "3")]
    pub client_request_id: ::prost::alloc::string::String,
    #[prost(oneof = "log_entry_record::Payload", tags = "4, 5, 6")]
    pub payload: ::core::option::Option<log_entry_record::Payload>,
}
/// Nested message and enum types in `LogEntryRecord`.
pub mod log_entry_record {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(bytes, tag = "4")]
        Command(::prost::alloc::vec::Vec<u8>),
        #[prost(message, tag = "5")]
        Config(super::ServerConfigRecord),
        #[prost(message, tag = "6")]
        Noop(super::NoopRecord),
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TermVoteRecord {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    /// Empty means no vote in `term`.
    #[prost(string, tag = "2")]
    pub voted_for: ::prost::alloc::string::String,
}
/// Compaction marker: entries at or below `through_index` live in a snapshot.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteEntriesRecord {
    #[prost(uint64, tag = "1")]
    pub through_index: u64,
    #[prost(uint64, tag = "2")]
    pub through_term: u64,
}
/// Conflict repair: entries at or above `from_index` are gone.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TruncateEntriesRecord {
    #[prost(uint64, tag = "1")]
    pub from_index: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommitIndexRecord {
    #[prost(uint64, tag = "1")]
    pub index: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientSessionRecord {
    #[prost(string, tag = "1")]
    pub client_request_id: ::prost::alloc::string::String,
    #[prost(uint64, tag = "2")]
    pub index: u64,
    #[prost(uint64, tag = "3")]
    pub term: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SnapshotRecord {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(uint64, tag = "2")]
    pub last_included_index: u64,
    #[prost(uint64, tag = "3")]
    pub last_included_term: u64,
    #[prost(bytes = "vec", tag = "4")]
    pub state: ::prost::alloc::vec::Vec<u8>,
    #[prost(message, optional, tag = "5")]
    pub server_config: ::core::option::Option<ServerConfigRecord>,
    #[prost(message, repeated, tag = "6")]
    pub unapplied_entries: ::prost::alloc::vec::Vec<LogEntryRecord>,
    #[prost(message, repeated, tag = "7")]
    pub client_sessions: ::prost::alloc::vec::Vec<ClientSessionRecord>,
}
