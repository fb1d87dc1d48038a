use crate::api::{RaftEntryId, RaftLeaderInfo, RaftProposeError, RaftProposeInput, RaftProposeOutput, RaftRemoteProposeError};
use crate::commitlog::{as_u64_or_zero, EntryPayload, Index, LogEntry};
use crate::grpc::{
    proto_append_entries_error, proto_append_entries_result, proto_install_snapshot_error,
    proto_install_snapshot_result, proto_log_entry, proto_propose_error, proto_propose_result, proto_request_vote_error,
    proto_request_vote_result, proto_timeout_now_error, proto_timeout_now_result, ProtoAppendEntriesError, ProtoAppendEntriesReq, ProtoAppendEntriesResult,
    ProtoAppendEntriesSuccess, ProtoClientStaleTerm, ProtoDuplicateRequest, ProtoEntryDiscarded,
    ProtoInstallSnapshotError, ProtoInstallSnapshotReq, ProtoInstallSnapshotResult, ProtoInstallSnapshotSuccess,
    ProtoLogEntry, ProtoNoop, ProtoNotLeader, ProtoProposeError, ProtoProposeReq, ProtoProposeResult,
    ProtoProposeSuccess, ProtoRequestVoteError, ProtoRequestVoteReq, ProtoRequestVoteResult, ProtoRequestVoteSuccess,
    ProtoNotVoting, ProtoServerConfig, ProtoServerFault, ProtoServerInfo, ProtoServerMissingPreviousLog, ProtoTimeout,
    ProtoTimeoutNowError, ProtoTimeoutNowReq, ProtoTimeoutNowResult, ProtoTimeoutNowSuccess, ProtoUnexpectedChunk,
};
use crate::network::TransportError;
use crate::replica::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, InstallSnapshotError, InstallSnapshotInput,
    InstallSnapshotOutput, MissingLogEntryInfo, ReplicaId, RequestVoteError, RequestVoteInput, RequestVoteOutput,
    ServerConfiguration, ServerInfo, ShardId, Term, TermOutOfDateInfo, TimeoutNowError, TimeoutNowInput,
    TimeoutNowOutput,
};
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tonic::Status;

// ------- RequestVote --------

pub(crate) fn request_vote_to_wire(shard_id: &ShardId, input: RequestVoteInput) -> ProtoRequestVoteReq {
    let (last_term, last_index) = log_entry_metadata_to_wire(input.candidate_last_log_entry);
    ProtoRequestVoteReq {
        shard_id: shard_id.as_str().to_string(),
        candidate_id: input.candidate_id.into_inner(),
        term: input.candidate_term.as_u64(),
        last_log_entry_index: last_index,
        last_log_entry_term: last_term,
    }
}

pub(crate) fn request_vote_from_wire(rpc_request: ProtoRequestVoteReq) -> Result<(ShardId, RequestVoteInput), Status> {
    let candidate_last_log_entry =
        log_entry_metadata_from_wire(rpc_request.last_log_entry_term, rpc_request.last_log_entry_index)?;
    let candidate_id = non_empty_replica_id(rpc_request.candidate_id, "CandidateId")?;

    Ok((
        ShardId::new(rpc_request.shard_id),
        RequestVoteInput {
            candidate_term: Term::new(rpc_request.term),
            candidate_id,
            candidate_last_log_entry,
        },
    ))
}

pub(crate) fn request_vote_result_to_wire(
    app_result: Result<RequestVoteOutput, RequestVoteError>,
) -> ProtoRequestVoteResult {
    let result = match app_result {
        Ok(ok) => proto_request_vote_result::Result::Ok(ProtoRequestVoteSuccess {
            term: ok.term.as_u64(),
            vote_granted: ok.vote_granted,
        }),
        Err(RequestVoteError::RequestTermOutOfDate(info)) => {
            proto_request_vote_result::Result::Err(ProtoRequestVoteError {
                err: Some(proto_request_vote_error::Err::StaleTerm(ProtoClientStaleTerm {
                    current_term: info.current_term.as_u64(),
                })),
            })
        }
        Err(RequestVoteError::ServerIoError(_)) => proto_request_vote_result::Result::Err(ProtoRequestVoteError {
            err: Some(proto_request_vote_error::Err::ServerFault(server_fault("Local IO failure"))),
        }),
        Err(RequestVoteError::ActorExited) => proto_request_vote_result::Result::Err(ProtoRequestVoteError {
            err: Some(proto_request_vote_error::Err::ServerFault(actor_exited_fault())),
        }),
    };

    ProtoRequestVoteResult { result: Some(result) }
}

pub(crate) fn request_vote_result_from_wire(
    rpc_reply: ProtoRequestVoteResult,
) -> Result<Result<RequestVoteOutput, RequestVoteError>, TransportError> {
    match rpc_reply.result {
        Some(proto_request_vote_result::Result::Ok(ok)) => Ok(Ok(RequestVoteOutput {
            term: Term::new(ok.term),
            vote_granted: ok.vote_granted,
        })),
        Some(proto_request_vote_result::Result::Err(ProtoRequestVoteError { err: Some(err) })) => match err {
            proto_request_vote_error::Err::StaleTerm(stale) => Ok(Err(RequestVoteError::RequestTermOutOfDate(
                TermOutOfDateInfo {
                    current_term: Term::new(stale.current_term),
                },
            ))),
            proto_request_vote_error::Err::ServerFault(fault) => {
                Ok(Err(RequestVoteError::ServerIoError(remote_fault(fault))))
            }
        },
        _ => Err(TransportError::MalformedReply("RequestVote result is empty".to_string())),
    }
}

// ------- AppendEntries --------

pub(crate) fn append_entries_to_wire(shard_id: &ShardId, input: AppendEntriesInput) -> ProtoAppendEntriesReq {
    let (previous_term, previous_index) = log_entry_metadata_to_wire(input.leader_previous_log_entry);
    ProtoAppendEntriesReq {
        shard_id: shard_id.as_str().to_string(),
        leader_id: input.leader_id.into_inner(),
        term: input.leader_term.as_u64(),
        commit_index: as_u64_or_zero(input.leader_commit_index),
        previous_log_entry_term: previous_term,
        previous_log_entry_index: previous_index,
        new_entries: input.new_entries.iter().map(log_entry_to_wire).collect(),
    }
}

pub(crate) fn append_entries_from_wire(
    rpc_request: ProtoAppendEntriesReq,
) -> Result<(ShardId, AppendEntriesInput), Status> {
    let leader_previous_log_entry =
        log_entry_metadata_from_wire(rpc_request.previous_log_entry_term, rpc_request.previous_log_entry_index)?;
    let leader_id = non_empty_replica_id(rpc_request.leader_id, "LeaderId")?;

    let mut new_entries = Vec::with_capacity(rpc_request.new_entries.len());
    let mut expected_index = leader_previous_log_entry
        .map(|(_, index)| index.plus(1))
        .unwrap_or_else(Index::start_index);
    for proto_entry in rpc_request.new_entries {
        let entry = log_entry_from_wire(proto_entry)?;
        if entry.index != expected_index {
            return Err(Status::invalid_argument(format!(
                "Entries must follow the previous entry without gaps: expected index {:?}, got {:?}",
                expected_index, entry.index
            )));
        }
        expected_index = expected_index.plus(1);
        new_entries.push(entry);
    }

    Ok((
        ShardId::new(rpc_request.shard_id),
        AppendEntriesInput {
            leader_term: Term::new(rpc_request.term),
            leader_id,
            leader_previous_log_entry,
            leader_commit_index: Index::from_u64(rpc_request.commit_index),
            new_entries,
        },
    ))
}

pub(crate) fn append_entries_result_to_wire(
    app_result: Result<AppendEntriesOutput, AppendEntriesError>,
) -> ProtoAppendEntriesResult {
    let result = match app_result {
        Ok(ok) => proto_append_entries_result::Result::Ok(ProtoAppendEntriesSuccess {
            term: ok.term.as_u64(),
            match_index: as_u64_or_zero(ok.match_index),
        }),
        Err(AppendEntriesError::ClientTermOutOfDate(info)) => {
            proto_append_entries_result::Result::Err(ProtoAppendEntriesError {
                err: Some(proto_append_entries_error::Err::StaleTerm(ProtoClientStaleTerm {
                    current_term: info.current_term.as_u64(),
                })),
            })
        }
        Err(AppendEntriesError::ServerMissingPreviousLogEntry(info)) => {
            let (last_term, last_index) = log_entry_metadata_to_wire(info.last_log_entry);
            proto_append_entries_result::Result::Err(ProtoAppendEntriesError {
                err: Some(proto_append_entries_error::Err::MissingLog(ProtoServerMissingPreviousLog {
                    term: info.term.as_u64(),
                    last_log_entry_index: last_index,
                    last_log_entry_term: last_term,
                })),
            })
        }
        Err(AppendEntriesError::ServerIoError(_)) => proto_append_entries_result::Result::Err(ProtoAppendEntriesError {
            err: Some(proto_append_entries_error::Err::ServerFault(server_fault("Local IO failure"))),
        }),
        Err(AppendEntriesError::ActorExited) => proto_append_entries_result::Result::Err(ProtoAppendEntriesError {
            err: Some(proto_append_entries_error::Err::ServerFault(actor_exited_fault())),
        }),
    };

    ProtoAppendEntriesResult { result: Some(result) }
}

pub(crate) fn append_entries_result_from_wire(
    rpc_reply: ProtoAppendEntriesResult,
) -> Result<Result<AppendEntriesOutput, AppendEntriesError>, TransportError> {
    match rpc_reply.result {
        Some(proto_append_entries_result::Result::Ok(ok)) => Ok(Ok(AppendEntriesOutput {
            term: Term::new(ok.term),
            match_index: Index::from_u64(ok.match_index),
        })),
        Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError { err: Some(err) })) => match err {
            proto_append_entries_error::Err::StaleTerm(stale) => Ok(Err(AppendEntriesError::ClientTermOutOfDate(
                TermOutOfDateInfo {
                    current_term: Term::new(stale.current_term),
                },
            ))),
            proto_append_entries_error::Err::MissingLog(missing) => {
                let last_log_entry =
                    log_entry_metadata_from_wire(missing.last_log_entry_term, missing.last_log_entry_index)
                        .map_err(|status| TransportError::MalformedReply(status.message().to_string()))?;
                Ok(Err(AppendEntriesError::ServerMissingPreviousLogEntry(MissingLogEntryInfo {
                    term: Term::new(missing.term),
                    last_log_entry,
                })))
            }
            proto_append_entries_error::Err::ServerFault(fault) => {
                Ok(Err(AppendEntriesError::ServerIoError(remote_fault(fault))))
            }
        },
        _ => Err(TransportError::MalformedReply("AppendEntries result is empty".to_string())),
    }
}

// ------- InstallSnapshot --------

pub(crate) fn install_snapshot_to_wire(shard_id: &ShardId, input: InstallSnapshotInput) -> ProtoInstallSnapshotReq {
    let (term, index) = input.last_included;
    ProtoInstallSnapshotReq {
        shard_id: shard_id.as_str().to_string(),
        leader_id: input.leader_id.into_inner(),
        term: input.leader_term.as_u64(),
        last_included_index: index.as_u64(),
        last_included_term: term.as_u64(),
        offset: input.offset,
        data: input.data.to_vec(),
        done: input.done,
    }
}

pub(crate) fn install_snapshot_from_wire(
    rpc_request: ProtoInstallSnapshotReq,
) -> Result<(ShardId, InstallSnapshotInput), Status> {
    let last_included =
        log_entry_metadata_from_wire(rpc_request.last_included_term, rpc_request.last_included_index)?
            .ok_or_else(|| Status::invalid_argument("Snapshot must include at least one entry"))?;
    let leader_id = non_empty_replica_id(rpc_request.leader_id, "LeaderId")?;

    Ok((
        ShardId::new(rpc_request.shard_id),
        InstallSnapshotInput {
            leader_term: Term::new(rpc_request.term),
            leader_id,
            last_included,
            offset: rpc_request.offset,
            data: Bytes::from(rpc_request.data),
            done: rpc_request.done,
        },
    ))
}

pub(crate) fn install_snapshot_result_to_wire(
    app_result: Result<InstallSnapshotOutput, InstallSnapshotError>,
) -> ProtoInstallSnapshotResult {
    let result = match app_result {
        Ok(ok) => proto_install_snapshot_result::Result::Ok(ProtoInstallSnapshotSuccess {
            term: ok.term.as_u64(),
            next_offset: ok.next_offset,
        }),
        Err(InstallSnapshotError::ClientTermOutOfDate(info)) => {
            proto_install_snapshot_result::Result::Err(ProtoInstallSnapshotError {
                err: Some(proto_install_snapshot_error::Err::StaleTerm(ProtoClientStaleTerm {
                    current_term: info.current_term.as_u64(),
                })),
            })
        }
        Err(InstallSnapshotError::UnexpectedChunk { term, expected_offset }) => {
            proto_install_snapshot_result::Result::Err(ProtoInstallSnapshotError {
                err: Some(proto_install_snapshot_error::Err::UnexpectedChunk(ProtoUnexpectedChunk {
                    term: term.as_u64(),
                    expected_offset,
                })),
            })
        }
        Err(InstallSnapshotError::ServerIoError(_)) => {
            proto_install_snapshot_result::Result::Err(ProtoInstallSnapshotError {
                err: Some(proto_install_snapshot_error::Err::ServerFault(server_fault(
                    "Local IO failure",
                ))),
            })
        }
        Err(InstallSnapshotError::ActorExited) => proto_install_snapshot_result::Result::Err(ProtoInstallSnapshotError {
            err: Some(proto_install_snapshot_error::Err::ServerFault(actor_exited_fault())),
        }),
    };

    ProtoInstallSnapshotResult { result: Some(result) }
}

pub(crate) fn install_snapshot_result_from_wire(
    rpc_reply: ProtoInstallSnapshotResult,
) -> Result<Result<InstallSnapshotOutput, InstallSnapshotError>, TransportError> {
    match rpc_reply.result {
        Some(proto_install_snapshot_result::Result::Ok(ok)) => Ok(Ok(InstallSnapshotOutput {
            term: Term::new(ok.term),
            next_offset: ok.next_offset,
        })),
        Some(proto_install_snapshot_result::Result::Err(ProtoInstallSnapshotError { err: Some(err) })) => match err {
            proto_install_snapshot_error::Err::StaleTerm(stale) => Ok(Err(
                InstallSnapshotError::ClientTermOutOfDate(TermOutOfDateInfo {
                    current_term: Term::new(stale.current_term),
                }),
            )),
            proto_install_snapshot_error::Err::UnexpectedChunk(chunk) => Ok(Err(InstallSnapshotError::UnexpectedChunk {
                term: Term::new(chunk.term),
                expected_offset: chunk.expected_offset,
            })),
            proto_install_snapshot_error::Err::ServerFault(fault) => {
                Ok(Err(InstallSnapshotError::ServerIoError(remote_fault(fault))))
            }
        },
        _ => Err(TransportError::MalformedReply("InstallSnapshot result is empty".to_string())),
    }
}

// ------- TimeoutNow --------

pub(crate) fn timeout_now_to_wire(shard_id: &ShardId, input: TimeoutNowInput) -> ProtoTimeoutNowReq {
    ProtoTimeoutNowReq {
        shard_id: shard_id.as_str().to_string(),
        leader_id: input.leader_id.into_inner(),
        term: input.leader_term.as_u64(),
    }
}

pub(crate) fn timeout_now_from_wire(rpc_request: ProtoTimeoutNowReq) -> Result<(ShardId, TimeoutNowInput), Status> {
    let leader_id = non_empty_replica_id(rpc_request.leader_id, "LeaderId")?;
    if rpc_request.term == 0 {
        return Err(Status::invalid_argument("Leader term must not be 0"));
    }

    Ok((
        ShardId::new(rpc_request.shard_id),
        TimeoutNowInput {
            leader_term: Term::new(rpc_request.term),
            leader_id,
        },
    ))
}

pub(crate) fn timeout_now_result_to_wire(
    app_result: Result<TimeoutNowOutput, TimeoutNowError>,
) -> ProtoTimeoutNowResult {
    let err = match app_result {
        Ok(ok) => {
            return ProtoTimeoutNowResult {
                result: Some(proto_timeout_now_result::Result::Ok(ProtoTimeoutNowSuccess {
                    term: ok.term.as_u64(),
                })),
            }
        }
        Err(TimeoutNowError::ClientTermOutOfDate(info)) => {
            proto_timeout_now_error::Err::StaleTerm(ProtoClientStaleTerm {
                current_term: info.current_term.as_u64(),
            })
        }
        Err(TimeoutNowError::NotVoting) => proto_timeout_now_error::Err::NotVoting(ProtoNotVoting {}),
        Err(TimeoutNowError::ServerIoError(_)) => {
            proto_timeout_now_error::Err::ServerFault(server_fault("Local IO failure"))
        }
        Err(TimeoutNowError::ActorExited) => proto_timeout_now_error::Err::ServerFault(actor_exited_fault()),
    };

    ProtoTimeoutNowResult {
        result: Some(proto_timeout_now_result::Result::Err(ProtoTimeoutNowError { err: Some(err) })),
    }
}

pub(crate) fn timeout_now_result_from_wire(
    rpc_reply: ProtoTimeoutNowResult,
) -> Result<Result<TimeoutNowOutput, TimeoutNowError>, TransportError> {
    match rpc_reply.result {
        Some(proto_timeout_now_result::Result::Ok(ok)) => Ok(Ok(TimeoutNowOutput {
            term: Term::new(ok.term),
        })),
        Some(proto_timeout_now_result::Result::Err(ProtoTimeoutNowError { err: Some(err) })) => match err {
            proto_timeout_now_error::Err::StaleTerm(stale) => {
                Ok(Err(TimeoutNowError::ClientTermOutOfDate(TermOutOfDateInfo {
                    current_term: Term::new(stale.current_term),
                })))
            }
            proto_timeout_now_error::Err::NotVoting(_) => Ok(Err(TimeoutNowError::NotVoting)),
            proto_timeout_now_error::Err::ServerFault(fault) => {
                Ok(Err(TimeoutNowError::ServerIoError(remote_fault(fault))))
            }
        },
        _ => Err(TransportError::MalformedReply("TimeoutNow result is empty".to_string())),
    }
}

// ------- Log entries and membership --------

fn log_entry_to_wire(entry: &LogEntry) -> ProtoLogEntry {
    let payload = match &entry.payload {
        EntryPayload::Command(data) => proto_log_entry::Payload::Command(data.to_vec()),
        EntryPayload::ServerConfig(config) => proto_log_entry::Payload::Config(server_config_to_wire(config)),
        EntryPayload::Noop => proto_log_entry::Payload::Noop(ProtoNoop {}),
    };
    ProtoLogEntry {
        index: entry.index.as_u64(),
        term: entry.term.as_u64(),
        client_request_id: entry.client_request_id.clone().unwrap_or_default(),
        payload: Some(payload),
    }
}

fn log_entry_from_wire(proto_entry: ProtoLogEntry) -> Result<LogEntry, Status> {
    let index =
        Index::from_u64(proto_entry.index).ok_or_else(|| Status::invalid_argument("Log entry index must not be 0"))?;
    if proto_entry.term == 0 {
        return Err(Status::invalid_argument("Log entry term must not be 0"));
    }
    let payload = match proto_entry.payload {
        Some(proto_log_entry::Payload::Command(data)) => EntryPayload::Command(Bytes::from(data)),
        Some(proto_log_entry::Payload::Config(config)) => EntryPayload::ServerConfig(server_config_from_wire(config)?),
        Some(proto_log_entry::Payload::Noop(_)) => EntryPayload::Noop,
        None => return Err(Status::invalid_argument("Log entry payload is missing")),
    };
    let client_request_id = match proto_entry.client_request_id {
        id if id.is_empty() => None,
        id => Some(id),
    };

    Ok(LogEntry {
        index,
        term: Term::new(proto_entry.term),
        client_request_id,
        payload,
    })
}

fn server_config_to_wire(config: &ServerConfiguration) -> ProtoServerConfig {
    ProtoServerConfig {
        members: config
            .members()
            .iter()
            .map(|member| ProtoServerInfo {
                replica_id: member.replica_id.as_str().to_string(),
                addr: member.addr.to_string(),
                voting: member.voting,
            })
            .collect(),
    }
}

fn server_config_from_wire(config: ProtoServerConfig) -> Result<ServerConfiguration, Status> {
    let mut members = Vec::with_capacity(config.members.len());
    for member in config.members {
        let addr: SocketAddr = member
            .addr
            .parse()
            .map_err(|_| Status::invalid_argument(format!("Invalid member address {:?}", member.addr)))?;
        members.push(ServerInfo {
            replica_id: non_empty_replica_id(member.replica_id, "ReplicaId")?,
            addr,
            voting: member.voting,
        });
    }
    Ok(ServerConfiguration::new(members))
}

// ------- Propose --------

pub(crate) fn propose_to_wire(
    shard_id: &str,
    client_request_id: Option<String>,
    payload: Bytes,
    timeout: Option<Duration>,
) -> ProtoProposeReq {
    ProtoProposeReq {
        shard_id: shard_id.to_string(),
        client_request_id: client_request_id.unwrap_or_default(),
        payload: payload.to_vec(),
        timeout_millis: timeout.map_or(0, |t| t.as_millis() as u64),
    }
}

pub(crate) fn propose_from_wire(rpc_request: ProtoProposeReq) -> (ShardId, RaftProposeInput, Option<Duration>) {
    let client_request_id = match rpc_request.client_request_id {
        id if id.is_empty() => None,
        id => Some(id),
    };
    let timeout = match rpc_request.timeout_millis {
        0 => None,
        millis => Some(Duration::from_millis(millis)),
    };

    (
        ShardId::new(rpc_request.shard_id),
        RaftProposeInput {
            client_request_id,
            payload: Bytes::from(rpc_request.payload),
        },
        timeout,
    )
}

pub(crate) fn propose_result_to_wire(app_result: Result<RaftProposeOutput, RaftProposeError>) -> ProtoProposeResult {
    let err = match app_result {
        Ok(ok) => {
            return ProtoProposeResult {
                result: Some(proto_propose_result::Result::Ok(ProtoProposeSuccess {
                    index: ok.entry_id.index(),
                    term: ok.entry_id.term(),
                    output: ok.output.to_vec(),
                })),
            }
        }
        Err(RaftProposeError::NotLeader { leader_hint }) => {
            let (leader_id, leader_addr) = match leader_hint {
                Some(leader) => (leader.replica_id, leader.addr.map(|a| a.to_string()).unwrap_or_default()),
                None => (String::new(), String::new()),
            };
            proto_propose_error::Err::NotLeader(ProtoNotLeader { leader_id, leader_addr })
        }
        Err(RaftProposeError::Timeout) => proto_propose_error::Err::Timeout(ProtoTimeout {}),
        Err(RaftProposeError::DuplicateRequest { entry_id }) => {
            proto_propose_error::Err::DuplicateRequest(ProtoDuplicateRequest {
                index: entry_id.index(),
                term: entry_id.term(),
            })
        }
        Err(RaftProposeError::EntryDiscarded) => proto_propose_error::Err::EntryDiscarded(ProtoEntryDiscarded {}),
        Err(RaftProposeError::LocalIoError(_)) => proto_propose_error::Err::ServerFault(server_fault("Local IO failure")),
        Err(RaftProposeError::ReplicaExited) => proto_propose_error::Err::ServerFault(actor_exited_fault()),
    };

    ProtoProposeResult {
        result: Some(proto_propose_result::Result::Err(ProtoProposeError { err: Some(err) })),
    }
}

pub(crate) fn propose_result_from_wire(
    rpc_result: ProtoProposeResult,
) -> Result<RaftProposeOutput, RaftRemoteProposeError> {
    let err = match rpc_result.result {
        Some(proto_propose_result::Result::Ok(ok)) => {
            let entry_id = entry_id_from_wire(ok.term, ok.index)?;
            return Ok(RaftProposeOutput {
                entry_id,
                output: Bytes::from(ok.output),
            });
        }
        Some(proto_propose_result::Result::Err(ProtoProposeError { err: Some(err) })) => err,
        _ => return Err(RaftRemoteProposeError::MalformedReply("Empty propose result".to_string())),
    };

    Err(match err {
        proto_propose_error::Err::NotLeader(not_leader) => {
            let leader_hint = match not_leader.leader_id {
                id if id.is_empty() => None,
                id => Some(RaftLeaderInfo {
                    replica_id: id,
                    addr: not_leader.leader_addr.parse().ok(),
                }),
            };
            RaftRemoteProposeError::NotLeader { leader_hint }
        }
        proto_propose_error::Err::Timeout(_) => RaftRemoteProposeError::Timeout,
        proto_propose_error::Err::DuplicateRequest(duplicate) => RaftRemoteProposeError::DuplicateRequest {
            entry_id: entry_id_from_wire(duplicate.term, duplicate.index)?,
        },
        proto_propose_error::Err::EntryDiscarded(_) => RaftRemoteProposeError::EntryDiscarded,
        proto_propose_error::Err::ServerFault(fault) => RaftRemoteProposeError::ServerFault(fault.message),
    })
}

fn entry_id_from_wire(term: u64, index: u64) -> Result<RaftEntryId, RaftRemoteProposeError> {
    match log_entry_metadata_from_wire(term, index) {
        Ok(Some(entry_id)) => Ok(RaftEntryId::from(entry_id)),
        _ => Err(RaftRemoteProposeError::MalformedReply(format!(
            "Invalid entry id {}@{}",
            index, term
        ))),
    }
}

// ------- Shared --------

fn log_entry_metadata_to_wire(entry: Option<(Term, Index)>) -> (u64, u64) {
    match entry {
        Some((term, index)) => (term.as_u64(), index.as_u64()),
        None => (0, 0),
    }
}

fn log_entry_metadata_from_wire(log_entry_term: u64, log_entry_index: u64) -> Result<Option<(Term, Index)>, Status> {
    match (log_entry_term, log_entry_index) {
        (0, 0) => Ok(None),
        (0, _) => Err(Status::invalid_argument("LogEntryTerm 0 and LogEntryIndex non-0")),
        (_, 0) => Err(Status::invalid_argument("LogEntryIndex 0 and LogEntryTerm non-0")),
        (term, index) => Ok(Some((Term::new(term), Index::new(index)))),
    }
}

fn non_empty_replica_id(replica_id: String, field: &str) -> Result<ReplicaId, Status> {
    if replica_id.is_empty() {
        return Err(Status::invalid_argument(format!("{} must not be empty", field)));
    }
    Ok(ReplicaId::new(replica_id))
}

fn server_fault(message: &str) -> ProtoServerFault {
    ProtoServerFault {
        message: message.to_string(),
    }
}

fn actor_exited_fault() -> ProtoServerFault {
    server_fault("Server internal replica task has exited")
}

fn remote_fault(fault: ProtoServerFault) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("Remote server fault: {}", fault.message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::voters;

    fn command(term: u64, index: u64) -> LogEntry {
        LogEntry {
            index: Index::new(index),
            term: Term::new(term),
            client_request_id: Some("req".to_string()),
            payload: EntryPayload::Command(Bytes::from_static(b"put x")),
        }
    }

    fn append_entries(entries: Vec<LogEntry>) -> AppendEntriesInput {
        AppendEntriesInput {
            leader_term: Term::new(3),
            leader_id: ReplicaId::new("a"),
            leader_previous_log_entry: Some((Term::new(2), Index::new(4))),
            leader_commit_index: Some(Index::new(4)),
            new_entries: entries,
        }
    }

    #[test]
    fn append_entries_request_keeps_every_payload_kind() {
        // -- setup --
        let config_entry = LogEntry {
            index: Index::new(6),
            term: Term::new(3),
            client_request_id: None,
            payload: EntryPayload::ServerConfig(voters(&["a", "b"])),
        };
        let noop = LogEntry {
            index: Index::new(7),
            term: Term::new(3),
            client_request_id: None,
            payload: EntryPayload::Noop,
        };
        let entries = vec![command(3, 5), config_entry, noop];

        // -- execute --
        let wire = append_entries_to_wire(&ShardId::new("shard-1"), append_entries(entries.clone()));
        let (shard_id, input) = append_entries_from_wire(wire).unwrap();

        // -- verify --
        assert_eq!(shard_id, ShardId::new("shard-1"));
        assert_eq!(input.new_entries, entries);
        assert_eq!(input.leader_commit_index, Some(Index::new(4)));
        assert_eq!(input.leader_previous_log_entry, Some((Term::new(2), Index::new(4))));
    }

    #[test]
    fn gap_after_previous_entry_is_rejected() {
        let wire = append_entries_to_wire(&ShardId::new("shard-1"), append_entries(vec![command(3, 6)]));

        let status = append_entries_from_wire(wire).unwrap_err();

        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn half_set_previous_entry_is_rejected() {
        let mut wire = append_entries_to_wire(&ShardId::new("shard-1"), append_entries(vec![]));
        wire.previous_log_entry_term = 0;

        let status = append_entries_from_wire(wire).unwrap_err();

        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn missing_log_hint_survives_the_wire() {
        // -- setup --
        let app_result = Err(AppendEntriesError::ServerMissingPreviousLogEntry(MissingLogEntryInfo {
            term: Term::new(3),
            last_log_entry: Some((Term::new(1), Index::new(2))),
        }));

        // -- execute --
        let decoded = append_entries_result_from_wire(append_entries_result_to_wire(app_result)).unwrap();

        // -- verify --
        match decoded {
            Err(AppendEntriesError::ServerMissingPreviousLogEntry(info)) => {
                assert_eq!(info.term, Term::new(3));
                assert_eq!(info.last_log_entry, Some((Term::new(1), Index::new(2))));
            }
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[test]
    fn timeout_now_refusals_survive_the_wire() {
        // -- execute --
        let not_voting = timeout_now_result_from_wire(timeout_now_result_to_wire(Err(TimeoutNowError::NotVoting)));
        let stale = timeout_now_result_from_wire(timeout_now_result_to_wire(Err(
            TimeoutNowError::ClientTermOutOfDate(TermOutOfDateInfo {
                current_term: Term::new(4),
            }),
        )));
        let missing_leader = timeout_now_from_wire(ProtoTimeoutNowReq {
            shard_id: "shard-1".to_string(),
            leader_id: String::new(),
            term: 2,
        });

        // -- verify --
        assert!(matches!(not_voting, Ok(Err(TimeoutNowError::NotVoting))));
        match stale {
            Ok(Err(TimeoutNowError::ClientTermOutOfDate(info))) => assert_eq!(info.current_term, Term::new(4)),
            other => panic!("Unexpected result {:?}", other),
        }
        assert!(missing_leader.is_err());
    }

    #[test]
    fn empty_result_is_malformed() {
        let result = request_vote_result_from_wire(ProtoRequestVoteResult { result: None });

        assert!(matches!(result, Err(TransportError::MalformedReply(_))));
    }

    #[test]
    fn snapshot_without_last_included_is_rejected() {
        let wire = ProtoInstallSnapshotReq {
            shard_id: "shard-1".to_string(),
            leader_id: "a".to_string(),
            term: 2,
            last_included_index: 0,
            last_included_term: 0,
            offset: 0,
            data: vec![1, 2, 3],
            done: true,
        };

        let status = install_snapshot_from_wire(wire).unwrap_err();

        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn propose_redirect_keeps_leader_hint() {
        // -- setup --
        let not_leader = Err(RaftProposeError::NotLeader {
            leader_hint: Some(RaftLeaderInfo {
                replica_id: "b".to_string(),
                addr: Some("127.0.0.1:4002".parse().unwrap()),
            }),
        });

        // -- execute --
        let result = propose_result_from_wire(propose_result_to_wire(not_leader));

        // -- verify --
        match result {
            Err(RaftRemoteProposeError::NotLeader { leader_hint: Some(leader) }) => {
                assert_eq!(leader.replica_id, "b");
                assert_eq!(leader.addr, Some("127.0.0.1:4002".parse().unwrap()));
            }
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[test]
    fn propose_without_request_id_or_timeout_uses_defaults() {
        let req = propose_to_wire("shard-1", None, Bytes::from_static(b"put x"), None);
        assert_eq!(req.timeout_millis, 0);

        let (shard_id, input, timeout) = propose_from_wire(req);

        assert_eq!(shard_id.as_str(), "shard-1");
        assert_eq!(input.client_request_id, None);
        assert_eq!(timeout, None);
    }
}
