//! Wire codec for the four consensus RPC shapes.
//!
//! Messages travel as a self-describing JSON envelope: a type tag, an ordered
//! list of named arguments, and a routing stamp (sender id + message id).
//! Each argument value is an independently serialized JSON document embedded
//! as a string in the outer envelope, so peers can decode arguments they know
//! about and skip the rest. Unknown keys are ignored; a missing key or an
//! undecodable blob makes the typed view unavailable and the receiver drops
//! the message as malformed.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::log::{LogEntry, LogIndex, MessageId, ServerId, Term};

/// The four RPC shapes of the consensus protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    AppendEntries,
    AppendEntriesResponse,
    RequestVote,
    RequestVoteResponse,
}

impl MessageType {
    pub fn is_request(self) -> bool {
        matches!(self, MessageType::AppendEntries | MessageType::RequestVote)
    }

    pub fn is_response(self) -> bool {
        !self.is_request()
    }
}

/// Routing stamp carried by every envelope.
///
/// Requests carry a fresh id assigned by the sending driver; responses echo
/// the id of the request they answer, which is how the requester correlates
/// them against its outstanding table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageInfo {
    #[serde(rename = "_msgFrom")]
    pub from: ServerId,
    #[serde(rename = "_msgId")]
    pub id: MessageId,
}

/// A message body awaiting its routing stamp.
///
/// Constructors build the argument list; [`Message::stamp`] turns the body
/// into a sendable [`Envelope`] once the driver assigns the stamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: MessageType,
    args: Vec<(String, String)>,
}

/// A complete wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "_msgType")]
    pub kind: MessageType,
    #[serde(rename = "_msgArgs")]
    args: Vec<(String, String)>,
    #[serde(rename = "_msgInfo")]
    pub info: MessageInfo,
}

fn encode_arg<T: Serialize>(name: &str, value: &T) -> (String, String) {
    let blob = serde_json::to_string(value).expect("argument values are plain data");
    (name.to_string(), blob)
}

/// Builds an AppendEntries request. `entries` pairs each entry with the log
/// index it occupies on the leader.
pub fn append_entries(
    term: Term,
    leader_id: ServerId,
    prev_log_index: LogIndex,
    prev_log_term: Term,
    entries: &[(LogIndex, LogEntry)],
    leader_commit: LogIndex,
) -> Message {
    Message {
        kind: MessageType::AppendEntries,
        args: vec![
            encode_arg("term", &term),
            encode_arg("leaderId", &leader_id),
            encode_arg("prevLogIndex", &prev_log_index),
            encode_arg("prevLogTerm", &prev_log_term),
            encode_arg("entries", &entries),
            encode_arg("leaderCommit", &leader_commit),
        ],
    }
}

pub fn append_entries_response(term: Term, success: bool) -> Message {
    Message {
        kind: MessageType::AppendEntriesResponse,
        args: vec![encode_arg("term", &term), encode_arg("success", &success)],
    }
}

pub fn request_vote(
    term: Term,
    candidate_id: ServerId,
    last_log_index: LogIndex,
    last_log_term: Term,
) -> Message {
    Message {
        kind: MessageType::RequestVote,
        args: vec![
            encode_arg("term", &term),
            encode_arg("candidateId", &candidate_id),
            encode_arg("lastLogIndex", &last_log_index),
            encode_arg("lastLogTerm", &last_log_term),
        ],
    }
}

pub fn request_vote_response(term: Term, vote_granted: bool) -> Message {
    Message {
        kind: MessageType::RequestVoteResponse,
        args: vec![
            encode_arg("term", &term),
            encode_arg("voteGranted", &vote_granted),
        ],
    }
}

impl Message {
    /// Stamps the body with its routing info, producing a sendable envelope.
    pub fn stamp(self, from: ServerId, id: MessageId) -> Envelope {
        Envelope {
            kind: self.kind,
            args: self.args,
            info: MessageInfo { from, id },
        }
    }
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("encode envelope")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("decode envelope")
    }

    /// Looks up an argument by key and decodes its embedded JSON document.
    /// None when the key is absent or the blob does not parse as `T`.
    fn arg<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let (_, blob) = self.args.iter().find(|(key, _)| key == name)?;
        serde_json::from_str(blob).ok()
    }

    /// Typed view of an AppendEntries request, if this envelope is one and
    /// every required argument decodes.
    pub fn as_append_entries(&self) -> Option<AppendEntriesArgs> {
        if self.kind != MessageType::AppendEntries {
            return None;
        }
        Some(AppendEntriesArgs {
            term: self.arg("term")?,
            leader_id: self.arg("leaderId")?,
            prev_log_index: self.arg("prevLogIndex")?,
            prev_log_term: self.arg("prevLogTerm")?,
            entries: self.arg("entries")?,
            leader_commit: self.arg("leaderCommit")?,
        })
    }

    pub fn as_append_entries_response(&self) -> Option<AppendEntriesResponseArgs> {
        if self.kind != MessageType::AppendEntriesResponse {
            return None;
        }
        Some(AppendEntriesResponseArgs {
            term: self.arg("term")?,
            success: self.arg("success")?,
        })
    }

    pub fn as_request_vote(&self) -> Option<RequestVoteArgs> {
        if self.kind != MessageType::RequestVote {
            return None;
        }
        Some(RequestVoteArgs {
            term: self.arg("term")?,
            candidate_id: self.arg("candidateId")?,
            last_log_index: self.arg("lastLogIndex")?,
            last_log_term: self.arg("lastLogTerm")?,
        })
    }

    pub fn as_request_vote_response(&self) -> Option<RequestVoteResponseArgs> {
        if self.kind != MessageType::RequestVoteResponse {
            return None;
        }
        Some(RequestVoteResponseArgs {
            term: self.arg("term")?,
            vote_granted: self.arg("voteGranted")?,
        })
    }

    /// The message term, regardless of shape. Every RPC carries one.
    pub fn term(&self) -> Option<Term> {
        self.arg("term")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppendEntriesArgs {
    pub term: Term,
    pub leader_id: ServerId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<(LogIndex, LogEntry)>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AppendEntriesResponseArgs {
    pub term: Term,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestVoteArgs {
    pub term: Term,
    pub candidate_id: ServerId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestVoteResponseArgs {
    pub term: Term,
    pub vote_granted: bool,
}
