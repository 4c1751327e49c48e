//! Per-server consensus state and the transition logic for inbound messages.
//!
//! [`RaftNode`] owns everything one participant knows: the durable triple
//! (current term, vote, log), the volatile commit/apply cursors, the role
//! with its role-specific bookkeeping, and the table of requests awaiting
//! responses. Handlers are synchronous state transitions: they consume an
//! envelope and return an [`Output`] describing what must happen next —
//! envelopes to flush, whether durable state changed, whether the election
//! timer restarts. The driver in [`crate::runtime`] persists before it sends,
//! so no peer ever observes state this server could forget in a crash.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::log::{Command, Log, LogEntry, LogIndex, MessageId, ServerId, Term};
use crate::message::{
    self, AppendEntriesArgs, AppendEntriesResponseArgs, Envelope, Message, MessageInfo,
    MessageType, RequestVoteArgs, RequestVoteResponseArgs,
};
use crate::storage::PersistentState;

/// Pointer to a proposed entry: the slot it was appended at and the term it
/// was appended in. A proposal is applied exactly when the entry at that
/// index still carries that term once the index commits.
pub type CommandPtr = (LogIndex, Term);

/// Rejection for proposals sent to a non-leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotLeader {
    /// Last known leader, for client redirection. None when no leader has
    /// been heard from in the current term.
    pub leader_hint: Option<ServerId>,
}

impl fmt::Display for NotLeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.leader_hint {
            Some(id) => write!(f, "not the leader; try server {id}"),
            None => write!(f, "not the leader; no leader known"),
        }
    }
}

impl std::error::Error for NotLeader {}

/// Vote bookkeeping carried only while campaigning. Members absent from both
/// sets have not responded yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoteTally {
    granted: HashSet<ServerId>,
    denied: HashSet<ServerId>,
}

impl VoteTally {
    fn record(&mut self, voter: ServerId, granted: bool) {
        if granted {
            self.granted.insert(voter);
        } else {
            self.denied.insert(voter);
        }
    }

    pub fn granted_count(&self) -> usize {
        self.granted.len()
    }
}

/// Replication bookkeeping carried only while leading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderState {
    /// Next log index to send each follower.
    next_index: HashMap<ServerId, LogIndex>,
    /// Highest log index known replicated on each follower.
    match_index: HashMap<ServerId, LogIndex>,
}

impl LeaderState {
    fn new(followers: &[ServerId], last_log_index: LogIndex) -> Self {
        Self {
            next_index: followers.iter().map(|&p| (p, last_log_index + 1)).collect(),
            match_index: followers.iter().map(|&p| (p, 0)).collect(),
        }
    }

    pub fn next_index(&self, peer: ServerId) -> Option<LogIndex> {
        self.next_index.get(&peer).copied()
    }

    pub fn match_index(&self, peer: ServerId) -> Option<LogIndex> {
        self.match_index.get(&peer).copied()
    }
}

/// Server role. Role-specific state lives inside the variant, so vote
/// tallies exist exactly while campaigning and per-peer replication indices
/// exist exactly while leading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Created but not yet loaded from stable storage.
    Booting,
    Follower,
    Candidate(VoteTally),
    Leader(LeaderState),
}

impl Role {
    pub fn kind(&self) -> RoleKind {
        match self {
            Role::Booting => RoleKind::Booting,
            Role::Follower => RoleKind::Follower,
            Role::Candidate(_) => RoleKind::Candidate,
            Role::Leader(_) => RoleKind::Leader,
        }
    }
}

/// Payload-free role tag for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleKind {
    Booting,
    Follower,
    Candidate,
    Leader,
}

/// A request this server has sent and still awaits a response for.
#[derive(Debug, Clone)]
struct SentRequest {
    dest: ServerId,
    kind: MessageType,
    /// Highest log index the request carried (prev_log_index for an empty
    /// AppendEntries). Unused for vote requests.
    last_index: LogIndex,
}

/// Effects of one state transition, to be executed by the driver in order:
/// persist first (when `persist` is set), then flush `envelopes` in
/// production order.
#[derive(Debug, Default)]
pub struct Output {
    pub envelopes: Vec<(ServerId, Envelope)>,
    /// The durable triple changed; it must hit stable storage before any of
    /// the envelopes leave this server.
    pub persist: bool,
    /// Valid leader contact or a granted vote; the election timer restarts.
    pub reset_election: bool,
}

/// Outstanding requests are garbage-collected on matching response and on
/// term change; this cap bounds the table against peers that never answer.
const OUTSTANDING_LIMIT: usize = 1024;

/// One consensus participant.
pub struct RaftNode {
    id: ServerId,
    /// All cluster member ids, self included.
    members: Vec<ServerId>,
    role: Role,
    current_term: Term,
    voted_for: Option<ServerId>,
    log: Log,
    commit_index: LogIndex,
    last_applied: LogIndex,
    leader_hint: Option<ServerId>,
    outstanding: BTreeMap<MessageId, SentRequest>,
    next_message_id: MessageId,
}

impl RaftNode {
    /// Creates a server in the Booting role. It handles nothing until
    /// [`RaftNode::boot`] loads the durable triple.
    pub fn new(id: ServerId, mut members: Vec<ServerId>) -> Self {
        members.sort_unstable();
        members.dedup();
        debug_assert!(members.contains(&id), "own id must be a cluster member");
        Self {
            id,
            members,
            role: Role::Booting,
            current_term: 0,
            voted_for: None,
            log: Log::new(),
            commit_index: 0,
            last_applied: 0,
            leader_hint: None,
            outstanding: BTreeMap::new(),
            next_message_id: 1,
        }
    }

    /// Adopts the durable triple read from stable storage and becomes a
    /// Follower. A server never returns to Booting.
    pub fn boot(&mut self, durable: PersistentState) {
        debug_assert_eq!(self.role, Role::Booting);
        self.current_term = durable.current_term;
        self.voted_for = durable.voted_for;
        self.log = durable.log;
        self.role = Role::Follower;
        info!(
            id = self.id,
            term = self.current_term,
            log_len = self.log.len(),
            "loaded durable state, following"
        );
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn role_kind(&self) -> RoleKind {
        self.role.kind()
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader(_))
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<ServerId> {
        self.voted_for
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn leader_hint(&self) -> Option<ServerId> {
        self.leader_hint
    }

    /// Snapshot of the durable triple for the driver to persist.
    pub fn durable_state(&self) -> PersistentState {
        PersistentState {
            current_term: self.current_term,
            voted_for: self.voted_for,
            log: self.log.clone(),
        }
    }

    fn majority(&self) -> usize {
        self.members.len() / 2 + 1
    }

    fn followers(&self) -> Vec<ServerId> {
        self.members.iter().copied().filter(|&m| m != self.id).collect()
    }

    /// Dispatches one inbound envelope through the common term prelude and
    /// the shape-specific handler. Malformed envelopes are dropped.
    pub fn handle(&mut self, envelope: &Envelope) -> Output {
        let mut out = Output::default();
        let Some(term) = envelope.term() else {
            warn!(from = envelope.info.from, "dropping message without a readable term");
            return out;
        };

        // Any message from a later term demotes us before type handling.
        if term > self.current_term {
            self.step_down(term);
            out.persist = true;
        }

        let info = envelope.info;
        match envelope.kind {
            MessageType::AppendEntries => match envelope.as_append_entries() {
                Some(args) => self.on_append_entries(&mut out, info, args),
                None => warn!(from = info.from, "dropping malformed AppendEntries"),
            },
            MessageType::AppendEntriesResponse => match envelope.as_append_entries_response() {
                Some(args) => self.on_append_entries_response(&mut out, info, args),
                None => warn!(from = info.from, "dropping malformed AppendEntriesResponse"),
            },
            MessageType::RequestVote => match envelope.as_request_vote() {
                Some(args) => self.on_request_vote(&mut out, info, args),
                None => warn!(from = info.from, "dropping malformed RequestVote"),
            },
            MessageType::RequestVoteResponse => match envelope.as_request_vote_response() {
                Some(args) => self.on_request_vote_response(&mut out, info, args),
                None => warn!(from = info.from, "dropping malformed RequestVoteResponse"),
            },
        }
        out
    }

    fn on_append_entries(&mut self, out: &mut Output, info: MessageInfo, args: AppendEntriesArgs) {
        if args.term < self.current_term {
            self.respond(out, info, message::append_entries_response(self.current_term, false));
            return;
        }

        // args.term == current_term past this point; the prelude absorbed
        // anything newer.
        if matches!(self.role, Role::Candidate(_)) {
            // A leader for the term we are campaigning in has emerged.
            self.become_follower();
        }
        if matches!(self.role, Role::Leader(_)) {
            // Two leaders in one term would break election safety; refuse
            // without touching local state.
            warn!(
                term = self.current_term,
                other = args.leader_id,
                "AppendEntries from a same-term leader while leading"
            );
            self.respond(out, info, message::append_entries_response(self.current_term, false));
            return;
        }

        self.leader_hint = Some(args.leader_id);
        out.reset_election = true;

        // The entry before the new ones must match, or the leader backs up.
        if args.prev_log_index > 0
            && self.log.term_at(args.prev_log_index) != Some(args.prev_log_term)
        {
            self.respond(out, info, message::append_entries_response(self.current_term, false));
            return;
        }

        let mut log_changed = false;
        for (index, entry) in args.entries {
            match self.log.term_at(index) {
                Some(existing) if existing == entry.term => {} // already have it
                Some(_) => {
                    debug!(index, "conflicting entry, truncating suffix");
                    self.log.truncate_from(index);
                    self.log.append(entry);
                    log_changed = true;
                }
                None => {
                    if index != self.log.len() + 1 {
                        warn!(index, log_len = self.log.len(), "non-contiguous entries");
                        self.respond(
                            out,
                            info,
                            message::append_entries_response(self.current_term, false),
                        );
                        return;
                    }
                    self.log.append(entry);
                    log_changed = true;
                }
            }
        }

        if args.leader_commit > self.commit_index {
            self.commit_index = args.leader_commit.min(self.log.len());
        }

        out.persist |= log_changed;
        self.respond(out, info, message::append_entries_response(self.current_term, true));
    }

    fn on_append_entries_response(
        &mut self,
        out: &mut Output,
        info: MessageInfo,
        args: AppendEntriesResponseArgs,
    ) {
        let Some(sent) = self.outstanding.remove(&info.id) else {
            debug!(from = info.from, id = info.id, "response matches no outstanding request");
            return;
        };
        if sent.dest != info.from || sent.kind != MessageType::AppendEntries {
            warn!(from = info.from, id = info.id, "response does not match its request");
            return;
        }
        if !self.is_leader() || args.term < self.current_term {
            return;
        }

        if args.success {
            if let Role::Leader(leader) = &mut self.role {
                let matched = leader.match_index.entry(info.from).or_insert(0);
                *matched = (*matched).max(sent.last_index);
                leader.next_index.insert(info.from, *matched + 1);
            }
            self.advance_commit_index();
        } else {
            // Log inconsistency: back up one entry and retry immediately.
            if let Role::Leader(leader) = &mut self.role {
                let next = leader.next_index.entry(info.from).or_insert(1);
                *next = next.saturating_sub(1).max(1);
            }
            let (msg, last_index) = self.build_append_entries(info.from);
            self.send_request(out, info.from, msg, last_index);
        }
    }

    fn on_request_vote(&mut self, out: &mut Output, info: MessageInfo, args: RequestVoteArgs) {
        // A candidate whose log is behind ours must not win: compare by last
        // term, then last index.
        let up_to_date = (args.last_log_term, args.last_log_index)
            >= (self.log.last_term(), self.log.last_index());
        let grant = args.term == self.current_term
            && self.voted_for.map_or(true, |v| v == args.candidate_id)
            && up_to_date;

        if grant {
            self.voted_for = Some(args.candidate_id);
            out.persist = true;
            out.reset_election = true;
            debug!(term = self.current_term, candidate = args.candidate_id, "vote granted");
        }
        self.respond(out, info, message::request_vote_response(self.current_term, grant));
    }

    fn on_request_vote_response(
        &mut self,
        out: &mut Output,
        info: MessageInfo,
        args: RequestVoteResponseArgs,
    ) {
        let Some(sent) = self.outstanding.remove(&info.id) else {
            debug!(from = info.from, id = info.id, "response matches no outstanding request");
            return;
        };
        if sent.dest != info.from || sent.kind != MessageType::RequestVote {
            warn!(from = info.from, id = info.id, "response does not match its request");
            return;
        }
        let majority = self.majority();
        let Role::Candidate(tally) = &mut self.role else {
            return;
        };
        if args.term != self.current_term {
            return;
        }

        tally.record(info.from, args.vote_granted);
        if tally.granted_count() >= majority {
            self.become_leader(out);
        }
    }

    /// Election timeout fired: start (or restart) a campaign.
    pub fn start_election(&mut self) -> Output {
        debug_assert!(
            matches!(self.role, Role::Follower | Role::Candidate(_)),
            "only followers and candidates campaign"
        );
        let mut out = Output::default();
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.role = Role::Candidate(VoteTally::default());
        self.leader_hint = None;
        self.outstanding.clear();
        out.persist = true;
        out.reset_election = true;

        info!(id = self.id, term = self.current_term, "election timeout, campaigning");
        let (last_index, last_term) = (self.log.last_index(), self.log.last_term());
        for member in self.members.clone() {
            let msg = message::request_vote(self.current_term, self.id, last_index, last_term);
            self.send_request(&mut out, member, msg, 0);
        }
        out
    }

    /// Heartbeat timer fired: replicate to every follower. Followers that
    /// are caught up get an empty AppendEntries; stragglers get the suffix
    /// from their next_index.
    pub fn tick_heartbeat(&mut self) -> Output {
        let mut out = Output::default();
        if !self.is_leader() {
            return out;
        }
        for peer in self.followers() {
            let (msg, last_index) = self.build_append_entries(peer);
            self.send_request(&mut out, peer, msg, last_index);
        }
        out
    }

    /// Appends a client command to the leader's log and starts replicating
    /// it. The returned pointer identifies the entry for apply correlation.
    pub fn propose(&mut self, command: Command) -> Result<(CommandPtr, Output), NotLeader> {
        if !self.is_leader() {
            return Err(NotLeader {
                leader_hint: self.leader_hint,
            });
        }
        let mut out = Output::default();
        let index = self.log.append(LogEntry::new(self.current_term, command));
        let ptr = (index, self.current_term);
        out.persist = true;
        for peer in self.followers() {
            let (msg, last_index) = self.build_append_entries(peer);
            self.send_request(&mut out, peer, msg, last_index);
        }
        // A single-member cluster reaches majority on its own log.
        self.advance_commit_index();
        Ok((ptr, out))
    }

    /// Drains entries that are committed but not yet applied, in index
    /// order, advancing the applied cursor.
    pub fn take_applicable(&mut self) -> Vec<(LogIndex, LogEntry)> {
        let mut batch = Vec::new();
        while self.last_applied < self.commit_index {
            let next = self.last_applied + 1;
            let Some(entry) = self.log.entry(next) else {
                debug_assert!(false, "commit index beyond log end");
                break;
            };
            batch.push((next, entry.clone()));
            self.last_applied = next;
        }
        batch
    }

    /// Largest N above commitIndex such that log[N] is from the current term
    /// and a majority (self included) holds it. Entries from earlier terms
    /// are only ever committed by a current-term entry above them.
    fn advance_commit_index(&mut self) -> bool {
        let Role::Leader(leader) = &self.role else {
            return false;
        };
        let majority = self.majority();
        let mut new_commit = self.commit_index;
        for n in (self.commit_index + 1)..=self.log.len() {
            if self.log.term_at(n) != Some(self.current_term) {
                continue;
            }
            let replicas = 1 + leader.match_index.values().filter(|&&m| m >= n).count();
            if replicas >= majority {
                new_commit = n;
            }
        }
        if new_commit > self.commit_index {
            debug!(from = self.commit_index, to = new_commit, "commit index advanced");
            self.commit_index = new_commit;
            true
        } else {
            false
        }
    }

    fn become_leader(&mut self, out: &mut Output) {
        info!(id = self.id, term = self.current_term, "won election, leading");
        let followers = self.followers();
        self.role = Role::Leader(LeaderState::new(&followers, self.log.last_index()));
        self.leader_hint = Some(self.id);
        // Announce immediately; this also serves as the first heartbeat.
        for peer in followers {
            let (msg, last_index) = self.build_append_entries(peer);
            self.send_request(out, peer, msg, last_index);
        }
    }

    /// Adopts a newer term and becomes a follower.
    fn step_down(&mut self, term: Term) {
        debug_assert!(term > self.current_term);
        info!(id = self.id, from = self.current_term, to = term, "newer term observed");
        self.current_term = term;
        self.voted_for = None;
        self.become_follower();
    }

    /// Becomes a follower in the current term (no vote change).
    fn become_follower(&mut self) {
        self.role = Role::Follower;
        self.leader_hint = None;
        self.outstanding.clear();
    }

    fn build_append_entries(&self, peer: ServerId) -> (Message, LogIndex) {
        let next = match &self.role {
            Role::Leader(leader) => leader.next_index(peer).unwrap_or(self.log.len() + 1),
            _ => self.log.len() + 1,
        };
        let prev_log_index = next - 1;
        let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
        let entries = self.log.entries_from(next);
        let last_index = prev_log_index + entries.len() as LogIndex;
        let msg = message::append_entries(
            self.current_term,
            self.id,
            prev_log_index,
            prev_log_term,
            &entries,
            self.commit_index,
        );
        (msg, last_index)
    }

    /// Stamps a request with a fresh id, records it as outstanding, and
    /// queues it for the driver to flush.
    fn send_request(&mut self, out: &mut Output, dest: ServerId, msg: Message, last_index: LogIndex) {
        let id = self.next_message_id;
        self.next_message_id += 1;
        self.outstanding.insert(
            id,
            SentRequest {
                dest,
                kind: msg.kind,
                last_index,
            },
        );
        // Ids are monotonic, so the first key is always the oldest entry.
        while self.outstanding.len() > OUTSTANDING_LIMIT {
            self.outstanding.pop_first();
        }
        out.envelopes.push((dest, msg.stamp(self.id, id)));
    }

    /// Stamps a response with the id of the request it answers.
    fn respond(&self, out: &mut Output, request: MessageInfo, msg: Message) {
        out.envelopes.push((request.from, msg.stamp(self.id, request.id)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PersistentState;
    use serde_json::json;

    fn booted(id: ServerId, members: &[ServerId]) -> RaftNode {
        let mut node = RaftNode::new(id, members.to_vec());
        node.boot(PersistentState::default());
        node
    }

    fn recovered(id: ServerId, members: &[ServerId], durable: PersistentState) -> RaftNode {
        let mut node = RaftNode::new(id, members.to_vec());
        node.boot(durable);
        node
    }

    fn log_of(terms_and_commands: &[(Term, &str)]) -> Log {
        let mut log = Log::new();
        for (term, cmd) in terms_and_commands {
            log.append(LogEntry::new(*term, json!(cmd)));
        }
        log
    }

    /// Pulls the envelope addressed to `dest` out of an output.
    fn sent_to(out: &Output, dest: ServerId) -> Envelope {
        out.envelopes
            .iter()
            .find(|(to, _)| *to == dest)
            .map(|(_, env)| env.clone())
            .expect("an envelope addressed to the peer")
    }

    /// Answers an outstanding vote request from `voter`.
    fn vote_reply(request: &Envelope, voter: ServerId, term: Term, granted: bool) -> Envelope {
        message::request_vote_response(term, granted).stamp(voter, request.info.id)
    }

    /// Answers an outstanding AppendEntries from `follower`.
    fn append_reply(request: &Envelope, follower: ServerId, term: Term, success: bool) -> Envelope {
        message::append_entries_response(term, success).stamp(follower, request.info.id)
    }

    /// Drives a freshly booted node to leadership in a 3-member cluster:
    /// self-vote via loopback, then one peer grant for the majority.
    fn make_leader(id: ServerId, members: &[ServerId]) -> RaftNode {
        let mut node = booted(id, members);
        let out = node.start_election();
        let out_self = node.handle(&sent_to(&out, id));
        node.handle(&sent_to(&out_self, id));
        let voter = members.iter().copied().find(|&m| m != id).unwrap();
        node.start_election_grant_from(voter);
        assert!(node.is_leader());
        node
    }

    impl RaftNode {
        /// Test shortcut: feed a granted vote from `voter` for the current
        /// campaign, using the real outstanding id.
        fn start_election_grant_from(&mut self, voter: ServerId) -> Output {
            let (&id, _) = self
                .outstanding
                .iter()
                .find(|(_, sent)| sent.dest == voter && sent.kind == MessageType::RequestVote)
                .expect("outstanding vote request for voter");
            let env = message::request_vote_response(self.current_term, true).stamp(voter, id);
            self.handle(&env)
        }
    }

    #[test]
    fn boot_transitions_booting_to_follower() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        assert_eq!(node.role_kind(), RoleKind::Booting);
        node.boot(PersistentState::default());
        assert_eq!(node.role_kind(), RoleKind::Follower);
        assert_eq!(node.current_term(), 0);
        assert_eq!(node.voted_for(), None);
        assert_eq!(node.commit_index(), 0);
        assert_eq!(node.last_applied(), 0);
        assert!(node.log().is_empty());
    }

    #[test]
    fn single_member_cluster_elects_itself() {
        // The self-addressed vote request loops back through the ordinary
        // handlers and wins the one-member majority.
        let mut node = booted(1, &[1]);
        let out = node.start_election();
        assert!(out.persist);
        assert_eq!(node.role_kind(), RoleKind::Candidate);
        assert_eq!(node.current_term(), 1);
        assert_eq!(node.voted_for(), Some(1));

        let request = sent_to(&out, 1);
        let out = node.handle(&request);
        let grant = sent_to(&out, 1);
        assert!(out.reset_election, "granting a vote restarts the timer");

        node.handle(&grant);
        assert_eq!(node.role_kind(), RoleKind::Leader);
        assert_eq!(node.current_term(), 1);
        assert!(node.log().is_empty());
        assert_eq!(node.commit_index(), 0);
    }

    #[test]
    fn majority_of_three_elects_a_leader() {
        let mut node = booted(1, &[1, 2, 3]);
        let out = node.start_election();
        assert_eq!(out.envelopes.len(), 3, "vote requests go to every member");

        // Self grant.
        let out_self = node.handle(&sent_to(&out, 1));
        node.handle(&sent_to(&out_self, 1));
        assert_eq!(node.role_kind(), RoleKind::Candidate, "one vote is not a majority");

        // One peer grant tips the majority.
        let out = node.start_election_grant_from(2);
        assert_eq!(node.role_kind(), RoleKind::Leader);
        if let Role::Leader(leader) = node.role() {
            assert_eq!(leader.next_index(2), Some(1));
            assert_eq!(leader.next_index(3), Some(1));
            assert_eq!(leader.match_index(2), Some(0));
            assert_eq!(leader.match_index(3), Some(0));
        } else {
            unreachable!();
        }

        // The win is announced with empty AppendEntries to both followers.
        for peer in [2, 3] {
            let announce = sent_to(&out, peer);
            let args = announce.as_append_entries().unwrap();
            assert!(args.entries.is_empty());
            assert_eq!(args.leader_id, 1);
            assert_eq!(args.term, node.current_term());
        }
    }

    #[test]
    fn denied_votes_do_not_count() {
        let mut node = booted(1, &[1, 2, 3, 4, 5]);
        let out = node.start_election();

        let out_self = node.handle(&sent_to(&out, 1));
        node.handle(&sent_to(&out_self, 1));

        for voter in [2, 3] {
            let (&id, _) = node
                .outstanding
                .iter()
                .find(|(_, sent)| sent.dest == voter)
                .unwrap();
            let env = message::request_vote_response(node.current_term(), false).stamp(voter, id);
            node.handle(&env);
        }
        assert_eq!(node.role_kind(), RoleKind::Candidate, "denials never elect");
    }

    #[test]
    fn reelection_increments_term_and_revotes() {
        let mut node = booted(5, &[4, 5, 6]);
        node.start_election();
        assert_eq!(node.current_term(), 1);
        let out = node.start_election();
        assert_eq!(node.current_term(), 2);
        assert_eq!(node.voted_for(), Some(5));
        assert_eq!(node.role_kind(), RoleKind::Candidate);
        let request = sent_to(&out, 4).as_request_vote().unwrap();
        assert_eq!(request.term, 2);
        assert_eq!(request.candidate_id, 5);
    }

    #[test]
    fn stale_vote_responses_from_a_previous_term_are_ignored() {
        let mut node = booted(1, &[1, 2, 3]);
        let first = node.start_election();
        let stale_request = sent_to(&first, 2);
        node.start_election(); // term advances, prior campaign abandoned

        // The old id was evicted with the term change; even a fresh-looking
        // grant for it must not count.
        let stale = vote_reply(&stale_request, 2, 1, true);
        node.handle(&stale);
        assert_eq!(node.role_kind(), RoleKind::Candidate);
        if let Role::Candidate(tally) = node.role() {
            assert_eq!(tally.granted_count(), 0);
        }
    }

    #[test]
    fn candidate_steps_down_for_a_current_term_leader() {
        let mut node = booted(1, &[1, 2, 3]);
        node.start_election();
        let term = node.current_term();

        let env = message::append_entries(term, 2, 0, 0, &[], 0).stamp(2, 77);
        let out = node.handle(&env);
        assert_eq!(node.role_kind(), RoleKind::Follower);
        assert_eq!(node.current_term(), term);
        assert_eq!(node.leader_hint(), Some(2));
        assert!(out.reset_election);
        let reply = sent_to(&out, 2).as_append_entries_response().unwrap();
        assert!(reply.success);
    }

    #[test]
    fn candidate_rejects_an_older_term_leader() {
        let mut node = booted(1, &[1, 2, 3]);
        node.start_election();
        node.start_election();
        let term = node.current_term();

        let env = message::append_entries(term - 1, 2, 0, 0, &[], 0).stamp(2, 78);
        let out = node.handle(&env);
        assert_eq!(node.role_kind(), RoleKind::Candidate, "stale leaders do not demote");
        assert!(!out.reset_election);
        let reply = sent_to(&out, 2).as_append_entries_response().unwrap();
        assert!(!reply.success);
        assert_eq!(reply.term, term, "reply tells the stale leader the real term");
    }

    #[test]
    fn append_entries_appends_and_advances_commit() {
        let mut node = booted(2, &[1, 2, 3]);
        let entries = vec![(1, LogEntry::new(2, json!("x")))];
        let env = message::append_entries(2, 1, 0, 0, &entries, 0).stamp(1, 5);
        let out = node.handle(&env);

        assert_eq!(node.current_term(), 2, "prelude adopts the leader's term");
        assert_eq!(node.log().len(), 1);
        assert_eq!(node.commit_index(), 0);
        assert!(out.persist);
        assert!(out.reset_election);
        let reply = sent_to(&out, 1).as_append_entries_response().unwrap();
        assert!(reply.success);
        assert_eq!(reply.term, 2);

        // Next heartbeat carries the leader's advanced commit index.
        let env = message::append_entries(2, 1, 1, 2, &[], 1).stamp(1, 6);
        node.handle(&env);
        assert_eq!(node.commit_index(), 1);
        let applied = node.take_applicable();
        assert_eq!(applied, vec![(1, LogEntry::new(2, json!("x")))]);
        assert_eq!(node.last_applied(), 1);
        assert!(node.take_applicable().is_empty(), "entries apply once");
    }

    #[test]
    fn commit_index_is_capped_by_log_length() {
        let mut node = booted(2, &[1, 2, 3]);
        let entries = vec![(1, LogEntry::new(1, json!("a")))];
        // Leader commit references entries this follower does not hold yet.
        let env = message::append_entries(1, 1, 0, 0, &entries, 9).stamp(1, 5);
        node.handle(&env);
        assert_eq!(node.commit_index(), 1);
    }

    #[test]
    fn log_mismatch_is_rejected_until_leader_backs_up() {
        let durable = PersistentState {
            current_term: 2,
            voted_for: None,
            log: log_of(&[(1, "a")]),
        };
        let mut node = recovered(2, &[1, 2, 3], durable);

        // prev entry (2, term 2) does not exist here.
        let entries = vec![(3, LogEntry::new(2, json!("c")))];
        let env = message::append_entries(2, 1, 2, 2, &entries, 0).stamp(1, 5);
        let out = node.handle(&env);
        let reply = sent_to(&out, 1).as_append_entries_response().unwrap();
        assert!(!reply.success);
        assert_eq!(node.log().len(), 1, "nothing was appended");
        assert!(out.reset_election, "a mismatching leader is still a valid leader");
    }

    #[test]
    fn conflicting_suffix_is_truncated() {
        // Follower log [(1,a),(1,b),(2,c)]; leader sends (3,B) at index 2.
        let durable = PersistentState {
            current_term: 2,
            voted_for: None,
            log: log_of(&[(1, "a"), (1, "b"), (2, "c")]),
        };
        let mut node = recovered(2, &[1, 2, 3], durable);

        let entries = vec![(2, LogEntry::new(3, json!("B")))];
        let env = message::append_entries(3, 1, 1, 1, &entries, 0).stamp(1, 5);
        let out = node.handle(&env);

        let reply = sent_to(&out, 1).as_append_entries_response().unwrap();
        assert!(reply.success);
        assert!(out.persist);
        assert_eq!(node.log().len(), 2);
        assert_eq!(node.log().entry(1).unwrap().command, json!("a"));
        assert_eq!(node.log().entry(2).unwrap(), &LogEntry::new(3, json!("B")));
    }

    #[test]
    fn duplicate_append_entries_is_idempotent() {
        let mut node = booted(2, &[1, 2, 3]);
        let entries = vec![(1, LogEntry::new(1, json!("a"))), (2, LogEntry::new(1, json!("b")))];
        let env = message::append_entries(1, 1, 0, 0, &entries, 0).stamp(1, 5);
        node.handle(&env);
        let before = node.log().clone();

        let replay = message::append_entries(1, 1, 0, 0, &entries, 0).stamp(1, 5);
        let out = node.handle(&replay);
        assert_eq!(node.log(), &before);
        assert!(!out.persist, "an unchanged log is not rewritten");
        let reply = sent_to(&out, 1).as_append_entries_response().unwrap();
        assert!(reply.success);
    }

    #[test]
    fn vote_granted_once_per_term() {
        let mut node = booted(3, &[1, 2, 3]);
        let env = message::request_vote(1, 1, 0, 0).stamp(1, 9);
        let out = node.handle(&env);
        let reply = sent_to(&out, 1).as_request_vote_response().unwrap();
        assert!(reply.vote_granted);
        assert!(out.persist, "the vote is durable before the reply leaves");
        assert_eq!(node.voted_for(), Some(1));

        // Same term, different candidate: denied.
        let env = message::request_vote(1, 2, 0, 0).stamp(2, 3);
        let out = node.handle(&env);
        let reply = sent_to(&out, 2).as_request_vote_response().unwrap();
        assert!(!reply.vote_granted);
        assert_eq!(node.voted_for(), Some(1));

        // Same term, same candidate again (duplicate request): still granted.
        let env = message::request_vote(1, 1, 0, 0).stamp(1, 10);
        let out = node.handle(&env);
        let reply = sent_to(&out, 1).as_request_vote_response().unwrap();
        assert!(reply.vote_granted);
    }

    #[test]
    fn vote_denied_when_candidate_log_is_behind() {
        // Our log ends in term 2; the candidate's ends in term 1. The prelude
        // still adopts its newer term, but the vote is denied.
        let durable = PersistentState {
            current_term: 2,
            voted_for: None,
            log: log_of(&[(1, "a"), (2, "b")]),
        };
        let mut node = recovered(3, &[3, 9, 11], durable);

        let env = message::request_vote(3, 9, 2, 1).stamp(9, 4);
        let out = node.handle(&env);

        assert_eq!(node.current_term(), 3);
        let reply = sent_to(&out, 9).as_request_vote_response().unwrap();
        assert_eq!(reply.term, 3);
        assert!(!reply.vote_granted);
        assert_eq!(node.voted_for(), None, "no vote is spent on a stale log");
    }

    #[test]
    fn vote_granted_on_equal_logs_with_longer_or_equal_index() {
        let durable = PersistentState {
            current_term: 2,
            voted_for: None,
            log: log_of(&[(1, "a"), (2, "b")]),
        };
        let mut node = recovered(3, &[3, 9, 11], durable);

        // Same last term, same last index: up-to-date, granted.
        let env = message::request_vote(3, 9, 2, 2).stamp(9, 4);
        let out = node.handle(&env);
        assert!(sent_to(&out, 9).as_request_vote_response().unwrap().vote_granted);
    }

    #[test]
    fn stale_term_vote_request_is_denied_with_current_term() {
        let durable = PersistentState {
            current_term: 4,
            voted_for: Some(7),
            log: log_of(&[(2, "a"), (4, "b")]),
        };
        let mut node = recovered(5, &[5, 7, 9], durable);

        assert_eq!(node.current_term(), 4);
        assert_eq!(node.voted_for(), Some(7));
        assert_eq!(node.commit_index(), 0);
        assert_eq!(node.role_kind(), RoleKind::Follower);

        // After recovery, any vote request in term <= 4 from someone other
        // than the recorded grantee is denied.
        for term in [3, 4] {
            let env = message::request_vote(term, 9, 10, 10).stamp(9, 1);
            let out = node.handle(&env);
            let reply = sent_to(&out, 9).as_request_vote_response().unwrap();
            assert!(!reply.vote_granted);
            assert_eq!(reply.term, 4);
        }
        assert_eq!(node.voted_for(), Some(7));
    }

    #[test]
    fn leader_replicates_and_commits_on_majority() {
        let mut node = make_leader(1, &[1, 2, 3]);
        let term = node.current_term();

        let (ptr, out) = node.propose(json!("x")).unwrap();
        assert_eq!(ptr, (1, term));
        assert_eq!(node.log().len(), 1);
        assert!(out.persist);
        assert_eq!(node.commit_index(), 0, "no follower has confirmed yet");

        let request = sent_to(&out, 2);
        let args = request.as_append_entries().unwrap();
        assert_eq!(args.prev_log_index, 0);
        assert_eq!(args.entries, vec![(1, LogEntry::new(term, json!("x")))]);
        assert_eq!(args.leader_commit, 0);

        // First confirmation reaches majority (leader + one follower).
        node.handle(&append_reply(&request, 2, term, true));
        assert_eq!(node.commit_index(), 1);
        if let Role::Leader(leader) = node.role() {
            assert_eq!(leader.match_index(2), Some(1));
            assert_eq!(leader.next_index(2), Some(2));
        }
        assert_eq!(node.take_applicable().len(), 1);

        // The next heartbeat announces the new commit index.
        let out = node.tick_heartbeat();
        let hb = sent_to(&out, 3).as_append_entries().unwrap();
        assert_eq!(hb.leader_commit, 1);
    }

    #[test]
    fn failed_append_backs_up_and_retries() {
        // A leader elected with history probes followers from the end of its
        // log and walks backwards on mismatch.
        let durable = PersistentState {
            current_term: 1,
            voted_for: None,
            log: log_of(&[(1, "a"), (1, "b")]),
        };
        let mut node = recovered(1, &[1, 2, 3], durable);
        let out = node.start_election(); // term 2
        let out_self = node.handle(&sent_to(&out, 1));
        node.handle(&sent_to(&out_self, 1));
        node.start_election_grant_from(2);
        let term = node.current_term();

        let out = node.tick_heartbeat();
        let request = sent_to(&out, 2);
        assert_eq!(request.as_append_entries().unwrap().prev_log_index, 2);

        // Mismatch: back up one entry and resend the suffix immediately.
        let out = node.handle(&append_reply(&request, 2, term, false));
        let retry = sent_to(&out, 2).as_append_entries().unwrap();
        assert_eq!(retry.prev_log_index, 1);
        assert_eq!(retry.entries, vec![(2, LogEntry::new(1, json!("b")))]);

        // A second mismatch reaches the front of the log.
        let out = node.handle(&append_reply(&sent_to(&out, 2), 2, term, false));
        let retry = sent_to(&out, 2).as_append_entries().unwrap();
        assert_eq!(retry.prev_log_index, 0);
        assert_eq!(retry.entries.len(), 2);
        if let Role::Leader(leader) = node.role() {
            assert_eq!(leader.next_index(2), Some(1));
        }
    }

    #[test]
    fn next_index_never_drops_below_one() {
        let mut node = make_leader(1, &[1, 2, 3]);
        let term = node.current_term();
        for _ in 0..4 {
            let out = node.tick_heartbeat();
            let request = sent_to(&out, 2);
            node.handle(&append_reply(&request, 2, term, false));
            if let Role::Leader(leader) = node.role() {
                assert!(leader.next_index(2).unwrap() >= 1);
            }
        }
    }

    #[test]
    fn commit_skips_entries_from_earlier_terms() {
        // A new leader holds entries from an earlier term; acknowledgements
        // for them alone must not move the commit index.
        let durable = PersistentState {
            current_term: 2,
            voted_for: None,
            log: log_of(&[(2, "old")]),
        };
        let mut node = recovered(1, &[1, 2, 3], durable);
        let out = node.start_election(); // term 3
        let out_self = node.handle(&sent_to(&out, 1));
        node.handle(&sent_to(&out_self, 1));
        node.start_election_grant_from(2);
        assert!(node.is_leader());
        let term = node.current_term();

        // Follower confirms the old-term entry.
        let out = node.tick_heartbeat();
        let request = sent_to(&out, 2);
        node.handle(&append_reply(&request, 2, term, true));
        assert_eq!(node.commit_index(), 0, "earlier-term entries never commit directly");

        // A current-term entry on a majority commits everything below it.
        let (_, out) = node.propose(json!("new")).unwrap();
        let request = sent_to(&out, 2);
        node.handle(&append_reply(&request, 2, term, true));
        assert_eq!(node.commit_index(), 2);
    }

    #[test]
    fn leader_steps_down_on_newer_term_response() {
        let mut node = make_leader(1, &[1, 2, 3]);
        let out = node.tick_heartbeat();
        assert!(!node.outstanding.is_empty());

        let request = sent_to(&out, 2);
        let newer = node.current_term() + 3;
        let out = node.handle(&append_reply(&request, 2, newer, false));

        assert_eq!(node.role_kind(), RoleKind::Follower);
        assert_eq!(node.current_term(), newer);
        assert_eq!(node.voted_for(), None);
        assert!(out.persist);
        assert!(node.outstanding.is_empty(), "step-down abandons outstanding requests");
    }

    #[test]
    fn responses_with_no_outstanding_request_are_dropped() {
        let mut node = make_leader(1, &[1, 2, 3]);
        let term = node.current_term();
        let before_commit = node.commit_index();

        let env = message::append_entries_response(term, true).stamp(2, 424242);
        node.handle(&env);
        assert_eq!(node.commit_index(), before_commit);
        assert!(node.is_leader());
    }

    #[test]
    fn response_from_the_wrong_peer_is_dropped() {
        let mut node = make_leader(1, &[1, 2, 3]);
        let term = node.current_term();
        node.propose(json!("x")).unwrap();
        let out = node.tick_heartbeat();
        let request = sent_to(&out, 2);

        // Peer 3 answers with peer 2's request id.
        let forged = message::append_entries_response(term, true).stamp(3, request.info.id);
        node.handle(&forged);
        if let Role::Leader(leader) = node.role() {
            assert_eq!(leader.match_index(3), Some(0), "mismatched responses count for nobody");
        }
    }

    #[test]
    fn non_candidate_ignores_vote_responses() {
        let mut node = make_leader(1, &[1, 2, 3]);
        let env = message::request_vote_response(node.current_term(), true).stamp(2, 1);
        node.handle(&env);
        assert!(node.is_leader(), "leaders discard vote responses");
    }

    #[test]
    fn malformed_messages_change_nothing() {
        let mut node = booted(1, &[1, 2, 3]);
        let env = message::request_vote(1, 2, 0, 0).stamp(2, 1);
        let mut doc: serde_json::Value = serde_json::from_slice(&env.encode().unwrap()).unwrap();
        doc["_msgArgs"][0][1] = json!("not json at all {");
        let corrupted = Envelope::decode(doc.to_string().as_bytes()).unwrap();

        let out = node.handle(&corrupted);
        assert!(out.envelopes.is_empty(), "malformed messages get no reply");
        assert!(!out.persist);
        assert_eq!(node.current_term(), 0);
        assert_eq!(node.voted_for(), None);
    }

    #[test]
    fn leader_only_state_exists_exactly_while_leading() {
        let mut node = make_leader(1, &[1, 2, 3]);
        assert!(matches!(node.role(), Role::Leader(_)));

        // A newer-term message demotes; the per-peer maps vanish with the role.
        let env = message::append_entries(node.current_term() + 1, 3, 0, 0, &[], 0).stamp(3, 1);
        node.handle(&env);
        assert!(matches!(node.role(), Role::Follower));
    }

    #[test]
    fn applied_never_passes_commit() {
        let mut node = booted(2, &[1, 2, 3]);
        let entries: Vec<_> = (1..=3)
            .map(|i| (i, LogEntry::new(1, json!(format!("c{i}")))))
            .collect();
        let env = message::append_entries(1, 1, 0, 0, &entries, 2).stamp(1, 5);
        node.handle(&env);

        assert_eq!(node.commit_index(), 2);
        let applied = node.take_applicable();
        assert_eq!(applied.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(node.last_applied(), 2);
        assert!(node.last_applied() <= node.commit_index());
        assert!(node.commit_index() <= node.log().len());
    }
}
