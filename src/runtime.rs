//! The election and replication driver.
//!
//! One worker thread owns the consensus state machine and everything it
//! touches: the durable store, the application state machine, the timers.
//! Network listener threads and short-lived connection handlers feed it
//! decoded envelopes through channels, so the state machine itself stays
//! single-threaded and lock-free.
//!
//! Self-addressed envelopes never touch the network: they go through a
//! dedicated loopback channel and are handled under the same persistence
//! discipline as everything else.
//!
//! The worker executes every handler [`Output`] in a fixed order: persist
//! the durable triple first (a failed write aborts the worker before any
//! message leaves), then flush envelopes in production order, then apply
//! newly committed entries and settle waiting client proposals.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender, unbounded};
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::config::{NodeConfig, TimingConfig};
use crate::log::{Command, LogIndex, ServerId, Term};
use crate::message::Envelope;
use crate::node::{CommandPtr, Output, RaftNode, RoleKind};
use crate::state_machine::{AppliedLog, StateMachine};
use crate::storage::StateStore;

/// How many recently applied entries a node keeps for status reporting.
const APPLIED_TAIL_LIMIT: usize = 64;

/// Handle for interacting with a running node.
///
/// The worker thread owns the actual consensus state; this handle talks to
/// it over a channel, each request carrying its own reply channel.
pub struct NodeHandle {
    request_tx: Sender<ClientRequest>,
}

impl NodeHandle {
    /// Submits a command for replication. Blocks until the entry is
    /// committed and applied on this node, returning its log position.
    ///
    /// Fails when this node is not the leader, when the entry's slot is
    /// later overwritten by another leader, or when the node shuts down.
    pub fn propose(&self, command: Command) -> Result<CommandPtr> {
        let (resp_tx, resp_rx) = unbounded();
        self.request_tx
            .send(ClientRequest::Propose {
                command,
                respond_to: resp_tx,
            })
            .context("failed to send proposal")?;
        resp_rx.recv().context("proposal response channel closed")?
    }

    /// Snapshot of the node's current consensus state.
    pub fn status(&self) -> Result<NodeStatus> {
        let (resp_tx, resp_rx) = unbounded();
        self.request_tx
            .send(ClientRequest::Status {
                respond_to: resp_tx,
            })
            .context("failed to send status request")?;
        resp_rx.recv().context("status response channel closed")
    }

    /// Forces an immediate election unless the node already leads. Useful
    /// for tests and demos; normal elections are timer-driven.
    pub fn campaign(&self) -> Result<()> {
        let (resp_tx, resp_rx) = unbounded();
        self.request_tx
            .send(ClientRequest::Campaign {
                respond_to: resp_tx,
            })
            .context("failed to send campaign request")?;
        resp_rx.recv().context("campaign response channel closed")
    }

    /// Signals the worker to shut down.
    pub fn shutdown(&self) -> Result<()> {
        self.request_tx
            .send(ClientRequest::Shutdown)
            .context("failed to send shutdown")?;
        Ok(())
    }
}

/// Point-in-time view of one node, as reported over [`NodeHandle::status`].
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub id: ServerId,
    pub role: RoleKind,
    pub term: Term,
    /// Last known leader, if any has been heard from this term.
    pub leader_hint: Option<ServerId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub log_len: LogIndex,
    /// Most recently applied entries, oldest first.
    pub applied_tail: Vec<(LogIndex, Command)>,
}

enum ClientRequest {
    Propose {
        command: Command,
        respond_to: Sender<Result<CommandPtr>>,
    },
    Status {
        respond_to: Sender<NodeStatus>,
    },
    Campaign {
        respond_to: Sender<()>,
    },
    Shutdown,
}

/// A proposal waiting for its log slot to commit and apply.
///
/// The slot is identified by (index, term): if the slot applies with a
/// different term, another leader overwrote it and the proposal is lost.
struct PendingProposal {
    ptr: CommandPtr,
    respond_to: Sender<Result<CommandPtr>>,
}

/// Spawns a node with the default recording state machine.
pub fn spawn_node(config: NodeConfig) -> Result<NodeHandle> {
    spawn_node_with(config, Box::new(AppliedLog::new()))
}

/// Spawns a node that applies committed commands to the given state
/// machine. Returns once the network listener is bound and the worker is
/// running; consensus proceeds in the background.
pub fn spawn_node_with(
    config: NodeConfig,
    state_machine: Box<dyn StateMachine>,
) -> Result<NodeHandle> {
    config.timing.validate()?;
    if !config.cluster.contains(config.id) {
        return Err(anyhow!("own id {} missing from the cluster document", config.id));
    }
    let listen_addr = config
        .cluster
        .addr_of(config.id)
        .ok_or_else(|| anyhow!("no address for own id {}", config.id))?;
    let peers: HashMap<ServerId, String> = config
        .cluster
        .servers
        .iter()
        .filter(|s| s.id != config.id)
        .map(|s| (s.id, s.addr()))
        .collect();

    let store = StateStore::from_name(&config.storage_name);
    let durable = store.read()?;
    let mut node = RaftNode::new(config.id, config.cluster.server_ids());
    node.boot(durable);

    let (client_tx, client_rx) = unbounded();
    let (network_tx, network_rx) = unbounded();
    let (loopback_tx, loopback_rx) = unbounded();

    let stopping = Arc::new(AtomicBool::new(false));
    spawn_network_listener(&listen_addr, network_tx, stopping.clone())?;

    let timing = config.timing;
    let id = config.id;
    thread::Builder::new()
        .name(format!("raft-worker-{id}"))
        .spawn(move || {
            let mut worker = Worker::new(
                node,
                store,
                peers,
                timing,
                state_machine,
                client_rx,
                network_rx,
                loopback_tx,
                loopback_rx,
            );
            let result = worker.run();
            // Unblock the accept loop so the listener releases its port.
            stopping.store(true, Ordering::SeqCst);
            let _ = TcpStream::connect(&listen_addr);
            if let Err(err) = result {
                error!(id, error = ?err, "consensus worker stopped");
            }
        })
        .context("failed to spawn consensus worker")?;

    Ok(NodeHandle {
        request_tx: client_tx,
    })
}

struct Worker {
    node: RaftNode,
    store: StateStore,
    peers: HashMap<ServerId, String>,
    timing: TimingConfig,
    state_machine: Box<dyn StateMachine>,
    client_rx: Receiver<ClientRequest>,
    network_rx: Receiver<Envelope>,
    loopback_tx: Sender<Envelope>,
    loopback_rx: Receiver<Envelope>,
    election_deadline: Instant,
    next_heartbeat: Instant,
    applied_tail: VecDeque<(LogIndex, Command)>,
    pending: Vec<PendingProposal>,
    last_role: RoleKind,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    fn new(
        node: RaftNode,
        store: StateStore,
        peers: HashMap<ServerId, String>,
        timing: TimingConfig,
        state_machine: Box<dyn StateMachine>,
        client_rx: Receiver<ClientRequest>,
        network_rx: Receiver<Envelope>,
        loopback_tx: Sender<Envelope>,
        loopback_rx: Receiver<Envelope>,
    ) -> Self {
        let last_role = node.role_kind();
        let now = Instant::now();
        let mut worker = Self {
            node,
            store,
            peers,
            timing,
            state_machine,
            client_rx,
            network_rx,
            loopback_tx,
            loopback_rx,
            election_deadline: now,
            next_heartbeat: now,
            applied_tail: VecDeque::new(),
            pending: Vec::new(),
            last_role,
        };
        worker.reset_election_deadline();
        worker
    }

    /// Runs the event loop until shutdown: wait for whichever comes first
    /// of a client request, an inbound envelope, a loopback envelope, or
    /// the next timer deadline.
    fn run(&mut self) -> Result<()> {
        loop {
            let deadline = match self.node.role_kind() {
                RoleKind::Leader => self.next_heartbeat,
                _ => self.election_deadline,
            };
            let timeout = deadline.saturating_duration_since(Instant::now());

            crossbeam_channel::select! {
                recv(self.client_rx) -> req => {
                    match req {
                        Ok(req) => {
                            if !self.handle_client_request(req)? {
                                break;
                            }
                        }
                        Err(_) => break, // every handle dropped
                    }
                }
                recv(self.loopback_rx) -> env => {
                    if let Ok(env) = env {
                        self.deliver(env)?;
                    }
                }
                recv(self.network_rx) -> env => {
                    match env {
                        Ok(env) => self.deliver(env)?,
                        Err(_) => break, // listener died
                    }
                }
                default(timeout) => self.on_timer()?,
            }

            self.sync_role_timers();
        }
        Ok(())
    }

    fn deliver(&mut self, envelope: Envelope) -> Result<()> {
        let out = self.node.handle(&envelope);
        self.execute(out)
    }

    fn on_timer(&mut self) -> Result<()> {
        let now = Instant::now();
        if self.node.is_leader() {
            if now >= self.next_heartbeat {
                self.next_heartbeat = now + self.timing.heartbeat_interval;
                let out = self.node.tick_heartbeat();
                self.execute(out)?;
            }
        } else if now >= self.election_deadline {
            self.reset_election_deadline();
            let out = self.node.start_election();
            self.execute(out)?;
        }
        Ok(())
    }

    /// Executes one handler output: persist, then send, then apply.
    fn execute(&mut self, out: Output) -> Result<()> {
        if out.persist {
            // Continuing after a failed write would let peers observe state
            // this server could forget in a crash; stop instead, without
            // emitting anything.
            self.store
                .write(&self.node.durable_state())
                .context("persist consensus state")?;
        }
        for (dest, envelope) in out.envelopes {
            if dest == self.node.id() {
                let _ = self.loopback_tx.send(envelope);
            } else if let Some(addr) = self.peers.get(&dest) {
                send_envelope(addr, &envelope);
            } else {
                warn!(dest, "no address for peer, dropping message");
            }
        }
        if out.reset_election {
            self.reset_election_deadline();
        }
        self.apply_committed();
        Ok(())
    }

    /// Hands newly committed entries to the state machine in order and
    /// settles any client proposals waiting on them.
    fn apply_committed(&mut self) {
        for (index, entry) in self.node.take_applicable() {
            debug!(id = self.node.id(), index, term = entry.term, "applying entry");
            self.state_machine.apply(index, &entry.command);
            self.applied_tail.push_back((index, entry.command.clone()));
            while self.applied_tail.len() > APPLIED_TAIL_LIMIT {
                self.applied_tail.pop_front();
            }

            let applied_term = entry.term;
            for pending in std::mem::take(&mut self.pending) {
                let (ptr_index, ptr_term) = pending.ptr;
                if ptr_index != index {
                    self.pending.push(pending);
                } else if ptr_term == applied_term {
                    let _ = pending.respond_to.send(Ok(pending.ptr));
                } else {
                    let _ = pending.respond_to.send(Err(anyhow!(
                        "proposal at index {ptr_index} was overwritten by term {applied_term}"
                    )));
                }
            }
        }
    }

    /// Returns `false` when shutdown was requested.
    fn handle_client_request(&mut self, req: ClientRequest) -> Result<bool> {
        match req {
            ClientRequest::Propose {
                command,
                respond_to,
            } => match self.node.propose(command) {
                Ok((ptr, out)) => {
                    self.pending.push(PendingProposal {
                        ptr,
                        respond_to,
                    });
                    self.execute(out)?;
                }
                Err(not_leader) => {
                    let _ = respond_to.send(Err(anyhow!(not_leader)));
                }
            },
            ClientRequest::Status { respond_to } => {
                let status = NodeStatus {
                    id: self.node.id(),
                    role: self.node.role_kind(),
                    term: self.node.current_term(),
                    leader_hint: self.node.leader_hint(),
                    commit_index: self.node.commit_index(),
                    last_applied: self.node.last_applied(),
                    log_len: self.node.log().len(),
                    applied_tail: self.applied_tail.iter().cloned().collect(),
                };
                let _ = respond_to.send(status);
            }
            ClientRequest::Campaign { respond_to } => {
                if !self.node.is_leader() {
                    info!(id = self.node.id(), "election forced");
                    self.reset_election_deadline();
                    let out = self.node.start_election();
                    self.execute(out)?;
                }
                let _ = respond_to.send(());
            }
            ClientRequest::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    /// Draws a fresh randomized election deadline. Randomizing on every
    /// reset is what breaks repeated split votes.
    fn reset_election_deadline(&mut self) {
        let timeout = rand::thread_rng()
            .gen_range(self.timing.election_timeout_min..=self.timing.election_timeout_max);
        self.election_deadline = Instant::now() + timeout;
    }

    /// Adjusts timers on role transitions and logs them.
    fn sync_role_timers(&mut self) {
        let role = self.node.role_kind();
        if role == self.last_role {
            return;
        }
        info!(
            id = self.node.id(),
            from = ?self.last_role,
            to = ?role,
            term = self.node.current_term(),
            "role changed"
        );
        if role == RoleKind::Leader {
            // The election win already announced itself; the periodic
            // heartbeat starts one interval from now.
            self.next_heartbeat = Instant::now() + self.timing.heartbeat_interval;
        }
        if self.last_role == RoleKind::Leader {
            self.reset_election_deadline();
        }
        self.last_role = role;
    }
}

/// Accepts peer connections and forwards decoded envelopes to the worker.
///
/// Each connection carries one length-prefixed envelope and is handled on
/// its own short-lived thread, so a slow peer cannot stall the listener.
fn spawn_network_listener(
    addr: &str,
    tx: Sender<Envelope>,
    stopping: Arc<AtomicBool>,
) -> Result<()> {
    let listener =
        TcpListener::bind(addr).with_context(|| format!("bind consensus listener {addr}"))?;
    let addr = addr.to_string();
    thread::Builder::new()
        .name(format!("raft-listener-{addr}"))
        .spawn(move || {
            for stream in listener.incoming() {
                if stopping.load(Ordering::SeqCst) {
                    break;
                }
                match stream {
                    Ok(stream) => {
                        let tx = tx.clone();
                        thread::spawn(move || {
                            if let Err(err) = handle_connection(stream, tx) {
                                debug!(error = ?err, "inbound connection dropped");
                            }
                        });
                    }
                    Err(err) => warn!(error = ?err, "accept failed"),
                }
            }
        })
        .map(|_| ())
        .context("failed to spawn network listener")
}

/// Reads one framed envelope: a 4-byte big-endian length, then that many
/// bytes of JSON.
fn handle_connection(mut stream: TcpStream, tx: Sender<Envelope>) -> Result<()> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    let envelope = Envelope::decode(&buf)?;
    tx.send(envelope)
        .map_err(|_| anyhow!("worker gone"))?;
    Ok(())
}

/// Best-effort send: one connection per envelope, errors logged and treated
/// as message loss. Heartbeats and replication retries provide recovery.
fn send_envelope(addr: &str, envelope: &Envelope) {
    let bytes = match envelope.encode() {
        Ok(bytes) => bytes,
        Err(err) => {
            error!(error = ?err, "failed to encode envelope");
            return;
        }
    };
    if let Err(err) = try_send(addr, &bytes) {
        debug!(addr, error = ?err, "send failed, treating as message loss");
    }
}

fn try_send(addr: &str, bytes: &[u8]) -> io::Result<()> {
    let mut stream = TcpStream::connect(addr)?;
    let len = bytes.len() as u32;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(bytes)?;
    Ok(())
}
