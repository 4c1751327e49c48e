//! Replicated-log consensus node.
//!
//! This crate implements the core of a consensus participant: a cluster of
//! nodes agrees on an ordered sequence of opaque command entries and feeds
//! committed entries to an application state machine, tolerating message
//! loss, restarts, and minority failures.
//!
//! # Architecture
//!
//! Each node runs a small set of threads:
//!
//! - **Worker thread**: owns the consensus state machine, the durable state
//!   store, and the timers; processes one event at a time
//! - **Network listener thread**: accepts incoming peer connections
//! - **Connection handler threads**: short-lived, decode one envelope each
//!   and forward it to the worker
//!
//! Communication between threads uses crossbeam channels. Keeping the
//! consensus state single-threaded means no locks and a handler model that
//! is easy to reason about: each inbound envelope or timer tick is one
//! atomic state transition, whose durable effects are persisted before any
//! outbound message leaves the node.
//!
//! # Modules
//!
//! - [`log`]: value types and the 1-indexed replicated log
//! - [`message`]: the wire codec for the four consensus RPC shapes
//! - [`storage`]: atomic durable storage for the (term, vote, log) triple
//! - [`node`]: per-server state and the handler logic
//! - [`runtime`]: worker loop, timers, network handling, node spawning
//! - [`config`]: cluster membership and timing configuration
//! - [`state_machine`]: the seam to the application executing committed
//!   commands

pub mod config;
pub mod log;
pub mod message;
pub mod node;
pub mod runtime;
pub mod state_machine;
pub mod storage;
