//! Durable storage for the persistent consensus state.
//!
//! The durable triple `(currentTerm, votedFor, log)` must survive crashes:
//! it is rewritten before any outbound message that reflects a change to it
//! leaves the server. On disk it is a single JSON document
//! `[term, votedForOrNull, {"_logEntries": [..]}]`.
//!
//! Writes go to a sibling temp file which is fsynced and renamed over the
//! target, so a reader observes either the previous document or the new one,
//! never a partial write.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::log::{Log, ServerId, Term};

type Triple = (Term, Option<ServerId>, Log);

/// The durable part of a server's state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Triple", into = "Triple")]
pub struct PersistentState {
    pub current_term: Term,
    pub voted_for: Option<ServerId>,
    pub log: Log,
}

impl From<Triple> for PersistentState {
    fn from((current_term, voted_for, log): Triple) -> Self {
        Self {
            current_term,
            voted_for,
            log,
        }
    }
}

impl From<PersistentState> for Triple {
    fn from(state: PersistentState) -> Self {
        (state.current_term, state.voted_for, state.log)
    }
}

/// Handle to one durable state document, addressed by name.
///
/// Two stores constructed from the same name refer to the same durable
/// object. Concurrent access by two live servers is not supported; the
/// store is shared only with this server's future incarnations.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn from_name(name: &str) -> Self {
        Self {
            path: PathBuf::from(format!("{name}.json")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the last successfully written triple, or the default
    /// `(0, none, empty log)` when no prior state exists.
    pub fn read(&self) -> Result<PersistentState> {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("corrupt state document at {}", self.path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(PersistentState::default()),
            Err(err) => {
                Err(err).with_context(|| format!("read state from {}", self.path.display()))
            }
        }
    }

    /// Atomically replaces the durable triple.
    pub fn write(&self, state: &PersistentState) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("create state directory {}", dir.display()))?;
            }
        }
        let bytes = serde_json::to_vec(state).context("serialize state document")?;
        let tmp = self.path.with_extension("json.tmp");
        let mut file = File::create(&tmp)
            .with_context(|| format!("create temp state file {}", tmp.display()))?;
        file.write_all(&bytes)
            .and_then(|_| file.sync_all())
            .with_context(|| format!("write temp state file {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("install state file {}", self.path.display()))?;
        Ok(())
    }
}
