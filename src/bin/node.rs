//! CLI entry point for running a consensus node with a line-oriented console.
//!
//! # Example usage
//!
//! Write a cluster document `cluster.json`:
//!
//! ```json
//! {
//!   "client": {"host": "127.0.0.1", "port": 7000},
//!   "servers": [
//!     {"id": 1, "host": "127.0.0.1", "port": 7101},
//!     {"id": 2, "host": "127.0.0.1", "port": 7102},
//!     {"id": 3, "host": "127.0.0.1", "port": 7103}
//!   ]
//! }
//! ```
//!
//! Then start each node in its own terminal:
//!
//! ```bash
//! cargo run --bin node -- --id 1 --config cluster.json
//! cargo run --bin node -- --id 2 --config cluster.json
//! cargo run --bin node -- --id 3 --config cluster.json
//! ```
//!
//! Once a leader emerges (`status` shows it), submit commands on it with
//! `propose {"op": "put", "key": "k", "value": "v"}` — any JSON document is
//! a valid command.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use raft_consensus::config::{ClusterConfig, NodeConfig, TimingConfig};
use raft_consensus::runtime::{NodeHandle, spawn_node};

/// Command-line arguments for the consensus node.
#[derive(Parser, Debug)]
#[command(author, version, about = "Replicated-log consensus node")]
struct Args {
    /// This node's id; must appear in the cluster document
    #[arg(long)]
    id: u64,

    /// Path to the cluster document (client endpoint + server list)
    #[arg(long)]
    config: PathBuf,

    /// Directory holding this node's durable state
    #[arg(long, default_value = "data")]
    storage_dir: PathBuf,

    /// Leader heartbeat interval in milliseconds
    #[arg(long, default_value_t = 50)]
    heartbeat_ms: u64,

    /// Minimum election timeout in milliseconds
    #[arg(long, default_value_t = 150)]
    election_min_ms: u64,

    /// Maximum election timeout in milliseconds
    #[arg(long, default_value_t = 300)]
    election_max_ms: u64,
}

/// Commands accepted at the console prompt.
#[derive(Debug, PartialEq)]
enum ConsoleCommand {
    Propose(serde_json::Value),
    Status,
    Campaign,
    Help,
    Exit,
}

impl ConsoleCommand {
    fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        if trimmed.eq_ignore_ascii_case("exit") {
            return Ok(ConsoleCommand::Exit);
        }
        if trimmed.eq_ignore_ascii_case("help") {
            return Ok(ConsoleCommand::Help);
        }
        if trimmed.eq_ignore_ascii_case("status") {
            return Ok(ConsoleCommand::Status);
        }
        if trimmed.eq_ignore_ascii_case("campaign") {
            return Ok(ConsoleCommand::Campaign);
        }
        if let Some(rest) = trimmed.strip_prefix("propose ") {
            let command = serde_json::from_str(rest.trim())
                .context("proposal payload must be a JSON document")?;
            return Ok(ConsoleCommand::Propose(command));
        }
        Err(anyhow!(
            "invalid command. Try propose <json>, status, campaign, help, or exit"
        ))
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let cluster = ClusterConfig::load(&args.config)?;
    let storage_name = args
        .storage_dir
        .join(format!("server-{}", args.id))
        .to_string_lossy()
        .into_owned();

    let handle = spawn_node(NodeConfig {
        id: args.id,
        cluster,
        storage_name,
        timing: TimingConfig {
            heartbeat_interval: Duration::from_millis(args.heartbeat_ms),
            election_timeout_min: Duration::from_millis(args.election_min_ms),
            election_timeout_max: Duration::from_millis(args.election_max_ms),
        },
    })?;

    println!("node {} running; type 'help' for commands", args.id);
    repl(&handle)?;
    handle.shutdown()?;
    Ok(())
}

fn repl(handle: &NodeHandle) -> Result<()> {
    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Ok(()); // stdin closed
        }
        if line.trim().is_empty() {
            continue;
        }
        match ConsoleCommand::parse(&line) {
            Ok(ConsoleCommand::Exit) => return Ok(()),
            Ok(ConsoleCommand::Help) => print_help(),
            Ok(ConsoleCommand::Status) => match handle.status() {
                Ok(status) => {
                    println!(
                        "node {} | role {:?} | term {} | leader {:?} | commit {} | applied {} | log {}",
                        status.id,
                        status.role,
                        status.term,
                        status.leader_hint,
                        status.commit_index,
                        status.last_applied,
                        status.log_len,
                    );
                    for (index, command) in &status.applied_tail {
                        println!("  applied {index}: {command}");
                    }
                }
                Err(err) => println!("status failed: {err:#}"),
            },
            Ok(ConsoleCommand::Campaign) => match handle.campaign() {
                Ok(()) => println!("election started"),
                Err(err) => println!("campaign failed: {err:#}"),
            },
            Ok(ConsoleCommand::Propose(command)) => match handle.propose(command) {
                Ok((index, term)) => println!("committed at index {index}, term {term}"),
                Err(err) => println!("proposal failed: {err:#}"),
            },
            Err(err) => println!("{err:#}"),
        }
    }
}

fn print_help() {
    println!("commands:");
    println!("  propose <json>  submit a command for replication (leader only)");
    println!("  status          show role, term, commit/apply progress");
    println!("  campaign        force an election on this node");
    println!("  exit            shut this node down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_console_commands() {
        assert_eq!(ConsoleCommand::parse("status").unwrap(), ConsoleCommand::Status);
        assert_eq!(ConsoleCommand::parse("  EXIT ").unwrap(), ConsoleCommand::Exit);
        assert_eq!(ConsoleCommand::parse("campaign").unwrap(), ConsoleCommand::Campaign);
        assert_eq!(
            ConsoleCommand::parse(r#"propose {"op": "put"}"#).unwrap(),
            ConsoleCommand::Propose(json!({"op": "put"}))
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert!(ConsoleCommand::parse("put k v").is_err());
        assert!(ConsoleCommand::parse("propose not-json").is_err());
    }
}
