//! Trustgate CLI entry point.
//!
//! Operator commands over the engine's database: chain verification, trust
//! inspection and reinstatement, lineage traces, the HITL queue, token
//! revocation, and a long-running HITL expiry sweeper. Every command prints
//! JSON on stdout.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use trustgate::config::EngineConfig;
use trustgate::engine::Engine;
use trustgate::lineage::IMPACT_TRACE_LIMIT;

/// Trust-aware authorization engine for autonomous agents.
#[derive(Parser)]
#[command(name = "trustgate", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Walk the audit chain and report the first broken receipt.
    VerifyChain {
        /// Only check the oldest N receipts.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show an agent's trust profile and recent history.
    Trust {
        /// Agent identifier.
        agent: String,
        /// History entries to show.
        #[arg(long, default_value_t = 20)]
        history: usize,
    },
    /// Lift an agent out of suspension.
    Reinstate {
        /// Agent identifier.
        agent: String,
        /// Who approved the reinstatement.
        #[arg(long)]
        reviewer: String,
    },
    /// Trace lineage from a node.
    Trace {
        /// Origin node id.
        node: String,
        /// Walk towards causes instead of effects.
        #[arg(long)]
        backward: bool,
        /// Stop after this many nodes.
        #[arg(long, default_value_t = IMPACT_TRACE_LIMIT)]
        max_nodes: usize,
    },
    /// Summarise everything downstream of a node.
    Impact {
        /// Origin node id.
        node: String,
    },
    /// Inspect and resolve HITL requests.
    Hitl {
        /// HITL operation.
        #[command(subcommand)]
        command: HitlCommand,
    },
    /// Revoke every token an agent holds.
    RevokeAgent {
        /// Agent identifier.
        agent: String,
        /// Reason stored on each token.
        #[arg(long)]
        reason: String,
    },
    /// Expire stale HITL requests on an interval until interrupted.
    Sweep {
        /// Seconds between sweeps.
        #[arg(long, default_value_t = 30)]
        interval_secs: u64,
    },
}

/// HITL queue subcommands.
#[derive(Subcommand)]
enum HitlCommand {
    /// List pending requests.
    List {
        /// Maximum requests to show.
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Approve or deny a pending request.
    Resolve {
        /// Request id.
        id: String,
        /// Approve the request.
        #[arg(long, conflicts_with = "deny", required_unless_present = "deny")]
        approve: bool,
        /// Deny the request.
        #[arg(long)]
        deny: bool,
        /// Reviewer identity.
        #[arg(long)]
        reviewer: String,
        /// Free-form reviewer notes.
        #[arg(long)]
        notes: Option<String>,
    },
    /// Expire pending requests past their deadline.
    Expire,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = EngineConfig::load().context("failed to load configuration")?;

    if let Command::Sweep { interval_secs } = cli.command {
        return handle_sweep(config, interval_secs).await;
    }

    trustgate::logging::init_cli();
    let engine = Engine::open(config).await?;

    match cli.command {
        Command::VerifyChain { limit } => handle_verify_chain(&engine, limit).await,
        Command::Trust { agent, history } => {
            let profile = engine.trust().profile(&agent).await?;
            let snapshot = engine.trust().snapshot(&agent).await?;
            let history = engine.trust().history(&agent, history).await?;
            print_json(&json!({
                "profile": profile,
                "current": snapshot,
                "history": history,
            }))
        }
        Command::Reinstate { agent, reviewer } => {
            let update = engine.trust().reinstate(&agent, &reviewer).await?;
            print_json(&update)
        }
        Command::Trace {
            node,
            backward,
            max_nodes,
        } => {
            let nodes = if backward {
                engine.lineage().backward_trace(&node, max_nodes).await?
            } else {
                engine.lineage().forward_trace(&node, max_nodes).await?
            };
            print_json(&nodes)
        }
        Command::Impact { node } => {
            let impact = engine.lineage().impact_analysis(&node).await?;
            print_json(&impact)
        }
        Command::Hitl { command } => handle_hitl(&engine, command).await,
        Command::RevokeAgent { agent, reason } => {
            let revoked = engine.tokens().revoke_all_for_agent(&agent, &reason).await?;
            print_json(&json!({ "agent_id": agent, "revoked": revoked }))
        }
        Command::Sweep { .. } => Ok(()),
    }
}

async fn handle_verify_chain(engine: &Engine, limit: Option<usize>) -> anyhow::Result<()> {
    let report = engine.audit().verify_chain_integrity(limit).await?;
    print_json(&report)?;
    if !report.valid {
        anyhow::bail!("audit chain integrity check failed");
    }
    Ok(())
}

async fn handle_hitl(engine: &Engine, command: HitlCommand) -> anyhow::Result<()> {
    match command {
        HitlCommand::List { limit } => {
            let pending = engine.hitl().list_pending(limit).await?;
            print_json(&pending)
        }
        HitlCommand::Resolve {
            id,
            approve,
            deny: _,
            reviewer,
            notes,
        } => {
            let decision = engine
                .controller()
                .complete_hitl(&id, approve, &reviewer, notes.as_deref())
                .await?;
            print_json(&decision)
        }
        HitlCommand::Expire => {
            let expired = engine.hitl().expire_stale().await?;
            print_json(&json!({ "expired": expired }))
        }
    }
}

/// Run the HITL expiry sweeper until Ctrl-C.
async fn handle_sweep(config: EngineConfig, interval_secs: u64) -> anyhow::Result<()> {
    let _logging_guard = trustgate::logging::init_production(&config.paths.logs_dir)?;
    let engine = Engine::open(config).await?;

    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    info!(interval_secs, "HITL expiry sweeper started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match engine.hitl().expire_stale().await {
                    Ok(0) => {}
                    Ok(expired) => info!(expired, "expired stale HITL requests"),
                    Err(e) => warn!(error = %e, "HITL sweep failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("HITL expiry sweeper stopping");
                return Ok(());
            }
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render output")?;
    println!("{rendered}");
    Ok(())
}
