// src/main.rs
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ballot_sync::calls::WriteCall;
use ballot_sync::client::ElectionClient;
use ballot_sync::config::ClientConfig;
use ballot_sync::gateway::EventKind;
use ballot_sync::integrity::{self, IntegrityReport};
use ballot_sync::rpc::RpcClient;
use ballot_sync::tx_manager::TxOptions;
use ballot_sync::types::{
    Address, Role, Timestamp, parse_address, snapshot_from_json, snapshot_to_json,
};

#[derive(Parser)]
#[command(name = "ballot-sync", version)]
struct Cli {
    /// WS endpoint of the ledger node.
    ///
    /// If not provided, the value from `LEDGER_WS` is used.
    #[arg(global = true, long)]
    ws: Option<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read the election, candidates, statistics, winner and the given voters
    /// and save them as a JSON snapshot.
    FetchSnapshot {
        /// Output JSON file.
        #[arg(long)]
        out: PathBuf,

        /// Voter address to include; repeatable.
        #[arg(long = "voter", value_parser = parse_addr)]
        voters: Vec<Address>,
    },

    /// Check a snapshot for internal consistency.
    ///
    /// With `--input` the check runs offline on a saved snapshot; otherwise a
    /// fresh snapshot is read from the ledger.
    Audit {
        /// Snapshot JSON file.
        #[arg(long)]
        input: Option<PathBuf>,

        /// Voter address to include in a live audit; repeatable.
        #[arg(long = "voter", value_parser = parse_addr)]
        voters: Vec<Address>,
    },

    /// Show the election phase and what an account may do.
    Status {
        #[arg(long, value_parser = parse_addr)]
        address: Address,
    },

    /// Print ledger events as JSON lines until interrupted.
    Watch {
        /// Event kinds to print (e.g. `VoteCast`); all when omitted.
        #[arg(long = "kind", value_parser = parse_kind)]
        kinds: Vec<EventKind>,
    },

    /// Submit a write and wait for confirmation.
    Tx {
        /// Sending account (must be unlocked on the node).
        #[arg(long, value_parser = parse_addr)]
        from: Address,

        /// Return after broadcast without waiting for a receipt.
        #[arg(long)]
        no_wait: bool,

        #[command(subcommand)]
        write: Write,
    },
}

#[derive(Subcommand)]
enum Write {
    CreateElection {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Unix seconds.
        #[arg(long)]
        registration_deadline: Timestamp,
        #[arg(long)]
        start_time: Timestamp,
        #[arg(long)]
        end_time: Timestamp,
    },
    AddCandidate {
        #[arg(long)]
        name: String,
        #[arg(long)]
        party: String,
        #[arg(long, default_value = "")]
        manifesto: String,
    },
    RegisterVoter {
        #[arg(long, value_parser = parse_addr)]
        voter: Address,
    },
    SelfRegister,
    Vote {
        #[arg(long)]
        candidate: u64,
    },
    StartVoting,
    EndVoting,
    Finalize,
    AssignRole {
        #[arg(long, value_parser = parse_addr)]
        user: Address,
        /// NONE, VOTER, OBSERVER, ADMIN or COMMISSIONER.
        #[arg(long)]
        role: Role,
    },
}

impl From<Write> for WriteCall {
    fn from(w: Write) -> Self {
        match w {
            Write::CreateElection {
                title,
                description,
                registration_deadline,
                start_time,
                end_time,
            } => WriteCall::CreateElection {
                title,
                description,
                registration_deadline,
                start_time,
                end_time,
            },
            Write::AddCandidate {
                name,
                party,
                manifesto,
            } => WriteCall::AddCandidate {
                name,
                party,
                manifesto,
            },
            Write::RegisterVoter { voter } => WriteCall::RegisterVoter { voter },
            Write::SelfRegister => WriteCall::SelfRegister,
            Write::Vote { candidate } => WriteCall::Vote {
                candidate_id: candidate,
            },
            Write::StartVoting => WriteCall::StartVoting,
            Write::EndVoting => WriteCall::EndVoting,
            Write::Finalize => WriteCall::FinalizeElection,
            Write::AssignRole { user, role } => WriteCall::AssignRole { user, role },
        }
    }
}

fn parse_addr(s: &str) -> Result<Address, String> {
    parse_address(s).map_err(|e| format!("invalid address `{s}`: {e}"))
}

fn parse_kind(s: &str) -> Result<EventKind, String> {
    EventKind::ALL
        .into_iter()
        .find(|k| k.as_str().eq_ignore_ascii_case(s))
        .ok_or_else(|| format!("unknown event kind `{s}`"))
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_report(report: &IntegrityReport) {
    if report.is_valid {
        eprintln!("Integrity check passed.");
    } else {
        eprintln!("Integrity check found {} issue(s):", report.issues.len());
        for issue in &report.issues {
            eprintln!("  [{:?}] {}", issue.code, issue.message);
        }
    }
}

async fn connect(ws: Option<String>, config: ClientConfig) -> Result<ElectionClient> {
    // Resolve ledger WS endpoint:
    //   1. CLI `--ws`
    //   2. `LEDGER_WS` env var
    let ws = match ws {
        Some(ws) => ws,
        None => std::env::var("LEDGER_WS").context("LEDGER_WS must be set or --ws provided")?,
    };
    let rpc = RpcClient::connect(&ws)
        .await
        .with_context(|| format!("connecting to {ws}"))?;
    info!(%ws, "connected to ledger");
    ElectionClient::new(Arc::new(rpc), config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from `.env` if present.
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ClientConfig::from_env()?;

    match cli.cmd {
        Commands::FetchSnapshot { out, voters } => {
            let client = connect(cli.ws, config).await?;
            let snapshot = client.snapshot(&voters).await?;

            let json = snapshot_to_json(&snapshot)?;
            fs::write(&out, json).with_context(|| format!("writing {}", out.display()))?;
            eprintln!(
                "Snapshot at block {} written to {}",
                snapshot.at_block,
                out.display()
            );
            client.dispose();
        }

        Commands::Audit { input, voters } => {
            let report = match input {
                Some(input) => {
                    let data = fs::read_to_string(&input)
                        .with_context(|| format!("reading {}", input.display()))?;
                    let snapshot = snapshot_from_json(&data)?;
                    integrity::validate(&snapshot)
                }
                None => {
                    let client = connect(cli.ws, config).await?;
                    let (_, report) = integrity::audit(&client, &voters).await?;
                    client.dispose();
                    report
                }
            };
            print_report(&report);
            print_json(&report)?;
            if !report.is_valid {
                std::process::exit(2);
            }
        }

        Commands::Status { address } => {
            let client = connect(cli.ws, config).await?;
            let info = client.election_info().await?;
            let phase = client.phase().await?;
            let remaining = client.time_remaining().await?;
            let permissions = client.permissions(address).await?;
            let statistics = client.statistics().await?;
            let winner = client.winner().await?;

            print_json(&serde_json::json!({
                "election": info,
                "phase": phase,
                "timeRemaining": remaining,
                "permissions": permissions,
                "statistics": statistics,
                "winner": winner,
            }))?;
            client.dispose();
        }

        Commands::Watch { kinds } => {
            let client = connect(cli.ws, config).await?;
            let kinds = if kinds.is_empty() {
                EventKind::ALL.to_vec()
            } else {
                kinds
            };
            let mut sub = client.subscribe(&kinds);
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    rec = sub.next() => match rec {
                        Some(rec) => println!("{}", serde_json::to_string(&rec)?),
                        None => break,
                    },
                }
            }
            drop(sub);
            client.dispose();
        }

        Commands::Tx {
            from,
            no_wait,
            write,
        } => {
            let client = connect(cli.ws, config).await?;
            let options = TxOptions {
                wait_for_confirmation: !no_wait,
                ..TxOptions::default()
            };
            let result = client.execute(write.into(), from, options).await;
            client.dispose();
            match result {
                Ok(outcome) => print_json(&outcome)?,
                Err(e) => {
                    print_json(&e.normalize())?;
                    return Err(anyhow!("transaction failed: {e}"));
                }
            }
        }
    }

    Ok(())
}
