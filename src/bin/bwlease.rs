//! Bandwidth lease replay CLI
//!
//! Usage:
//!   bwlease run --config market.json --events model.csv --output telemetry.csv --strict
//!   bwlease generate --output model.csv --seed 7 --jitter-secs 600

use bwlease::config::{ConfigLoader, MalformedPolicy, MarketConfigFile};
use bwlease::event::{write_log, AccountDirectory, EventLog, TIMESTAMP_FORMAT};
use bwlease::scenario;
use bwlease::{
    Asset, HarnessError, ReplayReport, ResourceLimits, Session, SimLedger, Strictness,
};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "bwlease")]
#[command(about = "Replay bandwidth lease logs against a ledger and record telemetry")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay an event log against an in-memory ledger
    Run {
        /// Market config JSON; a missing file falls back to defaults
        #[arg(short, long, default_value = "config.json")]
        config: PathBuf,

        /// Event log to replay
        #[arg(short, long)]
        events: PathBuf,

        /// Telemetry output file
        #[arg(short, long)]
        output: PathBuf,

        /// Enforce exact deltas, reserve conservation and trajectory direction
        #[arg(long)]
        strict: bool,

        /// Use defaults when the config file is malformed instead of failing
        #[arg(long)]
        lenient_config: bool,

        /// Read log timestamps as UTC instead of host local time
        #[arg(long)]
        utc: bool,

        /// Ledger head block time at session start
        #[arg(long, default_value = "2020-01-01T00:00:00Z")]
        genesis: DateTime<Utc>,

        /// Liquid balance given to every account referenced by the log
        #[arg(long, default_value = "5000000.0000 TST")]
        initial_balance: Asset,
    },

    /// Write the model-test event log
    Generate {
        /// Event log output file
        #[arg(short, long)]
        output: PathBuf,

        /// Time of the first event, in the log's timestamp format
        #[arg(long, default_value = "01/01/2021 00:00:00")]
        start: String,

        /// Seed for timestamp jitter
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Maximum jitter added to each timestamp; 0 disables jitter
        #[arg(long, default_value = "0")]
        jitter_secs: u32,

        /// Also write the matching market config
        #[arg(long)]
        config_output: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            config,
            events,
            output,
            strict,
            lenient_config,
            utc,
            genesis,
            initial_balance,
        } => {
            let policy = if lenient_config {
                MalformedPolicy::UseDefaults
            } else {
                MalformedPolicy::Fail
            };
            let mut loaded = ConfigLoader::with_policy(policy).load(&config)?;
            if strict {
                loaded.file.harness.strictness = Strictness::Strict;
            }

            let ledger = seed_ledger(&loaded.file, &events, genesis, &initial_balance)?;
            let report = if utc {
                replay(Utc, ledger, &loaded.file, &events, &output)?
            } else {
                replay(Local, ledger, &loaded.file, &events, &output)?
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Generate {
            output,
            start,
            seed,
            jitter_secs,
            config_output,
        } => {
            let start = NaiveDateTime::parse_from_str(&start, TIMESTAMP_FORMAT)?;
            let mut events = scenario::model_schedule(start);
            if jitter_secs > 0 {
                events = scenario::jittered(&events, seed, jitter_secs);
            }

            let mut writer = BufWriter::new(File::create(&output)?);
            write_log(&mut writer, &events)?;
            writer.flush()?;
            info!(path = %output.display(), events = events.len(), "wrote event log");

            if let Some(path) = config_output {
                let json = serde_json::to_string_pretty(&scenario::model_config())?;
                std::fs::write(&path, json)?;
                info!(path = %path.display(), "wrote market config");
            }
        }
    }
    Ok(())
}

/// Ledger holding every account the log references, each funded with `balance`
fn seed_ledger(
    config: &MarketConfigFile,
    events: &Path,
    genesis: DateTime<Utc>,
    balance: &Asset,
) -> Result<SimLedger, HarnessError> {
    let directory = AccountDirectory::new(config.harness.aliases.clone());
    let mut accounts = BTreeSet::new();
    for row in EventLog::open(events)? {
        if let Some(event) = row?.to_event(&directory)? {
            accounts.insert(event.operation.payer().clone());
            accounts.insert(event.operation.receiver().clone());
        }
    }

    let mut ledger = SimLedger::new(genesis, config.harness.reserve_account.clone());
    for account in accounts {
        if ledger.has_account(&account) {
            warn!(%account, "log references the reserve account directly");
            continue;
        }
        ledger.create_account(account, ResourceLimits::default(), balance.clone());
    }
    Ok(ledger)
}

fn replay<Tz: TimeZone>(
    zone: Tz,
    ledger: SimLedger,
    config: &MarketConfigFile,
    events: &Path,
    output: &Path,
) -> Result<ReplayReport, HarnessError> {
    let mut session = Session::open_session_in(zone, ledger, config, Some(output))?;
    session.replay(EventLog::open(events)?)
}
