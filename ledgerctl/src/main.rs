//! Operator CLI: append a raw event, verify the chain, publish and prove
//! disclosures, issue and redeem reveal tokens, run reports.
//!
//! Exit codes: `0` success, `1` verification failure, `2` invalid
//! arguments (clap's own exit code for parse errors), `3` governance or
//! disclosure/reveal policy denial.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use ledger_crypto::{KeyRegistry, MacKey};
use ledger_disclosure::{get_policy, publish, FakeAnchorClient, PublishRequest};
use ledger_events::EventCreateRequest;
use ledger_governance::{default_policy, GovernancePolicyEngine};
use ledger_reveal::{reveal, request_token, store_token_record, Subject};
use ledger_settings::{AnchorMode, Settings};
use ledger_store::{LedgerStore, SledStorage};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "ledgerctl")]
#[command(about = "Operate the event-sourced ledger: append, verify, disclose, reveal, report")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Print results as JSON instead of a short human summary.
    #[arg(long, global = true)]
    json: bool,

    /// Enable debug-level logging.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Append a single event read from a JSON file
    Append {
        event_file: PathBuf,
    },
    /// Replay the whole chain, recomputing every hash link and signature
    VerifyChain,
    #[command(subcommand)]
    Disclosure(DisclosureCommands),
    #[command(subcommand)]
    Reveal(RevealCommands),
    #[command(subcommand)]
    Report(ReportCommands),
}

#[derive(Subcommand)]
enum DisclosureCommands {
    /// Compile, commit, sign and anchor a disclosure statement for a settled period
    Publish {
        #[arg(long)]
        policy: String,
        /// `start/end`, both RFC3339 timestamps
        #[arg(long)]
        period: String,
        #[arg(long, value_delimiter = ',')]
        group_by: Vec<String>,
    },
    /// Print the Merkle proof for one metric/group cell of a published disclosure
    Proof {
        #[arg(long)]
        id: Uuid,
        #[arg(long)]
        metric: String,
        /// JSON object: `{}` for a scalar metric, `{"sku":"A1"}` for a grouped one
        #[arg(long, default_value = "{}")]
        group: String,
    },
    /// Print the anchored `disclosure:{id}` record for a published disclosure
    AnchorGet {
        #[arg(long)]
        id: Uuid,
    },
}

#[derive(Subcommand)]
enum RevealCommands {
    /// Mint a reveal token for a human or auditor subject
    Request {
        #[arg(long)]
        id: Uuid,
        #[arg(long)]
        subject: String,
        /// human | auditor
        #[arg(long)]
        actor: String,
    },
    /// Redeem a reveal token for one metric/group cell's detail evidence
    Redeem {
        #[arg(long)]
        id: Uuid,
        #[arg(long)]
        token: String,
        #[arg(long)]
        metric: String,
        #[arg(long, default_value = "{}")]
        group: String,
        /// human | auditor — the caller's authenticated identity
        #[arg(long)]
        actor: String,
    },
}

#[derive(Subcommand)]
enum ReportCommands {
    /// Profit & loss over a period
    Pnl {
        #[arg(long)]
        period: String,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("chain verification failed")]
struct ChainInvalid;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!("{err:#}");
            classify_exit_code(&err)
        }
    };
    std::process::exit(exit_code);
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(tracing_subscriber::filter::LevelFilter::from_level(level))
        .init();
}

fn classify_exit_code(err: &anyhow::Error) -> i32 {
    if let Some(store_err) = err.downcast_ref::<ledger_store::StoreError>() {
        if matches!(store_err, ledger_store::StoreError::PolicyEnforcement { .. }) {
            return 3;
        }
    }
    if let Some(disc_err) = err.downcast_ref::<ledger_disclosure::DisclosureError>() {
        use ledger_disclosure::DisclosureError::*;
        if matches!(
            disc_err,
            PeriodTooRecent { .. } | ProofLevelGated | GroupByNotAllowed(_) | UnknownPolicy(_)
        ) {
            return 3;
        }
    }
    if err.downcast_ref::<ledger_reveal::RevealError>().is_some() {
        return 3;
    }
    1
}

async fn run(cli: Cli) -> Result<()> {
    let settings = ledger_settings::load().context("loading configuration")?;
    let store = open_store(&settings).await?;

    match cli.command {
        Commands::Append { event_file } => cmd_append(&store, &event_file, cli.json).await,
        Commands::VerifyChain => cmd_verify_chain(&store, cli.json).await,
        Commands::Disclosure(cmd) => cmd_disclosure(&store, &settings, cmd, cli.json).await,
        Commands::Reveal(cmd) => cmd_reveal(&store, &settings, cmd, cli.json).await,
        Commands::Report(cmd) => cmd_report(&store, cmd, cli.json).await,
    }
}

async fn open_store(settings: &Settings) -> Result<LedgerStore<SledStorage>> {
    let keys = build_key_registry(settings)?;
    let governance = GovernancePolicyEngine::new(default_policy());
    let backend = SledStorage::open(&settings.storage_path)
        .with_context(|| format!("opening storage backend at {}", settings.storage_path))?;
    Ok(LedgerStore::new(backend, Arc::new(keys), Arc::new(governance)))
}

fn build_key_registry(settings: &Settings) -> Result<KeyRegistry> {
    let agent_seed = settings.keys.agent_seed().context("decoding agent signing seed")?;
    let human_seed = settings.keys.human_seed().context("decoding human signing seed")?;
    let auditor_seed = settings
        .keys
        .auditor_seed()
        .context("decoding auditor signing seed")?;
    KeyRegistry::from_seeds(&agent_seed, &human_seed, &auditor_seed)
        .context("constructing key registry from configured seeds")
}

fn build_mac_key(settings: &Settings) -> Result<MacKey> {
    let secret = settings
        .keys
        .reveal_mac_secret()
        .context("decoding reveal MAC secret")?;
    MacKey::new(&secret).context("constructing reveal MAC key")
}

fn parse_period(period: &str) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let (start, end) = period
        .split_once('/')
        .ok_or_else(|| anyhow::anyhow!("--period must be 'start/end', both RFC3339 timestamps"))?;
    let start = DateTime::parse_from_rfc3339(start)
        .context("parsing period start")?
        .with_timezone(&Utc);
    let end = DateTime::parse_from_rfc3339(end)
        .context("parsing period end")?
        .with_timezone(&Utc);
    Ok((start, end))
}

fn print_result<T: Serialize + std::fmt::Debug>(json: bool, value: &T) {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(value).expect("result serializes to JSON")
        );
    } else {
        println!("{value:#?}");
    }
}

async fn cmd_append(store: &LedgerStore<SledStorage>, path: &PathBuf, json: bool) -> Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let request: EventCreateRequest =
        serde_json::from_slice(&bytes).context("parsing event JSON")?;
    let role = ledger_crypto::required_role_for_actor(request.actor.actor_type.as_str())
        .with_context(|| format!("unknown actor type '{}'", request.actor.actor_type.as_str()))?;
    let row = store.append(request, role).await?;
    print_result(json, &row);
    Ok(())
}

async fn cmd_verify_chain(store: &LedgerStore<SledStorage>, json: bool) -> Result<()> {
    let ok = store.verify_chain().await?;
    if json {
        println!("{}", serde_json::json!({ "chain_valid": ok }));
    } else if ok {
        println!("chain OK");
    } else {
        println!("chain verification FAILED");
    }
    if !ok {
        return Err(ChainInvalid.into());
    }
    Ok(())
}

async fn cmd_disclosure(
    store: &LedgerStore<SledStorage>,
    settings: &Settings,
    cmd: DisclosureCommands,
    json: bool,
) -> Result<()> {
    match cmd {
        DisclosureCommands::Publish {
            policy,
            period,
            group_by,
        } => {
            let (period_start, period_end) = parse_period(&period)?;
            let policy = get_policy(&policy)
                .ok_or_else(|| anyhow::anyhow!(ledger_disclosure::DisclosureError::UnknownPolicy(policy.clone())))?;
            let keys = build_key_registry(settings)?;

            if !matches!(settings.anchor_mode, AnchorMode::Fake) {
                tracing::warn!(
                    mode = ?settings.anchor_mode,
                    "only the process-local fake anchor backend is wired up; falling back to it"
                );
            }
            let anchor = FakeAnchorClient::new();

            let request = PublishRequest {
                policy: &policy,
                period_start,
                period_end,
                group_by: &group_by,
                now: Utc::now(),
                anchor_timeout: Duration::from_millis(settings.anchor_timeout_ms),
                anchor_strict: settings.anchor_strict,
            };
            let run = publish(store, &keys, &anchor, &request).await?;
            print_result(json, &run.signed_statement);
            Ok(())
        }
        DisclosureCommands::Proof { id, metric, group } => {
            let group: Value = serde_json::from_str(&group).context("parsing --group as JSON")?;
            let run = ledger_disclosure::load_run(store.backend(), id)
                .await?
                .ok_or_else(|| anyhow::anyhow!(ledger_disclosure::DisclosureError::RunNotFound(id)))?;
            let leaves = &run.signed_statement.statement.commitments.leaf_payloads;
            let commitment = ledger_disclosure::build_summary_commitment(leaves)?;
            let proof = match ledger_disclosure::commitment::proof_for(
                leaves,
                &commitment.tree,
                &metric,
                &group,
            ) {
                Some(Ok(proof)) => proof,
                Some(Err(err)) => return Err(err.into()),
                None => bail!("no metric '{metric}' with that group in disclosure {id}"),
            };
            print_result(json, &proof);
            Ok(())
        }
        DisclosureCommands::AnchorGet { id } => {
            let run = ledger_disclosure::load_run(store.backend(), id)
                .await?
                .ok_or_else(|| anyhow::anyhow!(ledger_disclosure::DisclosureError::RunNotFound(id)))?;
            let statement = &run.signed_statement.statement;
            let record = serde_json::json!({
                "disclosure_id": statement.disclosure_id,
                "policy_id": statement.policy_id,
                "period_start": statement.period_start,
                "period_end": statement.period_end,
                "root_summary": statement.commitments.root_summary,
                "root_details": statement.commitments.root_details,
                "statement_sig_hash": run.signed_statement.statement_sig_hash,
            });
            print_result(json, &record);
            Ok(())
        }
    }
}

async fn cmd_reveal(
    store: &LedgerStore<SledStorage>,
    settings: &Settings,
    cmd: RevealCommands,
    json: bool,
) -> Result<()> {
    let mac_key = build_mac_key(settings)?;
    match cmd {
        RevealCommands::Request { id, subject, actor } => {
            let issued_to_actor = Subject::from_actor_type(&actor)
                .ok_or_else(|| anyhow::anyhow!("--actor must be 'human' or 'auditor'"))?;
            let now = Utc::now();
            let (envelope, record) = request_token(
                id,
                &subject,
                issued_to_actor,
                settings.reveal_token_ttl_seconds,
                now,
                &mac_key,
            )?;
            store_token_record(store.backend(), &record).await?;
            let token = envelope.encode()?;
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "token": token,
                        "token_id": record.token_id,
                        "expires_at": record.expires_at,
                    })
                );
            } else {
                println!("token: {token}");
                println!("expires_at: {}", record.expires_at);
            }
            Ok(())
        }
        RevealCommands::Redeem {
            id,
            token,
            metric,
            group,
            actor,
        } => {
            let group: Value = serde_json::from_str(&group).context("parsing --group as JSON")?;
            let now = Utc::now();
            let response = reveal(store, &mac_key, id, &token, &metric, &group, &actor, now).await?;
            print_result(json, &response);
            Ok(())
        }
    }
}

async fn cmd_report(store: &LedgerStore<SledStorage>, cmd: ReportCommands, json: bool) -> Result<()> {
    match cmd {
        ReportCommands::Pnl { period } => {
            let (start, end) = parse_period(&period)?;
            let events = store.list(None, None, None).await?;
            let state = ledger_projection::rebuild(&events)?;
            let scoped: Vec<_> = events
                .into_iter()
                .filter(|row| row.occurred_at >= start && row.occurred_at < end)
                .collect();
            let pnl = ledger_reports::generate_pnl(&scoped, &state.shipment_costs);
            print_result(json, &pnl);
            Ok(())
        }
    }
}
