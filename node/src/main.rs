// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Mintbridge Node
//!
//! Entry point for the `mintbridge-node` binary. Parses CLI arguments,
//! initializes logging and metrics, wires the escrow ledger to the
//! settlement pipeline, and serves the HTTP API.
//!
//! Subcommands:
//!
//! - `run`          start the service
//! - `dead-letters` list or remove dead letter entries
//! - `version`      print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use tokio::signal;

use mintbridge_contracts::{
    AccessControl, AssetLedger, ComplianceRecord, ComplianceRegistry, Credential, EscrowClient,
    EscrowSettings, MintEscrow, Role,
};
use mintbridge_protocol::auth::SignatureVerifier;
use mintbridge_protocol::clock::{Clock, SystemClock};
use mintbridge_protocol::config::{
    BridgeConfig, INTENT_SIGNATURE_HEADER, INTENT_TIMESTAMP_HEADER, PROTOCOL_VERSION,
    SETTLEMENT_SIGNATURE_HEADER, SETTLEMENT_TIMESTAMP_HEADER,
};
use mintbridge_protocol::dead_letter::{DeadLetterQueue, DeadLetterSink};
use mintbridge_protocol::settlement::{RetryPolicy, SettlementExecutor};
use mintbridge_protocol::storage::{BridgeDb, LedgerJournal};

use cli::{Commands, DeadLetterCommand, MintbridgeCli};
use logging::{LogFormat, DEFAULT_LOG_DIRECTIVE};
use metrics::{BridgeMetrics, MetricsState};

/// Symbol of the asset depositors pledge into escrow.
const DEPOSIT_ASSET: &str = "USDC";

/// Principal that administers ledger roles.
const ADMIN_PRINCIPAL: &str = "mintbridge-admin";

/// Principal the service executes and refunds as.
const EXECUTOR_PRINCIPAL: &str = "mintbridge-node";

/// How often expired idempotency records and old day buckets are dropped.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Day buckets kept behind the current one.
const BUCKET_RETENTION_DAYS: i64 = 7;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = MintbridgeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::DeadLetters(command) => manage_dead_letters(command),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts the service: API server, metrics endpoint, and maintenance loop.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(DEFAULT_LOG_DIRECTIVE, args.log_format);

    let mut config = BridgeConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    if let Some(port) = args.http_port {
        config.service.http_port = port;
    }
    if let Some(port) = args.metrics_port {
        config.service.metrics_port = port;
    }

    tracing::info!(
        http_port = config.service.http_port,
        metrics_port = config.service.metrics_port,
        data_dir = %args.data_dir.display(),
        markets = config.markets.len(),
        "starting mintbridge-node"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // --- Persistent storage ---
    let db = open_db(&args.data_dir, true)?;
    let idempotency = Arc::new(db.idempotency_store(clock.clone()));
    let dead_letters = Arc::new(db.dead_letter_queue(clock.clone()));

    // --- Escrow ledger ---
    let escrow = Arc::new(build_escrow(
        &config,
        clock.clone(),
        Arc::new(db.ledger_journal()),
    )?);
    let ledger = Arc::new(EscrowClient::new(
        escrow.clone(),
        Credential::new(EXECUTOR_PRINCIPAL),
    ));

    // --- Metrics ---
    let bridge_metrics =
        Arc::new(BridgeMetrics::new().context("failed to register prometheus metrics")?);
    bridge_metrics
        .dead_letter_depth
        .set(dead_letters.depth() as i64);

    // --- Application state ---
    let executor = SettlementExecutor::new(
        ledger.clone(),
        RetryPolicy::from(&config.retry),
        dead_letters.clone(),
    );
    let app_state = api::AppState {
        version: format!("{} (protocol {})", env!("CARGO_PKG_VERSION"), PROTOCOL_VERSION),
        ledger,
        idempotency: idempotency.clone(),
        dead_letters: dead_letters.clone(),
        executor,
        intent_auth: Arc::new(SignatureVerifier::new(
            "intent",
            config.secrets.intent_secret.as_bytes(),
            config.service.intent_clock_skew(),
            INTENT_SIGNATURE_HEADER,
            INTENT_TIMESTAMP_HEADER,
        )),
        settlement_auth: Arc::new(SignatureVerifier::new(
            "settlement",
            config.secrets.settlement_secret.as_bytes(),
            config.service.settlement_clock_skew(),
            SETTLEMENT_SIGNATURE_HEADER,
            SETTLEMENT_TIMESTAMP_HEADER,
        )),
        metrics: bridge_metrics.clone(),
        clock: clock.clone(),
        windows: api::RequestWindows::from(&config.service),
    };

    // --- API server ---
    let api_router = api::create_router(app_state);
    let api_addr = format!("0.0.0.0:{}", config.service.http_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {api_addr}"))?;
    tracing::info!("API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(MetricsState {
            metrics: bridge_metrics,
            dead_letters: dead_letters.clone(),
        });
    let metrics_addr = format!("0.0.0.0:{}", config.service.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {metrics_addr}"))?;
    tracing::info!("Metrics server listening on {}", metrics_addr);

    // --- Maintenance ---
    let maintenance = {
        let idempotency = idempotency.clone();
        let escrow = escrow.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                interval.tick().await;
                match idempotency.purge_expired() {
                    Ok(0) => {}
                    Ok(purged) => tracing::debug!(purged, "expired idempotency records purged"),
                    Err(e) => tracing::warn!(error = %e, "idempotency purge failed"),
                }
                let pruned = escrow.prune_buckets(BUCKET_RETENTION_DAYS);
                if pruned > 0 {
                    tracing::debug!(pruned, "old day buckets dropped");
                }
            }
        })
    };

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("Metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    maintenance.abort();
    db.flush().context("failed to flush database on shutdown")?;
    tracing::info!("mintbridge-node stopped");
    Ok(())
}

/// Opens the sled database under `data_dir`. Operator commands refuse to
/// create a fresh one.
fn open_db(data_dir: &Path, create: bool) -> Result<BridgeDb> {
    let db_path = data_dir.join("db");
    if create {
        std::fs::create_dir_all(&db_path).with_context(|| {
            format!("failed to create database directory: {}", db_path.display())
        })?;
    } else if !db_path.exists() {
        bail!("no database at {}", db_path.display());
    }
    let db = BridgeDb::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "database opened");
    Ok(db)
}

/// Builds the escrow ledger, applies devnet seed data from `config`, then
/// replays the journal on top of it.
fn build_escrow(
    config: &BridgeConfig,
    clock: Arc<dyn Clock>,
    journal: Arc<dyn LedgerJournal>,
) -> Result<MintEscrow> {
    let admin = Credential::new(ADMIN_PRINCIPAL);
    let access = Arc::new(AccessControl::new(&admin));
    access
        .grant(&admin, EXECUTOR_PRINCIPAL, Role::Executor)
        .context("failed to grant executor role")?;

    let now = clock.now();
    let registry = Arc::new(ComplianceRegistry::with_clock(
        config.compliance,
        clock.clone(),
    ));
    for (depositor, seed) in &config.seed.compliance {
        registry.set_record(
            depositor,
            ComplianceRecord {
                risk_score: seed.risk_score,
                attestation: seed.attestation.clone(),
                attested_at: attested_at(now, seed.attestation_age_secs),
            },
        );
    }

    let assets = Arc::new(AssetLedger::new(DEPOSIT_ASSET));
    for (holder, amount) in &config.seed.balances {
        assets
            .fund(holder, *amount)
            .with_context(|| format!("failed to seed balance for {holder}"))?;
    }
    if !config.seed.balances.is_empty() || !config.seed.compliance.is_empty() {
        tracing::info!(
            balances = config.seed.balances.len(),
            compliance_records = config.seed.compliance.len(),
            "seed data applied"
        );
    }

    MintEscrow::new(EscrowSettings::from(config), access, registry, assets)
        .with_clock(clock)
        .with_journal(journal)
        .context("failed to restore the ledger from its journal")
}

/// `now - age_secs`, clamped to the earliest representable instant.
fn attested_at(now: DateTime<Utc>, age_secs: u64) -> DateTime<Utc> {
    i64::try_from(age_secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Operator access to the dead letter queue.
fn manage_dead_letters(command: DeadLetterCommand) -> Result<()> {
    logging::init_logging("warn", LogFormat::Pretty);

    match command {
        DeadLetterCommand::List(args) => {
            let db = open_db(&args.data_dir, false)?;
            let queue = db.dead_letter_queue(Arc::new(SystemClock));
            let entries = match &args.reference {
                Some(reference) => {
                    let mut entries = queue
                        .list_by_reference(reference)
                        .context("failed to read dead letters")?;
                    entries.truncate(args.limit);
                    entries
                }
                None => queue.list(args.limit).context("failed to read dead letters")?,
            };
            for entry in &entries {
                println!("{}", serde_json::to_string(entry)?);
            }
            eprintln!("{} of {} entries shown", entries.len(), queue.depth());
        }
        DeadLetterCommand::Remove(args) => {
            let db = open_db(&args.data_dir, false)?;
            let queue: DeadLetterQueue = db.dead_letter_queue(Arc::new(SystemClock));
            let entry = queue
                .remove(&args.id)
                .with_context(|| format!("failed to remove dead letter {}", args.id))?;
            println!(
                "removed {} (payment reference {}, intent {})",
                entry.id, entry.payment_reference, entry.intent_id
            );
        }
    }
    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("mintbridge-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol        {}", PROTOCOL_VERSION);
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported. If a handler cannot be
/// installed that branch never fires and the other one still can.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
