use ch_clock::CronExpr;
use ch_config::Config;
use ch_core::telemetry;
use ch_db::{Db, DbOptions, RetryBackoff};
use ch_dispatch::{Dispatcher, DispatcherConfig, RetryPolicy, TaskUpdates};
use ch_flow::WorkflowEngine;
use ch_hub::{listener, WorkerHub};
use ch_lock::LockClient;
use ch_obs::ObsState;
use chrono::Duration;
use clap::{Parser, Subcommand};
use std::{process, sync::Arc};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "cronhubd")]
#[command(about = "cronhub distributed job scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduler (default)
    Start,
    /// Validate a cron expression and print its next fire times
    CheckCron {
        /// Seven-field expression: sec min hour dom month dow year
        expression: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Some(Commands::CheckCron { expression }) = &cli.command {
        check_cron(expression);
        return;
    }

    let json_logs = std::env::var("CRONHUB_LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);
    telemetry::init("cronhub", json_logs);

    // Load configuration - exit with non-zero if invalid
    let config = match Config::load() {
        Ok(config) => {
            tracing::debug!(?config, "Configuration loaded successfully");
            config
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    // Initialize database with migrations
    let mut db_options = DbOptions::new(&config.database.path);
    db_options.max_connections = config.database.pool_size;
    let db = match Db::open(&db_options).await {
        Ok(db) => {
            tracing::info!("Database initialized successfully");
            db
        }
        Err(e) => {
            tracing::error!("Failed to initialize database: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = db.ping().await {
        tracing::error!("Database liveness probe failed: {}", e);
        process::exit(1);
    }

    tracing::info!("cronhub starting");
    if let Err(e) = start_scheduler(config, db).await {
        tracing::error!("Scheduler failed: {}", e);
        process::exit(1);
    }
}

/// Authoring-time helper: validate and preview a schedule
fn check_cron(expression: &str) {
    let expr: CronExpr = match expression.parse() {
        Ok(expr) => expr,
        Err(e) => {
            eprintln!("invalid: {}", e);
            process::exit(1);
        }
    };

    println!("canonical: {}", expr);
    let mut from = ch_core::utc_now();
    for i in 1..=5 {
        match expr.next(from) {
            Ok(next) => {
                println!("fire {}: {}", i, ch_core::to_rfc3339(next));
                from = next;
            }
            Err(e) => {
                println!("fire {}: {}", i, e);
                break;
            }
        }
    }
}

async fn start_scheduler(config: Config, db: Db) -> ch_core::Result<()> {
    let cancel = CancellationToken::new();
    let obs_state = ObsState::new();
    let metrics = obs_state.metrics.clone();

    // One hub, one lock client, one dispatcher, one engine - all constructed
    // here and injected downward.
    let hub = Arc::new(WorkerHub::new(db.clone()));
    let locks = LockClient::new(db.pool().clone());

    let backoff = RetryBackoff {
        base_secs: config.scheduler.retry_base_delay_secs,
        multiplier: config.scheduler.retry_multiplier,
        max_secs: config.scheduler.retry_max_delay_secs,
    };
    let policy = RetryPolicy::new(
        backoff,
        Duration::seconds(config.scheduler.retry_grace_secs),
    );
    let dispatcher_config = DispatcherConfig {
        dispatch_tick: std::time::Duration::from_secs(config.scheduler.dispatch_tick_secs),
        timeout_tick: std::time::Duration::from_secs(config.scheduler.timeout_tick_secs),
        retry_tick: std::time::Duration::from_secs(config.scheduler.retry_tick_secs),
        dispatch_batch_limit: config.scheduler.dispatch_batch_limit,
        retry_batch_limit: config.scheduler.retry_batch_limit,
        leader_lease: Duration::seconds(config.scheduler.leader_lease_secs),
        stop_ack_grace: std::time::Duration::from_secs(config.hub.stop_ack_grace_secs),
    };

    let dispatcher = Arc::new(Dispatcher::new(
        db.clone(),
        hub.clone(),
        locks.clone(),
        policy,
        dispatcher_config,
        metrics.clone(),
    ));

    let engine = Arc::new(WorkflowEngine::new(
        db.clone(),
        hub.clone(),
        locks.clone(),
        metrics,
        Duration::seconds(config.workflow.default_timeout_secs),
    ));
    dispatcher.set_terminal_hook(engine.clone()).await;

    // Worker session listener feeding status updates into the dispatcher
    let sink = Arc::new(TaskUpdates::new(dispatcher.clone()));
    let listener_hub = hub.clone();
    let listener_cancel = cancel.clone();
    let worker_bind = config.server.worker_bind.clone();
    let listener_handle = tokio::spawn(async move {
        if let Err(e) = listener::serve(&worker_bind, listener_hub, sink, listener_cancel).await {
            tracing::error!("Worker listener failed: {}", e);
        }
    });

    dispatcher.start(cancel.clone());

    tokio::spawn(hub.clone().check_worker_status_loop(
        std::time::Duration::from_secs(config.hub.sweep_tick_secs),
        Duration::seconds(config.hub.inactive_secs),
        cancel.clone(),
    ));

    tokio::spawn(
        engine
            .clone()
            .start_expiry_loop(std::time::Duration::from_secs(60), cancel.clone()),
    );

    // Expired-lock housekeeping
    let sweep_locks = locks.clone();
    let sweep_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = sweep_cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = sweep_locks.sweep_expired().await {
                        tracing::warn!("Lock sweep failed: {}", e);
                    }
                }
            }
        }
    });

    // Everything is up: flip readiness, serve obs endpoints until SIGINT
    obs_state.readiness.mark_ready();
    tracing::info!("cronhub ready");

    let obs_bind = config.server.obs_bind.clone();
    tokio::select! {
        result = ch_obs::serve(&obs_bind, obs_state) => {
            cancel.cancel();
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received, draining");
            cancel.cancel();
        }
    }

    let _ = listener_handle.await;
    tracing::info!("cronhub stopped");
    Ok(())
}
