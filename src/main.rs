use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use colored::*;
use dotenv::dotenv;
use std::io::BufRead;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, watch};
use tracing::{error, info};

use asistencia_sync::config::Config;
use asistencia_sync::connectivity::{
    spawn_probe_loop, ConnectivityMonitor, ConnectivityProbe, HttpProbe,
};
use asistencia_sync::database::LocalStore;
use asistencia_sync::logging;
use asistencia_sync::models::{
    worker_id_from_credential_url, worker_id_from_qr, LocalId, NewAttendance,
};
use asistencia_sync::remote::HttpSubmissionService;
use asistencia_sync::sync::{
    CycleOutcome, RetryBackoff, SyncEngine, TriggerPolicy, TriggerReason,
};
use asistencia_sync::ui::{
    create_spinner, init_ui, print_counts, print_records, print_report, render_event,
};

#[derive(Parser)]
#[command(name = "asistencia-sync", version, about = "Offline-first attendance capture and sync")]
struct Cli {
    /// Default log level when RUST_LOG is unset
    #[arg(long, env = "ASISTENCIA_LOG", default_value = "info", global = true)]
    log_level: String,

    /// Overrides ASISTENCIA_DATABASE_URL
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Queue one attendance mark locally
    Record {
        #[arg(long)]
        project: String,
        /// YYYY-MM-DD, defaults to today
        #[arg(long)]
        date: Option<String>,
        #[arg(long, conflicts_with = "qr", required_unless_present = "qr")]
        worker: Option<String>,
        /// Scanned worker credential (`.../registrar-qr/<id>/`)
        #[arg(long)]
        qr: Option<String>,
        /// Accept a QR payload that is not a worker credential as the id
        #[arg(long, requires = "qr")]
        allow_raw_qr: bool,
        #[arg(long)]
        absent: bool,
    },
    /// List records the server has not acknowledged
    Pending,
    /// List records waiting for manual resolution
    Rejected,
    /// Put a rejected record back in the queue
    Requeue { local_id: i64 },
    /// Run one sync cycle now
    Sync,
    /// Watch connectivity and sync until Ctrl-C
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let mut config = Config::from_env()?;
    if let Some(database_url) = cli.database_url {
        config.database_url = database_url;
    }
    let store = LocalStore::open(&config.database_url)
        .await
        .with_context(|| format!("Failed to open local store at {}", config.database_url))?
        .with_max_rejections(config.sync.max_rejections);

    let result = match cli.command {
        Command::Record {
            project,
            date,
            worker,
            qr,
            allow_raw_qr,
            absent,
        } => {
            let worker = match (worker, qr) {
                (Some(worker), _) => worker,
                (None, Some(payload)) => worker_from_scan(&payload, allow_raw_qr)?,
                (None, None) => bail!("either --worker or --qr is required"),
            };
            record(&store, project, date, worker, !absent).await
        }
        Command::Pending => list_pending(&store).await,
        Command::Rejected => {
            let rejected = store.list_rejected().await?;
            print_records("❌ REJECTED RECORDS", &rejected);
            Ok(())
        }
        Command::Requeue { local_id } => {
            store.requeue(LocalId(local_id)).await?;
            println!("{} {}", "✅".green(), format!("Record #{} requeued", local_id).green());
            Ok(())
        }
        Command::Sync => sync_once(&config, store.clone()).await,
        Command::Run => run(&config, store.clone()).await,
    };

    store.close().await;
    result
}

async fn record(
    store: &LocalStore,
    project: String,
    date: Option<String>,
    worker_id: String,
    present: bool,
) -> Result<()> {
    let date = date.unwrap_or_else(|| today().format("%Y-%m-%d").to_string());

    let attendance = NewAttendance::parse(&worker_id, &project, &date, present)?;
    let local_id = store.append(&attendance).await?;
    println!(
        "{} {}",
        "📥".normal(),
        format!("Attendance {} queued for worker {}", local_id, attendance.worker_id).green()
    );
    Ok(())
}

fn worker_from_scan(payload: &str, allow_raw: bool) -> Result<String> {
    let worker = if allow_raw {
        worker_id_from_qr(payload)
    } else {
        worker_id_from_credential_url(payload)
    };
    match worker {
        Some(worker) => Ok(worker),
        None => bail!("QR payload is not a worker credential: {:?}", payload.trim()),
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

async fn list_pending(store: &LocalStore) -> Result<()> {
    let records = store.list_pending().await?;
    print_records("📋 PENDING RECORDS", &records);
    print_counts(&store.counts().await?);
    info!(unacknowledged = store.pending_count().await?, "local queue inspected");
    Ok(())
}

async fn sync_once(config: &Config, store: LocalStore) -> Result<()> {
    init_ui();
    let start_time = Instant::now();
    let remote = config.require_remote()?;

    let probe = HttpProbe::new(remote.base_url.clone(), remote.request_timeout)?;
    let spinner = create_spinner("Checking connection...");
    let online = probe.is_reachable().await;
    if !online {
        spinner.finish_with_message("⚠️ Server unreachable; records stay queued");
        print_counts(&store.counts().await?);
        return Ok(());
    }

    let monitor = ConnectivityMonitor::new(online, config.sync.debounce);
    let service = Arc::new(HttpSubmissionService::new(remote)?);
    let engine = SyncEngine::new(store, service, monitor, config.sync.mode);

    spinner.set_message("Submitting queued attendance...");
    let outcome = engine.request_cycle(TriggerReason::Manual).await;
    spinner.finish_and_clear();

    match outcome {
        CycleOutcome::Completed(report) if report.held_elsewhere && report.attempted == 0 => {
            println!("{}", "Another process is synchronizing; try again shortly".yellow())
        }
        CycleOutcome::Completed(report) => print_report(&report),
        CycleOutcome::Coalesced => println!("{}", "Another sync is already running".yellow()),
    }
    print_counts(&engine.store().counts().await?);

    println!(
        "\n{}",
        format!("⏱️ Total execution time: {:.2?}", start_time.elapsed()).cyan()
    );
    Ok(())
}

async fn run(config: &Config, store: LocalStore) -> Result<()> {
    init_ui();
    let remote = config.require_remote()?;

    let probe: Arc<dyn ConnectivityProbe> = Arc::new(HttpProbe::new(
        remote.base_url.clone(),
        remote.request_timeout,
    )?);
    let initial = probe.is_reachable().await;
    info!(online = initial, "initial connectivity");

    let monitor = ConnectivityMonitor::new(initial, config.sync.debounce);
    let service = Arc::new(HttpSubmissionService::new(remote)?);
    let engine = Arc::new(SyncEngine::new(
        store,
        service,
        monitor.clone(),
        config.sync.mode,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let probe_task = spawn_probe_loop(
        probe,
        monitor.clone(),
        config.sync.probe_interval,
        shutdown_rx.clone(),
    );

    let mut events = engine.subscribe();
    let notifier = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => render_event(&event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    info!(missed, "notification stream lagged")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let (policy, trigger) = TriggerPolicy::new(
        engine.clone(),
        &monitor,
        RetryBackoff::new(config.sync.retry_base, config.sync.retry_max),
    );
    let policy = policy.with_queue_poll(config.sync.queue_poll);
    let policy_task = tokio::spawn(policy.run(shutdown_rx));

    // A plain thread: blocking stdin reads would hold up runtime shutdown.
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            if line.is_err() || !trigger.sync_now_blocking() {
                break;
            }
        }
    });

    print_counts(&engine.store().counts().await?);
    println!(
        "{}",
        "Watching connectivity. Press Enter to sync now, Ctrl-C to stop.".yellow()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    println!("\n{}", "Stopping...".yellow());

    let _ = shutdown_tx.send(true);
    for (name, task) in [("trigger policy", policy_task), ("probe", probe_task)] {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "background task ended abnormally");
        }
    }
    drop(engine);
    notifier.abort();

    Ok(())
}
