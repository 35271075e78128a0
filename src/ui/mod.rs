use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::time::Duration;

use crate::database::QueueCounts;
use crate::models::{AttendanceRecord, SyncState};
use crate::sync::{CycleReport, SyncEvent};

const RULE_TOP: &str = "┌─────────────────────────────────────────────────────────────┐";
const RULE_MID: &str = "├─────────────────────────────────────────────────────────────┤";
const RULE_BOTTOM: &str = "└─────────────────────────────────────────────────────────────┘";

// Spinner shown while a cycle talks to the server
pub fn create_spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
        .template("{spinner:.blue} {msg} [{elapsed_precise}]")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    spinner.set_style(style);
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

pub fn init_ui() {
    println!(
        "{} {} {}",
        "📋".green(),
        "Attendance Sync".bold().blue(),
        "📋".green()
    );
}

fn header(title: &str) {
    println!("{}", RULE_TOP.bright_blue());
    println!(
        "{} {} {}",
        "│".bright_blue(),
        format!(" {:<58}", title).bold().white().on_blue(),
        "│".bright_blue()
    );
}

pub fn print_counts(counts: &QueueCounts) {
    header("📦 LOCAL QUEUE");
    println!("{}", RULE_MID.bright_blue());
    for (label, value) in [
        ("Pending", counts.pending),
        ("In flight", counts.in_flight),
        ("Failed (will retry)", counts.failed),
        ("Rejected (needs review)", counts.rejected),
    ] {
        println!(
            "{} {:<40} {:>18} {}",
            "│".bright_blue(),
            label.cyan(),
            value.to_string().yellow().bold(),
            "│".bright_blue()
        );
    }
    println!("{}", RULE_BOTTOM.bright_blue());
}

/// Table of queued records, one row each, in creation order.
pub fn print_records(title: &str, records: &[AttendanceRecord]) {
    header(title);
    println!("{}", RULE_MID.bright_blue());
    println!(
        "{} {:<6} {:<10} {:<10} {:<10} {:<8} {:<9} {}",
        "│".bright_blue(),
        "ID".bold(),
        "Worker".bold(),
        "Project".bold(),
        "Date".bold(),
        "Present".bold(),
        "State".bold(),
        "│".bright_blue()
    );
    println!("{}", RULE_MID.bright_blue());

    if records.is_empty() {
        println!(
            "{} {:<59} {}",
            "│".bright_blue(),
            "(empty)".dimmed(),
            "│".bright_blue()
        );
    }

    for record in records {
        println!(
            "{} {:<6} {:<10} {:<10} {:<10} {:<8} {:<9} {}",
            "│".bright_blue(),
            record.local_id.0,
            record.worker_id,
            record.project_id,
            record.date.format("%Y-%m-%d").to_string(),
            if record.present { "yes" } else { "no" },
            state_label(&record.sync_state),
            "│".bright_blue()
        );
        if let Some(error) = last_error(record) {
            println!("{}   {}", "│".bright_blue(), error.red());
        }
    }
    println!("{}", RULE_BOTTOM.bright_blue());
}

fn state_label(state: &SyncState) -> &'static str {
    match state {
        SyncState::Failed { .. } if !state.is_retry_eligible() => "rejected",
        SyncState::Failed { .. } => "retrying",
        other => other.label(),
    }
}

fn last_error(record: &AttendanceRecord) -> Option<&str> {
    match &record.sync_state {
        SyncState::Failed { last_error, .. } if !last_error.is_empty() => {
            Some(last_error.as_str())
        }
        _ => None,
    }
}

pub fn print_report(report: &CycleReport) {
    header("🔄 SYNC SUMMARY");
    println!("{}", RULE_MID.bright_blue());
    let rows = [
        ("Trigger", report.trigger.to_string().normal()),
        ("Cycles", report.cycles.to_string().normal()),
        ("Synced", report.synced.to_string().green().bold()),
        ("Failed (will retry)", report.failed.to_string().yellow().bold()),
        ("Rejected", report.rejected.to_string().red().bold()),
        ("Deferred (offline)", report.skipped_offline.to_string().yellow()),
        (
            "Busy in another process",
            (if report.held_elsewhere { "yes" } else { "no" }).normal(),
        ),
    ];
    for (label, value) in rows {
        println!(
            "{} {:<40} {:>18} {}",
            "│".bright_blue(),
            label.cyan(),
            value,
            "│".bright_blue()
        );
    }
    println!("{}", RULE_BOTTOM.bright_blue());
}

/// One line per engine event, for the long-running mode.
pub fn render_event(event: &SyncEvent) {
    match event {
        SyncEvent::Queued {
            local_id,
            worker_id,
        } => println!("{} {} queued for worker {}", "📥".normal(), local_id, worker_id.bold()),
        SyncEvent::CycleStarted { trigger, pending } => println!(
            "{} {}",
            "🔄".normal(),
            format!("Syncing {} record(s) ({})", pending, trigger).blue()
        ),
        SyncEvent::Synced {
            local_id,
            worker_id,
        } => println!("{} {} synced (worker {})", "✅".green(), local_id, worker_id),
        SyncEvent::Failed {
            local_id,
            worker_id,
            error,
        } => println!(
            "{} {} failed (worker {}): {}",
            "⚠️".yellow(),
            local_id,
            worker_id,
            error.yellow()
        ),
        SyncEvent::Rejected {
            local_id,
            worker_id,
            error,
        } => println!(
            "{} {} rejected (worker {}): {}",
            "❌".red(),
            local_id,
            worker_id,
            error.red().bold()
        ),
        SyncEvent::CycleFinished(report) => println!(
            "{}",
            format!(
                "Cycle done: {} synced, {} retrying, {} rejected, {} deferred",
                report.synced, report.failed, report.rejected, report.skipped_offline
            )
            .cyan()
        ),
    }
}
