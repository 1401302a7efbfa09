// Output formatting and display for CLI

use crate::ipc::ResponseData;
use crate::process::{CommandOutcome, HandleSummary, ProcessState, ReloadOutcome};
use colored::*;
use std::time::Duration;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

/// Print a success response to stdout
pub fn print_success(data: &ResponseData) {
    match data {
        ResponseData::Outcome(outcome) => print_outcome(outcome),
        ResponseData::Reloaded(outcome) => print_reload(outcome),
        ResponseData::Status(handles) => {
            if handles.is_empty() {
                println!("{}", "No applications are configured".yellow());
            } else {
                print_status_table(handles);
            }
        }
        ResponseData::Pong { pid, uptime } => {
            println!("{}", "✓ Daemon is running".green().bold());
            println!("  {}: {}", "PID".bold(), pid);
            println!("  {}: {}", "Uptime".bold(), format_duration(uptime));
        }
        ResponseData::ShuttingDown => {
            println!("{}", "✓ All instances stopped, daemon exiting".green().bold());
        }
    }
}

fn print_outcome(outcome: &CommandOutcome) {
    for slot in &outcome.acted {
        println!("{} {}", "✓".green().bold(), slot.to_string().cyan());
    }
    for (slot, reason) in &outcome.failed {
        eprintln!("{} {}: {}", "✗".red().bold(), slot.to_string().cyan(), reason);
    }
    if !outcome.failed.is_empty() {
        print_error(&format!(
            "{} of {} instance(s) failed",
            outcome.failed.len(),
            outcome.acted.len() + outcome.failed.len()
        ));
    }
}

fn print_reload(outcome: &ReloadOutcome) {
    let sections = [
        ("added", &outcome.added),
        ("removed", &outcome.removed),
        ("changed", &outcome.changed),
    ];
    let mut any = false;
    for (label, names) in sections {
        if !names.is_empty() {
            any = true;
            println!("  {:<9} {}", format!("{}:", label).bold(), names.join(", "));
        }
    }
    if !any && outcome.rejected.is_empty() {
        print_info("Configuration unchanged");
    }

    for (label, reason) in &outcome.rejected {
        eprintln!("{} {} rejected: {}", "✗".red().bold(), label.cyan(), reason);
    }
    for (slot, reason) in &outcome.failed {
        eprintln!("{} {}: {}", "✗".red().bold(), slot.to_string().cyan(), reason);
    }

    if outcome.rejected.is_empty() && outcome.failed.is_empty() {
        print_success_msg("Configuration reloaded");
    }
}

/// Print an error message to stderr
pub fn print_error(error: &str) {
    eprintln!("{} {}", "✗ Error:".red().bold(), error);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print a success message
pub fn print_success_msg(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "App")]
    app: String,
    #[tabled(rename = "#")]
    instance: u32,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "PID")]
    pid: String,
    #[tabled(rename = "CPU")]
    cpu: String,
    #[tabled(rename = "Memory")]
    memory: String,
    #[tabled(rename = "Uptime")]
    uptime: String,
    #[tabled(rename = "Restarts")]
    restarts: u32,
    #[tabled(rename = "Last cause")]
    last_cause: String,
}

impl StatusRow {
    fn from_summary(handle: &HandleSummary) -> Self {
        Self {
            app: truncate(&handle.app, 20),
            instance: handle.instance,
            state: format_state_colored(handle.state),
            pid: handle
                .pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "-".to_string()),
            cpu: format!("{:.1}%", handle.cpu_fraction * 100.0),
            memory: format_memory(handle.memory_bytes),
            uptime: handle
                .uptime
                .as_ref()
                .map(format_duration)
                .unwrap_or_else(|| "-".to_string()),
            restarts: handle.restart_count,
            last_cause: handle
                .last_cause
                .as_deref()
                .map(|cause| truncate(cause, 32))
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

/// Print a formatted table of every instance slot
fn print_status_table(handles: &[HandleSummary]) {
    let rows: Vec<StatusRow> = handles.iter().map(StatusRow::from_summary).collect();

    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));

    println!("\n{}\n", table);

    for handle in handles {
        if let Some(alarm) = &handle.alarm {
            println!(
                "{} {}:{} {}",
                "⚠".red().bold(),
                handle.app,
                handle.instance,
                alarm.red()
            );
        }
    }

    let running = handles
        .iter()
        .filter(|h| h.state == ProcessState::Running)
        .count();
    println!(
        "{}",
        format!("Total: {} instance(s), {} running", handles.len(), running)
            .dimmed()
            .italic()
    );
}

/// Format a process state with color coding
fn format_state_colored(state: ProcessState) -> String {
    let text = state.to_string();
    match state {
        ProcessState::Running => text.green().to_string(),
        ProcessState::Starting | ProcessState::Restarting => text.yellow().to_string(),
        ProcessState::Exited => text.bright_black().to_string(),
        ProcessState::Killed => text.red().to_string(),
        ProcessState::Retired => text.dimmed().to_string(),
    }
}

/// Format a duration in human-readable format
fn format_duration(duration: &Duration) -> String {
    let secs = duration.as_secs();

    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        let mins = secs / 60;
        let secs = secs % 60;
        if secs > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}m", mins)
        }
    } else if secs < 86400 {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        if mins > 0 {
            format!("{}h {}m", hours, mins)
        } else {
            format!("{}h", hours)
        }
    } else {
        let days = secs / 86400;
        let hours = (secs % 86400) / 3600;
        if hours > 0 {
            format!("{}d {}h", days, hours)
        } else {
            format!("{}d", days)
        }
    }
}

/// Format memory usage in human-readable format
fn format_memory(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes < KB {
        format!("{}B", bytes)
    } else if bytes < MB {
        format!("{:.1}KB", bytes as f64 / KB as f64)
    } else if bytes < GB {
        format!("{:.1}MB", bytes as f64 / MB as f64)
    } else {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    }
}

/// Truncate to at most `max_len` characters
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
