// Output formatting and display for CLI

use crate::config::ProcessSpec;
use crate::process::ProcessInfo;
use colored::*;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print a success message
pub fn print_success_msg(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print a formatted table of supervised processes
pub fn print_process_table(processes: &[ProcessInfo]) {
    if processes.is_empty() {
        println!("{}", "No processes are being supervised".yellow());
        return;
    }

    #[derive(Tabled)]
    struct ProcessRow {
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Kind")]
        kind: String,
        #[tabled(rename = "State")]
        state: String,
        #[tabled(rename = "PID")]
        pid: String,
        #[tabled(rename = "Restarts")]
        restarts: String,
        #[tabled(rename = "Memory watch")]
        monitored: String,
    }

    let rows: Vec<ProcessRow> = processes
        .iter()
        .map(|p| ProcessRow {
            name: truncate(&p.name, 30),
            kind: p.kind.to_string(),
            state: format_state_colored(p),
            pid: p
                .pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "-".to_string()),
            restarts: p.restarts.to_string(),
            monitored: if p.monitored { "on" } else { "-" }.to_string(),
        })
        .collect();

    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));

    println!("\n{}\n", table);
    println!(
        "{}",
        format!("Total: {} process(es)", processes.len())
            .dimmed()
            .italic()
    );
}

/// Print the specs of a config file as a table
pub fn print_spec_table(specs: &[ProcessSpec]) {
    #[derive(Tabled)]
    struct SpecRow {
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Script")]
        script: String,
        #[tabled(rename = "Restart delays")]
        delays: String,
        #[tabled(rename = "Memory limit")]
        memory: String,
        #[tabled(rename = "Log file")]
        log: String,
    }

    let rows: Vec<SpecRow> = specs
        .iter()
        .map(|spec| SpecRow {
            name: spec.name.clone().unwrap_or_else(|| "-".to_string()),
            script: spec
                .script
                .as_ref()
                .map(|s| truncate(&s.display().to_string(), 40))
                .unwrap_or_else(|| "(from manifest)".to_string()),
            delays: format_delays(&spec.restart_intervals_ms),
            memory: spec
                .memory_threshold_bytes
                .map(format_memory)
                .unwrap_or_else(|| "-".to_string()),
            log: spec
                .log_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));

    println!("\n{}\n", table);
}

/// Format a process state with color coding
fn format_state_colored(process: &ProcessInfo) -> String {
    if process.running && process.stop_requested {
        "stopping".yellow().to_string()
    } else if process.running {
        "running".green().to_string()
    } else if process.restart_pending {
        "restarting".yellow().to_string()
    } else {
        "stopped".bright_black().to_string()
    }
}

fn format_delays(intervals_ms: &[u64]) -> String {
    intervals_ms
        .iter()
        .map(|ms| {
            if ms % 1000 == 0 {
                format!("{}s", ms / 1000)
            } else {
                format!("{}ms", ms)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
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

/// Truncate a string to a maximum number of characters
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
