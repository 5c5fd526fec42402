//! Workflow inspection commands: `anvil status`, `anvil list`,
//! `anvil events`, `anvil archive`.

use anyhow::{Context, Result};
use console::style;
use std::process::ExitCode;
use std::time::Duration;

use anvil::config::AnvilConfig;
use anvil::dag::{StageStatus, WorkflowStatus};
use anvil::engine::{Severity, WorkflowSnapshot};
use anvil::events::{Event, LogTailer};

use super::{open_engine, print_event};

const FOLLOW_INTERVAL: Duration = Duration::from_millis(250);

pub async fn cmd_status(config: AnvilConfig, id: Option<&str>, json: bool) -> Result<ExitCode> {
    let engine = open_engine(config)?;
    let id = match id {
        Some(id) => id.to_string(),
        None => match engine.list().await?.into_iter().find(|r| !r.archived) {
            Some(record) => record.id,
            None => {
                println!("No workflows recorded.");
                return Ok(ExitCode::SUCCESS);
            }
        },
    };

    let snapshot = engine.status(&id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print_snapshot(&snapshot);
    }
    Ok(ExitCode::SUCCESS)
}

fn print_snapshot(snapshot: &WorkflowSnapshot) {
    println!(
        "{} {} '{}'  {}",
        style("Workflow").bold().cyan(),
        snapshot.id,
        snapshot.name,
        styled_workflow_status(snapshot.status)
    );
    let quality = snapshot
        .quality_total
        .map(|q| format!("{:.2}", q))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "  jumps: {}  events: {}  quality: {}",
        snapshot.total_jumps, snapshot.last_seq, quality
    );
    println!();
    println!(
        "  {:<28} {:<20} {:<16} {:>8}  counters",
        "STAGE", "SCOPE", "STATUS", "ATTEMPTS"
    );
    for stage in &snapshot.stages {
        let counters: Vec<String> = stage
            .counters
            .iter()
            .filter(|(_, value)| **value > 0)
            .map(|(kind, value)| format!("{}={}", kind, value))
            .collect();
        println!(
            "  {:<28} {:<20} {:<16} {:>8}  {}",
            stage.id,
            stage.scope,
            styled_stage_status(stage.status),
            stage.attempts,
            counters.join(" ")
        );
    }

    if let Some(fatal) = &snapshot.fatal {
        println!();
        println!("  {} {}", style("Fatal:").red().bold(), fatal);
    }
    if !snapshot.warnings.is_empty() {
        println!();
        for warning in &snapshot.warnings {
            println!("  {} {}", style("⚠").yellow(), warning);
        }
    }
    if !snapshot.findings.is_empty() {
        println!();
        println!("  {}", style("Watchdog:").bold());
        for finding in &snapshot.findings {
            let line = style(finding.to_string());
            let line = match finding.severity {
                Severity::Error => line.red(),
                Severity::Warning => line.yellow(),
            };
            println!("    {}", line);
        }
    }
}

fn styled_workflow_status(status: WorkflowStatus) -> console::StyledObject<String> {
    let text = style(status.to_string());
    match status {
        WorkflowStatus::Succeeded => text.green().bold(),
        WorkflowStatus::Running => text.cyan().bold(),
        WorkflowStatus::FailedContinue | WorkflowStatus::Canceled => text.yellow().bold(),
        WorkflowStatus::Terminal => text.red().bold(),
        WorkflowStatus::NotStarted => text.dim(),
    }
}

// Padded before styling so ANSI codes do not break the columns.
fn styled_stage_status(status: StageStatus) -> console::StyledObject<String> {
    let text = style(format!("{:<16}", status.to_string()));
    match status {
        StageStatus::Succeeded => text.green(),
        StageStatus::Running => text.cyan(),
        StageStatus::FailedContinue | StageStatus::Canceled => text.yellow(),
        StageStatus::Failed | StageStatus::Terminal => text.red(),
        StageStatus::NotStarted => text.dim(),
    }
}

pub async fn cmd_list(config: AnvilConfig, all: bool, json: bool) -> Result<ExitCode> {
    let engine = open_engine(config)?;
    let records: Vec<_> = engine
        .list()
        .await?
        .into_iter()
        .filter(|r| all || !r.archived)
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(ExitCode::SUCCESS);
    }
    if records.is_empty() {
        println!("No workflows recorded.");
        return Ok(ExitCode::SUCCESS);
    }
    println!(
        "{:<38} {:<16} {:>6}  {:<20} NAME",
        "ID", "STATUS", "EVENTS", "UPDATED"
    );
    for record in records {
        let archived = if record.archived { " (archived)" } else { "" };
        println!(
            "{:<38} {:<16} {:>6}  {:<20} {}{}",
            record.id,
            record.status.to_string(),
            record.last_seq,
            record.updated_at.format("%Y-%m-%d %H:%M:%S"),
            record.name,
            archived
        );
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn cmd_events(
    config: AnvilConfig,
    id: &str,
    from: u64,
    follow: bool,
    json: bool,
) -> Result<ExitCode> {
    let engine = open_engine(config)?;
    let history = engine.history(id, from).await?;
    let mut next = from.max(1);
    for event in &history {
        print_one(event, json)?;
        next = event.seq + 1;
    }
    if !follow {
        return Ok(ExitCode::SUCCESS);
    }

    let log = engine.log();
    let mut tailer = LogTailer::new(log.clone(), FOLLOW_INTERVAL);
    tailer.follow(id, next);
    loop {
        // Read the status first so the final poll includes the closing events.
        let finished = log
            .workflow(id)
            .await?
            .is_none_or(|record| record.status.is_final());
        for event in tailer.poll(id).await? {
            print_one(&event, json)?;
        }
        if finished {
            break;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(tailer.interval()) => {}
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_one(event: &Event, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string(event).context("Failed to serialize event")?
        );
    } else {
        print_event(event);
    }
    Ok(())
}

pub async fn cmd_archive(config: AnvilConfig, id: &str) -> Result<ExitCode> {
    let engine = open_engine(config)?;
    engine.archive(id).await?;
    println!("Archived {}", id);
    Ok(ExitCode::SUCCESS)
}
