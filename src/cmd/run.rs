//! Workflow execution commands: `anvil run`, `anvil resume`, `anvil cancel`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use anvil::config::AnvilConfig;
use anvil::dag::{Outcome, WorkflowStatus};
use anvil::engine::{Engine, RecoveryReport};
use anvil::events::{Subscription, SubscriptionFilter};
use anvil::plan::Plan;
use anvil::server::{self, AppState};

use super::{open_engine, print_event};

pub async fn cmd_run(config: AnvilConfig, plan_path: &Path, serve_port: Option<u16>) -> Result<ExitCode> {
    let plan = Plan::load(plan_path)
        .with_context(|| format!("Failed to load plan {}", plan_path.display()))?;
    check_config(&config)?;
    let engine = Arc::new(open_engine(config)?);
    print_recovery(&engine.recover().await?);

    let id = engine.create_workflow(&plan).await?;
    println!(
        "{} {} ({})",
        style("Workflow").bold().cyan(),
        style(&id).bold(),
        plan.name
    );
    drive(engine, id, serve_port).await
}

pub async fn cmd_resume(config: AnvilConfig, id: Option<&str>) -> Result<ExitCode> {
    check_config(&config)?;
    let engine = Arc::new(open_engine(config)?);
    print_recovery(&engine.recover().await?);

    let id = match id {
        Some(id) => id.to_string(),
        None => match engine.latest_resumable().await? {
            Some(id) => id,
            None => {
                println!("Nothing to resume.");
                return Ok(ExitCode::SUCCESS);
            }
        },
    };
    println!("{} {}", style("Resuming").bold().cyan(), style(&id).bold());
    drive(engine, id, None).await
}

pub async fn cmd_cancel(config: AnvilConfig, id: &str) -> Result<ExitCode> {
    let engine = open_engine(config)?;
    engine.cancel(id).await?;
    println!("{} {}", style("Cancel signal sent to").yellow(), id);
    Ok(ExitCode::SUCCESS)
}

/// Refuse to dispatch anything under a config that fails validation.
fn check_config(config: &AnvilConfig) -> Result<()> {
    let problems = config.toml.validate();
    if !problems.is_empty() {
        anyhow::bail!("Invalid configuration:\n  - {}", problems.join("\n  - "));
    }
    Ok(())
}

fn print_recovery(reports: &[RecoveryReport]) {
    for report in reports.iter().filter(|r| !r.reset.is_empty()) {
        println!(
            "{} {}: re-queued {}",
            style("Recovered").yellow(),
            report.workflow_id,
            report.reset.join(", ")
        );
    }
}

/// Run a workflow in the foreground, printing its events as they happen.
/// Ctrl-C cancels the workflow rather than killing the process.
async fn drive(engine: Arc<Engine>, id: String, serve_port: Option<u16>) -> Result<ExitCode> {
    let shutdown = CancellationToken::new();
    let server = serve_port.map(|port| {
        let state = AppState {
            log: engine.log(),
            bus: engine.bus().clone(),
        };
        let host = engine.config().toml.server.host.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server::serve(&host, port, state, token).await {
                warn!(error = %e, "event stream server failed");
            }
        })
    });

    let printer = tokio::spawn(print_live(
        engine.subscribe(SubscriptionFilter::workflows([id.clone()])),
    ));
    let interrupt = {
        let engine = engine.clone();
        let id = id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("{}", style("Interrupted; canceling workflow...").yellow());
                if let Err(e) = engine.cancel(&id).await {
                    warn!(error = %e, "failed to cancel workflow");
                }
            }
        })
    };

    let result = engine.start(&id).await;

    interrupt.abort();
    shutdown.cancel();
    // Closing the bus ends the printer and any open streams once drained.
    engine.bus().shutdown();
    let _ = printer.await;
    if let Some(server) = server {
        let _ = server.await;
    }

    let outcome = result?;
    print_outcome(&outcome);
    Ok(ExitCode::from(outcome.exit_code()))
}

async fn print_live(mut subscription: Subscription) {
    while let Some(event) = subscription.recv().await {
        print_event(&event);
    }
}

fn print_outcome(outcome: &Outcome) {
    let status = style(outcome.status.to_string());
    let status = match outcome.status {
        WorkflowStatus::Succeeded => status.green().bold(),
        WorkflowStatus::FailedContinue | WorkflowStatus::Canceled => status.yellow().bold(),
        _ => status.red().bold(),
    };
    println!();
    println!("Workflow {} {}", outcome.workflow_id, status);
    if let Some(fatal) = &outcome.fatal {
        println!("  {} {}", style("Fatal:").red().bold(), fatal);
    }
    for warning in &outcome.warnings {
        println!("  {} {}", style("⚠").yellow(), warning);
    }
}
