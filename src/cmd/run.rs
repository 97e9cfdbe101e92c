//! One-shot run in the terminal: `conductor run <query>`.

use anyhow::{Result, bail};
use conductor::config::ConductorToml;
use conductor::registry::{ControlSignal, RunRequest};
use conductor::server::AppState;
use conductor::ui::{RunView, UiMode};
use conductor_common::{EventBody, RunMode, RunStatus};
use console::Term;

pub struct RunOptions {
    pub query: String,
    pub mode: RunMode,
    /// Comma-separated stage list replacing the planner's choice.
    pub stages: Option<String>,
    pub json: bool,
    pub verbose: bool,
}

pub async fn cmd_run(config: &ConductorToml, opts: RunOptions) -> Result<()> {
    let query = opts.query.trim();
    if query.is_empty() {
        bail!("Query cannot be empty");
    }

    let state = AppState::from_config(config)?;
    if let Some(stages) = &opts.stages {
        let steps: Vec<String> = stages.split(',').map(|s| s.trim().to_string()).collect();
        state.workflow.set_plan_override(&steps)?;
    }

    let registry = state.registry.clone();
    let (run_id, mut events) = registry.create_subscribed(RunRequest {
        query: query.to_string(),
        mode: opts.mode,
    });
    let mode = if opts.json { UiMode::Json } else { UiMode::Full };
    let view = RunView::new(mode, opts.verbose);

    let interrupt = {
        let registry = registry.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!(%run_id, "Interrupted, requesting stop");
                let _ = registry.signal(run_id, ControlSignal::Stop);
            }
        })
    };

    let can_prompt = !opts.json && Term::stdout().is_term();
    while let Some(event) = events.recv().await {
        view.handle_event(&event);
        match &event.body {
            EventBody::AwaitingSelection { node, options } => {
                let choice = if can_prompt && !options.is_empty() {
                    prompt_selection(node, options).await
                } else {
                    None
                };
                let index = choice.and_then(|i| i64::try_from(i).ok()).unwrap_or_else(|| {
                    view.notice(&format!("No operator input for {}, taking option 0", node));
                    0
                });
                registry.record_selection(run_id, node, index)?;
            }
            EventBody::Error {
                node: Some(node), ..
            } => {
                view.notice(&format!("Stage {} failed, stopping run", node));
                registry.signal(run_id, ControlSignal::Stop)?;
            }
            _ => {}
        }
    }
    interrupt.abort();
    view.finish(run_id);

    let snapshot = registry.get(run_id)?;
    if snapshot.status == RunStatus::Error {
        bail!("Run {} failed", run_id);
    }
    if let Some(failure) = snapshot.failure {
        bail!("Stage {} failed: {}", failure.node, failure.message);
    }
    Ok(())
}

async fn prompt_selection(node: &str, options: &[String]) -> Option<usize> {
    let prompt = format!("Choose an option for {}", node);
    let items = options.to_vec();
    let picked = tokio::task::spawn_blocking(move || {
        dialoguer::Select::new()
            .with_prompt(prompt)
            .items(&items)
            .default(0)
            .interact_opt()
    })
    .await;

    match picked {
        Ok(Ok(choice)) => choice,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Selection prompt failed");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "Selection prompt task failed");
            None
        }
    }
}
