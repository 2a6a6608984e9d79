use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use worker_swarm::config::SwarmConfig;
use worker_swarm::llm::{LlmConfig, create_provider};
use worker_swarm::tools::ProjectFiles;
use worker_swarm::worker::{TaskRequest, WorkerRole, WorkerSpec};
use worker_swarm::Swarm;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let task = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if task.trim().is_empty() {
        eprintln!("Usage: worker-swarm <task...>");
        std::process::exit(2);
    }

    let config = SwarmConfig::from_env().context("reading SWARM_* configuration")?;
    let llm_config = LlmConfig::from_env().context("reading SWARM_LLM_* configuration")?;
    let role: WorkerRole = std::env::var("SWARM_ROLE")
        .ok()
        .map(|r| r.parse())
        .transpose()
        .map_err(|e: String| anyhow::anyhow!(e))?
        .unwrap_or(WorkerRole::Autonomous);
    let auto_debug = std::env::var("SWARM_AUTO_DEBUG")
        .map(|v| !matches!(v.trim().to_lowercase().as_str(), "0" | "false" | "no" | "off"))
        .unwrap_or(true);

    ProjectFiles::new(config.project_root.clone())
        .ensure_root()
        .await
        .with_context(|| format!("creating project root {}", config.project_root.display()))?;

    eprintln!("🐝 Worker Swarm v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Project root: {}", config.project_root.display());
    eprintln!("   Model: {} at {}", llm_config.model, llm_config.endpoint);
    eprintln!("   Role: {role}, auto-debug: {auto_debug}\n");

    let provider = create_provider(&llm_config)?;
    let max_iterations = config.default_max_iterations;
    let swarm = Swarm::new(config);

    let spec = WorkerSpec::new("worker-1", &llm_config.model, &llm_config.endpoint).with_role(role);
    let worker = swarm.spawn_worker(spec, provider).await;

    let request = TaskRequest::new(task)
        .auto_debug(auto_debug)
        .max_iterations(max_iterations);
    let outcome = swarm
        .assign_task(worker.id, request)
        .await
        .context("task aborted")?;

    println!("{}", outcome.result);
    eprintln!(
        "\nTask {} after {} iteration(s), {} operation(s)",
        outcome.completion,
        outcome.iterations,
        outcome.operations.len()
    );
    for record in outcome.operations.iter().filter(|r| r.is_failure()) {
        eprintln!("  failed: {}", record.operation);
    }

    review_permissions(&swarm).await?;
    Ok(())
}

/// Ask about each pending permission request on stdin.
async fn review_permissions(swarm: &Swarm) -> anyhow::Result<()> {
    let pending = swarm.list_pending().await;
    if pending.is_empty() {
        return Ok(());
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stderr = tokio::io::stderr();
    for request in pending {
        stderr
            .write_all(
                format!(
                    "\n{} wants to run `{}`\nAllow? [y/N] ",
                    request.description, request.command
                )
                .as_bytes(),
            )
            .await?;
        stderr.flush().await?;

        let answer = stdin.next_line().await?.unwrap_or_default();
        if matches!(answer.trim().to_lowercase().as_str(), "y" | "yes") {
            let approved = swarm.grant(request.id).await?;
            eprintln!("exit {}:\n{}", approved.result.exit_code, approved.result.output);
        } else {
            swarm.deny(request.id).await?;
            eprintln!("denied");
        }
    }
    Ok(())
}

/// stderr logging, plus a daily-rolling file when `SWARM_LOG_DIR` is set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match std::env::var("SWARM_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "worker-swarm.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter())
                .with(stderr_layer)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false),
                )
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter())
                .with(stderr_layer)
                .init();
            None
        }
    }
}
