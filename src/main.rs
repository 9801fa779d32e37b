use std::path::Path;
use std::sync::Arc;

use issue_dispatch::agent::{AgentRunner, CommandAgent};
use issue_dispatch::config::DispatchConfig;
use issue_dispatch::shutdown::install_shutdown_handler;
use issue_dispatch::store::{JobStore, LibSqlBackend};
use issue_dispatch::worker::{WorkerDeps, WorkerPool, spawn_reaper};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = DispatchConfig::from_env()?;

    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("🤖 Issue Dispatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!(
        "   Agent: {} {}",
        config.agent_binary,
        config.agent_args.join(" ")
    );
    eprintln!(
        "   Workers: {} (timeout {}s, {} attempts)",
        config.worker_count,
        config.agent_timeout.as_secs(),
        config.max_attempts
    );

    // ── Database ─────────────────────────────────────────────────────────
    let db = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await?
            .with_default_max_attempts(config.max_attempts),
    );
    let counts = db.job_counts().await?;
    tracing::info!(
        pending = counts.pending,
        running = counts.running,
        completed = counts.completed,
        failed = counts.failed,
        "Job queue opened"
    );

    let shutdown = install_shutdown_handler()?;

    // ── Workers ──────────────────────────────────────────────────────────
    let agent: Arc<dyn AgentRunner> = Arc::new(CommandAgent::from_config(&config));
    let deps = WorkerDeps::new(db.clone(), db.clone(), agent, &config);
    let pool = WorkerPool::spawn(config.worker_count, deps, &shutdown);

    // ── Reaper ───────────────────────────────────────────────────────────
    // Its first sweep also recovers jobs left running by a previous process.
    let reaper = spawn_reaper(
        db.clone(),
        db.clone(),
        config.reaper_interval,
        config.reaper_stale_after,
        shutdown.clone(),
    );

    shutdown.cancelled().await;

    let report = pool.shutdown(config.shutdown_grace).await;
    if let Err(e) = reaper.await {
        tracing::warn!(error = %e, "Reaper task ended abnormally");
    }
    tracing::info!(
        drained = report.drained,
        aborted = report.aborted,
        "Shutdown complete"
    );
    Ok(())
}

/// Console logging, plus a daily rolling file when `log_dir` is set.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "issue-dispatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(false))
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}
