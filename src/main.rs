use std::sync::Arc;

use anyhow::Context;
use ops_engine::config::EngineConfig;
use ops_engine::executor::TaskExecutor;
use ops_engine::retention::{self, FsArtifactStorage, RetentionManager};
use ops_engine::scheduler::{self, Scheduler, StaticLeadership};
use ops_engine::store::{Database, LibSqlBackend};
use ops_engine::task::TaskRegistry;
use ops_engine::task::builtin::register_builtin_tasks;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing first so configuration warnings are logged.
    // Keep the guard alive so buffered file logs flush.
    let log_dir = EngineConfig::log_dir_from_env();
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    let _log_guard = match &log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "ops-engine.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .init();
            None
        }
    };

    let config = EngineConfig::from_env();

    eprintln!("⚙️  Ops Engine v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Artifacts: {}", config.retention.storage_root.display());
    if let Some(dir) = &config.log_dir {
        eprintln!("   Logs: {}", dir.display());
    }

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );

    // ── Executor ─────────────────────────────────────────────────────────
    let executor = Arc::new(TaskExecutor::new(Arc::clone(&db), &config.executor));

    let registry = Arc::new(TaskRegistry::new());
    register_builtin_tasks(&registry).await;
    eprintln!("   Task types: {}", registry.list().await.join(", "));

    // ── Retention ────────────────────────────────────────────────────────
    let storage = Arc::new(FsArtifactStorage::new(config.retention.storage_root.clone()));
    let retention_manager = Arc::new(RetentionManager::new(
        Arc::clone(&db),
        storage,
        config.retention.clone(),
    ));

    // ── Startup Recovery ─────────────────────────────────────────────────
    let closed = executor.fail_pending_tasks().await?;
    if closed > 0 {
        eprintln!("   Recovered {} unfinished task records", closed);
    }

    let scheduler = Arc::new(Scheduler::new(
        config.scheduler.clone(),
        Arc::clone(&executor),
        Arc::clone(&registry),
        Arc::clone(&retention_manager),
        Arc::new(StaticLeadership::new(config.follower)),
    ));
    scheduler.reset_running_states().await?;

    // ── Background loops ─────────────────────────────────────────────────
    let _ticker = if config.scheduler.enabled {
        eprintln!(
            "   Scheduler: enabled (tick every {}s{})",
            config.scheduler.tick_interval.as_secs(),
            if config.follower { ", follower" } else { "" }
        );
        Some(scheduler::spawn_ticker(
            Arc::clone(&scheduler),
            config.scheduler.tick_interval,
        ))
    } else {
        eprintln!("   Scheduler: disabled");
        None
    };

    let _gc = retention::spawn_gc_sweeper(
        Arc::clone(&retention_manager),
        config.retention.gc_interval,
    );
    eprintln!(
        "   Retention: keep {} per schedule, GC every {}s\n",
        config.retention.default_min_to_retain,
        config.retention.gc_interval.as_secs()
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    let live = executor.live_runs().await;
    tracing::info!(live_runs = live.len(), "Shutting down");
    Ok(())
}
