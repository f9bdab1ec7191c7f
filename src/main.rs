//! Hive - 智能体编排运行时命令行
//!
//! ```bash
//! hive run "disk is full on web-1"
//! hive confirm <run_id> yes
//! hive resume <run_id>
//! hive batch "task one" "task two"
//! ```
//!
//! 配置文件用 --config 或 HIVE_CONFIG 指定；结果以 JSON 打印到 stdout。

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use hive::cli::{Cli, Commands};
use hive::config::load_config;
use hive::core::{ShutdownManager, ShutdownReason};
use hive::observability;
use hive::queue::{InMemoryTaskQueue, TaskInput, TaskQueue, WorkerPool};
use hive::RuntimeBuilder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    observability::init(cli.log_level());

    let cfg = load_config(cli.config_path()).context("Failed to load config")?;
    let runtime = RuntimeBuilder::from_config(&cfg)
        .await
        .context("Failed to assemble runtime")?
        .build()
        .context("Failed to build runtime")?;

    let result = match &cli.command {
        Commands::Run { task } => runtime.start(task).await?,
        Commands::Confirm { run_id, reply } => runtime.confirm(run_id, reply).await?,
        Commands::Resume { run_id } => runtime.resume(run_id).await?,
        Commands::Batch { tasks } => {
            return run_batch(runtime, cfg.worker_config(), tasks).await;
        }
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// 把任务放入内存队列，由 worker 池执行，全部结束后打印任务记录
async fn run_batch(
    runtime: hive::Runtime,
    workers: hive::queue::WorkerConfig,
    tasks: &[String],
) -> anyhow::Result<()> {
    let queue = Arc::new(InMemoryTaskQueue::new());
    let mut notifications = queue.subscribe();
    let mut ids = Vec::with_capacity(tasks.len());
    for task in tasks {
        ids.push(queue.submit(TaskInput::start(task.clone())).await?);
    }

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let pool = WorkerPool::new(queue.clone(), Arc::new(runtime), workers);
    let handles = pool.start(&shutdown);

    let mut finished = 0;
    while finished < ids.len() && !shutdown.is_shutdown() {
        tokio::select! {
            n = notifications.recv() => {
                n.context("notification channel closed")?;
                finished += 1;
            }
            _ = shutdown.wait_for_shutdown() => break,
        }
    }
    let panicked = shutdown.drain(ShutdownReason::QueueDrained, handles).await;
    if panicked > 0 {
        anyhow::bail!("{panicked} worker(s) exited abnormally");
    }

    for id in &ids {
        if let Some(record) = queue.get(id).await? {
            println!("{}", serde_json::to_string(&record)?);
        }
    }
    Ok(())
}
