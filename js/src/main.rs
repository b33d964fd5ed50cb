//! JobScheduler CLI entry point

use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, FromArgMatches};
use colored::{ColoredString, Colorize};
use eyre::{Context, Result};
use tracing::{debug, info, warn};

use jobscheduler::cli::{Cli, Command, OutputFormat, get_log_path};
use jobscheduler::config::Config;
use jobscheduler::resources::ProcProbe;
use jobscheduler::scheduler::{JobScheduler, SchedulerStatistics};
use jobscheduler::state::{StateManager, recover};
use taskqueue::{DependencyReport, NewTask, QueueStatistics, Store, TaskFilter, TaskRecord, TaskStatus};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // CLI --log-level > config file > INFO
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cmd = Cli::command().after_help(format!("Logs are written to: {}", get_log_path().display()));
    let cli = Cli::from_arg_matches(&cmd.get_matches())?;

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    info!(queue = %config.queue_path().display(), "JobScheduler loaded config");

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Add {
            task_type,
            owner,
            priority,
            depends_on,
            tags,
            estimate,
            max_retries,
            input,
            output_dir,
            task_config,
        } => {
            let mut task = NewTask::new(task_type, owner)
                .with_priority(priority)
                .with_dependencies(depends_on)
                .with_tags(tags);
            if let Some(secs) = estimate {
                task = task.with_estimated_duration(Duration::from_secs(secs));
            }
            if let Some(max_retries) = max_retries {
                task = task.with_max_retries(max_retries);
            }
            if let Some(input) = input {
                task = task.with_input_file(input);
            }
            if let Some(output_dir) = output_dir {
                task = task.with_output_dir(output_dir);
            }
            if let Some(raw) = task_config {
                let value = serde_json::from_str(&raw).context("--task-config is not valid JSON")?;
                task = task.with_config(value);
            }
            cmd_add(&config, task)
        }
        Command::Get { id, format } => cmd_get(&config, &id, format),
        Command::List {
            status,
            owner,
            task_type,
            tag,
            limit,
            format,
        } => {
            let mut filter = TaskFilter::new();
            if let Some(status) = status {
                filter = filter.status(status);
            }
            if let Some(owner) = owner {
                filter = filter.owner(owner);
            }
            if let Some(task_type) = task_type {
                filter = filter.task_type(task_type);
            }
            if let Some(tag) = tag {
                filter = filter.tag(tag);
            }
            cmd_list(&config, &filter, limit, format)
        }
        Command::Cancel { id } => cmd_cancel(&config, &id),
        Command::Retry { id } => cmd_retry(&config, &id),
        Command::Stats { format } => cmd_stats(&config, format),
        Command::Purge {
            statuses,
            older_than_days,
        } => cmd_purge(&config, statuses, older_than_days),
        Command::Validate { format } => cmd_validate(&config, format),
        Command::Run { workers, until_idle } => cmd_run(&config, workers, until_idle).await,
    }
}

/// Open the queue for writing; safe alongside a running `js run`
fn open_store(config: &Config) -> Result<Store> {
    Store::open_with(config.queue_path(), config.store_config())
        .with_context(|| format!("Failed to open task queue {}", config.queue_path().display()))
}

/// Open a lock-free snapshot for read commands
fn open_snapshot(config: &Config) -> Result<Store> {
    Store::open_read_only(config.queue_path(), config.store_config())
        .with_context(|| format!("Failed to read task queue {}", config.queue_path().display()))
}

fn cmd_add(config: &Config, task: NewTask) -> Result<()> {
    debug!(task_type = %task.task_type, "cmd_add: called");
    let mut store = open_store(config)?;
    let id = store.add(task)?;
    println!("{}", id);
    Ok(())
}

fn cmd_get(config: &Config, id: &str, format: OutputFormat) -> Result<()> {
    debug!(%id, %format, "cmd_get: called");
    let store = open_snapshot(config)?;
    let Some(task) = store.get(id) else {
        eyre::bail!("Task not found: {}", id);
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&task)?),
        OutputFormat::Table => print_task_table(std::slice::from_ref(&task)),
        OutputFormat::Text => {
            println!("{}", task.id.bold());
            println!("  type:      {}", task.task_type);
            println!("  owner:     {}", task.owner);
            println!("  status:    {}", colorize_status(task.status, task.status.as_str()));
            println!("  priority:  {}", task.priority);
            println!("  progress:  {:.1}%", task.progress_percentage);
            println!("  retries:   {}/{}", task.retry_count, task.max_retries);
            println!("  created:   {}", format_timestamp(task.created_at));
            if let Some(started) = task.started_at {
                println!("  started:   {}", format_timestamp(started));
            }
            if let Some(completed) = task.completed_at {
                println!("  finished:  {}", format_timestamp(completed));
            }
            if let Some(ms) = task.actual_duration_ms {
                println!("  duration:  {}", format_duration(Duration::from_millis(ms)));
            }
            if !task.dependencies.is_empty() {
                let deps: Vec<&str> = task.dependencies.iter().map(String::as_str).collect();
                println!("  depends:   {}", deps.join(", "));
            }
            if !task.tags.is_empty() {
                let tags: Vec<&str> = task.tags.iter().map(String::as_str).collect();
                println!("  tags:      {}", tags.join(", "));
            }
            if task.status == TaskStatus::Pending {
                println!("  queue eta: {}", format_duration(store.estimate_queue_time(id)));
            }
            if let Some(error) = &task.error_message {
                println!("  error:     {}", error.red());
            }
        }
    }
    Ok(())
}

fn cmd_list(config: &Config, filter: &TaskFilter, limit: Option<usize>, format: OutputFormat) -> Result<()> {
    debug!(?filter, ?limit, %format, "cmd_list: called");
    let store = open_snapshot(config)?;
    let mut tasks = store.list(filter);
    if let Some(limit) = limit {
        tasks.truncate(limit);
    }

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&tasks)?),
        OutputFormat::Table | OutputFormat::Text => {
            if tasks.is_empty() {
                println!("No tasks found");
            } else {
                print_task_table(&tasks);
            }
        }
    }
    Ok(())
}

fn print_task_table(tasks: &[TaskRecord]) {
    println!(
        "{:<38} {:<10} {:<9} {:<22} {:<16} {:>8}",
        "ID", "STATUS", "PRIORITY", "TYPE", "OWNER", "PROGRESS"
    );
    for task in tasks {
        let status = format!("{:<10}", task.status.as_str());
        println!(
            "{:<38} {} {:<9} {:<22} {:<16} {:>7.1}%",
            task.id,
            colorize_status(task.status, &status),
            task.priority.as_str(),
            task.task_type,
            task.owner,
            task.progress_percentage
        );
    }
}

fn cmd_cancel(config: &Config, id: &str) -> Result<()> {
    debug!(%id, "cmd_cancel: called");
    let mut store = open_store(config)?;
    if store.cancel(id)? {
        println!("Cancelled {}", id);
        Ok(())
    } else {
        eyre::bail!("Task {} not found or already finished", id)
    }
}

fn cmd_retry(config: &Config, id: &str) -> Result<()> {
    debug!(%id, "cmd_retry: called");
    let mut store = open_store(config)?;
    if store.retry(id)? {
        println!("Requeued {} for retry", id);
        Ok(())
    } else {
        eyre::bail!("Task {} not found, not failed, or out of retries", id)
    }
}

fn cmd_stats(config: &Config, format: OutputFormat) -> Result<()> {
    debug!(%format, "cmd_stats: called");
    let store = open_snapshot(config)?;
    let stats = store.statistics();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
        OutputFormat::Text | OutputFormat::Table => print_queue_stats(&stats),
    }
    Ok(())
}

fn print_queue_stats(stats: &QueueStatistics) {
    println!("{}", "Queue".bold());
    println!("  total:          {}", stats.total);
    for status in TaskStatus::ALL {
        let count = stats.count(status);
        if count > 0 {
            println!("  {:<15} {}", format!("{}:", status), colorize_status(status, &count.to_string()));
        }
    }
    println!("  success rate:   {:.1}%", stats.success_rate * 100.0);
    println!(
        "  avg duration:   {}",
        format_duration(Duration::from_millis(stats.average_duration_ms as u64))
    );
    println!(
        "  avg wait:       {}",
        format_duration(Duration::from_millis(stats.average_wait_ms as u64))
    );
    if stats.stale_pending > 0 {
        println!("  stale pending:  {}", stats.stale_pending.to_string().yellow());
    }
    if stats.blocked > 0 {
        println!("  blocked:        {}", stats.blocked.to_string().red());
    }
    if !stats.by_type.is_empty() {
        println!("{}", "By type".bold());
        for (task_type, count) in &stats.by_type {
            println!("  {:<22} {}", task_type, count);
        }
    }
}

fn cmd_purge(config: &Config, statuses: Vec<TaskStatus>, older_than_days: u64) -> Result<()> {
    let statuses = if statuses.is_empty() {
        vec![TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Cancelled]
    } else {
        statuses
    };
    debug!(?statuses, older_than_days, "cmd_purge: called");

    let mut store = open_store(config)?;
    let removed = store.purge_older_than(&statuses, Duration::from_secs(older_than_days.saturating_mul(86_400)))?;
    println!("Purged {} task(s)", removed);
    Ok(())
}

fn cmd_validate(config: &Config, format: OutputFormat) -> Result<()> {
    debug!(%format, "cmd_validate: called");
    let store = open_snapshot(config)?;
    let report = store.validate_dependencies();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text | OutputFormat::Table => print_dependency_report(&report),
    }

    if report.is_healthy() {
        Ok(())
    } else {
        eyre::bail!("Dependency problems found")
    }
}

fn print_dependency_report(report: &DependencyReport) {
    if report.is_healthy() {
        println!("{}", "Dependency graph OK".green());
        return;
    }
    for cycle in &report.cycles {
        println!("{} {}", "cycle:".red(), cycle.join(" -> "));
    }
    for (id, deps) in &report.missing {
        let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
        println!("{} {} depends on unknown {}", "missing:".yellow(), id, deps.join(", "));
    }
    for (id, deps) in &report.dead {
        let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
        println!("{} {} depends on {} which can never complete", "dead:".red(), id, deps.join(", "));
    }
    if !report.blocked.is_empty() {
        println!("{} {} task(s) can never run", "blocked:".red(), report.blocked.len());
    }
}

async fn cmd_run(config: &Config, workers: Option<usize>, until_idle: bool) -> Result<()> {
    let target = workers.unwrap_or(config.scheduler.workers);
    debug!(target, until_idle, "cmd_run: called");

    let state = StateManager::open(config.queue_path(), config.store_config())
        .with_context(|| format!("Failed to open task queue {}", config.queue_path().display()))?;

    let recovered = recover(&state, config.recovery.policy).await?;
    if recovered.total() > 0 {
        println!("Recovered interrupted tasks: {}", recovered);
    }

    let scheduler = JobScheduler::new(config.scheduler.clone(), state.clone(), Arc::new(ProcProbe::new()));
    scheduler.start(target);
    println!(
        "Scheduler running: {} worker(s), handlers: {}",
        target,
        scheduler.task_types().join(", ")
    );

    if until_idle {
        tokio::select! {
            result = wait_until_idle(&scheduler, config.scheduler.poll_interval()) => result?,
            result = wait_for_signal() => result?,
        }
    } else {
        wait_for_signal().await?;
    }

    scheduler.stop().await;
    let stats = scheduler.statistics().await?;
    print_run_summary(&stats);
    state.shutdown().await?;
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received, shutting down"),
        _ = sigterm.recv() => warn!("SIGTERM received, shutting down"),
    }
    Ok(())
}

/// Poll until no worker is busy and no task could be claimed
async fn wait_until_idle(scheduler: &JobScheduler, interval: Duration) -> Result<()> {
    loop {
        tokio::time::sleep(interval).await;
        if !has_runnable_work(scheduler).await? {
            info!("Queue idle, stopping");
            return Ok(());
        }
    }
}

async fn has_runnable_work(scheduler: &JobScheduler) -> Result<bool> {
    let stats = scheduler.statistics().await?;
    if stats.busy_workers > 0 || stats.queue.count(TaskStatus::Queued) > 0 {
        return Ok(true);
    }

    let tasks = scheduler.state().list_tasks(TaskFilter::new()).await?;
    let types: HashSet<String> = scheduler.task_types().into_iter().collect();
    let completed: HashSet<&str> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .map(|t| t.id.as_str())
        .collect();

    Ok(tasks.iter().any(|t| {
        t.status == TaskStatus::Pending
            && types.contains(&t.task_type)
            && t.dependencies.iter().all(|d| completed.contains(d.as_str()))
    }))
}

fn print_run_summary(stats: &SchedulerStatistics) {
    println!(
        "Scheduler stopped: {} completed, {} failed",
        stats.tasks_completed.to_string().green(),
        stats.tasks_failed.to_string().red()
    );
    print_queue_stats(&stats.queue);
}

fn colorize_status(status: TaskStatus, text: &str) -> ColoredString {
    match status {
        TaskStatus::Pending => text.normal(),
        TaskStatus::Queued => text.cyan(),
        TaskStatus::Running => text.blue(),
        TaskStatus::Completed => text.green(),
        TaskStatus::Failed => text.red(),
        TaskStatus::Cancelled => text.yellow(),
    }
}

fn format_timestamp(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}
