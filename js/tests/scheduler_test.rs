//! Scheduler tests
//!
//! Drive a real JobScheduler against a temp-dir store with a fixed resource
//! probe and short intervals.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use jobscheduler::handler::{HandlerResult, handler_fn};
use jobscheduler::resources::{FixedProbe, ResourceSnapshot};
use jobscheduler::scheduler::{JobScheduler, SchedulerConfig, WorkerStatus};
use jobscheduler::state::{INTERRUPTED_MESSAGE, RecoveryPolicy, StateManager, recover};
use taskqueue::{NewTask, Priority, StoreConfig, TaskRecord, TaskStatus};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        workers: 2,
        poll_interval_ms: 20,
        idle_backoff_ms: 20,
        overload_backoff_ms: 50,
        shutdown_timeout_ms: 500,
        ..Default::default()
    }
}

fn idle_host() -> ResourceSnapshot {
    ResourceSnapshot {
        cpu_percent: 10.0,
        memory_percent: 20.0,
        disk_percent: 30.0,
    }
}

fn setup() -> (TempDir, StateManager) {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let state = StateManager::open(temp.path().join("task_queue.json"), StoreConfig::default())
        .expect("Failed to open state manager");
    (temp, state)
}

fn scheduler(state: &StateManager, config: SchedulerConfig) -> JobScheduler {
    JobScheduler::new(config, state.clone(), Arc::new(FixedProbe::new(idle_host())))
}

async fn wait_for_status(state: &StateManager, id: &str, status: TaskStatus) -> TaskRecord {
    let deadline = Instant::now() + WAIT;
    loop {
        let task = state.get_task(id).await.unwrap().expect("task exists");
        if task.status == status {
            return task;
        }
        assert!(
            Instant::now() < deadline,
            "task {} stuck in {} waiting for {}",
            id,
            task.status,
            status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_idle_workers(scheduler: &JobScheduler) {
    let deadline = Instant::now() + WAIT;
    while scheduler
        .worker_status()
        .iter()
        .any(|w| w.status == WorkerStatus::Busy)
    {
        assert!(Instant::now() < deadline, "workers never went idle");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Handler that appends each task's owner to `order`
fn recording_handler(
    order: Arc<Mutex<Vec<String>>>,
) -> impl jobscheduler::handler::TaskHandler + 'static {
    handler_fn(move |task: TaskRecord, _progress| {
        let order = order.clone();
        async move {
            order.lock().unwrap().push(task.owner);
            Ok(HandlerResult::success())
        }
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_runs_tasks_to_completion() {
    let (_temp, state) = setup();
    let scheduler = scheduler(&state, fast_config());
    scheduler.register_handler("echo", handler_fn(|_task, _progress| async { Ok(HandlerResult::success()) }));

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(state.add_task(NewTask::new("echo", format!("p{}", i))).await.unwrap());
    }

    scheduler.start(2);
    for id in &ids {
        let task = wait_for_status(&state, id, TaskStatus::Completed).await;
        assert_eq!(task.progress_percentage, 100.0);
        assert!(task.started_at.is_some());
        assert!(task.completed_at >= task.started_at);
        assert!(task.actual_duration_ms.is_some());
        assert!(task.error_message.is_none());
    }

    wait_for_idle_workers(&scheduler).await;
    let stats = scheduler.statistics().await.unwrap();
    assert!(stats.running);
    assert_eq!(stats.total_workers, 2);
    assert_eq!(stats.active_workers, 2);
    assert_eq!(stats.tasks_completed, 5);
    assert_eq!(stats.tasks_failed, 0);
    assert_eq!(stats.queue.count(TaskStatus::Completed), 5);
    assert!(stats.gate_open);

    scheduler.stop().await;
    assert!(!scheduler.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handler_failures_are_recorded_and_worker_survives() {
    let (_temp, state) = setup();
    let scheduler = scheduler(&state, fast_config());
    scheduler.register_handler(
        "reports_failure",
        handler_fn(|_task, _progress| async { Ok(HandlerResult::failure("source file missing")) }),
    );
    scheduler.register_handler(
        "returns_error",
        handler_fn(|_task, _progress| async { Err(eyre::eyre!("decoder crashed")) }),
    );
    scheduler.register_handler(
        "panics",
        handler_fn(|task: TaskRecord, _progress| async move {
            if task.retry_count == 0 {
                panic!("kaboom");
            }
            Ok(HandlerResult::success())
        }),
    );
    scheduler.register_handler("echo", handler_fn(|_task, _progress| async { Ok(HandlerResult::success()) }));

    let failure = state.add_task(NewTask::new("reports_failure", "p")).await.unwrap();
    let error = state.add_task(NewTask::new("returns_error", "p")).await.unwrap();
    let panic = state.add_task(NewTask::new("panics", "p")).await.unwrap();

    // one worker, so the same worker must survive all three
    scheduler.start(1);

    let task = wait_for_status(&state, &failure, TaskStatus::Failed).await;
    assert_eq!(task.error_message.as_deref(), Some("source file missing"));
    let task = wait_for_status(&state, &error, TaskStatus::Failed).await;
    assert!(task.error_message.unwrap().contains("decoder crashed"));
    let task = wait_for_status(&state, &panic, TaskStatus::Failed).await;
    assert!(task.error_message.unwrap().contains("kaboom"));
    assert!(task.completed_at.is_some());

    let after = state.add_task(NewTask::new("echo", "p")).await.unwrap();
    wait_for_status(&state, &after, TaskStatus::Completed).await;

    wait_for_idle_workers(&scheduler).await;
    let workers = scheduler.worker_status();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].tasks_failed, 3);
    assert_eq!(workers[0].tasks_completed, 1);

    // a panicked task can be retried
    assert!(state.retry_task(&panic).await.unwrap());
    let task = wait_for_status(&state, &panic, TaskStatus::Completed).await;
    assert_eq!(task.retry_count, 1);

    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_resource_gate_defers_then_resumes() {
    let (_temp, state) = setup();
    let probe = Arc::new(FixedProbe::new(ResourceSnapshot {
        cpu_percent: 97.0,
        ..idle_host()
    }));
    let scheduler = JobScheduler::new(fast_config(), state.clone(), probe.clone());
    scheduler.register_handler("echo", handler_fn(|_task, _progress| async { Ok(HandlerResult::success()) }));

    let id = state.add_task(NewTask::new("echo", "p")).await.unwrap();
    scheduler.start(2);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let task = state.get_task(&id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    let stats = scheduler.statistics().await.unwrap();
    assert!(!stats.gate_open);
    assert_eq!(stats.resources.cpu_percent, 97.0);

    probe.set(idle_host());
    wait_for_status(&state, &id, TaskStatus::Completed).await;
    assert!(scheduler.statistics().await.unwrap().gate_open);

    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_worker_runs_in_priority_order() {
    let (_temp, state) = setup();
    let order = Arc::new(Mutex::new(Vec::new()));
    let scheduler = scheduler(&state, fast_config());
    scheduler.register_handler("record", recording_handler(order.clone()));

    let mut ids = Vec::new();
    for (owner, priority) in [
        ("low", Priority::Low),
        ("critical", Priority::Critical),
        ("normal-1", Priority::Normal),
        ("high", Priority::High),
        ("normal-2", Priority::Normal),
    ] {
        ids.push(
            state
                .add_task(NewTask::new("record", owner).with_priority(priority))
                .await
                .unwrap(),
        );
    }

    scheduler.start(1);
    for id in &ids {
        wait_for_status(&state, id, TaskStatus::Completed).await;
    }
    scheduler.stop().await;

    assert_eq!(
        *order.lock().unwrap(),
        vec!["critical", "high", "normal-1", "normal-2", "low"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dependency_pipeline_runs_in_order() {
    let (_temp, state) = setup();
    let order = Arc::new(Mutex::new(Vec::new()));
    let scheduler = scheduler(&state, fast_config());
    scheduler.register_handler("record", recording_handler(order.clone()));

    let extract = state.add_task(NewTask::new("record", "extract")).await.unwrap();
    let transcribe = state
        .add_task(NewTask::new("record", "transcribe").with_dependency(&extract))
        .await
        .unwrap();
    let mux = state
        .add_task(
            NewTask::new("record", "mux")
                .with_priority(Priority::Critical)
                .with_dependency(&transcribe),
        )
        .await
        .unwrap();

    scheduler.start(3);
    let first = wait_for_status(&state, &extract, TaskStatus::Completed).await;
    let second = wait_for_status(&state, &transcribe, TaskStatus::Completed).await;
    let third = wait_for_status(&state, &mux, TaskStatus::Completed).await;
    scheduler.stop().await;

    assert_eq!(*order.lock().unwrap(), vec!["extract", "transcribe", "mux"]);
    assert!(second.started_at >= first.completed_at);
    assert!(third.started_at >= second.completed_at);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unhandled_task_type_is_never_claimed() {
    let (_temp, state) = setup();
    let scheduler = scheduler(&state, fast_config());

    let id = state.add_task(NewTask::new("no_such_handler", "p")).await.unwrap();
    scheduler.start(2);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let task = state.get_task(&id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_while_running_stays_cancelled() {
    let (_temp, state) = setup();
    let scheduler = scheduler(&state, fast_config());
    scheduler.register_handler(
        "slow",
        handler_fn(|_task, progress| async move {
            for step in 1..=100 {
                if progress.is_cancelled().await {
                    return Ok(HandlerResult::failure("cancelled"));
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                progress.report(step as f64).await;
            }
            Ok(HandlerResult::success())
        }),
    );

    let id = state.add_task(NewTask::new("slow", "p")).await.unwrap();
    scheduler.start(1);
    wait_for_status(&state, &id, TaskStatus::Running).await;

    assert!(state.cancel_task(&id).await.unwrap());
    wait_for_idle_workers(&scheduler).await;

    let task = state.get_task(&id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.error_message.is_none());

    // The refused outcome is not counted anywhere
    let stats = scheduler.statistics().await.unwrap();
    assert_eq!(stats.tasks_completed, 0);
    assert_eq!(stats.tasks_failed, 0);
    for worker in scheduler.worker_status() {
        assert_eq!(worker.tasks_completed + worker.tasks_failed, 0);
    }
    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_start_and_stop_are_idempotent() {
    let (_temp, state) = setup();
    let scheduler = scheduler(&state, fast_config());

    scheduler.stop().await;
    scheduler.start(3);
    scheduler.start(3);
    assert!(scheduler.is_running());

    let deadline = Instant::now() + WAIT;
    while scheduler.worker_status().len() < 3 {
        assert!(Instant::now() < deadline, "pool never reached target");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(scheduler.worker_status().len(), 3);

    scheduler.stop().await;
    scheduler.stop().await;
    assert!(!scheduler.is_running());
    assert!(scheduler.worker_status().is_empty());

    // restart after stop
    scheduler.start(1);
    let deadline = Instant::now() + WAIT;
    while scheduler.worker_status().is_empty() {
        assert!(Instant::now() < deadline, "pool never restarted");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_is_bounded_and_recovery_fails_interrupted_task() {
    let (_temp, state) = setup();
    let scheduler = scheduler(
        &state,
        SchedulerConfig {
            shutdown_timeout_ms: 200,
            ..fast_config()
        },
    );
    scheduler.register_handler(
        "stuck",
        handler_fn(|_task, _progress| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(HandlerResult::success())
        }),
    );

    let id = state.add_task(NewTask::new("stuck", "p")).await.unwrap();
    scheduler.start(1);
    wait_for_status(&state, &id, TaskStatus::Running).await;

    let started = Instant::now();
    scheduler.stop().await;
    assert!(started.elapsed() < Duration::from_secs(5));

    let task = state.get_task(&id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Running);

    let stats = recover(&state, RecoveryPolicy::Fail).await.unwrap();
    assert_eq!(stats.failed, 1);
    let task = state.get_task(&id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_builtin_handler_runs_with_stage_delay_override() {
    let (_temp, state) = setup();
    let scheduler = scheduler(&state, fast_config());
    assert!(scheduler.task_types().contains(&"audio_extraction".to_string()));

    let id = state
        .add_task(NewTask::new("audio_extraction", "p").with_config(serde_json::json!({ "stage_delay_ms": 1 })))
        .await
        .unwrap();
    scheduler.start(1);
    let task = wait_for_status(&state, &id, TaskStatus::Completed).await;
    assert_eq!(task.progress_percentage, 100.0);
    scheduler.stop().await;
}
