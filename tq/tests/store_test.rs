//! Store behaviour through the public API

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use proptest::prelude::*;
use taskqueue::{Capabilities, NewTask, Priority, Store, StoreConfig, TaskStatus};
use tempfile::{TempDir, tempdir};

fn open_store() -> (TempDir, Store) {
    let dir = tempdir().expect("tempdir");
    let store = Store::open(dir.path()).expect("open store");
    (dir, store)
}

fn claim(store: &mut Store) -> Option<String> {
    store.next_eligible(&Capabilities::Any).unwrap().map(|t| t.id)
}

fn finish(store: &mut Store, id: &str, status: TaskStatus) {
    assert!(store.update_status(id, TaskStatus::Running, None, None).unwrap());
    assert!(store.update_status(id, status, Some(100.0), None).unwrap());
}

#[test]
fn test_priority_then_age_ordering() {
    let (_dir, mut store) = open_store();
    let a = store.add(NewTask::new("t", "p").with_priority(Priority::Low)).unwrap();
    let b = store.add(NewTask::new("t", "p").with_priority(Priority::High)).unwrap();
    let c = store.add(NewTask::new("t", "p").with_priority(Priority::High)).unwrap();

    assert_eq!(claim(&mut store).as_deref(), Some(b.as_str()));
    assert_eq!(claim(&mut store).as_deref(), Some(c.as_str()));
    assert_eq!(claim(&mut store).as_deref(), Some(a.as_str()));
    assert_eq!(claim(&mut store), None);
}

#[test]
fn test_claim_moves_to_queued() {
    let (_dir, mut store) = open_store();
    let id = store.add(NewTask::new("t", "p")).unwrap();
    let claimed = store.next_eligible(&Capabilities::Any).unwrap().unwrap();

    assert_eq!(claimed.id, id);
    assert_eq!(claimed.status, TaskStatus::Queued);
    assert_eq!(store.get(&id).unwrap().status, TaskStatus::Queued);
}

#[test]
fn test_capabilities_restrict_candidates() {
    let (_dir, mut store) = open_store();
    let audio = store.add(NewTask::new("audio_extraction", "p")).unwrap();
    let video = store
        .add(NewTask::new("video_transcoding", "p").with_priority(Priority::Critical))
        .unwrap();

    let caps = Capabilities::only(["audio_extraction"]);
    assert_eq!(store.next_eligible(&caps).unwrap().map(|t| t.id), Some(audio));
    assert_eq!(store.next_eligible(&caps).unwrap(), None);
    assert_eq!(claim(&mut store), Some(video));
}

#[test]
fn test_dependency_gating() {
    let (_dir, mut store) = open_store();
    let x = store.add(NewTask::new("t", "p")).unwrap();
    let y = store
        .add(NewTask::new("t", "p").with_priority(Priority::Critical).with_dependency(&x))
        .unwrap();

    assert_eq!(claim(&mut store).as_deref(), Some(x.as_str()));
    assert_eq!(claim(&mut store), None, "y waits for x");

    finish(&mut store, &x, TaskStatus::Completed);
    assert_eq!(claim(&mut store), Some(y));
}

#[test]
fn test_failed_dependency_blocks() {
    let (_dir, mut store) = open_store();
    let x = store.add(NewTask::new("t", "p").with_max_retries(0)).unwrap();
    let y = store.add(NewTask::new("t", "p").with_dependency(&x)).unwrap();
    let ghost = store.add(NewTask::new("t", "p").with_dependency("no-such-task")).unwrap();

    claim(&mut store);
    finish(&mut store, &x, TaskStatus::Failed);
    assert_eq!(claim(&mut store), None);

    let report = store.validate_dependencies();
    assert!(report.blocked.contains(&y));
    assert!(report.blocked.contains(&ghost));
    assert!(report.missing[&ghost].contains("no-such-task"));
    assert_eq!(store.statistics().blocked, 2);
}

#[test]
fn test_chain_on_unknown_id_is_blocked() {
    let (_dir, mut store) = open_store();
    let a = store.add(NewTask::new("t", "p").with_dependency("later")).unwrap();
    let b = store.add(NewTask::new("t", "p").with_dependency(&a)).unwrap();

    assert_eq!(claim(&mut store), None);
    let report = store.validate_dependencies();
    assert!(report.cycles.is_empty());
    assert!(report.blocked.contains(&a));
    assert!(report.blocked.contains(&b));
}

#[test]
fn test_retry_is_bounded() {
    let (_dir, mut store) = open_store();
    let id = store.add(NewTask::new("t", "p")).unwrap();

    for attempt in 1..=3 {
        claim(&mut store);
        finish(&mut store, &id, TaskStatus::Failed);
        assert!(store.retry(&id).unwrap(), "retry {attempt} allowed");

        let record = store.get(&id).unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.retry_count, attempt);
        assert!(record.started_at.is_none());
        assert!(record.completed_at.is_none());
        assert!(record.error_message.is_none());
        assert_eq!(record.progress_percentage, 0.0);
    }

    claim(&mut store);
    finish(&mut store, &id, TaskStatus::Failed);
    assert!(!store.retry(&id).unwrap());
    assert_eq!(store.get(&id).unwrap().retry_count, 3);
}

#[test]
fn test_retry_requires_failed_status() {
    let (_dir, mut store) = open_store();
    let id = store.add(NewTask::new("t", "p")).unwrap();
    assert!(!store.retry(&id).unwrap());

    finish(&mut store, &id, TaskStatus::Completed);
    assert!(!store.retry(&id).unwrap());
}

#[test]
fn test_terminal_timestamps_are_idempotent() {
    let (_dir, mut store) = open_store();
    let id = store.add(NewTask::new("t", "p")).unwrap();
    finish(&mut store, &id, TaskStatus::Completed);
    let first = store.get(&id).unwrap();

    thread::sleep(Duration::from_millis(5));
    assert!(store.update_status(&id, TaskStatus::Completed, None, None).unwrap());
    let second = store.get(&id).unwrap();

    assert_eq!(first.completed_at, second.completed_at);
    assert_eq!(first.actual_duration_ms, second.actual_duration_ms);
    assert!(!store.update_status(&id, TaskStatus::Failed, None, None).unwrap());
}

#[test]
fn test_actual_duration_matches_timestamps() {
    let (_dir, mut store) = open_store();
    let id = store.add(NewTask::new("t", "p")).unwrap();
    store.update_status(&id, TaskStatus::Running, None, None).unwrap();
    thread::sleep(Duration::from_millis(10));
    store.update_status(&id, TaskStatus::Completed, None, None).unwrap();

    let record = store.get(&id).unwrap();
    let started = record.started_at.unwrap();
    let completed = record.completed_at.unwrap();
    assert!(started >= record.created_at);
    assert!(completed >= started);
    assert_eq!(record.actual_duration_ms, Some((completed - started) as u64));
}

#[test]
fn test_lifecycle_scenario() {
    let (_dir, mut store) = open_store();
    let a = store
        .add(NewTask::new("audio_extraction", "proj").with_priority(Priority::Low))
        .unwrap();
    let b = store
        .add(NewTask::new("audio_extraction", "proj").with_priority(Priority::High))
        .unwrap();
    let c = store
        .add(NewTask::new("audio_extraction", "proj").with_dependency(&b))
        .unwrap();

    assert_eq!(claim(&mut store).as_deref(), Some(b.as_str()));
    assert_eq!(claim(&mut store).as_deref(), Some(a.as_str()));
    assert_eq!(claim(&mut store), None);

    finish(&mut store, &b, TaskStatus::Completed);
    assert_eq!(claim(&mut store).as_deref(), Some(c.as_str()));

    finish(&mut store, &a, TaskStatus::Failed);
    assert!(store.retry(&a).unwrap());
    assert_eq!(claim(&mut store).as_deref(), Some(a.as_str()));
    finish(&mut store, &a, TaskStatus::Completed);
    finish(&mut store, &c, TaskStatus::Completed);

    let stats = store.statistics();
    assert_eq!(stats.count(TaskStatus::Completed), 3);
    assert_eq!(stats.awaiting_dispatch(), 0);
    assert_eq!(stats.success_rate, 1.0);
}

#[test]
fn test_concurrent_claims_never_duplicate() {
    let (_dir, mut store) = open_store();
    for _ in 0..200 {
        store.add(NewTask::new("t", "p")).unwrap();
    }
    let store = Arc::new(Mutex::new(store));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let mut claimed = Vec::new();
                loop {
                    let next = store.lock().unwrap().next_eligible(&Capabilities::Any).unwrap();
                    match next {
                        Some(task) => claimed.push(task.id),
                        None => break claimed,
                    }
                }
            })
        })
        .collect();

    let mut all: Vec<String> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    let total = all.len();
    all.sort();
    all.dedup();
    assert_eq!(total, 200);
    assert_eq!(all.len(), 200);
}

#[test]
fn test_claims_across_handles_never_duplicate() {
    let (dir, mut store) = open_store();
    for _ in 0..100 {
        store.add(NewTask::new("t", "p")).unwrap();
    }

    // Each thread opens its own handle on the same file, like separate processes
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let path = dir.path().to_path_buf();
            thread::spawn(move || {
                let mut store = Store::open(&path).unwrap();
                let mut claimed = Vec::new();
                while let Some(id) = claim(&mut store) {
                    claimed.push(id);
                }
                claimed
            })
        })
        .collect();

    let mut all: Vec<String> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    let total = all.len();
    all.sort();
    all.dedup();
    assert_eq!(total, 100);
    assert_eq!(all.len(), 100);

    store.refresh().unwrap();
    assert_eq!(store.statistics().count(TaskStatus::Queued), 100);
}

#[test]
fn test_writers_interleave_without_lost_updates() {
    let (dir, mut scheduler) = open_store();
    let mut operator = Store::open(dir.path()).unwrap();

    let first = scheduler.add(NewTask::new("t", "p")).unwrap();
    let second = operator.add(NewTask::new("t", "p")).unwrap();
    assert_eq!(claim(&mut scheduler), Some(first.clone()));
    assert!(scheduler.update_status(&first, TaskStatus::Running, None, None).unwrap());

    assert!(operator.cancel(&first).unwrap());
    assert!(!scheduler.update_status(&first, TaskStatus::Completed, Some(100.0), None).unwrap());
    assert_eq!(claim(&mut scheduler), Some(second.clone()));

    let reopened = Store::open(dir.path()).unwrap();
    assert_eq!(reopened.get(&first).unwrap().status, TaskStatus::Cancelled);
    assert_eq!(reopened.get(&second).unwrap().status, TaskStatus::Queued);
}

#[test]
fn test_state_survives_reopen() {
    let dir = tempdir().unwrap();
    let (done, queued, failed) = {
        let mut store = Store::open(dir.path()).unwrap();
        let done = store.add(NewTask::new("t", "p").with_tag("keep")).unwrap();
        let queued = store.add(NewTask::new("t", "p")).unwrap();
        let failed = store.add(NewTask::new("t", "p")).unwrap();
        claim(&mut store);
        finish(&mut store, &done, TaskStatus::Completed);
        claim(&mut store);
        store
            .update_status(&failed, TaskStatus::Failed, None, Some("disk full".into()))
            .unwrap();
        (done, queued, failed)
    };

    let store = Store::open(dir.path()).unwrap();
    let done = store.get(&done).unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(done.tags.contains("keep"));
    assert_eq!(store.get(&queued).unwrap().status, TaskStatus::Queued);
    assert_eq!(
        store.get(&failed).unwrap().error_message.as_deref(),
        Some("disk full")
    );
}

#[test]
fn test_custom_config_defaults() {
    let dir = tempdir().unwrap();
    let config = StoreConfig {
        default_max_retries: 1,
        stale_pending_after: Duration::ZERO,
    };
    let mut store = Store::open_with(dir.path().join("custom.json"), config).unwrap();
    let id = store.add(NewTask::new("t", "p")).unwrap();
    let explicit = store.add(NewTask::new("t", "p").with_max_retries(7)).unwrap();

    assert_eq!(store.get(&id).unwrap().max_retries, 1);
    assert_eq!(store.get(&explicit).unwrap().max_retries, 7);
    thread::sleep(Duration::from_millis(5));
    assert_eq!(store.statistics().stale_pending, 2);
    assert!(dir.path().join("custom.json").exists());
}

#[test]
fn test_huge_stale_window_reports_nothing_stale() {
    let dir = tempdir().unwrap();
    let config = StoreConfig {
        stale_pending_after: Duration::from_secs(200_000_000_000 * 86_400),
        ..StoreConfig::default()
    };
    let mut store = Store::open_with(dir.path().join("queue.json"), config).unwrap();
    store.add(NewTask::new("t", "p")).unwrap();
    thread::sleep(Duration::from_millis(2));

    assert_eq!(store.statistics().stale_pending, 0);
}

proptest! {
    #[test]
    fn prop_progress_stays_in_range_and_monotonic(updates in prop::collection::vec(-50.0f64..150.0, 1..20)) {
        let (_dir, mut store) = open_store();
        let id = store.add(NewTask::new("t", "p")).unwrap();
        store.update_status(&id, TaskStatus::Running, None, None).unwrap();

        let mut last = 0.0;
        for p in updates {
            store.update_status(&id, TaskStatus::Running, Some(p), None).unwrap();
            let now = store.get(&id).unwrap().progress_percentage;
            prop_assert!((0.0..=100.0).contains(&now));
            prop_assert!(now >= last);
            last = now;
        }
    }
}
