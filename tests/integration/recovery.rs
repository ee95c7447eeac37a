//! Timeouts, memory failures and restarts.

use chrono::{Duration, Utc};

use myqueue::config::Config;
use myqueue::core::{Selection, TaskState};
use myqueue::core::{task, ResourceArgs, TaskOptions};

use crate::fixtures::{make_task, TestHome};

fn restartable(folder: &std::path::Path, cmd: &str, tmax: &str, restart: u32) -> myqueue::core::Task {
    task(
        cmd,
        TaskOptions {
            folder: folder.to_path_buf(),
            restart,
            resources: ResourceArgs {
                tmax: Some(tmax.to_string()),
                ..ResourceArgs::default()
            },
            ..TaskOptions::default()
        },
    )
    .unwrap()
}

#[test]
fn test_timeout_detected_from_error_file() {
    let home = TestHome::new();
    let w = home.folder("w");
    {
        let mut queue = home.open();
        queue
            .submit(
                vec![restartable(&w, "a.py", "10m", 0), make_task(&w, "b.py", &["a.py"])],
                false,
                usize::MAX,
            )
            .unwrap();
        queue.save().unwrap();
    }
    home.change_file(1, 0);
    let mut queue = home.open();
    assert_eq!(queue.tasks()[0].state(), TaskState::Running);

    // Past tmax but well inside the grace period: still running.
    let later = Utc::now() + Duration::seconds(700);
    queue.check(later).unwrap();
    assert_eq!(queue.tasks()[0].state(), TaskState::Running);

    home.error_file(&queue, 1, "TERM: TIMEOUT reached\n");
    queue.check(later).unwrap();
    assert_eq!(queue.tasks()[0].state(), TaskState::Timeout);
    assert_eq!(queue.tasks()[0].tstop, Some(later));
    assert_eq!(queue.tasks()[1].state(), TaskState::Canceled);
}

#[test]
fn test_long_overdue_task_times_out_without_marker() {
    let home = TestHome::new();
    let w = home.folder("w");
    let mut queue = home.open();
    queue.submit(vec![restartable(&w, "a.py", "10m", 0)], false, usize::MAX).unwrap();
    queue.update(1, TaskState::Running, Utc::now()).unwrap();
    queue.check(Utc::now() + Duration::seconds(600 + 1801)).unwrap();
    assert_eq!(queue.tasks()[0].state(), TaskState::Timeout);
}

#[test]
fn test_memory_failure_is_classified_on_open() {
    let home = TestHome::new();
    let w = home.folder("w");
    {
        let mut queue = home.open();
        queue.submit(vec![make_task(&w, "a.py", &[])], false, usize::MAX).unwrap();
        home.error_file(&queue, 1, "Traceback (most recent call last):\nMemoryError\n");
        queue.save().unwrap();
    }
    home.change_file(1, 2);
    let queue = home.open();
    let task = &queue.tasks()[0];
    assert_eq!(task.state(), TaskState::Memory);
    assert_eq!(task.error, "MemoryError");
}

#[test]
fn test_kick_restarts_with_bigger_resources_and_dependents() {
    let home = TestHome::new();
    let w = home.folder("w");
    let mut queue = home.open();
    queue
        .submit(
            vec![restartable(&w, "a.py", "10m", 2), make_task(&w, "b.py", &["a.py"])],
            false,
            usize::MAX,
        )
        .unwrap();
    queue.update(1, TaskState::Running, Utc::now()).unwrap();
    queue.update(1, TaskState::Timeout, Utc::now()).unwrap();
    assert_eq!(queue.tasks()[1].state(), TaskState::Canceled);

    let report = queue.kick().unwrap();
    assert_eq!(report.restarted.len(), 2);
    let a = &queue.tasks()[0];
    assert_eq!(a.state(), TaskState::Queued);
    assert_eq!(a.resources.tmax(), 1200);
    assert_eq!(a.restart, 1);
    let b = &queue.tasks()[1];
    assert!(b.deps.contains(&w.join("a.py")));

    let subs = home.scheduler.submissions();
    assert_eq!(subs[3].dependency_ids, vec![subs[2].id]);
}

#[test]
fn test_kick_after_marking_failed_as_memory() {
    let home = TestHome::new();
    let w = home.folder("w");
    let mut queue = home.open_with(Config::default());
    queue.submit(vec![restartable(&w, "a.py", "10m", 1)], false, usize::MAX).unwrap();
    queue.update(1, TaskState::Failed, Utc::now()).unwrap();

    let failed = Selection {
        states: [TaskState::Failed].into_iter().collect(),
        ..Selection::default()
    };
    queue.modify(&failed, TaskState::Memory).unwrap();
    let report = queue.kick().unwrap();
    assert_eq!(report.restarted.len(), 1);
    assert_eq!(queue.tasks()[0].resources.cores(), 2);
    assert_eq!(queue.tasks()[0].restart, 0);

    // No restarts left: a second memory failure stays put.
    queue.update(2, TaskState::Memory, Utc::now()).unwrap();
    assert!(queue.kick().unwrap().restarted.is_empty());
}
