//! Submit, change files, sync, remove and resubmit.

use std::fs;

use myqueue::config::Config;
use myqueue::core::{Selection, TaskState};
use myqueue::queue::Queue;
use myqueue::scheduler::{Scheduler, TestScheduler};

use crate::fixtures::{make_task, TestHome};

#[test]
fn test_change_files_drive_the_state_machine() {
    let home = TestHome::new();
    let w = home.folder("w");
    {
        let mut queue = home.open();
        let report = queue
            .submit(
                vec![make_task(&w, "b.py", &["a.py"]), make_task(&w, "a.py", &[])],
                false,
                usize::MAX,
            )
            .unwrap();
        assert_eq!(report.submitted.len(), 2);
        queue.save().unwrap();
    }

    home.change_file(1, 0);
    home.change_file(1, 1);
    {
        let mut queue = home.open();
        let a = &queue.tasks()[0];
        assert_eq!(a.state(), TaskState::Done);
        assert!(a.trunning.is_some() && a.tstop.is_some());
        assert!(queue.tasks()[1].deps.is_empty());
        queue.save().unwrap();
    }

    home.change_file(2, 2);
    let mut queue = home.open();
    assert_eq!(queue.tasks()[1].state(), TaskState::Failed);
    queue.save().unwrap();
    drop(queue);

    let log = Queue::read_log(&home.path).unwrap();
    assert!(log.iter().any(|t| t.id == 1 && t.state() == TaskState::Done));
    assert!(log.iter().any(|t| t.id == 2 && t.state() == TaskState::Failed));
}

#[test]
fn test_queue_file_stores_relative_folders() {
    let home = TestHome::new();
    let w = home.folder("sub/w");
    let mut queue = home.open();
    queue
        .submit(
            vec![make_task(&w, "a.py", &[]), make_task(&w, "b.py", &["a.py"])],
            false,
            usize::MAX,
        )
        .unwrap();
    queue.save().unwrap();

    let text = fs::read_to_string(home.path.join(".myqueue/queue.json")).unwrap();
    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(json["version"], 6);
    assert_eq!(json["tasks"][0]["folder"], "sub/w");
    assert_eq!(json["tasks"][1]["deps"][0], "sub/w/a.py");

    drop(queue);
    let reader = Queue::open(&home.path, Config::default(), Box::new(TestScheduler::new()), false, false).unwrap();
    assert_eq!(reader.tasks()[1].deps.iter().next(), Some(&w.join("a.py")));
}

#[test]
fn test_sync_uses_markers_and_drops_missing_folders() {
    let home = TestHome::new();
    let w = home.folder("w");
    let gone = home.folder("gone");
    let mut queue = home.open();
    queue
        .submit(
            vec![
                make_task(&w, "a.py", &[]),
                make_task(&w, "b.py", &[]),
                make_task(&gone, "c.py", &[]),
            ],
            false,
            usize::MAX,
        )
        .unwrap();

    fs::write(w.join("a.py.done"), "").unwrap();
    for id in 1..=3 {
        home.scheduler.finish(id);
    }
    fs::remove_dir_all(&gone).unwrap();

    let report = queue.sync().unwrap();
    assert_eq!(report.done, vec![w.join("a.py")]);
    assert_eq!(report.canceled.len(), 2);
    assert_eq!(report.removed, vec![gone.join("c.py")]);
    assert_eq!(queue.tasks().len(), 2);
    assert_eq!(queue.tasks()[0].state(), TaskState::Done);
    assert_eq!(queue.tasks()[1].state(), TaskState::Canceled);
}

#[test]
fn test_remove_takes_dependents_along() {
    let home = TestHome::new();
    let w = home.folder("w");
    let mut queue = home.open();
    queue
        .submit(
            vec![
                make_task(&w, "a.py", &[]),
                make_task(&w, "b.py", &["a.py"]),
                make_task(&w, "c.py", &["b.py"]),
                make_task(&w, "d.py", &[]),
            ],
            false,
            usize::MAX,
        )
        .unwrap();

    let removed = queue.remove(&Selection::ids([1])).unwrap();
    let names: Vec<String> = removed.iter().map(|t| t.name()).collect();
    assert_eq!(names, vec!["a.py", "b.py", "c.py"]);
    assert_eq!(queue.tasks().len(), 1);
    let live: Vec<u64> = home.scheduler.get_ids().unwrap().into_iter().collect();
    assert_eq!(live, vec![4]);
}

#[test]
fn test_resubmit_failed_with_new_resources() {
    let home = TestHome::new();
    let w = home.folder("w");
    {
        let mut queue = home.open();
        queue.submit(vec![make_task(&w, "a.py", &[])], false, usize::MAX).unwrap();
        queue.save().unwrap();
    }
    home.change_file(1, 2);
    let mut queue = home.open();
    let selection = Selection {
        states: [TaskState::Failed].into_iter().collect(),
        ..Selection::default()
    };
    let report = queue
        .resubmit(&selection, Some("4:1h".parse().unwrap()))
        .unwrap();
    assert_eq!(report.submitted.len(), 1);
    assert_eq!(queue.tasks().len(), 1);
    let task = &queue.tasks()[0];
    assert_eq!((task.id, task.state()), (2, TaskState::Queued));
    assert_eq!(task.resources.to_string(), "4:1h");
}

#[test]
fn test_dry_run_changes_nothing() {
    let home = TestHome::new();
    let w = home.folder("w");
    let mut queue = Queue::open(&home.path, Config::default(), Box::new(home.scheduler.clone()), true, true).unwrap();
    assert!(!queue.is_locked());
    let report = queue.submit(vec![make_task(&w, "a.py", &[])], false, usize::MAX).unwrap();
    assert_eq!(report.submitted.len(), 1);
    assert_eq!(report.submitted[0].id, 0);
    assert!(queue.tasks().is_empty());
    queue.save().unwrap();
    assert!(!home.path.join(".myqueue/queue.json").exists());
}

#[test]
fn test_second_writer_times_out_on_the_lock() {
    let home = TestHome::new();
    let _first = home.open();
    let path = home.path.join(".myqueue/queue.json.lock");
    assert!(path.is_file());
    let err = myqueue::lock::Lock::acquire(&path, std::time::Duration::from_millis(200)).unwrap_err();
    assert!(matches!(err, myqueue::Error::Locked { .. }));
}

#[test]
fn test_fresh_backend_does_not_reuse_ids() {
    let home = TestHome::new();
    let w = home.folder("w");
    {
        let mut queue = home.open();
        queue
            .submit(vec![make_task(&w, "a.py", &[]), make_task(&w, "b.py", &[])], false, usize::MAX)
            .unwrap();
        queue.save().unwrap();
    }

    // A new process starts with an empty backend.
    let mut queue = Queue::open(
        &home.path,
        Config::default(),
        Box::new(TestScheduler::new()),
        true,
        false,
    )
    .unwrap();
    let report = queue.submit(vec![make_task(&w, "c.py", &[])], false, usize::MAX).unwrap();
    assert_eq!(report.submitted[0].id, 3);
    let ids: Vec<u64> = queue.tasks().iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
}
