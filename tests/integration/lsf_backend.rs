//! The LSF backend behind a real queue, with `bsub` and friends scripted.

use std::fs;

use myqueue::config::Config;
use myqueue::core::{Node, Selection, TaskState};
use myqueue::queue::Queue;
use myqueue::scheduler::Lsf;

use crate::fixtures::{make_task, ScriptedRunner, TestHome};

fn config() -> Config {
    Config {
        scheduler: Some("lsf".to_string()),
        nodes: vec![Node::new("xeon8", 8), Node::new("xeon24", 24)],
        ..Config::default()
    }
}

fn open(home: &TestHome, runner: &ScriptedRunner) -> Queue {
    let config = config();
    let lsf = Lsf::new(&config, &home.path, Box::new(runner.clone()));
    Queue::open(&home.path, config, Box::new(lsf), true, false).unwrap()
}

#[test]
fn test_submit_chain_then_finish_through_change_files() {
    let home = TestHome::new();
    let w = home.folder("w");
    let runner = ScriptedRunner::default();
    runner.reply("bsub", "Job <101> is submitted to queue <xeon8>.\n");
    runner.reply("bsub", "Job <102> is submitted to queue <xeon8>.\n");
    {
        let mut queue = open(&home, &runner);
        queue
            .submit(
                vec![make_task(&w, "a.py", &[]), make_task(&w, "b.py", &["a.py"])],
                false,
                usize::MAX,
            )
            .unwrap();
        queue.save().unwrap();
    }

    let calls = runner.calls.borrow().clone();
    assert_eq!(calls.len(), 2);
    let second = calls[1].1.join(" ");
    assert!(second.ends_with("-w done(101)"), "{}", second);
    let script = calls[0].2.clone().unwrap();
    assert!(script.contains(&format!("mq={}/.myqueue/lsf-$LSB_JOBID", home.path.display())));
    assert!(script.contains(&format!("cd {} && python3 a.py", w.display())));

    // What the job script leaves behind.
    fs::write(home.path.join(".myqueue/lsf-101-0"), "").unwrap();
    fs::write(home.path.join(".myqueue/lsf-101-1"), "").unwrap();
    let queue = open(&home, &runner);
    assert_eq!(queue.tasks()[0].state(), TaskState::Done);
    assert_eq!(queue.tasks()[1].state(), TaskState::Queued);
}

#[test]
fn test_hold_release_and_remove_call_lsf_tools() {
    let home = TestHome::new();
    let w = home.folder("w");
    let runner = ScriptedRunner::default();
    runner.reply("bsub", "Job <7> is submitted to queue <xeon8>.\n");
    let mut queue = open(&home, &runner);
    queue.submit(vec![make_task(&w, "a.py", &[])], false, usize::MAX).unwrap();

    let all = Selection::ids([7]);
    queue.modify(&all, TaskState::Hold).unwrap();
    queue.modify(&all, TaskState::Queued).unwrap();
    queue.remove(&all).unwrap();
    assert_eq!(runner.programs(), vec!["bsub", "bstop", "bresume", "bkill"]);
    assert_eq!(runner.calls.borrow()[3].1, vec!["7".to_string()]);
}

#[test]
fn test_sync_asks_bjobs() {
    let home = TestHome::new();
    let w = home.folder("w");
    let runner = ScriptedRunner::default();
    runner.reply("bsub", "Job <7> is submitted to queue <xeon8>.\n");
    runner.reply("bsub", "Job <8> is submitted to queue <xeon8>.\n");
    let mut queue = open(&home, &runner);
    queue
        .submit(vec![make_task(&w, "a.py", &[]), make_task(&w, "b.py", &[])], false, usize::MAX)
        .unwrap();

    runner.reply(
        "bjobs",
        "JOBID   USER    STAT  QUEUE      FROM_HOST   EXEC_HOST   JOB_NAME   SUBMIT_TIME\n\
         8       u       RUN   xeon8      login       n001        b.py       Oct 19 10:00\n",
    );
    let report = queue.sync().unwrap();
    assert_eq!(report.canceled, vec![w.join("a.py")]);
    assert_eq!(queue.tasks()[1].state(), TaskState::Queued);
}
