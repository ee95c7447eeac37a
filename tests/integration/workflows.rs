//! Collecting workflows and submitting them, again and again.

use chrono::Utc;
use serde_json::json;

use myqueue::core::TaskState;
use myqueue::workflow::{
    run_workflow_function, workflow_tasks, CollectionContext, ResourceScope, RunSpec, Step, Value,
    WorkflowRegistry,
};
use myqueue::Result;

use crate::fixtures::TestHome;

fn registry() -> WorkflowRegistry {
    let mut registry = WorkflowRegistry::new();
    registry.register_function("relax", |args, _| Ok(json!(args[0].as_f64().unwrap_or(0.0) * 0.5)));
    registry.register_function("check", |args, _| Ok(json!(args[0].as_f64().unwrap_or(0.0) < 1.0)));
    registry.register_workflow("flow.py", |ctx: &mut CollectionContext<'_>| -> Result<Step> {
        let relax_step = ResourceScope::default()
            .cores(8)
            .tmax("1h")
            .decorate(|ctx: &mut CollectionContext<'_>| {
                ctx.run(RunSpec::new().function("relax").arg(Value::known(4.0)))
            });
        let relax = relax_step(&mut *ctx)?;
        let check = ctx.run(RunSpec::new().function("check").arg(relax.result()))?;
        if let Some(step) = check.result().compare(&Value::known(true)).stop() {
            return Ok(step);
        }
        ctx.run(RunSpec::new().shell("report").after(&check))?;
        Ok(Step::Complete)
    });
    registry
}

#[test]
fn test_workflow_submission_and_rerun() {
    let home = TestHome::new();
    let w = home.folder("w");
    let registry = registry();
    let script = home.path.join("flow.py");
    let folders = vec![w.clone()];

    let tasks = workflow_tasks(&registry, &script, &folders, &[]).unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].resources.cores(), 8);
    assert!(tasks[1].deps.contains(&w.join("relax")));

    let mut queue = home.open();
    let report = queue.submit(tasks, false, usize::MAX).unwrap();
    assert_eq!(report.submitted.len(), 2);

    // Submitting again while both are queued changes nothing.
    let again = workflow_tasks(&registry, &script, &folders, &[]).unwrap();
    let report = queue.submit(again, false, usize::MAX).unwrap();
    assert!(report.submitted.is_empty());
    assert_eq!(report.in_queue.get(&TaskState::Queued), Some(&2));

    // The job for relax runs in its folder.
    let value = run_workflow_function(&registry, &script, &w, "relax").unwrap();
    assert_eq!(value, Value::known(2.0));
    home.scheduler.set_maxrss(1, 512 << 20);
    queue.update(1, TaskState::Done, Utc::now()).unwrap();
    assert_eq!(queue.tasks()[0].memory_usage, 512 << 20);
    let value = run_workflow_function(&registry, &script, &w, "check").unwrap();
    assert_eq!(value, Value::known(false));
    queue.update(2, TaskState::Done, Utc::now()).unwrap();

    // With both results cached the workflow reaches its last task.
    let third = workflow_tasks(&registry, &script, &folders, &[]).unwrap();
    assert_eq!(third.len(), 3);
    let report = queue.submit(third, false, usize::MAX).unwrap();
    assert_eq!(report.already_done, 2);
    assert_eq!(report.submitted.len(), 1);
    assert_eq!(report.submitted[0].name(), "shell:report");
    assert!(report.submitted[0].deps.is_empty());
}

#[test]
fn test_failed_marker_needs_force() {
    let home = TestHome::new();
    let w = home.folder("w");
    let registry = registry();
    let script = home.path.join("flow.py");
    let folders = vec![w.clone()];

    let mut queue = home.open();
    queue
        .submit(workflow_tasks(&registry, &script, &folders, &[]).unwrap(), false, usize::MAX)
        .unwrap();
    queue.update(1, TaskState::Failed, Utc::now()).unwrap();
    assert!(w.join("relax.FAILED").is_file());
    assert_eq!(queue.tasks()[1].state(), TaskState::Canceled);

    let report = queue
        .submit(workflow_tasks(&registry, &script, &folders, &[]).unwrap(), false, usize::MAX)
        .unwrap();
    assert_eq!(report.already_failed, 1);
    assert_eq!(report.skipped.len(), 1);

    let report = queue
        .submit(workflow_tasks(&registry, &script, &folders, &[]).unwrap(), true, usize::MAX)
        .unwrap();
    assert_eq!(report.submitted.len(), 2);
    assert!(!w.join("relax.FAILED").exists());
    assert_eq!(queue.tasks().len(), 2);
}

#[test]
fn test_dependent_function_task_keeps_its_name() {
    let home = TestHome::new();
    let w = home.folder("w");
    let mut registry = WorkflowRegistry::new();
    registry.register_function("relax", |_, _| Ok(json!({"energy": -3.0})));
    registry.register_function("bands", |args, _| Ok(json!(args[0].as_f64().unwrap_or(0.0) * 2.0)));
    registry.register_workflow("flow.py", |ctx: &mut CollectionContext<'_>| -> Result<Step> {
        let relax = ctx.run(RunSpec::new().function("relax"))?;
        ctx.run(RunSpec::new().function("bands").arg(relax.result().field("energy")))?;
        Ok(Step::Complete)
    });
    let script = home.path.join("flow.py");
    let folders = vec![w.clone()];

    let names = |tasks: &[myqueue::core::Task]| tasks.iter().map(|t| t.name()).collect::<Vec<_>>();
    let first = workflow_tasks(&registry, &script, &folders, &[]).unwrap();
    assert_eq!(names(&first), vec!["relax", "bands"]);
    let mut queue = home.open();
    queue.submit(first, false, usize::MAX).unwrap();

    run_workflow_function(&registry, &script, &w, "relax").unwrap();
    queue.update(1, TaskState::Done, Utc::now()).unwrap();
    let value = run_workflow_function(&registry, &script, &w, "bands").unwrap();
    assert_eq!(value, Value::known(-6.0));

    // Both results are cached now, under the names they were submitted with.
    let again = workflow_tasks(&registry, &script, &folders, &[]).unwrap();
    assert_eq!(names(&again), vec!["relax", "bands"]);
    let report = queue.submit(again, false, usize::MAX).unwrap();
    assert!(report.submitted.is_empty());
    assert_eq!(report.already_done, 2);
}
