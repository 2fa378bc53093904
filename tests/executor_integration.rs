//! Integration tests for the task executor.
//!
//! Each test runs real runs against an in-memory libSQL store and checks the
//! persisted progress records.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::timeout;
use uuid::Uuid;

use ops_engine::config::ExecutorConfig;
use ops_engine::error::{ExecutorError, TaskError};
use ops_engine::executor::{
    GroupType, HookOutcome, ProgressRecord, RESTART_ERROR, TaskExecutionListener, TaskExecutor,
    TaskGroup, TaskState, WorkerPool,
};
use ops_engine::store::{Database, LibSqlBackend};
use ops_engine::task::{Task, TaskContext};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

async fn setup() -> (Arc<TaskExecutor>, Arc<dyn Database>) {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let executor = Arc::new(TaskExecutor::new(
        Arc::clone(&db),
        &ExecutorConfig::default(),
    ));
    (executor, db)
}

// ── Test tasks ──────────────────────────────────────────────────────

/// Sub-task that counts its invocations and optionally fails.
struct Step {
    name: String,
    fail: bool,
    calls: Arc<AtomicUsize>,
}

impl Step {
    fn ok(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail: false,
            calls: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn failing(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail: true,
            calls: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Task for Step {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _ctx: &TaskContext) -> Result<(), TaskError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(TaskError::execution(&self.name, "disk full"));
        }
        Ok(())
    }
}

/// Sub-task that waits until the run is aborted.
struct WaitForAbort;

#[async_trait]
impl Task for WaitForAbort {
    fn name(&self) -> &str {
        "wait"
    }

    async fn run(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        ctx.wait_for(Duration::from_secs(30), Duration::from_millis(5), || async {
            Ok(false)
        })
        .await
    }
}

/// Root task that appends one group per entry and lets the executor run them.
struct Planner {
    groups: Vec<Vec<Arc<dyn Task>>>,
    abortable: bool,
}

impl Planner {
    fn new(groups: Vec<Vec<Arc<dyn Task>>>) -> Arc<Self> {
        Arc::new(Self {
            groups,
            abortable: false,
        })
    }

    fn abortable(groups: Vec<Vec<Arc<dyn Task>>>) -> Arc<Self> {
        Arc::new(Self {
            groups,
            abortable: true,
        })
    }
}

#[async_trait]
impl Task for Planner {
    fn name(&self) -> &str {
        "planner"
    }

    fn is_abortable(&self) -> bool {
        self.abortable
    }

    async fn run(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        for (i, members) in self.groups.iter().enumerate() {
            let mut group = TaskGroup::new(format!("group {}", i + 1), GroupType::Other);
            for member in members {
                group.add_task(Arc::clone(member));
            }
            ctx.add_group(group).await?;
        }
        Ok(())
    }
}

/// Root task blocked until notified.
struct Blocked {
    release: Arc<Notify>,
}

#[async_trait]
impl Task for Blocked {
    fn name(&self) -> &str {
        "blocked"
    }

    async fn run(&self, _ctx: &TaskContext) -> Result<(), TaskError> {
        self.release.notified().await;
        Ok(())
    }
}

/// Task rejecting its own parameters.
struct BadParams;

#[async_trait]
impl Task for BadParams {
    fn name(&self) -> &str {
        "bad-params"
    }

    fn validate_params(&self) -> Result<(), TaskError> {
        Err(TaskError::Validation {
            name: "bad-params".to_string(),
            reason: "target is required".to_string(),
        })
    }

    async fn run(&self, _ctx: &TaskContext) -> Result<(), TaskError> {
        Ok(())
    }
}

/// Root task that runs its groups one at a time and keeps going after a failure.
struct Stepwise {
    first: Arc<Step>,
    broken: Arc<Step>,
    late: Arc<Step>,
    seen: std::sync::Mutex<Vec<String>>,
}

impl Stepwise {
    fn note(&self, entry: String) {
        self.seen.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl Task for Stepwise {
    fn name(&self) -> &str {
        "stepwise"
    }

    async fn run(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        let position = ctx
            .add_group(TaskGroup::new("first", GroupType::Configure).with_task(dyn_task(&self.first)))
            .await?;
        ctx.run_sub_tasks().await?;
        self.note(format!(
            "position {position}: first={} broken={}",
            self.first.calls(),
            self.broken.calls()
        ));

        let position = ctx
            .add_group(TaskGroup::new("second", GroupType::Verify).with_task(dyn_task(&self.broken)))
            .await?;
        let failure = ctx.run_sub_tasks().await.unwrap_err();
        self.note(format!("position {position}: {failure}"));

        let position = ctx
            .add_group(TaskGroup::new("third", GroupType::Cleanup).with_task(dyn_task(&self.late)))
            .await?;
        let after = ctx.run_sub_tasks().await.unwrap_err();
        self.note(format!("position {position}: aborted={}", after.is_aborted()));

        Err(failure)
    }
}

/// Waits at a barrier shared with the other members of its group.
struct Rendezvous {
    barrier: Arc<tokio::sync::Barrier>,
}

#[async_trait]
impl Task for Rendezvous {
    fn name(&self) -> &str {
        "rendezvous"
    }

    async fn run(&self, _ctx: &TaskContext) -> Result<(), TaskError> {
        self.barrier.wait().await;
        Ok(())
    }
}

/// Listener aborting the run when a task at `abort_at` starts.
struct AbortAt {
    abort_at: u32,
    before: AtomicUsize,
    after: AtomicUsize,
}

impl TaskExecutionListener for AbortAt {
    fn before_task(&self, record: &ProgressRecord) -> HookOutcome {
        self.before.fetch_add(1, Ordering::SeqCst);
        if record.position == self.abort_at {
            HookOutcome::Abort
        } else {
            HookOutcome::Proceed
        }
    }

    fn after_task(&self, _record: &ProgressRecord) {
        self.after.fetch_add(1, Ordering::SeqCst);
    }
}

fn dyn_task<T: Task + 'static>(task: &Arc<T>) -> Arc<dyn Task> {
    Arc::clone(task) as Arc<dyn Task>
}

async fn wait_until_running(executor: &TaskExecutor, run_id: Uuid, position: u32) {
    timeout(TEST_TIMEOUT, async {
        loop {
            let tree = executor.get_progress(run_id).await.unwrap();
            if tree
                .at_position(position)
                .iter()
                .any(|r| r.state == TaskState::Running)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("sub-task never started");
}

async fn wait_until_root_running(executor: &TaskExecutor, run_id: Uuid) {
    timeout(TEST_TIMEOUT, async {
        while executor.get_progress(run_id).await.unwrap().root.state != TaskState::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("run never started");
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn successful_run_records_every_position() {
    let (executor, _db) = setup().await;
    let a = Step::ok("a");
    let b = Step::ok("b");
    let c = Step::ok("c");
    let root = Planner::new(vec![vec![dyn_task(&a), dyn_task(&b)], vec![dyn_task(&c)]]);

    let run_id = executor.submit_task(root, "ops", None).await.unwrap();
    let state = timeout(TEST_TIMEOUT, executor.wait_for_task(run_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state, TaskState::Success);

    let tree = executor.get_progress(run_id).await.unwrap();
    assert_eq!(tree.root.position, 0);
    assert_eq!(tree.root.state, TaskState::Success);
    let positions: Vec<u32> = tree.subtasks.iter().map(|r| r.position).collect();
    assert_eq!(positions, vec![1, 1, 2]);
    assert!(tree.subtasks.iter().all(|r| r.state == TaskState::Success));
    assert!(tree.subtasks.iter().all(|r| r.parent_id == Some(run_id)));
    assert_eq!(tree.percent_complete(), 100.0);
    assert_eq!((a.calls(), b.calls(), c.calls()), (1, 1, 1));
    assert!(!executor.is_task_running(run_id).await);
}

#[tokio::test]
async fn failed_group_skips_later_groups() {
    let (executor, _db) = setup().await;
    let first = Step::ok("first");
    let broken = Step::failing("broken");
    let later = Step::ok("later");
    let root = Planner::new(vec![
        vec![dyn_task(&first)],
        vec![dyn_task(&broken)],
        vec![dyn_task(&later)],
    ]);

    let run_id = executor.submit_task(root, "ops", None).await.unwrap();
    let state = timeout(TEST_TIMEOUT, executor.wait_for_task(run_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state, TaskState::Failure);

    let tree = executor.get_progress(run_id).await.unwrap();
    let error = tree.root.error().unwrap();
    assert!(
        error.contains("Failed to execute task broken"),
        "unexpected root error: {error}"
    );
    assert!(error.contains("disk full"));

    assert_eq!(tree.at_position(1)[0].state, TaskState::Success);
    assert_eq!(tree.at_position(2)[0].state, TaskState::Failure);
    assert_eq!(tree.at_position(2)[0].error(), Some("disk full"));
    assert_eq!(tree.at_position(3)[0].state, TaskState::Aborted);
    assert_eq!(later.calls(), 0);
}

#[tokio::test]
async fn failed_member_aborts_queued_siblings() {
    let (executor, _db) = setup().await;
    let broken = Step::failing("broken");
    let sibling = Step::ok("sibling");
    let group = TaskGroup::new("serial", GroupType::Backup)
        .with_task(dyn_task(&broken))
        .with_task(dyn_task(&sibling))
        .with_pool(WorkerPool::new("serial", 1));

    struct Single(std::sync::Mutex<Option<TaskGroup>>);

    #[async_trait]
    impl Task for Single {
        fn name(&self) -> &str {
            "single"
        }

        async fn run(&self, ctx: &TaskContext) -> Result<(), TaskError> {
            let group = self.0.lock().unwrap().take();
            if let Some(group) = group {
                ctx.add_group(group).await?;
            }
            Ok(())
        }
    }

    let run_id = executor
        .submit_task(Arc::new(Single(std::sync::Mutex::new(Some(group)))), "ops", None)
        .await
        .unwrap();
    let state = timeout(TEST_TIMEOUT, executor.wait_for_task(run_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state, TaskState::Failure);

    let tree = executor.get_progress(run_id).await.unwrap();
    let states: Vec<(&str, TaskState)> = tree
        .subtasks
        .iter()
        .map(|r| (r.task_name.as_str(), r.state))
        .collect();
    assert!(states.contains(&("broken", TaskState::Failure)));
    assert!(states.contains(&("sibling", TaskState::Aborted)));
    assert_eq!(sibling.calls(), 0);
    assert!(
        tree.root
            .error()
            .unwrap()
            .contains("Failed to execute task broken")
    );
}

#[tokio::test]
async fn body_runs_groups_step_by_step() {
    let (executor, _db) = setup().await;
    let root = Arc::new(Stepwise {
        first: Step::ok("first"),
        broken: Step::failing("broken"),
        late: Step::ok("late"),
        seen: std::sync::Mutex::new(Vec::new()),
    });

    let run_id = executor
        .submit_task(Arc::clone(&root) as Arc<dyn Task>, "ops", None)
        .await
        .unwrap();
    let state = timeout(TEST_TIMEOUT, executor.wait_for_task(run_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state, TaskState::Failure);

    let seen = root.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 3);
    // The second group had not started when the first barrier returned.
    assert_eq!(seen[0], "position 1: first=1 broken=0");
    assert!(
        seen[1].starts_with("position 2: Failed to execute task broken"),
        "unexpected entry: {}",
        seen[1]
    );
    assert_eq!(seen[2], "position 3: aborted=true");

    let tree = executor.get_progress(run_id).await.unwrap();
    let positions: Vec<(u32, TaskState)> =
        tree.subtasks.iter().map(|r| (r.position, r.state)).collect();
    assert_eq!(
        positions,
        vec![
            (1, TaskState::Success),
            (2, TaskState::Failure),
            (3, TaskState::Aborted),
        ]
    );
    assert_eq!(root.late.calls(), 0);
    assert!(
        tree.root
            .error()
            .unwrap()
            .contains("Failed to execute task broken: disk full")
    );
}

#[tokio::test]
async fn members_of_a_group_run_concurrently() {
    let (executor, _db) = setup().await;
    let barrier = Arc::new(tokio::sync::Barrier::new(3));
    let members: Vec<Arc<dyn Task>> = (0..3)
        .map(|_| {
            Arc::new(Rendezvous {
                barrier: Arc::clone(&barrier),
            }) as Arc<dyn Task>
        })
        .collect();

    let run_id = executor
        .submit_task(Planner::new(vec![members]), "ops", Some(WorkerPool::new("wide", 3)))
        .await
        .unwrap();
    let state = timeout(TEST_TIMEOUT, executor.wait_for_task(run_id))
        .await
        .expect("members did not run concurrently")
        .unwrap();
    assert_eq!(state, TaskState::Success);
}

#[tokio::test]
async fn validation_failure_persists_nothing() {
    let (executor, db) = setup().await;

    let err = executor
        .create_runnable_task(Arc::new(BadParams), "ops")
        .await
        .err()
        .unwrap();
    assert!(matches!(err, ExecutorError::Validation(TaskError::Validation { .. })));
    assert!(db.list_incomplete_progress_records().await.unwrap().is_empty());
}

#[tokio::test]
async fn submitting_twice_is_rejected() {
    let (executor, _db) = setup().await;
    let run = executor
        .create_runnable_task(Planner::new(vec![]), "ops")
        .await
        .unwrap();

    executor.submit(Arc::clone(&run), None).await.unwrap();
    let err = executor.submit(Arc::clone(&run), None).await.unwrap_err();
    assert!(matches!(err, ExecutorError::AlreadySubmitted { .. }));
    timeout(TEST_TIMEOUT, run.wait()).await.unwrap();
}

#[tokio::test]
async fn abort_of_non_abortable_task_is_rejected() {
    let (executor, _db) = setup().await;
    let release = Arc::new(Notify::new());
    let run_id = executor
        .submit_task(
            Arc::new(Blocked {
                release: Arc::clone(&release),
            }),
            "ops",
            None,
        )
        .await
        .unwrap();
    wait_until_root_running(&executor, run_id).await;

    let before = serde_json::to_value(executor.get_progress(run_id).await.unwrap()).unwrap();
    let err = executor.abort(run_id).await.unwrap_err();
    assert!(matches!(err, ExecutorError::InvalidState { .. }));
    let after = serde_json::to_value(executor.get_progress(run_id).await.unwrap()).unwrap();
    assert_eq!(before, after);
    let run = executor.get_runnable_task(run_id).await.unwrap();
    assert!(!run.is_abort_requested());

    release.notify_one();
    let state = timeout(TEST_TIMEOUT, executor.wait_for_task(run_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state, TaskState::Success);
}

#[tokio::test]
async fn abort_mid_run_stops_the_current_group() {
    let (executor, _db) = setup().await;
    let sub1 = Step::ok("sub1");
    let after = Step::ok("after");
    let root = Planner::abortable(vec![
        vec![dyn_task(&sub1)],
        vec![dyn_task(&Arc::new(WaitForAbort))],
        vec![dyn_task(&after)],
    ]);

    let run_id = executor.submit_task(root, "ops", None).await.unwrap();
    wait_until_running(&executor, run_id, 2).await;

    executor.abort(run_id).await.unwrap();
    // A repeated request on an in-flight run is accepted.
    let _ = executor.abort(run_id).await;

    let state = timeout(TEST_TIMEOUT, executor.wait_for_task(run_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state, TaskState::Aborted);

    let tree = executor.get_progress(run_id).await.unwrap();
    assert_eq!(tree.at_position(1)[0].state, TaskState::Success);
    assert_eq!(tree.at_position(2)[0].state, TaskState::Aborted);
    assert_eq!(tree.at_position(3)[0].state, TaskState::Aborted);
    assert_eq!(after.calls(), 0);

    let err = executor.abort(run_id).await.unwrap_err();
    assert!(matches!(err, ExecutorError::InvalidState { .. }));
}

#[tokio::test]
async fn repeated_abort_is_a_no_op() {
    let (executor, _db) = setup().await;
    let root = Planner::abortable(vec![vec![dyn_task(&Arc::new(WaitForAbort))]]);
    let run_id = executor.submit_task(root, "ops", None).await.unwrap();
    wait_until_running(&executor, run_id, 1).await;

    executor.abort(run_id).await.unwrap();
    executor.abort(run_id).await.unwrap();

    let state = timeout(TEST_TIMEOUT, executor.wait_for_task(run_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state, TaskState::Aborted);
}

#[tokio::test]
async fn abort_of_unknown_run_is_not_found() {
    let (executor, _db) = setup().await;
    let err = executor.abort(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, ExecutorError::NotFound { .. }));
}

#[tokio::test]
async fn listener_can_abort_the_run() {
    let (executor, _db) = setup().await;
    let sub1 = Step::ok("sub1");
    let sub2 = Step::ok("sub2");
    let root = Planner::new(vec![vec![dyn_task(&sub1)], vec![dyn_task(&sub2)]]);

    let listener = Arc::new(AbortAt {
        abort_at: 2,
        before: AtomicUsize::new(0),
        after: AtomicUsize::new(0),
    });
    let run = executor.create_runnable_task(root, "ops").await.unwrap();
    run.set_listener(listener.clone()).unwrap();
    let run_id = executor.submit(run, None).await.unwrap();

    let state = timeout(TEST_TIMEOUT, executor.wait_for_task(run_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state, TaskState::Aborted);
    assert_eq!(listener.before.load(Ordering::SeqCst), 3);
    assert_eq!(listener.after.load(Ordering::SeqCst), 3);

    let tree = executor.get_progress(run_id).await.unwrap();
    assert_eq!(tree.at_position(1)[0].state, TaskState::Success);
    assert_eq!(tree.at_position(2)[0].state, TaskState::Aborted);
    assert_eq!(sub1.calls(), 1);
    assert_eq!(sub2.calls(), 0);
}

#[tokio::test]
async fn fail_pending_tasks_closes_leftover_records() {
    let (executor, db) = setup().await;

    let mut root = ProgressRecord::new(None, 0, "backup", serde_json::Value::Null, "ops");
    db.insert_progress_record(&root).await.unwrap();
    root.transition_to(TaskState::Running, None).unwrap();
    db.update_progress_record(&root).await.unwrap();

    let child = ProgressRecord::new(Some(root.id), 1, "copy", serde_json::Value::Null, "ops");
    db.insert_progress_record(&child).await.unwrap();

    let closed = executor.fail_pending_tasks().await.unwrap();
    assert_eq!(closed, 2);

    let root = db.get_progress_record(root.id).await.unwrap().unwrap();
    assert_eq!(root.state, TaskState::Failure);
    assert_eq!(root.error(), Some(RESTART_ERROR));
    let child = db.get_progress_record(child.id).await.unwrap().unwrap();
    assert_eq!(child.state, TaskState::Aborted);

    assert_eq!(executor.fail_pending_tasks().await.unwrap(), 0);
}
