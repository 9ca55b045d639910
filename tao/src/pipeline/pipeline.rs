//! Concurrent pipeline execution.
//!
//! A pipeline runs every registered task on its own tokio task. A task first
//! waits for the completion signal of each sibling named in its `run_after`
//! list, then runs. Errors from all tasks are merged into one aggregate, and
//! `close` tears tasks down in reverse registration order.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use tao_shared::{ErrorCode, TaoError, TaoResult};
use tokio::task::JoinSet;

use super::metrics::{PipelineMetrics, TaskMetrics};
use super::signal::{CompletionSignal, FireOnDrop};
use super::task::{SharedTask, Task, TaskState};
use crate::context::Context;
use crate::param::Parameter;

/// A task plus the names of the siblings it runs after.
#[derive(Clone)]
pub struct PipeTask {
    task: SharedTask,
    run_after: Vec<String>,
}

impl PipeTask {
    pub fn new(task: SharedTask) -> Self {
        Self {
            task,
            run_after: Vec::new(),
        }
    }

    /// Names of sibling tasks that must finish first. Names that match no
    /// sibling are ignored.
    pub fn run_after<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.run_after.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn name(&self) -> &str {
        self.task.name()
    }

    pub fn task(&self) -> &SharedTask {
        &self.task
    }

    pub fn dependencies(&self) -> &[String] {
        &self.run_after
    }
}

impl From<SharedTask> for PipeTask {
    fn from(task: SharedTask) -> Self {
        PipeTask::new(task)
    }
}

/// Whether `register` is accepted after the pipeline finished running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegisterPolicy {
    /// Only accept registration before `run`.
    #[default]
    RunnableOnly,
    /// Also accept registration once the pipeline is Over. Late tasks never
    /// run but are still closed by `close`.
    AllowAfterOver,
}

/// Named collection of concurrently executed tasks.
///
/// Optional `post_start` and `pre_stop` tasks run synchronously before the
/// fan-out and after the fan-in respectively.
pub struct Pipeline {
    name: String,
    post_start: Option<PipeTask>,
    pre_stop: Option<PipeTask>,
    policy: RegisterPolicy,
    inner: RwLock<PipelineInner>,
}

struct PipelineInner {
    tasks: Vec<PipeTask>,
    signals: HashMap<String, CompletionSignal>,
    results: Parameter,
    err: Option<TaoError>,
    state: TaskState,
    metrics: Option<PipelineMetrics>,
}

/// What one task run produced, reported back to the fan-in loop.
struct TaskOutcome {
    name: String,
    result: Parameter,
    error: Option<TaoError>,
    elapsed: Duration,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            post_start: None,
            pre_stop: None,
            policy: RegisterPolicy::default(),
            inner: RwLock::new(PipelineInner {
                tasks: Vec::new(),
                signals: HashMap::new(),
                results: Parameter::new(),
                err: None,
                state: TaskState::Runnable,
                metrics: None,
            }),
        }
    }

    pub fn with_post_start(mut self, task: PipeTask) -> Self {
        self.post_start = Some(task);
        self
    }

    pub fn with_pre_stop(mut self, task: PipeTask) -> Self {
        self.pre_stop = Some(task);
        self
    }

    pub fn with_register_policy(mut self, policy: RegisterPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Add a task. Names must be non-empty and unique within this pipeline,
    /// including the names of the `post_start` / `pre_stop` tasks.
    pub fn register(&self, task: PipeTask) -> TaoResult<()> {
        let name = task.name().to_string();
        if name.is_empty() {
            return Err(TaoError::new(
                ErrorCode::ParamInvalid,
                "pipeline: Register task name is empty",
            ));
        }

        let mut inner = self.inner.write();
        match inner.state {
            TaskState::Runnable => {}
            TaskState::Over if self.policy == RegisterPolicy::AllowAfterOver => {}
            TaskState::Over => {
                return Err(TaoError::new(
                    ErrorCode::ParamInvalid,
                    format!(
                        "pipeline: Register called after pipeline {} finished",
                        self.name
                    ),
                ));
            }
            TaskState::Running => {
                return Err(TaoError::new(
                    ErrorCode::TaskRunning,
                    format!("pipeline: Register called while pipeline {} is running", self.name),
                ));
            }
            TaskState::Closed => {
                return Err(TaoError::new(
                    ErrorCode::TaskClosed,
                    format!("pipeline: pipeline {} has been closed", self.name),
                ));
            }
        }

        if inner.signals.contains_key(&name) || self.is_special(&name) {
            return Err(TaoError::new(
                ErrorCode::ParamInvalid,
                format!("pipeline: Register called twice for task {name}"),
            ));
        }

        tracing::debug!(
            pipeline = %self.name,
            task = %name,
            run_after = ?task.dependencies(),
            "Registering task"
        );

        inner.signals.insert(name, CompletionSignal::new());
        inner.tasks.push(task);
        Ok(())
    }

    /// Registered task names in registration order.
    pub fn task_names(&self) -> Vec<String> {
        self.inner
            .read()
            .tasks
            .iter()
            .map(|t| t.name().to_string())
            .collect()
    }

    /// Timings of the last run.
    pub fn metrics(&self) -> Option<PipelineMetrics> {
        self.inner.read().metrics.clone()
    }

    fn is_special(&self, name: &str) -> bool {
        [&self.post_start, &self.pre_stop]
            .into_iter()
            .flatten()
            .any(|special| special.name() == name)
    }

    /// Store a finished task's snapshot and merge its error.
    fn record(&self, outcome: &TaskOutcome, metrics: &mut Vec<TaskMetrics>) {
        if let Some(err) = &outcome.error {
            tracing::warn!(
                pipeline = %self.name,
                task = %outcome.name,
                code = %err.code(),
                "Task failed: {}",
                err
            );
        }

        let mut inner = self.inner.write();
        inner
            .results
            .set(outcome.name.clone(), outcome.result.to_value());
        if let Some(err) = &outcome.error {
            TaoError::merge_into(&mut inner.err, err);
        }
        drop(inner);

        metrics.push(TaskMetrics {
            name: outcome.name.clone(),
            duration_ms: outcome.elapsed.as_millis(),
            succeeded: outcome.error.is_none(),
        });
    }

    fn merge_error(&self, err: TaoError) {
        TaoError::merge_into(&mut self.inner.write().err, &err);
    }
}

/// Run a task, turning a panic in its body into an error.
async fn run_task(task: &SharedTask, ctx: Context, param: Parameter) -> TaskOutcome {
    let name = task.name().to_string();
    let start = Instant::now();

    let error = match AssertUnwindSafe(task.run(ctx, param)).catch_unwind().await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(panic) => Some(TaoError::new(
            ErrorCode::Unknown,
            format!("pipeline: task {name} panicked: {}", panic_message(&*panic)),
        )),
    };

    TaskOutcome {
        result: task.result(),
        name,
        error,
        elapsed: start.elapsed(),
    }
}

/// Body of one concurrently launched task: wait for dependencies, run, then
/// release dependents.
async fn run_concurrent(
    pipe_task: PipeTask,
    ctx: Context,
    param: Parameter,
    signals: Arc<HashMap<String, CompletionSignal>>,
) -> TaskOutcome {
    let _release = signals
        .get(pipe_task.name())
        .cloned()
        .map(FireOnDrop);

    for dep in pipe_task.dependencies() {
        let Some(signal) = signals.get(dep) else {
            continue;
        };
        if !signal.is_fired() {
            tracing::trace!(task = %pipe_task.name(), dependency = %dep, "Waiting for dependency");
        }
        signal.wait().await;
    }

    run_task(pipe_task.task(), ctx, param).await
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Moves a running pipeline to Over on every exit path of `run`.
struct FinishGuard<'a>(&'a RwLock<PipelineInner>);

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.0.write();
        if inner.state == TaskState::Running {
            inner.state = TaskState::Over;
        }
    }
}

#[async_trait]
impl Task for Pipeline {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: Context, param: Parameter) -> TaoResult<()> {
        let (tasks, signals) = {
            let mut inner = self.inner.write();
            inner.state.check_run("pipeline", &self.name)?;
            if ctx.is_done() {
                return Err(TaoError::new(
                    ErrorCode::ContextCanceled,
                    "pipeline: context has been canceled",
                ));
            }
            inner.state = TaskState::Running;
            inner.results = Parameter::new();
            inner.err = None;
            (inner.tasks.clone(), Arc::new(inner.signals.clone()))
        };
        let _finish = FinishGuard(&self.inner);

        let total_start = Instant::now();
        let mut metrics = Vec::with_capacity(tasks.len() + 2);
        tracing::debug!(pipeline = %self.name, tasks = tasks.len(), "Pipeline started");

        if let Some(post_start) = &self.post_start {
            let outcome = run_task(post_start.task(), ctx.clone(), param.clone()).await;
            self.record(&outcome, &mut metrics);
            if let Some(err) = outcome.error {
                tracing::warn!(pipeline = %self.name, "post_start failed, skipping tasks");
                self.inner.write().metrics = Some(PipelineMetrics {
                    total_duration_ms: total_start.elapsed().as_millis(),
                    tasks: metrics,
                });
                return Err(self.last_error().unwrap_or(err));
            }
        }

        let mut set = JoinSet::new();
        for pipe_task in tasks {
            set.spawn(run_concurrent(
                pipe_task,
                ctx.clone(),
                param.clone(),
                Arc::clone(&signals),
            ));
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => self.record(&outcome, &mut metrics),
                Err(e) => self.merge_error(TaoError::new(
                    ErrorCode::Unknown,
                    format!("pipeline: task of {} did not complete: {e}", self.name),
                )),
            }
        }

        if let Some(pre_stop) = &self.pre_stop {
            let outcome = run_task(pre_stop.task(), ctx.clone(), param.clone()).await;
            self.record(&outcome, &mut metrics);
        }

        let total_duration_ms = total_start.elapsed().as_millis();
        let err = {
            let mut inner = self.inner.write();
            inner.metrics = Some(PipelineMetrics {
                total_duration_ms,
                tasks: metrics,
            });
            inner.err.clone()
        };

        tracing::debug!(
            pipeline = %self.name,
            elapsed_ms = total_duration_ms as u64,
            failed = err.is_some(),
            "Pipeline finished"
        );

        match err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn result(&self) -> Parameter {
        self.inner.read().results.clone()
    }

    fn last_error(&self) -> Option<TaoError> {
        self.inner.read().err.clone()
    }

    /// Close `pre_stop`, then registered tasks newest first, then
    /// `post_start`. Keeps going after failures and merges every error.
    fn close(&self) -> TaoResult<()> {
        let closers: Vec<SharedTask> = {
            let mut inner = self.inner.write();
            inner.state.check_close("pipeline", &self.name)?;
            inner.state = TaskState::Closed;

            self.post_start
                .iter()
                .chain(inner.tasks.iter())
                .chain(self.pre_stop.iter())
                .map(|t| Arc::clone(t.task()))
                .collect()
        };

        let mut err = None;
        for task in closers.iter().rev() {
            if let Err(e) = task.close() {
                tracing::warn!(
                    pipeline = %self.name,
                    task = %task.name(),
                    code = %e.code(),
                    "Close failed: {}",
                    e
                );
                TaoError::merge_into(&mut err, &e);
            }
        }

        tracing::debug!(pipeline = %self.name, failed = err.is_some(), "Pipeline closed");
        match err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn state(&self) -> TaskState {
        self.inner.read().state
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
