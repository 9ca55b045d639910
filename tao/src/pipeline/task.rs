//! Task trait and the closure-backed task implementation.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tao_shared::{ErrorCode, TaoError, TaoResult};

use crate::context::Context;
use crate::param::Parameter;

/// Lifecycle of a task. Only moves forward:
/// `Runnable -> Running -> Over -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TaskState {
    Runnable,
    Running,
    Over,
    Closed,
}

impl TaskState {
    /// Gate for `run`: only a Runnable task may start.
    pub(crate) fn check_run(self, kind: &str, name: &str) -> TaoResult<()> {
        match self {
            TaskState::Runnable => Ok(()),
            TaskState::Closed => Err(TaoError::new(
                ErrorCode::TaskClosed,
                format!("{kind}: {kind} {name} has been closed"),
            )),
            TaskState::Running | TaskState::Over => Err(TaoError::new(
                ErrorCode::TaskRunTwice,
                format!("{kind}: Run called twice for {kind} {name}"),
            )),
        }
    }

    /// Gate for `close`: anything but Running or Closed may be closed.
    pub(crate) fn check_close(self, kind: &str, name: &str) -> TaoResult<()> {
        match self {
            TaskState::Running => Err(TaoError::new(
                ErrorCode::TaskRunning,
                format!("{kind}: {kind} {name} is running"),
            )),
            TaskState::Closed => Err(TaoError::new(
                ErrorCode::TaskCloseTwice,
                format!("{kind}: Close called twice for {kind} {name}"),
            )),
            TaskState::Runnable | TaskState::Over => Ok(()),
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// A unit of work that can be registered into a pipeline.
///
/// [`Pipeline`](super::Pipeline) implements this trait too, so pipelines nest.
#[async_trait]
pub trait Task: Send + Sync {
    /// Name, unique within the owning pipeline.
    fn name(&self) -> &str;

    /// Execute once. Fails with `TaskClosed`, `TaskRunTwice` or
    /// `ContextCanceled` before doing any work.
    async fn run(&self, ctx: Context, param: Parameter) -> TaoResult<()>;

    /// Snapshot recorded by the last run. Empty before the task finished.
    fn result(&self) -> Parameter;

    /// Error recorded by the last run.
    fn last_error(&self) -> Option<TaoError>;

    /// Release resources. Fails with `TaskRunning` or `TaskCloseTwice`.
    fn close(&self) -> TaoResult<()>;

    fn state(&self) -> TaskState;

    /// Rendered error of the last run, empty when it succeeded.
    fn error(&self) -> String {
        self.last_error()
            .map(|e| e.to_string())
            .unwrap_or_default()
    }
}

pub type SharedTask = Arc<dyn Task>;

/// Task body: receives the context and the parameter, returns the parameter
/// to hand on.
pub type TaskRun =
    Arc<dyn Fn(Context, Parameter) -> BoxFuture<'static, TaoResult<Parameter>> + Send + Sync>;

pub type CloseFn = Box<dyn Fn() -> TaoResult<()> + Send + Sync>;

fn task_run<F, Fut>(f: F) -> TaskRun
where
    F: Fn(Context, Parameter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaoResult<Parameter>> + Send + 'static,
{
    Arc::new(move |ctx, param| f(ctx, param).boxed())
}

/// Task built from closures.
///
/// ```ignore
/// let task = FuncTask::new("hello", |_ctx, param: Parameter| async move {
///     param.set("message", "hello run");
///     Ok(param)
/// })
/// .with_close(|| Ok(()));
/// ```
pub struct FuncTask {
    name: String,
    run_fn: TaskRun,
    post_start: Option<TaskRun>,
    pre_stop: Option<TaskRun>,
    close_fn: Option<CloseFn>,
    inner: Mutex<TaskInner>,
}

struct TaskInner {
    result: Parameter,
    err: Option<TaoError>,
    state: TaskState,
}

impl FuncTask {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Context, Parameter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaoResult<Parameter>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run_fn: task_run(f),
            post_start: None,
            pre_stop: None,
            close_fn: None,
            inner: Mutex::new(TaskInner {
                result: Parameter::new(),
                err: None,
                state: TaskState::Runnable,
            }),
        }
    }

    /// Teardown invoked by `close`.
    pub fn with_close<F>(mut self, f: F) -> Self
    where
        F: Fn() -> TaoResult<()> + Send + Sync + 'static,
    {
        self.close_fn = Some(Box::new(f));
        self
    }

    /// Hook run before the body. The body is skipped when it fails.
    pub fn with_post_start<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Context, Parameter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaoResult<Parameter>> + Send + 'static,
    {
        self.post_start = Some(task_run(f));
        self
    }

    /// Hook run after the body, only when the body succeeded.
    pub fn with_pre_stop<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Context, Parameter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaoResult<Parameter>> + Send + 'static,
    {
        self.pre_stop = Some(task_run(f));
        self
    }

    pub fn into_shared(self) -> SharedTask {
        Arc::new(self)
    }

    async fn execute(&self, ctx: &Context, guard: &mut RunGuard<'_>) -> TaoResult<()> {
        if let Some(post_start) = &self.post_start {
            guard.param = post_start(ctx.clone(), guard.param.clone()).await?;
        }

        guard.param = (self.run_fn)(ctx.clone(), guard.param.clone()).await?;

        if let Some(pre_stop) = &self.pre_stop {
            guard.param = pre_stop(ctx.clone(), guard.param.clone()).await?;
        }
        Ok(())
    }
}

/// Records the outcome of a run on every exit path, including the run
/// future being dropped half-way.
struct RunGuard<'a> {
    inner: &'a Mutex<TaskInner>,
    param: Parameter,
    err: Option<TaoError>,
}

impl<'a> RunGuard<'a> {
    fn new(inner: &'a Mutex<TaskInner>, name: &str, param: Parameter) -> Self {
        Self {
            inner,
            param,
            err: Some(TaoError::new(
                ErrorCode::ContextCanceled,
                format!("task: run of task {name} was abandoned"),
            )),
        }
    }

    fn record(&mut self, outcome: &TaoResult<()>) {
        self.err = outcome.as_ref().err().cloned();
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        inner.result = self.param.snapshot();
        inner.err = self.err.take();
        inner.state = TaskState::Over;
    }
}

#[async_trait]
impl Task for FuncTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: Context, param: Parameter) -> TaoResult<()> {
        {
            let mut inner = self.inner.lock();
            inner.state.check_run("task", &self.name)?;
            if ctx.is_done() {
                return Err(TaoError::new(
                    ErrorCode::ContextCanceled,
                    "task: context has been canceled",
                ));
            }
            inner.state = TaskState::Running;
        }

        tracing::trace!(task = %self.name, "task started");
        let start = Instant::now();

        let mut guard = RunGuard::new(&self.inner, &self.name, param);
        let outcome = self.execute(&ctx, &mut guard).await;
        guard.record(&outcome);
        drop(guard);

        match &outcome {
            Ok(()) => tracing::debug!(
                task = %self.name,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "task finished"
            ),
            Err(e) => tracing::debug!(
                task = %self.name,
                code = %e.code(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "task failed"
            ),
        }
        outcome
    }

    fn result(&self) -> Parameter {
        self.inner.lock().result.clone()
    }

    fn last_error(&self) -> Option<TaoError> {
        self.inner.lock().err.clone()
    }

    fn close(&self) -> TaoResult<()> {
        {
            let mut inner = self.inner.lock();
            inner.state.check_close("task", &self.name)?;
            inner.state = TaskState::Closed;
        }

        match &self.close_fn {
            Some(close) => close(),
            None => Ok(()),
        }
    }

    fn state(&self) -> TaskState {
        self.inner.lock().state
    }
}
