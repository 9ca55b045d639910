//! Task lifecycle and concurrent pipeline execution.
//!
//! ## Architecture
//!
//! ```text
//! Pipeline → PipeTask → Task
//!
//! - Pipeline: runs every registered task concurrently, merges errors,
//!   closes tasks in reverse registration order
//! - PipeTask: a task plus the sibling names it runs after
//! - Task: unit of work with a one-way lifecycle
//!   (Runnable → Running → Over → Closed)
//! ```
//!
//! A [`Pipeline`] is itself a [`Task`], so pipelines nest.
//!
//! ## Example
//!
//! ```ignore
//! use tao::pipeline::{FuncTask, PipeTask, Pipeline, Task};
//! use tao::{Context, Parameter};
//!
//! let pipe = Pipeline::new("boot");
//! pipe.register(PipeTask::new(db.into_shared()))?;
//! pipe.register(PipeTask::new(http.into_shared()).run_after(["db"]))?;
//!
//! pipe.run(Context::background(), Parameter::new()).await?;
//! println!("{}", pipe.result());
//! pipe.close()?;
//! ```

mod metrics;
#[allow(clippy::module_inception)]
mod pipeline;
mod signal;
mod task;

pub use metrics::{PipelineMetrics, TaskMetrics};
pub use pipeline::{PipeTask, Pipeline, RegisterPolicy};
pub use task::{CloseFn, FuncTask, SharedTask, Task, TaskRun, TaskState};
