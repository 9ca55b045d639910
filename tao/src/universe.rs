//! Bootstrap buffer for unit registration.
//!
//! Units register before the engine knows its configuration. Until the
//! universe pipeline runs, each registration is queued as a task; once it is
//! running (or done), registrations execute on the spot.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tao_shared::{ErrorCode, TaoError, TaoResult};

use crate::config::{ConfigRegistry, UnitConfig};
use crate::context::Context;
use crate::param::Parameter;
use crate::pipeline::{FuncTask, PipeTask, Pipeline, Task, TaskState};

type UnitSetup = Box<dyn FnOnce() -> TaoResult<()> + Send>;

pub struct Universe {
    pipeline: Pipeline,
    registry: ConfigRegistry,
}

impl Universe {
    pub fn new(registry: ConfigRegistry) -> Self {
        Self {
            pipeline: Pipeline::new("universe"),
            registry,
        }
    }

    /// Register a unit: load its config section (defaults when absent),
    /// validate it, store it, then call `setup` with the result.
    pub fn register<C, F>(&self, name: &str, config: C, setup: F) -> TaoResult<()>
    where
        C: UnitConfig + Serialize + DeserializeOwned,
        F: FnOnce(Arc<C>) -> TaoResult<()> + Send + 'static,
    {
        if name.is_empty() {
            return Err(TaoError::new(
                ErrorCode::ParamInvalid,
                "universe: Register name is empty",
            ));
        }

        let registry = self.registry.clone();
        let key = name.to_string();
        let unit_setup: UnitSetup = Box::new(move || {
            let mut config = config;
            match registry.load_into(&key, &mut config) {
                Ok(()) => {}
                Err(e) if e.is(&ErrorCode::ConfigNotFound) => {}
                Err(e) => return Err(e),
            }
            config.validate();

            let config = Arc::new(config);
            registry.store(&key, Arc::clone(&config))?;
            setup(config)
        });

        match self.pipeline.state() {
            TaskState::Running | TaskState::Over | TaskState::Closed => {
                tracing::debug!(unit = %name, "Universe started, setting up immediately");
                unit_setup()
            }
            TaskState::Runnable => self.enqueue(name, unit_setup),
        }
    }

    fn enqueue(&self, name: &str, unit_setup: UnitSetup) -> TaoResult<()> {
        let slot = Arc::new(Mutex::new(Some(unit_setup)));

        let task_slot = Arc::clone(&slot);
        let task_name = name.to_string();
        let task = FuncTask::new(name, move |ctx: Context, param: Parameter| {
            let setup = task_slot.lock().take();
            let name = task_name.clone();
            async move {
                if ctx.is_done() {
                    return Err(TaoError::new(
                        ErrorCode::ContextCanceled,
                        format!("universe: {name} init failed"),
                    ));
                }
                match setup {
                    Some(setup) => setup().map(|()| param),
                    None => Err(TaoError::new(
                        ErrorCode::TaskRunTwice,
                        format!("universe: {name} set up twice"),
                    )),
                }
            }
        });

        match self.pipeline.register(PipeTask::new(task.into_shared())) {
            Ok(()) => {
                tracing::debug!(unit = %name, "Queued unit setup");
                Ok(())
            }
            // Lost the race with `init` or `close`.
            Err(e) if self.pipeline.state() != TaskState::Runnable => {
                tracing::debug!(unit = %name, "Universe started while queueing: {}", e);
                match slot.lock().take() {
                    Some(setup) => setup(),
                    None => Ok(()),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Run every queued setup once, bounded by `timeout`.
    pub async fn init(&self, timeout: Duration) -> TaoResult<()> {
        if self.pipeline.state() != TaskState::Runnable {
            return Err(TaoError::new(
                ErrorCode::TaskRunTwice,
                "universe: init twice",
            ));
        }

        let ctx = Context::background().with_timeout(timeout);
        tracing::debug!(
            units = ?self.pipeline.task_names(),
            timeout_ms = timeout.as_millis() as u64,
            "Universe init"
        );
        self.pipeline.run(ctx, Parameter::new()).await
    }

    pub fn state(&self) -> TaskState {
        self.pipeline.state()
    }

    pub fn close(&self) -> TaoResult<()> {
        self.pipeline.close()
    }

    pub fn registry(&self) -> &ConfigRegistry {
        &self.registry
    }
}
