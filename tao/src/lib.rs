//! tao: in-process task orchestration.
//!
//! Hosts register units with an [`Engine`]. Each unit owns a config section
//! and may contribute a task to the root pipeline, optionally running after
//! other units. The engine bootstraps once from a config file, runs every
//! task concurrently in dependency order, and closes them in reverse order
//! on shutdown.
//!
//! ```ignore
//! let engine = Engine::default();
//! engine.register("http", HttpConfig::default(), |config| start(config))?;
//! engine.load_default_config().await?;
//! engine.run(None, None).await?;
//! std::process::exit(tao::shutdown::close_on_signal(&engine).await);
//! ```

pub mod config;
pub mod context;
pub mod engine;
pub mod logging;
pub mod param;
pub mod pipeline;
pub mod shutdown;
pub mod universe;

pub use config::{ConfigFormat, ConfigRegistry, TaoConfig, UnitConfig};
pub use context::{CancelHandle, Context};
pub use engine::{Engine, EngineOptions};
pub use param::Parameter;
pub use pipeline::{FuncTask, PipeTask, Pipeline, RegisterPolicy, SharedTask, Task, TaskState};
pub use tao_shared::{Cause, ErrorCode, TaoError, TaoResult};
pub use universe::Universe;
