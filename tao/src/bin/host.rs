//! Demo host: registers a `print` unit, runs the engine, and closes on a
//! stop signal.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tao::pipeline::{FuncTask, SharedTask};
use tao::{Engine, EngineOptions, Parameter, UnitConfig};

#[derive(Debug, Parser)]
#[command(name = "tao-host", version, about = "Run tao units from a config file")]
struct Args {
    /// Config file (.yaml, .yml, .json or .toml). Defaults to the first of
    /// ./conf/config.{yaml,json,yml} that exists.
    #[arg(short = 'f', long = "config")]
    config: Option<PathBuf>,

    /// Close right after the run instead of waiting for a stop signal.
    #[arg(long)]
    once: bool,
}

const PRINT_KEY: &str = "print";

/// `print` section: echo a message a few times.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct PrintConfig {
    message: String,
    times: u32,
    run_after: Vec<String>,
}

impl Default for PrintConfig {
    fn default() -> Self {
        Self {
            message: "hello tao".to_string(),
            times: 1,
            run_after: Vec::new(),
        }
    }
}

impl UnitConfig for PrintConfig {
    fn validate(&mut self) {
        if self.message.trim().is_empty() {
            self.message = PrintConfig::default().message;
        }
        self.times = self.times.max(1);
    }

    fn to_task(&self) -> Option<SharedTask> {
        let message = self.message.clone();
        let times = self.times;
        let task = FuncTask::new(PRINT_KEY, move |_ctx, param: Parameter| {
            let message = message.clone();
            async move {
                for _ in 0..times {
                    println!("{message}");
                }
                param.set(PRINT_KEY, message);
                Ok(param)
            }
        });
        Some(task.into_shared())
    }

    fn run_after(&self) -> Vec<String> {
        self.run_after.clone()
    }
}

#[tokio::main]
async fn main() {
    let exit = match real_main().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e:#}");
            1
        }
    };

    std::process::exit(exit);
}

async fn real_main() -> anyhow::Result<i32> {
    let args = Args::parse();
    let engine = Engine::new(EngineOptions::default());

    engine.register(PRINT_KEY, PrintConfig::default(), |config: Arc<PrintConfig>| {
        tracing::debug!(times = config.times, "print unit ready");
        Ok(())
    })?;

    match &args.config {
        Some(path) => engine
            .set_config_path(path)
            .await
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => engine.load_default_config().await?,
    }

    let param = Parameter::new();
    engine.run(None, Some(param.clone())).await?;
    tracing::info!("Run finished: {}", param);

    if args.once {
        return Ok(tao::shutdown::exit_code(engine.close()));
    }
    Ok(tao::shutdown::close_on_signal(&engine).await)
}
