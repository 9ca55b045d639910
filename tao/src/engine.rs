//! The engine: owns the root pipeline, the universe and the config registry.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tao_shared::{ErrorCode, TaoError, TaoResult};

use crate::config::{ConfigFormat, ConfigRegistry, TAO_CONFIG_KEY, TaoConfig, UnitConfig};
use crate::context::Context;
use crate::logging::init_logging;
use crate::param::Parameter;
use crate::pipeline::{PipeTask, Pipeline, RegisterPolicy, Task, TaskState};
use crate::universe::Universe;

/// Name of the root pipeline.
pub const ROOT_PIPELINE: &str = "tao";

/// Config files tried, in order, by [`Engine::load_default_config`].
pub const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "./conf/config.yaml",
    "./conf/config.json",
    "./conf/config.yml",
];

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Deadline for running every queued unit setup.
    pub bootstrap_timeout: Duration,
    /// Registration policy of the root pipeline.
    pub register_policy: RegisterPolicy,
    pub default_config_paths: Vec<PathBuf>,
    /// Base of the `tao` section; the config file overlays it.
    pub tao_defaults: TaoConfig,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            bootstrap_timeout: Duration::from_secs(60),
            register_policy: RegisterPolicy::default(),
            default_config_paths: DEFAULT_CONFIG_PATHS.iter().map(PathBuf::from).collect(),
            tao_defaults: TaoConfig::default(),
        }
    }
}

// ============================================================================
// PUBLIC API
// ============================================================================

/// Entry point for hosts.
///
/// Units register first via [`Engine::register`]. Configuration is then
/// supplied exactly once ([`Engine::set_config_path`],
/// [`Engine::set_config_bytes`] or [`Engine::develop_mode`]), which
/// bootstraps the universe. [`Engine::run`] turns every stored unit config
/// into a task of the root pipeline and runs it; [`Engine::close`] tears
/// everything down.
///
/// **Cloning**: cheap via `Arc`; all clones share the same state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    options: EngineOptions,
    root: Pipeline,
    universe: Universe,
    registry: ConfigRegistry,
    /// One-shot gate for configuration bootstrap.
    bootstrapped: AtomicBool,
    /// Set once `run` gets past its entry checks.
    started: AtomicBool,
    config_path: RwLock<Option<PathBuf>>,
}

impl Engine {
    pub fn new(options: EngineOptions) -> Self {
        let registry = ConfigRegistry::new();
        let root = Pipeline::new(ROOT_PIPELINE).with_register_policy(options.register_policy);

        Self {
            inner: Arc::new(EngineInner {
                universe: Universe::new(registry.clone()),
                root,
                registry,
                options,
                bootstrapped: AtomicBool::new(false),
                started: AtomicBool::new(false),
                config_path: RwLock::new(None),
            }),
        }
    }

    /// Register a unit with the universe. See [`Universe::register`].
    pub fn register<C, F>(&self, name: &str, config: C, setup: F) -> TaoResult<()>
    where
        C: UnitConfig + Serialize + DeserializeOwned,
        F: FnOnce(Arc<C>) -> TaoResult<()> + Send + 'static,
    {
        self.inner.universe.register(name, config, setup)
    }

    /// Read a config file and bootstrap with it. The format follows the
    /// file extension.
    pub async fn set_config_path(&self, path: impl AsRef<Path>) -> TaoResult<()> {
        let path = path.as_ref();
        let owned = path.to_path_buf();
        let data = tokio::task::spawn_blocking(move || std::fs::read(owned))
            .await
            .map_err(|e| {
                TaoError::new(
                    ErrorCode::Unknown,
                    format!("init: config read task failed: {e}"),
                )
            })?
            .map_err(|e| {
                TaoError::wrapped("init: fail to read config file", TaoError::from(e))
            })?;
        let format = ConfigFormat::from_path(path)?;

        self.set_config_bytes(&data, format)
            .await
            .map_err(|e| TaoError::wrapped("init: fail to set config path", e))?;

        tracing::info!(path = %path.display(), "Loaded config file");
        *self.inner.config_path.write() = Some(path.to_path_buf());
        Ok(())
    }

    /// Parse `data` and bootstrap: apply the `tao` section, then run every
    /// queued unit setup. Only the first call of this family succeeds.
    pub async fn set_config_bytes(&self, data: &[u8], format: ConfigFormat) -> TaoResult<()> {
        if self
            .inner
            .bootstrapped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TaoError::new(
                ErrorCode::DuplicateCall,
                "config: SetConfigBytes has been called before",
            ));
        }

        self.inner.registry.load_bytes(data, format)?;
        self.bootstrap_tao()?;
        self.inner
            .universe
            .init(self.inner.options.bootstrap_timeout)
            .await
    }

    /// Bootstrap with every unit on its defaults.
    pub async fn develop_mode(&self) -> TaoResult<()> {
        self.set_config_bytes(&[], ConfigFormat::None).await
    }

    /// Try the default config files in order; fall back to develop mode when
    /// none exists.
    pub async fn load_default_config(&self) -> TaoResult<()> {
        let found = self
            .inner
            .options
            .default_config_paths
            .iter()
            .find(|path| path.is_file())
            .cloned();

        match found {
            Some(path) => self.set_config_path(path).await,
            None => {
                tracing::warn!(
                    searched = ?self.inner.options.default_config_paths,
                    "No config file found, using defaults"
                );
                self.develop_mode().await
            }
        }
    }

    /// Register every unit that provides a task into the root pipeline and
    /// run it. Bootstraps in develop mode first if no config was supplied.
    pub async fn run(&self, ctx: Option<Context>, param: Option<Parameter>) -> TaoResult<()> {
        let ctx = ctx.unwrap_or_default();
        let param = param.unwrap_or_default();

        if !self.is_bootstrapped() {
            tracing::warn!("Engine not configured, falling back to develop mode");
            match self.develop_mode().await {
                Err(e) if e.is(&ErrorCode::DuplicateCall) => {}
                other => other?,
            }
        }

        self.inner.root.state().check_run("tao", ROOT_PIPELINE)?;
        if ctx.is_done() {
            return Err(TaoError::new(
                ErrorCode::ContextCanceled,
                "tao: context has been canceled",
            ));
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(TaoError::new(
                ErrorCode::TaskRunTwice,
                format!("tao: Run called twice for tao {ROOT_PIPELINE}"),
            ));
        }

        for (key, unit) in self.inner.registry.units() {
            let Some(task) = unit.to_task() else {
                continue;
            };
            tracing::debug!(unit = %key, task = %task.name(), "Registering unit task");
            self.inner
                .root
                .register(PipeTask::new(task).run_after(unit.run_after()))?;
        }

        tracing::debug!("config data: \n{}", self.inner.registry.dump());
        self.inner.root.run(ctx, param).await
    }

    /// Close the root pipeline, then the universe. Both are attempted and
    /// their errors merged.
    pub fn close(&self) -> TaoResult<()> {
        let mut err = None;
        if let Err(e) = self.inner.root.close() {
            TaoError::merge_into(&mut err, &e);
        }
        if let Err(e) = self.inner.universe.close() {
            TaoError::merge_into(&mut err, &e);
        }

        match err {
            Some(err) => {
                tracing::warn!("Engine closed with errors: {}", err);
                Err(err)
            }
            None => {
                tracing::info!("Engine closed");
                Ok(())
            }
        }
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.inner.bootstrapped.load(Ordering::SeqCst)
    }

    /// Config file used for bootstrap, if any.
    pub fn config_path(&self) -> Option<PathBuf> {
        self.inner.config_path.read().clone()
    }

    pub fn registry(&self) -> &ConfigRegistry {
        &self.inner.registry
    }

    /// Root pipeline; results and metrics are read from here after `run`.
    pub fn root(&self) -> &Pipeline {
        &self.inner.root
    }

    pub fn state(&self) -> TaskState {
        self.inner.root.state()
    }

    pub fn universe_state(&self) -> TaskState {
        self.inner.universe.state()
    }

    // ========================================================================
    // BOOTSTRAP
    // ========================================================================

    /// Load and store the framework's own section, then install logging and
    /// print the banner.
    fn bootstrap_tao(&self) -> TaoResult<()> {
        let registry = &self.inner.registry;
        let mut config = self.inner.options.tao_defaults.clone();
        match registry.load_into(TAO_CONFIG_KEY, &mut config) {
            Ok(()) => {}
            Err(e) if e.is(&ErrorCode::ConfigNotFound) => {}
            Err(e) => return Err(e),
        }
        config.validate();
        let config = Arc::new(config);
        registry.store(TAO_CONFIG_KEY, Arc::clone(&config))?;

        init_logging(&config.log)
            .map_err(|e| TaoError::wrapped("init: fail to set logger for 'tao'", e))?;

        if !config.banner.hide {
            println!("{}", config.banner.content.trim());
        }
        Ok(())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{FuncTask, SharedTask};
    use serde::Deserialize;
    use serde_json::json;
    use std::io::Write;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(default)]
    struct EchoConfig {
        name: String,
        message: String,
        run_after: Vec<String>,
    }

    impl UnitConfig for EchoConfig {
        fn validate(&mut self) {
            if self.message.is_empty() {
                self.message = format!("{} says hi", self.name);
            }
        }

        fn to_task(&self) -> Option<SharedTask> {
            let message = self.message.clone();
            let key = self.name.clone();
            Some(
                FuncTask::new(self.name.clone(), move |_ctx, param: Parameter| {
                    let message = message.clone();
                    let key = key.clone();
                    async move {
                        let seen = param.keys();
                        param.set(key, json!({"message": message, "seen": seen}));
                        Ok(param)
                    }
                })
                .into_shared(),
            )
        }

        fn run_after(&self) -> Vec<String> {
            self.run_after.clone()
        }
    }

    fn quiet_options() -> EngineOptions {
        let mut tao_defaults = TaoConfig::default();
        tao_defaults.banner.hide = true;
        tao_defaults.log.disable = true;
        EngineOptions {
            default_config_paths: Vec::new(),
            tao_defaults,
            ..EngineOptions::default()
        }
    }

    fn echo(name: &str, run_after: &[&str]) -> EchoConfig {
        EchoConfig {
            name: name.to_string(),
            message: String::new(),
            run_after: run_after.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_orders_units_by_run_after() {
        let engine = Engine::new(quiet_options());
        engine.register("b", echo("b", &["a"]), |_c| Ok(())).unwrap();
        engine.register("a", echo("a", &[]), |_c| Ok(())).unwrap();

        engine
            .set_config_bytes(
                br#"{"tao": {"banner": {"hide": true}}, "a": {"message": "first"}}"#,
                ConfigFormat::Json,
            )
            .await
            .unwrap();

        let param = Parameter::new();
        engine.run(None, Some(param.clone())).await.unwrap();

        assert_eq!(param.get("a").unwrap()["message"], json!("first"));
        assert_eq!(param.get("b").unwrap()["message"], json!("b says hi"));
        let seen_by_b = param.get("b").unwrap()["seen"].clone();
        assert!(seen_by_b.as_array().unwrap().contains(&json!("a")));

        assert_eq!(engine.state(), TaskState::Over);
        assert_eq!(engine.root().task_names().len(), 2);
        engine.close().unwrap();
    }

    #[tokio::test]
    async fn test_config_bytes_only_once() {
        let engine = Engine::new(quiet_options());
        engine.develop_mode().await.unwrap();

        let err = engine
            .set_config_bytes(b"tao: {}", ConfigFormat::Yaml)
            .await
            .unwrap_err();
        assert_eq!(err.code(), &ErrorCode::DuplicateCall);
        assert!(engine.registry().contains(TAO_CONFIG_KEY));
        assert_eq!(engine.universe_state(), TaskState::Over);
    }

    #[tokio::test]
    async fn test_set_config_path_reads_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "tao:\n  banner:\n    hide: true\necho:\n  message: from file").unwrap();

        let engine = Engine::new(quiet_options());
        engine
            .register("echo", echo("echo", &[]), |config: Arc<EchoConfig>| {
                assert_eq!(config.message, "from file");
                Ok(())
            })
            .unwrap();
        engine.set_config_path(file.path()).await.unwrap();

        assert_eq!(engine.config_path().as_deref(), Some(file.path()));
        assert_eq!(
            engine.registry().get::<EchoConfig>("echo").unwrap().message,
            "from file"
        );
    }

    #[tokio::test]
    async fn test_set_config_path_errors() {
        let engine = Engine::new(quiet_options());
        let err = engine
            .set_config_path("/definitely/not/here.yaml")
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("init: fail to read config file"));

        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        let err = engine.set_config_path(file.path()).await.unwrap_err();
        assert_eq!(err.code(), &ErrorCode::ParamInvalid);
        assert!(!engine.is_bootstrapped());
    }

    #[tokio::test]
    async fn test_load_default_config_falls_back_to_develop_mode() {
        let engine = Engine::new(quiet_options());
        engine.load_default_config().await.unwrap();
        assert!(engine.is_bootstrapped());
        assert!(engine.config_path().is_none());
    }

    #[tokio::test]
    async fn test_run_without_config_uses_develop_mode() {
        let engine = Engine::new(quiet_options());
        engine.register("solo", echo("solo", &[]), |_c| Ok(())).unwrap();

        engine.run(None, None).await.unwrap();
        assert!(engine.is_bootstrapped());
        let result = engine.root().result();
        assert_eq!(result.get("solo").unwrap()["solo"]["message"], json!("solo says hi"));
    }

    #[tokio::test]
    async fn test_run_with_canceled_context() {
        let engine = Engine::new(quiet_options());
        engine.develop_mode().await.unwrap();

        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();
        let err = engine.run(Some(ctx), None).await.unwrap_err();
        assert_eq!(err.code(), &ErrorCode::ContextCanceled);
        assert_eq!(engine.state(), TaskState::Runnable);
    }

    #[tokio::test]
    async fn test_close_merges_errors() {
        let engine = Engine::new(quiet_options());
        engine.develop_mode().await.unwrap();
        engine.close().unwrap();

        let err = engine.close().unwrap_err();
        assert_eq!(err.code(), &ErrorCode::Unknown);
        assert_eq!(err.causes().count(), 1);
        assert_eq!(
            err.cause().and_then(|c| c.code()),
            Some(&ErrorCode::TaskCloseTwice)
        );
    }

    #[tokio::test]
    async fn test_tao_defaults_apply_in_develop_mode() {
        let engine = Engine::new(quiet_options());
        engine.develop_mode().await.unwrap();

        let tao = engine.registry().get::<TaoConfig>(TAO_CONFIG_KEY).unwrap();
        assert!(tao.banner.hide);
        assert!(tao.log.disable);
        assert_eq!(tao.log.level, "debug");
    }

    #[tokio::test]
    async fn test_run_twice_reports_lifecycle_error() {
        let engine = Engine::new(quiet_options());
        engine.register("solo", echo("solo", &[]), |_c| Ok(())).unwrap();
        engine.develop_mode().await.unwrap();

        engine.run(None, None).await.unwrap();
        let err = engine.run(None, None).await.unwrap_err();
        assert_eq!(err.code(), &ErrorCode::TaskRunTwice);
        assert_eq!(engine.root().task_names(), vec!["solo"]);

        engine.close().unwrap();
        let err = engine.run(None, None).await.unwrap_err();
        assert_eq!(err.code(), &ErrorCode::TaskClosed);
    }

    #[tokio::test]
    async fn test_run_after_canceled_context_still_allowed() {
        let engine = Engine::new(quiet_options());
        engine.register("solo", echo("solo", &[]), |_c| Ok(())).unwrap();
        engine.develop_mode().await.unwrap();

        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();
        assert!(engine.run(Some(ctx), None).await.is_err());

        engine.run(None, None).await.unwrap();
        assert_eq!(engine.state(), TaskState::Over);
    }
}
