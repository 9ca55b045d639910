//! Registry of raw and validated unit configurations.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tao_shared::{ErrorCode, TaoError, TaoResult};

use super::{ConfigFormat, UnitConfig};

/// Raw configuration sections plus every validated unit config.
///
/// **Cloning**: cheap via `Arc`; all clones share the same state.
#[derive(Clone, Default)]
pub struct ConfigRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

#[derive(Default)]
struct RegistryInner {
    /// Sections parsed from the config file, keyed by unit name.
    raw: HashMap<String, Value>,
    /// Validated configs in store order.
    entries: Vec<ConfigEntry>,
}

struct ConfigEntry {
    key: String,
    unit: Arc<dyn UnitConfig>,
    any: Arc<dyn Any + Send + Sync>,
    snapshot: Value,
}

impl ConfigRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `data` into the raw layer, replacing anything loaded before.
    pub fn load_bytes(&self, data: &[u8], format: ConfigFormat) -> TaoResult<()> {
        let raw = parse_sections(data, format).map_err(|e| {
            TaoError::wrapped(format!("config: fail to parse {format} data"), e)
        })?;

        tracing::debug!(format = %format, sections = raw.len(), "Loaded raw config");
        self.inner.write().raw = raw;
        Ok(())
    }

    /// Deserialize the raw section for `key`.
    ///
    /// Fails with `ConfigNotFound` when the section does not exist, which
    /// callers usually treat as "use defaults".
    pub fn load<C: DeserializeOwned>(&self, key: &str) -> TaoResult<C> {
        let value = self.inner.read().raw.get(key).cloned().ok_or_else(|| {
            TaoError::new(ErrorCode::ConfigNotFound, format!("config: {key} not found"))
        })?;

        serde_json::from_value(value).map_err(|e| {
            TaoError::new(
                ErrorCode::ParamInvalid,
                format!("config: {key} is malformed: {e}"),
            )
        })
    }

    /// Overlay the raw section for `key` onto `config`. Keys missing from the
    /// section keep the values already in `config`.
    pub fn load_into<C>(&self, key: &str, config: &mut C) -> TaoResult<()>
    where
        C: Serialize + DeserializeOwned,
    {
        let section = self.inner.read().raw.get(key).cloned().ok_or_else(|| {
            TaoError::new(ErrorCode::ConfigNotFound, format!("config: {key} not found"))
        })?;

        let mut merged = serde_json::to_value(&*config)?;
        overlay(&mut merged, section);
        *config = serde_json::from_value(merged).map_err(|e| {
            TaoError::new(
                ErrorCode::ParamInvalid,
                format!("config: {key} is malformed: {e}"),
            )
        })?;
        Ok(())
    }

    /// Record a validated config. A key can only be stored once.
    pub fn store<C>(&self, key: &str, config: Arc<C>) -> TaoResult<()>
    where
        C: UnitConfig + Serialize,
    {
        let snapshot = serde_json::to_value(config.as_ref())?;

        let mut inner = self.inner.write();
        if inner.entries.iter().any(|entry| entry.key == key) {
            return Err(TaoError::new(
                ErrorCode::DuplicateCall,
                format!("config: {key} has been set before"),
            ));
        }

        let unit: Arc<dyn UnitConfig> = config.clone();
        let any: Arc<dyn Any + Send + Sync> = config;
        inner.entries.push(ConfigEntry {
            key: key.to_string(),
            unit,
            any,
            snapshot,
        });
        Ok(())
    }

    /// Typed access to a stored config.
    pub fn get<C: UnitConfig>(&self, key: &str) -> Option<Arc<C>> {
        let inner = self.inner.read();
        let entry = inner.entries.iter().find(|entry| entry.key == key)?;
        Arc::clone(&entry.any).downcast::<C>().ok()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.read().entries.iter().any(|entry| entry.key == key)
    }

    /// Stored configs in store order.
    pub fn units(&self) -> Vec<(String, Arc<dyn UnitConfig>)> {
        self.inner
            .read()
            .entries
            .iter()
            .map(|entry| (entry.key.clone(), Arc::clone(&entry.unit)))
            .collect()
    }

    /// Pretty JSON of every stored config.
    pub fn dump(&self) -> String {
        let inner = self.inner.read();
        let map: Map<String, Value> = inner
            .entries
            .iter()
            .map(|entry| (entry.key.clone(), entry.snapshot.clone()))
            .collect();
        serde_json::to_string_pretty(&map).unwrap_or_default()
    }
}

fn overlay(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(slot) => overlay(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

fn parse_sections(data: &[u8], format: ConfigFormat) -> TaoResult<HashMap<String, Value>> {
    if format == ConfigFormat::None || data.iter().all(u8::is_ascii_whitespace) {
        return Ok(HashMap::new());
    }

    let sections = match format {
        ConfigFormat::None => HashMap::new(),
        ConfigFormat::Yaml => serde_yaml::from_slice(data)
            .map_err(|e| TaoError::new(ErrorCode::ParamInvalid, e.to_string()))?,
        ConfigFormat::Json => serde_json::from_slice(data)
            .map_err(|e| TaoError::new(ErrorCode::ParamInvalid, e.to_string()))?,
        ConfigFormat::Toml => {
            let text = std::str::from_utf8(data)
                .map_err(|e| TaoError::new(ErrorCode::ParamInvalid, e.to_string()))?;
            toml::from_str(text)
                .map_err(|e| TaoError::new(ErrorCode::ParamInvalid, e.to_string()))?
        }
    };
    Ok(sections)
}

impl std::fmt::Debug for ConfigRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("ConfigRegistry")
            .field("raw", &inner.raw.keys().collect::<Vec<_>>())
            .field(
                "stored",
                &inner.entries.iter().map(|e| &e.key).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    #[serde(default)]
    struct ServerConfig {
        port: u16,
        host: String,
    }

    impl UnitConfig for ServerConfig {
        fn validate(&mut self) {
            if self.port == 0 {
                self.port = 8080;
            }
        }
    }

    #[test]
    fn test_load_yaml_section() {
        let registry = ConfigRegistry::new();
        registry
            .load_bytes(b"server:\n  port: 9000\n  host: localhost\n", ConfigFormat::Yaml)
            .unwrap();

        let config: ServerConfig = registry.load("server").unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "localhost");
    }

    #[test]
    fn test_load_json_and_toml_sections() {
        let registry = ConfigRegistry::new();
        registry
            .load_bytes(br#"{"server": {"port": 7000}}"#, ConfigFormat::Json)
            .unwrap();
        assert_eq!(registry.load::<ServerConfig>("server").unwrap().port, 7000);

        registry
            .load_bytes(b"[server]\nport = 6000\n", ConfigFormat::Toml)
            .unwrap();
        assert_eq!(registry.load::<ServerConfig>("server").unwrap().port, 6000);
    }

    #[test]
    fn test_missing_section_is_config_not_found() {
        let registry = ConfigRegistry::new();
        registry.load_bytes(b"", ConfigFormat::Yaml).unwrap();
        let err = registry.load::<ServerConfig>("server").unwrap_err();
        assert_eq!(err.code(), &ErrorCode::ConfigNotFound);
    }

    #[test]
    fn test_malformed_data_rejected() {
        let registry = ConfigRegistry::new();
        let err = registry
            .load_bytes(b"{not json", ConfigFormat::Json)
            .unwrap_err();
        assert!(err.to_string().starts_with("config: fail to parse json data"));

        registry
            .load_bytes(br#"{"server": {"port": "high"}}"#, ConfigFormat::Json)
            .unwrap();
        let err = registry.load::<ServerConfig>("server").unwrap_err();
        assert_eq!(err.code(), &ErrorCode::ParamInvalid);
    }

    #[test]
    fn test_load_into_keeps_unset_fields() {
        let registry = ConfigRegistry::new();
        registry
            .load_bytes(b"server:\n  port: 9000\n", ConfigFormat::Yaml)
            .unwrap();

        let mut config = ServerConfig {
            port: 1,
            host: "example.org".into(),
        };
        registry.load_into("server", &mut config).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "example.org");

        let err = registry.load_into("client", &mut config).unwrap_err();
        assert_eq!(err.code(), &ErrorCode::ConfigNotFound);
        assert_eq!(config.port, 9000);
    }

    #[test]
    fn test_store_once_and_get_typed() {
        let registry = ConfigRegistry::new();
        let mut config = ServerConfig::default();
        config.validate();
        registry.store("server", Arc::new(config)).unwrap();

        let err = registry
            .store("server", Arc::new(ServerConfig::default()))
            .unwrap_err();
        assert_eq!(err.code(), &ErrorCode::DuplicateCall);

        let stored = registry.get::<ServerConfig>("server").unwrap();
        assert_eq!(stored.port, 8080);
        assert!(registry.get::<ServerConfig>("client").is_none());
        assert_eq!(registry.units().len(), 1);
        assert!(registry.dump().contains("\"port\": 8080"));
    }
}
