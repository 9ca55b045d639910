//! Thread-safe key/value bag passed into and out of every task.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use serde_json::Value;
use tao_shared::{ErrorCode, TaoError, TaoResult};

/// Shared parameter bag.
///
/// Cloning the handle shares the underlying map, which is how one input is
/// threaded through concurrently running tasks. Use [`Parameter::snapshot`]
/// for a copy that is decoupled from later mutations.
#[derive(Clone, Default)]
pub struct Parameter {
    params: Arc<RwLock<HashMap<String, Value>>>,
}

impl Parameter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.params.read().get(key).cloned()
    }

    /// Typed read. Fails with `ParamInvalid` when the stored value does not
    /// deserialize into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> TaoResult<Option<T>> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        serde_json::from_value(value).map(Some).map_err(|e| {
            TaoError::new(
                ErrorCode::ParamInvalid,
                format!("param: value of {key} has unexpected type: {e}"),
            )
        })
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.params.write().insert(key.into(), value.into());
    }

    pub fn delete(&self, key: &str) -> Option<Value> {
        self.params.write().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.params.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.params.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.read().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.params.read().keys().cloned().collect()
    }

    /// Shallow copy of the current map. Values are not shared with the
    /// original afterwards.
    pub fn snapshot(&self) -> Parameter {
        let params = self.params.read().clone();
        Parameter {
            params: Arc::new(RwLock::new(params)),
        }
    }

    /// JSON object holding the current contents.
    pub fn to_value(&self) -> Value {
        let params = self.params.read();
        Value::Object(params.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    /// Whether both handles point at the same underlying bag.
    pub fn ptr_eq(&self, other: &Parameter) -> bool {
        Arc::ptr_eq(&self.params, &other.params)
    }
}

impl From<HashMap<String, Value>> for Parameter {
    fn from(params: HashMap<String, Value>) -> Self {
        Parameter {
            params: Arc::new(RwLock::new(params)),
        }
    }
}

impl Serialize for Parameter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.params.read().serialize(serializer)
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).unwrap_or_default();
        f.write_str(&json)
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.params.read().iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_get_delete() {
        let p = Parameter::new();
        p.set("tao", "useful");
        assert_eq!(p.get("tao"), Some(json!("useful")));
        assert!(p.contains("tao"));

        assert_eq!(p.delete("tao"), Some(json!("useful")));
        assert!(p.get("tao").is_none());
        assert!(p.is_empty());
    }

    #[test]
    fn test_clone_shares_snapshot_does_not() {
        let p = Parameter::new();
        p.set("a", 1);

        let shared = p.clone();
        let snap = p.snapshot();
        p.set("b", 2);

        assert!(shared.ptr_eq(&p));
        assert_eq!(shared.get("b"), Some(json!(2)));
        assert!(snap.get("b").is_none());
        assert_eq!(snap.get("a"), Some(json!(1)));
    }

    #[test]
    fn test_get_as_typed() {
        let p = Parameter::new();
        p.set("times", 3);
        p.set("name", "tao");

        assert_eq!(p.get_as::<u32>("times").unwrap(), Some(3));
        assert_eq!(p.get_as::<u32>("missing").unwrap(), None);
        let err = p.get_as::<u32>("name").unwrap_err();
        assert_eq!(err.code(), &ErrorCode::ParamInvalid);
    }

    #[test]
    fn test_display_is_json() {
        let p = Parameter::new();
        p.set("message", "hello run");
        assert_eq!(p.to_string(), r#"{"message":"hello run"}"#);
        assert_eq!(p.to_value(), json!({"message": "hello run"}));
    }

    #[test]
    fn test_concurrent_writers() {
        let p = Parameter::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let p = p.clone();
                std::thread::spawn(move || p.set(format!("k{i}"), i))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(p.len(), 8);
    }
}
