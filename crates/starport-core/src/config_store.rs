//! Named configuration slots backed by deferred value producers.
//!
//! A producer is invoked on every read, so values sourced from the
//! environment or a settings file stay current between calls. Each declared
//! key also gets a script-callable `set_<key>` builtin.

use crate::args::Args;
use crate::error::{Error, Result};
use mlua::{Function, Lua, MultiValue, Value};
use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Deferred producer of a configuration value
pub type ConfigGetter<T> = Arc<dyn Fn() -> T + Send + Sync>;

/// Value types a [`ConfigStore`] can hold.
pub trait ConfigValue: Clone + Send + Sync + 'static {
    /// Name reported in type mismatch errors
    const TYPE_NAME: &'static str;

    /// Strict runtime type check of a script value; `None` on mismatch.
    fn from_lua(value: &Value) -> Option<Self>;

    fn to_json(&self) -> JsonValue;

    /// Blank values count as absent when a key is required.
    fn is_blank(&self) -> bool {
        false
    }
}

impl ConfigValue for String {
    const TYPE_NAME: &'static str = "string";

    fn from_lua(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        }
    }

    fn to_json(&self) -> JsonValue {
        JsonValue::String(self.clone())
    }

    fn is_blank(&self) -> bool {
        self.trim().is_empty()
    }
}

impl ConfigValue for bool {
    const TYPE_NAME: &'static str = "bool";

    fn from_lua(value: &Value) -> Option<Self> {
        match value {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    fn to_json(&self) -> JsonValue {
        JsonValue::Bool(*self)
    }
}

impl ConfigValue for i64 {
    const TYPE_NAME: &'static str = "int";

    fn from_lua(value: &Value) -> Option<Self> {
        match value {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    fn to_json(&self) -> JsonValue {
        JsonValue::from(*self)
    }
}

impl ConfigValue for f64 {
    const TYPE_NAME: &'static str = "float";

    fn from_lua(value: &Value) -> Option<Self> {
        match value {
            Value::Integer(i) => Some(*i as f64),
            Value::Number(f) => Some(*f),
            _ => None,
        }
    }

    fn to_json(&self) -> JsonValue {
        serde_json::Number::from_f64(*self).map_or(JsonValue::Null, JsonValue::Number)
    }
}

/// Key to producer map. A key may be declared without a producer, in which
/// case reads fail with [`Error::NotConfigured`] but a setter still exists.
pub struct ConfigStore<T> {
    slots: RwLock<BTreeMap<String, Option<ConfigGetter<T>>>>,
}

impl<T: ConfigValue> Default for ConfigStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ConfigValue> ConfigStore<T> {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(BTreeMap::new()),
        }
    }

    /// Declare a key without binding it. Existing bindings are kept.
    pub fn declare(&self, key: &str) {
        self.slots.write().entry(key.to_string()).or_insert(None);
    }

    /// Bind `key` to `producer`, replacing any previous binding.
    pub fn set<F>(&self, key: &str, producer: F)
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.slots
            .write()
            .insert(key.to_string(), Some(Arc::new(producer)));
    }

    /// Bind `key` to an already shared producer.
    pub fn set_getter(&self, key: &str, getter: ConfigGetter<T>) {
        self.slots.write().insert(key.to_string(), Some(getter));
    }

    /// Bind `key` to a fixed value.
    pub fn set_value(&self, key: &str, value: T) {
        self.set(key, move || value.clone());
    }

    /// Invoke the producer bound to `key`.
    pub fn get(&self, key: &str) -> Result<T> {
        // Clone the producer out so it runs without the lock held.
        let producer = self.slots.read().get(key).cloned().flatten();
        match producer {
            Some(producer) => Ok(producer()),
            None => Err(Error::NotConfigured(key.to_string())),
        }
    }

    /// Like [`Self::get`], but unset and blank values are `None`.
    pub fn get_present(&self, key: &str) -> Option<T> {
        self.get(key).ok().filter(|v| !v.is_blank())
    }

    /// All declared keys in sorted order
    pub fn keys(&self) -> Vec<String> {
        self.slots.read().keys().cloned().collect()
    }

    /// Current values of every bound key
    pub fn snapshot(&self) -> BTreeMap<String, T> {
        let producers: Vec<(String, ConfigGetter<T>)> = self
            .slots
            .read()
            .iter()
            .filter_map(|(k, p)| p.clone().map(|p| (k.clone(), p)))
            .collect();
        producers.into_iter().map(|(k, p)| (k, p())).collect()
    }

    /// Read the required `keys` in order; the first unset or blank one fails
    /// with [`Error::MissingConfig`].
    pub fn require(&self, keys: &[&str]) -> Result<Vec<T>> {
        keys.iter()
            .map(|key| {
                self.get_present(key)
                    .ok_or_else(|| Error::MissingConfig((*key).to_string()))
            })
            .collect()
    }

    /// Build the `set_<key>` builtin. It takes exactly one argument named
    /// after the key; `on_set` runs after each successful update.
    pub fn expose_setter<'lua, F>(
        self: &Arc<Self>,
        lua: &'lua Lua,
        module: &str,
        key: &str,
        on_set: F,
    ) -> mlua::Result<Function<'lua>>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let store = Arc::clone(self);
        let key = key.to_string();
        let fname = format!("{module}.set_{key}");
        lua.create_function(move |_, args: MultiValue| {
            let args = Args::unpack(&fname, args, &[key.as_str()])?;
            let value: Value = args.require(&key)?;
            let Some(value) = T::from_lua(&value) else {
                return Err(Error::TypeMismatch {
                    key: key.clone(),
                    expected: T::TYPE_NAME,
                    got: value.type_name().to_string(),
                }
                .into());
            };
            store.set_value(&key, value);
            tracing::debug!(setting = %key, "config updated from script");
            on_set();
            Ok(Value::Nil)
        })
    }
}
