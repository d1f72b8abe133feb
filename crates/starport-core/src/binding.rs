//! Module bindings: a config store, a cached service client and the table
//! of builtins a script sees.

use crate::config_store::{ConfigStore, ConfigValue};
use crate::error::{Error, Result};
use crate::retry::CancelToken;
use mlua::{Function, Lua, MultiValue, Table, Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// A loadable script module.
pub trait ScriptModule {
    /// Name used for `require` and the global binding
    fn name(&self) -> &'static str;

    /// Build the module table inside `lua`.
    fn load<'lua>(&self, lua: &'lua Lua) -> mlua::Result<Table<'lua>>;
}

/// Install `modules` into `package.loaded` and as globals.
pub fn install(lua: &Lua, modules: &[&dyn ScriptModule]) -> mlua::Result<()> {
    let globals = lua.globals();
    let loaded: Option<Table> = match globals.get::<_, Value>("package")? {
        Value::Table(package) => package.get("loaded").ok(),
        _ => None,
    };
    for module in modules {
        let table = module.load(lua)?;
        if let Some(loaded) = &loaded {
            loaded.set(module.name(), table.clone())?;
        }
        globals.set(module.name(), table)?;
        tracing::debug!(module = module.name(), "module installed");
    }
    Ok(())
}

/// Create a Lua builtin from a closure over unpacked call arguments.
pub fn builtin<'lua, F>(lua: &'lua Lua, func: F) -> mlua::Result<Function<'lua>>
where
    F: Fn(&'lua Lua, MultiValue<'lua>) -> mlua::Result<Value<'lua>> + Send + 'static,
{
    lua.create_function(func)
}

/// Config plus cancellation shared by every builtin of one module.
pub struct ModuleBinding<T> {
    name: &'static str,
    store: Arc<ConfigStore<T>>,
    cancel: CancelToken,
}

impl<T> Clone for ModuleBinding<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            store: Arc::clone(&self.store),
            cancel: self.cancel.clone(),
        }
    }
}

impl<T: ConfigValue> ModuleBinding<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            store: Arc::new(ConfigStore::new()),
            cancel: CancelToken::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn store(&self) -> &Arc<ConfigStore<T>> {
        &self.store
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn set_cancel_token(&mut self, cancel: CancelToken) {
        self.cancel = cancel;
    }

    /// Build the module table: one `set_<key>` per declared key,
    /// `get_config`, then `ops`. `on_set` runs whenever a script setter
    /// changes the configuration.
    pub fn register_operations<'lua, F>(
        &self,
        lua: &'lua Lua,
        ops: Vec<(&'static str, Function<'lua>)>,
        on_set: F,
    ) -> mlua::Result<Table<'lua>>
    where
        F: Fn() + Clone + Send + Sync + 'static,
    {
        let table = lua.create_table()?;
        for key in self.store.keys() {
            let setter = self
                .store
                .expose_setter(lua, self.name, &key, on_set.clone())?;
            table.set(format!("set_{key}"), setter)?;
        }

        let store = Arc::clone(&self.store);
        let fname = format!("{}.get_config", self.name);
        table.set(
            "get_config",
            lua.create_function(move |lua, args: MultiValue| {
                crate::args::Args::unpack(&fname, args, &[])?;
                let config = lua.create_table()?;
                for (key, value) in store.snapshot() {
                    config.set(key, luahelper::json_to_lua_value(lua, value.to_json())?)?;
                }
                Ok(config)
            })?,
        )?;

        for (name, func) in ops {
            table.set(name, func)?;
        }
        Ok(table)
    }
}

/// At most one live client, built on first use.
///
/// A client installed with [`ClientCache::set`] is pinned and survives
/// [`ClientCache::invalidate`].
pub struct ClientCache<C: ?Sized> {
    slot: Mutex<Option<(Arc<C>, bool)>>,
}

impl<C: ?Sized> Default for ClientCache<C> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

impl<C: ?Sized> ClientCache<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached client or build one with `make`. Configuration
    /// failures from `make` surface as [`Error::ClientUnavailable`].
    pub fn get_or_try_init<F>(&self, make: F) -> Result<Arc<C>>
    where
        F: FnOnce() -> Result<Arc<C>>,
    {
        let mut slot = self.slot.lock();
        if let Some((client, _)) = slot.as_ref() {
            return Ok(Arc::clone(client));
        }
        let client = make().map_err(client_unavailable)?;
        tracing::debug!("service client created");
        *slot = Some((Arc::clone(&client), false));
        Ok(client)
    }

    /// Install a client, e.g. a fake in tests or one built by the host.
    pub fn set(&self, client: Arc<C>) {
        *self.slot.lock() = Some((client, true));
    }

    /// Drop a client built from configuration so the next call rebuilds it.
    pub fn invalidate(&self) {
        let mut slot = self.slot.lock();
        if matches!(slot.as_ref(), Some((_, false))) {
            *slot = None;
        }
    }

    pub fn is_cached(&self) -> bool {
        self.slot.lock().is_some()
    }
}

/// One cached client per instance name, for services with several named
/// endpoints.
pub struct KeyedClientCache<C: ?Sized> {
    default_name: &'static str,
    clients: Mutex<HashMap<String, Arc<C>>>,
}

impl<C: ?Sized> KeyedClientCache<C> {
    pub fn new(default_name: &'static str) -> Self {
        Self {
            default_name,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Empty names resolve to the default instance.
    pub fn resolve_name<'a>(&self, name: &'a str) -> &'a str {
        if name.is_empty() { self.default_name } else { name }
    }

    pub fn get_or_try_init<F>(&self, name: &str, make: F) -> Result<Arc<C>>
    where
        F: FnOnce(&str) -> Result<Arc<C>>,
    {
        let name = self.resolve_name(name);
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(name) {
            return Ok(Arc::clone(client));
        }
        let client = make(name)?;
        tracing::debug!(instance = name, "instance client created");
        clients.insert(name.to_string(), Arc::clone(&client));
        Ok(client)
    }

    pub fn clear(&self) {
        self.clients.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }
}

fn client_unavailable(err: Error) -> Error {
    match err {
        Error::MissingConfig(_)
        | Error::NotConfigured(_)
        | Error::UnsupportedProvider(_)
        | Error::TypeMismatch { .. } => Error::ClientUnavailable(Box::new(err)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fake(usize);

    #[test]
    fn client_built_once() {
        let cache: ClientCache<Fake> = ClientCache::new();
        let builds = AtomicUsize::new(0);
        for _ in 0..3 {
            let c = cache
                .get_or_try_init(|| Ok(Arc::new(Fake(builds.fetch_add(1, Ordering::SeqCst)))))
                .unwrap();
            assert_eq!(c.0, 0);
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalidate_rebuilds_unless_pinned() {
        let cache: ClientCache<Fake> = ClientCache::new();
        cache.get_or_try_init(|| Ok(Arc::new(Fake(1)))).unwrap();
        cache.invalidate();
        assert!(!cache.is_cached());

        cache.set(Arc::new(Fake(7)));
        cache.invalidate();
        let c = cache.get_or_try_init(|| Ok(Arc::new(Fake(2)))).unwrap();
        assert_eq!(c.0, 7);
    }

    #[test]
    fn config_failure_is_client_unavailable() {
        let cache: ClientCache<Fake> = ClientCache::new();
        let err = cache
            .get_or_try_init(|| Err(Error::MissingConfig("resend_api_key".into())))
            .err()
            .unwrap();
        assert!(matches!(err, Error::ClientUnavailable(ref inner) if matches!(**inner, Error::MissingConfig(_))));
        assert!(!cache.is_cached());
    }

    #[test]
    fn keyed_cache_defaults_and_separates() {
        let cache: KeyedClientCache<String> = KeyedClientCache::new("default.db");
        let a = cache.get_or_try_init("", |n| Ok(Arc::new(n.to_string()))).unwrap();
        assert_eq!(a.as_str(), "default.db");
        let b = cache.get_or_try_init("notes", |n| Ok(Arc::new(n.to_string()))).unwrap();
        assert_eq!(b.as_str(), "notes");
        let again = cache
            .get_or_try_init("default.db", |_| Err(Error::Validation("rebuilt".into())))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn register_operations_builds_table() {
        let lua = Lua::new();
        let binding: ModuleBinding<String> = ModuleBinding::new("demo");
        binding.store().declare("api_key");
        binding.store().set_value("endpoint", "http://x".into());
        let ping = builtin(&lua, |lua, _| Ok(Value::String(lua.create_string("pong")?))).unwrap();
        let table = binding
            .register_operations(&lua, vec![("ping", ping)], || {})
            .unwrap();
        install_table(&lua, "demo", table);

        let (pong, endpoint, missing): (String, String, Value) = lua
            .load(
                r#"
                demo.set_api_key("sk")
                local cfg = demo.get_config()
                return demo.ping(), cfg.endpoint, cfg.other
                "#,
            )
            .eval()
            .unwrap();
        assert_eq!(pong, "pong");
        assert_eq!(endpoint, "http://x");
        assert!(missing.is_nil());
        assert_eq!(binding.store().get("api_key").unwrap(), "sk");
    }

    struct Demo;

    impl ScriptModule for Demo {
        fn name(&self) -> &'static str {
            "demo"
        }

        fn load<'lua>(&self, lua: &'lua Lua) -> mlua::Result<Table<'lua>> {
            let t = lua.create_table()?;
            t.set("answer", 42)?;
            Ok(t)
        }
    }

    fn install_table(lua: &Lua, name: &str, table: Table) {
        lua.globals().set(name, table).unwrap();
    }

    #[test]
    fn install_sets_global_and_require() {
        let lua = Lua::new();
        install(&lua, &[&Demo]).unwrap();
        let (a, b): (i64, i64) = lua
            .load("return demo.answer, require('demo').answer")
            .eval()
            .unwrap();
        assert_eq!((a, b), (42, 42));
    }
}
