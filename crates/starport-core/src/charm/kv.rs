//! `ckv` module: named key-value stores on the charm account.

use super::store::{DEFAULT_DB, KvStore};
use super::{CharmConfig, CharmCore};
use crate::args::{Args, StringOrBytes};
use crate::binding::{KeyedClientCache, ScriptModule, builtin};
use crate::error::Result;
use crate::marshal::{decode_json, encode_json};
use crate::settings::CharmSettings;
use mlua::{Lua, MultiValue, Table, Value};
use std::sync::Arc;

pub const MODULE_NAME: &str = "ckv";

/// The `ckv` script module
#[derive(Clone)]
pub struct KvModule {
    core: CharmCore,
    stores: Arc<KeyedClientCache<KvStore>>,
}

impl Default for KvModule {
    fn default() -> Self {
        Self::new()
    }
}

impl KvModule {
    pub fn new() -> Self {
        Self::with_core(CharmCore::new(MODULE_NAME))
    }

    pub fn with_config(config: &CharmConfig) -> Self {
        Self::with_core(CharmCore::with_config(MODULE_NAME, config))
    }

    pub fn from_settings(charm: &CharmSettings) -> Self {
        Self::with_core(CharmCore::from_settings(MODULE_NAME, charm))
    }

    fn with_core(core: CharmCore) -> Self {
        Self {
            core,
            stores: Arc::new(KeyedClientCache::new(DEFAULT_DB)),
        }
    }

    pub fn core(&self) -> &CharmCore {
        &self.core
    }

    fn store(&self, db: &str) -> Result<Arc<KvStore>> {
        self.stores.get_or_try_init(db, |name| {
            let store = self.core.client()?.open_kv(name)?;
            Ok(Arc::new(store))
        })
    }

    /// Unpack `args` and open the store named by the `db` parameter.
    fn call<'lua>(&self, op: &str, args: MultiValue<'lua>, params: &[&str]) -> Result<(Args<'lua>, Arc<KvStore>)> {
        let args = Args::unpack(&format!("{MODULE_NAME}.{op}"), args, params)?;
        let db: String = args.get_or("db", String::new())?;
        let store = self.store(&db)?;
        tracing::debug!(module = MODULE_NAME, op, db = store.name(), "kv operation");
        Ok((args, store))
    }

    fn get<'lua>(&self, lua: &'lua Lua, args: MultiValue<'lua>) -> Result<Value<'lua>> {
        let (args, store) = self.call("get", args, &["key", "db?"])?;
        let key: StringOrBytes = args.require("key")?;
        let value = store.get(key.as_bytes())?.unwrap_or_default();
        Ok(Value::String(lua.create_string(value)?))
    }

    fn set<'lua>(&self, args: MultiValue<'lua>) -> Result<Value<'lua>> {
        let (args, store) = self.call("set", args, &["key", "value*", "db?"])?;
        let key: StringOrBytes = args.require("key")?;
        let value: StringOrBytes = args.require("value")?;
        store.set(key.as_bytes(), value.as_bytes())?;
        Ok(Value::Nil)
    }

    fn get_json<'lua>(&self, lua: &'lua Lua, args: MultiValue<'lua>) -> Result<Value<'lua>> {
        let (args, store) = self.call("get_json", args, &["key", "db?"])?;
        let key: StringOrBytes = args.require("key")?;
        match store.get(key.as_bytes())? {
            None => Ok(Value::Nil),
            Some(raw) => decode_json(lua, &String::from_utf8_lossy(&raw)),
        }
    }

    fn set_json<'lua>(&self, args: MultiValue<'lua>) -> Result<Value<'lua>> {
        let (args, store) = self.call("set_json", args, &["key", "value*", "db?"])?;
        let key: StringOrBytes = args.require("key")?;
        let value: Value = args.require("value")?;
        store.set(key.as_bytes(), encode_json(value)?.as_bytes())?;
        Ok(Value::Nil)
    }

    fn delete<'lua>(&self, args: MultiValue<'lua>) -> Result<Value<'lua>> {
        let (args, store) = self.call("delete", args, &["key", "db?"])?;
        let key: StringOrBytes = args.require("key")?;
        store.delete(key.as_bytes())?;
        Ok(Value::Nil)
    }

    fn list<'lua>(&self, lua: &'lua Lua, args: MultiValue<'lua>) -> Result<Value<'lua>> {
        let (_, store) = self.call("list", args, &["db?"])?;
        let table = lua.create_table()?;
        for (key, value) in store.list()? {
            table.set(lua.create_string(key)?, lua.create_string(value)?)?;
        }
        Ok(Value::Table(table))
    }

    fn list_keys<'lua>(&self, lua: &'lua Lua, args: MultiValue<'lua>) -> Result<Value<'lua>> {
        let (_, store) = self.call("list_keys", args, &["db?"])?;
        let keys = store
            .list()?
            .into_iter()
            .map(|(key, _)| lua.create_string(key))
            .collect::<mlua::Result<Vec<_>>>()?;
        Ok(Value::Table(lua.create_sequence_from(keys)?))
    }

    fn list_values<'lua>(&self, lua: &'lua Lua, args: MultiValue<'lua>) -> Result<Value<'lua>> {
        let (_, store) = self.call("list_values", args, &["db?"])?;
        let values = store
            .list()?
            .into_iter()
            .map(|(_, value)| lua.create_string(value))
            .collect::<mlua::Result<Vec<_>>>()?;
        Ok(Value::Table(lua.create_sequence_from(values)?))
    }

    fn list_db<'lua>(&self, lua: &'lua Lua, args: MultiValue<'lua>) -> Result<Value<'lua>> {
        Args::unpack(&format!("{MODULE_NAME}.list_db"), args, &[])?;
        let names = self.core.client()?.list_kv()?;
        Ok(Value::Table(lua.create_sequence_from(names)?))
    }

    fn sync<'lua>(&self, args: MultiValue<'lua>) -> Result<Value<'lua>> {
        let (_, store) = self.call("sync", args, &["db?"])?;
        store.sync()?;
        Ok(Value::Nil)
    }

    fn reset<'lua>(&self, args: MultiValue<'lua>) -> Result<Value<'lua>> {
        let (_, store) = self.call("reset", args, &["db?"])?;
        store.reset()?;
        Ok(Value::Nil)
    }
}

impl ScriptModule for KvModule {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn load<'lua>(&self, lua: &'lua Lua) -> mlua::Result<Table<'lua>> {
        let this = self.clone();
        let get = builtin(lua, move |lua, args| Ok(this.get(lua, args)?))?;
        let this = self.clone();
        let set = builtin(lua, move |_, args| Ok(this.set(args)?))?;
        let this = self.clone();
        let get_json = builtin(lua, move |lua, args| Ok(this.get_json(lua, args)?))?;
        let this = self.clone();
        let set_json = builtin(lua, move |_, args| Ok(this.set_json(args)?))?;
        let this = self.clone();
        let delete = builtin(lua, move |_, args| Ok(this.delete(args)?))?;
        let this = self.clone();
        let list = builtin(lua, move |lua, args| Ok(this.list(lua, args)?))?;
        let this = self.clone();
        let list_keys = builtin(lua, move |lua, args| Ok(this.list_keys(lua, args)?))?;
        let this = self.clone();
        let list_values = builtin(lua, move |lua, args| Ok(this.list_values(lua, args)?))?;
        let this = self.clone();
        let list_db = builtin(lua, move |lua, args| Ok(this.list_db(lua, args)?))?;
        let this = self.clone();
        let sync = builtin(lua, move |_, args| Ok(this.sync(args)?))?;
        let this = self.clone();
        let reset = builtin(lua, move |_, args| Ok(this.reset(args)?))?;

        let stores = Arc::clone(&self.stores);
        self.core.load_table(
            lua,
            vec![
                ("get", get),
                ("set", set),
                ("get_json", get_json),
                ("set_json", set_json),
                ("delete", delete),
                ("list", list),
                ("list_keys", list_keys),
                ("list_values", list_values),
                ("list_db", list_db),
                ("sync", sync),
                ("reset", reset),
            ],
            move || stores.clear(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::install;
    use crate::error::Error;

    fn setup() -> (tempfile::TempDir, Lua) {
        let dir = tempfile::tempdir().unwrap();
        let config = CharmConfig {
            host: "localhost".into(),
            data_dir: dir.path().to_path_buf(),
            key_file: dir.path().join("id"),
            ssh_port: 1,
            http_port: 2,
        };
        let lua = Lua::new();
        install(&lua, &[&KvModule::with_config(&config)]).unwrap();
        (dir, lua)
    }

    #[test]
    fn missing_key_reads_empty() {
        let (_dir, lua) = setup();
        let (plain, json): (String, Value) = lua
            .load("return ckv.get('nope'), ckv.get_json('nope')")
            .eval()
            .unwrap();
        assert_eq!(plain, "");
        assert!(json.is_nil());
    }

    #[test]
    fn stores_are_separate() {
        let (dir, lua) = setup();
        let (a, b): (String, String) = lua
            .load(
                r#"
                ckv.set("k", "default")
                ckv.set("k", "other", "notes")
                return ckv.get("k"), ckv.get{key = "k", db = "notes"}
                "#,
            )
            .eval()
            .unwrap();
        assert_eq!(a, "default");
        assert_eq!(b, "other");
        assert!(dir.path().join("kv").join(DEFAULT_DB).join("kv.db").exists());

        let dbs: Vec<String> = lua.load("return ckv.list_db()").eval().unwrap();
        assert_eq!(dbs, vec!["notes".to_string(), DEFAULT_DB.to_string()]);
    }

    #[test]
    fn json_values() {
        let (_dir, lua) = setup();
        let (theme, size, raw): (String, i64, String) = lua
            .load(
                r#"
                ckv.set_json("prefs", {theme = "dark", size = 3}, "settings")
                local p = ckv.get_json("prefs", "settings")
                return p.theme, p.size, ckv.get("prefs", "settings")
                "#,
            )
            .eval()
            .unwrap();
        assert_eq!(theme, "dark");
        assert_eq!(size, 3);
        assert!(raw.contains("\"theme\":\"dark\""));
    }

    #[test]
    fn json_record_named_like_params_is_stored_whole() {
        let (_dir, lua) = setup();
        let (raw, value, db, other_db): (String, i64, String, Vec<String>) = lua
            .load(
                r#"
                ckv.set_json("cfg", {value = 5, db = "elsewhere"})
                local back = ckv.get_json("cfg")
                return ckv.get("cfg"), back.value, back.db, ckv.list_db()
                "#,
            )
            .eval()
            .unwrap();
        assert!(raw.contains("\"value\":5"));
        assert_eq!(value, 5);
        assert_eq!(db, "elsewhere");
        assert_eq!(other_db, vec![DEFAULT_DB.to_string()]);
    }

    #[test]
    fn table_for_plain_value_is_rejected() {
        let (_dir, lua) = setup();
        let err = lua.load("ckv.set('k', {value = 'v'})").exec().unwrap_err();
        assert!(matches!(Error::from_lua(&err), Some(Error::Argument(_))));
    }

    #[test]
    fn listing_in_key_order() {
        let (_dir, lua) = setup();
        let (keys, values, b): (Vec<String>, Vec<String>, String) = lua
            .load(
                r#"
                ckv.set("b", "2"); ckv.set("a", "1"); ckv.set("c", "3")
                ckv.delete("c")
                local all = ckv.list()
                return ckv.list_keys(), ckv.list_values(), all.b
                "#,
            )
            .eval()
            .unwrap();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(values, vec!["1", "2"]);
        assert_eq!(b, "2");
    }

    #[test]
    fn reset_and_sync() {
        let (_dir, lua) = setup();
        let n: i64 = lua
            .load(
                r#"
                ckv.set("a", "1")
                ckv.sync()
                ckv.reset()
                return #ckv.list_keys()
                "#,
            )
            .eval()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn bad_db_name_is_validation_error() {
        let (_dir, lua) = setup();
        let err = lua.load("ckv.get('k', '../escape')").exec().unwrap_err();
        assert!(matches!(Error::from_lua(&err), Some(Error::Validation(_))));
    }

    #[test]
    fn setter_switches_data_dir() {
        let (_dir, lua) = setup();
        let other = tempfile::tempdir().unwrap();
        lua.load("ckv.set('k', 'v')").exec().unwrap();
        lua.load(format!("ckv.set_data_dir({:?})", other.path().to_string_lossy()))
            .exec()
            .unwrap();
        let v: String = lua.load("return ckv.get('k')").eval().unwrap();
        assert_eq!(v, "");
        assert!(other.path().join("kv").join(DEFAULT_DB).exists());
    }

    #[test]
    fn get_bio_is_shared() {
        let (_dir, lua) = setup();
        let id: String = lua.load("return ckv.get_bio().id").eval().unwrap();
        assert_eq!(id.len(), 32);
    }
}
