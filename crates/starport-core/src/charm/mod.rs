//! Charm bindings: `ckv` (key-value stores), `cfs` (file store) and `cacc`
//! (account). The three modules share one account backend type and the
//! same connection settings; each keeps its own configuration store.
//!
//! ```lua
//! ckv.set("greeting", "hello")
//! ckv.set_json("prefs", {theme = "dark"}, "settings")
//! cfs.write("notes/today.md", "# Today")
//! print(cacc.get_userid(), cacc.get_username())
//! ```

mod account;
mod client;
mod files;
mod fs;
mod kv;
mod store;

pub use account::AccountModule;
pub use client::{
    Bio, CharmClient, CharmConfig, DEFAULT_HOST, DEFAULT_HTTP_PORT, DEFAULT_SSH_PORT, KEY_FILE_NAME,
    LocalCharm, PublicKey, validate_username,
};
pub use files::{FileStat, FileStore};
pub use fs::FsModule;
pub use kv::KvModule;
pub use store::{DEFAULT_DB, KvStore, list_stores, validate_db_name};

use crate::args::Args;
use crate::binding::{ClientCache, ModuleBinding, builtin};
use crate::error::{Error, Result};
use crate::marshal::to_script_value;
use crate::settings::{CharmSettings, bind_with_env};
use mlua::{Function, Lua, Table};
use std::path::PathBuf;
use std::sync::Arc;

const KEY_HOST: &str = "host";
const KEY_DATA_DIR: &str = "data_dir";
const KEY_KEY_FILE: &str = "key_file";
const KEY_SSH_PORT: &str = "ssh_port";
const KEY_HTTP_PORT: &str = "http_port";

/// Configuration and account client shared by the builtins of one charm
/// module.
#[derive(Clone)]
pub struct CharmCore {
    binding: ModuleBinding<String>,
    client: Arc<ClientCache<dyn CharmClient>>,
}

impl CharmCore {
    pub fn new(module_name: &'static str) -> Self {
        let binding = ModuleBinding::new(module_name);
        for key in [KEY_HOST, KEY_DATA_DIR, KEY_KEY_FILE, KEY_SSH_PORT, KEY_HTTP_PORT] {
            binding.store().declare(key);
        }
        Self {
            binding,
            client: Arc::new(ClientCache::new()),
        }
    }

    pub fn with_config(module_name: &'static str, config: &CharmConfig) -> Self {
        let core = Self::new(module_name);
        let store = core.binding.store();
        store.set_value(KEY_HOST, config.host.clone());
        store.set_value(KEY_DATA_DIR, config.data_dir.to_string_lossy().into_owned());
        store.set_value(KEY_KEY_FILE, config.key_file.to_string_lossy().into_owned());
        store.set_value(KEY_SSH_PORT, config.ssh_port.to_string());
        store.set_value(KEY_HTTP_PORT, config.http_port.to_string());
        core
    }

    /// Values from the settings file, falling back to the `CHARM_*`
    /// environment variables.
    pub fn from_settings(module_name: &'static str, charm: &CharmSettings) -> Self {
        let core = Self::new(module_name);
        let store = core.binding.store();
        bind_with_env(store, KEY_HOST, charm.host.clone(), "CHARM_HOST");
        bind_with_env(store, KEY_DATA_DIR, charm.data_dir.clone(), "CHARM_DATA_DIR");
        bind_with_env(store, KEY_KEY_FILE, charm.key_file.clone(), "CHARM_IDENTITY_KEY");
        bind_with_env(store, KEY_SSH_PORT, charm.ssh_port.map(|p| p.to_string()), "CHARM_SSH_PORT");
        bind_with_env(store, KEY_HTTP_PORT, charm.http_port.map(|p| p.to_string()), "CHARM_HTTP_PORT");
        core
    }

    pub fn binding(&self) -> &ModuleBinding<String> {
        &self.binding
    }

    pub fn name(&self) -> &'static str {
        self.binding.name()
    }

    /// Use `client` instead of opening the local account.
    pub fn set_client(&self, client: Arc<dyn CharmClient>) {
        self.client.set(client);
    }

    /// Current settings with defaults filled in.
    pub fn resolve(&self) -> Result<CharmConfig> {
        let store = self.binding.store();
        let host = store
            .get_present(KEY_HOST)
            .map_or_else(|| DEFAULT_HOST.to_string(), |h| h.trim().to_string());
        let data_dir = match store.get_present(KEY_DATA_DIR) {
            Some(dir) => PathBuf::from(dir.trim()),
            None => dirs::data_dir()
                .map(|d| d.join("charm"))
                .ok_or_else(|| Error::MissingConfig(KEY_DATA_DIR.to_string()))?,
        };
        let key_file = store
            .get_present(KEY_KEY_FILE)
            .map_or_else(|| data_dir.join(KEY_FILE_NAME), |k| PathBuf::from(k.trim()));
        Ok(CharmConfig {
            host,
            key_file,
            ssh_port: self.port(KEY_SSH_PORT, DEFAULT_SSH_PORT)?,
            http_port: self.port(KEY_HTTP_PORT, DEFAULT_HTTP_PORT)?,
            data_dir,
        })
    }

    fn port(&self, key: &str, default: u16) -> Result<u16> {
        match self.binding.store().get_present(key) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| Error::Validation(format!("invalid {key}: {raw:?}"))),
        }
    }

    pub fn client(&self) -> Result<Arc<dyn CharmClient>> {
        self.client.get_or_try_init(|| {
            let config = self.resolve()?;
            Ok(Arc::new(LocalCharm::open(config)?) as Arc<dyn CharmClient>)
        })
    }

    /// Build the module table from `ops` plus the shared `get_bio`.
    /// `on_set` runs after the core has dropped its cached client.
    pub fn load_table<'lua, F>(
        &self,
        lua: &'lua Lua,
        mut ops: Vec<(&'static str, Function<'lua>)>,
        on_set: F,
    ) -> mlua::Result<Table<'lua>>
    where
        F: Fn() + Clone + Send + Sync + 'static,
    {
        let this = self.clone();
        let fname = format!("{}.get_bio", self.name());
        let get_bio = builtin(lua, move |lua, args| {
            Args::unpack(&fname, args, &[])?;
            let bio = this.client()?.bio()?;
            Ok(to_script_value(lua, &bio)?)
        })?;
        ops.insert(0, ("get_bio", get_bio));

        let cache = Arc::clone(&self.client);
        self.binding.register_operations(lua, ops, move || {
            cache.invalidate();
            on_set();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_unset_values() {
        let dir = tempfile::tempdir().unwrap();
        let core = CharmCore::new("ckv");
        core.binding().store().set_value(KEY_DATA_DIR, dir.path().to_string_lossy().into_owned());
        let config = core.resolve().unwrap();
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.ssh_port, DEFAULT_SSH_PORT);
        assert_eq!(config.http_port, DEFAULT_HTTP_PORT);
        assert_eq!(config.key_file, dir.path().join(KEY_FILE_NAME));
    }

    #[test]
    fn bad_port_is_rejected() {
        let core = CharmCore::new("ckv");
        core.binding().store().set_value(KEY_DATA_DIR, "/tmp/x".into());
        core.binding().store().set_value(KEY_SSH_PORT, "70000".into());
        let err = core.resolve().unwrap_err();
        assert!(err.to_string().contains("invalid ssh_port"), "{err}");
    }

    #[test]
    fn settings_values_are_used() {
        let settings = CharmSettings {
            host: Some("charm.internal".into()),
            data_dir: Some("/srv/charm".into()),
            key_file: None,
            ssh_port: Some(2222),
            http_port: None,
        };
        let core = CharmCore::from_settings("cacc", &settings);
        let config = core.resolve().unwrap();
        assert_eq!(config.host, "charm.internal");
        assert_eq!(config.ssh_port, 2222);
        assert_eq!(config.data_dir, PathBuf::from("/srv/charm"));
    }

    #[test]
    fn config_round_trips_through_store() {
        let config = CharmConfig {
            host: "h".into(),
            data_dir: PathBuf::from("/d"),
            key_file: PathBuf::from("/d/k"),
            ssh_port: 1,
            http_port: 2,
        };
        assert_eq!(CharmCore::with_config("cfs", &config).resolve().unwrap(), config);
    }
}
