//! `cfs` module: the charm file store.

use super::files::FileStore;
use super::{CharmConfig, CharmCore};
use crate::args::{Args, StringOrBytes};
use crate::binding::{ClientCache, ScriptModule, builtin};
use crate::error::{Error, Result};
use crate::marshal::to_script_value;
use crate::settings::CharmSettings;
use mlua::{Function, Lua, MultiValue, Table, Value};
use std::sync::Arc;

pub const MODULE_NAME: &str = "cfs";

/// The `cfs` script module
#[derive(Clone)]
pub struct FsModule {
    core: CharmCore,
    files: Arc<ClientCache<FileStore>>,
}

impl Default for FsModule {
    fn default() -> Self {
        Self::new()
    }
}

impl FsModule {
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
            files: Arc::new(ClientCache::new()),
        }
    }

    pub fn core(&self) -> &CharmCore {
        &self.core
    }

    fn files(&self) -> Result<Arc<FileStore>> {
        self.files
            .get_or_try_init(|| Ok(Arc::new(self.core.client()?.file_store()?)))
    }

    fn read<'lua>(&self, lua: &'lua Lua, args: MultiValue<'lua>) -> Result<Value<'lua>> {
        let args = Args::unpack(&format!("{MODULE_NAME}.read"), args, &["name"])?;
        let name: String = args.require("name")?;
        tracing::debug!(module = MODULE_NAME, op = "read", name = %name, "file operation");
        let content = self.files()?.read(&name)?;
        Ok(Value::String(lua.create_string(content)?))
    }

    fn write<'lua>(&self, args: MultiValue<'lua>) -> Result<Value<'lua>> {
        let args = Args::unpack(&format!("{MODULE_NAME}.write"), args, &["name", "content"])?;
        let name: String = args.require("name")?;
        let content: StringOrBytes = args.require("content")?;
        tracing::debug!(module = MODULE_NAME, op = "write", name = %name, bytes = content.as_bytes().len(), "file operation");
        self.files()?.write(&name, content.as_bytes())?;
        Ok(Value::Nil)
    }

    fn remove<'lua>(&self, args: MultiValue<'lua>) -> Result<Value<'lua>> {
        let args = Args::unpack(&format!("{MODULE_NAME}.remove"), args, &["name"])?;
        let name: String = args.require("name")?;
        tracing::debug!(module = MODULE_NAME, op = "remove", name = %name, "file operation");
        self.files()?.remove(&name)?;
        Ok(Value::Nil)
    }

    fn stat<'lua>(&self, lua: &'lua Lua, args: MultiValue<'lua>) -> Result<Value<'lua>> {
        let args = Args::unpack(&format!("{MODULE_NAME}.stat"), args, &["name"])?;
        let name: String = args.require("name")?;
        to_script_value(lua, &self.files()?.stat(&name)?)
    }

    fn listdir<'lua>(&self, lua: &'lua Lua, args: MultiValue<'lua>) -> Result<Value<'lua>> {
        let fname = format!("{MODULE_NAME}.listdir");
        let args = Args::unpack(&fname, args, &["path", "recursive?", "filter?"])?;
        let path: String = args.require("path")?;
        let recursive: bool = args.get_or("recursive", false)?;
        let filter: Option<Function> = args.get("filter")?;

        let paths = self.files()?.walk(&path, recursive, |p| match &filter {
            None => Ok(true),
            Some(filter) => match filter.call::<_, Value>(p)? {
                Value::Boolean(keep) => Ok(keep),
                other => Err(Error::Argument(format!(
                    "{fname}: filter {p:?}: got {}, want bool",
                    other.type_name()
                ))),
            },
        })?;
        Ok(Value::Table(lua.create_sequence_from(paths)?))
    }
}

impl ScriptModule for FsModule {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn load<'lua>(&self, lua: &'lua Lua) -> mlua::Result<Table<'lua>> {
        let this = self.clone();
        let read = builtin(lua, move |lua, args| Ok(this.read(lua, args)?))?;
        let this = self.clone();
        let write = builtin(lua, move |_, args| Ok(this.write(args)?))?;
        let this = self.clone();
        let remove = builtin(lua, move |_, args| Ok(this.remove(args)?))?;
        let this = self.clone();
        let stat = builtin(lua, move |lua, args| Ok(this.stat(lua, args)?))?;
        let this = self.clone();
        let listdir = builtin(lua, move |lua, args| Ok(this.listdir(lua, args)?))?;

        let files = Arc::clone(&self.files);
        self.core.load_table(
            lua,
            vec![
                ("read", read),
                ("write", write),
                ("remove", remove),
                ("stat", stat),
                ("listdir", listdir),
            ],
            move || files.invalidate(),
        )
    }
}
