//! `cacc` module: charm account profile and keys.

use super::{CharmConfig, CharmCore};
use crate::args::Args;
use crate::binding::{ScriptModule, builtin};
use crate::error::Result;
use crate::marshal::to_script_value;
use crate::settings::CharmSettings;
use mlua::{Lua, MultiValue, Table, Value};

pub const MODULE_NAME: &str = "cacc";

/// The `cacc` script module
#[derive(Clone)]
pub struct AccountModule {
    core: CharmCore,
}

impl Default for AccountModule {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountModule {
    pub fn new() -> Self {
        Self {
            core: CharmCore::new(MODULE_NAME),
        }
    }

    pub fn with_config(config: &CharmConfig) -> Self {
        Self {
            core: CharmCore::with_config(MODULE_NAME, config),
        }
    }

    pub fn from_settings(charm: &CharmSettings) -> Self {
        Self {
            core: CharmCore::from_settings(MODULE_NAME, charm),
        }
    }

    pub fn core(&self) -> &CharmCore {
        &self.core
    }

    fn no_args(op: &str, args: MultiValue) -> Result<()> {
        Args::unpack(&format!("{MODULE_NAME}.{op}"), args, &[])?;
        Ok(())
    }

    fn get_username<'lua>(&self, lua: &'lua Lua, args: MultiValue<'lua>) -> Result<Value<'lua>> {
        Self::no_args("get_username", args)?;
        let name = self.core.client()?.bio()?.name.unwrap_or_default();
        Ok(Value::String(lua.create_string(name)?))
    }

    fn set_username<'lua>(&self, args: MultiValue<'lua>) -> Result<Value<'lua>> {
        let args = Args::unpack(&format!("{MODULE_NAME}.set_username"), args, &["name"])?;
        let name: String = args.require("name")?;
        self.core.client()?.set_name(&name)?;
        tracing::debug!(module = MODULE_NAME, op = "set_username", "username updated");
        Ok(Value::Nil)
    }

    fn get_host<'lua>(&self, lua: &'lua Lua, args: MultiValue<'lua>) -> Result<Value<'lua>> {
        Self::no_args("get_host", args)?;
        Ok(Value::String(lua.create_string(self.core.client()?.host())?))
    }

    fn get_userid<'lua>(&self, lua: &'lua Lua, args: MultiValue<'lua>) -> Result<Value<'lua>> {
        Self::no_args("get_userid", args)?;
        Ok(Value::String(lua.create_string(self.core.client()?.id()?)?))
    }

    fn get_key_files<'lua>(&self, lua: &'lua Lua, args: MultiValue<'lua>) -> Result<Value<'lua>> {
        Self::no_args("get_key_files", args)?;
        let paths = self
            .core
            .client()?
            .key_files()
            .into_iter()
            .map(|p| p.to_string_lossy().into_owned());
        Ok(Value::Table(lua.create_sequence_from(paths)?))
    }

    fn get_keys<'lua>(&self, lua: &'lua Lua, args: MultiValue<'lua>) -> Result<Value<'lua>> {
        Self::no_args("get_keys", args)?;
        to_script_value(lua, &self.core.client()?.public_keys()?)
    }
}

impl ScriptModule for AccountModule {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn load<'lua>(&self, lua: &'lua Lua) -> mlua::Result<Table<'lua>> {
        let this = self.clone();
        let get_username = builtin(lua, move |lua, args| Ok(this.get_username(lua, args)?))?;
        let this = self.clone();
        let set_username = builtin(lua, move |_, args| Ok(this.set_username(args)?))?;
        let this = self.clone();
        let get_host = builtin(lua, move |lua, args| Ok(this.get_host(lua, args)?))?;
        let this = self.clone();
        let get_userid = builtin(lua, move |lua, args| Ok(this.get_userid(lua, args)?))?;
        let this = self.clone();
        let get_key_files = builtin(lua, move |lua, args| Ok(this.get_key_files(lua, args)?))?;
        let this = self.clone();
        let get_keys = builtin(lua, move |lua, args| Ok(this.get_keys(lua, args)?))?;

        self.core.load_table(
            lua,
            vec![
                ("get_username", get_username),
                ("set_username", set_username),
                ("get_host", get_host),
                ("get_userid", get_userid),
                ("get_key_files", get_key_files),
                ("get_keys", get_keys),
            ],
            || {},
        )
    }
}
