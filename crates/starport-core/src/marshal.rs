//! Generic conversion of host structures into script values.
//!
//! Responses are serialized into the self-describing intermediate value
//! and then walked into Lua, so no operation carries bespoke conversion
//! code.

use crate::error::{Error, Result};
use luahelper::{json_to_lua_value, lua_value_to_json};
use mlua::{Lua, Value};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Convert any serializable host value into a Lua value.
pub fn to_script_value<'lua, T: Serialize + ?Sized>(lua: &'lua Lua, value: &T) -> Result<Value<'lua>> {
    let json = serde_json::to_value(value).map_err(|e| Error::Marshal(e.to_string()))?;
    Ok(json_to_lua_value(lua, json)?)
}

/// Convert a Lua value into a host structure.
pub fn from_script_value<T: DeserializeOwned>(value: Value) -> Result<T> {
    let json = lua_value_to_json(value).map_err(|e| Error::Marshal(e.to_string()))?;
    serde_json::from_value(json).map_err(|e| Error::Marshal(e.to_string()))
}

/// Encode a Lua value as compact JSON text.
pub fn encode_json(value: Value) -> Result<String> {
    let json = lua_value_to_json(value).map_err(|e| Error::Marshal(e.to_string()))?;
    serde_json::to_string(&json).map_err(|e| Error::Marshal(e.to_string()))
}

/// Decode JSON text into a Lua value.
pub fn decode_json<'lua>(lua: &'lua Lua, text: &str) -> Result<Value<'lua>> {
    let json: serde_json::Value =
        serde_json::from_str(text).map_err(|e| Error::Marshal(format!("invalid JSON: {e}")))?;
    Ok(json_to_lua_value(lua, json)?)
}
