//! Bridging between Lua values and the self-describing intermediate value
//! model (`serde_json::Value`) that starport bindings use to move structured
//! data across the script boundary.

use mlua::{Lua, Table, Value as LuaValue};
use serde_json::{Map, Number, Value as JsonValue};
use std::collections::HashSet;
use std::fmt;


/// Convert an intermediate value into a Lua value owned by `lua`.
///
/// Objects become tables with string keys, arrays become 1-based sequence
/// tables and `null` becomes `nil`. Integers that fit in `i64` stay
/// integers; everything else is a float.
pub fn json_to_lua_value<'lua>(lua: &'lua Lua, value: JsonValue) -> mlua::Result<LuaValue<'lua>> {
    Ok(match value {
        JsonValue::Null => LuaValue::Nil,
        JsonValue::Bool(b) => LuaValue::Boolean(b),
        JsonValue::Number(n) => number_to_lua(&n),
        JsonValue::String(s) => LuaValue::String(lua.create_string(&s)?),
        JsonValue::Array(items) => {
            let table = lua.create_table()?;
            for (idx, item) in items.into_iter().enumerate() {
                table.set(idx + 1, json_to_lua_value(lua, item)?)?;
            }
            LuaValue::Table(table)
        }
        JsonValue::Object(map) => {
            let table = lua.create_table()?;
            for (key, item) in map {
                table.set(key, json_to_lua_value(lua, item)?)?;
            }
            LuaValue::Table(table)
        }
    })
}

fn number_to_lua<'lua>(n: &Number) -> LuaValue<'lua> {
    if let Some(i) = n.as_i64() {
        LuaValue::Integer(i)
    } else if let Some(u) = n.as_u64() {
        LuaValue::Number(u as f64)
    } else {
        LuaValue::Number(n.as_f64().unwrap_or(f64::NAN))
    }
}

/// Convert a Lua value into the intermediate value model.
///
/// Tables that reference themselves (directly or through a child) have the
/// repeated reference replaced by `null`.
pub fn lua_value_to_json(value: LuaValue) -> mlua::Result<JsonValue> {
    let mut visited = HashSet::new();
    lua_value_to_json_impl(value, &mut visited)
}

fn lua_value_to_json_impl(value: LuaValue, visited: &mut HashSet<usize>) -> mlua::Result<JsonValue> {
    Ok(match value {
        LuaValue::Nil => JsonValue::Null,
        LuaValue::Boolean(b) => JsonValue::Bool(b),
        LuaValue::Integer(i) => JsonValue::Number(i.into()),
        LuaValue::Number(f) => match Number::from_f64(f) {
            Some(n) => JsonValue::Number(n),
            None => {
                return Err(mlua::Error::FromLuaConversionError {
                    from: "number",
                    to: "json",
                    message: Some(format!("{f} cannot be represented")),
                });
            }
        },
        LuaValue::String(s) => match s.to_str() {
            Ok(s) => JsonValue::String(s.to_string()),
            Err(_) => JsonValue::String(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        },
        LuaValue::Table(table) => {
            let ptr = table.to_pointer() as usize;
            if !visited.insert(ptr) {
                return Ok(JsonValue::Null);
            }
            let converted = table_to_json(table, visited);
            visited.remove(&ptr);
            converted?
        }
        LuaValue::LightUserData(ud) if ud.0.is_null() => JsonValue::Null,
        other => {
            return Err(mlua::Error::FromLuaConversionError {
                from: other.type_name(),
                to: "json",
                message: Some("value has no structured representation".to_string()),
            });
        }
    })
}

fn table_to_json(table: Table, visited: &mut HashSet<usize>) -> mlua::Result<JsonValue> {
    if table.raw_len() > 0 && is_array_style_table(&table) {
        let mut items = Vec::with_capacity(table.raw_len());
        for value in table.sequence_values::<LuaValue>() {
            items.push(lua_value_to_json_impl(value?, visited)?);
        }
        return Ok(JsonValue::Array(items));
    }

    let mut map = Map::new();
    for pair in table.pairs::<LuaValue, LuaValue>() {
        let (key, value) = pair?;
        let key = match key {
            LuaValue::String(s) => s.to_string_lossy().into_owned(),
            LuaValue::Integer(i) => i.to_string(),
            other => {
                return Err(mlua::Error::FromLuaConversionError {
                    from: other.type_name(),
                    to: "json object key",
                    message: None,
                });
            }
        };
        map.insert(key, lua_value_to_json_impl(value, visited)?);
    }
    Ok(JsonValue::Object(map))
}

/// Returns true when every key of `table` is an integer in `1..=len` with
/// no gaps. An empty table counts as array style.
pub fn is_array_style_table(table: &Table) -> bool {
    let len = table.raw_len();
    let mut count = 0usize;
    for pair in table.clone().pairs::<LuaValue, LuaValue>() {
        match pair {
            Ok((LuaValue::Integer(i), _)) if i >= 1 && (i as usize) <= len => count += 1,
            _ => return false,
        }
    }
    count == len
}

/// Debug-formats a Lua value without requiring the value to be convertible.
pub struct ValuePrinter<'lua>(pub LuaValue<'lua>);

impl fmt::Debug for ValuePrinter<'_> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            LuaValue::Nil => fmt.write_str("nil"),
            LuaValue::Boolean(b) => b.fmt(fmt),
            LuaValue::Integer(i) => i.fmt(fmt),
            LuaValue::Number(n) => n.fmt(fmt),
            LuaValue::String(s) => fmt.write_fmt(format_args!("{:?}", s.to_string_lossy())),
            LuaValue::Table(t) => {
                if is_array_style_table(t) {
                    let mut list = fmt.debug_list();
                    for value in t.clone().sequence_values::<LuaValue>().flatten() {
                        list.entry(&ValuePrinter(value));
                    }
                    list.finish()
                } else {
                    let mut map = fmt.debug_map();
                    for (key, value) in t.clone().pairs::<LuaValue, LuaValue>().flatten() {
                        map.entry(&ValuePrinter(key), &ValuePrinter(value));
                    }
                    map.finish()
                }
            }
            other => fmt.write_fmt(format_args!("<{}>", other.type_name())),
        }
    }
}
