//! Argument unpacking and flexible argument kinds.
//!
//! Builtins take Lua positional arguments plus an optional trailing table of
//! keyword arguments, so `llm.chat{text = "hi", n = 2}` and
//! `llm.chat("hi", nil, nil, nil, nil, nil, 2)` are the same call. The
//! parameter list is declared per operation; names ending in `?` are
//! optional. Names marked `*` (before any `?`) take arbitrary script
//! values: a table landing in that positional slot is always the value,
//! never a keyword set.
//!
//! The adapter kinds in this module normalize loosely typed script values
//! into canonical host forms. They only decode; range and cross-field
//! checks belong to the operation that uses them.

use crate::error::{Error, Result};
use luahelper::is_array_style_table;
use mlua::{Function, MultiValue, Table, Value};

/// Unpacked arguments of one builtin call.
pub struct Args<'lua> {
    fname: String,
    names: Vec<String>,
    values: Vec<Option<Value<'lua>>>,
}

struct Param<'a> {
    name: &'a str,
    required: bool,
    any_value: bool,
}

fn parse_params<'a>(params: &[&'a str]) -> Vec<Param<'a>> {
    params
        .iter()
        .map(|p| {
            let (rest, required) = match p.strip_suffix('?') {
                Some(rest) => (rest, false),
                None => (*p, true),
            };
            let (name, any_value) = match rest.strip_suffix('*') {
                Some(name) => (name, true),
                None => (rest, false),
            };
            Param {
                name,
                required,
                any_value,
            }
        })
        .collect()
}

/// A trailing table at `slot` is a keyword set when the slot does not take
/// arbitrary values and one of its string keys names a declared parameter.
fn is_keyword_table(table: &Table, slot: usize, params: &[Param]) -> bool {
    if params.get(slot).is_some_and(|p| p.any_value) {
        return false;
    }
    table
        .clone()
        .pairs::<Value, Value>()
        .flatten()
        .any(|(k, _)| match k {
            Value::String(s) => s
                .to_str()
                .is_ok_and(|key| params.iter().any(|p| p.name == key)),
            _ => false,
        })
}

impl<'lua> Args<'lua> {
    /// Match `args` against `params` for the builtin `fname`.
    pub fn unpack(fname: &str, args: MultiValue<'lua>, params: &[&str]) -> Result<Self> {
        let params = parse_params(params);
        let mut positional = args.into_vec();
        let mut keywords = Vec::new();

        let trailing_kw = match positional.last() {
            Some(Value::Table(t)) => is_keyword_table(t, positional.len() - 1, &params),
            _ => false,
        };
        if trailing_kw {
            if let Some(Value::Table(table)) = positional.pop() {
                for pair in table.clone().pairs::<Value, Value>() {
                    let (key, value) = pair.map_err(Error::Lua)?;
                    match key {
                        Value::String(s) => keywords.push((s.to_string_lossy().into_owned(), value)),
                        Value::Integer(_) => {}
                        other => {
                            return Err(Error::Argument(format!(
                                "{fname}: unexpected {} key in keyword arguments",
                                other.type_name()
                            )));
                        }
                    }
                }
                for value in table.sequence_values::<Value>() {
                    positional.push(value.map_err(Error::Lua)?);
                }
            }
        }

        if positional.len() > params.len() {
            return Err(Error::Argument(format!(
                "{fname}: got {} arguments, want at most {}",
                positional.len(),
                params.len()
            )));
        }

        let mut values: Vec<Option<Value<'lua>>> = vec![None; params.len()];
        for (slot, value) in values.iter_mut().zip(positional) {
            if !value.is_nil() {
                *slot = Some(value);
            }
        }

        // Sorted so the reported error does not depend on table iteration order.
        keywords.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, value) in keywords {
            let Some(idx) = params.iter().position(|p| p.name == key) else {
                return Err(Error::Argument(format!(
                    "{fname}: unexpected keyword argument {key:?}"
                )));
            };
            if values[idx].is_some() {
                return Err(Error::Argument(format!(
                    "{fname}: got multiple values for argument {key:?}"
                )));
            }
            values[idx] = Some(value);
        }

        for (param, value) in params.iter().zip(&values) {
            if param.required && value.is_none() {
                return Err(Error::Argument(format!(
                    "{fname}: missing argument for {}",
                    param.name
                )));
            }
        }

        Ok(Self {
            fname: fname.to_string(),
            names: params.iter().map(|p| p.name.to_string()).collect(),
            values,
        })
    }

    fn index(&self, name: &str) -> Result<usize> {
        self.names.iter().position(|n| n == name).ok_or_else(|| {
            Error::Argument(format!("{}: no parameter named {name}", self.fname))
        })
    }

    /// The raw value bound to `name`, if any.
    pub fn raw(&self, name: &str) -> Result<Option<Value<'lua>>> {
        Ok(self.values[self.index(name)?].clone())
    }

    /// Decode the argument bound to `name`; `None` when it was not given.
    pub fn get<T: FromArg<'lua>>(&self, name: &str) -> Result<Option<T>> {
        match self.raw(name)? {
            None => Ok(None),
            Some(value) => T::from_arg(value).map(Some).map_err(|detail| {
                Error::Argument(format!("{}: for parameter {name}: {detail}", self.fname))
            }),
        }
    }

    pub fn get_or<T: FromArg<'lua>>(&self, name: &str, default: T) -> Result<T> {
        Ok(self.get(name)?.unwrap_or(default))
    }

    /// Decode a required argument.
    pub fn require<T: FromArg<'lua>>(&self, name: &str) -> Result<T> {
        self.get(name)?.ok_or_else(|| {
            Error::Argument(format!("{}: missing argument for {name}", self.fname))
        })
    }

    pub fn fname(&self) -> &str {
        &self.fname
    }
}

/// Decoding of one script value into a host-side argument.
///
/// On failure the error is the "got X, want Y" detail; [`Args`] prefixes
/// it with the function and parameter names.
pub trait FromArg<'lua>: Sized {
    fn from_arg(value: Value<'lua>) -> std::result::Result<Self, String>;
}

pub(crate) fn mismatch(value: &Value, want: &str) -> String {
    format!("got {}, want {want}", value.type_name())
}

impl<'lua> FromArg<'lua> for Value<'lua> {
    fn from_arg(value: Value<'lua>) -> std::result::Result<Self, String> {
        Ok(value)
    }
}

impl<'lua> FromArg<'lua> for bool {
    fn from_arg(value: Value<'lua>) -> std::result::Result<Self, String> {
        match value {
            Value::Boolean(b) => Ok(b),
            other => Err(mismatch(&other, "bool")),
        }
    }
}

impl<'lua> FromArg<'lua> for i64 {
    fn from_arg(value: Value<'lua>) -> std::result::Result<Self, String> {
        match value {
            Value::Integer(i) => Ok(i),
            Value::Number(f) if f.fract() == 0.0 && f.abs() < 9.007_199_254_740_992e15 => {
                Ok(f as i64)
            }
            other => Err(mismatch(&other, "int")),
        }
    }
}

impl<'lua> FromArg<'lua> for String {
    fn from_arg(value: Value<'lua>) -> std::result::Result<Self, String> {
        match value {
            Value::String(s) => Ok(s.to_string_lossy().into_owned()),
            other => Err(mismatch(&other, "string")),
        }
    }
}

impl<'lua> FromArg<'lua> for Table<'lua> {
    fn from_arg(value: Value<'lua>) -> std::result::Result<Self, String> {
        match value {
            Value::Table(t) => Ok(t),
            other => Err(mismatch(&other, "table")),
        }
    }
}

impl<'lua> FromArg<'lua> for Function<'lua> {
    fn from_arg(value: Value<'lua>) -> std::result::Result<Self, String> {
        match value {
            Value::Function(f) => Ok(f),
            other => Err(mismatch(&other, "function")),
        }
    }
}

/// Text content that may arrive as any Lua string, including binary data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StringOrBytes(Vec<u8>);

impl StringOrBytes {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Canonical string view; invalid UTF-8 is replaced.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for StringOrBytes {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl<'lua> FromArg<'lua> for StringOrBytes {
    fn from_arg(value: Value<'lua>) -> std::result::Result<Self, String> {
        match value {
            Value::String(s) => Ok(Self(s.as_bytes().to_vec())),
            other => Err(mismatch(&other, "string or bytes")),
        }
    }
}

/// [`StringOrBytes`] with an explicit absent state.
///
/// Absent and empty are distinct; [`Self::is_null_or_empty`] collapses them
/// for validation only.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NullableStringOrBytes {
    #[default]
    Null,
    Value(StringOrBytes),
}

impl NullableStringOrBytes {
    pub fn with_default(value: &str) -> Self {
        Self::Value(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn is_null_or_empty(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Value(v) => v.is_empty(),
        }
    }

    /// String view; absent reads as the empty string.
    pub fn to_string_lossy(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Value(v) => v.to_string_lossy(),
        }
    }

    pub fn as_option(&self) -> Option<&StringOrBytes> {
        match self {
            Self::Null => None,
            Self::Value(v) => Some(v),
        }
    }
}

impl<'lua> FromArg<'lua> for NullableStringOrBytes {
    fn from_arg(value: Value<'lua>) -> std::result::Result<Self, String> {
        match value {
            Value::Nil => Ok(Self::Null),
            Value::String(s) => Ok(Self::Value(StringOrBytes(s.as_bytes().to_vec()))),
            other => Err(mismatch(&other, "string or bytes or nil")),
        }
    }
}

/// A number that may arrive as an integer or float literal.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NumberOrFloat(pub f64);

impl NumberOrFloat {
    pub fn as_f64(self) -> f64 {
        self.0
    }
}

impl<'lua> FromArg<'lua> for NumberOrFloat {
    fn from_arg(value: Value<'lua>) -> std::result::Result<Self, String> {
        match value {
            Value::Integer(i) => Ok(Self(i as f64)),
            Value::Number(f) => Ok(Self(f)),
            other => Err(mismatch(&other, "float or int")),
        }
    }
}

/// Zero or more values of `V`, given either as one value or a sequence.
#[derive(Debug, Clone)]
pub enum OneOrMany<V> {
    Empty,
    One(V),
    Many(Vec<V>),
}

impl<V> Default for OneOrMany<V> {
    fn default() -> Self {
        Self::Empty
    }
}

impl<V> OneOrMany<V> {
    pub fn as_slice(&self) -> &[V] {
        match self {
            Self::Empty => &[],
            Self::One(v) => std::slice::from_ref(v),
            Self::Many(vs) => vs,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    pub fn into_vec(self) -> Vec<V> {
        match self {
            Self::Empty => Vec::new(),
            Self::One(v) => vec![v],
            Self::Many(vs) => vs,
        }
    }
}

impl<V: PartialEq> PartialEq for OneOrMany<V> {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl<'lua, V: FromArg<'lua>> FromArg<'lua> for OneOrMany<V> {
    fn from_arg(value: Value<'lua>) -> std::result::Result<Self, String> {
        match value {
            Value::Nil => Ok(Self::Empty),
            Value::Table(t) if is_array_style_table(&t) => {
                let mut items = Vec::new();
                for (idx, item) in t.sequence_values::<Value>().enumerate() {
                    let item = item.map_err(|e| e.to_string())?;
                    items.push(V::from_arg(item).map_err(|d| format!("item {}: {d}", idx + 1))?);
                }
                Ok(Self::Many(items))
            }
            other => V::from_arg(other).map(Self::One),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlua::{IntoLuaMulti, Lua};
    use proptest::prelude::*;

    fn call<'lua>(lua: &'lua Lua, src: &str) -> MultiValue<'lua> {
        lua.load(src).eval::<MultiValue>().unwrap()
    }

    const SEND: &[&str] = &["subject", "html?", "text?", "to"];

    #[test]
    fn positional_fill_in_order() {
        let lua = Lua::new();
        let args = Args::unpack("send", call(&lua, "return 's', nil, 'body', 'a@b'"), SEND).unwrap();
        assert_eq!(args.require::<String>("subject").unwrap(), "s");
        assert!(args.get::<String>("html").unwrap().is_none());
        assert_eq!(args.get::<String>("text").unwrap().as_deref(), Some("body"));
        assert_eq!(args.require::<String>("to").unwrap(), "a@b");
    }

    #[test]
    fn trailing_table_is_keywords() {
        let lua = Lua::new();
        let args = Args::unpack(
            "send",
            call(&lua, "return {subject = 's', to = 'x@y', text = 't'}"),
            SEND,
        )
        .unwrap();
        assert_eq!(args.require::<String>("to").unwrap(), "x@y");
        assert_eq!(args.get::<String>("text").unwrap().as_deref(), Some("t"));
    }

    #[test]
    fn keyword_table_array_part_is_positional() {
        let lua = Lua::new();
        let args = Args::unpack("send", call(&lua, "return {'s', to = 'x@y'}"), SEND).unwrap();
        assert_eq!(args.require::<String>("subject").unwrap(), "s");
    }

    #[test]
    fn record_without_declared_keys_stays_positional() {
        let lua = Lua::new();
        let params = &["attachment"];
        let args = Args::unpack("send", call(&lua, "return {name = 'a.txt', content = 'x'}"), params)
            .unwrap();
        let t: Table = args.require("attachment").unwrap();
        assert_eq!(t.get::<_, String>("name").unwrap(), "a.txt");
    }

    #[test]
    fn value_slot_keeps_table_positional() {
        let lua = Lua::new();
        let params = &["key", "value*", "db?"];
        let args = Args::unpack("set_json", call(&lua, "return 'cfg', {value = 5, db = 'x'}"), params)
            .unwrap();
        assert_eq!(args.require::<String>("key").unwrap(), "cfg");
        assert!(args.get::<String>("db").unwrap().is_none());
        let t: Table = args.require("value").unwrap();
        assert_eq!(t.get::<_, i64>("value").unwrap(), 5);
        assert_eq!(t.get::<_, String>("db").unwrap(), "x");
    }

    #[test]
    fn value_slot_still_accepts_keywords() {
        let lua = Lua::new();
        let params = &["key", "value*", "db?"];
        let args = Args::unpack(
            "set_json",
            call(&lua, "return {key = 'cfg', value = {value = 5}, db = 'x'}"),
            params,
        )
        .unwrap();
        assert_eq!(args.require::<String>("db").unwrap(), "x");
        let t: Table = args.require("value").unwrap();
        assert_eq!(t.get::<_, i64>("value").unwrap(), 5);

        let args = Args::unpack("set_json", call(&lua, "return 'cfg', {1, 2}, {db = 'x'}"), params).unwrap();
        assert_eq!(args.require::<String>("db").unwrap(), "x");
    }

    #[test]
    fn unknown_keyword_is_error() {
        let lua = Lua::new();
        let err = Args::unpack(
            "send",
            call(&lua, "return {subject = 's', to = 'a', bogus = 1}"),
            SEND,
        )
        .err()
        .unwrap();
        assert_eq!(err.to_string(), r#"send: unexpected keyword argument "bogus""#);
    }

    #[test]
    fn duplicate_argument_is_error() {
        let lua = Lua::new();
        let err = Args::unpack("send", call(&lua, "return 's', {subject = 'again', to = 'a'}"), SEND)
            .err()
            .unwrap();
        assert!(err.to_string().contains("multiple values for argument \"subject\""));
    }

    #[test]
    fn too_many_positional_is_error() {
        let lua = Lua::new();
        let err = Args::unpack("send", call(&lua, "return 1, 2, 3, 4, 5"), SEND)
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "send: got 5 arguments, want at most 4");
    }

    #[test]
    fn missing_required_is_error() {
        let lua = Lua::new();
        let err = Args::unpack("send", call(&lua, "return 's'"), SEND).err().unwrap();
        assert_eq!(err.to_string(), "send: missing argument for to");
    }

    #[test]
    fn nil_positional_leaves_required_unset() {
        let lua = Lua::new();
        let err = Args::unpack("send", call(&lua, "return nil, nil, 't', 'a'"), SEND)
            .err()
            .unwrap();
        assert!(matches!(err, Error::Argument(ref m) if m.contains("subject")));
    }

    #[test]
    fn type_error_names_parameter() {
        let lua = Lua::new();
        let args = Args::unpack("chat", call(&lua, "return {n = 'two'}"), &["n?"]).unwrap();
        let err = args.get::<i64>("n").err().unwrap();
        assert_eq!(err.to_string(), "chat: for parameter n: got string, want int");
    }

    #[test]
    fn integral_float_is_int() {
        let lua = Lua::new();
        let args = Args::unpack("chat", call(&lua, "return 3.0"), &["n?"]).unwrap();
        assert_eq!(args.get::<i64>("n").unwrap(), Some(3));
    }

    #[test]
    fn number_or_float_accepts_both() {
        let lua = Lua::new();
        let args = Args::unpack("chat", call(&lua, "return 1, 0.5"), &["a", "b"]).unwrap();
        assert_eq!(args.require::<NumberOrFloat>("a").unwrap().as_f64(), 1.0);
        assert_eq!(args.require::<NumberOrFloat>("b").unwrap().as_f64(), 0.5);
    }

    #[test]
    fn nullable_distinguishes_absent_from_empty() {
        let lua = Lua::new();
        let args = Args::unpack("m", call(&lua, "return ''"), &["a?", "b?"]).unwrap();
        let a = args.get_or("a", NullableStringOrBytes::Null).unwrap();
        let b = args.get_or("b", NullableStringOrBytes::Null).unwrap();
        assert!(!a.is_null());
        assert!(b.is_null());
        assert!(a.is_null_or_empty() && b.is_null_or_empty());
    }

    #[test]
    fn nullable_keeps_default_when_unset() {
        let lua = Lua::new();
        let args = Args::unpack("draw", MultiValue::new(), &["size?"]).unwrap();
        let size = args
            .get_or("size", NullableStringOrBytes::with_default("1024x1024"))
            .unwrap();
        assert_eq!(size.to_string_lossy(), "1024x1024");
    }

    #[test]
    fn string_or_bytes_keeps_binary() {
        let lua = Lua::new();
        let args = Args::unpack("w", call(&lua, r#"return "\0\255ab""#), &["content"]).unwrap();
        let content: StringOrBytes = args.require("content").unwrap();
        assert_eq!(content.as_bytes(), &[0, 255, b'a', b'b']);
    }

    #[test]
    fn one_or_many_empty_table_is_empty() {
        let lua = Lua::new();
        let args = Args::unpack("send", call(&lua, "return {}"), &["to"]).unwrap();
        let to: OneOrMany<String> = args.require("to").unwrap();
        assert!(to.is_empty());
    }

    #[test]
    fn one_or_many_record_is_one() {
        let lua = Lua::new();
        let args = Args::unpack("chat", call(&lua, "return {role = 'user', text = 'hi'}"), &["messages"])
            .unwrap();
        let msgs: OneOrMany<Table> = args.require("messages").unwrap();
        assert_eq!(msgs.len(), 1);
    }

    #[test]
    fn one_or_many_item_error_names_index() {
        let lua = Lua::new();
        let args = Args::unpack("send", call(&lua, "return {'a', 2}"), &["to"]).unwrap();
        let err = args.get::<OneOrMany<String>>("to").err().unwrap();
        assert_eq!(err.to_string(), "send: for parameter to: item 2: got integer, want string");
    }

    proptest! {
        #[test]
        fn one_or_many_scalar_equals_singleton_list(s in "[a-z@.]{0,24}") {
            let lua = Lua::new();
            let single = (s.as_str(),).into_lua_multi(&lua).unwrap();
            let list = lua.create_sequence_from([s.as_str()]).unwrap();
            let wrapped = (list,).into_lua_multi(&lua).unwrap();
            let a: OneOrMany<String> = Args::unpack("f", single, &["to"]).unwrap().require("to").unwrap();
            let b: OneOrMany<String> = Args::unpack("f", wrapped, &["to"]).unwrap().require("to").unwrap();
            prop_assert_eq!(a, b);
        }

        #[test]
        fn number_or_float_matches_input(i in -1_000_000i64..1_000_000) {
            let lua = Lua::new();
            let args = Args::unpack("f", (i,).into_lua_multi(&lua).unwrap(), &["x"]).unwrap();
            prop_assert_eq!(args.require::<NumberOrFloat>("x").unwrap().as_f64(), i as f64);
        }
    }
}
