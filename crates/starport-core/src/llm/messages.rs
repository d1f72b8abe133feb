//! Chat message records and their conversion to provider messages.
//!
//! A message record is a Lua table with `role` plus any of `text`, `image`
//! (raw bytes), `image_file` (a local path) and `image_url`. Text-only
//! records become plain messages; anything with an image becomes a
//! multi-part message with images embedded as data URIs.

use super::types::{ChatMessage, ContentPart, MessageContent};
use crate::error::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::ImageFormat;
use mlua::{Lua, Table, Value};
use std::path::Path;

const MIME_TEXT: &str = "text/plain; charset=utf-8";
const MIME_BINARY: &str = "application/octet-stream";

/// Host-side view of one message record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageRecord {
    pub role: Option<String>,
    pub text: Option<String>,
    pub image: Option<Vec<u8>>,
    pub image_file: Option<String>,
    pub image_url: Option<String>,
}

fn string_field(table: &Table, key: &str) -> Result<Option<Vec<u8>>> {
    match table.get::<_, Value>(key)? {
        Value::String(s) => Ok(Some(s.as_bytes().to_vec())),
        _ => Ok(None),
    }
}

fn text_field(table: &Table, key: &str) -> Result<Option<String>> {
    Ok(string_field(table, key)?.map(|b| String::from_utf8_lossy(&b).into_owned()))
}

impl MessageRecord {
    /// Read a record. Fields that are absent or not strings are `None`.
    pub fn from_table(table: &Table) -> Result<Self> {
        Ok(Self {
            role: text_field(table, "role")?,
            text: text_field(table, "text")?,
            image: string_field(table, "image")?,
            image_file: text_field(table, "image_file")?,
            image_url: text_field(table, "image_url")?,
        })
    }

    /// Write the record, skipping empty fields.
    pub fn to_table<'lua>(&self, lua: &'lua Lua) -> Result<Table<'lua>> {
        let table = lua.create_table()?;
        let fields: [(&str, Option<&[u8]>); 5] = [
            ("role", self.role.as_deref().map(str::as_bytes)),
            ("text", self.text.as_deref().map(str::as_bytes)),
            ("image", self.image.as_deref()),
            ("image_file", self.image_file.as_deref().map(str::as_bytes)),
            ("image_url", self.image_url.as_deref().map(str::as_bytes)),
        ];
        for (key, value) in fields {
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                table.set(key, lua.create_string(value)?)?;
            }
        }
        Ok(table)
    }

    fn has_image(&self) -> bool {
        self.image.is_some() || self.image_file.is_some() || self.image_url.is_some()
    }
}

/// Convert message records into provider messages, preserving order.
pub fn messages_to_chat_messages(msgs: &[MessageRecord]) -> Result<Vec<ChatMessage>> {
    let mut out = Vec::with_capacity(msgs.len());
    for (i, msg) in msgs.iter().enumerate() {
        let n = i + 1;
        let Some(role) = msg.role.clone() else {
            return Err(Error::Validation(format!("message {n}: role is required")));
        };
        if msg.text.is_none() && !msg.has_image() {
            return Err(Error::Validation(format!(
                "message {n}: at least one of text, image, image_file, or image_url is required"
            )));
        }

        if !msg.has_image() {
            out.push(ChatMessage {
                role,
                content: MessageContent::Text(msg.text.clone().unwrap_or_default()),
            });
            continue;
        }

        let mut parts = Vec::new();
        if let Some(text) = &msg.text {
            parts.push(ContentPart::Text { text: text.clone() });
        }
        if let Some(url) = &msg.image_url {
            parts.push(ContentPart::image(url.clone()));
        }
        if let Some(data) = &msg.image {
            parts.push(ContentPart::image(image_data_to_data_uri(data)));
        }
        if let Some(path) = &msg.image_file {
            let uri = image_file_to_data_uri(Path::new(path)).map_err(|e| {
                Error::Io(std::io::Error::new(e.kind(), format!("message {n}: {e}")))
            })?;
            parts.push(ContentPart::image(uri));
        }
        out.push(ChatMessage {
            role,
            content: MessageContent::Parts(parts),
        });
    }
    Ok(out)
}

/// MIME type sniffed from content.
pub fn detect_mime(data: &[u8]) -> &'static str {
    match image::guess_format(data) {
        Ok(format) => format.to_mime_type(),
        Err(_) if std::str::from_utf8(data).is_ok() => MIME_TEXT,
        Err(_) => MIME_BINARY,
    }
}

/// MIME type from a path's extension.
pub fn mime_from_extension(path: &Path) -> &'static str {
    path.extension()
        .and_then(ImageFormat::from_extension)
        .map_or(MIME_BINARY, |format| format.to_mime_type())
}

pub fn image_data_to_data_uri(data: &[u8]) -> String {
    format!("data:{};base64,{}", detect_mime(data), STANDARD.encode(data))
}

pub fn image_file_to_data_uri(path: &Path) -> std::io::Result<String> {
    let data = std::fs::read(path)?;
    Ok(format!(
        "data:{};base64,{}",
        mime_from_extension(path),
        STANDARD.encode(&data)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

    fn record(role: &str, text: &str) -> MessageRecord {
        MessageRecord {
            role: Some(role.into()),
            text: Some(text.into()),
            ..MessageRecord::default()
        }
    }

    #[test]
    fn text_only_is_plain_message() {
        let msgs = messages_to_chat_messages(&[record("user", "hi")]).unwrap();
        assert_eq!(msgs[0].role, "user");
        assert_eq!(msgs[0].content, MessageContent::Text("hi".into()));
    }

    #[test]
    fn empty_text_counts_as_present() {
        let msgs = messages_to_chat_messages(&[record("system", "")]).unwrap();
        assert_eq!(msgs[0].content, MessageContent::Text(String::new()));
    }

    #[test]
    fn role_required() {
        let msg = MessageRecord {
            text: Some("x".into()),
            ..MessageRecord::default()
        };
        let err = messages_to_chat_messages(&[record("user", "a"), msg]).unwrap_err();
        assert_eq!(err.to_string(), "message 2: role is required");
    }

    #[test]
    fn content_required() {
        let msg = MessageRecord {
            role: Some("user".into()),
            ..MessageRecord::default()
        };
        let err = messages_to_chat_messages(&[msg]).unwrap_err();
        assert!(matches!(err, Error::Validation(ref m) if m.starts_with("message 1: at least one")));
    }

    #[test]
    fn parts_ordered_text_url_bytes() {
        let msg = MessageRecord {
            role: Some("user".into()),
            text: Some("what is this".into()),
            image: Some(PNG_MAGIC.to_vec()),
            image_url: Some("https://img/x.jpg".into()),
            ..MessageRecord::default()
        };
        let msgs = messages_to_chat_messages(&[msg]).unwrap();
        let MessageContent::Parts(parts) = &msgs[0].content else {
            panic!("expected parts");
        };
        assert_eq!(parts.len(), 3);
        assert!(matches!(&parts[0], ContentPart::Text { text } if text == "what is this"));
        assert!(matches!(&parts[1], ContentPart::ImageUrl { image_url } if image_url.url == "https://img/x.jpg"));
        assert!(matches!(&parts[2], ContentPart::ImageUrl { image_url }
            if image_url.url.starts_with("data:image/png;base64,") && image_url.detail == "auto"));
    }

    #[test]
    fn image_file_uses_extension_mime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.jpeg");
        std::fs::write(&path, b"not really a jpeg").unwrap();
        let uri = image_file_to_data_uri(&path).unwrap();
        assert!(uri.starts_with("data:image/jpeg;base64,"));
    }

    #[test]
    fn missing_image_file_names_message() {
        let msg = MessageRecord {
            role: Some("user".into()),
            image_file: Some("/definitely/not/here.png".into()),
            ..MessageRecord::default()
        };
        let err = messages_to_chat_messages(&[msg]).unwrap_err();
        assert!(matches!(err, Error::Io(ref e) if e.to_string().starts_with("message 1:")));
    }

    #[test]
    fn mime_detection_fallbacks() {
        assert_eq!(detect_mime(PNG_MAGIC), "image/png");
        assert_eq!(detect_mime(b"plain words"), MIME_TEXT);
        assert_eq!(detect_mime(&[0xFF, 0xFE, 0x00, 0x9F]), MIME_BINARY);
        assert_eq!(mime_from_extension(Path::new("a.gif")), "image/gif");
        assert_eq!(mime_from_extension(Path::new("a.unknown")), MIME_BINARY);
        assert_eq!(mime_from_extension(Path::new("noext")), MIME_BINARY);
    }

    #[test]
    fn record_roundtrip_keeps_text() {
        let lua = Lua::new();
        let original = MessageRecord {
            role: Some("user".into()),
            text: Some("hi".into()),
            image: Some(vec![0, 1, 2]),
            ..MessageRecord::default()
        };
        let table = original.to_table(&lua).unwrap();
        assert_eq!(MessageRecord::from_table(&table).unwrap(), original);
    }

    #[test]
    fn to_table_skips_empty() {
        let lua = Lua::new();
        let msg = MessageRecord {
            role: Some("user".into()),
            text: Some(String::new()),
            ..MessageRecord::default()
        };
        let table = msg.to_table(&lua).unwrap();
        assert!(table.get::<_, Value>("text").unwrap().is_nil());
        assert_eq!(table.get::<_, String>("role").unwrap(), "user");
    }
}
