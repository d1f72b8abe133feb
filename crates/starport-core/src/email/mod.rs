//! `email` module: send mail through the Resend API.
//!
//! ```lua
//! email.set_resend_api_key("re_...")
//! email.set_sender_domain("example.com")
//! local id = email.send{subject = "Report", markdown = "# Done", to = "ops@example.com", from_id = "bot"}
//! ```

mod resend;

pub use resend::{DEFAULT_ENDPOINT, ResendClient};

use crate::args::{Args, NullableStringOrBytes, OneOrMany, StringOrBytes};
use crate::binding::{ClientCache, ModuleBinding, ScriptModule, builtin};
use crate::error::{Error, Result};
use crate::retry::{CancelToken, RetryPolicy, with_retry};
use crate::settings::{EmailSettings, HttpSettings, bind_with_env};
use mlua::{Lua, MultiValue, Table, Value};
use pulldown_cmark::{CowStr, Event, LinkType, Options, Parser, Tag, TagEnd, TextMergeStream, html};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const MODULE_NAME: &str = "email";

const KEY_API_KEY: &str = "resend_api_key";
const KEY_SENDER_DOMAIN: &str = "sender_domain";

const SEND_PARAMS: &[&str] = &[
    "subject",
    "html?",
    "text?",
    "markdown?",
    "to",
    "cc?",
    "bcc?",
    "from?",
    "from_id?",
    "reply_to?",
    "reply_id?",
    "attachment_file?",
    "attachment?",
];

/// A file attached to an outgoing message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content: Vec<u8>,
}

/// Provider-neutral outgoing message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendEmailRequest {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub reply_to: Option<String>,
    pub subject: String,
    pub html: Option<String>,
    pub text: Option<String>,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendEmailResponse {
    pub id: String,
}

/// Mail transport used by the `email` module.
pub trait MailClient: Send + Sync {
    fn send(&self, request: &SendEmailRequest) -> Result<SendEmailResponse>;
}

/// The `email` script module
#[derive(Clone)]
pub struct EmailModule {
    binding: ModuleBinding<String>,
    client: Arc<ClientCache<dyn MailClient>>,
    endpoint: Option<String>,
    timeout: Duration,
}

impl Default for EmailModule {
    fn default() -> Self {
        Self::new()
    }
}

impl EmailModule {
    /// Module with declared but unset configuration.
    pub fn new() -> Self {
        let binding = ModuleBinding::new(MODULE_NAME);
        binding.store().declare(KEY_API_KEY);
        binding.store().declare(KEY_SENDER_DOMAIN);
        Self {
            binding,
            client: Arc::new(ClientCache::new()),
            endpoint: None,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_config(resend_api_key: &str, sender_domain: &str) -> Self {
        let module = Self::new();
        let store = module.binding.store();
        store.set_value(KEY_API_KEY, resend_api_key.to_string());
        store.set_value(KEY_SENDER_DOMAIN, sender_domain.to_string());
        module
    }

    pub fn with_getters<K, D>(resend_api_key: K, sender_domain: D) -> Self
    where
        K: Fn() -> String + Send + Sync + 'static,
        D: Fn() -> String + Send + Sync + 'static,
    {
        let module = Self::new();
        module.binding.store().set(KEY_API_KEY, resend_api_key);
        module.binding.store().set(KEY_SENDER_DOMAIN, sender_domain);
        module
    }

    /// Values from the settings file, falling back to `RESEND_API_KEY` and
    /// `RESEND_SENDER_DOMAIN`.
    pub fn from_settings(email: &EmailSettings, http: &HttpSettings) -> Self {
        let mut module = Self::new();
        let store = module.binding.store();
        bind_with_env(store, KEY_API_KEY, email.resend_api_key.clone(), "RESEND_API_KEY");
        bind_with_env(
            store,
            KEY_SENDER_DOMAIN,
            email.sender_domain.clone(),
            "RESEND_SENDER_DOMAIN",
        );
        module.endpoint = email.endpoint_url.clone();
        module.timeout = http.timeout();
        module
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = Some(endpoint.to_string());
        self
    }

    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.binding.set_cancel_token(cancel);
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        self.binding.cancel_token()
    }

    pub fn binding(&self) -> &ModuleBinding<String> {
        &self.binding
    }

    /// Use `client` instead of building one from configuration.
    pub fn set_client(&self, client: Arc<dyn MailClient>) {
        self.client.set(client);
    }

    fn client(&self) -> Result<Arc<dyn MailClient>> {
        self.client.get_or_try_init(|| {
            let api_key = self.binding.store().require(&[KEY_API_KEY])?.remove(0);
            let client = ResendClient::new(&api_key, self.endpoint.as_deref(), self.timeout)?;
            Ok(Arc::new(client) as Arc<dyn MailClient>)
        })
    }

    fn sender_domain(&self) -> Option<String> {
        self.binding.store().get_present(KEY_SENDER_DOMAIN)
    }

    fn send(&self, args: MultiValue) -> Result<String> {
        let fname = format!("{MODULE_NAME}.send");
        let args = Args::unpack(&fname, args, SEND_PARAMS)?;
        let request = self.build_request(&args)?;

        let client = self.client()?;
        tracing::debug!(
            module = MODULE_NAME,
            op = "send",
            recipients = request.to.len() + request.cc.len() + request.bcc.len(),
            attachments = request.attachments.len(),
            "sending mail"
        );
        let outcome = with_retry(&RetryPolicy::attempts(1), self.cancel_token(), || {
            client.send(&request)
        });
        Ok(outcome.result?.id)
    }

    /// Validate arguments and assemble the outgoing message.
    fn build_request(&self, args: &Args) -> Result<SendEmailRequest> {
        let subject: StringOrBytes = args.require("subject")?;
        let body_html: NullableStringOrBytes = args.get_or("html", NullableStringOrBytes::Null)?;
        let body_text: NullableStringOrBytes = args.get_or("text", NullableStringOrBytes::Null)?;
        let body_markdown: NullableStringOrBytes =
            args.get_or("markdown", NullableStringOrBytes::Null)?;
        let to: OneOrMany<String> = args.get_or("to", OneOrMany::Empty)?;
        let cc: OneOrMany<String> = args.get_or("cc", OneOrMany::Empty)?;
        let bcc: OneOrMany<String> = args.get_or("bcc", OneOrMany::Empty)?;
        let from: NullableStringOrBytes = args.get_or("from", NullableStringOrBytes::Null)?;
        let from_id: NullableStringOrBytes = args.get_or("from_id", NullableStringOrBytes::Null)?;
        let reply_to: NullableStringOrBytes = args.get_or("reply_to", NullableStringOrBytes::Null)?;
        let reply_id: NullableStringOrBytes = args.get_or("reply_id", NullableStringOrBytes::Null)?;
        let attachment_files: OneOrMany<String> = args.get_or("attachment_file", OneOrMany::Empty)?;
        let attachments: OneOrMany<Table> = args.get_or("attachment", OneOrMany::Empty)?;

        let html = non_blank(&body_html);
        let text = non_blank(&body_text);
        let markdown = non_blank(&body_markdown);
        if html.is_none() && text.is_none() && markdown.is_none() {
            return Err(Error::Validation(
                "one of html, text, or markdown must be non-blank".to_string(),
            ));
        }
        if to.is_empty() {
            return Err(Error::Validation("to must be set and non-empty".to_string()));
        }
        if non_blank(&from).is_none() && non_blank(&from_id).is_none() {
            return Err(Error::Validation(
                "one of from or from_id must be non-blank".to_string(),
            ));
        }

        let domain = self.sender_domain();
        let sender = resolve_address(&from, &from_id, "from_id", domain.as_deref())?
            .ok_or_else(|| Error::Validation("no valid from or from_id found".to_string()))?;
        let reply = resolve_address(&reply_to, &reply_id, "reply_id", domain.as_deref())?;

        let mut request = SendEmailRequest {
            from: sender,
            to: to.into_vec(),
            cc: cc.into_vec(),
            bcc: bcc.into_vec(),
            reply_to: reply,
            subject: subject.to_string_lossy(),
            ..SendEmailRequest::default()
        };

        if let Some(html) = html {
            request.html = Some(html);
        } else if let Some(text) = text {
            request.text = Some(text);
        } else if let Some(markdown) = markdown {
            request.html = Some(render_markdown(&markdown));
        }

        for path in attachment_files.as_slice() {
            request.attachments.push(read_attachment(Path::new(path))?);
        }
        for record in attachments.as_slice() {
            request.attachments.push(attachment_from_record(record)?);
        }
        Ok(request)
    }
}

fn non_blank(value: &NullableStringOrBytes) -> Option<String> {
    let s = value.to_string_lossy();
    if s.trim().is_empty() { None } else { Some(s) }
}

/// An explicit address wins; otherwise a local-part is qualified with the
/// configured domain.
fn resolve_address(
    address: &NullableStringOrBytes,
    local_part: &NullableStringOrBytes,
    local_name: &'static str,
    domain: Option<&str>,
) -> Result<Option<String>> {
    if let Some(address) = non_blank(address) {
        return Ok(Some(address));
    }
    match non_blank(local_part) {
        Some(id) => match domain {
            Some(domain) => Ok(Some(format!("{id}@{domain}"))),
            None => Err(Error::MissingDomain(local_name)),
        },
        None => Ok(None),
    }
}

/// Render markdown to HTML with strikethrough, tables and bare-URL links.
/// Raw HTML passes through untouched.
pub fn render_markdown(markdown: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TABLES);
    let events = linkify(TextMergeStream::new(Parser::new_ext(markdown, options)));
    let mut out = String::new();
    html::push_html(&mut out, events.into_iter());
    out
}

const URL_PREFIXES: &[&str] = &["https://", "http://", "www."];

/// Wrap bare `http(s)://` and `www.` addresses in plain text with links.
/// Text inside links, images and code blocks is left alone.
fn linkify<'a>(events: impl Iterator<Item = Event<'a>>) -> Vec<Event<'a>> {
    let mut out = Vec::new();
    let mut nested = 0usize;
    for event in events {
        match event {
            Event::Start(Tag::Link { .. } | Tag::Image { .. } | Tag::CodeBlock(_)) => {
                nested += 1;
                out.push(event);
            }
            Event::End(TagEnd::Link | TagEnd::Image | TagEnd::CodeBlock) => {
                nested = nested.saturating_sub(1);
                out.push(event);
            }
            Event::Text(text) if nested == 0 && find_url(&text).is_some() => push_linked(&text, &mut out),
            other => out.push(other),
        }
    }
    out
}

fn push_linked<'a>(text: &str, out: &mut Vec<Event<'a>>) {
    let mut rest = text;
    while let Some((start, end)) = find_url(rest) {
        if start > 0 {
            out.push(Event::Text(rest[..start].to_string().into()));
        }
        let url = &rest[start..end];
        let href = if url.starts_with("www.") {
            format!("http://{url}")
        } else {
            url.to_string()
        };
        out.push(Event::Start(Tag::Link {
            link_type: LinkType::Autolink,
            dest_url: href.into(),
            title: CowStr::Borrowed(""),
            id: CowStr::Borrowed(""),
        }));
        out.push(Event::Text(url.to_string().into()));
        out.push(Event::End(TagEnd::Link));
        rest = &rest[end..];
    }
    if !rest.is_empty() {
        out.push(Event::Text(rest.to_string().into()));
    }
}

/// Byte range of the first address in `text` that starts at a word boundary.
/// Trailing sentence punctuation is not part of the address.
fn find_url(text: &str) -> Option<(usize, usize)> {
    let mut from = 0;
    loop {
        let (start, prefix_len) = URL_PREFIXES
            .iter()
            .filter_map(|p| text[from..].find(p).map(|i| (from + i, p.len())))
            .min_by_key(|(i, _)| *i)?;
        let at_boundary = text[..start].chars().next_back().is_none_or(|c| !c.is_alphanumeric());
        let len = text[start..]
            .find(|c: char| c.is_whitespace() || matches!(c, '<' | '>' | '"'))
            .unwrap_or(text.len() - start);
        let trimmed = text[start..start + len].trim_end_matches(['.', ',', ':', ';', '!', '?', ')', '\'']);
        let end = start + trimmed.len();
        if at_boundary && end > start + prefix_len {
            return Some((start, end));
        }
        from = start + prefix_len;
    }
}

fn read_attachment(path: &Path) -> Result<Attachment> {
    let content = std::fs::read(path)?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned());
    Ok(Attachment { filename, content })
}

fn attachment_from_record(record: &Table) -> Result<Attachment> {
    let filename = match record.get::<_, Value>("name")? {
        Value::String(s) => s.to_string_lossy().into_owned(),
        _ => return Err(Error::Validation("attachment must have a name".to_string())),
    };
    let content = match record.get::<_, Value>("content")? {
        Value::String(s) => s.as_bytes().to_vec(),
        _ => return Err(Error::Validation("attachment must have content".to_string())),
    };
    Ok(Attachment { filename, content })
}

impl ScriptModule for EmailModule {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn load<'lua>(&self, lua: &'lua Lua) -> mlua::Result<Table<'lua>> {
        let this = self.clone();
        let send = builtin(lua, move |lua, args| {
            let id = this.send(args)?;
            Ok(Value::String(lua.create_string(&id)?))
        })?;
        let cache = Arc::clone(&self.client);
        self.binding
            .register_operations(lua, vec![("send", send)], move || cache.invalidate())
    }
}
