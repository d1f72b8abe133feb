//! `llm` module: chat completions and image generation against OpenAI or
//! Azure OpenAI.
//!
//! ```lua
//! llm.set_openai_api_key("sk-...")
//! llm.set_openai_gpt_model("gpt-4o")
//! local answer = llm.chat{text = "Summarize this", image_file = "chart.png"}
//! local history = {llm.message{role = "system", text = "Be brief"}}
//! local three = llm.chat{text = "A name for a cat", messages = history, n = 3}
//! ```

mod messages;
mod openai;
pub mod types;

pub use messages::{
    MessageRecord, detect_mime, image_data_to_data_uri, image_file_to_data_uri,
    messages_to_chat_messages, mime_from_extension,
};
pub use openai::{AZURE_API_VERSION, DEFAULT_BASE_URL, OpenAiClient, Provider};

use crate::args::{Args, NullableStringOrBytes, NumberOrFloat, OneOrMany};
use crate::binding::{ClientCache, ModuleBinding, ScriptModule, builtin};
use crate::config_store::ConfigGetter;
use crate::error::{Error, Result};
use crate::marshal::to_script_value;
use crate::retry::{CallOptions, CancelToken, with_retry};
use crate::settings::{HttpSettings, LlmSettings, bind_with_env};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::ImageFormat;
use mlua::{Lua, MultiValue, Table, Value};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use types::{
    ChatChoice, ChatRequest, ChatResponse, ImageData, ImageRequest, ImageResponse, ROLE_USER,
    ResponseFormat,
};

pub const MODULE_NAME: &str = "llm";

const KEY_PROVIDER: &str = "openai_provider";
const KEY_ENDPOINT: &str = "openai_endpoint_url";
const KEY_API_KEY: &str = "openai_api_key";
const KEY_GPT_MODEL: &str = "openai_gpt_model";
const KEY_DALLE_MODEL: &str = "openai_dalle_model";

const MESSAGE_PARAMS: &[&str] = &["role?", "text?", "image?", "image_file?", "image_url?"];

const CHAT_PARAMS: &[&str] = &[
    "text?",
    "image?",
    "image_file?",
    "image_url?",
    "messages?",
    "model?",
    "n?",
    "max_tokens?",
    "temperature?",
    "top_p?",
    "frequency_penalty?",
    "presence_penalty?",
    "stop?",
    "response_format?",
    "retry?",
    "full_response?",
    "allow_error?",
];

const DRAW_PARAMS: &[&str] = &[
    "prompt",
    "model?",
    "n?",
    "quality?",
    "size?",
    "style?",
    "response_format?",
    "retry?",
    "full_response?",
    "allow_error?",
];

/// Chat and image provider used by the `llm` module.
pub trait LlmClient: Send + Sync {
    fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;
    fn draw(&self, request: &ImageRequest) -> Result<ImageResponse>;
}

/// The `llm` script module
#[derive(Clone)]
pub struct LlmModule {
    binding: ModuleBinding<String>,
    client: Arc<ClientCache<dyn LlmClient>>,
    timeout: Duration,
}

impl Default for LlmModule {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmModule {
    pub fn new() -> Self {
        let binding = ModuleBinding::new(MODULE_NAME);
        for key in [KEY_PROVIDER, KEY_ENDPOINT, KEY_API_KEY, KEY_GPT_MODEL, KEY_DALLE_MODEL] {
            binding.store().declare(key);
        }
        Self {
            binding,
            client: Arc::new(ClientCache::new()),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_config(provider: &str, endpoint_url: &str, api_key: &str, gpt_model: &str, dalle_model: &str) -> Self {
        let module = Self::new();
        let store = module.binding.store();
        store.set_value(KEY_PROVIDER, provider.to_string());
        store.set_value(KEY_ENDPOINT, endpoint_url.to_string());
        store.set_value(KEY_API_KEY, api_key.to_string());
        store.set_value(KEY_GPT_MODEL, gpt_model.to_string());
        store.set_value(KEY_DALLE_MODEL, dalle_model.to_string());
        module
    }

    pub fn with_getters(
        provider: ConfigGetter<String>,
        endpoint_url: ConfigGetter<String>,
        api_key: ConfigGetter<String>,
        gpt_model: ConfigGetter<String>,
        dalle_model: ConfigGetter<String>,
    ) -> Self {
        let module = Self::new();
        let store = module.binding.store();
        store.set_getter(KEY_PROVIDER, provider);
        store.set_getter(KEY_ENDPOINT, endpoint_url);
        store.set_getter(KEY_API_KEY, api_key);
        store.set_getter(KEY_GPT_MODEL, gpt_model);
        store.set_getter(KEY_DALLE_MODEL, dalle_model);
        module
    }

    /// Values from the settings file, falling back to the `OPENAI_*`
    /// environment variables.
    pub fn from_settings(llm: &LlmSettings, http: &HttpSettings) -> Self {
        let mut module = Self::new();
        let store = module.binding.store();
        bind_with_env(store, KEY_PROVIDER, llm.provider.clone(), "OPENAI_PROVIDER");
        bind_with_env(store, KEY_ENDPOINT, llm.endpoint_url.clone(), "OPENAI_ENDPOINT_URL");
        bind_with_env(store, KEY_API_KEY, llm.api_key.clone(), "OPENAI_API_KEY");
        bind_with_env(store, KEY_GPT_MODEL, llm.gpt_model.clone(), "OPENAI_GPT_MODEL");
        bind_with_env(store, KEY_DALLE_MODEL, llm.dalle_model.clone(), "OPENAI_DALLE_MODEL");
        module.timeout = http.timeout();
        module
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
    pub fn set_client(&self, client: Arc<dyn LlmClient>) {
        self.client.set(client);
    }

    fn client(&self) -> Result<Arc<dyn LlmClient>> {
        self.client.get_or_try_init(|| {
            let store = self.binding.store();
            let api_key = store.require(&[KEY_API_KEY])?.remove(0);
            let provider = store
                .get_present(KEY_PROVIDER)
                .map_or_else(|| "openai".to_string(), |p| p.trim().to_lowercase());
            let provider = match provider.as_str() {
                "openai" => Provider::OpenAi,
                "azure" => Provider::Azure,
                _ => return Err(Error::UnsupportedProvider(provider)),
            };
            let endpoint = store.get_present(KEY_ENDPOINT);
            let client = OpenAiClient::new(provider, &api_key, endpoint.as_deref(), self.timeout)?;
            Ok(Arc::new(client) as Arc<dyn LlmClient>)
        })
    }

    /// Explicit model argument, else the configured default.
    fn model(&self, explicit: &NullableStringOrBytes, key: &str, kind: &'static str) -> Result<String> {
        let explicit = explicit.to_string_lossy();
        if !explicit.trim().is_empty() {
            return Ok(explicit);
        }
        self.binding
            .store()
            .get_present(key)
            .ok_or(Error::ModelNotConfigured(kind))
    }

    fn chat<'lua>(&self, lua: &'lua Lua, args: MultiValue<'lua>) -> Result<Value<'lua>> {
        let fname = format!("{MODULE_NAME}.chat");
        let args = Args::unpack(&fname, args, CHAT_PARAMS)?;
        let text: NullableStringOrBytes = args.get_or("text", NullableStringOrBytes::Null)?;
        let image: NullableStringOrBytes = args.get_or("image", NullableStringOrBytes::Null)?;
        let image_file: NullableStringOrBytes = args.get_or("image_file", NullableStringOrBytes::Null)?;
        let image_url: NullableStringOrBytes = args.get_or("image_url", NullableStringOrBytes::Null)?;
        let history: OneOrMany<Table> = args.get_or("messages", OneOrMany::Empty)?;
        let model: NullableStringOrBytes = args.get_or("model", NullableStringOrBytes::Null)?;
        let n: i64 = args.get_or("n", 1)?;
        let max_tokens: i64 = args.get_or("max_tokens", 64)?;
        let temperature: NumberOrFloat = args.get_or("temperature", NumberOrFloat(1.0))?;
        let top_p: NumberOrFloat = args.get_or("top_p", NumberOrFloat(1.0))?;
        let frequency_penalty: NumberOrFloat = args.get_or("frequency_penalty", NumberOrFloat(0.0))?;
        let presence_penalty: NumberOrFloat = args.get_or("presence_penalty", NumberOrFloat(0.0))?;
        let stop: OneOrMany<String> = args.get_or("stop", OneOrMany::Empty)?;
        let response_format: NullableStringOrBytes =
            args.get_or("response_format", NullableStringOrBytes::with_default("text"))?;
        let opts = call_options(&args)?;

        let model = self.model(&model, KEY_GPT_MODEL, "gpt")?;
        let n = positive("n", n)?;
        let max_tokens = positive("max_tokens", max_tokens)?;
        check_range("temperature", temperature.as_f64(), 0.0, 2.0)?;
        check_range("top_p", top_p.as_f64(), 0.0, 1.0)?;
        check_range("frequency_penalty", frequency_penalty.as_f64(), -2.0, 2.0)?;
        check_range("presence_penalty", presence_penalty.as_f64(), -2.0, 2.0)?;
        let response_format = match response_format.to_string_lossy().as_str() {
            "text" => "text",
            "json" => "json_object",
            other => {
                return Err(Error::Validation(format!("unsupported response format: {other}")));
            }
        };

        // Inline content becomes a user message ahead of the history.
        let mut records = Vec::with_capacity(history.len() + 1);
        let user = MessageRecord {
            role: Some(ROLE_USER.to_string()),
            text: present(&text).map(|v| v.to_string_lossy()),
            image: present(&image).map(|v| v.as_bytes().to_vec()),
            image_file: present(&image_file).map(|v| v.to_string_lossy()),
            image_url: present(&image_url).map(|v| v.to_string_lossy()),
        };
        if user.text.is_some() || user.image.is_some() || user.image_file.is_some() || user.image_url.is_some() {
            records.push(user);
        }
        for record in history.as_slice() {
            records.push(MessageRecord::from_table(record)?);
        }
        if records.is_empty() {
            return Err(Error::Validation(
                "one of text, image, image_file, image_url or messages is required".to_string(),
            ));
        }

        let request = ChatRequest {
            model,
            messages: messages_to_chat_messages(&records)?,
            max_tokens,
            temperature: temperature.as_f64() as f32,
            top_p: top_p.as_f64() as f32,
            n,
            stop: stop.into_vec(),
            presence_penalty: presence_penalty.as_f64() as f32,
            frequency_penalty: frequency_penalty.as_f64() as f32,
            response_format: ResponseFormat {
                kind: response_format.to_string(),
            },
        };

        let client = self.client()?;
        tracing::debug!(
            module = MODULE_NAME,
            op = "chat",
            model = %request.model,
            messages = request.messages.len(),
            n,
            retry = opts.retry,
            "calling chat model"
        );
        let outcome = with_retry(&opts.policy(), self.cancel_token(), || client.chat(&request));
        let Some(response) = opts.settle(outcome.result)? else {
            return Ok(Value::Nil);
        };

        if opts.full_response {
            return to_script_value(lua, &response);
        }
        let content = |choice: &ChatChoice| choice.message.content.clone().unwrap_or_default();
        match response.choices.as_slice() {
            [] => Ok(Value::Nil),
            [first, ..] if n == 1 => Ok(Value::String(lua.create_string(content(first))?)),
            choices => Ok(Value::Table(lua.create_sequence_from(choices.iter().map(content))?)),
        }
    }

    fn draw<'lua>(&self, lua: &'lua Lua, args: MultiValue<'lua>) -> Result<Value<'lua>> {
        let fname = format!("{MODULE_NAME}.draw");
        let args = Args::unpack(&fname, args, DRAW_PARAMS)?;
        let prompt: NullableStringOrBytes = args.require("prompt")?;
        let model: NullableStringOrBytes = args.get_or("model", NullableStringOrBytes::Null)?;
        let n: i64 = args.get_or("n", 1)?;
        let quality: NullableStringOrBytes =
            args.get_or("quality", NullableStringOrBytes::with_default("standard"))?;
        let size: NullableStringOrBytes = args.get_or("size", NullableStringOrBytes::with_default("1024x1024"))?;
        let style: NullableStringOrBytes = args.get_or("style", NullableStringOrBytes::with_default("vivid"))?;
        let response_format: NullableStringOrBytes =
            args.get_or("response_format", NullableStringOrBytes::with_default("url"))?;
        let opts = call_options(&args)?;

        if prompt.to_string_lossy().trim().is_empty() {
            return Err(Error::Validation("prompt is required".to_string()));
        }
        let model = self.model(&model, KEY_DALLE_MODEL, "dalle")?;
        let n = positive("n", n)?;

        let request = ImageRequest {
            prompt: prompt.to_string_lossy(),
            model,
            n,
            quality: quality.to_string_lossy(),
            size: size.to_string_lossy(),
            style: style.to_string_lossy(),
            response_format: response_format.to_string_lossy(),
        };

        let client = self.client()?;
        tracing::debug!(
            module = MODULE_NAME,
            op = "draw",
            model = %request.model,
            n,
            size = %request.size,
            "calling image model"
        );
        let outcome = with_retry(&opts.policy(), self.cancel_token(), || client.draw(&request));
        let Some(response) = opts.settle(outcome.result)? else {
            return Ok(Value::Nil);
        };

        if opts.full_response {
            return to_script_value(lua, &response);
        }
        let as_url = request.response_format.eq_ignore_ascii_case("url");
        match response.data.as_slice() {
            [] => Ok(Value::Nil),
            [first, ..] if n == 1 => extract_image(lua, first, as_url),
            images => {
                let items = images
                    .iter()
                    .map(|image| extract_image(lua, image, as_url))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Value::Table(lua.create_sequence_from(items)?))
            }
        }
    }
}

/// Build a message record. The role defaults to `user`; empty fields are
/// left out.
fn message<'lua>(lua: &'lua Lua, args: MultiValue<'lua>) -> Result<Value<'lua>> {
    let fname = format!("{MODULE_NAME}.message");
    let args = Args::unpack(&fname, args, MESSAGE_PARAMS)?;
    let field = |name: &str| -> Result<Option<NullableStringOrBytes>> {
        let value: NullableStringOrBytes = args.get_or(name, NullableStringOrBytes::Null)?;
        Ok(if value.is_null_or_empty() { None } else { Some(value) })
    };
    let record = MessageRecord {
        role: Some(field("role")?.map_or_else(|| ROLE_USER.to_string(), |v| v.to_string_lossy())),
        text: field("text")?.map(|v| v.to_string_lossy()),
        image: field("image")?.and_then(|v| v.as_option().map(|b| b.as_bytes().to_vec())),
        image_file: field("image_file")?.map(|v| v.to_string_lossy()),
        image_url: field("image_url")?.map(|v| v.to_string_lossy()),
    };
    Ok(Value::Table(record.to_table(lua)?))
}

fn present(value: &NullableStringOrBytes) -> Option<&crate::args::StringOrBytes> {
    value.as_option().filter(|v| !v.is_empty())
}

fn call_options(args: &Args) -> Result<CallOptions> {
    Ok(CallOptions {
        retry: args.get_or("retry", 1)?,
        full_response: args.get_or("full_response", false)?,
        allow_error: args.get_or("allow_error", false)?,
    })
}

fn positive(name: &str, value: i64) -> Result<u32> {
    u32::try_from(value)
        .ok()
        .filter(|v| *v >= 1)
        .ok_or_else(|| Error::Validation(format!("{name} must be at least 1, got {value}")))
}

fn check_range(name: &str, value: f64, min: f64, max: f64) -> Result<()> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(Error::Validation(format!("{name} must be between {min} and {max}, got {value}")))
    }
}

fn extract_image<'lua>(lua: &'lua Lua, data: &ImageData, as_url: bool) -> Result<Value<'lua>> {
    if as_url {
        return Ok(Value::String(lua.create_string(data.url.as_deref().unwrap_or_default())?));
    }
    let raw = STANDARD
        .decode(data.b64_json.as_deref().unwrap_or_default())
        .map_err(|e| Error::Marshal(format!("invalid image data: {e}")))?;
    Ok(Value::String(lua.create_string(normalize_png(&raw)?)?))
}

/// Decode and re-encode PNG data, rejecting anything that is not a valid
/// PNG image.
pub fn normalize_png(raw: &[u8]) -> Result<Vec<u8>> {
    let img = image::load_from_memory_with_format(raw, ImageFormat::Png)?;
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

impl ScriptModule for LlmModule {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn load<'lua>(&self, lua: &'lua Lua) -> mlua::Result<Table<'lua>> {
        let message = builtin(lua, |lua, args| Ok(message(lua, args)?))?;
        let this = self.clone();
        let chat = builtin(lua, move |lua, args| Ok(this.chat(lua, args)?))?;
        let this = self.clone();
        let draw = builtin(lua, move |lua, args| Ok(this.draw(lua, args)?))?;
        let cache = Arc::clone(&self.client);
        self.binding.register_operations(
            lua,
            vec![("message", message), ("chat", chat), ("draw", draw)],
            move || cache.invalidate(),
        )
    }
}
