//! starport-core: script bindings for external services
//!
//! Exposes mail sending, LLM chat and image generation, and a charm account
//! (key-value stores, file store, profile) as builtins inside an embedded
//! Lua runtime.
//!
//! # Architecture
//!
//! ```text
//! script call → Args (decode) → validate → build request
//!                                              ↓
//!                     ClientCache ← ConfigStore (lazy producers)
//!                                              ↓
//!                      with_retry (fail fast on 400, CancelToken)
//!                                              ↓
//!                      shape result (simple | full via marshal)
//! ```
//!
//! # Modules
//!
//! - `config_store`: named configuration slots with per-read producers
//! - `binding`: module tables, generated setters, cached clients
//! - `args`: argument unpacking and the flexible argument kinds
//! - `retry`: bounded retry with cancellation
//! - `marshal`: host structures to script values
//! - `email`: `email.send` over the Resend API
//! - `llm`: `llm.chat`, `llm.draw`, `llm.message` over OpenAI or Azure
//! - `charm`: `ckv`, `cfs` and `cacc` over a local charm backend
//! - `settings`: `starport.toml` loading
//! - `logging`: tracing subscriber setup for hosts
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod args;
pub mod binding;
pub mod charm;
pub mod config_store;
pub mod email;
pub mod error;
pub mod llm;
pub mod logging;
pub mod marshal;
pub mod retry;
pub mod settings;

pub use binding::{ScriptModule, install};
pub use error::{Error, Result};
pub use settings::Settings;

use retry::CancelToken;

/// Every module configured from `settings`, sharing one cancellation
/// token.
pub struct Modules {
    pub email: email::EmailModule,
    pub llm: llm::LlmModule,
    pub kv: charm::KvModule,
    pub fs: charm::FsModule,
    pub account: charm::AccountModule,
}

impl Modules {
    pub fn from_settings(settings: &Settings, cancel: &CancelToken) -> Self {
        Self {
            email: email::EmailModule::from_settings(&settings.email, &settings.http)
                .with_cancel_token(cancel.clone()),
            llm: llm::LlmModule::from_settings(&settings.llm, &settings.http)
                .with_cancel_token(cancel.clone()),
            kv: charm::KvModule::from_settings(&settings.charm),
            fs: charm::FsModule::from_settings(&settings.charm),
            account: charm::AccountModule::from_settings(&settings.charm),
        }
    }

    /// Install every module into `lua`.
    pub fn install(&self, lua: &mlua::Lua) -> mlua::Result<()> {
        install(lua, &[&self.email, &self.llm, &self.kv, &self.fs, &self.account])
    }
}
