//! Error types for starport-core

use thiserror::Error;

/// Result type alias for starport-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by bindings, either to the host or to a calling script.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or missing script-level input. Never retried.
    #[error("{0}")]
    Argument(String),

    /// A configuration key was never bound to a producer
    #[error("config {0} not set")]
    NotConfigured(String),

    /// A setter received a value of the wrong runtime type
    #[error("value type mismatch for {key}: expected {expected}, got {got}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        got: String,
    },

    /// A key needed to build a client is absent or blank
    #[error("missing config: {0}")]
    MissingConfig(String),

    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),

    /// Neither the call nor the configuration names a model
    #[error("{0} model is not set")]
    ModelNotConfigured(&'static str),

    /// A local-part was given but no domain is configured to qualify it
    #[error("sender_domain should be set when {0} is used")]
    MissingDomain(&'static str),

    /// Cross-field policy violation
    #[error("{0}")]
    Validation(String),

    /// Configuration problem found while constructing a service client
    #[error("client not available: {0}")]
    ClientUnavailable(#[source] Box<Error>),

    /// Network or provider failure
    #[error("{}", format_transport(*status, message))]
    Transport { status: Option<u16>, message: String },

    /// A response could not be converted into a script value
    #[error("marshal error: {0}")]
    Marshal(String),

    /// The host cancelled the call before the next attempt started
    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("{0}")]
    Lua(#[from] mlua::Error),
}

fn format_transport(status: Option<u16>, message: &str) -> String {
    match status {
        Some(code) => format!("transport error (status {code}): {message}"),
        None => format!("transport error: {message}"),
    }
}

impl Error {
    /// Transport failure with no HTTP status (connect, timeout, decode)
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            status: None,
            message: message.into(),
        }
    }

    /// Provider answered with a non-success HTTP status
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Transport {
            status: Some(status),
            message: message.into(),
        }
    }

    /// True for provider-side validation failures (HTTP 400)
    #[must_use]
    pub fn is_bad_request(&self) -> bool {
        matches!(self, Self::Transport { status: Some(400), .. })
    }

    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Find the starport error carried by an error raised inside Lua.
    ///
    /// Errors returned from builtins are wrapped by the runtime in callback
    /// and context layers; this walks through them.
    #[must_use]
    pub fn from_lua(err: &mlua::Error) -> Option<&Error> {
        match err {
            mlua::Error::ExternalError(inner) => inner.downcast_ref::<Error>(),
            mlua::Error::CallbackError { cause, .. } => Self::from_lua(cause),
            mlua::Error::WithContext { cause, .. } => Self::from_lua(cause),
            _ => None,
        }
    }
}

impl From<Error> for mlua::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Lua(inner) => inner,
            other => mlua::Error::external(other),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::http(status.as_u16(), err.to_string()),
            None => Self::transport(err.to_string()),
        }
    }
}
