/// Shared error type used across all DeepGate crates.
///
/// The variants follow the service's error taxonomy: `NotFound`,
/// `PermissionDenied`, `Auth` and `Validation` map onto HTTP statuses at the
/// API layer; `Sandbox`, `Provider` and `Database` terminate a turn;
/// tool-level failures never become this type — they are surfaced back to
/// the model as tool results.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("database: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("sandbox: {0}")]
    Sandbox(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Convenience for `NotFound` with an entity name and id.
    pub fn not_found(entity: &str, id: impl std::fmt::Display) -> Self {
        Error::NotFound(format!("{entity} {id}"))
    }
}
