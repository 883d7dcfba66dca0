//! Error types for the sync engine.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Store-related errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Credential cipher errors. Always fatal for the affected mailbox.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("Invalid ciphertext format: {0}")]
    InvalidFormat(String),

    #[error("Decryption failed: {0}")]
    Decrypt(String),

    #[error("Encryption failed: {0}")]
    Encrypt(String),
}

/// IMAP fetch errors.
///
/// `Auth` is fatal for the mailbox; everything else is transient and the
/// next cycle retries from the unchanged checkpoint.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Message parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Whether this error should mark the mailbox as failed (`status = ERROR`)
    /// rather than being retried on the next cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FetchError::Auth(_))
    }
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_is_fatal() {
        assert!(FetchError::Auth("LOGIN rejected".into()).is_fatal());
    }

    #[test]
    fn timeout_is_transient() {
        assert!(!FetchError::Timeout("greeting".into()).is_fatal());
        assert!(!FetchError::Connect("refused".into()).is_fatal());
    }
}
