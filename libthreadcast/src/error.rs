//! Error types for Threadcast

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ThreadcastError>;

#[derive(Error, Debug)]
pub enum ThreadcastError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Media processing error: {0}")]
    Media(#[from] MediaError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Missed schedule: thread was due at {scheduled_at} and the {grace_secs}s grace window has passed")]
    ScheduleMissed {
        scheduled_at: chrono::DateTime<chrono::Utc>,
        grace_secs: i64,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl ThreadcastError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            ThreadcastError::Config(_) => 2,
            ThreadcastError::InvalidInput(_) => 3,
            _ => 1,
        }
    }

    /// Check if an error is transient and should be retried
    ///
    /// Transient errors include network failures, server errors, rate limiting
    /// and storage I/O. Everything else (authentication, validation, media that
    /// cannot be shrunk, containers that expired) is permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            ThreadcastError::Platform(platform_error) => platform_error.is_transient(),
            ThreadcastError::Storage(StorageError::Io(_)) => true,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Malformed document: {0}")]
    DocumentError(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone)]
pub enum PlatformError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Content validation failed: {0}")]
    Validation(String),

    #[error("Posting failed: {0}")]
    Posting(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Media processing failed: {0}")]
    Processing(String),
}

impl PlatformError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PlatformError::Network(_) | PlatformError::RateLimit(_))
    }
}

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Media cannot fit in {budget} bytes (smallest encoding was {smallest} bytes)")]
    TooLarge { budget: u64, smallest: u64 },

    #[error("Unsupported mime type: {0}")]
    UnsupportedMimeType(String),

    #[error("Failed to decode media: {0}")]
    Decode(String),

    #[error("Failed to encode media: {0}")]
    Encode(String),

    #[error("ffmpeg failed: {0}")]
    Ffmpeg(String),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Invalid blob key: {0}")]
    InvalidKey(String),

    #[error("Blob I/O failed: {0}")]
    Io(#[from] std::io::Error),
}
