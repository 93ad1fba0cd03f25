//! Typed errors for the connector crates.

use thiserror::Error;

/// Classification attached to every [`ConnectorError`].
///
/// Higher layers decide between retrying and failing fast by looking at this
/// code instead of matching on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidConfiguration,
    Unsupported,
    TableNotFound,
    DestinationTableCreationFailed,
    StreamReadFailed,
    TypeMapping,
    Decode,
    /// Transient service or transport failure.
    Retryable,
    Service,
    Engine,
}

/// Errors that can occur anywhere in the connector.
#[derive(Debug, Clone, Error)]
pub enum ConnectorError {
    /// Invalid or missing option. Raised before any network call.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Views disabled, exotic table type or unsupported format.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The requested table does not exist.
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// Destination table creation or the materialization job failed.
    #[error("error creating destination table (job {}): {message}; query: {sql}", .job_id.as_deref().unwrap_or("<none>"))]
    MaterializationFailure {
        sql: String,
        job_id: Option<String>,
        message: String,
    },

    /// A stream could not be read within its retry budget.
    #[error("read of stream '{stream}' failed after {attempts} attempt(s): {message}")]
    StreamReadFailure {
        stream: String,
        attempts: u32,
        message: String,
    },

    /// A warehouse type has no engine counterpart.
    #[error("type mapping: {0}")]
    TypeMapping(String),

    /// A wire payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// The control or storage API reported an error.
    #[error("service error (status {status}, reason '{reason}'): {message}")]
    Service {
        status: u16,
        reason: String,
        message: String,
    },

    /// The request never reached the service or the connection broke.
    #[error("transport error: {0}")]
    Transport(String),

    /// The host engine reported an error.
    #[error("engine error: {0}")]
    Engine(String),
}

pub type Result<T, E = ConnectorError> = std::result::Result<T, E>;

const RETRYABLE_STATUS: [u16; 6] = [408, 429, 500, 502, 503, 504];
const RETRYABLE_REASONS: [&str; 4] = [
    "backendError",
    "internalError",
    "rateLimitExceeded",
    "jobBackendError",
];

impl ConnectorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ConnectorError::Configuration(_) => ErrorCode::InvalidConfiguration,
            ConnectorError::Unsupported(_) => ErrorCode::Unsupported,
            ConnectorError::TableNotFound(_) => ErrorCode::TableNotFound,
            ConnectorError::MaterializationFailure { .. } => {
                ErrorCode::DestinationTableCreationFailed
            }
            ConnectorError::StreamReadFailure { .. } => ErrorCode::StreamReadFailed,
            ConnectorError::TypeMapping(_) => ErrorCode::TypeMapping,
            ConnectorError::Decode(_) => ErrorCode::Decode,
            ConnectorError::Service { .. } if self.is_retryable() => ErrorCode::Retryable,
            ConnectorError::Service { .. } => ErrorCode::Service,
            ConnectorError::Transport(_) => ErrorCode::Retryable,
            ConnectorError::Engine(_) => ErrorCode::Engine,
        }
    }

    /// Whether the same call may succeed if issued again.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConnectorError::Service { status, reason, .. } => {
                RETRYABLE_STATUS.contains(status) || RETRYABLE_REASONS.contains(&reason.as_str())
            }
            ConnectorError::Transport(_) => true,
            _ => false,
        }
    }
}

impl From<arrow::error::ArrowError> for ConnectorError {
    fn from(e: arrow::error::ArrowError) -> Self {
        ConnectorError::Decode(e.to_string())
    }
}

impl From<serde_json::Error> for ConnectorError {
    fn from(e: serde_json::Error) -> Self {
        ConnectorError::Decode(e.to_string())
    }
}

impl From<datafusion::error::DataFusionError> for ConnectorError {
    fn from(e: datafusion::error::DataFusionError) -> Self {
        ConnectorError::Engine(e.to_string())
    }
}

impl From<ConnectorError> for datafusion::error::DataFusionError {
    fn from(e: ConnectorError) -> Self {
        datafusion::error::DataFusionError::External(Box::new(e))
    }
}
