//! Error types for registry transfer operations

pub mod handlers;

use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Envelope of a registry response that was turned into an error.
#[derive(Debug, Clone)]
pub struct ApiErrorResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl std::fmt::Display for ApiErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "registry responded with status code={}, response={}",
            self.status.as_u16(),
            self.body
        )
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    /// No candidate endpoint could be reached during discovery
    #[error("unable to connect to any of {candidates}: {}", failures.join("; "))]
    Connection {
        candidates: String,
        failures: Vec<String>,
    },

    /// A 401/403 response carried no challenge for the configured scheme
    #[error("no WWW-Authenticate challenge was found for scheme {scheme}")]
    AuthChallengeMissing { scheme: String },

    /// The token realm refused or failed the credential exchange
    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    /// 401 surfaced after the re-authentication attempt
    #[error("unauthorized: {0}")]
    Unauthorized(Box<ApiErrorResponse>),

    /// 416 on a chunk transfer: out-of-order or mismatched range
    #[error("requested range not satisfiable: {0}")]
    RangeNotSatisfiable(Box<ApiErrorResponse>),

    /// Any other non-2xx/3xx response
    #[error("registry API error: {0}")]
    Api(Box<ApiErrorResponse>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("parse error: {0}")]
    Parse(String),
}

impl RegistryError {
    /// HTTP status of the response behind this error, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            RegistryError::Unauthorized(response)
            | RegistryError::RangeNotSatisfiable(response)
            | RegistryError::Api(response) => Some(response.status),
            _ => None,
        }
    }

    pub fn response(&self) -> Option<&ApiErrorResponse> {
        match self {
            RegistryError::Unauthorized(response)
            | RegistryError::RangeNotSatisfiable(response)
            | RegistryError::Api(response) => Some(response),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, RegistryError::Unauthorized(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RegistryError::Cancelled)
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        RegistryError::Parse(err.to_string())
    }
}

impl From<url::ParseError> for RegistryError {
    fn from(err: url::ParseError) -> Self {
        RegistryError::InvalidArgument(format!("invalid URL: {}", err))
    }
}

impl From<reqwest::header::InvalidHeaderValue> for RegistryError {
    fn from(err: reqwest::header::InvalidHeaderValue) -> Self {
        RegistryError::InvalidArgument(format!("invalid header value: {}", err))
    }
}

impl From<reqwest::header::InvalidHeaderName> for RegistryError {
    fn from(err: reqwest::header::InvalidHeaderName) -> Self {
        RegistryError::InvalidArgument(format!("invalid header name: {}", err))
    }
}
