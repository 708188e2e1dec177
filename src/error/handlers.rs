//! Transport error classification shared by the dispatcher and token client

use crate::error::RegistryError;

/// Network error categorization and handling
pub struct NetworkErrorHandler;

impl NetworkErrorHandler {
    /// Categorize and format network errors with helpful context
    pub fn handle_network_error(error: &reqwest::Error, context: &str) -> RegistryError {
        if error.is_timeout() {
            RegistryError::Timeout(format!("{} timeout: {}", context, error))
        } else if error.is_connect() {
            RegistryError::Network(format!("Connection error during {}: {}", context, error))
        } else if error.is_request() {
            RegistryError::Network(format!("Request error during {}: {}", context, error))
        } else if error.is_body() || error.is_decode() {
            RegistryError::Network(format!("Failed to read response during {}: {}", context, error))
        } else {
            RegistryError::Network(format!("Network error during {}: {}", context, error))
        }
    }

    /// Flatten an error and its source chain into one line; used when aggregating probe failures
    pub fn describe(error: &(dyn std::error::Error + 'static)) -> String {
        let mut message = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        message
    }
}
