//! Token realm client
//!
//! Exchanges a bearer challenge (realm, service, scope) and optional credentials for a
//! registry token: `GET {realm}?service={service}&scope={scope}`.

use crate::error::handlers::NetworkErrorHandler;
use crate::error::{RegistryError, Result};
use crate::logging::Logger;
use crate::registry::auth::{AuthChallenge, Credentials};
use serde::Deserialize;
use url::Url;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
    issued_at: Option<String>,
}

/// Bearer credential issued by a token realm
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub expires_in: Option<u64>,
    pub issued_at: Option<String>,
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("value", &format_args!("<{} chars>", self.value.len()))
            .field("expires_in", &self.expires_in)
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct TokenClient {
    http: reqwest::Client,
    output: Logger,
}

impl TokenClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            output: Logger::new("token", false),
        }
    }

    pub fn with_logger(mut self, output: Logger) -> Self {
        self.output = output;
        self
    }

    pub fn logger(&self) -> &Logger {
        &self.output
    }

    pub fn token_url(challenge: &AuthChallenge) -> Result<Url> {
        let mut url = Url::parse(&challenge.realm).map_err(|e| {
            RegistryError::TokenExchange(format!("invalid realm '{}': {}", challenge.realm, e))
        })?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(service) = challenge.service.as_deref().filter(|s| !s.is_empty()) {
                pairs.append_pair("service", service);
            }
            if let Some(scope) = challenge.scope.as_deref().filter(|s| !s.is_empty()) {
                pairs.append_pair("scope", scope);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }

    pub async fn fetch_token(
        &self,
        challenge: &AuthChallenge,
        credentials: Option<&Credentials>,
    ) -> Result<Token> {
        let url = Self::token_url(challenge)?;
        self.output.detail(&format!(
            "Requesting token from {} (service={:?}, scope={:?})",
            challenge.realm, challenge.service, challenge.scope
        ));

        let mut request = self.http.get(url);
        if let Some(credentials) = credentials {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }

        let response = request.send().await.map_err(|e| {
            RegistryError::TokenExchange(
                NetworkErrorHandler::handle_network_error(&e, "token request").to_string(),
            )
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            self.output.warning(&format!(
                "Token request to {} failed with status {}",
                challenge.realm, status
            ));
            return Err(RegistryError::TokenExchange(format!(
                "realm {} responded with status {}: {}",
                challenge.realm, status, error_text
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| RegistryError::TokenExchange(format!("failed to read token response: {}", e)))?;
        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| RegistryError::TokenExchange(format!("failed to parse token response: {}", e)))?;

        let value = parsed
            .token
            .filter(|t| !t.is_empty())
            .or(parsed.access_token.filter(|t| !t.is_empty()))
            .ok_or_else(|| {
                RegistryError::TokenExchange("token response carried no token".to_string())
            })?;

        self.output
            .detail(&format!("Token obtained (length: {} chars)", value.len()));

        Ok(Token {
            value,
            expires_in: parsed.expires_in,
            issued_at: parsed.issued_at,
        })
    }
}
