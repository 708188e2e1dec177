//! Authentication strategies for registry access
//!
//! Every request passes through an [`AuthStrategy`] twice at most: [`AuthStrategy::authenticate`]
//! before the first send, and [`AuthStrategy::authenticate_challenge`] on a freshly built
//! request when the first send was answered with 401 or 403.
//!
//! - [`AnonymousBearerAuth`] and [`PasswordBearerAuth`] do nothing up front. When challenged
//!   they parse `WWW-Authenticate: Bearer realm=..,service=..,scope=..` and fetch a token from
//!   the realm, anonymously or with credentials. Tokens are not cached between requests.
//! - [`BasicAuth`] sends credentials on every request.
//!
//! All strategies support a session override ([`AuthStrategy::change_identity`]) that
//! replaces the configured credentials for subsequent authentications.

use crate::error::{RegistryError, Result};
use crate::logging::Logger;
use crate::registry::token::TokenClient;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Request;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue, WWW_AUTHENTICATE};
use std::collections::HashMap;
use std::sync::RwLock;

/// Anti-forgery header echoed from a challenge response onto the retried request
pub const CSRF_TOKEN_HEADER: &str = "X-Harbor-Csrf-Token";

const BEARER: &str = "Bearer";
const BASIC: &str = "Basic";

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A parsed `WWW-Authenticate` challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub scheme: String,
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl AuthChallenge {
    /// Parse one header value: `<scheme> key="value",key=value`
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, rest) = match header.find(char::is_whitespace) {
            Some(pos) => (&header[..pos], &header[pos..]),
            None => (header, ""),
        };
        if scheme.is_empty() {
            return None;
        }

        let mut params = parse_params(rest);
        Some(Self {
            scheme: scheme.to_string(),
            realm: params.remove("realm").unwrap_or_default(),
            service: params.remove("service"),
            scope: params.remove("scope"),
        })
    }

    /// First challenge in `headers` whose scheme matches, case-insensitively
    pub fn from_headers(headers: &HeaderMap, scheme: &str) -> Option<Self> {
        headers
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(Self::parse)
            .find(|challenge| challenge.scheme.eq_ignore_ascii_case(scheme))
    }
}

/// Split `key="quoted, value", key=token` into a map; keys are lowercased
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace() || *c == ',') {
            chars.next();
        }
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ',' {
                break;
            }
            key.push(c);
            chars.next();
        }
        if key.trim().is_empty() && chars.peek().is_none() {
            break;
        }
        if chars.next() != Some('=') {
            continue;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    _ => value.push(c),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
            value = value.trim().to_string();
        }
        params.insert(key.trim().to_ascii_lowercase(), value);
    }

    params
}

/// Copy the anti-forgery token from a challenge response, if one was sent
pub fn copy_csrf_token(challenge_headers: &HeaderMap, request: &mut Request) {
    if let Some(value) = challenge_headers.get(CSRF_TOKEN_HEADER) {
        if !value.is_empty() {
            request
                .headers_mut()
                .insert(HeaderName::from_static("x-harbor-csrf-token"), value.clone());
        }
    }
}

/// Runtime identity replacement shared by all strategies
#[derive(Debug, Default)]
struct IdentityOverride {
    current: RwLock<Option<Credentials>>,
}

impl IdentityOverride {
    fn set(&self, username: &str, password: &str) {
        if let Ok(mut guard) = self.current.write() {
            *guard = Some(Credentials::new(username, password));
        }
    }

    /// Override if one with a non-empty username is set, otherwise `fallback`
    fn resolve(&self, fallback: Option<&Credentials>) -> Option<Credentials> {
        let current = self.current.read().ok().and_then(|guard| guard.clone());
        match current {
            Some(credentials) if !credentials.username.is_empty() => Some(credentials),
            _ => fallback.cloned(),
        }
    }
}

#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Scheme this strategy answers challenges for
    fn scheme(&self) -> &'static str;

    /// Called before the first send of every request
    async fn authenticate(&self, request: &mut Request) -> Result<()>;

    /// Called on a new request after the previous send was answered with 401/403
    async fn authenticate_challenge(
        &self,
        request: &mut Request,
        challenge_headers: &HeaderMap,
    ) -> Result<()>;

    /// Replace the credentials used by subsequent authentications
    fn change_identity(&self, username: &str, password: &str);
}

/// Shared challenge handling of the two bearer strategies
async fn answer_bearer_challenge(
    tokens: &TokenClient,
    output: &Logger,
    request: &mut Request,
    challenge_headers: &HeaderMap,
    credentials: Option<Credentials>,
) -> Result<()> {
    let challenge = AuthChallenge::from_headers(challenge_headers, BEARER).ok_or_else(|| {
        RegistryError::AuthChallengeMissing {
            scheme: BEARER.to_string(),
        }
    })?;
    if challenge.realm.is_empty() {
        return Err(RegistryError::TokenExchange(
            "bearer challenge has no realm".to_string(),
        ));
    }

    copy_csrf_token(challenge_headers, request);

    output.detail(&format!(
        "Answering bearer challenge: realm={}, service={:?}, scope={:?}",
        challenge.realm, challenge.service, challenge.scope
    ));
    let token = tokens.fetch_token(&challenge, credentials.as_ref()).await?;

    let value = HeaderValue::from_str(&format!("{} {}", BEARER, token.value)).map_err(|_| {
        RegistryError::TokenExchange("token contains characters invalid in a header".to_string())
    })?;
    request.headers_mut().insert(AUTHORIZATION, value);
    Ok(())
}

/// Bearer tokens obtained without credentials
pub struct AnonymousBearerAuth {
    tokens: TokenClient,
    identity: IdentityOverride,
    output: Logger,
}

impl AnonymousBearerAuth {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            tokens: TokenClient::new(http),
            identity: IdentityOverride::default(),
            output: Logger::new("auth", false),
        }
    }

    /// Route auth and token-exchange logging through `output`
    pub fn with_logger(mut self, output: Logger) -> Self {
        self.tokens = self.tokens.with_logger(output.for_component("token"));
        self.output = output;
        self
    }
}

#[async_trait]
impl AuthStrategy for AnonymousBearerAuth {
    fn scheme(&self) -> &'static str {
        BEARER
    }

    async fn authenticate(&self, _request: &mut Request) -> Result<()> {
        Ok(())
    }

    async fn authenticate_challenge(
        &self,
        request: &mut Request,
        challenge_headers: &HeaderMap,
    ) -> Result<()> {
        let credentials = self.identity.resolve(None);
        answer_bearer_challenge(&self.tokens, &self.output, request, challenge_headers, credentials)
            .await
    }

    fn change_identity(&self, username: &str, password: &str) {
        self.identity.set(username, password);
    }
}

/// Bearer tokens obtained by presenting username/password to the realm
pub struct PasswordBearerAuth {
    credentials: Credentials,
    tokens: TokenClient,
    identity: IdentityOverride,
    output: Logger,
}

impl PasswordBearerAuth {
    pub fn new(credentials: Credentials, http: reqwest::Client) -> Self {
        Self {
            credentials,
            tokens: TokenClient::new(http),
            identity: IdentityOverride::default(),
            output: Logger::new("auth", false),
        }
    }

    /// Route auth and token-exchange logging through `output`
    pub fn with_logger(mut self, output: Logger) -> Self {
        self.tokens = self.tokens.with_logger(output.for_component("token"));
        self.output = output;
        self
    }
}

#[async_trait]
impl AuthStrategy for PasswordBearerAuth {
    fn scheme(&self) -> &'static str {
        BEARER
    }

    async fn authenticate(&self, _request: &mut Request) -> Result<()> {
        Ok(())
    }

    async fn authenticate_challenge(
        &self,
        request: &mut Request,
        challenge_headers: &HeaderMap,
    ) -> Result<()> {
        let credentials = self.identity.resolve(Some(&self.credentials));
        answer_bearer_challenge(&self.tokens, &self.output, request, challenge_headers, credentials)
            .await
    }

    fn change_identity(&self, username: &str, password: &str) {
        self.identity.set(username, password);
    }
}

/// Static `Authorization: Basic` credentials
pub struct BasicAuth {
    credentials: Credentials,
    identity: IdentityOverride,
}

impl BasicAuth {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            identity: IdentityOverride::default(),
        }
    }

    fn header_value(&self) -> Result<HeaderValue> {
        let credentials = self
            .identity
            .resolve(Some(&self.credentials))
            .unwrap_or_else(|| self.credentials.clone());
        let encoded = STANDARD.encode(format!("{}:{}", credentials.username, credentials.password));
        Ok(HeaderValue::from_str(&format!("{} {}", BASIC, encoded))?)
    }
}

#[async_trait]
impl AuthStrategy for BasicAuth {
    fn scheme(&self) -> &'static str {
        BASIC
    }

    async fn authenticate(&self, request: &mut Request) -> Result<()> {
        request.headers_mut().insert(AUTHORIZATION, self.header_value()?);
        Ok(())
    }

    async fn authenticate_challenge(
        &self,
        request: &mut Request,
        challenge_headers: &HeaderMap,
    ) -> Result<()> {
        copy_csrf_token(challenge_headers, request);
        request.headers_mut().insert(AUTHORIZATION, self.header_value()?);
        Ok(())
    }

    fn change_identity(&self, username: &str, password: &str) {
        self.identity.set(username, password);
    }
}
