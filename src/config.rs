//! Configuration for the registry client

use crate::error::{RegistryError, Result};
use crate::logging::Logger;
use crate::registry::auth::{
    AnonymousBearerAuth, AuthStrategy, BasicAuth, Credentials, PasswordBearerAuth,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_CHUNK_SIZE: u64 = 52_428_800;
pub const DEFAULT_TIMEOUT_SECS: u64 = 100;
pub const DEFAULT_MAX_CONCURRENCY: usize = 3;

/// How the client authenticates against the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    #[default]
    AnonymousBearer,
    PasswordBearer,
    Basic,
}

impl std::str::FromStr for AuthMode {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anonymous" | "anonymous_bearer" | "anonymous-oauth" => Ok(AuthMode::AnonymousBearer),
            "password" | "password_bearer" | "password-oauth" => Ok(AuthMode::PasswordBearer),
            "basic" => Ok(AuthMode::Basic),
            other => Err(RegistryError::InvalidArgument(format!(
                "unknown auth mode: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryClientConfig {
    /// Registry host, with or without a scheme
    pub host: String,
    #[serde(default)]
    pub auth_mode: AuthMode,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Default request timeout in seconds
    #[serde(default = "default_timeout")]
    pub default_timeout: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub repo_prefix: Option<String>,
    #[serde(default)]
    pub skip_tls: bool,
    #[serde(default)]
    pub verbose: bool,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

impl RegistryClientConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            auth_mode: AuthMode::default(),
            username: None,
            password: None,
            default_timeout: DEFAULT_TIMEOUT_SECS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            repo_prefix: None,
            skip_tls: false,
            verbose: false,
        }
    }

    /// Load configuration from `REGISTRY_*` environment variables
    pub fn from_env() -> Result<Self> {
        let host = env::var("REGISTRY_HOST")
            .map_err(|_| RegistryError::InvalidArgument("REGISTRY_HOST not set".to_string()))?;

        let mut config = Self::new(host);
        config.username = env::var("REGISTRY_USERNAME").ok();
        config.password = env::var("REGISTRY_PASSWORD").ok();
        config.repo_prefix = env::var("REGISTRY_REPO_PREFIX").ok();
        config.skip_tls = env::var("SKIP_TLS").is_ok_and(|v| v == "true");

        if let Ok(mode) = env::var("REGISTRY_AUTH_MODE") {
            config.auth_mode = mode.parse()?;
        } else if config.username.is_some() {
            config.auth_mode = AuthMode::PasswordBearer;
        }
        if let Some(timeout) = parse_env("REGISTRY_TIMEOUT")? {
            config.default_timeout = timeout;
        }
        if let Some(chunk_size) = parse_env("REGISTRY_CHUNK_SIZE")? {
            config.chunk_size = chunk_size;
        }
        if let Some(max_concurrency) = parse_env("REGISTRY_MAX_CONCURRENCY")? {
            config.max_concurrency = max_concurrency;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_credentials(
        mut self,
        auth_mode: AuthMode,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.auth_mode = auth_mode;
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.default_timeout = seconds;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_repo_prefix(mut self, repo_prefix: impl Into<String>) -> Self {
        self.repo_prefix = Some(repo_prefix.into());
        self
    }

    pub fn with_skip_tls(mut self, skip_tls: bool) -> Self {
        self.skip_tls = skip_tls;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout)
    }

    /// Repository prefix normalized to either "" or "something/"
    pub fn normalized_repo_prefix(&self) -> String {
        match self.repo_prefix.as_deref().map(str::trim) {
            None | Some("") => String::new(),
            Some(prefix) if prefix.ends_with('/') => prefix.to_string(),
            Some(prefix) => format!("{}/", prefix),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(RegistryError::InvalidArgument(
                "Registry host cannot be empty".to_string(),
            ));
        }
        if self.default_timeout == 0 {
            return Err(RegistryError::InvalidArgument(
                "Timeout must be greater than 0".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(RegistryError::InvalidArgument(
                "Chunk size must be greater than 0".to_string(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(RegistryError::InvalidArgument(
                "Max concurrency must be greater than 0".to_string(),
            ));
        }
        if self.auth_mode != AuthMode::AnonymousBearer && self.credentials().is_none() {
            return Err(RegistryError::InvalidArgument(format!(
                "{:?} authentication requires a username and password",
                self.auth_mode
            )));
        }
        Ok(())
    }

    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) if !username.is_empty() => {
                Some(Credentials::new(username.clone(), password.clone()))
            }
            _ => None,
        }
    }

    /// Build the strategy selected by `auth_mode`, logging through `output`
    pub fn build_auth_strategy(
        &self,
        token_http: reqwest::Client,
        output: &Logger,
    ) -> Result<Arc<dyn AuthStrategy>> {
        let output = output.for_component("auth");
        let strategy: Arc<dyn AuthStrategy> = match self.auth_mode {
            AuthMode::AnonymousBearer => {
                Arc::new(AnonymousBearerAuth::new(token_http).with_logger(output))
            }
            AuthMode::PasswordBearer => {
                let credentials = self.credentials().ok_or_else(|| {
                    RegistryError::InvalidArgument(
                        "password authentication requires credentials".to_string(),
                    )
                })?;
                Arc::new(PasswordBearerAuth::new(credentials, token_http).with_logger(output))
            }
            AuthMode::Basic => {
                let credentials = self.credentials().ok_or_else(|| {
                    RegistryError::InvalidArgument(
                        "basic authentication requires credentials".to_string(),
                    )
                })?;
                Arc::new(BasicAuth::new(credentials))
            }
        };
        Ok(strategy)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| RegistryError::InvalidArgument(format!("{} is not a valid number", name))),
        Err(_) => Ok(None),
    }
}
