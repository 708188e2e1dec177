//! Request dispatcher
//!
//! Every protocol call goes through [`Dispatcher`]. It resolves the registry endpoint once,
//! attaches credentials through the configured [`AuthStrategy`], answers a single 401/403
//! challenge by rebuilding and resending the request, and turns error statuses into
//! [`RegistryError`] values.

use crate::error::handlers::NetworkErrorHandler;
use crate::error::{ApiErrorResponse, RegistryError, Result};
use crate::logging::Logger;
use crate::registry::auth::AuthStrategy;
use crate::registry::query::QueryString;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Method, StatusCode};
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Unauthenticated path probed during endpoint discovery
pub const DISCOVERY_PATH: &str = "v2/";

pub const CLIENT_USER_AGENT: &str = concat!("registry-transfer/", env!("CARGO_PKG_VERSION"));

/// Lazily consumed response body of a streamed dispatch
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// One logical request; rebuilt into a fresh transport request for every send
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// `v2/...` relative to the endpoint, or `/...` relative to its origin
    pub path: String,
    pub query: QueryString,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Overrides the configured default timeout for buffered dispatches
    pub timeout: Option<Duration>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: QueryString::new(),
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn head(path: impl Into<String>) -> Self {
        Self::new(Method::HEAD, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_query(mut self, query: QueryString) -> Self {
        self.query = query;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Uniform envelope of a dispatched request
#[derive(Debug)]
pub struct ApiResponse<T> {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: T,
}

impl<T> ApiResponse<T> {
    /// Header value as a string, if present and valid UTF-8
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }
}

pub struct Dispatcher {
    http: reqwest::Client,
    host: String,
    default_timeout: Duration,
    auth: Arc<dyn AuthStrategy>,
    endpoint: OnceLock<Url>,
    output: Logger,
}

impl Dispatcher {
    pub fn new(
        http: reqwest::Client,
        host: impl Into<String>,
        default_timeout: Duration,
        auth: Arc<dyn AuthStrategy>,
        output: Logger,
    ) -> Self {
        Self {
            http,
            host: host.into(),
            default_timeout,
            auth,
            endpoint: OnceLock::new(),
            output,
        }
    }

    /// Use `endpoint` as-is and never probe
    pub fn with_endpoint(self, endpoint: Url) -> Self {
        let resolved = OnceLock::new();
        let _ = resolved.set(with_trailing_slash(endpoint));
        Self {
            endpoint: resolved,
            ..self
        }
    }

    pub fn auth(&self) -> &Arc<dyn AuthStrategy> {
        &self.auth
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Resolved endpoint, if discovery already ran
    pub fn cached_endpoint(&self) -> Option<&Url> {
        self.endpoint.get()
    }

    /// Resolve the endpoint once; later calls return the cached value
    pub async fn endpoint(&self) -> Result<Url> {
        if let Some(endpoint) = self.endpoint.get() {
            return Ok(endpoint.clone());
        }

        let candidates = candidate_endpoints(&self.host);
        let mut failures = Vec::with_capacity(candidates.len());

        for candidate in &candidates {
            let base = match Url::parse(candidate) {
                Ok(url) => with_trailing_slash(url),
                Err(e) => {
                    failures.push(format!("{}: {}", candidate, e));
                    continue;
                }
            };
            let probe = base.join(DISCOVERY_PATH)?;

            self.output.detail(&format!("Probing registry endpoint {}", probe));
            match self
                .http
                .get(probe.clone())
                .header(USER_AGENT, CLIENT_USER_AGENT)
                .timeout(self.default_timeout)
                .send()
                .await
            {
                Ok(response) => {
                    self.output.verbose(&format!(
                        "Resolved registry endpoint {} (probe status {})",
                        base,
                        response.status()
                    ));
                    // First writer wins when discoveries race
                    let _ = self.endpoint.set(base.clone());
                    return Ok(self.endpoint.get().cloned().unwrap_or(base));
                }
                Err(e) => {
                    let reason = NetworkErrorHandler::describe(&e);
                    self.output
                        .warning(&format!("Endpoint probe {} failed: {}", probe, reason));
                    failures.push(format!("{}: {}", probe, reason));
                }
            }
        }

        Err(RegistryError::Connection {
            candidates: candidates
                .iter()
                .map(|c| format!("'{}'", c))
                .collect::<Vec<_>>()
                .join(", "),
            failures,
        })
    }

    /// Send `request` and read the whole body as text
    pub async fn dispatch(
        &self,
        request: ApiRequest,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse<String>> {
        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let context = format!("{} {}", request.method, request.path);

        with_deadline(cancel, Some(timeout), &context, async {
            let response = self.send(&request).await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response
                .text()
                .await
                .map_err(|e| NetworkErrorHandler::handle_network_error(&e, &context))?;

            check_status(status, &headers, &body)?;
            self.output
                .detail(&format!("{} -> {} ({} bytes)", context, status, body.len()));
            Ok::<_, RegistryError>(ApiResponse {
                status,
                headers,
                body,
            })
        })
        .await
    }

    /// Send `request` and hand back the body as a lazy stream.
    ///
    /// No deadline applies; `cancel` still aborts both the send and the stream.
    pub async fn dispatch_streamed(
        &self,
        request: ApiRequest,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse<ByteStream>> {
        let context = format!("{} {}", request.method, request.path);
        let response = with_deadline(cancel, None, &context, self.send(&request)).await?;

        let status = response.status();
        let headers = response.headers().clone();
        if is_error_status(status) {
            let body = with_deadline(cancel, Some(self.default_timeout), &context, async {
                Ok::<_, RegistryError>(response.text().await.unwrap_or_default())
            })
            .await?;
            return Err(error_for_status(status, &headers, &body));
        }

        let inner = response.bytes_stream().boxed();
        let body = stream::unfold(
            (inner, cancel.clone(), false),
            |(mut inner, cancel, finished)| async move {
                if finished {
                    return None;
                }
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    item = inner.next() => Some(item),
                };
                match next {
                    None => Some((Err(RegistryError::Cancelled), (inner, cancel, true))),
                    Some(None) => None,
                    Some(Some(item)) => Some((
                        item.map_err(|e| {
                            NetworkErrorHandler::handle_network_error(&e, "streamed response body")
                        }),
                        (inner, cancel, false),
                    )),
                }
            },
        )
        .boxed();

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }

    /// Discover, authenticate, send, and answer at most one challenge
    async fn send(&self, request: &ApiRequest) -> Result<reqwest::Response> {
        let endpoint = self.endpoint().await?;
        let url = request_url(&endpoint, &request.path, &request.query)?;
        let context = format!("{} {}", request.method, request.path);

        self.output.info(&format!(
            "{} {}{}",
            request.method,
            request.path,
            if request.query.is_empty() {
                String::new()
            } else {
                format!("?{}", request.query.encoded())
            }
        ));

        let mut outgoing = self.build_request(request, &url)?;
        self.auth.authenticate(&mut outgoing).await?;
        let response = self
            .http
            .execute(outgoing)
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, &context))?;

        let status = response.status();
        if status != StatusCode::UNAUTHORIZED && status != StatusCode::FORBIDDEN {
            return Ok(response);
        }

        self.output.detail(&format!(
            "{} was challenged with {}, re-authenticating once",
            context, status
        ));
        let challenge_headers = response.headers().clone();
        drop(response);

        let mut retry = self.build_request(request, &url)?;
        self.auth
            .authenticate_challenge(&mut retry, &challenge_headers)
            .await?;
        self.http
            .execute(retry)
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, &context))
    }

    fn build_request(&self, request: &ApiRequest, url: &Url) -> Result<reqwest::Request> {
        let mut builder = self
            .http
            .request(request.method.clone(), url.clone())
            .headers(request.headers.clone())
            .header(USER_AGENT, CLIENT_USER_AGENT);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        builder
            .build()
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "building request"))
    }
}

/// Run `operation` under `cancel` and, when given, a deadline of `timeout`
async fn with_deadline<T, F>(
    cancel: &CancellationToken,
    timeout: Option<Duration>,
    context: &str,
    operation: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let guarded = async {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, operation).await {
                Ok(result) => result,
                Err(_) => Err(RegistryError::Timeout(format!(
                    "{} did not finish within {}s",
                    context,
                    limit.as_secs_f64()
                ))),
            },
            None => operation.await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RegistryError::Cancelled),
        result = guarded => result,
    }
}

/// Base URLs to probe, in order
pub fn candidate_endpoints(host: &str) -> Vec<String> {
    let host = host.trim().trim_end_matches('/');
    let lower = host.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        vec![host.to_string()]
    } else {
        vec![format!("https://{}", host), format!("http://{}", host)]
    }
}

/// Absolute URL for `path` under `endpoint`, with `query` replacing any existing query
pub fn request_url(endpoint: &Url, path: &str, query: &QueryString) -> Result<Url> {
    let mut url = endpoint.join(path)?;
    query.apply_to(&mut url);
    Ok(url)
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

fn is_error_status(status: StatusCode) -> bool {
    let code = status.as_u16();
    !(200..400).contains(&code)
}

/// Map a non-success status to its error; 401 is distinguished
pub fn check_status(status: StatusCode, headers: &HeaderMap, body: &str) -> Result<()> {
    if !is_error_status(status) {
        return Ok(());
    }
    Err(error_for_status(status, headers, body))
}

fn error_for_status(status: StatusCode, headers: &HeaderMap, body: &str) -> RegistryError {
    let response = Box::new(ApiErrorResponse {
        status,
        headers: headers.clone(),
        body: body.to_string(),
    });
    if status == StatusCode::UNAUTHORIZED {
        RegistryError::Unauthorized(response)
    } else {
        RegistryError::Api(response)
    }
}
