//! Shared, rate-limited HTTP client for one connection.

use crate::collector::rate_limit::RateLimiter;
use crate::collector::retry::RetryPolicy;
use crate::config::ApiConfig;
use crate::models::ConnectionId;
use crate::sources::models::Connection;
use crate::{Error, Result};
use dashmap::DashMap;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// What the collector should do with a response after the hook has seen it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseAction {
    /// Apply the normal success/retry/fatal rules.
    Continue,
    /// Drop the response and move on, e.g. a child resource deleted upstream.
    Skip,
}

/// Runs on every response before status handling. Returning an error aborts the request.
pub type AfterResponse = Arc<dyn Fn(&ApiResponse) -> Result<ResponseAction> + Send + Sync>;

/// Maps 401 to `Error::Unauthorized`.
pub fn default_after_response() -> AfterResponse {
    Arc::new(|res: &ApiResponse| {
        if res.status == StatusCode::UNAUTHORIZED {
            return Err(Error::Unauthorized(format!("authentication failed for {}", res.url)));
        }
        Ok(ResponseAction::Continue)
    })
}

/// Hook that skips 404s and otherwise defers to the default.
pub fn ignore_not_found() -> AfterResponse {
    let fallback = default_after_response();
    Arc::new(move |res: &ApiResponse| {
        if res.status == StatusCode::NOT_FOUND {
            return Ok(ResponseAction::Skip);
        }
        fallback(res)
    })
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub url: String,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| Error::backend(format!("decode response from {}", self.url), e))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    fn snippet(&self) -> String {
        let text = String::from_utf8_lossy(&self.body);
        text.chars().take(256).collect()
    }
}

/// Per-request knobs.
#[derive(Clone, Default)]
pub struct RequestOptions {
    /// Rate-limit cost; 0 is treated as 1.
    pub cost: u32,
    /// Overrides the client's hook for this request.
    pub after_response: Option<AfterResponse>,
}

pub struct ApiClient {
    http: Client,
    endpoint: Url,
    headers: HeaderMap,
    limiter: RateLimiter,
    retry: RetryPolicy,
    in_flight: Semaphore,
    after_response: AfterResponse,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("endpoint", &self.endpoint.as_str())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

pub struct ApiClientBuilder {
    endpoint: String,
    headers: HeaderMap,
    timeout: Duration,
    requests_per_hour: u32,
    retry: RetryPolicy,
    max_in_flight: usize,
    proxy: Option<String>,
    after_response: AfterResponse,
}

impl ApiClientBuilder {
    pub fn config(mut self, cfg: &ApiConfig) -> Self {
        self.timeout = cfg.timeout;
        self.requests_per_hour = cfg.requests_per_hour;
        self.retry = RetryPolicy::from_config(cfg);
        self.max_in_flight = cfg.max_in_flight;
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::backend("invalid header name", e))?;
        let value = HeaderValue::from_str(value).map_err(|e| Error::backend("invalid header value", e))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn bearer(mut self, token: &str) -> Result<Self> {
        if token.is_empty() {
            return Ok(self);
        }
        let auth = format!("Bearer {token}");
        self.headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).map_err(|e| Error::backend("invalid auth header", e))?,
        );
        Ok(self)
    }

    pub fn requests_per_hour(mut self, n: u32) -> Self {
        self.requests_per_hour = n;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy.filter(|p| !p.trim().is_empty());
        self
    }

    pub fn after_response(mut self, hook: AfterResponse) -> Self {
        self.after_response = hook;
        self
    }

    pub fn build(self) -> Result<ApiClient> {
        let mut endpoint = self.endpoint.trim().to_string();
        if !endpoint.ends_with('/') {
            endpoint.push('/');
        }
        let endpoint = Url::parse(&endpoint)
            .map_err(|e| Error::InvalidInput(format!("invalid endpoint {endpoint}: {e}")))?;
        let mut http = Client::builder().timeout(self.timeout);
        if let Some(p) = &self.proxy {
            http = http.proxy(reqwest::Proxy::all(p).map_err(Error::backend_reqwest)?);
        }
        let http = http.build().map_err(Error::backend_reqwest)?;
        Ok(ApiClient {
            http,
            endpoint,
            headers: self.headers,
            limiter: RateLimiter::per_hour(self.requests_per_hour)?,
            retry: self.retry,
            in_flight: Semaphore::new(self.max_in_flight.max(1)),
            after_response: self.after_response,
        })
    }
}

impl ApiClient {
    pub fn builder(endpoint: impl Into<String>) -> ApiClientBuilder {
        let cfg = ApiConfig::default();
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("tributary"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        ApiClientBuilder {
            endpoint: endpoint.into(),
            headers,
            timeout: cfg.timeout,
            requests_per_hour: cfg.requests_per_hour,
            retry: RetryPolicy::from_config(&cfg),
            max_in_flight: cfg.max_in_flight,
            proxy: None,
            after_response: default_after_response(),
        }
    }

    /// Builder seeded from a stored connection: endpoint, token, proxy and rate limit.
    pub fn for_connection(conn: &Connection, cfg: &ApiConfig) -> Result<ApiClientBuilder> {
        let mut b = Self::builder(&conn.endpoint)
            .config(cfg)
            .proxy(conn.proxy.clone())
            .bearer(conn.token.as_deref().unwrap_or_default())?;
        if let Some(n) = conn.rate_limit_per_hour {
            b = b.requests_per_hour(n);
        }
        Ok(b)
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn resolve(&self, path: &str) -> Result<Url> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return Url::parse(path).map_err(|e| Error::InvalidInput(format!("invalid url {path}: {e}")));
        }
        self.endpoint
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::InvalidInput(format!("invalid path {path}: {e}")))
    }

    /// GET with rate limiting, bounded retries and cancellation.
    ///
    /// Returns `Ok(None)` when the after-response hook asks to skip.
    #[tracing::instrument(level = "debug", skip(self, query, opts, cancel))]
    pub async fn get(
        &self,
        path: &str,
        query: &[(String, String)],
        opts: &RequestOptions,
        cancel: &CancellationToken,
    ) -> Result<Option<ApiResponse>> {
        let url = self.resolve(path)?;
        let hook = opts.after_response.as_ref().unwrap_or(&self.after_response);
        let cost = opts.cost.max(1);
        let cancelled = || Error::Cancelled(format!("request to {url} cancelled"));
        let mut attempt = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled()),
                r = self.limiter.acquire(cost) => r?,
            }
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled()),
                p = self.in_flight.acquire() => p.map_err(|e| Error::backend("api client in-flight semaphore", e))?,
            };

            let req = self
                .http
                .get(url.clone())
                .headers(self.headers.clone())
                .query(query);
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled()),
                r = async {
                    let resp = req.send().await?;
                    let status = resp.status();
                    let headers = resp.headers().clone();
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();
                    Ok::<_, reqwest::Error>(ApiResponse { url: final_url, status, headers, body })
                } => r,
            };
            drop(permit);

            let retry_headers = match sent {
                Err(e) => {
                    if attempt >= self.retry.max_retries {
                        return Err(Error::backend(format!("GET {url}"), e));
                    }
                    tracing::warn!(error = %e, url = %url, attempt, "request failed, retrying");
                    None
                }
                Ok(res) => {
                    self.limiter.observe(&res.headers).await;
                    if hook(&res)? == ResponseAction::Skip {
                        tracing::debug!(url = %url, status = res.status.as_u16(), "response skipped");
                        return Ok(None);
                    }
                    if res.status.is_success() {
                        return Ok(Some(res));
                    }
                    if !RetryPolicy::is_retryable(res.status) || attempt >= self.retry.max_retries {
                        return Err(Error::HttpStatus {
                            status: res.status.as_u16(),
                            message: format!("GET {url}: {}", res.snippet()),
                        });
                    }
                    tracing::warn!(url = %url, status = res.status.as_u16(), attempt, "retryable status");
                    Some(res.headers)
                }
            };

            let delay = self.retry.delay(attempt, retry_headers.as_ref());
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled()),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<Option<T>> {
        match self.get(path, query, &RequestOptions::default(), cancel).await? {
            Some(res) => Ok(Some(res.json()?)),
            None => Ok(None),
        }
    }
}

/// One client per `(plugin, connection)`, shared by every task using it.
#[derive(Default)]
pub struct ApiClientPool {
    clients: DashMap<(String, ConnectionId), Arc<ApiClient>>,
}

impl ApiClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_try_insert<F>(&self, plugin: &str, id: ConnectionId, build: F) -> Result<Arc<ApiClient>>
    where
        F: FnOnce() -> Result<ApiClient>,
    {
        let key = (plugin.to_string(), id);
        if let Some(c) = self.clients.get(&key) {
            return Ok(c.clone());
        }
        match self.clients.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(e) => Ok(e.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let client = Arc::new(build()?);
                e.insert(client.clone());
                Ok(client)
            }
        }
    }

    /// Drop a cached client after its connection changed or was deleted.
    pub fn invalidate(&self, plugin: &str, id: ConnectionId) {
        self.clients.remove(&(plugin.to_string(), id));
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::get;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base: Duration::from_millis(1),
            max: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn retries_server_errors_then_succeeds() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let app = Router::new().route(
            "/flaky",
            get(move || {
                let h = h.clone();
                async move {
                    if h.fetch_add(1, Ordering::SeqCst) < 2 {
                        (AxumStatus::BAD_GATEWAY, "down".to_string())
                    } else {
                        (AxumStatus::OK, "[1,2]".to_string())
                    }
                }
            }),
        );
        let base = spawn(app).await;
        let client = ApiClient::builder(base).retry(fast_retry()).build().unwrap();
        let res = client
            .get("flaky", &[], &RequestOptions::default(), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res.json::<Vec<u32>>().unwrap(), vec![1, 2]);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_fatal_and_401_is_unauthorized() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let app = Router::new()
            .route(
                "/missing",
                get(move || {
                    h.fetch_add(1, Ordering::SeqCst);
                    async { (AxumStatus::UNPROCESSABLE_ENTITY, "nope") }
                }),
            )
            .route("/secret", get(|| async { (AxumStatus::UNAUTHORIZED, "") }))
            .route("/gone", get(|| async { (AxumStatus::NOT_FOUND, "") }));
        let base = spawn(app).await;
        let client = ApiClient::builder(base).retry(fast_retry()).build().unwrap();
        let cancel = CancellationToken::new();

        let err = client
            .get("missing", &[], &RequestOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HttpStatus { status: 422, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let err = client
            .get("secret", &[], &RequestOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));

        let skip = RequestOptions {
            cost: 1,
            after_response: Some(ignore_not_found()),
        };
        assert!(client.get("gone", &[], &skip, &cancel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancelled_token_aborts_before_sending() {
        let client = ApiClient::builder("http://127.0.0.1:9/").build().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client
            .get("x", &[], &RequestOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn pool_reuses_clients() {
        let pool = ApiClientPool::new();
        let a = pool
            .get_or_try_insert("github", ConnectionId(1), || ApiClient::builder("http://localhost/").build())
            .unwrap();
        let b = pool
            .get_or_try_insert("github", ConnectionId(1), || Err(Error::BackendMessage("unused".into())))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        pool.invalidate("github", ConnectionId(1));
        assert!(pool.is_empty());
    }
}
