//! HTTP transport abstraction with exponential backoff retry logic.
//!
//! Adapters never talk to `reqwest` directly. They go through the
//! [`Transport`] trait, which keeps network access swappable (the test suite
//! serves literal HTML/JSON/RSS fixtures through it) and lets the runner share
//! one connection pool across every site and download.
//!
//! # Architecture
//!
//! - [`Transport`]: the `fetch(url) -> (status, body, headers)` capability,
//!   split into `get`, `head` and `post_form`
//! - [`HttpTransport`]: the `reqwest` implementation
//! - [`RetryTransport`]: decorator that adds retry logic to any transport
//!
//! Bodies are buffered into [`HttpResponse`] except for
//! [`Transport::download_to`], which streams straight to disk.
//!
//! # Retry Strategy
//!
//! - Transport errors and 5xx responses are retried
//! - Exponential backoff starting at `base_delay`, capped at `max_delay`
//! - Random jitter (0-250ms by default) added to each delay

use async_trait::async_trait;
use futures::StreamExt;
use rand::{Rng, rng};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tracing::{debug, error, instrument, warn};

use crate::error::ScrapeError;

/// User agent sent with every request.
pub const USER_AGENT: &str = concat!("civic-scraper/", env!("CARGO_PKG_VERSION"));

/// A fully buffered HTTP response.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    /// Final URL after redirects.
    pub url: String,
    /// HTTP status code.
    pub status: u16,
    /// Response headers with lowercase names.
    pub headers: HashMap<String, String>,
    /// Raw body bytes (empty for HEAD).
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Build a response, lowercasing header names.
    pub fn new(
        url: impl Into<String>,
        status: u16,
        headers: impl IntoIterator<Item = (String, String)>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            url: url.into(),
            status,
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-2xx response into [`ScrapeError::Status`].
    pub fn error_for_status(self) -> Result<Self, ScrapeError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ScrapeError::Status {
                url: self.url,
                status: self.status,
            })
        }
    }

    /// Header lookup by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// `Content-Length` header, falling back to the buffered body size.
    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")
            .and_then(|v| v.trim().parse().ok())
            .or_else(|| (!self.body.is_empty()).then_some(self.body.len() as u64))
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// The network capability every adapter depends on.
///
/// Implementations return non-2xx responses as `Ok`; callers decide whether a
/// status is fatal via [`HttpResponse::error_for_status`].
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// GET a URL, following redirects.
    async fn get(&self, url: &str) -> Result<HttpResponse, ScrapeError>;

    /// HEAD a URL, following redirects. Used for metadata probes.
    async fn head(&self, url: &str) -> Result<HttpResponse, ScrapeError>;

    /// POST an `application/x-www-form-urlencoded` body.
    async fn post_form(
        &self,
        url: &str,
        form: &[(String, String)],
    ) -> Result<HttpResponse, ScrapeError>;

    /// GET a URL and write its body to `path`.
    ///
    /// Returns the response head (empty body) and the number of bytes
    /// written. A non-2xx status is an error and leaves `path` untouched.
    async fn download_to(&self, url: &str, path: &Path) -> Result<(HttpResponse, u64), ScrapeError> {
        let mut response = self.get(url).await?.error_for_status()?;
        fs::write(path, &response.body).await?;
        let written = response.body.len() as u64;
        response.body = Vec::new();
        Ok((response, written))
    }
}

/// [`Transport`] backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a client with the crate user agent, a redirect limit and a timeout.
    pub fn new(timeout: StdDuration) -> Result<Self, ScrapeError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Status line and headers of a response, without its body.
    fn head_of(resp: &reqwest::Response) -> HttpResponse {
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect::<Vec<_>>();
        HttpResponse::new(resp.url().to_string(), resp.status().as_u16(), headers, Vec::<u8>::new())
    }

    async fn buffer(resp: reqwest::Response) -> Result<HttpResponse, ScrapeError> {
        let mut response = Self::head_of(&resp);
        response.body = resp.bytes().await?.to_vec();
        Ok(response)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(level = "debug", skip(self))]
    async fn get(&self, url: &str) -> Result<HttpResponse, ScrapeError> {
        let resp = self.client.get(url).send().await?;
        Self::buffer(resp).await
    }

    #[instrument(level = "debug", skip(self))]
    async fn head(&self, url: &str) -> Result<HttpResponse, ScrapeError> {
        let resp = self.client.head(url).send().await?;
        Self::buffer(resp).await
    }

    #[instrument(level = "debug", skip(self, form))]
    async fn post_form(
        &self,
        url: &str,
        form: &[(String, String)],
    ) -> Result<HttpResponse, ScrapeError> {
        let resp = self.client.post(url).form(form).send().await?;
        Self::buffer(resp).await
    }

    #[instrument(level = "debug", skip(self, path))]
    async fn download_to(&self, url: &str, path: &Path) -> Result<(HttpResponse, u64), ScrapeError> {
        let resp = self.client.get(url).send().await?;
        let head = Self::head_of(&resp).error_for_status()?;

        let mut file = fs::File::create(path).await?;
        let mut body = resp.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        debug!(url, written, "Streamed response body to disk");
        Ok((head, written))
    }
}

/// Wrapper that adds exponential backoff retry logic to any [`Transport`].
///
/// # Backoff Strategy
///
/// ```text
/// delay = min(base_delay * 2^(attempt-1), max_delay) + random_jitter(0..=jitter_ms)
/// ```
///
/// When retries run out the last failure is returned as-is: the transport
/// error, or [`ScrapeError::Status`] for a final 5xx.
#[derive(Clone)]
pub struct RetryTransport {
    /// The underlying transport to wrap.
    inner: Arc<dyn Transport>,
    /// Maximum number of retry attempts before giving up.
    max_retries: usize,
    /// Initial delay between retries (doubles with each attempt).
    base_delay: StdDuration,
    /// Maximum delay cap to prevent excessive waiting.
    max_delay: StdDuration,
    /// Upper bound of the random jitter added to each delay.
    jitter_ms: u64,
}

impl RetryTransport {
    /// Wrap a transport.
    ///
    /// ```ignore
    /// let retrying = RetryTransport::new(transport, 3, Duration::from_secs(1));
    /// ```
    pub fn new(inner: Arc<dyn Transport>, max_retries: usize, base_delay: StdDuration) -> Self {
        Self {
            inner,
            max_retries,
            base_delay,
            max_delay: StdDuration::from_secs(30),
            jitter_ms: 250,
        }
    }

    /// Override the jitter bound (tests use zero).
    pub fn with_jitter_ms(mut self, jitter_ms: u64) -> Self {
        self.jitter_ms = jitter_ms;
        self
    }

    fn delay_for(&self, attempt: usize) -> StdDuration {
        let shift = (attempt.saturating_sub(1)).min(16) as u32;
        let mut delay = self.base_delay.saturating_mul(1 << shift);
        if delay > self.max_delay {
            delay = self.max_delay;
        }
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rng().random_range(0..=self.jitter_ms)
        };
        delay + StdDuration::from_millis(jitter)
    }

    async fn retrying<F, Fut>(&self, verb: &str, url: &str, op: F) -> Result<HttpResponse, ScrapeError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<HttpResponse, ScrapeError>>,
    {
        let total_t0 = Instant::now();
        let mut attempt = 0usize;

        loop {
            let failure = match op().await {
                Ok(resp) if resp.status < 500 => return Ok(resp),
                Ok(resp) => ScrapeError::Status {
                    url: resp.url,
                    status: resp.status,
                },
                Err(e) => e,
            };

            attempt += 1;
            if attempt > self.max_retries {
                error!(
                    verb,
                    url,
                    attempt,
                    max = self.max_retries,
                    elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
                    error = %failure,
                    "request exhausted retries"
                );
                return Err(failure);
            }

            let delay = self.delay_for(attempt);
            warn!(
                verb,
                url,
                attempt,
                max = self.max_retries,
                ?delay,
                error = %failure,
                "request failed; backing off"
            );
            sleep(delay).await;
        }
    }
}

impl fmt::Debug for RetryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryTransport")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

#[async_trait]
impl Transport for RetryTransport {
    async fn get(&self, url: &str) -> Result<HttpResponse, ScrapeError> {
        self.retrying("GET", url, || self.inner.get(url)).await
    }

    async fn head(&self, url: &str) -> Result<HttpResponse, ScrapeError> {
        self.retrying("HEAD", url, || self.inner.head(url)).await
    }

    async fn post_form(
        &self,
        url: &str,
        form: &[(String, String)],
    ) -> Result<HttpResponse, ScrapeError> {
        debug!(url, fields = form.len(), "POST with retry");
        self.retrying("POST", url, || self.inner.post_form(url, form))
            .await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory transport serving literal fixtures.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Method {
        Get,
        Head,
        Post,
    }

    #[derive(Debug, Clone)]
    pub struct Call {
        pub method: Method,
        pub url: String,
        pub form: Vec<(String, String)>,
    }

    /// Routes are keyed by method and exact URL. Each route holds a queue of
    /// responses; the last one is repeated once the queue drains. Unknown
    /// routes answer 404.
    #[derive(Debug, Default)]
    pub struct FixtureTransport {
        routes: Mutex<HashMap<(Method, String), VecDeque<Result<HttpResponse, String>>>>,
        calls: Mutex<Vec<Call>>,
    }

    impl FixtureTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn route(&self, method: Method, url: &str, resp: HttpResponse) -> &Self {
            self.routes
                .lock()
                .unwrap()
                .entry((method, url.to_string()))
                .or_default()
                .push_back(Ok(resp));
            self
        }

        pub fn fail(&self, method: Method, url: &str, message: &str) -> &Self {
            self.routes
                .lock()
                .unwrap()
                .entry((method, url.to_string()))
                .or_default()
                .push_back(Err(message.to_string()));
            self
        }

        pub fn html(&self, url: &str, body: &str) -> &Self {
            self.route(Method::Get, url, ok(url, "text/html; charset=utf-8", body))
        }

        pub fn head_ok(&self, url: &str, content_type: &str, length: u64) -> &Self {
            self.route(
                Method::Head,
                url,
                HttpResponse::new(
                    url,
                    200,
                    [
                        ("Content-Type".to_string(), content_type.to_string()),
                        ("Content-Length".to_string(), length.to_string()),
                    ],
                    Vec::<u8>::new(),
                ),
            )
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn count(&self, method: Method, url: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.method == method && c.url == url)
                .count()
        }

        fn answer(
            &self,
            method: Method,
            url: &str,
            form: &[(String, String)],
        ) -> Result<HttpResponse, ScrapeError> {
            self.calls.lock().unwrap().push(Call {
                method,
                url: url.to_string(),
                form: form.to_vec(),
            });
            let mut routes = self.routes.lock().unwrap();
            let Some(queue) = routes.get_mut(&(method, url.to_string())) else {
                return Ok(HttpResponse::new(url, 404, Vec::<(String, String)>::new(), "Not found"));
            };
            let next = if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                queue.front().cloned().unwrap()
            };
            next.map_err(|m| ScrapeError::parse(url, m))
        }
    }

    pub fn ok(url: &str, content_type: &str, body: &str) -> HttpResponse {
        HttpResponse::new(
            url,
            200,
            [("Content-Type".to_string(), content_type.to_string())],
            body.as_bytes().to_vec(),
        )
    }

    #[async_trait]
    impl Transport for FixtureTransport {
        async fn get(&self, url: &str) -> Result<HttpResponse, ScrapeError> {
            self.answer(Method::Get, url, &[])
        }

        async fn head(&self, url: &str) -> Result<HttpResponse, ScrapeError> {
            self.answer(Method::Head, url, &[])
        }

        async fn post_form(
            &self,
            url: &str,
            form: &[(String, String)],
        ) -> Result<HttpResponse, ScrapeError> {
            self.answer(Method::Post, url, form)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FixtureTransport, Method, ok};
    use super::*;

    #[test]
    fn test_response_headers_are_case_insensitive() {
        let resp = HttpResponse::new(
            "http://x",
            200,
            [("Content-Type".to_string(), "application/pdf".to_string())],
            b"%PDF".to_vec(),
        );
        assert_eq!(resp.header("content-type"), Some("application/pdf"));
        assert_eq!(resp.content_type(), Some("application/pdf"));
        assert_eq!(resp.content_length(), Some(4));
    }

    #[test]
    fn test_error_for_status() {
        let resp = HttpResponse::new("http://x/missing", 404, Vec::new(), Vec::<u8>::new());
        match resp.error_for_status() {
            Err(ScrapeError::Status { status, url }) => {
                assert_eq!(status, 404);
                assert_eq!(url, "http://x/missing");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_after_server_error() {
        let fixtures = Arc::new(FixtureTransport::new());
        let url = "http://example.com/page";
        fixtures
            .route(Method::Get, url, HttpResponse::new(url, 503, Vec::new(), Vec::<u8>::new()))
            .route(Method::Get, url, ok(url, "text/html", "<p>ok</p>"));

        let retrying = RetryTransport::new(fixtures.clone(), 3, StdDuration::from_millis(1))
            .with_jitter_ms(0);
        let resp = retrying.get(url).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(fixtures.count(Method::Get, url), 2);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let fixtures = Arc::new(FixtureTransport::new());
        let url = "http://example.com/down";
        fixtures.fail(Method::Post, url, "connection reset");

        let retrying = RetryTransport::new(fixtures.clone(), 2, StdDuration::from_millis(1))
            .with_jitter_ms(0);
        let err = retrying.post_form(url, &[]).await.unwrap_err();
        assert!(err.to_string().contains("connection reset"));
        assert_eq!(fixtures.count(Method::Post, url), 3);
    }

    #[tokio::test]
    async fn test_exhausted_server_errors_keep_their_status() {
        let fixtures = Arc::new(FixtureTransport::new());
        let url = "http://example.com/busy";
        fixtures.route(Method::Get, url, HttpResponse::new(url, 503, Vec::new(), Vec::<u8>::new()));

        let retrying = RetryTransport::new(fixtures.clone(), 1, StdDuration::from_millis(1))
            .with_jitter_ms(0);
        let err = retrying.get(url).await.unwrap_err();
        assert!(matches!(err, ScrapeError::Status { status: 503, .. }), "{err:?}");
        assert_eq!(fixtures.count(Method::Get, url), 2);
    }

    #[tokio::test]
    async fn test_download_to_writes_body_and_returns_head() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out.pdf");
        let fixtures = FixtureTransport::new();
        let url = "http://example.com/a.pdf";
        fixtures.route(Method::Get, url, ok(url, "application/pdf", "%PDF-1.4"));

        let (head, written) = fixtures.download_to(url, &path).await.unwrap();
        assert_eq!(written, 8);
        assert_eq!(head.content_type(), Some("application/pdf"));
        assert!(head.body.is_empty());
        assert_eq!(std::fs::read(&path).unwrap(), b"%PDF-1.4");

        let missing = tmp.path().join("missing.pdf");
        let err = fixtures
            .download_to("http://example.com/missing.pdf", &missing)
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::Status { status: 404, .. }));
        assert!(!missing.exists());
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let fixtures = Arc::new(FixtureTransport::new());
        let url = "http://example.com/gone";
        let retrying = RetryTransport::new(fixtures.clone(), 5, StdDuration::from_millis(1))
            .with_jitter_ms(0);
        let resp = retrying.get(url).await.unwrap();
        assert_eq!(resp.status, 404);
        assert_eq!(fixtures.count(Method::Get, url), 1);
    }

    #[test]
    fn test_delay_is_capped() {
        let retrying = RetryTransport::new(
            Arc::new(FixtureTransport::new()),
            10,
            StdDuration::from_secs(1),
        )
        .with_jitter_ms(0);
        assert_eq!(retrying.delay_for(1), StdDuration::from_secs(1));
        assert_eq!(retrying.delay_for(3), StdDuration::from_secs(4));
        assert_eq!(retrying.delay_for(10), StdDuration::from_secs(30));
    }
}
