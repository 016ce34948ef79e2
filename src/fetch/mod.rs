use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Client, Method, Response, Url};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};

pub mod limit;
pub mod proxy;
pub mod session;

pub use limit::RateLimitedClient;
pub use proxy::{ProxyPool, Purpose};
pub use session::Session;

/// Ceiling applied when a call carries no explicit deadline.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/124.0.0.0 Safari/537.36";

/// Desktop user agents rotated by the anti-bot adapters.
pub const USER_AGENTS: &[&str] = &[
    DEFAULT_USER_AGENT,
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) \
     Version/17.3 Safari/605.1.15",
];

pub fn random_user_agent() -> &'static str {
    use rand::seq::IndexedRandom;
    USER_AGENTS
        .choose(&mut rand::rng())
        .copied()
        .unwrap_or(DEFAULT_USER_AGENT)
}

/// Build the base reqwest client shared by a pool slot. Compressed bodies
/// (gzip/brotli/deflate) are decoded transparently.
pub(crate) fn build_client(proxy: Option<&str>) -> Result<Client> {
    let mut builder = Client::builder()
        .user_agent(DEFAULT_USER_AGENT)
        .connect_timeout(Duration::from_secs(10))
        .redirect(reqwest::redirect::Policy::limited(10));
    if let Some(proxy) = proxy {
        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|e| Error::parse(format!("bad proxy url: {e}")))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| Error::TransientNetwork(format!("client construction failed: {e}")))
}

/// Shared HTTP substrate: proxy policy, bounded retries with fixed delay,
/// per-call deadlines and cancelation.
pub struct FetchClient {
    pool: ProxyPool,
    retries: u32,
    retry_delay: Duration,
}

impl FetchClient {
    pub fn new(config: &Config) -> Self {
        Self {
            pool: ProxyPool::new(config),
            retries: config.fetch_retries,
            retry_delay: config.fetch_retry_delay(),
        }
    }

    pub fn get(&self, url: Url) -> FetchBuilder<'_> {
        FetchBuilder::new(self, Method::GET, url)
    }

    pub fn head(&self, url: Url) -> FetchBuilder<'_> {
        FetchBuilder::new(self, Method::HEAD, url)
    }

    pub fn post(&self, url: Url) -> FetchBuilder<'_> {
        let mut builder = FetchBuilder::new(self, Method::POST, url);
        builder.idempotent = false;
        builder
    }
}

/// One outbound call. Collects options, then `send` runs the retry loop.
pub struct FetchBuilder<'a> {
    fetch: &'a FetchClient,
    method: Method,
    url: Url,
    headers: HeaderMap,
    form: Option<Vec<(String, String)>>,
    json: Option<serde_json::Value>,
    multipart: Option<(String, String, Vec<u8>)>,
    basic_auth: Option<(String, Option<String>)>,
    timeout: Option<Duration>,
    purpose: Purpose,
    idempotent: bool,
}

impl<'a> FetchBuilder<'a> {
    fn new(fetch: &'a FetchClient, method: Method, url: Url) -> Self {
        Self {
            fetch,
            method,
            url,
            headers: HeaderMap::new(),
            form: None,
            json: None,
            multipart: None,
            basic_auth: None,
            timeout: None,
            purpose: Purpose::Scrapers,
            idempotent: true,
        }
    }

    pub fn header(mut self, name: &'static str, value: &str) -> Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => tracing::debug!(name, "Dropping invalid header"),
        }
        self
    }

    pub fn user_agent(self, value: &str) -> Self {
        let mut this = self;
        if let Ok(value) = HeaderValue::from_str(value) {
            this.headers.insert(USER_AGENT, value);
        }
        this
    }

    pub fn form(mut self, fields: Vec<(String, String)>) -> Self {
        self.form = Some(fields);
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.json = Some(body);
        self
    }

    /// One-file multipart upload. Not retried.
    pub fn multipart_file(mut self, field: &str, filename: &str, bytes: Vec<u8>) -> Self {
        self.multipart = Some((field.to_string(), filename.to_string(), bytes));
        self.idempotent = false;
        self
    }

    pub fn basic_auth(mut self, user: &str, password: Option<&str>) -> Self {
        self.basic_auth = Some((user.to_string(), password.map(str::to_string)));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn purpose(mut self, purpose: Purpose) -> Self {
        self.purpose = purpose;
        self
    }

    fn build_attempt(&self, client: &Client, url: Url) -> reqwest::RequestBuilder {
        let mut builder = client
            .request(self.method.clone(), url)
            .headers(self.headers.clone())
            .timeout(self.timeout.unwrap_or(DEFAULT_TIMEOUT));
        if let Some(form) = &self.form {
            builder = builder.form(form);
        }
        if let Some(json) = &self.json {
            builder = builder.json(json);
        }
        if let Some((field, filename, bytes)) = &self.multipart {
            let part = reqwest::multipart::Part::bytes(bytes.clone())
                .file_name(filename.clone());
            builder =
                builder.multipart(reqwest::multipart::Form::new().part(field.clone(), part));
        }
        if let Some((user, password)) = &self.basic_auth {
            builder = builder.basic_auth(user, password.as_deref());
        }
        builder
    }

    /// Run the request, retrying transient failures with a fixed delay.
    /// Cancelation aborts the in-flight call and any pending retry sleep.
    pub async fn send(self, cancel: &CancellationToken) -> Result<Response> {
        let attempts = if self.idempotent {
            1 + self.fetch.retries
        } else {
            1
        };
        let mut last_err = Error::TransientNetwork("no attempt made".to_string());
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Canceled),
                    _ = tokio::time::sleep(self.fetch.retry_delay) => {}
                }
            }
            let (client, url) = self.fetch.pool.route(&self.purpose, &self.url)?;
            let request = self.build_attempt(&client, url);
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Canceled),
                outcome = request.send() => outcome,
            };
            match outcome {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        self.fetch.pool.record(&self.purpose, true);
                        return Ok(response);
                    }
                    self.fetch.pool.record(&self.purpose, true);
                    if status.is_server_error() {
                        last_err =
                            Error::TransientNetwork(format!("upstream status {status}"));
                        continue;
                    }
                    return Err(Error::UpstreamRejected {
                        status: status.as_u16(),
                    });
                }
                Err(e) => {
                    let err = Error::from(e);
                    self.fetch.pool.record(&self.purpose, !err.is_transient());
                    if err.is_transient() {
                        last_err = err;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
        Err(last_err)
    }

    pub async fn text(self, cancel: &CancellationToken) -> Result<String> {
        let response = self.send(cancel).await?;
        response.text().await.map_err(Error::from)
    }

    pub async fn json_response<T: DeserializeOwned>(self, cancel: &CancellationToken) -> Result<T> {
        let url = self.url.to_string();
        let response = self.send(cancel).await?;
        match response.json().await {
            Ok(body) => Ok(body),
            Err(e) => {
                tracing::debug!(url, "Failed to deserialize response body: {e}");
                Err(Error::parse("response body is not the expected json"))
            }
        }
    }

    pub async fn bytes(self, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let response = self.send(cancel).await?;
        Ok(response.bytes().await.map_err(Error::from)?.to_vec())
    }
}
