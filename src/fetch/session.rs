use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::Jar;
use reqwest::header::{HeaderValue, REFERER};
use reqwest::{Client, Response, Url};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

use super::random_user_agent;

/// Cookie-jar session for multi-step anti-bot chains.
///
/// One instance per resolution: the jar is never shared across requests.
/// The user agent is picked from the desktop pool at construction and kept
/// stable for the whole chain, since some hosts bind cookies to it.
pub struct Session {
    client: Client,
    jar: Arc<Jar>,
    user_agent: &'static str,
}

impl Session {
    pub fn new(proxy: Option<&str>) -> Result<Self> {
        let jar = Arc::new(Jar::default());
        let user_agent = random_user_agent();
        let mut builder = Client::builder()
            .user_agent(user_agent)
            .cookie_provider(jar.clone())
            .connect_timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::limited(10));
        if let Some(proxy) = proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| Error::parse(format!("bad proxy url: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| Error::TransientNetwork(format!("session construction failed: {e}")))?;
        Ok(Self {
            client,
            jar,
            user_agent,
        })
    }

    pub fn user_agent(&self) -> &'static str {
        self.user_agent
    }

    /// Plant a cookie scraped out of page javascript.
    pub fn set_cookie(&self, origin: &Url, name: &str, value: &str) {
        self.jar
            .add_cookie_str(&format!("{name}={value}"), origin);
    }

    async fn run(
        &self,
        request: reqwest::RequestBuilder,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<Response> {
        let request = request.timeout(timeout);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Canceled),
            outcome = request.send() => outcome,
        };
        outcome.map_err(Error::from)
    }

    pub async fn get(
        &self,
        url: Url,
        referer: Option<&Url>,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<Response> {
        let mut request = self.client.get(url);
        if let Some(referer) = referer {
            if let Ok(value) = HeaderValue::from_str(referer.as_str()) {
                request = request.header(REFERER, value);
            }
        }
        self.run(request, cancel, timeout).await
    }

    pub async fn get_text(
        &self,
        url: Url,
        referer: Option<&Url>,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<String> {
        let response = self.get(url, referer, cancel, timeout).await?;
        response.text().await.map_err(Error::from)
    }

    pub async fn post_form(
        &self,
        url: Url,
        fields: &[(String, String)],
        referer: Option<&Url>,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<Response> {
        let mut request = self.client.post(url).form(fields);
        if let Some(referer) = referer {
            if let Ok(value) = HeaderValue::from_str(referer.as_str()) {
                request = request.header(REFERER, value);
            }
        }
        self.run(request, cancel, timeout).await
    }
}
