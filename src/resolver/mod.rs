use std::sync::Arc;
use std::time::Duration;

use reqwest::header::ACCEPT_RANGES;
use reqwest::{StatusCode, Url};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fetch::{FetchClient, Purpose, Session};
use crate::token::{EasynewsPayload, NzbPayload, ResolutionToken, SidPayload};
use crate::usenet::UsenetController;

pub mod driveleech;
pub mod sid;

/// Validation probes get their own short deadline.
const PROBE_TIMEOUT: Duration = Duration::from_secs(8);

/// What a resolved preview points at.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Url(String),
    /// Usenet downloads resolve to a local file for the streaming layer.
    File(std::path::PathBuf),
}

/// On-click resolution of opaque preview tokens.
///
/// A dead chain resolves to `Ok(None)`: the API layer turns that into an
/// http error while the preview stays valid for a later retry.
pub struct Resolver {
    config: Arc<Config>,
    fetch: Arc<FetchClient>,
    usenet: Option<Arc<UsenetController>>,
}

impl Resolver {
    pub fn new(
        config: Arc<Config>,
        fetch: Arc<FetchClient>,
        usenet: Option<Arc<UsenetController>>,
    ) -> Self {
        Self {
            config,
            fetch,
            usenet,
        }
    }

    fn stream_session(&self) -> Result<Session> {
        let proxy = self
            .config
            .proxy_url
            .as_deref()
            .filter(|url| self.config.proxy_applies_to("httpstreams") && !url.contains("{url}"));
        Session::new(proxy)
    }

    /// Decode and dispatch. The provider in the url path must match the
    /// token's own claim.
    pub async fn resolve(
        &self,
        provider: &str,
        raw_token: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Resolved>> {
        let token = ResolutionToken::decode(raw_token)?;
        if token.provider != provider {
            return Err(Error::parse(format!(
                "token was minted for {}, not {provider}",
                token.provider
            )));
        }
        match provider {
            "uhdmovies" | "moviesdrive" => {
                let payload: SidPayload = token.typed_payload()?;
                let url = self.resolve_sid_chain(&payload.sid_url, cancel).await?;
                Ok(url.map(|u| Resolved::Url(u.to_string())))
            }
            "easynews" => {
                let payload: EasynewsPayload = token.typed_payload()?;
                let url = self.resolve_easynews(&payload, cancel).await?;
                Ok(url.map(|u| Resolved::Url(u.to_string())))
            }
            "newznab" => {
                let Some(usenet) = &self.usenet else {
                    return Err(Error::Other(anyhow::anyhow!(
                        "no usenet downloader configured"
                    )));
                };
                let payload: NzbPayload = token.typed_payload()?;
                let path = usenet.resolve(&payload, None, None, cancel).await?;
                Ok(Some(Resolved::File(path)))
            }
            rest => Err(Error::parse(format!("unknown resolve provider: {rest}"))),
        }
    }

    /// The full http-stream chain: SID walk, redirect page, file page
    /// extraction, intermediate unwrap, range validation.
    pub async fn resolve_sid_chain(
        &self,
        sid_url: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Url>> {
        let session = self.stream_session()?;
        let destination = match sid::resolve_sid_url(&session, sid_url, cancel).await {
            Ok(destination) => destination,
            Err(Error::Canceled) => return Err(Error::Canceled),
            Err(e) => {
                tracing::warn!(sid_url, "SID resolution failed: {e}");
                return Ok(None);
            }
        };
        let (page_url, html) =
            match driveleech::follow_redirect_page(&session, destination, cancel).await {
                Ok(page) => page,
                Err(Error::Canceled) => return Err(Error::Canceled),
                Err(e) => {
                    tracing::warn!("Redirect page fetch failed: {e}");
                    return Ok(None);
                }
            };
        let Some(direct) =
            driveleech::extract_direct_url(&session, &page_url, &html, cancel).await
        else {
            tracing::warn!(page = page_url.as_str(), "File page yielded no direct url");
            return Ok(None);
        };
        let direct = match driveleech::unwrap_intermediate(&session, direct, cancel).await {
            Ok(direct) => direct,
            Err(Error::Canceled) => return Err(Error::Canceled),
            Err(e) => {
                tracing::warn!("CDN intermediate unwrap failed: {e}");
                return Ok(None);
            }
        };
        let direct = driveleech::normalize_final_url(direct);
        if self.validate_stream_url(&direct, None, cancel).await? {
            Ok(Some(direct))
        } else {
            Ok(None)
        }
    }

    async fn resolve_easynews(
        &self,
        payload: &EasynewsPayload,
        cancel: &CancellationToken,
    ) -> Result<Option<Url>> {
        let raw = format!(
            "{}/{}/{}/{}{}/{}{}",
            payload.down_url.trim_end_matches('/'),
            payload.dl_farm,
            payload.dl_port,
            payload.post_hash,
            payload.ext,
            urlencoding::encode(&payload.post_title),
            payload.ext
        );
        let url =
            Url::parse(&raw).map_err(|e| Error::parse(format!("bad easynews url: {e}")))?;
        let auth = Some((payload.username.as_str(), payload.password.as_str()));
        if self.validate_stream_url(&url, auth, cancel).await? {
            let mut with_auth = url;
            // The player cannot send headers, so credentials ride in the url.
            let _ = with_auth.set_username(&payload.username);
            let _ = with_auth.set_password(Some(&payload.password));
            Ok(Some(with_auth))
        } else {
            Ok(None)
        }
    }

    /// Seekability probe: `Range: bytes=0-1` must come back `206`, or
    /// `200` with `Accept-Ranges: bytes`. HEAD first, then a GET whose
    /// body is dropped immediately.
    pub async fn validate_stream_url(
        &self,
        url: &Url,
        basic_auth: Option<(&str, &str)>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if self.config.disable_url_validation || self.config.disable_seek_validation {
            return Ok(true);
        }
        if let Some(host) = url.host_str() {
            if self
                .config
                .skip_validation_hosts
                .iter()
                .any(|skip| host.ends_with(skip))
            {
                return Ok(true);
            }
        }

        let head = {
            let mut builder = self
                .fetch
                .head(url.clone())
                .purpose(Purpose::HttpStreams)
                .header("range", "bytes=0-1")
                .timeout(PROBE_TIMEOUT);
            if let Some((user, password)) = basic_auth {
                builder = builder.basic_auth(user, Some(password));
            }
            builder.send(cancel).await
        };
        match head {
            Ok(response) if seekable_response(&response) => return Ok(true),
            Ok(_) => {}
            Err(Error::Canceled) => return Err(Error::Canceled),
            Err(e) => tracing::debug!(url = url.as_str(), "HEAD probe failed: {e}"),
        }

        // Some hosts refuse HEAD outright; confirm with a ranged GET and
        // throw the stream away without reading it.
        let get = {
            let mut builder = self
                .fetch
                .get(url.clone())
                .purpose(Purpose::HttpStreams)
                .header("range", "bytes=0-1")
                .timeout(PROBE_TIMEOUT);
            if let Some((user, password)) = basic_auth {
                builder = builder.basic_auth(user, Some(password));
            }
            builder.send(cancel).await
        };
        match get {
            Ok(response) => {
                let seekable = seekable_response(&response);
                drop(response);
                Ok(seekable)
            }
            Err(Error::Canceled) => Err(Error::Canceled),
            Err(e) => {
                tracing::debug!(url = url.as_str(), "GET probe failed: {e}");
                Ok(false)
            }
        }
    }
}

fn seekable_response(response: &reqwest::Response) -> bool {
    if response.status() == StatusCode::PARTIAL_CONTENT {
        return true;
    }
    if response.status() == StatusCode::OK {
        return response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.eq_ignore_ascii_case("bytes"));
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(config: Config) -> Resolver {
        let config = Arc::new(config);
        let fetch = Arc::new(FetchClient::new(&config));
        Resolver::new(config, fetch, None)
    }

    #[tokio::test]
    async fn rejects_provider_mismatch() {
        let resolver = resolver(Config::default());
        let token = ResolutionToken::new("uhdmovies", serde_json::json!({"sid_url": "x"}));
        let cancel = CancellationToken::new();
        let outcome = resolver
            .resolve("moviesdrive", &token.encode(), &cancel)
            .await;
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn rejects_malformed_token() {
        let resolver = resolver(Config::default());
        let cancel = CancellationToken::new();
        assert!(resolver
            .resolve("uhdmovies", "%%%not-a-token%%%", &cancel)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn unknown_provider_errors() {
        let resolver = resolver(Config::default());
        let token = ResolutionToken::new("mystery", serde_json::json!({}));
        let cancel = CancellationToken::new();
        assert!(resolver
            .resolve("mystery", &token.encode(), &cancel)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn disabled_validation_short_circuits() {
        let resolver = resolver(Config {
            disable_url_validation: true,
            ..Config::default()
        });
        let url = Url::parse("https://dead-host.invalid/file.mkv").unwrap();
        let cancel = CancellationToken::new();
        assert!(resolver
            .validate_stream_url(&url, None, &cancel)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn skip_list_short_circuits() {
        let resolver = resolver(Config {
            skip_validation_hosts: vec!["trusted-cdn.example".to_string()],
            ..Config::default()
        });
        let url = Url::parse("https://files.trusted-cdn.example/file.mkv").unwrap();
        let cancel = CancellationToken::new();
        assert!(resolver
            .validate_stream_url(&url, None, &cancel)
            .await
            .unwrap());
    }
}
