use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use reqwest::Url;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::cache::Caches;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fetch::{FetchClient, Purpose};
use crate::model::InfoHash;

/// Remote instant-availability collaborator: which of these hashes is
/// already cached at the debrid service.
pub struct AvailabilityClient {
    url: Url,
    fetch: Arc<FetchClient>,
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    #[serde(default)]
    cached: Vec<String>,
}

impl AvailabilityClient {
    pub fn new(url: &str, fetch: Arc<FetchClient>) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| Error::parse(format!("bad availability url: {e}")))?;
        Ok(Self { url, fetch })
    }

    pub async fn check_cached(
        &self,
        hashes: &[InfoHash],
        service: &str,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<HashSet<String>> {
        let body = serde_json::json!({
            "service": service,
            "token": token,
            "hashes": hashes.iter().map(|h| h.as_str()).collect::<Vec<_>>(),
        });
        let response: CheckResponse = self
            .fetch
            .post(self.url.clone())
            .purpose(Purpose::Debrid(service.to_string()))
            .json(body)
            .json_response(cancel)
            .await?;
        Ok(response.cached.into_iter().collect())
    }
}

/// Annotates merged torrents with their debrid availability.
///
/// Known answers come straight from the availability cache; unknown hashes
/// are checked against the remote service in a detached task that upserts
/// the cache for the next request, so the response is never blocked on it.
pub struct AvailabilityAnnotator {
    client: Option<Arc<AvailabilityClient>>,
    caches: Caches,
    config: Arc<Config>,
}

impl AvailabilityAnnotator {
    pub fn new(config: Arc<Config>, fetch: Arc<FetchClient>, caches: Caches) -> Self {
        let client = config
            .availability_url
            .as_deref()
            .and_then(|url| match AvailabilityClient::new(url, fetch.clone()) {
                Ok(client) => Some(Arc::new(client)),
                Err(e) => {
                    tracing::warn!("Availability client disabled: {e}");
                    None
                }
            });
        Self {
            client,
            caches,
            config,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.debrid_service.is_some() && self.config.debrid_token.is_some()
    }

    /// Cached verdicts for these hashes. Synthetic hashes are never sent
    /// anywhere; they come back absent (unknown).
    pub async fn annotate(&self, hashes: &[InfoHash]) -> HashMap<InfoHash, bool> {
        let (Some(service), Some(token)) =
            (&self.config.debrid_service, &self.config.debrid_token)
        else {
            return HashMap::new();
        };
        let real: Vec<InfoHash> = hashes
            .iter()
            .filter(|hash| !hash.is_synthetic())
            .cloned()
            .collect();
        if real.is_empty() {
            return HashMap::new();
        }
        let known = self.caches.availability(service, &real).await;

        let unknown: Vec<InfoHash> = real
            .into_iter()
            .filter(|hash| !known.contains_key(hash))
            .collect();
        if !unknown.is_empty() {
            self.refresh_in_background(service.clone(), token.clone(), unknown);
        }
        known
    }

    /// The non-blocking refresh for hashes the cache had no verdict on.
    fn refresh_in_background(&self, service: String, token: String, hashes: Vec<InfoHash>) {
        let Some(client) = self.client.clone() else {
            return;
        };
        let caches = self.caches.clone();
        let ttl = self.config.availability_ttl();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            match client.check_cached(&hashes, &service, &token, &cancel).await {
                Ok(cached) => {
                    tracing::debug!(
                        service,
                        cached = cached.len(),
                        checked = hashes.len(),
                        "Background availability refresh"
                    );
                    for hash in &hashes {
                        caches
                            .store_availability(
                                &service,
                                hash,
                                cached.contains(hash.as_str()),
                                ttl,
                            )
                            .await;
                    }
                }
                Err(e) => {
                    tracing::warn!(service, "Availability refresh failed: {e}");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn annotator(config: Config) -> AvailabilityAnnotator {
        let config = Arc::new(config);
        let fetch = Arc::new(FetchClient::new(&config));
        AvailabilityAnnotator::new(config, fetch, Caches::in_memory())
    }

    fn debrid_config() -> Config {
        Config {
            debrid_service: Some("realdebrid".to_string()),
            debrid_token: Some("tok".to_string()),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn disabled_without_debrid_config() {
        let annotator = annotator(Config::default());
        assert!(!annotator.enabled());
        let hash = InfoHash::new("08ada5a7a6183aae1e09d831df6748d566095a10").unwrap();
        assert!(annotator.annotate(&[hash]).await.is_empty());
    }

    #[tokio::test]
    async fn cached_verdicts_are_returned() {
        let annotator = annotator(debrid_config());
        let hash = InfoHash::new("08ada5a7a6183aae1e09d831df6748d566095a10").unwrap();
        annotator
            .caches
            .store_availability("realdebrid", &hash, true, Duration::from_secs(60))
            .await;
        let map = annotator.annotate(&[hash.clone()]).await;
        assert_eq!(map.get(&hash), Some(&true));
    }

    #[tokio::test]
    async fn synthetic_hashes_are_never_checked() {
        let annotator = annotator(debrid_config());
        let synthetic = InfoHash::synthesize("https://example.com/detail");
        // Even a cached verdict under the synthetic hash must not surface.
        annotator
            .caches
            .store_availability("realdebrid", &synthetic, true, Duration::from_secs(60))
            .await;
        assert!(annotator.annotate(&[synthetic]).await.is_empty());
    }
}
