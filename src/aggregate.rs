use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::availability::AvailabilityAnnotator;
use crate::cache::Caches;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fetch::FetchClient;
use crate::filtering::{dedup_candidates, rank_candidates};
use crate::metadata::{CinemetaClient, MetadataService};
use crate::model::{
    format_size, BehaviorHints, Candidate, HttpStreamCandidate, InfoHash, MediaRequest,
    NzbCandidate, PreviewStream, StreamItem, TorrentCandidate, TorrentStream,
};
use crate::query::{build_query, SearchQuery};
use crate::scrapers::{self, Scraper, SearchContext};
use crate::token::{NzbPayload, ResolutionToken};

/// What one aggregation returns: the ranked streams plus the few errors
/// that are allowed to surface (credential rejections).
#[derive(Debug)]
pub struct AggregateOutcome {
    pub streams: Vec<StreamItem>,
    pub errors: Vec<String>,
}

/// The fan-out/fan-in engine.
pub struct Aggregator {
    scrapers: Vec<Arc<dyn Scraper>>,
    metadata: Arc<dyn MetadataService>,
    fetch: Arc<FetchClient>,
    caches: Caches,
    availability: AvailabilityAnnotator,
    config: Arc<Config>,
}

/// The full built-in adapter set; `Config::scraper_enabled` prunes it per
/// request.
pub fn default_scrapers() -> Vec<Arc<dyn Scraper>> {
    vec![
        Arc::new(scrapers::leetx::Leetx),
        Arc::new(scrapers::torrent_galaxy::TorrentGalaxy),
        Arc::new(scrapers::magnetdl::MagnetDl),
        Arc::new(scrapers::btdigg::BtDigg),
        Arc::new(scrapers::ilcorsaronero::IlCorsaroNero),
        Arc::new(scrapers::torrent9::Torrent9),
        Arc::new(scrapers::bludv::BluDv),
        Arc::new(scrapers::torznab::Torznab::jackett()),
        Arc::new(scrapers::torznab::Torznab::bitmagnet()),
        Arc::new(scrapers::torznab::Torznab::stremthru()),
        Arc::new(scrapers::torrentio::Torrentio),
        Arc::new(scrapers::comet::Comet),
        Arc::new(scrapers::wolfmax4k::Wolfmax4k),
        Arc::new(scrapers::snowfl::Snowfl),
        Arc::new(scrapers::zilean::Zilean),
        Arc::new(scrapers::uhdmovies::UhdMovies),
        Arc::new(scrapers::moviesdrive::MoviesDrive),
        Arc::new(scrapers::home_media::HomeMedia),
        Arc::new(scrapers::easynews::Easynews),
        Arc::new(scrapers::newznab::Newznab),
    ]
}

impl Aggregator {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let fetch = Arc::new(FetchClient::new(&config));
        let caches = Caches::in_memory();
        let metadata = Arc::new(CinemetaClient::new(&config.metadata_url)?);
        Ok(Self::assemble(
            default_scrapers(),
            metadata,
            fetch,
            caches,
            config,
        ))
    }

    /// Wiring seam used by the api layer and by tests.
    pub fn assemble(
        scrapers: Vec<Arc<dyn Scraper>>,
        metadata: Arc<dyn MetadataService>,
        fetch: Arc<FetchClient>,
        caches: Caches,
        config: Arc<Config>,
    ) -> Self {
        let availability =
            AvailabilityAnnotator::new(config.clone(), fetch.clone(), caches.clone());
        Self {
            scrapers,
            metadata,
            fetch,
            caches,
            availability,
            config,
        }
    }

    pub fn caches(&self) -> &Caches {
        &self.caches
    }

    /// Run one aggregation: metadata, query build, concurrent scraper
    /// fan-out under the global deadline, merge, rank, annotate, wrap.
    pub async fn aggregate(
        &self,
        request: MediaRequest,
        cancel: CancellationToken,
    ) -> Result<AggregateOutcome> {
        let meta = self
            .metadata
            .get_meta(request.content_type, &request.imdb_id)
            .await?;
        let query = build_query(&meta, &request);
        tracing::debug!(
            id = request.composite_id(),
            query = query.text,
            "Aggregating"
        );

        let errors = Arc::new(std::sync::Mutex::new(Vec::new()));
        let merged = self.fan_out(&query, &cancel, errors.clone()).await;
        let streams = self.merge_and_wrap(merged, &query).await;
        let errors = errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|e: &Error| e.to_string())
            .collect();
        Ok(AggregateOutcome { streams, errors })
    }

    /// Invoke every selected scraper concurrently, each under its own
    /// child cancelation, and collect whatever finishes before the global
    /// deadline.
    async fn fan_out(
        &self,
        query: &SearchQuery,
        cancel: &CancellationToken,
        errors: Arc<std::sync::Mutex<Vec<Error>>>,
    ) -> Vec<Candidate> {
        let mut set = JoinSet::new();
        for scraper in &self.scrapers {
            if !self.config.scraper_enabled(scraper.name()) {
                continue;
            }
            if !scraper.supports(query.media.content_type) {
                continue;
            }
            let scraper = scraper.clone();
            let query = query.clone();
            let ctx = SearchContext {
                cancel: cancel.child_token(),
                label: query.media.composite_id(),
                config: self.config.clone(),
                fetch: self.fetch.clone(),
                caches: self.caches.clone(),
                errors: errors.clone(),
            };
            set.spawn(
                async move { scrapers::run_scraper(scraper.as_ref(), &query, &ctx).await },
            );
        }

        let deadline = tokio::time::Instant::now() + self.config.global_timeout();
        let mut merged = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(None) => break,
                Ok(Some(Ok(candidates))) => merged.extend(candidates),
                Ok(Some(Err(e))) => tracing::error!("Scraper task panicked: {e}"),
                Err(_) => {
                    tracing::warn!(
                        pending = set.len(),
                        "Global deadline reached, returning partial results"
                    );
                    cancel.cancel();
                    // Canceled scrapers return promptly; drain what they had.
                    while let Some(joined) = set.join_next().await {
                        match joined {
                            Ok(candidates) => merged.extend(candidates),
                            Err(e) => tracing::error!("Scraper task panicked: {e}"),
                        }
                    }
                    break;
                }
            }
        }
        merged
    }

    /// Cross-scraper merge: attribution, dedup, rank, availability flags,
    /// preview wrapping.
    async fn merge_and_wrap(&self, merged: Vec<Candidate>, query: &SearchQuery) -> Vec<StreamItem> {
        // Per-hash source attribution survives dedup.
        let mut sources: HashMap<InfoHash, BTreeSet<String>> = HashMap::new();
        for candidate in &merged {
            if let Candidate::Torrent(t) = candidate {
                if let Some(hash) = &t.info_hash {
                    sources
                        .entry(hash.clone())
                        .or_default()
                        .insert(t.tracker.clone());
                }
            }
        }

        let mut candidates = dedup_candidates(merged);
        rank_candidates(&mut candidates, query.media.season);

        let hashes: Vec<InfoHash> = candidates
            .iter()
            .filter_map(|candidate| match candidate {
                Candidate::Torrent(t) => t.info_hash.clone(),
                _ => None,
            })
            .collect();
        let cached = if self.availability.enabled() {
            self.availability.annotate(&hashes).await
        } else {
            HashMap::new()
        };

        candidates
            .into_iter()
            .filter_map(|candidate| match candidate {
                Candidate::Torrent(torrent) => {
                    Some(self.wrap_torrent(torrent, &sources, &cached))
                }
                Candidate::HttpStream(stream) => self.wrap_http_stream(stream),
                Candidate::Nzb(nzb) => Some(self.wrap_nzb(nzb)),
            })
            .collect()
    }

    fn wrap_torrent(
        &self,
        torrent: TorrentCandidate,
        sources: &HashMap<InfoHash, BTreeSet<String>>,
        cached: &HashMap<InfoHash, bool>,
    ) -> StreamItem {
        let quality = crate::model::Quality::from_title(&torrent.title);
        let attribution: Vec<String> = torrent
            .info_hash
            .as_ref()
            .and_then(|hash| sources.get(hash))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_else(|| vec![torrent.tracker.clone()]);
        let is_cached = torrent
            .info_hash
            .as_ref()
            .and_then(|hash| cached.get(hash).copied());
        let cached_marker = match (self.availability.enabled(), is_cached) {
            (true, Some(true)) => Some(true),
            (true, _) => Some(false),
            (false, _) => None,
        };
        StreamItem::Torrent(TorrentStream {
            name: format!("{}\n{}", attribution.join(" | "), quality.as_str()),
            title: format!("{}\n{}", torrent.title, format_size(torrent.size)),
            info_hash: torrent.info_hash,
            magnet: torrent.magnet,
            size: torrent.size,
            seeders: torrent.seeders,
            sources: attribution,
            languages: torrent.languages,
            resolution: quality,
            cached: cached_marker,
        })
    }

    fn wrap_http_stream(&self, stream: HttpStreamCandidate) -> Option<StreamItem> {
        let url = if stream.needs_resolution {
            let token = ResolutionToken::new(stream.provider.clone(), stream.payload?);
            token.resolver_url(&self.config.self_base_url)
        } else {
            stream.direct_url.as_ref()?.to_string()
        };
        let size = (!stream.size_text.is_empty()).then(|| stream.size_text.clone());
        Some(StreamItem::Preview(PreviewStream {
            name: format!("{}\n{}", stream.provider, stream.quality.as_str()),
            title: stream.display_name.clone(),
            url,
            behavior_hints: BehaviorHints {
                binge_group: Some(format!("{}-{}", stream.provider, stream.quality.as_str())),
                filename: Some(stream.display_name),
                not_web_ready: true,
            },
            resolution: stream.quality,
            size,
            needs_resolution: stream.needs_resolution,
        }))
    }

    fn wrap_nzb(&self, nzb: NzbCandidate) -> StreamItem {
        let quality = crate::model::Quality::from_title(&nzb.title);
        let payload = NzbPayload {
            nzb_url: nzb.nzb_url,
            title: nzb.title.clone(),
        };
        let token = ResolutionToken::new(
            "newznab",
            serde_json::to_value(&payload).unwrap_or(serde_json::Value::Null),
        );
        StreamItem::Preview(PreviewStream {
            name: format!("{}\n{}", nzb.indexer, quality.as_str()),
            title: format!("{}\n{}", nzb.title, format_size(nzb.size)),
            url: token.resolver_url(&self.config.self_base_url),
            behavior_hints: BehaviorHints {
                binge_group: Some(format!("usenet-{}", quality.as_str())),
                filename: Some(nzb.title),
                not_web_ready: true,
            },
            resolution: quality,
            size: Some(format_size(nzb.size)),
            needs_resolution: true,
        })
    }
}
