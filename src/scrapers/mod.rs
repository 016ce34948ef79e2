use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cache::Caches;
use crate::config::Config;
use crate::error::Error;
use crate::fetch::FetchClient;
use crate::filtering::{self, dedup_candidates};
use crate::model::{gib_to_bytes, Candidate, ContentType};
use crate::query::SearchQuery;

pub mod bludv;
pub mod btdigg;
pub mod comet;
pub mod easynews;
pub mod home_media;
pub mod ilcorsaronero;
pub mod leetx;
pub mod magnetdl;
pub mod moviesdrive;
pub mod newznab;
pub mod snowfl;
pub mod torrent9;
pub mod torrent_galaxy;
pub mod torrentio;
pub mod torznab;
pub mod uhdmovies;
pub mod wolfmax4k;
pub mod zilean;

/// Everything an adapter gets besides the query itself.
#[derive(Clone)]
pub struct SearchContext {
    /// Fires when the carrying request is aborted or its deadline passes.
    pub cancel: CancellationToken,
    /// Short label for log correlation, usually the content id.
    pub label: String,
    pub config: Arc<Config>,
    pub fetch: Arc<FetchClient>,
    pub caches: Caches,
    /// Sink for the few failures the aggregate surfaces to the user
    /// (credential rejections). Everything else degrades to empty.
    pub errors: Arc<std::sync::Mutex<Vec<Error>>>,
}

impl SearchContext {
    /// Deadline for a single upstream call within this search.
    pub fn call_timeout(&self) -> Duration {
        self.config.scraper_timeout()
    }

    pub fn report_error(&self, error: Error) {
        self.errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(error);
    }
}

impl std::fmt::Debug for SearchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchContext")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// The uniform adapter contract.
///
/// `search` must return within the configured scraper timeout or promptly
/// after cancelation, and never propagates a fault: failures are logged
/// and degrade to an empty list. Ordering of the output is not
/// significant; dedup and ranking happen downstream.
#[async_trait]
pub trait Scraper: Send + Sync {
    fn name(&self) -> &'static str;

    /// Language suffix for the timing mark, for single-language sources.
    fn lang(&self) -> Option<&'static str> {
        None
    }

    fn supports(&self, _content_type: ContentType) -> bool {
        true
    }

    async fn search(&self, query: &SearchQuery, ctx: &SearchContext) -> Vec<Candidate>;
}

static SEARCH_SEQ: AtomicU64 = AtomicU64::new(0);

/// Engine-side wrapper around one adapter invocation: result cache,
/// per-scraper timeout, and the timing mark.
pub async fn run_scraper(
    scraper: &dyn Scraper,
    query: &SearchQuery,
    ctx: &SearchContext,
) -> Vec<Candidate> {
    let name = scraper.name();
    let language_key = ctx.config.language_key();
    if let Some(cached) = ctx
        .caches
        .scraper_results(name, &query.text, &language_key)
        .await
    {
        return cached;
    }

    let seq = SEARCH_SEQ.fetch_add(1, Ordering::Relaxed);
    let mark = match scraper.lang() {
        Some(lang) => format!("[{}] {}:{}#{}", ctx.label, name, lang, seq),
        None => format!("[{}] {}#{}", ctx.label, name, seq),
    };
    let started = Instant::now();

    let timeout = ctx.config.scraper_timeout();
    let results = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => {
            tracing::debug!("{mark} canceled after {}ms", started.elapsed().as_millis());
            return Vec::new();
        }
        outcome = tokio::time::timeout(timeout, scraper.search(query, ctx)) => match outcome {
            Ok(results) => results,
            Err(_) => {
                tracing::warn!("{mark} timed out after {}ms", timeout.as_millis());
                Vec::new()
            }
        }
    };

    tracing::debug!(
        "{mark} {}ms ({} results)",
        started.elapsed().as_millis(),
        results.len()
    );

    ctx.caches
        .store_scraper_results(
            name,
            &query.text,
            &language_key,
            &results,
            ctx.config.result_ttl(query.media.content_type),
        )
        .await;
    results
}

/// Post-processing every adapter applies before returning: junk filter,
/// language filter, size window, in-source dedup.
pub fn finalize(raw: Vec<Candidate>, ctx: &SearchContext) -> Vec<Candidate> {
    let selected = &ctx.config.languages;
    let min_bytes = ctx.config.min_size_gib.map(gib_to_bytes);
    let max_bytes = ctx.config.max_size_gib.map(gib_to_bytes);
    let kept: Vec<Candidate> = raw
        .into_iter()
        .filter(|candidate| {
            if filtering::is_junk_title(candidate.title()) {
                return false;
            }
            if !filtering::passes_language_set(candidate.languages(), selected) {
                return false;
            }
            let size = candidate.size_bytes();
            if size > 0 {
                if let Some(min) = min_bytes {
                    if size < min {
                        return false;
                    }
                }
                if let Some(max) = max_bytes {
                    if size > max {
                        return false;
                    }
                }
            }
            true
        })
        .collect();
    dedup_candidates(kept)
}

/// Strict whole-word title match used by keyword trackers that return
/// fuzzy results: every queried word must appear as a token, and the year
/// (when known) must appear in the candidate title.
pub fn title_matches(candidate_title: &str, wanted_title: &str, year: Option<u16>) -> bool {
    let tokens: std::collections::BTreeSet<String> =
        filtering::tokenize_title(candidate_title).into_iter().collect();
    let wanted_ok = filtering::tokenize_title(wanted_title)
        .iter()
        .all(|word| tokens.contains(word));
    if !wanted_ok {
        return false;
    }
    match year {
        Some(year) => tokens.contains(&year.to_string()),
        None => true,
    }
}

/// Run pre-built fetch futures in fixed-size batches with a pause between
/// batches, stopping early on cancelation. Used for detail-page fetches.
pub async fn run_batched<R, F>(
    tasks: Vec<F>,
    batch_size: usize,
    delay: Duration,
    cancel: &CancellationToken,
) -> Vec<R>
where
    R: Send + 'static,
    F: Future<Output = Option<R>> + Send + 'static,
{
    let mut out = Vec::new();
    let total_batches = tasks.len().div_ceil(batch_size.max(1));
    let mut batches = Vec::with_capacity(total_batches);
    let mut current = Vec::with_capacity(batch_size);
    for task in tasks {
        current.push(task);
        if current.len() == batch_size {
            batches.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }

    for (index, batch) in batches.into_iter().enumerate() {
        if index > 0 {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return out,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        let mut set = JoinSet::new();
        for task in batch {
            set.spawn(task);
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Some(result)) => out.push(result),
                Ok(None) => {}
                Err(e) => tracing::error!("Detail fetch task panicked: {e}"),
            }
        }
        if cancel.is_cancelled() {
            return out;
        }
    }
    out
}

/// Per-item parse failures are skipped, not fatal. This keeps the skip
/// observable without failing the page.
pub(crate) fn skip_item(scraper: &'static str, err: &Error) {
    tracing::debug!(scraper, "Skipping unparsable item: {err}");
}

/// Upstreams disagree on whether counters are numbers or strings.
pub(crate) fn lenient_u64(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Default url for a scraper, overridable through `<NAME>_URL`.
pub(crate) fn base_url(
    ctx: &SearchContext,
    name: &str,
    default: &str,
) -> Option<reqwest::Url> {
    let settings = ctx.config.scraper(name);
    let raw = settings.url.as_deref().unwrap_or(default);
    match reqwest::Url::parse(raw) {
        Ok(url) => Some(url),
        Err(e) => {
            tracing::warn!(scraper = name, url = raw, "Bad scraper base url: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InfoHash, SourceMeta, TorrentCandidate};
    use std::collections::BTreeSet;

    fn ctx(config: Config) -> SearchContext {
        let config = Arc::new(config);
        SearchContext {
            cancel: CancellationToken::new(),
            label: "test".to_string(),
            fetch: Arc::new(FetchClient::new(&config)),
            caches: Caches::in_memory(),
            config,
            errors: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    fn torrent(title: &str, size: u64) -> Candidate {
        Candidate::Torrent(TorrentCandidate {
            title: title.to_string(),
            info_hash: InfoHash::new(&format!("{:040x}", size + title.len() as u64)),
            size,
            seeders: Some(1),
            tracker: "test".to_string(),
            languages: crate::filtering::detect_languages(title),
            magnet: None,
            source: SourceMeta::default(),
        })
    }

    #[test]
    fn finalize_applies_all_filters() {
        let config = Config {
            languages: vec!["en".to_string()],
            min_size_gib: Some(1.0),
            max_size_gib: Some(50.0),
            ..Config::default()
        };
        let ctx = ctx(config);
        let results = finalize(
            vec![
                torrent("Foo.2019.HDCAM.x264", gib_to_bytes(2.0)),
                torrent("Foo.2019.FRENCH.1080p", gib_to_bytes(2.0)),
                torrent("Foo.2019.1080p.WEB", gib_to_bytes(2.0)),
                torrent("Foo.2019.720p.tiny", 1024),
                torrent("Foo.2019.2160p.huge", gib_to_bytes(80.0)),
                torrent("Foo.2019.unknown.size", 0),
            ],
            &ctx,
        );
        let titles: Vec<_> = results.iter().map(|c| c.title()).collect();
        assert_eq!(titles, vec!["Foo.2019.1080p.WEB", "Foo.2019.unknown.size"]);
    }

    #[test]
    fn strict_title_match() {
        assert!(title_matches(
            "The.Matrix.1999.1080p.BluRay",
            "The Matrix",
            Some(1999)
        ));
        assert!(!title_matches(
            "The.Matrix.Reloaded.2003.1080p",
            "The Matrix",
            Some(1999)
        ));
        assert!(!title_matches("Matrix.1999.1080p", "The Matrix", Some(1999)));
        assert!(title_matches("Heat.1995.2160p", "Heat", None));
    }

    #[tokio::test]
    async fn run_batched_is_ordered_by_batch() {
        let cancel = CancellationToken::new();
        let tasks: Vec<_> = (0..5)
            .map(|i| async move { Some(i) })
            .collect();
        let mut out = run_batched(tasks, 2, Duration::from_millis(1), &cancel).await;
        out.sort();
        assert_eq!(out, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn run_batched_stops_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let tasks: Vec<_> = (0..10)
            .map(|i| async move { Some(i) })
            .collect();
        // First batch still runs; the pause before the second observes the
        // cancelation and stops.
        let out = run_batched(tasks, 2, Duration::from_secs(5), &cancel).await;
        assert_eq!(out.len(), 2);
    }
}
