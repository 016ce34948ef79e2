use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

use crate::filtering::detect_languages;
use crate::model::{parse_size, Candidate, InfoHash, SourceMeta, TorrentCandidate};
use crate::query::SearchQuery;

use super::{base_url, finalize, Scraper, SearchContext};

const DEFAULT_URL: &str = "https://torrentio.strem.fun";

static SEEDERS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"👤\s*(\d+)").expect("seeders pattern"));
static SIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"💾\s*([\d.,]+\s*[KMGT]?B)").expect("size pattern"));
static SOURCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"⚙️\s*([^\n👤💾]+)").expect("source pattern"));

/// Torrentio stream addon: `GET /stream/{type}/{id}.json`. Seeders, size
/// and the origin tracker ride inside the human `title` line and are
/// parsed back out.
pub struct Torrentio;

#[derive(Debug, Deserialize)]
struct AddonResponse {
    #[serde(default)]
    streams: Vec<AddonStream>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddonStream {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    info_hash: Option<String>,
}

impl Torrentio {
    fn map_stream(stream: AddonStream) -> Option<Candidate> {
        let info_hash = stream.info_hash.as_deref().and_then(InfoHash::new)?;
        let title_block = stream.title.unwrap_or_default();
        let mut lines = title_block.lines();
        let release_name = lines.next().unwrap_or("").trim().to_string();
        if release_name.is_empty() {
            return None;
        }
        let seeders = SEEDERS_RE
            .captures(&title_block)
            .and_then(|c| c[1].parse().ok());
        let size = SIZE_RE
            .captures(&title_block)
            .and_then(|c| parse_size(c[1].trim()))
            .unwrap_or(0);
        let tracker = match SOURCE_RE.captures(&title_block) {
            Some(c) => format!("Torrentio | {}", c[1].trim()),
            None => "Torrentio".to_string(),
        };
        let magnet = TorrentCandidate::magnet_from_hash(&info_hash, &release_name);
        Some(Candidate::Torrent(TorrentCandidate {
            languages: detect_languages(&title_block),
            size,
            seeders,
            tracker,
            info_hash: Some(info_hash),
            magnet: Some(magnet),
            source: SourceMeta::default(),
            title: release_name,
        }))
    }
}

#[async_trait]
impl Scraper for Torrentio {
    fn name(&self) -> &'static str {
        "torrentio"
    }

    async fn search(&self, query: &SearchQuery, ctx: &SearchContext) -> Vec<Candidate> {
        let Some(base) = base_url(ctx, self.name(), DEFAULT_URL) else {
            return Vec::new();
        };
        let limit = ctx.config.scraper(self.name()).limit.unwrap_or(80);

        let mut url = base;
        url.set_path(&format!(
            "/stream/{}/{}.json",
            query.media.content_type.as_str(),
            query.media.composite_id()
        ));
        let response: AddonResponse = match ctx
            .fetch
            .get(url)
            .timeout(ctx.call_timeout())
            .json_response(&ctx.cancel)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if !e.is_canceled() {
                    super::skip_item(self.name(), &e);
                }
                return Vec::new();
            }
        };

        let mut out: Vec<Candidate> = response
            .streams
            .into_iter()
            .filter_map(Self::map_stream)
            .collect();
        out.truncate(limit);
        finalize(out, ctx)
    }
}
