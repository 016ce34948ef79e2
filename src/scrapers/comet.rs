use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

use crate::filtering::detect_languages;
use crate::model::{parse_size, Candidate, InfoHash, SourceMeta, TorrentCandidate};
use crate::query::SearchQuery;

use super::{base_url, finalize, Scraper, SearchContext};

const DEFAULT_URL: &str = "https://comet.elfhosted.com";

static SEEDERS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"👤\s*(\d+)").expect("seeders pattern"));
static SIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"💾\s*([\d.,]+\s*[KMGT]?B)").expect("size pattern"));
static TRACKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"🔎\s*([^\n]+)").expect("tracker pattern"));

/// Comet stream addon. Same `stream/{type}/{id}.json` surface as
/// Torrentio with the metadata moved into `description`.
pub struct Comet;

#[derive(Debug, Deserialize)]
struct AddonResponse {
    #[serde(default)]
    streams: Vec<AddonStream>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddonStream {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    info_hash: Option<String>,
    #[serde(default)]
    behavior_hints: Option<BehaviorHints>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BehaviorHints {
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    video_size: Option<u64>,
}

impl Comet {
    fn map_stream(stream: AddonStream) -> Option<Candidate> {
        let info_hash = stream.info_hash.as_deref().and_then(InfoHash::new)?;
        let description = stream.description.unwrap_or_default();
        let hints = stream.behavior_hints;
        let title = hints
            .as_ref()
            .and_then(|h| h.filename.clone())
            .or_else(|| {
                description
                    .lines()
                    .next()
                    .map(|line| line.trim_start_matches(['💿', ' ']).trim().to_string())
            })
            .filter(|title| !title.is_empty())?;
        let size = hints
            .as_ref()
            .and_then(|h| h.video_size)
            .or_else(|| {
                SIZE_RE
                    .captures(&description)
                    .and_then(|c| parse_size(c[1].trim()))
            })
            .unwrap_or(0);
        let seeders = SEEDERS_RE
            .captures(&description)
            .and_then(|c| c[1].parse().ok());
        let tracker = match TRACKER_RE.captures(&description) {
            Some(c) => format!("Comet | {}", c[1].trim()),
            None => "Comet".to_string(),
        };
        let magnet = TorrentCandidate::magnet_from_hash(&info_hash, &title);
        Some(Candidate::Torrent(TorrentCandidate {
            languages: detect_languages(&description),
            size,
            seeders,
            tracker,
            info_hash: Some(info_hash),
            magnet: Some(magnet),
            source: SourceMeta::default(),
            title,
        }))
    }
}

#[async_trait]
impl Scraper for Comet {
    fn name(&self) -> &'static str {
        "comet"
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_description_stream() {
        let stream: AddonStream = serde_json::from_value(serde_json::json!({
            "description": "💿 The.Matrix.1999.1080p.BluRay\n👤 45 💾 8.4 GB 🔎 YTS",
            "infoHash": "08ada5a7a6183aae1e09d831df6748d566095a10"
        }))
        .unwrap();
        match Comet::map_stream(stream).unwrap() {
            Candidate::Torrent(t) => {
                assert_eq!(t.title, "The.Matrix.1999.1080p.BluRay");
                assert_eq!(t.seeders, Some(45));
                assert_eq!(t.tracker, "Comet | YTS");
            }
            rest => panic!("unexpected variant: {rest:?}"),
        }
    }

    #[test]
    fn behavior_hints_take_precedence() {
        let stream: AddonStream = serde_json::from_value(serde_json::json!({
            "description": "💿 Display.Name\n💾 1.0 GB",
            "infoHash": "08ada5a7a6183aae1e09d831df6748d566095a10",
            "behaviorHints": {
                "filename": "The.Matrix.1999.2160p.mkv",
                "videoSize": 64424509440u64
            }
        }))
        .unwrap();
        match Comet::map_stream(stream).unwrap() {
            Candidate::Torrent(t) => {
                assert_eq!(t.title, "The.Matrix.1999.2160p.mkv");
                assert_eq!(t.size, 64424509440);
            }
            rest => panic!("unexpected variant: {rest:?}"),
        }
    }
}
