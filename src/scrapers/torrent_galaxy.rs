use async_trait::async_trait;
use serde::Deserialize;

use crate::filtering::detect_languages;
use crate::model::{parse_size, Candidate, InfoHash, SourceMeta, TorrentCandidate};
use crate::query::SearchQuery;

use super::{base_url, finalize, lenient_u64, Scraper, SearchContext};

const DEFAULT_URL: &str = "https://torrentgalaxy.one";

/// TorrentGalaxy json search: `get_posts.php?q=<query>`.
pub struct TorrentGalaxy;

#[derive(Debug, Deserialize)]
struct TgxResponse {
    #[serde(default)]
    results: Vec<TgxTorrent>,
}

#[derive(Debug, Deserialize)]
struct TgxTorrent {
    /// Release name.
    n: String,
    /// Info hash.
    #[serde(default)]
    h: Option<String>,
    /// Human size string, e.g. `"1.37 GB"`.
    #[serde(default)]
    s: Option<String>,
    #[serde(default)]
    se: serde_json::Value,
    #[serde(default)]
    pk: Option<String>,
}

impl TorrentGalaxy {
    fn map_item(item: TgxTorrent) -> Option<Candidate> {
        let info_hash = item.h.as_deref().and_then(InfoHash::new)?;
        let magnet = TorrentCandidate::magnet_from_hash(&info_hash, &item.n);
        Some(Candidate::Torrent(TorrentCandidate {
            languages: detect_languages(&item.n),
            size: item.s.as_deref().and_then(parse_size).unwrap_or(0),
            seeders: lenient_u64(&item.se).map(|s| s as u32),
            tracker: "TorrentGalaxy".to_string(),
            info_hash: Some(info_hash),
            magnet: Some(magnet),
            source: SourceMeta {
                file_count: None,
                detail_url: item.pk.map(|pk| format!("{DEFAULT_URL}/post/{pk}")),
            },
            title: item.n,
        }))
    }
}

#[async_trait]
impl Scraper for TorrentGalaxy {
    fn name(&self) -> &'static str {
        "torrent_galaxy"
    }

    async fn search(&self, query: &SearchQuery, ctx: &SearchContext) -> Vec<Candidate> {
        let Some(base) = base_url(ctx, self.name(), DEFAULT_URL) else {
            return Vec::new();
        };
        let limit = ctx.config.scraper(self.name()).limit.unwrap_or(50);

        let mut out: Vec<Candidate> = Vec::new();
        for text in query.texts() {
            let mut url = base.clone();
            url.set_path("/get_posts.php");
            url.query_pairs_mut().append_pair("q", text);
            let response: TgxResponse = match ctx
                .fetch
                .get(url)
                .timeout(ctx.call_timeout())
                .json_response(&ctx.cancel)
                .await
            {
                Ok(response) => response,
                Err(e) if e.is_canceled() => break,
                Err(e) => {
                    super::skip_item(self.name(), &e);
                    continue;
                }
            };
            out.extend(response.results.into_iter().filter_map(Self::map_item));
            if !out.is_empty() {
                break;
            }
        }
        out.truncate(limit);
        finalize(out, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wire_shape() {
        let raw = serde_json::json!({
            "results": [
                {
                    "n": "The.Matrix.1999.1080p.BluRay.x265",
                    "h": "08ada5a7a6183aae1e09d831df6748d566095a10",
                    "s": "2.3 GB",
                    "se": "55",
                    "pk": "abc123"
                },
                { "n": "no hash, dropped" }
            ]
        });
        let response: TgxResponse = serde_json::from_value(raw).unwrap();
        let candidates: Vec<_> = response
            .results
            .into_iter()
            .filter_map(TorrentGalaxy::map_item)
            .collect();
        assert_eq!(candidates.len(), 1);
        match &candidates[0] {
            Candidate::Torrent(t) => {
                assert_eq!(t.seeders, Some(55));
                assert!(t.size > 2 * 1024 * 1024 * 1024);
                assert!(t.source.detail_url.as_deref().unwrap().contains("abc123"));
            }
            rest => panic!("unexpected variant: {rest:?}"),
        }
    }
}
