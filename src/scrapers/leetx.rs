use async_trait::async_trait;
use serde::Deserialize;

use crate::filtering::detect_languages;
use crate::model::{Candidate, InfoHash, SourceMeta, TorrentCandidate};
use crate::query::SearchQuery;

use super::{base_url, finalize, lenient_u64, title_matches, Scraper, SearchContext};

const DEFAULT_URL: &str = "https://1337x.proxyninja.org";
const DEFAULT_MAX_PAGES: u32 = 2;

/// 1337x-style JSON mirror. Keyword search with paging; results are fuzzy,
/// so movie hits are gated by a strict whole-word + year title match.
pub struct Leetx;

#[derive(Debug, Deserialize)]
struct LeetxTorrent {
    name: String,
    #[serde(default)]
    id: Option<serde_json::Value>,
    /// Real info hash when the mirror exposes it.
    #[serde(default)]
    h: Option<String>,
    #[serde(default)]
    size: serde_json::Value,
    #[serde(default)]
    seeders: serde_json::Value,
    #[serde(default)]
    link: Option<String>,
}

impl Leetx {
    fn map_item(item: LeetxTorrent, strict: Option<(&str, Option<u16>)>) -> Option<Candidate> {
        if let Some((title, year)) = strict {
            if !title_matches(&item.name, title, year) {
                return None;
            }
        }
        let (info_hash, detail_url) = match item.h.as_deref().and_then(InfoHash::new) {
            Some(hash) => (hash, item.link.clone()),
            None => {
                // No hash in the listing: derive one from the primary key so
                // dedup still works. Flagged synthetic, so it never reaches
                // debrid lookups.
                let id = item.id.as_ref().and_then(lenient_u64)?;
                let seed = format!("1337x/{id}");
                (InfoHash::synthesize(&seed), item.link.clone())
            }
        };
        let magnet = (!info_hash.is_synthetic())
            .then(|| TorrentCandidate::magnet_from_hash(&info_hash, &item.name));
        Some(Candidate::Torrent(TorrentCandidate {
            languages: detect_languages(&item.name),
            size: lenient_u64(&item.size).unwrap_or(0),
            seeders: lenient_u64(&item.seeders).map(|s| s as u32),
            tracker: "1337x".to_string(),
            info_hash: Some(info_hash),
            magnet,
            source: SourceMeta {
                file_count: None,
                detail_url,
            },
            title: item.name,
        }))
    }
}

#[async_trait]
impl Scraper for Leetx {
    fn name(&self) -> &'static str {
        "leetx"
    }

    async fn search(&self, query: &SearchQuery, ctx: &SearchContext) -> Vec<Candidate> {
        let Some(base) = base_url(ctx, self.name(), DEFAULT_URL) else {
            return Vec::new();
        };
        let settings = ctx.config.scraper(self.name());
        let max_pages = settings.max_pages.unwrap_or(DEFAULT_MAX_PAGES).max(1);
        let limit = settings.limit.unwrap_or(50);
        let strict = query
            .media
            .season
            .is_none()
            .then_some((query.title.as_str(), query.year));

        let mut out = Vec::new();
        'queries: for text in query.texts() {
            for page in 1..=max_pages {
                let mut url = base.clone();
                url.set_path("/api/v1/search");
                url.query_pairs_mut()
                    .append_pair("q", text)
                    .append_pair("page", &page.to_string());
                let items: Vec<LeetxTorrent> = match ctx
                    .fetch
                    .get(url)
                    .timeout(ctx.call_timeout())
                    .json_response(&ctx.cancel)
                    .await
                {
                    Ok(items) => items,
                    Err(e) if e.is_canceled() => return finalize(out, ctx),
                    Err(e) => {
                        super::skip_item(self.name(), &e);
                        break;
                    }
                };
                let page_empty = items.is_empty();
                out.extend(
                    items
                        .into_iter()
                        .filter_map(|item| Self::map_item(item, strict)),
                );
                if page_empty || out.len() >= limit {
                    break;
                }
            }
            if !out.is_empty() {
                break 'queries;
            }
        }
        out.truncate(limit);
        finalize(out, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(raw: serde_json::Value) -> LeetxTorrent {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn maps_real_hash() {
        let candidate = Leetx::map_item(
            item(serde_json::json!({
                "name": "The.Matrix.1999.1080p.BluRay.x264",
                "id": 42,
                "h": "08ADA5A7A6183AAE1E09D831DF6748D566095A10",
                "size": 2147483648u64,
                "seeders": "120",
            })),
            Some(("The Matrix", Some(1999))),
        )
        .unwrap();
        match candidate {
            Candidate::Torrent(t) => {
                let hash = t.info_hash.unwrap();
                assert_eq!(hash.as_str(), "08ada5a7a6183aae1e09d831df6748d566095a10");
                assert!(!hash.is_synthetic());
                assert!(t.magnet.is_some());
                assert_eq!(t.seeders, Some(120));
            }
            rest => panic!("unexpected variant: {rest:?}"),
        }
    }

    #[test]
    fn synthesizes_hash_from_id() {
        let candidate = Leetx::map_item(
            item(serde_json::json!({
                "name": "The.Matrix.1999.720p",
                "id": "77",
                "size": "1000",
                "seeders": 3,
            })),
            None,
        )
        .unwrap();
        match candidate {
            Candidate::Torrent(t) => {
                assert!(t.info_hash.unwrap().is_synthetic());
                assert!(t.magnet.is_none());
            }
            rest => panic!("unexpected variant: {rest:?}"),
        }
    }

    #[test]
    fn strict_match_rejects_wrong_movie() {
        let rejected = Leetx::map_item(
            item(serde_json::json!({
                "name": "The.Matrix.Reloaded.2003.1080p",
                "id": 1,
                "size": 0,
                "seeders": 0,
            })),
            Some(("The Matrix", Some(1999))),
        );
        assert!(rejected.is_none());
    }
}
