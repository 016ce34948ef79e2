use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::Deserialize;

use crate::filtering::detect_languages;
use crate::model::{parse_size, Candidate, InfoHash, SourceMeta, TorrentCandidate};
use crate::query::SearchQuery;

use super::{base_url, finalize, Scraper, SearchContext};

const DEFAULT_URL: &str = "https://wolfmax4k.com";

/// Spanish 4k release index. The api never exposes info hashes, so a
/// synthetic one is derived from the detail link; those candidates are
/// flagged and excluded from debrid availability checks.
pub struct Wolfmax4k;

#[derive(Debug, Deserialize)]
struct WolfmaxResponse {
    #[serde(default)]
    torrents: Vec<WolfmaxTorrent>,
}

#[derive(Debug, Deserialize)]
struct WolfmaxTorrent {
    #[serde(rename = "torrentName")]
    name: String,
    #[serde(default, rename = "torrentUrl")]
    url: Option<String>,
    #[serde(default, rename = "torrentSize")]
    size: Option<String>,
    #[serde(default)]
    quality: Option<String>,
}

impl Wolfmax4k {
    fn map_item(item: WolfmaxTorrent) -> Option<Candidate> {
        let detail_url = item.url?;
        let info_hash = InfoHash::synthesize(&detail_url);
        let title = match &item.quality {
            Some(quality) if !item.name.contains(quality.as_str()) => {
                format!("{} [{quality}]", item.name)
            }
            _ => item.name.clone(),
        };
        let mut languages: BTreeSet<String> = detect_languages(&title);
        languages.insert("es".to_string());
        Some(Candidate::Torrent(TorrentCandidate {
            languages,
            size: item.size.as_deref().and_then(parse_size).unwrap_or(0),
            seeders: None,
            tracker: "Wolfmax4K".to_string(),
            info_hash: Some(info_hash),
            magnet: None,
            source: SourceMeta {
                file_count: None,
                detail_url: Some(detail_url),
            },
            title,
        }))
    }
}

#[async_trait]
impl Scraper for Wolfmax4k {
    fn name(&self) -> &'static str {
        "wolfmax4k"
    }

    fn lang(&self) -> Option<&'static str> {
        Some("es")
    }

    async fn search(&self, query: &SearchQuery, ctx: &SearchContext) -> Vec<Candidate> {
        let Some(base) = base_url(ctx, self.name(), DEFAULT_URL) else {
            return Vec::new();
        };
        let limit = ctx.config.scraper(self.name()).limit.unwrap_or(20);

        let mut out: Vec<Candidate> = Vec::new();
        for text in query.texts() {
            let mut url = base.clone();
            url.set_path("/api/search");
            url.query_pairs_mut().append_pair("q", text);
            let response: WolfmaxResponse = match ctx
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
            out.extend(response.torrents.into_iter().filter_map(Self::map_item));
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
    fn synthesizes_and_flags_hash() {
        let item: WolfmaxTorrent = serde_json::from_value(serde_json::json!({
            "torrentName": "La Matrix (1999)",
            "torrentUrl": "https://wolfmax4k.com/descargar/la-matrix/",
            "torrentSize": "22.1 GB",
            "quality": "4K UHDrip"
        }))
        .unwrap();
        match Wolfmax4k::map_item(item).unwrap() {
            Candidate::Torrent(t) => {
                let hash = t.info_hash.unwrap();
                assert!(hash.is_synthetic());
                assert!(t.languages.contains("es"));
                assert!(t.title.contains("4K"));
                assert!(t.magnet.is_none());
            }
            rest => panic!("unexpected variant: {rest:?}"),
        }
    }

    #[test]
    fn same_link_same_hash() {
        let hash = |name: &str| {
            let item: WolfmaxTorrent = serde_json::from_value(serde_json::json!({
                "torrentName": name,
                "torrentUrl": "https://wolfmax4k.com/descargar/x/",
            }))
            .unwrap();
            match Wolfmax4k::map_item(item).unwrap() {
                Candidate::Torrent(t) => t.info_hash.unwrap(),
                rest => panic!("unexpected variant: {rest:?}"),
            }
        };
        assert_eq!(hash("a"), hash("b"));
    }
}
