use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::Deserialize;

use crate::filtering::detect_languages;
use crate::model::{Candidate, InfoHash, SourceMeta, TorrentCandidate};
use crate::query::SearchQuery;

use super::{base_url, finalize, Scraper, SearchContext};

const DEFAULT_URL: &str = "https://zilean.elfhosted.com";

/// Zilean DMM index: `POST /dmm/filtered` with a query text. Unusual among
/// the sources in that it returns a native language list per entry.
pub struct Zilean;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ZileanEntry {
    raw_title: String,
    info_hash: String,
    #[serde(default)]
    filesize: Option<u64>,
    #[serde(default)]
    languages: Vec<String>,
}

impl Zilean {
    fn map_item(item: ZileanEntry) -> Option<Candidate> {
        let info_hash = InfoHash::new(&item.info_hash)?;
        // Prefer the native list; fall back to title detection when empty.
        let languages: BTreeSet<String> = if item.languages.is_empty() {
            detect_languages(&item.raw_title)
        } else {
            item.languages
                .into_iter()
                .map(|code| code.to_lowercase())
                .collect()
        };
        let magnet = TorrentCandidate::magnet_from_hash(&info_hash, &item.raw_title);
        Some(Candidate::Torrent(TorrentCandidate {
            languages,
            size: item.filesize.unwrap_or(0),
            seeders: None,
            tracker: "Zilean".to_string(),
            info_hash: Some(info_hash),
            magnet: Some(magnet),
            source: SourceMeta::default(),
            title: item.raw_title,
        }))
    }
}

#[async_trait]
impl Scraper for Zilean {
    fn name(&self) -> &'static str {
        "zilean"
    }

    async fn search(&self, query: &SearchQuery, ctx: &SearchContext) -> Vec<Candidate> {
        let Some(base) = base_url(ctx, self.name(), DEFAULT_URL) else {
            return Vec::new();
        };
        let limit = ctx.config.scraper(self.name()).limit.unwrap_or(100);

        let mut url = base;
        url.set_path("/dmm/filtered");
        let mut body = serde_json::json!({ "query": query.title });
        if let Some(season) = query.media.season {
            body["season"] = season.into();
        }
        if let Some(episode) = query.media.episode {
            body["episode"] = episode.into();
        }
        if query.media.season.is_none() {
            if let Some(year) = query.year {
                body["year"] = year.into();
            }
        }

        let entries: Vec<ZileanEntry> = match ctx
            .fetch
            .post(url)
            .json(body)
            .timeout(ctx.call_timeout())
            .json_response(&ctx.cancel)
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                if !e.is_canceled() {
                    super::skip_item(self.name(), &e);
                }
                return Vec::new();
            }
        };

        let mut out: Vec<Candidate> =
            entries.into_iter().filter_map(Self::map_item).collect();
        out.truncate(limit);
        finalize(out, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_language_list_wins() {
        let item: ZileanEntry = serde_json::from_value(serde_json::json!({
            "rawTitle": "The.Matrix.1999.1080p",
            "infoHash": "08ada5a7a6183aae1e09d831df6748d566095a10",
            "filesize": 2147483648u64,
            "languages": ["EN", "FR"]
        }))
        .unwrap();
        match Zilean::map_item(item).unwrap() {
            Candidate::Torrent(t) => {
                assert!(t.languages.contains("en"));
                assert!(t.languages.contains("fr"));
            }
            rest => panic!("unexpected variant: {rest:?}"),
        }
    }

    #[test]
    fn falls_back_to_title_detection() {
        let item: ZileanEntry = serde_json::from_value(serde_json::json!({
            "rawTitle": "Film.FRENCH.1080p",
            "infoHash": "08ada5a7a6183aae1e09d831df6748d566095a10",
        }))
        .unwrap();
        match Zilean::map_item(item).unwrap() {
            Candidate::Torrent(t) => assert!(t.languages.contains("fr")),
            rest => panic!("unexpected variant: {rest:?}"),
        }
    }

    #[test]
    fn invalid_hash_is_dropped() {
        let item: ZileanEntry = serde_json::from_value(serde_json::json!({
            "rawTitle": "x",
            "infoHash": "nope",
        }))
        .unwrap();
        assert!(Zilean::map_item(item).is_none());
    }
}
