use async_trait::async_trait;
use serde::Deserialize;

use crate::filtering::detect_languages;
use crate::model::{Candidate, InfoHash, SourceMeta, TorrentCandidate};
use crate::query::SearchQuery;

use super::{base_url, finalize, lenient_u64, Scraper, SearchContext};

const DEFAULT_URL: &str = "https://magnetdl.hair";

/// MagnetDL json mirror. The site fronts with an anti-bot layer keyed on
/// the user agent, so every call sends a rotated desktop one.
pub struct MagnetDl;

#[derive(Debug, Deserialize)]
struct MagnetDlTorrent {
    n: String,
    /// Full magnet uri; the hash is pulled out of it.
    m: String,
    #[serde(default)]
    size: serde_json::Value,
    #[serde(default)]
    seeders: serde_json::Value,
}

impl MagnetDl {
    fn map_item(item: MagnetDlTorrent) -> Option<Candidate> {
        let info_hash = InfoHash::from_magnet(&item.m)?;
        let magnet = reqwest::Url::parse(&item.m).ok();
        Some(Candidate::Torrent(TorrentCandidate {
            languages: detect_languages(&item.n),
            size: lenient_u64(&item.size).unwrap_or(0),
            seeders: lenient_u64(&item.seeders).map(|s| s as u32),
            tracker: "MagnetDL".to_string(),
            info_hash: Some(info_hash),
            magnet,
            source: SourceMeta::default(),
            title: item.n,
        }))
    }
}

#[async_trait]
impl Scraper for MagnetDl {
    fn name(&self) -> &'static str {
        "magnetdl"
    }

    async fn search(&self, query: &SearchQuery, ctx: &SearchContext) -> Vec<Candidate> {
        let Some(base) = base_url(ctx, self.name(), DEFAULT_URL) else {
            return Vec::new();
        };
        let limit = ctx.config.scraper(self.name()).limit.unwrap_or(40);

        let mut out: Vec<Candidate> = Vec::new();
        for text in query.texts() {
            let mut url = base.clone();
            url.set_path(&format!("/api/{}/se/desc/1/", text.replace(' ', "-")));
            let items: Vec<MagnetDlTorrent> = match ctx
                .fetch
                .get(url)
                .user_agent(crate::fetch::random_user_agent())
                .timeout(ctx.call_timeout())
                .json_response(&ctx.cancel)
                .await
            {
                Ok(items) => items,
                Err(e) if e.is_canceled() => break,
                Err(e) => {
                    super::skip_item(self.name(), &e);
                    continue;
                }
            };
            out.extend(items.into_iter().filter_map(Self::map_item));
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
    fn hash_comes_from_magnet() {
        let item: MagnetDlTorrent = serde_json::from_value(serde_json::json!({
            "n": "The.Matrix.1999.REMUX",
            "m": "magnet:?xt=urn:btih:08ada5a7a6183aae1e09d831df6748d566095a10&dn=Matrix",
            "size": 34359738368u64,
            "seeders": 12
        }))
        .unwrap();
        match MagnetDl::map_item(item).unwrap() {
            Candidate::Torrent(t) => {
                assert_eq!(
                    t.info_hash.unwrap().as_str(),
                    "08ada5a7a6183aae1e09d831df6748d566095a10"
                );
                assert!(t.magnet.is_some());
            }
            rest => panic!("unexpected variant: {rest:?}"),
        }
    }

    #[test]
    fn bad_magnet_is_skipped() {
        let item: MagnetDlTorrent = serde_json::from_value(serde_json::json!({
            "n": "Broken",
            "m": "https://not-a-magnet.example/x",
        }))
        .unwrap();
        assert!(MagnetDl::map_item(item).is_none());
    }
}
