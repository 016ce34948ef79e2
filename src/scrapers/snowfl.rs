use async_trait::async_trait;
use serde::Deserialize;

use crate::filtering::detect_languages;
use crate::model::{parse_size, Candidate, InfoHash, SourceMeta, TorrentCandidate};
use crate::query::SearchQuery;

use super::{base_url, finalize, lenient_u64, Scraper, SearchContext};

const DEFAULT_URL: &str = "https://snowfl.com";

/// Snowfl meta-search. The api path carries a rotating token the site
/// embeds in its frontend bundle; it is supplied through `SNOWFL_API_KEY`.
pub struct Snowfl;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnowflTorrent {
    name: String,
    #[serde(default)]
    magnet: Option<String>,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    seeder: serde_json::Value,
    #[serde(default)]
    site: Option<String>,
}

impl Snowfl {
    fn map_item(item: SnowflTorrent) -> Option<Candidate> {
        let magnet = item.magnet?;
        let info_hash = InfoHash::from_magnet(&magnet)?;
        let tracker = match &item.site {
            Some(site) => format!("Snowfl | {site}"),
            None => "Snowfl".to_string(),
        };
        Some(Candidate::Torrent(TorrentCandidate {
            languages: detect_languages(&item.name),
            size: item.size.as_deref().and_then(parse_size).unwrap_or(0),
            seeders: lenient_u64(&item.seeder).map(|s| s as u32),
            tracker,
            info_hash: Some(info_hash),
            magnet: reqwest::Url::parse(&magnet).ok(),
            source: SourceMeta::default(),
            title: item.name,
        }))
    }
}

#[async_trait]
impl Scraper for Snowfl {
    fn name(&self) -> &'static str {
        "snowfl"
    }

    async fn search(&self, query: &SearchQuery, ctx: &SearchContext) -> Vec<Candidate> {
        let Some(base) = base_url(ctx, self.name(), DEFAULT_URL) else {
            return Vec::new();
        };
        let settings = ctx.config.scraper(self.name());
        let Some(token) = settings.api_key else {
            tracing::debug!("Snowfl token not configured, skipping");
            return Vec::new();
        };
        let limit = settings.limit.unwrap_or(40);

        let mut out: Vec<Candidate> = Vec::new();
        for text in query.texts() {
            let mut url = base.clone();
            url.set_path(&format!(
                "/{}/{}/{}/0/SEED/NONE/1",
                token,
                urlencoding::encode(text),
                "x"
            ));
            let items: Vec<SnowflTorrent> = match ctx
                .fetch
                .get(url)
                .header("referer", base.as_str())
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
    fn maps_and_labels_origin_site() {
        let item: SnowflTorrent = serde_json::from_value(serde_json::json!({
            "name": "The.Matrix.1999.2160p.REMUX",
            "magnet": "magnet:?xt=urn:btih:08ada5a7a6183aae1e09d831df6748d566095a10",
            "size": "52.3 GB",
            "seeder": 31,
            "site": "RARBG"
        }))
        .unwrap();
        match Snowfl::map_item(item).unwrap() {
            Candidate::Torrent(t) => {
                assert_eq!(t.tracker, "Snowfl | RARBG");
                assert!(t.size > 50 * 1024 * 1024 * 1024);
            }
            rest => panic!("unexpected variant: {rest:?}"),
        }
    }

    #[test]
    fn magnetless_items_are_dropped() {
        let item: SnowflTorrent =
            serde_json::from_value(serde_json::json!({ "name": "x", "seeder": 1 })).unwrap();
        assert!(Snowfl::map_item(item).is_none());
    }
}
