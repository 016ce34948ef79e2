use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::filtering::detect_languages;
use crate::model::{Candidate, ContentType, InfoHash, SourceMeta, TorrentCandidate};
use crate::query::SearchQuery;

use super::{finalize, Scraper, SearchContext};

/// Torznab rss envelope, shared with the newznab (usenet) adapter.
#[derive(Debug, Deserialize)]
pub(crate) struct Rss {
    pub channel: Channel,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Channel {
    #[serde(default, rename = "item")]
    pub items: Vec<Item>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Item {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub guid: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub enclosure: Option<Enclosure>,
    #[serde(
        default,
        rename = "torznab:attr",
        alias = "newznab:attr",
        alias = "attr"
    )]
    pub attrs: Vec<Attr>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Enclosure {
    #[serde(rename = "@url")]
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Attr {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@value")]
    pub value: String,
}

impl Item {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|attr| attr.name == name)
            .map(|attr| attr.value.as_str())
    }
}

pub(crate) fn parse_feed(xml: &str) -> Result<Vec<Item>> {
    let rss: Rss = quick_xml::de::from_str(xml)
        .map_err(|e| Error::parse(format!("torznab feed did not parse: {e}")))?;
    Ok(rss.channel.items)
}

/// Generic torznab adapter. One instance per configured indexer
/// (jackett, bitmagnet, stremthru); they differ only in name, default
/// endpoint and whether an api key is required.
pub struct Torznab {
    name: &'static str,
    label: &'static str,
    default_url: &'static str,
}

impl Torznab {
    pub fn jackett() -> Self {
        Self {
            name: "jackett",
            label: "Jackett",
            default_url: "http://127.0.0.1:9117/api/v2.0/indexers/all/results/torznab",
        }
    }

    pub fn bitmagnet() -> Self {
        Self {
            name: "bitmagnet",
            label: "Bitmagnet",
            default_url: "http://127.0.0.1:3333/torznab",
        }
    }

    pub fn stremthru() -> Self {
        Self {
            name: "stremthru",
            label: "StremThru",
            default_url: "https://stremthru.elfhosted.com/v0/torznab/api",
        }
    }

    fn map_item(&self, item: Item) -> Option<Candidate> {
        let title = item.title.clone()?;
        let info_hash = item
            .attr("infohash")
            .and_then(InfoHash::new)
            .or_else(|| item.attr("magneturl").and_then(InfoHash::from_magnet))?;
        let magnet = item
            .attr("magneturl")
            .and_then(|raw| reqwest::Url::parse(raw).ok())
            .or_else(|| Some(TorrentCandidate::magnet_from_hash(&info_hash, &title)));
        let seeders = item.attr("seeders").and_then(|raw| raw.parse().ok());
        let size = item
            .size
            .or_else(|| item.attr("size").and_then(|raw| raw.parse().ok()))
            .unwrap_or(0);
        Some(Candidate::Torrent(TorrentCandidate {
            languages: detect_languages(&title),
            size,
            seeders,
            tracker: self.label.to_string(),
            info_hash: Some(info_hash),
            magnet,
            source: SourceMeta {
                file_count: None,
                detail_url: item.link.or(item.guid),
            },
            title,
        }))
    }

    async fn fetch_page(
        &self,
        ctx: &SearchContext,
        base: &reqwest::Url,
        api_key: Option<&str>,
        content_type: ContentType,
        text: &str,
        legacy_param: bool,
    ) -> Result<Vec<Item>> {
        let mut url = base.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("t", "search");
            pairs.append_pair(if legacy_param { "search" } else { "q" }, text);
            pairs.append_pair(
                "cat",
                match content_type {
                    ContentType::Movie => "2000",
                    ContentType::Series => "5000",
                },
            );
            if let Some(key) = api_key {
                pairs.append_pair("apikey", key);
            }
        }
        let xml = ctx
            .fetch
            .get(url)
            .timeout(ctx.call_timeout())
            .text(&ctx.cancel)
            .await?;
        parse_feed(&xml)
    }
}

#[async_trait]
impl Scraper for Torznab {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn search(&self, query: &SearchQuery, ctx: &SearchContext) -> Vec<Candidate> {
        let Some(base) = super::base_url(ctx, self.name, self.default_url) else {
            return Vec::new();
        };
        let settings = ctx.config.scraper(self.name);
        let limit = settings.limit.unwrap_or(60);
        let api_key = settings.api_key.as_deref();

        let mut out: Vec<Candidate> = Vec::new();
        for text in query.texts() {
            let items = match self
                .fetch_page(ctx, &base, api_key, query.media.content_type, text, false)
                .await
            {
                Ok(items) => items,
                Err(e) if e.is_canceled() => break,
                Err(e) => {
                    // Older servers reject the modern param name; retry once
                    // with the legacy one before giving up on this query.
                    super::skip_item(self.name, &e);
                    match self
                        .fetch_page(ctx, &base, api_key, query.media.content_type, text, true)
                        .await
                    {
                        Ok(items) => items,
                        Err(e) => {
                            if !e.is_canceled() {
                                super::skip_item(self.name, &e);
                            }
                            continue;
                        }
                    }
                }
            };
            out.extend(items.into_iter().filter_map(|item| self.map_item(item)));
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

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:torznab="http://torznab.com/schemas/2015/feed">
  <channel>
    <title>indexer</title>
    <item>
      <title>The.Matrix.1999.1080p.BluRay.x264</title>
      <guid>https://indexer.example/details/1</guid>
      <link>https://indexer.example/dl/1.torrent</link>
      <size>8589934592</size>
      <enclosure url="https://indexer.example/dl/1.torrent" length="8589934592" type="application/x-bittorrent"/>
      <torznab:attr name="seeders" value="77"/>
      <torznab:attr name="infohash" value="08ada5a7a6183aae1e09d831df6748d566095a10"/>
    </item>
    <item>
      <title>The.Matrix.1999.2160p.REMUX</title>
      <torznab:attr name="magneturl" value="magnet:?xt=urn:btih:18ada5a7a6183aae1e09d831df6748d566095a10&amp;dn=matrix"/>
    </item>
    <item>
      <title>No hash at all</title>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn parses_torznab_feed() {
        let items = parse_feed(FEED).unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].attr("seeders"), Some("77"));
        assert_eq!(items[0].size, Some(8589934592));

        let adapter = Torznab::jackett();
        let candidates: Vec<_> = items
            .into_iter()
            .filter_map(|item| adapter.map_item(item))
            .collect();
        assert_eq!(candidates.len(), 2);
        match &candidates[0] {
            Candidate::Torrent(t) => {
                assert_eq!(t.seeders, Some(77));
                assert_eq!(t.tracker, "Jackett");
                assert_eq!(
                    t.info_hash.as_ref().unwrap().as_str(),
                    "08ada5a7a6183aae1e09d831df6748d566095a10"
                );
            }
            rest => panic!("unexpected variant: {rest:?}"),
        }
        // Hash recovered from the magnet attr.
        match &candidates[1] {
            Candidate::Torrent(t) => {
                assert_eq!(
                    t.info_hash.as_ref().unwrap().as_str(),
                    "18ada5a7a6183aae1e09d831df6748d566095a10"
                );
            }
            rest => panic!("unexpected variant: {rest:?}"),
        }
    }

    #[test]
    fn garbage_feed_errors() {
        assert!(parse_feed("<html>not a feed</html>").is_err());
        assert!(parse_feed("").is_err());
    }
}
