use async_trait::async_trait;

use crate::filtering::detect_languages;
use crate::model::{Candidate, ContentType, NzbCandidate};
use crate::query::SearchQuery;

use super::torznab::{parse_feed, Item};
use super::{finalize, Scraper, SearchContext};

/// Newznab usenet indexer. Same rss dialect as torznab; results become
/// nzb candidates that resolve through the download controller.
pub struct Newznab;

fn map_item(item: Item, indexer: &str) -> Option<Candidate> {
    let title = item.title.clone()?;
    let guid = item.guid.clone()?;
    let nzb_url = item
        .enclosure
        .as_ref()
        .map(|enclosure| enclosure.url.clone())
        .or_else(|| item.link.clone())?;
    let size = item
        .size
        .or_else(|| item.attr("size").and_then(|raw| raw.parse().ok()))
        .unwrap_or(0);
    Some(Candidate::Nzb(NzbCandidate {
        languages: detect_languages(&title),
        guid,
        nzb_url,
        size,
        indexer: indexer.to_string(),
        title,
    }))
}

#[async_trait]
impl Scraper for Newznab {
    fn name(&self) -> &'static str {
        "newznab"
    }

    async fn search(&self, query: &SearchQuery, ctx: &SearchContext) -> Vec<Candidate> {
        let Some(indexer) = ctx.config.newznab.clone() else {
            return Vec::new();
        };
        let Ok(base) = reqwest::Url::parse(&indexer.url) else {
            tracing::warn!(url = indexer.url, "Bad newznab url");
            return Vec::new();
        };
        let limit = ctx.config.scraper(self.name()).limit.unwrap_or(40);

        let mut out: Vec<Candidate> = Vec::new();
        for text in query.texts() {
            let mut url = base.clone();
            url.set_path("/api");
            url.query_pairs_mut()
                .append_pair("t", "search")
                .append_pair("q", text)
                .append_pair(
                    "cat",
                    match query.media.content_type {
                        ContentType::Movie => "2000",
                        ContentType::Series => "5000",
                    },
                )
                .append_pair("apikey", &indexer.api_key);
            let xml = match ctx
                .fetch
                .get(url)
                .timeout(ctx.call_timeout())
                .text(&ctx.cancel)
                .await
            {
                Ok(xml) => xml,
                Err(e) if e.is_canceled() => break,
                Err(e) => {
                    super::skip_item(self.name(), &e);
                    continue;
                }
            };
            match parse_feed(&xml) {
                Ok(items) => {
                    out.extend(
                        items
                            .into_iter()
                            .filter_map(|item| map_item(item, "Newznab")),
                    );
                }
                Err(e) => {
                    super::skip_item(self.name(), &e);
                    continue;
                }
            }
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
<rss version="2.0" xmlns:newznab="http://www.newznab.com/DTD/2010/feeds/attributes/">
  <channel>
    <item>
      <title>The.Matrix.1999.1080p.BluRay.x264</title>
      <guid>https://indexer.example/details/abc</guid>
      <link>https://indexer.example/getnzb/abc.nzb&amp;apikey=k</link>
      <enclosure url="https://indexer.example/getnzb/abc.nzb?apikey=k" length="8589934592" type="application/x-nzb"/>
      <newznab:attr name="size" value="8589934592"/>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn maps_nzb_candidates() {
        let items = parse_feed(FEED).unwrap();
        let candidates: Vec<_> = items
            .into_iter()
            .filter_map(|item| map_item(item, "Newznab"))
            .collect();
        assert_eq!(candidates.len(), 1);
        match &candidates[0] {
            Candidate::Nzb(n) => {
                assert_eq!(n.size, 8589934592);
                assert!(n.nzb_url.contains("getnzb"));
                assert_eq!(n.indexer, "Newznab");
            }
            rest => panic!("unexpected variant: {rest:?}"),
        }
    }
}
