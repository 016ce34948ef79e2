use std::collections::BTreeSet;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};

use crate::filtering::detect_languages;
use crate::model::{parse_size, Candidate, InfoHash, SourceMeta, TorrentCandidate};
use crate::query::SearchQuery;

use super::ilcorsaronero::MAGNET_RE;
use super::{base_url, finalize, run_batched, Scraper, SearchContext};

const DEFAULT_URL: &str = "https://bludv.net";
const DETAIL_BATCH: usize = 5;
const DETAIL_DELAY: Duration = Duration::from_millis(250);

static POST_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.post").expect("post selector"));
static TITLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".title a[href]").expect("title selector"));

/// Brazilian release blog. Every post links a detail page that carries one
/// magnet per quality; dual-audio releases are the norm.
pub struct BluDv;

fn parse_posts(html: &str, base: &reqwest::Url) -> Vec<(String, String)> {
    let doc = Html::parse_document(html);
    let mut out = Vec::new();
    for post in doc.select(&POST_SEL) {
        let Some(anchor) = post.select(&TITLE_SEL).next() else {
            continue;
        };
        let title = anchor.text().collect::<String>().trim().to_string();
        let Some(detail) = anchor
            .value()
            .attr("href")
            .and_then(|href| base.join(href).ok())
        else {
            continue;
        };
        if !title.is_empty() {
            out.push((title, detail.to_string()));
        }
    }
    out
}

/// All magnets on a detail page, paired with the nearest size found in the
/// page text.
fn parse_detail(html: &str) -> Vec<(String, u64)> {
    let page_size = html
        .split(|c: char| c == '<' || c == '>')
        .find_map(|chunk| {
            let chunk = chunk.trim();
            chunk
                .strip_prefix("Tamanho:")
                .map(str::trim)
                .and_then(parse_size)
        })
        .unwrap_or(0);
    MAGNET_RE
        .find_iter(html)
        .map(|m| (m.as_str().replace("&amp;", "&"), page_size))
        .collect()
}

fn release_languages(title: &str) -> BTreeSet<String> {
    let mut languages = detect_languages(title);
    // Everything on the site is at least dubbed or subtitled in Portuguese.
    languages.insert("pt".to_string());
    languages
}

#[async_trait]
impl Scraper for BluDv {
    fn name(&self) -> &'static str {
        "bludv"
    }

    fn lang(&self) -> Option<&'static str> {
        Some("pt")
    }

    async fn search(&self, query: &SearchQuery, ctx: &SearchContext) -> Vec<Candidate> {
        let Some(base) = base_url(ctx, self.name(), DEFAULT_URL) else {
            return Vec::new();
        };
        let limit = ctx.config.scraper(self.name()).limit.unwrap_or(20);

        let mut posts = Vec::new();
        for text in query.texts() {
            let mut url = base.clone();
            url.query_pairs_mut().append_pair("s", text);
            match ctx
                .fetch
                .get(url)
                .timeout(ctx.call_timeout())
                .text(&ctx.cancel)
                .await
            {
                Ok(body) => posts = parse_posts(&body, &base),
                Err(e) if e.is_canceled() => return Vec::new(),
                Err(e) => {
                    super::skip_item(self.name(), &e);
                    continue;
                }
            }
            if !posts.is_empty() {
                break;
            }
        }
        posts.truncate(limit);

        let timeout = ctx.call_timeout();
        let tasks: Vec<_> = posts
            .into_iter()
            .map(|(post_title, detail_url)| {
                let fetch = ctx.fetch.clone();
                let cancel = ctx.cancel.clone();
                async move {
                    let url = reqwest::Url::parse(&detail_url).ok()?;
                    let body = fetch.get(url).timeout(timeout).text(&cancel).await.ok()?;
                    let mut found = Vec::new();
                    for (magnet, size) in parse_detail(&body) {
                        let Some(info_hash) = InfoHash::from_magnet(&magnet) else {
                            continue;
                        };
                        // The magnet display name is usually the release
                        // name; the post title is the fallback.
                        let title = magnet
                            .split("dn=")
                            .nth(1)
                            .and_then(|dn| dn.split('&').next())
                            .and_then(|dn| urlencoding::decode(dn).ok())
                            .map(|dn| dn.into_owned())
                            .filter(|dn| !dn.is_empty())
                            .unwrap_or_else(|| post_title.clone());
                        found.push(Candidate::Torrent(TorrentCandidate {
                            languages: release_languages(&title),
                            size,
                            seeders: None,
                            tracker: "BluDV".to_string(),
                            info_hash: Some(info_hash),
                            magnet: reqwest::Url::parse(&magnet).ok(),
                            source: SourceMeta {
                                file_count: None,
                                detail_url: Some(detail_url.clone()),
                            },
                            title,
                        }));
                    }
                    Some(found)
                }
            })
            .collect();
        let nested = run_batched(tasks, DETAIL_BATCH, DETAIL_DELAY, &ctx.cancel).await;
        finalize(nested.into_iter().flatten().collect(), ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_posts_and_details() {
        let base = reqwest::Url::parse(DEFAULT_URL).unwrap();
        let listing = r#"<div class="post">
            <div class="title"><a href="/matrix-1999/">Matrix (1999) Dual Áudio 1080p</a></div>
        </div>"#;
        let posts = parse_posts(listing, &base);
        assert_eq!(posts.len(), 1);

        let detail = r#"<p>Tamanho: 2.4 GB</p>
          <a href="magnet:?xt=urn:btih:08ada5a7a6183aae1e09d831df6748d566095a10&amp;dn=Matrix.1999.Dual.1080p">baixar</a>"#;
        let magnets = parse_detail(detail);
        assert_eq!(magnets.len(), 1);
        assert!(magnets[0].1 > 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn portuguese_is_always_tagged() {
        let languages = release_languages("Matrix.1999.Dual.WEB-DL");
        assert!(languages.contains("pt"));
        assert!(languages.contains("multi"));
    }
}
