use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use scraper::{Html, Selector};

use crate::filtering::detect_languages;
use crate::model::{parse_size, Candidate, InfoHash, SourceMeta, TorrentCandidate};
use crate::query::SearchQuery;

use super::{base_url, finalize, run_batched, Scraper, SearchContext};

const DEFAULT_URL: &str = "https://ilcorsaronero.link";
/// Detail pages are fetched in parallel fives with a breather in between.
const DETAIL_BATCH: usize = 5;
const DETAIL_DELAY: Duration = Duration::from_millis(300);

static ROW_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("table.table-striped tbody tr").expect("row selector"));
static LINK_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("link selector"));
static CELL_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td").expect("cell selector"));

pub(crate) static MAGNET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"magnet:\?[^"'\s<>]+"#).expect("magnet pattern"));

/// Italian tracker. The listing has no magnets; each hit needs its detail
/// page fetched to find one.
pub struct IlCorsaroNero;

#[derive(Debug)]
struct ListedRow {
    title: String,
    detail_url: String,
    size: u64,
    seeders: Option<u32>,
}

fn parse_listing(html: &str, base: &reqwest::Url) -> Vec<ListedRow> {
    let doc = Html::parse_document(html);
    let mut rows = Vec::new();
    for row in doc.select(&ROW_SEL) {
        let Some(link) = row.select(&LINK_SEL).next() else {
            continue;
        };
        let title = link.text().collect::<String>().trim().to_string();
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let Ok(detail_url) = base.join(href) else {
            continue;
        };
        let cells: Vec<String> = row
            .select(&CELL_SEL)
            .map(|cell| cell.text().collect::<String>().trim().to_string())
            .collect();
        let size = cells.iter().rev().find_map(|cell| parse_size(cell)).unwrap_or(0);
        let seeders = cells
            .iter()
            .rev()
            .find_map(|cell| cell.parse::<u32>().ok());
        if title.is_empty() {
            continue;
        }
        rows.push(ListedRow {
            title,
            detail_url: detail_url.to_string(),
            size,
            seeders,
        });
    }
    rows
}

/// Find the magnet on a detail page. Hrefs come html-escaped.
pub(crate) fn extract_magnet(html: &str) -> Option<String> {
    MAGNET_RE
        .find(html)
        .map(|m| m.as_str().replace("&amp;", "&"))
}

#[async_trait]
impl Scraper for IlCorsaroNero {
    fn name(&self) -> &'static str {
        "ilcorsaronero"
    }

    fn lang(&self) -> Option<&'static str> {
        Some("it")
    }

    async fn search(&self, query: &SearchQuery, ctx: &SearchContext) -> Vec<Candidate> {
        let Some(base) = base_url(ctx, self.name(), DEFAULT_URL) else {
            return Vec::new();
        };
        let limit = ctx.config.scraper(self.name()).limit.unwrap_or(30);

        let mut listed = Vec::new();
        for text in query.texts() {
            let mut url = base.clone();
            url.set_path(&format!("/search/{}", urlencoding::encode(text)));
            let body = match ctx
                .fetch
                .get(url)
                .timeout(ctx.call_timeout())
                .text(&ctx.cancel)
                .await
            {
                Ok(body) => body,
                Err(e) if e.is_canceled() => return Vec::new(),
                Err(e) => {
                    super::skip_item(self.name(), &e);
                    continue;
                }
            };
            listed = parse_listing(&body, &base);
            if !listed.is_empty() {
                break;
            }
        }
        listed.truncate(limit);

        let timeout = ctx.call_timeout();
        let tasks: Vec<_> = listed
            .into_iter()
            .map(|row| {
                let fetch = ctx.fetch.clone();
                let cancel = ctx.cancel.clone();
                async move {
                    let url = reqwest::Url::parse(&row.detail_url).ok()?;
                    let body = fetch
                        .get(url)
                        .timeout(timeout)
                        .text(&cancel)
                        .await
                        .ok()?;
                    let magnet = extract_magnet(&body)?;
                    let info_hash = InfoHash::from_magnet(&magnet)?;
                    Some(Candidate::Torrent(TorrentCandidate {
                        languages: detect_languages(&row.title),
                        size: row.size,
                        seeders: row.seeders,
                        tracker: "IlCorsaroNero".to_string(),
                        info_hash: Some(info_hash),
                        magnet: reqwest::Url::parse(&magnet).ok(),
                        source: SourceMeta {
                            file_count: None,
                            detail_url: Some(row.detail_url),
                        },
                        title: row.title,
                    }))
                }
            })
            .collect();
        let out = run_batched(tasks, DETAIL_BATCH, DETAIL_DELAY, &ctx.cancel).await;
        finalize(out, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_and_detail_extraction() {
        let base = reqwest::Url::parse(DEFAULT_URL).unwrap();
        let listing = r#"<html><table class="table-striped"><tbody>
          <tr>
            <td><a href="/tor/1234/matrix">The.Matrix.1999.iTA.ENG.1080p</a></td>
            <td>8.5 GB</td><td>42</td>
          </tr>
        </tbody></table></html>"#;
        let rows = parse_listing(listing, &base);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].seeders, Some(42));
        assert!(rows[0].detail_url.starts_with("https://ilcorsaronero.link/tor/"));

        let detail = r#"<a href="magnet:?xt=urn:btih:08ada5a7a6183aae1e09d831df6748d566095a10&amp;dn=matrix&amp;tr=udp">get</a>"#;
        let magnet = extract_magnet(detail).unwrap();
        assert!(magnet.contains("&dn=matrix"));
        assert!(InfoHash::from_magnet(&magnet).is_some());
    }

    #[test]
    fn empty_listing() {
        let base = reqwest::Url::parse(DEFAULT_URL).unwrap();
        assert!(parse_listing("<html></html>", &base).is_empty());
        assert!(extract_magnet("<html>no links</html>").is_none());
    }
}
