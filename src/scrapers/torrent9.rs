use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};

use crate::filtering::detect_languages;
use crate::model::{parse_size, Candidate, InfoHash, SourceMeta, TorrentCandidate};
use crate::query::SearchQuery;

use super::ilcorsaronero::extract_magnet;
use super::{base_url, finalize, run_batched, Scraper, SearchContext};

const DEFAULT_URL: &str = "https://www.torrent9.fm";
const DETAIL_BATCH: usize = 5;
const DETAIL_DELAY: Duration = Duration::from_millis(250);

static ROW_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.table-responsive tbody tr").expect("row selector"));
static TITLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("td a[href]").expect("title selector"));

/// French tracker. Magnets live on detail pages only.
pub struct Torrent9;

fn parse_rows(html: &str, base: &reqwest::Url) -> Vec<(String, String, u64, Option<u32>)> {
    let doc = Html::parse_document(html);
    let mut out = Vec::new();
    for row in doc.select(&ROW_SEL) {
        let Some(anchor) = row.select(&TITLE_SEL).next() else {
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
        let cells: Vec<String> = row
            .text()
            .collect::<String>()
            .split('\n')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let size = cells.iter().find_map(|c| parse_size(c)).unwrap_or(0);
        let seeders = cells.iter().rev().find_map(|c| c.parse().ok());
        if !title.is_empty() {
            out.push((title, detail.to_string(), size, seeders));
        }
    }
    out
}

#[async_trait]
impl Scraper for Torrent9 {
    fn name(&self) -> &'static str {
        "torrent9"
    }

    fn lang(&self) -> Option<&'static str> {
        Some("fr")
    }

    async fn search(&self, query: &SearchQuery, ctx: &SearchContext) -> Vec<Candidate> {
        let Some(base) = base_url(ctx, self.name(), DEFAULT_URL) else {
            return Vec::new();
        };
        let limit = ctx.config.scraper(self.name()).limit.unwrap_or(30);

        let mut rows = Vec::new();
        for text in query.texts() {
            let mut url = base.clone();
            url.set_path(&format!(
                "/recherche/{}",
                urlencoding::encode(text)
            ));
            match ctx
                .fetch
                .get(url)
                .timeout(ctx.call_timeout())
                .text(&ctx.cancel)
                .await
            {
                Ok(body) => rows = parse_rows(&body, &base),
                Err(e) if e.is_canceled() => return Vec::new(),
                Err(e) => {
                    super::skip_item(self.name(), &e);
                    continue;
                }
            }
            if !rows.is_empty() {
                break;
            }
        }
        rows.truncate(limit);

        let timeout = ctx.call_timeout();
        let tasks: Vec<_> = rows
            .into_iter()
            .map(|(title, detail_url, size, seeders)| {
                let fetch = ctx.fetch.clone();
                let cancel = ctx.cancel.clone();
                async move {
                    let url = reqwest::Url::parse(&detail_url).ok()?;
                    let body = fetch.get(url).timeout(timeout).text(&cancel).await.ok()?;
                    let magnet = extract_magnet(&body)?;
                    let info_hash = InfoHash::from_magnet(&magnet)?;
                    Some(Candidate::Torrent(TorrentCandidate {
                        languages: detect_languages(&title),
                        size,
                        seeders,
                        tracker: "Torrent9".to_string(),
                        info_hash: Some(info_hash),
                        magnet: reqwest::Url::parse(&magnet).ok(),
                        source: SourceMeta {
                            file_count: None,
                            detail_url: Some(detail_url),
                        },
                        title,
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
    fn parses_search_rows() {
        let base = reqwest::Url::parse(DEFAULT_URL).unwrap();
        let html = r#"<div class="table-responsive"><table><tbody>
          <tr>
            <td><a href="/torrent/51234/matrix-1999">The Matrix 1999 MULTI TRUEFRENCH 1080p</a></td>
            <td>8.2 GB</td>
            <td>120</td>
          </tr>
        </tbody></table></div>"#;
        let rows = parse_rows(html, &base);
        assert_eq!(rows.len(), 1);
        let (title, detail, size, seeders) = &rows[0];
        assert!(title.contains("TRUEFRENCH"));
        assert!(detail.contains("/torrent/51234/"));
        assert!(*size > 8 * 1024 * 1024 * 1024);
        assert_eq!(*seeders, Some(120));
    }
}
