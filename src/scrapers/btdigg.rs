use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use scraper::{Html, Selector};

use crate::fetch::Session;
use crate::filtering::detect_languages;
use crate::model::{parse_size, Candidate, InfoHash, SourceMeta, TorrentCandidate};
use crate::query::SearchQuery;

use super::{base_url, finalize, Scraper, SearchContext};

const DEFAULT_URL: &str = "https://btdig.com";
const DEFAULT_MAX_PAGES: u32 = 4;
/// Pages are pulled in pairs with a fixed pause between pairs.
const PAGE_BATCH: u32 = 2;
const BATCH_DELAY: Duration = Duration::from_secs(1);

static RESULT_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.one_result").expect("result selector"));
static NAME_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".torrent_name a").expect("name selector"));
static MAGNET_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".torrent_magnet a").expect("magnet selector"));
static SIZE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".torrent_size").expect("size selector"));
static FILES_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".torrent_files").expect("files selector"));

/// DHT search engine scrape. The site is aggressively bot-hostile:
/// cookies must persist across pages, the user agent must stay stable for
/// the session, requests are jittered, and a CAPTCHA interstitial can
/// replace any response body.
pub struct BtDigg;

#[derive(Debug)]
struct ParsedRow {
    name: String,
    magnet: String,
    size: u64,
    file_count: Option<u32>,
}

/// One page worth of rows, or None when the body is a bot challenge.
fn parse_page(html: &str) -> Option<Vec<ParsedRow>> {
    let lower = html.to_lowercase();
    if lower.contains("captcha") || lower.contains("detected unusual traffic") {
        return None;
    }
    let doc = Html::parse_document(html);
    let mut rows = Vec::new();
    for result in doc.select(&RESULT_SEL) {
        let Some(name_el) = result.select(&NAME_SEL).next() else {
            continue;
        };
        let name = name_el.text().collect::<String>().trim().to_string();
        let Some(magnet) = result
            .select(&MAGNET_SEL)
            .next()
            .and_then(|a| a.value().attr("href"))
        else {
            continue;
        };
        let size = result
            .select(&SIZE_SEL)
            .next()
            .map(|el| el.text().collect::<String>())
            .as_deref()
            .and_then(parse_size)
            .unwrap_or(0);
        let file_count = result
            .select(&FILES_SEL)
            .next()
            .and_then(|el| el.text().collect::<String>().trim().parse().ok());
        if name.is_empty() {
            continue;
        }
        rows.push(ParsedRow {
            name,
            magnet: magnet.to_string(),
            size,
            file_count,
        });
    }
    Some(rows)
}

fn map_row(row: ParsedRow) -> Option<Candidate> {
    let info_hash = InfoHash::from_magnet(&row.magnet)?;
    Some(Candidate::Torrent(TorrentCandidate {
        languages: detect_languages(&row.name),
        size: row.size,
        seeders: None,
        tracker: "BTDigg".to_string(),
        info_hash: Some(info_hash),
        magnet: reqwest::Url::parse(&row.magnet).ok(),
        source: SourceMeta {
            file_count: row.file_count,
            detail_url: None,
        },
        title: row.name,
    }))
}

#[async_trait]
impl Scraper for BtDigg {
    fn name(&self) -> &'static str {
        "btdigg"
    }

    async fn search(&self, query: &SearchQuery, ctx: &SearchContext) -> Vec<Candidate> {
        let Some(base) = base_url(ctx, self.name(), DEFAULT_URL) else {
            return Vec::new();
        };
        let settings = ctx.config.scraper(self.name());
        let max_pages = settings.max_pages.unwrap_or(DEFAULT_MAX_PAGES).max(1);
        let limit = settings.limit.unwrap_or(50);

        // SOCKS proxy rotation when the matrix routes scrapers through one;
        // the legacy url-wrapping proxy cannot carry a cookie session.
        let proxy = ctx
            .config
            .proxy_url
            .as_deref()
            .filter(|url| ctx.config.proxy_applies_to("scrapers") && !url.contains("{url}"));
        let session = match Session::new(proxy) {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("BTDigg session construction failed: {e}");
                return Vec::new();
            }
        };

        let mut out: Vec<Candidate> = Vec::new();
        'pages: for page in 0..max_pages {
            if page > 0 {
                // Inter-request jitter, plus the longer pause between page
                // pairs. Makes the session look less like a crawler.
                let jitter = Duration::from_millis(rand::rng().random_range(300..900));
                let delay = if page % PAGE_BATCH == 0 {
                    BATCH_DELAY + jitter
                } else {
                    jitter
                };
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => break 'pages,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            let mut url = base.clone();
            url.set_path("/search");
            url.query_pairs_mut()
                .append_pair("q", &query.text)
                .append_pair("p", &page.to_string())
                .append_pair("order", "0");
            let body = match session
                .get_text(url, Some(&base), &ctx.cancel, ctx.call_timeout())
                .await
            {
                Ok(body) => body,
                Err(e) => {
                    if !e.is_canceled() {
                        super::skip_item(self.name(), &e);
                    }
                    break;
                }
            };
            let Some(rows) = parse_page(&body) else {
                tracing::warn!("BTDigg served a bot challenge, backing off");
                break;
            };
            if rows.is_empty() {
                break;
            }
            out.extend(rows.into_iter().filter_map(map_row));
            if out.len() >= limit {
                break;
            }
        }
        out.truncate(limit);
        finalize(out, ctx)
    }
}
