use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use crate::filtering::detect_languages;
use crate::model::{parse_size, Candidate, HttpStreamCandidate, Quality};
use crate::query::SearchQuery;
use crate::resolver::Resolver;
use crate::token::SidPayload;

use super::{base_url, finalize, title_matches, Scraper, SearchContext};

const DEFAULT_URL: &str = "https://uhdmovies.email";
/// Eager resolution is expensive; bound how many links get walked.
const EAGER_RESOLVE_CAP: usize = 3;

static ARTICLE_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<article[^>]*>.*?<a[^>]+href="([^"]+)"[^>]*(?:title="([^"]*)")?[^>]*>(.*?)</a>"#)
        .expect("article link pattern")
});
static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<(?:h[1-6]|p|strong)[^>]*>([^<]*(?:2160p|1080p|720p|480p|4k)[^<]*)<")
        .expect("section pattern")
});
static ANCHOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<a[^>]+href="([^"]+)"[^>]*>(.*?)</a>"#).expect("anchor pattern")
});
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("tag pattern"));
static EPISODE_TEXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bepisode\s*0*(\d{1,3})\b|\be0*(\d{1,3})\b").expect("episode"));

/// A download link with the quality section heading it sits under.
#[derive(Debug, PartialEq)]
pub(crate) struct SectionedLink {
    pub section: Option<String>,
    pub href: String,
    pub anchor_text: String,
}

/// Associate each matching anchor with the closest preceding quality
/// heading, by byte offset. The pages are too irregular for a structural
/// walk; offsets are what actually stays stable.
pub(crate) fn sectioned_links(
    html: &str,
    is_target: impl Fn(&str) -> bool,
) -> Vec<SectionedLink> {
    let sections: Vec<(usize, String)> = SECTION_RE
        .captures_iter(html)
        .filter_map(|caps| {
            let m = caps.get(1)?;
            Some((m.start(), m.as_str().trim().to_string()))
        })
        .collect();
    let mut out = Vec::new();
    for caps in ANCHOR_RE.captures_iter(html) {
        let (Some(href), Some(inner)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        if !is_target(href.as_str()) {
            continue;
        }
        let section = sections
            .iter()
            .take_while(|(offset, _)| *offset < href.start())
            .last()
            .map(|(_, label)| label.clone());
        out.push(SectionedLink {
            section,
            href: href.as_str().to_string(),
            anchor_text: TAG_RE.replace_all(inner.as_str(), " ").trim().to_string(),
        });
    }
    out
}

fn is_sid_href(href: &str) -> bool {
    href.contains("unblockedgames")
        || href.contains("sid=")
        || href.contains("driveleech")
        || href.contains("tech.examzculture")
}

fn anchor_episode(text: &str) -> Option<u16> {
    let caps = EPISODE_TEXT_RE.captures(text)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .and_then(|m| m.as_str().parse().ok())
}

/// UHDMovies: search page, movie page with per-quality download sections,
/// each link an anti-bot SID url. Default mode emits previews carrying
/// the SID url as an opaque token; eager mode walks the chain at search
/// time.
pub struct UhdMovies;

impl UhdMovies {
    fn pick_movie_page(html: &str, base: &reqwest::Url, query: &SearchQuery) -> Option<reqwest::Url> {
        for caps in ARTICLE_LINK_RE.captures_iter(html) {
            let href = caps.get(1)?.as_str();
            let text = caps
                .get(2)
                .map(|m| m.as_str().to_string())
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| {
                    TAG_RE
                        .replace_all(caps.get(3).map(|m| m.as_str()).unwrap_or(""), " ")
                        .trim()
                        .to_string()
                });
            if title_matches(&text, &query.title, query.year)
                || title_matches(&text, &query.title, None)
            {
                return base.join(href).ok();
            }
        }
        None
    }

    fn candidates_from_page(
        html: &str,
        page_url: &reqwest::Url,
        query: &SearchQuery,
    ) -> Vec<(SectionedLink, HttpStreamCandidate)> {
        let links = sectioned_links(html, is_sid_href);
        let mut out = Vec::new();
        for link in links {
            if let Some(episode) = query.media.episode {
                match anchor_episode(&link.anchor_text) {
                    Some(linked) if linked != episode => continue,
                    // Links without an episode marker are season-level
                    // archives; keep them.
                    _ => {}
                }
            }
            let Ok(sid_url) = page_url.join(&link.href) else {
                continue;
            };
            let section = link
                .section
                .clone()
                .unwrap_or_else(|| query.title.clone());
            let display_name = match query.episode_tag() {
                Some(tag) if !section.to_lowercase().contains("e0") => {
                    format!("{section} {tag}")
                }
                _ => section.clone(),
            };
            let size_bytes = parse_size_in(&section);
            let payload = SidPayload {
                sid_url: sid_url.to_string(),
            };
            let candidate = HttpStreamCandidate {
                quality: Quality::from_title(&section),
                size_text: size_bytes.map(crate::model::format_size).unwrap_or_default(),
                size_bytes,
                provider: "uhdmovies".to_string(),
                languages: detect_languages(&section),
                payload: serde_json::to_value(&payload).ok(),
                direct_url: None,
                needs_resolution: true,
                display_name,
            };
            out.push((link, candidate));
        }
        out
    }
}

/// First size-looking token inside a section heading.
fn parse_size_in(text: &str) -> Option<u64> {
    static SIZE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)[\[(]?\s*([\d.]+\s*[KMGT]B)\s*[\])]?").expect("size in text")
    });
    SIZE_RE
        .captures(text)
        .and_then(|caps| parse_size(caps[1].trim()))
}

#[async_trait]
impl Scraper for UhdMovies {
    fn name(&self) -> &'static str {
        "uhdmovies"
    }

    async fn search(&self, query: &SearchQuery, ctx: &SearchContext) -> Vec<Candidate> {
        let Some(base) = base_url(ctx, self.name(), DEFAULT_URL) else {
            return Vec::new();
        };
        let limit = ctx.config.scraper(self.name()).limit.unwrap_or(12);

        // Search listing -> the movie/show page.
        let mut page = None;
        for text in query.texts() {
            let mut url = base.clone();
            url.set_path("/search");
            url.query_pairs_mut().append_pair("s", text);
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
            page = Self::pick_movie_page(&body, &base, query);
            if page.is_some() {
                break;
            }
        }
        let Some(page_url) = page else {
            return Vec::new();
        };

        let html = match ctx
            .fetch
            .get(page_url.clone())
            .timeout(ctx.call_timeout())
            .text(&ctx.cancel)
            .await
        {
            Ok(html) => html,
            Err(e) => {
                if !e.is_canceled() {
                    super::skip_item(self.name(), &e);
                }
                return Vec::new();
            }
        };

        let mut found = Self::candidates_from_page(&html, &page_url, query);
        found.truncate(limit);

        if !ctx.config.disable_http_stream_lazy_load {
            let out = found
                .into_iter()
                .map(|(_, candidate)| Candidate::HttpStream(candidate))
                .collect();
            return finalize(out, ctx);
        }

        // Eager mode: run the full chain now and emit direct urls.
        let resolver = Resolver::new(ctx.config.clone(), ctx.fetch.clone(), None);
        let mut out = Vec::new();
        for (link, mut candidate) in found.into_iter().take(EAGER_RESOLVE_CAP) {
            let Ok(sid_url) = page_url.join(&link.href) else {
                continue;
            };
            match resolver
                .resolve_sid_chain(sid_url.as_str(), &ctx.cancel)
                .await
            {
                Ok(Some(direct)) => {
                    candidate.direct_url = Some(direct);
                    candidate.needs_resolution = false;
                    candidate.payload = None;
                    out.push(Candidate::HttpStream(candidate));
                }
                Ok(None) => {
                    tracing::debug!(sid = sid_url.as_str(), "Eager resolution found no stream");
                }
                Err(e) => {
                    if e.is_canceled() {
                        break;
                    }
                    super::skip_item(self.name(), &e);
                }
            }
        }
        finalize(out, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MediaMeta;
    use crate::model::{ContentType, MediaRequest};
    use crate::query::build_query;

    const MOVIE_PAGE: &str = r#"
      <h3>Download The Matrix (1999) 4K 2160p HDR [12.4 GB]</h3>
      <p><a href="https://unblockedgames.example/?sid=abc111">Download Now</a></p>
      <h3>Download The Matrix (1999) 1080p BluRay [4.2 GB]</h3>
      <p><a href="https://unblockedgames.example/?sid=abc222">Download Now</a></p>
      <p><a href="https://somewhere.example/unrelated">Trailer</a></p>
    "#;

    fn movie_query() -> SearchQuery {
        build_query(
            &MediaMeta {
                name: "The Matrix".to_string(),
                year: Some(1999),
            },
            &MediaRequest::parse(ContentType::Movie, "tt0133093").unwrap(),
        )
    }

    #[test]
    fn sections_attach_to_links() {
        let links = sectioned_links(MOVIE_PAGE, is_sid_href);
        assert_eq!(links.len(), 2);
        assert!(links[0].section.as_deref().unwrap().contains("2160p"));
        assert!(links[1].section.as_deref().unwrap().contains("1080p"));
    }

    #[test]
    fn page_maps_to_preview_candidates() {
        let page_url = reqwest::Url::parse("https://uhdmovies.email/movie/matrix").unwrap();
        let found = UhdMovies::candidates_from_page(MOVIE_PAGE, &page_url, &movie_query());
        assert_eq!(found.len(), 2);
        let (_, first) = &found[0];
        assert_eq!(first.quality, Quality::FourK);
        assert_eq!(first.provider, "uhdmovies");
        assert!(first.needs_resolution);
        assert!(first.size_bytes.unwrap() > 12 * 1024 * 1024 * 1024);
        let payload: SidPayload =
            serde_json::from_value(first.payload.clone().unwrap()).unwrap();
        assert!(payload.sid_url.contains("sid=abc111"));
    }

    #[test]
    fn episode_links_filter_by_request() {
        let page = r#"
          <h3>Breaking Bad S01 1080p [2.1 GB]</h3>
          <p><a href="https://unblockedgames.example/?sid=e1">Episode 1</a></p>
          <p><a href="https://unblockedgames.example/?sid=e3">Episode 3</a></p>
          <p><a href="https://unblockedgames.example/?sid=zip">Season Zip</a></p>
        "#;
        let query = build_query(
            &MediaMeta {
                name: "Breaking Bad".to_string(),
                year: Some(2008),
            },
            &MediaRequest::parse(ContentType::Series, "tt0903747:1:3").unwrap(),
        );
        let page_url = reqwest::Url::parse("https://uhdmovies.email/show/bb").unwrap();
        let found = UhdMovies::candidates_from_page(page, &page_url, &query);
        let sids: Vec<String> = found
            .iter()
            .map(|(link, _)| link.href.clone())
            .collect();
        assert_eq!(sids.len(), 2);
        assert!(sids[0].contains("sid=e3"));
        assert!(sids[1].contains("sid=zip"));
    }

    #[test]
    fn search_listing_pick() {
        let listing = r#"
          <article><a href="/movie/the-matrix-1999" title="The Matrix (1999)">The Matrix (1999)</a></article>
          <article><a href="/movie/other" title="Other Film (2020)">Other Film (2020)</a></article>
        "#;
        let base = reqwest::Url::parse("https://uhdmovies.email").unwrap();
        let picked = UhdMovies::pick_movie_page(listing, &base, &movie_query()).unwrap();
        assert!(picked.as_str().contains("the-matrix-1999"));
    }
}
