use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use crate::filtering::detect_languages;
use crate::model::{format_size, parse_size, Candidate, HttpStreamCandidate, Quality};
use crate::query::SearchQuery;
use crate::resolver::Resolver;
use crate::token::SidPayload;

use super::uhdmovies::sectioned_links;
use super::{base_url, finalize, title_matches, Scraper, SearchContext};

const DEFAULT_URL: &str = "https://moviesdrive.world";
const EAGER_RESOLVE_CAP: usize = 3;

static POST_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<a[^>]+href="([^"]+)"[^>]+title="([^"]+)""#).expect("post link pattern")
});
static SIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)([\d.]+\s*[KMGT]B)").expect("size pattern"));

fn is_hoster_href(href: &str) -> bool {
    href.contains("hubcloud")
        || href.contains("gdflix")
        || href.contains("mdrive")
        || href.contains("sid=")
        || href.contains("unblockedgames")
}

/// MoviesDrive: same two-stage shape as UHDMovies with hoster pages
/// instead of a single drive host. Emits previews around the hoster url;
/// the resolver walks whatever chain sits behind it.
pub struct MoviesDrive;

impl MoviesDrive {
    fn pick_post(html: &str, base: &reqwest::Url, query: &SearchQuery) -> Option<reqwest::Url> {
        for caps in POST_LINK_RE.captures_iter(html) {
            let href = caps.get(1)?.as_str();
            let title = caps.get(2)?.as_str();
            if title_matches(title, &query.title, query.year)
                || title_matches(title, &query.title, None)
            {
                return base.join(href).ok();
            }
        }
        None
    }
}

#[async_trait]
impl Scraper for MoviesDrive {
    fn name(&self) -> &'static str {
        "moviesdrive"
    }

    async fn search(&self, query: &SearchQuery, ctx: &SearchContext) -> Vec<Candidate> {
        let Some(base) = base_url(ctx, self.name(), DEFAULT_URL) else {
            return Vec::new();
        };
        let limit = ctx.config.scraper(self.name()).limit.unwrap_or(12);

        let mut post = None;
        for text in query.texts() {
            let mut url = base.clone();
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
            post = Self::pick_post(&body, &base, query);
            if post.is_some() {
                break;
            }
        }
        let Some(post_url) = post else {
            return Vec::new();
        };

        let html = match ctx
            .fetch
            .get(post_url.clone())
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

        let eager = ctx.config.disable_http_stream_lazy_load;
        let resolver = eager
            .then(|| Resolver::new(ctx.config.clone(), ctx.fetch.clone(), None));

        let mut out = Vec::new();
        for link in sectioned_links(&html, is_hoster_href) {
            if out.len() >= limit {
                break;
            }
            let Ok(hoster_url) = post_url.join(&link.href) else {
                continue;
            };
            let section = link.section.unwrap_or_else(|| query.title.clone());
            let size_bytes = SIZE_RE
                .captures(&section)
                .and_then(|caps| parse_size(caps[1].trim()));
            let mut candidate = HttpStreamCandidate {
                quality: Quality::from_title(&section),
                size_text: size_bytes.map(format_size).unwrap_or_default(),
                size_bytes,
                provider: "moviesdrive".to_string(),
                languages: detect_languages(&section),
                payload: serde_json::to_value(&SidPayload {
                    sid_url: hoster_url.to_string(),
                })
                .ok(),
                direct_url: None,
                needs_resolution: true,
                display_name: section,
            };
            match &resolver {
                None => out.push(Candidate::HttpStream(candidate)),
                Some(resolver) => {
                    if out.len() >= EAGER_RESOLVE_CAP {
                        break;
                    }
                    match resolver
                        .resolve_sid_chain(hoster_url.as_str(), &ctx.cancel)
                        .await
                    {
                        Ok(Some(direct)) => {
                            candidate.direct_url = Some(direct);
                            candidate.needs_resolution = false;
                            candidate.payload = None;
                            out.push(Candidate::HttpStream(candidate));
                        }
                        Ok(None) => {}
                        Err(e) => {
                            if e.is_canceled() {
                                break;
                            }
                            super::skip_item(self.name(), &e);
                        }
                    }
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

    #[test]
    fn picks_matching_post() {
        let html = r#"
          <a href="https://moviesdrive.world/the-matrix-1999/" title="The Matrix (1999) 1080p 2160p">poster</a>
          <a href="https://moviesdrive.world/other/" title="Unrelated (2021)">poster</a>
        "#;
        let base = reqwest::Url::parse(DEFAULT_URL).unwrap();
        let query = build_query(
            &MediaMeta {
                name: "The Matrix".to_string(),
                year: Some(1999),
            },
            &MediaRequest::parse(ContentType::Movie, "tt0133093").unwrap(),
        );
        let picked = MoviesDrive::pick_post(html, &base, &query).unwrap();
        assert!(picked.as_str().contains("the-matrix-1999"));
    }

    #[test]
    fn hoster_hrefs_are_detected() {
        assert!(is_hoster_href("https://hubcloud.example/drive/x"));
        assert!(is_hoster_href("https://tech.example/?sid=9"));
        assert!(!is_hoster_href("https://moviesdrive.world/about"));
    }
}
