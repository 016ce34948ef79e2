use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

use crate::error::Error;
use crate::filtering::detect_languages;
use crate::model::{parse_size, Candidate, HttpStreamCandidate, Quality};
use crate::query::SearchQuery;
use crate::token::EasynewsPayload;

use super::{base_url, finalize, title_matches, Scraper, SearchContext};

const DEFAULT_URL: &str = "https://members.easynews.com";
/// Clips shorter than this are samples or spam.
const MIN_DURATION_SECS: u64 = 300;

/// Usenet spam heuristics: bare hash-blob subjects and sample files.
static JUNK_SUBJECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:[a-f0-9]{16,}|.*\bsample\b.*)$").expect("junk subject pattern")
});

static DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:(\d+)h)?\s*(?:(\d+)m)?\s*(?:(\d+)s)?").expect("duration"));

/// Easynews global search. Authenticated; 401 is the one scraper failure
/// that surfaces to the user instead of degrading silently.
pub struct Easynews;

#[derive(Debug, Deserialize)]
struct EasynewsResponse {
    #[serde(default)]
    data: Vec<EasynewsItem>,
    #[serde(default, rename = "downURL")]
    down_url: Option<String>,
    #[serde(default, rename = "dlFarm")]
    dl_farm: Option<String>,
    #[serde(default, rename = "dlPort")]
    dl_port: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct EasynewsItem {
    /// Post hash.
    #[serde(default, rename = "0")]
    hash: Option<String>,
    /// File extension with the dot.
    #[serde(default, rename = "2")]
    ext: Option<String>,
    /// Display size, e.g. "1.2 GB".
    #[serde(default, rename = "4")]
    size_text: Option<String>,
    /// Subject line.
    #[serde(default, rename = "10")]
    subject: Option<String>,
    /// Runtime like "1h 52m".
    #[serde(default, rename = "14")]
    duration: Option<String>,
    #[serde(default, rename = "rawSize")]
    raw_size: Option<u64>,
    #[serde(default)]
    passwd: bool,
    #[serde(default)]
    virus: bool,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

fn duration_secs(raw: &str) -> u64 {
    let Some(caps) = DURATION_RE.captures(raw) else {
        return 0;
    };
    let part = |i: usize| {
        caps.get(i)
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .unwrap_or(0)
    };
    part(1) * 3600 + part(2) * 60 + part(3)
}

impl Easynews {
    fn map_item(
        item: EasynewsItem,
        response_meta: (&str, &str, &str),
        username: &str,
        password: &str,
        query: &SearchQuery,
    ) -> Option<Candidate> {
        let (down_url, dl_farm, dl_port) = response_meta;
        let hash = item.hash?;
        let subject = item.subject?;
        if item.passwd || item.virus {
            return None;
        }
        if item.kind.as_deref().is_some_and(|k| !k.eq_ignore_ascii_case("video")) {
            return None;
        }
        if JUNK_SUBJECT_RE.is_match(&subject) {
            return None;
        }
        if let Some(duration) = &item.duration {
            let secs = duration_secs(duration);
            if secs > 0 && secs < MIN_DURATION_SECS {
                return None;
            }
        }
        // Easynews full-text search is loose; hold results to the title.
        if query.media.season.is_none() && !title_matches(&subject, &query.title, None) {
            return None;
        }
        let ext = item.ext.unwrap_or_else(|| ".mkv".to_string());
        let payload = EasynewsPayload {
            username: username.to_string(),
            password: password.to_string(),
            dl_farm: dl_farm.to_string(),
            dl_port: dl_port.to_string(),
            post_hash: hash,
            ext,
            post_title: subject.clone(),
            down_url: down_url.to_string(),
        };
        let size_bytes = item
            .raw_size
            .or_else(|| item.size_text.as_deref().and_then(parse_size));
        Some(Candidate::HttpStream(HttpStreamCandidate {
            quality: Quality::from_title(&subject),
            size_text: item.size_text.unwrap_or_default(),
            size_bytes,
            provider: "easynews".to_string(),
            languages: detect_languages(&subject),
            payload: serde_json::to_value(&payload).ok(),
            direct_url: None,
            needs_resolution: true,
            display_name: subject,
        }))
    }
}

#[async_trait]
impl Scraper for Easynews {
    fn name(&self) -> &'static str {
        "easynews"
    }

    async fn search(&self, query: &SearchQuery, ctx: &SearchContext) -> Vec<Candidate> {
        let Some(auth) = ctx.config.easynews.clone() else {
            return Vec::new();
        };
        let Some(base) = base_url(ctx, self.name(), DEFAULT_URL) else {
            return Vec::new();
        };
        let limit = ctx.config.scraper(self.name()).limit.unwrap_or(50);

        let mut url = base;
        url.set_path("/2.0/search/solr-search/advanced");
        url.query_pairs_mut()
            .append_pair("st", "adv")
            .append_pair("sb", "1")
            .append_pair("fty[]", "VIDEO")
            .append_pair("spamf", "1")
            .append_pair("u", "1")
            .append_pair("gx", "1")
            .append_pair("pno", "1")
            .append_pair("sS", "3")
            .append_pair("gps", &query.text);

        let response: EasynewsResponse = match ctx
            .fetch
            .get(url)
            .basic_auth(&auth.username, Some(auth.password.as_str()))
            .timeout(ctx.call_timeout())
            .json_response(&ctx.cancel)
            .await
        {
            Ok(response) => response,
            Err(Error::UpstreamRejected { status: 401 }) => {
                tracing::error!("Easynews rejected the configured credentials");
                ctx.report_error(Error::Credentials {
                    service: "easynews",
                });
                return Vec::new();
            }
            Err(e) => {
                if !e.is_canceled() {
                    super::skip_item(self.name(), &e);
                }
                return Vec::new();
            }
        };

        let down_url = response
            .down_url
            .unwrap_or_else(|| "https://members.easynews.com/dl".to_string());
        let dl_farm = response.dl_farm.unwrap_or_else(|| "auto".to_string());
        let dl_port = response
            .dl_port
            .as_ref()
            .and_then(super::lenient_u64)
            .map(|p| p.to_string())
            .unwrap_or_else(|| "443".to_string());

        let mut out: Vec<Candidate> = response
            .data
            .into_iter()
            .filter_map(|item| {
                Self::map_item(
                    item,
                    (&down_url, &dl_farm, &dl_port),
                    &auth.username,
                    &auth.password,
                    query,
                )
            })
            .collect();
        out.truncate(limit);
        finalize(out, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContentType, MediaRequest};

    fn query() -> SearchQuery {
        crate::query::build_query(
            &crate::metadata::MediaMeta {
                name: "The Matrix".to_string(),
                year: Some(1999),
            },
            &MediaRequest::parse(ContentType::Movie, "tt0133093").unwrap(),
        )
    }

    fn item(raw: serde_json::Value) -> EasynewsItem {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn maps_video_post() {
        let candidate = Easynews::map_item(
            item(serde_json::json!({
                "0": "abcdef123456",
                "2": ".mkv",
                "4": "8.2 GB",
                "10": "The.Matrix.1999.1080p.BluRay",
                "14": "2h 16m",
                "rawSize": 8804682956u64,
                "type": "VIDEO"
            })),
            ("https://members.easynews.example/dl", "farm1", "443"),
            "user",
            "pass",
            &query(),
        )
        .unwrap();
        match candidate {
            Candidate::HttpStream(h) => {
                assert_eq!(h.provider, "easynews");
                assert!(h.needs_resolution);
                assert_eq!(h.quality, Quality::P1080);
                let payload: EasynewsPayload =
                    serde_json::from_value(h.payload.unwrap()).unwrap();
                assert_eq!(payload.post_hash, "abcdef123456");
                assert_eq!(payload.dl_farm, "farm1");
            }
            rest => panic!("unexpected variant: {rest:?}"),
        }
    }

    #[test]
    fn drops_flagged_and_junk_posts() {
        let meta = ("https://dl", "auto", "443");
        let q = query();
        let passworded = item(serde_json::json!({
            "0": "h1", "10": "The.Matrix.1999.1080p", "passwd": true
        }));
        assert!(Easynews::map_item(passworded, meta, "u", "p", &q).is_none());

        let hex_blob = item(serde_json::json!({
            "0": "h2", "10": "deadbeefdeadbeefdeadbeef"
        }));
        assert!(Easynews::map_item(hex_blob, meta, "u", "p", &q).is_none());

        let sample = item(serde_json::json!({
            "0": "h3", "10": "The.Matrix.1999.sample.mkv"
        }));
        assert!(Easynews::map_item(sample, meta, "u", "p", &q).is_none());

        let short_clip = item(serde_json::json!({
            "0": "h4", "10": "The.Matrix.1999.1080p", "14": "2m 30s"
        }));
        assert!(Easynews::map_item(short_clip, meta, "u", "p", &q).is_none());

        let wrong_title = item(serde_json::json!({
            "0": "h5", "10": "Completely.Different.Movie.1080p"
        }));
        assert!(Easynews::map_item(wrong_title, meta, "u", "p", &q).is_none());
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(duration_secs("2h 16m"), 8160);
        assert_eq!(duration_secs("3m 5s"), 185);
        assert_eq!(duration_secs(""), 0);
    }
}
