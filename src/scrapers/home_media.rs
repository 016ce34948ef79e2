use std::collections::BTreeSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

use crate::filtering::{detect_languages, tokenize_title};
use crate::model::{format_size, Candidate, HttpStreamCandidate, Quality};
use crate::query::SearchQuery;

use super::{finalize, Scraper, SearchContext};

/// Minimum word overlap between the wanted title and a library entry.
const MOVIE_OVERLAP: f64 = 0.6;
const SERIES_OVERLAP: f64 = 0.4;

static EPISODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bs(\d{1,2})\s*[ex]\s*(\d{1,3})\b|\b(\d{1,2})x(\d{1,3})\b")
        .expect("episode pattern")
});

/// The user's own media server: `GET /api/list`, streamed back directly by
/// flat path. Results need no resolution and skip the debrid machinery.
pub struct HomeMedia;

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    files: Vec<ListedFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListedFile {
    name: String,
    #[serde(default)]
    folder_name: Option<String>,
    #[serde(default)]
    flat_path: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default = "default_true")]
    is_complete: bool,
}

fn default_true() -> bool {
    true
}

fn word_overlap(wanted: &[String], candidate_tokens: &BTreeSet<String>) -> f64 {
    if wanted.is_empty() {
        return 0.0;
    }
    let hits = wanted
        .iter()
        .filter(|word| candidate_tokens.contains(*word))
        .count();
    hits as f64 / wanted.len() as f64
}

fn extract_year(tokens: &BTreeSet<String>) -> Option<u16> {
    tokens
        .iter()
        .filter_map(|token| {
            if token.len() == 4 {
                token.parse::<u16>().ok()
            } else {
                None
            }
        })
        .find(|year| (1900..2100).contains(year))
}

pub(crate) fn extract_episode(name: &str) -> Option<(u16, u16)> {
    let caps = EPISODE_RE.captures(name)?;
    let get = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u16>().ok());
    match (get(1), get(2)) {
        (Some(season), Some(episode)) => Some((season, episode)),
        _ => match (get(3), get(4)) {
            (Some(season), Some(episode)) => Some((season, episode)),
            _ => None,
        },
    }
}

/// Movie rule: enough of the title present, year within one.
/// Series rule: exact season/episode plus a looser title overlap.
fn file_matches(file: &ListedFile, query: &SearchQuery) -> bool {
    let full_name = match &file.folder_name {
        Some(folder) => format!("{folder} {}", file.name),
        None => file.name.clone(),
    };
    let tokens: BTreeSet<String> = tokenize_title(&full_name).into_iter().collect();
    let wanted = tokenize_title(&query.title);
    match (query.media.season, query.media.episode) {
        (Some(season), Some(episode)) => {
            if extract_episode(&full_name) != Some((season, episode)) {
                return false;
            }
            word_overlap(&wanted, &tokens) >= SERIES_OVERLAP
        }
        _ => {
            if word_overlap(&wanted, &tokens) < MOVIE_OVERLAP {
                return false;
            }
            match (query.year, extract_year(&tokens)) {
                (Some(wanted_year), Some(file_year)) => {
                    wanted_year.abs_diff(file_year) <= 1
                }
                // Year unknown on either side: accept on title alone.
                _ => true,
            }
        }
    }
}

#[async_trait]
impl Scraper for HomeMedia {
    fn name(&self) -> &'static str {
        "home_media"
    }

    async fn search(&self, query: &SearchQuery, ctx: &SearchContext) -> Vec<Candidate> {
        let Some(server) = ctx.config.home_media.clone() else {
            return Vec::new();
        };
        let Ok(base) = reqwest::Url::parse(&server.url) else {
            tracing::warn!(url = server.url, "Bad home media server url");
            return Vec::new();
        };

        let mut url = base.clone();
        url.set_path("/api/list");
        let mut request = ctx.fetch.get(url).timeout(ctx.call_timeout());
        if let Some(key) = &server.api_key {
            request = request.header("x-api-key", key);
        }
        let listing: ListResponse = match request.json_response(&ctx.cancel).await {
            Ok(listing) => listing,
            Err(e) => {
                if !e.is_canceled() {
                    super::skip_item(self.name(), &e);
                }
                return Vec::new();
            }
        };

        let out: Vec<Candidate> = listing
            .files
            .into_iter()
            .filter(|file| file.is_complete && file_matches(file, query))
            .filter_map(|file| {
                let flat_path = file.flat_path?;
                let mut direct = base.join(&flat_path).ok()?;
                if let Some(key) = &server.api_key {
                    direct.query_pairs_mut().append_pair("key", key);
                }
                let size_bytes = file.size;
                Some(Candidate::HttpStream(HttpStreamCandidate {
                    quality: Quality::from_title(&file.name),
                    size_text: size_bytes.map(format_size).unwrap_or_default(),
                    size_bytes,
                    provider: "home-media".to_string(),
                    languages: detect_languages(&file.name),
                    payload: None,
                    direct_url: Some(direct),
                    needs_resolution: false,
                    display_name: file.name,
                }))
            })
            .collect();
        finalize(out, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MediaMeta;
    use crate::model::{ContentType, MediaRequest};
    use crate::query::build_query;

    fn movie_query() -> SearchQuery {
        build_query(
            &MediaMeta {
                name: "The Matrix".to_string(),
                year: Some(1999),
            },
            &MediaRequest::parse(ContentType::Movie, "tt0133093").unwrap(),
        )
    }

    fn episode_query() -> SearchQuery {
        build_query(
            &MediaMeta {
                name: "Breaking Bad".to_string(),
                year: Some(2008),
            },
            &MediaRequest::parse(ContentType::Series, "tt0903747:1:3").unwrap(),
        )
    }

    fn file(name: &str, folder: Option<&str>) -> ListedFile {
        ListedFile {
            name: name.to_string(),
            folder_name: folder.map(str::to_string),
            flat_path: Some("flat/x.mkv".to_string()),
            size: Some(1024),
            is_complete: true,
        }
    }

    #[test]
    fn movie_matching_thresholds() {
        let query = movie_query();
        assert!(file_matches(&file("The.Matrix.1999.1080p.mkv", None), &query));
        // Year off by one is tolerated.
        assert!(file_matches(&file("The.Matrix.2000.1080p.mkv", None), &query));
        assert!(!file_matches(&file("The.Matrix.2003.1080p.mkv", None), &query));
        // 50% overlap is under the 60% bar.
        assert!(!file_matches(&file("Matrix.Stuff.1999.mkv", None), &query));
        // Folder name contributes tokens.
        assert!(file_matches(
            &file("movie.1999.mkv", Some("The Matrix (1999)")),
            &query
        ));
    }

    #[test]
    fn series_needs_exact_episode() {
        let query = episode_query();
        assert!(file_matches(
            &file("Breaking.Bad.S01E03.720p.mkv", None),
            &query
        ));
        assert!(file_matches(&file("breaking bad 1x03.mkv", None), &query));
        assert!(!file_matches(
            &file("Breaking.Bad.S01E04.720p.mkv", None),
            &query
        ));
        // Right episode, wrong show.
        assert!(!file_matches(&file("Other.Show.S01E03.mkv", None), &query));
    }

    #[test]
    fn episode_extraction() {
        assert_eq!(extract_episode("Foo.S02E05.mkv"), Some((2, 5)));
        assert_eq!(extract_episode("Foo 2x05"), Some((2, 5)));
        assert_eq!(extract_episode("Foo.2005.mkv"), None);
    }
}
