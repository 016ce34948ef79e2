use std::sync::LazyLock;

use regex::Regex;

use crate::metadata::MediaMeta;
use crate::model::{ContentType, MediaRequest};

/// The query handed to every scraper: a primary text plus fallbacks tried
/// by adapters whose first search comes back empty. Adapters that address
/// their upstream by id (stream addons) use `media` directly.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub text: String,
    pub fallbacks: Vec<String>,
    pub title: String,
    pub year: Option<u16>,
    pub media: MediaRequest,
}

impl SearchQuery {
    /// Primary plus fallbacks, deduplicated, in try-order.
    pub fn texts(&self) -> Vec<&str> {
        let mut out = vec![self.text.as_str()];
        for fallback in &self.fallbacks {
            if !out.contains(&fallback.as_str()) {
                out.push(fallback);
            }
        }
        out
    }

    pub fn episode_tag(&self) -> Option<String> {
        match (self.media.season, self.media.episode) {
            (Some(season), Some(episode)) => Some(format!("S{season:02}E{episode:02}")),
            _ => None,
        }
    }
}

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern"));

/// Strip characters that routinely break keyword searches and collapse
/// whitespace.
pub fn normalize_title(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| match c {
            '\'' | '’' | '"' => '\0',
            ':' | ',' | '!' | '?' | '(' | ')' | '[' | ']' | '&' => ' ',
            c => c,
        })
        .filter(|c| *c != '\0')
        .collect();
    WHITESPACE_RE
        .replace_all(cleaned.trim(), " ")
        .to_string()
}

/// `"The Matrix: Reloaded"` -> `"The Matrix"`. None when there is no
/// subtitle to strip.
fn strip_subtitle(title: &str) -> Option<String> {
    let (main, _) = title.split_once(':')?;
    let main = main.trim();
    (!main.is_empty()).then(|| main.to_string())
}

const DIGIT_WORDS: &[(&str, &str)] = &[
    ("1", "one"),
    ("2", "two"),
    ("3", "three"),
    ("4", "four"),
    ("5", "five"),
    ("6", "six"),
    ("7", "seven"),
    ("8", "eight"),
    ("9", "nine"),
];

/// Numeric franchises list both ways ("Ocean's 11" / "Ocean's Eleven" is
/// the exception that proves nothing is consistent). Swap standalone
/// digits with their words and vice versa.
fn swap_digit_words(title: &str) -> Option<String> {
    let mut changed = false;
    let swapped: Vec<String> = title
        .split_whitespace()
        .map(|word| {
            let lower = word.to_lowercase();
            for (digit, name) in DIGIT_WORDS {
                if word == *digit {
                    changed = true;
                    return name.to_string();
                }
                if lower == *name {
                    changed = true;
                    return digit.to_string();
                }
            }
            word.to_string()
        })
        .collect();
    changed.then(|| swapped.join(" "))
}

/// Build the per-request query with its fallback ladder.
pub fn build_query(meta: &MediaMeta, request: &MediaRequest) -> SearchQuery {
    let title = normalize_title(&meta.name);
    let mut fallbacks = Vec::new();

    let text = match request.content_type {
        ContentType::Movie => match meta.year {
            Some(year) => format!("{title} {year}"),
            None => title.clone(),
        },
        ContentType::Series => {
            let tag = match (request.season, request.episode) {
                (Some(season), Some(episode)) => format!("S{season:02}E{episode:02}"),
                _ => String::new(),
            };
            format!("{title} {tag}").trim().to_string()
        }
    };

    match request.content_type {
        ContentType::Movie => {
            if meta.year.is_some() {
                fallbacks.push(title.clone());
            }
            if let Some(main) = strip_subtitle(&meta.name) {
                let main = normalize_title(&main);
                if let Some(year) = meta.year {
                    fallbacks.push(format!("{main} {year}"));
                }
                fallbacks.push(main);
            }
            if let Some(swapped) = swap_digit_words(&title) {
                match meta.year {
                    Some(year) => fallbacks.push(format!("{swapped} {year}")),
                    None => fallbacks.push(swapped),
                }
            }
        }
        ContentType::Series => {
            if let (Some(season), Some(episode)) = (request.season, request.episode) {
                // Some indexers only list packs.
                fallbacks.push(format!("{title} S{season:02}"));
                fallbacks.push(format!("{title} {season}x{episode:02}"));
            }
            if let Some(main) = strip_subtitle(&meta.name) {
                let main = normalize_title(&main);
                if let (Some(season), Some(episode)) = (request.season, request.episode) {
                    fallbacks.push(format!("{main} S{season:02}E{episode:02}"));
                }
                fallbacks.push(main);
            }
        }
    }

    SearchQuery {
        text,
        fallbacks,
        title,
        year: meta.year,
        media: request.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str, year: Option<u16>) -> MediaMeta {
        MediaMeta {
            name: name.to_string(),
            year,
        }
    }

    fn movie(id: &str) -> MediaRequest {
        MediaRequest::parse(ContentType::Movie, id).unwrap()
    }

    fn episode(id: &str) -> MediaRequest {
        MediaRequest::parse(ContentType::Series, id).unwrap()
    }

    #[test]
    fn movie_query_is_name_year() {
        let query = build_query(&meta("The Matrix", Some(1999)), &movie("tt0133093"));
        assert_eq!(query.text, "The Matrix 1999");
        assert!(query.fallbacks.contains(&"The Matrix".to_string()));
    }

    #[test]
    fn episode_query_is_name_tag() {
        let query = build_query(&meta("Breaking Bad", Some(2008)), &episode("tt0903747:1:3"));
        assert_eq!(query.text, "Breaking Bad S01E03");
        assert_eq!(query.episode_tag().as_deref(), Some("S01E03"));
        assert!(query.fallbacks.contains(&"Breaking Bad S01".to_string()));
        assert!(query.fallbacks.contains(&"Breaking Bad 1x03".to_string()));
    }

    #[test]
    fn subtitle_fallback() {
        let query = build_query(
            &meta("Mad Max: Fury Road", Some(2015)),
            &movie("tt1392190"),
        );
        assert_eq!(query.text, "Mad Max Fury Road 2015");
        assert!(query.fallbacks.contains(&"Mad Max 2015".to_string()));
        assert!(query.fallbacks.contains(&"Mad Max".to_string()));
    }

    #[test]
    fn digit_word_fallback() {
        let query = build_query(&meta("Toy Story 3", Some(2010)), &movie("tt0435761"));
        assert!(query.fallbacks.contains(&"Toy Story three 2010".to_string()));

        let query = build_query(&meta("The Two Towers", Some(2002)), &movie("tt0167261"));
        assert!(query.fallbacks.contains(&"The 2 Towers 2002".to_string()));
    }

    #[test]
    fn normalization_drops_breaking_punctuation() {
        assert_eq!(normalize_title("Ocean's  Eleven"), "Oceans Eleven");
        assert_eq!(normalize_title("Mission: Impossible"), "Mission Impossible");
        assert_eq!(normalize_title("What If...?"), "What If...");
    }

    #[test]
    fn texts_dedupes() {
        let query = build_query(&meta("Heat", None), &movie("tt0113277"));
        let texts = query.texts();
        assert_eq!(texts[0], "Heat");
        let unique: std::collections::HashSet<_> = texts.iter().collect();
        assert_eq!(unique.len(), texts.len());
    }
}
