use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use regex::Regex;

use crate::model::{Candidate, InfoHash, Quality};

/// Whole-word tokens that mark a release as unwatchable junk.
const JUNK_TOKENS: &[&str] = &[
    "CAM", "HDCAM", "CAMRIP", "TS", "HDTS", "TELESYNC", "TC", "HDTC", "TELECINE", "SCR",
    "SCREENER", "DVDSCR", "BDSCR", "R5", "R6", "WORKPRINT", "WP", "HDRIP",
];

static JUNK_RE: LazyLock<Regex> = LazyLock::new(|| {
    let pattern = format!(r"(?i)\b(?:{})\b", JUNK_TOKENS.join("|"));
    Regex::new(&pattern).expect("junk pattern to compile")
});

/// Language code -> title tokens that betray it. Checked against the
/// normalized token set of a release name.
static LANGUAGE_TOKENS: LazyLock<Vec<(&'static str, Vec<&'static str>)>> = LazyLock::new(|| {
    vec![
        ("en", vec!["english", "eng"]),
        ("ru", vec!["russian", "rus"]),
        (
            "fr",
            vec!["french", "vostfr", "vff", "vfq", "vf2", "truefrench"],
        ),
        (
            "es",
            vec!["spanish", "espanol", "castellano", "latino", "esp"],
        ),
        ("de", vec!["german", "deutsch"]),
        ("it", vec!["italian", "ita"]),
        ("pt", vec!["portuguese", "dublado", "nacional", "legendado"]),
        ("pl", vec!["polish", "lektor"]),
        // Multi-audio releases carry at least one non-English track.
        ("multi", vec!["multi", "multilang", "dual"]),
    ]
});

/// Split a release name into lowercase tokens. `[].()_-` count as
/// separators.
pub fn tokenize_title(title: &str) -> Vec<String> {
    title
        .to_lowercase()
        .chars()
        .map(|c| match c {
            '[' | ']' | '.' | '(' | ')' | '_' | '-' => ' ',
            c => c,
        })
        .collect::<String>()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

pub fn is_junk_title(title: &str) -> bool {
    JUNK_RE.is_match(title)
}

/// Detect the language codes a release name advertises.
pub fn detect_languages(title: &str) -> BTreeSet<String> {
    let tokens: BTreeSet<String> = tokenize_title(title).into_iter().collect();
    let mut codes = BTreeSet::new();
    for (code, markers) in LANGUAGE_TOKENS.iter() {
        if markers.iter().any(|marker| tokens.contains(*marker)) {
            codes.insert(code.to_string());
        }
    }
    codes
}

fn is_foreign(code: &str) -> bool {
    code != "en"
}

/// Language filter given the user-selected codes.
///
/// Empty selection passes everything. An `{en}`-only selection drops any
/// title carrying a foreign token. A wider selection keeps titles matching
/// any selected foreign code, plus pure-English titles when `en` is
/// selected.
pub fn passes_language_filter(title: &str, selected: &[String]) -> bool {
    passes_language_set(&detect_languages(title), selected)
}

/// Same rules over an already-known language set, for sources that carry a
/// native language list instead of encoding it in the title.
pub fn passes_language_set(detected: &BTreeSet<String>, selected: &[String]) -> bool {
    if selected.is_empty() {
        return true;
    }
    let foreign_detected: Vec<&String> = detected.iter().filter(|c| is_foreign(c)).collect();
    let wants_english = selected.iter().any(|c| c == "en");
    let selected_foreign: Vec<&String> = selected.iter().filter(|c| is_foreign(c)).collect();

    if selected_foreign.is_empty() {
        // English only: any foreign marker disqualifies.
        return foreign_detected.is_empty();
    }
    // "multi" releases satisfy any selected foreign code.
    if foreign_detected
        .iter()
        .any(|code| *code == "multi" || selected_foreign.contains(code))
    {
        return true;
    }
    foreign_detected.is_empty() && wants_english
}

/// Group torrents by info hash keeping the largest size; ties keep the
/// highest seeders, then the first-seen record. Hashless HTTP streams are
/// grouped by `(provider, quality, size bucket)`.
pub fn dedup_candidates(candidates: Vec<Candidate>) -> Vec<Candidate> {
    #[derive(PartialEq, Eq, Hash)]
    enum Key {
        Hash(InfoHash),
        Stream(String, Quality, u64),
        Guid(String),
        Unkeyed(usize),
    }

    // 512 MiB buckets keep re-listed stream entries of the same rip together.
    const STREAM_SIZE_BUCKET: u64 = 512 * 1024 * 1024;

    let mut order: Vec<Key> = Vec::with_capacity(candidates.len());
    let mut best: HashMap<Key, Candidate> = HashMap::with_capacity(candidates.len());
    for (index, candidate) in candidates.into_iter().enumerate() {
        let key = match &candidate {
            Candidate::Torrent(t) => match &t.info_hash {
                Some(hash) => Key::Hash(hash.clone()),
                None => Key::Unkeyed(index),
            },
            Candidate::HttpStream(h) => Key::Stream(
                h.provider.clone(),
                h.quality,
                h.size_bytes.unwrap_or(0) / STREAM_SIZE_BUCKET,
            ),
            Candidate::Nzb(n) => Key::Guid(n.guid.clone()),
        };
        match best.get(&key) {
            None => {
                order.push(match &key {
                    Key::Hash(h) => Key::Hash(h.clone()),
                    Key::Stream(p, q, b) => Key::Stream(p.clone(), *q, *b),
                    Key::Guid(g) => Key::Guid(g.clone()),
                    Key::Unkeyed(i) => Key::Unkeyed(*i),
                });
                best.insert(key, candidate);
            }
            Some(current) => {
                let new_rank = (candidate.size_bytes(), candidate.seeders().unwrap_or(0));
                let current_rank = (current.size_bytes(), current.seeders().unwrap_or(0));
                if new_rank > current_rank {
                    best.insert(key, candidate);
                }
            }
        }
    }
    order
        .into_iter()
        .filter_map(|key| best.remove(&key))
        .collect()
}

static SEASON_RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bs(\d{1,2})\s*[-.]\s*s?(\d{1,2})\b").expect("season range pattern")
});
static SEASON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bs(\d{1,2})(?:e\d{1,3})?\b").expect("season pattern"));
static SEASON_WORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bseason\s+(\d{1,2})(?:\s*[-–]\s*(\d{1,2}))?\b").expect("season word pattern")
});

/// Ranking bonus for series releases.
///
/// Exact season match scores highest, a pack whose range covers the season
/// scores above unrelated titles, older seasons are penalized.
pub fn season_score(title: &str, requested: u16) -> i32 {
    const EXACT: i32 = 3;
    const COVERING: i32 = 2;
    const OLDER: i32 = -2;

    if let Some(caps) = SEASON_RANGE_RE.captures(title) {
        let start: u16 = caps[1].parse().unwrap_or(0);
        let end: u16 = caps[2].parse().unwrap_or(0);
        if start <= requested && requested <= end {
            return COVERING;
        }
        if end < requested {
            return OLDER;
        }
        return 0;
    }
    if let Some(caps) = SEASON_WORD_RE.captures(title) {
        let start: u16 = caps[1].parse().unwrap_or(0);
        let end: u16 = caps
            .get(2)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(start);
        if start == requested && end == requested {
            return EXACT;
        }
        if start <= requested && requested <= end {
            return COVERING;
        }
        if end < requested {
            return OLDER;
        }
        return 0;
    }
    if let Some(caps) = SEASON_RE.captures(title) {
        let season: u16 = caps[1].parse().unwrap_or(0);
        if season == requested {
            return EXACT;
        }
        if season < requested {
            return OLDER;
        }
        return 0;
    }
    if title.to_lowercase().contains("complete") {
        return COVERING;
    }
    0
}

/// Total order over merged candidates: resolution bucket, then season
/// affinity for series, then size, then seeders. `requested_season` is
/// `None` for movies.
pub fn rank_candidates(candidates: &mut [Candidate], requested_season: Option<u16>) {
    candidates.sort_by_key(|candidate| {
        let season = match requested_season {
            Some(season) => season_score(candidate.title(), season),
            None => 0,
        };
        std::cmp::Reverse((
            candidate.quality().weight(),
            season,
            candidate.size_bytes(),
            candidate.seeders().unwrap_or(0),
        ))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SourceMeta, TorrentCandidate};

    fn torrent(title: &str, hash: Option<&str>, size: u64, seeders: u32) -> Candidate {
        Candidate::Torrent(TorrentCandidate {
            title: title.to_string(),
            info_hash: hash.map(|h| InfoHash::new(h).unwrap()),
            size,
            seeders: Some(seeders),
            tracker: "test".to_string(),
            languages: detect_languages(title),
            magnet: None,
            source: SourceMeta::default(),
        })
    }

    #[test]
    fn junk_is_whole_word() {
        assert!(is_junk_title("Foo.2019.HDCAM.x264"));
        assert!(is_junk_title("Foo 2019 TS"));
        assert!(is_junk_title("foo.telesync.1080p"));
        assert!(!is_junk_title("Foo.2019.1080p.WEB"));
        // "TS" must not fire inside words.
        assert!(!is_junk_title("Fights.of.Fury.1080p"));
        assert!(!is_junk_title("The.Heights.2020.WEB"));
        assert!(!is_junk_title(""));
    }

    #[test]
    fn junk_purity_over_lists() {
        let titles = [
            "Foo.2019.HDCAM.x264",
            "Foo.2019.1080p.WEB",
            "Bar.SCREENER.2024",
            "Bar.2024.2160p.BluRay",
        ];
        let kept: Vec<_> = titles.iter().filter(|t| !is_junk_title(t)).collect();
        assert_eq!(kept, vec![&"Foo.2019.1080p.WEB", &"Bar.2024.2160p.BluRay"]);
    }

    #[test]
    fn language_detection() {
        assert!(detect_languages("Foo.FRENCH.1080p").contains("fr"));
        assert!(detect_languages("Foo.MULTI.VOSTFR").contains("fr"));
        assert!(detect_languages("Foo.MULTI.VOSTFR").contains("multi"));
        assert!(detect_languages("Pelicula.LATINO.WEB").contains("es"));
        assert!(detect_languages("Film.Dublado.720p").contains("pt"));
        assert!(detect_languages("Foo.1080p.WEB").is_empty());
    }

    #[test]
    fn english_only_filter() {
        let selected = vec!["en".to_string()];
        assert!(passes_language_filter("Foo.1080p", &selected));
        assert!(!passes_language_filter("Foo.FRENCH.1080p", &selected));
        assert!(!passes_language_filter("Foo.MULTI.VOSTFR", &selected));
        assert!(!passes_language_filter("Foo.MULTI.1080p", &selected));
    }

    #[test]
    fn no_selection_disables_filter() {
        assert!(passes_language_filter("Foo.FRENCH.1080p", &[]));
        assert!(passes_language_filter("Foo.1080p", &[]));
    }

    #[test]
    fn foreign_selection() {
        let fr = vec!["fr".to_string()];
        assert!(passes_language_filter("Foo.FRENCH.1080p", &fr));
        assert!(passes_language_filter("Foo.MULTI.1080p", &fr));
        assert!(!passes_language_filter("Foo.1080p", &fr));
        assert!(!passes_language_filter("Foo.GERMAN.1080p", &fr));

        let en_fr = vec!["en".to_string(), "fr".to_string()];
        assert!(passes_language_filter("Foo.FRENCH.1080p", &en_fr));
        assert!(passes_language_filter("Foo.1080p", &en_fr));
        assert!(!passes_language_filter("Foo.GERMAN.1080p", &en_fr));
    }

    #[test]
    fn language_monotonicity() {
        let titles = [
            "Foo.1080p",
            "Foo.FRENCH.1080p",
            "Foo.GERMAN.1080p",
            "Foo.MULTI.VOSTFR",
        ];
        let narrow = vec!["en".to_string()];
        let wide = vec!["en".to_string(), "fr".to_string()];
        for title in titles {
            if passes_language_filter(title, &narrow) {
                assert!(
                    passes_language_filter(title, &wide),
                    "{title} passed narrow but not wide"
                );
            }
        }
    }

    #[test]
    fn dedup_keeps_largest() {
        const HASH: &str = "08ada5a7a6183aae1e09d831df6748d566095a10";
        const OTHER: &str = "aaaa5a7a6183aae1e09d831df6748d566095a1aa";
        let deduped = dedup_candidates(vec![
            torrent("Foo.1080p", Some(HASH), 100, 10),
            torrent("Foo.1080p.PROPER", Some(HASH), 200, 5),
            torrent("Bar.720p", Some(OTHER), 50, 1),
        ]);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].title(), "Foo.1080p.PROPER");
        assert_eq!(deduped[0].size_bytes(), 200);
        assert_eq!(deduped[1].title(), "Bar.720p");
    }

    #[test]
    fn dedup_tie_prefers_seeders_then_first_seen() {
        const HASH: &str = "08ada5a7a6183aae1e09d831df6748d566095a10";
        let deduped = dedup_candidates(vec![
            torrent("first", Some(HASH), 100, 10),
            torrent("more-seeders", Some(HASH), 100, 20),
            torrent("same-rank", Some(HASH), 100, 20),
        ]);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].title(), "more-seeders");
    }

    #[test]
    fn rank_is_total_order() {
        const H1: &str = "08ada5a7a6183aae1e09d831df6748d566095a10";
        const H2: &str = "18ada5a7a6183aae1e09d831df6748d566095a10";
        const H3: &str = "28ada5a7a6183aae1e09d831df6748d566095a10";
        const H4: &str = "38ada5a7a6183aae1e09d831df6748d566095a10";
        let mut candidates = vec![
            torrent("Foo.720p", Some(H1), 900, 3),
            torrent("Foo.2160p", Some(H2), 100, 1),
            torrent("Foo.1080p.small", Some(H3), 50, 9),
            torrent("Foo.1080p.big", Some(H4), 500, 2),
        ];
        rank_candidates(&mut candidates, None);
        let titles: Vec<_> = candidates.iter().map(|c| c.title()).collect();
        assert_eq!(
            titles,
            vec!["Foo.2160p", "Foo.1080p.big", "Foo.1080p.small", "Foo.720p"]
        );
    }

    #[test]
    fn season_pack_scores() {
        assert_eq!(season_score("Breaking.Bad.S01.1080p.BluRay.x264", 1), 3);
        assert_eq!(season_score("Breaking.Bad.S01E03.1080p", 1), 3);
        assert_eq!(season_score("Breaking.Bad.S01-S05.1080p", 3), 2);
        assert_eq!(season_score("Show.Season 2.720p", 2), 3);
        assert_eq!(season_score("Show.Season 1-5.720p", 3), 2);
        assert_eq!(season_score("Breaking.Bad.S01.1080p", 2), -2);
        assert_eq!(season_score("Breaking.Bad.S04.1080p", 2), 0);
        assert_eq!(season_score("Breaking.Bad.COMPLETE.1080p", 2), 2);
        assert_eq!(season_score("Unrelated.Movie.1080p", 2), 0);
    }

    #[test]
    fn season_bonus_orders_series() {
        const H1: &str = "08ada5a7a6183aae1e09d831df6748d566095a10";
        const H2: &str = "18ada5a7a6183aae1e09d831df6748d566095a10";
        let mut candidates = vec![
            torrent("Show.S03.1080p", Some(H1), 100, 1),
            torrent("Show.S01.1080p", Some(H2), 900, 9),
        ];
        rank_candidates(&mut candidates, Some(1));
        assert_eq!(candidates[0].title(), "Show.S01.1080p");
    }
}
