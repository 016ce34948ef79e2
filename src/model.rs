use std::collections::BTreeSet;
use std::fmt::Display;
use std::str::FromStr;

use reqwest::Url;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::Error;

pub const TRACKERS: [&str; 9] = [
    "udp://tracker.opentrackr.org:1337",
    "udp://tracker.openbittorrent.com:6969/announce",
    "udp://open.stealth.si:80/announce",
    "udp://tracker.torrent.eu.org:451/announce",
    "udp://tracker.bittor.pw:1337/announce",
    "udp://public.popcorn-tracker.org:6969/announce",
    "udp://tracker.dler.org:6969/announce",
    "udp://exodus.desync.com:6969",
    "udp://opentracker.i2p.rocks:6969/announce",
];

fn serialize_url<S: Serializer>(url: &Option<Url>, serializer: S) -> Result<S::Ok, S::Error> {
    match url {
        Some(url) => serializer.serialize_some(url.as_str()),
        None => serializer.serialize_none(),
    }
}

fn deserialize_url<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Url>, D::Error> {
    let raw = Option::<String>::deserialize(deserializer)?;
    raw.map(|s| Url::parse(&s).map_err(D::Error::custom))
        .transpose()
}

fn serialize_hash<S: Serializer>(
    hash: &Option<InfoHash>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match hash {
        Some(hash) => serializer.serialize_some(hash.as_str()),
        None => serializer.serialize_none(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Movie,
    Series,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Movie => "movie",
            ContentType::Series => "series",
        }
    }
}

impl FromStr for ContentType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "movie" => Ok(ContentType::Movie),
            "series" => Ok(ContentType::Series),
            rest => Err(Error::parse(format!("unknown content type: {rest}"))),
        }
    }
}

/// Inbound request identity: `tt0133093` or `tt0903747:1:3`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRequest {
    pub content_type: ContentType,
    pub imdb_id: String,
    pub season: Option<u16>,
    pub episode: Option<u16>,
}

impl MediaRequest {
    pub fn parse(content_type: ContentType, id: &str) -> Result<Self, Error> {
        let mut parts = id.split(':');
        let imdb_id = parts
            .next()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::parse("empty content id"))?;
        let season = parts
            .next()
            .map(|s| s.parse())
            .transpose()
            .map_err(|_| Error::parse(format!("bad season in id: {id}")))?;
        let episode = parts
            .next()
            .map(|s| s.parse())
            .transpose()
            .map_err(|_| Error::parse(format!("bad episode in id: {id}")))?;
        if content_type == ContentType::Series && (season.is_none() || episode.is_none()) {
            return Err(Error::parse(format!("series id without episode: {id}")));
        }
        Ok(Self {
            content_type,
            imdb_id: imdb_id.to_string(),
            season,
            episode,
        })
    }

    /// The stremio-style composite id this request came in as.
    pub fn composite_id(&self) -> String {
        match (self.season, self.episode) {
            (Some(s), Some(e)) => format!("{}:{}:{}", self.imdb_id, s, e),
            _ => self.imdb_id.clone(),
        }
    }
}

/// 40-hex torrent content identifier, normalized to lowercase.
///
/// Sources that expose no real hash get one synthesized from their detail
/// URL. Synthetic hashes address results within this system only and are
/// never sent to debrid caches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InfoHash {
    hex: String,
    synthetic: bool,
}

impl InfoHash {
    pub fn new(raw: &str) -> Option<Self> {
        let hex = raw.trim().to_ascii_lowercase();
        if hex.len() != 40 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self {
            hex,
            synthetic: false,
        })
    }

    /// Pull the btih hash out of a magnet uri.
    pub fn from_magnet(magnet: &str) -> Option<Self> {
        let lower = magnet.to_ascii_lowercase();
        let start = lower.find("btih:")? + "btih:".len();
        let hex: String = lower[start..]
            .chars()
            .take_while(|c| c.is_ascii_hexdigit())
            .collect();
        Self::new(&hex)
    }

    /// Derive a stable stand-in hash for a source without real ones.
    pub fn synthesize(seed: &str) -> Self {
        let digest = Sha256::digest(seed.as_bytes());
        let mut hex = String::with_capacity(40);
        for byte in digest.iter().take(20) {
            hex.push_str(&format!("{byte:02x}"));
        }
        Self {
            hex,
            synthetic: true,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.hex
    }

    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }
}

impl Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hex)
    }
}

/// Canonical resolution bucket used for ranking and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    #[serde(rename = "4k")]
    FourK,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "480p")]
    P480,
    Other,
}

impl Quality {
    pub fn from_title(title: &str) -> Self {
        let lower = title.to_lowercase();
        if lower.contains("2160p") || lower.contains("4k") || lower.contains("uhd") {
            Quality::FourK
        } else if lower.contains("1080p") || lower.contains("1080i") {
            Quality::P1080
        } else if lower.contains("720p") {
            Quality::P720
        } else if lower.contains("480p") || lower.contains("480i") || lower.contains("dvdrip") {
            Quality::P480
        } else {
            Quality::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::FourK => "4k",
            Quality::P1080 => "1080p",
            Quality::P720 => "720p",
            Quality::P480 => "480p",
            Quality::Other => "other",
        }
    }

    /// Higher is better. Used as the primary ranking key.
    pub fn weight(&self) -> u8 {
        match self {
            Quality::FourK => 4,
            Quality::P1080 => 3,
            Quality::P720 => 2,
            Quality::P480 => 1,
            Quality::Other => 0,
        }
    }
}

/// Provider-specific leftovers that survive normalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail_url: Option<String>,
}

/// Normalized record produced by torrent scrapers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentCandidate {
    pub title: String,
    pub info_hash: Option<InfoHash>,
    /// Bytes; 0 means unknown.
    pub size: u64,
    pub seeders: Option<u32>,
    /// Short source label, possibly suffixed: `"Torrentio | Rarbg"`.
    pub tracker: String,
    pub languages: BTreeSet<String>,
    #[serde(
        serialize_with = "serialize_url",
        deserialize_with = "deserialize_url",
        default
    )]
    pub magnet: Option<Url>,
    pub source: SourceMeta,
}

impl TorrentCandidate {
    /// Build a magnet URI from the bare info hash and the public tracker list.
    pub fn magnet_from_hash(hash: &InfoHash, name: &str) -> Url {
        let mut url = Url::parse("magnet:").expect("magnet scheme to parse");
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("xt", &format!("urn:btih:{hash}"));
            query.append_pair("dn", name);
            for tracker in TRACKERS {
                query.append_pair("tr", tracker);
            }
        }
        url
    }
}

/// Normalized record produced by HTTP-stream scrapers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpStreamCandidate {
    /// Long release name used as the user-facing title line.
    pub display_name: String,
    pub quality: Quality,
    pub size_text: String,
    pub size_bytes: Option<u64>,
    pub provider: String,
    pub languages: BTreeSet<String>,
    /// Resolution payload wrapped into an opaque token at preview time.
    /// `None` only for candidates that already carry a direct url.
    pub payload: Option<serde_json::Value>,
    /// Direct url for providers that need no on-click resolution
    /// (personal media server, eagerly resolved streams).
    #[serde(
        serialize_with = "serialize_url",
        deserialize_with = "deserialize_url",
        default
    )]
    pub direct_url: Option<Url>,
    pub needs_resolution: bool,
}

/// Normalized record produced by the Usenet indexer scraper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NzbCandidate {
    pub title: String,
    pub guid: String,
    pub nzb_url: String,
    pub size: u64,
    pub indexer: String,
    pub languages: BTreeSet<String>,
}

/// The tagged union every scraper returns. The engine dispatches on the
/// variant during merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Candidate {
    Torrent(TorrentCandidate),
    HttpStream(HttpStreamCandidate),
    Nzb(NzbCandidate),
}

impl Candidate {
    pub fn title(&self) -> &str {
        match self {
            Candidate::Torrent(t) => &t.title,
            Candidate::HttpStream(h) => &h.display_name,
            Candidate::Nzb(n) => &n.title,
        }
    }

    pub fn size_bytes(&self) -> u64 {
        match self {
            Candidate::Torrent(t) => t.size,
            Candidate::HttpStream(h) => h.size_bytes.unwrap_or(0),
            Candidate::Nzb(n) => n.size,
        }
    }

    pub fn seeders(&self) -> Option<u32> {
        match self {
            Candidate::Torrent(t) => t.seeders,
            _ => None,
        }
    }

    pub fn quality(&self) -> Quality {
        match self {
            Candidate::HttpStream(h) => h.quality,
            rest => Quality::from_title(rest.title()),
        }
    }

    pub fn languages(&self) -> &BTreeSet<String> {
        match self {
            Candidate::Torrent(t) => &t.languages,
            Candidate::HttpStream(h) => &h.languages,
            Candidate::Nzb(n) => &n.languages,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BehaviorHints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binge_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub not_web_ready: bool,
}

/// Outbound shape for HTTP-stream results. `url` always points at this
/// system's own resolve endpoint; the upstream url never leaves the core.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewStream {
    pub name: String,
    pub title: String,
    pub url: String,
    pub behavior_hints: BehaviorHints,
    pub resolution: Quality,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    pub needs_resolution: bool,
}

/// Final stream descriptor. The url is known to accept range requests
/// (unless validation was disabled by configuration).
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedStream {
    pub url: String,
}

/// Outbound torrent descriptor after merging. `sources` preserves per-hash
/// attribution across scrapers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TorrentStream {
    pub name: String,
    pub title: String,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_hash"
    )]
    pub info_hash: Option<InfoHash>,
    #[serde(serialize_with = "serialize_url")]
    pub magnet: Option<Url>,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seeders: Option<u32>,
    pub sources: Vec<String>,
    pub languages: BTreeSet<String>,
    pub resolution: Quality,
    /// Set when a debrid service is configured: `Some(true)` means the
    /// hash is instantly available there.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,
}

/// One entry of the merged, ranked aggregate output.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum StreamItem {
    Torrent(TorrentStream),
    Preview(PreviewStream),
}

const KIB: f64 = 1024.0;
const MIB: f64 = 1024.0 * 1024.0;
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
const TIB: f64 = 1024.0 * 1024.0 * 1024.0 * 1024.0;

/// Parse a human size string like `"12.4 GB"` into bytes.
pub fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text.find(|c: char| c.is_ascii_alphabetic())?;
    let number: f64 = text[..split].trim().replace(',', "").parse().ok()?;
    let unit = text[split..].trim().to_ascii_uppercase();
    let multiplier = match unit.as_str() {
        "B" => 1.0,
        "KB" | "KIB" => KIB,
        "MB" | "MIB" => MIB,
        "GB" | "GIB" => GIB,
        "TB" | "TIB" => TIB,
        _ => return None,
    };
    Some((number * multiplier) as u64)
}

/// Format bytes the way size strings are displayed to users.
pub fn format_size(bytes: u64) -> String {
    let bytes = bytes as f64;
    if bytes >= TIB {
        format!("{:.2} TB", bytes / TIB)
    } else if bytes >= GIB {
        format!("{:.2} GB", bytes / GIB)
    } else if bytes >= MIB {
        format!("{:.2} MB", bytes / MIB)
    } else if bytes >= KIB {
        format!("{:.2} KB", bytes / KIB)
    } else {
        format!("{bytes:.0} B")
    }
}

pub fn gib_to_bytes(gib: f64) -> u64 {
    (gib * GIB) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_request_ids() {
        let movie = MediaRequest::parse(ContentType::Movie, "tt0133093").unwrap();
        assert_eq!(movie.imdb_id, "tt0133093");
        assert_eq!(movie.season, None);

        let episode = MediaRequest::parse(ContentType::Series, "tt0903747:1:3").unwrap();
        assert_eq!(episode.season, Some(1));
        assert_eq!(episode.episode, Some(3));
        assert_eq!(episode.composite_id(), "tt0903747:1:3");

        assert!(MediaRequest::parse(ContentType::Series, "tt0903747").is_err());
        assert!(MediaRequest::parse(ContentType::Movie, "tt1:one:2").is_err());
    }

    #[test]
    fn info_hash_normalization() {
        let hash = InfoHash::new(" 08ADA5A7A6183AAE1E09D831DF6748D566095A10 ").unwrap();
        assert_eq!(hash.as_str(), "08ada5a7a6183aae1e09d831df6748d566095a10");
        assert!(!hash.is_synthetic());

        assert!(InfoHash::new("too-short").is_none());
        assert!(InfoHash::new("z8ada5a7a6183aae1e09d831df6748d566095a10").is_none());

        let synthetic = InfoHash::synthesize("https://example.com/detail/42");
        assert_eq!(synthetic.as_str().len(), 40);
        assert!(synthetic.is_synthetic());
        assert_eq!(synthetic, InfoHash::synthesize("https://example.com/detail/42"));
    }

    #[test]
    fn hash_from_magnet() {
        let magnet = "magnet:?xt=urn:btih:08ADA5A7A6183AAE1E09D831DF6748D566095A10&dn=Foo";
        let hash = InfoHash::from_magnet(magnet).unwrap();
        assert_eq!(hash.as_str(), "08ada5a7a6183aae1e09d831df6748d566095a10");
        assert!(InfoHash::from_magnet("https://example.com/not-a-magnet").is_none());
    }

    #[test]
    fn quality_buckets() {
        assert_eq!(Quality::from_title("Foo.2160p.WEB"), Quality::FourK);
        assert_eq!(Quality::from_title("Foo 4K HDR"), Quality::FourK);
        assert_eq!(Quality::from_title("Foo.1080p.BluRay"), Quality::P1080);
        assert_eq!(Quality::from_title("foo 720P x264"), Quality::P720);
        assert_eq!(Quality::from_title("Foo.DVDRip"), Quality::P480);
        assert_eq!(Quality::from_title("Foo.WEB.x264"), Quality::Other);
    }

    #[test]
    fn size_round_trip() {
        assert_eq!(parse_size("1 KB"), Some(1024));
        assert_eq!(parse_size("12.4 GB"), Some((12.4 * GIB) as u64));
        assert_eq!(parse_size("700MB"), Some((700.0 * MIB) as u64));
        assert_eq!(parse_size("1,234 MB"), Some((1234.0 * MIB) as u64));
        assert_eq!(parse_size("garbage"), None);
        assert_eq!(format_size(parse_size("2.00 GB").unwrap()), "2.00 GB");
        assert_eq!(format_size(512), "512 B");
    }

    #[test]
    fn magnet_has_trackers() {
        let hash = InfoHash::new("08ada5a7a6183aae1e09d831df6748d566095a10").unwrap();
        let magnet = TorrentCandidate::magnet_from_hash(&hash, "Some Movie");
        let url = magnet.as_str();
        assert!(url.starts_with("magnet:?xt=urn%3Abtih%3A08ada5a7"));
        assert_eq!(url.matches("tr=").count(), TRACKERS.len());
    }
}
