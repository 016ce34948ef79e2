use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::error::Result;
use crate::model::ContentType;

/// Scrapers the engine knows about. Env overrides are scanned for these
/// names (`<NAME>_URL`, `<NAME>_LIMIT`, `<NAME>_MAX_PAGES`, `<NAME>_API_KEY`).
pub const KNOWN_SCRAPERS: &[&str] = &[
    "leetx",
    "torrent_galaxy",
    "magnetdl",
    "btdigg",
    "ilcorsaronero",
    "torrent9",
    "bludv",
    "jackett",
    "bitmagnet",
    "stremthru",
    "torrentio",
    "comet",
    "wolfmax4k",
    "snowfl",
    "zilean",
    "uhdmovies",
    "moviesdrive",
    "home_media",
    "easynews",
    "newznab",
];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScraperSettings {
    pub enabled: Option<bool>,
    pub url: Option<String>,
    pub limit: Option<usize>,
    pub max_pages: Option<u32>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EasynewsConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HomeMediaConfig {
    pub url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NewznabConfig {
    pub url: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SabnzbdConfig {
    pub url: String,
    pub api_key: String,
}

/// Effective user + environment configuration carried through every search.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-scraper deadline, milliseconds.
    pub scraper_timeout_ms: u64,
    /// Per-request deadline, milliseconds.
    pub global_timeout_ms: u64,
    /// Selected language codes. Empty disables the language filter.
    pub languages: Vec<String>,
    /// Per-candidate size window, GiB.
    pub min_size_gib: Option<f64>,
    pub max_size_gib: Option<f64>,
    pub debrid_service: Option<String>,
    pub debrid_token: Option<String>,
    /// Remote instant-availability endpoint; optional.
    pub availability_url: Option<String>,
    /// When true, HTTP-stream adapters resolve at search time (slow).
    pub disable_http_stream_lazy_load: bool,
    pub disable_url_validation: bool,
    pub disable_seek_validation: bool,
    /// Hosts exempt from range validation.
    pub skip_validation_hosts: Vec<String>,
    pub proxy_url: Option<String>,
    /// Matrix of the form `*:true` or `scrapers:true,httpstreams:false`.
    pub proxy_services: Option<String>,
    /// Base url of this service, used to mint preview resolver urls.
    pub self_base_url: String,
    pub movie_cache_ttl_min: u64,
    pub series_cache_ttl_min: u64,
    pub availability_cache_ttl_min: u64,
    pub fetch_retries: u32,
    pub fetch_retry_delay_ms: u64,
    pub metadata_url: String,
    pub scrapers: HashMap<String, ScraperSettings>,
    pub easynews: Option<EasynewsConfig>,
    pub home_media: Option<HomeMediaConfig>,
    pub newznab: Option<NewznabConfig>,
    pub sabnzbd: Option<SabnzbdConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scraper_timeout_ms: 10_000,
            global_timeout_ms: 30_000,
            languages: Vec::new(),
            min_size_gib: None,
            max_size_gib: None,
            debrid_service: None,
            debrid_token: None,
            availability_url: None,
            disable_http_stream_lazy_load: false,
            disable_url_validation: false,
            disable_seek_validation: false,
            skip_validation_hosts: Vec::new(),
            proxy_url: None,
            proxy_services: None,
            self_base_url: "http://127.0.0.1:7860".to_string(),
            movie_cache_ttl_min: 360,
            series_cache_ttl_min: 60,
            availability_cache_ttl_min: 30,
            fetch_retries: 2,
            fetch_retry_delay_ms: 1_000,
            metadata_url: "https://v3-cinemeta.strem.io".to_string(),
            scrapers: HashMap::new(),
            easynews: None,
            home_media: None,
            newznab: None,
            sabnzbd: None,
        }
    }
}

impl Config {
    /// Read a toml config file and layer environment overrides on top.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("read config file {}", path.as_ref().display()))?;
        let mut config: Config = toml::from_str(&raw).context("parse config file")?;
        config.apply_env();
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    /// Environment values win over file values, matching the precedence of
    /// the rest of the deployment tooling.
    pub fn apply_env(&mut self) {
        fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
            let raw = std::env::var(key).ok()?;
            match raw.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(key, found = raw, "Could not parse env override");
                    None
                }
            }
        }

        if let Some(v) = env_parse("SCRAPER_TIMEOUT") {
            self.scraper_timeout_ms = v;
        }
        if let Some(v) = env_parse("GLOBAL_TIMEOUT") {
            self.global_timeout_ms = v;
        }
        if let Ok(v) = std::env::var("LANGUAGES") {
            self.languages = v
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = env_parse("MIN_SIZE") {
            self.min_size_gib = Some(v);
        }
        if let Some(v) = env_parse("MAX_SIZE") {
            self.max_size_gib = Some(v);
        }
        if let Ok(v) = std::env::var("DEBRID_SERVICE") {
            self.debrid_service = Some(v);
        }
        if let Ok(v) = std::env::var("DEBRID_TOKEN") {
            self.debrid_token = Some(v);
        }
        if let Ok(v) = std::env::var("PROXY_URL") {
            self.proxy_url = Some(v);
        }
        if let Ok(v) = std::env::var("PROXY_SERVICES") {
            self.proxy_services = Some(v);
        }
        if let Ok(v) = std::env::var("SELF_BASE_URL") {
            self.self_base_url = v;
        }
        if let Some(v) = env_parse("DISABLE_HTTP_STREAM_LAZY_LOAD") {
            self.disable_http_stream_lazy_load = v;
        }
        if let Some(v) = env_parse("DISABLE_URL_VALIDATION") {
            self.disable_url_validation = v;
        }
        if let Some(v) = env_parse("DISABLE_SEEK_VALIDATION") {
            self.disable_seek_validation = v;
        }

        for name in KNOWN_SCRAPERS {
            let upper = name.to_uppercase();
            let entry = self.scrapers.entry(name.to_string()).or_default();
            if let Ok(v) = std::env::var(format!("{upper}_URL")) {
                entry.url = Some(v);
            }
            if let Some(v) = env_parse(&format!("{upper}_LIMIT")) {
                entry.limit = Some(v);
            }
            if let Some(v) = env_parse(&format!("{upper}_MAX_PAGES")) {
                entry.max_pages = Some(v);
            }
            if let Ok(v) = std::env::var(format!("{upper}_API_KEY")) {
                entry.api_key = Some(v);
            }
            if let Some(v) = env_parse(&format!("{upper}_ENABLED")) {
                entry.enabled = Some(v);
            }
        }
    }

    pub fn scraper(&self, name: &str) -> ScraperSettings {
        self.scrapers.get(name).cloned().unwrap_or_default()
    }

    pub fn scraper_enabled(&self, name: &str) -> bool {
        self.scraper(name).enabled.unwrap_or(true)
    }

    pub fn scraper_timeout(&self) -> Duration {
        Duration::from_millis(self.scraper_timeout_ms)
    }

    pub fn global_timeout(&self) -> Duration {
        Duration::from_millis(self.global_timeout_ms)
    }

    pub fn result_ttl(&self, content_type: ContentType) -> Duration {
        match content_type {
            ContentType::Movie => Duration::from_secs(self.movie_cache_ttl_min * 60),
            ContentType::Series => Duration::from_secs(self.series_cache_ttl_min * 60),
        }
    }

    pub fn availability_ttl(&self) -> Duration {
        Duration::from_secs(self.availability_cache_ttl_min * 60)
    }

    pub fn fetch_retry_delay(&self) -> Duration {
        Duration::from_millis(self.fetch_retry_delay_ms)
    }

    /// Language cache-key component; selection order does not matter.
    pub fn language_key(&self) -> String {
        let mut codes = self.languages.clone();
        codes.sort();
        codes.join(",")
    }

    /// Whether the proxy applies to the given service per the
    /// `proxy_services` matrix. With no matrix configured, a configured
    /// proxy url applies everywhere.
    pub fn proxy_applies_to(&self, service: &str) -> bool {
        self.proxy_url.is_some() && proxy_matrix_allows(self.proxy_services.as_deref(), service)
    }
}

/// Evaluate a `*:true` / `svc:true,svc:false` matrix for one service.
/// An explicit service entry beats the wildcard; no matrix allows all.
pub fn proxy_matrix_allows(matrix: Option<&str>, service: &str) -> bool {
    let Some(matrix) = matrix else {
        return true;
    };
    let mut wildcard = None;
    for part in matrix.split(',') {
        let Some((name, flag)) = part.split_once(':') else {
            continue;
        };
        let flag = flag.trim().eq_ignore_ascii_case("true");
        match name.trim() {
            "*" => wildcard = Some(flag),
            name if name == service => return flag,
            _ => {}
        }
    }
    wildcard.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.scraper_timeout(), Duration::from_secs(10));
        assert!(config.scraper_enabled("torrentio"));
        assert_eq!(
            config.result_ttl(ContentType::Movie),
            Duration::from_secs(360 * 60)
        );
        assert_eq!(
            config.result_ttl(ContentType::Series),
            Duration::from_secs(60 * 60)
        );
    }

    #[test]
    fn toml_round_trip() {
        let raw = r#"
            scraper_timeout_ms = 5000
            languages = ["en", "fr"]
            max_size_gib = 40.0

            [scrapers.torrentio]
            url = "https://torrentio.example"
            limit = 30

            [scrapers.btdigg]
            enabled = false
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.scraper_timeout_ms, 5000);
        assert_eq!(config.languages, vec!["en", "fr"]);
        assert_eq!(
            config.scraper("torrentio").url.as_deref(),
            Some("https://torrentio.example")
        );
        assert_eq!(config.scraper("torrentio").limit, Some(30));
        assert!(!config.scraper_enabled("btdigg"));
        assert!(config.scraper_enabled("snowfl"));
    }

    #[test]
    fn proxy_matrix() {
        let mut config = Config {
            proxy_url: Some("socks5://127.0.0.1:1080".to_string()),
            ..Config::default()
        };
        assert!(config.proxy_applies_to("scrapers"));

        config.proxy_services = Some("*:true".to_string());
        assert!(config.proxy_applies_to("scrapers"));
        assert!(config.proxy_applies_to("httpstreams"));

        config.proxy_services = Some("scrapers:true,httpstreams:false".to_string());
        assert!(config.proxy_applies_to("scrapers"));
        assert!(!config.proxy_applies_to("httpstreams"));
        assert!(!config.proxy_applies_to("realdebrid"));

        config.proxy_services = Some("*:true,scrapers:false".to_string());
        assert!(!config.proxy_applies_to("scrapers"));
        assert!(config.proxy_applies_to("httpstreams"));

        config.proxy_url = None;
        assert!(!config.proxy_applies_to("httpstreams"));
    }

    #[test]
    fn language_key_is_order_independent() {
        let a = Config {
            languages: vec!["fr".to_string(), "en".to_string()],
            ..Config::default()
        };
        let b = Config {
            languages: vec!["en".to_string(), "fr".to_string()],
            ..Config::default()
        };
        assert_eq!(a.language_key(), b.language_key());
    }
}
