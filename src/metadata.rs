use async_trait::async_trait;
use reqwest::{Client, Method, Request, Url};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::fetch::RateLimitedClient;
use crate::model::ContentType;

/// What the aggregation engine needs to build queries.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaMeta {
    pub name: String,
    pub year: Option<u16>,
}

/// External metadata collaborator: imdb id -> title/year.
#[async_trait]
pub trait MetadataService: Send + Sync {
    async fn get_meta(&self, content_type: ContentType, imdb_id: &str) -> Result<MediaMeta>;
}

/// Cinemeta-style metadata client: `GET /meta/{type}/{id}.json`.
#[derive(Debug)]
pub struct CinemetaClient {
    base_url: Url,
    client: RateLimitedClient,
}

#[derive(Debug, Deserialize)]
struct MetaEnvelope {
    meta: MetaBody,
}

#[derive(Debug, Deserialize)]
struct MetaBody {
    name: String,
    #[serde(default)]
    year: Option<String>,
    #[serde(default, rename = "releaseInfo")]
    release_info: Option<String>,
}

impl MetaBody {
    /// Year comes as `"1999"`, `"2008-2013"` or only inside releaseInfo.
    fn first_year(&self) -> Option<u16> {
        let raw = self.year.as_deref().or(self.release_info.as_deref())?;
        let digits: String = raw.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse().ok()
    }
}

impl CinemetaClient {
    const RATE_LIMIT: usize = 20;

    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::parse(format!("bad metadata url: {e}")))?;
        let client = RateLimitedClient::new(
            Client::new(),
            Self::RATE_LIMIT,
            std::time::Duration::from_secs(1),
        );
        Ok(Self { base_url, client })
    }
}

#[async_trait]
impl MetadataService for CinemetaClient {
    async fn get_meta(&self, content_type: ContentType, imdb_id: &str) -> Result<MediaMeta> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::parse("metadata url cannot be a base"))?
            .push("meta")
            .push(content_type.as_str())
            .push(&format!("{imdb_id}.json"));
        let request = Request::new(Method::GET, url);
        let envelope: MetaEnvelope = self.client.json(request).await?;
        let year = envelope.meta.first_year();
        Ok(MediaMeta {
            name: envelope.meta.name,
            year,
        })
    }
}
