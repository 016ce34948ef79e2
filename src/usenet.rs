use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use time::OffsetDateTime;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::fetch::{FetchClient, Purpose};
use crate::token::NzbPayload;

const POLL_INTERVAL: Duration = Duration::from_secs(3);
/// Streaming may begin at this completion percentage.
const STREAM_THRESHOLD_PCT: f64 = 5.0;
/// If the download would finish within this window anyway, wait for 100%.
const SMART_COMPLETE_WINDOW: Duration = Duration::from_secs(20);
const MAX_WAIT: Duration = Duration::from_secs(300);

const VIDEO_EXTENSIONS: &[&str] = &["mkv", "mp4", "avi", "m4v", "ts", "wmv"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Completed,
    Failed,
    Error,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Download {
    pub download_id: String,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub percent_complete: f64,
    pub status: DownloadStatus,
    pub bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// The downloader control plane (SABnzbd-shaped). Behind a trait so the
/// readiness logic is testable against a scripted fake.
#[async_trait]
pub trait NzbDownloader: Send + Sync {
    async fn submit(&self, name: &str, nzb: Vec<u8>) -> Result<String>;
    /// Pure observation; must not advance the download.
    async fn progress(&self, download_id: &str) -> Result<Download>;
    /// Files on disk once the download directory exists.
    async fn files(&self, download_id: &str) -> Result<Vec<PathBuf>>;
}

/// SABnzbd json api client.
pub struct SabnzbdClient {
    base: Url,
    api_key: String,
    fetch: Arc<FetchClient>,
}

#[derive(Debug, Deserialize)]
struct AddFileResponse {
    #[serde(default)]
    status: bool,
    #[serde(default)]
    nzo_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct QueueResponse {
    queue: QueueBody,
}

#[derive(Debug, Deserialize)]
struct QueueBody {
    #[serde(default)]
    slots: Vec<QueueSlot>,
}

#[derive(Debug, Deserialize)]
struct QueueSlot {
    nzo_id: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    percentage: String,
    #[serde(default)]
    mb: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    history: HistoryBody,
}

#[derive(Debug, Deserialize)]
struct HistoryBody {
    #[serde(default)]
    slots: Vec<HistorySlot>,
}

#[derive(Debug, Deserialize)]
struct HistorySlot {
    nzo_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    storage: Option<String>,
    #[serde(default)]
    bytes: u64,
}

impl SabnzbdClient {
    pub fn new(base_url: &str, api_key: &str, fetch: Arc<FetchClient>) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| Error::parse(format!("bad sabnzbd url: {e}")))?;
        Ok(Self {
            base,
            api_key: api_key.to_string(),
            fetch,
        })
    }

    fn api_url(&self, mode: &str) -> Url {
        let mut url = self.base.clone();
        url.set_path("/api");
        url.query_pairs_mut()
            .append_pair("mode", mode)
            .append_pair("output", "json")
            .append_pair("apikey", &self.api_key);
        url
    }
}

#[async_trait]
impl NzbDownloader for SabnzbdClient {
    async fn submit(&self, name: &str, nzb: Vec<u8>) -> Result<String> {
        let mut url = self.api_url("addfile");
        url.query_pairs_mut().append_pair("nzbname", name);
        let cancel = CancellationToken::new();
        let response = self
            .fetch
            .post(url)
            .purpose(Purpose::Scrapers)
            .multipart_file("name", &format!("{name}.nzb"), nzb)
            .timeout(Duration::from_secs(30))
            .send(&cancel)
            .await?;
        let parsed: AddFileResponse = response.json().await.map_err(Error::from)?;
        if !parsed.status {
            return Err(Error::Other(anyhow!("downloader rejected the nzb")));
        }
        parsed
            .nzo_ids
            .into_iter()
            .next()
            .ok_or_else(|| Error::Other(anyhow!("downloader returned no download id")))
    }

    async fn progress(&self, download_id: &str) -> Result<Download> {
        let cancel = CancellationToken::new();
        let queue: QueueResponse = self
            .fetch
            .get(self.api_url("queue"))
            .timeout(Duration::from_secs(10))
            .json_response(&cancel)
            .await?;
        if let Some(slot) = queue.queue.slots.iter().find(|s| s.nzo_id == download_id) {
            let status = match slot.status.to_lowercase().as_str() {
                "downloading" => DownloadStatus::Downloading,
                "queued" | "paused" | "grabbing" => DownloadStatus::Queued,
                _ => DownloadStatus::Downloading,
            };
            return Ok(Download {
                download_id: slot.nzo_id.clone(),
                name: slot.filename.clone(),
                started_at: OffsetDateTime::now_utc(),
                percent_complete: slot.percentage.parse().unwrap_or(0.0),
                status,
                bytes: slot
                    .mb
                    .parse::<f64>()
                    .map(|mb| (mb * 1024.0 * 1024.0) as u64)
                    .unwrap_or(0),
                path: None,
            });
        }
        // Not queued anymore: finished or failed, look in history.
        let history: HistoryResponse = self
            .fetch
            .get(self.api_url("history"))
            .timeout(Duration::from_secs(10))
            .json_response(&cancel)
            .await?;
        let slot = history
            .history
            .slots
            .into_iter()
            .find(|s| s.nzo_id == download_id)
            .ok_or_else(|| Error::Other(anyhow!("download {download_id} is unknown")))?;
        let status = match slot.status.to_lowercase().as_str() {
            "completed" => DownloadStatus::Completed,
            "failed" => DownloadStatus::Failed,
            _ => DownloadStatus::Error,
        };
        Ok(Download {
            download_id: slot.nzo_id,
            name: slot.name,
            started_at: OffsetDateTime::now_utc(),
            percent_complete: if status == DownloadStatus::Completed {
                100.0
            } else {
                0.0
            },
            status,
            bytes: slot.bytes,
            path: slot.storage.map(PathBuf::from),
        })
    }

    async fn files(&self, download_id: &str) -> Result<Vec<PathBuf>> {
        let progress = self.progress(download_id).await?;
        let Some(dir) = progress.path else {
            return Ok(Vec::new());
        };
        let mut files = Vec::new();
        let mut stack = vec![dir];
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .with_context(|| format!("read download dir {}", dir.display()))?;
            while let Some(entry) = entries.next_entry().await.map_err(anyhow::Error::from)? {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    files.push(path);
                }
            }
        }
        Ok(files)
    }
}

fn is_video(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

/// Pick the file to stream: for series the one matching the requested
/// episode, otherwise the largest video file.
pub fn pick_video_file(
    files: &[(PathBuf, u64)],
    season: Option<u16>,
    episode: Option<u16>,
) -> Option<PathBuf> {
    let videos: Vec<&(PathBuf, u64)> =
        files.iter().filter(|(path, _)| is_video(path)).collect();
    if let (Some(season), Some(episode)) = (season, episode) {
        if let Some((path, _)) = videos.iter().find(|(path, _)| {
            path.file_name()
                .and_then(|name| name.to_str())
                .and_then(crate::scrapers::home_media::extract_episode)
                == Some((season, episode))
        }) {
            return Some(path.clone());
        }
    }
    videos
        .into_iter()
        .max_by_key(|(_, size)| *size)
        .map(|(path, _)| path.clone())
}

/// Whether partial streaming should hold off because the download is about
/// to finish anyway. `speed` is percent per second.
fn finishing_soon(percent: f64, speed_pct_per_sec: f64) -> bool {
    if speed_pct_per_sec <= 0.0 {
        return false;
    }
    let remaining_secs = (100.0 - percent) / speed_pct_per_sec;
    remaining_secs < SMART_COMPLETE_WINDOW.as_secs_f64()
}

/// Orchestrates one usenet preview resolution: fetch the nzb, hand it to
/// the downloader, poll until streamable, pick the file.
pub struct UsenetController {
    downloader: Arc<dyn NzbDownloader>,
    fetch: Arc<FetchClient>,
    active: Mutex<HashMap<String, Download>>,
}

impl UsenetController {
    pub fn new(downloader: Arc<dyn NzbDownloader>, fetch: Arc<FetchClient>) -> Self {
        Self {
            downloader,
            fetch,
            active: Mutex::new(HashMap::new()),
        }
    }

    fn remember(&self, download: &Download) {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(download.download_id.clone(), download.clone());
    }

    /// Fetch the nzb from the indexer and submit it. Returns the download
    /// id to poll.
    pub async fn start(&self, payload: &NzbPayload, cancel: &CancellationToken) -> Result<String> {
        let nzb_url = Url::parse(&payload.nzb_url)
            .map_err(|e| Error::parse(format!("bad nzb url: {e}")))?;
        let nzb = self
            .fetch
            .get(nzb_url)
            .timeout(Duration::from_secs(30))
            .bytes(cancel)
            .await?;
        let download_id = self.downloader.submit(&payload.title, nzb).await?;
        tracing::info!(download_id, title = payload.title, "Submitted nzb");
        let download = self.downloader.progress(&download_id).await?;
        self.remember(&download);
        Ok(download_id)
    }

    /// Observational progress, as exposed to the API layer.
    pub async fn progress(&self, download_id: &str) -> Result<Download> {
        let download = self.downloader.progress(download_id).await?;
        self.remember(&download);
        Ok(download)
    }

    /// Poll until the download can be streamed: completed, or past the
    /// threshold with the smart-complete heuristic applied. Bounded by the
    /// max wait.
    pub async fn wait_until_streamable(
        &self,
        download_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Download> {
        let started = Instant::now();
        let mut previous: Option<(f64, Instant)> = None;
        loop {
            if started.elapsed() > MAX_WAIT {
                return Err(Error::Other(anyhow!(
                    "download {download_id} not streamable within {}s",
                    MAX_WAIT.as_secs()
                )));
            }
            let download = self.progress(download_id).await?;
            match download.status {
                DownloadStatus::Failed | DownloadStatus::Error => {
                    return Err(Error::Other(anyhow!(
                        "download {download_id} failed in the downloader"
                    )));
                }
                DownloadStatus::Completed => return Ok(download),
                DownloadStatus::Downloading
                    if download.percent_complete >= STREAM_THRESHOLD_PCT =>
                {
                    let now = Instant::now();
                    match previous {
                        // No speed sample yet; take one more poll before
                        // deciding between partial and full.
                        None => previous = Some((download.percent_complete, now)),
                        Some((pct, at)) => {
                            let dt = now.duration_since(at).as_secs_f64();
                            let speed = if dt > 0.0 {
                                (download.percent_complete - pct) / dt
                            } else {
                                0.0
                            };
                            if finishing_soon(download.percent_complete, speed) {
                                tracing::debug!(
                                    download_id,
                                    percent = download.percent_complete,
                                    "Nearly done, waiting for completion instead of partial stream"
                                );
                                previous = Some((download.percent_complete, now));
                            } else {
                                return Ok(download);
                            }
                        }
                    }
                }
                _ => {
                    previous = Some((download.percent_complete, Instant::now()));
                }
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Canceled),
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    /// Path of the file the streaming layer should serve.
    pub async fn stream_path(
        &self,
        download_id: &str,
        season: Option<u16>,
        episode: Option<u16>,
    ) -> Result<PathBuf> {
        let files = self.downloader.files(download_id).await?;
        let mut sized = Vec::with_capacity(files.len());
        for path in files {
            let size = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
            sized.push((path, size));
        }
        pick_video_file(&sized, season, episode)
            .ok_or_else(|| Error::Other(anyhow!("download {download_id} has no video file")))
    }

    /// Full resolution flow for a usenet preview click.
    pub async fn resolve(
        &self,
        payload: &NzbPayload,
        season: Option<u16>,
        episode: Option<u16>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let download_id = self.start(payload, cancel).await?;
        self.wait_until_streamable(&download_id, cancel).await?;
        self.stream_path(&download_id, season, episode).await
    }
}
