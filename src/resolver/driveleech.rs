use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use reqwest::Url;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::fetch::Session;

const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Known CDN intermediates that wrap the real video url.
const INTERMEDIATE_HOSTS: &[&str] = &["video-leech.pro", "cdn.video-leech.pro", "video-seed.pro"];

static JS_REDIRECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"window\.location\.replace\(["']([^"']+)["']\)"#).expect("js redirect")
});
static WORKER_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^"'\s<>]+\.workers\.dev[^"'\s<>]*"#).expect("workers url")
});
static VIDEO_CDN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"https?://[^"'\s<>]*(?:workers\.dev|video-seed\.pro|video-leech\.pro)[^"'\s<>]*"#,
    )
    .expect("video cdn url")
});
static HREF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<a[^>]+href\s*=\s*["']([^"']+)["'][^>]*>([^<]*)"#).expect("href"));
static ZFILE_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"["']key["']\s*[:,]\s*["']([^"']+)["']|formData\.append\(\s*["']key["']\s*,\s*["']([^"']+)["']"#)
        .expect("zfile key")
});

#[derive(Debug, Deserialize)]
struct MintedUrl {
    url: String,
}

/// Follow the post-SID redirect page: either a plain page or a
/// `window.location.replace` hop.
pub async fn follow_redirect_page(
    session: &Session,
    url: Url,
    cancel: &CancellationToken,
) -> Result<(Url, String)> {
    let body = session
        .get_text(url.clone(), None, cancel, STEP_TIMEOUT)
        .await?;
    if let Some(caps) = JS_REDIRECT_RE.captures(&body) {
        let next = url
            .join(caps[1].trim())
            .map_err(|e| Error::parse(format!("js redirect target did not parse: {e}")))?;
        let body = session
            .get_text(next.clone(), Some(&url), cancel, STEP_TIMEOUT)
            .await?;
        return Ok((next, body));
    }
    Ok((url, body))
}

fn anchors(html: &str) -> Vec<(String, String)> {
    HREF_RE
        .captures_iter(html)
        .map(|caps| (caps[1].to_string(), caps[2].trim().to_string()))
        .collect()
}

/// Resume-Cloud first: its target is either a direct workers link or a
/// `/zfile/` page whose api mints one against an embedded key.
async fn try_resume_cloud(
    session: &Session,
    page_url: &Url,
    html: &str,
    cancel: &CancellationToken,
) -> Option<Url> {
    let (href, _) = anchors(html).into_iter().find(|(href, text)| {
        text.to_lowercase().contains("resume cloud") || href.contains("/zfile")
    })?;
    let target = page_url.join(&href).ok()?;
    if let Some(m) = WORKER_URL_RE.find(target.as_str()) {
        return Url::parse(m.as_str()).ok();
    }
    let body = session
        .get_text(target.clone(), Some(page_url), cancel, STEP_TIMEOUT)
        .await
        .ok()?;
    if let Some(m) = WORKER_URL_RE.find(&body) {
        return Url::parse(m.as_str()).ok();
    }
    // The page hides the link behind a POST that mints it.
    let key = ZFILE_KEY_RE.captures(&body).and_then(|caps| {
        caps.get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str().to_string())
    })?;
    let minted: MintedUrl = session
        .post_form(
            target.clone(),
            &[("key".to_string(), key)],
            Some(page_url),
            cancel,
            STEP_TIMEOUT,
        )
        .await
        .ok()?
        .json()
        .await
        .ok()?;
    Url::parse(&minted.url).ok()
}

/// Instant-Download second: the link carries the payload in its `url`
/// query parameter; the host's `/api` endpoint exchanges it for the final
/// url.
async fn try_instant_download(
    session: &Session,
    page_url: &Url,
    html: &str,
    cancel: &CancellationToken,
) -> Option<Url> {
    let (href, _) = anchors(html)
        .into_iter()
        .find(|(href, text)| {
            text.to_lowercase().contains("instant")
                || INTERMEDIATE_HOSTS.iter().any(|host| href.contains(host))
        })?;
    let link = page_url.join(&href).ok()?;
    let keys = link
        .query_pairs()
        .find(|(name, _)| name == "url")
        .map(|(_, value)| value.into_owned())?;
    let mut api = link.clone();
    api.set_path("/api");
    api.set_query(None);
    let minted: MintedUrl = session
        .post_form(
            api,
            &[("keys".to_string(), keys)],
            Some(page_url),
            cancel,
            STEP_TIMEOUT,
        )
        .await
        .ok()?
        .json()
        .await
        .ok()?;
    Url::parse(&minted.url).ok()
}

/// Work the file page's download options in preference order and return
/// the first direct video url.
pub async fn extract_direct_url(
    session: &Session,
    page_url: &Url,
    html: &str,
    cancel: &CancellationToken,
) -> Option<Url> {
    if let Some(url) = try_resume_cloud(session, page_url, html, cancel).await {
        return Some(url);
    }
    if cancel.is_cancelled() {
        return None;
    }
    if let Some(url) = try_instant_download(session, page_url, html, cancel).await {
        return Some(url);
    }
    // Any workers-host link sitting right on the page.
    for (href, _) in anchors(html) {
        if WORKER_URL_RE.is_match(&href) {
            if let Ok(url) = page_url.join(&href) {
                return Some(url);
            }
        }
    }
    // Last resort: scan markup and scripts for an embedded video cdn url.
    VIDEO_CDN_RE
        .find(html)
        .and_then(|m| Url::parse(m.as_str()).ok())
}

/// Known intermediates either carry the final url in their `url` query
/// parameter or embed it in their body.
pub async fn unwrap_intermediate(
    session: &Session,
    url: Url,
    cancel: &CancellationToken,
) -> Result<Url> {
    let is_intermediate = url
        .host_str()
        .is_some_and(|host| INTERMEDIATE_HOSTS.contains(&host));
    if !is_intermediate {
        return Ok(url);
    }
    if let Some((_, inner)) = url.query_pairs().find(|(name, _)| name == "url") {
        if let Ok(inner) = Url::parse(&inner) {
            return Ok(inner);
        }
    }
    let body = session
        .get_text(url.clone(), None, cancel, STEP_TIMEOUT)
        .await?;
    WORKER_URL_RE
        .find(&body)
        .and_then(|m| Url::parse(m.as_str()).ok())
        .ok_or(Error::ResolveDead)
}

/// PixelDrain share links play back only through their api form.
pub fn normalize_final_url(url: Url) -> Url {
    if url.host_str() == Some("pixeldrain.com") {
        let segments: Vec<&str> = url.path().trim_matches('/').split('/').collect();
        if let ["u", id] = segments.as_slice() {
            let mut rewritten = url.clone();
            rewritten.set_path(&format!("/api/file/{id}"));
            return rewritten;
        }
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn js_redirect_is_detected() {
        let html = r#"<script>window.location.replace("/file/42?key=z");</script>"#;
        assert_eq!(
            &JS_REDIRECT_RE.captures(html).unwrap()[1],
            "/file/42?key=z"
        );
    }

    #[test]
    fn anchor_scan_finds_workers_link() {
        let html = r#"
          <a href="https://dl.example-cdn.workers.dev/file/matrix.mkv" class="btn">Download [Server 1]</a>
        "#;
        let found = anchors(html);
        assert_eq!(found.len(), 1);
        assert!(WORKER_URL_RE.is_match(&found[0].0));
    }

    #[test]
    fn raw_scan_finds_embedded_cdn_url() {
        let html = r#"<script>var src = "https://cdn.video-leech.pro/v/abc.mkv";</script>"#;
        let m = VIDEO_CDN_RE.find(html).unwrap();
        assert!(m.as_str().contains("video-leech.pro"));
    }

    #[test]
    fn zfile_key_extraction() {
        let key = |html: &str| {
            let caps = ZFILE_KEY_RE.captures(html).unwrap();
            caps.get(1)
                .or_else(|| caps.get(2))
                .unwrap()
                .as_str()
                .to_string()
        };
        assert_eq!(key(r#"formData.append("key", "s3cret");"#), "s3cret");
        assert_eq!(key(r#"{"key": "abc"}"#), "abc");
        assert!(ZFILE_KEY_RE.captures("<html>no key</html>").is_none());
    }

    #[test]
    fn pixeldrain_rewrite() {
        let url = Url::parse("https://pixeldrain.com/u/AbCd1234").unwrap();
        assert_eq!(
            normalize_final_url(url).as_str(),
            "https://pixeldrain.com/api/file/AbCd1234"
        );
        let untouched = Url::parse("https://video-host.example/file.mkv").unwrap();
        assert_eq!(normalize_final_url(untouched.clone()), untouched);
    }
}
