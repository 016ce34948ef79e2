use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use reqwest::Url;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::fetch::Session;

/// Hard ceiling per request inside the chain.
const STEP_TIMEOUT: Duration = Duration::from_secs(10);
/// Back-off schedule for 403/429 replies; length bounds the attempts.
const CHALLENGE_DELAYS: [Duration; 2] = [Duration::from_secs(3), Duration::from_secs(8)];

static FORM_ACTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<form[^>]+action\s*=\s*["']([^"']+)["']"#).expect("form action"));
static COOKIE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"s_343\('([^']+)',\s*'([^']*)'\)").expect("cookie call"));
static LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"c\.setAttribute\("href",\s*"([^"]+)"\)"#).expect("href assignment")
});
static META_REFRESH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)http-equiv\s*=\s*["']refresh["'][^>]*content\s*=\s*["'][^"']*url=([^"']+)"#)
        .expect("meta refresh")
});

/// A hidden input's value, tolerating either attribute order.
fn hidden_input(html: &str, name: &str) -> Option<String> {
    let forward = Regex::new(&format!(
        r#"name\s*=\s*["']{}["'][^>]*value\s*=\s*["']([^"']*)["']"#,
        regex::escape(name)
    ))
    .ok()?;
    if let Some(caps) = forward.captures(html) {
        return Some(caps[1].to_string());
    }
    let backward = Regex::new(&format!(
        r#"value\s*=\s*["']([^"']*)["'][^>]*name\s*=\s*["']{}["']"#,
        regex::escape(name)
    ))
    .ok()?;
    backward.captures(html).map(|caps| caps[1].to_string())
}

fn form_action(html: &str, base: &Url) -> Option<Url> {
    let caps = FORM_ACTION_RE.captures(html)?;
    base.join(&caps[1]).ok()
}

async fn get_with_challenge_retry(
    session: &Session,
    url: Url,
    referer: Option<&Url>,
    cancel: &CancellationToken,
) -> Result<String> {
    let mut delays = CHALLENGE_DELAYS.iter();
    loop {
        match session
            .get(url.clone(), referer, cancel, STEP_TIMEOUT)
            .await
        {
            Ok(response) if matches!(response.status().as_u16(), 403 | 429) => {
                let Some(delay) = delays.next() else {
                    return Err(Error::BotChallenge(
                        url.host_str().unwrap_or("sid host").to_string(),
                    ));
                };
                tracing::debug!(
                    status = response.status().as_u16(),
                    "SID host is rate limiting, backing off {}s",
                    delay.as_secs()
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Canceled),
                    _ = tokio::time::sleep(*delay) => {}
                }
            }
            Ok(response) => return response.text().await.map_err(Error::from),
            Err(e) => return Err(e),
        }
    }
}

/// The four-step anti-bot form walk that unwraps a SID url into the real
/// destination.
///
/// Step 0 lands on the SID page and lifts `_wp_http` from the first form.
/// Step 1 posts it back. Step 2 posts `_wp_http2` + `token` from the
/// verification form. Step 3 scrapes the dynamic cookie and link out of
/// the page javascript, sets the cookie on the origin, follows the link
/// and reads the destination from its meta-refresh tag.
pub async fn resolve_sid_url(
    session: &Session,
    sid_url: &str,
    cancel: &CancellationToken,
) -> Result<Url> {
    let sid_url =
        Url::parse(sid_url).map_err(|e| Error::parse(format!("bad sid url: {e}")))?;
    let origin = {
        let mut origin = sid_url.clone();
        origin.set_path("/");
        origin.set_query(None);
        origin
    };

    // Step 0: landing form.
    let landing = get_with_challenge_retry(session, sid_url.clone(), None, cancel).await?;
    let wp_http = hidden_input(&landing, "_wp_http")
        .ok_or_else(|| Error::parse("sid landing page has no _wp_http field"))?;
    let action = form_action(&landing, &sid_url)
        .ok_or_else(|| Error::parse("sid landing page has no form action"))?;

    // Step 1: post it back.
    let fields = vec![("_wp_http".to_string(), wp_http)];
    let verification = session
        .post_form(action.clone(), &fields, Some(&sid_url), cancel, STEP_TIMEOUT)
        .await?
        .text()
        .await
        .map_err(Error::from)?;
    if cancel.is_cancelled() {
        return Err(Error::Canceled);
    }

    // Step 2: verification form.
    let wp_http2 = hidden_input(&verification, "_wp_http2")
        .ok_or_else(|| Error::parse("sid verification page has no _wp_http2 field"))?;
    let token = hidden_input(&verification, "token")
        .ok_or_else(|| Error::parse("sid verification page has no token field"))?;
    let action2 = form_action(&verification, &action)
        .ok_or_else(|| Error::parse("sid verification page has no form action"))?;
    let fields = vec![
        ("_wp_http2".to_string(), wp_http2),
        ("token".to_string(), token),
    ];
    let scripted = session
        .post_form(action2.clone(), &fields, Some(&action), cancel, STEP_TIMEOUT)
        .await?
        .text()
        .await
        .map_err(Error::from)?;
    if cancel.is_cancelled() {
        return Err(Error::Canceled);
    }

    // Step 3: dynamic cookie + link, then the meta-refresh destination.
    let cookie = COOKIE_RE
        .captures(&scripted)
        .ok_or_else(|| Error::parse("sid script page has no cookie call"))?;
    session.set_cookie(&origin, &cookie[1], &cookie[2]);
    let link = LINK_RE
        .captures(&scripted)
        .ok_or_else(|| Error::parse("sid script page has no link assignment"))?;
    let link_url = origin
        .join(&link[1])
        .map_err(|e| Error::parse(format!("sid link did not join: {e}")))?;
    let redirect_page = session
        .get_text(link_url, Some(&action2), cancel, STEP_TIMEOUT)
        .await?;
    let destination = META_REFRESH_RE
        .captures(&redirect_page)
        .ok_or_else(|| Error::parse("sid redirect page has no meta refresh"))?;
    Url::parse(destination[1].trim())
        .map_err(|e| Error::parse(format!("sid destination is not a url: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hidden_inputs_both_orders() {
        let html = r#"
          <input type="hidden" name="_wp_http" value="abc123">
          <input type="hidden" value="xyz789" name="_wp_http2">
        "#;
        assert_eq!(hidden_input(html, "_wp_http").as_deref(), Some("abc123"));
        assert_eq!(hidden_input(html, "_wp_http2").as_deref(), Some("xyz789"));
        assert_eq!(hidden_input(html, "token"), None);
    }

    #[test]
    fn form_action_joins_relative() {
        let base = Url::parse("https://tech.example/sid?id=1").unwrap();
        let html = r#"<form method="POST" action="/verify/step1">"#;
        assert_eq!(
            form_action(html, &base).unwrap().as_str(),
            "https://tech.example/verify/step1"
        );
    }

    #[test]
    fn script_page_extraction() {
        let html = r#"
          <script>
            s_343('wp_session', '0a1b2c3d');
            var c = document.createElement("a");
            c.setAttribute("href", "/final?step=done");
          </script>
        "#;
        let cookie = COOKIE_RE.captures(html).unwrap();
        assert_eq!(&cookie[1], "wp_session");
        assert_eq!(&cookie[2], "0a1b2c3d");
        let link = LINK_RE.captures(html).unwrap();
        assert_eq!(&link[1], "/final?step=done");
    }

    #[test]
    fn meta_refresh_extraction() {
        let html = r#"<meta http-equiv="refresh" content="0; url=https://driveleech.example/file/42">"#;
        let caps = META_REFRESH_RE.captures(html).unwrap();
        assert_eq!(&caps[1], "https://driveleech.example/file/42");
    }
}
