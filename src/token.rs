use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Current envelope version. Bump when the payload layout changes; the
/// version field leaves room to move to encrypted payloads without
/// breaking the url format.
pub const TOKEN_VERSION: u8 = 1;

/// Decoded tokens larger than this are rejected outright.
const MAX_TOKEN_BYTES: usize = 8 * 1024;

/// Self-contained resolution token carried in preview urls.
///
/// Stateless by design: a server restart must not invalidate outstanding
/// previews, so everything the resolver needs rides inside the token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionToken {
    pub v: u8,
    pub provider: String,
    pub payload: serde_json::Value,
}

impl ResolutionToken {
    pub fn new(provider: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            v: TOKEN_VERSION,
            provider: provider.into(),
            payload,
        }
    }

    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).expect("token to serialize");
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        if raw.len() > MAX_TOKEN_BYTES * 4 / 3 + 4 {
            return Err(Error::parse("token exceeds size cap"));
        }
        let bytes = URL_SAFE_NO_PAD
            .decode(raw.trim())
            .map_err(|e| Error::parse(format!("token is not base64url: {e}")))?;
        if bytes.len() > MAX_TOKEN_BYTES {
            return Err(Error::parse("token exceeds size cap"));
        }
        let token: ResolutionToken = serde_json::from_slice(&bytes)
            .map_err(|e| Error::parse(format!("token is not valid json: {e}")))?;
        if token.v != TOKEN_VERSION {
            return Err(Error::parse(format!("unsupported token version {}", token.v)));
        }
        if token.provider.is_empty() {
            return Err(Error::parse("token has no provider"));
        }
        Ok(token)
    }

    pub fn typed_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| Error::parse(format!("token payload mismatch: {e}")))
    }

    /// The self-URL a preview stream points at.
    pub fn resolver_url(&self, self_base: &str) -> String {
        format!(
            "{}/resolve/{}/{}",
            self_base.trim_end_matches('/'),
            self.provider,
            self.encode()
        )
    }
}

/// UHDMovies / MoviesDrive payload: the SID url found at search time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidPayload {
    pub sid_url: String,
}

/// Easynews payload. Everything needed to rebuild the direct download url.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EasynewsPayload {
    pub username: String,
    pub password: String,
    pub dl_farm: String,
    pub dl_port: String,
    pub post_hash: String,
    pub ext: String,
    pub post_title: String,
    pub down_url: String,
}

/// Usenet payload: where to get the NZB and what to call it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NzbPayload {
    pub nzb_url: String,
    pub title: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let token = ResolutionToken::new(
            "uhdmovies",
            serde_json::json!({ "sid_url": "https://tech.example/sid?id=42" }),
        );
        let decoded = ResolutionToken::decode(&token.encode()).unwrap();
        assert_eq!(decoded, token);
        let payload: SidPayload = decoded.typed_payload().unwrap();
        assert_eq!(payload.sid_url, "https://tech.example/sid?id=42");
    }

    #[test]
    fn typed_payloads_round_trip() {
        let payload = EasynewsPayload {
            username: "user".into(),
            password: "pass".into(),
            dl_farm: "auto".into(),
            dl_port: "443".into(),
            post_hash: "abc123".into(),
            ext: ".mkv".into(),
            post_title: "Foo.2019.1080p".into(),
            down_url: "https://members.easynews.example/dl".into(),
        };
        let token =
            ResolutionToken::new("easynews", serde_json::to_value(&payload).unwrap());
        let decoded = ResolutionToken::decode(&token.encode()).unwrap();
        let back: EasynewsPayload = decoded.typed_payload().unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn rejects_garbage() {
        assert!(ResolutionToken::decode("not base64 at all!!!").is_err());
        // Valid base64, not json.
        assert!(ResolutionToken::decode(&URL_SAFE_NO_PAD.encode(b"hello")).is_err());
        // Valid json, wrong shape.
        assert!(ResolutionToken::decode(&URL_SAFE_NO_PAD.encode(b"{\"x\":1}")).is_err());
        // Wrong version.
        let stale = URL_SAFE_NO_PAD.encode(b"{\"v\":9,\"provider\":\"x\",\"payload\":null}");
        assert!(ResolutionToken::decode(&stale).is_err());
        // Empty provider.
        let anonymous = URL_SAFE_NO_PAD.encode(b"{\"v\":1,\"provider\":\"\",\"payload\":null}");
        assert!(ResolutionToken::decode(&anonymous).is_err());
    }

    #[test]
    fn rejects_oversized() {
        let huge = "A".repeat(MAX_TOKEN_BYTES * 2);
        assert!(ResolutionToken::decode(&huge).is_err());
    }

    #[test]
    fn resolver_url_shape() {
        let token = ResolutionToken::new("moviesdrive", serde_json::json!({"sid_url": "x"}));
        let url = token.resolver_url("http://127.0.0.1:7860/");
        assert!(url.starts_with("http://127.0.0.1:7860/resolve/moviesdrive/"));
        let encoded = url.rsplit('/').next().unwrap();
        assert_eq!(ResolutionToken::decode(encoded).unwrap(), token);
    }
}
