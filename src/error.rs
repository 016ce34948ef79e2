use std::fmt::Display;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure taxonomy shared by the fetch substrate, scrapers and resolvers.
///
/// Scrapers never let these cross the adapter boundary; they log and degrade
/// to an empty result. The aggregate only ever sees [Error::Credentials].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// DNS failure, connection reset, timeout or upstream 5xx.
    /// Retried by the fetch substrate before being surfaced.
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    /// Upstream answered with a non-retryable 4xx.
    #[error("upstream rejected request with status {status}")]
    UpstreamRejected { status: u16 },

    /// CAPTCHA or anti-bot interstitial detected by content match.
    #[error("bot challenge from {0}")]
    BotChallenge(String),

    /// Body did not parse or an expected selector is missing.
    #[error("parse failure: {0}")]
    ParseFailure(String),

    /// Cache backend fault. Callers treat this as a miss.
    #[error("cache backend failure: {0}")]
    CacheBackend(String),

    /// Final URL unreachable or failed range validation.
    #[error("resolved url is dead")]
    ResolveDead,

    /// Rejected login, e.g. Easynews 401.
    #[error("invalid {service} credentials")]
    Credentials { service: &'static str },

    /// The carrying request was canceled. Silent, debug-only.
    #[error("canceled")]
    Canceled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn parse(msg: impl Display) -> Self {
        Error::ParseFailure(msg.to_string())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientNetwork(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            return Error::TransientNetwork(err.to_string());
        }
        if let Some(status) = err.status() {
            if status.is_server_error() {
                return Error::TransientNetwork(format!("upstream status {status}"));
            }
            return Error::UpstreamRejected {
                status: status.as_u16(),
            };
        }
        if err.is_decode() || err.is_body() {
            return Error::ParseFailure(err.to_string());
        }
        Error::TransientNetwork(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::ParseFailure(err.to_string())
    }
}
