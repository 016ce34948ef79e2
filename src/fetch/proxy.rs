use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use reqwest::{Client, Url};

use crate::config::Config;
use crate::error::{Error, Result};

use super::build_client;

/// Proxy agents are recycled after this age or after too many consecutive
/// connection errors.
const AGENT_MAX_AGE: Duration = Duration::from_secs(300);
const AGENT_MAX_ERRORS: u32 = 5;

/// What a call is for. Selects the proxy policy column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Purpose {
    Scrapers,
    HttpStreams,
    Debrid(String),
}

impl Purpose {
    pub fn service_key(&self) -> &str {
        match self {
            Purpose::Scrapers => "scrapers",
            Purpose::HttpStreams => "httpstreams",
            Purpose::Debrid(service) => service,
        }
    }
}

enum Route {
    Direct,
    /// Destination percent-encoded into the proxy url (`{url}` placeholder).
    Legacy(String),
    /// SOCKS5/HTTPS proxy configured on the client itself.
    Agent(String),
}

struct AgentEntry {
    client: Client,
    created_at: Instant,
    consecutive_errors: u32,
}

/// Pools proxied clients per service. The base (direct) client lives for
/// the process; proxied agents age out and are rebuilt after repeated
/// connection failures.
pub struct ProxyPool {
    proxy_url: Option<String>,
    proxy_services: Option<String>,
    base: Client,
    agents: Mutex<HashMap<String, AgentEntry>>,
}

impl ProxyPool {
    pub fn new(config: &Config) -> Self {
        let base = build_client(None).expect("direct client to build");
        Self {
            proxy_url: config.proxy_url.clone(),
            proxy_services: config.proxy_services.clone(),
            base,
            agents: Mutex::new(HashMap::new()),
        }
    }

    fn route_kind(&self, purpose: &Purpose) -> Route {
        let allowed = self.proxy_url.is_some()
            && crate::config::proxy_matrix_allows(
                self.proxy_services.as_deref(),
                purpose.service_key(),
            );
        if !allowed {
            return Route::Direct;
        }
        match &self.proxy_url {
            None => Route::Direct,
            Some(proxy) if proxy.contains("{url}") => Route::Legacy(proxy.clone()),
            Some(proxy) => Route::Agent(proxy.clone()),
        }
    }

    /// Pick the client and effective url for a call.
    pub fn route(&self, purpose: &Purpose, url: &Url) -> Result<(Client, Url)> {
        match self.route_kind(purpose) {
            Route::Direct => Ok((self.base.clone(), url.clone())),
            Route::Legacy(template) => {
                let wrapped = template.replace("{url}", &urlencoding::encode(url.as_str()));
                let wrapped = Url::parse(&wrapped)
                    .map_err(|e| Error::parse(format!("legacy proxy produced a bad url: {e}")))?;
                Ok((self.base.clone(), wrapped))
            }
            Route::Agent(proxy) => {
                let client = self.agent_client(purpose.service_key(), &proxy)?;
                Ok((client, url.clone()))
            }
        }
    }

    fn agent_client(&self, service: &str, proxy: &str) -> Result<Client> {
        let mut agents = self
            .agents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let stale = agents.get(service).is_none_or(|entry| {
            entry.created_at.elapsed() > AGENT_MAX_AGE
                || entry.consecutive_errors >= AGENT_MAX_ERRORS
        });
        if stale {
            tracing::debug!(service, "Building proxy agent");
            let client = build_client(Some(proxy))?;
            agents.insert(
                service.to_string(),
                AgentEntry {
                    client,
                    created_at: Instant::now(),
                    consecutive_errors: 0,
                },
            );
        }
        Ok(agents
            .get(service)
            .expect("agent inserted above")
            .client
            .clone())
    }

    /// Feed connection outcomes back so broken agents get recycled.
    pub fn record(&self, purpose: &Purpose, ok: bool) {
        let mut agents = self
            .agents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(entry) = agents.get_mut(purpose.service_key()) {
            if ok {
                entry.consecutive_errors = 0;
            } else {
                entry.consecutive_errors += 1;
            }
        }
    }
}
