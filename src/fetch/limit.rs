use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::{Client, Request, Response};
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

struct QueuedRequest {
    request: Request,
    reply: oneshot::Sender<reqwest::Result<Response>>,
    /// Lets abandoned callers drop out of the queue before being sent.
    cancel: CancellationToken,
}

/// Rate limited HTTP client for upstreams that throttle.
///
/// Clones share the limit. `limit` permits per `per` window; a permit is
/// held for the window after its request finishes, which caps sustained
/// throughput at `limit / per`.
#[derive(Debug, Clone)]
pub struct RateLimitedClient {
    queue_tx: mpsc::Sender<QueuedRequest>,
}

impl RateLimitedClient {
    pub fn new(client: Client, limit: usize, per: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<QueuedRequest>(100);
        tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(limit));
            while let Some(QueuedRequest {
                request,
                reply,
                cancel,
            }) = rx.recv().await
            {
                let semaphore = semaphore.clone();
                let client = client.clone();
                tokio::spawn(async move {
                    let permit = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        Ok(permit) = semaphore.acquire_owned() => permit,
                    };
                    tokio::select! {
                        response = client.execute(request) => {
                            let _ = reply.send(response);
                        }
                        _ = cancel.cancelled() => {}
                    }
                    tokio::time::sleep(per).await;
                    drop(permit);
                });
            }
        });
        Self { queue_tx: tx }
    }

    pub async fn execute(&self, request: Request) -> Result<Response> {
        let (tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        // Dropped when the caller's future is dropped, which removes the
        // request from the queue before it is ever sent.
        let _guard = cancel.clone().drop_guard();
        let url = request.url().to_string();
        self.queue_tx
            .send(QueuedRequest {
                request,
                reply: tx,
                cancel,
            })
            .await
            .context("request queue closed")?;
        let response = rx
            .await
            .map_err(|_| Error::TransientNetwork("request dropped from queue".to_string()))?
            .map_err(Error::from)?;
        tracing::trace!(status = response.status().as_u16(), url, "Upstream response");
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else if status.is_server_error() {
            Err(Error::TransientNetwork(format!("upstream status {status}")))
        } else {
            Err(Error::UpstreamRejected {
                status: status.as_u16(),
            })
        }
    }

    pub async fn json<T: DeserializeOwned>(&self, request: Request) -> Result<T> {
        let url = request.url().to_string();
        let response = self.execute(request).await?;
        match response.json().await {
            Ok(body) => Ok(body),
            Err(e) => {
                tracing::debug!(url, "Failed to deserialize response body: {e}");
                Err(Error::parse("response body is not the expected json"))
            }
        }
    }
}
