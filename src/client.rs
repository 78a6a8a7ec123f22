use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{Result, SdError};
use crate::request::GenerationRequest;
use crate::stream::{status_error, StreamParser};
use crate::types::{GenerationOutput, ProgressUpdate, ServerStatus};
use crate::GenerationBackend;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

fn normalize(endpoint: String) -> String {
    endpoint.trim_end_matches('/').to_string()
}

/// Async client for a Stable Diffusion UI server.
///
/// Streams `POST /image` responses through a [`StreamParser`], sends the
/// best-effort `GET /image/stop`, and probes `GET /ping`. Clones share the
/// same connection pool and liveness flag.
///
/// # Example
/// ```no_run
/// use diffusion_queue::{form, request, SdClient};
///
/// # async fn example() -> diffusion_queue::Result<()> {
/// let client = SdClient::new("http://localhost:9000");
/// let task = request::prepare(&form::normalize(&form::FormConfig::new("a lighthouse")));
/// let output = client
///     .generate(&task.request_for_batch(0), 0, task.batch_count, |p| {
///         println!("{}%", p.percent)
///     })
///     .await?;
/// println!("{} image(s)", output.images.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SdClient {
    http: Client,
    endpoint: String,
    request_timeout: Option<Duration>,
    online: Arc<AtomicBool>,
}

impl SdClient {
    /// Create a client for the server at `endpoint` (e.g. `http://localhost:9000`).
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            endpoint: normalize(endpoint.into()),
            request_timeout: None,
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Use a custom `reqwest::Client` (for connection pooling, proxies, TLS).
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    /// Abort generation requests that take longer than `timeout`.
    /// Without one, a stalled server stalls the caller indefinitely.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    /// Whether the server is currently believed to be online.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }

    // ── Generation ──────────────────────────────────────────────────

    /// Run one batch: post the request and parse the streamed response.
    ///
    /// `batches_done`/`batch_count` describe the owning task so progress
    /// covers the whole task. `on_progress` is called for each step fragment.
    pub async fn generate<F>(
        &self,
        request: &GenerationRequest,
        batches_done: u32,
        batch_count: u32,
        mut on_progress: F,
    ) -> Result<GenerationOutput>
    where
        F: FnMut(ProgressUpdate),
    {
        let url = format!("{}/image", self.endpoint);
        let mut builder = self.http.post(&url).json(request);
        if let Some(timeout) = self.request_timeout {
            builder = builder.timeout(timeout);
        }

        let resp = builder.send().await.map_err(|e| {
            SdError::network(
                format!(
                    "Cannot connect to Stable Diffusion at {}; is the server running?",
                    self.endpoint
                ),
                e,
            )
        })?;

        let status = resp.status();
        if status != StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), body, self.is_online()));
        }

        let mut parser = StreamParser::new(batches_done, batch_count);
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| SdError::network("Stable Diffusion response stream failed", e))?;
            if let Some(update) = parser.push_bytes(&chunk, Instant::now()) {
                on_progress(update);
            }
        }

        parser.finish()
    }

    // ── Control ─────────────────────────────────────────────────────

    /// Ask the server to stop the generation in progress.
    pub async fn stop(&self) -> Result<()> {
        let url = format!("{}/image/stop", self.endpoint);
        let resp = self
            .http
            .get(&url)
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await
            .map_err(|e| SdError::network("Failed to send stop request", e))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(SdError::Server { status, body });
        }
        Ok(())
    }

    // ── Health ──────────────────────────────────────────────────────

    /// Probe `GET /ping` and record the result as the server's liveness.
    pub async fn ping(&self) -> ServerStatus {
        let url = format!("{}/ping", self.endpoint);
        let online = match self.http.get(&url).timeout(CONTROL_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(endpoint = %self.endpoint, error = %e, "ping failed");
                false
            }
        };

        let previous = self.online.swap(online, Ordering::Relaxed);
        if previous && !online {
            warn!(endpoint = %self.endpoint, "Stable Diffusion server went offline");
        }

        if online {
            ServerStatus::Online
        } else {
            ServerStatus::Offline
        }
    }
}

impl GenerationBackend for SdClient {
    async fn run_batch<F>(
        &self,
        request: &GenerationRequest,
        batches_done: u32,
        batch_count: u32,
        on_progress: F,
    ) -> Result<GenerationOutput>
    where
        F: FnMut(ProgressUpdate) + Send,
    {
        self.generate(request, batches_done, batch_count, on_progress)
            .await
    }

    async fn request_stop(&self) -> Result<()> {
        self.stop().await
    }

    async fn check_health(&self) -> ServerStatus {
        self.ping().await
    }
}
