//! Proxy Executor - one-shot HTTP requests on behalf of the gateway

use std::sync::Arc;
use std::time::{Duration, Instant};

use nodelink_proto::{ControlMessage, MessageError, ProxyRequest, ProxyResponse};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::agent::AgentError;
use crate::config::ProxyConfig;
use crate::outbound::Outbound;
use crate::pool::WorkPool;

/// Request headers that are derived from the request itself and never forwarded
const SKIPPED_HEADERS: [&str; 4] = ["host", "content-length", "connection", "transfer-encoding"];

/// Failure of a single proxy execution, reported to the gateway as text
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("missing url")]
    MissingUrl,

    #[error("invalid method: {0}")]
    InvalidMethod(String),

    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("invalid body: {0}")]
    InvalidBody(#[from] MessageError),

    #[error("{0}")]
    Request(#[from] reqwest::Error),

    #[error("read timeout after {0}ms")]
    ReadTimeout(u64),

    #[error("request timeout after {0}ms")]
    Timeout(u64),
}

/// Executes `proxy_request` messages
#[derive(Debug)]
pub struct ProxyExecutor {
    client: reqwest::Client,
    config: ProxyConfig,
}

impl ProxyExecutor {
    pub fn new(config: ProxyConfig) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self { client, config })
    }

    /// Run `request` on a pool slot and send its response.
    ///
    /// A saturated pool still yields a (failed) `proxy_response`.
    pub async fn submit(self: &Arc<Self>, request: ProxyRequest, pool: &WorkPool, outbound: &Outbound) {
        let request_id = request.request_id.clone();
        let executor = Arc::clone(self);
        let slot_outbound = outbound.clone();

        let submitted = pool.try_spawn(move |_| async move {
            let response = executor.execute(&request).await;
            send_response(&slot_outbound, response).await;
        });

        if let Err(e) = submitted {
            warn!(request_id = %request_id, error = %e, "Proxy request rejected");
            send_response(outbound, ProxyResponse::failure(request_id, e.to_string(), 0)).await;
        }
    }

    /// Perform the request; always produces exactly one response
    pub async fn execute(&self, request: &ProxyRequest) -> ProxyResponse {
        let started = Instant::now();
        let request_id = request.request_id.clone();

        let attempt = self.perform(request);
        let result = match request.timeout_ms {
            Some(ms) if ms > 0 => timeout(Duration::from_millis(ms), attempt)
                .await
                .unwrap_or(Err(ProxyError::Timeout(ms))),
            _ => attempt.await,
        };
        let latency_ms = elapsed_ms(started);

        match result {
            Ok((status_code, body)) => {
                info!(
                    request_id = %request_id,
                    status_code,
                    latency_ms,
                    bytes = body.len(),
                    "Proxy request completed"
                );
                ProxyResponse::success(request_id, status_code, &body, latency_ms)
            }
            Err(e) => {
                warn!(request_id = %request_id, latency_ms, error = %e, "Proxy request failed");
                ProxyResponse::failure(request_id, e.to_string(), latency_ms)
            }
        }
    }

    async fn perform(&self, request: &ProxyRequest) -> Result<(u16, Vec<u8>), ProxyError> {
        let url = request
            .url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or(ProxyError::MissingUrl)?;
        let url = reqwest::Url::parse(url)?;

        let method_name = request.method();
        let method = reqwest::Method::from_bytes(method_name.as_bytes())
            .map_err(|_| ProxyError::InvalidMethod(method_name.clone()))?;
        let body = request.decode_body()?;

        debug!(
            request_id = %request.request_id,
            method = %method,
            url = %url,
            "Executing proxy request"
        );

        let mut builder = self.client.request(method, url);
        if let Some(headers) = &request.headers {
            for (name, value) in headers {
                if SKIPPED_HEADERS
                    .iter()
                    .any(|skipped| name.eq_ignore_ascii_case(skipped))
                {
                    continue;
                }
                builder = builder.header(name.as_str(), value.as_str());
            }
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let mut response = builder.send().await?;
        let status_code = response.status().as_u16();

        let max_body = self.config.max_body_bytes;
        let read_timeout = self.config.read_timeout();
        let mut body = Vec::new();

        while body.len() < max_body {
            let chunk = timeout(read_timeout, response.chunk())
                .await
                .map_err(|_| ProxyError::ReadTimeout(self.config.read_timeout_ms))??;
            match chunk {
                Some(chunk) => {
                    let take = chunk.len().min(max_body - body.len());
                    body.extend_from_slice(&chunk[..take]);
                }
                None => break,
            }
        }

        Ok((status_code, body))
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    (started.elapsed().as_millis() as u64).max(1)
}

async fn send_response(outbound: &Outbound, response: ProxyResponse) {
    let request_id = response.request_id.clone();
    let message = ControlMessage::ProxyResponse { data: response };
    if let Err(e) = outbound.send_message(&message).await {
        debug!(request_id = %request_id, error = %e, "Failed to send proxy_response");
    }
}
