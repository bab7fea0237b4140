use crate::config::HttpClientConfig;
use async_trait::async_trait;
use courier_api::{Filter, RelayAck, SignedEvent};
use courier_core::config::CoreConfig;
use courier_core::error::CoreError;
use courier_core::fallback::{build_query_url, parse_publish_body, parse_query_body, HttpFallback};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;

/// HTTP relay bridge: `GET <base>/req?filters=..` and `POST <base>/event`.
pub struct RelayHttpClient {
    base_url: String,
    event_url: String,
    req_url: String,
    http: reqwest::Client,
    retry_attempts: u32,
    retry_backoff: Duration,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<RelayError>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct RelayError {
    #[serde(default)]
    code: Option<String>,
    message: String,
}

impl RelayHttpClient {
    pub fn new(cfg: &CoreConfig, http: &HttpClientConfig) -> Result<Self, CoreError> {
        let (event_url, req_url) = cfg
            .http_event_url()
            .zip(cfg.http_req_url())
            .ok_or_else(|| CoreError::Validation("http_fallback_base".to_string()))?;
        let base_url = event_url.trim_end_matches("/event").to_string();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.http_ack_timeout_ms))
            .connect_timeout(Duration::from_millis(http.connect_timeout_ms))
            .build()
            .map_err(|_| CoreError::Transport("client".to_string()))?;
        Ok(Self {
            base_url,
            event_url,
            req_url,
            http: client,
            retry_attempts: http.retry_attempts,
            retry_backoff: Duration::from_millis(http.retry_backoff_ms),
        })
    }

    async fn send_with_retry<F, Fut>(&self, mut op: F, label: &str) -> Result<Response, CoreError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Response, reqwest::Error>>,
    {
        let mut remaining = self.retry_attempts;
        loop {
            match op().await {
                Ok(resp) => {
                    if should_retry_status(resp.status()) && remaining > 0 {
                        log::debug!("{} got {}, retrying", label, resp.status());
                        remaining = remaining.saturating_sub(1);
                        sleep(self.retry_backoff).await;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if remaining == 0 {
                        return Err(map_reqwest_error(err, label));
                    }
                    log::debug!("{} failed ({}), retrying", label, err);
                    remaining = remaining.saturating_sub(1);
                    sleep(self.retry_backoff).await;
                }
            }
        }
    }

    async fn map_error_response(&self, resp: Response, label: &str) -> CoreError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let message = error_message(&body).unwrap_or_else(|| format!("{}:{}", label, status));
        if should_retry_status(status) {
            CoreError::Transport(message)
        } else {
            CoreError::rejection(&self.base_url, &message)
        }
    }
}

pub fn should_retry_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn map_reqwest_error(err: reqwest::Error, label: &str) -> CoreError {
    if err.is_timeout() {
        CoreError::Timeout(label.to_string())
    } else {
        CoreError::Transport(format!("{}: {}", label, err))
    }
}

/// Pulls a human message out of `{error:{code,message}}`, `{message}` or a plain body.
pub fn error_message(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<ErrorBody>(trimmed) {
        Ok(parsed) => match (parsed.error, parsed.message) {
            (Some(RelayError { code: Some(code), message }), _) => {
                Some(format!("{}: {}", code, message))
            }
            (Some(RelayError { message, .. }), _) => Some(message),
            (None, Some(message)) => Some(message),
            (None, None) => None,
        },
        Err(_) => Some(trimmed.to_string()),
    }
}

#[async_trait]
impl HttpFallback for RelayHttpClient {
    fn endpoint(&self) -> String {
        self.base_url.clone()
    }

    async fn query(&self, filters: &[Filter]) -> Result<Vec<SignedEvent>, CoreError> {
        let url = build_query_url(&self.req_url, filters)?;
        let resp = self
            .send_with_retry(|| self.http.get(url.clone()).send(), "query")
            .await?;
        if !resp.status().is_success() {
            return Err(self.map_error_response(resp, "query").await);
        }
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = resp
            .text()
            .await
            .map_err(|err| map_reqwest_error(err, "query"))?;
        parse_query_body(&content_type, &body)
    }

    async fn publish(&self, event: &SignedEvent) -> Result<RelayAck, CoreError> {
        let resp = self
            .send_with_retry(
                || self.http.post(self.event_url.clone()).json(event).send(),
                "publish",
            )
            .await?;
        let status = resp.status();
        if status.is_success() {
            let body = resp
                .text()
                .await
                .map_err(|err| map_reqwest_error(err, "publish"))?;
            return parse_publish_body(&body);
        }
        if should_retry_status(status) {
            return Err(self.map_error_response(resp, "publish").await);
        }
        // 4xx is the relay refusing this event, reported as a rejected ack.
        let body = resp.text().await.unwrap_or_default();
        Ok(RelayAck::rejected(
            error_message(&body).unwrap_or_else(|| format!("http {}", status)),
        ))
    }
}
