use std::time::Duration;

use once_cell::sync::OnceCell;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use skb_core::{ServiceError, ServiceResult};

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default)
}

fn connect_timeout() -> Duration {
    Duration::from_secs(env_u64("SKB_HTTP_CONNECT_TIMEOUT_SECS", 5).max(1))
}

fn request_timeout() -> Duration {
    Duration::from_secs(env_u64("SKB_HTTP_TIMEOUT_SECS", 60).max(1))
}

fn user_agent() -> String {
    format!("skb-desk/{}", env!("CARGO_PKG_VERSION"))
}

/// Base client builder with shared defaults.
pub fn builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .user_agent(user_agent())
        .connect_timeout(connect_timeout())
        .timeout(request_timeout())
        .pool_idle_timeout(Duration::from_secs(90))
}

/// Process-wide client shared by every collaborator.
pub fn client() -> anyhow::Result<reqwest::Client> {
    static CLIENT: OnceCell<reqwest::Client> = OnceCell::new();
    CLIENT
        .get_or_try_init(|| builder().build())
        .cloned()
        .map_err(|err| anyhow::anyhow!("build http client: {err}"))
}

/// Throttling and server-side failures are worth retrying; other non-2xx
/// statuses are not.
pub fn status_error(service: &'static str, status: StatusCode, body: &str) -> ServiceError {
    let snippet: String = body.chars().take(300).collect();
    let message = format!("{status}: {snippet}");
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        ServiceError::transient(service, message)
    } else {
        ServiceError::rejected(service, message)
    }
}

/// Send and require a 2xx status.
pub async fn send(service: &'static str, request: RequestBuilder) -> ServiceResult<Response> {
    let response = request
        .send()
        .await
        .map_err(|err| ServiceError::transient(service, err.to_string()))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(service, status, &body))
}

pub async fn json_body<T: DeserializeOwned>(
    service: &'static str,
    response: Response,
) -> ServiceResult<T> {
    let bytes = response
        .bytes()
        .await
        .map_err(|err| ServiceError::transient(service, err.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|err| ServiceError::malformed(service, err.to_string()))
}
