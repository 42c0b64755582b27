use async_trait::async_trait;
use serde::Serialize;
use skb_core::{ExternalSink, ServiceResult};

use crate::http_client;

const SERVICE: &str = "sheet";

/// Appends rows by POSTing `{"values": rows}` to a sheet webhook (an Apps
/// Script endpoint or any relay in front of the spreadsheet API).
pub struct WebhookSink {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
}

#[derive(Serialize)]
struct AppendBody<'a> {
    values: &'a [Vec<String>],
}

impl WebhookSink {
    pub fn new(http: reqwest::Client, url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http,
            url: url.into(),
            token,
        }
    }
}

#[async_trait]
impl ExternalSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn append_rows(&self, rows: &[Vec<String>]) -> ServiceResult<()> {
        let mut request = self.http.post(&self.url).json(&AppendBody { values: rows });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        http_client::send(SERVICE, request).await?;
        Ok(())
    }
}
