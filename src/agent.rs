use bytes::Bytes;
use futures::Stream;
use log::info;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client as HttpClient;
use serde::{ Serialize, Deserialize };

use crate::error::{ClientError, Result};

/// Notification payload for `POST {host}/message`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentMessageRequest {
    pub chat_message_id: i64,
    pub conversation_id: i64,
}

/// Client for a per-user agent host: dispatches message notifications and
/// opens the chunked reply stream.
#[derive(Clone)]
pub struct AgentClient {
    http: HttpClient,
}

impl AgentClient {
    pub fn new(token: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ClientError::Config(format!("Invalid agent token: {}", e)))?,
        );
        let http = HttpClient::builder().default_headers(headers).build()?;

        Ok(Self { http })
    }

    /// Notify the agent host of a persisted message. Non-success statuses
    /// abort the send flow; no retry is attempted.
    pub async fn post_message(&self, host_url: &str, request: &AgentMessageRequest) -> Result<()> {
        let url = format!("{}/message", host_url.trim_end_matches('/'));
        let response = self.http.post(&url).json(request).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Dispatch(format!(
                "{} returned {}",
                url,
                status
                    .canonical_reason()
                    .unwrap_or_else(|| status.as_str())
            )));
        }
        info!(
            "Dispatched message {} for conversation {}",
            request.chat_message_id, request.conversation_id
        );
        Ok(())
    }

    /// Open the chunked reply stream for a conversation. Dropping the
    /// returned stream aborts the underlying request.
    pub async fn open_reply_stream(
        &self,
        host_url: &str,
        conversation_id: i64,
    ) -> Result<impl Stream<Item = reqwest::Result<Bytes>> + Unpin> {
        let url = format!(
            "{}/stream/{}",
            host_url.trim_end_matches('/'),
            conversation_id
        );
        let response = self.http.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Stream(format!(
                "{} returned {}",
                url,
                status
                    .canonical_reason()
                    .unwrap_or_else(|| status.as_str())
            )));
        }
        Ok(response.bytes_stream())
    }
}
