use log::info;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client as HttpClient, Response};
use url::Url;

use crate::error::{ClientError, Result};
use crate::models::chat::Conversation;
use crate::models::entities::{BillingCycleEntity, ChatMessageEntity, UserEntity};

/// REST client for the chat backend: users, conversations, messages,
/// agent registrations, and billing cycles. No retry logic, no backoff.
#[derive(Clone)]
pub struct ApiClient {
    http: HttpClient,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        Url::parse(base_url)
            .map_err(|e| ClientError::Config(format!("Invalid API host '{}': {}", base_url, e)))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let http = HttpClient::builder().default_headers(headers).build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ClientError::Api {
            status: status.as_u16(),
            message,
        })
    }

    // --- Users ---

    pub async fn create_user(&self, user: &UserEntity) -> Result<UserEntity> {
        let response = self
            .http
            .post(self.endpoint("/users"))
            .json(user)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<UserEntity> {
        let response = self
            .http
            .get(self.endpoint(&format!("/users/by-email/{}", email)))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn email_exists(&self, email: &str) -> Result<bool> {
        let response = self
            .http
            .get(self.endpoint(&format!("/users/email-exists/{}", email)))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    // --- Conversations ---

    pub async fn upsert_conversation(&self, conversation: &Conversation) -> Result<Conversation> {
        let response = self
            .http
            .post(self.endpoint("/chat/conversation"))
            .json(conversation)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn get_conversations(&self, user_id: i64) -> Result<Vec<Conversation>> {
        let response = self
            .http
            .get(self.endpoint(&format!("/chat/conversation/{}", user_id)))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn delete_conversation(&self, conversation_id: i64) -> Result<()> {
        let response = self
            .http
            .delete(self.endpoint(&format!("/chat/conversation/{}", conversation_id)))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    // --- Messages ---

    pub async fn create_message(&self, entity: &ChatMessageEntity) -> Result<ChatMessageEntity> {
        let response = self
            .http
            .post(self.endpoint("/chat/messages"))
            .json(entity)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn mark_all_messages_read(&self, user_id: i64, conversation_id: i64) -> Result<()> {
        info!(
            "Marking messages as read for conversation {}",
            conversation_id
        );
        let response = self
            .http
            .post(self.endpoint(&format!(
                "/chat/messages/read/{}/{}",
                user_id, conversation_id
            )))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn get_messages_by_conversation(
        &self,
        conversation_id: i64,
        user_id: i64,
    ) -> Result<Vec<ChatMessageEntity>> {
        let response = self
            .http
            .get(self.endpoint(&format!(
                "/chat/messages/conversation/{}/{}",
                conversation_id, user_id
            )))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn get_unread_messages(
        &self,
        user_id: i64,
        conversation_id: i64,
    ) -> Result<Vec<ChatMessageEntity>> {
        let response = self
            .http
            .get(self.endpoint(&format!(
                "/chat/messages/unread/{}/{}",
                user_id, conversation_id
            )))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    // --- Agents ---

    pub async fn get_agent_host_url(&self, user_id: i64, agent_id: i64) -> Result<String> {
        let response = self
            .http
            .get(self.endpoint(&format!("/agents/host-url/{}/{}", user_id, agent_id)))
            .send()
            .await?;
        Ok(Self::check(response).await?.text().await?)
    }

    // --- Billing ---

    pub async fn get_open_billing_cycle(&self, owner_id: i64) -> Result<BillingCycleEntity> {
        let response = self
            .http
            .get(self.endpoint(&format!("/billing/cycle/{}", owner_id)))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }
}
