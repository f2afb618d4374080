use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::api::ApiClient;
use crate::cache::LocalCache;
use crate::error::Result;
use crate::models::entities::messages_from_entities;
use crate::state::ChatStore;

/// Background poller for messages the agent produced outside an active
/// stream. Every tick it fetches unread messages for the selected
/// conversation, merges them into the store and the local cache, and
/// marks them read.
pub struct UnreadPoller {
    api: ApiClient,
    cache: LocalCache,
    store: Arc<ChatStore>,
    user_id: i64,
    poll_interval: Duration,
}

impl UnreadPoller {
    pub fn new(
        api: ApiClient,
        cache: LocalCache,
        store: Arc<ChatStore>,
        user_id: i64,
        poll_interval: Duration,
    ) -> Self {
        Self {
            api,
            cache,
            store,
            user_id,
            poll_interval,
        }
    }

    /// Run the poll loop on its own task. A failed tick is logged and the
    /// loop keeps going.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick of tokio's interval fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.poll_once().await {
                    warn!("Unread poll failed: {}", e);
                    self.store
                        .notify_error(format!("Not possible to fetch unread messages: {}", e));
                }
            }
        })
    }

    /// One poll cycle. A no-op when nothing is selected or the selected
    /// conversation was never persisted.
    pub async fn poll_once(&self) -> Result<()> {
        let Some(conversation) = self.store.selected_conversation().await else {
            return Ok(());
        };
        let Some(conversation_id) = conversation.id else {
            return Ok(());
        };

        let entities = self
            .api
            .get_unread_messages(self.user_id, conversation_id)
            .await?;
        if entities.is_empty() {
            return Ok(());
        }
        debug!(
            "Poll found {} unread entities for conversation {}",
            entities.len(),
            conversation_id
        );

        let has_unread = entities.iter().any(|e| e.user_unread == Some(true));
        let incoming = messages_from_entities(&entities);
        if let Some(merged) = self.store.merge_unread(conversation_id, incoming).await {
            if let Err(e) = self.cache.save_conversation(&merged) {
                warn!("Failed to cache conversation: {}", e);
            }
        }

        if has_unread {
            let api = self.api.clone();
            let user_id = self.user_id;
            tokio::spawn(async move {
                if let Err(e) = api.mark_all_messages_read(user_id, conversation_id).await {
                    error!("Error marking messages as read: {}", e);
                }
            });
        }
        Ok(())
    }
}
