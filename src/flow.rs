use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use log::{error, info, warn};
use tokio::time::sleep;

use crate::agent::{AgentClient, AgentMessageRequest};
use crate::api::ApiClient;
use crate::cache::LocalCache;
use crate::error::{ClientError, Result};
use crate::models::chat::{Conversation, Message};
use crate::models::entities::{messages_from_entities, ChatMessageEntity, UserEntity};
use crate::state::{merge_messages, ChatStore};

/// Shared stop signal for an in-flight send, checked once per chunk read.
/// Setting it does not preempt a read already in progress.
#[derive(Clone, Debug, Default)]
pub struct StopFlag {
    inner: Arc<AtomicBool>,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.inner.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.inner.store(false, Ordering::Relaxed);
    }
}

/// Orchestrates the chat operations: the send/stream/merge flow at the
/// center, plus conversation management around it. One send runs its steps
/// strictly in sequence; concurrent sends are not serialized, matching the
/// last-write-wins discipline of the store.
pub struct ChatFlow {
    api: ApiClient,
    agent: AgentClient,
    cache: LocalCache,
    store: Arc<ChatStore>,
    user_id: i64,
    agent_id: i64,
    stream_delay: Duration,
    reconcile_delay: Duration,
}

impl ChatFlow {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: ApiClient,
        agent: AgentClient,
        cache: LocalCache,
        store: Arc<ChatStore>,
        user_id: i64,
        agent_id: i64,
        stream_delay: Duration,
        reconcile_delay: Duration,
    ) -> Self {
        Self {
            api,
            agent,
            cache,
            store,
            user_id,
            agent_id,
            stream_delay,
            reconcile_delay,
        }
    }

    pub fn store(&self) -> Arc<ChatStore> {
        Arc::clone(&self.store)
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    // --- Startup ---

    /// Fetch the conversation list, the agent host URL, and the open billing
    /// cycle, seeding the store. Billing failure is logged but not fatal.
    pub async fn load_user_data(&self) -> Result<()> {
        let conversations = self.api.get_conversations(self.user_id).await?;
        info!("Loaded {} conversations", conversations.len());
        self.store.set_conversations(conversations).await;

        let host_url = self.api.get_agent_host_url(self.user_id, self.agent_id).await?;
        info!("Agent host url: {}", host_url);
        self.store.set_agent_host_url(host_url).await;

        match self.api.get_open_billing_cycle(self.user_id).await {
            Ok(cycle) => self.store.set_billing_cycle(cycle).await,
            Err(e) => warn!("Failed to fetch billing cycle: {}", e),
        }
        Ok(())
    }

    // --- Send-and-stream flow ---

    /// Send a user message: persist it, notify the agent host, stream the
    /// reply into the selected conversation, then reconcile out-of-band
    /// messages. `delete_count` trailing messages are discarded first
    /// (edit-and-resend). Every failure path resets the busy flags.
    pub async fn send_message(
        &self,
        mut message: Message,
        delete_count: usize,
        stop: &StopFlag,
    ) -> Result<()> {
        let Some(selected) = self.store.selected_conversation().await else {
            return Ok(());
        };
        message.timestamp = Some(Utc::now());
        let content = message.content.clone();

        let mut updated = selected.clone();
        updated.messages = build_updated_messages(&selected.messages, delete_count, message);

        self.store.begin_send().await;

        // Step 1: persist the user message before anything touches the agent
        let entity = ChatMessageEntity::for_send(&content, &selected, self.user_id);
        let created = match self.api.create_message(&entity).await {
            Ok(created) => created,
            Err(e) => {
                error!("Failed to persist message: {}", e);
                self.store
                    .fail(format!("Not possible to send message: {}", e))
                    .await;
                return Err(e);
            }
        };
        self.store.message_persisted(created.clone());
        self.store.publish_selected(updated.clone()).await;

        // Step 2: agent dispatch
        let dispatched = self.dispatch(&created, &updated).await;
        let host_url = match dispatched {
            Ok(host_url) => host_url,
            Err(e) => {
                error!("Agent dispatch failed: {}", e);
                self.store.fail(e.to_string()).await;
                return Err(e);
            }
        };
        if let Err(e) = self.cache.save_conversation(&updated) {
            warn!("Failed to cache conversation: {}", e);
        }

        // Step 3 + 4: stream the reply, then reconcile and persist
        sleep(self.stream_delay).await;
        match self.stream_and_reconcile(updated, &content, &host_url, stop).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("Failed to receive the reply stream: {}", e);
                self.store
                    .fail(format!("Not possible to receive the message: {}", e))
                    .await;
                Err(e)
            }
        }
    }

    async fn dispatch(
        &self,
        created: &ChatMessageEntity,
        conversation: &Conversation,
    ) -> Result<String> {
        let host_url = self
            .store
            .agent_host_url()
            .await
            .ok_or_else(|| ClientError::Config("Agent host URL is not set".to_string()))?;
        let chat_message_id = created
            .id
            .ok_or_else(|| ClientError::Dispatch("Persisted message has no id".to_string()))?;
        let conversation_id = conversation
            .id
            .ok_or_else(|| ClientError::Dispatch("Conversation has no backend id".to_string()))?;

        let request = AgentMessageRequest {
            chat_message_id,
            conversation_id,
        };
        self.agent.post_message(&host_url, &request).await?;
        Ok(host_url)
    }

    async fn stream_and_reconcile(
        &self,
        mut conversation: Conversation,
        content: &str,
        host_url: &str,
        stop: &StopFlag,
    ) -> Result<()> {
        let conversation_id = conversation
            .id
            .ok_or_else(|| ClientError::Stream("Conversation has no backend id".to_string()))?;
        let stream = self.agent.open_reply_stream(host_url, conversation_id).await?;

        // First exchange names the conversation after the user message
        if conversation.messages.len() == 1 {
            conversation.name = Conversation::auto_name(content);
        }

        let (mut conversation, cancelled) =
            self.consume_reply_stream(conversation, stream, stop).await?;

        sleep(self.reconcile_delay).await;
        if let Err(e) = self.reconcile_unread(&mut conversation).await {
            warn!("Reconciliation failed: {}", e);
            self.store
                .notify_error(format!("Not possible to fetch unread messages: {}", e));
        }

        if let Err(e) = self.cache.save_conversation(&conversation) {
            warn!("Failed to cache conversation: {}", e);
        }
        let conversations = self.store.finish_send(conversation, cancelled).await;
        if let Err(e) = self.cache.save_conversations(&conversations) {
            warn!("Failed to cache conversation list: {}", e);
        }
        Ok(())
    }

    /// Consume the chunked reply: the first chunk appends the assistant
    /// message, later chunks replace its content with the accumulated
    /// buffer. `loading` clears on the first byte, not at stream end. The
    /// stop flag is checked before each read; dropping the stream aborts
    /// the request.
    async fn consume_reply_stream<S, E>(
        &self,
        mut conversation: Conversation,
        mut stream: S,
        stop: &StopFlag,
    ) -> Result<(Conversation, bool)>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        let mut text = String::new();
        let mut is_first = true;
        let mut cancelled = false;

        loop {
            if stop.is_stopped() {
                cancelled = true;
                break;
            }
            let Some(chunk) = stream.next().await else {
                break;
            };
            let chunk = chunk.map_err(|e| ClientError::Stream(e.to_string()))?;
            let chunk_text = String::from_utf8_lossy(&chunk).into_owned();
            text.push_str(&chunk_text);

            if is_first {
                is_first = false;
                conversation.messages.push(Message::assistant(chunk_text.clone()));
            } else if let Some(last) = conversation.messages.last_mut() {
                last.content = text.clone();
            }
            self.store
                .stream_update(conversation.clone(), chunk_text)
                .await;
        }
        drop(stream);

        Ok((conversation, cancelled))
    }

    /// Fetch messages the agent produced out-of-band and merge them into the
    /// conversation, skipping ones already rendered by the stream path.
    /// Marking them read is fire-and-forget.
    pub async fn reconcile_unread(&self, conversation: &mut Conversation) -> Result<usize> {
        let Some(conversation_id) = conversation.id else {
            return Ok(0);
        };
        let entities = self
            .api
            .get_unread_messages(self.user_id, conversation_id)
            .await?;
        if entities.is_empty() {
            return Ok(0);
        }

        if entities.iter().any(|e| e.user_unread == Some(true)) {
            self.mark_read_in_background(conversation_id);
        }

        let incoming = messages_from_entities(&entities);
        Ok(merge_messages(&mut conversation.messages, incoming))
    }

    fn mark_read_in_background(&self, conversation_id: i64) {
        let api = self.api.clone();
        let store = Arc::clone(&self.store);
        let user_id = self.user_id;
        tokio::spawn(async move {
            if let Err(e) = api.mark_all_messages_read(user_id, conversation_id).await {
                error!("Error marking messages as read: {}", e);
                store.notify_error(format!("Error marking messages as read: {}", e));
            }
        });
    }

    // --- Conversation management ---

    pub async fn new_conversation(&self) -> Result<Conversation> {
        self.store.set_loading(true).await;
        let conversation =
            Conversation::new("New Conversation", UserEntity::with_id(self.user_id));
        match self.api.upsert_conversation(&conversation).await {
            Ok(saved) => {
                if let Err(e) = self.cache.save_conversation(&saved) {
                    warn!("Failed to cache conversation: {}", e);
                }
                let conversations = self.store.insert_conversation(saved.clone()).await;
                if let Err(e) = self.cache.save_conversations(&conversations) {
                    warn!("Failed to cache conversation list: {}", e);
                }
                Ok(saved)
            }
            Err(e) => {
                error!("Failed to create conversation: {}", e);
                self.store.set_loading(false).await;
                self.store
                    .notify_error(format!("Not possible to update the conversation: {}", e));
                Err(e)
            }
        }
    }

    /// Open a conversation: fetch its full message history, mark any unread
    /// entities read (fire-and-forget), and publish it as selected.
    pub async fn select_conversation(&self, mut conversation: Conversation) -> Result<()> {
        self.store.set_loading(true).await;
        let conversation_id = match conversation.id {
            Some(id) => id,
            None => {
                self.store.set_loading(false).await;
                return Err(ClientError::Config(
                    "Conversation has no backend id".to_string(),
                ));
            }
        };

        let entities = match self
            .api
            .get_messages_by_conversation(conversation_id, self.user_id)
            .await
        {
            Ok(entities) => entities,
            Err(e) => {
                error!("Failed to fetch conversation messages: {}", e);
                self.store.set_loading(false).await;
                self.store.notify_error(format!(
                    "Not possible to fetch conversation messages: {}",
                    e
                ));
                return Err(e);
            }
        };

        if entities.iter().any(|e| e.user_unread == Some(true)) {
            self.mark_read_in_background(conversation_id);
        }

        conversation.messages = messages_from_entities(&entities);
        self.store.select_conversation(conversation.clone()).await;
        if let Err(e) = self.cache.save_conversation(&conversation) {
            warn!("Failed to cache conversation: {}", e);
        }
        Ok(())
    }

    /// Apply a field change (e.g. rename, folder move) and upsert it.
    pub async fn update_conversation(&self, conversation: Conversation) -> Result<Conversation> {
        let saved = match self.api.upsert_conversation(&conversation).await {
            Ok(saved) => saved,
            Err(e) => {
                error!("Failed to update conversation: {}", e);
                self.store
                    .notify_error(format!("Not possible to update the conversation: {}", e));
                return Err(e);
            }
        };
        let conversations = self.store.update_conversation(saved.clone()).await;
        if let Err(e) = self.cache.save_conversation(&saved) {
            warn!("Failed to cache conversation: {}", e);
        }
        if let Err(e) = self.cache.save_conversations(&conversations) {
            warn!("Failed to cache conversation list: {}", e);
        }
        Ok(saved)
    }

    pub async fn delete_conversation(&self, conversation_id: i64) -> Result<()> {
        if let Err(e) = self.api.delete_conversation(conversation_id).await {
            error!("Failed to delete conversation: {}", e);
            self.store
                .notify_error(format!("Not possible to delete the conversation: {}", e));
            return Err(e);
        }
        let conversations = self.store.remove_conversation(conversation_id).await;
        if let Err(e) = self.cache.save_conversations(&conversations) {
            warn!("Failed to cache conversation list: {}", e);
        }
        if self.store.selected_conversation().await.is_none() {
            if let Err(e) = self.cache.clear_selected_conversation() {
                warn!("Failed to clear cached selection: {}", e);
            }
        }
        Ok(())
    }
}

/// Compute the message list for a send: pop `delete_count` trailing
/// messages (edit-and-resend), then append the new one.
pub fn build_updated_messages(
    existing: &[Message],
    delete_count: usize,
    message: Message,
) -> Vec<Message> {
    let keep = existing.len().saturating_sub(delete_count);
    let mut messages: Vec<Message> = existing[..keep].to_vec();
    messages.push(message);
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::Role;
    use futures::stream;
    use std::convert::Infallible;
    use std::sync::atomic::AtomicUsize;

    fn flow_with_store() -> (ChatFlow, Arc<ChatStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let api = ApiClient::new("http://127.0.0.1:9").expect("api client");
        let agent = AgentClient::new("test-token").expect("agent client");
        let cache = LocalCache::open(dir.path()).expect("cache");
        let store = Arc::new(ChatStore::new());
        let flow = ChatFlow::new(
            api,
            agent,
            cache,
            Arc::clone(&store),
            1,
            0,
            Duration::from_millis(0),
            Duration::from_millis(0),
        );
        (flow, store, dir)
    }

    fn conversation_with(messages: Vec<Message>) -> Conversation {
        Conversation {
            id: Some(42),
            name: "test".to_string(),
            messages,
            folder_id: None,
            user: UserEntity::with_id(1),
        }
    }

    fn chunks(parts: &[&'static str]) -> Vec<std::result::Result<Bytes, Infallible>> {
        parts.iter().map(|p| Ok(Bytes::from_static(p.as_bytes()))).collect()
    }

    #[test]
    fn edit_and_resend_truncates_before_appending() {
        let existing = vec![
            Message::user("m0"),
            Message::assistant("m1"),
            Message::user("m2"),
            Message::assistant("m3"),
            Message::user("m4"),
        ];
        // Editing index 2 of a 5-message list: delete_count = 5 - 2 = 3
        let updated = build_updated_messages(&existing, 3, Message::user("edited"));
        assert_eq!(updated.len(), 3);
        assert_eq!(updated[0].content, "m0");
        assert_eq!(updated[1].content, "m1");
        assert_eq!(updated[2].content, "edited");
    }

    #[test]
    fn delete_count_larger_than_list_keeps_only_new_message() {
        let existing = vec![Message::user("m0")];
        let updated = build_updated_messages(&existing, 5, Message::user("fresh"));
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].content, "fresh");
    }

    #[tokio::test]
    async fn stream_appends_one_assistant_message_with_full_text() {
        let (flow, _store, _dir) = flow_with_store();
        let conversation = conversation_with(vec![Message::user("question")]);
        let stream = stream::iter(chunks(&["Hello", ", ", "world"]));

        let (merged, cancelled) = flow
            .consume_reply_stream(conversation, stream, &StopFlag::new())
            .await
            .expect("stream");

        assert!(!cancelled);
        assert_eq!(merged.messages.len(), 2);
        assert_eq!(merged.messages[1].role, Role::Assistant);
        assert_eq!(merged.messages[1].content, "Hello, world");
    }

    #[tokio::test]
    async fn stream_clears_loading_on_first_chunk() {
        let (flow, store, _dir) = flow_with_store();
        store.begin_send().await;
        let conversation = conversation_with(vec![Message::user("q")]);
        let stream = stream::iter(chunks(&["partial"]));

        flow.consume_reply_stream(conversation, stream, &StopFlag::new())
            .await
            .expect("stream");

        let state = store.snapshot().await;
        assert!(!state.loading);
        // Streaming flag stays up until finalization
        assert!(state.message_is_streaming);
    }

    #[tokio::test]
    async fn stop_flag_halts_after_current_chunk() {
        let (flow, _store, _dir) = flow_with_store();
        let conversation = conversation_with(vec![Message::user("q")]);
        let stop = StopFlag::new();

        let yielded = Arc::new(AtomicUsize::new(0));
        let stop_after_two = {
            let stop = stop.clone();
            let yielded = Arc::clone(&yielded);
            stream::iter(chunks(&["one ", "two ", "three"])).map(move |chunk| {
                if yielded.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                    stop.stop();
                }
                chunk
            })
        };

        let (merged, cancelled) = flow
            .consume_reply_stream(conversation, stop_after_two, &stop)
            .await
            .expect("stream");

        assert!(cancelled);
        assert_eq!(merged.messages.last().expect("assistant").content, "one two ");
    }

    #[tokio::test]
    async fn stopped_before_first_chunk_appends_nothing() {
        let (flow, _store, _dir) = flow_with_store();
        let conversation = conversation_with(vec![Message::user("q")]);
        let stop = StopFlag::new();
        stop.stop();
        let stream = stream::iter(chunks(&["never seen"]));

        let (merged, cancelled) = flow
            .consume_reply_stream(conversation, stream, &stop)
            .await
            .expect("stream");

        assert!(cancelled);
        assert_eq!(merged.messages.len(), 1);
    }
}
