use tokio::sync::{broadcast, RwLock};

use crate::models::chat::{Conversation, Message};
use crate::models::entities::{BillingCycleEntity, ChatMessageEntity};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Shared application state for the chat view tree.
#[derive(Clone, Debug, Default)]
pub struct ChatState {
    pub selected_conversation: Option<Conversation>,
    pub conversations: Vec<Conversation>,
    pub loading: bool,
    pub message_is_streaming: bool,
    pub agent_host_url: Option<String>,
    pub billing_cycle: Option<BillingCycleEntity>,
}

/// Events emitted by the store, one per logical transition. A renderer
/// subscribes and reacts; the store never calls back into the view layer.
#[derive(Clone, Debug)]
pub enum StateEvent {
    SendStarted {
        conversation_id: Option<i64>,
    },
    /// The user message was durably recorded by the backend.
    MessagePersisted {
        entity: ChatMessageEntity,
    },
    ConversationUpdated {
        conversation: Conversation,
    },
    /// Incremental assistant output; `delta` is the newly received chunk.
    AssistantDelta {
        conversation_id: Option<i64>,
        delta: String,
    },
    StreamEnded {
        conversation_id: Option<i64>,
        cancelled: bool,
    },
    UnreadMerged {
        conversation_id: i64,
        count: usize,
    },
    Error {
        message: String,
    },
}

/// State container shared across the send flow, the unread poller, and the
/// driver. Every public method batches its field updates into a single
/// lock acquisition and emits at most one event, so renderers never observe
/// a half-applied transition.
pub struct ChatStore {
    state: RwLock<ChatState>,
    events: broadcast::Sender<StateEvent>,
}

impl Default for ChatStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(ChatState::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: StateEvent) {
        // No receivers is fine (headless use, tests)
        let _ = self.events.send(event);
    }

    pub async fn snapshot(&self) -> ChatState {
        self.state.read().await.clone()
    }

    pub async fn selected_conversation(&self) -> Option<Conversation> {
        self.state.read().await.selected_conversation.clone()
    }

    pub async fn agent_host_url(&self) -> Option<String> {
        self.state.read().await.agent_host_url.clone()
    }

    pub async fn is_streaming(&self) -> bool {
        self.state.read().await.message_is_streaming
    }

    // --- Startup / selection transitions ---

    pub async fn set_conversations(&self, conversations: Vec<Conversation>) {
        self.state.write().await.conversations = conversations;
    }

    pub async fn set_agent_host_url(&self, url: String) {
        self.state.write().await.agent_host_url = Some(url);
    }

    pub async fn set_billing_cycle(&self, cycle: BillingCycleEntity) {
        self.state.write().await.billing_cycle = Some(cycle);
    }

    pub async fn set_loading(&self, loading: bool) {
        self.state.write().await.loading = loading;
    }

    pub async fn select_conversation(&self, conversation: Conversation) {
        {
            let mut state = self.state.write().await;
            state.selected_conversation = Some(conversation.clone());
            state.loading = false;
        }
        self.emit(StateEvent::ConversationUpdated { conversation });
    }

    /// New conversation: select it and prepend it to the list.
    pub async fn insert_conversation(&self, conversation: Conversation) -> Vec<Conversation> {
        let conversations = {
            let mut state = self.state.write().await;
            state.conversations.insert(0, conversation.clone());
            state.selected_conversation = Some(conversation.clone());
            state.loading = false;
            state.conversations.clone()
        };
        self.emit(StateEvent::ConversationUpdated { conversation });
        conversations
    }

    /// Field change on an existing conversation (rename, folder move):
    /// replace its list entry and the selection when it matches.
    pub async fn update_conversation(&self, conversation: Conversation) -> Vec<Conversation> {
        let conversations = {
            let mut state = self.state.write().await;
            for entry in state.conversations.iter_mut() {
                if entry.id == conversation.id {
                    *entry = conversation.clone();
                }
            }
            if state
                .selected_conversation
                .as_ref()
                .map(|c| c.id == conversation.id)
                .unwrap_or(false)
            {
                state.selected_conversation = Some(conversation.clone());
            }
            state.conversations.clone()
        };
        self.emit(StateEvent::ConversationUpdated { conversation });
        conversations
    }

    pub async fn remove_conversation(&self, conversation_id: i64) -> Vec<Conversation> {
        let mut state = self.state.write().await;
        state.conversations.retain(|c| c.id != Some(conversation_id));
        if state
            .selected_conversation
            .as_ref()
            .and_then(|c| c.id)
            == Some(conversation_id)
        {
            state.selected_conversation = None;
        }
        state.conversations.clone()
    }

    // --- Send-flow transitions ---

    pub async fn begin_send(&self) {
        let conversation_id = {
            let mut state = self.state.write().await;
            state.loading = true;
            state.message_is_streaming = true;
            state.selected_conversation.as_ref().and_then(|c| c.id)
        };
        self.emit(StateEvent::SendStarted { conversation_id });
    }

    pub fn message_persisted(&self, entity: ChatMessageEntity) {
        self.emit(StateEvent::MessagePersisted { entity });
    }

    pub async fn publish_selected(&self, conversation: Conversation) {
        self.state.write().await.selected_conversation = Some(conversation.clone());
        self.emit(StateEvent::ConversationUpdated { conversation });
    }

    /// One streamed chunk: clears `loading` (first byte has arrived) and
    /// publishes the conversation with the updated trailing message.
    pub async fn stream_update(&self, conversation: Conversation, delta: String) {
        let conversation_id = conversation.id;
        {
            let mut state = self.state.write().await;
            state.loading = false;
            state.selected_conversation = Some(conversation);
        }
        self.emit(StateEvent::AssistantDelta {
            conversation_id,
            delta,
        });
    }

    /// Finalize a send: publish the reconciled conversation, replace its
    /// list entry (or insert it when the list is empty), clear the
    /// streaming flag. Returns the updated list for caching.
    pub async fn finish_send(
        &self,
        conversation: Conversation,
        cancelled: bool,
    ) -> Vec<Conversation> {
        let conversation_id = conversation.id;
        let conversations = {
            let mut state = self.state.write().await;
            let mut replaced = false;
            for entry in state.conversations.iter_mut() {
                if entry.id == conversation.id {
                    *entry = conversation.clone();
                    replaced = true;
                }
            }
            if !replaced && state.conversations.is_empty() {
                state.conversations.push(conversation.clone());
            }
            state.selected_conversation = Some(conversation);
            state.loading = false;
            state.message_is_streaming = false;
            state.conversations.clone()
        };
        self.emit(StateEvent::StreamEnded {
            conversation_id,
            cancelled,
        });
        conversations
    }

    /// Any failure path: re-enable the input UI and surface the error.
    pub async fn fail(&self, message: String) {
        {
            let mut state = self.state.write().await;
            state.loading = false;
            state.message_is_streaming = false;
        }
        self.emit(StateEvent::Error { message });
    }

    pub fn notify_error(&self, message: String) {
        self.emit(StateEvent::Error { message });
    }

    // --- Poller transitions ---

    /// Merge out-of-band messages into the selected conversation, skipping
    /// ones already rendered via the stream path. Clears both busy flags.
    /// Returns the merged conversation when it was the selected one.
    pub async fn merge_unread(
        &self,
        conversation_id: i64,
        messages: Vec<Message>,
    ) -> Option<Conversation> {
        let outcome = {
            let mut state = self.state.write().await;
            let outcome = match state.selected_conversation.as_mut() {
                Some(selected) if selected.id == Some(conversation_id) => {
                    let count = merge_messages(&mut selected.messages, messages);
                    Some((selected.clone(), count))
                }
                _ => None,
            };
            if outcome.is_some() {
                state.loading = false;
                state.message_is_streaming = false;
            }
            outcome
        };
        let (merged, count) = outcome?;
        if count > 0 {
            self.emit(StateEvent::UnreadMerged {
                conversation_id,
                count,
            });
        }
        Some(merged)
    }
}

/// Append `incoming` messages that are not already present, identified by
/// (role, content). Returns how many were appended.
pub fn merge_messages(existing: &mut Vec<Message>, incoming: Vec<Message>) -> usize {
    let mut appended = 0;
    for message in incoming {
        let duplicate = existing
            .iter()
            .any(|m| m.role == message.role && m.content == message.content);
        if !duplicate {
            existing.push(message);
            appended += 1;
        }
    }
    appended
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::Message;
    use crate::models::entities::UserEntity;

    fn conversation(id: i64) -> Conversation {
        Conversation {
            id: Some(id),
            name: format!("conv-{}", id),
            messages: Vec::new(),
            folder_id: None,
            user: UserEntity::with_id(1),
        }
    }

    #[test]
    fn merge_skips_already_rendered_messages() {
        let mut existing = vec![Message::user("hi"), Message::assistant("hello")];
        let appended = merge_messages(
            &mut existing,
            vec![Message::assistant("hello"), Message::assistant("more")],
        );
        assert_eq!(appended, 1);
        assert_eq!(existing.len(), 3);
        assert_eq!(existing[2].content, "more");
    }

    #[tokio::test]
    async fn begin_send_sets_both_flags() {
        let store = ChatStore::new();
        store.begin_send().await;
        let state = store.snapshot().await;
        assert!(state.loading);
        assert!(state.message_is_streaming);
    }

    #[tokio::test]
    async fn fail_resets_both_flags() {
        let store = ChatStore::new();
        store.begin_send().await;
        store.fail("boom".to_string()).await;
        let state = store.snapshot().await;
        assert!(!state.loading);
        assert!(!state.message_is_streaming);
    }

    #[tokio::test]
    async fn finish_send_replaces_list_entry() {
        let store = ChatStore::new();
        store
            .set_conversations(vec![conversation(1), conversation(2)])
            .await;
        let mut updated = conversation(2);
        updated.name = "renamed".to_string();
        let list = store.finish_send(updated, false).await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].name, "renamed");
    }

    #[tokio::test]
    async fn finish_send_inserts_into_empty_list() {
        let store = ChatStore::new();
        let list = store.finish_send(conversation(9), false).await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, Some(9));
    }

    #[tokio::test]
    async fn merge_unread_ignores_other_conversations() {
        let store = ChatStore::new();
        store.select_conversation(conversation(1)).await;
        let merged = store.merge_unread(2, vec![Message::user("x")]).await;
        assert!(merged.is_none());
    }

    #[tokio::test]
    async fn merge_unread_clears_busy_flags() {
        let store = ChatStore::new();
        store.select_conversation(conversation(1)).await;
        store.begin_send().await;
        let merged = store
            .merge_unread(1, vec![Message::assistant("late reply")])
            .await
            .expect("selected conversation");
        assert_eq!(merged.messages.len(), 1);
        let state = store.snapshot().await;
        assert!(!state.loading);
        assert!(!state.message_is_streaming);
    }
}
