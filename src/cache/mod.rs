use std::path::Path;

use crate::error::{ClientError, Result};
use crate::models::chat::{Conversation, Folder, Settings};

const KEY_SELECTED_CONVERSATION: &str = "selectedConversation";
const KEY_CONVERSATION_HISTORY: &str = "conversationHistory";
const KEY_FOLDERS: &str = "folders";
const KEY_SETTINGS: &str = "settings";

/// Local key-value cache for session continuity: conversation snapshots and
/// UI preferences, written on every conversation mutation and read on load.
#[derive(Clone)]
pub struct LocalCache {
    db: sled::Db,
}

impl LocalCache {
    pub fn open(data_dir: &Path) -> Result<Self> {
        let db = sled::open(data_dir.join("cache.db"))
            .map_err(|e| ClientError::Storage(format!("Failed to open local cache: {}", e)))?;
        Ok(Self { db })
    }

    fn put<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.db
            .insert(key.as_bytes(), bytes)
            .map_err(|e| ClientError::Storage(format!("Failed to write '{}': {}", key, e)))?;
        Ok(())
    }

    fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let entry = self
            .db
            .get(key.as_bytes())
            .map_err(|e| ClientError::Storage(format!("Failed to read '{}': {}", key, e)))?;
        match entry {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.put(KEY_SELECTED_CONVERSATION, conversation)
    }

    pub fn load_selected_conversation(&self) -> Result<Option<Conversation>> {
        self.get(KEY_SELECTED_CONVERSATION)
    }

    pub fn save_conversations(&self, conversations: &[Conversation]) -> Result<()> {
        self.put(KEY_CONVERSATION_HISTORY, &conversations)
    }

    pub fn load_conversations(&self) -> Result<Vec<Conversation>> {
        Ok(self.get(KEY_CONVERSATION_HISTORY)?.unwrap_or_default())
    }

    pub fn save_folders(&self, folders: &[Folder]) -> Result<()> {
        self.put(KEY_FOLDERS, &folders)
    }

    pub fn load_folders(&self) -> Result<Vec<Folder>> {
        Ok(self.get(KEY_FOLDERS)?.unwrap_or_default())
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        self.put(KEY_SETTINGS, settings)
    }

    pub fn load_settings(&self) -> Result<Settings> {
        Ok(self.get(KEY_SETTINGS)?.unwrap_or_default())
    }

    pub fn clear_selected_conversation(&self) -> Result<()> {
        self.db
            .remove(KEY_SELECTED_CONVERSATION.as_bytes())
            .map_err(|e| ClientError::Storage(format!("Failed to clear selection: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::Message;
    use crate::models::entities::UserEntity;

    fn open_temp() -> (LocalCache, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = LocalCache::open(dir.path()).expect("open cache");
        (cache, dir)
    }

    #[test]
    fn conversation_round_trips() {
        let (cache, _dir) = open_temp();
        let mut conversation = Conversation::new("Trip", UserEntity::with_id(4));
        conversation.id = Some(11);
        conversation.messages.push(Message::user("hello"));

        cache.save_conversation(&conversation).expect("save");
        let loaded = cache
            .load_selected_conversation()
            .expect("load")
            .expect("present");
        assert_eq!(loaded.id, Some(11));
        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(loaded.messages[0].content, "hello");
    }

    #[test]
    fn conversation_list_round_trips() {
        let (cache, _dir) = open_temp();
        let list = vec![
            Conversation::new("a", UserEntity::with_id(1)),
            Conversation::new("b", UserEntity::with_id(1)),
        ];
        cache.save_conversations(&list).expect("save");
        let loaded = cache.load_conversations().expect("load");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].name, "b");
    }

    #[test]
    fn folder_list_round_trips() {
        let (cache, _dir) = open_temp();
        let folders = vec![Folder::new("Work", "chat"), Folder::new("Ideas", "chat")];
        cache.save_folders(&folders).expect("save");
        let loaded = cache.load_folders().expect("load");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].name, "Work");
        assert_ne!(loaded[0].id, loaded[1].id);
    }

    #[test]
    fn missing_keys_yield_defaults() {
        let (cache, _dir) = open_temp();
        assert!(cache.load_selected_conversation().expect("load").is_none());
        assert!(cache.load_conversations().expect("load").is_empty());
        assert_eq!(cache.load_settings().expect("load").theme, "dark");
    }

    #[test]
    fn clear_selected_conversation_removes_entry() {
        let (cache, _dir) = open_temp();
        let conversation = Conversation::new("gone", UserEntity::with_id(2));
        cache.save_conversation(&conversation).expect("save");
        cache.clear_selected_conversation().expect("clear");
        assert!(cache.load_selected_conversation().expect("load").is_none());
    }
}
