pub mod chat;
pub mod entities;

pub use chat::{Conversation, Folder, Message, Role, Settings};
pub use entities::{
    messages_from_entities, BillingCycleEntity, ChatMessageEntity, UserEntity,
};
