//! 记忆层：回合对话（含续接令牌）、会话恢复重放、风格档案缓存

pub mod continuation;
pub mod conversation;
pub mod profile_cache;

pub use continuation::{goal_of, opening_message, replay, resume_note, suggested_step};
pub use conversation::{Conversation, Message, Part, Role};
pub use profile_cache::{FileProfileCache, InMemoryProfileCache, ProfileCache};
