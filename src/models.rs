mod chat;
mod message;
mod task;
pub mod timestamp;
mod user;

pub use chat::{Chat, ChatMetadata, ChatPatch, ChatStatus, DEFAULT_CHAT_TITLE};
pub use message::{
    Attachment, Delivery, DeliveryState, Message, MessagePatch, Reaction, ReactionType, Role,
};
pub use task::{NewTask, Task, TaskKind, TaskPatch, TaskStatus};
pub use user::{Profile, ProfileRole, Session};

use serde::{Deserialize, Deserializer};

/// Reads an explicit `null` column as the field's default.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
