pub mod identity;
pub mod message;
pub mod text;

pub use identity::{EntityId, IdError, LocationId};
pub use message::{render_transcript, split_system_prompt, Message, MessageRole};
pub use text::strip_thinking;

pub const CORE_VERSION: &str = env!("CARGO_PKG_VERSION");
