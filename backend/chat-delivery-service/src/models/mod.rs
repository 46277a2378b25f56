pub mod conversation;
pub mod message;
pub mod notification;

pub use conversation::{
    Conversation, ConversationKind, ConversationSummary, GroupInvite, SendTarget,
};
pub use message::{AppendOutcome, DeliveryState, HistoryRange, Message, NewMessage};
pub use notification::Notification;
