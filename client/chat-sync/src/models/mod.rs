pub mod conversation;
pub mod message;
pub mod read_marker;

pub use conversation::Conversation;
pub use message::{
    ClientKey, ConversationId, Message, MessageId, MessageIdentity, MessageRow, NewMessage,
    TimelineEntry, UserId,
};
pub use read_marker::{DeliveryState, ReadMarker};
