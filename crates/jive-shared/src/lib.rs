//! # jive-shared
//!
//! Types shared by the Jive chat store and server: identifiers, the
//! message body model, and the JSON event protocol spoken over the
//! WebSocket.

pub mod constants;
pub mod error;
pub mod message;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use message::{FileMetadata, MessageBody, MessageKind, SystemEffect};
pub use types::{ConversationId, ConversationRef, MessageId, Role, UserId};
