pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{DeliveryError, RejectionKind, ValidationError};
pub use types::{ConversationId, DeliveryStatus, MessageId, SyncStatus, UserId};
