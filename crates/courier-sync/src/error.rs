use thiserror::Error;

use courier_shared::{ConversationId, DeliveryError, MessageId, ValidationError};
use courier_store::StoreError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("No user is signed in")]
    NotSignedIn,

    #[error("Unknown conversation: {0}")]
    UnknownConversation(ConversationId),

    #[error("Unknown message: {0}")]
    UnknownMessage(MessageId),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Message {id} reached the lifetime limit of {attempts} delivery attempts")]
    RetryLimitReached { id: MessageId, attempts: u32 },

    #[error("Store lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, SyncError>;
