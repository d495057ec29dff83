use callcore::{CallId, InvalidStatusTransition};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("call record not found: {0}")]
    NotFound(CallId),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidStatusTransition),

    #[error("change subscription closed")]
    SubscriptionClosed,

    #[error("record store backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
