use crate::ids::MessageRef;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Initialized,
    Success,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionState {
    pub status: TransactionStatus,
    pub content_uri: Option<MessageRef>,
}

impl TransactionState {
    pub fn initialized() -> Self {
        Self {
            status: TransactionStatus::Initialized,
            content_uri: None,
        }
    }

    pub fn success(uri: MessageRef) -> Self {
        Self {
            status: TransactionStatus::Success,
            content_uri: Some(uri),
        }
    }

    pub fn failed(uri: Option<MessageRef>) -> Self {
        Self {
            status: TransactionStatus::Failed,
            content_uri: uri,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, TransactionStatus::Initialized)
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, TransactionStatus::Success)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, TransactionStatus::Failed)
    }
}

impl Default for TransactionState {
    fn default() -> Self {
        Self::initialized()
    }
}
