use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

const CONTENT_PREFIX: &str = "content://mms/";

/// Reference to a row in the message store, rendered as `content://mms/<id>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageRef(u64);

impl MessageRef {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl Display for MessageRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", CONTENT_PREFIX, self.0)
    }
}

impl FromStr for MessageRef {
    type Err = crate::error::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tail = s
            .strip_prefix(CONTENT_PREFIX)
            .ok_or_else(|| crate::error::CoreError::Validation("message_ref".to_string()))?;
        tail.parse::<u64>()
            .map(MessageRef)
            .map_err(|_| crate::error::CoreError::Validation("message_ref".to_string()))
    }
}

/// Identifies one `submit` call; the unit of work the host waits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId(pub u64);

impl Display for ServiceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for TransactionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
