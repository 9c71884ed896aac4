use crate::ids::ServiceId;
use crate::state::TransactionState;
use crate::transaction::TransactionKind;
use tokio::sync::broadcast;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceEvent {
    TransactionCompleted {
        service_id: ServiceId,
        kind: TransactionKind,
        state: TransactionState,
    },
    Idle,
}

pub type EventReceiver = broadcast::Receiver<ServiceEvent>;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServiceEvent>,
}

impl EventBus {
    pub fn new(size: usize) -> Self {
        let (tx, _) = broadcast::channel(size.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ServiceEvent) {
        let _ = self.tx.send(event);
    }
}
