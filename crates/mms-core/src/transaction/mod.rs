pub mod notification;
pub mod read_rec;
pub mod retrieve;
pub mod send;

use crate::config::TransactionSettings;
use crate::error::CoreError;
use crate::ids::{MessageRef, ServiceId, TransactionId};
use crate::pdu::{MessageType, PduCodec};
use crate::state::TransactionState;
use crate::store::MessageStore;
use crate::transport::MmsTransport;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    Notification,
    Retrieve,
    Send,
    ReadRec,
}

impl TransactionKind {
    /// Transaction that services a pending row of the given message type.
    pub fn for_pending(msg_type: MessageType) -> Option<Self> {
        match msg_type {
            MessageType::NotificationInd => Some(TransactionKind::Retrieve),
            MessageType::ReadRecInd => Some(TransactionKind::ReadRec),
            MessageType::SendReq => Some(TransactionKind::Send),
            _ => None,
        }
    }
}

impl Display for TransactionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TransactionKind::Notification => "notification",
            TransactionKind::Retrieve => "retrieve",
            TransactionKind::Send => "send",
            TransactionKind::ReadRec => "read-rec",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TransactionTarget {
    Stored(MessageRef),
    Push(Vec<u8>),
}

impl TransactionTarget {
    pub fn message_ref(&self) -> Option<MessageRef> {
        match self {
            TransactionTarget::Stored(uri) => Some(*uri),
            TransactionTarget::Push(_) => None,
        }
    }
}

impl Display for TransactionTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionTarget::Stored(uri) => write!(f, "{}", uri),
            TransactionTarget::Push(bytes) => write!(f, "push[{} bytes]", bytes.len()),
        }
    }
}

/// Collaborators a protocol flow runs against.
#[derive(Clone)]
pub struct TransactionContext {
    pub store: Arc<dyn MessageStore>,
    pub transport: Arc<dyn MmsTransport>,
    pub codec: Arc<dyn PduCodec>,
    pub auto_retrieve: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Created,
    Running,
    Finished,
}

const PHASE_CREATED: u8 = 0;
const PHASE_RUNNING: u8 = 1;
const PHASE_FINISHED: u8 = 2;

struct Inner {
    id: TransactionId,
    kind: TransactionKind,
    target: TransactionTarget,
    service_id: ServiceId,
    settings: TransactionSettings,
    phase: AtomicU8,
    state: watch::Sender<TransactionState>,
}

/// One protocol exchange with the relay. Cloning shares the instance.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<Inner>,
}

impl Transaction {
    pub fn new(
        kind: TransactionKind,
        target: TransactionTarget,
        service_id: ServiceId,
        settings: TransactionSettings,
    ) -> Self {
        let (state, _) = watch::channel(TransactionState::initialized());
        Self {
            inner: Arc::new(Inner {
                id: TransactionId::random(),
                kind,
                target,
                service_id,
                settings,
                phase: AtomicU8::new(PHASE_CREATED),
                state,
            }),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.inner.id
    }

    pub fn kind(&self) -> TransactionKind {
        self.inner.kind
    }

    pub fn target(&self) -> &TransactionTarget {
        &self.inner.target
    }

    pub fn service_id(&self) -> ServiceId {
        self.inner.service_id
    }

    pub fn settings(&self) -> &TransactionSettings {
        &self.inner.settings
    }

    /// Same kind against the same target.
    pub fn is_equivalent(&self, other: &Transaction) -> bool {
        self.inner.kind == other.inner.kind && self.inner.target == other.inner.target
    }

    pub fn is_same(&self, other: &Transaction) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn state(&self) -> TransactionState {
        self.inner.state.borrow().clone()
    }

    pub fn phase(&self) -> Phase {
        match self.inner.phase.load(Ordering::SeqCst) {
            PHASE_CREATED => Phase::Created,
            PHASE_RUNNING => Phase::Running,
            _ => Phase::Finished,
        }
    }

    /// Completion channel; resolves once the state leaves `Initialized`.
    pub fn subscribe(&self) -> watch::Receiver<TransactionState> {
        self.inner.state.subscribe()
    }

    /// Starts the exchange on its own task and returns immediately.
    pub fn process(
        &self,
        ctx: TransactionContext,
        permits: Arc<Semaphore>,
    ) -> Result<JoinHandle<()>, CoreError> {
        self.inner
            .phase
            .compare_exchange(
                PHASE_CREATED,
                PHASE_RUNNING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| CoreError::Validation("transaction_already_started".to_string()))?;
        let txn = self.clone();
        Ok(tokio::spawn(async move {
            let fallback = TransactionState::failed(txn.target().message_ref());
            let state = match permits.acquire_owned().await {
                Ok(_permit) => {
                    let kind = txn.kind();
                    let target = txn.target().clone();
                    let settings = txn.settings().clone();
                    let worker = tokio::spawn(async move {
                        execute(kind, &target, &settings, &ctx).await
                    });
                    match worker.await {
                        Ok(state) => state,
                        Err(err) => {
                            warn!("{} transaction {} aborted: {}", txn.kind(), txn.id(), err);
                            fallback
                        }
                    }
                }
                Err(_) => fallback,
            };
            txn.finish(state);
        }))
    }

    fn finish(&self, state: TransactionState) {
        let state = if state.is_terminal() {
            state
        } else {
            TransactionState::failed(self.target().message_ref())
        };
        debug!(
            "{} transaction {} finished: {:?}",
            self.kind(),
            self.id(),
            state.status
        );
        self.inner.phase.store(PHASE_FINISHED, Ordering::SeqCst);
        self.inner.state.send_replace(state);
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("target", &self.inner.target)
            .field("service_id", &self.inner.service_id)
            .finish()
    }
}

/// Runs the protocol flow for `kind` to completion.
pub async fn execute(
    kind: TransactionKind,
    target: &TransactionTarget,
    settings: &TransactionSettings,
    ctx: &TransactionContext,
) -> TransactionState {
    match (kind, target) {
        (TransactionKind::Notification, _) => notification::run(target, settings, ctx).await,
        (TransactionKind::Retrieve, TransactionTarget::Stored(uri)) => {
            retrieve::run(*uri, settings, ctx).await
        }
        (TransactionKind::Send, TransactionTarget::Stored(uri)) => {
            send::run(*uri, settings, ctx).await
        }
        (TransactionKind::ReadRec, TransactionTarget::Stored(uri)) => {
            read_rec::run(*uri, settings, ctx).await
        }
        (kind, TransactionTarget::Push(_)) => {
            warn!("{} transaction cannot run from push data", kind);
            TransactionState::failed(None)
        }
    }
}

pub(crate) fn log_failure(kind: TransactionKind, target: &dyn Display, err: &CoreError) {
    if err.is_transport() {
        warn!("{} {}: transport failure: {}", kind, target, err);
    } else if err.is_protocol() {
        warn!("{} {}: invalid response pdu: {}", kind, target, err);
    } else {
        warn!("{} {}: {}", kind, target, err);
    }
}
