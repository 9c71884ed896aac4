use crate::alarm::AlarmScheduler;
use crate::connectivity::Connectivity;
use crate::error::CoreError;
use crate::ids::MessageRef;
use crate::notify::Notifier;
use crate::pdu::MessageType;
use crate::policy::{Direction, RetryScheme};
use crate::state::TransactionState;
use crate::store::{DownloadState, ErrorType, MessageStore, PendingOperation, PendingUpdate};
use crate::time::Clock;
use crate::transaction::Transaction;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::task::JoinHandle;

const MAX_UPDATE_ATTEMPTS: usize = 3;

/// Turns failed transactions into future retries and keeps the wake-up
/// alarm pointed at the earliest one.
pub struct RetryScheduler {
    store: Arc<dyn MessageStore>,
    connectivity: Arc<dyn Connectivity>,
    alarm: Arc<dyn AlarmScheduler>,
    notifier: Arc<dyn Notifier>,
    scheme: Arc<dyn RetryScheme>,
    clock: Arc<dyn Clock>,
    alarm_horizon_ms: Option<u64>,
}

impl RetryScheduler {
    pub fn new(
        store: Arc<dyn MessageStore>,
        connectivity: Arc<dyn Connectivity>,
        alarm: Arc<dyn AlarmScheduler>,
        notifier: Arc<dyn Notifier>,
        scheme: Arc<dyn RetryScheme>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            connectivity,
            alarm,
            notifier,
            scheme,
            clock,
            alarm_horizon_ms: None,
        }
    }

    pub fn with_alarm_horizon(mut self, horizon_ms: Option<u64>) -> Self {
        self.alarm_horizon_ms = horizon_ms;
        self
    }

    /// Waits for `transaction` to complete, then handles the outcome. The
    /// task ends quietly if the transaction is dropped without running.
    pub fn observe(self: &Arc<Self>, transaction: &Transaction) -> JoinHandle<()> {
        let mut rx = transaction.subscribe();
        let scheduler = Arc::clone(self);
        let id = transaction.id();
        tokio::spawn(async move {
            let state = match rx.wait_for(|state| state.is_terminal()).await {
                Ok(state) => state.clone(),
                Err(_) => {
                    debug!("transaction {} discarded before completion", id);
                    return;
                }
            };
            scheduler.on_complete(&state).await;
        })
    }

    pub async fn on_complete(&self, state: &TransactionState) {
        if state.is_failed() {
            if let Some(uri) = state.content_uri {
                if let Err(err) = self.schedule_retry(&uri).await {
                    warn!("cannot schedule retry for {}: {}", uri, err);
                }
            }
        }
        if self.connectivity.is_connected() {
            if let Err(err) = self.arm_next_alarm().await {
                warn!("cannot arm retry alarm: {}", err);
            }
        }
    }

    /// Counts one more failed attempt against the pending row of `uri`.
    /// Returns the row as written, or `None` when there is nothing to retry.
    pub async fn schedule_retry(
        &self,
        uri: &MessageRef,
    ) -> Result<Option<PendingOperation>, CoreError> {
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let Some(row) = self.store.pending_for(uri).await? else {
                debug!("no pending operation for {}", uri);
                return Ok(None);
            };
            let direction = match row.msg_type {
                MessageType::NotificationInd => Direction::Incoming,
                MessageType::SendReq | MessageType::ReadRecInd => Direction::Outgoing,
                other => {
                    warn!("bad message type {:?} pending for {}", other, uri);
                    return Ok(None);
                }
            };

            let retry_index = row.retry_index.saturating_add(1);
            let now = self.clock.now_ms();
            let limit = self.scheme.retry_limit(direction, ErrorType::Generic);
            let (error_type, due_time) = if retry_index < limit {
                let wait = self
                    .scheme
                    .waiting_interval_ms(direction, retry_index, ErrorType::Generic);
                (ErrorType::Generic, Some(now.saturating_add(wait)))
            } else {
                (ErrorType::GenericPermanent, None)
            };
            let update = PendingUpdate {
                retry_index,
                due_time,
                error_type,
                last_try: now,
            };
            if !self
                .store
                .update_pending(row.id, row.retry_index, update)
                .await?
            {
                debug!("pending row {} changed concurrently, re-reading", row.id);
                continue;
            }

            let incoming = direction == Direction::Incoming;
            match due_time {
                Some(at) => {
                    info!("retry {} for {} scheduled at {}", retry_index, uri, at);
                    if incoming {
                        self.mark_download(uri, DownloadState::TransientFailure).await;
                    }
                }
                None if incoming => {
                    info!("download of {} failed permanently", uri);
                    let thread_id = match row.thread_id {
                        Some(thread_id) => Some(thread_id),
                        None => self.store.thread_id(uri).await.ok().flatten(),
                    };
                    if let Some(thread_id) = thread_id {
                        self.notifier.notify_download_failed(thread_id);
                    }
                    self.mark_download(uri, DownloadState::PermanentFailure)
                        .await;
                }
                None => {
                    info!("sending {} failed permanently", uri);
                    self.notifier.notify_send_failed(true);
                }
            }

            return Ok(Some(PendingOperation {
                retry_index,
                due_time: due_time.unwrap_or(row.due_time),
                error_type,
                last_try: now,
                ..row
            }));
        }
        Err(CoreError::Storage)
    }

    /// Arms the alarm for the earliest pending operation; returns its due time.
    pub async fn arm_next_alarm(&self) -> Result<Option<u64>, CoreError> {
        let before = match self.alarm_horizon_ms {
            Some(horizon) => self.clock.now_ms().saturating_add(horizon),
            None => u64::MAX,
        };
        match self.store.earliest_pending(before).await? {
            Some(row) => {
                self.alarm.arm(row.due_time);
                debug!("next retry is scheduled at {}", row.due_time);
                Ok(Some(row.due_time))
            }
            None => Ok(None),
        }
    }

    async fn mark_download(&self, uri: &MessageRef, state: DownloadState) {
        if let Err(err) = self.store.mark_download_state(uri, state).await {
            debug!("cannot mark {} as {:?}: {}", uri, state, err);
        }
    }
}
