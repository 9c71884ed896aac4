use crate::config::{CoreConfig, TransactionSettings};
use crate::connectivity::{Connectivity, LeaseStatus, NetworkEvent};
use crate::error::CoreError;
use crate::event::{EventBus, EventReceiver, ServiceEvent};
use crate::ids::{MessageRef, ServiceId};
use crate::notify::{Notifier, ToastKind};
use crate::pdu::{GenericPdu, PduCodec};
use crate::rate::RateController;
use crate::retry::RetryScheduler;
use crate::state::TransactionStatus;
use crate::store::MessageStore;
use crate::time::Clock;
use crate::transaction::{
    Transaction, TransactionContext, TransactionKind, TransactionTarget,
};
use crate::transport::MmsTransport;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;

/// Arguments for launching one transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransactionBundle {
    pub kind: TransactionKind,
    #[serde(default)]
    pub uri: Option<MessageRef>,
    #[serde(default)]
    pub push_data: Option<Vec<u8>>,
    #[serde(default)]
    pub mmsc_url: Option<String>,
    #[serde(default)]
    pub proxy_address: Option<String>,
    #[serde(default)]
    pub proxy_port: Option<u16>,
}

impl TransactionBundle {
    pub fn stored(kind: TransactionKind, uri: MessageRef) -> Self {
        Self {
            kind,
            uri: Some(uri),
            push_data: None,
            mmsc_url: None,
            proxy_address: None,
            proxy_port: None,
        }
    }

    pub fn push(push_data: Vec<u8>) -> Self {
        Self {
            kind: TransactionKind::Notification,
            uri: None,
            push_data: Some(push_data),
            mmsc_url: None,
            proxy_address: None,
            proxy_port: None,
        }
    }

    /// Per-request relay settings, falling back to `defaults` when no MMSC is given.
    pub fn settings(&self, defaults: &TransactionSettings) -> TransactionSettings {
        match self.mmsc_url.as_ref() {
            Some(mmsc) => TransactionSettings {
                mmsc_url: mmsc.clone(),
                proxy_address: self.proxy_address.clone(),
                proxy_port: self.proxy_port,
            },
            None => defaults.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Scan,
    Launch(TransactionBundle),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServiceSnapshot {
    pub processing: usize,
    pub pending: usize,
    pub open_units: usize,
}

enum Command {
    Submit {
        service_id: ServiceId,
        request: Request,
    },
    NetworkChanged(NetworkEvent),
    ExtendLease,
    Completed(Transaction),
    Shutdown,
}

#[derive(Default)]
struct Queues {
    processing: Vec<Transaction>,
    pending: VecDeque<Transaction>,
    open_units: HashSet<ServiceId>,
}

impl Queues {
    fn in_flight(&self) -> bool {
        !self.processing.is_empty() || !self.pending.is_empty()
    }
}

/// Non-blocking entry point into the service loop.
#[derive(Clone)]
pub struct ServiceHandle {
    tx: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
    queues: Arc<Mutex<Queues>>,
    events: EventBus,
}

/// Receiving half handed to [`TransactionService::new`].
pub struct ServiceInbox {
    rx: mpsc::UnboundedReceiver<Command>,
    tx: mpsc::WeakUnboundedSender<Command>,
    queues: Arc<Mutex<Queues>>,
    events: EventBus,
}

impl ServiceHandle {
    pub fn channel(event_buffer: usize) -> (ServiceHandle, ServiceInbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queues = Arc::new(Mutex::new(Queues::default()));
        let events = EventBus::new(event_buffer);
        let inbox = ServiceInbox {
            rx,
            tx: tx.downgrade(),
            queues: queues.clone(),
            events: events.clone(),
        };
        let handle = ServiceHandle {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
            queues,
            events,
        };
        (handle, inbox)
    }

    pub fn submit(&self, request: Request) -> Result<ServiceId, CoreError> {
        submit_to(&self.tx, &self.next_id, request)
    }

    /// Handle that does not keep the service loop alive.
    pub fn downgrade(&self) -> WeakServiceHandle {
        WeakServiceHandle {
            tx: self.tx.downgrade(),
            next_id: self.next_id.clone(),
        }
    }

    pub fn scan(&self) -> Result<ServiceId, CoreError> {
        self.submit(Request::Scan)
    }

    pub fn launch(&self, bundle: TransactionBundle) -> Result<ServiceId, CoreError> {
        self.submit(Request::Launch(bundle))
    }

    pub fn network_changed(&self, event: NetworkEvent) -> Result<(), CoreError> {
        self.tx
            .send(Command::NetworkChanged(event))
            .map_err(|_| CoreError::Stopped)
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> ServiceSnapshot {
        let queues = self.queues.lock().await;
        ServiceSnapshot {
            processing: queues.processing.len(),
            pending: queues.pending.len(),
            open_units: queues.open_units.len(),
        }
    }
}

/// Submits requests only while some [`ServiceHandle`] is still alive.
#[derive(Clone)]
pub struct WeakServiceHandle {
    tx: mpsc::WeakUnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
}

impl WeakServiceHandle {
    pub fn submit(&self, request: Request) -> Result<ServiceId, CoreError> {
        let tx = self.tx.upgrade().ok_or(CoreError::Stopped)?;
        submit_to(&tx, &self.next_id, request)
    }
}

fn submit_to(
    tx: &mpsc::UnboundedSender<Command>,
    next_id: &AtomicU64,
    request: Request,
) -> Result<ServiceId, CoreError> {
    let service_id = ServiceId(next_id.fetch_add(1, Ordering::SeqCst));
    tx.send(Command::Submit {
        service_id,
        request,
    })
    .map_err(|_| CoreError::Stopped)?;
    Ok(service_id)
}

pub struct Collaborators {
    pub store: Arc<dyn MessageStore>,
    pub transport: Arc<dyn MmsTransport>,
    pub codec: Arc<dyn PduCodec>,
    pub connectivity: Arc<dyn Connectivity>,
    pub notifier: Arc<dyn Notifier>,
    pub retry: Arc<RetryScheduler>,
    pub clock: Arc<dyn Clock>,
}

enum Admission {
    Started,
    Deferred,
    Absorbed,
}

/// Serialized admission loop: dedups requests, holds the MMS connectivity
/// lease and hands transactions to the worker pool.
pub struct TransactionService {
    config: CoreConfig,
    store: Arc<dyn MessageStore>,
    connectivity: Arc<dyn Connectivity>,
    notifier: Arc<dyn Notifier>,
    retry: Arc<RetryScheduler>,
    clock: Arc<dyn Clock>,
    rate: RateController,
    ctx: TransactionContext,
    permits: Arc<Semaphore>,
    rx: mpsc::UnboundedReceiver<Command>,
    tx: mpsc::WeakUnboundedSender<Command>,
    queues: Arc<Mutex<Queues>>,
    events: EventBus,
    lease_timer: Option<JoinHandle<()>>,
}

impl TransactionService {
    pub fn new(config: CoreConfig, inbox: ServiceInbox, deps: Collaborators) -> Self {
        let ctx = TransactionContext {
            store: deps.store.clone(),
            transport: deps.transport,
            codec: deps.codec,
            auto_retrieve: config.auto_retrieve,
        };
        let rate = RateController::new(config.max_send_rate_per_minute, deps.clock.clone());
        let permits = Arc::new(Semaphore::new(config.max_concurrent_transactions.max(1)));
        Self {
            config,
            store: deps.store,
            connectivity: deps.connectivity,
            notifier: deps.notifier,
            retry: deps.retry,
            clock: deps.clock,
            rate,
            ctx,
            permits,
            rx: inbox.rx,
            tx: inbox.tx,
            queues: inbox.queues,
            events: inbox.events,
            lease_timer: None,
        }
    }

    pub fn rate_controller(&self) -> RateController {
        self.rate.clone()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        debug!("transaction service started");
        while let Some(command) = self.rx.recv().await {
            match command {
                Command::Submit {
                    service_id,
                    request,
                } => self.on_request(service_id, request).await,
                Command::NetworkChanged(event) => self.on_network_changed(event).await,
                Command::ExtendLease => self.on_extend_lease().await,
                Command::Completed(transaction) => self.on_transaction_complete(transaction).await,
                Command::Shutdown => break,
            }
        }
        self.on_shutdown().await;
    }

    async fn on_request(&mut self, service_id: ServiceId, request: Request) {
        debug!("handling request {}: {:?}", service_id, request);
        self.queues.lock().await.open_units.insert(service_id);
        match request {
            Request::Scan => self.scan(service_id).await,
            Request::Launch(bundle) => {
                if !self.connectivity.is_available() {
                    self.on_network_unavailable(service_id, Some(bundle.kind))
                        .await;
                    return;
                }
                self.launch(service_id, bundle).await;
            }
        }
    }

    async fn scan(&mut self, service_id: ServiceId) {
        let now = self.clock.now_ms();
        let rows = match self.store.pending_due(now).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!("cannot load pending messages: {}", err);
                self.finish_unit(service_id).await;
                return;
            }
        };
        if rows.is_empty() {
            debug!("no pending messages");
            if let Err(err) = self.retry.arm_next_alarm().await {
                warn!("cannot arm retry alarm: {}", err);
            }
            self.finish_unit(service_id).await;
            return;
        }

        let available = self.connectivity.is_available();
        let mut launched = false;
        for row in rows {
            let kind = TransactionKind::for_pending(row.msg_type);
            if !available {
                self.on_network_unavailable(service_id, kind).await;
                return;
            }
            let Some(kind) = kind else {
                warn!("unrecognized message type {:?} for {}", row.msg_type, row.message);
                continue;
            };
            if !row.awaits_scan() {
                continue;
            }
            launched = true;
            self.launch(service_id, TransactionBundle::stored(kind, row.message))
                .await;
        }
        if !launched {
            if let Err(err) = self.retry.arm_next_alarm().await {
                warn!("cannot arm retry alarm: {}", err);
            }
            self.finish_unit(service_id).await;
        }
    }

    async fn on_network_unavailable(&mut self, service_id: ServiceId, kind: Option<TransactionKind>) {
        let toast = match kind {
            Some(TransactionKind::Retrieve) => Some(ToastKind::DownloadLater),
            Some(TransactionKind::Send) => Some(ToastKind::MessageQueued),
            _ => None,
        };
        if let Some(toast) = toast {
            self.notifier.toast(toast);
        }
        self.finish_unit(service_id).await;
    }

    async fn launch(&mut self, service_id: ServiceId, bundle: TransactionBundle) {
        let transaction = match self.build(service_id, &bundle) {
            Ok(transaction) => transaction,
            Err(err) => {
                warn!("cannot create {} transaction for {}: {}", bundle.kind, service_id, err);
                self.abandon(service_id).await;
                return;
            }
        };
        self.retry.observe(&transaction);
        match self.process_transaction(transaction).await {
            Ok(Admission::Started) => debug!("started processing for {}", service_id),
            Ok(Admission::Deferred) => debug!("deferred {} pending MMS connectivity", service_id),
            Ok(Admission::Absorbed) => self.finish_unit(service_id).await,
            Err(err) => {
                warn!("cannot process {}: {}", service_id, err);
                self.abandon(service_id).await;
            }
        }
    }

    fn build(
        &self,
        service_id: ServiceId,
        bundle: &TransactionBundle,
    ) -> Result<Transaction, CoreError> {
        let target = match (bundle.kind, bundle.uri, bundle.push_data.as_ref()) {
            (_, Some(uri), _) => TransactionTarget::Stored(uri),
            (TransactionKind::Notification, None, Some(bytes)) => match self.ctx.codec.parse(bytes)? {
                GenericPdu::NotificationInd(_) => TransactionTarget::Push(bytes.clone()),
                other => {
                    return Err(CoreError::Protocol(format!(
                        "invalid push data: {:?}",
                        other.message_type()
                    )))
                }
            },
            _ => return Err(CoreError::Validation("transaction_target".to_string())),
        };
        Ok(Transaction::new(
            bundle.kind,
            target,
            service_id,
            bundle.settings(&self.config.settings),
        ))
    }

    async fn process_transaction(
        &mut self,
        transaction: Transaction,
    ) -> Result<Admission, CoreError> {
        let mut queues = self.queues.lock().await;
        if queues.pending.iter().any(|t| t.is_equivalent(&transaction)) {
            debug!("transaction already pending: {}", transaction.service_id());
            return Ok(Admission::Absorbed);
        }
        if queues
            .processing
            .iter()
            .any(|t| t.is_equivalent(&transaction))
        {
            debug!("duplicated transaction: {}", transaction.service_id());
            return Ok(Admission::Absorbed);
        }

        if self.connectivity.begin_lease()? == LeaseStatus::RequestStarted {
            queues.pending.push_back(transaction);
            return Ok(Admission::Deferred);
        }

        queues.processing.push(transaction.clone());
        if let Err(err) = self.start(&transaction) {
            queues.processing.retain(|t| !t.is_same(&transaction));
            return Err(err);
        }
        drop(queues);
        self.arm_lease_timer();
        Ok(Admission::Started)
    }

    fn start(&self, transaction: &Transaction) -> Result<(), CoreError> {
        debug!("starting transaction: {:?}", transaction);
        transaction.process(self.ctx.clone(), self.permits.clone())?;
        let mut rx = transaction.subscribe();
        let completed = transaction.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            if rx.wait_for(|state| state.is_terminal()).await.is_ok() {
                if let Some(tx) = tx.upgrade() {
                    let _ = tx.send(Command::Completed(completed));
                }
            }
        });
        Ok(())
    }

    async fn on_network_changed(&mut self, event: NetworkEvent) {
        debug!("network state changed: {:?}", event);
        if !event.enables_mms() {
            return;
        }
        self.arm_lease_timer();
        let next = {
            let mut queues = self.queues.lock().await;
            match queues.pending.pop_front() {
                Some(transaction) => Some(transaction),
                None if queues.processing.is_empty() => None,
                None => return,
            }
        };
        let Some(transaction) = next else {
            self.cancel_lease_timer();
            self.connectivity.end_lease();
            return;
        };
        let service_id = transaction.service_id();
        match self.process_transaction(transaction).await {
            Ok(Admission::Started) => debug!("started deferred processing of {}", service_id),
            Ok(Admission::Deferred) => debug!("{} still waiting for connectivity", service_id),
            Ok(Admission::Absorbed) => self.finish_unit(service_id).await,
            Err(err) => {
                warn!("cannot resume {}: {}", service_id, err);
                self.abandon(service_id).await;
            }
        }
    }

    async fn on_extend_lease(&mut self) {
        if self.queues.lock().await.processing.is_empty() {
            return;
        }
        debug!("extending MMS connectivity, still processing");
        match self.connectivity.begin_lease() {
            Ok(LeaseStatus::AlreadyActive) => self.arm_lease_timer(),
            Ok(status) => info!("extending MMS connectivity returned {:?}", status),
            Err(err) => warn!("attempt to extend MMS connectivity failed: {}", err),
        }
    }

    async fn on_transaction_complete(&mut self, transaction: Transaction) {
        let state = transaction.state();
        let service_id = transaction.service_id();
        let (processing_empty, pending_empty) = {
            let mut queues = self.queues.lock().await;
            queues.processing.retain(|t| !t.is_same(&transaction));
            (queues.processing.is_empty(), queues.pending.is_empty())
        };
        if processing_empty {
            self.cancel_lease_timer();
            if pending_empty {
                self.connectivity.end_lease();
            }
        }

        match state.status {
            TransactionStatus::Success => {
                debug!("transaction complete: {}", service_id);
                match transaction.kind() {
                    TransactionKind::Notification | TransactionKind::Retrieve => {
                        self.notifier.notify_new_message()
                    }
                    TransactionKind::Send => self.rate.update(),
                    TransactionKind::ReadRec => {}
                }
            }
            TransactionStatus::Failed => debug!("transaction failed: {}", service_id),
            TransactionStatus::Initialized => {
                debug!("transaction state unknown: {}", service_id)
            }
        }

        self.events.publish(ServiceEvent::TransactionCompleted {
            service_id,
            kind: transaction.kind(),
            state,
        });
        self.finish_unit(service_id).await;
    }

    /// Drops a unit whose transaction never started.
    async fn abandon(&mut self, service_id: ServiceId) {
        let idle = !self.queues.lock().await.in_flight();
        if idle {
            self.cancel_lease_timer();
            self.connectivity.end_lease();
        }
        self.finish_unit(service_id).await;
    }

    async fn finish_unit(&mut self, service_id: ServiceId) {
        let idle = {
            let mut queues = self.queues.lock().await;
            queues.open_units.remove(&service_id);
            queues.open_units.is_empty() && !queues.in_flight()
        };
        if idle {
            debug!("no work left, service idle");
            self.events.publish(ServiceEvent::Idle);
        }
    }

    fn arm_lease_timer(&mut self) {
        self.cancel_lease_timer();
        let tx = self.tx.clone();
        let delay = Duration::from_millis(self.config.lease_extension_ms);
        self.lease_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::ExtendLease);
            }
        }));
    }

    fn cancel_lease_timer(&mut self) {
        if let Some(timer) = self.lease_timer.take() {
            timer.abort();
        }
    }

    async fn on_shutdown(&mut self) {
        self.cancel_lease_timer();
        let mut queues = self.queues.lock().await;
        if !queues.pending.is_empty() {
            warn!(
                "transaction service exiting with {} transaction(s) still pending",
                queues.pending.len()
            );
        }
        queues.pending.clear();
        debug!("transaction service stopped");
    }
}
