pub mod retry_tests;

use crate::alarm::AlarmScheduler;
use crate::config::{CoreConfig, TransactionSettings};
use crate::connectivity::{LeaseMode, SimulatedConnectivity};
use crate::event::{EventReceiver, ServiceEvent};
use crate::ids::{MessageRef, ServiceId};
use crate::notify::{Notifier, ToastKind};
use crate::pdu::{GenericPdu, JsonPduCodec, NotificationInd, PduCodec, RetrieveConf, SendReq};
use crate::policy::RetryPolicy;
use crate::service::ServiceHandle;
use crate::state::TransactionState;
use crate::store::{Folder, InMemoryStore, MessageStore};
use crate::time::ManualClock;
use crate::transaction::TransactionKind;
use crate::transport::InMemoryMmsc;
use crate::{EngineParts, MmsEngine};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, timeout, Duration};

pub const START_MS: u64 = 1_700_000_000_000;
pub const MMSC_URL: &str = "http://mmsc.test/mms";
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notice {
    NewMessage,
    SendFailed(bool),
    DownloadFailed(u64),
    Toast(ToastKind),
}

#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().expect("notices").clone()
    }

    pub fn count(&self, notice: &Notice) -> usize {
        self.notices().iter().filter(|n| *n == notice).count()
    }

    fn push(&self, notice: Notice) {
        self.notices.lock().expect("notices").push(notice);
    }
}

impl Notifier for RecordingNotifier {
    fn notify_new_message(&self) {
        self.push(Notice::NewMessage);
    }

    fn notify_send_failed(&self, manual: bool) {
        self.push(Notice::SendFailed(manual));
    }

    fn notify_download_failed(&self, thread_id: u64) {
        self.push(Notice::DownloadFailed(thread_id));
    }

    fn toast(&self, kind: ToastKind) {
        self.push(Notice::Toast(kind));
    }
}

#[derive(Default)]
pub struct RecordingAlarm {
    armed: Mutex<Vec<u64>>,
}

impl RecordingAlarm {
    pub fn armed(&self) -> Vec<u64> {
        self.armed.lock().expect("alarm").clone()
    }
}

impl AlarmScheduler for RecordingAlarm {
    fn arm(&self, at_ms: u64) {
        self.armed.lock().expect("alarm").push(at_ms);
    }
}

pub struct Harness {
    pub engine: MmsEngine,
    pub handle: ServiceHandle,
    pub store: InMemoryStore,
    pub mmsc: InMemoryMmsc,
    pub connectivity: SimulatedConnectivity,
    pub notifier: Arc<RecordingNotifier>,
    pub alarm: Arc<RecordingAlarm>,
    pub clock: Arc<ManualClock>,
}

pub fn settings() -> TransactionSettings {
    TransactionSettings::new(MMSC_URL)
}

pub fn core_config() -> CoreConfig {
    CoreConfig {
        settings: settings(),
        ..CoreConfig::default()
    }
}

pub fn start(
    config: CoreConfig,
    policy: RetryPolicy,
    connectivity: SimulatedConnectivity,
) -> Harness {
    let clock = Arc::new(ManualClock::new(START_MS));
    let store = InMemoryStore::new(clock.clone());
    let mmsc = InMemoryMmsc::new();
    let notifier = Arc::new(RecordingNotifier::default());
    let alarm = Arc::new(RecordingAlarm::default());
    let engine = MmsEngine::start(
        config,
        policy,
        EngineParts {
            store: Arc::new(store.clone()),
            transport: Arc::new(mmsc.clone()),
            codec: Arc::new(JsonPduCodec),
            connectivity: Arc::new(connectivity.clone()),
            notifier: notifier.clone(),
            clock: clock.clone(),
            alarm: Some(alarm.clone()),
        },
    )
    .expect("engine");
    Harness {
        handle: engine.handle(),
        engine,
        store,
        mmsc,
        connectivity,
        notifier,
        alarm,
        clock,
    }
}

pub fn start_default() -> Harness {
    start(
        core_config(),
        RetryPolicy::default(),
        SimulatedConnectivity::new(true, LeaseMode::Active),
    )
}

pub fn encode(pdu: GenericPdu) -> Vec<u8> {
    JsonPduCodec.compose(&pdu).expect("compose")
}

pub fn decode(bytes: &[u8]) -> GenericPdu {
    JsonPduCodec.parse(bytes).expect("parse")
}

pub fn notification(location: &str) -> NotificationInd {
    NotificationInd {
        transaction_id: format!("tx-{}", location).into_bytes(),
        content_location: location.to_string(),
        from: Some("+15550001".to_string()),
        subject: Some("hello".to_string()),
        message_size: 1024,
        expiry_secs: 7 * 24 * 3600,
    }
}

pub fn retrieve_conf(message_id: Option<&str>, transaction_id: Option<&[u8]>) -> RetrieveConf {
    RetrieveConf {
        message_id: message_id.map(str::to_string),
        transaction_id: transaction_id.map(|t| t.to_vec()),
        from: Some("+15550001".to_string()),
        subject: Some("hello".to_string()),
        date: START_MS / 1000,
        content_type: "application/vnd.wap.multipart.related".to_string(),
        body: b"picture".to_vec(),
    }
}

pub fn send_req(transaction_id: &[u8]) -> SendReq {
    SendReq {
        transaction_id: transaction_id.to_vec(),
        to: vec!["+15550002".to_string()],
        subject: None,
        date: START_MS / 1000,
        content_type: "application/vnd.wap.multipart.mixed".to_string(),
        body: b"hi there".to_vec(),
    }
}

pub async fn stored_notification(store: &InMemoryStore, location: &str) -> MessageRef {
    store
        .persist_pdu(
            GenericPdu::NotificationInd(notification(location)),
            Folder::Inbox,
        )
        .await
        .expect("persist notification")
}

pub async fn outbox_send(store: &InMemoryStore, transaction_id: &[u8]) -> MessageRef {
    store
        .persist_pdu(GenericPdu::SendReq(send_req(transaction_id)), Folder::Outbox)
        .await
        .expect("persist send req")
}

pub async fn next_completion(
    rx: &mut EventReceiver,
) -> (ServiceId, TransactionKind, TransactionState) {
    loop {
        let event = timeout(EVENT_TIMEOUT, rx.recv())
            .await
            .expect("event timeout")
            .expect("event");
        if let ServiceEvent::TransactionCompleted {
            service_id,
            kind,
            state,
        } = event
        {
            return (service_id, kind, state);
        }
    }
}

pub async fn wait_idle(rx: &mut EventReceiver) {
    loop {
        let event = timeout(EVENT_TIMEOUT, rx.recv())
            .await
            .expect("idle timeout")
            .expect("event");
        if event == ServiceEvent::Idle {
            return;
        }
    }
}

pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}
