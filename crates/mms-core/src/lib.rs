pub mod alarm;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod event;
pub mod ids;
pub mod notify;
pub mod pdu;
pub mod policy;
pub mod rate;
pub mod retry;
pub mod service;
pub mod state;
pub mod store;
pub mod time;
pub mod transaction;
pub mod transport;

use alarm::{AlarmScheduler, TokioAlarm};
use config::CoreConfig;
use connectivity::Connectivity;
use error::CoreError;
use event::EventReceiver;
use log::info;
use notify::Notifier;
use pdu::PduCodec;
use policy::{DefaultRetryScheme, RetryPolicy};
use rate::RateController;
use retry::RetryScheduler;
use service::{Collaborators, ServiceHandle, TransactionService};
use std::sync::Arc;
use store::MessageStore;
use time::Clock;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use transport::MmsTransport;

/// Collaborators the engine is built from.
pub struct EngineParts {
    pub store: Arc<dyn MessageStore>,
    pub transport: Arc<dyn MmsTransport>,
    pub codec: Arc<dyn PduCodec>,
    pub connectivity: Arc<dyn Connectivity>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
    /// Defaults to a [`TokioAlarm`] that submits scans to the service.
    pub alarm: Option<Arc<dyn AlarmScheduler>>,
}

/// Running transaction service together with its retry scheduler.
pub struct MmsEngine {
    handle: ServiceHandle,
    retry: Arc<RetryScheduler>,
    rate: RateController,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MmsEngine {
    pub fn start(
        config: CoreConfig,
        policy: RetryPolicy,
        parts: EngineParts,
    ) -> Result<Self, CoreError> {
        let scheme = DefaultRetryScheme::new(policy)?;
        let (handle, inbox) = ServiceHandle::channel(config.event_buffer);
        let alarm = match parts.alarm {
            Some(alarm) => alarm,
            None => Arc::new(TokioAlarm::new(handle.downgrade(), parts.clock.clone())),
        };
        let retry = Arc::new(
            RetryScheduler::new(
                parts.store.clone(),
                parts.connectivity.clone(),
                alarm,
                parts.notifier.clone(),
                Arc::new(scheme),
                parts.clock.clone(),
            )
            .with_alarm_horizon(config.alarm_horizon_ms),
        );
        let service = TransactionService::new(
            config,
            inbox,
            Collaborators {
                store: parts.store,
                transport: parts.transport,
                codec: parts.codec,
                connectivity: parts.connectivity,
                notifier: parts.notifier,
                retry: retry.clone(),
                clock: parts.clock,
            },
        );
        let rate = service.rate_controller();
        let task = service.spawn();
        info!("mms engine started");
        Ok(Self {
            handle,
            retry,
            rate,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn handle(&self) -> ServiceHandle {
        self.handle.clone()
    }

    pub fn retry(&self) -> Arc<RetryScheduler> {
        self.retry.clone()
    }

    pub fn rate(&self) -> &RateController {
        &self.rate
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.handle.subscribe()
    }

    /// Stops the service loop and waits for it to exit.
    pub async fn shutdown(&self) {
        self.handle.shutdown();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        info!("mms engine stopped");
    }
}

#[cfg(test)]
mod tests;
