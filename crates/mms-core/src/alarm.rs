use crate::service::{Request, WeakServiceHandle};
use crate::time::Clock;
use log::debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// One-shot wake-up at an absolute wall-clock time.
pub trait AlarmScheduler: Send + Sync {
    fn arm(&self, at_ms: u64);
}

/// Alarm backed by a tokio timer. Arming replaces the previous alarm; on
/// fire it submits a scan of due pending operations. The handle is weak and
/// never keeps the service loop alive.
pub struct TokioAlarm {
    handle: WeakServiceHandle,
    clock: Arc<dyn Clock>,
    armed: Mutex<Option<JoinHandle<()>>>,
}

impl TokioAlarm {
    pub fn new(handle: WeakServiceHandle, clock: Arc<dyn Clock>) -> Self {
        Self {
            handle,
            clock,
            armed: Mutex::new(None),
        }
    }
}

impl AlarmScheduler for TokioAlarm {
    fn arm(&self, at_ms: u64) {
        let delay = at_ms.saturating_sub(self.clock.now_ms());
        let handle = self.handle.clone();
        debug!("next retry alarm in {} ms", delay);
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let _ = handle.submit(Request::Scan);
        });
        if let Ok(mut guard) = self.armed.lock() {
            if let Some(previous) = guard.replace(task) {
                previous.abort();
            }
        }
    }
}

impl Drop for TokioAlarm {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.armed.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}
