use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseStatus {
    AlreadyActive,
    RequestStarted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkKind {
    Mobile,
    Wifi,
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkReason {
    ApnSwitched,
    ApnFailed,
    RoamingOn,
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEvent {
    pub kind: NetworkKind,
    pub connected: bool,
    pub reason: Option<NetworkReason>,
}

impl NetworkEvent {
    pub fn mms_apn_ready() -> Self {
        Self {
            kind: NetworkKind::Mobile,
            connected: true,
            reason: Some(NetworkReason::ApnSwitched),
        }
    }

    /// True when the event reports that the MMS APN is now usable.
    pub fn enables_mms(&self) -> bool {
        self.kind == NetworkKind::Mobile
            && self.connected
            && self.reason == Some(NetworkReason::ApnSwitched)
    }
}

pub trait Connectivity: Send + Sync {
    fn is_available(&self) -> bool;
    fn is_connected(&self) -> bool;
    fn begin_lease(&self) -> Result<LeaseStatus, CoreError>;
    fn end_lease(&self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseMode {
    Active,
    Deferred,
    Failing,
}

/// Scriptable connectivity used by tests and by the daemon when no radio
/// layer is attached.
#[derive(Clone)]
pub struct SimulatedConnectivity {
    available: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    mode: Arc<Mutex<LeaseMode>>,
    begins: Arc<AtomicUsize>,
    ends: Arc<AtomicUsize>,
}

impl SimulatedConnectivity {
    pub fn new(available: bool, mode: LeaseMode) -> Self {
        Self {
            available: Arc::new(AtomicBool::new(available)),
            connected: Arc::new(AtomicBool::new(available && mode == LeaseMode::Active)),
            mode: Arc::new(Mutex::new(mode)),
            begins: Arc::new(AtomicUsize::new(0)),
            ends: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_mode(&self, mode: LeaseMode) {
        if let Ok(mut guard) = self.mode.lock() {
            *guard = mode;
        }
    }

    pub fn begins(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }

    pub fn ends(&self) -> usize {
        self.ends.load(Ordering::SeqCst)
    }
}

impl Connectivity for SimulatedConnectivity {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn begin_lease(&self) -> Result<LeaseStatus, CoreError> {
        self.begins.fetch_add(1, Ordering::SeqCst);
        let mode = self
            .mode
            .lock()
            .map(|guard| *guard)
            .map_err(|_| CoreError::Connectivity("lease state".to_string()))?;
        match mode {
            LeaseMode::Active => Ok(LeaseStatus::AlreadyActive),
            LeaseMode::Deferred => Ok(LeaseStatus::RequestStarted),
            LeaseMode::Failing => Err(CoreError::Connectivity(
                "cannot establish MMS connectivity".to_string(),
            )),
        }
    }

    fn end_lease(&self) {
        self.ends.fetch_add(1, Ordering::SeqCst);
    }
}
