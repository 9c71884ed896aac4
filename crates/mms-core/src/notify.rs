use log::info;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToastKind {
    MessageQueued,
    DownloadLater,
}

/// User-facing side effects of transaction outcomes.
pub trait Notifier: Send + Sync {
    fn notify_new_message(&self);
    fn notify_send_failed(&self, manual: bool);
    fn notify_download_failed(&self, thread_id: u64);
    fn toast(&self, kind: ToastKind);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify_new_message(&self) {
        info!("new message available");
    }

    fn notify_send_failed(&self, manual: bool) {
        info!("message could not be sent (manual={})", manual);
    }

    fn notify_download_failed(&self, thread_id: u64) {
        info!("message download failed in thread {}", thread_id);
    }

    fn toast(&self, kind: ToastKind) {
        match kind {
            ToastKind::MessageQueued => info!("message queued, will send when network is back"),
            ToastKind::DownloadLater => info!("message will be downloaded later"),
        }
    }
}
