use crate::config::TransactionSettings;
use crate::error::CoreError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

#[async_trait]
pub trait MmsTransport: Send + Sync {
    async fn get(&self, settings: &TransactionSettings, url: &str) -> Result<Vec<u8>, CoreError>;
    async fn post(
        &self,
        settings: &TransactionSettings,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, CoreError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PostedPdu {
    pub mmsc_url: String,
    pub body: Vec<u8>,
}

#[derive(Default)]
struct MmscState {
    documents: HashMap<String, Vec<u8>>,
    gets: HashMap<String, usize>,
    posted: Vec<PostedPdu>,
    post_responses: VecDeque<Vec<u8>>,
    fail_gets: usize,
    fail_posts: usize,
}

/// Relay living in process memory: serves published documents on GET and
/// records every POST.
#[derive(Clone)]
pub struct InMemoryMmsc {
    state: Arc<Mutex<MmscState>>,
    hold: Arc<watch::Sender<bool>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl Default for InMemoryMmsc {
    fn default() -> Self {
        let (hold, _) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(MmscState::default())),
            hold: Arc::new(hold),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl InMemoryMmsc {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish(&self, location: &str, bytes: Vec<u8>) {
        self.state
            .lock()
            .await
            .documents
            .insert(location.to_string(), bytes);
    }

    pub async fn queue_post_response(&self, bytes: Vec<u8>) {
        self.state.lock().await.post_responses.push_back(bytes);
    }

    pub async fn fail_next_gets(&self, count: usize) {
        self.state.lock().await.fail_gets = count;
    }

    pub async fn fail_next_posts(&self, count: usize) {
        self.state.lock().await.fail_posts = count;
    }

    pub async fn get_count(&self, location: &str) -> usize {
        self.state
            .lock()
            .await
            .gets
            .get(location)
            .copied()
            .unwrap_or(0)
    }

    pub async fn posted(&self) -> Vec<PostedPdu> {
        self.state.lock().await.posted.clone()
    }

    /// Parks every exchange until [`InMemoryMmsc::release`] is called.
    pub fn hold(&self) {
        self.hold.send_replace(true);
    }

    pub fn release(&self) {
        self.hold.send_replace(false);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self) {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let mut rx = self.hold.subscribe();
        let _ = rx.wait_for(|held| !*held).await;
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MmsTransport for InMemoryMmsc {
    async fn get(&self, _settings: &TransactionSettings, url: &str) -> Result<Vec<u8>, CoreError> {
        self.enter().await;
        let result = {
            let mut guard = self.state.lock().await;
            *guard.gets.entry(url.to_string()).or_default() += 1;
            if guard.fail_gets > 0 {
                guard.fail_gets -= 1;
                Err(CoreError::Transport(format!("get {}", url)))
            } else {
                guard
                    .documents
                    .get(url)
                    .cloned()
                    .ok_or_else(|| CoreError::Transport(format!("404 {}", url)))
            }
        };
        self.leave();
        result
    }

    async fn post(
        &self,
        settings: &TransactionSettings,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, CoreError> {
        self.enter().await;
        let result = {
            let mut guard = self.state.lock().await;
            if guard.fail_posts > 0 {
                guard.fail_posts -= 1;
                Err(CoreError::Transport("post".to_string()))
            } else {
                guard.posted.push(PostedPdu {
                    mmsc_url: settings.mmsc_url.clone(),
                    body,
                });
                Ok(guard.post_responses.pop_front().unwrap_or_default())
            }
        };
        self.leave();
        result
    }
}
