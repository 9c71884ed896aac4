use crate::time::Clock;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const WINDOW_MS: u64 = 60 * 1000;

/// Counts sends in a sliding one-minute window.
#[derive(Clone)]
pub struct RateController {
    limit: u32,
    clock: Arc<dyn Clock>,
    sent: Arc<Mutex<VecDeque<u64>>>,
}

impl RateController {
    pub fn new(limit_per_minute: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            limit: limit_per_minute,
            clock,
            sent: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn update(&self) {
        let now = self.clock.now_ms();
        if let Ok(mut guard) = self.sent.lock() {
            Self::expire(&mut guard, now);
            guard.push_back(now);
        }
    }

    pub fn sent_in_window(&self) -> usize {
        let now = self.clock.now_ms();
        match self.sent.lock() {
            Ok(mut guard) => {
                Self::expire(&mut guard, now);
                guard.len()
            }
            Err(_) => 0,
        }
    }

    pub fn is_limit_surpassed(&self) -> bool {
        self.sent_in_window() >= self.limit as usize
    }

    fn expire(sent: &mut VecDeque<u64>, now: u64) {
        while let Some(front) = sent.front() {
            if now.saturating_sub(*front) >= WINDOW_MS {
                sent.pop_front();
            } else {
                break;
            }
        }
    }
}
