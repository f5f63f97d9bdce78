//! Per-workspace handoff priority queue backed by a [`CacheBackend`] sorted
//! set: `score = priority`, lower score wins, ties broken by insertion order.
//! A single `f64` score can't carry two independent orderings, so priority
//! occupies the integer part and a monotonic counter the fractional part —
//! enough ties to matter only arise within the same priority tier, and the
//! counter never grows large enough to bleed into the next priority tier.

use crate::coordinator::HandoffParams;
use devos_core::cache::CacheBackend;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const ENTRY_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const COUNTER_SCALE: f64 = 1.0 / 1_000_000.0;

pub struct HandoffQueue {
    cache: Arc<dyn CacheBackend>,
    counter: AtomicU64,
}

impl HandoffQueue {
    pub fn new(cache: Arc<dyn CacheBackend>) -> Self {
        Self { cache, counter: AtomicU64::new(0) }
    }

    fn key(workspace_id: &str) -> String {
        format!("handoff-queue:{workspace_id}")
    }

    pub async fn enqueue(&self, workspace_id: &str, priority: u32, params: &HandoffParams) {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let score = priority as f64 + (seq as f64) * COUNTER_SCALE;
        let member = serde_json::to_string(params).expect("HandoffParams always serializes");
        let key = Self::key(workspace_id);
        self.cache.zadd(&key, score, &member).await;
        self.cache.expire(&key, ENTRY_TTL).await;
    }

    /// Atomically reads the lowest-scoring member and removes that exact
    /// member (never by score range — two entries can share a score).
    pub async fn peek_and_pop(&self, workspace_id: &str) -> Option<HandoffParams> {
        let key = Self::key(workspace_id);
        let (_, member) = self.cache.zpeek_min(&key).await?;
        self.cache.zrem(&key, &member).await;
        serde_json::from_str(&member).ok()
    }

    pub async fn depth(&self, workspace_id: &str) -> usize {
        self.cache.zcard(&Self::key(workspace_id)).await
    }

    pub async fn list(&self, workspace_id: &str) -> Vec<HandoffParams> {
        let key = Self::key(workspace_id);
        self.cache
            .zrangebyscore(&key, f64::MIN, f64::MAX)
            .await
            .iter()
            .filter_map(|m| serde_json::from_str(m).ok())
            .collect()
    }
}
