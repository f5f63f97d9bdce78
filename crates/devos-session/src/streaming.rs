//! CLI Output Streaming (`spec.md` §4.4): batched delivery of agent stdout
//! to subscribers with bounded memory and a replay window for late joiners.

use devos_core::cache::CacheBackend;
use devos_core::store::{Store, StoreError};
use devos_events::event_bus::EventBus;
use devos_events::protocol::{CliOutputPayload, DevosEvent};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

const FLUSH_INTERVAL: Duration = Duration::from_millis(100);
const MAX_TOTAL_LINES: usize = 50_000;
const BUFFER_LINES: usize = 1000;
const BUFFER_TTL: Duration = Duration::from_secs(60 * 60);

fn cache_key(session_id: Uuid) -> String {
    format!("cli:output:{session_id}")
}

struct SessionBuffers {
    batch: Mutex<Vec<String>>,
    total: Mutex<VecDeque<String>>,
    next_offset: AtomicU64,
    stop: Notify,
}

pub struct OutputStreamer {
    cache: Arc<dyn CacheBackend>,
    events: EventBus,
    store: Arc<Store>,
    sessions: dashmap::DashMap<Uuid, Arc<SessionBuffers>>,
}

impl OutputStreamer {
    pub fn new(cache: Arc<dyn CacheBackend>, events: EventBus, store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self { cache, events, store, sessions: dashmap::DashMap::new() })
    }

    /// Clears any stale buffer and arms the periodic flush for `session_id`.
    pub async fn start_streaming(self: &Arc<Self>, session_id: Uuid) {
        self.cache.del(&cache_key(session_id)).await;
        let state = Arc::new(SessionBuffers {
            batch: Mutex::new(Vec::new()),
            total: Mutex::new(VecDeque::new()),
            next_offset: AtomicU64::new(0),
            stop: Notify::new(),
        });
        self.sessions.insert(session_id, state.clone());

        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(FLUSH_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        this.flush_once(session_id, &state).await;
                    }
                    _ = state.stop.notified() => {
                        this.flush_once(session_id, &state).await;
                        break;
                    }
                }
            }
        });
    }

    /// Splits `bytes` on newlines and appends non-empty lines to the batch
    /// and running total, dropping the oldest lines once over the cap.
    pub fn on_output(&self, session_id: Uuid, bytes: &[u8]) {
        let Some(state) = self.sessions.get(&session_id) else { return };
        let text = String::from_utf8_lossy(bytes);
        let mut batch = state.batch.lock().unwrap();
        let mut total = state.total.lock().unwrap();
        for line in text.split('\n') {
            if line.is_empty() {
                continue;
            }
            batch.push(line.to_string());
            total.push_back(line.to_string());
            if total.len() > MAX_TOTAL_LINES {
                total.pop_front();
            }
        }
    }

    async fn flush_once(&self, session_id: Uuid, state: &SessionBuffers) {
        let lines = {
            let mut batch = state.batch.lock().unwrap();
            if batch.is_empty() {
                return;
            }
            std::mem::take(&mut *batch)
        };

        let line_offset = state.next_offset.fetch_add(lines.len() as u64, Ordering::SeqCst);
        self.events.publish(DevosEvent::CliOutput(CliOutputPayload {
            session_id,
            lines,
            line_offset,
            timestamp: Utc::now(),
        }));

        let tail: Vec<String> = {
            let total = state.total.lock().unwrap();
            total.iter().rev().take(BUFFER_LINES).rev().cloned().collect()
        };
        let json = serde_json::to_string(&tail).unwrap_or_else(|_| "[]".to_string());
        self.cache.set(&cache_key(session_id), &json, None).await;
    }

    /// Final flush, TTL the cache buffer, archive the full output, stop the
    /// periodic task.
    pub async fn stop_streaming(&self, session_id: Uuid) -> Result<(), StoreError> {
        let Some((_, state)) = self.sessions.remove(&session_id) else { return Ok(()) };
        self.flush_once(session_id, &state).await;
        state.stop.notify_one();
        self.cache.expire(&cache_key(session_id), BUFFER_TTL).await;

        let full_text = {
            let total = state.total.lock().unwrap();
            total.iter().cloned().collect::<Vec<_>>().join("\n")
        };
        self.store.archive_cli_output(session_id, &full_text).await
    }

    pub async fn get_buffered_output(&self, session_id: Uuid) -> Vec<String> {
        match self.cache.get(&cache_key(session_id)).await {
            Some(json) => serde_json::from_str(&json).unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devos_core::cache::InMemoryCacheBackend;

    async fn harness() -> (Arc<OutputStreamer>, Uuid) {
        let cache: Arc<dyn CacheBackend> = Arc::new(InMemoryCacheBackend::new());
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let streamer = OutputStreamer::new(cache, EventBus::new(), store);
        let session_id = Uuid::new_v4();
        streamer.start_streaming(session_id).await;
        (streamer, session_id)
    }

    #[tokio::test]
    async fn on_output_splits_lines_and_buffers() {
        let (streamer, session_id) = harness().await;
        streamer.on_output(session_id, b"line one\nline two\n");
        tokio::time::sleep(Duration::from_millis(150)).await;
        let buffered = streamer.get_buffered_output(session_id).await;
        assert_eq!(buffered, vec!["line one".to_string(), "line two".to_string()]);
    }

    #[tokio::test]
    async fn stop_streaming_ttls_the_buffer_and_archives() {
        let (streamer, session_id) = harness().await;
        streamer.on_output(session_id, b"archived line\n");
        streamer.stop_streaming(session_id).await.unwrap();
        let buffered = streamer.get_buffered_output(session_id).await;
        assert_eq!(buffered, vec!["archived line".to_string()]);
    }

    #[tokio::test]
    async fn empty_batch_produces_no_flush_event() {
        let cache: Arc<dyn CacheBackend> = Arc::new(InMemoryCacheBackend::new());
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let events = EventBus::new();
        let rx = events.subscribe();
        let streamer = OutputStreamer::new(cache, events, store);
        let session_id = Uuid::new_v4();
        streamer.start_streaming(session_id).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err());
    }
}
