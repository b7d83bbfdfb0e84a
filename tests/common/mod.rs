//! Shared helpers for integration tests.

use docsync::store::DocumentStore;
use docsync::MemoryDocumentStore;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Initialize tracing for a test (first caller wins).
#[allow(dead_code)]
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `check` every few milliseconds until it holds or the deadline passes.
#[allow(dead_code)]
pub async fn wait_until(deadline_ms: u64, mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..(deadline_ms / 5).max(1) {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// A store pre-populated with `n` documents `doc:00..` carrying `{"value": i}`.
#[allow(dead_code)]
pub async fn seeded_store(n: usize) -> Arc<MemoryDocumentStore> {
    let store = Arc::new(MemoryDocumentStore::new());
    for i in 0..n {
        store
            .put_document(&format!("doc:{i:02}"), None, json!({"value": i}))
            .await
            .unwrap();
    }
    store
}
