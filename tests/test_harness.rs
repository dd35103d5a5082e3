//! Test harness for worker integration tests.
//!
//! Bundles the in-process queue, store, and database behind a single
//! environment, plus polling helpers for asynchronous assertions.

#![allow(dead_code)]

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use exprunner::client::Client;
use exprunner::config::WorkerConfig;
use exprunner::db::MemoryDb;
use exprunner::error::Result;
use exprunner::queue::{fresh_queue_name, MemoryQueue};
use exprunner::store::MemoryStore;
use exprunner::worker::Worker;

/// Shared in-process backends for one test.
pub struct TestEnv {
    pub queue: Arc<MemoryQueue>,
    pub store: Arc<MemoryStore>,
    pub db: Arc<MemoryDb>,
    pub client: Client,
}

impl TestEnv {
    pub fn new() -> Self {
        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(MemoryStore::new());
        let db = Arc::new(MemoryDb::new());
        let client = Client::new(queue.clone(), store.clone(), db.clone());
        Self {
            queue,
            store,
            db,
            client,
        }
    }

    /// Worker config with shorter timeouts for faster tests.
    pub fn worker_config(&self, queue_name: &str, work_root: &Path) -> WorkerConfig {
        let mut config = WorkerConfig::new(queue_name);
        config.work_root = work_root.to_path_buf();
        config.execution_timeout = Duration::from_secs(20);
        config.visibility_timeout = Duration::from_secs(5);
        config.receive_wait = Duration::from_millis(200);
        config.capture_interval = Duration::from_millis(50);
        config
    }

    /// Spawn a worker on the shared backends.
    pub fn spawn_worker(
        &self,
        config: WorkerConfig,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<usize>> {
        let worker = Worker::new(
            config,
            self.queue.clone(),
            self.store.clone(),
            self.db.clone(),
        );
        tokio::spawn(async move { worker.run(cancel).await })
    }
}

/// Fresh random queue name, isolating this test run.
pub fn test_queue_name() -> String {
    fresh_queue_name("test")
}

/// Write an executable shell script into `dir` and return its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(50)).await;
    assert!(result, "{}", message);
}
