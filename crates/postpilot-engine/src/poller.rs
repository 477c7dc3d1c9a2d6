//! The due-task poller.
//!
//! Every tick, atomically claim the batch of due tasks and process them
//! with bounded concurrency. A second, slower tick sweeps credentials
//! nearing expiry so tokens refresh before a post needs them. One
//! task's failure or panic never takes down a pass.

use futures::future::join_all;
use postpilot_core::config::PollerConfig;
use postpilot_credentials::CredentialManager;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::machine::TaskEngine;

/// Claim at most this many tasks per pass; the rest wait for the next
/// tick. Keeps a huge backlog from pinning one pass forever.
const CLAIM_BATCH: usize = 32;

/// Run one polling pass: claim due tasks and process them, at most
/// `max_concurrent` in flight at once. Returns how many tasks were
/// processed to an outcome.
pub async fn run_pass(engine: &Arc<TaskEngine>, max_concurrent: usize) -> usize {
    let claimed = {
        let db = engine.db();
        let db = db.lock().await;
        match db.claim_due(chrono::Utc::now(), CLAIM_BATCH) {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::warn!("⚠️ Due-task query failed: {e}");
                return 0;
            }
        }
    };
    if claimed.is_empty() {
        return 0;
    }
    tracing::info!("🔔 {} due task(s) claimed", claimed.len());

    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut handles: Vec<(String, JoinHandle<()>)> = Vec::with_capacity(claimed.len());

    for task in claimed {
        let engine = engine.clone();
        let semaphore = semaphore.clone();
        let task_id = task.id.clone();
        let handle = tokio::spawn(async move {
            // Semaphore is never closed, so acquire only fails if it
            // were; treat that as a skipped slot.
            let Ok(_permit) = semaphore.acquire().await else {
                return;
            };
            if let Err(e) = engine.process_due(task).await {
                tracing::warn!("⚠️ Task processing error: {e}");
            }
        });
        handles.push((task_id, handle));
    }

    let (task_ids, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
    let mut processed = 0;
    for (task_id, joined) in task_ids.into_iter().zip(join_all(handles).await) {
        match joined {
            Ok(()) => processed += 1,
            Err(e) => {
                // A panicked worker leaves its claim set; release it so
                // the next pass can pick the task up again.
                tracing::error!("⚠️ Task {task_id} worker crashed: {e}");
                if let Err(e) = engine.db().lock().await.release(&task_id) {
                    tracing::warn!("⚠️ Could not release task {task_id}: {e}");
                }
            }
        }
    }
    processed
}

/// Start the background poller: a fast tick for due tasks and a slow
/// tick for the credential expiry sweep, on one spawned loop.
pub fn spawn_poller(
    engine: Arc<TaskEngine>,
    credentials: Arc<CredentialManager>,
    config: &PollerConfig,
) -> JoinHandle<()> {
    let interval = std::time::Duration::from_secs(config.interval_secs.max(1));
    let sweep_interval = std::time::Duration::from_secs(config.sweep_interval_secs.max(1));
    let max_concurrent = config.max_concurrent.max(1);

    tracing::info!(
        "📅 Poller started (every {}s, sweep every {}s, {} workers)",
        interval.as_secs(),
        sweep_interval.as_secs(),
        max_concurrent
    );

    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweep = tokio::time::interval(sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let n = run_pass(&engine, max_concurrent).await;
                    if n > 0 {
                        tracing::info!("✅ Pass complete: {n} task(s) processed");
                    }
                }
                _ = sweep.tick() => {
                    let refreshed = credentials.sweep_expiring().await;
                    if refreshed > 0 {
                        tracing::info!("🔑 Expiry sweep refreshed {refreshed} credential(s)");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::NewTask;
    use crate::persistence::TaskDb;
    use crate::tasks::TaskStatus;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use postpilot_core::{Platform, PostPayload, PostPilotError};
    use postpilot_credentials::{Credential, RefreshedToken, TokenRefresher};
    use postpilot_dispatch::{Dispatcher, ProviderAdapter, ProviderFailure, ProviderPost};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct NoRefresh;

    #[async_trait]
    impl TokenRefresher for NoRefresh {
        fn can_refresh(&self, _credential: &Credential) -> bool {
            false
        }
        async fn refresh(
            &self,
            _credential: &Credential,
        ) -> postpilot_core::Result<RefreshedToken> {
            Err(PostPilotError::Credential("no refresh".into()))
        }
    }

    /// Adapter that tracks how many posts run at once and succeeds,
    /// except for bodies containing "poison".
    struct GaugeAdapter {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl GaugeAdapter {
        fn new() -> Self {
            Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ProviderAdapter for GaugeAdapter {
        fn platform(&self) -> Platform {
            Platform::Facebook
        }

        async fn post(
            &self,
            _credential: &Credential,
            _network_id: &str,
            payload: &PostPayload,
        ) -> Result<ProviderPost, ProviderFailure> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);

            if payload.body.contains("poison") {
                Err(ProviderFailure::api(Some(100), 400, "bad request"))
            } else {
                Ok(ProviderPost {
                    post_id: "ok".into(),
                })
            }
        }
    }

    struct Harness {
        engine: Arc<TaskEngine>,
        adapter: Arc<GaugeAdapter>,
        dir: std::path::PathBuf,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.dir).ok();
        }
    }

    /// Forwards to a shared GaugeAdapter so the test can read the peak.
    struct Shared(Arc<GaugeAdapter>);

    #[async_trait]
    impl ProviderAdapter for Shared {
        fn platform(&self) -> Platform {
            self.0.platform()
        }
        async fn post(
            &self,
            credential: &Credential,
            network_id: &str,
            payload: &PostPayload,
        ) -> Result<ProviderPost, ProviderFailure> {
            self.0.post(credential, network_id, payload).await
        }
    }

    async fn harness(name: &str) -> Harness {
        let dir = std::env::temp_dir().join(name);
        std::fs::create_dir_all(&dir).ok();

        let credentials = Arc::new(
            CredentialManager::open(&dir.join("creds.db"), true, 3, Arc::new(NoRefresh)).unwrap(),
        );
        credentials
            .store_credential(&Credential::new("user-1", Platform::Facebook, "token"))
            .await
            .unwrap();

        let adapter = Arc::new(GaugeAdapter::new());
        let mut dispatcher = Dispatcher::new(credentials.clone());
        dispatcher.register(Box::new(Shared(adapter.clone())));

        let db = Arc::new(Mutex::new(TaskDb::open(&dir.join("tasks.db")).unwrap()));
        let engine = Arc::new(TaskEngine::new(
            db,
            Arc::new(dispatcher),
            credentials,
            300,
        ));
        Harness {
            engine,
            adapter,
            dir,
        }
    }

    fn spec(body: &str, due_in_secs: i64) -> NewTask {
        NewTask {
            user_id: "user-1".into(),
            network_id: "page-1".into(),
            platform: Platform::Facebook,
            payload: PostPayload::new("title", body),
            scheduled_for: Utc::now() + Duration::seconds(due_in_secs),
            recurrence: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pass_processes_only_due_tasks() {
        let h = harness("postpilot-poller-due").await;
        let due = h.engine.create(spec("post now", -5)).await.unwrap();
        let future = h.engine.create(spec("post later", 3600)).await.unwrap();

        assert_eq!(run_pass(&h.engine, 4).await, 1);

        let db = h.engine.db();
        let db = db.lock().await;
        assert_eq!(db.get(&due.id).unwrap().unwrap().status, TaskStatus::Published);
        assert_eq!(db.get(&future.id).unwrap().unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_pass_is_a_noop() {
        let h = harness("postpilot-poller-empty").await;
        assert_eq!(run_pass(&h.engine, 4).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let h = harness("postpilot-poller-bounded").await;
        for i in 0..6 {
            h.engine
                .create(spec(&format!("post {i}"), -5))
                .await
                .unwrap();
        }

        assert_eq!(run_pass(&h.engine, 2).await, 6);
        assert!(h.adapter.peak.load(Ordering::SeqCst) <= 2);
        // The semaphore gates, it does not serialize.
        assert!(h.adapter.peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_failure_does_not_stop_the_pass() {
        let h = harness("postpilot-poller-isolated").await;
        let bad = h.engine.create(spec("poison pill", -5)).await.unwrap();
        let good = h.engine.create(spec("fine post", -5)).await.unwrap();

        assert_eq!(run_pass(&h.engine, 4).await, 2);

        let db = h.engine.db();
        let db = db.lock().await;
        assert_eq!(db.get(&bad.id).unwrap().unwrap().status, TaskStatus::Failed);
        assert_eq!(db.get(&good.id).unwrap().unwrap().status, TaskStatus::Published);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_pass_finds_nothing_in_flight() {
        // Once a pass claimed everything due, an immediately following
        // pass sees an empty batch even before outcomes land.
        let h = harness("postpilot-poller-claim").await;
        h.engine.create(spec("only one", -5)).await.unwrap();

        let first = run_pass(&h.engine, 4).await;
        let second = run_pass(&h.engine, 4).await;
        assert_eq!(first, 1);
        assert_eq!(second, 0);
    }
}
