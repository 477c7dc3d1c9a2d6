//! The task state machine.
//!
//! Owns every status transition a task can make. Pending tasks move to
//! published, failed, or cancelled; nothing moves out of a terminal
//! state. A published recurring task enqueues exactly one successor.

use chrono::{Duration, Utc};
use postpilot_core::error::{PostPilotError, Result};
use postpilot_core::{Platform, PostPayload};
use postpilot_credentials::{CredentialError, CredentialManager};
use postpilot_dispatch::{DispatchOutcome, Dispatcher, PostRequest};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::persistence::TaskDb;
use crate::recurrence::next_occurrence;
use crate::tasks::{Recurrence, ScheduledTask, TaskStatus};

/// Recoverable failures a task absorbs before it is marked failed.
const MAX_TASK_ATTEMPTS: u32 = 3;

/// Specification of a task to create, as the authoring surface sends it.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub user_id: String,
    pub network_id: String,
    pub platform: Platform,
    pub payload: PostPayload,
    pub scheduled_for: chrono::DateTime<Utc>,
    pub recurrence: Option<Recurrence>,
}

/// Drives task lifecycles. Constructed once per process and shared.
pub struct TaskEngine {
    db: Arc<Mutex<TaskDb>>,
    dispatcher: Arc<Dispatcher>,
    credentials: Arc<CredentialManager>,
    /// Cooldown applied after a recoverable failure before the poller
    /// may pick the task up again.
    retry_cooldown: Duration,
}

impl TaskEngine {
    pub fn new(
        db: Arc<Mutex<TaskDb>>,
        dispatcher: Arc<Dispatcher>,
        credentials: Arc<CredentialManager>,
        retry_cooldown_secs: u64,
    ) -> Self {
        Self {
            db,
            dispatcher,
            credentials,
            retry_cooldown: Duration::seconds(retry_cooldown_secs as i64),
        }
    }

    pub fn db(&self) -> Arc<Mutex<TaskDb>> {
        self.db.clone()
    }

    /// Validate and persist a new pending task.
    pub async fn create(&self, spec: NewTask) -> Result<ScheduledTask> {
        if spec.payload.body.trim().is_empty() {
            return Err(PostPilotError::Validation("post body is empty".into()));
        }
        if spec.network_id.trim().is_empty() {
            return Err(PostPilotError::Validation("network id is empty".into()));
        }
        if let Some(recurrence) = &spec.recurrence {
            recurrence.validate()?;
            if let Some(ends_at) = recurrence.ends_at
                && ends_at <= spec.scheduled_for
            {
                return Err(PostPilotError::Validation(
                    "recurrence end date precedes the first occurrence".into(),
                ));
            }
        }

        let task = ScheduledTask {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: spec.user_id,
            network_id: spec.network_id,
            platform: spec.platform,
            payload: spec.payload,
            scheduled_for: spec.scheduled_for,
            recurrence: spec.recurrence,
            status: TaskStatus::Pending,
            failed_attempts: 0,
            last_error: None,
            published_at: None,
            next_attempt_after: None,
            created_at: Utc::now(),
        };
        self.db.lock().await.insert(&task)?;
        tracing::info!(
            "📅 Task {} scheduled for {} on {}",
            task.id,
            task.scheduled_for.to_rfc3339(),
            task.platform
        );
        Ok(task)
    }

    /// Cancel a pending task. Cancelling twice is a no-op success;
    /// cancelling a task in any other terminal state is rejected.
    pub async fn cancel(&self, task_id: &str) -> Result<()> {
        let db = self.db.lock().await;
        let mut task = db
            .get(task_id)?
            .ok_or_else(|| PostPilotError::Validation(format!("no such task: {task_id}")))?;

        match task.status {
            TaskStatus::Pending => {
                task.status = TaskStatus::Cancelled;
                db.update(&task)?;
                tracing::info!("🚫 Task {task_id} cancelled");
                Ok(())
            }
            TaskStatus::Cancelled => Ok(()),
            other => Err(PostPilotError::InvalidTransition(format!(
                "cannot cancel a {} task",
                other.as_str()
            ))),
        }
    }

    /// Tasks owned by a user.
    pub async fn tasks_for_user(&self, user_id: &str) -> Result<Vec<ScheduledTask>> {
        self.db.lock().await.for_user(user_id)
    }

    /// Delete a task on the owner's behalf. Published tasks are kept.
    pub async fn delete(&self, task_id: &str, user_id: &str) -> Result<bool> {
        self.db.lock().await.delete(task_id, user_id)
    }

    /// Publish a pending task immediately, bypassing the due check.
    /// Same claim and processing path as the poller.
    pub async fn run_now(&self, task_id: &str) -> Result<ScheduledTask> {
        let task = {
            let db = self.db.lock().await;
            let task = db
                .get(task_id)?
                .ok_or_else(|| PostPilotError::Validation(format!("no such task: {task_id}")))?;
            if task.status != TaskStatus::Pending {
                return Err(PostPilotError::InvalidTransition(format!(
                    "cannot publish a {} task",
                    task.status.as_str()
                )));
            }
            if !db.claim(task_id)? {
                return Err(PostPilotError::InvalidTransition(
                    "task is already being processed".into(),
                ));
            }
            task
        };
        self.process_due(task).await
    }

    /// Process one claimed due task to an outcome.
    ///
    /// The caller must hold the task's claim (via `claim_due`, `claim`,
    /// or `run_now`); every path through here writes the task back and
    /// releases it.
    pub async fn process_due(&self, mut task: ScheduledTask) -> Result<ScheduledTask> {
        let credential = match self
            .credentials
            .get_valid(&task.user_id, task.platform)
            .await
        {
            Ok(credential) => credential,
            // Local storage trouble, not a user problem. Release the
            // claim so a later pass retries; no budget is consumed.
            Err(CredentialError::Internal(reason)) => {
                self.release_claim(&task.id).await;
                return Err(PostPilotError::Credential(reason));
            }
            // NotConfigured / NeedsReauth: only user action can fix
            // them, so the task fails without consuming retry budget.
            Err(e) => {
                tracing::warn!("⚠️ Task {} failed credential resolution: {e}", task.id);
                task.status = TaskStatus::Failed;
                task.last_error = Some(e.to_string());
                self.write_outcome(&task).await?;
                return Ok(task);
            }
        };

        let request = PostRequest {
            user_id: task.user_id.clone(),
            platform: task.platform,
            network_id: task.network_id.clone(),
            payload: task.payload.clone(),
        };

        match self.dispatcher.publish(&request, credential).await {
            DispatchOutcome::Success { post_id } => {
                task.status = TaskStatus::Published;
                task.published_at = Some(Utc::now());
                task.last_error = None;
                task.next_attempt_after = None;
                self.write_outcome(&task).await?;
                tracing::info!("✅ Task {} published as {post_id}", task.id);
                self.enqueue_successor(&task).await?;
            }
            DispatchOutcome::Recoverable(reason) => {
                task.failed_attempts += 1;
                task.last_error = Some(reason.clone());
                if task.failed_attempts >= MAX_TASK_ATTEMPTS {
                    task.status = TaskStatus::Failed;
                    tracing::warn!(
                        "❌ Task {} failed after {} attempts: {reason}",
                        task.id,
                        task.failed_attempts
                    );
                } else {
                    // Stays pending; the cooldown keeps the poller from
                    // hammering a rate-limited provider every pass.
                    task.next_attempt_after = Some(Utc::now() + self.retry_cooldown);
                    tracing::warn!(
                        "🔁 Task {} attempt {}/{MAX_TASK_ATTEMPTS} failed, will retry: {reason}",
                        task.id,
                        task.failed_attempts
                    );
                }
                self.write_outcome(&task).await?;
            }
            DispatchOutcome::Fatal(reason) => {
                task.status = TaskStatus::Failed;
                task.last_error = Some(reason.clone());
                self.write_outcome(&task).await?;
                tracing::warn!("❌ Task {} failed permanently: {reason}", task.id);
            }
        }

        Ok(task)
    }

    /// Persist a processing outcome. If the write fails, try to release
    /// the claim anyway so the task is not stranded in flight.
    async fn write_outcome(&self, task: &ScheduledTask) -> Result<()> {
        let db = self.db.lock().await;
        if let Err(e) = db.update(task) {
            if let Err(release_err) = db.release(&task.id) {
                tracing::warn!("⚠️ Could not release task {}: {release_err}", task.id);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn release_claim(&self, task_id: &str) {
        if let Err(e) = self.db.lock().await.release(task_id) {
            tracing::warn!("⚠️ Could not release task {task_id}: {e}");
        }
    }

    /// After a recurring task publishes, create its single successor —
    /// unless the rule's end date says the series is over.
    async fn enqueue_successor(&self, task: &ScheduledTask) -> Result<()> {
        let Some(recurrence) = &task.recurrence else {
            return Ok(());
        };
        let next = next_occurrence(task.scheduled_for, recurrence);
        if let Some(ends_at) = recurrence.ends_at
            && next > ends_at
        {
            tracing::info!("🏁 Recurring task {} reached its end date", task.id);
            return Ok(());
        }

        let successor = task.successor(next);
        self.db.lock().await.insert(&successor)?;
        tracing::info!(
            "🔂 Recurring task {} enqueued successor {} for {}",
            task.id,
            successor.id,
            next.to_rfc3339()
        );
        Ok(())
    }
}
