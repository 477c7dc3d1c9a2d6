//! Task definitions — the core data model for scheduled posts.

use chrono::{DateTime, NaiveTime, Utc};
use postpilot_core::error::{PostPilotError, Result};
use postpilot_core::{Platform, PostPayload};
use serde::{Deserialize, Serialize};

/// A post scheduled for publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// Unique task ID.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Provider-side resource the post targets (page id, account id).
    pub network_id: String,
    pub platform: Platform,
    pub payload: PostPayload,
    /// When the post is due.
    pub scheduled_for: DateTime<Utc>,
    /// Recurrence rule; None = one-shot.
    pub recurrence: Option<Recurrence>,
    pub status: TaskStatus,
    /// Recoverable failures so far (task-level budget, capped at 3).
    pub failed_attempts: u32,
    /// Human-readable reason for the most recent failure.
    pub last_error: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    /// Cooldown gate: the poller skips the task until this passes.
    pub next_attempt_after: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Task status. Published, Failed, and Cancelled are terminal — only
/// Pending tasks transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Published,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Published => "published",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> TaskStatus {
        match s {
            "published" => TaskStatus::Published,
            "failed" => TaskStatus::Failed,
            "cancelled" => TaskStatus::Cancelled,
            _ => TaskStatus::Pending,
        }
    }

    /// Terminal statuses accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Pending)
    }
}

/// How a task regenerates its successor after publishing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recurrence {
    pub pattern: RecurrencePattern,
    /// Time of day every occurrence is stamped with.
    pub time_of_day: NaiveTime,
    /// Weekly only: 0 = Sunday … 6 = Saturday.
    #[serde(default)]
    pub day_of_week: Option<u32>,
    /// Monthly only: 1–31, clamped to shorter months.
    #[serde(default)]
    pub day_of_month: Option<u32>,
    /// No successor is created past this point.
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecurrencePattern {
    Daily,
    Weekly,
    Monthly,
}

impl Recurrence {
    /// Reject rules whose fields contradict their pattern.
    pub fn validate(&self) -> Result<()> {
        match self.pattern {
            RecurrencePattern::Daily => {
                if self.day_of_week.is_some() || self.day_of_month.is_some() {
                    return Err(PostPilotError::Validation(
                        "daily recurrence takes neither day_of_week nor day_of_month".into(),
                    ));
                }
            }
            RecurrencePattern::Weekly => {
                if self.day_of_month.is_some() {
                    return Err(PostPilotError::Validation(
                        "weekly recurrence does not take day_of_month".into(),
                    ));
                }
                if let Some(dow) = self.day_of_week
                    && dow > 6
                {
                    return Err(PostPilotError::Validation(format!(
                        "day_of_week must be 0-6, got {dow}"
                    )));
                }
            }
            RecurrencePattern::Monthly => {
                if self.day_of_week.is_some() {
                    return Err(PostPilotError::Validation(
                        "monthly recurrence does not take day_of_week".into(),
                    ));
                }
                if let Some(dom) = self.day_of_month
                    && !(1..=31).contains(&dom)
                {
                    return Err(PostPilotError::Validation(format!(
                        "day_of_month must be 1-31, got {dom}"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl ScheduledTask {
    /// Successor of a published recurring task: same payload, network,
    /// and rule; fresh id, fresh counters, new due time.
    pub fn successor(&self, scheduled_for: DateTime<Utc>) -> ScheduledTask {
        ScheduledTask {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: self.user_id.clone(),
            network_id: self.network_id.clone(),
            platform: self.platform,
            payload: self.payload.clone(),
            scheduled_for,
            recurrence: self.recurrence.clone(),
            status: TaskStatus::Pending,
            failed_attempts: 0,
            last_error: None,
            published_at: None,
            next_attempt_after: None,
            created_at: Utc::now(),
        }
    }
}
