//! SQLite-backed persistence for scheduled tasks.
//!
//! The due query and the claim flag together guarantee at-most-one
//! dispatch per due task per pass: a task is handed out only by an
//! atomic conditional flip of `in_flight`, and every status-writing
//! update clears the flag again.

use chrono::{DateTime, Utc};
use postpilot_core::error::{PostPilotError, Result};
use postpilot_core::{Platform, PostPayload};
use std::path::Path;
use std::str::FromStr;

use crate::tasks::{Recurrence, ScheduledTask, TaskStatus};

/// SQLite task store.
pub struct TaskDb {
    conn: rusqlite::Connection,
}

impl TaskDb {
    /// Open or create the task database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| PostPilotError::Storage(format!("DB open: {e}")))?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                network_id TEXT NOT NULL,
                platform TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                body TEXT NOT NULL,
                image_url TEXT,
                link_url TEXT,
                scheduled_for TEXT NOT NULL,
                recurrence TEXT,                -- JSON rule, NULL = one-shot
                status TEXT NOT NULL DEFAULT 'pending',
                failed_attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                published_at TEXT,
                next_attempt_after TEXT,
                in_flight INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_due
                ON tasks(status, scheduled_for);
            CREATE INDEX IF NOT EXISTS idx_tasks_user
                ON tasks(user_id);
            -- Claims are per-process; one stranded by a crash must not
            -- block the task forever. Only this process opens the db.
            UPDATE tasks SET in_flight = 0 WHERE in_flight = 1;
         ",
            )
            .map_err(|e| PostPilotError::Storage(format!("Migration: {e}")))?;
        Ok(())
    }

    /// Insert a new task.
    pub fn insert(&self, task: &ScheduledTask) -> Result<()> {
        let recurrence = task
            .recurrence
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.conn
            .execute(
                "INSERT INTO tasks
                 (id, user_id, network_id, platform, title, body, image_url, link_url,
                  scheduled_for, recurrence, status, failed_attempts, last_error,
                  published_at, next_attempt_after, in_flight, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, 0, ?16)",
                rusqlite::params![
                    task.id,
                    task.user_id,
                    task.network_id,
                    task.platform.as_str(),
                    task.payload.title,
                    task.payload.body,
                    task.payload.image_url,
                    task.payload.link_url,
                    task.scheduled_for.to_rfc3339(),
                    recurrence,
                    task.status.as_str(),
                    task.failed_attempts,
                    task.last_error,
                    task.published_at.map(|t| t.to_rfc3339()),
                    task.next_attempt_after.map(|t| t.to_rfc3339()),
                    task.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| PostPilotError::Storage(format!("Insert task: {e}")))?;
        Ok(())
    }

    /// Write back a task's mutable state and release its claim.
    pub fn update(&self, task: &ScheduledTask) -> Result<()> {
        self.conn
            .execute(
                "UPDATE tasks SET status = ?2, failed_attempts = ?3, last_error = ?4,
                        published_at = ?5, next_attempt_after = ?6, scheduled_for = ?7,
                        in_flight = 0
                 WHERE id = ?1",
                rusqlite::params![
                    task.id,
                    task.status.as_str(),
                    task.failed_attempts,
                    task.last_error,
                    task.published_at.map(|t| t.to_rfc3339()),
                    task.next_attempt_after.map(|t| t.to_rfc3339()),
                    task.scheduled_for.to_rfc3339(),
                ],
            )
            .map_err(|e| PostPilotError::Storage(format!("Update task: {e}")))?;
        Ok(())
    }

    /// Load one task by id.
    pub fn get(&self, id: &str) -> Result<Option<ScheduledTask>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_TASK} WHERE id = ?1"))
            .map_err(|e| PostPilotError::Storage(format!("Get task: {e}")))?;
        let mut rows = stmt
            .query_map([id], row_to_task)
            .map_err(|e| PostPilotError::Storage(format!("Get task: {e}")))?;
        match rows.next() {
            Some(row) => Ok(Some(
                row.map_err(|e| PostPilotError::Storage(format!("Get task row: {e}")))?,
            )),
            None => Ok(None),
        }
    }

    /// All tasks owned by a user, newest schedule first.
    pub fn for_user(&self, user_id: &str) -> Result<Vec<ScheduledTask>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{SELECT_TASK} WHERE user_id = ?1 ORDER BY scheduled_for DESC"
            ))
            .map_err(|e| PostPilotError::Storage(format!("User tasks: {e}")))?;
        let rows = stmt
            .query_map([user_id], row_to_task)
            .map_err(|e| PostPilotError::Storage(format!("User tasks: {e}")))?;
        collect_tasks(rows)
    }

    /// Atomically claim up to `limit` due tasks.
    ///
    /// A task qualifies when it is pending, its due time has passed, any
    /// retry cooldown has elapsed, and no other worker holds it. Each
    /// returned task had its `in_flight` flag flipped by a conditional
    /// update, so overlapping passes cannot hand out the same task twice.
    pub fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledTask>> {
        let now_str = now.to_rfc3339();
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{SELECT_TASK}
                 WHERE status = 'pending' AND in_flight = 0 AND scheduled_for <= ?1
                   AND (next_attempt_after IS NULL OR next_attempt_after <= ?1)
                 ORDER BY scheduled_for LIMIT ?2"
            ))
            .map_err(|e| PostPilotError::Storage(format!("Due query: {e}")))?;
        let rows = stmt
            .query_map(rusqlite::params![now_str, limit as i64], row_to_task)
            .map_err(|e| PostPilotError::Storage(format!("Due query: {e}")))?;
        let candidates = collect_tasks(rows)?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for task in candidates {
            if self.claim(&task.id)? {
                claimed.push(task);
            }
        }
        Ok(claimed)
    }

    /// Conditional pending → in-flight flip. Returns false if the task
    /// is already claimed or no longer pending.
    pub fn claim(&self, id: &str) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "UPDATE tasks SET in_flight = 1
                 WHERE id = ?1 AND status = 'pending' AND in_flight = 0",
                [id],
            )
            .map_err(|e| PostPilotError::Storage(format!("Claim task: {e}")))?;
        Ok(n == 1)
    }

    /// Release a claim without touching status (processing aborted
    /// before any outcome was reached).
    pub fn release(&self, id: &str) -> Result<()> {
        self.conn
            .execute("UPDATE tasks SET in_flight = 0 WHERE id = ?1", [id])
            .map_err(|e| PostPilotError::Storage(format!("Release task: {e}")))?;
        Ok(())
    }

    /// Delete a task on the owner's behalf. Published posts stay on
    /// record and cannot be deleted here.
    pub fn delete(&self, id: &str, user_id: &str) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "DELETE FROM tasks
                 WHERE id = ?1 AND user_id = ?2 AND status != 'published'",
                rusqlite::params![id, user_id],
            )
            .map_err(|e| PostPilotError::Storage(format!("Delete task: {e}")))?;
        Ok(n > 0)
    }
}

const SELECT_TASK: &str = "SELECT id, user_id, network_id, platform, title, body, image_url,
        link_url, scheduled_for, recurrence, status, failed_attempts, last_error,
        published_at, next_attempt_after, created_at FROM tasks";

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledTask> {
    let platform_str: String = row.get(3)?;
    let recurrence_str: Option<String> = row.get(9)?;
    let status_str: String = row.get(10)?;

    let recurrence: Option<Recurrence> =
        recurrence_str.and_then(|s| serde_json::from_str(&s).ok());

    Ok(ScheduledTask {
        id: row.get(0)?,
        user_id: row.get(1)?,
        network_id: row.get(2)?,
        platform: Platform::from_str(&platform_str).unwrap_or(Platform::Facebook),
        payload: PostPayload {
            title: row.get(4)?,
            body: row.get(5)?,
            image_url: row.get(6)?,
            link_url: row.get(7)?,
        },
        scheduled_for: parse_time(row.get::<_, String>(8)?),
        recurrence,
        status: TaskStatus::parse(&status_str),
        failed_attempts: row.get(11)?,
        last_error: row.get(12)?,
        published_at: row.get::<_, Option<String>>(13)?.map(parse_time),
        next_attempt_after: row.get::<_, Option<String>>(14)?.map(parse_time),
        created_at: parse_time(row.get::<_, String>(15)?),
    })
}

fn parse_time(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn collect_tasks<'a>(
    rows: impl Iterator<Item = rusqlite::Result<ScheduledTask>> + 'a,
) -> Result<Vec<ScheduledTask>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| PostPilotError::Storage(format!("Task row: {e}")))?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn temp_db(name: &str) -> (TaskDb, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(name);
        std::fs::create_dir_all(&dir).ok();
        let db = TaskDb::open(&dir.join("tasks.db")).unwrap();
        (db, dir)
    }

    fn task(id: &str, due_in_secs: i64) -> ScheduledTask {
        ScheduledTask {
            id: id.to_string(),
            user_id: "user-1".into(),
            network_id: "page-1".into(),
            platform: Platform::Facebook,
            payload: PostPayload::new("title", "body"),
            scheduled_for: Utc::now() + Duration::seconds(due_in_secs),
            recurrence: None,
            status: TaskStatus::Pending,
            failed_attempts: 0,
            last_error: None,
            published_at: None,
            next_attempt_after: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_get_roundtrip() {
        let (db, dir) = temp_db("postpilot-taskdb-roundtrip");
        let mut t = task("t1", 60);
        t.recurrence = Some(crate::tasks::Recurrence {
            pattern: crate::tasks::RecurrencePattern::Weekly,
            time_of_day: chrono::NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            day_of_week: Some(2),
            day_of_month: None,
            ends_at: None,
        });
        db.insert(&t).unwrap();

        let loaded = db.get("t1").unwrap().unwrap();
        assert_eq!(loaded.payload.body, "body");
        assert_eq!(loaded.platform, Platform::Facebook);
        assert_eq!(loaded.status, TaskStatus::Pending);
        let rec = loaded.recurrence.unwrap();
        assert_eq!(rec.day_of_week, Some(2));
        assert!(db.get("missing").unwrap().is_none());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_claim_due_selects_only_due_pending() {
        let (db, dir) = temp_db("postpilot-taskdb-due");
        db.insert(&task("due", -5)).unwrap();
        db.insert(&task("future", 3600)).unwrap();
        let mut published = task("done", -5);
        published.status = TaskStatus::Published;
        db.insert(&published).unwrap();
        let mut cooling = task("cooling", -5);
        cooling.next_attempt_after = Some(Utc::now() + Duration::seconds(300));
        db.insert(&cooling).unwrap();

        let claimed = db.claim_due(Utc::now(), 10).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, "due");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_claim_is_exclusive() {
        let (db, dir) = temp_db("postpilot-taskdb-claim");
        db.insert(&task("t1", -5)).unwrap();

        // First pass claims it; an overlapping pass gets nothing.
        assert_eq!(db.claim_due(Utc::now(), 10).unwrap().len(), 1);
        assert!(db.claim_due(Utc::now(), 10).unwrap().is_empty());
        assert!(!db.claim("t1").unwrap());

        // Writing the outcome releases the claim, but a terminal status
        // never qualifies again.
        let mut t = db.get("t1").unwrap().unwrap();
        t.status = TaskStatus::Published;
        t.published_at = Some(Utc::now());
        db.update(&t).unwrap();
        assert!(db.claim_due(Utc::now(), 10).unwrap().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_reopen_releases_stale_claims() {
        let (db, dir) = temp_db("postpilot-taskdb-reopen");
        db.insert(&task("t1", -5)).unwrap();
        assert_eq!(db.claim_due(Utc::now(), 10).unwrap().len(), 1);

        // Crash before any outcome write: the claim is persisted but
        // the worker is gone. Reopening must hand the task out again.
        drop(db);
        let db = TaskDb::open(&dir.join("tasks.db")).unwrap();
        let reclaimed = db.claim_due(Utc::now(), 10).unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, "t1");
        assert_eq!(reclaimed[0].status, TaskStatus::Pending);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_release_without_outcome() {
        let (db, dir) = temp_db("postpilot-taskdb-release");
        db.insert(&task("t1", -5)).unwrap();
        assert!(db.claim("t1").unwrap());
        db.release("t1").unwrap();
        assert!(db.claim("t1").unwrap());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_delete_rejects_published() {
        let (db, dir) = temp_db("postpilot-taskdb-delete");
        let mut published = task("p1", -5);
        published.status = TaskStatus::Published;
        db.insert(&published).unwrap();
        db.insert(&task("t1", 60)).unwrap();

        assert!(!db.delete("p1", "user-1").unwrap());
        assert!(db.delete("t1", "user-1").unwrap());
        // Wrong owner deletes nothing.
        db.insert(&task("t2", 60)).unwrap();
        assert!(!db.delete("t2", "someone-else").unwrap());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_for_user() {
        let (db, dir) = temp_db("postpilot-taskdb-user");
        db.insert(&task("t1", 60)).unwrap();
        db.insert(&task("t2", 120)).unwrap();
        let mut other = task("t3", 60);
        other.user_id = "user-2".into();
        db.insert(&other).unwrap();

        let mine = db.for_user("user-1").unwrap();
        assert_eq!(mine.len(), 2);
        assert_eq!(db.for_user("user-2").unwrap().len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }
}
