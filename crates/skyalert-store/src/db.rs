//! SQLite-backed mail-task queue and pending-notification store.
//!
//! The queue is the single source of truth for outbound mail. `claim` is
//! the exclusivity boundary: it transitions pending tasks to processing
//! inside one transaction, so two dispatcher invocations can never both
//! hold the same task.

use std::path::Path;
use std::sync::Mutex;

use chrono::{Local, NaiveDateTime};
use rusqlite::Connection;
use skyalert_core::error::{Result, SkyAlertError};
use skyalert_core::types::{
    MailPayload, MailTask, Notification, NotificationStatus, TIMESTAMP_FORMAT, TaskStatus,
    new_notification_id, new_task_id,
};

pub struct MailStore {
    conn: Mutex<Connection>,
}

impl MailStore {
    /// Open (or create) the queue database and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| SkyAlertError::Store(format!("DB open: {e}")))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.lock()?
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS mail_task (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id TEXT UNIQUE NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    payload TEXT,
                    is_test INTEGER NOT NULL DEFAULT 0,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    error TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS notification (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    notification_id TEXT UNIQUE NOT NULL,
                    recipient TEXT NOT NULL,
                    title TEXT NOT NULL,
                    content TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    is_test INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL
                );",
            )
            .map_err(|e| SkyAlertError::Store(format!("Migration: {e}")))?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| SkyAlertError::Store(e.to_string()))
    }

    fn now_text() -> String {
        Local::now().naive_local().format(TIMESTAMP_FORMAT).to_string()
    }

    // ─── Mail tasks ───────────────────────────────────────

    /// Enqueue a rendered payload as a pending task. Returns the task id.
    pub fn enqueue(&self, payload: &MailPayload) -> Result<String> {
        let task_id = new_task_id(&payload.to_email);
        self.enqueue_with_task_id(&task_id, payload)?;
        Ok(task_id)
    }

    /// Enqueue under an explicit task id. A colliding id replaces the
    /// existing row rather than duplicating it.
    pub fn enqueue_with_task_id(&self, task_id: &str, payload: &MailPayload) -> Result<()> {
        let json = serde_json::to_string(payload)?;
        let now = Self::now_text();
        self.lock()?
            .execute(
                "INSERT OR REPLACE INTO mail_task
                 (task_id, status, payload, is_test, attempts, error, created_at, updated_at)
                 VALUES (?1, 'pending', ?2, ?3, 0, NULL, ?4, ?4)",
                rusqlite::params![task_id, json, payload.is_test as i32, now],
            )
            .map_err(|e| SkyAlertError::Store(format!("Enqueue: {e}")))?;
        Ok(())
    }

    /// Atomically claim pending tasks (oldest first): mark them processing,
    /// bump attempts, and return them. After this call returns, no other
    /// claimer can observe the same tasks as pending.
    pub fn claim(&self, is_test: Option<bool>, limit: Option<usize>) -> Result<Vec<MailTask>> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| SkyAlertError::Store(format!("Claim tx: {e}")))?;

        let mut sql = String::from("SELECT task_id FROM mail_task WHERE status = 'pending'");
        if let Some(flag) = is_test {
            sql.push_str(&format!(" AND is_test = {}", flag as i32));
        }
        sql.push_str(" ORDER BY created_at, id");
        if let Some(n) = limit {
            sql.push_str(&format!(" LIMIT {n}"));
        }

        let task_ids: Vec<String> = {
            let mut stmt = tx
                .prepare(&sql)
                .map_err(|e| SkyAlertError::Store(format!("Claim select: {e}")))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| SkyAlertError::Store(format!("Claim select: {e}")))?;
            rows.filter_map(|r| r.ok()).collect()
        };

        let now = Self::now_text();
        let mut tasks = Vec::with_capacity(task_ids.len());
        for task_id in &task_ids {
            tx.execute(
                "UPDATE mail_task
                 SET status = 'processing', attempts = attempts + 1, updated_at = ?1
                 WHERE task_id = ?2 AND status = 'pending'",
                rusqlite::params![now, task_id],
            )
            .map_err(|e| SkyAlertError::Store(format!("Claim update: {e}")))?;
            if let Some(task) = Self::task_row(&tx, task_id)?
                && task.status == TaskStatus::Processing
            {
                tasks.push(task);
            }
        }

        tx.commit()
            .map_err(|e| SkyAlertError::Store(format!("Claim commit: {e}")))?;
        Ok(tasks)
    }

    /// processing → sent.
    pub fn complete(&self, task_id: &str) -> Result<()> {
        self.transition(task_id, TaskStatus::Sent, None)
    }

    /// processing → failed, with the error text recorded. The queue never
    /// retries failed tasks on its own.
    pub fn fail(&self, task_id: &str, error: &str) -> Result<()> {
        self.transition(task_id, TaskStatus::Failed, Some(error))
    }

    fn transition(&self, task_id: &str, to: TaskStatus, error: Option<&str>) -> Result<()> {
        let rows = self
            .lock()?
            .execute(
                "UPDATE mail_task SET status = ?1, error = ?2, updated_at = ?3
                 WHERE task_id = ?4 AND status = 'processing'",
                rusqlite::params![to.as_str(), error, Self::now_text(), task_id],
            )
            .map_err(|e| SkyAlertError::Store(format!("Task update: {e}")))?;
        if rows == 0 {
            return Err(SkyAlertError::Store(format!(
                "task {task_id} is not in processing state"
            )));
        }
        Ok(())
    }

    /// Operator override: put a failed (or stuck processing) task back to
    /// pending so the next dispatch picks it up.
    pub fn reset_to_pending(&self, task_id: &str) -> Result<()> {
        let rows = self
            .lock()?
            .execute(
                "UPDATE mail_task SET status = 'pending', error = NULL, updated_at = ?1
                 WHERE task_id = ?2 AND status IN ('failed', 'processing')",
                rusqlite::params![Self::now_text(), task_id],
            )
            .map_err(|e| SkyAlertError::Store(format!("Task reset: {e}")))?;
        if rows == 0 {
            return Err(SkyAlertError::Store(format!(
                "task {task_id} not found or not resettable"
            )));
        }
        Ok(())
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<MailTask>> {
        let conn = self.lock()?;
        Self::task_row(&conn, task_id)
    }

    pub fn pending_task_count(&self) -> Result<usize> {
        let count: i64 = self
            .lock()?
            .query_row(
                "SELECT COUNT(*) FROM mail_task WHERE status = 'pending'",
                [],
                |row| row.get(0),
            )
            .map_err(|e| SkyAlertError::Store(format!("Task count: {e}")))?;
        Ok(count as usize)
    }

    fn task_row(conn: &Connection, task_id: &str) -> Result<Option<MailTask>> {
        let row = conn
            .query_row(
                "SELECT id, task_id, status, payload, is_test, attempts, error, created_at, updated_at
                 FROM mail_task WHERE task_id = ?1",
                [task_id],
                |row| {
                    Ok(MailTask {
                        id: row.get(0)?,
                        task_id: row.get(1)?,
                        status: TaskStatus::parse(&row.get::<_, String>(2)?),
                        payload: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                        is_test: row.get::<_, i32>(4)? != 0,
                        attempts: row.get(5)?,
                        error: row.get(6)?,
                        created_at: parse_ts(&row.get::<_, String>(7)?),
                        updated_at: parse_ts(&row.get::<_, String>(8)?),
                    })
                },
            )
            .ok();
        Ok(row)
    }

    // ─── Notifications (manual approval) ──────────────────

    /// Stage a payload for human review. Returns the notification id.
    pub fn create_notification(
        &self,
        payload: &MailPayload,
        title: &str,
        content: &str,
    ) -> Result<String> {
        let notification_id = new_notification_id(&payload.to_email);
        let recipient = format!("{} ({})", payload.to_name, payload.to_email);
        let json = serde_json::to_string(payload)?;
        self.lock()?
            .execute(
                "INSERT INTO notification
                 (notification_id, recipient, title, content, payload, status, is_test, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7)",
                rusqlite::params![
                    notification_id,
                    recipient,
                    title,
                    content,
                    json,
                    payload.is_test as i32,
                    Self::now_text(),
                ],
            )
            .map_err(|e| SkyAlertError::Store(format!("Create notification: {e}")))?;
        Ok(notification_id)
    }

    pub fn pending_notifications(&self) -> Result<Vec<Notification>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, notification_id, recipient, title, content, payload, status, is_test, created_at
                 FROM notification WHERE status = 'pending' ORDER BY created_at DESC, id DESC",
            )
            .map_err(|e| SkyAlertError::Store(format!("Notification select: {e}")))?;
        let rows = stmt
            .query_map([], notification_row)
            .map_err(|e| SkyAlertError::Store(format!("Notification select: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn get_notification(&self, notification_id: &str) -> Result<Option<Notification>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, notification_id, recipient, title, content, payload, status, is_test, created_at
                 FROM notification WHERE notification_id = ?1",
                [notification_id],
                notification_row,
            )
            .ok();
        Ok(row)
    }

    /// Resolve a pending notification exactly once. Re-resolving (or
    /// resolving an unknown id) is an explicit error, never a silent
    /// re-send.
    pub fn resolve_notification(
        &self,
        notification_id: &str,
        status: NotificationStatus,
    ) -> Result<Notification> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| SkyAlertError::Store(format!("Resolve tx: {e}")))?;
        let rows = tx
            .execute(
                "UPDATE notification SET status = ?1
                 WHERE notification_id = ?2 AND status = 'pending'",
                rusqlite::params![status.as_str(), notification_id],
            )
            .map_err(|e| SkyAlertError::Store(format!("Resolve: {e}")))?;
        if rows == 0 {
            return Err(SkyAlertError::NotificationResolved(
                notification_id.to_string(),
            ));
        }
        let notification = tx
            .query_row(
                "SELECT id, notification_id, recipient, title, content, payload, status, is_test, created_at
                 FROM notification WHERE notification_id = ?1",
                [notification_id],
                notification_row,
            )
            .map_err(|e| SkyAlertError::Store(format!("Resolve fetch: {e}")))?;
        tx.commit()
            .map_err(|e| SkyAlertError::Store(format!("Resolve commit: {e}")))?;
        Ok(notification)
    }

    /// Administrative reset: drop every queued task and notification.
    /// Destructive; operator recovery only.
    pub fn clear_queues(&self) -> Result<(usize, usize)> {
        let conn = self.lock()?;
        let tasks = conn
            .execute("DELETE FROM mail_task", [])
            .map_err(|e| SkyAlertError::Store(format!("Clear tasks: {e}")))?;
        let notifications = conn
            .execute("DELETE FROM notification", [])
            .map_err(|e| SkyAlertError::Store(format!("Clear notifications: {e}")))?;
        Ok((tasks, notifications))
    }
}

fn notification_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Notification> {
    Ok(Notification {
        id: row.get(0)?,
        notification_id: row.get(1)?,
        recipient: row.get(2)?,
        title: row.get(3)?,
        content: row.get(4)?,
        payload: row.get(5)?,
        status: NotificationStatus::parse(&row.get::<_, String>(6)?),
        is_test: row.get::<_, i32>(7)? != 0,
        created_at: parse_ts(&row.get::<_, String>(8)?),
    })
}

fn parse_ts(raw: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .unwrap_or_else(|_| Local::now().naive_local())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn scratch_store(name: &str) -> MailStore {
        let dir = std::env::temp_dir().join("skyalert-store-test").join(name);
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).unwrap();
        MailStore::open(&dir.join("queue.db")).unwrap()
    }

    fn payload(email: &str) -> MailPayload {
        MailPayload {
            to_email: email.into(),
            to_name: "张三".into(),
            subject: "北京地区高温天气预警通知".into(),
            content: "预警内容".into(),
            region: "北京".into(),
            weather_type: "高温".into(),
            condition: "最高温度 >= 35".into(),
            category: "客户".into(),
            ..Default::default()
        }
    }

    #[test]
    fn enqueue_claim_complete_round_trip() {
        let store = scratch_store("round-trip");
        let task_id = store.enqueue(&payload("a@x.com")).unwrap();

        let claimed = store.claim(None, None).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].task_id, task_id);
        assert_eq!(claimed[0].status, TaskStatus::Processing);
        assert_eq!(claimed[0].attempts, 1);

        store.complete(&task_id).unwrap();
        let task = store.get_task(&task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Sent);
        assert_eq!(task.attempts, 1);

        // Terminal tasks are invisible to subsequent claims.
        assert!(store.claim(None, None).unwrap().is_empty());
    }

    #[test]
    fn claim_is_exclusive_across_threads() {
        let store = Arc::new(scratch_store("exclusive"));
        store.enqueue(&payload("a@x.com")).unwrap();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.claim(None, None).unwrap().len())
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 1);
    }

    #[test]
    fn claim_orders_oldest_first_and_honors_limit() {
        let store = scratch_store("order");
        let first = store.enqueue(&payload("a@x.com")).unwrap();
        let _second = store.enqueue(&payload("b@x.com")).unwrap();

        let claimed = store.claim(None, Some(1)).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].task_id, first);
        assert_eq!(store.pending_task_count().unwrap(), 1);
    }

    #[test]
    fn claim_filters_on_is_test() {
        let store = scratch_store("is-test");
        let mut test_payload = payload("t@x.com");
        test_payload.is_test = true;
        store.enqueue(&test_payload).unwrap();
        store.enqueue(&payload("real@x.com")).unwrap();

        let claimed = store.claim(Some(false), None).unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(!claimed[0].is_test);
    }

    #[test]
    fn duplicate_task_id_replaces() {
        let store = scratch_store("replace");
        store
            .enqueue_with_task_id("task_fixed", &payload("a@x.com"))
            .unwrap();
        store
            .enqueue_with_task_id("task_fixed", &payload("b@x.com"))
            .unwrap();
        assert_eq!(store.pending_task_count().unwrap(), 1);
        let task = store.get_task("task_fixed").unwrap().unwrap();
        assert!(task.payload.contains("b@x.com"));
    }

    #[test]
    fn fail_records_error_and_stays_terminal() {
        let store = scratch_store("fail");
        let task_id = store.enqueue(&payload("a@x.com")).unwrap();
        store.claim(None, None).unwrap();
        store.fail(&task_id, "SMTP connect timeout").unwrap();

        let task = store.get_task(&task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("SMTP connect timeout"));

        // No automatic edge back to pending; completing a failed task errors.
        assert!(store.complete(&task_id).is_err());

        // Explicit operator reset re-opens it.
        store.reset_to_pending(&task_id).unwrap();
        assert_eq!(store.pending_task_count().unwrap(), 1);
    }

    #[test]
    fn completing_an_unclaimed_task_errors() {
        let store = scratch_store("unclaimed");
        let task_id = store.enqueue(&payload("a@x.com")).unwrap();
        assert!(store.complete(&task_id).is_err());
    }

    #[test]
    fn notification_resolves_exactly_once() {
        let store = scratch_store("notify");
        let nid = store
            .create_notification(&payload("a@x.com"), "天气预警: 高温 - 北京", "是否发送？")
            .unwrap();

        assert_eq!(store.pending_notifications().unwrap().len(), 1);

        let resolved = store
            .resolve_notification(&nid, NotificationStatus::Approved)
            .unwrap();
        assert_eq!(resolved.status, NotificationStatus::Approved);
        assert!(store.pending_notifications().unwrap().is_empty());

        // Second resolution must fail loudly.
        let err = store
            .resolve_notification(&nid, NotificationStatus::Rejected)
            .unwrap_err();
        assert!(matches!(err, SkyAlertError::NotificationResolved(_)));
    }

    #[test]
    fn resolving_unknown_notification_errors() {
        let store = scratch_store("notify-missing");
        let err = store
            .resolve_notification("alert_nope", NotificationStatus::Approved)
            .unwrap_err();
        assert!(matches!(err, SkyAlertError::NotificationResolved(_)));
    }

    #[test]
    fn clear_queues_drops_everything() {
        let store = scratch_store("clear");
        store.enqueue(&payload("a@x.com")).unwrap();
        store
            .create_notification(&payload("b@x.com"), "t", "c")
            .unwrap();
        let (tasks, notifications) = store.clear_queues().unwrap();
        assert_eq!((tasks, notifications), (1, 1));
        assert_eq!(store.pending_task_count().unwrap(), 0);
        assert!(store.pending_notifications().unwrap().is_empty());
    }
}
