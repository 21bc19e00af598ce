//! SQLite task store shared by the server and every agent process
//!
//! 저장 데이터:
//! - Tasks: 작업 트리 (parent_id 로 연결)
//! - Activity Log: append-only 이벤트 기록 (id 가 변경 커서)
//! - Questions: 사람에게 묻는 질문과 답변
//! - Artifacts: 작업 결과물 메타데이터
//!
//! Every operation opens its own short-lived connection. Agent processes write
//! to the same file concurrently, so SQLite's write lock (WAL journal plus a
//! busy timeout) is the only synchronization.
//!
//! ## Migration System
//!
//! - Version 1: tasks, activity_log, questions
//! - Version 2: tasks.pid column and the artifacts table

use super::types::{
    ActivityEntry, ActivityKind, Artifact, NewArtifact, NewQuestion, NewTask, Question,
    QuestionType, Task, TaskPatch, TaskStats, TaskStatus, TaskView,
};
use crate::strings::{now_timestamp, short_id, truncate_chars};
use crate::{Error, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Current schema version
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// How long a writer waits on a locked database
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Question/answer text kept in the activity message
const ACTIVITY_PREVIEW_CHARS: usize = 100;

const TASK_COLUMNS: &str = "id, parent_id, title, description, status, assigned_agent, phase, \
                            result, pid, auto_accept, source, created_at, updated_at";

const ACTIVITY_COLUMNS: &str = "id, task_id, event_type, agent, message, metadata, created_at";

const QUESTION_COLUMNS: &str = "id, task_id, agent, question, question_type, options, context, \
                                answer, answered_at, auto_accepted, created_at";

const ARTIFACT_COLUMNS: &str =
    "id, task_id, artifact_type, label, file_path, mime_type, metadata, created_at";

fn db_err(action: &str, e: rusqlite::Error) -> Error {
    Error::Storage(format!("Failed to {}: {}", action, e))
}

/// Persistent task tree, activity log, questions and artifacts
#[derive(Debug, Clone)]
pub struct TaskStore {
    path: PathBuf,
}

impl TaskStore {
    /// Open (and create if needed) the store at `path`
    ///
    /// Schema creation and migrations are idempotent, so both the server and
    /// agent processes call this.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("Failed to create data directory: {}", e)))?;
        }

        let conn = Self::connect_at(path)?;
        let path = std::fs::canonicalize(path)
            .map_err(|e| Error::Storage(format!("Failed to resolve database path: {}", e)))?;

        let store = Self { path };
        store.initialize_schema(&conn)?;
        store.run_migrations(&conn)?;

        debug!("Task store ready at {}", store.path.display());
        Ok(store)
    }

    /// Absolute database path (exported to agent processes)
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection> {
        Self::connect_at(&self.path)
    }

    fn connect_at(path: &Path) -> Result<Connection> {
        let conn =
            Connection::open(path).map_err(|e| db_err("open database", e))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| db_err("set busy timeout", e))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )
        .map_err(|e| db_err("set pragmas", e))?;
        Ok(conn)
    }

    /// Get current schema version from database
    pub fn schema_version(&self) -> Result<i32> {
        let conn = self.connect()?;
        Self::read_schema_version(&conn)
    }

    fn read_schema_version(conn: &Connection) -> Result<i32> {
        conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .map_err(|e| db_err("get schema version", e))
    }

    /// Initialize database schema (base tables)
    fn initialize_schema(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- Schema version tracking
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            -- Task tree
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                parent_id TEXT,
                title TEXT NOT NULL,
                description TEXT,
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK(status IN ('pending', 'in_progress', 'completed', 'failed', 'blocked')),
                assigned_agent TEXT,
                phase TEXT,
                result TEXT,
                auto_accept INTEGER NOT NULL DEFAULT 0,
                source TEXT NOT NULL DEFAULT 'cli',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (parent_id) REFERENCES tasks(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

            -- Append-only activity log
            CREATE TABLE IF NOT EXISTS activity_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                agent TEXT,
                message TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_activity_task ON activity_log(task_id);

            -- Human-in-the-loop questions
            CREATE TABLE IF NOT EXISTS questions (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                agent TEXT,
                question TEXT NOT NULL,
                question_type TEXT NOT NULL DEFAULT 'text',
                options TEXT,
                context TEXT,
                answer TEXT,
                answered_at TEXT,
                auto_accepted INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_questions_task ON questions(task_id);
            CREATE INDEX IF NOT EXISTS idx_questions_pending ON questions(answer);

            INSERT OR IGNORE INTO schema_version (version) VALUES (1);
            "#,
        )
        .map_err(|e| db_err("initialize schema", e))?;

        Ok(())
    }

    /// Run all pending migrations
    fn run_migrations(&self, conn: &Connection) -> Result<()> {
        let current_version = Self::read_schema_version(conn)?;

        if current_version >= CURRENT_SCHEMA_VERSION {
            debug!(
                "Database schema is up to date (version {})",
                current_version
            );
            return Ok(());
        }

        info!(
            "Running database migrations from version {} to {}",
            current_version, CURRENT_SCHEMA_VERSION
        );

        for version in (current_version + 1)..=CURRENT_SCHEMA_VERSION {
            match version {
                2 => Self::migrate_v2(conn)?,
                _ => {
                    warn!("Unknown migration version: {}", version);
                }
            }

            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
                params![version],
            )
            .map_err(|e| db_err("record migration", e))?;

            info!("Applied migration to version {}", version);
        }

        Ok(())
    }

    /// Migration to version 2: process pid and artifacts
    fn migrate_v2(conn: &Connection) -> Result<()> {
        // Another process may have added the column first
        let _ = conn.execute("ALTER TABLE tasks ADD COLUMN pid INTEGER", []);

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS artifacts (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                artifact_type TEXT NOT NULL,
                label TEXT NOT NULL,
                file_path TEXT NOT NULL,
                mime_type TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_artifacts_task ON artifacts(task_id);
            "#,
        )
        .map_err(|e| db_err("create artifacts table", e))?;

        Ok(())
    }

    // ========================================================================
    // Task Operations
    // ========================================================================

    /// Create a task and log its `created` activity
    pub fn create_task(&self, new: &NewTask) -> Result<Task> {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction()
            .map_err(|e| db_err("begin transaction", e))?;

        if let Some(ref parent_id) = new.parent_id {
            if load_task(&tx, parent_id)?.is_none() {
                return Err(Error::not_found("Parent task", parent_id));
            }
        }

        let id = short_id();
        let now = now_timestamp();
        let status = new.status.unwrap_or(TaskStatus::Pending);

        tx.execute(
            r#"
            INSERT INTO tasks (id, parent_id, title, description, status, assigned_agent,
                               auto_accept, source, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            "#,
            params![
                id,
                new.parent_id,
                new.title,
                new.description,
                status,
                new.assigned_agent,
                new.auto_accept,
                new.source,
                now,
            ],
        )
        .map_err(|e| db_err("create task", e))?;

        insert_activity(
            &tx,
            &id,
            ActivityKind::Created,
            &format!("Task created: {}", new.title),
            new.assigned_agent.as_deref(),
            None,
        )?;

        let task = load_task(&tx, &id)?.ok_or_else(|| Error::not_found("Task", &id))?;
        tx.commit().map_err(|e| db_err("commit task", e))?;

        debug!("Created task {} ({})", task.id, task.title);
        Ok(task)
    }

    /// Get a task row without derived fields
    pub fn find_task(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.connect()?;
        load_task(&conn, id)
    }

    /// Get a task with its direct children and pending question count
    pub fn get_task(&self, id: &str) -> Result<Option<TaskView>> {
        let conn = self.connect()?;
        match load_task(&conn, id)? {
            Some(task) => Ok(Some(build_view(&conn, task)?)),
            None => Ok(None),
        }
    }

    /// Apply a partial update
    ///
    /// Logs `status_change` / `phase_change` when those values actually change.
    /// Returns `None` if the task does not exist.
    pub fn update_task(&self, id: &str, patch: &TaskPatch) -> Result<Option<Task>> {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction()
            .map_err(|e| db_err("begin transaction", e))?;

        let Some(current) = load_task(&tx, id)? else {
            return Ok(None);
        };
        if patch.is_empty() {
            return Ok(Some(current));
        }

        let mut sets: Vec<String> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();
        let mut set = |column: &str, value: SqlValue| {
            values.push(value);
            sets.push(format!("{} = ?{}", column, values.len()));
        };

        if let Some(ref title) = patch.title {
            set("title", SqlValue::Text(title.clone()));
        }
        if let Some(ref description) = patch.description {
            set("description", SqlValue::Text(description.clone()));
        }
        if let Some(status) = patch.status {
            set("status", SqlValue::Text(status.as_str().to_string()));
        }
        if let Some(ref agent) = patch.assigned_agent {
            set("assigned_agent", SqlValue::Text(agent.clone()));
        }
        if let Some(ref phase) = patch.phase {
            set("phase", SqlValue::Text(phase.clone()));
        }
        if let Some(ref result) = patch.result {
            set("result", SqlValue::Text(result.clone()));
        }
        if let Some(pid) = patch.pid {
            set(
                "pid",
                pid.map(|p| SqlValue::Integer(i64::from(p)))
                    .unwrap_or(SqlValue::Null),
            );
        }
        set("updated_at", SqlValue::Text(now_timestamp()));

        values.push(SqlValue::Text(id.to_string()));
        let sql = format!(
            "UPDATE tasks SET {} WHERE id = ?{}",
            sets.join(", "),
            values.len()
        );
        tx.execute(&sql, params_from_iter(values.iter()))
            .map_err(|e| db_err("update task", e))?;

        if let Some(status) = patch.status.filter(|s| *s != current.status) {
            insert_activity(
                &tx,
                id,
                ActivityKind::StatusChange,
                &format!("Status changed to {}", status),
                None,
                None,
            )?;
        }
        if let Some(phase) = patch
            .phase
            .as_deref()
            .filter(|p| current.phase.as_deref() != Some(*p))
        {
            insert_activity(
                &tx,
                id,
                ActivityKind::PhaseChange,
                &format!("Phase changed to {}", phase),
                None,
                None,
            )?;
        }

        let updated = load_task(&tx, id)?;
        tx.commit().map_err(|e| db_err("commit task update", e))?;
        Ok(updated)
    }

    /// Delete a task; children, activity, questions and artifacts cascade
    pub fn delete_task(&self, id: &str) -> Result<bool> {
        let conn = self.connect()?;
        let changed = conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])
            .map_err(|e| db_err("delete task", e))?;
        Ok(changed > 0)
    }

    /// Root tasks, newest first, each with its direct children
    pub fn root_tasks(&self) -> Result<Vec<TaskView>> {
        let conn = self.connect()?;
        let sql = format!(
            "SELECT {} FROM tasks WHERE parent_id IS NULL ORDER BY created_at DESC, rowid DESC",
            TASK_COLUMNS
        );
        let roots = query_tasks(&conn, &sql, params![])?;
        roots
            .into_iter()
            .map(|task| build_view(&conn, task))
            .collect()
    }

    /// Direct children, oldest first
    pub fn children(&self, id: &str) -> Result<Vec<Task>> {
        let conn = self.connect()?;
        load_children(&conn, id)
    }

    /// Persisted pid, if any
    pub fn task_pid(&self, id: &str) -> Result<Option<u32>> {
        let conn = self.connect()?;
        let pid: Option<Option<u32>> = conn
            .query_row("SELECT pid FROM tasks WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| db_err("get task pid", e))?;
        Ok(pid.flatten())
    }

    /// Active tasks (in_progress or blocked) that still record a pid
    pub fn orphaned_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.connect()?;
        let sql = format!(
            "SELECT {} FROM tasks WHERE status IN ('in_progress', 'blocked') AND pid IS NOT NULL \
             ORDER BY created_at, rowid",
            TASK_COLUMNS
        );
        query_tasks(&conn, &sql, params![])
    }

    // ========================================================================
    // Activity Operations
    // ========================================================================

    /// Append an activity entry, returning its id
    pub fn log_activity(
        &self,
        task_id: &str,
        kind: ActivityKind,
        message: &str,
        agent: Option<&str>,
    ) -> Result<i64> {
        let conn = self.connect()?;
        insert_activity(&conn, task_id, kind, message, agent, None)
    }

    /// Append an activity entry with a metadata object
    pub fn log_activity_with_metadata(
        &self,
        task_id: &str,
        kind: ActivityKind,
        message: &str,
        agent: Option<&str>,
        metadata: &serde_json::Value,
    ) -> Result<i64> {
        let conn = self.connect()?;
        insert_activity(&conn, task_id, kind, message, agent, Some(metadata))
    }

    /// Newest-first activity, optionally scoped to a task (and its children)
    pub fn activity(
        &self,
        task_id: Option<&str>,
        limit: usize,
        include_children: bool,
    ) -> Result<Vec<ActivityEntry>> {
        let conn = self.connect()?;
        let limit = limit as i64;

        match task_id {
            Some(task_id) => {
                let scope = if include_children {
                    "task_id = ?1 OR task_id IN (SELECT id FROM tasks WHERE parent_id = ?1)"
                } else {
                    "task_id = ?1"
                };
                let sql = format!(
                    "SELECT {} FROM activity_log WHERE {} ORDER BY id DESC LIMIT ?2",
                    ACTIVITY_COLUMNS, scope
                );
                query_activity(&conn, &sql, params![task_id, limit])
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM activity_log ORDER BY id DESC LIMIT ?1",
                    ACTIVITY_COLUMNS
                );
                query_activity(&conn, &sql, params![limit])
            }
        }
    }

    /// Entries with id strictly greater than `after_id`, ascending
    pub fn activity_since(&self, after_id: i64, limit: Option<usize>) -> Result<Vec<ActivityEntry>> {
        let conn = self.connect()?;
        // LIMIT -1 means unbounded in SQLite
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let sql = format!(
            "SELECT {} FROM activity_log WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
            ACTIVITY_COLUMNS
        );
        query_activity(&conn, &sql, params![after_id, limit])
    }

    /// Highest activity id, 0 when empty
    pub fn latest_activity_id(&self) -> Result<i64> {
        let conn = self.connect()?;
        conn.query_row("SELECT COALESCE(MAX(id), 0) FROM activity_log", [], |row| {
            row.get(0)
        })
        .map_err(|e| db_err("get latest activity id", e))
    }

    // ========================================================================
    // Question Operations
    // ========================================================================

    /// Store an unanswered question and log it
    pub fn create_question(&self, new: &NewQuestion) -> Result<Question> {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction()
            .map_err(|e| db_err("begin transaction", e))?;

        if load_task(&tx, &new.task_id)?.is_none() {
            return Err(Error::not_found("Task", &new.task_id));
        }

        let id = short_id();
        let options = match new.options {
            Some(ref options) if !options.is_empty() => Some(serde_json::to_string(options)?),
            _ => None,
        };

        tx.execute(
            r#"
            INSERT INTO questions (id, task_id, agent, question, question_type, options,
                                   context, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                id,
                new.task_id,
                new.agent,
                new.question,
                new.question_type,
                options,
                new.context,
                now_timestamp(),
            ],
        )
        .map_err(|e| db_err("create question", e))?;

        insert_activity(
            &tx,
            &new.task_id,
            ActivityKind::Question,
            &format!(
                "Question asked: {}",
                truncate_chars(&new.question, ACTIVITY_PREVIEW_CHARS)
            ),
            new.agent.as_deref(),
            None,
        )?;

        let question = load_question(&tx, &id)?.ok_or_else(|| Error::not_found("Question", &id))?;
        tx.commit().map_err(|e| db_err("commit question", e))?;
        Ok(question)
    }

    /// Record an answer if the question is still pending
    ///
    /// Returns `false` when the question does not exist or was already
    /// answered; the existing answer is never overwritten.
    pub fn answer_question(
        &self,
        question_id: &str,
        answer: &str,
        auto_accepted: bool,
    ) -> Result<bool> {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction()
            .map_err(|e| db_err("begin transaction", e))?;

        let changed = tx
            .execute(
                r#"
                UPDATE questions SET answer = ?1, answered_at = ?2, auto_accepted = ?3
                WHERE id = ?4 AND answer IS NULL
                "#,
                params![answer, now_timestamp(), auto_accepted, question_id],
            )
            .map_err(|e| db_err("answer question", e))?;

        if changed == 0 {
            return Ok(false);
        }

        let task_id: String = tx
            .query_row(
                "SELECT task_id FROM questions WHERE id = ?1",
                params![question_id],
                |row| row.get(0),
            )
            .map_err(|e| db_err("load answered question", e))?;

        insert_activity(
            &tx,
            &task_id,
            ActivityKind::Answer,
            &format!("Answer: {}", truncate_chars(answer, ACTIVITY_PREVIEW_CHARS)),
            None,
            None,
        )?;

        tx.commit().map_err(|e| db_err("commit answer", e))?;
        Ok(true)
    }

    pub fn get_question(&self, question_id: &str) -> Result<Option<Question>> {
        let conn = self.connect()?;
        load_question(&conn, question_id)
    }

    /// Questions for a task, oldest first
    pub fn questions(
        &self,
        task_id: &str,
        pending_only: bool,
        include_children: bool,
    ) -> Result<Vec<Question>> {
        let conn = self.connect()?;
        let scope = if include_children {
            "(task_id = ?1 OR task_id IN (SELECT id FROM tasks WHERE parent_id = ?1))"
        } else {
            "task_id = ?1"
        };
        let pending = if pending_only { " AND answer IS NULL" } else { "" };
        let sql = format!(
            "SELECT {} FROM questions WHERE {}{} ORDER BY created_at, rowid",
            QUESTION_COLUMNS, scope, pending
        );
        query_questions(&conn, &sql, params![task_id])
    }

    /// Every unanswered question across all tasks, oldest first
    pub fn pending_questions(&self) -> Result<Vec<Question>> {
        let conn = self.connect()?;
        let sql = format!(
            "SELECT {} FROM questions WHERE answer IS NULL ORDER BY created_at, rowid",
            QUESTION_COLUMNS
        );
        query_questions(&conn, &sql, params![])
    }

    /// Unanswered questions on one task
    pub fn pending_question_count(&self, task_id: &str) -> Result<u32> {
        let conn = self.connect()?;
        count_pending(&conn, task_id)
    }

    /// blocked -> in_progress, only if no question on the task is pending
    ///
    /// Single conditional UPDATE so a concurrent cancel (failed) or a new
    /// question is never overridden. Returns `true` if the task was resumed.
    pub fn resume_if_unblocked(&self, task_id: &str) -> Result<bool> {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction()
            .map_err(|e| db_err("begin transaction", e))?;

        let changed = tx
            .execute(
                r#"
                UPDATE tasks SET status = 'in_progress', updated_at = ?1
                WHERE id = ?2 AND status = 'blocked'
                  AND NOT EXISTS (
                      SELECT 1 FROM questions WHERE task_id = ?2 AND answer IS NULL
                  )
                "#,
                params![now_timestamp(), task_id],
            )
            .map_err(|e| db_err("resume task", e))?;

        if changed > 0 {
            insert_activity(
                &tx,
                task_id,
                ActivityKind::StatusChange,
                &format!("Status changed to {}", TaskStatus::InProgress),
                None,
                None,
            )?;
        }

        tx.commit().map_err(|e| db_err("commit resume", e))?;
        Ok(changed > 0)
    }

    // ========================================================================
    // Artifact Operations
    // ========================================================================

    /// Register an artifact and log it
    pub fn create_artifact(&self, new: &NewArtifact) -> Result<Artifact> {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction()
            .map_err(|e| db_err("begin transaction", e))?;

        if load_task(&tx, &new.task_id)?.is_none() {
            return Err(Error::not_found("Task", &new.task_id));
        }

        let metadata = new
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?
            .unwrap_or_else(|| "{}".to_string());

        tx.execute(
            r#"
            INSERT INTO artifacts (id, task_id, artifact_type, label, file_path, mime_type,
                                   metadata, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                new.id,
                new.task_id,
                new.artifact_type,
                new.label,
                new.file_path,
                new.mime_type,
                metadata,
                now_timestamp(),
            ],
        )
        .map_err(|e| db_err("create artifact", e))?;

        insert_activity(
            &tx,
            &new.task_id,
            ActivityKind::Artifact,
            &format!("Artifact added: {}", new.label),
            None,
            Some(&serde_json::json!({ "artifact_id": new.id })),
        )?;

        let artifact =
            load_artifact(&tx, &new.id)?.ok_or_else(|| Error::not_found("Artifact", &new.id))?;
        tx.commit().map_err(|e| db_err("commit artifact", e))?;
        Ok(artifact)
    }

    pub fn get_artifact(&self, id: &str) -> Result<Option<Artifact>> {
        let conn = self.connect()?;
        load_artifact(&conn, id)
    }

    /// Artifacts for a task (and optionally its children), oldest first
    pub fn artifacts(&self, task_id: &str, include_children: bool) -> Result<Vec<Artifact>> {
        let conn = self.connect()?;
        let scope = if include_children {
            "task_id = ?1 OR task_id IN (SELECT id FROM tasks WHERE parent_id = ?1)"
        } else {
            "task_id = ?1"
        };
        let sql = format!(
            "SELECT {} FROM artifacts WHERE {} ORDER BY created_at, rowid",
            ARTIFACT_COLUMNS, scope
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| db_err("prepare query", e))?;
        let artifacts = stmt
            .query_map(params![task_id], artifact_from_row)
            .map_err(|e| db_err("query artifacts", e))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(artifacts)
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> Result<TaskStats> {
        let conn = self.connect()?;
        let mut stats = TaskStats::default();

        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")
            .map_err(|e| db_err("prepare query", e))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, TaskStatus>(0)?, row.get::<_, u32>(1)?)))
            .map_err(|e| db_err("query stats", e))?;
        for (status, count) in rows.filter_map(|r| r.ok()) {
            stats.add(status, count);
        }

        stats.pending_questions = conn
            .query_row(
                "SELECT COUNT(*) FROM questions WHERE answer IS NULL",
                [],
                |row| row.get(0),
            )
            .map_err(|e| db_err("count pending questions", e))?;

        Ok(stats)
    }
}

// ============================================================================
// Row helpers
// ============================================================================

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        status: row.get(4)?,
        assigned_agent: row.get(5)?,
        phase: row.get(6)?,
        result: row.get(7)?,
        pid: row.get(8)?,
        auto_accept: row.get(9)?,
        source: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn activity_from_row(row: &Row<'_>) -> rusqlite::Result<ActivityEntry> {
    let metadata: Option<String> = row.get(5)?;
    Ok(ActivityEntry {
        id: row.get(0)?,
        task_id: row.get(1)?,
        event_type: row.get(2)?,
        agent: row.get(3)?,
        message: row.get(4)?,
        metadata: metadata
            .and_then(|m| serde_json::from_str(&m).ok())
            .unwrap_or_else(|| serde_json::json!({})),
        created_at: row.get(6)?,
    })
}

fn question_from_row(row: &Row<'_>) -> rusqlite::Result<Question> {
    let options: Option<String> = row.get(5)?;
    let question_type: QuestionType = row.get(4)?;
    Ok(Question {
        id: row.get(0)?,
        task_id: row.get(1)?,
        agent: row.get(2)?,
        question: row.get(3)?,
        question_type,
        options: options.and_then(|o| serde_json::from_str(&o).ok()),
        context: row.get(6)?,
        answer: row.get(7)?,
        answered_at: row.get(8)?,
        auto_accepted: row.get(9)?,
        created_at: row.get(10)?,
    })
}

fn artifact_from_row(row: &Row<'_>) -> rusqlite::Result<Artifact> {
    let metadata: Option<String> = row.get(6)?;
    Ok(Artifact {
        id: row.get(0)?,
        task_id: row.get(1)?,
        artifact_type: row.get(2)?,
        label: row.get(3)?,
        file_path: row.get(4)?,
        mime_type: row.get(5)?,
        metadata: metadata
            .and_then(|m| serde_json::from_str(&m).ok())
            .unwrap_or_else(|| serde_json::json!({})),
        created_at: row.get(7)?,
    })
}

fn load_task(conn: &Connection, id: &str) -> Result<Option<Task>> {
    let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
    conn.query_row(&sql, params![id], task_from_row)
        .optional()
        .map_err(|e| db_err("get task", e))
}

fn load_children(conn: &Connection, id: &str) -> Result<Vec<Task>> {
    let sql = format!(
        "SELECT {} FROM tasks WHERE parent_id = ?1 ORDER BY created_at, rowid",
        TASK_COLUMNS
    );
    query_tasks(conn, &sql, params![id])
}

fn load_question(conn: &Connection, id: &str) -> Result<Option<Question>> {
    let sql = format!("SELECT {} FROM questions WHERE id = ?1", QUESTION_COLUMNS);
    conn.query_row(&sql, params![id], question_from_row)
        .optional()
        .map_err(|e| db_err("get question", e))
}

fn load_artifact(conn: &Connection, id: &str) -> Result<Option<Artifact>> {
    let sql = format!("SELECT {} FROM artifacts WHERE id = ?1", ARTIFACT_COLUMNS);
    conn.query_row(&sql, params![id], artifact_from_row)
        .optional()
        .map_err(|e| db_err("get artifact", e))
}

fn count_pending(conn: &Connection, task_id: &str) -> Result<u32> {
    conn.query_row(
        "SELECT COUNT(*) FROM questions WHERE task_id = ?1 AND answer IS NULL",
        params![task_id],
        |row| row.get(0),
    )
    .map_err(|e| db_err("count pending questions", e))
}

fn build_view(conn: &Connection, task: Task) -> Result<TaskView> {
    let children = load_children(conn, &task.id)?;
    let pending_questions = count_pending(conn, &task.id)?;
    Ok(TaskView {
        task,
        children,
        pending_questions,
    })
}

fn query_tasks(conn: &Connection, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(sql).map_err(|e| db_err("prepare query", e))?;
    let tasks = stmt
        .query_map(params, task_from_row)
        .map_err(|e| db_err("query tasks", e))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(tasks)
}

fn query_activity(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<ActivityEntry>> {
    let mut stmt = conn.prepare(sql).map_err(|e| db_err("prepare query", e))?;
    let entries = stmt
        .query_map(params, activity_from_row)
        .map_err(|e| db_err("query activity", e))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(entries)
}

fn query_questions(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<Question>> {
    let mut stmt = conn.prepare(sql).map_err(|e| db_err("prepare query", e))?;
    let questions = stmt
        .query_map(params, question_from_row)
        .map_err(|e| db_err("query questions", e))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(questions)
}

fn insert_activity(
    conn: &Connection,
    task_id: &str,
    kind: ActivityKind,
    message: &str,
    agent: Option<&str>,
    metadata: Option<&serde_json::Value>,
) -> Result<i64> {
    let metadata = metadata
        .map(serde_json::to_string)
        .transpose()?
        .unwrap_or_else(|| "{}".to_string());

    conn.execute(
        r#"
        INSERT INTO activity_log (task_id, event_type, agent, message, metadata, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        params![task_id, kind, agent, message, metadata, now_timestamp()],
    )
    .map_err(|e| db_err("log activity", e))?;

    Ok(conn.last_insert_rowid())
}
