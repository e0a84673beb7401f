//! SessionRegistry: durable catalog of running and historical loops.
//!
//! A single-file SQLite database at a user-scoped path, safe to open from
//! the supervisor and from short-lived CLI commands at the same time (the
//! engine serializes access). Records are never deleted; `clean` only marks
//! orphans failed.

use std::path::{Path, PathBuf};

use chrono::Local;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::error::{RalphError, RalphResult};

/// Loop status as persisted in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Running,
    Stopped,
    Completed,
    Failed,
    Checkpointed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Checkpointed => "checkpointed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(SessionStatus::Running),
            "stopped" => Some(SessionStatus::Stopped),
            "completed" => Some(SessionStatus::Completed),
            "failed" => Some(SessionStatus::Failed),
            "checkpointed" => Some(SessionStatus::Checkpointed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

/// One loop's registry row.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub task_name: String,
    pub task_dir: PathBuf,
    pub agent: String,
    pub status: SessionStatus,
    pub status_reason: String,
    pub started_at: String,
    pub updated_at: String,
    pub max_iterations: u32,
    pub last_iteration: u32,
    pub pid: i32,
    pub socket_path: PathBuf,
    pub last_port: Option<u16>,
}

impl SessionRecord {
    pub fn new(task_name: &str, task_dir: &Path, agent: &str, max_iterations: u32) -> Self {
        let now = Local::now().to_rfc3339();
        Self {
            task_name: task_name.to_string(),
            task_dir: task_dir.to_path_buf(),
            agent: agent.to_string(),
            status: SessionStatus::Running,
            status_reason: String::new(),
            started_at: now.clone(),
            updated_at: now,
            max_iterations,
            last_iteration: 0,
            pid: std::process::id() as i32,
            socket_path: PathBuf::new(),
            last_port: None,
        }
    }
}

/// Filter for [`SessionRegistry::list`].
#[derive(Debug, Clone, Copy, Default)]
pub enum SessionFilter {
    #[default]
    All,
    Status(SessionStatus),
    /// Rows whose supervisor PID is still alive.
    Alive,
}

const SCHEMA_VERSION: i64 = 2;

/// Forward-only migrations keyed by the version they produce.
const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        "CREATE TABLE IF NOT EXISTS sessions (
            task_name TEXT PRIMARY KEY,
            task_dir TEXT NOT NULL,
            agent TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'running',
            started_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            max_iterations INTEGER NOT NULL DEFAULT 10,
            last_iteration INTEGER NOT NULL DEFAULT 0,
            pid INTEGER NOT NULL,
            socket_path TEXT NOT NULL DEFAULT ''
        );",
    ),
    (
        2,
        "ALTER TABLE sessions ADD COLUMN status_reason TEXT NOT NULL DEFAULT '';
         ALTER TABLE sessions ADD COLUMN last_port INTEGER;",
    ),
];

/// Durable key-value store of loops, keyed by task name.
pub struct SessionRegistry {
    conn: Connection,
}

impl SessionRegistry {
    /// Open (or create) the registry at `path` and run pending migrations.
    pub fn open(path: &Path) -> RalphResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| RalphError::Registry(format!("open {}: {e}", path.display())))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| RalphError::Registry(format!("set WAL: {e}")))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|e| RalphError::Registry(format!("set busy_timeout: {e}")))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
        )
        .map_err(|e| RalphError::Registry(format!("create meta: {e}")))?;

        let registry = Self { conn };
        registry.migrate()?;
        Ok(registry)
    }

    fn schema_version(&self) -> RalphResult<i64> {
        let version: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schemaVersion'",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| RalphError::Registry(format!("read schemaVersion: {e}")))?;
        Ok(version.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    fn migrate(&self) -> RalphResult<()> {
        let mut current = self.schema_version()?;
        for (version, sql) in MIGRATIONS {
            if *version <= current {
                continue;
            }
            debug!(version, "applying registry migration");
            self.conn
                .execute_batch(sql)
                .map_err(|e| RalphError::Registry(format!("migration {version}: {e}")))?;
            self.conn
                .execute(
                    "INSERT INTO meta (key, value) VALUES ('schemaVersion', ?1)
                     ON CONFLICT(key) DO UPDATE SET value = ?1",
                    params![version.to_string()],
                )
                .map_err(|e| RalphError::Registry(format!("record version {version}: {e}")))?;
            current = *version;
        }
        debug_assert_eq!(current.max(SCHEMA_VERSION), SCHEMA_VERSION);
        Ok(())
    }

    /// Create or replace a record; refreshes `updatedAt`.
    ///
    /// Fails with a conflict when a record with the same task name is
    /// `running` and its PID is still alive, unless `force` is set.
    pub fn upsert(&self, record: &SessionRecord, force: bool) -> RalphResult<()> {
        if !force
            && let Some(existing) = self.get(&record.task_name)?
            && existing.status == SessionStatus::Running
            && existing.pid != record.pid
            && pid_alive(existing.pid)
        {
            return Err(RalphError::SessionConflict(
                record.task_name.clone(),
                existing.pid,
            ));
        }

        let now = Local::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT OR REPLACE INTO sessions
                 (task_name, task_dir, agent, status, status_reason, started_at, updated_at,
                  max_iterations, last_iteration, pid, socket_path, last_port)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    record.task_name,
                    record.task_dir.display().to_string(),
                    record.agent,
                    record.status.as_str(),
                    record.status_reason,
                    record.started_at,
                    now,
                    record.max_iterations,
                    record.last_iteration,
                    record.pid,
                    record.socket_path.display().to_string(),
                    record.last_port,
                ],
            )
            .map_err(|e| RalphError::Registry(format!("upsert: {e}")))?;
        Ok(())
    }

    pub fn get(&self, task_name: &str) -> RalphResult<Option<SessionRecord>> {
        self.conn
            .query_row(
                "SELECT task_name, task_dir, agent, status, status_reason, started_at,
                        updated_at, max_iterations, last_iteration, pid, socket_path, last_port
                 FROM sessions WHERE task_name = ?1",
                params![task_name],
                row_to_record,
            )
            .optional()
            .map_err(|e| RalphError::Registry(format!("get: {e}")))
    }

    pub fn list(&self, filter: SessionFilter) -> RalphResult<Vec<SessionRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT task_name, task_dir, agent, status, status_reason, started_at,
                        updated_at, max_iterations, last_iteration, pid, socket_path, last_port
                 FROM sessions ORDER BY started_at DESC",
            )
            .map_err(|e| RalphError::Registry(format!("list: {e}")))?;
        let rows = stmt
            .query_map([], row_to_record)
            .map_err(|e| RalphError::Registry(format!("list: {e}")))?;

        let mut records = Vec::new();
        for row in rows {
            let record = row.map_err(|e| RalphError::Registry(format!("list row: {e}")))?;
            let keep = match filter {
                SessionFilter::All => true,
                SessionFilter::Status(status) => record.status == status,
                SessionFilter::Alive => pid_alive(record.pid),
            };
            if keep {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Transition a record to a terminal status. Idempotent: a record that
    /// is already terminal keeps its first terminal status and reason.
    pub fn mark_terminal(
        &self,
        task_name: &str,
        status: SessionStatus,
        reason: Option<&str>,
    ) -> RalphResult<()> {
        if !status.is_terminal() {
            return Err(RalphError::Registry(format!(
                "mark_terminal with non-terminal status {}",
                status.as_str()
            )));
        }
        let Some(existing) = self.get(task_name)? else {
            return Ok(());
        };
        if existing.status.is_terminal() {
            debug!(task_name, "already terminal, keeping first transition");
            return Ok(());
        }

        let now = Local::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE sessions SET status = ?1, status_reason = ?2, updated_at = ?3
                 WHERE task_name = ?4",
                params![status.as_str(), reason.unwrap_or(""), now, task_name],
            )
            .map_err(|e| RalphError::Registry(format!("mark_terminal: {e}")))?;
        info!(task_name, status = status.as_str(), "session terminal");
        Ok(())
    }

    /// Sweep non-terminal records whose supervisor PID is dead, marking them
    /// failed with reason `"orphaned"`. Returns the affected task names.
    pub fn clean(&self) -> RalphResult<Vec<String>> {
        let mut orphaned = Vec::new();
        for record in self.list(SessionFilter::All)? {
            if !record.status.is_terminal() && !pid_alive(record.pid) {
                warn!(task = %record.task_name, pid = record.pid, "orphaned session");
                self.mark_terminal(&record.task_name, SessionStatus::Failed, Some("orphaned"))?;
                orphaned.push(record.task_name);
            }
        }
        Ok(orphaned)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let status: String = row.get(3)?;
    let task_dir: String = row.get(1)?;
    let socket_path: String = row.get(10)?;
    Ok(SessionRecord {
        task_name: row.get(0)?,
        task_dir: PathBuf::from(task_dir),
        agent: row.get(2)?,
        status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Failed),
        status_reason: row.get(4)?,
        started_at: row.get(5)?,
        updated_at: row.get(6)?,
        max_iterations: row.get(7)?,
        last_iteration: row.get(8)?,
        pid: row.get(9)?,
        socket_path: PathBuf::from(socket_path),
        last_port: row.get(11)?,
    })
}

/// Whether a PID refers to a live process. EPERM still means alive.
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}
