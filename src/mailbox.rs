use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Row, params};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::agent::{AgentRecord, Capability};
use crate::nudge::NudgeError;

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("mail store error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("payload error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message {0} not found")]
    NotFound(i64),
    #[error(transparent)]
    Nudge(#[from] NudgeError),
    #[error("{0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Status,
    Question,
    Result,
    Error,
    #[value(name = "worker_done")]
    WorkerDone,
    #[value(name = "merge_ready")]
    MergeReady,
    Merged,
    Escalation,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Question => "question",
            Self::Result => "result",
            Self::Error => "error",
            Self::WorkerDone => "worker_done",
            Self::MergeReady => "merge_ready",
            Self::Merged => "merged",
            Self::Escalation => "escalation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "status" => Self::Status,
            "question" => Self::Question,
            "result" => Self::Result,
            "error" => Self::Error,
            "worker_done" => Self::WorkerDone,
            "merge_ready" => Self::MergeReady,
            "merged" => Self::Merged,
            "escalation" => Self::Escalation,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "normal" => Self::Normal,
            "high" => Self::High,
            "urgent" => Self::Urgent,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: i64,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub msg_type: MessageType,
    pub priority: Priority,
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    pub in_reply_to: Option<i64>,
}

impl Message {
    pub fn is_unread(&self) -> bool {
        self.read_at.is_none()
    }
}

/// A message as handed to `send`; the store assigns id and created_at.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub msg_type: MessageType,
    pub priority: Priority,
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct MailFilter {
    pub from: Option<String>,
    pub to: Option<String>,
    pub unread_only: bool,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Marked,
    AlreadyRead,
}

fn ts(dt: DateTime<Utc>) -> String {
    // Fixed-width micros keep string comparison chronological.
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(col: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                col,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn bad_column(col: usize, what: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, what.into())
}

const MESSAGE_COLUMNS: &str =
    "id, sender, recipient, subject, body, msg_type, priority, payload, created_at, read_at, in_reply_to";

fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
    let type_s: String = row.get(5)?;
    let msg_type = MessageType::parse(&type_s)
        .ok_or_else(|| bad_column(5, format!("unknown message type: {type_s}")))?;
    let prio_s: String = row.get(6)?;
    let priority = Priority::parse(&prio_s)
        .ok_or_else(|| bad_column(6, format!("unknown priority: {prio_s}")))?;
    let payload: Option<String> = row.get(7)?;
    let payload = match payload {
        Some(raw) => Some(
            serde_json::from_str(&raw).map_err(|e| bad_column(7, format!("bad payload: {e}")))?,
        ),
        None => None,
    };
    let created_s: String = row.get(8)?;
    let read_s: Option<String> = row.get(9)?;
    Ok(Message {
        id: row.get(0)?,
        from: row.get(1)?,
        to: row.get(2)?,
        subject: row.get(3)?,
        body: row.get(4)?,
        msg_type,
        priority,
        payload,
        created_at: parse_ts(8, &created_s)?,
        read_at: match read_s {
            Some(s) => Some(parse_ts(9, &s)?),
            None => None,
        },
        in_reply_to: row.get(10)?,
    })
}

/// The persistent mail store: a single SQLite file in WAL mode, safe for
/// the orchestrator and every worker process to write concurrently. Also
/// mirrors live agent records for durability.
pub struct Mailbox {
    conn: Connection,
}

impl Mailbox {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, MailError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| MailError::Validation(format!("cannot create state dir: {e}")))?;
            }
        }
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    #[cfg(test)]
    pub(crate) fn in_memory() -> Result<Self, MailError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), MailError> {
        // journal_mode returns a row; query it rather than execute it.
        let _mode: String =
            self.conn
                .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        self.conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS messages (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                sender      TEXT NOT NULL,
                recipient   TEXT NOT NULL,
                subject     TEXT NOT NULL,
                body        TEXT NOT NULL,
                msg_type    TEXT NOT NULL,
                priority    TEXT NOT NULL,
                payload     TEXT,
                created_at  TEXT NOT NULL,
                read_at     TEXT,
                in_reply_to INTEGER REFERENCES messages(id),
                CHECK (read_at IS NULL OR read_at >= created_at)
            );

            CREATE INDEX IF NOT EXISTS idx_messages_unread
                ON messages(recipient, read_at);
            CREATE INDEX IF NOT EXISTS idx_messages_recipient
                ON messages(recipient, created_at);
            CREATE INDEX IF NOT EXISTS idx_messages_sender
                ON messages(sender, created_at);

            CREATE TABLE IF NOT EXISTS agents (
                name          TEXT PRIMARY KEY,
                capability    TEXT NOT NULL,
                task_id       TEXT NOT NULL,
                parent        TEXT NOT NULL,
                depth         INTEGER NOT NULL,
                branch        TEXT NOT NULL,
                worktree_path TEXT NOT NULL,
                session_pid   INTEGER,
                created_at    TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Append a message. The store assigns the id and timestamp; it is the
    /// sole source of id uniqueness.
    pub fn send(&self, msg: &NewMessage) -> Result<i64, MailError> {
        let payload = msg
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO messages (sender, recipient, subject, body, msg_type, priority, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                msg.from,
                msg.to,
                msg.subject,
                msg.body,
                msg.msg_type.as_str(),
                msg.priority.as_str(),
                payload,
                ts(Utc::now()),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    /// Filtered listing, newest first.
    pub fn list(&self, filter: &MailFilter) -> Result<Vec<Message>, MailError> {
        let mut sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE 1=1");
        let mut values: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(from) = &filter.from {
            sql.push_str(&format!(" AND sender = ?{}", values.len() + 1));
            values.push(from.clone().into());
        }
        if let Some(to) = &filter.to {
            sql.push_str(&format!(" AND recipient = ?{}", values.len() + 1));
            values.push(to.clone().into());
        }
        if filter.unread_only {
            sql.push_str(" AND read_at IS NULL");
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values.iter()), row_to_message)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get(&self, id: i64) -> Result<Message, MailError> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
        self.conn
            .query_row(&sql, params![id], row_to_message)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => MailError::NotFound(id),
                other => MailError::Sqlite(other),
            })
    }

    /// Mark read. Idempotent: a second call reports `AlreadyRead` and
    /// leaves the original read timestamp alone.
    pub fn mark_read(&self, id: i64) -> Result<MarkOutcome, MailError> {
        let tx = self.conn.unchecked_transaction()?;
        let read_at: Option<String> = tx
            .query_row("SELECT read_at FROM messages WHERE id = ?1", params![id], |r| r.get(0))
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => MailError::NotFound(id),
                other => MailError::Sqlite(other),
            })?;
        if read_at.is_some() {
            return Ok(MarkOutcome::AlreadyRead);
        }
        tx.execute(
            "UPDATE messages SET read_at = ?1 WHERE id = ?2",
            params![ts(Utc::now()), id],
        )?;
        tx.commit()?;
        Ok(MarkOutcome::Marked)
    }

    pub fn mark_unread(&self, id: i64) -> Result<(), MailError> {
        let changed = self
            .conn
            .execute("UPDATE messages SET read_at = NULL WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(MailError::NotFound(id));
        }
        Ok(())
    }

    /// Reply to a message. Recipient: if the replier is the original
    /// sender, back to the original recipient; otherwise to the original
    /// sender. Subject gains a single "Re: " prefix.
    pub fn reply(&self, original_id: i64, from: &str, body: &str) -> Result<i64, MailError> {
        let original = self.get(original_id)?;
        let to = if from == original.from {
            original.to.clone()
        } else {
            original.from.clone()
        };
        let subject = if original.subject.starts_with("Re: ") {
            original.subject.clone()
        } else {
            format!("Re: {}", original.subject)
        };
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO messages (sender, recipient, subject, body, msg_type, priority, created_at, in_reply_to)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                from,
                to,
                subject,
                body,
                MessageType::Status.as_str(),
                Priority::Normal.as_str(),
                ts(Utc::now()),
                original_id,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    /// Unread messages for a recipient, oldest first, in injection order.
    pub fn unread_for(&self, recipient: &str) -> Result<Vec<Message>, MailError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE recipient = ?1 AND read_at IS NULL
             ORDER BY created_at ASC, id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![recipient], row_to_message)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// When the agent last sent anything, for staleness checks.
    pub fn latest_activity(&self, agent: &str) -> Result<Option<DateTime<Utc>>, MailError> {
        let latest: Option<String> = self.conn.query_row(
            "SELECT MAX(created_at) FROM messages WHERE sender = ?1",
            params![agent],
            |row| row.get(0),
        )?;
        match latest {
            Some(s) => Ok(Some(parse_ts(0, &s).map_err(MailError::Sqlite)?)),
            None => Ok(None),
        }
    }

    /// Has this agent ever signalled worker_done?
    pub fn has_reported_done(&self, agent: &str) -> Result<bool, MailError> {
        let exists: i64 = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM messages WHERE sender = ?1 AND msg_type = 'worker_done')",
            params![agent],
            |row| row.get(0),
        )?;
        Ok(exists != 0)
    }

    // ---- durable agent mirror ----

    pub fn upsert_agent(&self, rec: &AgentRecord) -> Result<(), MailError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO agents
                 (name, capability, task_id, parent, depth, branch, worktree_path, session_pid, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                rec.name,
                rec.capability.as_str(),
                rec.task_id,
                rec.parent,
                rec.depth,
                rec.branch,
                rec.worktree_path.to_string_lossy().into_owned(),
                rec.session_pid,
                ts(rec.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn remove_agent(&self, name: &str) -> Result<(), MailError> {
        self.conn
            .execute("DELETE FROM agents WHERE name = ?1", params![name])?;
        Ok(())
    }

    pub fn get_agent(&self, name: &str) -> Result<Option<AgentRecord>, MailError> {
        let result = self.conn.query_row(
            "SELECT name, capability, task_id, parent, depth, branch, worktree_path, session_pid, created_at
             FROM agents WHERE name = ?1",
            params![name],
            row_to_agent,
        );
        match result {
            Ok(rec) => Ok(Some(rec)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(MailError::Sqlite(e)),
        }
    }

    pub fn list_agents(&self) -> Result<Vec<AgentRecord>, MailError> {
        let mut stmt = self.conn.prepare(
            "SELECT name, capability, task_id, parent, depth, branch, worktree_path, session_pid, created_at
             FROM agents ORDER BY name",
        )?;
        let rows = stmt.query_map([], row_to_agent)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    #[cfg(test)]
    pub(crate) fn raw(&self) -> &Connection {
        &self.conn
    }
}

fn row_to_agent(row: &Row) -> rusqlite::Result<AgentRecord> {
    let cap_s: String = row.get(1)?;
    let capability = Capability::parse(&cap_s)
        .ok_or_else(|| bad_column(1, format!("unknown capability: {cap_s}")))?;
    let path: String = row.get(6)?;
    let created_s: String = row.get(8)?;
    Ok(AgentRecord {
        name: row.get(0)?,
        capability,
        task_id: row.get(2)?,
        parent: row.get(3)?,
        depth: row.get(4)?,
        branch: row.get(5)?,
        worktree_path: path.into(),
        session_pid: row.get(7)?,
        created_at: parse_ts(8, &created_s)?,
    })
}
