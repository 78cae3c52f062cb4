//! Schema migrations
//!
//! Each step runs inside its own transaction together with the row that
//! records it in `schema_migrations`, so a failed step leaves the archive at
//! the previous version.

use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::{debug, info, instrument};

use crate::error::Result;

/// One schema step. Versions start at 1 and have no gaps.
struct Step {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const STEPS: &[Step] = &[
    Step {
        version: 1,
        name: "discussion message log",
        sql: r#"
            -- seq keeps per-room arrival order
            CREATE TABLE IF NOT EXISTS discussion_messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                event_id TEXT NOT NULL,
                author_id TEXT NOT NULL,
                author_name TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                reply_to TEXT,
                is_edited INTEGER NOT NULL DEFAULT 0,
                edited_at TEXT,
                reactions TEXT NOT NULL DEFAULT '[]'
            );
        "#,
    },
    Step {
        version: 2,
        name: "room and author indexes",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_discussion_messages_event
                ON discussion_messages(event_id, seq);
            CREATE INDEX IF NOT EXISTS idx_discussion_messages_author
                ON discussion_messages(author_id);
        "#,
    },
];

/// Highest applied version, 0 for a fresh database
pub fn schema_version(conn: &Connection) -> Result<u32> {
    let version: Option<u32> =
        conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get(0)
        })?;
    Ok(version.unwrap_or(0))
}

/// Bring the schema up to date
#[instrument(skip(conn))]
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
    )?;

    let start = schema_version(conn)?;
    let pending: Vec<&Step> = STEPS.iter().filter(|s| s.version > start).collect();
    if pending.is_empty() {
        debug!(version = start, "Schema up to date");
        return Ok(());
    }

    for step in pending {
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(step.sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![step.version, step.name, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        debug!(version = step.version, name = step.name, "Applied migration");
    }

    info!(from = start, to = schema_version(conn)?, "Archive schema migrated");
    Ok(())
}
