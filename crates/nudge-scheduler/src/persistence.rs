//! SQLite-backed persistence for events, periodic definitions and their occurrences.
//! Survives restarts; every multi-row change is one transaction.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nudge_core::error::{NudgeError, Result};
use nudge_core::traits::{EventStore, Repository};
use nudge_core::types::{
    DueOccurrence, NotificationParams, OneShotItem, PendingOccurrence, RecurringDefinition, UserId,
};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use uuid::Uuid;

/// SQLite store implementing both the engine queries and the CRUD writes.
pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

const EVENT_COLUMNS: &str =
    "id, user_id, text, description, send_at, params, notified, done";
const PERIODIC_COLUMNS: &str = "id, user_id, text, description, day_offset_secs, \
     smallest_period_secs, biggest_period_secs, params";

impl SqliteRepository {
    /// Open or create the database file.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        Self::with_connection(conn)
    }

    /// Private database that disappears with the handle.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.migrate()?;
        Ok(repo)
    }

    /// Create tables and indexes.
    fn migrate(&self) -> Result<()> {
        self.lock()?
            .execute_batch(
                "
            PRAGMA foreign_keys = ON;

            -- One-shot reminders
            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                text TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                send_at INTEGER NOT NULL,        -- unix millis
                params TEXT,                     -- JSON NotificationParams override
                notified INTEGER NOT NULL DEFAULT 0,
                done INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_due ON events (notified, done, send_at);
            CREATE INDEX IF NOT EXISTS idx_events_user ON events (user_id);

            -- Periodic definitions
            CREATE TABLE IF NOT EXISTS periodic_events (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                text TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                day_offset_secs INTEGER NOT NULL,
                smallest_period_secs INTEGER NOT NULL,
                biggest_period_secs INTEGER NOT NULL,
                params TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_periodic_user ON periodic_events (user_id);

            -- The single outstanding occurrence of each definition;
            -- dispatched rows are deleted in the dispatching transaction
            CREATE TABLE IF NOT EXISTS pending_occurrences (
                id TEXT PRIMARY KEY,
                periodic_event_id TEXT NOT NULL UNIQUE
                    REFERENCES periodic_events (id) ON DELETE CASCADE,
                send_at INTEGER NOT NULL,
                dispatched INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_occurrence_due
                ON pending_occurrences (dispatched, send_at);

            -- Per-user default notification params
            CREATE TABLE IF NOT EXISTS user_settings (
                user_id INTEGER PRIMARY KEY,
                params TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
         ",
            )
            .map_err(|e| NudgeError::Storage(format!("Migration: {e}")))?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| NudgeError::Storage(e.to_string()))
    }

    /// Drop a definition's occurrence without regenerating it.
    #[cfg(test)]
    pub(crate) fn discard_occurrence(&self, definition_id: Uuid) -> Result<()> {
        self.lock()?
            .execute(
                "DELETE FROM pending_occurrences WHERE periodic_event_id = ?1",
                params![definition_id.to_string()],
            )
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn nearest_one_shot_time_skipping(
        &self,
        skip: &[Uuid],
    ) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock()?;
        nearest_send_at(
            &conn,
            "SELECT MIN(send_at) FROM events WHERE notified = 0 AND done = 0",
            skip,
        )
    }

    async fn nearest_occurrence_time_skipping(
        &self,
        skip: &[Uuid],
    ) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock()?;
        nearest_send_at(
            &conn,
            "SELECT MIN(send_at) FROM pending_occurrences WHERE dispatched = 0",
            skip,
        )
    }

    async fn due_one_shot_items(&self, till: DateTime<Utc>) -> Result<Vec<OneShotItem>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM events
                 WHERE notified = 0 AND done = 0 AND send_at <= ?1
                 ORDER BY send_at"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![till.timestamp_millis()], event_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    async fn due_occurrences(&self, till: DateTime<Utc>) -> Result<Vec<DueOccurrence>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT p.id, p.user_id, p.text, p.description, p.day_offset_secs,
                        p.smallest_period_secs, p.biggest_period_secs, p.params,
                        o.id, o.send_at, o.dispatched
                 FROM pending_occurrences o
                 JOIN periodic_events p ON p.id = o.periodic_event_id
                 WHERE o.dispatched = 0 AND o.send_at <= ?1
                 ORDER BY o.send_at",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![till.timestamp_millis()], |row| {
                let definition = definition_from_row(row)?;
                let occurrence = PendingOccurrence {
                    id: uuid_at(row, 8)?,
                    definition_id: definition.id,
                    send_time: time_at(row, 9)?,
                    dispatched: row.get(10)?,
                };
                Ok(DueOccurrence {
                    occurrence,
                    definition,
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    async fn mark_one_shot_notified(&self, ids: &[Uuid]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        {
            let mut stmt = tx
                .prepare("UPDATE events SET notified = 1 WHERE id = ?1")
                .map_err(db_err)?;
            for id in ids {
                stmt.execute(params![id.to_string()]).map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)
    }

    async fn mark_occurrence_dispatched_and_regenerate(
        &self,
        occurrence_id: Uuid,
        next: PendingOccurrence,
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let marked = tx
            .execute(
                "UPDATE pending_occurrences SET dispatched = 1
                 WHERE id = ?1 AND dispatched = 0 AND periodic_event_id = ?2",
                params![occurrence_id.to_string(), next.definition_id.to_string()],
            )
            .map_err(db_err)?;
        if marked == 0 {
            // Dropping the transaction rolls it back.
            return Err(NudgeError::NotFound(format!(
                "outstanding occurrence {occurrence_id}"
            )));
        }
        tx.execute(
            "DELETE FROM pending_occurrences WHERE id = ?1",
            params![occurrence_id.to_string()],
        )
        .map_err(db_err)?;
        insert_occurrence(&tx, &next)?;
        tx.commit().map_err(db_err)
    }

    async fn default_notification_params(&self, user_id: UserId) -> Result<NotificationParams> {
        let conn = self.lock()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT params FROM user_settings WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        let json = json.ok_or_else(|| {
            NudgeError::NotFound(format!("default notification params for user {user_id}"))
        })?;
        serde_json::from_str(&json)
            .map_err(|e| NudgeError::Storage(format!("Corrupt params for user {user_id}: {e}")))
    }
}

#[async_trait]
impl EventStore for SqliteRepository {
    async fn create_one_shot(&self, item: &OneShotItem) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO events
             (id, user_id, text, description, send_at, params, notified, done, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                item.id.to_string(),
                item.user_id,
                item.text,
                item.description,
                item.send_time.timestamp_millis(),
                params_to_json(item.params.as_ref())?,
                item.notified,
                item.done,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_one_shot(&self, id: Uuid) -> Result<OneShotItem> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
            params![id.to_string()],
            event_from_row,
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| NudgeError::NotFound(format!("event {id}")))
    }

    async fn update_one_shot(&self, item: &OneShotItem) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE events SET user_id = ?2, text = ?3, description = ?4, send_at = ?5,
                        params = ?6, notified = ?7, done = ?8
                 WHERE id = ?1",
                params![
                    item.id.to_string(),
                    item.user_id,
                    item.text,
                    item.description,
                    item.send_time.timestamp_millis(),
                    params_to_json(item.params.as_ref())?,
                    item.notified,
                    item.done,
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(NudgeError::NotFound(format!("event {}", item.id)));
        }
        Ok(())
    }

    async fn delete_one_shot(&self, id: Uuid) -> Result<()> {
        let conn = self.lock()?;
        let deleted = conn
            .execute("DELETE FROM events WHERE id = ?1", params![id.to_string()])
            .map_err(db_err)?;
        if deleted == 0 {
            return Err(NudgeError::NotFound(format!("event {id}")));
        }
        Ok(())
    }

    async fn list_one_shots(&self, user_id: UserId) -> Result<Vec<OneShotItem>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM events WHERE user_id = ?1 ORDER BY send_at"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![user_id], event_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    async fn create_definition(
        &self,
        definition: &RecurringDefinition,
        first: &PendingOccurrence,
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            "INSERT INTO periodic_events
             (id, user_id, text, description, day_offset_secs, smallest_period_secs,
              biggest_period_secs, params, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                definition.id.to_string(),
                definition.user_id,
                definition.text,
                definition.description,
                secs(definition.day_offset),
                secs(definition.smallest_period),
                secs(definition.biggest_period),
                params_to_json(definition.params.as_ref())?,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        insert_occurrence(&tx, first)?;
        tx.commit().map_err(db_err)
    }

    async fn get_definition(&self, id: Uuid) -> Result<RecurringDefinition> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {PERIODIC_COLUMNS} FROM periodic_events WHERE id = ?1"),
            params![id.to_string()],
            definition_from_row,
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| NudgeError::NotFound(format!("periodic event {id}")))
    }

    async fn update_definition(
        &self,
        definition: &RecurringDefinition,
        replacement: Option<&PendingOccurrence>,
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let changed = tx
            .execute(
                "UPDATE periodic_events SET user_id = ?2, text = ?3, description = ?4,
                        day_offset_secs = ?5, smallest_period_secs = ?6,
                        biggest_period_secs = ?7, params = ?8
                 WHERE id = ?1",
                params![
                    definition.id.to_string(),
                    definition.user_id,
                    definition.text,
                    definition.description,
                    secs(definition.day_offset),
                    secs(definition.smallest_period),
                    secs(definition.biggest_period),
                    params_to_json(definition.params.as_ref())?,
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(NudgeError::NotFound(format!(
                "periodic event {}",
                definition.id
            )));
        }
        if let Some(next) = replacement {
            tx.execute(
                "DELETE FROM pending_occurrences WHERE periodic_event_id = ?1",
                params![definition.id.to_string()],
            )
            .map_err(db_err)?;
            insert_occurrence(&tx, next)?;
        }
        tx.commit().map_err(db_err)
    }

    async fn delete_definition(&self, id: Uuid) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            "DELETE FROM pending_occurrences WHERE periodic_event_id = ?1",
            params![id.to_string()],
        )
        .map_err(db_err)?;
        let deleted = tx
            .execute(
                "DELETE FROM periodic_events WHERE id = ?1",
                params![id.to_string()],
            )
            .map_err(db_err)?;
        if deleted == 0 {
            return Err(NudgeError::NotFound(format!("periodic event {id}")));
        }
        tx.commit().map_err(db_err)
    }

    async fn list_definitions(&self, user_id: UserId) -> Result<Vec<RecurringDefinition>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {PERIODIC_COLUMNS} FROM periodic_events
                 WHERE user_id = ?1 ORDER BY created_at"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![user_id], definition_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    async fn pending_occurrence(&self, definition_id: Uuid) -> Result<PendingOccurrence> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, periodic_event_id, send_at, dispatched FROM pending_occurrences
             WHERE periodic_event_id = ?1 AND dispatched = 0",
            params![definition_id.to_string()],
            |row| {
                Ok(PendingOccurrence {
                    id: uuid_at(row, 0)?,
                    definition_id: uuid_at(row, 1)?,
                    send_time: time_at(row, 2)?,
                    dispatched: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| NudgeError::NotFound(format!("occurrence of {definition_id}")))
    }

    async fn set_default_notification_params(
        &self,
        user_id: UserId,
        params: &NotificationParams,
    ) -> Result<()> {
        let json = serde_json::to_string(params)
            .map_err(|e| NudgeError::Storage(format!("Serialize params: {e}")))?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO user_settings (user_id, params, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (user_id) DO UPDATE SET params = excluded.params,
                                                 updated_at = excluded.updated_at",
            params![user_id, json, Utc::now().to_rfc3339()],
        )
        .map_err(db_err)?;
        Ok(())
    }
}

fn insert_occurrence(conn: &Connection, occurrence: &PendingOccurrence) -> Result<()> {
    conn.execute(
        "INSERT INTO pending_occurrences (id, periodic_event_id, send_at, dispatched)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            occurrence.id.to_string(),
            occurrence.definition_id.to_string(),
            occurrence.send_time.timestamp_millis(),
            occurrence.dispatched,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<OneShotItem> {
    Ok(OneShotItem {
        id: uuid_at(row, 0)?,
        user_id: row.get(1)?,
        text: row.get(2)?,
        description: row.get(3)?,
        send_time: time_at(row, 4)?,
        params: params_at(row, 5)?,
        notified: row.get(6)?,
        done: row.get(7)?,
    })
}

/// Expects the `PERIODIC_COLUMNS` layout in columns 0..=7.
fn definition_from_row(row: &Row<'_>) -> rusqlite::Result<RecurringDefinition> {
    Ok(RecurringDefinition {
        id: uuid_at(row, 0)?,
        user_id: row.get(1)?,
        text: row.get(2)?,
        description: row.get(3)?,
        day_offset: duration_at(row, 4)?,
        smallest_period: duration_at(row, 5)?,
        biggest_period: duration_at(row, 6)?,
        params: params_at(row, 7)?,
    })
}

fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(millis).ok_or(rusqlite::Error::IntegralValueOutOfRange(
        idx, millis,
    ))
}

fn duration_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Duration> {
    let secs: i64 = row.get(idx)?;
    u64::try_from(secs)
        .map(Duration::from_secs)
        .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, secs))
}

fn params_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<NotificationParams>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|json| {
        serde_json::from_str(&json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn params_to_json(params: Option<&NotificationParams>) -> Result<Option<String>> {
    params
        .map(|p| {
            serde_json::to_string(p)
                .map_err(|e| NudgeError::Storage(format!("Serialize params: {e}")))
        })
        .transpose()
}

/// `MIN(send_at)` query with an optional `id NOT IN (...)` filter.
fn nearest_send_at(
    conn: &Connection,
    base: &str,
    skip: &[Uuid],
) -> Result<Option<DateTime<Utc>>> {
    let mut sql = base.to_string();
    if !skip.is_empty() {
        let marks = vec!["?"; skip.len()].join(", ");
        sql.push_str(&format!(" AND id NOT IN ({marks})"));
    }
    let ids: Vec<String> = skip.iter().map(Uuid::to_string).collect();
    let millis: Option<i64> = conn
        .query_row(&sql, params_from_iter(ids.iter()), |row| row.get(0))
        .map_err(db_err)?;
    millis.map(millis_to_time).transpose()
}

fn millis_to_time(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| NudgeError::Storage(format!("timestamp {millis} out of range")))
}

fn secs(d: Duration) -> i64 {
    d.as_secs() as i64
}

fn db_err(e: rusqlite::Error) -> NudgeError {
    NudgeError::Storage(e.to_string())
}
