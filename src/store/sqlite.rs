//! SQLite implementation of the persistence bridge.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;
use uuid::Uuid;

use super::{ChartRecord, ContextStore, DimensionRecord, LabelRecord, ShadowRecord};
use crate::collection::ChartType;
use crate::error::Result;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS context (host_id BLOB, id TEXT NOT NULL, \
     version INT NOT NULL, title TEXT NOT NULL, chart_type TEXT NOT NULL, \
     unit TEXT NOT NULL, priority INT NOT NULL, first_time_t INT NOT NULL, \
     last_time_t INT NOT NULL, deleted INT NOT NULL, family TEXT, \
     PRIMARY KEY (host_id, id));",
    "CREATE TABLE IF NOT EXISTS chart (chart_id BLOB, host_id BLOB, \
     id TEXT NOT NULL, name TEXT, context TEXT NOT NULL, title TEXT, \
     unit TEXT, priority INT, update_every INT, chart_type TEXT, \
     family TEXT, PRIMARY KEY (chart_id));",
    "CREATE TABLE IF NOT EXISTS dimension (dim_id BLOB, chart_id BLOB, \
     id TEXT NOT NULL, name TEXT, hidden INT NOT NULL DEFAULT 0, \
     PRIMARY KEY (dim_id));",
    "CREATE TABLE IF NOT EXISTS chart_label (chart_id BLOB, \
     label_key TEXT NOT NULL, label_value TEXT, \
     PRIMARY KEY (chart_id, label_key));",
];

/// Context metadata store backed by a SQLite database file.
pub struct SqliteContextStore {
    conn: Mutex<Connection>,
}

impl SqliteContextStore {
    /// Opens (creating if needed) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "store.sqlite.open");
        Self::init(conn)
    }

    /// Opens a private in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        for stmt in SCHEMA {
            conn.execute(stmt, [])?;
        }
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Writes an archived chart row; the metadata side of the agent keeps
    /// these current, the index only reads them back at startup.
    pub fn store_chart(&self, host_uuid: &Uuid, chart: &ChartRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO chart (chart_id, host_id, id, name, context, \
             title, unit, priority, update_every, chart_type, family) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                chart.uuid.as_bytes().as_slice(),
                host_uuid.as_bytes().as_slice(),
                chart.id,
                chart.name,
                chart.context,
                chart.title,
                chart.units,
                chart.priority,
                chart.update_every_s,
                chart.chart_type.as_str(),
                chart.family,
            ],
        )?;
        Ok(())
    }

    /// Writes an archived dimension row.
    pub fn store_dimension(&self, chart_uuid: &Uuid, dim: &DimensionRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO dimension (dim_id, chart_id, id, name, hidden) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                dim.uuid.as_bytes().as_slice(),
                chart_uuid.as_bytes().as_slice(),
                dim.id,
                dim.name,
                dim.hidden as i64,
            ],
        )?;
        Ok(())
    }

    /// Writes an archived label row.
    pub fn store_label(&self, chart_uuid: &Uuid, label: &LabelRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO chart_label (chart_id, label_key, label_value) \
             VALUES (?1, ?2, ?3)",
            params![
                chart_uuid.as_bytes().as_slice(),
                label.key,
                label.value,
            ],
        )?;
        Ok(())
    }

    /// The stored shadow row of one context, if present.
    pub fn shadow(&self, host_uuid: &Uuid, id: &str) -> Result<Option<ShadowRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, version, title, chart_type, unit, priority, \
                 first_time_t, last_time_t, deleted, family \
                 FROM context WHERE host_id = ?1 AND id = ?2",
                params![host_uuid.as_bytes().as_slice(), id],
                shadow_from_row,
            )
            .optional()?;
        Ok(row)
    }
}

fn shadow_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ShadowRecord> {
    Ok(ShadowRecord {
        id: row.get(0)?,
        version: row.get::<_, i64>(1)? as u64,
        title: row.get(2)?,
        chart_type: ChartType::from_str_lossy(&row.get::<_, String>(3)?),
        units: row.get(4)?,
        priority: row.get::<_, i64>(5)? as u32,
        first_time_s: row.get(6)?,
        last_time_s: row.get(7)?,
        deleted: row.get::<_, i64>(8)? != 0,
        family: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
    })
}

fn uuid_from_blob(blob: Vec<u8>) -> Uuid {
    Uuid::from_slice(&blob).unwrap_or_default()
}

impl ContextStore for SqliteContextStore {
    fn load_contexts(&self, host_uuid: &Uuid, cb: &mut dyn FnMut(ShadowRecord)) -> Result<()> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, version, title, chart_type, unit, priority, \
             first_time_t, last_time_t, deleted, family \
             FROM context WHERE host_id = ?1",
        )?;
        let rows = stmt.query_map(params![host_uuid.as_bytes().as_slice()], shadow_from_row)?;
        for row in rows {
            cb(row?);
        }
        Ok(())
    }

    fn load_charts(&self, host_uuid: &Uuid, cb: &mut dyn FnMut(ChartRecord)) -> Result<()> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT chart_id, id, name, context, title, unit, priority, \
             update_every, chart_type, family \
             FROM chart WHERE host_id = ?1",
        )?;
        let rows = stmt.query_map(params![host_uuid.as_bytes().as_slice()], |row| {
            Ok(ChartRecord {
                uuid: uuid_from_blob(row.get(0)?),
                id: row.get(1)?,
                name: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                context: row.get(3)?,
                title: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                units: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                priority: row.get::<_, i64>(6)? as u32,
                update_every_s: row.get(7)?,
                chart_type: ChartType::from_str_lossy(
                    &row.get::<_, Option<String>>(8)?.unwrap_or_default(),
                ),
                family: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
            })
        })?;
        for row in rows {
            cb(row?);
        }
        Ok(())
    }

    fn load_dimensions(
        &self,
        chart_uuid: &Uuid,
        cb: &mut dyn FnMut(DimensionRecord),
    ) -> Result<()> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT dim_id, id, name, hidden FROM dimension WHERE chart_id = ?1",
        )?;
        let rows = stmt.query_map(params![chart_uuid.as_bytes().as_slice()], |row| {
            Ok(DimensionRecord {
                uuid: uuid_from_blob(row.get(0)?),
                id: row.get(1)?,
                name: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                hidden: row.get::<_, i64>(3)? != 0,
            })
        })?;
        for row in rows {
            cb(row?);
        }
        Ok(())
    }

    fn load_labels(&self, chart_uuid: &Uuid, cb: &mut dyn FnMut(LabelRecord)) -> Result<()> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT label_key, label_value FROM chart_label WHERE chart_id = ?1",
        )?;
        let rows = stmt.query_map(params![chart_uuid.as_bytes().as_slice()], |row| {
            Ok(LabelRecord {
                key: row.get(0)?,
                value: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            })
        })?;
        for row in rows {
            cb(row?);
        }
        Ok(())
    }

    fn store_context(&self, host_uuid: &Uuid, shadow: &ShadowRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO context (host_id, id, version, title, \
             chart_type, unit, priority, first_time_t, last_time_t, deleted, family) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                host_uuid.as_bytes().as_slice(),
                shadow.id,
                shadow.version as i64,
                shadow.title,
                shadow.chart_type.as_str(),
                shadow.units,
                shadow.priority,
                shadow.first_time_s,
                shadow.last_time_s,
                shadow.deleted as i64,
                shadow.family,
            ],
        )?;
        Ok(())
    }

    fn delete_context(&self, host_uuid: &Uuid, id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM context WHERE host_id = ?1 AND id = ?2",
            params![host_uuid.as_bytes().as_slice(), id],
        )?;
        Ok(())
    }
}
