//! SQLite cache of feature vectors keyed by (dump id, schema version).

use crate::error::PipelineResult;
use crate::features::{FeatureVector, Scope};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

pub struct FeatureCache {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS feature_vectors (
        dump_id TEXT NOT NULL,
        schema_version INTEGER NOT NULL,
        scope TEXT NOT NULL,
        key_id TEXT NOT NULL,
        position INTEGER NOT NULL,
        layout_hash TEXT NOT NULL,
        payload TEXT NOT NULL,
        PRIMARY KEY (dump_id, schema_version, scope, key_id)
    );
    CREATE INDEX IF NOT EXISTS idx_vectors_dump ON feature_vectors(dump_id, schema_version);
"#;

impl FeatureCache {
    /// Open or create the cache at `path`.
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace every vector cached for `dump_id` under the vectors' schema version.
    pub fn store(&self, dump_id: &str, image: &FeatureVector, processes: &[FeatureVector]) -> PipelineResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM feature_vectors WHERE dump_id = ?1 AND schema_version = ?2",
            params![dump_id, image.schema_version],
        )?;
        for (position, v) in std::iter::once(image).chain(processes).enumerate() {
            tx.execute(
                "INSERT OR REPLACE INTO feature_vectors \
                 (dump_id, schema_version, scope, key_id, position, layout_hash, payload) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    dump_id,
                    v.schema_version,
                    v.scope.as_str(),
                    v.key_id,
                    position as i64,
                    v.layout_hash,
                    serde_json::to_string(v)?,
                ],
            )?;
        }
        tx.commit()?;
        debug!(dump_id, vectors = processes.len() + 1, "feature vectors cached");
        Ok(())
    }

    pub fn get(&self, dump_id: &str, schema_version: u16, scope: Scope, key_id: &str) -> PipelineResult<Option<FeatureVector>> {
        let conn = self.conn();
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM feature_vectors \
                 WHERE dump_id = ?1 AND schema_version = ?2 AND scope = ?3 AND key_id = ?4",
                params![dump_id, schema_version, scope.as_str(), key_id],
                |row| row.get(0),
            )
            .optional()?;
        match payload {
            Some(p) => Ok(Some(serde_json::from_str(&p)?)),
            None => Ok(None),
        }
    }

    /// Every cached vector of a dump and version: image first, then processes in stored order.
    pub fn vectors(&self, dump_id: &str, schema_version: u16) -> PipelineResult<Vec<FeatureVector>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT payload FROM feature_vectors WHERE dump_id = ?1 AND schema_version = ?2 ORDER BY position",
        )?;
        let payloads = stmt
            .query_map(params![dump_id, schema_version], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        payloads
            .iter()
            .map(|p| serde_json::from_str(p).map_err(Into::into))
            .collect()
    }

    /// Drop every cached vector of a dump; returns the number removed.
    pub fn evict(&self, dump_id: &str) -> PipelineResult<usize> {
        let n = self
            .conn()
            .execute("DELETE FROM feature_vectors WHERE dump_id = ?1", params![dump_id])?;
        Ok(n)
    }
}
