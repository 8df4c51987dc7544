//! SQLite artifact store: one row per `{community, season, kind}` plus a
//! bounded recent-artifacts index.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::{check_existing, ArtifactKind, ArtifactRecord, ArtifactSink, SinkError, WriteOutcome};
use crate::logging::ts_epoch_ms;
use crate::resolver::SeasonArtifact;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecentEntry {
    pub community_id: String,
    pub season_id: String,
    pub kind: ArtifactKind,
    pub content_hash: String,
    pub written_at_ms: u64,
}

pub struct SqliteArtifactStore {
    conn: Mutex<Connection>,
    recent_cap: usize,
}

impl SqliteArtifactStore {
    pub fn open(path: impl AsRef<Path>, recent_cap: usize) -> Result<Self, SinkError> {
        let store = Self {
            conn: Mutex::new(Connection::open(path)?),
            recent_cap: recent_cap.max(1),
        };
        store.init()?;
        Ok(store)
    }

    pub fn open_in_memory(recent_cap: usize) -> Result<Self, SinkError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            recent_cap: recent_cap.max(1),
        };
        store.init()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, SinkError> {
        self.conn
            .lock()
            .map_err(|_| SinkError::Storage("sqlite connection lock poisoned".to_string()))
    }

    fn init(&self) -> Result<(), SinkError> {
        self.lock()?.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS artifacts (
                community_id TEXT NOT NULL,
                season_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                body TEXT NOT NULL,
                written_at_ms INTEGER NOT NULL,
                PRIMARY KEY (community_id, season_id, kind)
            );
            CREATE TABLE IF NOT EXISTS recent_artifacts (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                community_id TEXT NOT NULL,
                season_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                written_at_ms INTEGER NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    /// Insert a record, or confirm it is already present with the same hash.
    pub fn put(&self, record: &ArtifactRecord) -> Result<WriteOutcome, SinkError> {
        let body = serde_json::to_string(&record.body)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let stored: Option<String> = tx
            .query_row(
                "SELECT content_hash FROM artifacts
                 WHERE community_id = ?1 AND season_id = ?2 AND kind = ?3",
                params![record.community_id, record.season_id, record.kind.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(outcome) =
            check_existing(&record.key(), stored.as_deref(), &record.content_hash)?
        {
            return Ok(outcome);
        }

        let now = ts_epoch_ms() as i64;
        tx.execute(
            "INSERT INTO artifacts (community_id, season_id, kind, content_hash, body, written_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.community_id,
                record.season_id,
                record.kind.as_str(),
                record.content_hash,
                body,
                now
            ],
        )?;
        tx.execute(
            "INSERT INTO recent_artifacts (community_id, season_id, kind, content_hash, written_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.community_id,
                record.season_id,
                record.kind.as_str(),
                record.content_hash,
                now
            ],
        )?;
        tx.execute(
            "DELETE FROM recent_artifacts WHERE seq NOT IN
             (SELECT seq FROM recent_artifacts ORDER BY seq DESC LIMIT ?1)",
            params![self.recent_cap as i64],
        )?;
        tx.commit()?;
        Ok(WriteOutcome::Inserted)
    }

    pub fn get(
        &self,
        community_id: &str,
        season_id: &str,
        kind: ArtifactKind,
    ) -> Result<Option<ArtifactRecord>, SinkError> {
        let conn = self.lock()?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT content_hash, body FROM artifacts
                 WHERE community_id = ?1 AND season_id = ?2 AND kind = ?3",
                params![community_id, season_id, kind.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((content_hash, body)) => Ok(Some(ArtifactRecord {
                kind,
                community_id: community_id.to_string(),
                season_id: season_id.to_string(),
                content_hash,
                body: serde_json::from_str(&body)?,
            })),
            None => Ok(None),
        }
    }

    pub fn load_season(
        &self,
        community_id: &str,
        season_id: &str,
    ) -> Result<Option<SeasonArtifact>, SinkError> {
        match self.get(community_id, season_id, ArtifactKind::Season)? {
            Some(record) => Ok(Some(serde_json::from_value(record.body)?)),
            None => Ok(None),
        }
    }

    /// Most recent writes first, bounded by the index cap.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<RecentEntry>, SinkError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT community_id, season_id, kind, content_hash, written_at_ms
             FROM recent_artifacts ORDER BY seq DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (community_id, season_id, kind, content_hash, written_at_ms) = row?;
            let kind = ArtifactKind::parse(&kind)
                .ok_or_else(|| SinkError::Storage(format!("unknown artifact kind {}", kind)))?;
            out.push(RecentEntry {
                community_id,
                season_id,
                kind,
                content_hash,
                written_at_ms: written_at_ms.max(0) as u64,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl ArtifactSink for SqliteArtifactStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn write(&self, record: &ArtifactRecord) -> Result<WriteOutcome, SinkError> {
        self.put(record)
    }
}
