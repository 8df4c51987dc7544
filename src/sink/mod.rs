//! Artifact persistence.
//!
//! Sinks return typed results; `CompositeSink` is the fail-open boundary.
//! It fans a record out to every sink, logs each failure and hands back a
//! `SinkReport`. Nothing a sink does can change or invalidate an artifact:
//! validity is decided by the content hash alone.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audit::AuditArtifact;
use crate::config::EngineSettings;
use crate::counterfactual::CounterfactualArtifact;
use crate::logging::{log, log_sink_failure, obj, v_str, Domain, Level};
use crate::resolver::SeasonArtifact;
use crate::verdict::LegitimacyVerdict;

pub mod jsonl;
pub mod memory;
pub mod sqlite;

pub use jsonl::JsonlArtifactLog;
pub use memory::MemorySink;
pub use sqlite::SqliteArtifactStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Season,
    Audit,
    Counterfactual,
    Verdict,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Season => "season",
            Self::Audit => "audit",
            Self::Counterfactual => "counterfactual",
            Self::Verdict => "verdict",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "season" => Some(Self::Season),
            "audit" => Some(Self::Audit),
            "counterfactual" => Some(Self::Counterfactual),
            "verdict" => Some(Self::Verdict),
            _ => None,
        }
    }
}

/// A persisted artifact keyed by `{community_id, season_id, kind}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub kind: ArtifactKind,
    pub community_id: String,
    pub season_id: String,
    pub content_hash: String,
    pub body: Value,
}

impl ArtifactRecord {
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.community_id, self.season_id, self.kind.as_str())
    }

    pub fn season(a: &SeasonArtifact) -> Result<Self, SinkError> {
        Ok(Self {
            kind: ArtifactKind::Season,
            community_id: a.community_id.clone(),
            season_id: a.season_id.clone(),
            content_hash: a.hashes.output_hash.clone(),
            body: serde_json::to_value(a)?,
        })
    }

    pub fn audit(a: &AuditArtifact) -> Result<Self, SinkError> {
        Ok(Self {
            kind: ArtifactKind::Audit,
            community_id: a.community_id.clone(),
            season_id: a.season_id.clone(),
            content_hash: a.audit_hash.clone(),
            body: serde_json::to_value(a)?,
        })
    }

    pub fn counterfactual(a: &CounterfactualArtifact) -> Result<Self, SinkError> {
        Ok(Self {
            kind: ArtifactKind::Counterfactual,
            community_id: a.community_id.clone(),
            season_id: a.season_id.clone(),
            content_hash: a.delta_hash.clone(),
            body: serde_json::to_value(a)?,
        })
    }

    pub fn verdict(v: &LegitimacyVerdict) -> Result<Self, SinkError> {
        Ok(Self {
            kind: ArtifactKind::Verdict,
            community_id: v.community_id.clone(),
            season_id: v.season_id.clone(),
            content_hash: v.verdict_hash.clone(),
            body: serde_json::to_value(v)?,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("integrity violation at {key}: stored hash {stored} differs from incoming {incoming}")]
    IntegrityViolation {
        key: String,
        stored: String,
        incoming: String,
    },
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("storage: {0}")]
    Storage(String),
}

/// Result of a write that did not need to touch storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    Unchanged,
}

/// Check an incoming record against what a sink already holds for its key.
pub fn check_existing(
    key: &str,
    stored_hash: Option<&str>,
    incoming_hash: &str,
) -> Result<Option<WriteOutcome>, SinkError> {
    match stored_hash {
        Some(stored) if stored == incoming_hash => Ok(Some(WriteOutcome::Unchanged)),
        Some(stored) => Err(SinkError::IntegrityViolation {
            key: key.to_string(),
            stored: stored.to_string(),
            incoming: incoming_hash.to_string(),
        }),
        None => Ok(None),
    }
}

#[async_trait]
pub trait ArtifactSink: Send + Sync {
    fn name(&self) -> &str;

    /// Persist a record. Writing the same hash twice must succeed; a
    /// different hash for an existing key is an integrity violation.
    async fn write(&self, record: &ArtifactRecord) -> Result<WriteOutcome, SinkError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkFailure {
    pub sink: String,
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SinkReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failures: Vec<SinkFailure>,
}

impl SinkReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn merge(&mut self, other: SinkReport) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.failures.extend(other.failures);
    }

    pub fn record_failure(&mut self, sink: &str, key: &str, reason: String) {
        log_sink_failure(sink, key, &reason);
        self.failures.push(SinkFailure {
            sink: sink.to_string(),
            key: key.to_string(),
            reason,
        });
    }
}

/// Fan-out over every configured sink. Never returns an error.
#[derive(Clone, Default)]
pub struct CompositeSink {
    sinks: Vec<Arc<dyn ArtifactSink>>,
}

impl CompositeSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn with(mut self, sink: Arc<dyn ArtifactSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub async fn write(&self, record: &ArtifactRecord) -> SinkReport {
        let mut report = SinkReport::default();
        let key = record.key();
        for sink in &self.sinks {
            report.attempted += 1;
            match sink.write(record).await {
                Ok(outcome) => {
                    report.succeeded += 1;
                    log(
                        Level::Debug,
                        Domain::Sink,
                        "written",
                        obj(&[
                            ("sink", v_str(sink.name())),
                            ("key", v_str(&key)),
                            ("outcome", v_str(&format!("{:?}", outcome))),
                        ]),
                    );
                }
                Err(err) => report.record_failure(sink.name(), &key, err.to_string()),
            }
        }
        report
    }

    pub async fn write_all(&self, records: &[ArtifactRecord]) -> SinkReport {
        let mut report = SinkReport::default();
        for record in records {
            report.merge(self.write(record).await);
        }
        report
    }
}

/// SQLite store plus the optional JSONL log, as configured for the binaries.
pub fn sinks_from_settings(
    settings: &EngineSettings,
) -> Result<(CompositeSink, Arc<SqliteArtifactStore>), SinkError> {
    let store = Arc::new(SqliteArtifactStore::open(
        &settings.sqlite_path,
        settings.recent_index_cap,
    )?);
    let mut sinks = CompositeSink::new().with(store.clone());
    if let Some(path) = &settings.artifact_log_path {
        sinks = sinks.with(Arc::new(JsonlArtifactLog::open(path)?));
    }
    Ok((sinks, store))
}
