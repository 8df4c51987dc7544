//! In-process sink, used by tests and dry runs.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{check_existing, ArtifactRecord, ArtifactSink, SinkError, WriteOutcome};

#[derive(Default)]
pub struct MemorySink {
    records: Mutex<BTreeMap<String, ArtifactRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<ArtifactRecord> {
        self.records.lock().ok()?.get(key).cloned()
    }

    pub fn records(&self) -> Vec<ArtifactRecord> {
        self.records
            .lock()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ArtifactSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn write(&self, record: &ArtifactRecord) -> Result<WriteOutcome, SinkError> {
        let key = record.key();
        let mut records = self
            .records
            .lock()
            .map_err(|_| SinkError::Storage("memory sink lock poisoned".to_string()))?;
        let stored = records.get(&key).map(|r| r.content_hash.as_str());
        if let Some(outcome) = check_existing(&key, stored, &record.content_hash)? {
            return Ok(outcome);
        }
        records.insert(key, record.clone());
        Ok(WriteOutcome::Inserted)
    }
}
