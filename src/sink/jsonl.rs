//! Append-only JSONL artifact log.
//!
//! One `ArtifactRecord` per line. On open the existing log is replayed to
//! rebuild the key -> hash index, so the integrity rule survives restarts.
//! A torn final line is terminated before anything new is appended.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{check_existing, ArtifactRecord, ArtifactSink, SinkError, WriteOutcome};
use crate::logging::{log, obj, v_str, Domain, Level};

struct LogState {
    file: File,
    index: HashMap<String, String>,
}

pub struct JsonlArtifactLog {
    path: PathBuf,
    state: Mutex<LogState>,
}

impl JsonlArtifactLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let mut index = HashMap::new();
        for record in Self::replay(&path)? {
            index.insert(record.key(), record.content_hash);
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if Self::ends_mid_line(&path)? {
            file.write_all(b"\n")?;
            file.flush()?;
            log(
                Level::Warn,
                Domain::Sink,
                "jsonl_torn_tail",
                obj(&[("path", v_str(&path.to_string_lossy()))]),
            );
        }
        Ok(Self {
            path,
            state: Mutex::new(LogState { file, index }),
        })
    }

    fn ends_mid_line(path: &Path) -> Result<bool, SinkError> {
        let mut file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Ok(false);
        }
        file.seek(SeekFrom::End(-1))?;
        let mut last = [0u8; 1];
        file.read_exact(&mut last)?;
        Ok(last[0] != b'\n')
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every parseable record. Torn or foreign lines are skipped.
    pub fn replay(path: &Path) -> Result<Vec<ArtifactRecord>, SinkError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(path)?);
        let mut out = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ArtifactRecord>(&line) {
                Ok(record) => out.push(record),
                Err(err) => log(
                    Level::Warn,
                    Domain::Sink,
                    "jsonl_skip",
                    obj(&[
                        ("path", v_str(&path.to_string_lossy())),
                        ("line", serde_json::json!(idx + 1)),
                        ("reason", v_str(&err.to_string())),
                    ]),
                ),
            }
        }
        Ok(out)
    }

    pub fn append(&self, record: &ArtifactRecord) -> Result<WriteOutcome, SinkError> {
        let key = record.key();
        let mut state = self
            .state
            .lock()
            .map_err(|_| SinkError::Storage("jsonl log lock poisoned".to_string()))?;
        let stored = state.index.get(&key).map(String::as_str);
        if let Some(outcome) = check_existing(&key, stored, &record.content_hash)? {
            return Ok(outcome);
        }

        let line = serde_json::to_string(record)?;
        state.file.write_all(line.as_bytes())?;
        state.file.write_all(b"\n")?;
        state.file.flush()?;
        state.index.insert(key, record.content_hash.clone());
        Ok(WriteOutcome::Inserted)
    }
}

#[async_trait]
impl ArtifactSink for JsonlArtifactLog {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn write(&self, record: &ArtifactRecord) -> Result<WriteOutcome, SinkError> {
        self.append(record)
    }
}
