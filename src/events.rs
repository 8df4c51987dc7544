//! Community activity events and the sources that supply them.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Event-type tag. Known tags map to named variants; anything else the
/// ingestion pipeline emits is kept verbatim in `Other` so the resolver's
/// safety flag can decide what to do with it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    Upvote,
    Downvote,
    Comment,
    ModerationAction,
    GovernanceProposal,
    GovernanceVote,
    CommunityJoin,
    Other(String),
}

impl EventType {
    pub const KNOWN: [EventType; 7] = [
        EventType::Upvote,
        EventType::Downvote,
        EventType::Comment,
        EventType::ModerationAction,
        EventType::GovernanceProposal,
        EventType::GovernanceVote,
        EventType::CommunityJoin,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Self::Upvote => "UPVOTE",
            Self::Downvote => "DOWNVOTE",
            Self::Comment => "COMMENT",
            Self::ModerationAction => "MODERATION_ACTION",
            Self::GovernanceProposal => "GOVERNANCE_PROPOSAL",
            Self::GovernanceVote => "GOVERNANCE_VOTE",
            Self::CommunityJoin => "COMMUNITY_JOIN",
            Self::Other(tag) => tag.as_str(),
        }
    }

    pub fn parse(tag: &str) -> Self {
        match tag {
            "UPVOTE" => Self::Upvote,
            "DOWNVOTE" => Self::Downvote,
            "COMMENT" => Self::Comment,
            "MODERATION_ACTION" => Self::ModerationAction,
            "GOVERNANCE_PROPOSAL" => Self::GovernanceProposal,
            "GOVERNANCE_VOTE" => Self::GovernanceVote,
            "COMMUNITY_JOIN" => Self::CommunityJoin,
            other => Self::Other(other.to_string()),
        }
    }

    /// Moderation and proposal work: the stewardship signal.
    pub fn is_stewardship(&self) -> bool {
        matches!(self, Self::ModerationAction | Self::GovernanceProposal)
    }

    /// Activity that shows a member stayed after joining.
    pub fn is_retention(&self) -> bool {
        matches!(self, Self::Comment | Self::GovernanceVote)
    }
}

impl From<String> for EventType {
    fn from(tag: String) -> Self {
        Self::parse(&tag)
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable activity record owned by the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub id: String,
    pub community_id: String,
    pub actor_id: String,
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    /// Epoch milliseconds
    pub ts: u64,
}

/// Half-open `[start_ms, end_ms)` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_ms: u64,
    pub end_ms: u64,
}

impl TimeWindow {
    pub fn new(start_ms: u64, end_ms: u64) -> Self {
        Self { start_ms, end_ms }
    }

    pub fn contains(&self, ts: u64) -> bool {
        ts >= self.start_ms && ts < self.end_ms
    }

    pub fn is_empty(&self) -> bool {
        self.end_ms <= self.start_ms
    }
}

/// Filter a slice down to one community and window.
pub fn select_window<'a>(
    events: &'a [ActivityEvent],
    community_id: &str,
    window: TimeWindow,
) -> Vec<&'a ActivityEvent> {
    events
        .iter()
        .filter(|e| e.community_id == community_id && window.contains(e.ts))
        .collect()
}

// =============================================================================
// Event sources
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("event source io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed event at {path}:{line}: {reason}")]
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

/// Read-only supplier of activity events.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn list(
        &self,
        community_id: &str,
        start_ms: u64,
        end_ms: u64,
    ) -> Result<Vec<ActivityEvent>, SourceError>;
}

/// Vector-backed source, used for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventSource {
    events: Vec<ActivityEvent>,
}

impl InMemoryEventSource {
    pub fn new(events: Vec<ActivityEvent>) -> Self {
        Self { events }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[async_trait]
impl EventSource for InMemoryEventSource {
    async fn list(
        &self,
        community_id: &str,
        start_ms: u64,
        end_ms: u64,
    ) -> Result<Vec<ActivityEvent>, SourceError> {
        let window = TimeWindow::new(start_ms, end_ms);
        Ok(select_window(&self.events, community_id, window)
            .into_iter()
            .cloned()
            .collect())
    }
}

/// JSON-lines file, one `ActivityEvent` per line. Blank lines and `#`
/// comments are skipped; anything else that fails to parse aborts the read.
#[derive(Debug, Clone)]
pub struct JsonlEventSource {
    path: PathBuf,
}

impl JsonlEventSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn parse_lines(path: &Path, text: &str) -> Result<Vec<ActivityEvent>, SourceError> {
        let mut out = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let evt: ActivityEvent =
                serde_json::from_str(trimmed).map_err(|e| SourceError::Malformed {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    reason: e.to_string(),
                })?;
            out.push(evt);
        }
        Ok(out)
    }
}

#[async_trait]
impl EventSource for JsonlEventSource {
    async fn list(
        &self,
        community_id: &str,
        start_ms: u64,
        end_ms: u64,
    ) -> Result<Vec<ActivityEvent>, SourceError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| SourceError::Io {
                path: self.path.clone(),
                source,
            })?;
        let all = Self::parse_lines(&self.path, &text)?;
        let window = TimeWindow::new(start_ms, end_ms);
        Ok(all
            .into_iter()
            .filter(|e| e.community_id == community_id && window.contains(e.ts))
            .collect())
    }
}
