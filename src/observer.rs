//! Typed stage notifications for a pipeline run.
//!
//! Observers are synchronous and must not fail the run; anything they want
//! to persist goes through their own channel.

use std::sync::Mutex;

use serde::Serialize;
use serde_json::json;

use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::verdict::VerdictState;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum PipelineEvent {
    Started {
        season_id: String,
        community_id: String,
    },
    Fetched {
        community_id: String,
        events: usize,
    },
    Resolved {
        community_id: String,
        output_hash: String,
        eligible: usize,
        max_weight: f64,
    },
    Audited {
        community_id: String,
        audit_hash: String,
        hard_fail: usize,
        soft_risk: usize,
    },
    CounterfactualsRun {
        community_id: String,
        delta_hash: String,
        critical: usize,
    },
    VerdictReached {
        community_id: String,
        verdict: VerdictState,
        verdict_hash: String,
    },
    Persisted {
        community_id: String,
        attempted: usize,
        succeeded: usize,
    },
    Failed {
        community_id: String,
        reason: String,
    },
}

impl PipelineEvent {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Fetched { .. } => "fetched",
            Self::Resolved { .. } => "resolved",
            Self::Audited { .. } => "audited",
            Self::CounterfactualsRun { .. } => "counterfactuals_run",
            Self::VerdictReached { .. } => "verdict_reached",
            Self::Persisted { .. } => "persisted",
            Self::Failed { .. } => "failed",
        }
    }
}

pub trait PipelineObserver: Send + Sync {
    fn on_event(&self, event: &PipelineEvent);
}

/// Forwards every stage to the structured log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl PipelineObserver for LoggingObserver {
    fn on_event(&self, event: &PipelineEvent) {
        let (level, fields) = match event {
            PipelineEvent::Started {
                season_id,
                community_id,
            } => (
                Level::Info,
                obj(&[
                    ("season_id", v_str(season_id)),
                    ("community_id", v_str(community_id)),
                ]),
            ),
            PipelineEvent::Fetched {
                community_id,
                events,
            } => (
                Level::Debug,
                obj(&[
                    ("community_id", v_str(community_id)),
                    ("events", json!(events)),
                ]),
            ),
            PipelineEvent::Resolved {
                community_id,
                output_hash,
                eligible,
                max_weight,
            } => (
                Level::Debug,
                obj(&[
                    ("community_id", v_str(community_id)),
                    ("output_hash", v_str(output_hash)),
                    ("eligible", json!(eligible)),
                    ("max_weight", v_num(*max_weight)),
                ]),
            ),
            PipelineEvent::Audited {
                community_id,
                audit_hash,
                hard_fail,
                soft_risk,
            } => (
                Level::Debug,
                obj(&[
                    ("community_id", v_str(community_id)),
                    ("audit_hash", v_str(audit_hash)),
                    ("hard_fail", json!(hard_fail)),
                    ("soft_risk", json!(soft_risk)),
                ]),
            ),
            PipelineEvent::CounterfactualsRun {
                community_id,
                delta_hash,
                critical,
            } => (
                Level::Debug,
                obj(&[
                    ("community_id", v_str(community_id)),
                    ("delta_hash", v_str(delta_hash)),
                    ("critical", json!(critical)),
                ]),
            ),
            PipelineEvent::VerdictReached {
                community_id,
                verdict,
                verdict_hash,
            } => (
                Level::Info,
                obj(&[
                    ("community_id", v_str(community_id)),
                    ("verdict", v_str(verdict.as_str())),
                    ("verdict_hash", v_str(verdict_hash)),
                ]),
            ),
            PipelineEvent::Persisted {
                community_id,
                attempted,
                succeeded,
            } => (
                if attempted == succeeded {
                    Level::Debug
                } else {
                    Level::Warn
                },
                obj(&[
                    ("community_id", v_str(community_id)),
                    ("attempted", json!(attempted)),
                    ("succeeded", json!(succeeded)),
                ]),
            ),
            PipelineEvent::Failed {
                community_id,
                reason,
            } => (
                Level::Error,
                obj(&[
                    ("community_id", v_str(community_id)),
                    ("msg", v_str(reason)),
                ]),
            ),
        };
        log(level, Domain::System, event.stage(), fields);
    }
}

/// Keeps every event in arrival order.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<PipelineEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn stages(&self) -> Vec<&'static str> {
        self.events().iter().map(PipelineEvent::stage).collect()
    }
}

impl PipelineObserver for RecordingObserver {
    fn on_event(&self, event: &PipelineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_keeps_order() {
        let rec = RecordingObserver::new();
        rec.on_event(&PipelineEvent::Started {
            season_id: "s0".to_string(),
            community_id: "c".to_string(),
        });
        rec.on_event(&PipelineEvent::Fetched {
            community_id: "c".to_string(),
            events: 4,
        });
        assert_eq!(rec.stages(), vec!["started", "fetched"]);
    }

    #[test]
    fn test_event_serializes_with_stage_tag() {
        let e = PipelineEvent::Persisted {
            community_id: "c".to_string(),
            attempted: 4,
            succeeded: 3,
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["stage"], "persisted");
        assert_eq!(v["succeeded"], 3);
    }
}
