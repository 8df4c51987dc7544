//! Replay verification: re-resolve a stored artifact from the same events
//! and config and compare every hash in the chain.

use serde::Serialize;
use serde_json::json;

use crate::audit::audit_artifact;
use crate::config::ResolutionConfig;
use crate::counterfactual::run_counterfactuals;
use crate::events::ActivityEvent;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::resolver::{resolve_events, ResolveError, SeasonArtifact, SeasonRequest};
use crate::verdict::resolve_verdict;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub season_id: String,
    pub community_id: String,
    /// Stored artifact still matches its own output hash
    pub stored_intact: bool,
    pub input_match: bool,
    pub config_match: bool,
    pub output_match: bool,
    pub stored_output_hash: String,
    pub replayed_output_hash: String,
    /// Verdict hash of the replayed chain
    pub replayed_verdict_hash: String,
}

impl ReplayReport {
    pub fn is_exact(&self) -> bool {
        self.stored_intact && self.input_match && self.config_match && self.output_match
    }

    pub fn mismatches(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if !self.stored_intact {
            out.push("stored_output_hash");
        }
        if !self.input_match {
            out.push("input_hash");
        }
        if !self.config_match {
            out.push("config_hash");
        }
        if !self.output_match {
            out.push("output_hash");
        }
        out
    }
}

/// Re-run resolution, audit, counterfactuals and verdict for a stored
/// artifact. Mismatches are reported, not raised; only failures that stop
/// the replay itself are errors.
pub fn verify_replay(
    stored: &SeasonArtifact,
    events: &[ActivityEvent],
    config: &ResolutionConfig,
) -> Result<ReplayReport, ResolveError> {
    let request = SeasonRequest {
        season_id: stored.season_id.clone(),
        community_id: stored.community_id.clone(),
        window: stored.window,
    };
    let replayed = resolve_events(&request, events, config)?;
    let audit = audit_artifact(&replayed, events)?;
    let counterfactuals = run_counterfactuals(&replayed, events, config)?;
    let verdict = resolve_verdict(&audit, &counterfactuals)?;

    let report = ReplayReport {
        season_id: stored.season_id.clone(),
        community_id: stored.community_id.clone(),
        stored_intact: stored.verify_output_hash(),
        input_match: stored.hashes.input_hash == replayed.hashes.input_hash,
        config_match: stored.hashes.config_hash == replayed.hashes.config_hash,
        output_match: stored.hashes.output_hash == replayed.hashes.output_hash,
        stored_output_hash: stored.hashes.output_hash.clone(),
        replayed_output_hash: replayed.hashes.output_hash,
        replayed_verdict_hash: verdict.verdict_hash,
    };
    log(
        if report.is_exact() { Level::Info } else { Level::Warn },
        Domain::System,
        "replay",
        obj(&[
            ("season_id", v_str(&report.season_id)),
            ("community_id", v_str(&report.community_id)),
            ("exact", json!(report.is_exact())),
            ("mismatches", json!(report.mismatches())),
        ]),
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventType, TimeWindow};

    fn events() -> Vec<ActivityEvent> {
        (0..24)
            .map(|i| ActivityEvent {
                id: format!("e{}", i),
                community_id: "c".to_string(),
                actor_id: format!("u{}", i % 8),
                event_type: if i % 3 == 0 {
                    EventType::Comment
                } else {
                    EventType::Upvote
                },
                target_id: None,
                ts: 10 * i as u64,
            })
            .collect()
    }

    fn stored(config: &ResolutionConfig) -> SeasonArtifact {
        let req = SeasonRequest::new("s0", "c", TimeWindow::new(0, 1_000));
        resolve_events(&req, &events(), config).unwrap()
    }

    #[test]
    fn test_replay_is_exact() {
        let cfg = ResolutionConfig::season0_default();
        let report = verify_replay(&stored(&cfg), &events(), &cfg).unwrap();
        assert!(report.is_exact(), "{:?}", report.mismatches());
    }

    #[test]
    fn test_replay_detects_changed_config_and_input() {
        let cfg = ResolutionConfig::season0_default();
        let artifact = stored(&cfg);

        let mut other = cfg.clone();
        other.max_share = 0.5;
        let report = verify_replay(&artifact, &events(), &other).unwrap();
        assert!(!report.config_match);
        assert!(report.input_match);

        let fewer: Vec<_> = events().into_iter().skip(1).collect();
        let report = verify_replay(&artifact, &fewer, &cfg).unwrap();
        assert!(!report.input_match);
        assert!(report.mismatches().contains(&"input_hash"));
    }

    #[test]
    fn test_replay_flags_tampered_store() {
        let cfg = ResolutionConfig::season0_default();
        let mut artifact = stored(&cfg);
        if let Some(w) = artifact.resolved_weights.values_mut().next() {
            *w += 0.01;
        }
        let report = verify_replay(&artifact, &events(), &cfg).unwrap();
        assert!(!report.stored_intact);
        assert!(!report.is_exact());
    }
}
