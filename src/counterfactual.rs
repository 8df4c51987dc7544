//! Counterfactual replay: re-run the resolver with one protection removed
//! and measure how far the outcome moves.
//!
//! A scenario is only ever a mutation of `ResolutionConfig`; the replay goes
//! through `resolver::resolve_events`, the same code path as production.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::audit::CONCENTRATION_HARD_LIMIT;
use crate::canonical::{canonical_hash, CanonicalError};
use crate::config::ResolutionConfig;
use crate::events::{ActivityEvent, EventType};
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::resolver::{config_hash, resolve_events, ResolveError, SeasonArtifact, SeasonRequest};

/// Saturation constant that makes `1 - e^(-k·x)` effectively linear.
pub const LINEAR_SATURATION_K: f64 = 1e-9;
pub const JOIN_INFLATION: f64 = 10.0;

/// Total-variation shift at or above which removal is critical.
pub const CRITICAL_SHIFT: f64 = 0.25;
pub const EFFECTIVE_SHIFT: f64 = 0.10;
pub const EFFECTIVE_MAX_DELTA: f64 = 0.05;
pub const MARGINAL_SHIFT: f64 = 0.02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scenario {
    NoWhaleCaps,
    NoDiminishingReturns,
    NoJoinDampening,
    NoStewardshipWeighting,
}

impl Scenario {
    pub const ALL: [Scenario; 4] = [
        Scenario::NoWhaleCaps,
        Scenario::NoDiminishingReturns,
        Scenario::NoJoinDampening,
        Scenario::NoStewardshipWeighting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoWhaleCaps => "NO_WHALE_CAPS",
            Self::NoDiminishingReturns => "NO_DIMINISHING_RETURNS",
            Self::NoJoinDampening => "NO_JOIN_DAMPENING",
            Self::NoStewardshipWeighting => "NO_STEWARDSHIP_WEIGHTING",
        }
    }

    fn protection(&self) -> &'static str {
        match self {
            Self::NoWhaleCaps => "whale cap",
            Self::NoDiminishingReturns => "saturation curve",
            Self::NoJoinDampening => "join-weight dampening",
            Self::NoStewardshipWeighting => "stewardship weighting",
        }
    }

    /// The canonical config with exactly this protection disabled.
    pub fn mutate(&self, base: &ResolutionConfig) -> ResolutionConfig {
        let mut cfg = base.clone();
        match self {
            Self::NoWhaleCaps => cfg.max_share = 1.0,
            Self::NoDiminishingReturns => cfg.saturation_k = LINEAR_SATURATION_K,
            Self::NoJoinDampening => {
                let top = cfg.type_weights.values().copied().fold(0.0, f64::max);
                let current = cfg.weight_for(&EventType::CommunityJoin).unwrap_or(0.0);
                cfg.set_weight(&EventType::CommunityJoin, (current * JOIN_INFLATION).max(top));
            }
            Self::NoStewardshipWeighting => {
                cfg.set_weight(&EventType::ModerationAction, 0.0);
                cfg.set_weight(&EventType::GovernanceProposal, 0.0);
            }
        }
        cfg.name = format!("{}+{}", base.name, self.as_str().to_lowercase());
        cfg
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Efficacy {
    Critical,
    Effective,
    Marginal,
    Unnecessary,
}

impl Efficacy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::Effective => "EFFECTIVE",
            Self::Marginal => "MARGINAL",
            Self::Unnecessary => "UNNECESSARY",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterfactualResult {
    pub scenario: Scenario,
    pub narrative: String,
    pub efficacy: Efficacy,
    pub canonical_max_weight: f64,
    pub counterfactual_max_weight: f64,
    /// Total variation distance between the two weight distributions
    pub distribution_shift: f64,
    /// Output hash of the counterfactual artifact
    pub distribution_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterfactualArtifact {
    pub season_id: String,
    pub community_id: String,
    pub artifact_hash: String,
    pub results: Vec<CounterfactualResult>,
    pub delta_hash: String,
}

impl CounterfactualArtifact {
    pub fn compute_hash(&self) -> Result<String, CanonicalError> {
        delta_hash(&self.artifact_hash, &self.results)
    }

    pub fn critical(&self) -> impl Iterator<Item = &CounterfactualResult> {
        self.results
            .iter()
            .filter(|r| r.efficacy == Efficacy::Critical)
    }
}

fn delta_hash(
    artifact_hash: &str,
    results: &[CounterfactualResult],
) -> Result<String, CanonicalError> {
    canonical_hash(&json!({
        "artifactHash": artifact_hash,
        "results": results,
    }))
}

/// `½ Σ |a_u - b_u|` over the union of users.
pub fn total_variation(a: &SeasonArtifact, b: &SeasonArtifact) -> f64 {
    let users: BTreeSet<&String> = a
        .resolved_weights
        .keys()
        .chain(b.resolved_weights.keys())
        .collect();
    let sum: f64 = users
        .into_iter()
        .map(|u| {
            let x = a.resolved_weights.get(u).copied().unwrap_or(0.0);
            let y = b.resolved_weights.get(u).copied().unwrap_or(0.0);
            (x - y).abs()
        })
        .sum();
    sum / 2.0
}

pub fn classify(canonical_max: f64, counterfactual_max: f64, shift: f64) -> Efficacy {
    let crosses_limit =
        canonical_max <= CONCENTRATION_HARD_LIMIT && counterfactual_max > CONCENTRATION_HARD_LIMIT;
    if crosses_limit || shift >= CRITICAL_SHIFT {
        Efficacy::Critical
    } else if shift >= EFFECTIVE_SHIFT || counterfactual_max - canonical_max >= EFFECTIVE_MAX_DELTA {
        Efficacy::Effective
    } else if shift >= MARGINAL_SHIFT {
        Efficacy::Marginal
    } else {
        Efficacy::Unnecessary
    }
}

fn narrate(scenario: Scenario, efficacy: Efficacy, canon_max: f64, cf_max: f64, shift: f64) -> String {
    let what = match efficacy {
        Efficacy::Critical => "is critical",
        Efficacy::Effective => "is effective",
        Efficacy::Marginal => "has a marginal effect",
        Efficacy::Unnecessary => "changes nothing material",
    };
    format!(
        "without the {}: max share {:.1}% -> {:.1}%, {:.1}% of recognition moves; the protection {}",
        scenario.protection(),
        canon_max * 100.0,
        cf_max * 100.0,
        shift * 100.0,
        what
    )
}

/// Replay every scenario against the canonical artifact.
///
/// The supplied config must be the one that produced the artifact and the
/// artifact must still match its own output hash; anything else is a
/// programmer error.
pub fn run_counterfactuals(
    canonical: &SeasonArtifact,
    events: &[ActivityEvent],
    config: &ResolutionConfig,
) -> Result<CounterfactualArtifact, ResolveError> {
    if !canonical.verify_output_hash() {
        return Err(ResolveError::TamperedArtifact {
            season_id: canonical.season_id.clone(),
            community_id: canonical.community_id.clone(),
        });
    }
    let actual = config_hash(config)?;
    if actual != canonical.hashes.config_hash {
        return Err(ResolveError::ConfigMismatch {
            expected: canonical.hashes.config_hash.clone(),
            actual,
        });
    }

    let request = SeasonRequest {
        season_id: canonical.season_id.clone(),
        community_id: canonical.community_id.clone(),
        window: canonical.window,
    };
    let canon_max = canonical.max_weight();

    let mut results = Vec::with_capacity(Scenario::ALL.len());
    for scenario in Scenario::ALL {
        let mutated = scenario.mutate(config);
        let replay = resolve_events(&request, events, &mutated)?;
        let cf_max = replay.max_weight();
        let shift = total_variation(canonical, &replay);
        let efficacy = classify(canon_max, cf_max, shift);
        log(
            Level::Debug,
            Domain::Counterfactual,
            "scenario",
            obj(&[
                ("community_id", v_str(&canonical.community_id)),
                ("scenario", v_str(scenario.as_str())),
                ("efficacy", v_str(efficacy.as_str())),
                ("shift", v_num(shift)),
                ("max_weight", v_num(cf_max)),
            ]),
        );
        results.push(CounterfactualResult {
            scenario,
            narrative: narrate(scenario, efficacy, canon_max, cf_max, shift),
            efficacy,
            canonical_max_weight: canon_max,
            counterfactual_max_weight: cf_max,
            distribution_shift: shift,
            distribution_hash: replay.hashes.output_hash,
        });
    }

    let delta_hash = delta_hash(&canonical.hashes.output_hash, &results)?;
    Ok(CounterfactualArtifact {
        season_id: canonical.season_id.clone(),
        community_id: canonical.community_id.clone(),
        artifact_hash: canonical.hashes.output_hash.clone(),
        results,
        delta_hash,
    })
}
