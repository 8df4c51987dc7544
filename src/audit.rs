//! Legitimacy audit: five independent risk findings over a resolved artifact
//! and the raw events behind it.
//!
//! Pure function of its two inputs. Thresholds:
//!
//! | dimension       | HARD_FAIL                               | SOFT_RISK                          |
//! |-----------------|-----------------------------------------|------------------------------------|
//! | concentration   | any weight > 0.20 after capping         | more than 3 actors clamped         |
//! | diversity       | fewer than 2 event types                | one type > 90% of events           |
//! | stewardship     | no moderation or proposal events        |                                    |
//! | join/retention  | joins with no comments or gov votes     |                                    |
//! | silence/noise   |                                         | > 25% of participants dampened 3x+ |

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::canonical::{canonical_hash, CanonicalError};
use crate::events::{select_window, ActivityEvent, EventType};
use crate::logging::{log, log_finding, obj, v_str, Domain, Level};
use crate::resolver::SeasonArtifact;

pub const CONCENTRATION_HARD_LIMIT: f64 = 0.20;
pub const CAP_PRESSURE_ACTORS: usize = 3;
pub const MONOCULTURE_MIN_TYPES: usize = 2;
pub const TYPE_SKEW_SHARE: f64 = 0.90;
/// An actor is "heavily dampened" when its event share is this many times its weight.
pub const DAMPENING_RATIO: f64 = 3.0;
pub const DAMPENED_PARTICIPANT_SHARE: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditDimension {
    Concentration,
    Diversity,
    Stewardship,
    JoinRetention,
    SilenceNoise,
}

impl AuditDimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Concentration => "CONCENTRATION",
            Self::Diversity => "DIVERSITY",
            Self::Stewardship => "STEWARDSHIP",
            Self::JoinRetention => "JOIN_RETENTION",
            Self::SilenceNoise => "SILENCE_NOISE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FindingVerdict {
    Pass,
    SoftRisk,
    HardFail,
}

impl FindingVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::SoftRisk => "SOFT_RISK",
            Self::HardFail => "HARD_FAIL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskFlag {
    WhaleDominance,
    CapPressure,
    MonocultureDetection,
    TypeSkew,
    StewardshipAbsent,
    EmptyJoinSpike,
    BurstDampening,
}

impl RiskFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WhaleDominance => "WHALE_DOMINANCE",
            Self::CapPressure => "CAP_PRESSURE",
            Self::MonocultureDetection => "MONOCULTURE_DETECTION",
            Self::TypeSkew => "TYPE_SKEW",
            Self::StewardshipAbsent => "STEWARDSHIP_ABSENT",
            Self::EmptyJoinSpike => "EMPTY_JOIN_SPIKE",
            Self::BurstDampening => "BURST_DAMPENING",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditFinding {
    pub dimension: AuditDimension,
    pub verdict: FindingVerdict,
    pub risk_flags: BTreeSet<RiskFlag>,
    pub narrative: String,
}

impl AuditFinding {
    fn pass(dimension: AuditDimension, narrative: String) -> Self {
        Self {
            dimension,
            verdict: FindingVerdict::Pass,
            risk_flags: BTreeSet::new(),
            narrative,
        }
    }

    fn flagged(
        dimension: AuditDimension,
        verdict: FindingVerdict,
        flag: RiskFlag,
        narrative: String,
    ) -> Self {
        let mut risk_flags = BTreeSet::new();
        risk_flags.insert(flag);
        Self {
            dimension,
            verdict,
            risk_flags,
            narrative,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditArtifact {
    pub season_id: String,
    pub community_id: String,
    /// Output hash of the audited season artifact
    pub artifact_hash: String,
    pub findings: Vec<AuditFinding>,
    pub audit_hash: String,
}

impl AuditArtifact {
    pub fn compute_hash(&self) -> Result<String, CanonicalError> {
        audit_hash(&self.artifact_hash, &self.findings)
    }

    pub fn count(&self, verdict: FindingVerdict) -> usize {
        self.findings.iter().filter(|f| f.verdict == verdict).count()
    }

    pub fn finding(&self, dimension: AuditDimension) -> Option<&AuditFinding> {
        self.findings.iter().find(|f| f.dimension == dimension)
    }
}

fn audit_hash(artifact_hash: &str, findings: &[AuditFinding]) -> Result<String, CanonicalError> {
    canonical_hash(&json!({
        "artifactHash": artifact_hash,
        "findings": findings,
    }))
}

// =============================================================================
// Dimensions
// =============================================================================

fn concentration(artifact: &SeasonArtifact) -> AuditFinding {
    let dim = AuditDimension::Concentration;
    if artifact.is_empty() {
        return AuditFinding::pass(dim, "no resolved weights; nothing concentrated".to_string());
    }
    let (top_user, top_weight) = artifact
        .resolved_weights
        .iter()
        .fold(("", 0.0), |acc, (u, w)| if *w > acc.1 { (u.as_str(), *w) } else { acc });
    if top_weight > CONCENTRATION_HARD_LIMIT {
        return AuditFinding::flagged(
            dim,
            FindingVerdict::HardFail,
            RiskFlag::WhaleDominance,
            format!(
                "{} holds {:.1}% of recognition after capping (limit {:.0}%)",
                top_user,
                top_weight * 100.0,
                CONCENTRATION_HARD_LIMIT * 100.0
            ),
        );
    }
    let clamped = artifact.clamped_count();
    if clamped > CAP_PRESSURE_ACTORS {
        return AuditFinding::flagged(
            dim,
            FindingVerdict::SoftRisk,
            RiskFlag::CapPressure,
            format!("{} actors needed whale-cap clamping", clamped),
        );
    }
    AuditFinding::pass(
        dim,
        format!(
            "largest share {:.1}%, {} actors clamped",
            top_weight * 100.0,
            clamped
        ),
    )
}

fn type_counts(events: &[&ActivityEvent]) -> BTreeMap<EventType, usize> {
    let mut counts = BTreeMap::new();
    for e in events {
        *counts.entry(e.event_type.clone()).or_insert(0) += 1;
    }
    counts
}

fn diversity(counts: &BTreeMap<EventType, usize>, total: usize) -> AuditFinding {
    let dim = AuditDimension::Diversity;
    if counts.len() < MONOCULTURE_MIN_TYPES {
        let narrative = match counts.keys().next() {
            Some(only) => format!("all {} events are {}", total, only),
            None => "no events in window".to_string(),
        };
        return AuditFinding::flagged(
            dim,
            FindingVerdict::HardFail,
            RiskFlag::MonocultureDetection,
            narrative,
        );
    }
    let (top_type, top_count) = counts
        .iter()
        .fold((None, 0usize), |acc, (t, c)| if *c > acc.1 { (Some(t), *c) } else { acc });
    let share = top_count as f64 / total as f64;
    if share > TYPE_SKEW_SHARE {
        let name = top_type.map(|t| t.to_string()).unwrap_or_default();
        return AuditFinding::flagged(
            dim,
            FindingVerdict::SoftRisk,
            RiskFlag::TypeSkew,
            format!("{} accounts for {:.1}% of events", name, share * 100.0),
        );
    }
    AuditFinding::pass(
        dim,
        format!("{} event types, largest {:.1}%", counts.len(), share * 100.0),
    )
}

fn stewardship(counts: &BTreeMap<EventType, usize>) -> AuditFinding {
    let dim = AuditDimension::Stewardship;
    let stewardship: usize = counts
        .iter()
        .filter(|(t, _)| t.is_stewardship())
        .map(|(_, c)| *c)
        .sum();
    if stewardship == 0 {
        return AuditFinding::flagged(
            dim,
            FindingVerdict::HardFail,
            RiskFlag::StewardshipAbsent,
            "no moderation actions or governance proposals in window".to_string(),
        );
    }
    AuditFinding::pass(dim, format!("{} stewardship events", stewardship))
}

fn join_retention(counts: &BTreeMap<EventType, usize>) -> AuditFinding {
    let dim = AuditDimension::JoinRetention;
    let joins = counts.get(&EventType::CommunityJoin).copied().unwrap_or(0);
    let retention: usize = counts
        .iter()
        .filter(|(t, _)| t.is_retention())
        .map(|(_, c)| *c)
        .sum();
    if joins > 0 && retention == 0 {
        return AuditFinding::flagged(
            dim,
            FindingVerdict::HardFail,
            RiskFlag::EmptyJoinSpike,
            format!("{} joins with no comments or governance votes", joins),
        );
    }
    AuditFinding::pass(
        dim,
        format!("{} joins, {} retention events", joins, retention),
    )
}

fn silence_noise(artifact: &SeasonArtifact, events: &[&ActivityEvent]) -> AuditFinding {
    let dim = AuditDimension::SilenceNoise;
    let participants = artifact.resolved_weights.len();
    if participants == 0 {
        return AuditFinding::pass(dim, "no participants to dampen".to_string());
    }

    let mut per_actor: BTreeMap<&str, usize> = BTreeMap::new();
    let mut participant_events = 0usize;
    for e in events {
        if artifact.resolved_weights.contains_key(&e.actor_id) {
            *per_actor.entry(e.actor_id.as_str()).or_insert(0) += 1;
            participant_events += 1;
        }
    }
    if participant_events == 0 {
        return AuditFinding::pass(dim, "no participant events".to_string());
    }

    let dampened = artifact
        .resolved_weights
        .iter()
        .filter(|(user, weight)| {
            let n = per_actor.get(user.as_str()).copied().unwrap_or(0);
            let event_share = n as f64 / participant_events as f64;
            **weight > 0.0 && event_share >= DAMPENING_RATIO * **weight
        })
        .count();
    let fraction = dampened as f64 / participants as f64;
    if fraction > DAMPENED_PARTICIPANT_SHARE {
        return AuditFinding::flagged(
            dim,
            FindingVerdict::SoftRisk,
            RiskFlag::BurstDampening,
            format!(
                "{} of {} participants ({:.0}%) are burst actors dampened {}x or more",
                dampened,
                participants,
                fraction * 100.0,
                DAMPENING_RATIO
            ),
        );
    }
    AuditFinding::pass(
        dim,
        format!("{} of {} participants heavily dampened", dampened, participants),
    )
}

/// Audit a resolved artifact against the raw events that produced it.
pub fn audit_artifact(
    artifact: &SeasonArtifact,
    events: &[ActivityEvent],
) -> Result<AuditArtifact, CanonicalError> {
    let in_window = select_window(events, &artifact.community_id, artifact.window);
    let counts = type_counts(&in_window);

    let findings = vec![
        concentration(artifact),
        diversity(&counts, in_window.len()),
        stewardship(&counts),
        join_retention(&counts),
        silence_noise(artifact, &in_window),
    ];

    for f in &findings {
        let flags: Vec<String> = f.risk_flags.iter().map(|r| r.as_str().to_string()).collect();
        log_finding(
            &artifact.community_id,
            f.dimension.as_str(),
            f.verdict.as_str(),
            &flags,
        );
    }

    let audit_hash = audit_hash(&artifact.hashes.output_hash, &findings)?;
    let audit = AuditArtifact {
        season_id: artifact.season_id.clone(),
        community_id: artifact.community_id.clone(),
        artifact_hash: artifact.hashes.output_hash.clone(),
        findings,
        audit_hash,
    };
    log(
        Level::Info,
        Domain::Audit,
        "audited",
        obj(&[
            ("season_id", v_str(&audit.season_id)),
            ("community_id", v_str(&audit.community_id)),
            ("hard_fail", json!(audit.count(FindingVerdict::HardFail))),
            ("soft_risk", json!(audit.count(FindingVerdict::SoftRisk))),
            ("audit_hash", v_str(&audit.audit_hash)),
        ]),
    );
    Ok(audit)
}
