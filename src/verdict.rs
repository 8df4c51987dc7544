//! Moral verdict: fold audit findings and counterfactual efficacy into one
//! ternary legitimacy decision.
//!
//! Rules, in order (escalation stops at the first match, concerns accumulate):
//! 1. any HARD_FAIL            -> BLOCK
//! 2. two or more SOFT_RISK    -> CONDITIONAL
//! 3. CRITICAL counterfactual while still ALLOW -> CONDITIONAL (fragile)
//! 4. otherwise                -> ALLOW

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::audit::{AuditArtifact, FindingVerdict};
use crate::canonical::{canonical_hash, CanonicalError};
use crate::counterfactual::CounterfactualArtifact;
use crate::logging::{log, obj, v_str, Domain, Level};

/// Findings evaluated above which confidence is HIGH.
pub const HIGH_CONFIDENCE_FINDINGS: usize = 3;
pub const SOFT_RISK_ESCALATION: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictState {
    Allow,
    Conditional,
    Block,
}

impl VerdictState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "ALLOW",
            Self::Conditional => "CONDITIONAL",
            Self::Block => "BLOCK",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Confidence {
    High,
    Medium,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictHashes {
    pub audit_hash: String,
    pub counterfactual_delta_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegitimacyVerdict {
    pub season_id: String,
    pub community_id: String,
    pub verdict: VerdictState,
    pub primary_concerns: Vec<String>,
    pub counterfactual_findings: Vec<String>,
    pub confidence: Confidence,
    pub hashes: VerdictHashes,
    pub verdict_hash: String,
    /// Wall-clock signing time; outside the verdict hash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_at_ms: Option<u64>,
}

impl LegitimacyVerdict {
    pub fn compute_hash(&self) -> Result<String, CanonicalError> {
        verdict_hash(
            &self.season_id,
            &self.community_id,
            self.verdict,
            &self.primary_concerns,
        )
    }

    pub fn signed(mut self, now_ms: u64) -> Self {
        self.signed_at_ms = Some(now_ms);
        self
    }
}

fn verdict_hash(
    season_id: &str,
    community_id: &str,
    verdict: VerdictState,
    concerns: &[String],
) -> Result<String, CanonicalError> {
    canonical_hash(&json!({
        "seasonId": season_id,
        "communityId": community_id,
        "verdict": verdict,
        "concerns": concerns,
    }))
}

pub fn resolve_verdict(
    audit: &AuditArtifact,
    counterfactuals: &CounterfactualArtifact,
) -> Result<LegitimacyVerdict, CanonicalError> {
    let mut concerns = Vec::new();
    let mut verdict = VerdictState::Allow;

    let hard: Vec<_> = audit
        .findings
        .iter()
        .filter(|f| f.verdict == FindingVerdict::HardFail)
        .collect();
    let soft: Vec<_> = audit
        .findings
        .iter()
        .filter(|f| f.verdict == FindingVerdict::SoftRisk)
        .collect();

    if !hard.is_empty() {
        verdict = VerdictState::Block;
        concerns.extend(hard.iter().map(|f| f.narrative.clone()));
    }
    if soft.len() >= SOFT_RISK_ESCALATION {
        if verdict == VerdictState::Allow {
            verdict = VerdictState::Conditional;
        }
        concerns.extend(soft.iter().map(|f| f.narrative.clone()));
    }

    let critical: Vec<_> = counterfactuals.critical().collect();
    if verdict == VerdictState::Allow && !critical.is_empty() {
        verdict = VerdictState::Conditional;
        let names: Vec<&str> = critical.iter().map(|r| r.scenario.as_str()).collect();
        concerns.push(format!(
            "outcome is fragile: removing a single protection ({}) changes it critically",
            names.join(", ")
        ));
    }

    let counterfactual_findings = counterfactuals
        .results
        .iter()
        .map(|r| format!("{} [{}]: {}", r.scenario.as_str(), r.efficacy.as_str(), r.narrative))
        .collect();

    let confidence = if audit.findings.len() > HIGH_CONFIDENCE_FINDINGS {
        Confidence::High
    } else {
        Confidence::Medium
    };

    let verdict_hash = verdict_hash(&audit.season_id, &audit.community_id, verdict, &concerns)?;
    log(
        Level::Info,
        Domain::Verdict,
        "verdict",
        obj(&[
            ("season_id", v_str(&audit.season_id)),
            ("community_id", v_str(&audit.community_id)),
            ("verdict", v_str(verdict.as_str())),
            ("concerns", json!(concerns.len())),
            ("verdict_hash", v_str(&verdict_hash)),
        ]),
    );

    Ok(LegitimacyVerdict {
        season_id: audit.season_id.clone(),
        community_id: audit.community_id.clone(),
        verdict,
        primary_concerns: concerns,
        counterfactual_findings,
        confidence,
        hashes: VerdictHashes {
            audit_hash: audit.audit_hash.clone(),
            counterfactual_delta_hash: counterfactuals.delta_hash.clone(),
        },
        verdict_hash,
        signed_at_ms: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditDimension, AuditFinding};
    use crate::counterfactual::{CounterfactualResult, Efficacy, Scenario};
    use std::collections::BTreeSet;

    fn finding(dim: AuditDimension, verdict: FindingVerdict, narrative: &str) -> AuditFinding {
        AuditFinding {
            dimension: dim,
            verdict,
            risk_flags: BTreeSet::new(),
            narrative: narrative.to_string(),
        }
    }

    fn audit(findings: Vec<AuditFinding>) -> AuditArtifact {
        AuditArtifact {
            season_id: "s0".to_string(),
            community_id: "c".to_string(),
            artifact_hash: "o".to_string(),
            findings,
            audit_hash: "a".to_string(),
        }
    }

    fn counterfactuals(efficacy: Efficacy) -> CounterfactualArtifact {
        CounterfactualArtifact {
            season_id: "s0".to_string(),
            community_id: "c".to_string(),
            artifact_hash: "o".to_string(),
            results: vec![CounterfactualResult {
                scenario: Scenario::NoWhaleCaps,
                narrative: "n".to_string(),
                efficacy,
                canonical_max_weight: 0.15,
                counterfactual_max_weight: 0.4,
                distribution_shift: 0.3,
                distribution_hash: "h".to_string(),
            }],
            delta_hash: "d".to_string(),
        }
    }

    fn all_pass() -> Vec<AuditFinding> {
        vec![
            finding(AuditDimension::Concentration, FindingVerdict::Pass, "ok"),
            finding(AuditDimension::Diversity, FindingVerdict::Pass, "ok"),
            finding(AuditDimension::Stewardship, FindingVerdict::Pass, "ok"),
            finding(AuditDimension::JoinRetention, FindingVerdict::Pass, "ok"),
            finding(AuditDimension::SilenceNoise, FindingVerdict::Pass, "ok"),
        ]
    }

    #[test]
    fn test_single_soft_risk_still_allows() {
        let mut f = all_pass();
        f[4] = finding(AuditDimension::SilenceNoise, FindingVerdict::SoftRisk, "bursty");
        let v = resolve_verdict(&audit(f), &counterfactuals(Efficacy::Effective)).unwrap();
        assert_eq!(v.verdict, VerdictState::Allow);
        assert!(v.primary_concerns.is_empty());
        assert_eq!(v.confidence, Confidence::High);
    }

    #[test]
    fn test_two_soft_risks_conditional() {
        let mut f = all_pass();
        f[0] = finding(AuditDimension::Concentration, FindingVerdict::SoftRisk, "caps");
        f[1] = finding(AuditDimension::Diversity, FindingVerdict::SoftRisk, "skew");
        let v = resolve_verdict(&audit(f), &counterfactuals(Efficacy::Marginal)).unwrap();
        assert_eq!(v.verdict, VerdictState::Conditional);
        assert_eq!(v.primary_concerns, vec!["caps".to_string(), "skew".to_string()]);
    }

    #[test]
    fn test_critical_counterfactual_downgrades_allow() {
        let v = resolve_verdict(&audit(all_pass()), &counterfactuals(Efficacy::Critical)).unwrap();
        assert_eq!(v.verdict, VerdictState::Conditional);
        assert_eq!(v.primary_concerns.len(), 1);
        assert!(v.primary_concerns[0].contains("NO_WHALE_CAPS"));
    }

    #[test]
    fn test_block_does_not_add_fragility() {
        let mut f = all_pass();
        f[2] = finding(AuditDimension::Stewardship, FindingVerdict::HardFail, "no stewards");
        let v = resolve_verdict(&audit(f), &counterfactuals(Efficacy::Critical)).unwrap();
        assert_eq!(v.verdict, VerdictState::Block);
        assert_eq!(v.primary_concerns, vec!["no stewards".to_string()]);
    }

    #[test]
    fn test_medium_confidence_with_few_findings() {
        let f = all_pass().into_iter().take(3).collect();
        let v = resolve_verdict(&audit(f), &counterfactuals(Efficacy::Unnecessary)).unwrap();
        assert_eq!(v.confidence, Confidence::Medium);
    }

    #[test]
    fn test_signing_time_outside_hash() {
        let v = resolve_verdict(&audit(all_pass()), &counterfactuals(Efficacy::Marginal)).unwrap();
        let a = v.clone().signed(1);
        let b = v.signed(2);
        assert_eq!(a.verdict_hash, b.verdict_hash);
        assert_eq!(a.compute_hash().unwrap(), a.verdict_hash);
    }
}
