//! Season-0 weight resolver.
//!
//! Converts a window of activity events into normalized, capped recognition
//! weights plus provenance hashes:
//!
//! ```text
//! events ─► filter(window) ─► raw = Σ type_weight · 2^(-age/half_life)
//!        ─► eligible(count >= min_events) ─► saturate(1 - e^(-k·raw))
//!        ─► normalize ─► clamp(max_share) ─► artifact{weights, caps, hashes}
//! ```
//!
//! Every per-actor pass walks a `BTreeMap`, so float summation order is the
//! sorted user-id order and the output hash is reproducible.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::canonical::{canonical_hash, CanonicalError};
use crate::config::{ClampMode, ConfigError, ResolutionConfig};
use crate::events::{select_window, ActivityEvent, EventSource, SourceError, TimeWindow};
use crate::logging::{log, log_provenance, obj, v_num, v_str, Domain, Level, ProfileScope};

pub const SCHEMA_VERSION: &str = "season0.v1";
pub const RUNNER_VERSION: &str = concat!("season0-runner/", env!("CARGO_PKG_VERSION"));

/// Tolerance for `Σ weights == 1`.
pub const SUM_EPSILON: f64 = 1e-9;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
    #[error("weight invariant violated: {msg}")]
    InvariantViolation { msg: String },
    #[error("config hash mismatch: artifact has {expected}, supplied config hashes to {actual}")]
    ConfigMismatch { expected: String, actual: String },
    #[error("artifact {season_id}/{community_id} does not match its own output hash")]
    TamperedArtifact {
        season_id: String,
        community_id: String,
    },
    #[error("run cancelled before fetch")]
    Cancelled,
    #[error("worker task failed: {0}")]
    Worker(String),
}

/// What identifies one resolution run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonRequest {
    pub season_id: String,
    pub community_id: String,
    pub window: TimeWindow,
}

impl SeasonRequest {
    pub fn new(season_id: &str, community_id: &str, window: TimeWindow) -> Self {
        Self {
            season_id: season_id.to_string(),
            community_id: community_id.to_string(),
            window,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapReason {
    /// Above the cap straight after normalization
    MaxShareClamp,
    /// Pushed over the cap by redistributed overflow
    RedistributionClamp,
}

impl CapReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxShareClamp => "MAX_SHARE_CLAMP",
            Self::RedistributionClamp => "REDISTRIBUTION_CLAMP",
        }
    }
}

/// Share before (`raw`) and after (`capped`) the clamp step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapEntry {
    pub raw: f64,
    pub capped: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cap_reason: Option<CapReason>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashBundle {
    pub input_hash: String,
    pub config_hash: String,
    pub output_hash: String,
    pub runner_version: String,
}

/// Counters for humans; not part of the output hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionStats {
    pub events_in_window: usize,
    pub events_counted: usize,
    pub events_dropped_unknown: usize,
    pub actors_seen: usize,
    pub actors_eligible: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeasonArtifact {
    pub season_id: String,
    pub community_id: String,
    pub window: TimeWindow,
    pub schema_version: String,
    pub resolved_weights: BTreeMap<String, f64>,
    pub caps_applied: BTreeMap<String, CapEntry>,
    pub hashes: HashBundle,
    pub notes: Vec<String>,
    #[serde(default)]
    pub stats: ResolutionStats,
}

#[derive(Serialize)]
struct OutputProjection<'a> {
    season_id: &'a str,
    community_id: &'a str,
    window: &'a TimeWindow,
    schema_version: &'a str,
    resolved_weights: &'a BTreeMap<String, f64>,
    caps_applied: &'a BTreeMap<String, CapEntry>,
}

impl SeasonArtifact {
    /// Hash over weights, caps, window and ids. Notes, stats and wall-clock
    /// time are deliberately outside it.
    pub fn compute_output_hash(&self) -> Result<String, CanonicalError> {
        canonical_hash(&OutputProjection {
            season_id: &self.season_id,
            community_id: &self.community_id,
            window: &self.window,
            schema_version: &self.schema_version,
            resolved_weights: &self.resolved_weights,
            caps_applied: &self.caps_applied,
        })
    }

    pub fn verify_output_hash(&self) -> bool {
        self.compute_output_hash()
            .map(|h| h == self.hashes.output_hash)
            .unwrap_or(false)
    }

    pub fn max_weight(&self) -> f64 {
        self.resolved_weights.values().copied().fold(0.0, f64::max)
    }

    /// Actors whose share the clamp step changed.
    pub fn clamped_count(&self) -> usize {
        self.caps_applied
            .values()
            .filter(|c| c.cap_reason.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.resolved_weights.is_empty()
    }
}

// =============================================================================
// Hashing helpers
// =============================================================================

#[derive(Serialize, PartialEq, Eq, PartialOrd, Ord)]
struct EventProjection<'a> {
    ts: u64,
    id: &'a str,
    actor_id: &'a str,
    event_type: &'a str,
    target_id: Option<&'a str>,
}

fn project(e: &ActivityEvent) -> EventProjection<'_> {
    EventProjection {
        ts: e.ts,
        id: &e.id,
        actor_id: &e.actor_id,
        event_type: e.event_type.as_str(),
        target_id: e.target_id.as_deref(),
    }
}

/// Hash of the stable event projection, independent of source order.
pub fn input_hash(events: &[&ActivityEvent]) -> Result<String, CanonicalError> {
    let mut projected: Vec<EventProjection<'_>> = events.iter().map(|e| project(e)).collect();
    projected.sort();
    canonical_hash(&projected)
}

pub fn config_hash(config: &ResolutionConfig) -> Result<String, CanonicalError> {
    canonical_hash(config)
}

// =============================================================================
// Numeric steps
// =============================================================================

/// `2^(-(window_end - ts) / half_life)`; no decay when `half_life <= 0`.
pub fn decay_multiplier(ts: u64, window_end_ms: u64, half_life_ms: f64) -> f64 {
    if half_life_ms <= 0.0 {
        return 1.0;
    }
    let age = window_end_ms.saturating_sub(ts) as f64;
    (-age / half_life_ms).exp2().max(0.0)
}

/// `1 - e^(-k·raw)`, computed through `exp_m1` so small inputs keep precision.
pub fn saturate(raw: f64, k: f64) -> f64 {
    -(-k * raw).exp_m1()
}

/// Result of the clamp-and-redistribute step.
#[derive(Debug, Clone, Default)]
pub struct ClampOutcome {
    pub weights: BTreeMap<String, f64>,
    pub caps: BTreeMap<String, CapEntry>,
    pub notes: Vec<String>,
}

fn caps_from(
    normalized: &BTreeMap<String, f64>,
    weights: &BTreeMap<String, f64>,
    reasons: &BTreeMap<String, CapReason>,
) -> BTreeMap<String, CapEntry> {
    normalized
        .iter()
        .map(|(user, raw)| {
            let capped = weights.get(user).copied().unwrap_or(0.0);
            (
                user.clone(),
                CapEntry {
                    raw: *raw,
                    capped,
                    cap_reason: reasons.get(user).copied(),
                },
            )
        })
        .collect()
}

/// Pin every actor above the cap and rescale the free actors into the
/// remaining mass, repeating until no free actor exceeds the cap.
///
/// Proportionality among free actors is preserved. When the cap cannot be
/// met (`n · cap < 1`) every actor gets `1/n`.
pub fn clamp_converge(normalized: &BTreeMap<String, f64>, max_share: f64) -> ClampOutcome {
    let n = normalized.len();
    let mut reasons: BTreeMap<String, CapReason> = BTreeMap::new();
    let mut weights: BTreeMap<String, f64> = BTreeMap::new();
    let mut notes = Vec::new();
    if n == 0 {
        return ClampOutcome::default();
    }

    if (n as f64) * max_share < 1.0 {
        let equal = 1.0 / n as f64;
        for (user, w) in normalized {
            if *w > max_share {
                reasons.insert(user.clone(), CapReason::MaxShareClamp);
            }
            weights.insert(user.clone(), equal);
        }
        notes.push(format!(
            "max_share {} unattainable with {} eligible actors; equal split {:.6} applied",
            max_share, n, equal
        ));
        let caps = caps_from(normalized, &weights, &reasons);
        return ClampOutcome {
            weights,
            caps,
            notes,
        };
    }

    let mut round = 0usize;
    loop {
        let free: Vec<(&String, f64)> = normalized
            .iter()
            .filter(|(u, _)| !reasons.contains_key(*u))
            .map(|(u, w)| (u, *w))
            .collect();
        let free_mass = (1.0 - reasons.len() as f64 * max_share).max(0.0);
        let free_total: f64 = free.iter().map(|(_, w)| *w).sum();

        let candidates: Vec<(&String, f64)> = free
            .iter()
            .map(|(u, w)| {
                let share = if free_total > 0.0 {
                    w * free_mass / free_total
                } else {
                    free_mass / free.len() as f64
                };
                (*u, share)
            })
            .collect();

        let over: Vec<&String> = candidates
            .iter()
            .filter(|(_, share)| *share > max_share)
            .map(|(u, _)| *u)
            .collect();

        if over.is_empty() {
            for (u, share) in candidates {
                weights.insert(u.clone(), share);
            }
            break;
        }

        let reason = if round == 0 {
            CapReason::MaxShareClamp
        } else {
            CapReason::RedistributionClamp
        };
        for u in over {
            reasons.insert(u.clone(), reason);
        }
        round += 1;
    }

    for u in reasons.keys() {
        weights.insert(u.clone(), max_share);
    }
    if round > 1 {
        notes.push(format!("clamp converged after {} rounds", round));
    }

    let caps = caps_from(normalized, &weights, &reasons);
    ClampOutcome {
        weights,
        caps,
        notes,
    }
}

/// One clamp, one proportional redistribution among under-cap actors, one
/// re-clamp, one renormalize. Not guaranteed to leave everyone under the cap.
pub fn clamp_single_pass(normalized: &BTreeMap<String, f64>, max_share: f64) -> ClampOutcome {
    let mut weights = normalized.clone();
    let mut reasons: BTreeMap<String, CapReason> = BTreeMap::new();
    let mut notes = Vec::new();

    let mut overflow = 0.0;
    for (user, w) in weights.iter_mut() {
        if *w > max_share {
            overflow += *w - max_share;
            *w = max_share;
            reasons.insert(user.clone(), CapReason::MaxShareClamp);
        }
    }

    let under_total: f64 = weights
        .iter()
        .filter(|(u, w)| !reasons.contains_key(*u) && **w < max_share)
        .map(|(_, w)| *w)
        .sum();

    if overflow > 0.0 && under_total > 0.0 {
        for (user, w) in weights.iter_mut() {
            if reasons.contains_key(user) || *w >= max_share {
                continue;
            }
            *w += overflow * (*w / under_total);
            if *w > max_share {
                *w = max_share;
                reasons.insert(user.clone(), CapReason::RedistributionClamp);
            }
        }
    }

    let total: f64 = weights.values().sum();
    if total > 0.0 {
        for w in weights.values_mut() {
            *w /= total;
        }
    }

    let above = weights.values().filter(|w| **w > max_share).count();
    if above > 0 {
        notes.push(format!(
            "single-pass clamp left {} actors above max_share {}",
            above, max_share
        ));
    }

    let caps = caps_from(normalized, &weights, &reasons);
    ClampOutcome {
        weights,
        caps,
        notes,
    }
}

/// Finite, inside [0, 1], summing to 1.
pub fn check_weight_invariants(weights: &BTreeMap<String, f64>) -> Result<(), ResolveError> {
    if weights.is_empty() {
        return Ok(());
    }
    for (user, w) in weights {
        if !w.is_finite() || *w < 0.0 || *w > 1.0 {
            return Err(ResolveError::InvariantViolation {
                msg: format!("weight for {} is {}", user, w),
            });
        }
    }
    let sum: f64 = weights.values().sum();
    if (sum - 1.0).abs() > SUM_EPSILON {
        return Err(ResolveError::InvariantViolation {
            msg: format!("weights sum to {}", sum),
        });
    }
    Ok(())
}

// =============================================================================
// Resolution
// =============================================================================

/// Pure resolution over an already-fetched event set.
///
/// Events outside the request's community or window are ignored, so the
/// result does not depend on how carefully the source filtered.
pub fn resolve_events(
    request: &SeasonRequest,
    events: &[ActivityEvent],
    config: &ResolutionConfig,
) -> Result<SeasonArtifact, ResolveError> {
    config.validate()?;
    let _scope = ProfileScope::with_context(
        "resolve_events",
        &[("community_id", v_str(&request.community_id))],
    );

    let mut in_window = select_window(events, &request.community_id, request.window);
    in_window.sort_by(|a, b| project(a).cmp(&project(b)));

    let input_hash = input_hash(&in_window)?;
    let config_hash = config_hash(config)?;

    let mut stats = ResolutionStats {
        events_in_window: in_window.len(),
        ..Default::default()
    };
    let mut raw_scores: BTreeMap<&str, f64> = BTreeMap::new();
    let mut event_counts: BTreeMap<&str, u32> = BTreeMap::new();

    for e in &in_window {
        let weight = match config.weight_for(&e.event_type) {
            Some(w) => w,
            None if config.drop_unknown_types => {
                stats.events_dropped_unknown += 1;
                continue;
            }
            None => 0.0,
        };
        let decay = decay_multiplier(e.ts, request.window.end_ms, config.half_life_ms);
        *raw_scores.entry(e.actor_id.as_str()).or_insert(0.0) += weight * decay;
        *event_counts.entry(e.actor_id.as_str()).or_insert(0) += 1;
        stats.events_counted += 1;
    }
    stats.actors_seen = event_counts.len();

    let saturated: BTreeMap<String, f64> = raw_scores
        .iter()
        .filter(|(actor, _)| event_counts.get(*actor).copied().unwrap_or(0) >= config.min_events)
        .map(|(actor, raw)| (actor.to_string(), saturate(*raw, config.saturation_k)))
        .collect();
    stats.actors_eligible = saturated.len();

    let mut notes = Vec::new();
    if stats.events_dropped_unknown > 0 {
        notes.push(format!(
            "{} events with unweighted types dropped",
            stats.events_dropped_unknown
        ));
    }
    let ineligible = stats.actors_seen - stats.actors_eligible;
    if ineligible > 0 {
        notes.push(format!(
            "{} actors below min_events {}",
            ineligible, config.min_events
        ));
    }

    let total: f64 = saturated.values().sum();
    let clamp = if total > 0.0 && total.is_finite() {
        let normalized: BTreeMap<String, f64> = saturated
            .iter()
            .map(|(u, s)| (u.clone(), s / total))
            .collect();
        match config.clamp_mode {
            ClampMode::Converge => clamp_converge(&normalized, config.max_share),
            ClampMode::SinglePass => clamp_single_pass(&normalized, config.max_share),
        }
    } else if stats.actors_eligible == 0 {
        notes.push("no eligible actors in window; weights empty".to_string());
        ClampOutcome::default()
    } else {
        notes.push(format!(
            "{} eligible actors carry zero weighted mass after decay; weights empty",
            stats.actors_eligible
        ));
        ClampOutcome::default()
    };

    check_weight_invariants(&clamp.weights)?;
    notes.extend(clamp.notes);

    let mut artifact = SeasonArtifact {
        season_id: request.season_id.clone(),
        community_id: request.community_id.clone(),
        window: request.window,
        schema_version: SCHEMA_VERSION.to_string(),
        resolved_weights: clamp.weights,
        caps_applied: clamp.caps,
        hashes: HashBundle {
            input_hash,
            config_hash,
            output_hash: String::new(),
            runner_version: RUNNER_VERSION.to_string(),
        },
        notes,
        stats,
    };
    let clamped = artifact.clamped_count();
    if clamped > 0 {
        artifact
            .notes
            .push(format!("{} actors clamped at max_share {}", clamped, config.max_share));
    }
    artifact.hashes.output_hash = artifact.compute_output_hash()?;

    log(
        Level::Info,
        Domain::Resolver,
        "resolved",
        obj(&[
            ("season_id", v_str(&artifact.season_id)),
            ("community_id", v_str(&artifact.community_id)),
            ("events", json!(artifact.stats.events_in_window)),
            ("eligible", json!(artifact.stats.actors_eligible)),
            ("clamped", json!(clamped)),
            ("max_weight", v_num(artifact.max_weight())),
        ]),
    );
    Ok(artifact)
}

/// Fetch the request's window from a source.
pub async fn fetch_window(
    request: &SeasonRequest,
    source: &dyn EventSource,
) -> Result<Vec<ActivityEvent>, ResolveError> {
    let events = source
        .list(
            &request.community_id,
            request.window.start_ms,
            request.window.end_ms,
        )
        .await?;
    log(
        Level::Debug,
        Domain::Source,
        "fetched",
        obj(&[
            ("community_id", v_str(&request.community_id)),
            ("count", json!(events.len())),
        ]),
    );
    Ok(events)
}

/// Fetch from the source, then resolve. The fetch is the only await point.
pub async fn run_season(
    request: &SeasonRequest,
    source: &dyn EventSource,
    config: &ResolutionConfig,
) -> Result<SeasonArtifact, ResolveError> {
    config.validate()?;
    let events = fetch_window(request, source).await?;
    let artifact = resolve_events(request, &events, config)?;
    log_provenance(
        &artifact.season_id,
        &artifact.community_id,
        &artifact.hashes.input_hash,
        &artifact.hashes.config_hash,
        &artifact.hashes.output_hash,
    );
    Ok(artifact)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shares(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(u, w)| (u.to_string(), *w)).collect()
    }

    #[test]
    fn test_decay_halves_at_half_life() {
        let m = decay_multiplier(0, 1000, 1000.0);
        assert!((m - 0.5).abs() < 1e-12);
        assert_eq!(decay_multiplier(0, 1000, 0.0), 1.0);
        assert_eq!(decay_multiplier(0, 1000, -5.0), 1.0);
    }

    #[test]
    fn test_saturate_is_concave_and_bounded() {
        let k = 0.5;
        assert_eq!(saturate(0.0, k), 0.0);
        let a = saturate(1.0, k);
        let b = saturate(2.0, k);
        let c = saturate(3.0, k);
        assert!(a < b && b < c && c < 1.0);
        assert!(b - a > c - b);
    }

    #[test]
    fn test_converge_single_whale() {
        let mut pairs = vec![("whale".to_string(), 0.9)];
        for i in 0..10 {
            pairs.push((format!("u{:02}", i), 0.01));
        }
        let normalized: BTreeMap<String, f64> = pairs.into_iter().collect();
        let out = clamp_converge(&normalized, 0.15);
        assert_eq!(out.weights["whale"], 0.15);
        assert_eq!(out.caps["whale"].cap_reason, Some(CapReason::MaxShareClamp));
        let sum: f64 = out.weights.values().sum();
        assert!((sum - 1.0).abs() < SUM_EPSILON);
        assert!(out.weights.values().all(|w| *w <= 0.15));
    }

    #[test]
    fn test_converge_records_redistribution_clamp() {
        // b is under the cap at first but crosses it once a's overflow lands
        let normalized = shares(&[("a", 0.6), ("b", 0.2), ("c", 0.1), ("d", 0.1)]);
        let out = clamp_converge(&normalized, 0.3);
        assert_eq!(out.caps["a"].cap_reason, Some(CapReason::MaxShareClamp));
        assert_eq!(out.caps["b"].cap_reason, Some(CapReason::RedistributionClamp));
        assert_eq!(out.weights["a"], 0.3);
        assert_eq!(out.weights["b"], 0.3);
        assert!((out.weights["c"] - 0.2).abs() < 1e-12);
        assert!((out.weights["d"] - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_converge_infeasible_cap_splits_equally() {
        let normalized = shares(&[("a", 0.7), ("b", 0.3)]);
        let out = clamp_converge(&normalized, 0.15);
        assert_eq!(out.weights["a"], 0.5);
        assert_eq!(out.weights["b"], 0.5);
        assert_eq!(out.notes.len(), 1);
    }

    #[test]
    fn test_single_pass_can_overshoot_after_renormalize() {
        let normalized = shares(&[("a", 0.6), ("b", 0.2), ("c", 0.1), ("d", 0.1)]);
        let out = clamp_single_pass(&normalized, 0.3);
        let sum: f64 = out.weights.values().sum();
        assert!((sum - 1.0).abs() < SUM_EPSILON);
        assert_eq!(out.caps["b"].cap_reason, Some(CapReason::RedistributionClamp));
        // overflow lost at the re-clamp is restored by renormalization
        assert!(out.weights["a"] > 0.3);
        assert!(!out.notes.is_empty());
    }

    fn comments(actors: usize, ts: u64) -> Vec<ActivityEvent> {
        (0..actors * 3)
            .map(|i| ActivityEvent {
                id: format!("e{}", i),
                community_id: "c".to_string(),
                actor_id: format!("u{}", i % actors),
                event_type: crate::events::EventType::Comment,
                target_id: None,
                ts,
            })
            .collect()
    }

    #[test]
    fn test_empty_notes_distinguish_no_actors_from_decayed_mass() {
        let cfg = ResolutionConfig::season0_default();
        let empty = resolve_events(
            &SeasonRequest::new("s0", "c", TimeWindow::new(0, 1_000)),
            &[],
            &cfg,
        )
        .unwrap();
        assert!(empty.notes.iter().any(|n| n.contains("no eligible actors")));

        // an unbounded window end ages every event to zero decay
        let decayed = resolve_events(
            &SeasonRequest::new("s0", "c", TimeWindow::new(0, u64::MAX)),
            &comments(10, 1_700_000_000_000),
            &cfg,
        )
        .unwrap();
        assert!(decayed.is_empty());
        assert_eq!(decayed.stats.actors_eligible, 10);
        assert!(decayed
            .notes
            .iter()
            .any(|n| n.contains("10 eligible actors carry zero weighted mass")));
    }

    #[test]
    fn test_invariant_check_rejects_nan() {
        let w = shares(&[("a", f64::NAN)]);
        assert!(check_weight_invariants(&w).is_err());
        let w = shares(&[("a", 0.4), ("b", 0.4)]);
        assert!(check_weight_invariants(&w).is_err());
    }
}
