//! Resolver properties: determinism, normalization, caps, decay and window
//! handling, checked against realistic and randomized event sets.

use legitimacy_engine::config::{ClampMode, ResolutionConfig};
use legitimacy_engine::events::{ActivityEvent, EventType, InMemoryEventSource, TimeWindow};
use legitimacy_engine::resolver::{
    decay_multiplier, resolve_events, run_season, CapReason, SeasonArtifact, SeasonRequest,
    SUM_EPSILON,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

const DAY: u64 = 86_400_000;

fn evt(id: &str, actor: &str, event_type: EventType, ts: u64) -> ActivityEvent {
    ActivityEvent {
        id: id.to_string(),
        community_id: "c1".to_string(),
        actor_id: actor.to_string(),
        event_type,
        target_id: None,
        ts,
    }
}

fn request() -> SeasonRequest {
    SeasonRequest::new("season-0", "c1", TimeWindow::new(0, 30 * DAY))
}

fn random_events(rng: &mut StdRng, actors: usize, n: usize) -> Vec<ActivityEvent> {
    (0..n)
        .map(|i| {
            // actor 0 is a whale taking roughly half the traffic
            let actor = if rng.gen_bool(0.5) {
                0
            } else {
                rng.gen_range(0..actors)
            };
            let t = EventType::KNOWN[rng.gen_range(0..EventType::KNOWN.len())].clone();
            evt(
                &format!("e{}", i),
                &format!("u{:03}", actor),
                t,
                rng.gen_range(0..30 * DAY),
            )
        })
        .collect()
}

fn assert_normalized(a: &SeasonArtifact) {
    if a.is_empty() {
        return;
    }
    let sum: f64 = a.resolved_weights.values().sum();
    assert!((sum - 1.0).abs() < SUM_EPSILON, "sum {} for {:?}", sum, a.notes);
    for w in a.resolved_weights.values() {
        assert!(w.is_finite() && *w >= 0.0);
    }
}

#[test]
fn identical_inputs_produce_identical_artifacts() {
    let mut rng = StdRng::seed_from_u64(7);
    let events = random_events(&mut rng, 20, 400);
    let cfg = ResolutionConfig::season0_default();
    let a = resolve_events(&request(), &events, &cfg).unwrap();
    let b = resolve_events(&request(), &events, &cfg).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.hashes.output_hash.len(), 64);
    assert!(a.verify_output_hash());
}

#[test]
fn event_order_does_not_matter() {
    let mut rng = StdRng::seed_from_u64(11);
    let events = random_events(&mut rng, 15, 300);
    let mut shuffled = events.clone();
    shuffled.shuffle(&mut rng);
    let cfg = ResolutionConfig::season0_default();
    let a = resolve_events(&request(), &events, &cfg).unwrap();
    let b = resolve_events(&request(), &shuffled, &cfg).unwrap();
    assert_eq!(a.hashes.input_hash, b.hashes.input_hash);
    assert_eq!(a.hashes.output_hash, b.hashes.output_hash);
}

#[test]
fn randomized_sweep_stays_normalized_and_capped() {
    let cfg = ResolutionConfig::season0_default();
    for seed in 0..40 {
        let mut rng = StdRng::seed_from_u64(seed);
        let actors = rng.gen_range(2..60);
        let n = rng.gen_range(0..600);
        let events = random_events(&mut rng, actors, n);
        let a = resolve_events(&request(), &events, &cfg).unwrap();
        assert_normalized(&a);

        let eligible = a.resolved_weights.len() as f64;
        if eligible * cfg.max_share >= 1.0 {
            for (u, w) in &a.resolved_weights {
                assert!(
                    *w <= cfg.max_share + 1e-12,
                    "seed {}: {} has {} over cap",
                    seed,
                    u,
                    w
                );
            }
        }
        assert_eq!(a.caps_applied.len(), a.resolved_weights.len());
    }
}

#[test]
fn single_pass_mode_is_still_normalized() {
    let cfg = ResolutionConfig {
        clamp_mode: ClampMode::SinglePass,
        ..ResolutionConfig::season0_default()
    };
    for seed in 100..120 {
        let mut rng = StdRng::seed_from_u64(seed);
        let events = random_events(&mut rng, 30, 400);
        assert_normalized(&resolve_events(&request(), &events, &cfg).unwrap());
    }
}

#[test]
fn clamp_mode_changes_config_hash() {
    let converge = ResolutionConfig::season0_default();
    let single = ResolutionConfig {
        clamp_mode: ClampMode::SinglePass,
        ..converge.clone()
    };
    let events = vec![evt("e", "u", EventType::Comment, 5)];
    let a = resolve_events(&request(), &events, &converge).unwrap();
    let b = resolve_events(&request(), &events, &single).unwrap();
    assert_ne!(a.hashes.config_hash, b.hashes.config_hash);
}

#[test]
fn empty_window_yields_empty_weights_with_a_note() {
    let cfg = ResolutionConfig::season0_default();
    let a = resolve_events(&request(), &[], &cfg).unwrap();
    assert!(a.resolved_weights.is_empty());
    assert!(a.caps_applied.is_empty());
    assert!(!a.notes.is_empty());
    assert_eq!(a.hashes.input_hash.len(), 64);
    assert!(a.verify_output_hash());
}

#[test]
fn events_outside_window_or_community_are_ignored() {
    let cfg = ResolutionConfig::season0_default();
    let mut events: Vec<_> = (0..30)
        .map(|i| evt(&format!("e{}", i), &format!("u{}", i % 10), EventType::Comment, i * DAY))
        .collect();
    let base = resolve_events(&request(), &events, &cfg).unwrap();

    // end of the window is exclusive
    events.push(evt("late", "u1", EventType::GovernanceProposal, 30 * DAY));
    let mut foreign = evt("foreign", "u1", EventType::GovernanceProposal, DAY);
    foreign.community_id = "c2".to_string();
    events.push(foreign);

    let again = resolve_events(&request(), &events, &cfg).unwrap();
    assert_eq!(base.hashes.input_hash, again.hashes.input_hash);
    assert_eq!(base.hashes.output_hash, again.hashes.output_hash);
}

#[test]
fn older_activity_weighs_less() {
    let cfg = ResolutionConfig {
        max_share: 1.0,
        ..ResolutionConfig::season0_default()
    };
    let end = 30 * DAY;
    let mut events = Vec::new();
    for i in 0..3 {
        events.push(evt(&format!("old{}", i), "old", EventType::Comment, i));
        events.push(evt(&format!("new{}", i), "new", EventType::Comment, end - 1 - i));
    }
    let a = resolve_events(&request(), &events, &cfg).unwrap();
    assert!(a.resolved_weights["new"] > a.resolved_weights["old"]);
}

#[test]
fn single_whale_is_clamped_to_max_share() {
    let cfg = ResolutionConfig::season0_default();
    let mut events = Vec::new();
    for i in 0..200 {
        events.push(evt(&format!("w{}", i), "whale", EventType::Comment, DAY + i));
    }
    for u in 0..10 {
        for i in 0..3 {
            events.push(evt(
                &format!("u{}-{}", u, i),
                &format!("user{:02}", u),
                EventType::Upvote,
                2 * DAY + i,
            ));
        }
    }
    let a = resolve_events(&request(), &events, &cfg).unwrap();
    assert!((a.resolved_weights["whale"] - cfg.max_share).abs() < 1e-12);
    assert_eq!(
        a.caps_applied["whale"].cap_reason,
        Some(CapReason::MaxShareClamp)
    );
    assert!(a.caps_applied["whale"].raw > cfg.max_share);
    assert_normalized(&a);
    assert!(a.notes.iter().any(|n| n.contains("clamped")));
}

#[test]
fn whale_with_ninety_percent_of_raw_mass_gets_exactly_the_cap() {
    let cfg = ResolutionConfig {
        min_events: 1,
        ..ResolutionConfig::season0_default()
    };
    let mut events = Vec::new();
    for i in 0..90 {
        events.push(evt(&format!("w{}", i), "whale", EventType::Upvote, 29 * DAY + i));
    }
    for u in 0..10 {
        events.push(evt(&format!("s{}", u), &format!("small{}", u), EventType::Upvote, 29 * DAY));
    }
    let a = resolve_events(&request(), &events, &cfg).unwrap();
    assert!((a.resolved_weights["whale"] - 0.15).abs() < SUM_EPSILON);
    assert_eq!(
        a.caps_applied["whale"].cap_reason,
        Some(CapReason::MaxShareClamp)
    );
    assert_normalized(&a);
}

#[test]
fn decay_is_strictly_monotonic_towards_window_end() {
    let end = 30 * DAY;
    let half_life = 14.0 * DAY as f64;
    let mut last = 0.0;
    for ts in [0, DAY, 10 * DAY, 20 * DAY, end - 1] {
        let m = decay_multiplier(ts, end, half_life);
        assert!(m > last, "decay at {} not above previous", ts);
        assert!(m <= 1.0);
        last = m;
    }
}

#[test]
fn config_and_input_hashes_move_independently() {
    let cfg = ResolutionConfig::season0_default();
    let events: Vec<_> = (0..12)
        .map(|i| evt(&format!("e{}", i), &format!("u{}", i % 4), EventType::Comment, i * DAY))
        .collect();
    let base = resolve_events(&request(), &events, &cfg).unwrap();

    let tweaked = ResolutionConfig {
        half_life_ms: cfg.half_life_ms * 2.0,
        ..cfg.clone()
    };
    let a = resolve_events(&request(), &events, &tweaked).unwrap();
    assert_ne!(a.hashes.config_hash, base.hashes.config_hash);
    assert_eq!(a.hashes.input_hash, base.hashes.input_hash);

    let mut moved = events.clone();
    moved[0].ts += 1;
    let b = resolve_events(&request(), &moved, &cfg).unwrap();
    assert_ne!(b.hashes.input_hash, base.hashes.input_hash);
    assert_eq!(b.hashes.config_hash, base.hashes.config_hash);
}

#[test]
fn min_events_gates_eligibility() {
    let cfg = ResolutionConfig {
        max_share: 1.0,
        ..ResolutionConfig::season0_default()
    };
    let events = vec![
        evt("a1", "active", EventType::Comment, 1),
        evt("a2", "active", EventType::Comment, 2),
        evt("a3", "active", EventType::Comment, 3),
        evt("l1", "lurker", EventType::GovernanceProposal, 4),
        evt("l2", "lurker", EventType::GovernanceProposal, 5),
    ];
    let a = resolve_events(&request(), &events, &cfg).unwrap();
    assert_eq!(a.resolved_weights.len(), 1);
    assert!((a.resolved_weights["active"] - 1.0).abs() < 1e-12);
    assert_eq!(a.stats.actors_seen, 2);
    assert_eq!(a.stats.actors_eligible, 1);
}

#[test]
fn unknown_types_are_dropped_and_counted() {
    let cfg = ResolutionConfig::season0_default();
    let mut events: Vec<_> = (0..3)
        .map(|i| evt(&format!("c{}", i), "u", EventType::Comment, i))
        .collect();
    events.push(evt("r", "u", EventType::Other("REACTION".to_string()), 10));
    let a = resolve_events(&request(), &events, &cfg).unwrap();
    assert_eq!(a.stats.events_in_window, 4);
    assert_eq!(a.stats.events_dropped_unknown, 1);
    assert_eq!(a.stats.events_counted, 3);
}

#[test]
fn invalid_config_is_rejected_before_resolution() {
    let cfg = ResolutionConfig {
        saturation_k: 0.0,
        ..ResolutionConfig::season0_default()
    };
    assert!(resolve_events(&request(), &[], &cfg).is_err());
}

#[tokio::test]
async fn run_season_matches_pure_resolution() {
    let mut rng = StdRng::seed_from_u64(3);
    let events = random_events(&mut rng, 12, 200);
    let cfg = ResolutionConfig::season0_default();
    let source = InMemoryEventSource::new(events.clone());
    let fetched = run_season(&request(), &source, &cfg).await.unwrap();
    let pure = resolve_events(&request(), &events, &cfg).unwrap();
    assert_eq!(fetched.hashes, pure.hashes);
    assert_eq!(fetched.resolved_weights, pure.resolved_weights);
}
