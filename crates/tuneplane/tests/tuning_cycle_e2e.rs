//! End-to-end control-loop cycle: router decision -> canary apply ->
//! evidence accumulation -> persistence, against real tempdir stores.

use std::collections::BTreeMap;

use tempfile::TempDir;
use tuneplane::baseline::{compute_baseline_signature, numeric_snapshot, MetricsSnapshot};
use tuneplane::canary::{AppliedState, CanaryPhase, CanaryRunner, CancelToken};
use tuneplane::config::TuningPolicy;
use tuneplane::effect_store::EffectStore;
use tuneplane::envelope::{KnobKind, KnobSpec, KnobValue, TuningEnvelope};
use tuneplane::gating::{CapabilityRegistry, CooldownStore, StabilizationTracker};
use tuneplane::ir::{TuningIR, TuningMode};
use tuneplane::ledger::{read_all, verify_chain, FileLedger};
use tuneplane::optimizer::MetricDirection;
use tuneplane::router::{RouterStores, TuningPlaneRouter};

fn envelope() -> TuningEnvelope {
    TuningEnvelope::new("cache").with_knob(KnobSpec {
        name: "workers".to_string(),
        kind: KnobKind::Int,
        min: Some(1.0),
        max: Some(16.0),
        domain: Vec::new(),
        default: KnobValue::Int(4),
        hot_apply: true,
        required_capability: None,
        stabilization_cycles: 0,
    })
}

fn envelopes() -> BTreeMap<String, TuningEnvelope> {
    let mut map = BTreeMap::new();
    map.insert("cache".to_string(), envelope());
    map
}

fn snapshot(latency: f64) -> MetricsSnapshot {
    numeric_snapshot(&[
        ("queue_depth", 5.0),
        ("latency_ms", latency),
        ("error_rate", 0.01),
    ])
}

#[test]
fn full_cycle_decides_applies_and_persists() {
    let dir = TempDir::new().expect("tempdir");
    let effects_path = dir.path().join("effects.json");

    // Seed evidence: workers=16 reliably improves latency in this bucket.
    let mut effects = EffectStore::new();
    let baseline = compute_baseline_signature(&snapshot(100.0));
    for _ in 0..5 {
        effects.record_sample(
            "cache",
            "workers",
            &KnobValue::Int(16),
            &baseline,
            "latency_ms",
            -10.0,
        );
    }

    // Router cycle.
    let mut router = TuningPlaneRouter::new(
        TuningPolicy::default(),
        "latency_ms",
        MetricDirection::LowerIsBetter,
    );
    let cooldowns = CooldownStore::new();
    let stores = RouterStores {
        effect_store: &effects,
        cooldowns: &cooldowns,
        safe_sets: None,
        overlay: None,
        now_idx: 0,
    };
    let bundle = router
        .build_tuning_plane_bundle("cycle-1", &snapshot(100.0), &envelopes(), &stores)
        .expect("bundle");
    let selected = bundle.portfolio["cache"].applied.clone();
    assert_eq!(selected["workers"], KnobValue::Int(16));

    // Canary-apply the router's selection.
    let mut ledger = FileLedger::open(dir.path()).expect("open ledger");
    let capabilities = CapabilityRegistry::new();
    let mut stabilization = StabilizationTracker::new();
    let mut state = AppliedState::new();
    let policy = TuningPolicy::default();
    let ir = TuningIR::new(
        "cycle-1",
        TuningMode::AppliedTune,
        "cache",
        "node-a",
        selected,
        vec!["exploit".to_string()],
        "",
    )
    .expect("ir");
    let mut metrics = || Some(snapshot(88.0));
    let outcome = {
        let mut runner = CanaryRunner {
            policy: &policy.canary,
            capabilities: &capabilities,
            stabilization: &mut stabilization,
            state: &mut state,
            effects: &mut effects,
            ledger: &mut ledger,
        };
        runner
            .run(
                &ir,
                &envelope(),
                &baseline,
                "latency_ms",
                MetricDirection::LowerIsBetter,
                &mut metrics,
                &CancelToken::new(),
            )
            .expect("canary")
    };
    assert_eq!(outcome.phase, CanaryPhase::Committed);
    assert_eq!(
        state.current("cache", "workers", &envelope()),
        Some(KnobValue::Int(16))
    );

    // Evidence accumulated during observation.
    let stats = effects
        .get_effect_stats(
            "cache",
            "workers",
            &KnobValue::Int(16),
            &baseline,
            "latency_ms",
        )
        .expect("stats");
    assert_eq!(stats.n, 6);

    // Persist and reload both stores; the chain must verify.
    effects.save(&effects_path).expect("save effects");
    let reloaded = EffectStore::load(&effects_path);
    assert_eq!(reloaded, effects);

    let entries = read_all(dir.path()).expect("read ledger");
    assert!(!entries.is_empty());
    verify_chain(&entries).expect("chain verifies");
    assert!(entries.iter().any(|e| e.entry_type == "tuning_applied"));
}

#[test]
fn twelve_consecutive_executions_produce_identical_bundle_hashes() {
    // Fresh state per run; identical inputs end to end.
    let run = || {
        let mut effects = EffectStore::new();
        let baseline = compute_baseline_signature(&snapshot(100.0));
        for _ in 0..5 {
            effects.record_sample(
                "cache",
                "workers",
                &KnobValue::Int(16),
                &baseline,
                "latency_ms",
                -10.0,
            );
        }
        let cooldowns = CooldownStore::new();
        let mut router = TuningPlaneRouter::new(
            TuningPolicy::default(),
            "latency_ms",
            MetricDirection::LowerIsBetter,
        );
        let stores = RouterStores {
            effect_store: &effects,
            cooldowns: &cooldowns,
            safe_sets: None,
            overlay: None,
            now_idx: 0,
        };
        router
            .build_tuning_plane_bundle("cycle-1", &snapshot(100.0), &envelopes(), &stores)
            .expect("bundle")
            .bundle_hash
    };
    let first = run();
    for i in 1..12 {
        assert_eq!(run(), first, "run {i} diverged");
    }
}

#[test]
fn drift_breaker_emits_do_nothing_bundle_but_ages_stabilization() {
    let mut router = TuningPlaneRouter::new(
        TuningPolicy::default(),
        "latency_ms",
        MetricDirection::LowerIsBetter,
    );
    router.stabilization_mut().note_change("cache", "workers");
    let effects = EffectStore::new();
    let cooldowns = CooldownStore::new();
    let stores = RouterStores {
        effect_store: &effects,
        cooldowns: &cooldowns,
        safe_sets: None,
        overlay: None,
        now_idx: 0,
    };
    router
        .build_tuning_plane_bundle("cycle-1", &snapshot(100.0), &envelopes(), &stores)
        .expect("first");
    let bundle = router
        .build_tuning_plane_bundle("cycle-2", &snapshot(1000.0), &envelopes(), &stores)
        .expect("second");
    assert!(bundle.portfolio.is_empty());
    assert!(bundle.experiments.is_empty());
    // Stabilization still aged exactly once per cycle.
    assert_eq!(
        router.stabilization().cycles_since_change("cache", "workers"),
        Some(2)
    );
}
