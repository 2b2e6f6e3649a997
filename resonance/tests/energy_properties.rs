//! Property tests for the numeric invariants of energy mapping and
//! ensemble scoring.
//!
//! Tests verify:
//! - instant and smoothed energy stay in [0,1] for any delay/certainty
//! - EMA converges monotonically on a constant stream
//! - ensemble energy never exceeds the strongest member by more than epsilon
//! - DI is unavailable exactly when some member lacks certainty

use std::collections::BTreeMap;

use proptest::prelude::*;
use resonance::config::{EnergyConfig, EnsembleConfig};
use resonance::ensemble::{bounded_ensemble_energy, diversity_index, score_window};
use resonance::ensemble::{TokenObservation, WindowMember};
use resonance::{DiversityIndex, EnergyMapper, EnergyValue, StreamId, TokenEvent};
use tokio::time::Instant;

fn delay_strategy() -> impl Strategy<Value = f64> {
    prop_oneof![
        -1.0e6..1.0e6f64,
        Just(0.0),
        Just(-0.0),
        Just(f64::INFINITY),
        Just(f64::NEG_INFINITY),
        Just(f64::MAX),
        Just(f64::MIN_POSITIVE),
    ]
}

fn observation(stream: u64, instant: f64, text: &str, certainty: Option<f64>) -> TokenObservation {
    TokenObservation {
        value: EnergyValue::new(StreamId(stream), instant, instant, Instant::now()),
        text: text.to_string(),
        certainty,
        alternatives: Vec::new(),
    }
}

proptest! {
    #[test]
    fn prop_energy_is_bounded(
        tokens in prop::collection::vec((delay_strategy(), prop::option::of(0.0..=1.0f64)), 1..64),
        alpha in 0.01..=1.0f64,
    ) {
        let config = EnergyConfig { alpha, ..EnergyConfig::default() };
        let mut mapper = EnergyMapper::new(StreamId(1), config);
        for (seq, (delay, certainty)) in tokens.into_iter().enumerate() {
            let mut b = TokenEvent::builder(StreamId(1), seq as u64).with_delay_ms(delay);
            if let Some(c) = certainty {
                b = b.with_certainty(c);
            }
            let v = mapper.observe(&b.build().unwrap());
            prop_assert!((0.0..=1.0).contains(&v.instant), "instant {}", v.instant);
            prop_assert!((0.0..=1.0).contains(&v.smoothed), "smoothed {}", v.smoothed);
        }
    }

    #[test]
    fn prop_ema_converges_monotonically(
        start_delay in 0.0..5_000.0f64,
        steady_delay in 0.0..5_000.0f64,
        certainty in 0.0..=1.0f64,
        alpha in 0.05..=0.5f64,
    ) {
        let config = EnergyConfig { alpha, ..EnergyConfig::default() };
        let mut mapper = EnergyMapper::new(StreamId(1), config);
        let first = TokenEvent::builder(StreamId(1), 0)
            .with_delay_ms(start_delay)
            .with_certainty(1.0 - certainty)
            .build()
            .unwrap();
        mapper.observe(&first);

        let mut prev_gap = f64::INFINITY;
        let mut last = None;
        // (1-α)^n shrinks the gap below 1e-3 well within this bound.
        let steps = ((1e-3f64).ln() / (1.0 - alpha).ln()).ceil() as u64 + 1;
        for seq in 1..=steps {
            let ev = TokenEvent::builder(StreamId(1), seq)
                .with_delay_ms(steady_delay)
                .with_certainty(certainty)
                .build()
                .unwrap();
            let v = mapper.observe(&ev);
            let gap = (v.smoothed - v.instant).abs();
            prop_assert!(gap <= prev_gap + 1e-12, "gap grew: {} > {}", gap, prev_gap);
            prev_gap = gap;
            last = Some(gap);
        }
        prop_assert!(last.unwrap() < 1e-3);
    }

    #[test]
    fn prop_ensemble_energy_is_capped(
        members in prop::collection::vec((0.0..=1.0f64, 0.0..5.0f64), 1..8),
        interference in -1.0..=1.0f64,
        gain in 0.0..10.0f64,
        epsilon in 0.0..0.2f64,
    ) {
        let strongest = members.iter().map(|(e, _)| *e).fold(0.0, f64::max);
        let e = bounded_ensemble_energy(&members, interference, gain, epsilon);
        prop_assert!((0.0..=1.0).contains(&e));
        prop_assert!(e <= strongest + epsilon + 1e-12);
    }

    #[test]
    fn prop_window_score_respects_cap(
        instants in prop::collection::vec((0.0..=1.0f64, prop::option::of(0.0..=1.0f64)), 1..6),
    ) {
        let config = EnsembleConfig::default();
        let mut window: BTreeMap<StreamId, WindowMember> = BTreeMap::new();
        for (i, (e, c)) in instants.iter().enumerate() {
            let mut m = WindowMember::new(1.0);
            m.observations.push(observation(i as u64, *e, "t", *c));
            window.insert(StreamId(i as u64), m);
        }
        let strongest = instants.iter().map(|(e, _)| *e).fold(0.0, f64::max);
        let score = score_window(&window, &config);
        prop_assert!(score.ensemble_energy <= strongest + config.amplification_epsilon + 1e-12);
    }

    #[test]
    fn prop_di_unavailable_iff_certainty_missing(
        certainties in prop::collection::vec(prop::option::of(0.0..=1.0f64), 1..6),
        texts in prop::collection::vec("[a-c]", 6),
    ) {
        let mut window: BTreeMap<StreamId, WindowMember> = BTreeMap::new();
        for (i, c) in certainties.iter().enumerate() {
            let mut m = WindowMember::new(1.0);
            m.observations.push(observation(i as u64, 0.5, &texts[i], *c));
            window.insert(StreamId(i as u64), m);
        }
        let any_missing = certainties.iter().any(Option::is_none);
        match diversity_index(window.values()) {
            DiversityIndex::Unavailable => prop_assert!(any_missing),
            DiversityIndex::Available(v) => {
                prop_assert!(!any_missing);
                prop_assert!((0.0..=1.0).contains(&v));
            }
        }
    }
}
