//! Window scoring: ensemble energy, diversity index and interference class.
//!
//! ```text
//! mean        = Σ γ_i·e_i / Σ γ_i                (weighted member instants)
//! spread      = weighted std-dev of e_i, normalized by 0.5 into [0,1]
//! coherence   = 1 - spread                       (and ≤ 1 - DI when DI exists)
//! interference= 2·coherence - 1                  ∈ [-1, 1], 0 for one member
//! ensemble    = clamp(mean·(1 + gain·interference), 0, min(1, max e_i + ε))
//! ```
//!
//! DI is `1 - dominant mass` of the members' averaged token distributions,
//! and only exists when every observation in the window carries certainty.

use std::collections::{BTreeMap, HashMap};

use crate::config::EnsembleConfig;
use crate::types::{
    unit_clamp, DiversityIndex, EnergyValue, InterferencePattern, StreamId, TokenAlternative,
};

/// Largest possible weighted std-dev of values in [0,1].
const MAX_SPREAD: f64 = 0.5;

/// One token as seen by the merge loop.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenObservation {
    pub value: EnergyValue,
    pub text: String,
    pub certainty: Option<f64>,
    pub alternatives: Vec<TokenAlternative>,
}

/// Everything one stream contributed to a window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowMember {
    /// Per-model confidence factor γ.
    pub weight: f64,
    pub observations: Vec<TokenObservation>,
}

impl WindowMember {
    pub fn new(weight: f64) -> Self {
        Self {
            weight,
            observations: Vec::new(),
        }
    }

    /// Most recent energy in the window.
    pub fn latest(&self) -> Option<EnergyValue> {
        self.observations.last().map(|o| o.value)
    }

    fn has_certainty(&self) -> bool {
        !self.observations.is_empty() && self.observations.iter().all(|o| o.certainty.is_some())
    }

    /// Average next-token distribution over this member's observations.
    fn distribution(&self) -> HashMap<&str, f64> {
        let mut dist: HashMap<&str, f64> = HashMap::new();
        let n = self.observations.len() as f64;
        for obs in &self.observations {
            let mut local: HashMap<&str, f64> = HashMap::new();
            *local.entry(obs.text.as_str()).or_default() += obs.certainty.unwrap_or(0.0);
            for alt in &obs.alternatives {
                *local.entry(alt.text.as_str()).or_default() += alt.probability;
            }
            let mass: f64 = local.values().sum();
            let norm = if mass > 1.0 { mass } else { 1.0 };
            for (text, p) in local {
                *dist.entry(text).or_default() += p / norm / n;
            }
        }
        dist
    }
}

/// Derived metrics for one window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowScore {
    pub ensemble_energy: f64,
    pub diversity_index: DiversityIndex,
    pub pattern: InterferencePattern,
    /// Unweighted average of member instants.
    pub simple_mean: f64,
    /// Normalized spread in [0,1].
    pub spread: f64,
}

impl Default for WindowScore {
    fn default() -> Self {
        Self {
            ensemble_energy: 0.0,
            diversity_index: DiversityIndex::Unavailable,
            pattern: InterferencePattern::Neutral,
            simple_mean: 0.0,
            spread: 0.0,
        }
    }
}

/// DI across members, `Unavailable` if any observation lacks certainty.
pub fn diversity_index<'a>(members: impl IntoIterator<Item = &'a WindowMember>) -> DiversityIndex {
    let members: Vec<&WindowMember> = members
        .into_iter()
        .filter(|m| !m.observations.is_empty())
        .collect();
    if members.is_empty() || !members.iter().all(|m| m.has_certainty()) {
        return DiversityIndex::Unavailable;
    }

    let n = members.len() as f64;
    let mut aggregate: HashMap<&str, f64> = HashMap::new();
    for member in &members {
        for (text, p) in member.distribution() {
            *aggregate.entry(text).or_default() += p / n;
        }
    }
    let dominant = aggregate.values().copied().fold(0.0_f64, f64::max);
    DiversityIndex::Available(unit_clamp(1.0 - dominant))
}

/// Weighted mean and normalized spread of `(instant, weight)` pairs.
/// Zero total weight falls back to equal weights.
fn weighted_moments(members: &[(f64, f64)]) -> (f64, f64) {
    let total: f64 = members.iter().map(|(_, w)| w.max(0.0)).sum();
    let weights: Vec<f64> = if total > 0.0 {
        members.iter().map(|(_, w)| w.max(0.0) / total).collect()
    } else {
        vec![1.0 / members.len() as f64; members.len()]
    };
    let mean: f64 = members.iter().zip(&weights).map(|((e, _), w)| e * w).sum();
    let var: f64 = members
        .iter()
        .zip(&weights)
        .map(|((e, _), w)| w * (e - mean).powi(2))
        .sum();
    (mean, unit_clamp(var.sqrt() / MAX_SPREAD))
}

/// Ensemble energy of `(instant, weight)` members under `interference`,
/// capped at `max instant + epsilon`.
pub fn bounded_ensemble_energy(
    members: &[(f64, f64)],
    interference: f64,
    gain: f64,
    epsilon: f64,
) -> f64 {
    if members.is_empty() {
        return 0.0;
    }
    let (mean, _) = weighted_moments(members);
    let strongest = members.iter().map(|(e, _)| *e).fold(0.0_f64, f64::max);
    let cap = (strongest + epsilon.max(0.0)).min(1.0);
    let raw = mean * (1.0 + gain * interference.clamp(-1.0, 1.0));
    if raw.is_nan() {
        return 0.0;
    }
    raw.clamp(0.0, cap)
}

/// Score one window's members.
pub fn score_window(
    members: &BTreeMap<StreamId, WindowMember>,
    config: &EnsembleConfig,
) -> WindowScore {
    let energies: Vec<(f64, f64)> = members
        .values()
        .filter_map(|m| m.latest().map(|v| (v.instant, m.weight)))
        .collect();
    if energies.is_empty() {
        return WindowScore::default();
    }

    let diversity_index = diversity_index(members.values());
    let simple_mean = energies.iter().map(|(e, _)| e).sum::<f64>() / energies.len() as f64;
    let (_, spread) = weighted_moments(&energies);

    let interference = if energies.len() < 2 {
        0.0
    } else {
        let mut coherence = 1.0 - spread;
        if let Some(di) = diversity_index.value() {
            coherence = coherence.min(1.0 - di);
        }
        2.0 * coherence - 1.0
    };

    let ensemble_energy = bounded_ensemble_energy(
        &energies,
        interference,
        config.interference_gain,
        config.amplification_epsilon,
    );

    let pattern = classify(
        energies.len(),
        simple_mean,
        spread,
        ensemble_energy,
        diversity_index,
        config,
    );

    WindowScore {
        ensemble_energy,
        diversity_index,
        pattern,
        simple_mean,
        spread,
    }
}

fn classify(
    members: usize,
    simple_mean: f64,
    spread: f64,
    ensemble_energy: f64,
    di: DiversityIndex,
    config: &EnsembleConfig,
) -> InterferencePattern {
    if members < 2 {
        return InterferencePattern::Neutral;
    }
    let agrees = di.value().map_or(true, |d| d <= config.constructive_max_diversity);
    if simple_mean >= config.constructive_min_energy
        && spread <= config.constructive_max_spread
        && agrees
        && ensemble_energy >= simple_mean
    {
        return InterferencePattern::Constructive;
    }

    let diverges = spread >= config.destructive_min_spread
        || di.value().is_some_and(|d| d >= config.destructive_min_diversity);
    if diverges && ensemble_energy < simple_mean {
        return InterferencePattern::Destructive;
    }
    InterferencePattern::Neutral
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn obs(stream: u64, instant: f64, text: &str, certainty: Option<f64>) -> TokenObservation {
        TokenObservation {
            value: EnergyValue::new(StreamId(stream), instant, instant, Instant::now()),
            text: text.to_string(),
            certainty,
            alternatives: Vec::new(),
        }
    }

    fn window(entries: Vec<(u64, f64, &str, Option<f64>)>) -> BTreeMap<StreamId, WindowMember> {
        let mut members: BTreeMap<StreamId, WindowMember> = BTreeMap::new();
        for (stream, e, text, c) in entries {
            members
                .entry(StreamId(stream))
                .or_insert_with(|| WindowMember::new(1.0))
                .observations
                .push(obs(stream, e, text, c));
        }
        members
    }

    #[test]
    fn test_empty_window_is_neutral_and_unavailable() {
        let score = score_window(&BTreeMap::new(), &EnsembleConfig::default());
        assert_eq!(score.ensemble_energy, 0.0);
        assert_eq!(score.diversity_index, DiversityIndex::Unavailable);
        assert_eq!(score.pattern, InterferencePattern::Neutral);
    }

    #[test]
    fn test_single_member_passes_through() {
        let members = window(vec![(0, 0.7, "a", Some(0.9))]);
        let score = score_window(&members, &EnsembleConfig::default());
        assert!((score.ensemble_energy - 0.7).abs() < 1e-12);
        assert_eq!(score.pattern, InterferencePattern::Neutral);
    }

    #[test]
    fn test_di_unavailable_if_any_member_lacks_certainty() {
        let members = window(vec![(0, 0.7, "a", Some(0.9)), (1, 0.7, "a", None)]);
        assert_eq!(diversity_index(members.values()), DiversityIndex::Unavailable);
    }

    #[test]
    fn test_di_low_when_members_agree() {
        let members = window(vec![(0, 0.9, "x", Some(0.95)), (1, 0.9, "x", Some(0.95))]);
        let di = diversity_index(members.values()).value().unwrap();
        assert!((di - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_di_high_when_members_split() {
        let members = window(vec![(0, 0.9, "x", Some(0.9)), (1, 0.9, "y", Some(0.9))]);
        let di = diversity_index(members.values()).value().unwrap();
        assert!((di - 0.55).abs() < 1e-9);
    }

    #[test]
    fn test_alternatives_feed_the_distribution() {
        let mut members = window(vec![(0, 0.5, "x", Some(0.5))]);
        if let Some(m) = members.get_mut(&StreamId(0)) {
            m.observations[0].alternatives = vec![TokenAlternative {
                text: "y".into(),
                probability: 0.4,
            }];
        }
        let di = diversity_index(members.values()).value().unwrap();
        assert!((di - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_constructive_agreement() {
        let members = window(vec![(0, 0.9, "x", Some(0.95)), (1, 0.9, "x", Some(0.95))]);
        let score = score_window(&members, &EnsembleConfig::default());
        assert_eq!(score.pattern, InterferencePattern::Constructive);
        assert!(score.ensemble_energy >= 0.9);
        assert!(score.ensemble_energy <= 0.9 + EnsembleConfig::default().amplification_epsilon + 1e-12);
    }

    #[test]
    fn test_destructive_divergence() {
        let members = window(vec![(0, 0.85, "x", Some(0.95)), (1, 0.3, "y", Some(0.1))]);
        let score = score_window(&members, &EnsembleConfig::default());
        assert_eq!(score.pattern, InterferencePattern::Destructive);
        assert!(score.ensemble_energy < score.simple_mean);
    }

    #[test]
    fn test_weights_shift_the_mean() {
        let even = bounded_ensemble_energy(&[(0.2, 1.0), (0.8, 1.0)], 0.0, 0.25, 0.05);
        let skewed = bounded_ensemble_energy(&[(0.2, 1.0), (0.8, 3.0)], 0.0, 0.25, 0.05);
        assert!((even - 0.5).abs() < 1e-12);
        assert!((skewed - 0.65).abs() < 1e-12);
        // Zero weights fall back to equal weighting.
        let zero = bounded_ensemble_energy(&[(0.2, 0.0), (0.8, 0.0)], 0.0, 0.25, 0.05);
        assert!((zero - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_amplification_is_capped() {
        let e = bounded_ensemble_energy(&[(0.6, 1.0), (0.6, 1.0)], 1.0, 10.0, 0.05);
        assert!((e - 0.65).abs() < 1e-12);
    }
}
