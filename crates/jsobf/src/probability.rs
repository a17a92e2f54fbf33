//! §4.D's probability resolver: maps a user-supplied knob to a concrete
//! per-invocation decision, deterministically, from the pipeline's shared
//! RNG.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Accepted shapes for a user knob like `controlFlowFlattening` or `rgf`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProbabilitySpec {
    /// All (`true`) or nothing (`false`).
    Boolean(bool),
    /// Bernoulli trial with this success probability, clamped to `[0, 1]`.
    Chance(f64),
    /// A fixed weighted choice among named options, e.g. the composite
    /// `identifierGenerator` spec.
    WeightedChoice(Vec<(String, f64)>),
}

impl ProbabilitySpec {
    /// Resolves this spec to a yes/no decision, drawing from `rng` only when
    /// the spec is genuinely probabilistic.
    pub fn decide(&self, rng: &mut impl Rng) -> bool {
        match self {
            Self::Boolean(b) => *b,
            Self::Chance(p) => rng.gen_bool(p.clamp(0.0, 1.0)),
            Self::WeightedChoice(choices) => weighted_pick(choices, rng).is_some(),
        }
    }

    /// Resolves a weighted-choice spec to the chosen label; panics-free for
    /// non-weighted specs, which have no labels to pick among.
    #[must_use]
    pub fn pick_label(&self, rng: &mut impl Rng) -> Option<String> {
        match self {
            Self::WeightedChoice(choices) => weighted_pick(choices, rng),
            _ => None,
        }
    }
}

fn weighted_pick(choices: &[(String, f64)], rng: &mut impl Rng) -> Option<String> {
    let total: f64 = choices.iter().map(|(_, w)| w.max(0.0)).sum();
    if total <= 0.0 {
        return None;
    }
    let mut pick = rng.gen_range(0.0..total);
    for (label, weight) in choices {
        let weight = weight.max(0.0);
        if pick < weight {
            return Some(label.clone());
        }
        pick -= weight;
    }
    choices.last().map(|(label, _)| label.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn boolean_spec_is_unconditional() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(ProbabilitySpec::Boolean(true).decide(&mut rng));
        assert!(!ProbabilitySpec::Boolean(false).decide(&mut rng));
    }

    #[test]
    fn chance_spec_is_deterministic_given_a_seed() {
        let mut rng_a = ChaCha8Rng::seed_from_u64(42);
        let mut rng_b = ChaCha8Rng::seed_from_u64(42);
        let spec = ProbabilitySpec::Chance(0.5);
        let sequence_a: Vec<bool> = (0..20).map(|_| spec.decide(&mut rng_a)).collect();
        let sequence_b: Vec<bool> = (0..20).map(|_| spec.decide(&mut rng_b)).collect();
        assert_eq!(sequence_a, sequence_b);
    }

    #[test]
    fn chance_of_zero_never_fires() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let spec = ProbabilitySpec::Chance(0.0);
        assert!((0..50).all(|_| !spec.decide(&mut rng)));
    }

    #[test]
    fn weighted_choice_only_returns_known_labels() {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let spec = ProbabilitySpec::WeightedChoice(vec![("randomized".to_owned(), 3.0), ("hexadecimal".to_owned(), 1.0)]);
        for _ in 0..50 {
            let label = spec.pick_label(&mut rng).unwrap();
            assert!(label == "randomized" || label == "hexadecimal");
        }
    }
}
