//! Consensus scoring and convergence detection

use serde::{Deserialize, Serialize};

use super::discussion::{Contribution, Participant};

/// How contributions of one round are reduced to a consensus score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusStrategy {
    /// Lowest agreement score
    Unanimous,
    /// Mean agreement score
    #[default]
    Majority,
    /// Participant-weighted mean
    Weighted,
    /// Score reported by a facilitator agent
    Facilitator,
}

/// Reduce self-reported agreement scores to one round score.
///
/// Only contributions that carry a score take part. With no scores the
/// result is 0. `Facilitator` has no participant-side formula: the reported
/// facilitator score is used by the caller, and this falls back to the mean.
pub fn evaluate_consensus(
    strategy: ConsensusStrategy,
    contributions: &[Contribution],
    participants: &[Participant],
) -> f64 {
    let scored: Vec<(&Contribution, f64)> = contributions
        .iter()
        .filter_map(|c| c.agreement_score.map(|s| (c, s)))
        .collect();
    if scored.is_empty() {
        return 0.0;
    }

    match strategy {
        ConsensusStrategy::Unanimous => scored.iter().map(|(_, s)| *s).fold(f64::INFINITY, f64::min),
        ConsensusStrategy::Majority | ConsensusStrategy::Facilitator => {
            scored.iter().map(|(_, s)| *s).sum::<f64>() / scored.len() as f64
        }
        ConsensusStrategy::Weighted => {
            let weight_of = |c: &Contribution| {
                participants
                    .iter()
                    .find(|p| p.participant_id() == c.participant_id)
                    .map(|p| p.weight)
                    .unwrap_or(1.0)
            };
            let (weighted, total) = scored.iter().fold((0.0, 0.0), |(sum, total), (c, s)| {
                let w = weight_of(*c);
                (sum + s * w, total + w)
            });
            if total > 0.0 {
                weighted / total
            } else {
                0.0
            }
        }
    }
}

/// Whether a discussion has converged given every round score so far.
///
/// True when the latest score reaches `threshold`, or when scores never
/// decreased and their mean reaches 90% of `threshold`.
pub fn check_convergence(scores: &[f64], threshold: f64) -> bool {
    let Some(&last) = scores.last() else {
        return false;
    };
    if last >= threshold {
        return true;
    }
    let non_decreasing = scores.windows(2).all(|w| w[1] >= w[0]);
    let mean = scores.iter().sum::<f64>() / scores.len() as f64;
    non_decreasing && mean >= 0.9 * threshold
}
