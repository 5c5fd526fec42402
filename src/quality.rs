//! Weighted quality gate scoring.
//!
//! Five pillars, each scored in `[0, 1]`, are combined with fixed weights that
//! sum to 1.0. The total is rounded to six decimal places so that equal inputs
//! always produce bit-identical totals and verdicts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Total at or above which the verdict is `Pass`.
pub const PASS_FLOOR: f64 = 0.85;
/// Total at or above which the verdict is `Warning` (below it: `Critical`).
pub const WARNING_FLOOR: f64 = 0.50;
/// Default gate threshold.
pub const DEFAULT_THRESHOLD: f64 = 0.85;

const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pillar {
    Tested,
    Readable,
    Understandable,
    Secured,
    Trackable,
}

impl Pillar {
    pub const ALL: [Pillar; 5] = [
        Pillar::Tested,
        Pillar::Readable,
        Pillar::Understandable,
        Pillar::Secured,
        Pillar::Trackable,
    ];
}

impl std::fmt::Display for Pillar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pillar::Tested => write!(f, "tested"),
            Pillar::Readable => write!(f, "readable"),
            Pillar::Understandable => write!(f, "understandable"),
            Pillar::Secured => write!(f, "secured"),
            Pillar::Trackable => write!(f, "trackable"),
        }
    }
}

/// Per-pillar weights. Must sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PillarWeights {
    #[serde(default = "default_tested")]
    pub tested: f64,
    #[serde(default = "default_readable")]
    pub readable: f64,
    #[serde(default = "default_understandable")]
    pub understandable: f64,
    #[serde(default = "default_secured")]
    pub secured: f64,
    #[serde(default = "default_trackable")]
    pub trackable: f64,
}

fn default_tested() -> f64 {
    0.30
}

fn default_readable() -> f64 {
    0.15
}

fn default_understandable() -> f64 {
    0.15
}

fn default_secured() -> f64 {
    0.25
}

fn default_trackable() -> f64 {
    0.15
}

impl Default for PillarWeights {
    fn default() -> Self {
        Self {
            tested: default_tested(),
            readable: default_readable(),
            understandable: default_understandable(),
            secured: default_secured(),
            trackable: default_trackable(),
        }
    }
}

impl PillarWeights {
    pub fn get(&self, pillar: Pillar) -> f64 {
        match pillar {
            Pillar::Tested => self.tested,
            Pillar::Readable => self.readable,
            Pillar::Understandable => self.understandable,
            Pillar::Secured => self.secured,
            Pillar::Trackable => self.trackable,
        }
    }

    pub fn sum(&self) -> f64 {
        Pillar::ALL.iter().map(|p| self.get(*p)).sum()
    }

    pub fn validate(&self) -> Result<(), QualityError> {
        for pillar in Pillar::ALL {
            let w = self.get(pillar);
            if !(0.0..=1.0).contains(&w) {
                return Err(QualityError::WeightOutOfRange { pillar, weight: w });
            }
        }
        let sum = self.sum();
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(QualityError::WeightsDoNotSumToOne { sum });
        }
        Ok(())
    }
}

/// Raw pillar scores as reported by the quality executor.
pub type PillarScores = BTreeMap<Pillar, f64>;

#[derive(Debug, Error, PartialEq)]
pub enum QualityError {
    #[error("Missing score for pillar '{0}'")]
    MissingPillar(Pillar),

    #[error("Score {score} for pillar '{pillar}' is outside [0, 1]")]
    ScoreOutOfRange { pillar: Pillar, score: f64 },

    #[error("Weight {weight} for pillar '{pillar}' is outside [0, 1]")]
    WeightOutOfRange { pillar: Pillar, weight: f64 },

    #[error("Pillar weights sum to {sum}, expected 1.0")]
    WeightsDoNotSumToOne { sum: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Warning,
    Critical,
}

impl Verdict {
    pub fn for_total(total: f64) -> Self {
        if total >= PASS_FLOOR {
            Verdict::Pass
        } else if total >= WARNING_FLOOR {
            Verdict::Warning
        } else {
            Verdict::Critical
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Pass => write!(f, "PASS"),
            Verdict::Warning => write!(f, "WARNING"),
            Verdict::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// One scored quality gate attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub scores: PillarScores,
    pub weights: PillarWeights,
    pub total: f64,
    pub verdict: Verdict,
    pub threshold: f64,
    pub passed: bool,
    /// Pillars below the pass floor, lowest first.
    pub worst: Vec<(Pillar, f64)>,
}

impl QualityReport {
    /// Same scores as `other`: another retry would not change the outcome.
    pub fn is_stagnant_against(&self, other: &QualityReport) -> bool {
        self.scores == other.scores
    }

    /// Feedback text for the repair stage.
    pub fn feedback(&self) -> String {
        let pillars: Vec<String> = self
            .worst
            .iter()
            .map(|(p, s)| format!("{}={:.2}", p, s))
            .collect();
        format!(
            "quality {:.2} ({}) below threshold {:.2}; weakest pillars: {}",
            self.total,
            self.verdict,
            self.threshold,
            pillars.join(", ")
        )
    }
}

/// Pure scorer over the five pillars.
#[derive(Debug, Clone, Copy)]
pub struct QualityScorer {
    weights: PillarWeights,
    threshold: f64,
}

impl Default for QualityScorer {
    fn default() -> Self {
        Self {
            weights: PillarWeights::default(),
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl QualityScorer {
    pub fn new(weights: PillarWeights, threshold: f64) -> Self {
        Self { weights, threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn score(&self, scores: &PillarScores) -> Result<QualityReport, QualityError> {
        self.weights.validate()?;

        let mut total = 0.0;
        for pillar in Pillar::ALL {
            let score = *scores
                .get(&pillar)
                .ok_or(QualityError::MissingPillar(pillar))?;
            if !(0.0..=1.0).contains(&score) {
                return Err(QualityError::ScoreOutOfRange { pillar, score });
            }
            total += self.weights.get(pillar) * score;
        }
        let total = round6(total);

        let mut worst: Vec<(Pillar, f64)> = Pillar::ALL
            .iter()
            .filter_map(|p| scores.get(p).map(|s| (*p, *s)))
            .filter(|(_, s)| *s < PASS_FLOOR)
            .collect();
        worst.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        Ok(QualityReport {
            scores: scores.clone(),
            weights: self.weights,
            total,
            verdict: Verdict::for_total(total),
            threshold: self.threshold,
            passed: total >= self.threshold,
            worst,
        })
    }
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(values: [f64; 5]) -> PillarScores {
        Pillar::ALL.iter().copied().zip(values).collect()
    }

    #[test]
    fn test_reference_scores_total_exactly() {
        let report = QualityScorer::default()
            .score(&scores([0.9, 0.8, 0.7, 0.6, 0.9]))
            .unwrap();
        assert_eq!(report.total, 0.78);
        assert_eq!(report.verdict, Verdict::Warning);
        assert!(!report.passed);
    }

    #[test]
    fn test_worst_pillars_sorted_ascending() {
        let report = QualityScorer::default()
            .score(&scores([0.9, 0.8, 0.7, 0.6, 0.9]))
            .unwrap();
        let names: Vec<Pillar> = report.worst.iter().map(|(p, _)| *p).collect();
        assert_eq!(
            names,
            vec![Pillar::Secured, Pillar::Understandable, Pillar::Readable]
        );
        assert!(report.feedback().starts_with("quality 0.78"));
    }

    #[test]
    fn test_verdict_tiers() {
        assert_eq!(Verdict::for_total(0.85), Verdict::Pass);
        assert_eq!(Verdict::for_total(0.849999), Verdict::Warning);
        assert_eq!(Verdict::for_total(0.5), Verdict::Warning);
        assert_eq!(Verdict::for_total(0.49), Verdict::Critical);
    }

    #[test]
    fn test_perfect_scores_pass() {
        let report = QualityScorer::default().score(&scores([1.0; 5])).unwrap();
        assert_eq!(report.total, 1.0);
        assert!(report.passed);
        assert!(report.worst.is_empty());
    }

    #[test]
    fn test_custom_threshold_decides_gate_not_verdict() {
        let scorer = QualityScorer::new(PillarWeights::default(), 0.75);
        let report = scorer.score(&scores([0.9, 0.8, 0.7, 0.6, 0.9])).unwrap();
        assert!(report.passed);
        assert_eq!(report.verdict, Verdict::Warning);
    }

    #[test]
    fn test_missing_pillar_rejected() {
        let mut s = scores([0.9; 5]);
        s.remove(&Pillar::Trackable);
        let err = QualityScorer::default().score(&s).unwrap_err();
        assert_eq!(err, QualityError::MissingPillar(Pillar::Trackable));
    }

    #[test]
    fn test_out_of_range_score_rejected() {
        let err = QualityScorer::default()
            .score(&scores([1.2, 0.8, 0.7, 0.6, 0.9]))
            .unwrap_err();
        assert!(matches!(err, QualityError::ScoreOutOfRange { .. }));
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let weights = PillarWeights {
            tested: 0.5,
            ..PillarWeights::default()
        };
        assert!(matches!(
            weights.validate(),
            Err(QualityError::WeightsDoNotSumToOne { .. })
        ));
        assert!(PillarWeights::default().validate().is_ok());
    }

    #[test]
    fn test_stagnation_compares_scores() {
        let scorer = QualityScorer::default();
        let a = scorer.score(&scores([0.9, 0.8, 0.7, 0.6, 0.9])).unwrap();
        let b = scorer.score(&scores([0.9, 0.8, 0.7, 0.6, 0.9])).unwrap();
        let c = scorer.score(&scores([0.9, 0.8, 0.7, 0.7, 0.9])).unwrap();
        assert!(a.is_stagnant_against(&b));
        assert!(!a.is_stagnant_against(&c));
    }
}
