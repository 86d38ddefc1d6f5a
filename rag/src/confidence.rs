//! Confidence scoring and the escalation signal.
//!
//! The scorer only advises. Acting on [`ConfidenceResult::should_escalate`] (handing the
//! conversation to a human) is left to the caller's workflow.

use serde::Serialize;

use crate::config::ConfidenceConfig;
use crate::types::RetrievedChunk;

/// Chunks scoring above this count as supporting evidence.
const SUPPORT_THRESHOLD: f32 = 0.75;

/// The four bounded components of a confidence score.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ConfidenceFactors {
    /// `min(top.normalized_score * 0.4, 0.4)`.
    pub top_result: f32,
    /// `min(supporting * 0.1, 0.3)` where supporting results score above 0.75.
    pub supporting_density: f32,
    /// 0.2, 0.15 or 0.05 depending on answer length.
    pub answer_length: f32,
    /// 0.1 when the answer cites a source.
    pub citation: f32,
}

impl ConfidenceFactors {
    /// Sum of the factors, capped at 1.
    #[must_use]
    pub fn total(&self) -> f32 {
        (self.top_result + self.supporting_density + self.answer_length + self.citation)
            .clamp(0.0, 1.0)
    }
}

/// Outcome of [`ConfidenceScorer::score`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConfidenceResult {
    /// Confidence in `[0, 1]`.
    pub score: f32,
    /// Whether the answer should be handed to a human.
    pub should_escalate: bool,
    /// Handoff phrase found in the answer, if any.
    pub handoff_phrase: Option<String>,
    /// Score breakdown.
    pub factors: ConfidenceFactors,
}

/// Scores an answer against the chunks it was generated from.
#[derive(Clone, Debug)]
pub struct ConfidenceScorer {
    config: ConfidenceConfig,
    handoff_phrases: Vec<String>,
    citation_markers: Vec<String>,
}

impl ConfidenceScorer {
    /// Creates a scorer. Phrase and marker matching is case-insensitive.
    #[must_use]
    pub fn new(config: ConfidenceConfig) -> Self {
        let lower = |items: &[String]| items.iter().map(|s| s.to_lowercase()).collect();
        Self {
            handoff_phrases: lower(&config.handoff_phrases),
            citation_markers: lower(&config.citation_markers),
            config,
        }
    }

    /// Configured escalation threshold.
    #[must_use]
    pub const fn threshold(&self) -> f32 {
        self.config.escalation_threshold
    }

    /// Scores `answer` given the chunks `retrieved` for `query`.
    ///
    /// An empty retrieval set is a normal low-confidence outcome, not an error.
    #[must_use]
    pub fn score(&self, answer: &str, retrieved: &[RetrievedChunk], query: &str) -> ConfidenceResult {
        let lowered = answer.to_lowercase();
        let factors = ConfidenceFactors {
            top_result: top_result_factor(retrieved),
            supporting_density: density_factor(retrieved),
            answer_length: length_factor(answer.chars().count()),
            citation: if self.citation_markers.iter().any(|m| lowered.contains(m)) {
                0.1
            } else {
                0.0
            },
        };
        let score = factors.total();
        let handoff_phrase = self
            .handoff_phrases
            .iter()
            .find(|phrase| lowered.contains(phrase.as_str()))
            .cloned();
        let should_escalate = score < self.config.escalation_threshold || handoff_phrase.is_some();

        tracing::debug!(
            query,
            score,
            should_escalate,
            handoff = handoff_phrase.as_deref(),
            retrieved = retrieved.len(),
            "Scored answer"
        );
        ConfidenceResult {
            score,
            should_escalate,
            handoff_phrase,
            factors,
        }
    }

    /// The escalation rule on its own: below threshold, or a handoff phrase present.
    #[must_use]
    pub fn should_escalate(&self, score: f32, answer: &str) -> bool {
        if score < self.config.escalation_threshold {
            return true;
        }
        let lowered = answer.to_lowercase();
        self.handoff_phrases
            .iter()
            .any(|phrase| lowered.contains(phrase.as_str()))
    }
}

impl Default for ConfidenceScorer {
    fn default() -> Self {
        Self::new(ConfidenceConfig::default())
    }
}

fn top_result_factor(retrieved: &[RetrievedChunk]) -> f32 {
    retrieved
        .iter()
        .map(|r| r.normalized_score)
        .max_by(f32::total_cmp)
        .map_or(0.0, |top| (top * 0.4).clamp(0.0, 0.4))
}

fn density_factor(retrieved: &[RetrievedChunk]) -> f32 {
    let supporting = retrieved
        .iter()
        .filter(|r| r.normalized_score > SUPPORT_THRESHOLD)
        .count();
    #[allow(clippy::cast_precision_loss)]
    let density = supporting as f32 * 0.1;
    density.min(0.3)
}

const fn length_factor(chars: usize) -> f32 {
    match chars {
        51..500 => 0.2,
        500..1000 => 0.15,
        _ => 0.05,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chunk, Metadata, RetrievalSource};
    use std::sync::Arc;

    fn retrieved(scores: &[f32]) -> Vec<RetrievedChunk> {
        scores
            .iter()
            .enumerate()
            .map(|(i, &score)| RetrievedChunk {
                chunk: Arc::new(Chunk::new("doc", i, "text", 1, Metadata::new())),
                raw_score: score,
                normalized_score: score,
                source: RetrievalSource::Hybrid,
                vector_score: Some(score),
                keyword_score: Some(score),
            })
            .collect()
    }

    fn answer(chars: usize) -> String {
        "a".repeat(chars)
    }

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn length_bands() {
        assert!(approx(length_factor(50), 0.05));
        assert!(approx(length_factor(51), 0.2));
        assert!(approx(length_factor(499), 0.2));
        assert!(approx(length_factor(500), 0.15));
        assert!(approx(length_factor(999), 0.15));
        assert!(approx(length_factor(1000), 0.05));
    }

    #[test]
    fn low_confidence_escalates() {
        let scorer = ConfidenceScorer::default();
        let result = scorer.score(&answer(60), &retrieved(&[0.5]), "q");

        assert!(approx(result.score, 0.4));
        assert!(result.should_escalate);
        assert!(result.handoff_phrase.is_none());
    }

    #[test]
    fn high_confidence_does_not_escalate() {
        let scorer = ConfidenceScorer::default();
        let result = scorer.score(&answer(60), &retrieved(&[0.875, 0.8, 0.8]), "q");

        assert!(approx(result.score, 0.85));
        assert!(approx(result.factors.supporting_density, 0.3));
        assert!(!result.should_escalate);
    }

    #[test]
    fn threshold_rule_in_isolation() {
        let scorer = ConfidenceScorer::default();
        assert!(scorer.should_escalate(0.4, "fine"));
        assert!(!scorer.should_escalate(0.85, "fine"));
        assert!(scorer.should_escalate(0.85, "Let me TRANSFER YOU to billing"));
    }

    #[test]
    fn handoff_phrase_forces_escalation() {
        let scorer = ConfidenceScorer::default();
        let text = format!("{} I'm not sure about that, sorry.", answer(60));
        let result = scorer.score(&text, &retrieved(&[1.0, 0.9, 0.9]), "q");

        assert!(result.score >= 0.7);
        assert!(result.should_escalate);
        assert_eq!(result.handoff_phrase.as_deref(), Some("i'm not sure"));
    }

    #[test]
    fn citation_adds_a_tenth() {
        let scorer = ConfidenceScorer::default();
        let plain = scorer.score(&answer(60), &retrieved(&[0.5]), "q");
        let cited = scorer.score(&format!("{} [Source: faq.md]", answer(60)), &retrieved(&[0.5]), "q");

        assert!(approx(cited.factors.citation, 0.1));
        assert!(approx(cited.score - plain.score, 0.1));
    }

    #[test]
    fn empty_retrieval_is_low_confidence() {
        let scorer = ConfidenceScorer::default();
        let result = scorer.score("", &[], "q");
        assert!(approx(result.score, 0.05));
        assert!(result.should_escalate);
    }

    #[test]
    fn score_is_capped() {
        let scorer = ConfidenceScorer::default();
        let text = format!("{} according to the guide", answer(60));
        let result = scorer.score(&text, &retrieved(&[1.0, 1.0, 1.0, 1.0, 1.0]), "q");
        assert!(result.score <= 1.0);
        assert!(approx(result.score, 1.0));
    }
}
