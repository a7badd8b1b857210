//! Plurality vote across the per-model predictions of one submission.

use shared::domain::{ClassLabel, ConsensusResult, ModelPredictionSet, PredictionEntry};

/// Votes over every entry whose label is not `Error`.
///
/// Ties go to the class listed first in [`ClassLabel::CLASSES`]
/// (STAR, then GALAXY, then QSO), so the result never depends on map order.
/// `confidence` is the mean confidence of the winning voters that reported one.
pub fn compute_consensus<'a, I>(entries: I) -> ConsensusResult
where
    I: IntoIterator<Item = &'a PredictionEntry>,
{
    let mut tallies = [0usize; ClassLabel::CLASSES.len()];
    let mut confidence_sums = [0f64; ClassLabel::CLASSES.len()];
    let mut confidence_counts = [0usize; ClassLabel::CLASSES.len()];
    let mut total = 0;

    for entry in entries {
        let Some(index) = entry.label.class_index() else {
            continue;
        };
        total += 1;
        tallies[index] += 1;
        if let Some(confidence) = entry.confidence {
            confidence_sums[index] += confidence;
            confidence_counts[index] += 1;
        }
    }

    if total == 0 {
        return ConsensusResult::unknown();
    }

    let mut winner = 0;
    for index in 1..tallies.len() {
        if tallies[index] > tallies[winner] {
            winner = index;
        }
    }

    let confidence = (confidence_counts[winner] > 0)
        .then(|| confidence_sums[winner] / confidence_counts[winner] as f64);

    ConsensusResult {
        prediction: Some(ClassLabel::CLASSES[winner]),
        count: tallies[winner],
        total,
        confidence,
    }
}

/// Consensus over the whole ensemble.
pub fn global_consensus(predictions: &ModelPredictionSet) -> ConsensusResult {
    compute_consensus(predictions.values())
}

/// Consensus over the classical models only, leaving out the deep-learning model.
pub fn classical_consensus(predictions: &ModelPredictionSet) -> ConsensusResult {
    compute_consensus(
        predictions
            .iter()
            .filter(|(model, _)| !model.is_deep_learning())
            .map(|(_, entry)| entry),
    )
}
