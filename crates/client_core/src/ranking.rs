use shared::domain::{ClassLabel, ClassProbabilities};

/// Sorts by weight, highest first. Equal weights keep input order; NaN sorts last.
pub fn rank_descending<K>(items: impl IntoIterator<Item = (K, f64)>) -> Vec<(K, f64)> {
    let mut ranked: Vec<(K, f64)> = items.into_iter().collect();
    ranked.sort_by(|(_, a), (_, b)| sort_key(*b).total_cmp(&sort_key(*a)));
    ranked
}

fn sort_key(weight: f64) -> f64 {
    if weight.is_nan() {
        f64::NEG_INFINITY
    } else {
        weight
    }
}

pub fn rank_probabilities(probabilities: &ClassProbabilities) -> Vec<(ClassLabel, f64)> {
    rank_descending(probabilities.iter())
}
