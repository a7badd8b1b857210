//! Test-set scores of each model, measured offline when the models were trained.

use shared::domain::ModelId;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelMetrics {
    pub model: &'static str,
    pub accuracy: f64,
    /// Not measured for every model.
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub f1_score: f64,
}

pub static MODEL_METRICS: [ModelMetrics; 5] = [
    ModelMetrics {
        model: ModelId::RANDOM_FOREST,
        accuracy: 0.97,
        precision: Some(0.97),
        recall: Some(0.97),
        f1_score: 0.97,
    },
    ModelMetrics {
        model: ModelId::DEEP_LEARNING,
        accuracy: 0.97,
        precision: None,
        recall: None,
        f1_score: 0.97,
    },
    ModelMetrics {
        model: ModelId::MLP,
        accuracy: 0.95,
        precision: Some(0.94),
        recall: Some(0.95),
        f1_score: 0.94,
    },
    ModelMetrics {
        model: ModelId::SVM,
        accuracy: 0.92,
        precision: Some(0.91),
        recall: Some(0.92),
        f1_score: 0.91,
    },
    ModelMetrics {
        model: ModelId::KNN,
        accuracy: 0.89,
        precision: Some(0.88),
        recall: Some(0.89),
        f1_score: 0.88,
    },
];
