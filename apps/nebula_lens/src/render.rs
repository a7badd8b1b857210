//! Plain-text panels for the terminal front end.

use client_core::{
    metrics::MODEL_METRICS, rank_probabilities, ExplanationState, LogEntry, ParameterForm,
    ReadyResult, ResultState,
};
use shared::domain::{ConsensusResult, Feature, ModelId, PredictionEntry};

const BAR_WIDTH: usize = 24;

pub const EXPLANATION_HEADER: &str = "\n== AI explanation ==\n";
pub const ANALYZING: &str = "Analyzing cosmic data...\n";

/// Display order of the classical ensemble; unknown models follow alphabetically.
const CLASSICAL_ORDER: [&str; 4] = [
    ModelId::RANDOM_FOREST,
    ModelId::SVM,
    ModelId::KNN,
    ModelId::MLP,
];

fn bar(fraction: f64) -> String {
    let fraction = if fraction.is_finite() {
        fraction.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let filled = (fraction * BAR_WIDTH as f64).round() as usize;
    format!("{}{}", "#".repeat(filled), ".".repeat(BAR_WIDTH - filled))
}

fn percent(value: f64) -> String {
    format!("{:.1}%", value * 100.0)
}

pub fn placeholder() -> String {
    "Ready to Predict\nEnter the photometric parameters and run a prediction.\n".to_string()
}

pub fn loading() -> String {
    "Processing cosmic signals...\n".to_string()
}

pub fn result_panels(state: &ResultState) -> String {
    match state {
        ResultState::Empty => placeholder(),
        ResultState::Loading(_) => loading(),
        ResultState::Failed(error) => format!("Error: {}\n", error.message),
        ResultState::Ready(ready) => ready_panels(ready),
    }
}

/// Empty while idle. A trailing `|` marks a reveal still typing.
pub fn explanation_panel(state: &ExplanationState) -> String {
    match state {
        ExplanationState::Idle => String::new(),
        ExplanationState::Fetching => format!("{EXPLANATION_HEADER}{ANALYZING}"),
        ExplanationState::Shown(reveal) => {
            let cursor = if state.is_typing() { "|" } else { "" };
            format!("{EXPLANATION_HEADER}{}{cursor}\n", reveal.visible())
        }
        ExplanationState::Failed(error) => {
            format!("{EXPLANATION_HEADER}Error: {}\n", error.message)
        }
    }
}

fn consensus_line(consensus: &ConsensusResult) -> String {
    format!(
        "{} ({}/{} Votes)",
        consensus.label(),
        consensus.count,
        consensus.total
    )
}

fn ready_panels(ready: &ReadyResult) -> String {
    let predictions = &ready.payload.predictions;
    let mut out = String::new();

    out.push_str("== Global consensus ==\n");
    out.push_str(&format!("  {}\n", consensus_line(&ready.consensus)));
    if let Some(confidence) = ready.consensus.confidence {
        out.push_str(&format!("  mean confidence {}\n", percent(confidence)));
    }
    if let Some(agreement) = &ready.payload.model_agreement {
        out.push_str(&format!(
            "  service agreement: {} ({}/{})\n",
            agreement.prediction, agreement.count, agreement.total
        ));
    }

    if let Some(entry) = predictions.get(ModelId::DEEP_LEARNING) {
        out.push_str("\n== Deep Learning ==\n");
        out.push_str(&deep_learning_card(entry));
    }

    let mut classical: Vec<(&ModelId, &PredictionEntry)> = predictions
        .iter()
        .filter(|(model, _)| !model.is_deep_learning())
        .collect();
    classical.sort_by_key(|(model, _)| {
        CLASSICAL_ORDER
            .iter()
            .position(|known| *known == model.as_str())
            .unwrap_or(CLASSICAL_ORDER.len())
    });
    if !classical.is_empty() {
        out.push_str("\n== Classical ensemble ==\n");
        out.push_str(&format!("  consensus: {}\n", consensus_line(&ready.classical)));
        for (model, entry) in &classical {
            out.push_str(&comparison_row(model, entry));
        }
    }

    out.push_str("\n== Probability breakdown ==\n");
    for (model, entry) in predictions {
        out.push_str(&format!("  {:<24}", model.display_name()));
        if entry.is_error() {
            out.push_str(" ERR\n");
            continue;
        }
        let ranked: Vec<String> = rank_probabilities(&entry.probabilities)
            .into_iter()
            .map(|(label, probability)| format!("{label} {}", percent(probability)))
            .collect();
        out.push_str(&format!(" {}\n", ranked.join("  ")));
    }

    if let Some(performance) = &ready.payload.performance {
        out.push_str("\n== Reported performance ==\n");
        for (name, metrics) in performance {
            out.push_str(&format!(
                "  {:<28} accuracy {:.2}  f1 {:.2}\n",
                name, metrics.accuracy, metrics.f1_score
            ));
        }
    }
    out
}

fn deep_learning_card(entry: &PredictionEntry) -> String {
    if entry.is_error() {
        return format!(
            "  ERR {}\n",
            entry.probabilities.failure().unwrap_or_default()
        );
    }
    let mut out = format!("  {}", entry.label);
    if let Some(confidence) = entry.confidence {
        out.push_str(&format!("  {}", percent(confidence)));
    }
    out.push('\n');
    for (label, probability) in rank_probabilities(&entry.probabilities) {
        out.push_str(&format!(
            "  {:<7}{} {}\n",
            label.as_str(),
            bar(probability),
            percent(probability)
        ));
    }
    out
}

fn comparison_row(model: &ModelId, entry: &PredictionEntry) -> String {
    if entry.is_error() {
        return format!("  {:<24} ERR\n", model.display_name());
    }
    let confidence = entry.confidence.unwrap_or_default();
    format!(
        "  {:<24} {:<7}{} {}\n",
        model.display_name(),
        entry.label.as_str(),
        bar(confidence),
        entry.confidence.map_or_else(|| "-".to_string(), percent)
    )
}

pub fn form(form: &ParameterForm) -> String {
    let mut out = String::new();
    for feature in Feature::ALL {
        let range = feature.range();
        let value = form
            .get(feature)
            .map_or_else(|| "(empty)".to_string(), |value| value.to_string());
        out.push_str(&format!(
            "  {:<12} {:<12} [{} to {}, step {}]\n",
            feature.label(),
            value,
            range.min,
            range.max,
            range.step
        ));
    }
    out
}

pub fn prediction_log(entries: &[LogEntry]) -> String {
    if entries.is_empty() {
        return "No predictions yet.\n".to_string();
    }
    let mut out = String::new();
    for entry in entries {
        let input = &entry.record.input;
        let short_id = entry.id.simple().to_string();
        out.push_str(&format!(
            "  {} {}  {:<22} u={} g={} r={} i={} z={} redshift={}\n",
            &short_id[..8],
            entry.recorded_at.format("%H:%M:%S"),
            consensus_line(&entry.record.consensus),
            input.u,
            input.g,
            input.r,
            input.i,
            input.z,
            input.redshift
        ));
    }
    out
}

/// `weights` must already be sorted highest first.
pub fn feature_importance(weights: &[(String, f64)]) -> String {
    if weights.is_empty() {
        return "No feature importance reported.\n".to_string();
    }
    let max = weights
        .iter()
        .map(|(_, weight)| *weight)
        .fold(0.0_f64, f64::max);
    let mut out = String::new();
    for (name, weight) in weights {
        let scaled = if max > 0.0 { weight / max } else { 0.0 };
        out.push_str(&format!("  {:<10}{} {:.4}\n", name, bar(scaled), weight));
    }
    out
}

pub fn model_metrics() -> String {
    let mut out = format!(
        "  {:<24} {:>8} {:>9} {:>6} {:>6}\n",
        "model", "accuracy", "precision", "recall", "f1"
    );
    let optional =
        |score: Option<f64>| score.map_or_else(|| "-".to_string(), |v| format!("{v:.2}"));
    for metrics in &MODEL_METRICS {
        out.push_str(&format!(
            "  {:<24} {:>8.2} {:>9} {:>6} {:>6.2}\n",
            ModelId::new(metrics.model).display_name(),
            metrics.accuracy,
            optional(metrics.precision),
            optional(metrics.recall),
            metrics.f1_score
        ));
    }
    out
}
