use std::{collections::BTreeMap, fmt};

use serde::{
    de::{MapAccess, Visitor},
    Deserialize, Deserializer, Serialize,
};

use crate::{
    domain::{ClassLabel, ModelPredictionSet, PhotometricInput},
    error::{ApiError, ErrorCode},
};

/// `POST /predict` body: the six features as a flat record.
pub type PredictRequest = PhotometricInput;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub accuracy: f64,
    pub f1_score: f64,
}

/// The service's own vote summary, shown next to the client-side consensus.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelAgreement {
    pub prediction: ClassLabel,
    pub count: usize,
    pub total: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionPayload {
    pub predictions: ModelPredictionSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance: Option<BTreeMap<String, PerformanceMetrics>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_agreement: Option<ModelAgreement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_features: Option<PhotometricInput>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExplanationRequest {
    pub prediction: ClassLabel,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExplanationResponse {
    #[serde(default)]
    explanation: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn service_error(body: &[u8]) -> Option<ApiError> {
    match serde_json::from_slice::<ErrorEnvelope>(body) {
        Ok(ErrorEnvelope {
            error: Some(message),
        }) => Some(ApiError::service(message)),
        _ => None,
    }
}

pub fn decode_predict_response(body: &[u8]) -> Result<PredictionPayload, ApiError> {
    if let Some(err) = service_error(body) {
        return Err(err);
    }
    Ok(serde_json::from_slice(body)?)
}

/// An `explanation` wins over `error`; a blank explanation is an error of its own.
pub fn decode_explanation_response(body: &[u8]) -> Result<String, ApiError> {
    let response: ExplanationResponse = serde_json::from_slice(body)?;
    match (response.explanation, response.error) {
        (Some(text), _) if !text.trim().is_empty() => Ok(text),
        (_, Some(message)) => Err(ApiError::service(message)),
        _ => Err(ApiError::new(
            ErrorCode::EmptyExplanation,
            "explanation service returned no text",
        )),
    }
}

/// Feature weights in the order the service listed them.
pub fn decode_feature_importance(body: &[u8]) -> Result<Vec<(String, f64)>, ApiError> {
    if let Some(err) = service_error(body) {
        return Err(err);
    }
    let OrderedWeights(weights) = serde_json::from_slice(body)?;
    Ok(weights)
}

pub fn decode_health_response(body: &[u8]) -> Result<HealthResponse, ApiError> {
    Ok(serde_json::from_slice(body)?)
}

struct OrderedWeights(Vec<(String, f64)>);

impl<'de> Deserialize<'de> for OrderedWeights {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct WeightsVisitor;

        impl<'de> Visitor<'de> for WeightsVisitor {
            type Value = OrderedWeights;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of feature name to weight")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut weights = Vec::with_capacity(map.size_hint().unwrap_or(6));
                while let Some((name, weight)) = map.next_entry::<String, f64>()? {
                    weights.push((name, weight));
                }
                Ok(OrderedWeights(weights))
            }
        }

        deserializer.deserialize_map(WeightsVisitor)
    }
}
