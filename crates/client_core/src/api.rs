use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use shared::{
    error::{ApiError, ErrorCode},
    protocol::{
        decode_explanation_response, decode_feature_importance, decode_health_response,
        decode_predict_response, ExplanationRequest, HealthResponse, PredictRequest,
        PredictionPayload,
    },
};
use tracing::debug;
use url::Url;

use crate::{config::Settings, ranking::rank_descending};

/// The remote inference and explanation service.
#[async_trait]
pub trait InferenceApi: Send + Sync {
    async fn predict(&self, input: &PredictRequest) -> Result<PredictionPayload, ApiError>;
    async fn explain(&self, request: &ExplanationRequest) -> Result<String, ApiError>;
    /// Feature weights, highest first.
    async fn feature_importance(&self) -> Result<Vec<(String, f64)>, ApiError>;
    async fn health(&self) -> Result<HealthResponse, ApiError>;
}

pub struct HttpInferenceApi {
    http: Client,
    api_base: Url,
    explanation_base: Url,
}

impl HttpInferenceApi {
    pub fn new(settings: &Settings) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = settings.request_timeout() {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().context("failed to build HTTP client")?;
        Self::with_client(
            http,
            &settings.api_base_url,
            settings.explanation_base_url(),
        )
    }

    pub fn with_client(http: Client, api_base: &str, explanation_base: &str) -> Result<Self> {
        Ok(Self {
            http,
            api_base: parse_base_url(api_base)?,
            explanation_base: parse_base_url(explanation_base)?,
        })
    }

    pub fn api_base(&self) -> &Url {
        &self.api_base
    }

    fn endpoint(base: &Url, path: &str) -> Result<Url, ApiError> {
        base.join(path)
            .map_err(|err| ApiError::transport(format!("invalid endpoint '{path}': {err}")))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Vec<u8>, ApiError> {
        let response = request
            .send()
            .await
            .map_err(transport_error)?
            .error_for_status()
            .map_err(transport_error)?;
        let body = response.bytes().await.map_err(transport_error)?;
        Ok(body.to_vec())
    }
}

/// Ensures the base path ends with `/` so `join` appends instead of replacing.
fn parse_base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw.trim()).with_context(|| format!("invalid base url '{raw}'"))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn transport_error(err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::new(ErrorCode::Timeout, err.to_string())
    } else {
        ApiError::transport(err.to_string())
    }
}

#[async_trait]
impl InferenceApi for HttpInferenceApi {
    async fn predict(&self, input: &PredictRequest) -> Result<PredictionPayload, ApiError> {
        let url = Self::endpoint(&self.api_base, "predict")?;
        debug!(%url, "POST predict");
        let body = self.send(self.http.post(url).json(input)).await?;
        decode_predict_response(&body)
    }

    async fn explain(&self, request: &ExplanationRequest) -> Result<String, ApiError> {
        let url = Self::endpoint(&self.explanation_base, "get_explanation")?;
        debug!(%url, prediction = %request.prediction, "POST get_explanation");
        let body = self.send(self.http.post(url).json(request)).await?;
        decode_explanation_response(&body)
    }

    async fn feature_importance(&self) -> Result<Vec<(String, f64)>, ApiError> {
        let url = Self::endpoint(&self.api_base, "feature_importance")?;
        debug!(%url, "GET feature_importance");
        let body = self.send(self.http.get(url)).await?;
        decode_feature_importance(&body).map(|weights| rank_descending(weights))
    }

    async fn health(&self) -> Result<HealthResponse, ApiError> {
        let url = Self::endpoint(&self.api_base, "health")?;
        let body = self.send(self.http.get(url)).await?;
        decode_health_response(&body)
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
