//! Client-side core of NebulaLens: per-model prediction aggregation, the
//! result/explanation state machines and the session that drives them.

pub mod api;
pub mod config;
pub mod consensus;
pub mod explanation;
pub mod form;
pub mod metrics;
pub mod prediction_log;
pub mod ranking;
pub mod result_store;
mod session;
mod submission;

pub use api::{HttpInferenceApi, InferenceApi};
pub use config::{load_settings, Settings};
pub use consensus::{classical_consensus, compute_consensus, global_consensus};
pub use explanation::{ExplanationFetcher, ExplanationState, TypedReveal};
pub use form::{MissingFields, ParameterForm};
pub use prediction_log::{LogEntry, PredictionLog, PredictionRecord};
pub use ranking::{rank_descending, rank_probabilities};
pub use result_store::{PredictionResultStore, ReadyResult, ResultState};
pub use session::{Session, SessionEvent, SessionSettings, SessionSnapshot};
pub use submission::{SubmitError, PREDICTION_FAILED_MESSAGE};

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod session_tests;
