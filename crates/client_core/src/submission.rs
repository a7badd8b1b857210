use std::sync::Arc;

use shared::{
    domain::{PhotometricInput, RequestSeq},
    error::ApiError,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    explanation::start_explanation,
    form::MissingFields,
    prediction_log::PredictionRecord,
    result_store::{Commit, ResultState},
    session::{Session, SessionEvent, SessionShared},
};

pub const PREDICTION_FAILED_MESSAGE: &str = "Failed to get prediction.";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Incomplete(#[from] MissingFields),
    #[error("session has been torn down")]
    TornDown,
}

impl Session {
    /// Starts one inference request. The store enters `Loading` immediately; the
    /// response is committed only if no newer submission was made meanwhile.
    pub async fn submit(&self, input: PhotometricInput) -> Result<RequestSeq, SubmitError> {
        let shared = &self.shared;
        let mut state = shared.state.lock().await;
        if state.torn_down {
            return Err(SubmitError::TornDown);
        }

        let seq = state.results.begin();
        state.explanation.reset();
        shared.stop_explanation_tasks();
        shared.emit(SessionEvent::PredictionStarted { seq });

        let task_shared = Arc::clone(shared);
        let handle = tokio::spawn(run_prediction(task_shared, seq, input));
        shared.register_prediction(handle);
        Ok(seq)
    }

    /// Submits the current form values; every field is required.
    pub async fn submit_form(&self) -> Result<RequestSeq, SubmitError> {
        let input = self.form().await.to_input()?;
        self.submit(input).await
    }
}

async fn run_prediction(shared: Arc<SessionShared>, seq: RequestSeq, input: PhotometricInput) {
    let outcome = shared.api.predict(&input).await;

    let mut guard = shared.state.lock().await;
    let state = &mut *guard;
    if state.torn_down {
        return;
    }

    let outcome = outcome.map_err(|err: ApiError| {
        warn!(seq = seq.0, "prediction request failed: {err}");
        err.with_message(PREDICTION_FAILED_MESSAGE)
    });

    match state.results.resolve(seq, outcome) {
        Commit::Ready => {
            let Some(ready) = state.results.ready() else {
                return;
            };
            let consensus = ready.consensus;
            let record = PredictionRecord {
                input,
                consensus,
                payload: ready.payload.clone(),
            };
            let log_id = state.log.append(record);
            shared.emit(SessionEvent::PredictionReady { seq, log_id });

            if shared.settings.explanations_enabled {
                start_explanation(&shared, state, consensus);
            }
        }
        Commit::Failed => {
            if let ResultState::Failed(error) = state.results.state() {
                shared.emit(SessionEvent::PredictionFailed {
                    seq,
                    error: error.clone(),
                });
            }
        }
        Commit::Stale => {
            debug!(seq = seq.0, "prediction response arrived after a newer submission");
            shared.emit(SessionEvent::StalePredictionDiscarded { seq });
        }
    }
}
