use shared::{
    domain::{ConsensusResult, RequestSeq},
    error::ApiError,
    protocol::PredictionPayload,
};
use tracing::{debug, info};

use crate::consensus::{classical_consensus, global_consensus};

#[derive(Debug, Clone, PartialEq)]
pub struct ReadyResult {
    pub payload: PredictionPayload,
    /// Vote over every model.
    pub consensus: ConsensusResult,
    /// Vote over every model except `dl`.
    pub classical: ConsensusResult,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResultState {
    Empty,
    Loading(RequestSeq),
    Ready(ReadyResult),
    Failed(ApiError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    Ready,
    Failed,
    /// Outcome of a superseded request; nothing changed.
    Stale,
}

/// Latest prediction outcome. Only the most recently issued request may commit.
#[derive(Debug)]
pub struct PredictionResultStore {
    state: ResultState,
    latest: RequestSeq,
}

impl Default for PredictionResultStore {
    fn default() -> Self {
        Self {
            state: ResultState::Empty,
            latest: RequestSeq(0),
        }
    }
}

impl PredictionResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters `Loading` for a new request, dropping any previous result or error.
    pub fn begin(&mut self) -> RequestSeq {
        self.latest = self.latest.next();
        self.state = ResultState::Loading(self.latest);
        info!(seq = self.latest.0, "prediction request started");
        self.latest
    }

    pub fn resolve(
        &mut self,
        seq: RequestSeq,
        outcome: Result<PredictionPayload, ApiError>,
    ) -> Commit {
        if !matches!(self.state, ResultState::Loading(current) if current == seq) {
            debug!(
                seq = seq.0,
                latest = self.latest.0,
                "discarding stale prediction response"
            );
            return Commit::Stale;
        }

        match outcome {
            Ok(payload) => {
                let consensus = global_consensus(&payload.predictions);
                let classical = classical_consensus(&payload.predictions);
                info!(
                    seq = seq.0,
                    prediction = consensus.label(),
                    count = consensus.count,
                    total = consensus.total,
                    "prediction ready"
                );
                self.state = ResultState::Ready(ReadyResult {
                    payload,
                    consensus,
                    classical,
                });
                Commit::Ready
            }
            Err(err) => {
                info!(seq = seq.0, code = ?err.code, "prediction failed");
                self.state = ResultState::Failed(err);
                Commit::Failed
            }
        }
    }

    pub fn state(&self) -> &ResultState {
        &self.state
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.state, ResultState::Loading(_))
    }

    pub fn ready(&self) -> Option<&ReadyResult> {
        match &self.state {
            ResultState::Ready(ready) => Some(ready),
            _ => None,
        }
    }

    /// `Unknown 0/0` outside `Ready`.
    pub fn consensus(&self) -> ConsensusResult {
        self.ready()
            .map(|ready| ready.consensus)
            .unwrap_or_else(ConsensusResult::unknown)
    }
}
