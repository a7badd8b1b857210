//! Natural-language explanation of the current consensus, revealed one
//! character per timer tick.
//!
//! [`ExplanationFetcher`] is the synchronous state machine; the functions at the
//! bottom spawn the fetch and reveal tasks on behalf of a [`crate::Session`].

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use shared::{
    domain::{ConsensusResult, ExplanationGeneration},
    error::ApiError,
    protocol::ExplanationRequest,
};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::session::{SessionEvent, SessionShared, SessionState};

pub const EXPLANATION_FAILED_MESSAGE: &str = "Failed to fetch explanation.";

/// Typing effect over a fixed source string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedReveal {
    source: String,
    shown_bytes: usize,
    shown_chars: usize,
}

impl TypedReveal {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            shown_bytes: 0,
            shown_chars: 0,
        }
    }

    /// Reveals the next character, or returns `None` once everything is shown.
    pub fn advance(&mut self) -> Option<char> {
        let next = self.source[self.shown_bytes..].chars().next()?;
        self.shown_bytes += next.len_utf8();
        self.shown_chars += 1;
        Some(next)
    }

    pub fn visible(&self) -> &str {
        &self.source[..self.shown_bytes]
    }

    /// Number of characters revealed so far.
    pub fn shown_chars(&self) -> usize {
        self.shown_chars
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_complete(&self) -> bool {
        self.shown_bytes == self.source.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExplanationState {
    Idle,
    Fetching,
    Shown(TypedReveal),
    Failed(ApiError),
}

impl ExplanationState {
    /// Shown and not yet fully revealed.
    pub fn is_typing(&self) -> bool {
        matches!(self, ExplanationState::Shown(reveal) if !reveal.is_complete())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevealTick {
    /// `index` is the character position of `ch` within the source.
    Appended {
        ch: char,
        index: usize,
        complete: bool,
    },
    /// The reveal belongs to an older generation or is already done; stop the timer.
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExplanationCommit {
    Shown,
    Failed,
    Stale,
}

#[derive(Debug)]
pub struct ExplanationFetcher {
    state: ExplanationState,
    generation: ExplanationGeneration,
}

impl Default for ExplanationFetcher {
    fn default() -> Self {
        Self {
            state: ExplanationState::Idle,
            generation: ExplanationGeneration(0),
        }
    }
}

impl ExplanationFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new fetch. Anything belonging to an earlier generation becomes stale.
    pub fn trigger(&mut self) -> ExplanationGeneration {
        self.generation = self.generation.next();
        self.state = ExplanationState::Fetching;
        self.generation
    }

    /// Back to `Idle`, invalidating any in-flight fetch or reveal.
    pub fn reset(&mut self) {
        self.generation = self.generation.next();
        self.state = ExplanationState::Idle;
    }

    pub fn resolve(
        &mut self,
        generation: ExplanationGeneration,
        outcome: Result<String, ApiError>,
    ) -> ExplanationCommit {
        if generation != self.generation || self.state != ExplanationState::Fetching {
            return ExplanationCommit::Stale;
        }
        match outcome {
            Ok(text) if !text.is_empty() => {
                self.state = ExplanationState::Shown(TypedReveal::new(text));
                ExplanationCommit::Shown
            }
            Ok(_) => {
                self.state = ExplanationState::Failed(ApiError::new(
                    shared::error::ErrorCode::EmptyExplanation,
                    EXPLANATION_FAILED_MESSAGE,
                ));
                ExplanationCommit::Failed
            }
            Err(err) => {
                self.state = ExplanationState::Failed(err);
                ExplanationCommit::Failed
            }
        }
    }

    pub fn tick(&mut self, generation: ExplanationGeneration) -> RevealTick {
        if generation != self.generation {
            return RevealTick::Stop;
        }
        let ExplanationState::Shown(reveal) = &mut self.state else {
            return RevealTick::Stop;
        };
        match reveal.advance() {
            Some(ch) => RevealTick::Appended {
                ch,
                index: reveal.shown_chars() - 1,
                complete: reveal.is_complete(),
            },
            None => RevealTick::Stop,
        }
    }

    pub fn state(&self) -> &ExplanationState {
        &self.state
    }

    pub fn generation(&self) -> ExplanationGeneration {
        self.generation
    }

    pub fn is_typing(&self) -> bool {
        self.state.is_typing()
    }
}

/// Counts running reveal timers; decremented when the task is dropped, aborted or not.
pub(crate) struct RevealTimerGuard(Arc<AtomicUsize>);

impl RevealTimerGuard {
    pub(crate) fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for RevealTimerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Triggers a fetch for `consensus`, replacing whatever the panel showed.
/// Called with the session state locked, right after a `Ready` commit.
pub(crate) fn start_explanation(
    shared: &Arc<SessionShared>,
    state: &mut SessionState,
    consensus: ConsensusResult,
) {
    let Some(prediction) = consensus.prediction else {
        state.explanation.reset();
        shared.stop_explanation_tasks();
        return;
    };

    let generation = state.explanation.trigger();
    shared.stop_explanation_tasks();
    shared.emit(SessionEvent::ExplanationFetching { generation });

    let request = ExplanationRequest {
        prediction,
        confidence: consensus.confidence.unwrap_or_default(),
    };
    debug!(
        generation = generation.0,
        prediction = %prediction,
        "requesting explanation"
    );

    let task_shared = Arc::clone(shared);
    let handle = tokio::spawn(async move {
        let outcome = task_shared.api.explain(&request).await;
        let mut state = task_shared.state.lock().await;
        if state.torn_down {
            return;
        }
        let outcome = outcome.map_err(|err| {
            warn!(generation = generation.0, "explanation request failed: {err}");
            err.with_message(EXPLANATION_FAILED_MESSAGE)
        });
        match state.explanation.resolve(generation, outcome) {
            ExplanationCommit::Shown => {
                info!(generation = generation.0, "explanation received");
                task_shared.emit(SessionEvent::ExplanationShown { generation });
                let period = task_shared.settings.reveal_interval;
                start_reveal_timer(&task_shared, generation, period);
            }
            ExplanationCommit::Failed => {
                if let ExplanationState::Failed(error) = state.explanation.state() {
                    task_shared.emit(SessionEvent::ExplanationFailed {
                        generation,
                        error: error.clone(),
                    });
                }
            }
            ExplanationCommit::Stale => {
                debug!(generation = generation.0, "discarding stale explanation");
                task_shared.emit(SessionEvent::StaleExplanationDiscarded { generation });
            }
        }
    });
    shared.register_explanation_fetch(handle);
}

fn start_reveal_timer(
    shared: &Arc<SessionShared>,
    generation: ExplanationGeneration,
    period: Duration,
) {
    let guard = RevealTimerGuard::new(Arc::clone(&shared.live_reveal_timers));
    let task_shared = Arc::clone(shared);
    let handle = tokio::spawn(async move {
        let _guard = guard;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let mut state = task_shared.state.lock().await;
            if state.torn_down {
                return;
            }
            match state.explanation.tick(generation) {
                RevealTick::Appended {
                    ch,
                    index,
                    complete,
                } => {
                    task_shared.emit(SessionEvent::ExplanationAppended {
                        generation,
                        index,
                        ch,
                    });
                    if complete {
                        debug!(generation = generation.0, "explanation fully revealed");
                        task_shared.emit(SessionEvent::ExplanationComplete { generation });
                        return;
                    }
                }
                RevealTick::Stop => return,
            }
        }
    });
    shared.register_reveal_timer(handle);
}
