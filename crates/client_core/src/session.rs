//! Per-page session: owns the form, result store, explanation panel and log,
//! plus every task spawned on their behalf.

use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use shared::{
    domain::{ClassLabel, ExplanationGeneration, Feature, RequestSeq},
    error::ApiError,
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    api::InferenceApi,
    explanation::{ExplanationFetcher, ExplanationState},
    form::ParameterForm,
    prediction_log::{LogEntry, PredictionLog},
    result_store::{PredictionResultStore, ResultState},
};

const SESSION_EVENT_CAPACITY: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub explanations_enabled: bool,
    pub reveal_interval: Duration,
    pub log_capacity: Option<NonZeroUsize>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            explanations_enabled: false,
            reveal_interval: Duration::from_millis(5),
            log_capacity: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PredictionStarted {
        seq: RequestSeq,
    },
    PredictionReady {
        seq: RequestSeq,
        log_id: Uuid,
    },
    PredictionFailed {
        seq: RequestSeq,
        error: ApiError,
    },
    StalePredictionDiscarded {
        seq: RequestSeq,
    },
    ExplanationFetching {
        generation: ExplanationGeneration,
    },
    ExplanationShown {
        generation: ExplanationGeneration,
    },
    ExplanationAppended {
        generation: ExplanationGeneration,
        /// Character position within the explanation, starting at 0.
        index: usize,
        ch: char,
    },
    ExplanationComplete {
        generation: ExplanationGeneration,
    },
    ExplanationFailed {
        generation: ExplanationGeneration,
        error: ApiError,
    },
    StaleExplanationDiscarded {
        generation: ExplanationGeneration,
    },
    TornDown,
}

pub(crate) struct SessionState {
    pub(crate) form: ParameterForm,
    pub(crate) results: PredictionResultStore,
    pub(crate) explanation: ExplanationFetcher,
    pub(crate) log: PredictionLog,
    pub(crate) torn_down: bool,
}

#[derive(Default)]
struct TaskRegistry {
    closed: bool,
    predictions: Vec<JoinHandle<()>>,
    explanation_fetch: Option<JoinHandle<()>>,
    reveal_timer: Option<JoinHandle<()>>,
}

impl TaskRegistry {
    fn abort_all(&mut self) {
        for handle in self.predictions.drain(..) {
            handle.abort();
        }
        if let Some(handle) = self.explanation_fetch.take() {
            handle.abort();
        }
        if let Some(handle) = self.reveal_timer.take() {
            handle.abort();
        }
    }
}

pub(crate) struct SessionShared {
    pub(crate) api: Arc<dyn InferenceApi>,
    pub(crate) settings: SessionSettings,
    pub(crate) state: Mutex<SessionState>,
    pub(crate) live_reveal_timers: Arc<AtomicUsize>,
    events: broadcast::Sender<SessionEvent>,
    tasks: StdMutex<TaskRegistry>,
}

impl SessionShared {
    pub(crate) fn emit(&self, event: SessionEvent) {
        // No subscribers is fine; views may not be listening yet.
        let _ = self.events.send(event);
    }

    fn with_tasks(&self, f: impl FnOnce(&mut TaskRegistry)) {
        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut tasks);
    }

    pub(crate) fn register_prediction(&self, handle: JoinHandle<()>) {
        self.with_tasks(|tasks| {
            if tasks.closed {
                handle.abort();
                return;
            }
            tasks.predictions.retain(|task| !task.is_finished());
            tasks.predictions.push(handle);
        });
    }

    pub(crate) fn register_explanation_fetch(&self, handle: JoinHandle<()>) {
        self.with_tasks(|tasks| {
            if tasks.closed {
                handle.abort();
                return;
            }
            if let Some(previous) = tasks.explanation_fetch.replace(handle) {
                previous.abort();
            }
        });
    }

    pub(crate) fn register_reveal_timer(&self, handle: JoinHandle<()>) {
        self.with_tasks(|tasks| {
            if tasks.closed {
                handle.abort();
                return;
            }
            if let Some(previous) = tasks.reveal_timer.replace(handle) {
                previous.abort();
            }
        });
    }

    /// Aborts the in-flight explanation fetch and the reveal timer, if any.
    pub(crate) fn stop_explanation_tasks(&self) {
        self.with_tasks(|tasks| {
            if let Some(handle) = tasks.explanation_fetch.take() {
                handle.abort();
            }
            if let Some(handle) = tasks.reveal_timer.take() {
                handle.abort();
            }
        });
    }

    fn close_tasks(&self) {
        self.with_tasks(|tasks| {
            tasks.closed = true;
            tasks.abort_all();
        });
    }
}

/// Read-only copy of the session for rendering.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub form: ParameterForm,
    pub result: ResultState,
    pub explanation: ExplanationState,
    /// Generation `explanation` belongs to.
    pub explanation_generation: ExplanationGeneration,
    pub explanations_enabled: bool,
    pub log: Vec<LogEntry>,
}

impl SessionSnapshot {
    pub fn is_loading(&self) -> bool {
        matches!(self.result, ResultState::Loading(_))
    }
}

/// One page session. Not `Clone`: views borrow it, and dropping it tears it down.
pub struct Session {
    pub(crate) shared: Arc<SessionShared>,
}

impl Session {
    pub fn new(api: Arc<dyn InferenceApi>, settings: SessionSettings) -> Self {
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        let log = PredictionLog::with_capacity(settings.log_capacity);
        Self {
            shared: Arc::new(SessionShared {
                api,
                settings,
                state: Mutex::new(SessionState {
                    form: ParameterForm::default(),
                    results: PredictionResultStore::new(),
                    explanation: ExplanationFetcher::new(),
                    log,
                    torn_down: false,
                }),
                live_reveal_timers: Arc::new(AtomicUsize::new(0)),
                events,
                tasks: StdMutex::new(TaskRegistry::default()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.shared.state.lock().await;
        SessionSnapshot {
            form: state.form.clone(),
            result: state.results.state().clone(),
            explanation: state.explanation.state().clone(),
            explanation_generation: state.explanation.generation(),
            explanations_enabled: self.shared.settings.explanations_enabled,
            log: state.log.entries().cloned().collect(),
        }
    }

    pub async fn form(&self) -> ParameterForm {
        self.shared.state.lock().await.form.clone()
    }

    pub async fn set_field(&self, feature: Feature, value: f64) {
        self.shared.state.lock().await.form.set(feature, value);
    }

    pub async fn clear_field(&self, feature: Feature) {
        self.shared.state.lock().await.form.clear(feature);
    }

    /// Returns `false` for `ClassLabel::Error`, which has no example object.
    pub async fn load_preset(&self, class: ClassLabel) -> bool {
        self.shared.state.lock().await.form.load_preset(class)
    }

    /// Number of reveal timers currently alive; never more than one.
    pub fn active_reveal_timers(&self) -> usize {
        self.shared.live_reveal_timers.load(Ordering::SeqCst)
    }

    pub async fn is_torn_down(&self) -> bool {
        self.shared.state.lock().await.torn_down
    }

    /// Stops every pending request callback and timer. Afterwards no task writes
    /// to the session state again.
    pub async fn teardown(&self) {
        {
            let mut state = self.shared.state.lock().await;
            if state.torn_down {
                return;
            }
            state.torn_down = true;
        }
        self.shared.close_tasks();
        info!("session torn down");
        self.shared.emit(SessionEvent::TornDown);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.close_tasks();
        if let Ok(mut state) = self.shared.state.try_lock() {
            state.torn_down = true;
        } else {
            debug!("session dropped while state was locked; tasks already aborted");
        }
    }
}
