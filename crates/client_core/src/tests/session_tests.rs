use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use async_trait::async_trait;
use shared::{
    domain::{
        ClassLabel, ClassProbabilities, ExplanationGeneration, Feature, ModelId,
        PhotometricInput, PredictionEntry, RequestSeq,
    },
    error::{ApiError, ErrorCode},
    protocol::{ExplanationRequest, HealthResponse, PredictRequest, PredictionPayload},
};
use tokio::{
    sync::{broadcast, oneshot},
    time::{sleep, timeout, Instant},
};

use crate::{
    explanation::EXPLANATION_FAILED_MESSAGE, ExplanationState, InferenceApi, MissingFields,
    ResultState, Session, SessionEvent, SessionSettings, SubmitError,
    PREDICTION_FAILED_MESSAGE,
};

enum Reply<T> {
    Now(Result<T, ApiError>),
    Gate(oneshot::Receiver<Result<T, ApiError>>),
}

async fn settle<T>(reply: Option<Reply<T>>) -> Result<T, ApiError> {
    match reply {
        Some(Reply::Now(outcome)) => outcome,
        Some(Reply::Gate(rx)) => rx
            .await
            .unwrap_or_else(|_| Err(ApiError::transport("gate dropped"))),
        None => Err(ApiError::transport("no scripted reply")),
    }
}

/// Fake service: predictions are keyed by the `u` magnitude of the input,
/// explanations by the requested class.
#[derive(Default)]
struct ScriptedApi {
    predictions: StdMutex<HashMap<u64, Reply<PredictionPayload>>>,
    explanations: StdMutex<HashMap<ClassLabel, Reply<String>>>,
    predict_calls: StdMutex<Vec<PhotometricInput>>,
    explain_calls: StdMutex<Vec<ExplanationRequest>>,
}

impl ScriptedApi {
    fn reply_predict(&self, u: f64, outcome: Result<PredictionPayload, ApiError>) {
        self.predictions
            .lock()
            .unwrap()
            .insert(u.to_bits(), Reply::Now(outcome));
    }

    fn gate_predict(&self, u: f64) -> oneshot::Sender<Result<PredictionPayload, ApiError>> {
        let (tx, rx) = oneshot::channel();
        self.predictions
            .lock()
            .unwrap()
            .insert(u.to_bits(), Reply::Gate(rx));
        tx
    }

    fn reply_explain(&self, label: ClassLabel, outcome: Result<String, ApiError>) {
        self.explanations
            .lock()
            .unwrap()
            .insert(label, Reply::Now(outcome));
    }

    fn gate_explain(&self, label: ClassLabel) -> oneshot::Sender<Result<String, ApiError>> {
        let (tx, rx) = oneshot::channel();
        self.explanations
            .lock()
            .unwrap()
            .insert(label, Reply::Gate(rx));
        tx
    }

    fn explain_calls(&self) -> Vec<ExplanationRequest> {
        self.explain_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl InferenceApi for ScriptedApi {
    async fn predict(&self, input: &PredictRequest) -> Result<PredictionPayload, ApiError> {
        self.predict_calls.lock().unwrap().push(*input);
        let reply = self.predictions.lock().unwrap().remove(&input.u.to_bits());
        settle(reply).await
    }

    async fn explain(&self, request: &ExplanationRequest) -> Result<String, ApiError> {
        self.explain_calls.lock().unwrap().push(*request);
        let reply = self.explanations.lock().unwrap().remove(&request.prediction);
        settle(reply).await
    }

    async fn feature_importance(&self) -> Result<Vec<(String, f64)>, ApiError> {
        Ok(Vec::new())
    }

    async fn health(&self) -> Result<HealthResponse, ApiError> {
        Ok(HealthResponse {
            status: "ok".into(),
        })
    }
}

fn input(u: f64) -> PhotometricInput {
    PhotometricInput {
        u,
        g: 17.2,
        r: 16.8,
        i: 16.5,
        z: 16.3,
        redshift: 0.05,
    }
}

fn unanimous(label: ClassLabel) -> PredictionPayload {
    let predictions = [("rf", 0.9), ("svm", 0.8), ("dl", 0.95)]
        .into_iter()
        .map(|(model, confidence)| {
            (
                ModelId::new(model),
                PredictionEntry::new(
                    label,
                    Some(confidence),
                    ClassProbabilities::new([(label, confidence)]),
                ),
            )
        })
        .collect();
    PredictionPayload {
        predictions,
        performance: None,
        model_agreement: None,
        input_features: None,
    }
}

fn all_failed() -> PredictionPayload {
    PredictionPayload {
        predictions: [("rf", "not fitted"), ("svm", "not fitted")]
            .into_iter()
            .map(|(model, reason)| (ModelId::new(model), PredictionEntry::failed(reason)))
            .collect(),
        performance: None,
        model_agreement: None,
        input_features: None,
    }
}

fn settings(explanations_enabled: bool) -> SessionSettings {
    SessionSettings {
        explanations_enabled,
        reveal_interval: Duration::from_millis(5),
        log_capacity: None,
    }
}

async fn next_matching(
    events: &mut broadcast::Receiver<SessionEvent>,
    mut wanted: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    timeout(Duration::from_secs(30), async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) => {}
                Err(err) => panic!("event stream broke: {err}"),
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

async fn ready(events: &mut broadcast::Receiver<SessionEvent>, seq: RequestSeq) {
    next_matching(events, |event| {
        matches!(event, SessionEvent::PredictionReady { seq: s, .. } if *s == seq)
    })
    .await;
}

fn shown_text(state: &ExplanationState) -> &str {
    match state {
        ExplanationState::Shown(reveal) => reveal.visible(),
        other => panic!("explanation not shown: {other:?}"),
    }
}

#[tokio::test]
async fn late_response_of_superseded_submission_is_discarded() {
    let api = Arc::new(ScriptedApi::default());
    let first_gate = api.gate_predict(1.0);
    let second_gate = api.gate_predict(2.0);
    let session = Session::new(api.clone(), settings(false));
    let mut events = session.subscribe();

    let first = session.submit(input(1.0)).await.expect("first submit");
    let second = session.submit(input(2.0)).await.expect("second submit");
    assert!(second > first);

    second_gate
        .send(Ok(unanimous(ClassLabel::Galaxy)))
        .expect("second gate");
    ready(&mut events, second).await;

    first_gate
        .send(Ok(unanimous(ClassLabel::Star)))
        .expect("first gate");
    next_matching(&mut events, |event| {
        matches!(event, SessionEvent::StalePredictionDiscarded { seq } if *seq == first)
    })
    .await;

    let snapshot = session.snapshot().await;
    let ResultState::Ready(result) = &snapshot.result else {
        panic!("expected ready result, got {:?}", snapshot.result);
    };
    assert_eq!(result.consensus.prediction, Some(ClassLabel::Galaxy));
    assert_eq!(snapshot.log.len(), 1);
}

#[tokio::test]
async fn early_response_of_superseded_submission_keeps_loading() {
    let api = Arc::new(ScriptedApi::default());
    let first_gate = api.gate_predict(1.0);
    let _second_gate = api.gate_predict(2.0);
    let session = Session::new(api.clone(), settings(false));
    let mut events = session.subscribe();

    let first = session.submit(input(1.0)).await.expect("first submit");
    let second = session.submit(input(2.0)).await.expect("second submit");

    first_gate
        .send(Err(ApiError::transport("reset by peer")))
        .expect("first gate");
    next_matching(&mut events, |event| {
        matches!(event, SessionEvent::StalePredictionDiscarded { seq } if *seq == first)
    })
    .await;

    let snapshot = session.snapshot().await;
    assert_eq!(snapshot.result, ResultState::Loading(second));
    assert!(snapshot.is_loading());
}

#[tokio::test]
async fn every_success_is_logged_newest_first() {
    let api = Arc::new(ScriptedApi::default());
    let session = Session::new(api.clone(), settings(false));
    let mut events = session.subscribe();

    let labels = [ClassLabel::Star, ClassLabel::Galaxy, ClassLabel::Qso];
    for (n, label) in labels.into_iter().enumerate() {
        let u = 15.0 + n as f64;
        api.reply_predict(u, Ok(unanimous(label)));
        let seq = session.submit(input(u)).await.expect("submit");
        ready(&mut events, seq).await;
    }

    let log = session.snapshot().await.log;
    assert_eq!(log.len(), 3);
    let logged: Vec<_> = log
        .iter()
        .map(|entry| entry.record.consensus.prediction)
        .collect();
    assert_eq!(
        logged,
        vec![
            Some(ClassLabel::Qso),
            Some(ClassLabel::Galaxy),
            Some(ClassLabel::Star)
        ]
    );
    assert_eq!(log[0].record.input, input(17.0));
    let ids: HashSet<_> = log.iter().map(|entry| entry.id).collect();
    assert_eq!(ids.len(), 3);
}

#[tokio::test]
async fn failed_prediction_shows_generic_message_and_skips_explanation() {
    let api = Arc::new(ScriptedApi::default());
    api.reply_predict(1.0, Err(ApiError::transport("connection refused")));
    let session = Session::new(api.clone(), settings(true));
    let mut events = session.subscribe();

    let seq = session.submit(input(1.0)).await.expect("submit");
    let event = next_matching(&mut events, |event| {
        matches!(event, SessionEvent::PredictionFailed { .. })
    })
    .await;
    let SessionEvent::PredictionFailed { seq: failed, error } = event else {
        unreachable!();
    };
    assert_eq!(failed, seq);
    assert_eq!(error.code, ErrorCode::Transport);
    assert_eq!(error.message, PREDICTION_FAILED_MESSAGE);

    let snapshot = session.snapshot().await;
    assert_eq!(snapshot.result, ResultState::Failed(error));
    assert_eq!(snapshot.explanation, ExplanationState::Idle);
    assert!(snapshot.log.is_empty());
    assert!(api.explain_calls().is_empty());
}

#[tokio::test]
async fn disabled_explanations_never_reach_the_service() {
    let api = Arc::new(ScriptedApi::default());
    api.reply_predict(1.0, Ok(unanimous(ClassLabel::Star)));
    let session = Session::new(api.clone(), settings(false));
    let mut events = session.subscribe();

    let seq = session.submit(input(1.0)).await.expect("submit");
    ready(&mut events, seq).await;
    sleep(Duration::from_millis(50)).await;

    let snapshot = session.snapshot().await;
    assert!(!snapshot.explanations_enabled);
    assert_eq!(snapshot.explanation, ExplanationState::Idle);
    assert!(api.explain_calls().is_empty());
}

#[tokio::test]
async fn unknown_consensus_requests_no_explanation() {
    let api = Arc::new(ScriptedApi::default());
    api.reply_predict(1.0, Ok(all_failed()));
    let session = Session::new(api.clone(), settings(true));
    let mut events = session.subscribe();

    let seq = session.submit(input(1.0)).await.expect("submit");
    ready(&mut events, seq).await;

    let snapshot = session.snapshot().await;
    let ResultState::Ready(result) = &snapshot.result else {
        panic!("expected ready result");
    };
    assert!(result.consensus.is_unknown());
    assert_eq!(snapshot.explanation, ExplanationState::Idle);
    assert!(api.explain_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn explanation_types_out_one_char_per_interval() {
    let api = Arc::new(ScriptedApi::default());
    api.reply_predict(1.0, Ok(unanimous(ClassLabel::Star)));
    api.reply_explain(ClassLabel::Star, Ok("Hot!".into()));
    let session = Session::new(api.clone(), settings(true));
    let mut events = session.subscribe();

    session.submit(input(1.0)).await.expect("submit");
    next_matching(&mut events, |event| {
        matches!(event, SessionEvent::ExplanationShown { .. })
    })
    .await;
    let shown_at = Instant::now();
    assert_eq!(shown_text(&session.snapshot().await.explanation), "");
    assert_eq!(session.active_reveal_timers(), 1);

    let mut typed = String::new();
    loop {
        match next_matching(&mut events, |event| {
            matches!(
                event,
                SessionEvent::ExplanationAppended { .. } | SessionEvent::ExplanationComplete { .. }
            )
        })
        .await
        {
            SessionEvent::ExplanationAppended { ch, index, .. } => {
                assert_eq!(index, typed.chars().count());
                typed.push(ch);
            }
            _ => break,
        }
    }
    assert_eq!(typed, "Hot!");
    assert!(shown_at.elapsed() >= Duration::from_millis(5) * 4);
    assert_eq!(shown_text(&session.snapshot().await.explanation), "Hot!");

    let request = api.explain_calls()[0];
    assert_eq!(request.prediction, ClassLabel::Star);
    assert!((request.confidence - (0.9 + 0.8 + 0.95) / 3.0).abs() < 1e-9);

    sleep(Duration::from_millis(20)).await;
    assert_eq!(session.active_reveal_timers(), 0);
}

#[tokio::test]
async fn explanation_failure_uses_generic_message() {
    let api = Arc::new(ScriptedApi::default());
    api.reply_predict(1.0, Ok(unanimous(ClassLabel::Qso)));
    api.reply_predict(2.0, Ok(unanimous(ClassLabel::Galaxy)));
    api.reply_explain(
        ClassLabel::Qso,
        Err(ApiError::service("Gemini model is not initialized.")),
    );
    api.reply_explain(ClassLabel::Galaxy, Ok(String::new()));
    let session = Session::new(api.clone(), settings(true));
    let mut events = session.subscribe();

    session.submit(input(1.0)).await.expect("submit");
    let SessionEvent::ExplanationFailed { error, .. } = next_matching(&mut events, |event| {
        matches!(event, SessionEvent::ExplanationFailed { .. })
    })
    .await
    else {
        unreachable!();
    };
    assert_eq!(error.code, ErrorCode::Service);
    assert_eq!(error.message, EXPLANATION_FAILED_MESSAGE);

    let snapshot = session.snapshot().await;
    let ResultState::Ready(result) = &snapshot.result else {
        panic!("explanation failure replaced the result: {:?}", snapshot.result);
    };
    assert_eq!(result.consensus.prediction, Some(ClassLabel::Qso));
    assert_eq!(result.consensus.count, 3);
    assert_eq!(snapshot.log.len(), 1);
    assert_eq!(snapshot.log[0].record.consensus, result.consensus);

    session.submit(input(2.0)).await.expect("submit");
    let SessionEvent::ExplanationFailed { error, .. } = next_matching(&mut events, |event| {
        matches!(event, SessionEvent::ExplanationFailed { .. })
    })
    .await
    else {
        unreachable!();
    };
    assert_eq!(error.code, ErrorCode::EmptyExplanation);
    let snapshot = session.snapshot().await;
    assert_eq!(snapshot.explanation, ExplanationState::Failed(error));
    assert!(matches!(
        &snapshot.result,
        ResultState::Ready(result) if result.consensus.prediction == Some(ClassLabel::Galaxy)
    ));
    assert_eq!(snapshot.log.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn new_explanation_fully_replaces_the_previous_reveal() {
    let long_star_text = "Stars are self-luminous spheres of plasma. ".repeat(8);
    let api = Arc::new(ScriptedApi::default());
    api.reply_predict(1.0, Ok(unanimous(ClassLabel::Star)));
    api.reply_predict(2.0, Ok(unanimous(ClassLabel::Galaxy)));
    api.reply_explain(ClassLabel::Star, Ok(long_star_text));
    api.reply_explain(ClassLabel::Galaxy, Ok("Galaxy.".into()));
    let session = Session::new(api.clone(), settings(true));
    let mut events = session.subscribe();

    session.submit(input(1.0)).await.expect("first submit");
    let SessionEvent::ExplanationAppended {
        generation: first_generation,
        ..
    } = next_matching(&mut events, |event| {
        matches!(event, SessionEvent::ExplanationAppended { .. })
    })
    .await
    else {
        unreachable!();
    };
    assert_eq!(session.active_reveal_timers(), 1);

    let second = session.submit(input(2.0)).await.expect("second submit");
    assert_eq!(session.snapshot().await.explanation, ExplanationState::Idle);
    next_matching(&mut events, |event| {
        matches!(event, SessionEvent::PredictionStarted { seq } if *seq == second)
    })
    .await;

    let mut typed = String::new();
    loop {
        match next_matching(&mut events, |event| {
            matches!(
                event,
                SessionEvent::ExplanationShown { .. }
                    | SessionEvent::ExplanationAppended { .. }
                    | SessionEvent::ExplanationComplete { .. }
            )
        })
        .await
        {
            SessionEvent::ExplanationShown { generation } => {
                assert!(generation > first_generation);
                assert_eq!(session.active_reveal_timers(), 1);
            }
            SessionEvent::ExplanationAppended { generation, ch, .. } => {
                assert_ne!(generation, first_generation, "old reveal kept typing");
                typed.push(ch);
            }
            _ => break,
        }
    }

    assert_eq!(typed, "Galaxy.");
    assert_eq!(
        shown_text(&session.snapshot().await.explanation),
        "Galaxy."
    );
    assert!(session.active_reveal_timers() <= 1);
}

#[tokio::test]
async fn superseded_explanation_fetch_never_shows() {
    let api = Arc::new(ScriptedApi::default());
    api.reply_predict(1.0, Ok(unanimous(ClassLabel::Star)));
    api.reply_predict(2.0, Ok(unanimous(ClassLabel::Qso)));
    let star_gate = api.gate_explain(ClassLabel::Star);
    let qso_gate = api.gate_explain(ClassLabel::Qso);
    let session = Session::new(api.clone(), settings(true));
    let mut events = session.subscribe();

    session.submit(input(1.0)).await.expect("first submit");
    let SessionEvent::ExplanationFetching {
        generation: star_generation,
    } = next_matching(&mut events, |event| {
        matches!(event, SessionEvent::ExplanationFetching { .. })
    })
    .await
    else {
        unreachable!();
    };

    session.submit(input(2.0)).await.expect("second submit");
    let SessionEvent::ExplanationFetching {
        generation: qso_generation,
    } = next_matching(&mut events, |event| {
        matches!(event, SessionEvent::ExplanationFetching { .. })
    })
    .await
    else {
        unreachable!();
    };
    assert!(qso_generation > star_generation);

    // The star fetch was aborted, so its gate may already be closed.
    let _ = star_gate.send(Ok("Stars.".into()));
    qso_gate.send(Ok("Quasars.".into())).expect("qso gate");

    let shown = next_matching(&mut events, |event| {
        matches!(event, SessionEvent::ExplanationShown { .. })
    })
    .await;
    assert_eq!(
        shown,
        SessionEvent::ExplanationShown {
            generation: qso_generation
        }
    );
    next_matching(&mut events, |event| {
        matches!(event, SessionEvent::ExplanationComplete { .. })
    })
    .await;
    let snapshot = session.snapshot().await;
    assert_eq!(shown_text(&snapshot.explanation), "Quasars.");
    assert_eq!(snapshot.explanation_generation, qso_generation);
}

#[tokio::test(start_paused = true)]
async fn teardown_freezes_the_session() {
    let api = Arc::new(ScriptedApi::default());
    api.reply_predict(1.0, Ok(unanimous(ClassLabel::Galaxy)));
    api.reply_explain(ClassLabel::Galaxy, Ok("Galaxies ".repeat(40)));
    let session = Session::new(api.clone(), settings(true));
    let mut events = session.subscribe();

    session.submit(input(1.0)).await.expect("submit");
    next_matching(&mut events, |event| {
        matches!(event, SessionEvent::ExplanationAppended { .. })
    })
    .await;

    session.teardown().await;
    assert!(session.is_torn_down().await);
    let frozen = session.snapshot().await;
    let visible = shown_text(&frozen.explanation).to_string();
    assert!(!visible.is_empty());

    sleep(Duration::from_secs(1)).await;

    let later = session.snapshot().await;
    assert_eq!(shown_text(&later.explanation), visible);
    assert_eq!(later.result, frozen.result);
    assert_eq!(later.log.len(), frozen.log.len());
    assert_eq!(session.active_reveal_timers(), 0);

    assert_eq!(
        session.submit(input(2.0)).await,
        Err(SubmitError::TornDown)
    );
}

#[tokio::test]
async fn teardown_drops_pending_prediction() {
    let api = Arc::new(ScriptedApi::default());
    let gate = api.gate_predict(1.0);
    let session = Session::new(api.clone(), settings(false));

    let seq = session.submit(input(1.0)).await.expect("submit");
    session.teardown().await;
    let _ = gate.send(Ok(unanimous(ClassLabel::Star)));
    sleep(Duration::from_millis(50)).await;

    let snapshot = session.snapshot().await;
    assert_eq!(snapshot.result, ResultState::Loading(seq));
    assert!(snapshot.log.is_empty());
}

#[tokio::test(start_paused = true)]
async fn dropping_the_session_stops_its_reveal_timer() {
    let api = Arc::new(ScriptedApi::default());
    api.reply_predict(1.0, Ok(unanimous(ClassLabel::Star)));
    api.reply_explain(ClassLabel::Star, Ok("Twinkle ".repeat(50)));
    let session = Session::new(api.clone(), settings(true));
    let mut events = session.subscribe();
    let live_timers = Arc::clone(&session.shared.live_reveal_timers);

    session.submit(input(1.0)).await.expect("submit");
    next_matching(&mut events, |event| {
        matches!(event, SessionEvent::ExplanationAppended { .. })
    })
    .await;
    assert_eq!(session.active_reveal_timers(), 1);

    drop(session);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(live_timers.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn submit_form_requires_every_parameter() {
    let api = Arc::new(ScriptedApi::default());
    let session = Session::new(api.clone(), settings(false));
    let mut events = session.subscribe();

    session.set_field(Feature::U, 19.0).await;
    session.set_field(Feature::G, 18.0).await;
    let err = session.submit_form().await.expect_err("incomplete form");
    assert_eq!(
        err,
        SubmitError::Incomplete(MissingFields(vec![
            Feature::R,
            Feature::I,
            Feature::Z,
            Feature::Redshift
        ]))
    );
    assert_eq!(session.snapshot().await.result, ResultState::Empty);

    assert!(session.load_preset(ClassLabel::Qso).await);
    let preset = PhotometricInput::example(ClassLabel::Qso).expect("qso preset");
    api.reply_predict(preset.u, Ok(unanimous(ClassLabel::Qso)));
    let seq = session.submit_form().await.expect("complete form");
    ready(&mut events, seq).await;
    assert_eq!(*api.predict_calls.lock().unwrap(), vec![preset]);

    session.clear_field(Feature::Z).await;
    assert_eq!(session.form().await.missing(), vec![Feature::Z]);
}

#[test]
fn generations_only_move_forward() {
    let first = ExplanationGeneration(0);
    assert!(first.next() > first);
    assert_eq!(RequestSeq(41).next(), RequestSeq(42));
}
