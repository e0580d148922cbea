//! Question/answer state machine of one diagnostic session.
//!
//! The coordinator owns the session identifiers, the outstanding clarifying
//! questions and the reasoning stream. Stream lifetime follows the session
//! status: a new submission or [`reset`](DiagnosticSessionCoordinator::reset)
//! tears the previous stream down, and no stream outlives `Complete`.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::answer::Answers;
use crate::api::{AnswerRequest, PredictionApi, PredictionReport, PredictionResponse, SymptomRequest};
use crate::config::CoordinatorConfig;
use crate::error::{DiagnosticError, Result};
use crate::question::{ClarifyingQuestion, normalize_question_list};
use crate::resolver::SessionIdResolver;
use crate::step_log::{ReasoningStep, StepLog};
use crate::stream::{ConnectionState, EventTransport, ReasoningStreamClient, StepFeed};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Idle,
    Submitting,
    AwaitingAnswers,
    /// Finalized, waiting briefly for the stream's `complete` event
    Streaming,
    Complete,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticSession {
    pub result_id: Option<String>,
    pub session_id: Option<String>,
    pub symptoms: Vec<String>,
    pub status: SessionStatus,
}

/// Result of a successful submission
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The backend wants these questions answered before it can finish
    NeedsAnswers {
        questions: Vec<ClarifyingQuestion>,
        notice: Option<String>,
    },
    Complete {
        report: PredictionReport,
        notice: Option<String>,
    },
}

/// How an incoming session id relates to the tracked one
#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionChange {
    Unchanged,
    Assigned(String),
    Replaced { previous: String, current: String },
}

fn reconcile_session_id(current: Option<&str>, incoming: Option<String>) -> SessionChange {
    match (current, incoming) {
        (_, None) => SessionChange::Unchanged,
        (None, Some(id)) => SessionChange::Assigned(id),
        (Some(previous), Some(id)) if previous == id => SessionChange::Unchanged,
        (Some(previous), Some(id)) => SessionChange::Replaced {
            previous: previous.to_string(),
            current: id,
        },
    }
}

/// Trim, drop blanks and duplicates, keep the caller's order
fn normalize_symptoms(symptoms: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    symptoms
        .into_iter()
        .map(|symptom| symptom.trim().to_string())
        .filter(|symptom| !symptom.is_empty())
        .filter(|symptom| seen.insert(symptom.clone()))
        .collect()
}

pub struct DiagnosticSessionCoordinator {
    api: Arc<dyn PredictionApi>,
    stream: ReasoningStreamClient,
    resolver: SessionIdResolver,
    config: CoordinatorConfig,
    feed: StepFeed,
    session: Option<DiagnosticSession>,
    questions: Vec<ClarifyingQuestion>,
    report: PredictionReport,
    // Latest known session id, polled by the resolver when streaming starts
    // before the backend has assigned one.
    session_id_tx: Arc<watch::Sender<Option<String>>>,
    status_tx: watch::Sender<SessionStatus>,
}

impl DiagnosticSessionCoordinator {
    pub fn new(
        api: Arc<dyn PredictionApi>,
        transport: Arc<dyn EventTransport>,
        config: CoordinatorConfig,
    ) -> Self {
        let feed = StepFeed::new();
        let (session_id_tx, _rx) = watch::channel(None);
        let (status_tx, _rx) = watch::channel(SessionStatus::Idle);
        Self {
            api,
            stream: ReasoningStreamClient::new(transport, config.reconnect, feed.clone()),
            resolver: SessionIdResolver::new(config.resolver),
            config,
            feed,
            session: None,
            questions: Vec::new(),
            report: PredictionReport::default(),
            session_id_tx: Arc::new(session_id_tx),
            status_tx,
        }
    }

    /// Start a new session from the selected symptoms.
    ///
    /// Any previous session is discarded first. Blank input is rejected
    /// before the backend is contacted.
    pub async fn submit(&mut self, symptoms: Vec<String>) -> Result<SubmitOutcome> {
        let symptoms = normalize_symptoms(symptoms);
        if symptoms.is_empty() {
            return Err(DiagnosticError::Validation(
                "Please select at least one symptom".to_string(),
            ));
        }

        self.teardown();
        self.session = Some(DiagnosticSession {
            symptoms: symptoms.clone(),
            status: SessionStatus::Submitting,
            ..DiagnosticSession::default()
        });
        self.status_tx.send_replace(SessionStatus::Submitting);
        info!(symptoms = symptoms.len(), "Submitting symptoms");

        let response = match self.api.submit_symptoms(&SymptomRequest { symptoms }).await {
            Ok(response) => response,
            Err(e) => return Err(self.fail(e)),
        };

        let session_id = response.session_id.clone();
        if let Some(session) = self.session.as_mut() {
            session.session_id = session_id.clone();
            session.result_id = response.result_id.clone();
        }
        self.session_id_tx.send_replace(session_id.clone());
        self.seed_steps(&response);
        self.absorb_predictions(&response);

        match session_id {
            Some(session_id) => self.stream.connect(session_id),
            None => {
                debug!("No session id yet, streaming once one is assigned");
                let session_id_rx = self.session_id_tx.subscribe();
                self.stream
                    .connect_when_resolved(&self.resolver, move || session_id_rx.borrow().clone());
            }
        }

        self.advance(response).await
    }

    /// Send answers to the outstanding questions.
    ///
    /// Needs a result or session id from an earlier submission; only
    /// materially answered questions are sent.
    pub async fn submit_answers(&mut self, answers: &Answers) -> Result<SubmitOutcome> {
        let (result_id, session_id) = self
            .session
            .as_ref()
            .map(|session| (session.result_id.clone(), session.session_id.clone()))
            .unwrap_or_default();
        if result_id.is_none() && session_id.is_none() {
            return Err(DiagnosticError::Concurrency(
                "Cannot submit answers: no session or result id available".to_string(),
            ));
        }
        if self.questions.is_empty() {
            return Err(DiagnosticError::Validation(
                "No clarifying questions are awaiting answers".to_string(),
            ));
        }

        let payload = answers.payload_for(&self.questions)?;
        if payload.is_empty() {
            return Err(DiagnosticError::Validation(
                "Answer at least one question before submitting".to_string(),
            ));
        }

        self.set_status(SessionStatus::Submitting);
        info!(
            answered = payload.len(),
            outstanding = self.questions.len(),
            "Submitting answers"
        );

        let request = AnswerRequest {
            result_id,
            session_id,
            answers: payload,
        };
        let response = match self.api.submit_answers(&request).await {
            Ok(response) => response,
            Err(e) => return Err(self.fail(e)),
        };

        if let Some(result_id) = response.result_id.clone() {
            if let Some(session) = self.session.as_mut() {
                session.result_id = Some(result_id);
            }
        }
        self.update_session_id(response.session_id.clone());
        self.seed_steps(&response);
        self.absorb_predictions(&response);

        self.advance(response).await
    }

    /// Drop the session, its questions, steps and stream
    pub fn reset(&mut self) {
        self.teardown();
        info!("Diagnostic session reset");
    }

    /// Raw backend status of the current session
    pub async fn session_status(&self) -> Result<Value> {
        let session_id = self
            .session
            .as_ref()
            .and_then(|session| session.session_id.as_deref())
            .ok_or_else(|| {
                DiagnosticError::Concurrency("No session id is known yet".to_string())
            })?;
        self.api.session_status(session_id).await
    }

    pub fn status(&self) -> SessionStatus {
        self.session
            .as_ref()
            .map_or(SessionStatus::Idle, |session| session.status)
    }

    pub fn session(&self) -> Option<&DiagnosticSession> {
        self.session.as_ref()
    }

    /// Questions awaiting answers, empty unless `AwaitingAnswers` (or a
    /// failed answer submission left them outstanding)
    pub fn questions(&self) -> &[ClarifyingQuestion] {
        &self.questions
    }

    pub fn report(&self) -> &PredictionReport {
        &self.report
    }

    pub fn steps(&self) -> StepLog {
        self.feed.snapshot()
    }

    pub fn subscribe_steps(&self) -> watch::Receiver<StepLog> {
        self.feed.subscribe()
    }

    /// Status changes as they happen, including the `Streaming` phase a
    /// finishing submission passes through
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.stream.subscribe_state()
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.is_active()
    }

    fn teardown(&mut self) {
        self.stream.close();
        self.feed.reset();
        self.session = None;
        self.questions.clear();
        self.report = PredictionReport::default();
        self.session_id_tx.send_replace(None);
        self.status_tx.send_replace(SessionStatus::Idle);
    }

    fn set_status(&mut self, status: SessionStatus) {
        if let Some(session) = self.session.as_mut() {
            if session.status != status {
                debug!(from = ?session.status, to = ?status, "Session status");
                session.status = status;
                self.status_tx.send_replace(status);
            }
        }
    }

    fn fail(&mut self, err: DiagnosticError) -> DiagnosticError {
        error!("Diagnostic request failed: {}", err);
        self.set_status(SessionStatus::Error);
        err
    }

    fn update_session_id(&mut self, incoming: Option<String>) {
        let current = self
            .session
            .as_ref()
            .and_then(|session| session.session_id.as_deref());

        match reconcile_session_id(current, incoming) {
            SessionChange::Unchanged => {}
            SessionChange::Assigned(session_id) => {
                info!(session_id = %session_id, "Backend assigned session id");
                self.store_session_id(&session_id);
                // A pending resolver picks the id up on its next poll.
                if !self.stream.is_active() {
                    self.stream.connect(session_id);
                }
            }
            SessionChange::Replaced { previous, current } => {
                warn!(
                    previous = %previous,
                    current = %current,
                    "Backend changed the session id, discarding steps of the previous session"
                );
                self.feed.reset();
                self.store_session_id(&current);
                self.stream.connect(current);
            }
        }
    }

    fn store_session_id(&mut self, session_id: &str) {
        if let Some(session) = self.session.as_mut() {
            session.session_id = Some(session_id.to_string());
        }
        self.session_id_tx.send_replace(Some(session_id.to_string()));
    }

    fn seed_steps(&self, response: &PredictionResponse) {
        let steps: Vec<ReasoningStep> = response
            .reasoning_steps
            .iter()
            .filter_map(|raw| ReasoningStep::from_value(raw.clone(), self.feed.ids()))
            .collect();
        if !steps.is_empty() {
            debug!(steps = steps.len(), "Seeding reasoning steps from response");
        }
        self.feed.append_all(steps);
    }

    fn absorb_predictions(&mut self, response: &PredictionResponse) {
        if let Some(initial) = &response.initial_predictions {
            self.report.initial = initial.clone();
        }
        if let Some(enhanced) = &response.enhanced_predictions {
            self.report.enhanced = Some(enhanced.clone());
        }
    }

    async fn advance(&mut self, response: PredictionResponse) -> Result<SubmitOutcome> {
        let notice = match (&response.enhancement_error, response.enhanced) {
            (Some(reason), false) => {
                warn!("Enhanced analysis unavailable: {}", reason);
                Some(format!("Enhanced analysis unavailable - {}", reason))
            }
            _ => None,
        };

        let questions = normalize_question_list(&response.clarifying_questions);
        if questions.is_empty() || response.prediction_complete {
            return Ok(self.finalize(notice).await);
        }

        info!(questions = questions.len(), "Awaiting answers to clarifying questions");
        self.questions = questions.clone();
        self.set_status(SessionStatus::AwaitingAnswers);
        Ok(SubmitOutcome::NeedsAnswers { questions, notice })
    }

    async fn finalize(&mut self, notice: Option<String>) -> SubmitOutcome {
        self.questions.clear();

        if self.stream.is_active() {
            self.set_status(SessionStatus::Streaming);
        }
        match self.stream.wait(self.config.completion_grace).await {
            Some(outcome) => debug!(?outcome, "Reasoning stream finished"),
            None if self.stream.is_active() => {
                debug!("Reasoning stream still open after grace period, closing")
            }
            None => {}
        }
        self.stream.close();

        self.set_status(SessionStatus::Complete);
        info!(
            predictions = self.report.best().len(),
            steps = self.feed.snapshot().len(),
            "Diagnostic session complete"
        );
        SubmitOutcome::Complete {
            report: self.report.clone(),
            notice,
        }
    }
}
