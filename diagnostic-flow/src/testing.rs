//! In-memory collaborators for unit tests.

use async_trait::async_trait;
use futures::{StreamExt, stream};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

use crate::api::{AnswerRequest, PredictionApi, PredictionResponse, SymptomRequest};
use crate::error::{DiagnosticError, Result};
use crate::stream::{EventStream, EventTransport};

/// How a scripted stream ends after its messages
#[derive(Debug, Clone, Copy)]
pub enum Tail {
    Error,
    Hang,
    End,
}

/// What one call to `open` does
#[derive(Debug, Clone)]
pub enum Script {
    Refuse,
    Events { messages: Vec<String>, tail: Tail },
}

impl Script {
    pub fn events(messages: Vec<String>, tail: Tail) -> Self {
        Script::Events { messages, tail }
    }
}

/// Counts streams that are still alive
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(live))
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Plays back one [`Script`] per `open`; refuses once the scripts run out
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    opens: Mutex<Vec<(String, Instant)>>,
    live: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Self::default()
        }
    }

    pub fn refusing() -> Self {
        Self::default()
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn open_count(&self) -> usize {
        self.opens.lock().unwrap().len()
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.opens.lock().unwrap().iter().map(|(_, at)| *at).collect()
    }

    pub fn opened_sessions(&self) -> Vec<String> {
        self.opens.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventTransport for ScriptedTransport {
    async fn open(&self, session_id: &str) -> Result<EventStream> {
        self.opens
            .lock()
            .unwrap()
            .push((session_id.to_string(), Instant::now()));

        let script = self.scripts.lock().unwrap().pop_front();
        let (messages, tail) = match script {
            None | Some(Script::Refuse) => {
                return Err(DiagnosticError::Stream("connection refused".to_string()));
            }
            Some(Script::Events { messages, tail }) => (messages, tail),
        };

        let head = stream::iter(messages.into_iter().map(Ok));
        let tail: EventStream = match tail {
            Tail::Error => Box::pin(stream::once(async {
                Err(DiagnosticError::Stream("connection reset".to_string()))
            })),
            Tail::Hang => Box::pin(stream::pending()),
            Tail::End => Box::pin(stream::empty()),
        };

        let guard = LiveGuard::new(&self.live);
        Ok(Box::pin(head.chain(tail).map(move |event| {
            let _alive = &guard;
            event
        })))
    }
}

/// Scripted prediction backend that records every request it receives
#[derive(Default)]
pub struct ScriptedApi {
    symptom_replies: Mutex<VecDeque<Result<Value>>>,
    answer_replies: Mutex<VecDeque<Result<Value>>>,
    symptom_requests: Mutex<Vec<SymptomRequest>>,
    answer_requests: Mutex<Vec<AnswerRequest>>,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_symptoms(self, reply: Result<Value>) -> Self {
        self.symptom_replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn on_answers(self, reply: Result<Value>) -> Self {
        self.answer_replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn symptom_requests(&self) -> Vec<SymptomRequest> {
        self.symptom_requests.lock().unwrap().clone()
    }

    pub fn answer_requests(&self) -> Vec<AnswerRequest> {
        self.answer_requests.lock().unwrap().clone()
    }

    fn reply(queue: &Mutex<VecDeque<Result<Value>>>) -> Result<PredictionResponse> {
        let reply = queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(DiagnosticError::Network("no scripted reply".to_string())));
        PredictionResponse::from_json(reply?)
    }
}

#[async_trait]
impl PredictionApi for ScriptedApi {
    async fn submit_symptoms(&self, request: &SymptomRequest) -> Result<PredictionResponse> {
        self.symptom_requests.lock().unwrap().push(request.clone());
        Self::reply(&self.symptom_replies)
    }

    async fn submit_answers(&self, request: &AnswerRequest) -> Result<PredictionResponse> {
        self.answer_requests.lock().unwrap().push(request.clone());
        Self::reply(&self.answer_replies)
    }

    async fn session_status(&self, session_id: &str) -> Result<Value> {
        Ok(json!({"session_id": session_id, "status": "active"}))
    }
}
