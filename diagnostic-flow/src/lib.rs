pub mod answer;
pub mod api;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod http;
pub mod question;
pub mod resolver;
pub mod sse;
pub mod step_log;
pub mod stream;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use answer::{AnswerValue, Answers};
pub use api::{
    AnswerRequest, DiseasePrediction, PredictionApi, PredictionReport, PredictionResponse,
    Predictions, SymptomRequest,
};
pub use config::{ApiConfig, CoordinatorConfig, ReconnectPolicy};
pub use coordinator::{DiagnosticSession, DiagnosticSessionCoordinator, SessionStatus, SubmitOutcome};
pub use error::{DiagnosticError, Result};
pub use http::HttpPredictionApi;
pub use question::{ChoiceOption, ClarifyingQuestion, QuestionKind, normalize_questions};
pub use resolver::{ResolveOutcome, ResolverConfig, ResolverHandle, SessionIdResolver};
pub use sse::SseTransport;
pub use step_log::{ReasoningStep, StepContent, StepLog, StepStatus};
pub use stream::{
    ConnectionState, EventStream, EventTransport, ReasoningStreamClient, StepFeed, StreamOutcome,
};
