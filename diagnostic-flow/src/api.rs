use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use crate::answer::AnswerValue;
use crate::error::{DiagnosticError, Result};

/// One disease as scored by the backend. Read-only; the client only routes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawPrediction")]
pub struct DiseasePrediction {
    pub probability: f64,
    pub confidence_level: Option<String>,
    pub explanation: Option<String>,
    pub precautions: Vec<String>,
    pub matching_symptoms: Vec<String>,
    pub missing_symptoms: Vec<String>,
    pub severity: Option<String>,
    pub recommendation: Option<String>,
}

/// Disease name to prediction
pub type Predictions = BTreeMap<String, DiseasePrediction>;

// The backend sends either a bare probability or an object whose confidence
// field has been called both `confidence_level` and `confidence`.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawPrediction {
    Probability(f64),
    Detailed(Box<DetailedPrediction>),
}

#[derive(Deserialize)]
struct DetailedPrediction {
    #[serde(default)]
    probability: Option<f64>,
    #[serde(default)]
    confidence_level: Option<Value>,
    #[serde(default)]
    confidence: Option<Value>,
    #[serde(default)]
    explanation: Option<Value>,
    #[serde(default)]
    precautions: Option<Value>,
    #[serde(default)]
    matching_symptoms: Option<Value>,
    #[serde(default)]
    missing_symptoms: Option<Value>,
    #[serde(default)]
    severity: Option<Value>,
    #[serde(default)]
    recommendation: Option<Value>,
}

impl From<RawPrediction> for DiseasePrediction {
    fn from(raw: RawPrediction) -> Self {
        match raw {
            RawPrediction::Probability(probability) => DiseasePrediction {
                probability: probability.clamp(0.0, 1.0),
                ..DiseasePrediction::default()
            },
            RawPrediction::Detailed(detailed) => {
                let detailed = *detailed;
                DiseasePrediction {
                    probability: detailed.probability.unwrap_or(0.0).clamp(0.0, 1.0),
                    confidence_level: detailed
                        .confidence_level
                        .as_ref()
                        .and_then(scalar_string)
                        .or_else(|| detailed.confidence.as_ref().and_then(scalar_string)),
                    explanation: detailed.explanation.as_ref().and_then(scalar_string),
                    precautions: string_list(detailed.precautions.as_ref()),
                    matching_symptoms: string_list(detailed.matching_symptoms.as_ref()),
                    missing_symptoms: string_list(detailed.missing_symptoms.as_ref()),
                    severity: detailed.severity.as_ref().and_then(scalar_string),
                    recommendation: detailed.recommendation.as_ref().and_then(scalar_string),
                }
            }
        }
    }
}

/// Parse a predictions object, skipping entries that are not predictions.
pub fn parse_predictions(raw: &Value) -> Predictions {
    let Value::Object(entries) = raw else {
        return Predictions::new();
    };

    entries
        .iter()
        .filter_map(|(disease, value)| {
            match serde_json::from_value::<DiseasePrediction>(value.clone()) {
                Ok(prediction) => Some((disease.clone(), prediction)),
                Err(e) => {
                    debug!(disease = %disease, "Skipping malformed prediction: {}", e);
                    None
                }
            }
        })
        .collect()
}

/// Everything the backend has predicted for the current session so far
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredictionReport {
    pub initial: Predictions,
    pub enhanced: Option<Predictions>,
}

impl PredictionReport {
    /// Enhanced predictions when available, otherwise the initial ones
    pub fn best(&self) -> &Predictions {
        self.enhanced
            .as_ref()
            .filter(|enhanced| !enhanced.is_empty())
            .unwrap_or(&self.initial)
    }

    /// [`best`](Self::best) sorted by probability, highest first
    pub fn ranked(&self) -> Vec<(&str, &DiseasePrediction)> {
        let mut ranked: Vec<(&str, &DiseasePrediction)> = self
            .best()
            .iter()
            .map(|(disease, prediction)| (disease.as_str(), prediction))
            .collect();
        ranked.sort_by(|a, b| b.1.probability.total_cmp(&a.1.probability));
        ranked
    }

    pub fn is_empty(&self) -> bool {
        self.initial.is_empty() && self.enhanced.as_ref().is_none_or(|e| e.is_empty())
    }
}

/// Response of both the symptom and the answer endpoints
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredictionResponse {
    pub initial_predictions: Option<Predictions>,
    pub enhanced: bool,
    pub enhanced_predictions: Option<Predictions>,
    /// Raw questions; normalized by the coordinator
    pub clarifying_questions: Value,
    pub result_id: Option<String>,
    pub session_id: Option<String>,
    /// Raw steps, objects or bare strings
    pub reasoning_steps: Vec<Value>,
    pub enhancement_error: Option<String>,
    pub prediction_complete: bool,
    pub status: Option<String>,
}

impl PredictionResponse {
    /// Read a response body.
    ///
    /// A body carrying an `error` field is a failed call even when the HTTP
    /// status said otherwise.
    pub fn from_json(body: Value) -> Result<Self> {
        let Value::Object(mut fields) = body else {
            return Err(DiagnosticError::Network(
                "Prediction response is not a JSON object".to_string(),
            ));
        };

        if let Some(error) = fields.get("error").filter(|error| !error.is_null()) {
            return Err(DiagnosticError::Network(
                scalar_string(error).unwrap_or_else(|| error.to_string()),
            ));
        }

        let mut take = |key: &str| fields.remove(key).unwrap_or(Value::Null);

        Ok(Self {
            initial_predictions: non_null(take("initial_predictions"))
                .map(|raw| parse_predictions(&raw)),
            enhanced: take("enhanced").as_bool().unwrap_or(false),
            enhanced_predictions: non_null(take("enhanced_predictions"))
                .map(|raw| parse_predictions(&raw)),
            clarifying_questions: take("clarifying_questions"),
            result_id: scalar_string(&take("result_id")),
            session_id: scalar_string(&take("session_id")),
            reasoning_steps: match take("reasoning_steps") {
                Value::Array(steps) => steps,
                _ => Vec::new(),
            },
            enhancement_error: scalar_string(&take("enhancement_error")),
            prediction_complete: take("prediction_complete").as_bool().unwrap_or(false),
            status: scalar_string(&take("status")),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymptomRequest {
    pub symptoms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnswerRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub answers: BTreeMap<String, AnswerValue>,
}

/// The prediction backend as seen from the client
#[async_trait]
pub trait PredictionApi: Send + Sync {
    /// Submit selected symptoms and start a diagnostic session
    async fn submit_symptoms(&self, request: &SymptomRequest) -> Result<PredictionResponse>;

    /// Answer the outstanding clarifying questions of a session
    async fn submit_answers(&self, request: &AnswerRequest) -> Result<PredictionResponse>;

    /// Raw status document of a backend session
    async fn session_status(&self, session_id: &str) -> Result<Value>;
}

fn non_null(value: Value) -> Option<Value> {
    (!value.is_null()).then_some(value)
}

/// Strings and numbers as text; empty strings and other shapes are absent
fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(scalar_string).collect(),
        Some(other) => scalar_string(other).into_iter().collect(),
        None => Vec::new(),
    }
}
