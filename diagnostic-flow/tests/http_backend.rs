use axum::{
    Json, Router,
    body::Body,
    extract::Path,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use diagnostic_flow::{
    AnswerValue, Answers, ApiConfig, CoordinatorConfig, DiagnosticError,
    DiagnosticSessionCoordinator, EventTransport, HttpPredictionApi, PredictionApi, SessionStatus,
    SseTransport, SubmitOutcome, SymptomRequest,
};
use futures::{StreamExt, stream};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

const TOKEN: &str = "test-token";
const SESSION_ID: &str = "session-http";

fn authorized(headers: &HeaderMap) -> bool {
    let expected = format!("Bearer {}", TOKEN);
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        == Some(expected.as_str())
}

fn unauthorized() -> (StatusCode, Json<Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "Authentication credentials were not provided."})),
    )
}

async fn predict_enhanced(headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    if !authorized(&headers) {
        return unauthorized();
    }
    let symptoms = body["symptoms"].as_array().cloned().unwrap_or_default();
    if symptoms.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "No symptoms provided"})),
        );
    }

    (
        StatusCode::OK,
        Json(json!({
            "initial_predictions": {
                "Malaria": {"probability": 0.61, "confidence": "Medium"},
                "Typhoid": 0.22
            },
            "enhanced": true,
            "status": "waiting_for_input",
            "session_id": SESSION_ID,
            "result_id": 11,
            "clarifying_questions": [
                {"id": "chills", "question_text": "Do you have chills?", "type": "yes_no"},
                {"id": "duration", "question_text": "How long?", "type": "multiple_choice",
                 "options": [{"value": "days", "label": "A few days"}, {"value": "weeks", "label": "Weeks"}]}
            ],
            "reasoning_steps": ["Initial ML model prediction"]
        })),
    )
}

async fn answer_questions(headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    if !authorized(&headers) {
        return unauthorized();
    }
    if body["result_id"] != json!("11") || body["session_id"] != json!(SESSION_ID) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Unknown result"})),
        );
    }

    let chills = body["answers"]["chills"].as_str() == Some("yes");
    (
        StatusCode::OK,
        Json(json!({
            "enhanced": true,
            "enhanced_predictions": {
                "Malaria": {
                    "probability": if chills { 0.87 } else { 0.4 },
                    "confidence_level": "High",
                    "precautions": ["Seek medical care"],
                    "severity": "high"
                }
            },
            "clarifying_questions": [],
            "prediction_complete": true,
            "session_id": SESSION_ID,
            "answered": body["answers"].clone()
        })),
    )
}

async fn session_status(Path(session_id): Path<String>) -> Json<Value> {
    Json(json!({"session_id": session_id, "status": "waiting_for_input"}))
}

async fn reasoning_stream(Path(session_id): Path<String>) -> Response {
    if session_id != SESSION_ID {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    }

    // One event is split across chunks on purpose.
    let chunks: Vec<&'static str> = vec![
        ": keep-alive\n\n",
        "data: {\"type\":\"connected\",\"session_id\":\"session-http\"}\n\n",
        "data: {\"type\":\"step\",\"step_id\":\"sse-1\",\"agent\":\"ml_model\",",
        "\"step\":\"initial_analysis\",\"content\":\"Scored 41 diseases\"}\r\n\r\n",
        "data: {\"type\":\"step\",\"step_id\":\"sse-2\",\"agent\":\"llm\",\"step\":\"refine\",\"status\":\"in_progress\"}\n\n",
        "data: {\"type\":\"step\",\"step_id\":\"sse-2\",\"agent\":\"llm\",\"step\":\"refine\",\"status\":\"completed\"}\n\n",
        "data: {\"type\":\"complete\"}\n\n",
    ];
    let body = Body::from_stream(stream::iter(
        chunks.into_iter().map(Ok::<_, std::io::Error>),
    ));

    ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
}

async fn start_backend() -> String {
    let app = Router::new()
        .route("/api/diagnostics/predict/disease/enhanced/", post(predict_enhanced))
        .route(
            "/api/diagnostics/predict/disease/answer-questions/",
            post(answer_questions),
        )
        .route("/api/diagnostics/sessions/{session_id}/status/", get(session_status))
        .route("/api/diagnostics/reasoning-stream/{session_id}", get(reasoning_stream));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{}/api/diagnostics", addr)
}

#[tokio::test]
async fn test_http_api_against_backend() {
    let base_url = start_backend().await;
    let api = HttpPredictionApi::new(ApiConfig::new(&base_url).with_token(TOKEN)).unwrap();

    let response = api
        .submit_symptoms(&SymptomRequest {
            symptoms: vec!["fever".to_string(), "chills".to_string()],
        })
        .await
        .unwrap();

    assert_eq!(response.session_id.as_deref(), Some(SESSION_ID));
    assert_eq!(response.result_id.as_deref(), Some("11"));
    let initial = response.initial_predictions.unwrap();
    assert_eq!(initial["Malaria"].confidence_level.as_deref(), Some("Medium"));
    assert_eq!(initial["Typhoid"].probability, 0.22);

    let status = api.session_status(SESSION_ID).await.unwrap();
    assert_eq!(status["status"], "waiting_for_input");
}

#[tokio::test]
async fn test_http_errors_surface_backend_message() {
    let base_url = start_backend().await;

    let api = HttpPredictionApi::new(ApiConfig::new(&base_url).with_token(TOKEN)).unwrap();
    let err = api
        .submit_symptoms(&SymptomRequest { symptoms: vec![] })
        .await
        .unwrap_err();
    assert!(matches!(&err, DiagnosticError::Network(message) if message.contains("No symptoms provided")));

    let anonymous = HttpPredictionApi::new(ApiConfig::new(&base_url)).unwrap();
    let err = anonymous
        .submit_symptoms(&SymptomRequest {
            symptoms: vec!["fever".to_string()],
        })
        .await
        .unwrap_err();
    assert!(matches!(&err, DiagnosticError::Network(message) if message.contains("401")));
}

#[tokio::test]
async fn test_sse_transport_decodes_stream() {
    let base_url = start_backend().await;
    let transport = SseTransport::new(ApiConfig::new(&base_url).with_token(TOKEN)).unwrap();

    let events: Vec<String> = transport
        .open(SESSION_ID)
        .await
        .unwrap()
        .map(|event| event.unwrap())
        .collect()
        .await;

    assert_eq!(events.len(), 5);
    let step: Value = serde_json::from_str(&events[1]).unwrap();
    assert_eq!(step["step_id"], "sse-1");
    assert_eq!(step["content"], "Scored 41 diseases");

    let missing = transport.open("nope").await;
    assert!(matches!(missing, Err(DiagnosticError::Stream(_))));
}

#[tokio::test]
async fn test_session_against_backend() {
    let base_url = start_backend().await;
    let config = ApiConfig::new(&base_url).with_token(TOKEN);
    let mut coordinator = DiagnosticSessionCoordinator::new(
        Arc::new(HttpPredictionApi::new(config.clone()).unwrap()),
        Arc::new(SseTransport::new(config).unwrap()),
        CoordinatorConfig {
            completion_grace: Duration::from_secs(5),
            ..CoordinatorConfig::default()
        },
    );

    let outcome = coordinator
        .submit(vec!["fever".to_string(), "headache".to_string()])
        .await
        .unwrap();
    let SubmitOutcome::NeedsAnswers { questions, .. } = outcome else {
        panic!("expected clarifying questions");
    };
    assert_eq!(questions.len(), 2);

    let mut answers = Answers::new();
    answers
        .record(&questions[0], AnswerValue::Text("yes".to_string()))
        .unwrap();
    answers
        .record(&questions[1], AnswerValue::Text("days".to_string()))
        .unwrap();

    let outcome = coordinator.submit_answers(&answers).await.unwrap();
    let SubmitOutcome::Complete { report, .. } = outcome else {
        panic!("expected a final prediction");
    };

    let (top, prediction) = report.ranked()[0];
    assert_eq!(top, "Malaria");
    assert_eq!(prediction.probability, 0.87);
    assert_eq!(coordinator.status(), SessionStatus::Complete);
    assert!(!coordinator.is_streaming());

    let steps = coordinator.steps();
    assert!(steps.get("sse-1").is_some());
    assert!(steps.get("sse-2").is_some());
    assert!(steps.current_in_progress().is_none());
    assert_eq!(steps.len(), 3);
}
