//! `reqwest` implementation of [`PredictionApi`].

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, header};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error};

use crate::api::{AnswerRequest, PredictionApi, PredictionResponse, SymptomRequest};
use crate::config::ApiConfig;
use crate::error::{DiagnosticError, Result};

#[derive(Debug, Clone)]
pub struct HttpPredictionApi {
    client: Client,
    config: ApiConfig,
}

impl HttpPredictionApi {
    pub fn new(config: ApiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    /// Use an existing client; its timeouts take precedence over the config's
    pub fn with_client(client: Client, config: ApiConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.config.authorization() {
            Some(value) => request.header(header::AUTHORIZATION, value),
            None => request,
        }
    }

    async fn post_json<B: Serialize + ?Sized>(&self, url: &str, body: &B) -> Result<Value> {
        debug!(url = %url, "POST");
        let request = self.authorize(self.client.post(url).json(body));
        self.send(request).await
    }

    async fn send(&self, request: RequestBuilder) -> Result<Value> {
        let response = request.send().await.map_err(|e| {
            error!("Prediction backend unreachable: {}", e);
            DiagnosticError::Network(format!("Backend unreachable: {}", e))
        })?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|value| {
                    value
                        .get("error")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or(body);
            error!(status = %status, "Prediction backend returned an error: {}", message);
            return Err(DiagnosticError::Network(format!(
                "Backend returned {}: {}",
                status, message
            )));
        }

        serde_json::from_str(&body).map_err(|e| {
            DiagnosticError::Network(format!("Backend sent invalid JSON: {}", e))
        })
    }
}

#[async_trait]
impl PredictionApi for HttpPredictionApi {
    async fn submit_symptoms(&self, request: &SymptomRequest) -> Result<PredictionResponse> {
        let body = self
            .post_json(&self.config.enhanced_prediction_url(), request)
            .await?;
        PredictionResponse::from_json(body)
    }

    async fn submit_answers(&self, request: &AnswerRequest) -> Result<PredictionResponse> {
        let body = self
            .post_json(&self.config.answer_questions_url(), request)
            .await?;
        PredictionResponse::from_json(body)
    }

    async fn session_status(&self, session_id: &str) -> Result<Value> {
        let url = self.config.session_status_url(session_id);
        debug!(url = %url, "GET");
        self.send(self.authorize(self.client.get(&url))).await
    }
}
