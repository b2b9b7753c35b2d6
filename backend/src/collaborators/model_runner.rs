//! Model runners - regression/ML predictions for the valuation engine

use crate::collaborators::{CollaboratorError, ModelRunner, Prediction};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// Calls a model server: `POST {base_url}/predict`
#[derive(Debug, Clone)]
pub struct HttpModelRunner {
    client: Client,
    base_url: String,
}

#[derive(Serialize)]
struct PredictRequest<'a> {
    model_name: &'a str,
    version: Option<&'a str>,
    features: &'a BTreeMap<String, f64>,
}

#[derive(Deserialize)]
struct PredictResponse {
    prediction: Option<f64>,
    #[serde(default, alias = "explain")]
    explanation: Map<String, Value>,
}

impl HttpModelRunner {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(HttpModelRunner {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

/// 5xx and 429 are worth retrying; other client errors are not
fn classify_status(status: StatusCode) -> Option<CollaboratorError> {
    if status.is_success() {
        None
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Some(CollaboratorError::Recoverable(format!("model server returned {}", status)))
    } else {
        Some(CollaboratorError::Terminal(format!("model server returned {}", status)))
    }
}

fn classify_transport(err: reqwest::Error) -> CollaboratorError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        CollaboratorError::Recoverable(err.to_string())
    } else {
        CollaboratorError::Terminal(err.to_string())
    }
}

#[async_trait]
impl ModelRunner for HttpModelRunner {
    async fn predict(
        &self,
        model_name: &str,
        features: &BTreeMap<String, f64>,
        version: Option<&str>,
    ) -> Result<Prediction, CollaboratorError> {
        let url = format!("{}/predict", self.base_url);
        debug!("Requesting prediction from {} (model: {})", url, model_name);

        let response = self
            .client
            .post(&url)
            .json(&PredictRequest {
                model_name,
                version,
                features,
            })
            .send()
            .await
            .map_err(classify_transport)?;

        if let Some(err) = classify_status(response.status()) {
            return Err(err);
        }

        let body: PredictResponse = response.json().await.map_err(|e| {
            CollaboratorError::Terminal(format!("malformed model response: {}", e))
        })?;

        info!("Model {} predicted {:?}", model_name, body.prediction);

        Ok(Prediction {
            prediction: body.prediction,
            explanation: body.explanation,
        })
    }
}

/// Offline fallback: sqft × price_per_sqft when both features are present
#[derive(Debug, Clone, Default)]
pub struct HeuristicModelRunner;

#[async_trait]
impl ModelRunner for HeuristicModelRunner {
    async fn predict(
        &self,
        model_name: &str,
        features: &BTreeMap<String, f64>,
        version: Option<&str>,
    ) -> Result<Prediction, CollaboratorError> {
        let prediction = match (features.get("sqft"), features.get("price_per_sqft")) {
            (Some(sqft), Some(ppsf)) if *sqft > 0.0 && *ppsf > 0.0 => Some((sqft * ppsf * 100.0).round() / 100.0),
            _ => None,
        };

        let mut explanation = Map::new();
        explanation.insert("model_name".to_string(), json!(model_name));
        explanation.insert("version".to_string(), json!(version));
        explanation.insert(
            "top_features".to_string(),
            json!(["sqft", "price_per_sqft", "bedrooms", "bathrooms"]),
        );

        Ok(Prediction {
            prediction,
            explanation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_heuristic_prediction() {
        let features = BTreeMap::from([
            ("sqft".to_string(), 2200.0),
            ("price_per_sqft".to_string(), 200.0),
        ]);

        let prediction = HeuristicModelRunner.predict("avm", &features, Some("v1")).await.unwrap();

        assert_eq!(prediction.prediction, Some(440_000.0));
        assert_eq!(prediction.explanation["version"], json!("v1"));
    }

    #[tokio::test]
    async fn test_heuristic_without_ppsf_has_no_prediction() {
        let features = BTreeMap::from([("sqft".to_string(), 2200.0)]);
        let prediction = HeuristicModelRunner.predict("avm", &features, None).await.unwrap();
        assert!(prediction.prediction.is_none());
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::OK).is_none());
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            Some(CollaboratorError::Recoverable(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            Some(CollaboratorError::Recoverable(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND),
            Some(CollaboratorError::Terminal(_))
        ));
    }

    #[test]
    fn test_response_accepts_explain_alias() {
        let body: PredictResponse =
            serde_json::from_str(r#"{"prediction": 455000.5, "explain": {"top_features": ["sqft"]}}"#).unwrap();
        assert_eq!(body.prediction, Some(455_000.5));
        assert!(body.explanation.contains_key("top_features"));
    }

    #[tokio::test]
    #[ignore] // Ignore by default since it needs a running model server
    async fn test_http_model_runner() {
        let runner = HttpModelRunner::new("http://127.0.0.1:8000", Duration::from_secs(5)).unwrap();
        let features = BTreeMap::from([("sqft".to_string(), 2200.0)]);
        let result = runner.predict("avm-regression", &features, None).await;
        assert!(result.is_ok());
    }
}
