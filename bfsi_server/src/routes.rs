use axum::{
    extract::{rejection::JsonRejection, State},
    response::Json,
    routing::{get, post},
    Router,
};
use common::{
    ChatRequest, ChatResponse, CsvPreview, FraudRequest, FraudResponse, HealthResponse,
    InfoResponse, RootResponse,
};
use std::{collections::HashMap, sync::Arc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::debug;

use crate::csv_preview::CsvPreviewer;
use crate::error::AppError;
use crate::fraud::resolve_feature_vector;
use crate::state::{ServiceContext, SERVICE_NAME};

pub fn router(state: Arc<ServiceContext>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/info", get(info_handler))
        .route("/predict_fraud", post(predict_fraud))
        .route("/chat", post(chat))
        .route("/csv_data", get(csv_data))
        // Any origin, method and header, credentials included.
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        status: "ok".to_string(),
        service: SERVICE_NAME.to_string(),
    })
}

async fn health(State(state): State<Arc<ServiceContext>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        fraud_model_loaded: state.fraud.is_some(),
        chat_model_loaded: state.chat_model_loaded(),
        csv_preview_enabled: CsvPreviewer::enabled(),
    })
}

async fn info_handler(
    State(state): State<Arc<ServiceContext>>,
) -> Result<Json<InfoResponse>, AppError> {
    let pid = sysinfo::get_current_pid()
        .map_err(|e| AppError::Internal(format!("Cannot resolve process id: {}", e)))?;

    let (memory_rss_mb, cpu_percent) = {
        let mut system = state.system.lock().await;
        system.refresh_process(pid);
        let process = system
            .process(pid)
            .ok_or_else(|| AppError::Internal("Process statistics unavailable".to_string()))?;
        (process.memory() as f64 / 1024.0 / 1024.0, process.cpu_usage())
    };

    let cpu_count = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    let artifact_load_time_ms: HashMap<String, f64> = state.load_times_ms.clone();

    Ok(Json(InfoResponse {
        service: SERVICE_NAME.to_string(),
        base_model_id: state.config.chat.base_model_id.clone(),
        adapter_dir: state.config.chat.adapter_dir.clone(),
        classifier_path: state.config.fraud.classifier_path.clone(),
        artifact_load_time_ms,
        device: state.device.clone(),
        cpu_count,
        memory_rss_mb,
        cpu_percent,
    }))
}

async fn predict_fraud(
    State(state): State<Arc<ServiceContext>>,
    payload: Result<Json<FraudRequest>, JsonRejection>,
) -> Result<Json<FraudResponse>, AppError> {
    let Json(request) = payload?;
    let scorer = state.fraud.clone().ok_or_else(|| {
        AppError::Unavailable("Fraud model or scaler not loaded on server.".to_string())
    })?;

    let vector = resolve_feature_vector(&request, state.config.fraud.feature_order.as_deref())?;
    debug!(
        received = vector.len(),
        expected = scorer.n_features(),
        "Fraud scoring request"
    );

    let score = tokio::task::spawn_blocking(move || scorer.scale_and_score(&vector)).await??;

    Ok(Json(FraudResponse {
        is_fraud: score.label,
        probability: score.probability,
    }))
}

async fn chat(
    State(state): State<Arc<ServiceContext>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, AppError> {
    let Json(request) = payload?;
    if request.message.trim().is_empty() {
        return Err(AppError::BadRequest("Message must not be empty.".to_string()));
    }

    let chatbot = state
        .chat
        .clone()
        .ok_or_else(|| AppError::Unavailable("Chatbot not initialized on server.".to_string()))?;

    let response = tokio::task::spawn_blocking(move || {
        chatbot.get_reply(&request.message, request.history.as_deref())
    })
    .await?
    .map_err(|e| AppError::Internal(format!("Chatbot error: {}", e)))?;

    Ok(Json(response))
}

async fn csv_data(State(state): State<Arc<ServiceContext>>) -> Result<Json<CsvPreview>, AppError> {
    let previewer = state.csv.clone();
    let preview = tokio::task::spawn_blocking(move || previewer.preview()).await??;
    Ok(Json(preview))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{prompt::PromptBuilder, Chatbot, ReplyGenerator, MODEL_NOT_LOADED_REPLY};
    use crate::fraud::{FraudScore, FraudScorer, ScoreError};
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use common::ServiceConfig;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    /// Thresholds the first feature at zero, like a one-stump classifier.
    struct StumpScorer;

    impl FraudScorer for StumpScorer {
        fn n_features(&self) -> usize {
            3
        }

        fn scale_and_score(&self, features: &[f64]) -> Result<FraudScore, ScoreError> {
            if features.len() != 3 {
                return Err(ScoreError::Dimension {
                    expected: 3,
                    got: features.len(),
                });
            }
            let probability = if features[0] > 0.0 { 0.92 } else { 0.08 };
            Ok(FraudScore {
                label: u8::from(probability >= 0.5),
                probability,
            })
        }
    }

    struct FailingScorer;

    impl FraudScorer for FailingScorer {
        fn n_features(&self) -> usize {
            3
        }

        fn scale_and_score(&self, _features: &[f64]) -> Result<FraudScore, ScoreError> {
            Err(ScoreError::Model("input tensor rank mismatch".to_string()))
        }
    }

    struct CannedGenerator;

    impl ReplyGenerator for CannedGenerator {
        fn generate(&self, _prompt: &str) -> anyhow::Result<String> {
            Ok("KYC (Know Your Customer) is the process of verifying a client's identity.".to_string())
        }
    }

    struct FailingGenerator;

    impl ReplyGenerator for FailingGenerator {
        fn generate(&self, _prompt: &str) -> anyhow::Result<String> {
            anyhow::bail!("out of memory")
        }
    }

    fn context(
        config: ServiceConfig,
        fraud: Option<Arc<dyn FraudScorer>>,
        generator: Option<Arc<dyn ReplyGenerator>>,
    ) -> Arc<ServiceContext> {
        let chatbot = Chatbot::new(PromptBuilder::default(), generator, "phi3-bfsi-lora");
        Arc::new(ServiceContext::new(config, fraud, Some(Arc::new(chatbot))))
    }

    fn loaded_app() -> Router {
        router(context(
            ServiceConfig::default(),
            Some(Arc::new(StumpScorer)),
            Some(Arc::new(CannedGenerator)),
        ))
    }

    fn unloaded_app() -> Router {
        router(context(ServiceConfig::default(), None, None))
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        send(app, request).await
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        send(app, request).await
    }

    #[tokio::test]
    async fn test_root_is_static() {
        for app in [loaded_app(), unloaded_app()] {
            let (status, body) = get_json(app, "/").await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["status"], "ok");
            assert_eq!(body["service"], SERVICE_NAME);
        }
    }

    #[tokio::test]
    async fn test_health_reports_capabilities() {
        let (_, body) = get_json(loaded_app(), "/health").await;
        assert_eq!(body["fraud_model_loaded"], true);
        assert_eq!(body["chat_model_loaded"], true);

        let (_, body) = get_json(unloaded_app(), "/health").await;
        assert_eq!(body["fraud_model_loaded"], false);
        assert_eq!(body["chat_model_loaded"], false);
    }

    #[tokio::test]
    async fn test_predict_fraud_vector() {
        for (vector, expected) in [(json!([4.0, 1.0, 2.0]), 1), (json!([-4.0, 1.0, 2.0]), 0)] {
            let (status, body) =
                post_json(loaded_app(), "/predict_fraud", json!({ "feature_vector": vector })).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["is_fraud"], expected);
            let probability = body["probability"].as_f64().unwrap();
            assert!((0.0..=1.0).contains(&probability));
        }
    }

    #[tokio::test]
    async fn test_predict_fraud_features_without_ordering() {
        let (status, body) = post_json(
            loaded_app(),
            "/predict_fraud",
            json!({ "features": { "amount": 10.0, "velocity": 2.0, "hour": 3.0 } }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("feature ordering"));
    }

    #[tokio::test]
    async fn test_predict_fraud_features_with_ordering() {
        let mut config = ServiceConfig::default();
        config.fraud.feature_order = Some(vec![
            "amount".to_string(),
            "velocity".to_string(),
            "hour".to_string(),
        ]);
        let app = router(context(config, Some(Arc::new(StumpScorer)), None));

        let (status, body) = post_json(
            app.clone(),
            "/predict_fraud",
            json!({ "features": { "hour": 3.0, "amount": 10.0, "velocity": 2.0 } }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_fraud"], 1);

        let (status, body) = post_json(
            app,
            "/predict_fraud",
            json!({ "features": { "amount": 10.0 } }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("velocity"));
    }

    #[tokio::test]
    async fn test_predict_fraud_no_input() {
        let (status, body) = post_json(loaded_app(), "/predict_fraud", json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().starts_with("No input provided"));
    }

    #[tokio::test]
    async fn test_predict_fraud_wrong_dimension() {
        let (status, _) =
            post_json(loaded_app(), "/predict_fraud", json!({ "feature_vector": [1.0] })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_predict_fraud_unloaded_is_deterministic() {
        for _ in 0..3 {
            let (status, body) = post_json(
                unloaded_app(),
                "/predict_fraud",
                json!({ "feature_vector": [1.0, 2.0, 3.0] }),
            )
            .await;
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(body["error"], "Fraud model or scaler not loaded on server.");
        }
    }

    #[tokio::test]
    async fn test_predict_fraud_model_error() {
        let app = router(context(ServiceConfig::default(), Some(Arc::new(FailingScorer)), None));
        let (status, body) =
            post_json(app, "/predict_fraud", json!({ "feature_vector": [1.0, 2.0, 3.0] })).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Prediction error: input tensor rank mismatch");
    }

    #[tokio::test]
    async fn test_chat_reply() {
        let (status, body) = post_json(
            loaded_app(),
            "/chat",
            json!({
                "message": "What is KYC?",
                "history": [{ "role": "user", "content": "hello" }]
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body["reply"].as_str().unwrap().is_empty());
        assert_eq!(body["meta"]["source"], "phi3-bfsi-lora");
    }

    #[tokio::test]
    async fn test_chat_model_not_loaded() {
        let (status, body) =
            post_json(unloaded_app(), "/chat", json!({ "message": "What is KYC?" })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reply"], MODEL_NOT_LOADED_REPLY);
    }

    #[tokio::test]
    async fn test_chat_not_initialized() {
        let app = router(Arc::new(ServiceContext::new(ServiceConfig::default(), None, None)));
        let (status, body) = post_json(app, "/chat", json!({ "message": "What is KYC?" })).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Chatbot not initialized on server.");
    }

    #[tokio::test]
    async fn test_chat_generation_error() {
        let app = router(context(
            ServiceConfig::default(),
            None,
            Some(Arc::new(FailingGenerator)),
        ));
        let (status, body) = post_json(app, "/chat", json!({ "message": "What is KYC?" })).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Chatbot error: out of memory");
    }

    #[tokio::test]
    async fn test_chat_empty_message() {
        let (status, _) = post_json(loaded_app(), "/chat", json!({ "message": "   " })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_csv_missing_file() {
        let mut config = ServiceConfig::default();
        config.csv.path = "/nonexistent/finaldata.csv".to_string();
        let app = router(context(config, None, None));

        let (status, body) = get_json(app, "/csv_data").await;
        if CsvPreviewer::enabled() {
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert!(body["error"].as_str().unwrap().contains("/nonexistent/finaldata.csv"));
        } else {
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    #[cfg(feature = "csv-preview")]
    #[tokio::test]
    async fn test_csv_preview_counts() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Transaction_Amount,Card_Type,Is_Fraud").unwrap();
        for i in 0..250 {
            writeln!(file, "{},UzCard,{}", i * 3, i % 2).unwrap();
        }

        let mut config = ServiceConfig::default();
        config.csv.path = file.path().display().to_string();
        let app = router(context(config, None, None));

        let (status, body) = get_json(app, "/csv_data").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_rows"], 250);
        assert_eq!(body["displayed_rows"], 100);
        assert_eq!(body["data"].as_array().unwrap().len(), 100);
        assert_eq!(body["columns"], json!(["Transaction_Amount", "Card_Type", "Is_Fraud"]));
    }

    #[cfg(feature = "csv-preview")]
    #[tokio::test]
    async fn test_csv_empty_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut config = ServiceConfig::default();
        config.csv.path = file.path().display().to_string();
        let app = router(context(config, None, None));

        let (status, body) = get_json(app, "/csv_data").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!([]));
        assert_eq!(body["total_rows"], 0);
    }

    #[cfg(feature = "csv-preview")]
    #[tokio::test]
    async fn test_csv_ragged_rows() {
        let short = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(short.path(), "a,b,c\n1,2,3\n4,5\n").unwrap();
        let mut config = ServiceConfig::default();
        config.csv.path = short.path().display().to_string();

        let (status, body) = get_json(router(context(config, None, None)), "/csv_data").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_rows"], 2);
        assert_eq!(body["data"][1]["c"], Value::Null);

        let long = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(long.path(), "a,b\n1,2\n3,4,5\n").unwrap();
        let mut config = ServiceConfig::default();
        config.csv.path = long.path().display().to_string();

        let (status, body) = get_json(router(context(config, None, None)), "/csv_data").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("Error parsing CSV file:"));
    }

    #[tokio::test]
    async fn test_malformed_bodies_get_json_errors() {
        let (status, body) = post_json(
            loaded_app(),
            "/predict_fraud",
            json!({ "feature_vector": ["x"] }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().starts_with("Invalid request body"));

        let (status, body) = post_json(loaded_app(), "/chat", json!({ "history": [] })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let request = Request::builder()
            .method(Method::POST)
            .uri("/predict_fraud")
            .body(Body::from(r#"{"feature_vector":[1.0,2.0,3.0]}"#))
            .unwrap();
        let (status, body) = send(loaded_app(), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let request = Request::builder()
            .method(Method::POST)
            .uri("/chat")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = send(loaded_app(), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_cors_preflight_mirrors_origin() {
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/predict_fraud")
            .header(header::ORIGIN, "http://127.0.0.1:5500")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
            .body(Body::empty())
            .unwrap();

        let response = loaded_app().oneshot(request).await.unwrap();
        let headers = response.headers();
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://127.0.0.1:5500"
        );
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    }
}
