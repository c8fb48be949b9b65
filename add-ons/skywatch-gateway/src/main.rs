//! Axum gateway for the dispatch engine: transcript ingestion, alert
//! lifecycle, dispatch requests, protocol reload, and the SSE event stream
//! the dashboard subscribes to. Config-driven via EngineConfig; provider
//! credentials stay in the backend environment and never reach a client.

mod handlers;

use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use skywatch_engine::{
    AuditStore, CallDispatcher, Classifier, DispatchEngine, EngineConfig, ExternalClassifier,
    LlmClassifier, ProtocolCatalog, RecipientDirectory,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DispatchEngine>,
}

fn build_engine(config: EngineConfig) -> Result<Arc<DispatchEngine>, Box<dyn std::error::Error>> {
    let catalog = Arc::new(ProtocolCatalog::load(&config.protocols_path)?);
    let directory = Arc::new(RecipientDirectory::load(&config.recipients_path)?);
    // Fail at startup, not mid-emergency, when a protocol names a role the
    // directory cannot dial.
    catalog.validate_against(&directory)?;

    let external = LlmClassifier::from_env().map(|c| Arc::new(c) as Arc<dyn ExternalClassifier>);
    if external.is_none() {
        tracing::info!("no external classifier configured, keyword ladder only");
    }
    let classifier = Classifier::new(
        external,
        config.classifier_timeout_ms,
        config.override_min_confidence,
    );

    let store = Arc::new(AuditStore::open_path(&config.storage_path, config.retention)?);
    let caller = Arc::new(CallDispatcher::from_env(Duration::from_secs(
        config.call_rate_limit_secs,
    )));

    let engine = Arc::new(DispatchEngine::new(
        config, catalog, directory, classifier, store, caller,
    ));

    // Call tasks from a previous run died with that process; sweep their
    // outstanding records so the affected alerts can be dispatched again.
    let swept = engine.recover()?;
    if swept > 0 {
        tracing::warn!(swept, "swept orphaned dispatch records from a previous run");
    }
    Ok(engine)
}

fn build_app(state: AppState) -> Router {
    // Dashboard dev servers sit on the 3000/8000 port ranges.
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            |origin: &axum::http::HeaderValue, _| {
                let s = origin.to_str().unwrap_or("");
                let port = s
                    .split(':')
                    .last()
                    .and_then(|p| p.parse::<u16>().ok())
                    .unwrap_or(0);
                (3000..=3099).contains(&port) || (8000..=8099).contains(&port)
            },
        ))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any);

    Router::new()
        .route("/api/v1/transcripts", post(handlers::alerts::ingest_transcript))
        .route("/api/v1/alerts", get(handlers::alerts::list_alerts))
        .route("/api/v1/alerts/:id", get(handlers::alerts::get_alert))
        .route(
            "/api/v1/alerts/:id/acknowledge",
            post(handlers::alerts::acknowledge_alert),
        )
        .route(
            "/api/v1/alerts/:id/resolve",
            post(handlers::alerts::resolve_alert),
        )
        .route(
            "/api/v1/dispatch",
            post(handlers::dispatch::create_dispatch).get(handlers::dispatch::list_dispatches),
        )
        .route("/api/v1/dispatch/:id", get(handlers::dispatch::get_dispatch))
        .route("/api/v1/protocols", get(handlers::system::list_protocols))
        .route(
            "/api/v1/protocols/reload",
            post(handlers::system::reload_protocols),
        )
        .route("/api/v1/events", get(handlers::system::events_stream))
        .route("/api/v1/health", get(handlers::system::health))
        .layer(cors)
        .with_state(state)
}

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!(
            "[skywatch-gateway] .env not loaded: {} (using system environment)",
            e
        );
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match EngineConfig::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "configuration load failed");
            std::process::exit(1);
        }
    };
    let port = config.port;
    let app_name = config.app_name.clone();

    let engine = match build_engine(config) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!(error = %e, "engine initialization failed");
            std::process::exit(1);
        }
    };

    let app = build_app(AppState { engine });
    let addr = format!("0.0.0.0:{}", port);
    tracing::info!(%addr, app = %app_name, "gateway listening");
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use skywatch_engine::caller::{CallPlacement, CallProvider, ProviderCallStatus};
    use skywatch_engine::{CallStatus, EngineError, SimulatedProvider};
    use tower::ServiceExt;

    /// Accepts the call and never confirms, keeping the record outstanding.
    struct HangingProvider;

    #[async_trait::async_trait]
    impl CallProvider for HangingProvider {
        async fn place_call(
            &self,
            _recipient_number: &str,
            _script: &str,
            _metadata: serde_json::Value,
        ) -> Result<CallPlacement, EngineError> {
            Ok(CallPlacement {
                provider_id: "hang_1".to_string(),
                simulated: true,
            })
        }

        async fn call_status(&self, _provider_id: &str) -> Result<ProviderCallStatus, EngineError> {
            Ok(ProviderCallStatus {
                status: CallStatus::Calling,
                duration_seconds: None,
            })
        }
    }

    fn test_app(dir: &tempfile::TempDir, provider: Arc<dyn CallProvider>) -> Router {
        let mut config = EngineConfig::default();
        config.storage_path = dir.path().join("audit").to_string_lossy().into_owned();
        config.protocols_path = "/nonexistent/protocols.toml".to_string();
        config.recipients_path = "/nonexistent/recipients.toml".to_string();
        config.call_rate_limit_secs = 0;
        config.call_poll_interval_secs = 0;
        config.retry_backoff_ms = 1;

        let catalog = Arc::new(ProtocolCatalog::load(&config.protocols_path).unwrap());
        let directory = Arc::new(RecipientDirectory::load(&config.recipients_path).unwrap());
        let store = Arc::new(AuditStore::open_path(&config.storage_path, config.retention).unwrap());
        let caller = Arc::new(CallDispatcher::new(provider, Duration::ZERO, true));
        let engine = Arc::new(DispatchEngine::new(
            config,
            catalog,
            directory,
            Classifier::keyword_only(),
            store,
            caller,
        ));
        build_app(AppState { engine })
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_simulation_mode() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir, Arc::new(SimulatedProvider));
        let res = app
            .oneshot(Request::get("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = body_json(res).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["simulation"], true);
    }

    #[tokio::test]
    async fn acknowledging_unknown_alert_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir, Arc::new(SimulatedProvider));
        let res = app
            .oneshot(post_json(
                "/api/v1/alerts/emrg_missing/acknowledge",
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn double_dispatch_returns_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir, Arc::new(HangingProvider));

        let res = app
            .clone()
            .oneshot(post_json(
                "/api/v1/transcripts",
                serde_json::json!({
                    "transcript": "Mayday mayday, engine failure, 120 souls on board",
                    "hints": { "callsign": "UAL423" }
                }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        let body = body_json(res).await;
        let alert_id = body["alert"]["id"].as_str().unwrap().to_string();
        assert_eq!(body["classification"]["emergency_type"], "engine_failure");

        let res = app
            .clone()
            .oneshot(post_json(
                "/api/v1/dispatch",
                serde_json::json!({ "alert_id": alert_id }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);

        let res = app
            .clone()
            .oneshot(post_json(
                "/api/v1/dispatch",
                serde_json::json!({ "alert_id": alert_id }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn routine_transcript_returns_classification_without_alert() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir, Arc::new(SimulatedProvider));
        let res = app
            .oneshot(post_json(
                "/api/v1/transcripts",
                serde_json::json!({ "transcript": "descend and maintain flight level 240" }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = body_json(res).await;
        assert!(body["alert"].is_null());
    }

    #[tokio::test]
    async fn bad_status_filter_is_422() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir, Arc::new(SimulatedProvider));
        let res = app
            .oneshot(
                Request::get("/api/v1/alerts?status=bogus")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
