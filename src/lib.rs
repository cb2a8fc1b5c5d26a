pub mod admission;
pub mod appresult;
pub mod bus;
pub mod config;
pub mod conversations;
pub mod db;
pub mod messages;
pub mod metrics;

use std::sync::Arc;

use axum::{
    extract::FromRef,
    http::{header, HeaderName, Method},
    middleware,
    routing::get,
    Router,
};
use sqlx::SqlitePool;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub use appresult::{AppError, AppResult};

use admission::AdmissionController;
use bus::FanoutBus;
use config::Config;
use conversations::Registry;
use messages::ConversationStore;
use metrics::Metrics;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub registry: Registry,
    pub store: ConversationStore,
    pub bus: Arc<FanoutBus>,
    pub admission: Arc<AdmissionController>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: &Config, db_pool: SqlitePool) -> anyhow::Result<Self> {
        Ok(Self {
            registry: Registry::new(db_pool.clone(), config.id_scheme),
            store: ConversationStore::new(db_pool, config.retention),
            bus: FanoutBus::new(),
            admission: Arc::new(AdmissionController::new(
                config.rate_limit_max_requests,
                config.rate_limit_window,
            )),
            metrics: Metrics::new()?,
        })
    }
}

/// Every route lives under `/api/v1` behind the admission gate. Needs
/// `ConnectInfo<SocketAddr>` from the server.
pub fn app(state: AppState) -> Router {
    let api = Router::new()
        .merge(conversations::router())
        .merge(messages::router())
        .route("/metrics", get(metrics::metrics))
        .route_layer(middleware::from_fn_with_state(state.clone(), admission::admit_middleware));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, HeaderName::from_static("token")]);

    Router::new()
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub trait Required {
    fn required(self, name: &'static str) -> AppResult<String>;
}

impl Required for Option<String> {
    /// Absent and empty both count as missing.
    fn required(self, name: &'static str) -> AppResult<String> {
        self.filter(|value| !value.is_empty())
            .ok_or(AppError::MissingParameter(name))
    }
}

pub fn parse_user_id(raw: &str) -> AppResult<i64> {
    raw.trim()
        .parse()
        .map_err(|_| AppError::invalid(format!("userId must be an integer, got {raw:?}")))
}


#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use crate::testing::{call, get, test_state};

    use super::*;

    #[test]
    fn required_treats_empty_as_missing() {
        assert_eq!(Some("x".to_owned()).required("a").unwrap(), "x");
        assert!(matches!(None::<String>.required("a"), Err(AppError::MissingParameter("a"))));
        assert!(matches!(Some(String::new()).required("a"), Err(AppError::MissingParameter("a"))));
    }

    #[test]
    fn user_ids_are_integers() {
        assert_eq!(parse_user_id("42").unwrap(), 42);
        assert!(matches!(parse_user_id("forty-two"), Err(AppError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn admission_gate_returns_429_after_the_limit() {
        let state = test_state().await;
        let app = app(state.clone());

        for _ in 0..30 {
            let (status, _) = call(&app, get("/api/v1/history?convId=c")).await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, body) = call(&app, get("/api/v1/history?convId=c")).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], "Too many requests");
        assert_eq!(state.metrics.admission_denied.get(), 1);
    }

    #[tokio::test]
    async fn metrics_are_exposed() {
        let state = test_state().await;
        state.metrics.frames_dropped.inc();
        let app = app(state);

        let (status, body) = call(&app, get("/api/v1/metrics")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_str().unwrap().contains("relay_frames_dropped_total 1"));
    }
}
