use crate::cache::{ResponseCache, build_cache_key, get_or_fetch};
use crate::claims::{AuthError, Claims};
use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use common::config::CacheConfig;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

/// Read side of the analytical store, one query per role and endpoint.
#[async_trait]
pub trait DashboardQuery: Send + Sync {
    /// Unknown endpoints are `Error::InvalidInput`.
    async fn fetch(
        &self,
        role: &str,
        endpoint: &str,
        filters: &BTreeMap<String, Value>,
    ) -> common::Result<Value>;
}

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<dyn ResponseCache>,
    pub queries: Arc<dyn DashboardQuery>,
    pub ttls: CacheConfig,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

#[derive(Debug)]
pub enum AppError {
    Auth(AuthError),
    Query(common::Error),
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        AppError::Auth(err)
    }
}

impl From<common::Error> for AppError {
    fn from(err: common::Error) -> Self {
        AppError::Query(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Auth(AuthError::Forbidden) => (StatusCode::FORBIDDEN, AuthError::Forbidden.to_string()),
            AppError::Auth(err) => (StatusCode::UNAUTHORIZED, err.to_string()),
            AppError::Query(common::Error::InvalidInput(msg)) => (StatusCode::BAD_REQUEST, msg),
            AppError::Query(err) => {
                error!(error = %err, "Dashboard query failed");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        };
        let body = Json(ErrorBody {
            success: false,
            error: message,
        });
        (status, body).into_response()
    }
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "checked_at": Utc::now().to_rfc3339()}))
}

/// Agent views are scoped to the caller's own identifier.
const AGENT_ID_CLAIMS: [&str; 3] = ["agent_id", "sub", "user_id"];

async fn dashboard(
    Path((role, endpoint)): Path<(String, String)>,
    Query(params): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<Value>, AppError> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let claims = Claims::from_authorization(authorization)?;
    claims.require_role(&role)?;

    let mut filters: BTreeMap<String, Value> = params
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();
    if role.eq_ignore_ascii_case("agent") {
        let agent_id = claims
            .first_of(&AGENT_ID_CLAIMS)
            .ok_or(AppError::Auth(AuthError::Forbidden))?;
        filters.insert("agent_id".to_string(), Value::String(agent_id));
    }

    let key = build_cache_key(&role, &endpoint, &filters);
    let ttl = Duration::from_secs(state.ttls.ttl_for(&role));
    let cached = get_or_fetch(state.cache.as_ref(), &key, ttl, || {
        state.queries.fetch(&role, &endpoint, &filters)
    })
    .await?;
    debug!(key = %key, cache_hit = cached.cache_hit, "Served dashboard response");

    let mut body = cached.body;
    body.insert("cache_hit".to_string(), Value::Bool(cached.cache_hit));
    Ok(Json(Value::Object(body)))
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/dashboard/{role}/{endpoint}", get(dashboard))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::claims::bearer;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tower::ServiceExt;

    #[derive(Default)]
    struct CountingQuery {
        calls: AtomicU32,
    }

    #[async_trait]
    impl DashboardQuery for CountingQuery {
        async fn fetch(
            &self,
            role: &str,
            endpoint: &str,
            filters: &BTreeMap<String, Value>,
        ) -> common::Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match (role, endpoint) {
                ("agent", "assigned_loans") => Ok(json!({
                    "loans": [{"loan_id": "L1"}],
                    "total": 1,
                    "agent_id": filters.get("agent_id"),
                })),
                ("hr", "performance") => Ok(json!([{"agent_id": "A1"}])),
                _ => Err(common::Error::InvalidInput(format!("Unknown endpoint: {}", endpoint))),
            }
        }
    }

    fn app() -> (Router, Arc<CountingQuery>, Arc<MemoryCache>) {
        let queries = Arc::new(CountingQuery::default());
        let cache = Arc::new(MemoryCache::new());
        let state = AppState {
            cache: cache.clone(),
            queries: queries.clone(),
            ttls: CacheConfig::default(),
        };
        (routes(state), queries, cache)
    }

    async fn call(router: &Router, uri: &str, token: Option<&Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().uri(uri);
        if let Some(claims) = token {
            request = request.header(header::AUTHORIZATION, bearer(claims));
        }
        let response = router
            .clone()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (router, _, _) = app();
        let (status, body) = call(&router, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_second_request_is_served_from_cache() {
        let (router, queries, cache) = app();
        let claims = json!({"role": "agent", "agent_id": "A7"});
        let uri = "/dashboard/agent/assigned_loans?date=2024-01-03";

        let (status, first) = call(&router, uri, Some(&claims)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["cache_hit"], false);
        assert_eq!(first["agent_id"], "A7");

        let (_, second) = call(&router, uri, Some(&claims)).await;
        assert_eq!(second["cache_hit"], true);
        assert_eq!(second["total"], 1);
        assert_eq!(queries.calls.load(Ordering::SeqCst), 1);

        let cached = cache
            .get("agent:assigned_loans:agent_id=A7:date=2024-01-03")
            .await
            .unwrap();
        assert!(cached.is_some());
    }

    #[tokio::test]
    async fn test_agents_do_not_share_entries() {
        let (router, queries, _) = app();
        let uri = "/dashboard/agent/assigned_loans";
        call(&router, uri, Some(&json!({"role": "agent", "agent_id": "A1"}))).await;
        let (_, body) = call(&router, uri, Some(&json!({"role": "agent", "sub": "A2"}))).await;
        assert_eq!(body["agent_id"], "A2");
        assert_eq!(queries.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_object_results_are_wrapped() {
        let (router, _, _) = app();
        let (status, body) = call(&router, "/dashboard/hr/performance", Some(&json!({"role": "hr"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["agent_id"], "A1");
    }

    #[tokio::test]
    async fn test_auth_failures() {
        let (router, queries, _) = app();
        let uri = "/dashboard/manager/branch_summary";

        let (status, body) = call(&router, uri, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Missing Authorization header");

        let (status, _) = call(&router, uri, Some(&json!({"role": "agent", "agent_id": "A1"}))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(queries.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_endpoint_is_bad_request() {
        let (router, _, cache) = app();
        let (status, body) = call(&router, "/dashboard/hr/unknown", Some(&json!({"role": "hr"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(cache.is_empty());
    }
}
