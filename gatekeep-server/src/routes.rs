use crate::config::Settings;
use axum::extract::{ConnectInfo, State};
use axum::http::{Extensions, HeaderMap, StatusCode, Uri};
use axum::routing::{any, get, put};
use axum::{Json, Router};
use gatekeep::{
    AdmissionLayer, ApiKeyPolicy, ConfigError, IdentityMode, Limiter, LimiterConfig, LimiterStore,
    StoreFailurePolicy,
};
use std::net::SocketAddr;
use std::sync::Arc;

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

#[derive(Clone)]
struct AppState {
    store: Arc<dyn LimiterStore>,
    admin_token: Option<Arc<str>>,
}

fn connect_info(extensions: &Extensions) -> Option<SocketAddr> {
    extensions.get::<ConnectInfo<SocketAddr>>().map(|info| info.0)
}

fn limited(
    store: &Arc<dyn LimiterStore>,
    settings: &Settings,
    mode: IdentityMode,
) -> Result<AdmissionLayer<Limiter<dyn LimiterStore>>, ConfigError> {
    let config = LimiterConfig::new(mode, settings.requests_limit, settings.client_block_time)?;
    let failure = if settings.fail_open {
        StoreFailurePolicy::FailOpen
    } else {
        StoreFailurePolicy::FailClosed
    };
    Ok(AdmissionLayer::new(Limiter::new(config, store.clone()))
        .with_api_key_header(settings.api_key_header.clone())
        .with_store_failure_policy(failure)
        .with_peer_addr(connect_info))
}

/// Build the application router. Each limited route gets its own limiter;
/// they share `store`, so an identity's usage counts across routes.
pub fn router(store: Arc<dyn LimiterStore>, settings: &Settings) -> Result<Router, ConfigError> {
    let mut app = Router::new()
        .route("/healthz", get(healthz))
        .route("/ip", any(ping).layer(limited(&store, settings, IdentityMode::IpOnly)?))
        .route("/apikey", any(ping).layer(limited(&store, settings, IdentityMode::ApiKeyOnly)?))
        .route("/ip-apikey", any(ping).layer(limited(&store, settings, IdentityMode::IpOrApiKey)?))
        .fallback(any(ping).layer(limited(&store, settings, settings.limit_type)?));

    if settings.admin_token.is_some() {
        app = app.route("/admin/api-keys", put(upsert_api_key));
    }

    Ok(app.with_state(AppState {
        store,
        admin_token: settings.admin_token.as_deref().map(Arc::from),
    }))
}

async fn ping(uri: Uri) -> String {
    format!("ping {}", uri.path())
}

async fn healthz() -> &'static str {
    "ok"
}

/// Compares in time independent of where the first differing byte is.
fn tokens_match(presented: &[u8], expected: &[u8]) -> bool {
    presented.len() == expected.len()
        && presented.iter().zip(expected).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

async fn upsert_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ApiKeyPolicy>,
) -> Result<StatusCode, (StatusCode, String)> {
    let presented = headers.get(ADMIN_TOKEN_HEADER).map(|v| v.as_bytes()).unwrap_or_default();
    let authorized = state
        .admin_token
        .as_deref()
        .is_some_and(|expected| tokens_match(presented, expected.as_bytes()));
    if !authorized {
        return Err((StatusCode::UNAUTHORIZED, "invalid admin token".into()));
    }

    let policy = ApiKeyPolicy::new(body.id, body.max_requests)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    state.store.persist_policy(&policy).await.map_err(|e| {
        tracing::warn!(error = %e, "failed to persist api key policy");
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    tracing::info!(api_key = %policy.id, max = policy.max_requests, "api key policy updated");
    Ok(StatusCode::NO_CONTENT)
}
