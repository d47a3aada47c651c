use crate::gateway_router::{rebuild_from_registry, GatewayRouter};
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use kernel_core::config::KernelConfig;
use kernel_core::error::KernelError;
use kernel_core::http_registry::HttpMethod;
use kernel_core::plugin::RuntimeHandle;
use kernel_modules::auth::rate_limit::Bucket;
use kernel_modules::auth::{AuthBoundary, RawCredential};
use kernel_modules::authz;
use kernel_observability::MetricsCollector;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

const AUTH_PATH_PREFIX: &str = "/admin/auth/";

/// Everything the gateway's handlers need, cloned cheaply per request.
#[derive(Clone)]
pub struct GatewayState {
    pub runtime: Arc<RuntimeHandle>,
    pub router: Arc<GatewayRouter>,
    pub auth: Arc<AuthBoundary>,
    pub config: Arc<KernelConfig>,
    pub metrics: Arc<MetricsCollector>,
}

/// Builds the axum `Router` by compiling the current `HttpRegistry`
/// snapshot and mounting one catch-all handler per HTTP method, plus
/// `/metrics`. Intended to be called once, after plugins have had their
/// grace period to register contracts; routes added afterward are
/// invisible until the gateway is rebuilt.
pub fn build_router(state: GatewayState) -> Router {
    rebuild_from_registry(&state.router, &state.runtime.http_registry);

    Router::new()
        .route("/metrics", get(metrics_handler))
        .fallback(dispatch)
        .layer(axum::middleware::from_fn_with_state(state.config.clone(), security_headers))
        .with_state(state)
}

fn method_from_axum(method: &Method) -> Option<HttpMethod> {
    match method.as_str() {
        "GET" => Some(HttpMethod::Get),
        "POST" => Some(HttpMethod::Post),
        "PUT" => Some(HttpMethod::Put),
        "PATCH" => Some(HttpMethod::Patch),
        "DELETE" => Some(HttpMethod::Delete),
        _ => None,
    }
}

fn error_response(err: KernelError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(err.to_json_body())).into_response();
    if let Some(retry) = err.retry_after_secs() {
        if let Ok(value) = HeaderValue::from_str(&retry.to_string()) {
            response.headers_mut().insert("retry-after", value);
        }
    }
    response
}

/// Prefers a proxy-supplied client address over the raw socket peer, the
/// way the gateway already trusts `x-forwarded-proto` for scheme
/// detection.
fn client_identifier(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    peer.ip().to_string()
}

fn extract_credential(headers: &HeaderMap) -> Option<RawCredential<'_>> {
    if let Some(auth) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(value) = auth.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(RawCredential::Bearer(token));
            }
        }
    }
    if let Some(cookie) = headers.get(axum::http::header::COOKIE) {
        if let Ok(value) = cookie.to_str() {
            for part in value.split(';') {
                let part = part.trim();
                if let Some(session_id) = part.strip_prefix("session_id=") {
                    return Some(RawCredential::SessionCookie(session_id));
                }
            }
        }
    }
    None
}

async fn dispatch(
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<HashMap<String, String>>,
    method: Method,
    headers: HeaderMap,
    uri: axum::http::Uri,
    body: Bytes,
) -> Response {
    let operation_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    kernel_observability::request_logger::with_request_scope(operation_id, move |_id| async move {
        handle(state, peer, method, headers, uri, query, body).await
    })
    .await
}

async fn handle(
    state: GatewayState,
    peer: SocketAddr,
    method: Method,
    headers: HeaderMap,
    uri: axum::http::Uri,
    query: HashMap<String, String>,
    body: Bytes,
) -> Response {
    let started = std::time::Instant::now();
    let path = uri.path().to_string();

    let Some(http_method) = method_from_axum(&method) else {
        return error_response(KernelError::NotFound("method not routable".into()));
    };

    let Some(route_match) = state.router.match_route(http_method, uri.path()) else {
        return error_response(KernelError::NotFound(format!("no route for {} {}", method, uri.path())));
    };

    if !state.runtime.service_registry.has_service(&route_match.service_name) {
        return error_response(KernelError::NotFound(format!("service {}", route_match.service_name)));
    }

    let identifier = client_identifier(&headers, peer);

    if path.starts_with(AUTH_PATH_PREFIX) {
        if let Err(e) = state.auth.check_rate_limit(Bucket::Auth, &identifier).await {
            return error_response(e);
        }
    }

    let credential = extract_credential(&headers);
    let credential_present = credential.is_some();
    let ctx = match state.auth.authenticate(credential).await {
        Ok(ctx) => {
            if credential_present {
                state.metrics.record_auth_attempt("gateway", true);
            }
            ctx
        }
        Err(e) => {
            if credential_present {
                state.metrics.record_auth_attempt("gateway", false);
            }
            return error_response(e);
        }
    };

    if ctx.is_some() {
        let api_identifier = ctx.as_ref().and_then(|c| c.user_id.clone()).unwrap_or(identifier);
        if let Err(e) = state.auth.check_rate_limit(Bucket::Api, &api_identifier).await {
            return error_response(e);
        }
    }

    if !authz::check(ctx.as_ref(), &route_match.service_name, None) {
        return error_response(if ctx.is_some() { KernelError::Unauthorized } else { KernelError::Unauthenticated });
    }

    let args: Vec<Value> = route_match.params.iter().map(|(_, v)| Value::String(v.clone())).collect();

    let mut kwargs: HashMap<String, Value> = query.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
    if !body.is_empty() {
        match serde_json::from_slice::<Value>(&body) {
            Ok(Value::Object(map)) => {
                for (k, v) in map {
                    kwargs.insert(k, v);
                }
            }
            Ok(other) => {
                kwargs.insert("body".to_string(), other);
            }
            Err(_) => {
                return error_response(KernelError::InvalidInput("request body is not valid JSON".into()));
            }
        }
    }

    let timeout = std::time::Duration::from_millis(state.config.service_call_timeout_ms);
    let result = state
        .runtime
        .service_registry
        .call_with_timeout(&route_match.service_name, timeout, args, kwargs)
        .await;

    let operation_id = kernel_observability::request_logger::current_operation_id();
    let mut response = match result {
        Ok(value) => (StatusCode::OK, Json(value)).into_response(),
        Err(e) => error_response(e),
    };

    state.metrics.record_request(&path, method.as_str(), response.status().as_u16(), started.elapsed().as_secs_f64());

    if let Some(id) = operation_id {
        if let Ok(value) = HeaderValue::from_str(&id) {
            response.headers_mut().insert("x-request-id", value);
        }
    }
    response
}

/// Sets the fixed security header set on every response. Strictness of
/// the Content-Security-Policy depends on `environment`: relaxed in
/// development (so an admin UI served from a different origin can still
/// function), locked to `default-src 'self'` in production.
async fn security_headers(
    State(config): State<Arc<KernelConfig>>,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let is_https = request
        .headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "https")
        .unwrap_or(false);

    let origin = request.headers().get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok()).map(|s| s.to_string());

    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("x-xss-protection", HeaderValue::from_static("1; mode=block"));
    headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
    headers.insert(
        "permissions-policy",
        HeaderValue::from_static("geolocation=(), microphone=(), camera=()"),
    );
    if is_https {
        headers.insert(
            "strict-transport-security",
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        );
    }

    let csp = match config.csp_mode.as_str() {
        "strict" => "default-src 'self'",
        _ => "default-src 'self' 'unsafe-inline' 'unsafe-eval'; connect-src *",
    };
    headers.insert("content-security-policy", HeaderValue::from_static(csp));

    if let Some(origin) = origin {
        if config.cors.allowed_origins.iter().any(|o| o == "*" || o == &origin) {
            if let Ok(value) = HeaderValue::from_str(&origin) {
                headers.insert("access-control-allow-origin", value);
                headers.insert("vary", HeaderValue::from_static("origin"));
            }
        }
    }

    response
}

/// Returns Prometheus text exposition for the runtime's own metrics.
async fn metrics_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    let body = state.metrics.gather_text();
    ([("content-type", "text/plain; version=0.0.4")], body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csp_strict_in_production_relaxed_otherwise() {
        let mut cfg = KernelConfig::default();
        cfg.csp_mode = "strict".to_string();
        assert_eq!(
            match cfg.csp_mode.as_str() {
                "strict" => "default-src 'self'",
                _ => "default-src 'self' 'unsafe-inline' 'unsafe-eval'; connect-src *",
            },
            "default-src 'self'"
        );
    }
}
