use crate::throttler::ThrottleGate;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::{info, Instrument};
use uuid::Uuid;

/// Client identity resolved for a request, available to downstream handlers
/// as a request extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity(pub String);

/// Logging middleware for request/response tracking. Resolves the client
/// with the gate's resolver so logs name the same key that is throttled.
pub async fn logging_middleware(
    State(gate): State<Arc<ThrottleGate>>,
    mut request: Request,
    next: Next,
) -> Response {
    let request_id = Uuid::new_v4();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let client_ip = gate.resolver().resolve_request(&request);
    request
        .extensions_mut()
        .insert(ClientIdentity(client_ip.clone()));

    let span = tracing::info_span!("request", request_id = %request_id);

    async move {
        info!(
            target: "route_throttle::middleware",
            method = %method,
            uri = %uri,
            client_ip = %client_ip,
            "Incoming request"
        );

        let response = next.run(request).await;

        info!(
            target: "route_throttle::middleware",
            method = %method,
            uri = %uri,
            status = %response.status(),
            "Request completed"
        );

        response
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_key::ClientKeyResolver;
    use crate::rate_limit_config::RuleTable;
    use crate::rate_limiter::RateLimiter;
    use crate::store::{MemoryStore, DEFAULT_TTL};
    use axum::body::Body;
    use axum::routing::get;
    use axum::{middleware, Extension, Router};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_logged_client_matches_gate_resolver() {
        let store = Arc::new(MemoryStore::new(16, DEFAULT_TTL).unwrap());
        let gate = ThrottleGate::new(RuleTable::default_table().unwrap(), RateLimiter::new(store))
            .with_resolver(ClientKeyResolver::with_headers(["fly-client-ip"]));

        let app = Router::new()
            .route(
                "/whoami",
                get(|Extension(ClientIdentity(ip)): Extension<ClientIdentity>| async move { ip }),
            )
            .layer(middleware::from_fn_with_state(Arc::new(gate), logging_middleware));

        let request = Request::builder()
            .uri("/whoami")
            .header("x-forwarded-for", "1.1.1.1")
            .header("fly-client-ip", "2.2.2.2")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"2.2.2.2");
    }
}
