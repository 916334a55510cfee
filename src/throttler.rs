use crate::client_key::ClientKeyResolver;
use crate::clock::{Clock, SystemClock};
use crate::error::{ThrottlerError, ThrottlerResult};
use crate::rate_limit_config::RuleTable;
use crate::rate_limiter::RateLimiter;
use crate::response::ResponseBuilder;
use axum::extract::{Request, State};
use axum::http::header::USER_AGENT;
use axum::middleware::Next;
use axum::response::Response;
use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Admission control in front of a downstream handler.
///
/// Each request is either admitted (the handler runs and its response gets
/// quota headers) or denied with a terminal response; there is no queueing.
/// Any limiter failure admits the request, since a broken throttle must not
/// take the service down with it.
pub struct ThrottleGate {
    rules: RuleTable,
    limiter: RateLimiter,
    resolver: ClientKeyResolver,
    clock: Arc<dyn Clock>,
}

impl ThrottleGate {
    pub fn new(rules: RuleTable, limiter: RateLimiter) -> Self {
        Self {
            rules,
            limiter,
            resolver: ClientKeyResolver::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_resolver(mut self, resolver: ClientKeyResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Clock used for `Retry-After`. Should match the store's clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn resolver(&self) -> &ClientKeyResolver {
        &self.resolver
    }

    pub async fn handle<F, Fut>(&self, request: Request, downstream: F) -> Response
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        let path = request.uri().path().to_string();
        let Some(rule) = self.rules.match_path(&path) else {
            return downstream(request).await;
        };

        let client_key = self.resolver.resolve_request(&request);
        let checked = contain_panic(|| self.limiter.check(&client_key, &rule.key_prefix, &rule.policy));
        let mut result = match checked {
            Ok(result) => result,
            Err(err) => {
                error!(
                    target: "route_throttle::gate",
                    client_key = %client_key,
                    path = %path,
                    key_prefix = %rule.key_prefix,
                    error = %err,
                    "Rate limiter failed, admitting request"
                );
                return downstream(request).await;
            }
        };

        if !result.allowed {
            let user_agent = request
                .headers()
                .get(USER_AGENT)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("unknown");
            warn!(
                target: "route_throttle::gate",
                client_key = %client_key,
                path = %path,
                key_prefix = %rule.key_prefix,
                total_hits = result.total_hits,
                limit = rule.policy.max_requests,
                user_agent = %user_agent,
                "Rate limit exceeded"
            );
            return ResponseBuilder::denial(&rule.policy, &result, self.clock.now_ms());
        }

        let response = downstream(request).await;

        if rule.policy.skips_status(response.status().as_u16()) {
            let refunded = contain_panic(|| self.limiter.refund(&client_key, &rule.key_prefix, &result));
            if let Err(err) = refunded {
                error!(
                    target: "route_throttle::gate",
                    client_key = %client_key,
                    key_prefix = %rule.key_prefix,
                    error = %err,
                    "Failed to refund skipped request"
                );
            } else {
                debug!(
                    target: "route_throttle::gate",
                    client_key = %client_key,
                    key_prefix = %rule.key_prefix,
                    status = %response.status(),
                    "Request not counted against quota"
                );
                result.total_hits = result.total_hits.saturating_sub(1);
                result.remaining = (result.remaining + 1).min(result.limit);
            }
        }

        ResponseBuilder::annotate(response, &result)
    }
}

/// Run a limiter operation, turning a panic from the store into an error so
/// the caller can fail open.
fn contain_panic<T>(op: impl FnOnce() -> ThrottlerResult<T>) -> ThrottlerResult<T> {
    panic::catch_unwind(AssertUnwindSafe(op)).unwrap_or_else(|payload| {
        Err(ThrottlerError::Internal(format!(
            "counter store panicked: {}",
            panic_message(payload.as_ref())
        )))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Axum middleware mounting a shared [`ThrottleGate`], for use with
/// `axum::middleware::from_fn_with_state`.
pub async fn throttle_middleware(
    State(gate): State<Arc<ThrottleGate>>,
    request: Request,
    next: Next,
) -> Response {
    gate.handle(request, |request| next.run(request)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::error::{ThrottlerError, ThrottlerResult};
    use crate::rate_limit_config::{PathPattern, Policy, Rule};
    use crate::response::{X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING};
    use crate::store::{CounterStore, MemoryStore, RateLimitResult, DEFAULT_TTL};
    use axum::body::Body;
    use axum::http::{header, StatusCode};
    use axum::response::IntoResponse;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Store that fails every operation and counts how often it was touched.
    #[derive(Default)]
    struct BrokenStore {
        calls: AtomicUsize,
    }

    impl CounterStore for BrokenStore {
        fn check_and_increment(&self, _: &str, _: Duration, _: u64) -> ThrottlerResult<RateLimitResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ThrottlerError::Internal("store unavailable".to_string()))
        }

        fn decrement(&self, _: &str, _: u64) -> ThrottlerResult<()> {
            Err(ThrottlerError::Internal("store unavailable".to_string()))
        }

        fn reset(&self, _: &str) -> ThrottlerResult<()> {
            Err(ThrottlerError::Internal("store unavailable".to_string()))
        }

        fn len(&self) -> usize {
            0
        }

        fn capacity(&self) -> usize {
            0
        }
    }

    /// Store whose every operation panics.
    struct PanickingStore;

    impl CounterStore for PanickingStore {
        fn check_and_increment(&self, _: &str, _: Duration, _: u64) -> ThrottlerResult<RateLimitResult> {
            panic!("store corrupted");
        }

        fn decrement(&self, _: &str, _: u64) -> ThrottlerResult<()> {
            panic!("store corrupted");
        }

        fn reset(&self, _: &str) -> ThrottlerResult<()> {
            panic!("store corrupted");
        }

        fn len(&self) -> usize {
            0
        }

        fn capacity(&self) -> usize {
            0
        }
    }

    fn auth_table(policy: Policy) -> RuleTable {
        RuleTable::new(vec![Rule::new(PathPattern::prefix("/api/auth"), "auth", policy)]).unwrap()
    }

    fn gate(policy: Policy) -> (ThrottleGate, MockClock) {
        let clock = MockClock::new(1_000_000);
        let store = MemoryStore::with_clock(100, DEFAULT_TTL, Arc::new(clock.clone())).unwrap();
        let gate = ThrottleGate::new(auth_table(policy), RateLimiter::new(Arc::new(store)))
            .with_clock(Arc::new(clock.clone()));
        (gate, clock)
    }

    fn request(path: &str) -> Request {
        Request::builder()
            .uri(path)
            .header("x-forwarded-for", "1.2.3.4")
            .body(Body::empty())
            .unwrap()
    }

    async fn ok_handler(_request: Request) -> Response {
        StatusCode::OK.into_response()
    }

    #[tokio::test]
    async fn test_denies_after_limit() {
        let (gate, clock) = gate(Policy::new(Duration::from_secs(60), 3));

        for expected in ["2", "1", "0"] {
            let response = gate.handle(request("/api/auth/login"), ok_handler).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()[X_RATELIMIT_REMAINING], expected);
        }

        clock.advance_ms(20_000);
        let called = AtomicUsize::new(0);
        let response = gate
            .handle(request("/api/auth/login"), |req| {
                called.fetch_add(1, Ordering::SeqCst);
                ok_handler(req)
            })
            .await;

        assert_eq!(called.load(Ordering::SeqCst), 0);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "40");
        assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "0");
        assert_eq!(response.headers()[X_RATELIMIT_LIMIT], "3");
    }

    #[tokio::test]
    async fn test_unmatched_path_skips_store() {
        let store = Arc::new(BrokenStore::default());
        let gate = ThrottleGate::new(
            auth_table(Policy::new(Duration::from_secs(60), 1)),
            RateLimiter::new(store.clone()),
        );

        let response = gate.handle(request("/static/logo.png"), ok_handler).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
        assert!(response.headers().get(X_RATELIMIT_LIMIT).is_none());
    }

    #[tokio::test]
    async fn test_fails_open_when_store_errors() {
        let store = Arc::new(BrokenStore::default());
        let gate = ThrottleGate::new(
            auth_table(Policy::new(Duration::from_secs(60), 1)),
            RateLimiter::new(store.clone()),
        );

        for _ in 0..3 {
            let response = gate.handle(request("/api/auth/login"), ok_handler).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get(X_RATELIMIT_LIMIT).is_none());
        }
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fails_open_when_store_panics() {
        let gate = Arc::new(ThrottleGate::new(
            auth_table(Policy::new(Duration::from_secs(60), 1)),
            RateLimiter::new(Arc::new(PanickingStore)),
        ));
        let called = Arc::new(AtomicUsize::new(0));

        let task_gate = Arc::clone(&gate);
        let task_called = Arc::clone(&called);
        let outcome = tokio::spawn(async move {
            task_gate
                .handle(request("/api/auth/login"), |req| {
                    task_called.fetch_add(1, Ordering::SeqCst);
                    ok_handler(req)
                })
                .await
        })
        .await;

        let response = outcome.expect("gate must not propagate a store panic");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(X_RATELIMIT_LIMIT).is_none());
        assert_eq!(called.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_contain_panic_reports_message() {
        let err = contain_panic::<()>(|| panic!("boom {}", 7)).unwrap_err();
        assert_eq!(err.to_string(), "Internal error: counter store panicked: boom 7");
    }

    #[tokio::test]
    async fn test_skip_successful_requests_refunds_quota() {
        let policy = Policy::new(Duration::from_secs(60), 2).skip_successful_requests(true);
        let (gate, _clock) = gate(policy);

        for _ in 0..5 {
            let response = gate.handle(request("/api/auth/login"), ok_handler).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "2");
        }

        // Failed responses still count.
        for expected in ["1", "0"] {
            let response = gate
                .handle(request("/api/auth/login"), |_| async {
                    StatusCode::UNAUTHORIZED.into_response()
                })
                .await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(response.headers()[X_RATELIMIT_REMAINING], expected);
        }
        let response = gate.handle(request("/api/auth/login"), ok_handler).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_skip_failed_requests_refunds_quota() {
        let policy = Policy::new(Duration::from_secs(60), 2).skip_failed_requests(true);
        let (gate, _clock) = gate(policy);

        for _ in 0..5 {
            let response = gate
                .handle(request("/api/auth/login"), |_| async {
                    StatusCode::UNAUTHORIZED.into_response()
                })
                .await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "2");
        }

        // Failures were not counted, so the successful quota is intact.
        for _ in 0..2 {
            let response = gate.handle(request("/api/auth/login"), ok_handler).await;
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = gate.handle(request("/api/auth/login"), ok_handler).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_every_request_counted_by_default() {
        let (gate, _clock) = gate(Policy::new(Duration::from_secs(60), 2));

        for _ in 0..2 {
            gate.handle(request("/api/auth/login"), |_| async {
                StatusCode::UNAUTHORIZED.into_response()
            })
            .await;
        }

        let response = gate.handle(request("/api/auth/login"), ok_handler).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
