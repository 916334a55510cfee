use crate::error::ThrottlerResult;
use crate::rate_limit_config::Policy;
use crate::store::{CounterStore, RateLimitResult};
use std::sync::Arc;

/// Applies a policy to a client key on top of a shared [`CounterStore`].
///
/// Each `(client key, key prefix)` pair is an independent counter, so a client
/// that exhausts one endpoint class keeps its quota for the others.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    pub fn check(
        &self,
        client_key: &str,
        key_prefix: &str,
        policy: &Policy,
    ) -> ThrottlerResult<RateLimitResult> {
        self.store.check_and_increment(
            &composite_key(client_key, key_prefix),
            policy.window,
            policy.max_requests,
        )
    }

    /// Give back the hit recorded by `result`, if its window is still current.
    pub fn refund(
        &self,
        client_key: &str,
        key_prefix: &str,
        result: &RateLimitResult,
    ) -> ThrottlerResult<()> {
        self.store
            .decrement(&composite_key(client_key, key_prefix), result.reset_time_ms)
    }

    pub fn reset(&self, client_key: &str, key_prefix: &str) -> ThrottlerResult<()> {
        self.store.reset(&composite_key(client_key, key_prefix))
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }
}

pub fn composite_key(client_key: &str, key_prefix: &str) -> String {
    format!("{}:{}", client_key, key_prefix)
}
