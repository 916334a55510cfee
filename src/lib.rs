pub mod client_key;
pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod rate_limit_config;
pub mod rate_limiter;
pub mod response;
pub mod server;
pub mod store;
pub mod throttler;

pub use client_key::ClientKeyResolver;
pub use config::Config;
pub use error::{ThrottlerError, ThrottlerResult};
pub use rate_limit_config::{PathPattern, Policy, Rule, RuleTable};
pub use rate_limiter::RateLimiter;
pub use response::ResponseBuilder;
pub use server::create_app;
pub use store::{CounterStore, MemoryStore, RateLimitResult};
pub use throttler::{throttle_middleware, ThrottleGate};
