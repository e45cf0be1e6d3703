pub mod admin;
pub mod auth;
pub mod metrics;

pub use admin::require_admin;
pub use auth::{auth_middleware, AuthUser};
pub use metrics::metrics_middleware;
