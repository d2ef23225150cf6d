//! Authorization guard API.
//!
//! - [`AuthGuard`]: require-auth / require-permission / require-any / require-all
//! - [`Evaluator`]: cached, hierarchy-ordered evaluation against the rule engine
//! - [`GuardOptions`]: immutable configuration, built once per process
//! - [`DomainAdapter`]: named checks for domain modules
//! - [`RequirePermissionLayer`] / [`Authenticated`]: axum integration
//!
//! # Usage
//!
//! ```rust,ignore
//! use keystone_core::guard::{AuthGuard, GuardError};
//!
//! async fn list_tasks(State(guard): State<Arc<AuthGuard>>, headers: HeaderMap) -> Result<Json<Vec<Task>>, GuardError> {
//!     let principal = guard.require_permission(&headers, "scheduler:tasks:read").await?;
//!     // ...
//! }
//! ```

mod adapters;
mod auth_guard;
mod circuit_breaker;
mod evaluator;
mod layer;
mod options;

pub use adapters::DomainAdapter;
pub use auth_guard::{AuthGuard, GuardError};
pub use circuit_breaker::{Admission, CircuitBreaker, CircuitBreakerMetrics, CircuitState};
pub use evaluator::{Evaluation, EvaluationError, Evaluator};
pub use layer::{Authenticated, RequirePermissionLayer, RequirePermissionService};
pub use options::{CircuitBreakerOptions, GuardOptions, GuardOptionsBuilder, Profile};
