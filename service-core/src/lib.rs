//! service-core: shared infrastructure for the IAM services.
//!
//! Everything here is tenant- and engine-agnostic: the HTTP error envelope,
//! the layered configuration loader, tracing bootstrap and the middleware that
//! every router mounts.
pub mod config;
pub mod error;
pub mod middleware;
pub mod observability;

pub use axum;
pub use serde;
pub use serde_json;
pub use tokio;
pub use tower;
pub use tower_http;
pub use tracing;
pub use validator;
