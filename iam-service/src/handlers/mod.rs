pub mod auth;
pub mod metrics;
pub mod oauth;
pub mod rules;
pub mod well_known;
