//! HTTP handlers for bank-service.

pub mod accounts;
pub mod health;
pub mod transfers;

pub use health::{health_check, healthcheck, metrics, readiness_check};
