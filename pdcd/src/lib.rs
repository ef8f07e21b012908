//! Progressive Delivery Controller daemon internals.
//!
//! The daemon owns the canary subsystem: per-target metrics accumulation,
//! the live traffic router, rollback execution, deployment history, and
//! the controller that drives a rollout through its phases. The HTTP API
//! in [`http_api`] is the only surface the surrounding application and
//! operators consume.

pub mod controller;
pub mod events;
pub mod health;
pub mod history;
pub mod http_api;
pub mod metrics;
pub mod rollback;
pub mod router;
pub mod telemetry;
