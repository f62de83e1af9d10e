//! REST API layer.
//!
//! Provides the receipt query endpoints, the liveness check, and the
//! control-parameter helpers shared with ingress.

pub mod health;
pub mod params;
pub mod replies;

pub use health::health_routes;
pub use params::{control_param, control_param_multi, query_pairs, ControlPrefixes};
pub use replies::replies_routes;
