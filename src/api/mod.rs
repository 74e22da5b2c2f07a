//! HTTP control surface
//!
//! Exposes monitoring control, status, event history, a live event stream
//! and the tagging operations over a localhost axum server. When a session
//! token is configured every route except `/health` requires it.

mod error;
mod routes;
mod server;

pub use error::ApiError;
pub use routes::{ControlResponse, EventsQuery, PathParams, TagRequest, DEFAULT_EVENTS_LIMIT};
pub use server::{ApiServer, ApiServerConfig, ApiState};
