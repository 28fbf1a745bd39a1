//! The proxy's HTTP surface.
//!
//! Everything not under `/__sideline/` is an intercepted request and goes
//! through the [`Dispatcher`]. The control routes carry the coordination
//! channel between pages and the engine.

mod control;
mod intercept;
mod middleware;

use axum::{
    Router,
    http::HeaderName,
    middleware as axum_middleware,
    routing::{get, post},
};

use crate::engine::{Coordinator, Dispatcher};

pub use middleware::RequestContext;

/// Names where an intercepted response came from.
pub const SOURCE_HEADER: HeaderName = HeaderName::from_static("x-sideline-source");

#[derive(Clone)]
pub struct HttpState {
    pub dispatcher: Dispatcher,
    pub coordinator: Coordinator,
}

impl HttpState {
    pub fn new(dispatcher: Dispatcher, coordinator: Coordinator) -> Self {
        Self {
            dispatcher,
            coordinator,
        }
    }
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/__sideline/messages", post(control::post_message))
        .route("/__sideline/channel", get(control::channel))
        .route("/__sideline/status", get(control::status))
        .fallback(intercept::intercept)
        .layer(axum_middleware::from_fn(middleware::log_responses))
        .layer(axum_middleware::from_fn(middleware::set_request_context))
        .with_state(state)
}
