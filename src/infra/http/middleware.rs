use std::time::Instant;

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use metrics::histogram;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::ResponseSource;
use crate::error::ErrorReport;

use super::SOURCE_HEADER;

const CONTROL_PREFIX: &str = "/__sideline/";
const FORWARDED: &str = "forwarded";
const CONTROL: &str = "control";

const ENGINE_SOURCES: [ResponseSource; 5] = [
    ResponseSource::Network,
    ResponseSource::Precache,
    ResponseSource::Runtime,
    ResponseSource::OfflineDocument,
    ResponseSource::Synthesized,
];

#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
}

pub async fn set_request_context(mut request: Request<Body>, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let ctx = RequestContext {
        request_id: request_id.clone(),
    };
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).await;
    response.extensions_mut().insert(ctx);
    response
}

/// Label for where a response came from: an engine source, `control` for
/// the coordination routes, or `forwarded` for declined requests.
fn served_from(path: &str, response: &Response) -> &'static str {
    if path.starts_with(CONTROL_PREFIX) {
        return CONTROL;
    }
    let header = response
        .headers()
        .get(SOURCE_HEADER)
        .and_then(|value| value.to_str().ok());
    ENGINE_SOURCES
        .into_iter()
        .map(ResponseSource::as_str)
        .find(|label| Some(*label) == header)
        .unwrap_or(FORWARDED)
}

/// Time every response by where it was served from and log the ones worth
/// a look: failures of the proxy itself and answers given while degraded.
pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let request_id = request
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id.clone())
        .unwrap_or_default();

    let mut response = next.run(request).await;
    let status = response.status().as_u16();
    let served_from = served_from(&path, &response);
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    histogram!("sideline_response_ms", "served_from" => served_from).record(elapsed_ms);

    if let Some(report) = response.extensions_mut().remove::<ErrorReport>() {
        let detail = report
            .messages
            .first()
            .cloned()
            .unwrap_or_else(|| "no diagnostic available".to_string());
        if response.status().is_server_error() {
            error!(
                target = "sideline::http::response",
                status,
                method = %method,
                path = %path,
                elapsed_ms,
                source = report.source,
                detail = %detail,
                chain = ?report.messages,
                request_id = %request_id,
                "proxy failed to answer",
            );
        } else {
            warn!(
                target = "sideline::http::response",
                status,
                method = %method,
                path = %path,
                source = report.source,
                detail = %detail,
                request_id = %request_id,
                "request rejected",
            );
        }
        return response;
    }

    match served_from {
        "offline-document" | "synthesized" => info!(
            target = "sideline::http::response",
            status,
            method = %method,
            path = %path,
            served_from,
            request_id = %request_id,
            "answered from the offline fallback",
        ),
        _ => debug!(
            target = "sideline::http::response",
            status,
            method = %method,
            path = %path,
            served_from,
            elapsed_ms,
            request_id = %request_id,
            "request served",
        ),
    }

    response
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn tagged(label: &'static str) -> Response {
        let mut response = Response::new(Body::empty());
        response
            .headers_mut()
            .insert(SOURCE_HEADER, HeaderValue::from_static(label));
        response
    }

    #[test]
    fn engine_sources_are_reported_as_sent() {
        assert_eq!(served_from("/app.css", &tagged("precache")), "precache");
        assert_eq!(
            served_from("/dashboard", &tagged("offline-document")),
            "offline-document"
        );
    }

    #[test]
    fn untagged_and_unknown_responses_were_forwarded() {
        assert_eq!(served_from("/api/bets", &Response::new(Body::empty())), FORWARDED);
        assert_eq!(served_from("/api/bets", &tagged("elsewhere")), FORWARDED);
    }

    #[test]
    fn coordination_routes_are_control() {
        assert_eq!(
            served_from("/__sideline/status", &Response::new(Body::empty())),
            CONTROL
        );
    }
}
