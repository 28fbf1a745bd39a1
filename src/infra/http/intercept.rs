use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderName, HeaderValue, StatusCode, Uri},
    response::Response,
};
use http_body_util::{BodyExt, Limited};
use tracing::debug;
use url::Url;

use crate::cache::Snapshot;
use crate::engine::{EngineResponse, InterceptedRequest, Interception};
use crate::error::HttpError;
use crate::infra::network::{OutboundRequest, is_hop_by_hop};

use super::{HttpState, SOURCE_HEADER};

const SOURCE: &str = "infra::http::intercept";
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

pub(super) async fn intercept(
    State(state): State<HttpState>,
    request: Request,
) -> Result<Response, HttpError> {
    let (parts, body) = request.into_parts();
    let ctx = state.dispatcher.context();

    let url = upstream_url(ctx.origin(), &parts.uri).ok_or_else(|| {
        HttpError::new(
            SOURCE,
            StatusCode::BAD_REQUEST,
            "Invalid request target",
            format!("cannot resolve `{}` against the upstream origin", parts.uri),
        )
    })?;
    let body = Limited::new(body, MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|err| {
            HttpError::from_error(
                SOURCE,
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large",
                &*err,
            )
        })?
        .to_bytes();

    let request = InterceptedRequest::from_parts(parts.method, url, parts.headers);

    // Detached so a caller hanging up does not cancel cache warming.
    let dispatcher = state.dispatcher.clone();
    let task_request = request.clone();
    let interception = tokio::spawn(async move { dispatcher.handle(&task_request).await })
        .await
        .map_err(|err| {
            HttpError::from_error(
                SOURCE,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Interception failed",
                &err,
            )
        })?;

    match interception {
        Interception::Responded(response) => Ok(engine_response(response)),
        Interception::Declined(reason) => {
            debug!(url = %request.url, reason = reason.as_str(), "Forwarding declined request");
            let outbound = OutboundRequest::from_intercepted(&request).with_body(body);
            let snapshot = ctx.network().send(outbound).await.map_err(|err| {
                HttpError::from_error(SOURCE, StatusCode::BAD_GATEWAY, "Upstream unavailable", &err)
            })?;
            Ok(snapshot_response(snapshot))
        }
    }
}

/// Absolute-form targets are kept as sent; origin-form targets are rebased
/// onto the upstream origin.
fn upstream_url(origin: &Url, uri: &Uri) -> Option<Url> {
    if uri.scheme().is_some() {
        return Url::parse(&uri.to_string()).ok();
    }

    let mut url = origin.clone();
    url.set_path(uri.path());
    url.set_query(uri.query());
    Some(url)
}

fn engine_response(response: EngineResponse) -> Response {
    let source = response.source;
    let mut http = snapshot_response(response.snapshot);
    http.headers_mut()
        .insert(SOURCE_HEADER, HeaderValue::from_static(source.as_str()));
    http
}

fn snapshot_response(snapshot: Snapshot) -> Response {
    let Snapshot {
        status,
        headers: stored,
        body,
        ..
    } = snapshot;

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);

    let headers = response.headers_mut();
    for (name, value) in &stored {
        if is_hop_by_hop(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            headers.append(name, value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Url {
        Url::parse("http://dash.local:8000/").expect("origin")
    }

    #[test]
    fn origin_form_is_rebased_on_upstream() {
        let uri: Uri = "/api/odds?league=7".parse().expect("uri");
        let url = upstream_url(&origin(), &uri).expect("resolved");
        assert_eq!(url.as_str(), "http://dash.local:8000/api/odds?league=7");
    }

    #[test]
    fn double_slash_paths_stay_on_upstream() {
        let uri: Uri = "//elsewhere.example/x".parse().expect("uri");
        let url = upstream_url(&origin(), &uri).expect("resolved");
        assert_eq!(url.host_str(), Some("dash.local"));
    }

    #[test]
    fn absolute_form_is_kept() {
        let uri: Uri = "https://cdn.example/lib.js".parse().expect("uri");
        let url = upstream_url(&origin(), &uri).expect("resolved");
        assert_eq!(url.as_str(), "https://cdn.example/lib.js");
    }

    #[test]
    fn snapshot_headers_are_copied_without_hop_by_hop() {
        let snapshot = Snapshot::new(
            200,
            vec![
                ("content-type".to_string(), "text/css".to_string()),
                ("transfer-encoding".to_string(), "chunked".to_string()),
            ],
            "body{}",
        );
        let response = snapshot_response(snapshot);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok()),
            Some("text/css")
        );
        assert!(response.headers().get("transfer-encoding").is_none());
    }
}
