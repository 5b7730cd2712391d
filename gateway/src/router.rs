//! The Gateway-side HTTP middleware that turns an external request
//! into a tunnel `Request`/`Response` round trip.
//!
//! Installed as the axum `Router`'s fallback so it only ever sees
//! requests that didn't match `/health` or the `/tunnel` upgrade
//! endpoint; the CRUD/test/log-history HTTP surfaces the wider product
//! exposes are out of scope here and simply aren't registered, so every
//! other path reaches this handler.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::stream;
use tokio::time::Instant;
use tunnel_protocol::{is_hop_by_hop, Message};
use uuid::Uuid;

use crate::session::TunnelSession;
use crate::GatewayState;

const MAX_REQUEST_BODY_BYTES: usize = 10 * 1024 * 1024;
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REQUEST_ID_LEN: usize = 64;

pub async fn handle(State(state): State<Arc<GatewayState>>, req: Request<Body>) -> Response {
    let (parts, body) = req.into_parts();
    let host = extract_host(&parts.headers, &parts.uri);

    let mapping_id = match identify_mapping(&state, &parts.headers, &host).await {
        Some(id) => id,
        None => return landing_page_or_unavailable(&state, &host).await,
    };

    let Some(session) = state.session_manager.current().await else {
        let _ = state.edge_proxy.remove_route(mapping_id).await;
        return service_unavailable();
    };

    if let Some(declared) = content_length(&parts.headers) {
        if declared > MAX_REQUEST_BODY_BYTES {
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body exceeds 10 MiB").into_response();
        }
    }

    let body_bytes = match to_bytes(body, MAX_REQUEST_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return (StatusCode::PAYLOAD_TOO_LARGE, "request body exceeds 10 MiB").into_response(),
    };

    let request_id = derive_request_id(&parts.headers);
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let rx = session.register_streaming(request_id.clone());
    session
        .enqueue(Message::Request {
            request_id: request_id.clone(),
            mapping_id,
            method: parts.method.as_str().to_string(),
            path_and_query,
            headers: headers_to_wire(&parts.headers),
            initial_body: Some(body_bytes.to_vec()),
            has_more_body: false,
        })
        .await;

    let deadline = Instant::now() + RESPONSE_TIMEOUT;
    forward_response(&state, &session, mapping_id, &request_id, rx, deadline, &parts.uri).await
}

async fn landing_page_or_unavailable(state: &Arc<GatewayState>, host: &str) -> Response {
    if host.eq_ignore_ascii_case(&state.config.gateway.public_base_domain) {
        if let Some(landing_page) = state.landing_page.load_full() {
            return Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/html; charset=utf-8")
                .body(Body::from(landing_page.0.clone()))
                .unwrap_or_else(|_| service_unavailable());
        }
    }
    service_unavailable()
}

fn service_unavailable() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "No tunnel configured for this host").into_response()
}

/// Prefer the edge proxy's stamped mapping-id header (valid
/// even with no live tunnel, since it comes from Caddy's own config),
/// falling back to a host lookup against the active session's snapshot.
async fn identify_mapping(state: &Arc<GatewayState>, headers: &HeaderMap, host: &str) -> Option<Uuid> {
    if let Some(header_value) = headers.get("X-Octoporty-Mapping-Id") {
        if let Ok(text) = header_value.to_str() {
            if let Ok(id) = Uuid::parse_str(text) {
                return Some(id);
            }
        }
    }

    let session = state.session_manager.current().await?;
    session.find_mapping(|m| m.external_domain.eq_ignore_ascii_case(host)).map(|m| m.id)
}

fn extract_host(headers: &HeaderMap, uri: &axum::http::Uri) -> String {
    let raw = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| uri.host())
        .unwrap_or("");
    raw.rsplit_once(':').map(|(host, _)| host).unwrap_or(raw).to_string()
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Accept the client's id only if present and short enough;
/// otherwise mint a fresh one.
fn derive_request_id(headers: &HeaderMap) -> String {
    if let Some(value) = headers.get("X-Octoporty-Request-Id").and_then(|v| v.to_str().ok()) {
        if !value.is_empty() && value.len() <= MAX_REQUEST_ID_LEN {
            return value.to_string();
        }
    }
    Uuid::new_v4().simple().to_string()
}

fn headers_to_wire(headers: &HeaderMap) -> Vec<(String, Vec<String>)> {
    let mut seen = std::collections::HashSet::new();
    let mut result = Vec::new();
    for name in headers.keys() {
        if !seen.insert(name.as_str().to_string()) {
            continue;
        }
        let values: Vec<String> = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect();
        result.push((name.as_str().to_string(), values));
    }
    result
}

/// Consume the Agent's reply stream, mapping a missing
/// first event to the self-healing 503 and everything else onto the
/// external response as it arrives.
async fn forward_response(
    state: &Arc<GatewayState>,
    session: &TunnelSession,
    mapping_id: Uuid,
    request_id: &str,
    mut rx: tokio::sync::mpsc::Receiver<Message>,
    deadline: Instant,
    uri: &axum::http::Uri,
) -> Response {
    let remaining = deadline.saturating_duration_since(Instant::now());
    let first = tokio::time::timeout(remaining, rx.recv()).await;

    let (status, headers, initial_body, has_more_body) = match first {
        Ok(Some(Message::Response { status, headers, initial_body, has_more_body, .. })) => {
            (status, headers, initial_body, has_more_body)
        }
        Ok(Some(other)) => {
            tracing::warn!(request_id, kind = other.kind(), "unexpected first reply frame");
            session.unregister_streaming(request_id);
            return (StatusCode::BAD_GATEWAY, "upstream returned an unexpected reply").into_response();
        }
        Ok(None) => {
            tracing::warn!(request_id, "tunnel produced no reply events, self-healing route");
            session.unregister_streaming(request_id);
            let _ = state.edge_proxy.remove_route(mapping_id).await;
            return service_unavailable();
        }
        Err(_) => {
            tracing::warn!(request_id, "timed out waiting for upstream response");
            session.unregister_streaming(request_id);
            return (StatusCode::GATEWAY_TIMEOUT, "upstream did not respond in time").into_response();
        }
    };

    let path = uri.path().to_string();
    if !has_more_body {
        session.unregister_streaming(request_id);
        return build_response_headers(status, headers, &path).body(Body::from(initial_body.unwrap_or_default())).unwrap_or_else(|_| service_unavailable());
    }

    let session = session.clone();
    let request_id = request_id.to_string();
    let body_stream = stream::unfold(
        (rx, deadline, false, session, request_id),
        |(mut rx, deadline, stopped, session, request_id)| async move {
            if stopped {
                session.unregister_streaming(&request_id);
                return None;
            }
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    session.unregister_streaming(&request_id);
                    return None;
                }
                match tokio::time::timeout(remaining, rx.recv()).await {
                    Ok(Some(Message::ResponseBodyChunk { bytes, is_final, .. })) => {
                        if bytes.is_empty() {
                            if is_final {
                                session.unregister_streaming(&request_id);
                                return None;
                            }
                            continue;
                        }
                        return Some((
                            Ok::<_, std::io::Error>(Bytes::from(bytes)),
                            (rx, deadline, is_final, session, request_id),
                        ));
                    }
                    Ok(Some(_)) => continue,
                    Ok(None) | Err(_) => {
                        session.unregister_streaming(&request_id);
                        return None;
                    }
                }
            }
        },
    );

    build_response_headers(status, headers, &path)
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| service_unavailable())
}

/// Excludes hop-by-hop headers and `Content-Length` (axum
/// recomputes it), infers `Content-Type` from the request path when the
/// upstream omitted it.
fn build_response_headers(status: u16, headers: Vec<(String, Vec<String>)>, path: &str) -> axum::http::response::Builder {
    let mut builder = Response::builder().status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));
    let mut saw_content_type = false;

    for (name, values) in headers {
        if is_hop_by_hop(&name) || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        if name.eq_ignore_ascii_case("content-type") {
            saw_content_type = true;
        }
        for value in values {
            builder = builder.header(&name, value);
        }
    }

    if !saw_content_type {
        let guess = mime_guess::from_path(path).first_raw().unwrap_or("application/octet-stream");
        builder = builder.header("content-type", guess);
    }

    builder
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn derive_request_id_accepts_short_client_id() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Octoporty-Request-Id", HeaderValue::from_static("client-req-1"));
        assert_eq!(derive_request_id(&headers), "client-req-1");
    }

    #[test]
    fn derive_request_id_rejects_oversized_client_id() {
        let mut headers = HeaderMap::new();
        let long = "a".repeat(100);
        headers.insert("X-Octoporty-Request-Id", HeaderValue::from_str(&long).unwrap());
        assert_ne!(derive_request_id(&headers), long);
    }

    #[test]
    fn extract_host_strips_port() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::HOST, HeaderValue::from_static("app.test:8443"));
        let uri: axum::http::Uri = "/".parse().unwrap();
        assert_eq!(extract_host(&headers, &uri), "app.test");
    }
}
