use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{FromRequestParts as _, Request, State, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse as _, Response};
use camino::Utf8Path;
use tower::util::ServiceExt as _;
use tower_http::services::ServeDir;

use crate::GatewayState;
use crate::http::RequestError;
use crate::{cgi, console, session};

/// The HTTP surface of the daemon: every request lands in [`dispatch`].
pub fn make_http_service(state: GatewayState) -> Router {
    Router::new().fallback(dispatch).with_state(state)
}

/// Mux between the WebSocket session flow and the plain-HTTP surfaces
/// (dev console, static files, CGI, 404), then stamp the configured
/// response headers on whatever came out.
async fn dispatch(
    State(state): State<GatewayState>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let conf = Arc::clone(&state.conf);
    let upgrade_requested = is_websocket_upgrade(req.headers());

    let mut response = if upgrade_requested {
        match handle_websocket(state, peer_addr, req).await {
            Ok(response) => response,
            Err(error) => error.into_response(),
        }
    } else {
        serve_plain(&state, peer_addr, req).await
    };

    let is_upgrade_response = response.status() == StatusCode::SWITCHING_PROTOCOLS;
    append_headers(response.headers_mut(), &conf.headers);
    if is_upgrade_response {
        append_headers(response.headers_mut(), &conf.headers_ws);
    } else {
        append_headers(response.headers_mut(), &conf.headers_http);
    }

    response
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    let connection = headers
        .get(header::CONNECTION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    upgrade.eq_ignore_ascii_case("websocket") && connection.to_ascii_lowercase().contains("upgrade")
}

async fn handle_websocket(
    state: GatewayState,
    peer_addr: SocketAddr,
    req: Request,
) -> Result<Response, RequestError> {
    let base_path = state.conf.base_path.clone();
    let resolve_path = strip_base_path(req.uri().path(), &base_path)
        .ok_or(RequestError::OutsideBasePath)?
        .to_owned();

    let (mut parts, _body) = req.into_parts();
    let ws = WebSocketUpgrade::from_request_parts(&mut parts, &())
        .await
        .map_err(|rejection| RequestError::BadHandshake(Box::new(rejection)))?;

    session::handle_upgrade(state, peer_addr, ws, parts, resolve_path).await
}

async fn serve_plain(state: &GatewayState, peer_addr: SocketAddr, req: Request) -> Response {
    let conf = &state.conf;

    let Some(stripped) = strip_base_path(req.uri().path(), &conf.base_path) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let stripped = stripped.to_owned();

    if conf.dev_console {
        if req.method() == Method::GET || req.method() == Method::HEAD {
            return console::serve();
        }
        return StatusCode::NOT_FOUND.into_response();
    }

    if let Some(dir) = &conf.static_dir {
        return serve_static(dir, &stripped, req).await;
    }

    if let Some(dir) = &conf.cgi_dir {
        return cgi::handle(conf, dir, &stripped, peer_addr, req)
            .await
            .unwrap_or_else(|error| error.into_response());
    }

    StatusCode::NOT_FOUND.into_response()
}

async fn serve_static(dir: &Utf8Path, stripped: &str, req: Request) -> Response {
    let (mut parts, body) = req.into_parts();
    parts.uri = with_path(&parts.uri, stripped);
    let req = Request::from_parts(parts, body);

    match ServeDir::new(dir).oneshot(req).await {
        Ok(response) => response.map(Body::new),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Requests outside the configured base path are foreign; inside it, the
/// prefix is stripped before any script resolution.
fn strip_base_path<'a>(path: &'a str, base_path: &str) -> Option<&'a str> {
    if base_path == "/" {
        return Some(path);
    }

    let rest = path.strip_prefix(base_path)?;
    if rest.is_empty() {
        Some("/")
    } else if rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

fn with_path(uri: &Uri, new_path: &str) -> Uri {
    let replaced = match uri.query() {
        Some(query) => format!("{new_path}?{query}"),
        None => new_path.to_owned(),
    };
    replaced.parse().unwrap_or_else(|_| Uri::from_static("/"))
}

fn append_headers(headers: &mut HeaderMap, configured: &[(HeaderName, HeaderValue)]) {
    for (name, value) in configured {
        headers.append(name.clone(), value.clone());
    }
}
