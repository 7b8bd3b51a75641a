use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::response::Response;
use camino::Utf8Path;
use http_body_util::BodyExt as _;
use tokio::io::{AsyncBufReadExt as _, AsyncReadExt as _, AsyncWriteExt as _, BufReader};

use crate::config::Conf;
use crate::env::{self, EnvConfig};
use crate::http::RequestError;
use crate::launcher::{self, LaunchedProcess};
use crate::process_endpoint::{log_stderr, trim_eol};
use crate::resolver::{self, ScriptSource};
use crate::session::{self, RemoteInfo};

/// Run a classic CGI script for a plain (non-upgrade) HTTP request.
///
/// Scripts resolve under the CGI root with the same walk the WebSocket
/// resolver uses, and see the same environment, with `CONTENT_LENGTH` and
/// `CONTENT_TYPE` appended from the request so they mask the cleared
/// placeholders. The request body is piped to stdin; the script's stdout
/// must produce an RFC 3875 header section (`Status:` and/or headers, then
/// a blank line) followed by the body.
pub(crate) async fn handle(
    conf: &Conf,
    root: &Utf8Path,
    resolve_path: &str,
    peer_addr: SocketAddr,
    req: Request,
) -> Result<Response, RequestError> {
    let source = ScriptSource::Dir {
        root: root.to_path_buf(),
    };
    let resolution = resolver::resolve(resolve_path, &source).map_err(|error| {
        info!(target: "access", "NOT FOUND: {error}");
        RequestError::from(error)
    })?;

    let remote = RemoteInfo::resolve(peer_addr, conf.reverse_lookup).await;
    let request_id = session::generate_id();
    let (parts, body) = req.into_parts();

    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| parts.uri.host())
        .unwrap_or("");

    let mut env_list = env::create_env(
        &parts.headers,
        &parts.uri,
        &parts.method,
        parts.version,
        host,
        &remote,
        &resolution,
        &request_id,
        &EnvConfig {
            server_software: &conf.server_software,
            ssl: conf.ssl(),
            parent_env: &conf.parent_env,
            extra_env: &conf.extra_env,
        },
    )
    .map_err(RequestError::BadEnvironment)?;

    let body_bytes = body
        .collect()
        .await
        .map_err(RequestError::internal("failed to read the request body"))?
        .to_bytes();

    // Later entries mask the cleared placeholders emitted by the builder.
    env_list.push(("CONTENT_LENGTH".to_owned(), body_bytes.len().to_string()));
    if let Some(content_type) = parts.headers.get(header::CONTENT_TYPE).and_then(|value| value.to_str().ok()) {
        env_list.push(("CONTENT_TYPE".to_owned(), content_type.to_owned()));
    }

    let launched = launcher::launch(resolution.file_path.as_str(), &[], &env_list).map_err(|source| {
        RequestError::LaunchFailed {
            command: resolution.file_path.to_string(),
            source,
        }
    })?;

    let LaunchedProcess {
        mut child,
        mut stdin,
        stdout,
        stderr,
        ..
    } = launched;

    websocketd_task::spawn_in_span(log_stderr(stderr));

    if !body_bytes.is_empty() {
        stdin
            .write_all(&body_bytes)
            .await
            .map_err(RequestError::internal("failed to feed the request body to the script"))?;
    }
    drop(stdin);

    let mut reader = BufReader::new(stdout);
    let mut status = StatusCode::OK;
    let mut response_headers: Vec<(HeaderName, HeaderValue)> = Vec::new();
    let mut line = String::new();

    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .await
            .map_err(RequestError::internal("failed to read the script response"))?;
        if read == 0 {
            break;
        }

        let header_line = trim_eol(&line);
        if header_line.is_empty() {
            break;
        }

        let Some((name, value)) = header_line.split_once(':') else {
            warn!(line = header_line, "malformed CGI header line");
            return Err(RequestError::BadCgiOutput {
                detail: "header line without a colon",
            });
        };

        if name.eq_ignore_ascii_case("Status") {
            status = parse_status(value.trim()).ok_or(RequestError::BadCgiOutput {
                detail: "unparseable Status line",
            })?;
            continue;
        }

        let name = HeaderName::try_from(name.trim()).map_err(|_| RequestError::BadCgiOutput {
            detail: "invalid header name",
        })?;
        let value = HeaderValue::try_from(value.trim()).map_err(|_| RequestError::BadCgiOutput {
            detail: "invalid header value",
        })?;
        response_headers.push((name, value));
    }

    let mut response_body = Vec::new();
    reader
        .read_to_end(&mut response_body)
        .await
        .map_err(RequestError::internal("failed to read the script response"))?;

    if let Err(error) = child.wait().await {
        debug!(%error, "failed to reap CGI script");
    }

    let mut response = Response::builder()
        .status(status)
        .body(Body::from(response_body))
        .map_err(RequestError::internal("failed to assemble the response"))?;
    for (name, value) in response_headers {
        response.headers_mut().append(name, value);
    }

    Ok(response)
}

fn parse_status(value: &str) -> Option<StatusCode> {
    let code = value.split_whitespace().next()?;
    code.parse::<u16>().ok().and_then(|code| StatusCode::from_u16(code).ok())
}
