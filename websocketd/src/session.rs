use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::WebSocketUpgrade;
use axum::extract::ws::WebSocket;
use axum::http::header;
use axum::http::request::Parts;
use axum::response::Response;
use tracing::Instrument as _;
use typed_builder::TypedBuilder;

use crate::GatewayState;
use crate::endpoint::{FramingMode, pipe_endpoints};
use crate::env::{self, EnvConfig};
use crate::http::RequestError;
use crate::launcher::{self, LaunchedProcess};
use crate::limiter::ForkGuard;
use crate::process_endpoint::ProcessEndpoint;
use crate::resolver;
use crate::socket_endpoint::SocketEndpoint;

/// Who is on the other end of the connection.
#[derive(Debug, Clone)]
pub struct RemoteInfo {
    pub addr: String,
    pub host: String,
    pub port: String,
}

impl RemoteInfo {
    /// `host` falls back to the address text: reverse lookups are best
    /// effort and their failures are swallowed.
    pub async fn resolve(peer: SocketAddr, reverse_lookup: bool) -> Self {
        let addr = peer.ip().to_string();
        let port = peer.port().to_string();

        let host = if reverse_lookup {
            lookup_addr(peer.ip()).await.unwrap_or_else(|| addr.clone())
        } else {
            addr.clone()
        };

        Self { addr, host, port }
    }
}

async fn lookup_addr(ip: IpAddr) -> Option<String> {
    tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&ip).ok())
        .await
        .ok()
        .flatten()
}

/// Monotonically unique session token, modeled after Apache mod_unique_id.
pub(crate) fn generate_id() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos().to_string())
        .unwrap_or_else(|_| "0".to_owned())
}

/// Admit, prepare and run one WebSocket session.
///
/// Stops at the first failing step with the matching status: 404 for an
/// unresolvable script, 429 when the fork pool is exhausted, 403 on origin
/// rejection, 500 when the environment cannot be built or the child fails
/// to launch. The fork token travels into the upgrade callback so it is
/// released on every return path.
pub(crate) async fn handle_upgrade(
    state: GatewayState,
    peer_addr: SocketAddr,
    ws: WebSocketUpgrade,
    parts: Parts,
    resolve_path: String,
) -> Result<Response, RequestError> {
    let conf = Arc::clone(&state.conf);

    let session_id = generate_id();
    let remote = RemoteInfo::resolve(peer_addr, conf.reverse_lookup).await;

    let resolution = resolver::resolve(&resolve_path, &conf.script_source).map_err(|error| {
        info!(target: "access", "NOT FOUND: {error}");
        RequestError::from(error)
    })?;

    let fork_guard = state.limiter.try_acquire()?;

    let host = request_host(&parts);
    let origin = parts
        .headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());

    conf.origin_policy.check(origin, host, conf.ssl())?;

    let env_list = env::create_env(
        &parts.headers,
        &parts.uri,
        &parts.method,
        parts.version,
        host,
        &remote,
        &resolution,
        &session_id,
        &EnvConfig {
            server_software: &conf.server_software,
            ssl: conf.ssl(),
            parent_env: &conf.parent_env,
            extra_env: &conf.extra_env,
        },
    )
    .map_err(RequestError::BadEnvironment)?;

    let (command, args) = resolution.command(&conf.script_source);
    let command = command.to_owned();

    let launched = launcher::launch(&command, args, &env_list).map_err(|source| RequestError::LaunchFailed {
        command: command.clone(),
        source,
    })?;

    let span = info_span!(
        "session",
        id = %session_id,
        remote = %remote.host,
        origin = origin.unwrap_or(""),
        url = %parts.uri,
        command = %command,
        pid = launched.pid.unwrap_or(0),
    );

    let mode = if conf.binary {
        FramingMode::Binary
    } else {
        FramingMode::Text
    };
    let close_grace = conf.close_grace;

    let response = ws.on_upgrade(move |socket| {
        Session::builder()
            .socket(socket)
            .launched(launched)
            .mode(mode)
            .close_grace(close_grace)
            .fork_guard(fork_guard)
            .build()
            .run()
            .instrument(span)
    });

    Ok(response)
}

fn request_host(parts: &Parts) -> &str {
    parts
        .headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| parts.uri.host())
        .unwrap_or("")
}

/// One admitted session: the upgraded socket, the launched child, and the
/// fork token that is given back when the session ends.
#[derive(TypedBuilder)]
struct Session {
    socket: WebSocket,
    launched: LaunchedProcess,
    mode: FramingMode,
    close_grace: Duration,
    fork_guard: ForkGuard,
}

impl Session {
    async fn run(self) {
        let Self {
            socket,
            launched,
            mode,
            close_grace,
            fork_guard,
        } = self;

        info!(target: "access", "CONNECT");

        let process_endpoint = ProcessEndpoint::new(launched, mode, close_grace);
        let socket_endpoint = SocketEndpoint::new(socket, mode);

        pipe_endpoints(process_endpoint, socket_endpoint).await;

        info!(target: "access", "DISCONNECT");
        drop(fork_guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique_and_monotonic() {
        let first: u128 = generate_id().parse().expect("numeric id");
        std::thread::sleep(Duration::from_millis(1));
        let second: u128 = generate_id().parse().expect("numeric id");
        assert!(second > first);
    }

    #[tokio::test]
    async fn remote_info_without_lookup_uses_the_address() {
        let peer: SocketAddr = "192.0.2.1:4242".parse().expect("socket addr");
        let remote = RemoteInfo::resolve(peer, false).await;
        assert_eq!(remote.addr, "192.0.2.1");
        assert_eq!(remote.host, "192.0.2.1");
        assert_eq!(remote.port, "4242");
    }
}
