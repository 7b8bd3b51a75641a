use std::net::{SocketAddr, ToSocketAddrs as _};

use anyhow::Context as _;
use async_trait::async_trait;
use axum::Router;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse as _, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_rustls::TlsAcceptor;
use websocketd_task::{ChildTask, ShutdownSignal, Task};

use crate::GatewayState;

/// One bound TCP address serving HTTP (optionally behind TLS).
pub struct GatewayListener {
    addr: SocketAddr,
    listener: TcpListener,
    tls_acceptor: Option<TlsAcceptor>,
    state: GatewayState,
}

impl GatewayListener {
    pub fn init_and_bind(
        address: &str,
        tls_acceptor: Option<TlsAcceptor>,
        state: GatewayState,
    ) -> anyhow::Result<Self> {
        info!(%address, "Initiating listener…");

        let socket_addr = address
            .to_socket_addrs()
            .with_context(|| format!("invalid address {address}"))?
            .next()
            .with_context(|| format!("address {address} resolves to nothing"))?;

        let socket = if socket_addr.is_ipv4() {
            TcpSocket::new_v4().context("failed to create IPv4 TCP socket")?
        } else {
            TcpSocket::new_v6().context("failed to create IPv6 TCP socket")?
        };
        socket.bind(socket_addr).context("failed to bind TCP socket")?;

        let listener = socket
            .listen(64)
            .context("failed to listen with the bound TCP socket")?;

        let socket_addr = listener.local_addr().context("failed to read bound TCP address")?;

        let scheme = if tls_acceptor.is_some() { "wss" } else { "ws" };
        let base_path = &state.conf.base_path;
        info!("Listening on {scheme}://{socket_addr}{base_path}");

        Ok(Self {
            addr: socket_addr,
            listener,
            tls_acceptor,
            state,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[instrument("listener", skip(self), fields(addr = %self.addr))]
    pub async fn run(self) -> anyhow::Result<()> {
        loop {
            match self.listener.accept().await.context("failed to accept connection") {
                Ok((stream, peer_addr)) => {
                    let state = self.state.clone();
                    let tls_acceptor = self.tls_acceptor.clone();

                    ChildTask::spawn(async move {
                        let result = match tls_acceptor {
                            Some(acceptor) => serve_tls_peer(stream, acceptor, state, peer_addr).await,
                            None => serve_peer(stream, state, peer_addr).await,
                        };

                        if let Err(error) = result {
                            debug!(error = format!("{error:#}"), client = %peer_addr, "Peer failure");
                        }
                    })
                    .detach();
                }
                Err(error) => error!(error = format!("{error:#}"), "Listener failure"),
            }
        }
    }
}

#[async_trait]
impl Task for GatewayListener {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "gateway listener";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        tokio::select! {
            result = self.run() => result,
            _ = shutdown_signal.wait() => Ok(()),
        }
    }
}

async fn serve_tls_peer(
    stream: TcpStream,
    acceptor: TlsAcceptor,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> anyhow::Result<()> {
    let tls_stream = acceptor.accept(stream).await.context("TLS handshake failed")?;
    serve_peer(tls_stream, state, peer_addr).await
}

async fn serve_peer<I>(io: I, state: GatewayState, peer_addr: SocketAddr) -> anyhow::Result<()>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let app = crate::make_http_service(state).layer(axum::Extension(ConnectInfo(peer_addr)));
    let service = TowerToHyperService::new(app);

    auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(io), service)
        .await
        .map_err(|error| anyhow::anyhow!("HTTP connection error: {error}"))
}

/// Plain-HTTP listener that answers everything with a redirect to the
/// equivalent HTTPS URL.
pub struct RedirectListener {
    addr: SocketAddr,
    listener: TcpListener,
    target_port: u16,
}

impl RedirectListener {
    pub fn init_and_bind(port: u16, target_port: u16) -> anyhow::Result<Self> {
        let socket_addr = SocketAddr::from(([0, 0, 0, 0], port));

        let socket = TcpSocket::new_v4().context("failed to create IPv4 TCP socket")?;
        socket.bind(socket_addr).context("failed to bind redirect socket")?;
        let listener = socket
            .listen(64)
            .context("failed to listen with the bound redirect socket")?;

        info!(addr = %socket_addr, target_port, "Redirect listener started");

        Ok(Self {
            addr: socket_addr,
            listener,
            target_port,
        })
    }

    #[instrument("redirect", skip(self), fields(addr = %self.addr))]
    pub async fn run(self) -> anyhow::Result<()> {
        let app = Router::new().fallback(redirect_to_https).with_state(self.target_port);

        loop {
            match self.listener.accept().await.context("failed to accept connection") {
                Ok((stream, peer_addr)) => {
                    let app = app.clone().layer(axum::Extension(ConnectInfo(peer_addr)));
                    let service = TowerToHyperService::new(app);

                    ChildTask::spawn(async move {
                        let result = auto::Builder::new(TokioExecutor::new())
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                        if let Err(error) = result {
                            debug!(%error, client = %peer_addr, "Redirect peer failure");
                        }
                    })
                    .detach();
                }
                Err(error) => error!(error = format!("{error:#}"), "Redirect listener failure"),
            }
        }
    }
}

#[async_trait]
impl Task for RedirectListener {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "https redirect listener";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        tokio::select! {
            result = self.run() => result,
            _ = shutdown_signal.wait() => Ok(()),
        }
    }
}

async fn redirect_to_https(State(target_port): State<u16>, req: Request) -> Response {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    let name = crate::env::tell_host_port(host, true)
        .map(|(name, _)| name)
        .unwrap_or_else(|_| host.to_owned());

    let path_and_query = req
        .uri()
        .path_and_query()
        .map_or_else(|| req.uri().path().to_owned(), |pq| pq.as_str().to_owned());

    let location = if target_port == 443 {
        format!("https://{name}{path_and_query}")
    } else {
        format!("https://{name}:{target_port}{path_and_query}")
    };

    match axum::http::HeaderValue::try_from(location) {
        Ok(value) => {
            let mut response = StatusCode::FOUND.into_response();
            response.headers_mut().insert(header::LOCATION, value);
            response
        }
        Err(_) => StatusCode::BAD_REQUEST.into_response(),
    }
}
