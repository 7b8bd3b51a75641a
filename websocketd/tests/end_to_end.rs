//! Full-stack scenarios: a real listener on an ephemeral port, driven by a
//! WebSocket client.

#![cfg(unix)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use websocketd::GatewayState;
use websocketd::config::Conf;
use websocketd::limiter::ForkLimiter;
use websocketd::listener::GatewayListener;
use websocketd::log::LogLevel;
use websocketd::origin::OriginPolicy;
use websocketd::resolver::ScriptSource;

fn base_conf(script_source: ScriptSource) -> Conf {
    Conf {
        addresses: Vec::new(),
        port: 0,
        base_path: "/".to_owned(),
        tls: None,
        reverse_lookup: false,
        script_source,
        static_dir: None,
        cgi_dir: None,
        dev_console: false,
        max_forks: 0,
        binary: false,
        close_grace: Duration::ZERO,
        origin_policy: OriginPolicy::default(),
        parent_env: Vec::new(),
        extra_env: Vec::new(),
        server_software: "websocketd/test".to_owned(),
        headers: Vec::new(),
        headers_ws: Vec::new(),
        headers_http: Vec::new(),
        log_level: LogLevel::Error,
        redir_port: None,
    }
}

fn command(name: &str, args: &[&str]) -> ScriptSource {
    ScriptSource::Command {
        name: name.to_owned(),
        args: args.iter().map(|arg| (*arg).to_owned()).collect(),
    }
}

async fn start_server(conf: Conf) -> SocketAddr {
    let limiter = Arc::new(ForkLimiter::new(conf.max_forks));
    let state = GatewayState {
        conf: Arc::new(conf),
        limiter,
    };

    let listener = GatewayListener::init_and_bind("127.0.0.1:0", None, state).expect("bind test listener");
    let addr = listener.addr();
    tokio::spawn(listener.run());
    addr
}

#[tokio::test]
async fn echo_session_delivers_one_text_frame() {
    let addr = start_server(base_conf(command("/bin/echo", &["foo bar", "baz"]))).await;

    let (mut ws, _response) = connect_async(format!("ws://{addr}/")).await.expect("upgrade succeeds");

    let frame = ws.next().await.expect("one frame").expect("readable frame");
    assert_eq!(frame.into_text().expect("text frame").as_str(), "foo bar baz");

    // After the child's EOF the server tears the session down; the client
    // observes a close frame or the connection ending.
    match ws.next().await {
        None => {}
        Some(Ok(frame)) => assert!(frame.is_close(), "unexpected extra frame: {frame:?}"),
        Some(Err(_)) => {}
    }
}

#[tokio::test]
async fn cat_session_echoes_frames_in_order() {
    let addr = start_server(base_conf(command("/bin/cat", &[]))).await;

    let (mut ws, _response) = connect_async(format!("ws://{addr}/")).await.expect("upgrade succeeds");

    for text in ["foo bar", "foo baz", "foo bam"] {
        ws.send(Message::text(text)).await.expect("send frame");
        let frame = ws.next().await.expect("echoed frame").expect("readable frame");
        assert_eq!(frame.into_text().expect("text frame").as_str(), text);
    }

    ws.close(None).await.expect("close");
}

#[tokio::test]
async fn binary_session_ferries_opaque_frames() {
    let mut conf = base_conf(command("/bin/cat", &[]));
    conf.binary = true;
    let addr = start_server(conf).await;

    let (mut ws, _response) = connect_async(format!("ws://{addr}/")).await.expect("upgrade succeeds");

    let payload = vec![0x00, 0xff, 0x10, 0x20];
    ws.send(Message::binary(payload.clone())).await.expect("send frame");

    let frame = ws.next().await.expect("echoed frame").expect("readable frame");
    match frame {
        Message::Binary(data) => assert_eq!(data.as_ref(), payload.as_slice()),
        other => panic!("expected a binary frame, got {other:?}"),
    }

    ws.close(None).await.expect("close");
}

#[tokio::test]
async fn origin_allow_list_admits_and_rejects() {
    let mut conf = base_conf(command("/bin/cat", &[]));
    conf.origin_policy = OriginPolicy::from_options(false, Some("example.com")).expect("valid list");
    let addr = start_server(conf).await;

    // Port-less entry: any port on the allowed host is fine.
    let mut request = format!("ws://{addr}/").into_client_request().expect("request");
    request
        .headers_mut()
        .insert("Origin", HeaderValue::from_static("http://example.com:81"));
    let (mut ws, _response) = connect_async(request).await.expect("allowed origin upgrades");
    ws.close(None).await.expect("close");

    let mut request = format!("ws://{addr}/").into_client_request().expect("request");
    request
        .headers_mut()
        .insert("Origin", HeaderValue::from_static("http://evil.com"));
    match connect_async(request).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 403),
        other => panic!("evil origin must be rejected with 403, got {other:?}"),
    }
}

#[tokio::test]
async fn fork_limit_rejects_the_second_session_with_429() {
    let mut conf = base_conf(command("/bin/cat", &[]));
    conf.max_forks = 1;
    let addr = start_server(conf).await;

    let (mut first, _response) = connect_async(format!("ws://{addr}/")).await.expect("first upgrade");

    match connect_async(format!("ws://{addr}/")).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 429),
        other => panic!("second session must be refused with 429, got {other:?}"),
    }

    // Releasing the first session frees the slot again.
    first.close(None).await.expect("close first");
    drop(first);
    tokio::time::sleep(Duration::from_secs(2)).await;

    let (mut third, _response) = connect_async(format!("ws://{addr}/"))
        .await
        .expect("slot is free after the first session ended");
    third.close(None).await.expect("close third");
}

#[tokio::test]
async fn script_dir_resolves_scripts_and_404s_everything_else() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().join("ws");
    std::fs::create_dir_all(root.join("foo")).expect("mkdir");
    let script = root.join("foo/greet.sh");
    std::fs::write(&script, "#!/bin/sh\necho \"hello $PATH_INFO\"\n").expect("write script");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    }

    let mut conf = base_conf(ScriptSource::Dir {
        root: camino::Utf8PathBuf::from_path_buf(root).expect("utf-8 root"),
    });
    conf.parent_env = vec![("PATH".to_owned(), "/usr/bin:/bin".to_owned())];
    let addr = start_server(conf).await;

    let (mut ws, _response) = connect_async(format!("ws://{addr}/foo/greet.sh/extra/x"))
        .await
        .expect("script resolves");
    let frame = ws.next().await.expect("greeting").expect("readable frame");
    assert_eq!(frame.into_text().expect("text frame").as_str(), "hello /extra/x");

    match connect_async(format!("ws://{addr}/foo/missing.sh")).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 404),
        other => panic!("missing script must yield 404, got {other:?}"),
    }
}

/// Minimal HTTP/1.1 GET over a raw socket, for the plain-HTTP surfaces.
async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.expect("send request");

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.expect("read response");
    String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test]
async fn dev_console_is_served_to_plain_requests() {
    let mut conf = base_conf(command("/bin/cat", &[]));
    conf.dev_console = true;
    conf.headers_http = vec![(
        "server".parse().expect("header name"),
        "websocketd-test".parse().expect("header value"),
    )];
    let addr = start_server(conf).await;

    let response = http_get(addr, "/anything").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("websocketd console"));
    assert!(response.to_ascii_lowercase().contains("server: websocketd-test"));
}

#[tokio::test]
async fn plain_requests_without_a_surface_get_404() {
    let addr = start_server(base_conf(command("/bin/cat", &[]))).await;
    let response = http_get(addr, "/").await;
    assert!(response.starts_with("HTTP/1.1 404"));
}

#[tokio::test]
async fn cgi_scripts_answer_plain_requests() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = dir.path().join("hello.sh");
    std::fs::write(
        &script,
        "#!/bin/sh\necho \"Status: 200 OK\"\necho \"Content-Type: text/plain\"\necho\necho \"query=$QUERY_STRING\"\n",
    )
    .expect("write script");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    }

    let mut conf = base_conf(command("/bin/cat", &[]));
    conf.cgi_dir = Some(camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 dir"));
    conf.parent_env = vec![("PATH".to_owned(), "/usr/bin:/bin".to_owned())];
    let addr = start_server(conf).await;

    let response = http_get(addr, "/hello.sh?a=1").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.to_ascii_lowercase().contains("content-type: text/plain"));
    assert!(response.contains("query=a=1"));
}
