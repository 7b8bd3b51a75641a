use std::time::Duration;

use anyhow::Context as _;
use axum::http::{HeaderName, HeaderValue};
use camino::Utf8PathBuf;
use clap::Parser;

use crate::log::LogLevel;
use crate::origin::OriginPolicy;
use crate::resolver::ScriptSource;

/// Command-line surface of the daemon.
#[derive(Debug, Parser)]
#[command(
    name = "websocketd",
    version,
    about = "Turn any program that uses STDIN/STDOUT into a WebSocket server",
    after_help = "Full documentation at http://websocketd.com/"
)]
pub struct Cli {
    /// HTTP port to listen on. Defaults to 80, or 443 with --ssl.
    #[arg(long)]
    pub port: Option<u16>,

    /// Interface to bind to, repeatable. Use square brackets for IPv6
    /// addresses. Default: all interfaces.
    #[arg(long = "address", value_name = "ADDRESS")]
    pub addresses: Vec<String>,

    /// Base URL path the server answers on.
    #[arg(long, default_value = "/")]
    pub basepath: String,

    /// Listen for HTTPS connections instead of HTTP.
    #[arg(long)]
    pub ssl: bool,

    /// TLS certificate file (PEM). Must be used together with --ssl and
    /// --sslkey.
    #[arg(long, value_name = "FILE")]
    pub sslcert: Option<Utf8PathBuf>,

    /// TLS private key file (PEM). Must be used together with --ssl and
    /// --sslcert.
    #[arg(long, value_name = "FILE")]
    pub sslkey: Option<Utf8PathBuf>,

    /// Perform DNS reverse lookups on remote clients.
    #[arg(
        long,
        value_name = "BOOL",
        num_args = 0..=1,
        default_value_t = true,
        default_missing_value = "true",
        action = clap::ArgAction::Set
    )]
    pub reverselookup: bool,

    /// Serve all scripts in this local directory as WebSocket endpoints.
    /// Mutually exclusive with COMMAND.
    #[arg(long, value_name = "DIR")]
    pub dir: Option<Utf8PathBuf>,

    /// Serve static files in this directory over HTTP.
    #[arg(long, value_name = "DIR")]
    pub staticdir: Option<Utf8PathBuf>,

    /// Serve CGI scripts in this directory over HTTP.
    #[arg(long, value_name = "DIR")]
    pub cgidir: Option<Utf8PathBuf>,

    /// Enable the interactive development console. Cannot be used with
    /// --staticdir or --cgidir.
    #[arg(long)]
    pub devconsole: bool,

    /// Maximum number of concurrent child processes; 0 means unlimited.
    #[arg(long, default_value_t = 0)]
    pub maxforks: usize,

    /// Ferry frames as opaque binary data instead of newline-delimited
    /// text.
    #[arg(long)]
    pub binary: bool,

    /// Grace time in milliseconds before child termination escalates.
    #[arg(long, default_value_t = 0)]
    pub closems: u64,

    /// Reject upgrades (HTTP 403) when the Origin header does not match
    /// the requested Host.
    #[arg(long)]
    pub sameorigin: bool,

    /// Comma-separated origin allow-list: host[:port], optionally with a
    /// scheme. Without a port, any port matches.
    #[arg(long, value_name = "host[:port][,host[:port]...]")]
    pub origin: Option<String>,

    /// Comma-separated list of environment variables the daemon forwards
    /// to executed scripts.
    #[arg(long, value_name = "VAR[,VAR...]")]
    pub passenv: Option<String>,

    /// Additional environment entry for the child, repeatable.
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Custom HTTP header added to every response, repeatable.
    #[arg(long = "header", value_name = "NAME: VALUE")]
    pub header: Vec<String>,

    /// Custom HTTP header for WebSocket upgrade responses only,
    /// repeatable.
    #[arg(long = "header-ws", value_name = "NAME: VALUE")]
    pub header_ws: Vec<String>,

    /// Custom HTTP header for plain HTTP responses only, repeatable.
    #[arg(long = "header-http", value_name = "NAME: VALUE")]
    pub header_http: Vec<String>,

    /// Log level, from most to least verbose: debug, trace, access, info,
    /// error, fatal.
    #[arg(long, default_value = "access", value_name = "LEVEL")]
    pub loglevel: String,

    /// Answer plain HTTP requests on this extra port with a redirect to
    /// the HTTPS listener.
    #[arg(long, value_name = "PORT")]
    pub redirport: Option<u16>,

    /// Print the license and exit.
    #[arg(long)]
    pub license: bool,

    /// Program to execute per connection, with its arguments.
    #[arg(value_name = "COMMAND [ARGS...]", trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TlsConf {
    pub cert_file: Utf8PathBuf,
    pub key_file: Utf8PathBuf,
}

/// Validated runtime configuration, shared as `Arc<Conf>`.
#[derive(Debug)]
pub struct Conf {
    /// `host:port` strings, one listener each.
    pub addresses: Vec<String>,
    /// Port of the main listeners; the redirect listener points here.
    pub port: u16,
    pub base_path: String,
    pub tls: Option<TlsConf>,
    pub reverse_lookup: bool,
    pub script_source: ScriptSource,
    pub static_dir: Option<Utf8PathBuf>,
    pub cgi_dir: Option<Utf8PathBuf>,
    pub dev_console: bool,
    pub max_forks: usize,
    pub binary: bool,
    pub close_grace: Duration,
    pub origin_policy: OriginPolicy,
    pub parent_env: Vec<(String, String)>,
    pub extra_env: Vec<(String, String)>,
    pub server_software: String,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub headers_ws: Vec<(HeaderName, HeaderValue)>,
    pub headers_http: Vec<(HeaderName, HeaderValue)>,
    pub log_level: LogLevel,
    pub redir_port: Option<u16>,
}

impl Conf {
    pub fn from_cli(cli: Cli) -> anyhow::Result<Self> {
        let script_source = match (&cli.dir, cli.command.is_empty()) {
            (Some(_), false) => anyhow::bail!("COMMAND and --dir are mutually exclusive"),
            (None, true) => anyhow::bail!("please specify COMMAND or provide --dir option"),
            (Some(dir), true) => {
                anyhow::ensure!(dir.is_dir(), "script directory {dir} does not exist");
                ScriptSource::Dir { root: dir.clone() }
            }
            (None, false) => ScriptSource::Command {
                name: cli.command[0].clone(),
                args: cli.command[1..].to_vec(),
            },
        };

        let tls = match (cli.ssl, cli.sslcert, cli.sslkey) {
            (true, Some(cert_file), Some(key_file)) => Some(TlsConf { cert_file, key_file }),
            (false, None, None) => None,
            _ => anyhow::bail!("--ssl, --sslcert and --sslkey options must be used together"),
        };

        if cli.devconsole && (cli.staticdir.is_some() || cli.cgidir.is_some()) {
            anyhow::bail!("--devconsole cannot be used together with --staticdir or --cgidir");
        }

        if cli.redirport.is_some() && tls.is_none() {
            anyhow::bail!("--redirport only makes sense together with --ssl");
        }

        anyhow::ensure!(cli.basepath.starts_with('/'), "--basepath must start with '/'");

        let port = cli.port.unwrap_or(if tls.is_some() { 443 } else { 80 });
        let addresses = if cli.addresses.is_empty() {
            vec![join_host_port("", port)]
        } else {
            cli.addresses.iter().map(|address| join_host_port(address, port)).collect()
        };

        let origin_policy = OriginPolicy::from_options(cli.sameorigin, cli.origin.as_deref())?;

        let extra_env = cli
            .env
            .iter()
            .map(|entry| {
                entry
                    .split_once('=')
                    .map(|(key, value)| (key.to_owned(), value.to_owned()))
                    .with_context(|| format!("--env entry '{entry}' is not in KEY=VALUE form"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let log_level: LogLevel = cli.loglevel.parse()?;

        Ok(Conf {
            addresses,
            port,
            base_path: cli.basepath,
            tls,
            reverse_lookup: cli.reverselookup,
            script_source,
            static_dir: cli.staticdir,
            cgi_dir: cli.cgidir,
            dev_console: cli.devconsole,
            max_forks: cli.maxforks,
            binary: cli.binary,
            close_grace: Duration::from_millis(cli.closems),
            origin_policy,
            parent_env: resolve_parent_env(cli.passenv.as_deref()),
            extra_env,
            server_software: format!("websocketd/{}", env!("CARGO_PKG_VERSION")),
            headers: parse_headers(&cli.header).context("invalid --header")?,
            headers_ws: parse_headers(&cli.header_ws).context("invalid --header-ws")?,
            headers_http: parse_headers(&cli.header_http).context("invalid --header-http")?,
            log_level,
            redir_port: cli.redirport,
        })
    }

    pub fn ssl(&self) -> bool {
        self.tls.is_some()
    }
}

/// Default allow-listed parent variables, per OS.
fn default_pass_env() -> &'static [&'static str] {
    if cfg!(windows) {
        &["SystemRoot", "COMSPEC", "PATH", "PATHEXT", "WINDIR"]
    } else {
        &["PATH"]
    }
}

/// Resolve the allow-listed names against the daemon's own environment.
/// Unset variables are skipped.
fn resolve_parent_env(passenv: Option<&str>) -> Vec<(String, String)> {
    let names: Vec<String> = match passenv {
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(ToOwned::to_owned)
            .collect(),
        None => default_pass_env().iter().map(|name| (*name).to_owned()).collect(),
    };

    names
        .into_iter()
        .filter_map(|name| std::env::var(&name).ok().map(|value| (name, value)))
        .collect()
}

fn parse_headers(entries: &[String]) -> anyhow::Result<Vec<(HeaderName, HeaderValue)>> {
    entries
        .iter()
        .map(|entry| {
            let (name, value) = entry
                .split_once(':')
                .with_context(|| format!("header '{entry}' is not in 'Name: value' form"))?;
            let name = HeaderName::try_from(name.trim()).with_context(|| format!("invalid header name in '{entry}'"))?;
            let value = HeaderValue::try_from(value.trim()).with_context(|| format!("invalid header value in '{entry}'"))?;
            Ok((name, value))
        })
        .collect()
}

fn join_host_port(address: &str, port: u16) -> String {
    if address.is_empty() {
        return format!("0.0.0.0:{port}");
    }
    if address.contains(':') && !address.starts_with('[') {
        return format!("[{address}]:{port}");
    }
    format!("{address}:{port}")
}
