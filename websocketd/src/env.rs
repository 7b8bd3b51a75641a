use anyhow::Context as _;
use axum::http::{HeaderMap, Method, Uri, Version};

use crate::resolver::UrlResolution;
use crate::session::RemoteInfo;

pub(crate) const GATEWAY_INTERFACE: &str = "websocketd-CGI/0.1";

/// Everything the environment builder needs besides the request itself.
pub struct EnvConfig<'a> {
    pub server_software: &'a str,
    pub ssl: bool,
    /// Allow-listed variables copied from the daemon's own environment.
    pub parent_env: &'a [(String, String)],
    /// User-specified extras, appended last so they mask anything above.
    pub extra_env: &'a [(String, String)],
}

/// Build the ordered CGI-style environment for a child process.
///
/// Order matters: `SERVER_SOFTWARE`, the allow-listed parent variables, the
/// RFC 3875 standard set, the non-standard extras (`UNIQUE_ID`,
/// `REMOTE_PORT`, `REQUEST_URI`, `HTTPS`), the request headers as `HTTP_*`,
/// then the user extras. Duplicate keys are allowed; children that honor
/// last-wins see later entries mask earlier ones.
pub fn create_env(
    headers: &HeaderMap,
    uri: &Uri,
    method: &Method,
    version: Version,
    host: &str,
    remote: &RemoteInfo,
    resolution: &UrlResolution,
    session_id: &str,
    config: &EnvConfig<'_>,
) -> anyhow::Result<Vec<(String, String)>> {
    let (server_name, server_port) = tell_host_port(host, config.ssl)?;

    let mut env: Vec<(String, String)> = Vec::with_capacity(headers.len() + 21 + config.parent_env.len() + config.extra_env.len());

    // This variable could be rewritten from outside.
    push_env(&mut env, "SERVER_SOFTWARE", config.server_software);

    env.extend(config.parent_env.iter().cloned());

    // Standard CGI set, as defined in RFC 3875.
    push_env(&mut env, "REMOTE_ADDR", &remote.addr);
    push_env(&mut env, "REMOTE_HOST", &remote.host);
    push_env(&mut env, "SERVER_NAME", &server_name);
    push_env(&mut env, "SERVER_PORT", &server_port);
    push_env(&mut env, "SERVER_PROTOCOL", protocol_name(version));
    push_env(&mut env, "GATEWAY_INTERFACE", GATEWAY_INTERFACE);
    push_env(&mut env, "REQUEST_METHOD", method.as_str());
    push_env(&mut env, "SCRIPT_NAME", &resolution.script_path);
    push_env(&mut env, "PATH_INFO", &resolution.path_info);
    push_env(&mut env, "PATH_TRANSLATED", uri.path());
    push_env(&mut env, "QUERY_STRING", uri.query().unwrap_or(""));

    // Not supported, but explicitly cleared so nothing leaks from the
    // parent environment.
    push_env(&mut env, "AUTH_TYPE", "");
    push_env(&mut env, "CONTENT_LENGTH", "");
    push_env(&mut env, "CONTENT_TYPE", "");
    push_env(&mut env, "REMOTE_IDENT", "");
    push_env(&mut env, "REMOTE_USER", "");

    // Non-standard, but commonly used. UNIQUE_ID is based on Apache
    // mod_unique_id.
    push_env(&mut env, "UNIQUE_ID", session_id);
    push_env(&mut env, "REMOTE_PORT", &remote.port);
    push_env(&mut env, "REQUEST_URI", request_uri(uri));

    if config.ssl {
        push_env(&mut env, "HTTPS", "on");
    }

    for key in header_keys(headers) {
        let joined = headers
            .get_all(&key)
            .iter()
            .map(|value| sanitize(&String::from_utf8_lossy(value.as_bytes())))
            .collect::<Vec<_>>()
            .join(", ");
        let name = format!("HTTP_{}", key.as_str().to_ascii_uppercase().replace('-', "_"));
        env.push((name, joined));
    }

    env.extend(config.extra_env.iter().cloned());

    Ok(env)
}

/// Map carriage returns and line feeds to spaces and trim the result.
/// Adapted from the header cleaning net/http servers perform.
pub fn sanitize(value: &str) -> String {
    value.replace(['\r', '\n'], " ").trim().to_owned()
}

/// Split a request `Host` into name and port. A missing port defaults to
/// the listener scheme's port; anything else unparseable is an error.
pub fn tell_host_port(host: &str, ssl: bool) -> anyhow::Result<(String, String)> {
    let default_port = if ssl { "443" } else { "80" };

    if let Some(rest) = host.strip_prefix('[') {
        let (addr, tail) = rest.rsplit_once(']').context("missing ']' in host")?;
        return match tail {
            "" => Ok((addr.to_owned(), default_port.to_owned())),
            tail => {
                let port = tail.strip_prefix(':').context("unexpected characters after ']'")?;
                Ok((addr.to_owned(), port.to_owned()))
            }
        };
    }

    match host.matches(':').count() {
        0 => Ok((host.to_owned(), default_port.to_owned())),
        1 => {
            // Checked just above: exactly one colon.
            let (name, port) = host.split_once(':').context("split host")?;
            Ok((name.to_owned(), port.to_owned()))
        }
        _ => anyhow::bail!("address {host}: too many colons in address"),
    }
}

fn push_env(env: &mut Vec<(String, String)>, key: &str, value: &str) {
    env.push((key.to_ascii_uppercase(), sanitize(value)));
}

fn protocol_name(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

fn request_uri(uri: &Uri) -> &str {
    uri.path_and_query().map_or_else(|| uri.path(), |pq| pq.as_str())
}

/// Header names in iteration order, each once.
fn header_keys(headers: &HeaderMap) -> Vec<axum::http::HeaderName> {
    headers.keys().cloned().collect()
}
