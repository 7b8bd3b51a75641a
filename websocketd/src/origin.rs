use anyhow::Context as _;
use thiserror::Error;
use url::Url;

use crate::env::tell_host_port;

#[derive(Debug, Error)]
pub enum OriginError {
    #[error("origin {origin} is not allowed")]
    NotAllowed { origin: String },
    #[error("origin {origin} could not be parsed")]
    Invalid { origin: String },
    #[error("request host {host} could not be parsed")]
    BadHost { host: String },
}

/// One entry of the `--origin` allow-list: `[scheme://]host[:port]`.
///
/// An entry port of 80 matches any origin port. This mirrors the historical
/// behavior of entries written without an explicit port and is relied upon
/// by deployed clients; keep it when touching this code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedOrigin {
    scheme: Option<String>,
    host: String,
    port: u16,
}

impl AllowedOrigin {
    pub fn parse(entry: &str) -> anyhow::Result<Self> {
        anyhow::ensure!(!entry.is_empty(), "empty origin entry");

        if entry.contains("://") {
            let url = Url::parse(entry).with_context(|| format!("invalid origin entry {entry}"))?;
            let host = url
                .host_str()
                .with_context(|| format!("origin entry {entry} has no host"))?
                .to_owned();
            // `Url::port` is `None` when the port is the scheme default,
            // which collapses `http://h:80` and `http://h` into the same
            // any-port entry.
            let port = url.port_or_known_default().unwrap_or(80);
            Ok(Self {
                scheme: Some(url.scheme().to_owned()),
                host,
                port,
            })
        } else {
            match entry.split_once(':') {
                Some((host, port)) => {
                    anyhow::ensure!(!host.is_empty(), "origin entry {entry} has no host");
                    let port: u16 = port.parse().with_context(|| format!("invalid port in origin entry {entry}"))?;
                    Ok(Self {
                        scheme: None,
                        host: host.to_owned(),
                        port,
                    })
                }
                None => Ok(Self {
                    scheme: None,
                    host: entry.to_owned(),
                    port: 80,
                }),
            }
        }
    }

    fn matches(&self, scheme: &str, host: &str, port: u16) -> bool {
        if self.host != host {
            return false;
        }
        if let Some(expected) = &self.scheme {
            if expected != scheme {
                return false;
            }
        }
        // Port 80 entries accept any origin port.
        self.port == 80 || self.port == port
    }
}

/// `Origin` admission policy for protocol upgrades.
#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    /// Require the origin host/port to equal the request host/port.
    pub same_origin: bool,
    /// `None` = no allow-list configured (anything goes); `Some(vec![])` =
    /// nothing is allowed.
    pub allow_list: Option<Vec<AllowedOrigin>>,
}

impl OriginPolicy {
    pub fn from_options(same_origin: bool, allow_list: Option<&str>) -> anyhow::Result<Self> {
        let allow_list = allow_list
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|entry| !entry.is_empty())
                    .map(AllowedOrigin::parse)
                    .collect::<anyhow::Result<Vec<_>>>()
            })
            .transpose()
            .context("invalid --origin list")?;

        Ok(Self {
            same_origin,
            allow_list,
        })
    }

    /// Decide whether an upgrade with the given `Origin` header may proceed.
    ///
    /// An absent or empty origin is accepted, as is `null` when no
    /// allow-list is configured. Ports default per scheme on the origin
    /// side, and per listener TLS mode on the request side.
    pub fn check(&self, origin: Option<&str>, request_host: &str, ssl: bool) -> Result<(), OriginError> {
        let Some(origin) = origin.filter(|value| !value.is_empty()) else {
            return Ok(());
        };

        if origin == "null" && self.allow_list.is_none() {
            return Ok(());
        }

        let url = Url::parse(origin).map_err(|_| OriginError::Invalid {
            origin: origin.to_owned(),
        })?;
        let origin_host = url.host_str().unwrap_or("");
        let origin_port = url.port_or_known_default().unwrap_or(80);

        if self.same_origin {
            let (host, port) = tell_host_port(request_host, ssl).map_err(|_| OriginError::BadHost {
                host: request_host.to_owned(),
            })?;
            let port: u16 = port.parse().map_err(|_| OriginError::BadHost {
                host: request_host.to_owned(),
            })?;

            if origin_host != host || origin_port != port {
                return Err(OriginError::NotAllowed {
                    origin: origin.to_owned(),
                });
            }
        }

        if let Some(allow_list) = &self.allow_list {
            let allowed = allow_list
                .iter()
                .any(|entry| entry.matches(url.scheme(), origin_host, origin_port));

            if !allowed {
                return Err(OriginError::NotAllowed {
                    origin: origin.to_owned(),
                });
            }
        }

        Ok(())
    }
}
