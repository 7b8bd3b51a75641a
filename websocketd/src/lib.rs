#[macro_use]
extern crate tracing;

mod cgi;
mod console;
mod dispatch;
mod http;

pub mod config;
pub mod endpoint;
pub mod env;
pub mod launcher;
pub mod limiter;
pub mod listener;
pub mod log;
pub mod origin;
pub mod process_endpoint;
pub mod resolver;
pub mod session;
pub mod socket_endpoint;
pub mod tls;

use std::sync::Arc;

use crate::config::Conf;
use crate::limiter::ForkLimiter;

pub use crate::dispatch::make_http_service;

/// Shared state every request handler sees.
#[derive(Clone)]
pub struct GatewayState {
    pub conf: Arc<Conf>,
    pub limiter: Arc<ForkLimiter>,
}
