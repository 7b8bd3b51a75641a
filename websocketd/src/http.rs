use std::error::Error as StdError;
use std::io;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::limiter::ForkNotAllowed;
use crate::origin::OriginError;
use crate::resolver::ResolveError;

/// Everything that can stop a request before (or instead of) a session.
///
/// Each variant wraps the failure it stems from; [`RequestError::status`]
/// is the HTTP answer the client sees for it. The variants mirror the
/// admission pipeline: resolution, fork admission, origin check,
/// handshake, environment, launch — plus the CGI surface.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("no script for the requested URL")]
    ScriptNotFound(#[from] ResolveError),

    #[error(transparent)]
    ForkRefused(#[from] ForkNotAllowed),

    #[error(transparent)]
    OriginRejected(#[from] OriginError),

    #[error("request is outside the configured base path")]
    OutsideBasePath,

    #[error("malformed WebSocket handshake")]
    BadHandshake(#[source] Box<dyn StdError + Send + Sync>),

    #[error("could not launch {command}")]
    LaunchFailed {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("could not build the child environment")]
    BadEnvironment(#[source] anyhow::Error),

    /// The script ran but its output is not a CGI response.
    #[error("CGI script produced a malformed response: {detail}")]
    BadCgiOutput { detail: &'static str },

    #[error("{context}")]
    Internal {
        context: &'static str,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl RequestError {
    /// Wrap a transport or plumbing failure that only warrants a 500.
    pub fn internal<E>(context: &'static str) -> impl FnOnce(E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        move |source| Self::Internal {
            context,
            source: source.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RequestError::ScriptNotFound(_) | RequestError::OutsideBasePath => StatusCode::NOT_FOUND,
            RequestError::ForkRefused(_) => StatusCode::TOO_MANY_REQUESTS,
            RequestError::OriginRejected(_) => StatusCode::FORBIDDEN,
            RequestError::BadHandshake(_) => StatusCode::BAD_REQUEST,
            RequestError::BadCgiOutput { .. } => StatusCode::BAD_GATEWAY,
            RequestError::LaunchFailed { .. } | RequestError::BadEnvironment(_) | RequestError::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        let status = self.status();

        let mut description = self.to_string();
        let mut cause = StdError::source(&self);
        while let Some(source) = cause {
            description.push_str(", because ");
            description.push_str(&source.to_string());
            cause = source.source();
        }
        error!(%status, error = %description);

        status.into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_admission_pipeline() {
        assert_eq!(
            RequestError::from(ResolveError::ScriptNotFound).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(RequestError::from(ForkNotAllowed).status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            RequestError::from(OriginError::NotAllowed {
                origin: "http://evil.com".to_owned()
            })
            .status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(RequestError::OutsideBasePath.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            RequestError::BadCgiOutput { detail: "no colon" }.status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            RequestError::LaunchFailed {
                command: "nope".to_owned(),
                source: io::Error::other("exec failed"),
            }
            .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn launch_failures_name_the_command() {
        let error = RequestError::LaunchFailed {
            command: "/srv/scripts/run.sh".to_owned(),
            source: io::Error::other("permission denied"),
        };
        assert!(error.to_string().contains("/srv/scripts/run.sh"));
    }
}
