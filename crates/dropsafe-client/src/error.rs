//! Client-side error taxonomy.
//!
//! These stay inside the fetch layer; the export pipeline never sees them.
//! Transport conditions and HTTP statuses map totally onto the variants, with
//! `Api` as the catch-all for anything the server reports that has no more
//! specific meaning.

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("{0}")]
    WrongUuid(String),

    #[error("the request timed out")]
    RequestTimeout,

    #[error("cannot connect to the server")]
    ServerConnection,

    #[error("reply rejected: {0}")]
    Reply(String),

    #[error("api error: {0}")]
    Api(String),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Collapse a transport failure into the taxonomy.
pub(crate) fn transport_error(err: reqwest::Error) -> ClientError {
    if err.is_timeout() {
        ClientError::RequestTimeout
    } else if err.is_connect() || err.is_redirect() {
        ClientError::ServerConnection
    } else {
        ClientError::Api(err.to_string())
    }
}

/// Map a non-success status onto an error; `None` means the status is fine.
///
/// 404 carries the caller's "missing X" context since it names which record
/// the server does not know about.
pub(crate) fn classify_status(
    status: StatusCode,
    missing: &str,
    detail: &str,
) -> Option<ClientError> {
    if status.is_success() {
        return None;
    }
    Some(match status {
        StatusCode::FORBIDDEN => ClientError::Auth(nonempty(detail, "forbidden")),
        StatusCode::NOT_FOUND => ClientError::WrongUuid(missing.to_string()),
        StatusCode::BAD_REQUEST => ClientError::Reply(nonempty(detail, "bad request")),
        StatusCode::GATEWAY_TIMEOUT => ClientError::RequestTimeout,
        StatusCode::BAD_GATEWAY => ClientError::ServerConnection,
        other => ClientError::Api(format!(
            "unexpected status {other}: {}",
            nonempty(detail, "no detail")
        )),
    })
}

fn nonempty(detail: &str, fallback: &str) -> String {
    let detail = detail.trim();
    if detail.is_empty() {
        fallback.to_string()
    } else {
        detail.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_statuses_are_not_errors() {
        assert!(classify_status(StatusCode::OK, "missing", "").is_none());
        assert!(classify_status(StatusCode::NO_CONTENT, "missing", "").is_none());
    }

    #[test]
    fn statuses_map_onto_the_taxonomy() {
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, "missing", "").unwrap(),
            ClientError::Auth(_)
        ));
        match classify_status(StatusCode::NOT_FOUND, "missing submission abc", "").unwrap() {
            ClientError::WrongUuid(msg) => assert_eq!(msg, "missing submission abc"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "missing", "too long").unwrap(),
            ClientError::Reply(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::GATEWAY_TIMEOUT, "missing", "").unwrap(),
            ClientError::RequestTimeout
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, "missing", "").unwrap(),
            ClientError::ServerConnection
        ));
        assert!(matches!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR, "missing", "boom").unwrap(),
            ClientError::Api(_)
        ));
    }
}
