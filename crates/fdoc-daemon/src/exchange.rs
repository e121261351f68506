//! Transport-neutral request/response envelope.
//!
//! The protocol runs over per-step HTTP round-trips, but the listeners
//! never see HTTP: an embedding server maps the method, `Message-Type`
//! header, `Authorization` header, and body onto an [`ExchangeRequest`]
//! and writes the [`ExchangeResponse`] back out. Statuses carry the same
//! meaning as their HTTP codes.

use bytes::Bytes;

use fdoc_core::MsgType;

/// Scheme prefix of the session credential header.
const BEARER_PREFIX: &str = "Bearer ";

/// Response status, mapped one-to-one onto HTTP codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Protocol success; the body carries the next message.
    Ok,
    /// Malformed body or failed validation.
    BadRequest,
    /// Missing, invalid, or expired bearer token, or wrong previous state.
    Unauthorized,
    /// Referenced device has no voucher or resource on file.
    NotFound,
    /// Persistence or unexpected library failure.
    InternalError,
}

impl Status {
    /// The HTTP code this status maps to.
    #[must_use]
    pub const fn http_code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::NotFound => 404,
            Self::InternalError => 500,
        }
    }
}

/// One inbound protocol step.
#[derive(Debug, Clone)]
pub struct ExchangeRequest {
    /// Declared message type (the `Message-Type` header).
    pub msg_type: MsgType,
    /// Raw `Authorization` header value, when present.
    pub authorization: Option<String>,
    /// Encoded message body.
    pub body: Bytes,
}

impl ExchangeRequest {
    /// First message of a sub-protocol: no credential yet.
    #[must_use]
    pub fn opening(msg_type: MsgType, body: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            authorization: None,
            body: body.into(),
        }
    }

    /// Subsequent message carrying the issued bearer token.
    #[must_use]
    pub fn with_bearer(msg_type: MsgType, token: &str, body: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            authorization: Some(format!("{BEARER_PREFIX}{token}")),
            body: body.into(),
        }
    }

    /// Extracts the bearer token from the authorization header, if the
    /// header is present and carries the bearer scheme.
    #[must_use]
    pub fn bearer(&self) -> Option<&str> {
        self.authorization
            .as_deref()
            .and_then(|header| header.strip_prefix(BEARER_PREFIX))
            .filter(|token| !token.is_empty())
    }
}

/// One outbound protocol step.
#[derive(Debug, Clone)]
pub struct ExchangeResponse {
    /// Outcome status.
    pub status: Status,
    /// Message type of the body (the `Message-Type` header).
    pub msg_type: MsgType,
    /// `Authorization` echo: the freshly issued token on a sub-protocol's
    /// first response, the presented one afterwards.
    pub authorization: Option<String>,
    /// Encoded message body; an encoded error object on failure.
    pub body: Bytes,
}

impl ExchangeResponse {
    /// Successful step response.
    #[must_use]
    pub fn ok(msg_type: MsgType, authorization: Option<String>, body: impl Into<Bytes>) -> Self {
        Self {
            status: Status::Ok,
            msg_type,
            authorization,
            body: body.into(),
        }
    }

    /// Formats `token` as a bearer authorization header value.
    #[must_use]
    pub fn bearer_header(token: &str) -> String {
        format!("{BEARER_PREFIX}{token}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_extraction() {
        let req = ExchangeRequest::with_bearer(MsgType::To1ProveToRv, "abc-123", Bytes::new());
        assert_eq!(req.bearer(), Some("abc-123"));

        let opening = ExchangeRequest::opening(MsgType::To1HelloRv, Bytes::new());
        assert_eq!(opening.bearer(), None);

        let wrong_scheme = ExchangeRequest {
            msg_type: MsgType::To1ProveToRv,
            authorization: Some("Basic abc".to_string()),
            body: Bytes::new(),
        };
        assert_eq!(wrong_scheme.bearer(), None);

        let empty = ExchangeRequest {
            msg_type: MsgType::To1ProveToRv,
            authorization: Some("Bearer ".to_string()),
            body: Bytes::new(),
        };
        assert_eq!(empty.bearer(), None);
    }

    #[test]
    fn status_codes() {
        assert_eq!(Status::Ok.http_code(), 200);
        assert_eq!(Status::BadRequest.http_code(), 400);
        assert_eq!(Status::Unauthorized.http_code(), 401);
        assert_eq!(Status::NotFound.http_code(), 404);
        assert_eq!(Status::InternalError.http_code(), 500);
    }
}
