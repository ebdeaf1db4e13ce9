use std::fmt;

use anyhow::Error;
use http::{HeaderValue, Response, StatusCode, header};
use serde::Serialize;
use serde_json::Value;

use crate::service::{Outgoing, full};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequestError,
    AuthenticationError,
    AccessForbidden,
    RateLimitExceeded,
    ApiError,
    ServerError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequestError => "invalid_request_error",
            Self::AuthenticationError => "authentication_error",
            Self::AccessForbidden => "access_forbidden",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::ApiError => "api_error",
            Self::ServerError => "server_error",
        }
    }

    /// Anything outside the known set is reported as `api_error`.
    pub fn from_upstream(kind: &str) -> Self {
        match kind {
            "invalid_request_error" => Self::InvalidRequestError,
            "authentication_error" => Self::AuthenticationError,
            "access_forbidden" => Self::AccessForbidden,
            "rate_limit_exceeded" => Self::RateLimitExceeded,
            "server_error" => Self::ServerError,
            _ => Self::ApiError,
        }
    }
}

/// Client-facing failure, rendered as `{"error": {...}}`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: ErrorKind,
    pub message: String,
    pub code: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    message: &'a str,
    #[serde(rename = "type")]
    kind: ErrorKind,
    code: String,
    param: Option<()>,
    status: u16,
}

impl ApiError {
    pub fn new(status: StatusCode, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
            code: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            ErrorKind::InvalidRequestError,
            message,
        )
    }

    pub fn internal(err: impl fmt::Display) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::ServerError,
            err.to_string(),
        )
    }

    /// Error for a failed attempt to reach the upstream at all.
    pub fn transport(err: &Error) -> Self {
        if err.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            Self::new(
                StatusCode::GATEWAY_TIMEOUT,
                ErrorKind::ServerError,
                "Upstream request timed out",
            )
        } else {
            Self::new(
                StatusCode::BAD_GATEWAY,
                ErrorKind::ServerError,
                format!("Cannot reach upstream: {err}"),
            )
        }
    }

    /// Re-expresses an upstream error response, keeping its status.
    ///
    /// Understands both `{"error": {"message", "type", "code"}}` and `{"error": "message"}`
    /// bodies; anything else falls back to a generic message.
    pub fn from_upstream(status: StatusCode, body: &[u8]) -> Self {
        let mut this = Self::new(
            status,
            ErrorKind::ApiError,
            "Error while calling upstream API",
        );
        let Ok(value) = serde_json::from_slice::<Value>(body) else {
            return this;
        };
        match value.get("error") {
            Some(Value::Object(error)) => {
                if let Some(message) = error.get("message").and_then(Value::as_str) {
                    this.message = message.to_owned();
                }
                if let Some(kind) = error.get("type").and_then(Value::as_str) {
                    this.kind = ErrorKind::from_upstream(kind);
                }
                this.code = error.get("code").and_then(code_string);
            }
            Some(Value::String(message)) => {
                this.message = message.clone();
                this.code = value.get("code").and_then(code_string);
            }
            _ => (),
        }
        this
    }

    pub fn to_json(&self) -> Vec<u8> {
        let body = ErrorBody {
            error: ErrorDetail {
                message: &self.message,
                kind: self.kind,
                code: self
                    .code
                    .clone()
                    .unwrap_or_else(|| self.status.as_u16().to_string()),
                param: None,
                status: self.status.as_u16(),
            },
        };
        serde_json::to_vec(&body).unwrap_or_default()
    }

    pub fn into_response(self) -> Result<Response<Outgoing>, Error> {
        Ok(Response::builder()
            .status(self.status)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            )
            .body(full(self.to_json()))?)
    }
}

fn code_string(code: &Value) -> Option<String> {
    match code {
        Value::String(code) => Some(code.clone()),
        Value::Number(code) => Some(code.to_string()),
        _ => None,
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}): {}",
            self.kind.as_str(),
            self.status.as_u16(),
            self.message
        )
    }
}

impl std::error::Error for ApiError {}

#[test]
fn error_shape() {
    let err = ApiError::invalid_request("bad");
    let value: Value = serde_json::from_slice(&err.to_json()).unwrap();
    assert_eq!(
        value,
        serde_json::json!({
            "error": {
                "message": "bad",
                "type": "invalid_request_error",
                "code": "400",
                "param": null,
                "status": 400
            }
        })
    );
}

#[test]
fn upstream_object_error() {
    let err = ApiError::from_upstream(
        StatusCode::TOO_MANY_REQUESTS,
        br#"{"error":{"message":"slow down","type":"rate_limit_exceeded","code":"rl"}}"#,
    );
    assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(err.kind, ErrorKind::RateLimitExceeded);
    assert_eq!(err.message, "slow down");
    assert_eq!(err.code.as_deref(), Some("rl"));
}

#[test]
fn upstream_string_error() {
    let err = ApiError::from_upstream(
        StatusCode::UNAUTHORIZED,
        br#"{"code":"Client specified an invalid argument","error":"Incorrect API key"}"#,
    );
    assert_eq!(err.kind, ErrorKind::ApiError);
    assert_eq!(err.message, "Incorrect API key");
    assert_eq!(
        err.code.as_deref(),
        Some("Client specified an invalid argument")
    );
}

#[test]
fn upstream_opaque_error() {
    let err = ApiError::from_upstream(StatusCode::BAD_GATEWAY, b"<html>oops</html>");
    assert_eq!(err.kind, ErrorKind::ApiError);
    assert_eq!(err.message, "Error while calling upstream API");
    let value: Value = serde_json::from_slice(&err.to_json()).unwrap();
    assert_eq!(value["error"]["code"], "502");
    assert_eq!(value["error"]["status"], 502);
}
