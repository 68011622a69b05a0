//! Response envelopes
//!
//! Every structured reply has the shape `{code, msg, data?}`. `code` is a
//! business code from [`code`]; the HTTP status is derived from it by
//! [`status_for`].

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::error;

use crate::error::RegistryError;

/// Business codes
pub mod code {
    pub const OK: i32 = 200;
    pub const SYSTEM_ERR: i32 = 1000;
    pub const AUTH_ERR: i32 = 1001;
    pub const ARG_ERR: i32 = 1002;
    pub const API_ERR: i32 = 1003;
    pub const NORMAL_ERR: i32 = 1004;
}

/// Default message for a business code
pub fn code_msg(code: i32) -> &'static str {
    match code {
        code::OK => "success",
        code::SYSTEM_ERR => "system error",
        code::AUTH_ERR => "authentication failed",
        code::ARG_ERR => "invalid argument",
        code::API_ERR => "interface error",
        code::NORMAL_ERR => "business error",
        _ => "unknown error",
    }
}

/// HTTP status used for a business code
pub fn status_for(code: i32) -> StatusCode {
    match code {
        code::OK | code::NORMAL_ERR => StatusCode::OK,
        code::AUTH_ERR => StatusCode::UNAUTHORIZED,
        code::ARG_ERR => StatusCode::BAD_REQUEST,
        code::API_ERR => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Response body
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename = "result")]
pub struct Envelope {
    pub code: i32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    pub fn new(code: i32, msg: impl Into<String>, data: Option<Value>) -> Self {
        let msg = msg.into();
        let msg = if msg.is_empty() {
            code_msg(code).to_string()
        } else {
            msg
        };
        Self { code, msg, data }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    AsciiJson,
    Xml,
}

fn render(format: Format, envelope: Envelope) -> Response {
    let status = status_for(envelope.code);
    let (body, content_type) = match format {
        Format::Json => (serde_json::to_string(&envelope).map_err(|e| e.to_string()), "application/json"),
        Format::AsciiJson => (
            serde_json::to_string(&envelope)
                .map(|s| escape_non_ascii(&s))
                .map_err(|e| e.to_string()),
            "application/json",
        ),
        Format::Xml => (
            quick_xml::se::to_string(&envelope).map_err(|e| e.to_string()),
            "application/xml; charset=utf-8",
        ),
    };

    match body {
        Ok(body) => (status, [(header::CONTENT_TYPE, HeaderValue::from_static(content_type))], body).into_response(),
        Err(e) => {
            error!("Failed to encode response: {}", e);
            let fallback = format!(r#"{{"code":{},"msg":"{}"}}"#, code::SYSTEM_ERR, code_msg(code::SYSTEM_ERR));
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
                fallback,
            )
                .into_response()
        }
    }
}

/// Replace every non-ASCII character with its `\uXXXX` escape
fn escape_non_ascii(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    let mut units = [0u16; 2];
    for c in json.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

/// Success data; `null` (including `()` and `None`) becomes an empty object
fn ok_data<T: Serialize>(data: T) -> Result<Value, Response> {
    match serde_json::to_value(data) {
        Ok(Value::Null) => Ok(Value::Object(Default::default())),
        Ok(value) => Ok(value),
        Err(e) => {
            error!("Failed to serialize response data: {}", e);
            Err(error_json(code::SYSTEM_ERR, ""))
        }
    }
}

fn ok_with<T: Serialize>(format: Format, data: T) -> Response {
    match ok_data(data) {
        Ok(data) => render(format, Envelope::new(code::OK, code_msg(code::OK), Some(data))),
        Err(response) => response,
    }
}

/// Plain text `200 OK`
pub fn ok_text(data: impl Into<String>) -> Response {
    (StatusCode::OK, data.into()).into_response()
}

pub fn ok_json<T: Serialize>(data: T) -> Response {
    ok_with(Format::Json, data)
}

/// An empty `msg` is replaced by the code's default message
pub fn error_json(code: i32, msg: &str) -> Response {
    render(Format::Json, Envelope::new(code, msg, None))
}

pub fn ok_ascii_json<T: Serialize>(data: T) -> Response {
    ok_with(Format::AsciiJson, data)
}

pub fn error_ascii_json(code: i32, msg: &str) -> Response {
    render(Format::AsciiJson, Envelope::new(code, msg, None))
}

pub fn ok_xml<T: Serialize>(data: T) -> Response {
    ok_with(Format::Xml, data)
}

pub fn error_xml(code: i32, msg: &str) -> Response {
    render(Format::Xml, Envelope::new(code, msg, None))
}

/// `302 Found` to `location`
pub fn redirect(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (StatusCode::FOUND, [(header::LOCATION, value)]).into_response(),
        Err(_) => error_json(code::ARG_ERR, "invalid redirect location"),
    }
}

/// Error carried out of a handler as a JSON envelope
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{msg}")]
pub struct ApiError {
    pub code: i32,
    pub msg: String,
}

impl ApiError {
    pub fn new(code: i32, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        let msg = if msg.is_empty() {
            code_msg(code).to_string()
        } else {
            msg
        };
        Self { code, msg }
    }

    pub fn system() -> Self {
        Self::new(code::SYSTEM_ERR, "")
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::new(code::AUTH_ERR, msg)
    }

    pub fn argument(msg: impl Into<String>) -> Self {
        Self::new(code::ARG_ERR, msg)
    }

    pub fn business(msg: impl Into<String>) -> Self {
        Self::new(code::NORMAL_ERR, msg)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error_json(self.code, &self.msg)
    }
}

// Backend details stay in the log; callers only see the generic system error.
impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        error!("Backend unavailable: {}", err);
        Self::system()
    }
}
