use serde_json::{Map, Value, json};

use crate::{ApiError, Endpoint};

/// A response body as received: decoded JSON, raw text, or nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// Zero-length body.
    Empty,
    /// Body that parsed as JSON.
    Json(Value),
    /// Body that did not parse as JSON.
    Text(String),
}

impl ResponseBody {
    /// Parses raw response bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            return ResponseBody::Empty;
        }
        match serde_json::from_slice(bytes) {
            Ok(value) => ResponseBody::Json(value),
            Err(_) => ResponseBody::Text(String::from_utf8_lossy(bytes).into_owned()),
        }
    }

    /// Whether the body is exactly `{"errors": [{"code": code}]}`.
    pub fn is_error_code(&self, code: &str) -> bool {
        matches!(self, ResponseBody::Json(value) if *value == json!({"errors": [{"code": code}]}))
    }

    /// The body as a JSON value; text becomes a JSON string.
    pub fn into_value(self) -> Value {
        match self {
            ResponseBody::Empty => Value::Null,
            ResponseBody::Json(value) => value,
            ResponseBody::Text(text) => Value::String(text),
        }
    }
}

/// What the pipeline should do with a response.
#[derive(Debug)]
pub enum Classification {
    /// The call succeeded with this payload.
    Success(Value),
    /// The access token was rejected; refresh it and resend once.
    RefreshCredentials,
    /// A bot-detection challenge; halt all scheduled work.
    Captcha,
    /// The call failed with this error.
    Failure(ApiError),
}

/// Maps a raw response to a [`Classification`].
///
/// Rules are checked in a fixed order and the first match wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Classifies one response.
    ///
    /// `captcha_marker` is true when the challenge header was present on the response.
    pub fn classify(
        &self,
        endpoint: Endpoint,
        status: u16,
        captcha_marker: bool,
        body: ResponseBody,
    ) -> Classification {
        match status {
            400 if endpoint == Endpoint::UserEmailChange
                && body.is_error_code("INVALID_EMAIL_CHANGE_REQUEST") =>
            {
                Classification::Failure(ApiError::EmailChange)
            }
            400 if endpoint == Endpoint::ItemStatus && body.is_error_code("VALIDATION_ERROR") => {
                Classification::Failure(ApiError::Validation)
            }
            401 if endpoint.requires_credentials() && endpoint != Endpoint::TokenRefresh => {
                Classification::RefreshCredentials
            }
            403 if captcha_marker => Classification::Captcha,
            403 if body.is_error_code("UNAUTHORIZED") => {
                Classification::Failure(ApiError::Unauthorized)
            }
            410 if endpoint == Endpoint::ItemStatus && body.is_error_code("ENTITY_DELETED") => {
                Classification::Failure(ApiError::ItemDeleted)
            }
            410 if endpoint == Endpoint::ItemStatus && body.is_error_code("ENTITY_DISABLED") => {
                Classification::Failure(ApiError::ItemDisabled)
            }
            202 if endpoint == Endpoint::AuthByPolling && body == ResponseBody::Empty => {
                Classification::Success(Value::Object(Map::new()))
            }
            200 => match body {
                ResponseBody::Empty if endpoint.allows_empty_success() => {
                    Classification::Success(Value::Object(Map::new()))
                }
                ResponseBody::Json(value) => Classification::Success(value),
                ResponseBody::Empty => Classification::Failure(ApiError::Decode(format!(
                    "empty body from {endpoint}"
                ))),
                ResponseBody::Text(text) => Classification::Failure(ApiError::Decode(format!(
                    "non-JSON body from {endpoint}: {text}"
                ))),
            },
            _ => Classification::Failure(ApiError::Http {
                status,
                body: body.into_value(),
            }),
        }
    }
}
