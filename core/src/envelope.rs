//! Uniform response envelope exchanged between services.
//!
//! Every HTTP response, success or failure, has the shape
//! `{"code": 200, "message": "...", "data": ...}`. A `code` of 200 is success;
//! anything else is a business rejection whose `message` is a stable,
//! human-readable reason.

use serde::{Deserialize, Serialize};

/// The success code.
pub const SUCCESS_CODE: i32 = 200;

/// `{code, message, data}` response body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    /// 200 on success, otherwise an HTTP-like status describing the rejection
    pub code: i32,
    /// Human-readable outcome
    #[serde(default)]
    pub message: String,
    /// Payload, absent on rejection
    pub data: Option<T>,
}

impl<T> ApiEnvelope<T> {
    /// Successful envelope carrying `data`.
    #[must_use]
    pub fn ok(data: T) -> Self {
        Self {
            code: SUCCESS_CODE,
            message: "success".to_string(),
            data: Some(data),
        }
    }

    /// Rejection envelope with no payload.
    #[must_use]
    pub fn rejected(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Whether the downstream reported success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code == SUCCESS_CODE
    }

    /// Split into `Ok(data)` on success or `Err(message)` on rejection.
    ///
    /// # Errors
    ///
    /// Returns the rejection message when `code != 200`.
    pub fn into_result(self) -> Result<Option<T>, String> {
        if self.is_success() {
            Ok(self.data)
        } else {
            Err(self.message)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn rejection_has_null_data() {
        let envelope: ApiEnvelope<u32> = ApiEnvelope::rejected(404, "owner not found");
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["data"], serde_json::Value::Null);
        assert_eq!(envelope.into_result(), Err("owner not found".to_string()));
    }

    #[test]
    fn missing_fields_default() {
        let envelope: ApiEnvelope<u32> = serde_json::from_str(r#"{"code":200}"#).unwrap();
        assert!(envelope.is_success());
        assert_eq!(envelope.into_result(), Ok(None));
    }
}
