//! Response validation for the provisioning backend.
//!
//! The contract is binary: the response confirms the runner if and only if
//! its `statusCode` field is the integer `200`. Everything else, including a
//! missing field, a string `"200"` or a payload that is not an object, is a
//! provisioning failure.

use serde_json::Value;

use crate::error::ProvisionError;
use crate::request::ProvisionResponse;

/// The only status code that confirms a runner.
pub const SUCCESS_STATUS: i64 = 200;

/// Proof that the backend accepted a provisioning request.
#[derive(Clone, Debug, PartialEq)]
pub struct ProvisionConfirmation {
    pub status_code: i64,
    pub body: Option<Value>,
}

/// Check a backend response.
///
/// # Errors
///
/// Returns [`ProvisionError::ProvisioningFailed`] with the raw payload when
/// the response does not carry `statusCode == 200`.
pub fn validate_response(
    response: &ProvisionResponse,
) -> Result<ProvisionConfirmation, ProvisionError> {
    match response.status_code() {
        Some(SUCCESS_STATUS) => Ok(ProvisionConfirmation {
            status_code: SUCCESS_STATUS,
            body: response.body().cloned(),
        }),
        Some(other) => Err(ProvisionError::ProvisioningFailed {
            reason: format!("backend returned statusCode {other}"),
            raw_response: response.raw(),
        }),
        None => Err(ProvisionError::ProvisioningFailed {
            reason: missing_reason(response.payload()),
            raw_response: response.raw(),
        }),
    }
}

fn missing_reason(payload: &Value) -> String {
    match payload {
        Value::Object(map) => match map.get("statusCode") {
            None => "response has no statusCode field".to_string(),
            Some(value) => format!("statusCode is not an integer: {value}"),
        },
        _ => "response is not a JSON object".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(payload: Value) -> Result<ProvisionConfirmation, ProvisionError> {
        validate_response(&ProvisionResponse::new(payload))
    }

    #[test]
    fn accepts_exactly_200() {
        let confirmation = check(json!({"statusCode": 200, "body": "ok"})).unwrap();
        assert_eq!(confirmation.status_code, 200);
        assert_eq!(confirmation.body, Some(json!("ok")));

        assert!(check(json!({"statusCode": 200})).is_ok());
    }

    #[test]
    fn rejects_every_other_code() {
        for code in [0, 1, 199, 201, 204, 299, 400, 500, 503, -200, 2000] {
            let err = check(json!({"statusCode": code})).unwrap_err();
            assert!(
                matches!(err, ProvisionError::ProvisioningFailed { .. }),
                "code {code} was not rejected"
            );
        }
    }

    #[test]
    fn rejects_missing_and_malformed_status() {
        let cases = [
            json!({}),
            json!({"body": "ok"}),
            json!({"statusCode": "200"}),
            json!({"statusCode": 200.1}),
            json!({"statusCode": null}),
            json!({"statusCode": true}),
            json!({"StatusCode": 200}),
            json!([{"statusCode": 200}]),
            json!("200"),
            Value::Null,
        ];
        for payload in cases {
            let rendered = payload.to_string();
            assert!(check(payload).is_err(), "{rendered} was accepted");
        }
    }

    #[test]
    fn diagnostic_includes_raw_response() {
        let err = check(json!({"statusCode": 500, "body": "capacity exceeded"})).unwrap_err();
        match &err {
            ProvisionError::ProvisioningFailed {
                reason,
                raw_response,
            } => {
                assert!(reason.contains("500"));
                assert!(raw_response.contains(r#""statusCode":500"#));
                assert!(raw_response.contains("capacity exceeded"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        let message = err.to_string();
        assert!(message.contains(r#""statusCode":500"#));
        assert!(message.contains("capacity exceeded"));
    }

    #[test]
    fn missing_field_reason_is_specific() {
        let err = check(json!({"errorMessage": "Task timed out"})).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("no statusCode field"));
        assert!(message.contains("Task timed out"));
    }
}
