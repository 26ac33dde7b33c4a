use crate::engine::EngineError;
use faceproof_core::FailureReason;
use serde::{Deserialize, Serialize};

/// The envelope every public operation returns. Failures never escape as
/// raw errors: they carry a [`FailureReason`] and a user-facing message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    pub message: String,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ServiceResponse<T> {
    pub fn ok(request_id: &str, message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            failure_reason: None,
            message: message.into(),
            request_id: request_id.to_string(),
            data: Some(data),
        }
    }

    pub fn fail(request_id: &str, err: &EngineError) -> Self {
        Self {
            success: false,
            failure_reason: Some(err.reason()),
            message: err.user_message(),
            request_id: request_id.to_string(),
            data: None,
        }
    }
}

impl<T: Serialize> ServiceResponse<T> {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|err| {
            tracing::error!(error = %err, "response serialization failed");
            serde_json::json!({
                "success": false,
                "failureReason": FailureReason::ProcessingError,
                "message": FailureReason::ProcessingError.user_message(),
                "requestId": self.request_id,
            })
            .to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_shape() {
        let json: serde_json::Value =
            serde_json::from_str(&ServiceResponse::ok("r1", "done", 42).to_json()).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["requestId"], "r1");
        assert_eq!(json["data"], 42);
        assert!(json.get("failureReason").is_none());
    }

    #[test]
    fn test_failure_shape() {
        let resp: ServiceResponse<()> =
            ServiceResponse::fail("r2", &EngineError::NoFace { which: "image 2" });
        let json: serde_json::Value = serde_json::from_str(&resp.to_json()).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["failureReason"], "no_face_detected");
        assert_eq!(json["message"], "no face detected in image 2");
        assert!(json.get("data").is_none());
    }
}
