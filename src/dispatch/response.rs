use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::DispatchError;

/// The uniform response body: `{"error": bool, "message": string, "data"?: any}`.
///
/// Downstream services answer in the same shape, so it also decodes their
/// replies.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JsonResponse {
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            error: false,
            message: message.into(),
            data: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Option<Value>) -> Self {
        self.data = data;
        self
    }
}

impl From<&DispatchError> for JsonResponse {
    fn from(err: &DispatchError) -> Self {
        JsonResponse::error(err.to_string())
    }
}
