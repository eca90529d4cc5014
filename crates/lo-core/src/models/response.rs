use serde::Serialize;

use crate::error::OrchestratorError;

pub const SUCCESS_CODE: i32 = 0;

/// Structured result handed to the API layer for every exposed operation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: SUCCESS_CODE,
            message: "success".into(),
            data: Some(data),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == SUCCESS_CODE
    }
}

impl<T> From<&OrchestratorError> for ApiResponse<T> {
    fn from(err: &OrchestratorError) -> Self {
        Self {
            code: err.code(),
            message: format!("{}: {err}", err.kind()),
            data: None,
        }
    }
}

impl<T> From<crate::Result<T>> for ApiResponse<T> {
    fn from(result: crate::Result<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(err) => Self::from(&err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_carries_kind_and_code() {
        let err = OrchestratorError::status_conflict("node abc", "STOPPED", "RUNNING");
        let resp: ApiResponse<()> = ApiResponse::from(Err(err));
        assert!(!resp.is_success());
        assert_eq!(resp.code, 201002);
        assert!(resp.message.starts_with("StatusConflict:"));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(!json.contains("\"data\""));
    }
}
