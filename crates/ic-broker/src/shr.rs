use serde::{Deserialize, Serialize};

pub const NO_ACCOUNT_FOUND: &str = "no_account_found";
pub const CLIENT_EXCEPTION: &str = "client_exception";

/// Signed HTTP request produced by the broker, or the reason it could not be
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateShrResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

impl GenerateShrResult {
    pub fn success(shr: impl Into<String>) -> Self {
        Self {
            shr: Some(shr.into()),
            ..Default::default()
        }
    }

    pub fn failure(error_code: impl Into<String>, error_msg: impl Into<String>) -> Self {
        Self {
            shr: None,
            error_code: Some(error_code.into()),
            error_msg: Some(error_msg.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.shr.is_some() && self.error_code.is_none()
    }
}
