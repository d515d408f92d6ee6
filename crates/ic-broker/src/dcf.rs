use serde::{Deserialize, Serialize};

/// Device code flow authorization step: what the user has to enter, where,
/// and how often the client may poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationResult {
    pub user_code: String,
    pub device_code: String,
    pub verification_uri: String,
    /// Seconds until the codes expire
    pub expires_in: u64,
    /// Seconds between polls
    #[serde(default)]
    pub interval: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
