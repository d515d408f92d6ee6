use ic_core::CacheRecord;
use serde::{Deserialize, Serialize};

/// Flattened snapshot of a token result or a failure, as sent across the
/// broker boundary. `success` decides which half of the fields is meaningful.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerResult {
    #[serde(rename = "tenantProfileCacheRecords", skip_serializing_if = "Option::is_none")]
    pub tenant_profile_data: Option<Vec<CacheRecord>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home_account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authority: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    /// Epoch seconds
    pub expires_on: i64,
    pub ext_expires_on: i64,
    pub cached_at: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub spe_ring: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token_age: Option<String>,

    pub success: bool,
    pub serviced_from_cache: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Exception kind tag. Brokers predating the tag leave it out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(rename = "oauthSubErrorCode", skip_serializing_if = "Option::is_none")]
    pub sub_error_code: Option<String>,
    pub http_status_code: u16,
    /// JSON object of header name to values
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_response_headers: Option<String>,
    /// JSON object of body field to value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_response_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cli_telem_error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cli_telem_sub_error_code: Option<String>,
}

impl BrokerResult {
    pub fn tenant_profile_records(&self) -> &[CacheRecord] {
        self.tenant_profile_data.as_deref().unwrap_or_default()
    }
}
