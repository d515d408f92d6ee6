//! Field layout of the ESTS telemetry headers.
//!
//! Both headers are `|` separated sections whose fields are `,` separated.
//! Values are rendered positionally, so the order of the lists below is part
//! of the wire format.

pub use ic_core::config::telemetry::{FAILED_REQUEST_CAP, HEADER_DATA_LIMIT};

pub const SCHEMA_VERSION_KEY: &str = "schema_version";
pub const CURRENT_SCHEMA_VERSION: &str = "2";
/// Platform fields were sent before they were versioned, so this starts at 2
pub const CURRENT_PLATFORM_SCHEMA_VERSION: &str = "2";

pub const CURRENT_REQUEST_HEADER_NAME: &str = "x-client-current-telemetry";
pub const LAST_REQUEST_HEADER_NAME: &str = "x-client-last-telemetry";

pub const SEPARATOR_PIPE: &str = "|";
pub const SEPARATOR_COMMA: &str = ",";

pub mod key {
    const EVENT_PREFIX: &str = "Microsoft.MSAL.";

    macro_rules! prefixed {
        ($name:ident, $suffix:literal) => {
            pub const $name: &str = concat!("Microsoft.MSAL.", $suffix);
        };
    }

    prefixed!(API_ID, "api_id");
    prefixed!(FORCE_REFRESH, "force_refresh");
    prefixed!(CORRELATION_ID, "correlation_id");
    prefixed!(ERROR_CODE, "error_code");
    prefixed!(ERROR_DESCRIPTION, "error_description");
    prefixed!(SERVER_ERROR_CODE, "server_error_code");
    prefixed!(SERVER_SUBERROR_CODE, "server_sub_error_code");
    prefixed!(HTTP_RESPONSE_CODE, "response_code");
    prefixed!(SPE_RING, "spe_ring");
    prefixed!(ACCOUNT_STATUS, "account_status");
    prefixed!(ID_TOKEN_STATUS, "id_token_status");
    prefixed!(AT_STATUS, "at_status");
    prefixed!(RT_STATUS, "rt_status");
    prefixed!(FRT_STATUS, "frt_status");
    prefixed!(MRRT_STATUS, "mrrt_status");

    pub const ALL_TELEMETRY_DATA_SENT: &str = "is_all_telemetry_data_sent";
    pub const PLATFORM_SCHEMA_VERSION: &str = "platform_schema_version";

    // Shared device and multiple registration fields
    pub const IS_SHARED_DEVICE: &str = "isSharedScenario";
    pub const REG_TYPE: &str = "reg_type";
    pub const REG_SOURCE: &str = "reg_source";
    pub const FLW_SIGNOUT_APP: &str = "flw_signout_app";
    pub const FLW_SIGNIN_APP: &str = "flw_signin_app";
    pub const REG_NUM: &str = "reg_num";
    pub const CLOUD_NUM: &str = "cloud_num";
    pub const REG_SEQ_NUM: &str = "reg_seq_num";
    pub const REQ_PURPOSE: &str = "req_purpose";

    /// True when `key` carries the library event prefix
    pub fn is_prefixed(key: &str) -> bool {
        key.starts_with(EVENT_PREFIX)
    }
}

pub mod value {
    pub const TRUE: &str = "1";
    pub const FALSE: &str = "0";
    pub const EMPTY: &str = "";
}

const TOKEN_STATUS_FIELDS: [&str; 6] = [
    key::ACCOUNT_STATUS,
    key::ID_TOKEN_STATUS,
    key::AT_STATUS,
    key::RT_STATUS,
    key::FRT_STATUS,
    key::MRRT_STATUS,
];

const SHARED_DEVICE_FIELDS: [&str; 5] = [
    key::IS_SHARED_DEVICE,
    key::REG_TYPE,
    key::REG_SOURCE,
    key::FLW_SIGNOUT_APP,
    key::FLW_SIGNIN_APP,
];

const MULTIPLE_REGISTRATION_FIELDS: [&str; 6] = [
    key::IS_SHARED_DEVICE,
    key::REG_NUM,
    key::CLOUD_NUM,
    key::REG_SEQ_NUM,
    key::REQ_PURPOSE,
    key::REG_SOURCE,
];

const LAST_REQUEST_PLATFORM_FIELDS: [&str; 2] =
    [key::PLATFORM_SCHEMA_VERSION, key::ALL_TELEMETRY_DATA_SENT];

const OFFLINE_EMIT_FIELDS: [&str; 2] = [key::FLW_SIGNIN_APP, key::FLW_SIGNOUT_APP];

pub fn is_current_platform_field(key: &str) -> bool {
    TOKEN_STATUS_FIELDS.contains(&key)
        || SHARED_DEVICE_FIELDS.contains(&key)
        || MULTIPLE_REGISTRATION_FIELDS.contains(&key)
}

pub fn is_last_platform_field(key: &str) -> bool {
    LAST_REQUEST_PLATFORM_FIELDS.contains(&key)
}

/// Fields that may be parked in the supplemental store while no request is active
pub fn is_offline_emit_allowed(key: &str) -> bool {
    OFFLINE_EMIT_FIELDS.contains(&key)
}

/// Ordered platform fields of the current request header
pub fn current_request_platform_fields(shared_device: bool) -> Vec<&'static str> {
    let mut fields = vec![key::PLATFORM_SCHEMA_VERSION];
    if shared_device {
        fields.extend(SHARED_DEVICE_FIELDS);
    } else {
        fields.extend(MULTIPLE_REGISTRATION_FIELDS);
    }
    fields.extend(TOKEN_STATUS_FIELDS);
    fields
}

pub fn last_request_platform_fields() -> &'static [&'static str] {
    &LAST_REQUEST_PLATFORM_FIELDS
}

pub fn schema_compliant_bool(value: bool) -> &'static str {
    if value { value::TRUE } else { value::FALSE }
}

/// Normalize a value for the header: booleans become `1`/`0` and the
/// separator characters are dropped.
pub fn schema_compliant_string(value: Option<&str>) -> String {
    match value.map(str::trim) {
        None | Some("") => value::EMPTY.to_string(),
        Some(v) if v.eq_ignore_ascii_case("true") => value::TRUE.to_string(),
        Some(v) if v.eq_ignore_ascii_case("false") => value::FALSE.to_string(),
        Some(v) => v.chars().filter(|c| *c != '|' && *c != ',').collect(),
    }
}
