//! Bundle keys shared with the broker

pub const BROKER_RESULT_V2: &str = "broker_result_v2";
pub const BROKER_RESULT_V2_COMPRESSED: &str = "broker_result_v2_compressed";
pub const BROKER_REQUEST_V2_SUCCESS: &str = "broker_request_v2_success";

pub const BROKER_ACCOUNTS: &str = "broker_accounts";
pub const BROKER_ACCOUNTS_COMPRESSED: &str = "broker_accounts_compressed";

pub const BROKER_DEVICE_MODE: &str = "broker_device_mode";
pub const BROKER_GENERATE_SHR_RESULT: &str = "broker_generate_shr_result";
pub const BROKER_DEVICE_CODE_FLOW_AUTHORIZATION_RESULT: &str =
    "broker_device_code_flow_authorization_result";

/// Written by the broker on a successful hello
pub const NEGOTIATED_BP_VERSION_KEY: &str = "common.broker.protocol.version.name";

/// Written by brokers that do not understand hello
pub const ERROR: &str = "error";
pub const ERROR_DESCRIPTION: &str = "error_description";
