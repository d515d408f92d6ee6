use std::collections::HashMap;
use std::num::ParseIntError;
use std::sync::Arc;

use thiserror::Error;

/// Error codes for failures raised on the client side.
pub mod client_codes {
    pub const DEVICE_NETWORK_NOT_AVAILABLE: &str = "device_network_not_available";
    pub const INTERRUPTED_OPERATION: &str = "operation_interrupted";
    pub const INVALID_BROKER_BUNDLE: &str = "invalid_broker_bundle";
    pub const IO_ERROR: &str = "io_error";
    pub const JSON_PARSE_FAILURE: &str = "json_parse_failure";
    pub const DATA_MALFORMED: &str = "data_malformed";
    pub const UNKNOWN_ERROR: &str = "unknown_error";
    pub const DECRYPTION_FAILURE: &str = "failed_to_decrypt";
    pub const ENCRYPTION_FAILURE: &str = "failed_to_encrypt";
    pub const ACCESS_DENIED: &str = "access_denied";
    pub const TOKENS_MISSING: &str = "tokens_missing";
    pub const ACCOUNT_NOT_FOUND: &str = "account_not_found";
    pub const MISSING_PARAMETER: &str = "missing_parameter";
}

/// Protocol level error strings shared with brokers and the token endpoint.
pub mod error_strings {
    pub const INTERACTION_REQUIRED: &str = "interaction_required";
    pub const INVALID_GRANT: &str = "invalid_grant";
    pub const UNAUTHORIZED_CLIENT: &str = "unauthorized_client";
    pub const PROTECTION_POLICY_REQUIRED: &str = "protection_policy_required";
    pub const INVALID_BROKER_REFRESH_TOKEN: &str = "Broker refresh token is invalid";
    pub const NO_TOKENS_FOUND: &str = "no_tokens_found";
    pub const NO_ACCOUNT_FOUND: &str = "no_account_found";
    pub const USER_CANCELLED: &str = "User cancelled";
    pub const USER_CANCELLED_CODE: &str = "user_cancelled";
    pub const UNSUPPORTED_BROKER_VERSION_ERROR_CODE: &str = "unsupported_broker_version";
    pub const UNSUPPORTED_BROKER_VERSION_ERROR_MESSAGE: &str =
        "Please update Intune Company Portal and/or Microsoft Authenticator to the latest version.";
    pub const DEVICE_CODE_FLOW_NOT_SUPPORTED: &str = "dcf_not_supported";
    pub const AUTHORIZATION_PENDING: &str = "authorization_pending";
    pub const ILLEGAL_ARGUMENT_ERROR_CODE: &str = "illegal_argument_exception";
    pub const BROKER_TOKEN_REQUEST_OPERATION_NAME: &str = "broker_token_request_operation";
}

/// Error codes that must never be cached by callers.
const NON_CACHEABLE_CODES: &[&str] = &[
    client_codes::DEVICE_NETWORK_NOT_AVAILABLE,
    client_codes::INTERRUPTED_OPERATION,
    client_codes::INVALID_BROKER_BUNDLE,
    client_codes::IO_ERROR,
];

/// Raw HTTP response data captured for service errors
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceDetails {
    pub sub_error_code: Option<String>,
    /// HTTP status, 0 when unknown
    pub http_status_code: u16,
    pub http_response_body: HashMap<String, String>,
    pub http_response_headers: HashMap<String, Vec<String>>,
}

impl ServiceDetails {
    pub fn new(sub_error_code: Option<String>, http_status_code: u16) -> Self {
        Self {
            sub_error_code,
            http_status_code,
            ..Default::default()
        }
    }
}

/// Discriminant plus the kind specific payload of a [`BaseException`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExceptionKind {
    /// Local or SDK side failure
    Client,
    /// The token endpoint rejected the request
    Service(ServiceDetails),
    /// The server demands interactive authentication
    UiRequired { sub_error_code: Option<String> },
    /// The server demands app protection policy remediation
    IntuneAppProtectionPolicyRequired {
        service: ServiceDetails,
        account_upn: Option<String>,
        account_user_id: Option<String>,
        tenant_id: Option<String>,
        authority_url: Option<String>,
    },
    /// Caller misuse
    Argument {
        operation_name: String,
        argument_name: Option<String>,
    },
    /// The user cancelled the flow
    UserCancel,
}

impl ExceptionKind {
    pub fn exception_type(&self) -> ExceptionType {
        match self {
            Self::Client => ExceptionType::Client,
            Self::Service(_) => ExceptionType::Service,
            Self::UiRequired { .. } => ExceptionType::UiRequired,
            Self::IntuneAppProtectionPolicyRequired { .. } => {
                ExceptionType::IntuneAppProtectionPolicyRequired
            }
            Self::Argument { .. } => ExceptionType::Argument,
            Self::UserCancel => ExceptionType::UserCancel,
        }
    }
}

/// Serialization tag for exception kinds crossing a process boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionType {
    Client,
    Service,
    UiRequired,
    IntuneAppProtectionPolicyRequired,
    Argument,
    UserCancel,
}

impl ExceptionType {
    const ALL: [ExceptionType; 6] = [
        Self::Client,
        Self::Service,
        Self::UiRequired,
        Self::IntuneAppProtectionPolicyRequired,
        Self::Argument,
        Self::UserCancel,
    ];

    /// Tag written on the wire. Older peers only understand these names.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Client => "com.microsoft.identity.common.exception.ClientException",
            Self::Service => "com.microsoft.identity.common.exception.ServiceException",
            Self::UiRequired => "com.microsoft.identity.common.exception.UiRequiredException",
            Self::IntuneAppProtectionPolicyRequired => {
                "com.microsoft.identity.common.exception.IntuneAppProtectionPolicyRequiredException"
            }
            Self::Argument => "com.microsoft.identity.common.exception.ArgumentException",
            Self::UserCancel => "com.microsoft.identity.common.exception.UserCancelException",
        }
    }

    pub fn short_name(self) -> &'static str {
        match self {
            Self::Client => "ClientException",
            Self::Service => "ServiceException",
            Self::UiRequired => "UiRequiredException",
            Self::IntuneAppProtectionPolicyRequired => "IntuneAppProtectionPolicyRequiredException",
            Self::Argument => "ArgumentException",
            Self::UserCancel => "UserCancelException",
        }
    }

    /// Resolve a tag, accepting both the wire name and the short name.
    /// Returns `None` for tags this version does not know.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let tag = tag.trim();
        Self::ALL.into_iter().find(|t| {
            t.wire_name().eq_ignore_ascii_case(tag) || t.short_name().eq_ignore_ascii_case(tag)
        })
    }
}

type SharedCause = Arc<dyn std::error::Error + Send + Sync>;

/// Structured failure shared by every component.
///
/// The kind specific data lives in [`ExceptionKind`]; the fields here are the ones
/// every failure carries across the broker boundary so that telemetry and support
/// diagnostics stay correlated.
#[derive(Error, Debug, Clone)]
#[error("[{error_code}] {}", .message.as_deref().unwrap_or_default())]
pub struct BaseException {
    kind: ExceptionKind,
    error_code: String,
    message: Option<String>,
    correlation_id: Option<String>,
    spe_ring: Option<String>,
    refresh_token_age: Option<String>,
    cli_telem_error_code: Option<String>,
    cli_telem_sub_error_code: Option<String>,
    username: Option<String>,
    suppressed: Vec<BaseException>,
    #[source]
    cause: Option<SharedCause>,
}

impl BaseException {
    pub fn new(kind: ExceptionKind, error_code: impl Into<String>, message: Option<String>) -> Self {
        Self {
            kind,
            error_code: error_code.into(),
            message: message.filter(|m| !m.is_empty()),
            correlation_id: None,
            spe_ring: None,
            refresh_token_age: None,
            cli_telem_error_code: None,
            cli_telem_sub_error_code: None,
            username: None,
            suppressed: Vec::new(),
            cause: None,
        }
    }

    pub fn client(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ExceptionKind::Client, error_code, Some(message.into()))
    }

    pub fn service(
        error_code: impl Into<String>,
        message: Option<String>,
        details: ServiceDetails,
    ) -> Self {
        Self::new(ExceptionKind::Service(details), error_code, message)
    }

    pub fn ui_required(
        error_code: impl Into<String>,
        message: Option<String>,
        sub_error_code: Option<String>,
    ) -> Self {
        Self::new(ExceptionKind::UiRequired { sub_error_code }, error_code, message)
    }

    pub fn argument(
        operation_name: impl Into<String>,
        argument_name: Option<String>,
        message: Option<String>,
    ) -> Self {
        Self::new(
            ExceptionKind::Argument {
                operation_name: operation_name.into(),
                argument_name,
            },
            error_strings::ILLEGAL_ARGUMENT_ERROR_CODE,
            message,
        )
    }

    pub fn user_cancel() -> Self {
        Self::new(
            ExceptionKind::UserCancel,
            error_strings::USER_CANCELLED_CODE,
            Some(error_strings::USER_CANCELLED.to_string()),
        )
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn kind(&self) -> &ExceptionKind {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut ExceptionKind {
        &mut self.kind
    }

    pub fn exception_type(&self) -> ExceptionType {
        self.kind.exception_type()
    }

    pub fn error_code(&self) -> &str {
        &self.error_code
    }

    /// Message, never `Some("")`
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn set_correlation_id(&mut self, correlation_id: Option<String>) {
        self.correlation_id = correlation_id;
    }

    pub fn spe_ring(&self) -> Option<&str> {
        self.spe_ring.as_deref()
    }

    pub fn set_spe_ring(&mut self, spe_ring: Option<String>) {
        self.spe_ring = spe_ring;
    }

    pub fn refresh_token_age(&self) -> Option<&str> {
        self.refresh_token_age.as_deref()
    }

    pub fn set_refresh_token_age(&mut self, refresh_token_age: Option<String>) {
        self.refresh_token_age = refresh_token_age;
    }

    pub fn cli_telem_error_code(&self) -> Option<&str> {
        self.cli_telem_error_code.as_deref()
    }

    pub fn set_cli_telem_error_code(&mut self, code: Option<String>) {
        self.cli_telem_error_code = code;
    }

    pub fn cli_telem_sub_error_code(&self) -> Option<&str> {
        self.cli_telem_sub_error_code.as_deref()
    }

    pub fn set_cli_telem_sub_error_code(&mut self, code: Option<String>) {
        self.cli_telem_sub_error_code = code;
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn set_username(&mut self, username: Option<String>) {
        self.username = username;
    }

    pub fn suppressed(&self) -> &[BaseException] {
        &self.suppressed
    }

    pub fn add_suppressed(&mut self, exception: BaseException) {
        self.suppressed.push(exception);
    }

    /// Service details for `Service` and `IntuneAppProtectionPolicyRequired` kinds
    pub fn service_details(&self) -> Option<&ServiceDetails> {
        match &self.kind {
            ExceptionKind::Service(details) => Some(details),
            ExceptionKind::IntuneAppProtectionPolicyRequired { service, .. } => Some(service),
            _ => None,
        }
    }

    /// OAuth sub error code, if the kind carries one
    pub fn sub_error_code(&self) -> Option<&str> {
        match &self.kind {
            ExceptionKind::UiRequired { sub_error_code } => sub_error_code.as_deref(),
            _ => self
                .service_details()
                .and_then(|d| d.sub_error_code.as_deref()),
        }
    }

    pub fn is_cacheable(&self) -> bool {
        if matches!(
            self.kind,
            ExceptionKind::IntuneAppProtectionPolicyRequired { .. }
        ) {
            return false;
        }
        !NON_CACHEABLE_CODES.contains(&self.error_code.as_str())
    }
}

/// Failures reading timestamps and other typed values out of cache records
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("Invalid timestamp in '{field}': '{value}'")]
    InvalidTimestamp {
        field: &'static str,
        value: String,
        #[source]
        source: ParseIntError,
    },

    #[error("Timestamp in '{field}' is out of range: '{value}'")]
    TimestampOutOfRange { field: &'static str, value: String },

    #[error("Missing required field '{0}'")]
    MissingField(&'static str),

    #[error("Unknown credential type '{0}'")]
    UnknownCredentialType(String),
}

impl From<RecordError> for BaseException {
    fn from(err: RecordError) -> Self {
        let message = err.to_string();
        BaseException::client(client_codes::DATA_MALFORMED, message).with_cause(err)
    }
}

/// Errors raised by name/value stores and the encryption layer under them
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Decryption failed with every available key ({} attempts)", failures.len())]
    DecryptionExhausted { failures: Vec<StoreError> },

    #[error("Stored data is corrupted or was encrypted with a different key")]
    CorruptedStore,

    #[error("Storage is locked by another process")]
    LockTimeout,

    #[error("In-memory store lock poisoned")]
    LockPoisoned,

    #[error("Passphrase entry was cancelled")]
    PassphraseUnavailable,

    #[error("Invalid record: {0}")]
    Record(#[from] RecordError),

    #[error("Invalid stored data: {0}")]
    InvalidData(String),
}

impl From<StoreError> for BaseException {
    fn from(err: StoreError) -> Self {
        let message = err.to_string();
        match err {
            StoreError::Io(_) | StoreError::LockTimeout | StoreError::LockPoisoned => {
                BaseException::client(client_codes::IO_ERROR, message).with_cause(err)
            }
            StoreError::Serde(_) | StoreError::InvalidData(_) => {
                BaseException::client(client_codes::JSON_PARSE_FAILURE, message).with_cause(err)
            }
            StoreError::Encryption(_) => {
                BaseException::client(client_codes::ENCRYPTION_FAILURE, message).with_cause(err)
            }
            StoreError::Decryption(_) | StoreError::CorruptedStore => {
                BaseException::client(client_codes::DECRYPTION_FAILURE, message).with_cause(err)
            }
            StoreError::DecryptionExhausted { failures } => {
                let mut exception =
                    BaseException::client(client_codes::DECRYPTION_FAILURE, message);
                for failure in failures {
                    exception.add_suppressed(failure.into());
                }
                exception
            }
            StoreError::PassphraseUnavailable => {
                BaseException::client(client_codes::ACCESS_DENIED, message).with_cause(err)
            }
            StoreError::Record(record) => record.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BaseException>;
