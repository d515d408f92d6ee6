//! Shared building blocks for the identity common layer
//!
//! This crate holds the data model every other component speaks:
//!
//! 1. Credential and account records as they are stored in the token cache
//! 2. [`CacheRecord`], one account with the credentials resolved for it
//! 3. [`LocalAuthenticationResult`], a successful token acquisition
//! 4. [`BaseException`], the structured failure with its [`ExceptionKind`]
//! 5. The [`NameValueStore`] persistence contract
//!
//! # Example
//!
//! ```
//! use ic_core::{BaseException, ExceptionKind, ServiceDetails};
//!
//! let err = BaseException::service(
//!     "invalid_grant",
//!     Some("AADSTS70008: refresh token expired".to_string()),
//!     ServiceDetails::new(Some("bad_token".to_string()), 400),
//! );
//!
//! assert!(matches!(err.kind(), ExceptionKind::Service(_)));
//! assert_eq!(err.sub_error_code(), Some("bad_token"));
//! assert!(err.is_cacheable());
//! ```
//!
//! # Token Expiry
//!
//! Timestamps are stored as epoch-second strings, exactly as the cache schema
//! defines them. Reading them is strict: a value that is not a number is a
//! [`RecordError`], never silently "expired".

pub mod account;
pub mod config;
pub mod credential;
pub mod errors;
pub mod logging;
pub mod result;
pub mod store;

pub use account::{AccountRecord, CacheRecord, AUTHORITY_TYPE_MS_STS};
pub use config::{CommonConfig, ConfigError, LoggingConfig, StorageSettings, TelemetrySettings};
pub use credential::{
    AccessTokenRecord, Credential, CredentialRecord, CredentialType, IdTokenRecord,
    PrimaryRefreshTokenRecord, RefreshTokenRecord,
};
pub use errors::{
    client_codes, error_strings, BaseException, ExceptionKind, ExceptionType, RecordError, Result,
    ServiceDetails, StoreError,
};
pub use result::{AuthenticationResult, LocalAuthenticationResult, SdkType};
pub use store::{MemoryNameValueStore, NameValueStore, StoreResult};
