//! Broker result marshaling
//!
//! Results and failures cross the broker boundary as a [`Bundle`] holding a
//! JSON [`BrokerResult`]. [`MsalBrokerResultAdapter`] builds those bundles and
//! turns them back into a [`LocalAuthenticationResult`] or the matching
//! [`BaseException`] kind.
//!
//! # Example
//!
//! ```
//! use ic_broker::MsalBrokerResultAdapter;
//! use ic_core::{BaseException, ExceptionType};
//!
//! let adapter = MsalBrokerResultAdapter::new();
//! let failure = BaseException::ui_required("invalid_grant", None, None);
//!
//! let bundle = adapter.bundle_from_base_exception(&failure, Some("5.0")).unwrap();
//! let restored = adapter.base_exception_from_bundle(&bundle);
//!
//! assert_eq!(restored.exception_type(), ExceptionType::UiRequired);
//! assert_eq!(restored.error_code(), "invalid_grant");
//! ```
//!
//! [`LocalAuthenticationResult`]: ic_core::LocalAuthenticationResult
//! [`BaseException`]: ic_core::BaseException

pub mod adapter;
pub mod broker_result;
pub mod bundle;
pub mod dcf;
pub mod gzip;
pub mod keys;
pub mod protocol;
pub mod shr;

pub use adapter::MsalBrokerResultAdapter;
pub use broker_result::BrokerResult;
pub use bundle::{Bundle, BundleValue};
pub use dcf::AuthorizationResult;
pub use protocol::{
    ProtocolVersion, ProtocolVersionError, can_compress_broker_payloads,
    should_remove_refresh_token,
};
pub use shr::GenerateShrResult;
