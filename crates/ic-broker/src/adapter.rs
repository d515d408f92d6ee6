use std::collections::HashMap;

use ic_core::config::authority::MSA_CONSUMER_TENANT_ID;
use ic_core::{
    AuthenticationResult, BaseException, CacheRecord, ExceptionKind, ExceptionType,
    LocalAuthenticationResult, Result, SdkType, ServiceDetails, StoreError, client_codes,
    error_strings,
};
use serde::Serialize;
use tracing::{debug, error, instrument, warn};

use crate::broker_result::BrokerResult;
use crate::bundle::Bundle;
use crate::dcf::AuthorizationResult;
use crate::gzip;
use crate::keys;
use crate::protocol::{can_compress_broker_payloads, should_remove_refresh_token};
use crate::shr::GenerateShrResult;

const EMPTY_RESULT_MESSAGE: &str = "Broker Result not returned from Broker";

/// Converts token results, failures and the other broker replies to and from
/// [`Bundle`]s.
///
/// Payloads are JSON. When the negotiated protocol version allows it they
/// travel gzip compressed under a separate key, so readers check the
/// compressed key first and fall back to the plain one.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsalBrokerResultAdapter;

impl MsalBrokerResultAdapter {
    pub fn new() -> Self {
        Self
    }

    #[instrument(skip_all)]
    pub fn bundle_from_authentication_result(
        &self,
        result: &dyn AuthenticationResult,
        negotiated_protocol_version: Option<&str>,
    ) -> Result<Bundle> {
        let mut records = result.cache_record_with_tenant_profile_data().to_vec();
        let mut refresh_token = result.refresh_token().map(str::to_string);

        let consumer_tenant = result
            .tenant_id()
            .is_some_and(|t| t.eq_ignore_ascii_case(MSA_CONSUMER_TENANT_ID));
        if should_remove_refresh_token(negotiated_protocol_version) && !consumer_tenant {
            debug!("Removing refresh tokens from broker result");
            refresh_token = None;
            for record in &mut records {
                record.refresh_token = None;
            }
        }

        let account = result.account_record();
        let access_token = result.access_token_record();
        let broker_result = BrokerResult {
            tenant_profile_data: Some(records),
            access_token: Some(result.access_token().to_string()),
            id_token: result.id_token().map(str::to_string),
            refresh_token,
            home_account_id: Some(account.home_account_id.clone()),
            local_account_id: Some(account.local_account_id.clone()),
            user_name: Some(account.username.clone()),
            token_type: access_token.token_type.clone(),
            client_id: Some(access_token.credential.client_id.clone()),
            family_id: result.family_id().map(str::to_string),
            scope: Some(access_token.target.clone()),
            client_info: access_token.credential.client_info.clone(),
            authority: access_token.authority.clone(),
            environment: Some(access_token.credential.environment.clone()),
            tenant_id: result.tenant_id().map(str::to_string),
            expires_on: result.expires_on().timestamp(),
            ext_expires_on: epoch_or_zero(access_token.extended_expires_on.as_deref()),
            cached_at: epoch_or_zero(access_token.credential.cached_at.as_deref()),
            spe_ring: result.spe_ring().map(str::to_string),
            refresh_token_age: result.refresh_token_age().map(str::to_string),
            correlation_id: result.correlation_id().map(str::to_string),
            success: true,
            serviced_from_cache: result.is_serviced_from_cache(),
            ..Default::default()
        };

        let mut bundle = Bundle::new();
        put_json_payload(
            &mut bundle,
            &broker_result,
            keys::BROKER_RESULT_V2,
            keys::BROKER_RESULT_V2_COMPRESSED,
            negotiated_protocol_version,
        )?;
        bundle.put_bool(keys::BROKER_REQUEST_V2_SUCCESS, true);
        Ok(bundle)
    }

    #[instrument(skip_all, fields(error_code = exception.error_code()))]
    pub fn bundle_from_base_exception(
        &self,
        exception: &BaseException,
        negotiated_protocol_version: Option<&str>,
    ) -> Result<Bundle> {
        let mut broker_result = BrokerResult {
            success: false,
            error_code: Some(exception.error_code().to_string()),
            error_message: exception.message().map(str::to_string),
            exception_type: Some(exception.exception_type().wire_name().to_string()),
            correlation_id: exception.correlation_id().map(str::to_string),
            sub_error_code: exception.sub_error_code().map(str::to_string),
            cli_telem_error_code: exception.cli_telem_error_code().map(str::to_string),
            cli_telem_sub_error_code: exception.cli_telem_sub_error_code().map(str::to_string),
            spe_ring: exception.spe_ring().map(str::to_string),
            refresh_token_age: exception.refresh_token_age().map(str::to_string),
            ..Default::default()
        };

        if let Some(details) = exception.service_details() {
            broker_result.http_status_code = details.http_status_code;
            broker_result.http_response_headers = json_if_not_empty(&details.http_response_headers)?;
            broker_result.http_response_body = json_if_not_empty(&details.http_response_body)?;
        }

        if let ExceptionKind::IntuneAppProtectionPolicyRequired {
            account_upn,
            account_user_id,
            tenant_id,
            authority_url,
            ..
        } = exception.kind()
        {
            broker_result.user_name = account_upn.clone();
            broker_result.local_account_id = account_user_id.clone();
            broker_result.tenant_id = tenant_id.clone();
            broker_result.authority = authority_url.clone();
        }

        let mut bundle = Bundle::new();
        put_json_payload(
            &mut bundle,
            &broker_result,
            keys::BROKER_RESULT_V2,
            keys::BROKER_RESULT_V2_COMPRESSED,
            negotiated_protocol_version,
        )?;
        bundle.put_bool(keys::BROKER_REQUEST_V2_SUCCESS, false);
        Ok(bundle)
    }

    /// Read the [`BrokerResult`] out of `bundle`, compressed key first.
    pub fn broker_result_from_bundle(&self, bundle: &Bundle) -> Result<BrokerResult> {
        let json = read_payload(
            bundle,
            keys::BROKER_RESULT_V2,
            keys::BROKER_RESULT_V2_COMPRESSED,
        )
        .map_err(|e| {
            error!("Failed to decompress broker result: {}", e);
            invalid_broker_bundle("Failed to decompress broker result").with_cause(e)
        })?;

        let Some(json) = json else {
            error!("{}", EMPTY_RESULT_MESSAGE);
            return Err(self.get_exception_for_empty_result_bundle());
        };

        serde_json::from_str(&json).map_err(|e| {
            error!("Failed to parse broker result: {}", e);
            invalid_broker_bundle("Failed to parse broker result").with_cause(e)
        })
    }

    pub fn authentication_result_from_bundle(
        &self,
        bundle: &Bundle,
    ) -> Result<LocalAuthenticationResult> {
        let broker_result = self.broker_result_from_bundle(bundle)?;
        self.authentication_result_from_broker_result(broker_result)
    }

    pub fn authentication_result_from_broker_result(
        &self,
        broker_result: BrokerResult,
    ) -> Result<LocalAuthenticationResult> {
        let records = broker_result.tenant_profile_data.unwrap_or_default();
        let Some(last_authorized) = records.first().cloned() else {
            error!("Broker result does not contain tenant profile data");
            return Err(invalid_broker_bundle(
                "Broker Result does not contain tenant profile data",
            ));
        };

        let result = LocalAuthenticationResult::new(
            last_authorized,
            records,
            SdkType::Msal,
            broker_result.serviced_from_cache,
        )?;
        Ok(result
            .with_family_id(broker_result.family_id)
            .with_spe_ring(broker_result.spe_ring)
            .with_refresh_token_age(broker_result.refresh_token_age)
            .with_correlation_id(broker_result.correlation_id))
    }

    /// Exception carried by `bundle`. An unreadable bundle yields the
    /// `invalid_broker_bundle` failure describing why.
    pub fn base_exception_from_bundle(&self, bundle: &Bundle) -> BaseException {
        match self.broker_result_from_bundle(bundle) {
            Ok(broker_result) => self.base_exception_from_broker_result(&broker_result),
            Err(e) => e,
        }
    }

    pub fn base_exception_from_broker_result(&self, broker_result: &BrokerResult) -> BaseException {
        let error_code = broker_result
            .error_code
            .clone()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| client_codes::UNKNOWN_ERROR.to_string());
        let message = broker_result.error_message.clone();

        let mut exception = match broker_result.exception_type.as_deref().filter(|t| !t.is_empty()) {
            Some(tag) => exception_from_type_tag(tag, broker_result, error_code, message),
            None => exception_from_error_codes(broker_result, error_code, message),
        };

        exception.set_cli_telem_error_code(broker_result.cli_telem_error_code.clone());
        exception.set_cli_telem_sub_error_code(broker_result.cli_telem_sub_error_code.clone());
        exception.set_correlation_id(broker_result.correlation_id.clone());
        exception.set_spe_ring(broker_result.spe_ring.clone());
        exception.set_refresh_token_age(broker_result.refresh_token_age.clone());
        exception
    }

    /// Negotiated protocol version from a hello reply
    pub fn verify_hello_from_result_bundle(&self, bundle: Option<&Bundle>) -> Result<String> {
        let Some(bundle) = bundle else {
            warn!("Hello returned no bundle");
            return Err(unsupported_broker_version());
        };

        if let Some(version) = non_empty(bundle.get_string(keys::NEGOTIATED_BP_VERSION_KEY)) {
            debug!("Negotiated broker protocol version {}", version);
            return Ok(version.to_string());
        }

        let error_code = non_empty(bundle.get_string(keys::ERROR));
        let error_description = non_empty(bundle.get_string(keys::ERROR_DESCRIPTION));
        if let (Some(code), Some(description)) = (error_code, error_description) {
            warn!("Hello failed with {}", code);
            return Err(BaseException::client(code, description));
        }

        Err(unsupported_broker_version())
    }

    pub fn get_acquire_token_result_from_result_bundle(
        &self,
        bundle: &Bundle,
    ) -> Result<LocalAuthenticationResult> {
        let broker_result = self.broker_result_from_bundle(bundle)?;
        if bundle.get_bool(keys::BROKER_REQUEST_V2_SUCCESS) {
            debug!("Broker returned a successful result");
            self.authentication_result_from_broker_result(broker_result)
        } else {
            Err(self.base_exception_from_broker_result(&broker_result))
        }
    }

    pub fn bundle_from_accounts(
        &self,
        accounts: &[CacheRecord],
        negotiated_protocol_version: Option<&str>,
    ) -> Result<Bundle> {
        let mut bundle = Bundle::new();
        put_json_payload(
            &mut bundle,
            accounts,
            keys::BROKER_ACCOUNTS,
            keys::BROKER_ACCOUNTS_COMPRESSED,
            negotiated_protocol_version,
        )?;
        Ok(bundle)
    }

    pub fn get_accounts_from_result_bundle(&self, bundle: &Bundle) -> Result<Vec<CacheRecord>> {
        let json = read_payload(bundle, keys::BROKER_ACCOUNTS, keys::BROKER_ACCOUNTS_COMPRESSED)
            .map_err(|e| {
                error!("Failed to decompress account list: {}", e);
                invalid_broker_bundle("Failed to decompress account list").with_cause(e)
            })?;

        match json {
            Some(json) => serde_json::from_str(&json).map_err(|e| {
                invalid_broker_bundle("Failed to parse account list").with_cause(e)
            }),
            None => Err(self.base_exception_from_bundle(bundle)),
        }
    }

    /// Absent and empty replies both mean the account is gone
    pub fn verify_remove_account_result_from_bundle(&self, bundle: Option<&Bundle>) -> Result<()> {
        let Some(bundle) = bundle.filter(|b| !b.is_empty()) else {
            return Ok(());
        };

        let broker_result = self.broker_result_from_bundle(bundle)?;
        if broker_result.success {
            Ok(())
        } else {
            Err(self.base_exception_from_broker_result(&broker_result))
        }
    }

    pub fn bundle_from_device_mode(&self, is_shared_device: bool) -> Bundle {
        let mut bundle = Bundle::new();
        bundle.put_bool(keys::BROKER_DEVICE_MODE, is_shared_device);
        bundle
    }

    /// True when the device is in shared mode
    pub fn get_device_mode_from_result_bundle(&self, bundle: &Bundle) -> Result<bool> {
        if !bundle.contains_key(keys::BROKER_DEVICE_MODE) {
            return Err(self.base_exception_from_bundle(bundle));
        }
        Ok(bundle.get_bool(keys::BROKER_DEVICE_MODE))
    }

    pub fn bundle_from_generate_shr_result(&self, result: &GenerateShrResult) -> Result<Bundle> {
        let mut bundle = Bundle::new();
        bundle.put_string(keys::BROKER_GENERATE_SHR_RESULT, to_json(result)?);
        Ok(bundle)
    }

    pub fn get_generate_shr_result_from_result_bundle(
        &self,
        bundle: &Bundle,
    ) -> Result<GenerateShrResult> {
        let Some(json) = non_empty(bundle.get_string(keys::BROKER_GENERATE_SHR_RESULT)) else {
            return Err(invalid_broker_bundle("Broker did not return a SHR result"));
        };
        serde_json::from_str(json)
            .map_err(|e| invalid_broker_bundle("Failed to parse SHR result").with_cause(e))
    }

    pub fn bundle_from_device_code_flow_authorization_result(
        &self,
        result: &AuthorizationResult,
    ) -> Result<Bundle> {
        let mut bundle = Bundle::new();
        bundle.put_string(
            keys::BROKER_DEVICE_CODE_FLOW_AUTHORIZATION_RESULT,
            to_json(result)?,
        );
        Ok(bundle)
    }

    /// Authorization step of the device code flow. A broker too old for the
    /// flow answers with a `dcf_not_supported` client failure.
    pub fn get_device_code_flow_authorization_result_from_bundle(
        &self,
        bundle: &Bundle,
    ) -> Result<AuthorizationResult> {
        match non_empty(bundle.get_string(keys::BROKER_DEVICE_CODE_FLOW_AUTHORIZATION_RESULT)) {
            Some(json) => serde_json::from_str(json).map_err(|e| {
                invalid_broker_bundle("Failed to parse device code flow authorization result")
                    .with_cause(e)
            }),
            None => Err(surface_capability_gap(self.base_exception_from_bundle(bundle))),
        }
    }

    /// Token step of the device code flow. `Ok(None)` means the user has not
    /// finished yet and the caller should keep polling.
    pub fn get_device_code_flow_token_result_from_bundle(
        &self,
        bundle: &Bundle,
    ) -> Result<Option<LocalAuthenticationResult>> {
        let broker_result = self.broker_result_from_bundle(bundle)?;
        if bundle.get_bool(keys::BROKER_REQUEST_V2_SUCCESS) {
            return self.authentication_result_from_broker_result(broker_result).map(Some);
        }

        let exception = self.base_exception_from_broker_result(&broker_result);
        if exception.error_code() == error_strings::AUTHORIZATION_PENDING {
            debug!("Device code flow authorization pending");
            return Ok(None);
        }
        Err(surface_capability_gap(exception))
    }

    pub fn get_exception_for_empty_result_bundle(&self) -> BaseException {
        invalid_broker_bundle(EMPTY_RESULT_MESSAGE)
    }
}

fn exception_from_type_tag(
    tag: &str,
    broker_result: &BrokerResult,
    error_code: String,
    message: Option<String>,
) -> BaseException {
    let Some(exception_type) = ExceptionType::from_tag(tag) else {
        warn!("Unknown exception type {}, treating it as a client exception", tag);
        return BaseException::new(ExceptionKind::Client, error_code, message);
    };

    match exception_type {
        ExceptionType::Client => BaseException::new(ExceptionKind::Client, error_code, message),
        ExceptionType::Service => {
            BaseException::service(error_code, message, service_details(broker_result))
        }
        ExceptionType::UiRequired => {
            BaseException::ui_required(error_code, message, broker_result.sub_error_code.clone())
        }
        ExceptionType::IntuneAppProtectionPolicyRequired => {
            intune_exception(broker_result, error_code, message)
        }
        ExceptionType::Argument => BaseException::argument(
            error_strings::BROKER_TOKEN_REQUEST_OPERATION_NAME,
            None,
            message,
        ),
        ExceptionType::UserCancel => BaseException::user_cancel(),
    }
}

/// Brokers that predate the exception type tag only send codes
fn exception_from_error_codes(
    broker_result: &BrokerResult,
    error_code: String,
    message: Option<String>,
) -> BaseException {
    let is = |expected: &str| error_code.eq_ignore_ascii_case(expected);
    let sub_error_code = broker_result.sub_error_code.as_deref();

    if is(error_strings::INTERACTION_REQUIRED)
        || is(error_strings::INVALID_GRANT)
        || is(error_strings::INVALID_BROKER_REFRESH_TOKEN)
        || is(error_strings::NO_TOKENS_FOUND)
    {
        debug!("Legacy broker result maps to ui required");
        return BaseException::ui_required(error_code, message, broker_result.sub_error_code.clone());
    }

    if is(error_strings::UNAUTHORIZED_CLIENT)
        && sub_error_code
            .is_some_and(|s| s.eq_ignore_ascii_case(error_strings::PROTECTION_POLICY_REQUIRED))
    {
        debug!("Legacy broker result maps to app protection policy required");
        return intune_exception(broker_result, error_code, message);
    }

    if is(error_strings::USER_CANCELLED) || is(error_strings::USER_CANCELLED_CODE) {
        return BaseException::user_cancel();
    }

    if is(error_strings::ILLEGAL_ARGUMENT_ERROR_CODE) {
        return BaseException::argument(
            error_strings::BROKER_TOKEN_REQUEST_OPERATION_NAME,
            None,
            message,
        );
    }

    if non_empty(broker_result.http_response_headers.as_deref()).is_some()
        || non_empty(broker_result.http_response_body.as_deref()).is_some()
    {
        return BaseException::service(error_code, message, service_details(broker_result));
    }

    BaseException::new(ExceptionKind::Client, error_code, message)
}

fn intune_exception(
    broker_result: &BrokerResult,
    error_code: String,
    message: Option<String>,
) -> BaseException {
    BaseException::new(
        ExceptionKind::IntuneAppProtectionPolicyRequired {
            service: service_details(broker_result),
            account_upn: broker_result.user_name.clone(),
            account_user_id: broker_result.local_account_id.clone(),
            tenant_id: broker_result.tenant_id.clone(),
            authority_url: broker_result.authority.clone(),
        },
        error_code,
        message,
    )
}

/// HTTP data of a service failure. Unreadable header or body JSON is logged
/// and left out; it never hides the failure itself.
fn service_details(broker_result: &BrokerResult) -> ServiceDetails {
    let mut details = ServiceDetails::new(
        broker_result.sub_error_code.clone(),
        broker_result.http_status_code,
    );

    if let Some(body) = non_empty(broker_result.http_response_body.as_deref()) {
        match serde_json::from_str::<HashMap<String, serde_json::Value>>(body) {
            Ok(fields) => {
                details.http_response_body = fields
                    .into_iter()
                    .map(|(k, v)| match v {
                        serde_json::Value::String(s) => (k, s),
                        other => (k, other.to_string()),
                    })
                    .collect();
            }
            Err(e) => warn!("Failed to deserialize http response body: {}", e),
        }
    }

    if let Some(headers) = non_empty(broker_result.http_response_headers.as_deref()) {
        match serde_json::from_str(headers) {
            Ok(headers) => details.http_response_headers = headers,
            Err(e) => warn!("Failed to deserialize http response headers: {}", e),
        }
    }

    details
}

fn surface_capability_gap(exception: BaseException) -> BaseException {
    if exception.error_code() != error_strings::DEVICE_CODE_FLOW_NOT_SUPPORTED
        || exception.exception_type() == ExceptionType::Client
    {
        return exception;
    }

    warn!("Broker does not support device code flow");
    let mut client = BaseException::new(
        ExceptionKind::Client,
        exception.error_code(),
        exception.message().map(str::to_string),
    );
    client.set_correlation_id(exception.correlation_id().map(str::to_string));
    client
}

fn put_json_payload<T: Serialize + ?Sized>(
    bundle: &mut Bundle,
    payload: &T,
    plain_key: &str,
    compressed_key: &str,
    negotiated_protocol_version: Option<&str>,
) -> Result<()> {
    let json = to_json(payload)?;

    if can_compress_broker_payloads(negotiated_protocol_version) {
        match gzip::compress_string(&json) {
            Ok(compressed) => {
                debug!(
                    "Compressed broker payload from {} to {} bytes",
                    json.len(),
                    compressed.len()
                );
                bundle.put_bytes(compressed_key, compressed);
                return Ok(());
            }
            Err(e) => warn!("Failed to compress broker payload, sending it as a string: {}", e),
        }
    }

    bundle.put_string(plain_key, json);
    Ok(())
}

/// Payload stored under `compressed_key` or `plain_key`, `None` when both
/// are absent or empty.
fn read_payload(
    bundle: &Bundle,
    plain_key: &str,
    compressed_key: &str,
) -> std::io::Result<Option<String>> {
    let json = match bundle.get_bytes(compressed_key) {
        Some(compressed) => {
            debug!("Broker payload is compressed");
            gzip::decompress_bytes_to_string(compressed)?
        }
        None => bundle.get_string(plain_key).unwrap_or_default().to_string(),
    };
    Ok(Some(json).filter(|j| !j.is_empty()))
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| StoreError::from(e).into())
}

fn json_if_not_empty<V: Serialize>(map: &HashMap<String, V>) -> Result<Option<String>> {
    if map.is_empty() {
        return Ok(None);
    }
    to_json(map).map(Some)
}

fn epoch_or_zero(value: Option<&str>) -> i64 {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(0)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

fn invalid_broker_bundle(message: &str) -> BaseException {
    BaseException::client(client_codes::INVALID_BROKER_BUNDLE, message)
}

fn unsupported_broker_version() -> BaseException {
    BaseException::client(
        error_strings::UNSUPPORTED_BROKER_VERSION_ERROR_CODE,
        error_strings::UNSUPPORTED_BROKER_VERSION_ERROR_MESSAGE,
    )
}
