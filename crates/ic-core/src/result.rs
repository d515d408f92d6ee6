use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::account::{AccountRecord, CacheRecord};
use crate::credential::{AccessTokenRecord, IdTokenRecord};
use crate::errors::{client_codes, BaseException, RecordError, Result};

/// SDK that requested the token; decides which id token is surfaced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SdkType {
    #[default]
    Msal,
    Adal,
    Unknown,
}

/// Read surface of a successful token acquisition
pub trait AuthenticationResult: Send + Sync {
    fn access_token(&self) -> &str;
    fn expires_on(&self) -> DateTime<Utc>;
    fn tenant_id(&self) -> Option<&str>;
    fn unique_id(&self) -> &str;
    fn refresh_token(&self) -> Option<&str>;
    fn id_token(&self) -> Option<&str>;
    fn scope(&self) -> &[String];
    fn account_record(&self) -> &AccountRecord;
    fn access_token_record(&self) -> &AccessTokenRecord;
    /// The authorized record first, then the other tenant profiles
    fn cache_record_with_tenant_profile_data(&self) -> &[CacheRecord];
    fn family_id(&self) -> Option<&str>;
    fn spe_ring(&self) -> Option<&str>;
    fn refresh_token_age(&self) -> Option<&str>;
    fn correlation_id(&self) -> Option<&str>;
    fn is_serviced_from_cache(&self) -> bool;
}

/// Token acquisition result assembled from cache records
#[derive(Debug, Clone)]
pub struct LocalAuthenticationResult {
    cache_record: CacheRecord,
    tenant_profile_records: Vec<CacheRecord>,
    access_token_record: AccessTokenRecord,
    expires_on: DateTime<Utc>,
    refresh_token: Option<String>,
    id_token: Option<String>,
    scope: Vec<String>,
    sdk_type: SdkType,
    serviced_from_cache: bool,
    family_id: Option<String>,
    spe_ring: Option<String>,
    refresh_token_age: Option<String>,
    correlation_id: Option<String>,
}

impl LocalAuthenticationResult {
    /// Build a result from the authorized record and every tenant profile record.
    ///
    /// Fails with `tokens_missing` when the record has no access token and with
    /// `data_malformed` when `expires_on` is absent or not numeric.
    pub fn new(
        last_authorized: CacheRecord,
        tenant_profile_records: Vec<CacheRecord>,
        sdk_type: SdkType,
        serviced_from_cache: bool,
    ) -> Result<Self> {
        let access_token_record = last_authorized.access_token.clone().ok_or_else(|| {
            BaseException::client(
                client_codes::TOKENS_MISSING,
                "Cache record does not contain an access token",
            )
        })?;

        let expires_on_seconds = access_token_record
            .credential
            .expires_on_seconds()?
            .ok_or(RecordError::MissingField("expires_on"))?;
        let expires_on = DateTime::<Utc>::from_timestamp(expires_on_seconds, 0).ok_or_else(|| {
            RecordError::TimestampOutOfRange {
                field: "expires_on",
                value: expires_on_seconds.to_string(),
            }
        })?;

        let id_token = select_id_token(&last_authorized, sdk_type).map(|t| t.credential.secret.clone());
        let refresh_token = last_authorized
            .refresh_token
            .as_ref()
            .map(|rt| rt.credential.secret.clone());
        let family_id = last_authorized
            .refresh_token
            .as_ref()
            .and_then(|rt| rt.family_id.clone());
        let scope = access_token_record.scopes();

        Ok(Self {
            cache_record: last_authorized,
            tenant_profile_records,
            access_token_record,
            expires_on,
            refresh_token,
            id_token,
            scope,
            sdk_type,
            serviced_from_cache,
            family_id,
            spe_ring: None,
            refresh_token_age: None,
            correlation_id: None,
        })
    }

    pub fn with_family_id(mut self, family_id: Option<String>) -> Self {
        if family_id.is_some() {
            self.family_id = family_id;
        }
        self
    }

    pub fn with_spe_ring(mut self, spe_ring: Option<String>) -> Self {
        self.spe_ring = spe_ring;
        self
    }

    pub fn with_refresh_token_age(mut self, refresh_token_age: Option<String>) -> Self {
        self.refresh_token_age = refresh_token_age;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn sdk_type(&self) -> SdkType {
        self.sdk_type
    }

    pub fn cache_record(&self) -> &CacheRecord {
        &self.cache_record
    }
}

/// ADAL always gets the v1 id token. Everyone else gets v2 when present,
/// v1 otherwise.
fn select_id_token(record: &CacheRecord, sdk_type: SdkType) -> Option<&IdTokenRecord> {
    match sdk_type {
        SdkType::Adal => record.v1_id_token.as_ref(),
        _ => record.id_token.as_ref().or(record.v1_id_token.as_ref()),
    }
}

impl AuthenticationResult for LocalAuthenticationResult {
    fn access_token(&self) -> &str {
        &self.access_token_record.credential.secret
    }

    fn expires_on(&self) -> DateTime<Utc> {
        self.expires_on
    }

    fn tenant_id(&self) -> Option<&str> {
        Some(self.access_token_record.realm.as_str()).filter(|r| !r.is_empty())
    }

    fn unique_id(&self) -> &str {
        &self.access_token_record.credential.home_account_id
    }

    fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    fn id_token(&self) -> Option<&str> {
        self.id_token.as_deref()
    }

    fn scope(&self) -> &[String] {
        &self.scope
    }

    fn account_record(&self) -> &AccountRecord {
        &self.cache_record.account
    }

    fn access_token_record(&self) -> &AccessTokenRecord {
        &self.access_token_record
    }

    fn cache_record_with_tenant_profile_data(&self) -> &[CacheRecord] {
        &self.tenant_profile_records
    }

    fn family_id(&self) -> Option<&str> {
        self.family_id.as_deref()
    }

    fn spe_ring(&self) -> Option<&str> {
        self.spe_ring.as_deref()
    }

    fn refresh_token_age(&self) -> Option<&str> {
        self.refresh_token_age.as_deref()
    }

    fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    fn is_serviced_from_cache(&self) -> bool {
        self.serviced_from_cache
    }
}
