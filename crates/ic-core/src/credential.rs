use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::RecordError;

/// Kinds of credential held in the token cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CredentialType {
    AccessToken,
    #[serde(rename = "AccessToken_With_AuthScheme")]
    AccessTokenWithAuthScheme,
    RefreshToken,
    IdToken,
    V1IdToken,
    PrimaryRefreshToken,
}

impl CredentialType {
    const ALL: [CredentialType; 6] = [
        Self::AccessToken,
        Self::AccessTokenWithAuthScheme,
        Self::RefreshToken,
        Self::IdToken,
        Self::V1IdToken,
        Self::PrimaryRefreshToken,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AccessToken => "AccessToken",
            Self::AccessTokenWithAuthScheme => "AccessToken_With_AuthScheme",
            Self::RefreshToken => "RefreshToken",
            Self::IdToken => "IdToken",
            Self::V1IdToken => "V1IdToken",
            Self::PrimaryRefreshToken => "PrimaryRefreshToken",
        }
    }

    /// Case-insensitive lookup by serialized name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(name.trim()))
    }

    pub fn is_access_token(self) -> bool {
        matches!(self, Self::AccessToken | Self::AccessTokenWithAuthScheme)
    }

    pub fn is_id_token(self) -> bool {
        matches!(self, Self::IdToken | Self::V1IdToken)
    }
}

/// Parse an epoch-seconds field strictly. Non numeric input is an error,
/// never treated as expired or unexpired.
pub fn parse_epoch_seconds(field: &'static str, value: &str) -> Result<i64, RecordError> {
    value
        .trim()
        .parse::<i64>()
        .map_err(|source| RecordError::InvalidTimestamp {
            field,
            value: value.to_string(),
            source,
        })
}

/// Strict "instant is before now" check on an epoch-seconds field
fn is_before_now(field: &'static str, value: &str) -> Result<bool, RecordError> {
    let seconds = parse_epoch_seconds(field, value)?;
    let instant = DateTime::<Utc>::from_timestamp(seconds, 0).ok_or_else(|| {
        RecordError::TimestampOutOfRange {
            field,
            value: value.to_string(),
        }
    })?;
    Ok(instant < Utc::now())
}

/// Fields shared by every credential kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub home_account_id: String,
    pub environment: String,
    pub credential_type: String,
    pub client_id: String,
    pub secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_on: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_info: Option<String>,
}

impl Credential {
    pub fn new(
        credential_type: CredentialType,
        home_account_id: impl Into<String>,
        environment: impl Into<String>,
        client_id: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            home_account_id: home_account_id.into(),
            environment: environment.into(),
            credential_type: credential_type.as_str().to_string(),
            client_id: client_id.into(),
            secret: secret.into(),
            ..Default::default()
        }
    }

    pub fn kind(&self) -> Result<CredentialType, RecordError> {
        CredentialType::from_name(&self.credential_type)
            .ok_or_else(|| RecordError::UnknownCredentialType(self.credential_type.clone()))
    }

    /// A credential without a secret cannot be used for anything
    pub fn is_usable(&self) -> bool {
        !self.secret.is_empty()
    }

    pub fn expires_on_seconds(&self) -> Result<Option<i64>, RecordError> {
        self.expires_on
            .as_deref()
            .filter(|v| !v.is_empty())
            .map(|v| parse_epoch_seconds("expires_on", v))
            .transpose()
    }

    pub fn cached_at_seconds(&self) -> Result<Option<i64>, RecordError> {
        self.cached_at
            .as_deref()
            .filter(|v| !v.is_empty())
            .map(|v| parse_epoch_seconds("cached_at", v))
            .transpose()
    }
}

/// Access token cache entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenRecord {
    #[serde(flatten)]
    pub credential: Credential,
    #[serde(default)]
    pub realm: String,
    #[serde(default)]
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authority: Option<String>,
    #[serde(default, alias = "access_token_type", skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_expires_on: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_on: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_claims: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_identifier: Option<String>,
}

impl AccessTokenRecord {
    /// Expired once `expires_on` lies strictly before the current instant.
    /// A missing or non numeric `expires_on` is an error.
    pub fn is_expired(&self) -> Result<bool, RecordError> {
        let expires_on = self
            .credential
            .expires_on
            .as_deref()
            .filter(|v| !v.is_empty())
            .ok_or(RecordError::MissingField("expires_on"))?;
        is_before_now("expires_on", expires_on)
    }

    pub fn is_extended_expired(&self) -> Result<bool, RecordError> {
        match self.extended_expires_on.as_deref().filter(|v| !v.is_empty()) {
            Some(value) => is_before_now("extended_expires_on", value),
            None => Ok(false),
        }
    }

    /// Proactive refresh hint from the server
    pub fn should_refresh(&self) -> Result<bool, RecordError> {
        match self.refresh_on.as_deref().filter(|v| !v.is_empty()) {
            Some(value) => is_before_now("refresh_on", value),
            None => Ok(false),
        }
    }

    /// Scopes from `target`
    pub fn scopes(&self) -> Vec<String> {
        self.target.split_whitespace().map(str::to_string).collect()
    }
}

/// Refresh token cache entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    #[serde(flatten)]
    pub credential: Credential,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_id: Option<String>,
    #[serde(default)]
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,
}

impl RefreshTokenRecord {
    /// Refresh tokens are never expired locally; the server decides.
    pub fn is_expired(&self) -> Result<bool, RecordError> {
        Ok(false)
    }

    pub fn is_family_refresh_token(&self) -> bool {
        self.family_id.as_deref().is_some_and(|f| !f.is_empty())
    }
}

/// Id token cache entry, v1 or v2 depending on `credential_type`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdTokenRecord {
    #[serde(flatten)]
    pub credential: Credential,
    #[serde(default)]
    pub realm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authority: Option<String>,
}

/// Device bound primary refresh token entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryRefreshTokenRecord {
    #[serde(flatten)]
    pub credential: Credential,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key_rolling_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prt_protocol_version: Option<String>,
}

impl PrimaryRefreshTokenRecord {
    /// PRT validity is decided by the server.
    pub fn is_expired(&self) -> Result<bool, RecordError> {
        Ok(false)
    }
}

/// Any cached credential, discriminated by `credential_type`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialRecord {
    AccessToken(AccessTokenRecord),
    RefreshToken(RefreshTokenRecord),
    IdToken(IdTokenRecord),
    PrimaryRefreshToken(PrimaryRefreshTokenRecord),
}

impl CredentialRecord {
    pub fn credential(&self) -> &Credential {
        match self {
            Self::AccessToken(r) => &r.credential,
            Self::RefreshToken(r) => &r.credential,
            Self::IdToken(r) => &r.credential,
            Self::PrimaryRefreshToken(r) => &r.credential,
        }
    }

    pub fn credential_type(&self) -> Result<CredentialType, RecordError> {
        self.credential().kind()
    }

    pub fn realm(&self) -> Option<&str> {
        match self {
            Self::AccessToken(r) => Some(r.realm.as_str()),
            Self::RefreshToken(r) => r.realm.as_deref(),
            Self::IdToken(r) => Some(r.realm.as_str()),
            Self::PrimaryRefreshToken(r) => r.realm.as_deref(),
        }
    }

    pub fn target(&self) -> Option<&str> {
        match self {
            Self::AccessToken(r) => Some(r.target.as_str()),
            Self::RefreshToken(r) => Some(r.target.as_str()),
            Self::IdToken(_) => None,
            Self::PrimaryRefreshToken(r) => r.target.as_deref(),
        }
    }

    pub fn is_expired(&self) -> Result<bool, RecordError> {
        match self {
            Self::AccessToken(r) => r.is_expired(),
            Self::RefreshToken(r) => r.is_expired(),
            Self::IdToken(_) => Ok(false),
            Self::PrimaryRefreshToken(r) => r.is_expired(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        match self {
            Self::AccessToken(r) => serde_json::to_string(r),
            Self::RefreshToken(r) => serde_json::to_string(r),
            Self::IdToken(r) => serde_json::to_string(r),
            Self::PrimaryRefreshToken(r) => serde_json::to_string(r),
        }
    }

    /// Parse a stored credential, picking the record shape from `credential_type`
    pub fn from_json(json: &str) -> Result<Self, crate::errors::StoreError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let type_name = value
            .get("credential_type")
            .and_then(|v| v.as_str())
            .ok_or(RecordError::MissingField("credential_type"))?;
        let credential_type = CredentialType::from_name(type_name)
            .ok_or_else(|| RecordError::UnknownCredentialType(type_name.to_string()))?;

        let record = match credential_type {
            CredentialType::AccessToken | CredentialType::AccessTokenWithAuthScheme => {
                Self::AccessToken(serde_json::from_value(value)?)
            }
            CredentialType::RefreshToken => Self::RefreshToken(serde_json::from_value(value)?),
            CredentialType::IdToken | CredentialType::V1IdToken => {
                Self::IdToken(serde_json::from_value(value)?)
            }
            CredentialType::PrimaryRefreshToken => {
                Self::PrimaryRefreshToken(serde_json::from_value(value)?)
            }
        };
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access_token(expires_on: &str) -> AccessTokenRecord {
        let mut credential = Credential::new(
            CredentialType::AccessToken,
            "uid.utid",
            "login.microsoftonline.com",
            "client-id",
            "at-secret",
        );
        credential.expires_on = Some(expires_on.to_string());
        AccessTokenRecord {
            credential,
            realm: "utid".to_string(),
            target: "User.Read openid".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_access_token_expiry_boundary() {
        let now = Utc::now().timestamp();
        assert!(access_token(&(now - 1).to_string()).is_expired().unwrap());
        assert!(!access_token(&(now + 3600).to_string()).is_expired().unwrap());
    }

    #[test]
    fn test_non_numeric_expiry_is_an_error() {
        let result = access_token("tomorrow").is_expired();
        assert!(matches!(
            result,
            Err(RecordError::InvalidTimestamp { field: "expires_on", .. })
        ));
    }

    #[test]
    fn test_missing_expiry_is_an_error() {
        let mut at = access_token("0");
        at.credential.expires_on = None;
        assert!(matches!(at.is_expired(), Err(RecordError::MissingField("expires_on"))));
    }

    #[test]
    fn test_refresh_token_never_expires() {
        let mut credential = Credential::new(
            CredentialType::RefreshToken,
            "uid.utid",
            "login.microsoftonline.com",
            "client-id",
            "rt-secret",
        );
        credential.expires_on = Some("1".to_string());
        let rt = RefreshTokenRecord {
            credential,
            ..Default::default()
        };
        assert!(!rt.is_expired().unwrap());

        let prt = PrimaryRefreshTokenRecord::default();
        assert!(!prt.is_expired().unwrap());
    }

    #[test]
    fn test_should_refresh_uses_refresh_on() {
        let now = Utc::now().timestamp();
        let mut at = access_token(&(now + 3600).to_string());
        assert!(!at.should_refresh().unwrap());
        at.refresh_on = Some((now - 10).to_string());
        assert!(at.should_refresh().unwrap());
        at.refresh_on = Some(String::new());
        assert!(!at.should_refresh().unwrap());
    }

    #[test]
    fn test_credential_record_json_dispatch() {
        let json = r#"{
            "home_account_id": "uid.utid",
            "environment": "login.microsoftonline.com",
            "credential_type": "accesstoken",
            "client_id": "client-id",
            "secret": "at",
            "expires_on": "100",
            "realm": "utid",
            "target": "openid",
            "access_token_type": "Bearer"
        }"#;
        let record = CredentialRecord::from_json(json).unwrap();
        match &record {
            CredentialRecord::AccessToken(at) => {
                assert_eq!(at.token_type.as_deref(), Some("Bearer"));
                assert_eq!(at.realm, "utid");
            }
            other => panic!("unexpected record {:?}", other),
        }
        assert_eq!(record.credential_type().unwrap(), CredentialType::AccessToken);

        let bad = r#"{"credential_type": "Cookie", "secret": "x"}"#;
        assert!(CredentialRecord::from_json(bad).is_err());
    }

    #[test]
    fn test_usable_requires_secret() {
        let mut credential = Credential::default();
        assert!(!credential.is_usable());
        credential.secret = "s".to_string();
        assert!(credential.is_usable());
    }
}
