use serde::{Deserialize, Serialize};

use crate::credential::{AccessTokenRecord, IdTokenRecord, RefreshTokenRecord};

/// Authority type for the Microsoft STS (multi resource refresh tokens)
pub const AUTHORITY_TYPE_MS_STS: &str = "MSSTS";

/// One tenant profile of an account.
///
/// `(home_account_id, environment, realm)` identifies the tenant profile,
/// `(home_account_id, environment)` identifies the account across tenants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub home_account_id: String,
    pub environment: String,
    pub realm: String,
    pub local_account_id: String,
    /// Display value; can change between sign-ins
    pub username: String,
    pub authority_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternative_account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub middle_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_info: Option<String>,
}

impl AccountRecord {
    /// Object id half of `<uid>.<utid>`
    pub fn uid(&self) -> Option<&str> {
        self.home_account_id
            .split_once('.')
            .map(|(uid, _)| uid)
            .filter(|uid| !uid.is_empty())
    }

    /// Home tenant half of `<uid>.<utid>`
    pub fn utid(&self) -> Option<&str> {
        self.home_account_id
            .split_once('.')
            .map(|(_, utid)| utid)
            .filter(|utid| !utid.is_empty())
    }

    pub fn is_same_account(&self, other: &AccountRecord) -> bool {
        self.home_account_id.eq_ignore_ascii_case(&other.home_account_id)
            && self.environment.eq_ignore_ascii_case(&other.environment)
    }

    pub fn is_same_tenant_profile(&self, other: &AccountRecord) -> bool {
        self.is_same_account(other) && self.realm.eq_ignore_ascii_case(&other.realm)
    }

    pub fn is_multi_resource_capable(&self) -> bool {
        self.authority_type == AUTHORITY_TYPE_MS_STS
    }
}

/// One account plus the credentials resolved for it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub account: AccountRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<AccessTokenRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<RefreshTokenRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<IdTokenRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v1_id_token: Option<IdTokenRecord>,
}

impl CacheRecord {
    pub fn new(account: AccountRecord) -> Self {
        Self {
            account,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> AccountRecord {
        AccountRecord {
            home_account_id: "uid-1.utid-1".to_string(),
            environment: "login.microsoftonline.com".to_string(),
            realm: "utid-1".to_string(),
            local_account_id: "uid-1".to_string(),
            username: "user@contoso.com".to_string(),
            authority_type: AUTHORITY_TYPE_MS_STS.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_uid_and_utid() {
        let account = account();
        assert_eq!(account.uid(), Some("uid-1"));
        assert_eq!(account.utid(), Some("utid-1"));

        let no_dot = AccountRecord {
            home_account_id: "opaque".to_string(),
            ..Default::default()
        };
        assert_eq!(no_dot.uid(), None);
    }

    #[test]
    fn test_tenant_profile_identity() {
        let home = account();
        let mut guest = account();
        guest.realm = "other-tenant".to_string();
        guest.username = "renamed@contoso.com".to_string();

        assert!(home.is_same_account(&guest));
        assert!(!home.is_same_tenant_profile(&guest));
    }

    #[test]
    fn test_name_fields_are_independent() {
        let json = r#"{
            "home_account_id": "a.b",
            "environment": "env",
            "realm": "b",
            "local_account_id": "a",
            "username": "u",
            "authority_type": "MSSTS",
            "family_name": "Family",
            "middle_name": "Middle"
        }"#;
        let record: AccountRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.family_name.as_deref(), Some("Family"));
        assert_eq!(record.middle_name.as_deref(), Some("Middle"));
        assert!(record.is_multi_resource_capable());
    }
}
