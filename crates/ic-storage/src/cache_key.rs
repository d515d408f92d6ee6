use ic_core::{AccountRecord, CredentialRecord, CredentialType, RecordError};

const SEPARATOR: &str = "-";
const FOCI_PREFIX: &str = "foci-";

fn sanitize(value: &str) -> String {
    value.trim().to_lowercase()
}

/// `<home_account_id>-<environment>-<realm>`
pub fn account_cache_key(account: &AccountRecord) -> String {
    [
        account.home_account_id.as_str(),
        account.environment.as_str(),
        account.realm.as_str(),
    ]
    .map(sanitize)
    .join(SEPARATOR)
}

/// `<home_account_id>-<environment>-<credential_type>-<client_id>-<realm>-<target>`
///
/// Family refresh tokens are keyed by family id instead of client id so every
/// family member finds the same entry. Refresh tokens are not scoped to a realm,
/// id tokens are not scoped to a target, and PRTs to neither.
pub fn credential_cache_key(record: &CredentialRecord) -> Result<String, RecordError> {
    let credential = record.credential();
    let credential_type = credential.kind()?;

    let client_id = match record {
        CredentialRecord::RefreshToken(rt) if rt.is_family_refresh_token() => {
            let family_id = rt.family_id.as_deref().unwrap_or_default().trim();
            family_id
                .strip_prefix(FOCI_PREFIX)
                .unwrap_or(family_id)
                .to_string()
        }
        _ => credential.client_id.clone(),
    };

    let (realm, target) = match record {
        CredentialRecord::AccessToken(at) => (at.realm.as_str(), at.target.as_str()),
        CredentialRecord::RefreshToken(rt) => ("", rt.target.as_str()),
        CredentialRecord::IdToken(id) => (id.realm.as_str(), ""),
        CredentialRecord::PrimaryRefreshToken(_) => ("", ""),
    };

    let mut key = [
        credential.home_account_id.as_str(),
        credential.environment.as_str(),
        credential_type.as_str(),
        client_id.as_str(),
        realm,
        target,
    ]
    .map(sanitize)
    .join(SEPARATOR);

    if let CredentialRecord::AccessToken(at) = record {
        if let Some(app_id) = at.application_identifier.as_deref().filter(|a| !a.is_empty()) {
            key.push_str(SEPARATOR);
            key.push_str(&sanitize(app_id));
        }
        if credential_type == CredentialType::AccessTokenWithAuthScheme
            && let Some(kid) = at.kid.as_deref().filter(|k| !k.is_empty())
        {
            key.push_str(SEPARATOR);
            key.push_str(&sanitize(kid));
        }
    }

    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ic_core::{AccessTokenRecord, Credential, IdTokenRecord, RefreshTokenRecord};

    const HOME: &str = "UID.UTID";
    const ENV: &str = "login.microsoftonline.com";

    #[test]
    fn test_account_key_is_lowercase() {
        let account = AccountRecord {
            home_account_id: HOME.to_string(),
            environment: ENV.to_string(),
            realm: " UTID ".to_string(),
            ..Default::default()
        };
        assert_eq!(account_cache_key(&account), "uid.utid-login.microsoftonline.com-utid");
    }

    #[test]
    fn test_access_token_key() {
        let record = CredentialRecord::AccessToken(AccessTokenRecord {
            credential: Credential::new(CredentialType::AccessToken, HOME, ENV, "Client", "s"),
            realm: "utid".to_string(),
            target: "User.Read openid".to_string(),
            application_identifier: Some("app/sig".to_string()),
            ..Default::default()
        });
        assert_eq!(
            credential_cache_key(&record).unwrap(),
            "uid.utid-login.microsoftonline.com-accesstoken-client-utid-user.read openid-app/sig"
        );
    }

    #[test]
    fn test_family_refresh_token_key_uses_family_id() {
        let record = CredentialRecord::RefreshToken(RefreshTokenRecord {
            credential: Credential::new(CredentialType::RefreshToken, HOME, ENV, "client", "s"),
            family_id: Some("foci-1".to_string()),
            target: "openid".to_string(),
            realm: Some("utid".to_string()),
        });
        assert_eq!(
            credential_cache_key(&record).unwrap(),
            "uid.utid-login.microsoftonline.com-refreshtoken-1--openid"
        );
    }

    #[test]
    fn test_id_token_key_has_no_target() {
        let record = CredentialRecord::IdToken(IdTokenRecord {
            credential: Credential::new(CredentialType::V1IdToken, HOME, ENV, "client", "s"),
            realm: "utid".to_string(),
            authority: None,
        });
        assert_eq!(
            credential_cache_key(&record).unwrap(),
            "uid.utid-login.microsoftonline.com-v1idtoken-client-utid-"
        );
    }

    #[test]
    fn test_unknown_credential_type() {
        let mut credential = Credential::new(CredentialType::IdToken, HOME, ENV, "client", "s");
        credential.credential_type = "Cookie".to_string();
        let record = CredentialRecord::IdToken(IdTokenRecord {
            credential,
            ..Default::default()
        });
        assert!(matches!(
            credential_cache_key(&record),
            Err(RecordError::UnknownCredentialType(_))
        ));
    }
}
