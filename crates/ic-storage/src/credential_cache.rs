use std::sync::Arc;

use ic_core::{
    AccessTokenRecord, AccountRecord, CacheRecord, CredentialRecord, CredentialType,
    IdTokenRecord, NameValueStore, RefreshTokenRecord, StoreResult,
};
use tracing::{debug, instrument, warn};

use crate::cache_key::{account_cache_key, credential_cache_key};

/// Credential lookup criteria. `None` matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialFilter {
    pub home_account_id: Option<String>,
    pub environment: Option<String>,
    pub credential_type: Option<CredentialType>,
    pub client_id: Option<String>,
    pub realm: Option<String>,
    /// Space separated scopes; every one must be present in the stored target
    pub target: Option<String>,
    pub family_id: Option<String>,
}

impl CredentialFilter {
    pub fn for_account(account: &AccountRecord, credential_type: CredentialType) -> Self {
        Self {
            home_account_id: Some(account.home_account_id.clone()),
            environment: Some(account.environment.clone()),
            credential_type: Some(credential_type),
            ..Default::default()
        }
    }

    pub fn matches(&self, record: &CredentialRecord) -> bool {
        let credential = record.credential();

        if !matches_ignore_case(&self.home_account_id, &credential.home_account_id)
            || !matches_ignore_case(&self.environment, &credential.environment)
            || !matches_ignore_case(&self.client_id, &credential.client_id)
        {
            return false;
        }

        if let Some(expected) = self.credential_type
            && credential.kind().ok() != Some(expected)
        {
            return false;
        }

        if let Some(realm) = &self.realm
            && !record.realm().is_some_and(|r| r.eq_ignore_ascii_case(realm))
        {
            return false;
        }

        if let Some(target) = &self.target
            && !target_contains_all(record.target().unwrap_or_default(), target)
        {
            return false;
        }

        if let Some(family_id) = &self.family_id {
            let stored = match record {
                CredentialRecord::RefreshToken(rt) => rt.family_id.as_deref(),
                CredentialRecord::PrimaryRefreshToken(prt) => prt.family_id.as_deref(),
                _ => None,
            };
            if !stored.is_some_and(|f| f.eq_ignore_ascii_case(family_id)) {
                return false;
            }
        }

        true
    }
}

fn matches_ignore_case(expected: &Option<String>, actual: &str) -> bool {
    expected
        .as_deref()
        .is_none_or(|e| e.trim().eq_ignore_ascii_case(actual.trim()))
}

fn target_contains_all(stored: &str, requested: &str) -> bool {
    let stored: Vec<String> = stored.split_whitespace().map(str::to_lowercase).collect();
    requested
        .split_whitespace()
        .all(|scope| stored.contains(&scope.to_lowercase()))
}

/// Accounts and credentials stored as JSON under their cache keys
#[derive(Clone)]
pub struct AccountCredentialCache {
    store: Arc<dyn NameValueStore>,
}

impl std::fmt::Debug for AccountCredentialCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountCredentialCache").finish_non_exhaustive()
    }
}

enum Entry {
    Account(AccountRecord),
    Credential(CredentialRecord),
}

fn parse_entry(key: &str, value: &str) -> Option<Entry> {
    let parsed: serde_json::Value = match serde_json::from_str(value) {
        Ok(v) => v,
        Err(e) => {
            warn!("Skipping unreadable cache entry {}: {}", key, e);
            return None;
        }
    };

    if parsed.get("credential_type").is_some() {
        match CredentialRecord::from_json(value) {
            Ok(record) => Some(Entry::Credential(record)),
            Err(e) => {
                warn!("Skipping malformed credential {}: {}", key, e);
                None
            }
        }
    } else if parsed.get("authority_type").is_some() {
        match serde_json::from_value(parsed) {
            Ok(account) => Some(Entry::Account(account)),
            Err(e) => {
                warn!("Skipping malformed account {}: {}", key, e);
                None
            }
        }
    } else {
        None
    }
}

impl AccountCredentialCache {
    pub fn new(store: Arc<dyn NameValueStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, account), fields(key = %account_cache_key(account)))]
    pub async fn save_account(&self, account: &AccountRecord) -> StoreResult<()> {
        let json = serde_json::to_string(account)?;
        self.store.put(&account_cache_key(account), &json).await
    }

    pub async fn save_credential(&self, credential: &CredentialRecord) -> StoreResult<()> {
        let key = credential_cache_key(credential)?;
        debug!("Saving credential {}", key);
        self.store.put(&key, &credential.to_json()?).await
    }

    pub async fn get_account(&self, cache_key: &str) -> StoreResult<Option<AccountRecord>> {
        let Some(value) = self.store.get(cache_key).await? else {
            return Ok(None);
        };
        match parse_entry(cache_key, &value) {
            Some(Entry::Account(account)) => Ok(Some(account)),
            _ => Ok(None),
        }
    }

    pub async fn get_credential(&self, cache_key: &str) -> StoreResult<Option<CredentialRecord>> {
        let Some(value) = self.store.get(cache_key).await? else {
            return Ok(None);
        };
        match parse_entry(cache_key, &value) {
            Some(Entry::Credential(record)) => Ok(Some(record)),
            _ => Ok(None),
        }
    }

    async fn entries(&self) -> StoreResult<Vec<Entry>> {
        Ok(self
            .store
            .get_all()
            .await?
            .iter()
            .filter_map(|(key, value)| parse_entry(key, value))
            .collect())
    }

    pub async fn get_accounts(&self) -> StoreResult<Vec<AccountRecord>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter_map(|e| match e {
                Entry::Account(account) => Some(account),
                Entry::Credential(_) => None,
            })
            .collect())
    }

    /// Accounts sharing `home_account_id` and `environment`, optionally one realm
    pub async fn get_accounts_filtered_by(
        &self,
        home_account_id: Option<&str>,
        environment: Option<&str>,
        realm: Option<&str>,
    ) -> StoreResult<Vec<AccountRecord>> {
        let matches = |expected: Option<&str>, actual: &str| {
            expected.is_none_or(|e| e.eq_ignore_ascii_case(actual))
        };
        Ok(self
            .get_accounts()
            .await?
            .into_iter()
            .filter(|a| {
                matches(home_account_id, &a.home_account_id)
                    && matches(environment, &a.environment)
                    && matches(realm, &a.realm)
            })
            .collect())
    }

    pub async fn get_credentials(&self) -> StoreResult<Vec<CredentialRecord>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter_map(|e| match e {
                Entry::Credential(record) => Some(record),
                Entry::Account(_) => None,
            })
            .collect())
    }

    pub async fn get_credentials_filtered_by(
        &self,
        filter: &CredentialFilter,
    ) -> StoreResult<Vec<CredentialRecord>> {
        Ok(filter_credentials(&self.get_credentials().await?, filter))
    }

    pub async fn remove_account(&self, account: &AccountRecord) -> StoreResult<bool> {
        let key = account_cache_key(account);
        let existed = self.store.get(&key).await?.is_some();
        self.store.remove(&key).await?;
        Ok(existed)
    }

    pub async fn remove_credential(&self, credential: &CredentialRecord) -> StoreResult<bool> {
        let key = credential_cache_key(credential)?;
        let existed = self.store.get(&key).await?.is_some();
        self.store.remove(&key).await?;
        Ok(existed)
    }

    pub async fn clear_all(&self) -> StoreResult<()> {
        self.store.clear().await
    }

    /// Resolve the credentials for one tenant profile of `account`.
    ///
    /// Refresh tokens of multi resource accounts (MSSTS) are matched on client
    /// only; when none exists any family refresh token of the account is used.
    #[instrument(skip(self, account), fields(account = %account_cache_key(account)))]
    pub async fn load(
        &self,
        client_id: &str,
        target: Option<&str>,
        account: &AccountRecord,
    ) -> StoreResult<CacheRecord> {
        let all = self.get_credentials().await?;
        Ok(resolve_cache_record(&all, client_id, target, account))
    }

    /// The record for `account` first, then one record per other tenant profile
    /// of the same account carrying only the account and its id tokens.
    pub async fn load_with_aggregated_account_data(
        &self,
        client_id: &str,
        target: Option<&str>,
        account: &AccountRecord,
    ) -> StoreResult<Vec<CacheRecord>> {
        let all = self.get_credentials().await?;
        let mut records = vec![resolve_cache_record(&all, client_id, target, account)];

        let profiles = self
            .get_accounts_filtered_by(
                Some(&account.home_account_id),
                Some(&account.environment),
                None,
            )
            .await?;

        for profile in profiles
            .into_iter()
            .filter(|p| !p.is_same_tenant_profile(account))
        {
            let mut record = CacheRecord::new(profile);
            let (v2, v1) = find_id_tokens(&all, client_id, &record.account);
            record.id_token = v2;
            record.v1_id_token = v1;
            records.push(record);
        }

        debug!("Loaded {} tenant profile records", records.len());
        Ok(records)
    }
}

pub fn filter_credentials(
    credentials: &[CredentialRecord],
    filter: &CredentialFilter,
) -> Vec<CredentialRecord> {
    credentials
        .iter()
        .filter(|c| filter.matches(c))
        .cloned()
        .collect()
}

fn resolve_cache_record(
    all: &[CredentialRecord],
    client_id: &str,
    target: Option<&str>,
    account: &AccountRecord,
) -> CacheRecord {
    let mut record = CacheRecord::new(account.clone());

    let at_filter = CredentialFilter {
        client_id: Some(client_id.to_string()),
        realm: Some(account.realm.clone()),
        target: target.map(str::to_string),
        // Bearer and auth-scheme tokens both qualify, the variant check below narrows it
        credential_type: None,
        ..CredentialFilter::for_account(account, CredentialType::AccessToken)
    };
    record.access_token = filter_credentials(all, &at_filter)
        .into_iter()
        .find_map(|c| match c {
            CredentialRecord::AccessToken(at)
                if at.credential.kind().is_ok_and(CredentialType::is_access_token) =>
            {
                Some(at)
            }
            _ => None,
        });

    let multi_resource = account.is_multi_resource_capable();
    let rt_filter = CredentialFilter {
        client_id: Some(client_id.to_string()),
        realm: (!multi_resource).then(|| account.realm.clone()),
        target: if multi_resource {
            None
        } else {
            target.map(str::to_string)
        },
        ..CredentialFilter::for_account(account, CredentialType::RefreshToken)
    };
    record.refresh_token = first_refresh_token(filter_credentials(all, &rt_filter))
        .or_else(|| family_refresh_token(all, account));

    let (v2, v1) = find_id_tokens(all, client_id, account);
    record.id_token = v2;
    record.v1_id_token = v1;

    record
}

fn first_refresh_token(records: Vec<CredentialRecord>) -> Option<RefreshTokenRecord> {
    records.into_iter().find_map(|c| match c {
        CredentialRecord::RefreshToken(rt) => Some(rt),
        _ => None,
    })
}

fn family_refresh_token(
    all: &[CredentialRecord],
    account: &AccountRecord,
) -> Option<RefreshTokenRecord> {
    let filter = CredentialFilter::for_account(account, CredentialType::RefreshToken);
    let found = filter_credentials(all, &filter).into_iter().find_map(|c| match c {
        CredentialRecord::RefreshToken(rt) if rt.is_family_refresh_token() => Some(rt),
        _ => None,
    });
    if found.is_some() {
        debug!("Using family refresh token for account");
    }
    found
}

fn find_id_tokens(
    all: &[CredentialRecord],
    client_id: &str,
    account: &AccountRecord,
) -> (Option<IdTokenRecord>, Option<IdTokenRecord>) {
    let find = |credential_type| {
        let filter = CredentialFilter {
            client_id: Some(client_id.to_string()),
            realm: Some(account.realm.clone()),
            ..CredentialFilter::for_account(account, credential_type)
        };
        filter_credentials(all, &filter).into_iter().find_map(|c| match c {
            CredentialRecord::IdToken(id) => Some(id),
            _ => None,
        })
    };
    (find(CredentialType::IdToken), find(CredentialType::V1IdToken))
}

/// Access token records in `records`
pub fn access_tokens(records: &[CredentialRecord]) -> Vec<&AccessTokenRecord> {
    records
        .iter()
        .filter_map(|c| match c {
            CredentialRecord::AccessToken(at) => Some(at),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ic_core::{Credential, MemoryNameValueStore, AUTHORITY_TYPE_MS_STS};

    const HOME: &str = "uid.utid";
    const ENV: &str = "login.microsoftonline.com";
    const CLIENT: &str = "client-id";

    fn account(realm: &str) -> AccountRecord {
        AccountRecord {
            home_account_id: HOME.to_string(),
            environment: ENV.to_string(),
            realm: realm.to_string(),
            local_account_id: "uid".to_string(),
            username: "user@contoso.com".to_string(),
            authority_type: AUTHORITY_TYPE_MS_STS.to_string(),
            ..Default::default()
        }
    }

    fn at(realm: &str, target: &str, secret: &str) -> CredentialRecord {
        let mut credential = Credential::new(CredentialType::AccessToken, HOME, ENV, CLIENT, secret);
        credential.expires_on = Some("4102444800".to_string());
        CredentialRecord::AccessToken(AccessTokenRecord {
            credential,
            realm: realm.to_string(),
            target: target.to_string(),
            ..Default::default()
        })
    }

    fn rt(client_id: &str, family_id: Option<&str>) -> CredentialRecord {
        CredentialRecord::RefreshToken(RefreshTokenRecord {
            credential: Credential::new(
                CredentialType::RefreshToken,
                HOME,
                ENV,
                client_id,
                format!("rt-{}", client_id),
            ),
            family_id: family_id.map(str::to_string),
            target: "openid offline_access".to_string(),
            realm: None,
        })
    }

    fn id_token(credential_type: CredentialType, realm: &str) -> CredentialRecord {
        CredentialRecord::IdToken(IdTokenRecord {
            credential: Credential::new(credential_type, HOME, ENV, CLIENT, format!("id-{}", realm)),
            realm: realm.to_string(),
            authority: None,
        })
    }

    fn cache() -> AccountCredentialCache {
        AccountCredentialCache::new(Arc::new(MemoryNameValueStore::new()))
    }

    #[tokio::test]
    async fn test_save_and_list() {
        let cache = cache();
        cache.save_account(&account("utid")).await.unwrap();
        cache.save_credential(&at("utid", "User.Read", "at")).await.unwrap();
        cache.save_credential(&rt(CLIENT, None)).await.unwrap();

        assert_eq!(cache.get_accounts().await.unwrap().len(), 1);
        assert_eq!(cache.get_credentials().await.unwrap().len(), 2);

        let filter = CredentialFilter {
            credential_type: Some(CredentialType::RefreshToken),
            ..Default::default()
        };
        assert_eq!(cache.get_credentials_filtered_by(&filter).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_same_key_supersedes() {
        let cache = cache();
        cache.save_credential(&at("utid", "User.Read", "old")).await.unwrap();
        cache.save_credential(&at("utid", "User.Read", "new")).await.unwrap();

        let all = cache.get_credentials().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].credential().secret, "new");
    }

    #[tokio::test]
    async fn test_load_resolves_record() {
        let cache = cache();
        let account = account("utid");
        cache.save_account(&account).await.unwrap();
        cache.save_credential(&at("utid", "User.Read openid", "at")).await.unwrap();
        cache.save_credential(&at("other", "User.Read", "guest-at")).await.unwrap();
        cache.save_credential(&rt(CLIENT, None)).await.unwrap();
        cache.save_credential(&id_token(CredentialType::IdToken, "utid")).await.unwrap();
        cache.save_credential(&id_token(CredentialType::V1IdToken, "utid")).await.unwrap();

        let record = cache.load(CLIENT, Some("user.read"), &account).await.unwrap();
        assert_eq!(record.access_token.unwrap().credential.secret, "at");
        assert_eq!(record.refresh_token.unwrap().credential.secret, "rt-client-id");
        assert_eq!(record.id_token.unwrap().credential.secret, "id-utid");
        assert!(record.v1_id_token.is_some());
    }

    #[tokio::test]
    async fn test_load_returns_auth_scheme_access_token() {
        let cache = cache();
        let account = account("utid");
        let mut credential = Credential::new(
            CredentialType::AccessTokenWithAuthScheme,
            HOME,
            ENV,
            CLIENT,
            "pop-at",
        );
        credential.expires_on = Some("4102444800".to_string());
        cache
            .save_credential(&CredentialRecord::AccessToken(AccessTokenRecord {
                credential,
                realm: "utid".to_string(),
                target: "User.Read".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap();

        let record = cache.load(CLIENT, Some("User.Read"), &account).await.unwrap();
        let access_token = record.access_token.unwrap();
        assert_eq!(access_token.credential.secret, "pop-at");
        assert!(matches!(
            access_token.credential.kind(),
            Ok(CredentialType::AccessTokenWithAuthScheme)
        ));
    }

    #[tokio::test]
    async fn test_load_falls_back_to_family_refresh_token() {
        let cache = cache();
        let account = account("utid");
        cache.save_credential(&rt("other-app", Some("1"))).await.unwrap();

        let record = cache.load(CLIENT, None, &account).await.unwrap();
        let refresh_token = record.refresh_token.unwrap();
        assert_eq!(refresh_token.family_id.as_deref(), Some("1"));
        assert!(record.access_token.is_none());
    }

    #[tokio::test]
    async fn test_aggregated_tenant_profiles() {
        let cache = cache();
        let home = account("utid");
        let guest = account("guest-tenant");
        cache.save_account(&home).await.unwrap();
        cache.save_account(&guest).await.unwrap();
        cache.save_credential(&at("utid", "User.Read", "at")).await.unwrap();
        cache.save_credential(&id_token(CredentialType::IdToken, "guest-tenant")).await.unwrap();

        let records = cache
            .load_with_aggregated_account_data(CLIENT, Some("User.Read"), &home)
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].account.realm, "utid");
        assert!(records[0].access_token.is_some());
        assert_eq!(records[1].account.realm, "guest-tenant");
        assert!(records[1].access_token.is_none());
        assert_eq!(
            records[1].id_token.as_ref().unwrap().credential.secret,
            "id-guest-tenant"
        );
    }

    #[tokio::test]
    async fn test_remove() {
        let cache = cache();
        let account = account("utid");
        let token = at("utid", "User.Read", "at");
        cache.save_account(&account).await.unwrap();
        cache.save_credential(&token).await.unwrap();

        assert!(cache.remove_credential(&token).await.unwrap());
        assert!(!cache.remove_credential(&token).await.unwrap());
        assert!(cache.remove_account(&account).await.unwrap());
        assert!(cache.get_accounts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_entries_are_skipped() {
        let store = Arc::new(MemoryNameValueStore::new());
        store.put("garbage", "not json").await.unwrap();
        store
            .put("bad-cred", r#"{"credential_type":"Cookie","secret":"x"}"#)
            .await
            .unwrap();
        let cache = AccountCredentialCache::new(store);
        cache.save_account(&account("utid")).await.unwrap();

        assert_eq!(cache.get_accounts().await.unwrap().len(), 1);
        assert!(cache.get_credentials().await.unwrap().is_empty());
    }

    #[test]
    fn test_access_tokens_helper() {
        let records = vec![at("utid", "a", "1"), rt(CLIENT, None), at("utid", "b", "2")];
        assert_eq!(access_tokens(&records).len(), 2);
    }
}
