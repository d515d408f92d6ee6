use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use ic_core::{AuthenticationResult, BaseException, NameValueStore, TelemetrySettings};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::cache::LastRequestTelemetryCache;
use crate::request_telemetry::{CurrentRequestTelemetry, FailedRequest, LastRequestTelemetry};
use crate::schema::{
    self, CURRENT_REQUEST_HEADER_NAME, LAST_REQUEST_HEADER_NAME, key, value,
};

/// Correlation id placeholder used before a request context is set up
const UNSET_CORRELATION_ID: &str = "UNSET";
/// Error code recorded for cancelled commands
pub const USER_CANCEL_ERROR_CODE: &str = "user_cancel";

/// The parts of a token command telemetry needs to know about
pub trait TelemetryCommand: Send + Sync {
    fn correlation_id(&self) -> Option<&str>;

    fn is_eligible_for_ests_telemetry(&self) -> bool;

    /// False for commands answered locally, e.g. cache lookups
    fn will_reach_token_endpoint(&self) -> bool;
}

/// How a command finished
#[derive(Clone, Copy)]
pub enum CommandResult<'a> {
    /// `None` for commands that do not produce a token result
    Completed(Option<&'a dyn AuthenticationResult>),
    Error(&'a BaseException),
    Cancel,
}

impl CommandResult<'_> {
    fn error_code(&self) -> Option<&str> {
        match self {
            Self::Error(exception) => Some(exception.error_code()),
            Self::Cancel => Some(USER_CANCEL_ERROR_CODE),
            Self::Completed(_) => None,
        }
    }

    fn is_serviced_from_cache(&self) -> bool {
        matches!(self, Self::Completed(Some(result)) if result.is_serviced_from_cache())
    }
}

fn normalize_correlation_id(correlation_id: Option<&str>) -> Option<&str> {
    correlation_id.filter(|c| !c.is_empty() && *c != UNSET_CORRELATION_ID)
}

/// Whether the server received and logged the telemetry headers of this command
pub fn is_telemetry_logged_by_server(
    command: &dyn TelemetryCommand,
    result: &CommandResult<'_>,
) -> bool {
    if !command.will_reach_token_endpoint() {
        return false;
    }

    match result {
        // No headers are logged for these status codes
        CommandResult::Error(exception) => exception.service_details().is_some_and(|details| {
            let status = details.http_status_code;
            !(status == 0 || status == 429 || status >= 500)
        }),
        CommandResult::Cancel => false,
        CommandResult::Completed(Some(result)) => !result.is_serviced_from_cache(),
        CommandResult::Completed(None) => false,
    }
}

/// Collects per request telemetry and renders the ESTS telemetry headers.
///
/// One instance is shared (as `Arc`) by every command of the process. The
/// per correlation id lifecycle is `init_telemetry_for_command`, any number
/// of `emit` calls, then exactly one `flush`.
pub struct EstsTelemetry {
    settings: TelemetrySettings,
    telemetry_map: RwLock<HashMap<String, CurrentRequestTelemetry>>,
    sent_failed_requests: RwLock<HashMap<String, HashSet<FailedRequest>>>,
    last_request_cache: Option<LastRequestTelemetryCache>,
    supplemental_store: Option<Arc<dyn NameValueStore>>,
    /// Serializes read-modify-write of the persisted last request telemetry
    flush_lock: Mutex<()>,
}

impl std::fmt::Debug for EstsTelemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EstsTelemetry")
            .field("settings", &self.settings)
            .field("has_last_request_cache", &self.last_request_cache.is_some())
            .field("has_supplemental_store", &self.supplemental_store.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for EstsTelemetry {
    fn default() -> Self {
        Self::new(TelemetrySettings::default())
    }
}

impl EstsTelemetry {
    pub fn new(settings: TelemetrySettings) -> Self {
        Self {
            settings,
            telemetry_map: RwLock::new(HashMap::new()),
            sent_failed_requests: RwLock::new(HashMap::new()),
            last_request_cache: None,
            supplemental_store: None,
            flush_lock: Mutex::new(()),
        }
    }

    pub fn with_last_request_cache(mut self, cache: LastRequestTelemetryCache) -> Self {
        self.last_request_cache = Some(cache);
        self
    }

    /// Store that keeps allow-listed fields emitted while no request is active
    pub fn with_supplemental_store(mut self, store: Arc<dyn NameValueStore>) -> Self {
        self.supplemental_store = Some(store);
        self
    }

    pub fn settings(&self) -> &TelemetrySettings {
        &self.settings
    }

    /// Start collecting for `command`. Ineligible commands are ignored.
    pub fn init_telemetry_for_command(&self, command: &dyn TelemetryCommand) {
        if !command.is_eligible_for_ests_telemetry() {
            return;
        }
        let Some(correlation_id) = normalize_correlation_id(command.correlation_id()) else {
            debug!("Command has no correlation id, not collecting telemetry");
            return;
        };

        self.telemetry_map
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(correlation_id.to_string(), CurrentRequestTelemetry::new());
        self.sent_failed_requests
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(correlation_id.to_string(), HashSet::new());
    }

    /// True while telemetry is being collected for `correlation_id`
    pub fn is_tracking(&self, correlation_id: &str) -> bool {
        normalize_correlation_id(Some(correlation_id)).is_some_and(|id| {
            self.telemetry_map
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(id)
        })
    }

    /// Record one field for the request `correlation_id`.
    ///
    /// Without an active request the field goes to the supplemental store if
    /// it is allow-listed there, and is dropped otherwise.
    pub async fn emit(&self, correlation_id: Option<&str>, key: &str, value: Option<&str>) {
        if key.is_empty() {
            return;
        }
        let compliant = schema::schema_compliant_string(value);

        if let Some(id) = normalize_correlation_id(correlation_id) {
            let mut map = self
                .telemetry_map
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(current) = map.get_mut(id) {
                current.put(key, &compliant);
                return;
            }
        }

        self.emit_to_supplemental_store(key, &compliant).await;
    }

    pub async fn emit_all(&self, correlation_id: Option<&str>, fields: &HashMap<String, String>) {
        for (key, value) in fields {
            self.emit(correlation_id, key, Some(value)).await;
        }
    }

    pub async fn emit_bool(&self, correlation_id: Option<&str>, key: &str, value: bool) {
        self.emit(correlation_id, key, Some(schema::schema_compliant_bool(value)))
            .await;
    }

    pub async fn emit_api_id(&self, correlation_id: Option<&str>, api_id: &str) {
        self.emit(correlation_id, key::API_ID, Some(api_id)).await;
    }

    pub async fn emit_force_refresh(&self, correlation_id: Option<&str>, force_refresh: bool) {
        self.emit_bool(correlation_id, key::FORCE_REFRESH, force_refresh)
            .await;
    }

    async fn emit_to_supplemental_store(&self, key: &str, value: &str) {
        let Some(store) = &self.supplemental_store else {
            return;
        };
        if !schema::is_offline_emit_allowed(key) {
            return;
        }
        if let Err(e) = store.put(key, value).await {
            warn!("Failed to store supplemental telemetry field {}: {}", key, e);
        }
    }

    /// Fold the finished command into the persisted last request telemetry and
    /// stop tracking it. Flushing an unknown correlation id does nothing.
    #[instrument(skip_all, fields(correlation_id = command.correlation_id().unwrap_or_default()))]
    pub async fn flush(&self, command: &dyn TelemetryCommand, result: CommandResult<'_>) {
        let Some(correlation_id) = normalize_correlation_id(command.correlation_id()) else {
            info!("Correlation id is not set. Nothing to flush.");
            return;
        };

        let _guard = self.flush_lock.lock().await;

        let current = self
            .telemetry_map
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(correlation_id);
        let sent = self
            .sent_failed_requests
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(correlation_id)
            .unwrap_or_default();

        let Some(current) = current else {
            info!("No telemetry recorded for this command. Nothing to flush.");
            return;
        };

        let mut last = match self.load_last_request_telemetry().await {
            Some(last) => last,
            None => LastRequestTelemetry::seeded_from(&current),
        }
        .with_failed_request_cap(self.settings.failed_request_cap);

        if is_telemetry_logged_by_server(command, &result) {
            // The server has the headers now; drop what it already received
            last.reset_silent_success_count();
            last.wipe_failed_requests(&sent);
            self.clear_supplemental_store().await;
        }

        if let Some(error_code) = result.error_code() {
            last.append_failed_request(FailedRequest::new(
                current.api_id().unwrap_or_default(),
                correlation_id,
                error_code,
            ));
        } else if result.is_serviced_from_cache() {
            last.increment_silent_success_count();
        }

        match &self.last_request_cache {
            Some(cache) => {
                if let Err(e) = cache.save_request_telemetry_to_cache(&last).await {
                    warn!("Failed to save last request telemetry: {}", e);
                }
            }
            None => warn!("Last request telemetry cache is not set up. Unable to save telemetry."),
        }
    }

    async fn load_last_request_telemetry(&self) -> Option<LastRequestTelemetry> {
        match &self.last_request_cache {
            Some(cache) => cache.get_request_telemetry_from_cache().await,
            None => {
                debug!("Last request telemetry cache is not set up");
                None
            }
        }
    }

    async fn clear_supplemental_store(&self) {
        if let Some(store) = &self.supplemental_store
            && let Err(e) = store.clear().await
        {
            warn!("Failed to clear supplemental telemetry: {}", e);
        }
    }

    async fn merge_supplemental_fields(&self, correlation_id: &str) {
        let Some(store) = &self.supplemental_store else {
            return;
        };
        match store.get_all().await {
            Ok(fields) => self.emit_all(Some(correlation_id), &fields).await,
            Err(e) => warn!("Failed to read supplemental telemetry: {}", e),
        }
    }

    /// Headers for the request `correlation_id`. Empty when nothing is being
    /// collected for it.
    pub async fn telemetry_headers(&self, correlation_id: Option<&str>) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        let Some(correlation_id) = normalize_correlation_id(correlation_id) else {
            return headers;
        };
        if !self.is_tracking(correlation_id) {
            return headers;
        }

        self.merge_supplemental_fields(correlation_id).await;

        match self.current_header_string(correlation_id) {
            Some(header) => {
                headers.insert(CURRENT_REQUEST_HEADER_NAME.to_string(), header);
            }
            None => debug!("Current request telemetry header is not available"),
        }
        match self.last_header_string(correlation_id).await {
            Some(header) => {
                headers.insert(LAST_REQUEST_HEADER_NAME.to_string(), header);
            }
            None => debug!("Last request telemetry header is not available"),
        }
        headers
    }

    fn current_header_string(&self, correlation_id: &str) -> Option<String> {
        self.telemetry_map
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(correlation_id)
            .map(CurrentRequestTelemetry::header_string)
    }

    async fn last_header_string(&self, correlation_id: &str) -> Option<String> {
        let Some(cache) = &self.last_request_cache else {
            warn!("Last request telemetry cache is not set up");
            return None;
        };

        // Reading the history and marking what was sent must not interleave with a flush
        let _guard = self.flush_lock.lock().await;
        let Some(cached) = cache.get_request_telemetry_from_cache().await else {
            // Nothing persisted yet: describe an empty history
            let current = self
                .telemetry_map
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(correlation_id)
                .cloned()?;
            let mut last = LastRequestTelemetry::seeded_from(&current);
            last.put_in_platform_telemetry(key::ALL_TELEMETRY_DATA_SENT, value::TRUE);
            return Some(last.header_string());
        };

        let (copy, sent) = cached.fit_to_header_limit(self.settings.header_data_limit);
        if let Some(set) = self
            .sent_failed_requests
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(correlation_id)
        {
            set.extend(sent);
        }
        Some(copy.header_string())
    }

    /// Forget every in-flight request and the persisted history
    pub async fn clear(&self) {
        self.telemetry_map
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.sent_failed_requests
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        if let Some(cache) = &self.last_request_cache
            && let Err(e) = cache.clear().await
        {
            warn!("Failed to clear last request telemetry: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::HEADER_DATA_LIMIT;
    use crate::cache::{
        LAST_TELEMETRY_HEADER_STRING_CACHE_KEY, LAST_TELEMETRY_OBJECT_CACHE_KEY,
        LAST_TELEMETRY_SCHEMA_VERSION_CACHE_KEY,
    };
    use ic_core::{
        AccessTokenRecord, AccountRecord, CacheRecord, Credential, CredentialType, ExceptionKind,
        LocalAuthenticationResult, MemoryNameValueStore, SdkType, ServiceDetails,
    };

    const CORRELATION_ID: &str = "SOME_CORRELATION_ID";
    const API_ID: &str = "API_ID";

    struct MockCommand {
        correlation_id: Option<String>,
        eligible: bool,
        reaches_token_endpoint: bool,
    }

    impl MockCommand {
        fn new(reaches_token_endpoint: bool) -> Self {
            Self {
                correlation_id: Some(CORRELATION_ID.to_string()),
                eligible: true,
                reaches_token_endpoint,
            }
        }
    }

    impl TelemetryCommand for MockCommand {
        fn correlation_id(&self) -> Option<&str> {
            self.correlation_id.as_deref()
        }

        fn is_eligible_for_ests_telemetry(&self) -> bool {
            self.eligible
        }

        fn will_reach_token_endpoint(&self) -> bool {
            self.reaches_token_endpoint
        }
    }

    fn auth_result(serviced_from_cache: bool) -> LocalAuthenticationResult {
        let mut credential =
            Credential::new(CredentialType::AccessToken, "uid.utid", "login.windows.net", "client", "at");
        credential.expires_on = Some("4102444800".to_string());
        let mut record = CacheRecord::new(AccountRecord::default());
        record.access_token = Some(AccessTokenRecord {
            credential,
            realm: "utid".to_string(),
            target: "openid".to_string(),
            ..Default::default()
        });
        LocalAuthenticationResult::new(record.clone(), vec![record], SdkType::Msal, serviced_from_cache)
            .unwrap()
    }

    fn telemetry_with_store() -> (EstsTelemetry, Arc<MemoryNameValueStore>) {
        let store = Arc::new(MemoryNameValueStore::new());
        let telemetry = EstsTelemetry::default()
            .with_last_request_cache(LastRequestTelemetryCache::new(store.clone()));
        (telemetry, store)
    }

    async fn seed_five_failures(store: &MemoryNameValueStore) {
        let mut last = LastRequestTelemetry::new("2");
        for i in 1..=5 {
            last.append_failed_request(FailedRequest::new(
                format!("API_{}", i),
                format!("COL_ID_{}", i),
                format!("ERR_{}", i),
            ));
        }
        for _ in 0..5 {
            last.increment_silent_success_count();
        }
        store
            .put(LAST_TELEMETRY_OBJECT_CACHE_KEY, &serde_json::to_string(&last).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_emit_without_init_is_dropped() {
        let telemetry = EstsTelemetry::default();
        telemetry.emit_api_id(Some(CORRELATION_ID), API_ID).await;
        assert!(!telemetry.is_tracking(CORRELATION_ID));
        assert!(telemetry.telemetry_headers(Some(CORRELATION_ID)).await.is_empty());
    }

    #[tokio::test]
    async fn test_headers_with_empty_cache() {
        let (telemetry, _store) = telemetry_with_store();
        let command = MockCommand::new(true);
        telemetry.init_telemetry_for_command(&command);
        telemetry.emit_api_id(Some(CORRELATION_ID), API_ID).await;
        telemetry.emit_force_refresh(Some(CORRELATION_ID), true).await;
        for (field, status) in [
            (key::AT_STATUS, "true"),
            (key::MRRT_STATUS, "false"),
            (key::RT_STATUS, "true"),
            (key::FRT_STATUS, "false"),
            (key::ID_TOKEN_STATUS, "false"),
            (key::ACCOUNT_STATUS, "true"),
        ] {
            telemetry.emit(Some(CORRELATION_ID), field, Some(status)).await;
        }

        let headers = telemetry.telemetry_headers(Some(CORRELATION_ID)).await;
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[CURRENT_REQUEST_HEADER_NAME], "2|API_ID,1|2,,,,,,,1,0,1,1,0,0");
        assert_eq!(headers[LAST_REQUEST_HEADER_NAME], "2|0|||2,1");
    }

    #[tokio::test]
    async fn test_headers_with_cached_failures() {
        let (telemetry, store) = telemetry_with_store();
        seed_five_failures(&store).await;
        telemetry.init_telemetry_for_command(&MockCommand::new(true));
        telemetry.emit_api_id(Some(CORRELATION_ID), API_ID).await;

        let headers = telemetry.telemetry_headers(Some(CORRELATION_ID)).await;
        assert_eq!(headers[CURRENT_REQUEST_HEADER_NAME], "2|API_ID,0|2,,,,,,,,,,,,");
        assert_eq!(
            headers[LAST_REQUEST_HEADER_NAME],
            "2|5|API_1,COL_ID_1,API_2,COL_ID_2,API_3,COL_ID_3,API_4,COL_ID_4,API_5,COL_ID_5|ERR_1,ERR_2,ERR_3,ERR_4,ERR_5|2,1"
        );
    }

    #[tokio::test]
    async fn test_unset_correlation_id_yields_no_headers() {
        let (telemetry, _store) = telemetry_with_store();
        telemetry.init_telemetry_for_command(&MockCommand::new(true));
        assert!(telemetry.telemetry_headers(None).await.is_empty());
        assert!(telemetry.telemetry_headers(Some("UNSET")).await.is_empty());
    }

    #[tokio::test]
    async fn test_flush_cached_success_counts_silent_success() {
        let (telemetry, store) = telemetry_with_store();
        let command = MockCommand::new(false);
        let result = auth_result(true);

        telemetry.init_telemetry_for_command(&command);
        telemetry.emit_api_id(Some(CORRELATION_ID), API_ID).await;
        telemetry
            .flush(&command, CommandResult::Completed(Some(&result)))
            .await;

        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[LAST_TELEMETRY_SCHEMA_VERSION_CACHE_KEY], "2");
        assert_eq!(all[LAST_TELEMETRY_HEADER_STRING_CACHE_KEY], "2|1|||2,");
        assert!(!telemetry.is_tracking(CORRELATION_ID));
    }

    #[tokio::test]
    async fn test_flush_error_appends_failed_request() {
        let (telemetry, store) = telemetry_with_store();
        let command = MockCommand::new(false);
        let exception = BaseException::service(
            "ERROR_CODE",
            Some("ERROR_MESSAGE".to_string()),
            ServiceDetails::default(),
        );

        telemetry.init_telemetry_for_command(&command);
        telemetry.emit_api_id(Some(CORRELATION_ID), API_ID).await;
        telemetry.flush(&command, CommandResult::Error(&exception)).await;

        let all = store.get_all().await.unwrap();
        assert_eq!(
            all[LAST_TELEMETRY_HEADER_STRING_CACHE_KEY],
            "2|0|API_ID,SOME_CORRELATION_ID|ERROR_CODE|2,"
        );
    }

    #[tokio::test]
    async fn test_flush_logged_by_server_wipes_sent_failures() {
        let (telemetry, store) = telemetry_with_store();
        seed_five_failures(&store).await;
        let command = MockCommand::new(true);
        let exception = BaseException::service(
            "ERROR_CODE",
            None,
            ServiceDetails::new(None, 400),
        );

        telemetry.init_telemetry_for_command(&command);
        telemetry.emit_api_id(Some(CORRELATION_ID), API_ID).await;
        // Building the headers marks the five cached failures as sent
        telemetry.telemetry_headers(Some(CORRELATION_ID)).await;
        telemetry.flush(&command, CommandResult::Error(&exception)).await;

        let all = store.get_all().await.unwrap();
        assert_eq!(
            all[LAST_TELEMETRY_HEADER_STRING_CACHE_KEY],
            "2|0|API_ID,SOME_CORRELATION_ID|ERROR_CODE|2,"
        );
    }

    #[tokio::test]
    async fn test_flush_after_truncated_header_keeps_unsent_failures() {
        let (telemetry, store) = telemetry_with_store();
        let mut seeded = LastRequestTelemetry::new("2");
        for i in 0..100 {
            seeded.append_failed_request(FailedRequest::new(
                "API_ID",
                format!("00000000-0000-0000-0000-{:012}", i),
                "invalid_grant",
            ));
        }
        store
            .put(LAST_TELEMETRY_OBJECT_CACHE_KEY, &serde_json::to_string(&seeded).unwrap())
            .await
            .unwrap();

        let command = MockCommand::new(true);
        let exception = BaseException::service("ERROR_CODE", None, ServiceDetails::new(None, 400));
        telemetry.init_telemetry_for_command(&command);
        telemetry.emit_api_id(Some(CORRELATION_ID), API_ID).await;

        let headers = telemetry.telemetry_headers(Some(CORRELATION_ID)).await;
        let last_header = &headers[LAST_REQUEST_HEADER_NAME];
        assert!(last_header.len() <= HEADER_DATA_LIMIT);
        assert!(last_header.ends_with(",0"));

        let (_, sent) = seeded.fit_to_header_limit(HEADER_DATA_LIMIT);
        assert!(!sent.is_empty() && sent.len() < 100);

        telemetry.flush(&command, CommandResult::Error(&exception)).await;

        let stored: LastRequestTelemetry = serde_json::from_str(
            &store.get(LAST_TELEMETRY_OBJECT_CACHE_KEY).await.unwrap().unwrap(),
        )
        .unwrap();
        let remaining = stored.failed_requests();
        assert_eq!(remaining.len(), 100 - sent.len() + 1);
        assert_eq!(
            remaining[0].correlation_id,
            format!("00000000-0000-0000-0000-{:012}", sent.len())
        );
        assert!(sent.iter().all(|s| !remaining.contains(s)));
        assert_eq!(remaining.last().unwrap().correlation_id, CORRELATION_ID);
    }

    #[tokio::test]
    async fn test_flush_throttled_error_keeps_history() {
        let (telemetry, store) = telemetry_with_store();
        seed_five_failures(&store).await;
        let command = MockCommand::new(true);
        let exception = BaseException::service("throttled", None, ServiceDetails::new(None, 429));

        telemetry.init_telemetry_for_command(&command);
        telemetry.telemetry_headers(Some(CORRELATION_ID)).await;
        telemetry.flush(&command, CommandResult::Error(&exception)).await;

        let last = LastRequestTelemetryCache::new(store)
            .get_request_telemetry_from_cache()
            .await
            .unwrap();
        assert_eq!(last.failed_requests().len(), 6);
        assert_eq!(last.silent_successful_count(), 5);
    }

    #[tokio::test]
    async fn test_cancel_records_user_cancel() {
        let (telemetry, store) = telemetry_with_store();
        let command = MockCommand::new(true);
        telemetry.init_telemetry_for_command(&command);
        telemetry.flush(&command, CommandResult::Cancel).await;

        let header = store
            .get(LAST_TELEMETRY_HEADER_STRING_CACHE_KEY)
            .await
            .unwrap()
            .unwrap();
        assert!(header.ends_with("|user_cancel|2,"));
    }

    #[tokio::test]
    async fn test_second_flush_is_a_no_op() {
        let (telemetry, store) = telemetry_with_store();
        let command = MockCommand::new(false);
        let result = auth_result(true);
        telemetry.init_telemetry_for_command(&command);

        telemetry.flush(&command, CommandResult::Completed(Some(&result))).await;
        telemetry.flush(&command, CommandResult::Completed(Some(&result))).await;

        let last = LastRequestTelemetryCache::new(store)
            .get_request_telemetry_from_cache()
            .await
            .unwrap();
        assert_eq!(last.silent_successful_count(), 1);
    }

    #[tokio::test]
    async fn test_flush_without_cache_does_not_fail() {
        let telemetry = EstsTelemetry::default();
        let command = MockCommand::new(false);
        telemetry.init_telemetry_for_command(&command);
        telemetry.flush(&command, CommandResult::Cancel).await;
        assert!(!telemetry.is_tracking(CORRELATION_ID));
    }

    #[tokio::test]
    async fn test_subsequent_cached_commands() {
        let (telemetry, _store) = telemetry_with_store();
        let command = MockCommand::new(true);
        let cached = auth_result(true);

        for _ in 0..2 {
            telemetry.init_telemetry_for_command(&command);
            telemetry.emit_api_id(Some(CORRELATION_ID), API_ID).await;
            telemetry.emit_force_refresh(Some(CORRELATION_ID), false).await;
            telemetry.flush(&command, CommandResult::Completed(Some(&cached))).await;
        }

        telemetry.init_telemetry_for_command(&command);
        telemetry.emit_api_id(Some(CORRELATION_ID), API_ID).await;
        telemetry.emit_force_refresh(Some(CORRELATION_ID), true).await;

        let headers = telemetry.telemetry_headers(Some(CORRELATION_ID)).await;
        assert_eq!(headers[CURRENT_REQUEST_HEADER_NAME], "2|API_ID,1|2,,,,,,,,,,,,");
        assert_eq!(headers[LAST_REQUEST_HEADER_NAME], "2|2|||2,1");
    }

    #[tokio::test]
    async fn test_supplemental_fields_reach_next_request() {
        let supplemental = Arc::new(MemoryNameValueStore::new());
        let telemetry = EstsTelemetry::default()
            .with_last_request_cache(LastRequestTelemetryCache::new(Arc::new(
                MemoryNameValueStore::new(),
            )))
            .with_supplemental_store(supplemental.clone());

        telemetry.emit(None, key::FLW_SIGNIN_APP, Some("com.app")).await;
        telemetry.emit(None, key::AT_STATUS, Some("1")).await;
        assert_eq!(supplemental.keys().await.unwrap(), vec![key::FLW_SIGNIN_APP.to_string()]);

        telemetry.init_telemetry_for_command(&MockCommand::new(true));
        telemetry.emit(Some(CORRELATION_ID), key::IS_SHARED_DEVICE, Some("true")).await;
        let headers = telemetry.telemetry_headers(Some(CORRELATION_ID)).await;
        assert_eq!(headers[CURRENT_REQUEST_HEADER_NAME], "2|,0|2,1,,,,com.app,,,,,,");
    }

    #[tokio::test]
    async fn test_flush_during_header_build_keeps_unsent_failure() {
        let (telemetry, store) = telemetry_with_store();
        seed_five_failures(&store).await;
        let telemetry = Arc::new(telemetry);

        let sender = MockCommand {
            correlation_id: Some("corr-a".to_string()),
            eligible: true,
            reaches_token_endpoint: true,
        };
        let failing = MockCommand {
            correlation_id: Some("corr-b".to_string()),
            eligible: true,
            reaches_token_endpoint: false,
        };
        telemetry.init_telemetry_for_command(&sender);
        telemetry.emit_api_id(Some("corr-a"), API_ID).await;
        telemetry.init_telemetry_for_command(&failing);

        let client_error = BaseException::client("io_error", "disk");
        let (headers, ()) = tokio::join!(
            telemetry.telemetry_headers(Some("corr-a")),
            telemetry.flush(&failing, CommandResult::Error(&client_error)),
        );
        let included = headers[LAST_REQUEST_HEADER_NAME].contains("corr-b");

        let bad_request = BaseException::service("invalid_grant", None, ServiceDetails::new(None, 400));
        telemetry.flush(&sender, CommandResult::Error(&bad_request)).await;

        let last = LastRequestTelemetryCache::new(store)
            .get_request_telemetry_from_cache()
            .await
            .unwrap();
        let remaining: Vec<_> = last
            .failed_requests()
            .iter()
            .map(|f| f.correlation_id.as_str())
            .collect();
        if included {
            assert_eq!(remaining, ["corr-a"]);
        } else {
            assert_eq!(remaining, ["corr-b", "corr-a"]);
        }
    }

    #[tokio::test]
    async fn test_concurrent_flushes_are_not_lost() {
        let store = Arc::new(MemoryNameValueStore::new());
        let telemetry = Arc::new(
            EstsTelemetry::default()
                .with_last_request_cache(LastRequestTelemetryCache::new(store.clone())),
        );

        let mut handles = Vec::new();
        for i in 0..10 {
            let telemetry = telemetry.clone();
            handles.push(tokio::spawn(async move {
                let command = MockCommand {
                    correlation_id: Some(format!("corr-{}", i)),
                    eligible: true,
                    reaches_token_endpoint: false,
                };
                let exception = BaseException::client("io_error", "disk");
                telemetry.init_telemetry_for_command(&command);
                telemetry.flush(&command, CommandResult::Error(&exception)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let last = LastRequestTelemetryCache::new(store)
            .get_request_telemetry_from_cache()
            .await
            .unwrap();
        assert_eq!(last.failed_requests().len(), 10);
    }

    #[test]
    fn test_logged_by_server_rules() {
        let reaching = MockCommand::new(true);
        let local = MockCommand::new(false);
        let bad_request = BaseException::service("e", None, ServiceDetails::new(None, 400));
        let server_error = BaseException::service("e", None, ServiceDetails::new(None, 503));
        let client = BaseException::client("e", "m");
        let protection_policy = BaseException::new(
            ExceptionKind::IntuneAppProtectionPolicyRequired {
                service: ServiceDetails::new(Some("protection_policy_required".to_string()), 400),
                account_upn: None,
                account_user_id: None,
                tenant_id: None,
                authority_url: None,
            },
            "unauthorized_client",
            None,
        );
        let network = auth_result(false);
        let cached = auth_result(true);

        assert!(is_telemetry_logged_by_server(&reaching, &CommandResult::Error(&bad_request)));
        assert!(!is_telemetry_logged_by_server(&reaching, &CommandResult::Error(&server_error)));
        assert!(!is_telemetry_logged_by_server(&reaching, &CommandResult::Error(&client)));
        assert!(is_telemetry_logged_by_server(&reaching, &CommandResult::Error(&protection_policy)));
        assert!(!is_telemetry_logged_by_server(&local, &CommandResult::Error(&bad_request)));
        assert!(!is_telemetry_logged_by_server(&reaching, &CommandResult::Cancel));
        assert!(is_telemetry_logged_by_server(&reaching, &CommandResult::Completed(Some(&network))));
        assert!(!is_telemetry_logged_by_server(&reaching, &CommandResult::Completed(Some(&cached))));
        assert!(!is_telemetry_logged_by_server(&reaching, &CommandResult::Completed(None)));
    }
}
