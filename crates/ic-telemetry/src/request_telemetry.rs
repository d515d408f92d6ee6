use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::schema::{
    self, CURRENT_PLATFORM_SCHEMA_VERSION, CURRENT_SCHEMA_VERSION, FAILED_REQUEST_CAP,
    SEPARATOR_COMMA, SEPARATOR_PIPE, key, value,
};

/// A request that failed before its telemetry reached the server.
///
/// Persisted under the `m*` names older readers expect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FailedRequest {
    #[serde(rename = "mApiId", alias = "api_id")]
    pub api_id: String,
    #[serde(rename = "mCorrelationId", alias = "correlation_id")]
    pub correlation_id: String,
    #[serde(rename = "mError", alias = "error")]
    pub error: String,
}

impl FailedRequest {
    pub fn new(
        api_id: impl Into<String>,
        correlation_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            api_id: api_id.into(),
            correlation_id: correlation_id.into(),
            error: error.into(),
        }
    }
}

fn platform_section(fields: &[&str], platform: &BTreeMap<String, String>) -> String {
    fields
        .iter()
        .map(|field| {
            if *field == key::PLATFORM_SCHEMA_VERSION {
                CURRENT_PLATFORM_SCHEMA_VERSION
            } else {
                platform.get(*field).map(String::as_str).unwrap_or(value::EMPTY)
            }
        })
        .collect::<Vec<_>>()
        .join(SEPARATOR_COMMA)
}

/// Telemetry of the request in flight for one correlation id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentRequestTelemetry {
    schema_version: String,
    api_id: Option<String>,
    force_refresh: Option<String>,
    platform_telemetry: BTreeMap<String, String>,
}

impl Default for CurrentRequestTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl CurrentRequestTelemetry {
    pub fn new() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION.to_string(),
            api_id: None,
            force_refresh: None,
            platform_telemetry: BTreeMap::new(),
        }
    }

    /// Record one field. Keys that are not part of the header are ignored.
    pub fn put(&mut self, key: &str, value: &str) {
        match key {
            key::API_ID => self.api_id = Some(value.to_string()),
            key::FORCE_REFRESH => self.force_refresh = Some(value.to_string()),
            k if schema::is_current_platform_field(k) => {
                self.platform_telemetry.insert(k.to_string(), value.to_string());
            }
            _ => {}
        }
    }

    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    pub fn api_id(&self) -> Option<&str> {
        self.api_id.as_deref()
    }

    pub fn force_refresh(&self) -> Option<&str> {
        self.force_refresh.as_deref()
    }

    pub fn platform_value(&self, key: &str) -> Option<&str> {
        self.platform_telemetry.get(key).map(String::as_str)
    }

    fn is_shared_device(&self) -> bool {
        self.platform_value(key::IS_SHARED_DEVICE) == Some(value::TRUE)
    }

    /// `schema_version|api_id,force_refresh|platform fields`
    pub fn header_string(&self) -> String {
        let fields = schema::current_request_platform_fields(self.is_shared_device());
        [
            self.schema_version.clone(),
            [
                self.api_id.as_deref().unwrap_or(value::EMPTY),
                self.force_refresh.as_deref().unwrap_or(value::FALSE),
            ]
            .join(SEPARATOR_COMMA),
            platform_section(&fields, &self.platform_telemetry),
        ]
        .join(SEPARATOR_PIPE)
    }
}

fn default_failed_request_cap() -> usize {
    FAILED_REQUEST_CAP
}

/// Telemetry about earlier requests, carried in the next request's header
/// and persisted across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastRequestTelemetry {
    #[serde(default)]
    silent_successful_count: u32,
    #[serde(default)]
    failed_requests: Vec<FailedRequest>,
    schema_version: String,
    #[serde(default)]
    platform_telemetry: BTreeMap<String, String>,
    #[serde(skip, default = "default_failed_request_cap")]
    failed_request_cap: usize,
}

impl LastRequestTelemetry {
    pub fn new(schema_version: impl Into<String>) -> Self {
        Self {
            silent_successful_count: 0,
            failed_requests: Vec::new(),
            schema_version: schema_version.into(),
            platform_telemetry: BTreeMap::new(),
            failed_request_cap: FAILED_REQUEST_CAP,
        }
    }

    pub fn with_failed_request_cap(mut self, cap: usize) -> Self {
        self.failed_request_cap = cap;
        self.enforce_cap();
        self
    }

    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    pub fn silent_successful_count(&self) -> u32 {
        self.silent_successful_count
    }

    pub fn failed_requests(&self) -> &[FailedRequest] {
        &self.failed_requests
    }

    pub fn platform_value(&self, key: &str) -> Option<&str> {
        self.platform_telemetry.get(key).map(String::as_str)
    }

    pub fn increment_silent_success_count(&mut self) {
        self.silent_successful_count = self.silent_successful_count.saturating_add(1);
    }

    pub fn reset_silent_success_count(&mut self) {
        self.silent_successful_count = 0;
    }

    /// Append a failure, dropping the oldest entries beyond the cap
    pub fn append_failed_request(&mut self, failed_request: FailedRequest) {
        self.failed_requests.push(failed_request);
        self.enforce_cap();
    }

    fn enforce_cap(&mut self) {
        if self.failed_requests.len() > self.failed_request_cap {
            let excess = self.failed_requests.len() - self.failed_request_cap;
            self.failed_requests.drain(..excess);
        }
    }

    /// Forget the failures the server has already logged
    pub fn wipe_failed_requests(&mut self, sent: &HashSet<FailedRequest>) {
        self.failed_requests.retain(|f| !sent.contains(f));
    }

    pub fn put_in_platform_telemetry(&mut self, key: &str, value: &str) {
        if schema::is_last_platform_field(key) {
            self.platform_telemetry.insert(key.to_string(), value.to_string());
        }
    }

    /// Fresh object for `current`, used when nothing was persisted yet
    pub fn seeded_from(current: &CurrentRequestTelemetry) -> Self {
        let mut last = Self::new(current.schema_version());
        for field in schema::last_request_platform_fields() {
            if let Some(value) = current.platform_value(field) {
                last.put_in_platform_telemetry(field, value);
            }
        }
        last
    }

    /// `schema_version|silent_count|api_id,correlation_id,...|error,...|platform fields`
    pub fn header_string(&self) -> String {
        let failed_section = self
            .failed_requests
            .iter()
            .flat_map(|f| [f.api_id.as_str(), f.correlation_id.as_str()])
            .collect::<Vec<_>>()
            .join(SEPARATOR_COMMA);
        let error_section = self
            .failed_requests
            .iter()
            .map(|f| f.error.as_str())
            .collect::<Vec<_>>()
            .join(SEPARATOR_COMMA);

        [
            self.schema_version.clone(),
            self.silent_successful_count.to_string(),
            failed_section,
            error_section,
            platform_section(schema::last_request_platform_fields(), &self.platform_telemetry),
        ]
        .join(SEPARATOR_PIPE)
    }

    /// Copy holding as many failed requests as fit in `limit` bytes of header.
    ///
    /// Returns the copy and the failed requests it carries. When some had to be
    /// left out the copy reports `is_all_telemetry_data_sent = 0`.
    pub fn fit_to_header_limit(&self, limit: usize) -> (Self, Vec<FailedRequest>) {
        let mut copy = Self {
            failed_requests: Vec::with_capacity(self.failed_requests.len()),
            ..self.clone()
        };
        // Both flag values are one byte, so the length checks hold either way
        copy.put_in_platform_telemetry(key::ALL_TELEMETRY_DATA_SENT, value::TRUE);

        let mut sent = Vec::new();
        for failed_request in &self.failed_requests {
            copy.failed_requests.push(failed_request.clone());
            if copy.header_string().len() > limit {
                copy.failed_requests.pop();
                copy.put_in_platform_telemetry(key::ALL_TELEMETRY_DATA_SENT, value::FALSE);
                break;
            }
            sent.push(failed_request.clone());
        }

        (copy, sent)
    }
}
