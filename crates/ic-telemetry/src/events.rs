use std::collections::BTreeMap;

use ic_core::{BaseException, ExceptionType};
use tracing::warn;

use crate::schema::key;

/// Error telemetry for one failed operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub exception_type: ExceptionType,
    pub error_code: String,
    pub error_description: Option<String>,
    pub correlation_id: Option<String>,
    pub spe_ring: Option<String>,
    pub http_status_code: Option<u16>,
    pub sub_error_code: Option<String>,
}

impl From<&BaseException> for ErrorEvent {
    fn from(exception: &BaseException) -> Self {
        let http_status_code = exception.service_details().map(|d| d.http_status_code);

        Self {
            exception_type: exception.exception_type(),
            error_code: exception.error_code().to_string(),
            error_description: exception.message().map(str::to_string),
            correlation_id: exception.correlation_id().map(str::to_string),
            spe_ring: exception.spe_ring().map(str::to_string),
            http_status_code,
            sub_error_code: exception.sub_error_code().map(str::to_string),
        }
    }
}

impl ErrorEvent {
    /// Flat property map using the library event keys
    pub fn properties(&self) -> BTreeMap<&'static str, String> {
        let mut properties = BTreeMap::new();
        properties.insert(key::ERROR_CODE, self.error_code.clone());
        let optional = [
            (key::ERROR_DESCRIPTION, self.error_description.clone()),
            (key::CORRELATION_ID, self.correlation_id.clone()),
            (key::SPE_RING, self.spe_ring.clone()),
            (key::HTTP_RESPONSE_CODE, self.http_status_code.map(|c| c.to_string())),
            (key::SERVER_SUBERROR_CODE, self.sub_error_code.clone()),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                properties.insert(name, value);
            }
        }
        properties
    }
}

/// Receives error events
pub trait EventSink: Send + Sync {
    fn on_error_event(&self, event: &ErrorEvent);
}

/// Writes error events to the tracing log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn on_error_event(&self, event: &ErrorEvent) {
        warn!(
            error_code = %event.error_code,
            correlation_id = event.correlation_id.as_deref().unwrap_or_default(),
            http_status = event.http_status_code,
            "{} raised",
            event.exception_type.short_name()
        );
    }
}

/// Report `exception` to `sink`. Constructing an exception never does this
/// on its own; callers invoke it once the failure is final.
pub fn emit_error_event(sink: &dyn EventSink, exception: &BaseException) -> ErrorEvent {
    let event = ErrorEvent::from(exception);
    sink.on_error_event(&event);
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use ic_core::ServiceDetails;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<ErrorEvent>>,
    }

    impl EventSink for RecordingSink {
        fn on_error_event(&self, event: &ErrorEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_service_error_event() {
        let exception = BaseException::service(
            "invalid_grant",
            Some("expired".to_string()),
            ServiceDetails::new(Some("bad_token".to_string()), 400),
        )
        .with_correlation_id(Some("corr".to_string()));

        let sink = RecordingSink::default();
        let event = emit_error_event(&sink, &exception);

        assert_eq!(event.http_status_code, Some(400));
        assert_eq!(event.sub_error_code.as_deref(), Some("bad_token"));
        assert_eq!(sink.events.lock().unwrap().len(), 1);

        let properties = event.properties();
        assert_eq!(properties[key::ERROR_CODE], "invalid_grant");
        assert_eq!(properties[key::HTTP_RESPONSE_CODE], "400");
        assert_eq!(properties[key::CORRELATION_ID], "corr");
    }

    #[test]
    fn test_construction_alone_emits_nothing() {
        let sink = RecordingSink::default();
        let exception = BaseException::user_cancel();
        assert!(sink.events.lock().unwrap().is_empty());

        let event = emit_error_event(&sink, &exception);
        assert_eq!(event.exception_type, ExceptionType::UserCancel);
        assert!(event.http_status_code.is_none());
        assert!(!event.properties().contains_key(key::HTTP_RESPONSE_CODE));
    }
}
