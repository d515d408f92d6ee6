//! ESTS server telemetry
//!
//! Every token request carries two headers: `x-client-current-telemetry`
//! describing the request itself, and `x-client-last-telemetry` describing
//! what happened since the server last heard from this client (silent cache
//! hits and failed requests). [`EstsTelemetry`] collects the fields per
//! correlation id, renders both headers within the byte budget, and folds
//! each finished command into the persisted history.
//!
//! Error events are separate: see [`emit_error_event`].

pub mod cache;
pub mod ests;
pub mod events;
pub mod request_telemetry;
pub mod schema;

pub use cache::LastRequestTelemetryCache;
pub use ests::{CommandResult, EstsTelemetry, TelemetryCommand, is_telemetry_logged_by_server};
pub use events::{ErrorEvent, EventSink, TracingEventSink, emit_error_event};
pub use request_telemetry::{CurrentRequestTelemetry, FailedRequest, LastRequestTelemetry};
