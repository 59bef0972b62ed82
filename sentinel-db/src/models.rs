//! Wire types shared by the listener, the workers, and the flusher.

use std::io::Read;

use chrono::{DateTime, Utc};
use oracle::sql_type::{Clob, Object};
use serde::{Deserialize, Serialize};

use crate::error::{DbError, DbErrorKind};
use sentinel_common::trace::TraceParent;

/// Longest message the `process_logs.message` column accepts.
pub const MAX_LOG_MESSAGE_CHARS: usize = 4000;

/// The closed set of process-lifecycle events the database emits.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Started,
    Heartbeat,
    Progress,
    Completed,
    Error,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Started => "STARTED",
            EventType::Heartbeat => "HEARTBEAT",
            EventType::Progress => "PROGRESS",
            EventType::Completed => "COMPLETED",
            EventType::Error => "ERROR",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, DbError> {
        match raw {
            "STARTED" => Ok(EventType::Started),
            "HEARTBEAT" => Ok(EventType::Heartbeat),
            "PROGRESS" => Ok(EventType::Progress),
            "COMPLETED" => Ok(EventType::Completed),
            "ERROR" => Ok(EventType::Error),
            other => {
                Err(DbErrorKind::MalformedEvent(format!("unknown event type {:?}", other)).into())
            }
        }
    }

    /// The `process_live_status.status` value this event transitions to.
    pub fn live_status(&self) -> &'static str {
        match self {
            EventType::Started | EventType::Heartbeat | EventType::Progress => "RUNNING",
            EventType::Completed => "COMPLETED",
            EventType::Error => "FAILED",
        }
    }

    /// Log severity recorded for the event's audit row.
    pub fn log_level(&self) -> LogLevel {
        match self {
            EventType::Error => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// A process-lifecycle event extracted from the queue payload object.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub event_id: String,
    pub event_type: EventType,
    pub process_id: String,
    pub tenant_id: String,
    pub timestamp_utc: DateTime<Utc>,
    pub payload: Option<String>,
}

impl Event {
    /// Extracts the six attributes from the dequeued object. Strings are
    /// copied into owned buffers and the payload CLOB is streamed out, so the
    /// driver object may be released as soon as this returns.
    pub fn from_object(obj: &Object) -> Result<Event, DbError> {
        fn attr(obj: &Object, name: &str) -> Result<String, DbError> {
            let value: String = obj.get(name)?;
            if value.is_empty() {
                return Err(
                    DbErrorKind::MalformedEvent(format!("empty attribute {}", name)).into(),
                );
            }
            Ok(value)
        }

        let event_type = EventType::parse(&attr(obj, "EVENT_TYPE")?)?;
        let payload = match obj.get::<Option<Clob>>("PAYLOAD")? {
            Some(mut lob) => {
                let mut buf = String::new();
                lob.read_to_string(&mut buf)
                    .map_err(|e| DbErrorKind::MalformedEvent(format!("payload read: {}", e)))?;
                Some(buf)
            }
            None => None,
        };

        Ok(Event {
            event_id: attr(obj, "EVENT_ID")?,
            event_type,
            process_id: attr(obj, "PROCESS_ID")?,
            tenant_id: attr(obj, "TENANT_ID")?,
            timestamp_utc: obj.get("TIMESTAMP_UTC")?,
            payload,
        })
    }
}

/// Log severities accepted by `process_logs.log_level`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }
}

/// One row bound for `process_logs`. The insert timestamp is assigned by the
/// database at flush time.
#[derive(Clone, Debug, PartialEq)]
pub struct LogRow {
    pub process_id: String,
    pub tenant_id: String,
    pub log_level: LogLevel,
    pub event_type: Option<String>,
    pub component: Option<String>,
    pub message: String,
    pub details_json: Option<String>,
    pub stack_trace: Option<String>,
    pub correlation_id: Option<String>,
    pub span_id: Option<String>,
    pub trace_id: Option<String>,
    pub event_duration_us: Option<i64>,
}

impl LogRow {
    pub fn new(process_id: &str, tenant_id: &str, log_level: LogLevel, message: &str) -> Self {
        let mut message = message.to_owned();
        if message.chars().count() > MAX_LOG_MESSAGE_CHARS {
            message = message.chars().take(MAX_LOG_MESSAGE_CHARS).collect();
        }
        Self {
            process_id: process_id.to_owned(),
            tenant_id: tenant_id.to_owned(),
            log_level,
            event_type: None,
            component: None,
            message,
            details_json: None,
            stack_trace: None,
            correlation_id: None,
            span_id: None,
            trace_id: None,
            event_duration_us: None,
        }
    }

    /// The audit row a lifecycle event leaves behind. Trace identifiers and
    /// the reported duration are lifted from the payload when it carries
    /// them.
    pub fn for_event(event: &Event) -> Self {
        let mut row = Self::new(
            &event.process_id,
            &event.tenant_id,
            event.event_type.log_level(),
            &format!("process event {}", event.event_type.as_str()),
        );
        row.event_type = Some(event.event_type.as_str().to_owned());
        row.component = Some("queue-listener".to_owned());
        row.correlation_id = Some(event.event_id.clone());
        row.details_json = event.payload.clone();

        if let Some(doc) = event
            .payload
            .as_deref()
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
        {
            if let Some(parent) = doc
                .get("traceparent")
                .and_then(|v| v.as_str())
                .and_then(|v| TraceParent::parse(v).ok())
            {
                row.trace_id = Some(parent.trace_id);
                row.span_id = Some(parent.span_id);
            }
            row.event_duration_us = doc.get("duration_us").and_then(|v| v.as_i64());
        }

        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_event(payload: Option<&str>) -> Event {
        Event {
            event_id: "E1".to_owned(),
            event_type: EventType::Completed,
            process_id: "P1".to_owned(),
            tenant_id: "T1".to_owned(),
            timestamp_utc: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
            payload: payload.map(str::to_owned),
        }
    }

    #[test]
    fn event_type_round_trips_its_wire_strings() {
        for event_type in [
            EventType::Started,
            EventType::Heartbeat,
            EventType::Progress,
            EventType::Completed,
            EventType::Error,
        ] {
            assert_eq!(EventType::parse(event_type.as_str()).unwrap(), event_type);
        }
        assert!(EventType::parse("RESTARTED").is_err());
    }

    #[test]
    fn completed_event_yields_an_info_row() {
        let row = LogRow::for_event(&sample_event(None));
        assert_eq!(row.process_id, "P1");
        assert_eq!(row.tenant_id, "T1");
        assert_eq!(row.log_level, LogLevel::Info);
        assert_eq!(row.event_type.as_deref(), Some("COMPLETED"));
        assert_eq!(row.correlation_id.as_deref(), Some("E1"));
    }

    #[test]
    fn error_event_yields_an_error_row() {
        let mut event = sample_event(None);
        event.event_type = EventType::Error;
        assert_eq!(LogRow::for_event(&event).log_level, LogLevel::Error);
    }

    #[test]
    fn traceparent_in_payload_is_lifted_into_the_row() {
        let payload =
            r#"{"traceparent":"00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"}"#;
        let row = LogRow::for_event(&sample_event(Some(payload)));
        assert_eq!(
            row.trace_id.as_deref(),
            Some("4bf92f3577b34da6a3ce929d0e0e4736")
        );
        assert_eq!(row.span_id.as_deref(), Some("00f067aa0ba902b7"));
    }

    #[test]
    fn reported_durations_are_lifted_into_the_row() {
        let row = LogRow::for_event(&sample_event(Some(r#"{"duration_us": 1500}"#)));
        assert_eq!(row.event_duration_us, Some(1500));

        let row = LogRow::for_event(&sample_event(Some("not json")));
        assert_eq!(row.event_duration_us, None);
    }

    #[test]
    fn oversized_messages_are_truncated() {
        let long = "x".repeat(MAX_LOG_MESSAGE_CHARS + 100);
        let row = LogRow::new("P1", "T1", LogLevel::Info, &long);
        assert_eq!(row.message.chars().count(), MAX_LOG_MESSAGE_CHARS);
    }

    #[test]
    fn live_status_transitions_follow_the_event_type() {
        assert_eq!(EventType::Started.live_status(), "RUNNING");
        assert_eq!(EventType::Completed.live_status(), "COMPLETED");
        assert_eq!(EventType::Error.live_status(), "FAILED");
    }
}
