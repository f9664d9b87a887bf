// Payload parsing. Each MQTT publish carries one JSON object with a
// `timestamp` and a numeric `value`; the sensor name is not in the payload
// but taken from the last segment of the topic the message arrived on.
use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("payload must be a JSON object")]
    NotAnObject,

    #[error("payload is missing field `{0}`")]
    MissingField(&'static str),

    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),

    #[error("field `value` must be a number, got {0}")]
    InvalidValue(serde_json::Value),

    #[error("topic {0:?} has an empty last segment")]
    EmptyTopic(String),
}

/// One sensor reading as it is written to the database.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub topic: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl Reading {
    /// Parse a raw publish into a `Reading`.
    pub fn parse(topic: &str, payload: &[u8]) -> Result<Self, ParseError> {
        let name = topic_name(topic).ok_or_else(|| ParseError::EmptyTopic(topic.to_string()))?;

        let v: serde_json::Value = serde_json::from_slice(payload)?;
        let obj = v.as_object().ok_or(ParseError::NotAnObject)?;

        let raw_ts = obj.get("timestamp").ok_or(ParseError::MissingField("timestamp"))?;
        let timestamp = raw_ts
            .as_str()
            .and_then(parse_time)
            .ok_or_else(|| ParseError::InvalidTimestamp(raw_ts.to_string()))?;

        let raw_value = obj.get("value").ok_or(ParseError::MissingField("value"))?;
        let value = raw_value
            .as_f64()
            .ok_or_else(|| ParseError::InvalidValue(raw_value.clone()))?;

        Ok(Reading {
            topic: name.to_string(),
            timestamp,
            value,
        })
    }
}

/// Last `/` separated segment of an MQTT topic, `None` if it is empty.
pub fn topic_name(topic: &str) -> Option<&str> {
    topic.rsplit('/').next().filter(|s| !s.is_empty())
}

// Sensors send either RFC 3339 or the bare `YYYY-MM-DD HH:MM:SS` form,
// the latter is taken as UTC.
fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|ndt| ndt.and_utc())
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_well_formed_payload() {
        let payload = br#"{"timestamp": "2023-01-01T00:00:00Z", "value": 12.5}"#;
        let reading = Reading::parse("sensors/moisture", payload).expect("parse reading");

        assert_eq!(reading.topic, "moisture");
        assert_eq!(reading.timestamp, Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(reading.value, 12.5);
    }

    #[test]
    fn test_parse_ignores_extra_fields_and_offsets() {
        let payload = br#"{"timestamp": "2023-06-01T12:00:00+02:00", "value": 3, "unit": "%"}"#;
        let reading = Reading::parse("mock/saturation", payload).unwrap();

        assert_eq!(reading.topic, "saturation");
        assert_eq!(reading.timestamp, Utc.with_ymd_and_hms(2023, 6, 1, 10, 0, 0).unwrap());
        assert_eq!(reading.value, 3.0);
    }

    #[test]
    fn test_parse_plain_datetime_as_utc() {
        let payload = br#"{"timestamp": "2025-11-29 22:00:39", "value": -1.25}"#;
        let reading = Reading::parse("moisture", payload).unwrap();

        assert_eq!(reading.topic, "moisture");
        assert_eq!(reading.timestamp, Utc.with_ymd_and_hms(2025, 11, 29, 22, 0, 39).unwrap());
    }

    #[test]
    fn test_missing_value_is_an_error() {
        let payload = br#"{"timestamp": "2023-01-01T00:00:00Z"}"#;
        let err = Reading::parse("sensors/moisture", payload).unwrap_err();
        assert!(matches!(err, ParseError::MissingField("value")), "got {err:?}");
    }

    #[test]
    fn test_missing_timestamp_is_an_error() {
        let err = Reading::parse("sensors/moisture", br#"{"value": 1.0}"#).unwrap_err();
        assert!(matches!(err, ParseError::MissingField("timestamp")), "got {err:?}");
    }

    #[test]
    fn test_rejects_bad_inputs() {
        assert!(matches!(
            Reading::parse("a/b", b"not json").unwrap_err(),
            ParseError::InvalidJson(_)
        ));
        assert!(matches!(
            Reading::parse("a/b", b"[1, 2]").unwrap_err(),
            ParseError::NotAnObject
        ));
        assert!(matches!(
            Reading::parse("a/b", br#"{"timestamp": "yesterday", "value": 1}"#).unwrap_err(),
            ParseError::InvalidTimestamp(_)
        ));
        let quoted_value = br#"{"timestamp": "2023-01-01T00:00:00Z", "value": "12.5"}"#;
        assert!(matches!(
            Reading::parse("a/b", quoted_value).unwrap_err(),
            ParseError::InvalidValue(_)
        ));
        let well_formed = br#"{"timestamp": "2023-01-01T00:00:00Z", "value": 1}"#;
        assert!(matches!(
            Reading::parse("sensors/", well_formed).unwrap_err(),
            ParseError::EmptyTopic(_)
        ));
    }

    #[test]
    fn test_topic_name() {
        assert_eq!(topic_name("sensors/garden/moisture"), Some("moisture"));
        assert_eq!(topic_name("moisture"), Some("moisture"));
        assert_eq!(topic_name("sensors/"), None);
        assert_eq!(topic_name(""), None);
    }
}
