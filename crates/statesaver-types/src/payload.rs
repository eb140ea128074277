//! The raw serialized event carried in every row.
//!
//! The store treats `raw_payload` as opaque text except in two places:
//! when a writer builds a [`NewEvent`](crate::NewEvent) from it, and when
//! the migrator rebuilds the indexed columns of legacy rows. Both go
//! through [`EventPayload::parse`].
//!
//! ```json
//! {"uid": "ANDROID-1", "type": "a-f-G", "time": "2024-05-01T12:00:00Z",
//!  "point": {"lat": 38.5, "lon": -77.1}}
//! ```
//!
//! Fields other than the ones below are ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PayloadError;
use crate::record::GeoPoint;

/// The indexed subset of a serialized event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    /// Stable identity of the event.
    pub uid: String,
    /// Classification string.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Time the event was produced.
    pub time: DateTime<Utc>,
    /// Location, if the event has one.
    #[serde(default)]
    pub point: Option<PayloadPoint>,
}

/// The `point` element of a serialized event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PayloadPoint {
    /// Latitude in decimal degrees.
    pub lat: f64,
    /// Longitude in decimal degrees.
    pub lon: f64,
}

impl EventPayload {
    /// Parse a raw payload.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Malformed`] if the text is not a JSON event
    /// and [`PayloadError::MissingField`] if `uid` or `type` is empty.
    pub fn parse(raw: &str) -> Result<Self, PayloadError> {
        let payload: Self = serde_json::from_str(raw)?;
        if payload.uid.is_empty() {
            return Err(PayloadError::MissingField("uid"));
        }
        if payload.event_type.is_empty() {
            return Err(PayloadError::MissingField("type"));
        }
        Ok(payload)
    }

    /// Event time in milliseconds since the Unix epoch.
    pub fn time_millis(&self) -> i64 {
        self.time.timestamp_millis()
    }

    /// Event location; the origin when the payload has no point.
    pub fn geometry(&self) -> GeoPoint {
        self.point
            .map_or(GeoPoint::ORIGIN, |p| GeoPoint::new(p.lon, p.lat))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_event_without_point() {
        let payload =
            EventPayload::parse(r#"{"uid":"u1","type":"a-f-G","time":"1970-01-01T00:00:01Z"}"#)
                .unwrap();

        assert_eq!(payload.uid, "u1");
        assert_eq!(payload.time_millis(), 1_000);
        assert_eq!(payload.geometry(), GeoPoint::ORIGIN);
    }

    #[test]
    fn ignores_unknown_fields() {
        let payload = EventPayload::parse(
            r#"{"uid":"u1","type":"a-f-G","time":"2024-01-01T00:00:00Z","how":"m-g","detail":{"callsign":"ALPHA"}}"#,
        );
        assert!(payload.is_ok());
    }

    #[test]
    fn rejects_garbage() {
        let err = EventPayload::parse("<event uid='x'/>").unwrap_err();
        assert!(matches!(err, PayloadError::Malformed(_)));
    }

    #[test]
    fn rejects_empty_uid() {
        let err = EventPayload::parse(r#"{"uid":"","type":"a-f-G","time":"2024-01-01T00:00:00Z"}"#)
            .unwrap_err();
        assert!(matches!(err, PayloadError::MissingField("uid")));
    }

    #[test]
    fn rejects_empty_type() {
        let err = EventPayload::parse(r#"{"uid":"u1","type":"","time":"2024-01-01T00:00:00Z"}"#)
            .unwrap_err();
        assert!(matches!(err, PayloadError::MissingField("type")));
    }
}
