//! Event records as stored in, and read back from, the `events` table.
//!
//! [`EventRecord`] is a full row including the store-assigned `id` and the
//! cached `query_order`. [`NewEvent`] is what writers hand to the store;
//! the store fills in the rest.

use serde::{Deserialize, Serialize};

use crate::error::{PayloadError, RecordError};
use crate::payload::EventPayload;

/// A point location in WGS84 (SRID 4326).
///
/// `(0, 0)` is a legal value and is used when an event carries no point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Longitude in decimal degrees.
    pub longitude: f64,
    /// Latitude in decimal degrees.
    pub latitude: f64,
}

impl GeoPoint {
    /// Spatial reference identifier of every stored point.
    pub const SRID: i32 = 4326;

    /// The degenerate `(0, 0)` point.
    pub const ORIGIN: Self = Self {
        longitude: 0.0,
        latitude: 0.0,
    };

    /// Create a point from longitude and latitude.
    pub const fn new(longitude: f64, latitude: f64) -> Self {
        Self {
            longitude,
            latitude,
        }
    }
}

/// One persisted event row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Store-assigned surrogate key. Strictly increasing, never reused.
    pub id: i64,
    /// Caller-supplied stable identity. Several rows may share it.
    pub uid: String,
    /// Classification string, e.g. `b-m-p-j`.
    pub event_type: String,
    /// Full serialized event, opaque to the store.
    pub raw_payload: String,
    /// Optional secondary serialization; empty when absent.
    pub derived_payload: String,
    /// Whether the item should be shown again on replay.
    pub visible: bool,
    /// Milliseconds since the Unix epoch.
    pub last_update: i64,
    /// Priority cached from the classification registry at write time.
    pub query_order: i32,
    /// Location of the event.
    pub geometry: GeoPoint,
}

/// An event about to be written. The store assigns `id` and `query_order`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    uid: String,
    event_type: String,
    raw_payload: String,
    derived_payload: String,
    visible: bool,
    last_update: i64,
    geometry: GeoPoint,
}

impl NewEvent {
    /// Build a visible event at the origin with no timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::MissingType`] if `event_type` is empty and
    /// [`RecordError::MissingPayload`] if `raw_payload` is empty.
    pub fn new(
        uid: impl Into<String>,
        event_type: impl Into<String>,
        raw_payload: impl Into<String>,
    ) -> Result<Self, RecordError> {
        let event_type = event_type.into();
        let raw_payload = raw_payload.into();
        if event_type.is_empty() {
            return Err(RecordError::MissingType);
        }
        if raw_payload.is_empty() {
            return Err(RecordError::MissingPayload);
        }
        Ok(Self {
            uid: uid.into(),
            event_type,
            raw_payload,
            derived_payload: String::new(),
            visible: true,
            last_update: 0,
            geometry: GeoPoint::ORIGIN,
        })
    }

    /// Build an event by parsing its raw payload.
    ///
    /// The uid, type, timestamp and point are all taken from the payload.
    /// This is the same derivation the migrator applies to legacy rows.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError`] if the payload cannot be parsed or lacks
    /// a uid or type.
    pub fn from_payload(raw_payload: impl Into<String>) -> Result<Self, PayloadError> {
        let raw_payload = raw_payload.into();
        let payload = EventPayload::parse(&raw_payload)?;
        let geometry = payload.geometry();
        let last_update = payload.time_millis();
        let event = Self::new(payload.uid, payload.event_type, raw_payload)?
            .with_last_update(last_update)
            .with_geometry(geometry);
        Ok(event)
    }

    /// Set the secondary serialized representation.
    #[must_use]
    pub fn with_derived_payload(mut self, derived_payload: impl Into<String>) -> Self {
        self.derived_payload = derived_payload.into();
        self
    }

    /// Set the visibility flag.
    #[must_use]
    pub const fn with_visible(mut self, visible: bool) -> Self {
        self.visible = visible;
        self
    }

    /// Set the last-update timestamp (milliseconds since epoch).
    #[must_use]
    pub const fn with_last_update(mut self, last_update: i64) -> Self {
        self.last_update = last_update;
        self
    }

    /// Set the location.
    #[must_use]
    pub const fn with_geometry(mut self, geometry: GeoPoint) -> Self {
        self.geometry = geometry;
        self
    }

    /// Caller-supplied identity.
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Classification string.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Full serialized event.
    pub fn raw_payload(&self) -> &str {
        &self.raw_payload
    }

    /// Secondary serialization, possibly empty.
    pub fn derived_payload(&self) -> &str {
        &self.derived_payload
    }

    /// Visibility flag.
    pub const fn visible(&self) -> bool {
        self.visible
    }

    /// Milliseconds since the Unix epoch.
    pub const fn last_update(&self) -> i64 {
        self.last_update
    }

    /// Location of the event.
    pub const fn geometry(&self) -> GeoPoint {
        self.geometry
    }

    /// Turn this event into a full record with the given id and priority.
    pub fn into_record(self, id: i64, query_order: i32) -> EventRecord {
        EventRecord {
            id,
            uid: self.uid,
            event_type: self.event_type,
            raw_payload: self.raw_payload,
            derived_payload: self.derived_payload,
            visible: self.visible,
            last_update: self.last_update,
            query_order,
            geometry: self.geometry,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_type() {
        let err = NewEvent::new("uid-1", "", "{}").unwrap_err();
        assert_eq!(err, RecordError::MissingType);
    }

    #[test]
    fn rejects_missing_payload() {
        let err = NewEvent::new("uid-1", "a-f-G", "").unwrap_err();
        assert_eq!(err, RecordError::MissingPayload);
    }

    #[test]
    fn builder_sets_fields() {
        let event = NewEvent::new("uid-1", "a-f-G", "{}")
            .unwrap()
            .with_derived_payload("derived")
            .with_visible(false)
            .with_last_update(1_700_000_000_000)
            .with_geometry(GeoPoint::new(-77.1, 38.5));

        assert_eq!(event.derived_payload(), "derived");
        assert!(!event.visible());
        assert_eq!(event.last_update(), 1_700_000_000_000);
        assert_eq!(event.geometry(), GeoPoint::new(-77.1, 38.5));
    }

    #[test]
    fn from_payload_derives_indexed_fields() {
        let raw = r#"{"uid":"ANDROID-7","type":"b-m-r","time":"2024-05-01T12:00:00Z","point":{"lat":38.5,"lon":-77.1}}"#;
        let event = NewEvent::from_payload(raw).unwrap();

        assert_eq!(event.uid(), "ANDROID-7");
        assert_eq!(event.event_type(), "b-m-r");
        assert_eq!(event.raw_payload(), raw);
        assert_eq!(event.last_update(), 1_714_564_800_000);
        assert_eq!(event.geometry(), GeoPoint::new(-77.1, 38.5));
        assert!(event.visible());
    }

    #[test]
    fn into_record_keeps_fields() {
        let record = NewEvent::new("uid-2", "b-m-p-j", "payload")
            .unwrap()
            .into_record(42, 1);

        assert_eq!(record.id, 42);
        assert_eq!(record.query_order, 1);
        assert_eq!(record.uid, "uid-2");
        assert_eq!(record.geometry, GeoPoint::ORIGIN);
    }
}
