//! Per-record reshaping applied while paginating.
//!
//! Upstream records carry `lat`/`lon` floats and epoch-millisecond timestamps. Stored
//! documents use a GeoJSON `location` point and RFC 3339 UTC strings instead, which the
//! store's date operators (`$year`, `$dateToString`) understand.

use std::sync::Arc;

use chrono::{SecondsFormat, TimeZone, Utc};
use serde_json::{json, Value};

use crate::contract::Record;
use crate::paginate::Transform;

pub const MEMBER_TIME_FIELDS: &[&str] = &["joined", "visited"];
pub const EVENT_TIME_FIELDS: &[&str] = &["time", "created", "updated"];
pub const GROUP_TIME_FIELDS: &[&str] = &["created"];

/// Replace `lat`/`lon` with `location: {type: "Point", coordinates: [lon, lat]}`.
/// Records without both coordinates are returned unchanged.
pub fn reshape_geospatial(mut doc: Record) -> Record {
    let Some(map) = doc.as_object_mut() else {
        return doc;
    };
    if let (Some(lat), Some(lon)) = (map.get("lat").cloned(), map.get("lon").cloned()) {
        map.remove("lat");
        map.remove("lon");
        map.insert(
            "location".into(),
            json!({ "type": "Point", "coordinates": [lon, lat] }),
        );
    }
    doc
}

pub fn epoch_millis_to_rfc3339(ms: i64) -> Option<String> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
}

/// Convert the named epoch-millisecond fields to RFC 3339 strings. Non-numeric values are
/// left alone.
pub fn reshape_time(mut doc: Record, keys: &[&str]) -> Record {
    if let Some(map) = doc.as_object_mut() {
        for key in keys {
            let converted = map
                .get(*key)
                .and_then(Value::as_i64)
                .and_then(epoch_millis_to_rfc3339);
            if let Some(ts) = converted {
                map.insert((*key).to_string(), Value::String(ts));
            }
        }
    }
    doc
}

pub fn reshape_member(doc: Record) -> Record {
    reshape_time(reshape_geospatial(doc), MEMBER_TIME_FIELDS)
}

pub fn reshape_event(doc: Record) -> Record {
    reshape_time(doc, EVENT_TIME_FIELDS)
}

pub fn reshape_group(doc: Record) -> Record {
    reshape_time(reshape_geospatial(doc), GROUP_TIME_FIELDS)
}

pub fn member_transform() -> Transform {
    Arc::new(reshape_member)
}

pub fn event_transform() -> Transform {
    Arc::new(reshape_event)
}

pub fn group_transform() -> Transform {
    Arc::new(reshape_group)
}
