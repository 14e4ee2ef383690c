//! InfluxDB line protocol encoding for measurement points.
//!
//! ```text
//! heart_reading,owner=alice value=61i,confidence=2i 1623729906000
//! ```
//!
//! Timestamps are written with millisecond precision; the write request must
//! carry `precision=ms` to match.

use crate::model::{MeasurementPoint, TABLE_NAME};

/// Encode one point as a single line, without trailing newline.
pub fn encode_point(point: &MeasurementPoint) -> String {
    encode_line(
        TABLE_NAME,
        &[("owner", point.owner.as_str())],
        &[
            ("value", point.value),
            ("confidence", i64::from(point.confidence)),
        ],
        point.timestamp.timestamp_millis(),
    )
}

/// Encode a batch as a newline-separated request body.
pub fn encode_batch(points: &[MeasurementPoint]) -> String {
    let mut body = String::with_capacity(points.len() * 64);
    for point in points {
        body.push_str(&encode_point(point));
        body.push('\n');
    }
    body
}

fn encode_line(
    measurement: &str,
    tags: &[(&str, &str)],
    fields: &[(&str, i64)],
    timestamp: i64,
) -> String {
    let mut line = escape_measurement(measurement);

    for (key, value) in tags {
        // Empty tag values are invalid line protocol, leave the tag out.
        if value.is_empty() {
            continue;
        }
        line.push(',');
        line.push_str(&escape_key(key));
        line.push('=');
        line.push_str(&escape_key(value));
    }

    line.push(' ');
    let fields: Vec<String> = fields
        .iter()
        .map(|(key, value)| format!("{}={}i", escape_key(key), value))
        .collect();
    line.push_str(&fields.join(","));

    line.push(' ');
    line.push_str(&timestamp.to_string());
    line
}

/// Measurement names escape commas and spaces.
fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// Tag keys, tag values and field keys escape commas, equals signs and spaces.
fn escape_key(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}
