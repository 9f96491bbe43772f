//! InfluxDB 1.x writer using the HTTP line protocol.
//!
//! ```text
//! measurement,tag1=val1,tag2=val2 field1=val1,field2=val2 timestamp_ms
//! ```

use super::{check_response, BatchWriter, SinkError};
use crate::config::DbConfig;
use crate::telemetry::{Reading, SensorEvent};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::fmt::Write as _;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: &'static str,
    pub tags: Vec<(&'static str, String)>,
    pub fields: Vec<(&'static str, f64)>,
    pub ts: DateTime<Utc>,
}

impl Point {
    /// Appends this point as one line, tags sorted by key.
    pub fn write_line(&self, out: &mut String) {
        out.push_str(&escape_measurement(self.measurement));

        // Empty tag values are rejected by the server, so such tags are left off.
        let mut tags: Vec<_> = self.tags.iter().filter(|(_, v)| !v.is_empty()).collect();
        tags.sort_by_key(|(k, _)| *k);
        for (key, value) in tags {
            out.push(',');
            out.push_str(&escape_key(key));
            out.push('=');
            out.push_str(&escape_tag_value(value));
        }

        out.push(' ');
        for (i, (key, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&escape_key(key));
            out.push('=');
            let _ = write!(out, "{}", value);
        }

        let _ = write!(out, " {}", self.ts.timestamp_millis());
        out.push('\n');
    }
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// Tag values come from the payload. Backslashes are doubled so a trailing
/// one cannot swallow the separator, and line breaks become spaces since the
/// protocol has no escape for them.
fn escape_tag_value(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            ',' | '=' | ' ' => {
                escaped.push('\\');
                escaped.push(c);
            }
            '\n' | '\r' => escaped.push_str("\\ "),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Tag keys and field keys are fixed names.
fn escape_key(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

/// One point per metric, except the Thread parent report which becomes a
/// single multi-field `threadParentInfo` point tagged with the router locator.
pub fn points_from_event(event: &SensorEvent) -> Vec<Point> {
    let single = |(name, value): (&'static str, f64)| Point {
        measurement: name,
        tags: vec![("instance", event.instance.clone())],
        fields: vec![("value", value)],
        ts: event.ts,
    };

    match &event.reading {
        Reading::ThreadDisplayStatus {
            parent: Some(parent),
        } => {
            let mut points: Vec<Point> = event.common_values().into_iter().map(single).collect();
            let fields: Vec<(&'static str, f64)> = [
                ("linkQualityIn", parent.link_quality_in),
                ("linkQualityOut", parent.link_quality_out),
                ("avgRssi", parent.avg_rssi),
                ("latestRssi", parent.latest_rssi),
            ]
            .into_iter()
            .filter_map(|(name, value)| value.map(|v| (name, v)))
            .collect();
            if !fields.is_empty() {
                let mut tags = vec![("instance", event.instance.clone())];
                if let Some(rloc16) = &parent.rloc16 {
                    tags.push(("parentRloc16", rloc16.as_tag()));
                }
                points.push(Point {
                    measurement: "threadParentInfo",
                    tags,
                    fields,
                    ts: event.ts,
                });
            }
            points
        }
        _ => event
            .common_values()
            .into_iter()
            .chain(event.reading.values())
            .map(single)
            .collect(),
    }
}

pub fn encode_points(points: &[Point]) -> String {
    let mut body = String::with_capacity(points.len() * 64);
    for point in points {
        point.write_line(&mut body);
    }
    body
}

pub struct InfluxWriter {
    client: reqwest::Client,
    query_url: Url,
    write_url: Url,
    username: Option<String>,
    password: Option<String>,
    database: String,
}

impl InfluxWriter {
    pub fn new(config: &DbConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let base = config.base_url()?;
        Ok(Self {
            client,
            query_url: base.join("query")?,
            write_url: base.join("write")?,
            username: config.username.clone(),
            password: config.password.clone(),
            database: config.database.clone(),
        })
    }

    fn request(&self, url: &Url) -> reqwest::RequestBuilder {
        let request = self.client.post(url.clone());
        match &self.username {
            Some(username) => request.basic_auth(username, self.password.as_deref()),
            None => request,
        }
    }
}

impl BatchWriter for InfluxWriter {
    type Row = Point;

    fn backend(&self) -> &'static str {
        "influxdb"
    }

    fn rows_from_event(&self, event: &SensorEvent) -> Vec<Point> {
        points_from_event(event)
    }

    async fn ensure_schema(&self) -> Result<(), SinkError> {
        let statement = format!("CREATE DATABASE \"{}\"", self.database.replace('"', "\\\""));
        let response = self
            .request(&self.query_url)
            .query(&[("q", statement.as_str())])
            .send()
            .await?;
        check_response(response).await
    }

    async fn write_rows(&self, rows: &[Point]) -> Result<(), SinkError> {
        let response = self
            .request(&self.write_url)
            .query(&[("db", self.database.as_str()), ("precision", "ms")])
            .body(encode_points(rows))
            .send()
            .await?;
        check_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{Rloc16, ThreadParentInfo};
    use chrono::TimeZone;

    fn event(reading: Reading) -> SensorEvent {
        SensorEvent {
            instance: "S1".to_string(),
            tag: "x".to_string(),
            ts: Utc.timestamp_millis_opt(1_704_067_200_000).unwrap(),
            vcc: Some(3000.0),
            previous_sample_time_micros: None,
            rssi: None,
            reading,
        }
    }

    #[test]
    fn one_point_per_metric() {
        let points = points_from_event(&event(Reading::Temperature {
            temperature: Some(21.5),
        }));
        assert_eq!(
            encode_points(&points),
            "sensorVoltage,instance=S1 value=3 1704067200000\n\
             temperature,instance=S1 value=21.5 1704067200000\n"
        );
    }

    #[test]
    fn thread_status_is_a_single_tagged_point() {
        let points = points_from_event(&event(Reading::ThreadDisplayStatus {
            parent: Some(ThreadParentInfo {
                latest_rssi: Some(-61.0),
                avg_rssi: Some(-63.0),
                link_quality_in: Some(3.0),
                link_quality_out: None,
                rloc16: Some(Rloc16::Text("0x6c00".to_string())),
            }),
        }));
        assert_eq!(points.len(), 2);
        let mut line = String::new();
        points[1].write_line(&mut line);
        assert_eq!(
            line,
            "threadParentInfo,instance=S1,parentRloc16=0x6c00 linkQualityIn=3,avgRssi=-63,latestRssi=-61 1704067200000\n"
        );
    }

    #[test]
    fn escapes_tag_values() {
        let point = Point {
            measurement: "my metric",
            tags: vec![("instance", "living room,1".to_string())],
            fields: vec![("value", 1.5)],
            ts: Utc.timestamp_millis_opt(5).unwrap(),
        };
        let mut line = String::new();
        point.write_line(&mut line);
        assert_eq!(line, "my\\ metric,instance=living\\ room\\,1 value=1.5 5\n");
    }

    fn temperature_line(instance: &str) -> String {
        let mut e = event(Reading::Temperature {
            temperature: Some(1.0),
        });
        e.instance = instance.to_string();
        e.vcc = None;
        e.ts = Utc.timestamp_millis_opt(5).unwrap();
        encode_points(&points_from_event(&e))
    }

    #[test]
    fn empty_instance_is_left_off() {
        assert_eq!(temperature_line(""), "temperature value=1 5\n");
    }

    #[test]
    fn line_breaks_in_instance_stay_on_one_line() {
        assert_eq!(
            temperature_line("a\nb"),
            "temperature,instance=a\\ b value=1 5\n"
        );
        assert_eq!(temperature_line("a\r\nb").lines().count(), 1);
    }

    #[test]
    fn trailing_backslash_does_not_escape_separator() {
        assert_eq!(
            temperature_line("room\\"),
            "temperature,instance=room\\\\ value=1 5\n"
        );
    }

    #[test]
    fn empty_rloc16_is_left_off() {
        let mut e = event(Reading::ThreadDisplayStatus {
            parent: Some(ThreadParentInfo {
                avg_rssi: Some(-1.0),
                rloc16: Some(Rloc16::Text(String::new())),
                ..ThreadParentInfo::default()
            }),
        });
        e.instance = "d".to_string();
        e.vcc = None;
        e.ts = Utc.timestamp_millis_opt(5).unwrap();
        assert_eq!(
            encode_points(&points_from_event(&e)),
            "threadParentInfo,instance=d avgRssi=-1 5\n"
        );
    }

    #[test]
    fn unknown_reading_without_common_fields_has_no_points() {
        let mut e = event(Reading::Unknown);
        e.vcc = None;
        assert!(points_from_event(&e).is_empty());
    }
}
