use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// One flattened numeric measurement derived from a [`SensorEvent`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRecord {
    pub name: &'static str,
    pub value: f64,
    pub instance: String,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid sensor event JSON: {0}")]
    Json(#[from] simd_json::Error),
    #[error("invalid event timestamp {0:?}")]
    Timestamp(String),
}

/// A decoded sensor reading.
///
/// The common fields are present on every kind of reading; the kind-specific
/// values live in [`Reading`], selected by the `tag` field of the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorEvent {
    pub instance: String,
    pub tag: String,
    pub ts: DateTime<Utc>,
    /// Supply voltage in millivolts.
    pub vcc: Option<f64>,
    pub previous_sample_time_micros: Option<f64>,
    pub rssi: Option<f64>,
    pub reading: Reading,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Temperature { temperature: Option<f64> },
    Pressure { pressure: Option<f64> },
    Humidity { humidity: Option<f64> },
    Environment {
        temperature: Option<f64>,
        pressure: Option<f64>,
        humidity: Option<f64>,
    },
    Current { current: Option<f64> },
    TankLevel { tank_level: Option<f64> },
    ElectricEnergy { amp_hours: Option<f64> },
    LevelReport { level: Option<f64> },
    Motion { motion_detected: Option<bool> },
    ThreadDisplayStatus { parent: Option<ThreadParentInfo> },
    Impulse,
    Unknown,
}

/// Link quality towards the Thread parent router, as reported by displays.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadParentInfo {
    #[serde(default)]
    pub latest_rssi: Option<f64>,
    #[serde(default)]
    pub avg_rssi: Option<f64>,
    #[serde(default)]
    pub link_quality_in: Option<f64>,
    #[serde(default)]
    pub link_quality_out: Option<f64>,
    #[serde(default)]
    pub rloc16: Option<Rloc16>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Rloc16 {
    Text(String),
    Number(f64),
}

impl Rloc16 {
    /// Raw form used as a tag value.
    pub fn as_tag(&self) -> String {
        match self {
            Rloc16::Text(raw) => raw.trim().to_string(),
            Rloc16::Number(value) => format!("{}", value),
        }
    }

    /// Numeric router locator; `0x`-prefixed strings are hex.
    pub fn value(&self) -> Option<f64> {
        match self {
            Rloc16::Number(value) => Some(*value),
            Rloc16::Text(raw) => {
                let raw = raw.trim();
                let parsed = match raw
                    .strip_prefix("0x")
                    .or_else(|| raw.strip_prefix("0X"))
                {
                    Some(hex) => i64::from_str_radix(hex, 16).ok(),
                    None => raw.parse::<i64>().ok(),
                };
                parsed.map(|v| v as f64)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEvent {
    instance: String,
    tag: String,
    ts: WireTimestamp,
    #[serde(default)]
    vcc: Option<f64>,
    #[serde(default)]
    previous_sample_time_micros: Option<f64>,
    #[serde(default)]
    rssi: Option<f64>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    pressure: Option<f64>,
    #[serde(default)]
    humidity: Option<f64>,
    #[serde(default)]
    current: Option<f64>,
    #[serde(default)]
    tank_level: Option<f64>,
    #[serde(default)]
    amp_hours: Option<f64>,
    #[serde(default)]
    level: Option<f64>,
    #[serde(default)]
    motion_detected: Option<bool>,
    #[serde(default)]
    parent: Option<ThreadParentInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Str(String),
    Int(i64),
    Float(f64),
}

impl WireTimestamp {
    fn to_datetime(&self) -> Result<DateTime<Utc>, DecodeError> {
        match self {
            WireTimestamp::Str(s) => DateTime::parse_from_rfc3339(s.trim())
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| DecodeError::Timestamp(s.clone())),
            WireTimestamp::Int(ms) => millis_to_dt(*ms),
            WireTimestamp::Float(ms) => millis_to_dt(*ms as i64),
        }
    }
}

fn millis_to_dt(ms: i64) -> Result<DateTime<Utc>, DecodeError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| DecodeError::Timestamp(ms.to_string()))
}

/// Decodes one MQTT payload. The buffer is parsed in place.
pub fn decode_event(payload: &mut [u8]) -> Result<SensorEvent, DecodeError> {
    let wire: WireEvent = simd_json::from_slice(payload)?;
    SensorEvent::from_wire(wire)
}

impl SensorEvent {
    fn from_wire(wire: WireEvent) -> Result<Self, DecodeError> {
        let ts = wire.ts.to_datetime()?;
        let reading = match wire.tag.as_str() {
            "t" => Reading::Temperature {
                temperature: wire.temperature,
            },
            "p" => Reading::Pressure {
                pressure: wire.pressure,
            },
            "h" => Reading::Humidity {
                humidity: wire.humidity,
            },
            "m" => Reading::Environment {
                temperature: wire.temperature,
                pressure: wire.pressure,
                humidity: wire.humidity,
            },
            "c" => Reading::Current {
                current: wire.current,
            },
            "w" => Reading::TankLevel {
                tank_level: wire.tank_level,
            },
            "e" => Reading::ElectricEnergy {
                amp_hours: wire.amp_hours,
            },
            "l" => Reading::LevelReport { level: wire.level },
            "k" => Reading::Motion {
                motion_detected: wire.motion_detected,
            },
            "s" => Reading::ThreadDisplayStatus {
                parent: wire.parent,
            },
            "i" => Reading::Impulse,
            _ => Reading::Unknown,
        };

        Ok(Self {
            instance: wire.instance,
            tag: wire.tag,
            ts,
            vcc: wire.vcc,
            previous_sample_time_micros: wire.previous_sample_time_micros,
            rssi: wire.rssi,
            reading,
        })
    }

    /// Voltage, sample duration and signal strength, in that order.
    pub fn common_values(&self) -> Vec<(&'static str, f64)> {
        let mut values = Vec::with_capacity(3);
        if let Some(vcc) = self.vcc.filter(|v| *v != 0.0) {
            values.push(("sensorVoltage", vcc / 1000.0));
        }
        if let Some(micros) = self.previous_sample_time_micros.filter(|v| *v != 0.0) {
            values.push(("measurementDuration", micros / 1000.0 / 1000.0));
        }
        if let Some(rssi) = self.rssi {
            values.push(("rssi", rssi));
        }
        values
    }

    /// Every metric carried by this event: the common ones first, then the
    /// kind-specific ones.
    pub fn metrics(&self) -> Vec<MetricRecord> {
        let mut values = self.common_values();
        values.extend(self.reading.values());
        values
            .into_iter()
            .map(|(name, value)| self.record(name, value))
            .collect()
    }

    pub fn record(&self, name: &'static str, value: f64) -> MetricRecord {
        MetricRecord {
            name,
            value,
            instance: self.instance.clone(),
            ts: self.ts,
        }
    }
}

impl Reading {
    /// Kind-specific metrics. Absent values are skipped one by one.
    pub fn values(&self) -> Vec<(&'static str, f64)> {
        let candidates: Vec<(&'static str, Option<f64>)> = match self {
            Reading::Temperature { temperature } => vec![("temperature", *temperature)],
            Reading::Pressure { pressure } => vec![("pressure", *pressure)],
            Reading::Humidity { humidity } => vec![("humidity", *humidity)],
            Reading::Environment {
                temperature,
                pressure,
                humidity,
            } => vec![
                ("temperature", *temperature),
                ("pressure", *pressure),
                ("humidity", *humidity),
            ],
            Reading::Current { current } => vec![("current", *current)],
            Reading::TankLevel { tank_level } => vec![("tankLevel", *tank_level)],
            Reading::ElectricEnergy { amp_hours } => vec![("ampHours", *amp_hours)],
            Reading::LevelReport { level } => vec![("level", *level)],
            Reading::Motion { motion_detected } => vec![(
                "motionDetected",
                motion_detected.map(|detected| if detected { 1.0 } else { 0.0 }),
            )],
            Reading::ThreadDisplayStatus { parent } => match parent {
                Some(parent) => vec![
                    ("thread_linkQualityIn", parent.link_quality_in),
                    ("thread_linkQualityOut", parent.link_quality_out),
                    ("thread_avgRssi", parent.avg_rssi),
                    ("thread_latestRssi", parent.latest_rssi),
                    (
                        "thread_parentRloc16",
                        parent.rloc16.as_ref().and_then(Rloc16::value),
                    ),
                ],
                None => Vec::new(),
            },
            Reading::Impulse => vec![("impulse", Some(1.0))],
            Reading::Unknown => Vec::new(),
        };

        candidates
            .into_iter()
            .filter_map(|(name, value)| value.map(|value| (name, value)))
            .collect()
    }
}
