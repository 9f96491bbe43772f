use anyhow::{anyhow, bail, Context, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

const DEFAULT_SETUP_CONFIG_PATH: &str = "/etc/sensor-db-bridge/config.json";
const DEFAULT_TOPIC: &str = "/sensor/+/+/state";
const DEFAULT_RETRY_MS: u64 = 10_000;
const DEFAULT_BUFFER_MAX_AGE_MS: u64 = 5_000;
const MASK_CHAR: char = '*';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    ClickHouse,
    InfluxDb,
    Timescale,
    Simulator,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::ClickHouse => "clickhouse",
            Backend::InfluxDb => "influxdb",
            Backend::Timescale => "timescale",
            Backend::Simulator => "simulator",
        }
    }

    /// Row stores batch one row per event, point stores one point per metric.
    fn default_buffer_max_items(&self) -> usize {
        match self {
            Backend::ClickHouse | Backend::Timescale => 5000,
            Backend::InfluxDb | Backend::Simulator => 1000,
        }
    }

    fn default_port(&self, protocol: &str) -> u16 {
        match self {
            Backend::ClickHouse if protocol == "https" => 8443,
            Backend::ClickHouse => 8123,
            Backend::InfluxDb => 8086,
            Backend::Timescale => 5432,
            Backend::Simulator => 0,
        }
    }
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "clickhouse" => Ok(Backend::ClickHouse),
            "influx" | "influxdb" => Ok(Backend::InfluxDb),
            "timescale" | "timescaledb" | "postgres" => Ok(Backend::Timescale),
            "simulator" | "stdout" => Ok(Backend::Simulator),
            other => Err(anyhow!("unknown DB_BACKEND {other:?}")),
        }
    }
}

/// Store connection settings shared by every backend.
#[derive(Clone, Debug)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: String,
    pub database_url: Option<String>,
    pub pool_size: u32,
}

#[derive(Serialize)]
struct RedactedDbConfig<'a> {
    host: &'a str,
    port: u16,
    protocol: &'a str,
    username: Option<&'a str>,
    password: String,
    database: &'a str,
}

impl DbConfig {
    pub fn base_url(&self) -> Result<Url> {
        Url::parse(&format!("{}://{}:{}/", self.protocol, self.host, self.port))
            .with_context(|| format!("invalid store address {}:{}", self.host, self.port))
    }

    /// Connection URL for sqlx, either given verbatim or assembled from parts.
    pub fn postgres_url(&self) -> Result<String> {
        if let Some(url) = &self.database_url {
            return Ok(url.clone());
        }
        let mut url = Url::parse(&format!(
            "postgres://{}:{}/{}",
            self.host, self.port, self.database
        ))
        .context("invalid postgres address")?;
        if let Some(username) = &self.username {
            url.set_username(username)
                .map_err(|_| anyhow!("invalid DB_USERNAME"))?;
            url.set_password(self.password.as_deref())
                .map_err(|_| anyhow!("invalid DB_PASSWORD"))?;
        }
        Ok(url.to_string())
    }

    pub fn redacted_json(&self) -> String {
        let view = RedactedDbConfig {
            host: &self.host,
            port: self.port,
            protocol: &self.protocol,
            username: self.username.as_deref(),
            password: mask_secret(self.password.as_deref()),
            database: &self.database,
        };
        serde_json::to_string_pretty(&view).unwrap_or_default()
    }
}

/// First two characters stay readable, the rest is masked.
pub fn mask_secret(secret: Option<&str>) -> String {
    match secret {
        None => "undefined".to_string(),
        Some(secret) => secret
            .chars()
            .enumerate()
            .map(|(idx, c)| if idx < 2 { c } else { MASK_CHAR })
            .collect(),
    }
}

fn setup_config_path() -> PathBuf {
    match env_optional("BRIDGE_SETUP_CONFIG_PATH") {
        Some(path) => PathBuf::from(path),
        None => PathBuf::from(DEFAULT_SETUP_CONFIG_PATH),
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    mqtt_broker: Option<String>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    mqtt_client_id: Option<String>,
    #[serde(default)]
    db_backend: Option<String>,
    #[serde(default)]
    db_host: Option<String>,
    #[serde(default)]
    db_port: Option<u16>,
    #[serde(default)]
    db_username: Option<String>,
    #[serde(default)]
    db_password: Option<String>,
    #[serde(default)]
    db_database: Option<String>,
    #[serde(default)]
    buffer_max_items: Option<usize>,
    #[serde(default)]
    buffer_max_age_ms: Option<u64>,
    #[serde(default)]
    db_insert_retry_ms: Option<u64>,
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = setup_config_path();
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_tls: bool,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub mqtt_topic: String,
    pub mqtt_keepalive_secs: u64,
    pub backend: Backend,
    pub db: DbConfig,
    pub buffer_max_items: usize,
    pub buffer_max_age_ms: u64,
    pub retry_delay_ms: u64,
    pub stats_interval_ms: u64,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let overrides = load_setup_config_overrides().unwrap_or_default();
        Self::resolve(overrides)
    }

    fn resolve(ov: SetupConfigOverrides) -> Result<Self> {
        let mqtt_broker = env_optional("MQTT_BROKER")
            .or(ov.mqtt_broker)
            .unwrap_or_else(|| "mqtt://127.0.0.1:1883".to_string());
        let (mqtt_host, mqtt_port, mqtt_tls) = parse_broker_url(&mqtt_broker)?;
        let mqtt_username = env_optional("MQTT_USERNAME").or(ov.mqtt_username);
        let mqtt_password = env_optional("MQTT_PASSWORD").or(ov.mqtt_password);
        let mqtt_client_id = env_optional("MQTT_CLIENT_ID")
            .or(ov.mqtt_client_id)
            .unwrap_or_else(|| format!("sensor-db-bridge-{}", std::process::id()));
        let mqtt_topic = env_optional("MQTT_TOPIC").unwrap_or_else(|| DEFAULT_TOPIC.to_string());
        let mqtt_keepalive_secs = env_u64("MQTT_KEEPALIVE_SECS")?.unwrap_or(30);

        let backend = match env_optional("DB_BACKEND").or(ov.db_backend) {
            Some(raw) => raw.parse::<Backend>()?,
            None => Backend::ClickHouse,
        };

        let protocol = env_optional("DB_PROTOCOL").unwrap_or_else(|| "https".to_string());
        if protocol != "http" && protocol != "https" {
            bail!("DB_PROTOCOL must be http or https, got {protocol:?}");
        }
        let port = match env_u64("DB_PORT")? {
            Some(port) => u16::try_from(port).context("DB_PORT out of range")?,
            None => ov
                .db_port
                .filter(|v| *v != 0)
                .unwrap_or_else(|| backend.default_port(&protocol)),
        };
        let db = DbConfig {
            host: env_optional("DB_HOST")
                .or(ov.db_host)
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            port,
            protocol,
            username: env_optional("DB_USERNAME").or(ov.db_username),
            password: env_optional("DB_PASSWORD").or(ov.db_password),
            database: env_optional("DB_DATABASE")
                .or(ov.db_database)
                .unwrap_or_else(|| "sensors".to_string()),
            database_url: env_optional("DATABASE_URL"),
            pool_size: env_u64("DB_POOL_SIZE")?.unwrap_or(5) as u32,
        };

        let buffer_max_items = match env_u64("BUFFER_MAX_ITEMS")? {
            Some(value) => value as usize,
            None => ov
                .buffer_max_items
                .unwrap_or_else(|| backend.default_buffer_max_items()),
        };
        if buffer_max_items == 0 {
            bail!("BUFFER_MAX_ITEMS must be at least 1");
        }
        let buffer_max_age_ms = env_u64("BUFFER_MAX_AGE_MS")?
            .or(ov.buffer_max_age_ms)
            .unwrap_or(DEFAULT_BUFFER_MAX_AGE_MS);
        let retry_delay_ms = env_u64("DB_INSERT_RETRY_MS")?
            .or(ov.db_insert_retry_ms)
            .unwrap_or(DEFAULT_RETRY_MS);
        let stats_interval_ms = env_u64("BRIDGE_STATS_INTERVAL_MS")?.unwrap_or(60_000);
        let otlp_endpoint = env_optional("OTEL_EXPORTER_OTLP_ENDPOINT");

        Ok(Self {
            mqtt_host,
            mqtt_port,
            mqtt_tls,
            mqtt_username,
            mqtt_password,
            mqtt_client_id,
            mqtt_topic,
            mqtt_keepalive_secs,
            backend,
            db,
            buffer_max_items,
            buffer_max_age_ms,
            retry_delay_ms,
            stats_interval_ms,
            otlp_endpoint,
        })
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn buffer_max_age(&self) -> Duration {
        Duration::from_millis(self.buffer_max_age_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms.max(1))
    }

    pub fn log_startup(&self) {
        tracing::info!(
            host = %self.mqtt_host,
            port = self.mqtt_port,
            tls = self.mqtt_tls,
            username = self.mqtt_username.as_deref().unwrap_or("undefined"),
            password = %mask_secret(self.mqtt_password.as_deref()),
            client_id = %self.mqtt_client_id,
            topic = %self.mqtt_topic,
            "MQTT configuration"
        );
        tracing::info!(
            backend = self.backend.as_str(),
            buffer_max_items = self.buffer_max_items,
            buffer_max_age_ms = self.buffer_max_age_ms,
            retry_delay_ms = self.retry_delay_ms,
            "store configuration:\n{}",
            self.db.redacted_json()
        );
    }
}

fn parse_broker_url(raw: &str) -> Result<(String, u16, bool)> {
    let url = Url::parse(raw.trim()).context("invalid MQTT_BROKER")?;
    let tls = match url.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        other => bail!("unsupported MQTT_BROKER scheme {other:?}"),
    };
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("MQTT_BROKER missing host"))?
        .to_string();
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });
    Ok((host, port, tls))
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(key: &str) -> Result<Option<u64>> {
    match env_optional(key) {
        Some(value) => value
            .parse::<u64>()
            .map(Some)
            .with_context(|| format!("invalid {key}")),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_all_but_two_characters() {
        assert_eq!(mask_secret(Some("hunter2")), "hu*****");
        assert_eq!(mask_secret(Some("ab")), "ab");
        assert_eq!(mask_secret(Some("")), "");
        assert_eq!(mask_secret(None), "undefined");
    }

    #[test]
    fn redacted_json_hides_password() {
        let db = DbConfig {
            host: "ch.example".to_string(),
            port: 8443,
            protocol: "https".to_string(),
            username: Some("writer".to_string()),
            password: Some("s3cret".to_string()),
            database: "sensors".to_string(),
            database_url: None,
            pool_size: 5,
        };
        let json = db.redacted_json();
        assert!(json.contains("s3****"));
        assert!(!json.contains("s3cret"));
    }

    #[test]
    fn parses_broker_urls() {
        assert_eq!(
            parse_broker_url("mqtt://broker.local").unwrap(),
            ("broker.local".to_string(), 1883, false)
        );
        assert_eq!(
            parse_broker_url("mqtts://broker.local:9000").unwrap(),
            ("broker.local".to_string(), 9000, true)
        );
        assert!(parse_broker_url("http://broker.local").is_err());
    }

    #[test]
    fn parses_backend_names() {
        assert_eq!("ClickHouse".parse::<Backend>().unwrap(), Backend::ClickHouse);
        assert_eq!("influx".parse::<Backend>().unwrap(), Backend::InfluxDb);
        assert_eq!("timescaledb".parse::<Backend>().unwrap(), Backend::Timescale);
        assert!("mongodb".parse::<Backend>().is_err());
    }

    #[test]
    fn postgres_url_is_assembled_from_parts() {
        let db = DbConfig {
            host: "db".to_string(),
            port: 5432,
            protocol: "https".to_string(),
            username: Some("writer".to_string()),
            password: Some("pw".to_string()),
            database: "sensors".to_string(),
            database_url: None,
            pool_size: 5,
        };
        assert_eq!(db.postgres_url().unwrap(), "postgres://writer:pw@db:5432/sensors");
    }
}
