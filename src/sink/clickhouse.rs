use super::{check_response, BatchWriter, MeasurementRow, SinkError};
use crate::config::DbConfig;
use crate::telemetry::SensorEvent;
use anyhow::Result;
use std::time::Duration;
use url::Url;

const INSERT_QUERY: &str = "INSERT INTO measurements FORMAT JSONEachRow";

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS measurements (
    ts             DateTime64(3) Codec(DoubleDelta, LZ4),
    instance       LowCardinality(String),
    metric_names   Array(LowCardinality(String)),
    metric_values  Array(Float32) Codec(Gorilla, LZ4)
) ENGINE = MergeTree()
PARTITION BY toYYYYMM(ts)
ORDER BY (ts, instance)
"#;

/// ClickHouse over its HTTP interface.
pub struct ClickHouseWriter {
    client: reqwest::Client,
    endpoint: Url,
    username: Option<String>,
    password: Option<String>,
    database: String,
}

impl ClickHouseWriter {
    pub fn new(config: &DbConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.base_url()?,
            username: config.username.clone(),
            password: config.password.clone(),
            database: config.database.clone(),
        })
    }

    async fn post(&self, query: Option<&str>, body: String) -> Result<(), SinkError> {
        let mut params = vec![
            ("database", self.database.as_str()),
            ("date_time_input_format", "best_effort"),
        ];
        if let Some(query) = query {
            params.push(("query", query));
        }
        let mut request = self.client.post(self.endpoint.clone()).query(&params).body(body);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }
        let response = request.send().await?;
        check_response(response).await
    }
}

/// `JSONEachRow` body: one JSON object per line.
pub(super) fn encode_rows(rows: &[MeasurementRow]) -> Result<String, SinkError> {
    let mut body = String::new();
    for row in rows {
        body.push_str(&serde_json::to_string(row)?);
        body.push('\n');
    }
    Ok(body)
}

impl BatchWriter for ClickHouseWriter {
    type Row = MeasurementRow;

    fn backend(&self) -> &'static str {
        "clickhouse"
    }

    fn rows_from_event(&self, event: &SensorEvent) -> Vec<MeasurementRow> {
        MeasurementRow::from_event(event).into_iter().collect()
    }

    async fn ensure_schema(&self) -> Result<(), SinkError> {
        self.post(None, CREATE_TABLE.to_string()).await
    }

    async fn write_rows(&self, rows: &[MeasurementRow]) -> Result<(), SinkError> {
        let body = encode_rows(rows)?;
        self.post(Some(INSERT_QUERY), body).await
    }
}
