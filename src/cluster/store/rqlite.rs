use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::{
    ConfigStore, StoredValue, VersionExtractor, WriteCondition, check_condition,
    default_extractor, observe, stored_value,
};
use crate::cluster::error::{MembershipError, Result};

const EXECUTE_PATH: &str = "/db/execute";
const QUERY_PATH: &str = "/db/query";
const NO_TABLE_ERROR: &str = "no such table";
const ROW_EXISTS_ERROR: &str = "UNIQUE constraint failed";

/// Configuration store backed by one row of an rqlite table.
///
/// The row is keyed by cluster name; the value column holds the hex-encoded
/// blob and the version column a row counter used to guard updates.
pub struct RqliteStore {
    client: reqwest::Client,
    base_url: String,
    table: String,
    key: String,
    extractor: VersionExtractor,
    shut_down: AtomicBool,
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(default)]
    results: Vec<StatementResult>,
}

#[derive(Debug, Default, Deserialize)]
struct StatementResult {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    rows_affected: u64,
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

/// A row as stored: blob plus row counter.
struct Row {
    value: StoredValue,
    row_version: u64,
}

fn backend_error(e: reqwest::Error) -> MembershipError {
    MembershipError::Backend(format!("rqlite: {}", e))
}

fn valid_table_name(table: &str) -> bool {
    !table.is_empty()
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !table.starts_with(|c: char| c.is_ascii_digit())
}

impl RqliteStore {
    /// Connect to the rqlite node at `url`.
    ///
    /// Nothing is sent until the first read or write; the table is created
    /// lazily by the first `CreateIfNotExists`.
    pub async fn connect(url: &str, table: &str, cluster: &str) -> Result<Self> {
        if !valid_table_name(table) {
            return Err(MembershipError::Config(format!(
                "invalid rqlite table name '{}'",
                table
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(backend_error)?;
        Ok(Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
            table: table.to_string(),
            key: cluster.to_string(),
            extractor: default_extractor(),
            shut_down: AtomicBool::new(false),
        })
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(MembershipError::ShuttingDown);
        }
        Ok(())
    }

    async fn post(&self, path: &str, statements: Value) -> Result<Vec<StatementResult>> {
        let response: Response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(&statements)
            .send()
            .await
            .map_err(backend_error)?
            .error_for_status()
            .map_err(backend_error)?
            .json()
            .await
            .map_err(backend_error)?;
        Ok(response.results)
    }

    async fn read_row(&self) -> Result<Option<Row>> {
        let statements = json!([[
            format!("select key, value, version from {} where key = ?", self.table),
            self.key
        ]]);
        let results = self.post(QUERY_PATH, statements).await?;
        let result = results.into_iter().next().unwrap_or_default();

        if let Some(error) = result.error {
            if error.starts_with(NO_TABLE_ERROR) {
                return Ok(None);
            }
            return Err(MembershipError::Backend(format!("rqlite query: {}", error)));
        }
        let Some(row) = result.values.into_iter().next() else {
            return Ok(None);
        };
        parse_row(&row, &self.extractor).map(Some)
    }

    async fn execute_checked(&self, statements: Value) -> Result<Vec<StatementResult>> {
        let results = self.post(EXECUTE_PATH, statements).await?;
        debug!(statements = results.len(), "rqlite execute");
        Ok(results)
    }

    async fn create(&self, bytes: &Bytes) -> Result<()> {
        let statements = json!([
            [format!(
                "create table if not exists {}(key text primary key, value text, version integer) strict",
                self.table
            )],
            [
                format!("insert into {} (key, value, version) values (?, ?, 0)", self.table),
                self.key,
                hex::encode(bytes)
            ]
        ]);
        let results = self.execute_checked(statements).await?;
        let insert = results.into_iter().nth(1).unwrap_or_default();
        match insert.error {
            Some(error) if error.starts_with(ROW_EXISTS_ERROR) => {
                let actual = self.read_row().await.ok().flatten().map(|r| r.value.version);
                Err(MembershipError::Conflict {
                    expected: None,
                    actual,
                })
            }
            Some(error) => Err(MembershipError::Backend(format!("rqlite insert: {}", error))),
            None if insert.rows_affected == 1 => Ok(()),
            None => Err(MembershipError::Backend(format!(
                "rqlite insert affected {} rows",
                insert.rows_affected
            ))),
        }
    }

    async fn update(&self, bytes: &Bytes, row_version: u64) -> Result<bool> {
        let statements = json!([[
            format!(
                "update {} set value = ?, version = ? where key = ? and version = ?",
                self.table
            ),
            hex::encode(bytes),
            row_version + 1,
            self.key,
            row_version
        ]]);
        let results = self.execute_checked(statements).await?;
        let update = results.into_iter().next().unwrap_or_default();
        match update.error {
            Some(error) => Err(MembershipError::Backend(format!("rqlite update: {}", error))),
            None => match update.rows_affected {
                0 => Ok(false),
                1 => Ok(true),
                n => Err(MembershipError::Backend(format!(
                    "rqlite update affected {} rows",
                    n
                ))),
            },
        }
    }

    async fn write_inner(&self, bytes: Bytes, condition: WriteCondition) -> Result<()> {
        let row = self.read_row().await?;
        check_condition(
            row.as_ref().map(|r| r.value.version),
            &bytes,
            condition,
            &self.extractor,
        )?;

        let Some(row) = row else {
            return self.create(&bytes).await;
        };
        if self.update(&bytes, row.row_version).await? {
            return Ok(());
        }
        let actual = self.read_row().await.ok().flatten().map(|r| r.value.version);
        Err(MembershipError::Conflict {
            expected: match condition {
                WriteCondition::CompareVersionAndSwap(v) => Some(v),
                _ => Some(row.value.version),
            },
            actual,
        })
    }
}

fn parse_row(row: &[Value], extractor: &VersionExtractor) -> Result<Row> {
    let (Some(value), Some(row_version)) = (
        row.get(1).and_then(Value::as_str),
        row.get(2).and_then(Value::as_u64),
    ) else {
        return Err(MembershipError::Corrupt(format!(
            "unexpected rqlite row shape: {:?}",
            row
        )));
    };
    let bytes = hex::decode(value)
        .map_err(|e| MembershipError::Corrupt(format!("rqlite value is not hex: {}", e)))?;
    Ok(Row {
        value: stored_value(Bytes::from(bytes), extractor)?,
        row_version,
    })
}

#[async_trait]
impl ConfigStore for RqliteStore {
    async fn read(&self) -> Result<Option<StoredValue>> {
        self.ensure_running()?;
        let started = Instant::now();
        let result = self.read_row().await.map(|r| r.map(|row| row.value));
        observe("rqlite", "read", started, &result);
        result
    }

    async fn write(&self, bytes: Bytes, condition: WriteCondition) -> Result<()> {
        self.ensure_running()?;
        let started = Instant::now();
        let result = self.write_inner(bytes, condition).await;
        observe("rqlite", "write", started, &result);
        result
    }

    fn describe(&self) -> String {
        format!("{}/{}/{}", self.base_url, self.table, self.key)
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::codec;
    use crate::cluster::configuration::NodesConfiguration;
    use crate::types::ConfigVersion;

    #[test]
    fn test_table_name_validation() {
        assert!(valid_table_name("nodes_config"));
        assert!(!valid_table_name("1nodes"));
        assert!(!valid_table_name("a;drop"));
        assert!(!valid_table_name(""));
    }

    #[test]
    fn test_parse_row() {
        let mut cfg = NodesConfiguration::empty();
        cfg.version = ConfigVersion(9);
        let blob = codec::encode(&cfg).unwrap();
        let row = vec![json!("alpha"), json!(hex::encode(&blob)), json!(4)];
        let parsed = parse_row(&row, &default_extractor()).unwrap();
        assert_eq!(parsed.value.version, ConfigVersion(9));
        assert_eq!(parsed.row_version, 4);
    }

    #[test]
    fn test_parse_row_rejects_bad_shape() {
        let row = vec![json!("alpha"), json!(12)];
        assert!(matches!(
            parse_row(&row, &default_extractor()),
            Err(MembershipError::Corrupt(_))
        ));
    }

    #[test]
    fn test_response_deserialization() {
        let body = r#"{"results":[{"error":"no such table: t"},{"rows_affected":1}]}"#;
        let response: Response = serde_json::from_str(body).unwrap();
        assert!(
            response.results[0]
                .error
                .as_deref()
                .unwrap()
                .starts_with(NO_TABLE_ERROR)
        );
        assert_eq!(response.results[1].rows_affected, 1);
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_table() {
        assert!(
            RqliteStore::connect("http://localhost:4001", "bad-name", "c")
                .await
                .is_err()
        );
    }
}
