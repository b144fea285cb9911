// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/fleetsim

//! REST SQL client for TDengine (taosAdapter on 3.x, httpd on 2.x)

use std::time::Duration;

use base64::Engine as _;
use reqwest::blocking::Client;
use reqwest::header::AUTHORIZATION;
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::schema::{quote, sanitize};
use super::SqlBackend;
use crate::config::TimeSeriesSettings;
use crate::sinks::SinkError;

/// "Table already exists" on 2.x servers
pub const TABLE_EXISTS: i64 = 1539;

/// Parsed body of a REST SQL response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    pub fn records(&self) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| self.columns.iter().cloned().zip(row.iter().cloned()).collect())
            .collect()
    }

    /// Row count reported for a write statement
    pub fn affected_rows(&self) -> u64 {
        if self.columns.len() == 1 && self.columns[0] == "affected_rows" {
            return self
                .rows
                .first()
                .and_then(|r| r.first())
                .and_then(Value::as_u64)
                .unwrap_or(0);
        }
        self.rows.len() as u64
    }
}

/// Accepts both the 2.x (`status`/`head`) and 3.x (`code`/`column_meta`) shapes
pub fn parse_response(body: &Value) -> Result<QueryResult, SinkError> {
    let code = body.get("code").and_then(Value::as_i64).unwrap_or(0);
    let errored = body.get("status").and_then(Value::as_str) == Some("error") || code != 0;

    if errored {
        if code == TABLE_EXISTS {
            return Ok(QueryResult::default());
        }
        let desc = body
            .get("desc")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Err(SinkError::Rejected { code, desc });
    }

    let columns = if let Some(head) = body.get("head").and_then(Value::as_array) {
        head.iter().filter_map(Value::as_str).map(str::to_string).collect()
    } else {
        body.get("column_meta")
            .and_then(Value::as_array)
            .map(|meta| {
                meta.iter()
                    .filter_map(|m| m.get(0).or_else(|| m.get("name")).and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };

    let rows = body
        .get("data")
        .and_then(Value::as_array)
        .map(|data| data.iter().filter_map(Value::as_array).cloned().collect())
        .unwrap_or_default();

    Ok(QueryResult { columns, rows })
}

pub fn basic_auth(user: &str, password: &str) -> String {
    let token = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, password));
    format!("Basic {}", token)
}

/// Blocking client bound to one database
pub struct RestBackend {
    client: Client,
    base_url: String,
    database: String,
    auth: String,
}

impl RestBackend {
    /// Check the server answers, then make sure the database exists
    pub fn connect(settings: &TimeSeriesSettings) -> Result<Self, SinkError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms.max(1)))
            .build()
            .map_err(|e| SinkError::Transport(e.to_string()))?;

        let backend = Self {
            client,
            base_url: settings.base_url(),
            database: sanitize(&settings.database),
            auth: basic_auth(&settings.user, &settings.password),
        };

        let version = backend.post(&backend.server_url(), "SELECT SERVER_VERSION()")?;
        let version = version
            .rows
            .first()
            .and_then(|r| r.first())
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        info!("Connected to time-series store {} (server {})", backend.base_url, version);

        backend.post(
            &backend.server_url(),
            &format!("CREATE DATABASE IF NOT EXISTS {}", quote(&backend.database)),
        )?;
        Ok(backend)
    }

    fn server_url(&self) -> String {
        format!("{}/rest/sql", self.base_url)
    }

    fn database_url(&self) -> String {
        format!("{}/rest/sql/{}", self.base_url, self.database)
    }

    fn post(&self, url: &str, sql: &str) -> Result<QueryResult, SinkError> {
        debug!("SQL: {}", sql);
        let response = self
            .client
            .post(url)
            .header(AUTHORIZATION, &self.auth)
            .body(sql.to_string())
            .send()
            .map_err(|e| SinkError::Transport(e.to_string()))?;

        let status = response.status();
        let body: Value = response
            .json()
            .map_err(|e| SinkError::Transport(format!("HTTP {}: {}", status, e)))?;
        parse_response(&body)
    }
}

impl SqlBackend for RestBackend {
    fn execute(&mut self, sql: &str) -> Result<u64, SinkError> {
        let url = self.database_url();
        Ok(self.post(&url, sql)?.affected_rows())
    }

    fn query(&mut self, sql: &str) -> Result<Vec<Map<String, Value>>, SinkError> {
        let url = self.database_url();
        Ok(self.post(&url, sql)?.records())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_v3_query() {
        let body = json!({
            "code": 0,
            "column_meta": [["field", "VARCHAR", 64], ["type", "VARCHAR", 32], ["length", "INT", 4], ["note", "VARCHAR", 8]],
            "data": [["ts", "TIMESTAMP", 8, ""], ["site", "NCHAR", 64, "TAG"]],
            "rows": 2
        });
        let result = parse_response(&body).unwrap();
        let records = result.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["field"], "site");
        assert_eq!(records[1]["note"], "TAG");
    }

    #[test]
    fn test_parse_v2_write() {
        let body = json!({"status": "succ", "head": ["affected_rows"], "data": [[3]], "rows": 1});
        assert_eq!(parse_response(&body).unwrap().affected_rows(), 3);

        let v3 = json!({"code": 0, "column_meta": [["affected_rows", "INT", 4]], "data": [[2]], "rows": 1});
        assert_eq!(parse_response(&v3).unwrap().affected_rows(), 2);
    }

    #[test]
    fn test_parse_errors() {
        let exists = json!({"status": "error", "code": 1539, "desc": "Table already exists"});
        assert_eq!(parse_response(&exists).unwrap(), QueryResult::default());

        let syntax = json!({"code": 9728, "desc": "syntax error near 'x'"});
        match parse_response(&syntax) {
            Err(SinkError::Rejected { code, desc }) => {
                assert_eq!(code, 9728);
                assert!(desc.contains("syntax"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_basic_auth() {
        assert_eq!(basic_auth("root", "taosdata"), "Basic cm9vdDp0YW9zZGF0YQ==");
    }

    #[test]
    fn test_unreachable_server_is_transport_error() {
        let settings = TimeSeriesSettings {
            enabled: true,
            host: "127.0.0.1".into(),
            port: 1,
            timeout_ms: 500,
            ..Default::default()
        };
        assert!(matches!(RestBackend::connect(&settings), Err(SinkError::Transport(_))));
    }
}
