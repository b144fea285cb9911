// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/fleetsim

//! Super table layout, SQL generation and additive schema sync

use std::collections::HashSet;

use serde_json::Value;
use tracing::{debug, info};

use super::SqlBackend;
use crate::model::{Device, GeneratedSample, ParameterDefinition, SampleValue, ValueKind};
use crate::sinks::SinkError;

pub const TIMESTAMP_COLUMN: &str = "ts";
pub const NAME_TAG: &str = "device_name";
pub const MODEL_TAG: &str = "device_model";
const TAG_TEXT_TYPE: &str = "NCHAR(64)";

/// Identifier safe for any TDengine version: ASCII alphanumerics and `_`
pub fn sanitize(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c.to_ascii_lowercase() } else { '_' })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

pub fn quote(ident: &str) -> String {
    format!("`{}`", ident)
}

pub fn column_type(kind: ValueKind) -> &'static str {
    match kind {
        ValueKind::Number => "DOUBLE",
        ValueKind::Boolean => "BOOL",
        ValueKind::String => "NCHAR(255)",
    }
}

pub fn string_literal(text: &str) -> String {
    format!("'{}'", text.replace('\\', "\\\\").replace('\'', "\\'"))
}

pub fn value_literal(value: &SampleValue) -> String {
    match value {
        SampleValue::Null => "NULL".to_string(),
        SampleValue::Bool(b) => b.to_string(),
        SampleValue::Number(n) if n.is_finite() => n.to_string(),
        SampleValue::Number(_) => "NULL".to_string(),
        SampleValue::Text(s) => string_literal(s),
    }
}

pub fn sub_table_name(device_id: &str) -> String {
    format!("device_{}", sanitize(device_id))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub sql_type: &'static str,
}

/// Wide per-category table: timestamp, one column per value parameter, tags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperTable {
    pub name: String,
    pub columns: Vec<Column>,
    pub tags: Vec<Column>,
}

impl SuperTable {
    pub fn for_device(device: &Device) -> Self {
        let mut seen: HashSet<String> = [TIMESTAMP_COLUMN, NAME_TAG, MODEL_TAG].iter().map(|s| s.to_string()).collect();
        let mut columns = Vec::new();
        let mut tags = vec![
            Column { name: NAME_TAG.to_string(), sql_type: TAG_TEXT_TYPE },
            Column { name: MODEL_TAG.to_string(), sql_type: TAG_TEXT_TYPE },
        ];

        for parameter in &device.parameters {
            let name = sanitize(&parameter.id);
            if !seen.insert(name.clone()) {
                continue;
            }
            if parameter.is_tag {
                let sql_type = match parameter.kind {
                    ValueKind::String => TAG_TEXT_TYPE,
                    kind => column_type(kind),
                };
                tags.push(Column { name, sql_type });
            } else {
                columns.push(Column { name, sql_type: column_type(parameter.kind) });
            }
        }

        Self {
            name: sanitize(&device.category),
            columns,
            tags,
        }
    }

    /// Stable fingerprint of the layout, used to skip redundant syncs
    pub fn signature(&self) -> String {
        let describe = |cols: &[Column]| {
            cols.iter().map(|c| format!("{}:{}", c.name, c.sql_type)).collect::<Vec<_>>().join(",")
        };
        format!("{}|{}", describe(&self.columns), describe(&self.tags))
    }

    pub fn create_sql(&self) -> String {
        let mut columns = vec![format!("{} TIMESTAMP", quote(TIMESTAMP_COLUMN))];
        columns.extend(self.columns.iter().map(|c| format!("{} {}", quote(&c.name), c.sql_type)));
        let tags: Vec<String> = self.tags.iter().map(|c| format!("{} {}", quote(&c.name), c.sql_type)).collect();
        format!(
            "CREATE STABLE IF NOT EXISTS {} ({}) TAGS ({})",
            quote(&self.name),
            columns.join(", "),
            tags.join(", ")
        )
    }

    /// ALTER statements for everything missing from the live table.
    /// Existing columns and tags are never dropped or retyped.
    pub fn alter_sql(&self, existing_columns: &HashSet<String>, existing_tags: &HashSet<String>) -> Vec<String> {
        let table = quote(&self.name);
        let mut statements = Vec::new();
        for column in &self.columns {
            if !existing_columns.contains(&column.name) && !existing_tags.contains(&column.name) {
                statements.push(format!("ALTER STABLE {} ADD COLUMN {} {}", table, quote(&column.name), column.sql_type));
            }
        }
        for tag in &self.tags {
            if !existing_tags.contains(&tag.name) && !existing_columns.contains(&tag.name) {
                statements.push(format!("ALTER STABLE {} ADD TAG {} {}", table, quote(&tag.name), tag.sql_type));
            }
        }
        statements
    }

    /// Sub-table for one device, tag values taken from the device definition
    pub fn create_sub_table_sql(&self, device: &Device) -> String {
        let tag_names: Vec<String> = self.tags.iter().map(|t| quote(&t.name)).collect();
        let tag_values: Vec<String> = self.tags.iter().map(|t| tag_value(device, &t.name)).collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} USING {} ({}) TAGS ({})",
            quote(&sub_table_name(&device.id)),
            quote(&self.name),
            tag_names.join(", "),
            tag_values.join(", ")
        )
    }

    /// Multi-row insert of the value parameters. Tag parameters are left out.
    pub fn insert_sql(&self, device: &Device, samples: &[GeneratedSample]) -> Option<String> {
        if samples.is_empty() {
            return None;
        }
        // First parameter wins a sanitized name, as in `for_device`
        let mut emitted = HashSet::new();
        let parameters: Vec<(&ParameterDefinition, String)> = device
            .value_parameters()
            .map(|p| (p, sanitize(&p.id)))
            .filter(|(_, name)| self.columns.iter().any(|c| &c.name == name) && emitted.insert(name.clone()))
            .collect();

        let mut columns = vec![quote(TIMESTAMP_COLUMN)];
        columns.extend(parameters.iter().map(|(_, name)| quote(name)));

        let rows: Vec<String> = samples
            .iter()
            .map(|sample| {
                let mut values = vec![sample.timestamp_millis().to_string()];
                values.extend(
                    parameters
                        .iter()
                        .map(|(p, _)| sample.get(&p.id).map(value_literal).unwrap_or_else(|| "NULL".to_string())),
                );
                format!("({})", values.join(", "))
            })
            .collect();

        Some(format!(
            "INSERT INTO {} ({}) VALUES {}",
            quote(&sub_table_name(&device.id)),
            columns.join(", "),
            rows.join(" ")
        ))
    }
}

fn tag_value(device: &Device, tag: &str) -> String {
    match tag {
        NAME_TAG => string_literal(device.display_name()),
        MODEL_TAG => device.model.as_deref().map(string_literal).unwrap_or_else(|| "NULL".to_string()),
        _ => device
            .tag_parameters()
            .find(|p| sanitize(&p.id) == tag)
            .and_then(|p| p.default_value.as_ref())
            .map(|v| value_literal(&SampleValue::from_json(v)))
            .unwrap_or_else(|| "NULL".to_string()),
    }
}

/// Outcome of one schema sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: bool,
    pub altered: usize,
}

fn field<'a>(row: &'a serde_json::Map<String, Value>, names: &[&str]) -> Option<&'a str> {
    names.iter().find_map(|n| row.get(*n)).and_then(Value::as_str)
}

/// Create the super table if absent, otherwise add whatever it is missing
pub fn sync_schema(backend: &mut dyn SqlBackend, table: &SuperTable) -> Result<SyncReport, SinkError> {
    let rows = backend.query(&format!("SHOW STABLES LIKE {}", string_literal(&table.name)))?;
    let exists = rows
        .iter()
        .any(|row| row.values().any(|v| v.as_str() == Some(table.name.as_str())));

    if !exists {
        backend.execute(&table.create_sql())?;
        info!("Created super table {}", table.name);
        return Ok(SyncReport { created: true, altered: 0 });
    }

    let mut columns = HashSet::new();
    let mut tags = HashSet::new();
    for row in backend.query(&format!("DESCRIBE {}", quote(&table.name)))? {
        let Some(name) = field(&row, &["field", "Field"]) else { continue };
        let is_tag = field(&row, &["note", "Note"]).is_some_and(|n| n.eq_ignore_ascii_case("TAG"));
        if is_tag {
            tags.insert(name.to_string());
        } else {
            columns.insert(name.to_string());
        }
    }

    let mut report = SyncReport::default();
    for statement in table.alter_sql(&columns, &tags) {
        match backend.execute(&statement) {
            Ok(_) => {
                report.altered += 1;
                info!("Schema evolved: {}", statement);
            }
            Err(SinkError::Rejected { code, desc }) => {
                debug!("Ignoring schema change rejection {} ({}): {}", code, desc, statement);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(report)
}
