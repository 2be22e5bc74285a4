//! Turns nested JSON records into a flat, column-oriented table.
//!
//! Nested objects become `parent.child` columns. Lists and empty objects are kept as their
//! JSON text, since warehouse columns hold scalars only.

use crate::PipelineError;
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

pub const SEPARATOR: &str = ".";

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<&Value> for Cell {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Cell::Null,
            Value::Bool(b) => Cell::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Cell::Int(i),
                None => n.as_f64().map_or_else(|| Cell::Text(n.to_string()), Cell::Float),
            },
            Value::String(s) => Cell::Text(s.clone()),
            Value::Array(_) | Value::Object(_) => Cell::Text(value.to_string()),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => Ok(()),
            Cell::Bool(b) => write!(f, "{}", b),
            Cell::Int(i) => write!(f, "{}", i),
            Cell::Float(x) => write!(f, "{}", x),
            Cell::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Table {
    columns: Vec<String>,
    index: HashMap<String, usize>,
    rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn column(&self, name: &str) -> Option<impl Iterator<Item = &Cell>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(move |row| &row[idx]))
    }

    fn ensure_column(&mut self, name: &str) -> usize {
        if let Some(idx) = self.column_index(name) {
            return idx;
        }

        let idx = self.columns.len();
        self.columns.push(name.to_string());
        self.index.insert(name.to_string(), idx);
        for row in &mut self.rows {
            row.push(Cell::Null);
        }
        idx
    }

    fn push_row(&mut self, fields: Vec<(String, Cell)>) {
        let mut row = vec![Cell::Null; self.columns.len()];
        for (name, cell) in fields {
            let idx = self.ensure_column(&name);
            if idx >= row.len() {
                row.resize(idx + 1, Cell::Null);
            }
            row[idx] = cell;
        }
        row.resize(self.columns.len(), Cell::Null);
        self.rows.push(row);
    }

    /// Appends `other` below this table, widening both to the union of their columns.
    pub fn append(&mut self, other: Table) {
        let Table { columns, rows, .. } = other;
        for row in rows {
            self.push_row(columns.iter().cloned().zip(row).collect());
        }
    }

    /// Sets `name` to `value` on every row, adding the column if needed.
    pub fn with_constant(mut self, name: &str, value: Cell) -> Self {
        let idx = self.ensure_column(name);
        for row in &mut self.rows {
            row[idx] = value.clone();
        }
        self
    }

    /// Adds a `name` column holding the text of `sources` concatenated, in order.
    pub fn with_key(mut self, name: &str, sources: &[&str]) -> Result<Self> {
        let source_idx = sources
            .iter()
            .map(|source| {
                self.column_index(source).ok_or_else(|| {
                    PipelineError::DataUnavailable(format!("missing key column {}", source))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let idx = self.ensure_column(name);
        for row in &mut self.rows {
            let key: String = source_idx.iter().map(|i| row[*i].to_string()).collect();
            row[idx] = Cell::Text(key);
        }
        Ok(self)
    }
}

fn flatten_into(prefix: &str, value: &Value, out: &mut Vec<(String, Cell)>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                let name = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}{}{}", prefix, SEPARATOR, key)
                };
                flatten_into(&name, child, out);
            }
        }
        _ => {
            let name = if prefix.is_empty() { "value" } else { prefix };
            out.push((name.to_string(), Cell::from(value)));
        }
    }
}

/// One row per record.
pub fn normalize(records: &[Value]) -> Table {
    let mut table = Table::default();
    for record in records {
        let mut fields = Vec::new();
        flatten_into("", record, &mut fields);
        table.push_row(fields);
    }
    table
}

/// One row per element of the list found at `path` in each record, with each `meta` path of
/// the parent copied onto all of its child rows. A parent without a list at `path` yields no
/// rows; a missing meta value is null.
pub fn normalize_nested(records: &[Value], path: &str, meta: &[&[&str]]) -> Table {
    let mut table = Table::default();
    for record in records {
        let Some(children) = record.get(path).and_then(Value::as_array) else {
            continue;
        };

        let broadcast: Vec<(String, Cell)> = meta
            .iter()
            .map(|keys| {
                let value = keys
                    .iter()
                    .try_fold(record, |value, key| value.get(key))
                    .unwrap_or(&Value::Null);
                (keys.join(SEPARATOR), Cell::from(value))
            })
            .collect();

        for child in children {
            let mut fields = Vec::new();
            flatten_into("", child, &mut fields);
            fields.extend(broadcast.iter().cloned());
            table.push_row(fields);
        }
    }
    table
}
