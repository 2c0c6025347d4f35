//! Row representation for query results.

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::value::SqlValue;

/// A row from a query result.
///
/// Columns keep the order the driver returned them in. Name lookups are
/// case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

impl Row {
    /// Create an empty row.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a row from parallel column and value lists.
    ///
    /// Extra columns or values beyond the shorter list are dropped.
    #[must_use]
    pub fn from_parts(mut columns: Vec<String>, mut values: Vec<SqlValue>) -> Self {
        let len = columns.len().min(values.len());
        columns.truncate(len);
        values.truncate(len);
        Self { columns, values }
    }

    /// Builder-style column append.
    #[must_use]
    pub fn with(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.set(column, value);
        self
    }

    /// Set a column, replacing its value if present or appending it otherwise.
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<SqlValue>) {
        let column = column.into();
        let value = value.into();
        match self.position(&column) {
            Some(index) => self.values[index] = value,
            None => {
                self.columns.push(column);
                self.values.push(value);
            }
        }
    }

    /// Get the raw value by index.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    /// Get the raw value by column name.
    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<&SqlValue> {
        self.position(name).and_then(|i| self.values.get(i))
    }

    /// Get an integer column by name.
    pub fn get_i64(&self, name: &str) -> Result<i64, TypeError> {
        let value = self
            .get_by_name(name)
            .ok_or_else(|| TypeError::ColumnNotFound(name.to_string()))?;

        value.as_i64().ok_or_else(|| TypeError::TypeMismatch {
            expected: "int",
            actual: value.type_name().to_string(),
        })
    }

    /// Check whether the row has a column with this name.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Get the number of columns in the row.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if the row is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Column names, in order.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Iterate over (column, value) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }
}

impl IntoIterator for Row {
    type Item = (String, SqlValue);
    type IntoIter = std::iter::Zip<std::vec::IntoIter<String>, std::vec::IntoIter<SqlValue>>;

    fn into_iter(self) -> Self::IntoIter {
        self.columns.into_iter().zip(self.values)
    }
}

/// The outcome of one statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Rows returned by the statement, empty for most DML.
    pub rows: Vec<Row>,
    /// Rows inserted, updated or deleted.
    pub rows_affected: u64,
}

impl QueryResult {
    /// A result carrying only an affected-row count.
    #[must_use]
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows: Vec::new(),
            rows_affected,
        }
    }

    /// A result carrying rows.
    #[must_use]
    pub fn with_rows(rows: Vec<Row>) -> Self {
        Self {
            rows,
            rows_affected: 0,
        }
    }

    /// First row, if any.
    #[must_use]
    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }
}
