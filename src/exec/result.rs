use crate::storage::{Row, Type};

/// The result protocol emitted at the core's boundary: column
/// metadata plus either rows (queries) or an affected-row count
/// (DML). Errors travel separately as `GraniteError` (kind, message).
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<ResultColumn>,
    pub rows: Vec<Row>,
    pub rows_affected: Option<u64>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultColumn {
    pub name: String,
    pub ctype: Option<Type>,
}

impl QueryResult {
    pub fn rows(columns: Vec<ResultColumn>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows,
            rows_affected: None,
            warnings: Vec::new(),
        }
    }

    pub fn affected(count: u64) -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            rows_affected: Some(count),
            warnings: Vec::new(),
        }
    }

    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            rows_affected: None,
            warnings: Vec::new(),
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}
