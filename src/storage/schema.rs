use crate::{
    error::GraniteError,
    io::{Decodeable, Encodeable, GraniteReader},
    plan::ast::Expr,
    storage::{cell::Cell, cell::Type, tuple::Row},
    types::GraniteResult,
};

/// One column of a table: name, declared type, nullability, default.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub ctype: Type,
    pub nullable: bool,
    pub default: Option<Cell>,
}

impl Column {
    pub fn new(name: &str, ctype: Type) -> Self {
        Self {
            name: name.to_string(),
            ctype,
            nullable: true,
            default: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, default: Cell) -> Self {
        self.default = Some(default);
        self
    }
}

/// What happens to child rows when the referenced parent row goes away
/// (or its key changes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferentialAction {
    Restrict,
    Cascade,
    SetNull,
}

impl ReferentialAction {
    fn tag(&self) -> u8 {
        match self {
            ReferentialAction::Restrict => 0,
            ReferentialAction::Cascade => 1,
            ReferentialAction::SetNull => 2,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, GraniteError> {
        match tag {
            0 => Ok(ReferentialAction::Restrict),
            1 => Ok(ReferentialAction::Cascade),
            2 => Ok(ReferentialAction::SetNull),
            _ => Err(GraniteError::storage(&format!(
                "invalid referential action tag: {}",
                tag
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKey {
    pub name: String,
    pub columns: Vec<String>,
    pub parent_table: String,
    pub parent_columns: Vec<String>,
    pub on_delete: ReferentialAction,
    pub on_update: ReferentialAction,
}

/// The declared shape of a table: ordered columns plus constraints.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    pub columns: Vec<Column>,
    /// Empty when the table has no primary key.
    pub primary_key: Vec<String>,
    /// Named unique constraints over column lists.
    pub uniques: Vec<(String, Vec<String>)>,
    pub foreign_keys: Vec<ForeignKey>,
    /// Named CHECK constraints, evaluated on insert and update.
    pub checks: Vec<(String, Expr)>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            columns,
            primary_key: Vec::new(),
            uniques: Vec::new(),
            foreign_keys: Vec::new(),
            checks: Vec::new(),
        }
    }

    pub fn with_primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, i: usize) -> &Column {
        &self.columns[i]
    }

    /// Resolve a list of column names to their indexes. Fails with a
    /// semantic error on an unknown name.
    pub fn resolve_columns(&self, names: &[String]) -> Result<Vec<usize>, GraniteError> {
        names
            .iter()
            .map(|name| {
                self.column_index(name).ok_or_else(|| {
                    GraniteError::semantic(&format!("unknown column: {}", name))
                })
            })
            .collect()
    }

    /// Arity, type and NOT NULL checks for a fully materialized row.
    /// CHECK constraints need expression evaluation and are enforced by
    /// the executor.
    pub fn validate_row(&self, row: &Row) -> GraniteResult {
        if row.width() != self.columns.len() {
            return Err(GraniteError::semantic(&format!(
                "row width {} does not match schema width {}",
                row.width(),
                self.columns.len()
            )));
        }

        for (i, column) in self.columns.iter().enumerate() {
            let cell = row.get_cell(i);
            if cell.is_null() {
                if !column.nullable {
                    return Err(GraniteError::constraint(&format!(
                        "null value in column {} violates not-null constraint",
                        column.name
                    )));
                }
                continue;
            }
            if !cell.matches_type(column.ctype) {
                return Err(GraniteError::semantic(&format!(
                    "type mismatch for column {}: expected {}, got {:?}",
                    column.name,
                    column.ctype.name(),
                    cell
                )));
            }
        }

        Ok(())
    }

    /// Fill missing trailing values with declared defaults (NULL when
    /// no default is declared).
    pub fn default_cell(&self, i: usize) -> Cell {
        match &self.columns[i].default {
            Some(cell) => cell.clone(),
            None => Cell::Null,
        }
    }

    pub fn add_column(&mut self, column: Column) -> GraniteResult {
        if self.column_index(&column.name).is_some() {
            return Err(GraniteError::semantic(&format!(
                "column {} already exists",
                column.name
            )));
        }
        self.columns.push(column);
        Ok(())
    }

    pub fn drop_column(&mut self, name: &str) -> Result<usize, GraniteError> {
        let index = self
            .column_index(name)
            .ok_or_else(|| GraniteError::semantic(&format!("unknown column: {}", name)))?;

        if self.primary_key.iter().any(|c| c == name) {
            return Err(GraniteError::semantic(&format!(
                "cannot drop primary key column {}",
                name
            )));
        }

        self.columns.remove(index);
        Ok(index)
    }
}

impl Encodeable for Column {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.name.encode());
        buf.extend_from_slice(&self.ctype.encode());
        buf.extend_from_slice(&self.nullable.encode());
        match &self.default {
            Some(cell) => {
                buf.extend_from_slice(&true.encode());
                buf.extend_from_slice(&cell.encode());
            }
            None => buf.extend_from_slice(&false.encode()),
        }
        buf
    }
}

impl Decodeable for Column {
    fn decode_from(reader: &mut GraniteReader) -> Result<Self, GraniteError> {
        let name = String::decode_from(reader)?;
        let ctype = Type::decode_from(reader)?;
        let nullable = bool::decode_from(reader)?;
        let default = if bool::decode_from(reader)? {
            Some(Cell::decode_from(reader)?)
        } else {
            None
        };
        Ok(Column {
            name,
            ctype,
            nullable,
            default,
        })
    }
}

fn encode_names(names: &[String], buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(names.len() as u16).to_le_bytes());
    for name in names {
        buf.extend_from_slice(&name.encode());
    }
}

fn decode_names(reader: &mut GraniteReader) -> Result<Vec<String>, GraniteError> {
    let count = u16::decode_from(reader)?;
    let mut names = Vec::with_capacity(count as usize);
    for _ in 0..count {
        names.push(String::decode_from(reader)?);
    }
    Ok(names)
}

impl Encodeable for ForeignKey {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.name.encode());
        encode_names(&self.columns, &mut buf);
        buf.extend_from_slice(&self.parent_table.encode());
        encode_names(&self.parent_columns, &mut buf);
        buf.push(self.on_delete.tag());
        buf.push(self.on_update.tag());
        buf
    }
}

impl Decodeable for ForeignKey {
    fn decode_from(reader: &mut GraniteReader) -> Result<Self, GraniteError> {
        Ok(ForeignKey {
            name: String::decode_from(reader)?,
            columns: decode_names(reader)?,
            parent_table: String::decode_from(reader)?,
            parent_columns: decode_names(reader)?,
            on_delete: ReferentialAction::from_tag(u8::decode_from(reader)?)?,
            on_update: ReferentialAction::from_tag(u8::decode_from(reader)?)?,
        })
    }
}

impl Encodeable for Schema {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        buf.extend_from_slice(&(self.columns.len() as u16).to_le_bytes());
        for column in &self.columns {
            buf.extend_from_slice(&column.encode());
        }

        encode_names(&self.primary_key, &mut buf);

        buf.extend_from_slice(&(self.uniques.len() as u16).to_le_bytes());
        for (name, columns) in &self.uniques {
            buf.extend_from_slice(&name.encode());
            encode_names(columns, &mut buf);
        }

        buf.extend_from_slice(&(self.foreign_keys.len() as u16).to_le_bytes());
        for fk in &self.foreign_keys {
            buf.extend_from_slice(&fk.encode());
        }

        buf.extend_from_slice(&(self.checks.len() as u16).to_le_bytes());
        for (name, expr) in &self.checks {
            buf.extend_from_slice(&name.encode());
            buf.extend_from_slice(&expr.encode());
        }

        buf
    }
}

impl Decodeable for Schema {
    fn decode_from(reader: &mut GraniteReader) -> Result<Self, GraniteError> {
        let column_count = u16::decode_from(reader)?;
        let mut columns = Vec::with_capacity(column_count as usize);
        for _ in 0..column_count {
            columns.push(Column::decode_from(reader)?);
        }

        let primary_key = decode_names(reader)?;

        let unique_count = u16::decode_from(reader)?;
        let mut uniques = Vec::with_capacity(unique_count as usize);
        for _ in 0..unique_count {
            let name = String::decode_from(reader)?;
            uniques.push((name, decode_names(reader)?));
        }

        let fk_count = u16::decode_from(reader)?;
        let mut foreign_keys = Vec::with_capacity(fk_count as usize);
        for _ in 0..fk_count {
            foreign_keys.push(ForeignKey::decode_from(reader)?);
        }

        let check_count = u16::decode_from(reader)?;
        let mut checks = Vec::with_capacity(check_count as usize);
        for _ in 0..check_count {
            let name = String::decode_from(reader)?;
            checks.push((name, Expr::decode_from(reader)?));
        }

        Ok(Schema {
            columns,
            primary_key,
            uniques,
            foreign_keys,
            checks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> Schema {
        Schema::new(vec![
            Column::new("id", Type::Int64).not_null(),
            Column::new("name", Type::String),
            Column::new("score", Type::Float64).with_default(Cell::Float64(0.0)),
        ])
        .with_primary_key(&["id"])
    }

    #[test]
    fn test_validate_row() {
        let schema = sample_schema();

        let good = Row::new(vec![
            Cell::Int64(1),
            Cell::String("a".to_string()),
            Cell::Float64(1.5),
        ]);
        assert!(schema.validate_row(&good).is_ok());

        let null_pk = Row::new(vec![Cell::Null, Cell::Null, Cell::Float64(0.0)]);
        assert!(schema.validate_row(&null_pk).is_err());

        let bad_type = Row::new(vec![
            Cell::Int64(1),
            Cell::Int64(2),
            Cell::Float64(0.0),
        ]);
        assert!(schema.validate_row(&bad_type).is_err());
    }

    #[test]
    fn test_schema_round_trip() {
        let mut schema = sample_schema();
        schema.uniques.push(("u_name".to_string(), vec!["name".to_string()]));
        schema.foreign_keys.push(ForeignKey {
            name: "fk_dept".to_string(),
            columns: vec!["id".to_string()],
            parent_table: "dept".to_string(),
            parent_columns: vec!["id".to_string()],
            on_delete: ReferentialAction::Cascade,
            on_update: ReferentialAction::Restrict,
        });

        let bytes = schema.encode();
        let mut reader = GraniteReader::new(&bytes);
        let decoded = Schema::decode_from(&mut reader).unwrap();
        assert_eq!(decoded, schema);
    }

    #[test]
    fn test_drop_pk_column_rejected() {
        let mut schema = sample_schema();
        assert!(schema.drop_column("id").is_err());
        assert!(schema.drop_column("name").is_ok());
        assert_eq!(schema.width(), 2);
    }
}
