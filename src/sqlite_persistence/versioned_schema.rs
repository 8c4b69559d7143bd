use anyhow::{bail, Result};
use rusqlite::{params, types::Type, Connection};

/// Declare a [`Column`] with optional field overrides, e.g.
/// `sqlite_column!("state", &SqlType::Text, non_null = true)`.
#[macro_export]
macro_rules! sqlite_column {
    ($name:expr, $sql_type:expr $(, $field:ident = $value:expr)*) => {
        {
            // unused_mut fires when no optional field assignments are passed
            #[allow(unused_mut)]
            let mut column = Column {
                name: $name,
                sql_type: $sql_type,
                is_primary_key: false,
                non_null: false,
                default_value: None,
            };
            $(
                column.$field = $value;
            )*
            column
        }
    };
}

#[derive(Debug, PartialEq, Eq)]
pub enum SqlType {
    Text,
    Integer,
    Real,
    Blob,
}

impl SqlType {
    fn as_sql(&self) -> &'static str {
        match self {
            SqlType::Text => "TEXT",
            SqlType::Integer => "INTEGER",
            SqlType::Real => "REAL",
            SqlType::Blob => "BLOB",
        }
    }
}

pub struct Column<'a, S: AsRef<str>> {
    pub name: S,
    pub sql_type: &'a SqlType,
    pub is_primary_key: bool,
    pub non_null: bool,
    pub default_value: Option<S>,
}

pub struct Table {
    pub name: &'static str,
    pub columns: &'static [Column<'static, &'static str>],
    pub indices: &'static [(&'static str, &'static str)],
}

impl Table {
    pub fn create(&self, conn: &Connection) -> Result<()> {
        let mut create_sql = format!("CREATE TABLE {} (", self.name);
        for (column_index, column) in self.columns.iter().enumerate() {
            if column_index > 0 {
                create_sql.push_str(", ");
            }
            create_sql.push_str(&format!("{} {}", column.name, column.sql_type.as_sql()));
            if column.is_primary_key {
                create_sql.push_str(" PRIMARY KEY");
            }
            if column.non_null {
                create_sql.push_str(" NOT NULL");
            }
            if let Some(default_value) = column.default_value {
                create_sql.push_str(&format!(" DEFAULT {}", default_value));
            }
        }
        create_sql.push_str(");");
        conn.execute(&create_sql, params![])?;

        for (index_name, column_names) in self.indices {
            conn.execute(
                &format!(
                    "CREATE INDEX {} ON {}({});",
                    index_name, self.name, column_names
                ),
                params![],
            )?;
        }
        Ok(())
    }
}

pub struct VersionedSchema {
    pub version: usize,
    pub tables: &'static [Table],
    pub migration: Option<fn(&Connection) -> Result<()>>,
}

fn strip_leading_and_trailing_parentheses<S: AsRef<str>>(s: S) -> String {
    let s = s.as_ref();
    if s.starts_with('(') && s.ends_with(')') {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

impl VersionedSchema {
    pub fn create(&self, conn: &Connection) -> Result<()> {
        for table in self.tables {
            table.create(conn)?;
        }
        conn.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + self.version),
            [],
        )?;
        Ok(())
    }

    /// Compare the live database against the declared tables.
    ///
    /// Columns are checked by name, type, nullability, default value, and
    /// primary-key flag; declared indices must exist on the right table.
    pub fn validate(&self, conn: &Connection) -> Result<()> {
        for table in self.tables {
            let mut stmt = conn.prepare(&format!("PRAGMA table_info({});", table.name))?;
            let actual_columns: Vec<Result<Column<'_, String>, rusqlite::Error>> = stmt
                .query_map(params![], |row| {
                    let name = row.get::<usize, String>(1)?;
                    let sql_type = match row.get::<_, String>(2)?.as_str() {
                        "TEXT" => &SqlType::Text,
                        "INTEGER" => &SqlType::Integer,
                        "REAL" => &SqlType::Real,
                        "BLOB" => &SqlType::Blob,
                        _ => {
                            return Err(rusqlite::Error::InvalidColumnType(
                                2,
                                "".to_string(),
                                Type::Text,
                            ))
                        }
                    };

                    Ok(Column {
                        name,
                        sql_type,
                        non_null: row.get::<_, i32>(3)? == 1,
                        default_value: row
                            .get::<_, Option<String>>(4)?
                            .as_deref()
                            .map(|s| s.to_string()),
                        is_primary_key: row.get::<_, i32>(5)? == 1,
                    })
                })?
                .collect();

            if actual_columns.len() != table.columns.len() {
                bail!(
                    "Table {} has {} columns, expected {}. Found column names: {}, expected: {}",
                    table.name,
                    actual_columns.len(),
                    table.columns.len(),
                    actual_columns
                        .iter()
                        .filter_map(|c| c.as_ref().ok().map(|column| column.name.clone()))
                        .collect::<Vec<String>>()
                        .join(", "),
                    table
                        .columns
                        .iter()
                        .map(|c| c.name)
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }

            for (actual_column_result, expected_column) in
                actual_columns.iter().zip(table.columns.iter())
            {
                let actual_column = match actual_column_result {
                    Ok(column) => column,
                    Err(e) => bail!("Error reading column: {:?}", e),
                };
                if actual_column.name != expected_column.name {
                    bail!(
                        "Table {} column name mismatch: expected {}, got {}",
                        &table.name,
                        expected_column.name,
                        actual_column.name
                    );
                }
                if actual_column.sql_type != expected_column.sql_type {
                    bail!(
                        "Table {} column {} type mismatch: expected {:?}, got {:?}",
                        &table.name,
                        expected_column.name,
                        expected_column.sql_type,
                        actual_column.sql_type
                    );
                }
                if actual_column.non_null != expected_column.non_null {
                    bail!(
                        "Table {} column {} non-null mismatch: expected {}, got {}",
                        &table.name,
                        expected_column.name,
                        expected_column.non_null,
                        actual_column.non_null
                    );
                }

                // Default values might be wrapped in parentheses, strip before comparing
                if actual_column
                    .default_value
                    .as_ref()
                    .map(strip_leading_and_trailing_parentheses)
                    != expected_column
                        .default_value
                        .map(strip_leading_and_trailing_parentheses)
                {
                    bail!(
                        "Table {} column {} default value mismatch: expected {:?}, got {:?}",
                        &table.name,
                        expected_column.name,
                        expected_column.default_value,
                        actual_column.default_value
                    );
                }
                if actual_column.is_primary_key != expected_column.is_primary_key {
                    bail!(
                        "Table {} column {} primary key mismatch: expected {}, got {}",
                        &table.name,
                        expected_column.name,
                        expected_column.is_primary_key,
                        actual_column.is_primary_key
                    );
                }
            }

            for (index_name, _columns) in table.indices {
                let index_exists: bool = conn
                    .query_row(
                        "SELECT 1 FROM sqlite_master WHERE type='index' AND name=?1 AND tbl_name=?2",
                        params![index_name, table.name],
                        |_| Ok(true),
                    )
                    .unwrap_or(false);

                if !index_exists {
                    bail!("Table {} is missing index '{}'", table.name, index_name);
                }
            }
        }
        Ok(())
    }
}

/// Offset added to `PRAGMA user_version` so a staffetta database is never
/// mistaken for some other application's SQLite file.
pub const BASE_DB_VERSION: usize = 77000;
