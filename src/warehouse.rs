use crate::PipelineError;
use crate::flatten::{Cell, Table};
use anyhow::{Context, Result, bail};
use log::{debug, info};
use sqlx::any::{AnyArguments, AnyPoolOptions};
use sqlx::query::Query;
use sqlx::{Any, AnyPool};
use std::collections::{HashMap, HashSet};

pub static GAMEWEEK_TABLE: &str = "gameweek2";

const MAX_BIND_PARAMS: usize = 900;
const DELETE_CHUNK: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Postgres,
    Generic,
}

impl Dialect {
    fn from_uri(uri: &str) -> Self {
        if uri.starts_with("postgres") {
            Dialect::Postgres
        } else {
            Dialect::Generic
        }
    }

    /// Placeholder for the `n`th (1-based) bind parameter of a statement.
    fn placeholder(self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", n),
            Dialect::Generic => "?".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    BigInt,
    Double,
    Boolean,
    Text,
}

impl ColumnType {
    fn sql(self) -> &'static str {
        match self {
            ColumnType::BigInt => "BIGINT",
            ColumnType::Double => "DOUBLE PRECISION",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Text => "TEXT",
        }
    }

    /// Maps a declared column type, as either backend reports it, back onto the types this
    /// crate creates.
    fn from_declared(declared: &str) -> Self {
        let declared = declared.to_ascii_uppercase();
        if declared.contains("INT") {
            ColumnType::BigInt
        } else if declared.contains("DOUBLE")
            || declared.contains("REAL")
            || declared.contains("FLOAT")
            || declared.contains("NUMERIC")
        {
            ColumnType::Double
        } else if declared.contains("BOOL") {
            ColumnType::Boolean
        } else {
            ColumnType::Text
        }
    }

    /// Narrowest type that holds every non-null cell; integers widen to doubles, and any
    /// other mix falls back to text.
    pub fn infer<'a, I>(cells: I) -> Self
    where
        I: IntoIterator<Item = &'a Cell>,
    {
        let mut inferred = None;
        for cell in cells {
            let ty = match cell {
                Cell::Null => continue,
                Cell::Bool(_) => ColumnType::Boolean,
                Cell::Int(_) => ColumnType::BigInt,
                Cell::Float(_) => ColumnType::Double,
                Cell::Text(_) => return ColumnType::Text,
            };
            inferred = Some(match (inferred, ty) {
                (None, ty) => ty,
                (Some(current), ty) if current == ty => ty,
                (Some(ColumnType::BigInt), ColumnType::Double)
                | (Some(ColumnType::Double), ColumnType::BigInt) => ColumnType::Double,
                _ => return ColumnType::Text,
            });
        }
        inferred.unwrap_or(ColumnType::Text)
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn bind_cell<'q>(
    query: Query<'q, Any, AnyArguments<'q>>,
    cell: &Cell,
    ty: ColumnType,
) -> Query<'q, Any, AnyArguments<'q>> {
    match (ty, cell) {
        (ColumnType::BigInt, Cell::Null) => query.bind(None::<i64>),
        (ColumnType::Double, Cell::Null) => query.bind(None::<f64>),
        (ColumnType::Boolean, Cell::Null) => query.bind(None::<bool>),
        (ColumnType::Text, Cell::Null) => query.bind(None::<String>),
        (ColumnType::BigInt, Cell::Int(i)) => query.bind(*i),
        (ColumnType::BigInt, Cell::Float(x)) => query.bind(*x),
        (ColumnType::Double, Cell::Int(i)) => query.bind(*i as f64),
        (ColumnType::Double, Cell::Float(x)) => query.bind(*x),
        (ColumnType::Boolean, Cell::Bool(b)) => query.bind(*b),
        (_, cell) => query.bind(cell.to_string()),
    }
}

pub struct Warehouse {
    pool: AnyPool,
    dialect: Dialect,
}

impl Warehouse {
    pub async fn connect(uri: &str) -> Result<Self> {
        sqlx::any::install_default_drivers();

        // Jobs are sequential; a single connection also keeps in-memory SQLite coherent.
        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(uri)
            .await
            .context("Failed to connect to warehouse")?;

        Ok(Self {
            pool,
            dialect: Dialect::from_uri(uri),
        })
    }

    pub fn gameweek(&self) -> Gameweek<'_> {
        Gameweek { warehouse: self }
    }

    fn create_table_sql(
        table: &str,
        rows: &Table,
        types: &[ColumnType],
        if_not_exists: bool,
    ) -> String {
        let columns: Vec<String> = rows
            .columns()
            .iter()
            .zip(types)
            .map(|(name, ty)| format!("{} {}", quote_ident(name), ty.sql()))
            .collect();

        format!(
            "CREATE TABLE {}{} ({})",
            if if_not_exists { "IF NOT EXISTS " } else { "" },
            quote_ident(table),
            columns.join(", ")
        )
    }

    fn column_types(rows: &Table) -> Vec<ColumnType> {
        rows.columns()
            .iter()
            .filter_map(|name| rows.column(name))
            .map(ColumnType::infer)
            .collect()
    }

    /// Declared types of the columns `table` already has.
    async fn declared_types(
        &self,
        tx: &mut sqlx::Transaction<'_, Any>,
        table: &str,
    ) -> Result<HashMap<String, ColumnType>> {
        let sql = match self.dialect {
            Dialect::Postgres => {
                "SELECT CAST(column_name AS TEXT), CAST(data_type AS TEXT) \
                 FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = $1"
            }
            Dialect::Generic => "SELECT name, type FROM pragma_table_info(?)",
        };
        let columns: Vec<(String, String)> = sqlx::query_as(sql)
            .bind(table)
            .fetch_all(&mut **tx)
            .await
            .with_context(|| format!("Failed to read columns of {}", table))?;

        Ok(columns
            .into_iter()
            .map(|(name, declared)| (name, ColumnType::from_declared(&declared)))
            .collect())
    }

    /// Types to bind `rows` with: the table's own where a column exists, inferred otherwise.
    fn bind_types(
        rows: &Table,
        inferred: &[ColumnType],
        declared: &HashMap<String, ColumnType>,
    ) -> Vec<ColumnType> {
        rows.columns()
            .iter()
            .zip(inferred)
            .map(|(name, ty)| declared.get(name).copied().unwrap_or(*ty))
            .collect()
    }

    async fn insert_rows(
        &self,
        tx: &mut sqlx::Transaction<'_, Any>,
        table: &str,
        rows: &Table,
        types: &[ColumnType],
    ) -> Result<u64> {
        let column_list = rows
            .columns()
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let rows_per_statement = (MAX_BIND_PARAMS / rows.columns().len()).max(1);

        let mut inserted = 0;
        for batch in rows.rows().chunks(rows_per_statement) {
            let mut n = 0;
            let values = batch
                .iter()
                .map(|row| {
                    let params: Vec<String> = row
                        .iter()
                        .map(|_| {
                            n += 1;
                            self.dialect.placeholder(n)
                        })
                        .collect();
                    format!("({})", params.join(", "))
                })
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "INSERT INTO {} ({}) VALUES {}",
                quote_ident(table),
                column_list,
                values
            );

            let mut query = sqlx::query(&sql);
            for row in batch {
                for (cell, ty) in row.iter().zip(types) {
                    query = bind_cell(query, cell, *ty);
                }
            }
            inserted += query
                .execute(&mut **tx)
                .await
                .with_context(|| format!("Failed to insert into {}", table))?
                .rows_affected();
        }

        Ok(inserted)
    }

    /// Replaces `table` so it holds exactly `rows`.
    pub async fn replace_all(&self, table: &str, rows: &Table) -> Result<u64> {
        if rows.columns().is_empty() {
            bail!("No columns to write to {}", table);
        }
        let types = Self::column_types(rows);

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to drop {}", table))?;
        sqlx::query(&Self::create_table_sql(table, rows, &types, false))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to create {}", table))?;
        let inserted = self.insert_rows(&mut tx, table, rows, &types).await?;
        tx.commit().await?;

        info!("Replaced {} with {} rows", table, inserted);
        Ok(inserted)
    }

    /// Deletes every row of `table` whose `key_column` matches an incoming key, then appends
    /// `rows`. The table is created on first use.
    pub async fn upsert_by_key(&self, table: &str, key_column: &str, rows: &Table) -> Result<u64> {
        if rows.is_empty() {
            info!("Nothing to upsert into {}", table);
            return Ok(0);
        }
        let inferred = Self::column_types(rows);
        let key_idx = rows
            .column_index(key_column)
            .with_context(|| format!("Rows for {} have no {} column", table, key_column))?;

        let mut seen = HashSet::new();
        let keys: Vec<&Cell> = rows
            .rows()
            .iter()
            .map(|row| &row[key_idx])
            .filter(|cell| **cell != Cell::Null && seen.insert(cell.to_string()))
            .collect();

        let mut tx = self.pool.begin().await?;
        sqlx::query(&Self::create_table_sql(table, rows, &inferred, true))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to create {}", table))?;
        let declared = self.declared_types(&mut tx, table).await?;
        let types = Self::bind_types(rows, &inferred, &declared);
        let key_type = types[key_idx];

        let mut deleted = 0;
        for chunk in keys.chunks(DELETE_CHUNK) {
            let params: Vec<String> = (1..=chunk.len())
                .map(|n| self.dialect.placeholder(n))
                .collect();
            let sql = format!(
                "DELETE FROM {} WHERE {} IN ({})",
                quote_ident(table),
                quote_ident(key_column),
                params.join(", ")
            );

            let mut query = sqlx::query(&sql);
            for key in chunk {
                query = bind_cell(query, key, key_type);
            }
            deleted += query
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to delete from {}", table))?
                .rows_affected();
        }
        debug!("Deleted {} rows from {}", deleted, table);

        let inserted = self.insert_rows(&mut tx, table, rows, &types).await?;
        tx.commit().await?;

        info!(
            "Upserted {} rows into {} ({} replaced)",
            inserted, table, deleted
        );
        Ok(inserted)
    }

    /// Distinct non-null integer values of `column`, ascending.
    pub async fn distinct_ids(&self, table: &str, column: &str) -> Result<Vec<i64>> {
        let sql = format!(
            "SELECT DISTINCT CAST({} AS BIGINT) FROM {} ORDER BY 1",
            quote_ident(column),
            quote_ident(table)
        );
        let ids: Vec<Option<i64>> = sqlx::query_scalar(&sql)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("Failed to read {} from {}", column, table))?;

        Ok(ids.into_iter().flatten().collect())
    }
}

/// The persisted "current week" counter.
pub struct Gameweek<'a> {
    warehouse: &'a Warehouse,
}

impl Gameweek<'_> {
    pub async fn ensure(&self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (weeknum BIGINT)",
            quote_ident(GAMEWEEK_TABLE)
        );
        sqlx::query(&sql).execute(&self.warehouse.pool).await?;

        Ok(())
    }

    pub async fn current(&self) -> Result<i64> {
        let sql = format!(
            "SELECT CAST(MAX(weeknum) AS BIGINT) FROM {}",
            quote_ident(GAMEWEEK_TABLE)
        );
        let week: Option<i64> = sqlx::query_scalar(&sql)
            .fetch_one(&self.warehouse.pool)
            .await
            .context("Failed to get current gameweek")?;

        let week = week
            .ok_or_else(|| PipelineError::DataUnavailable("no gameweek recorded".to_string()))?;
        debug!("Current gameweek is {}", week);

        Ok(week)
    }

    pub async fn seed(&self, week: i64) -> Result<()> {
        self.ensure().await?;
        self.insert(week).await
    }

    /// Records the week after the current one and returns it.
    pub async fn advance(&self) -> Result<i64> {
        let next = self.current().await? + 1;
        self.insert(next).await?;
        info!("Advanced gameweek to {}", next);

        Ok(next)
    }

    async fn insert(&self, week: i64) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (weeknum) VALUES ({})",
            quote_ident(GAMEWEEK_TABLE),
            self.warehouse.dialect.placeholder(1)
        );
        sqlx::query(&sql)
            .bind(week)
            .execute(&self.warehouse.pool)
            .await
            .context("Failed to record gameweek")?;

        Ok(())
    }
}
