use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        id: Ulid,
        name: String,
    },
    InsertReservation {
        resource_id: Ulid,
        requester_id: String,
        start: Ms,
        end: Ms,
        /// `RETURNING ...` was present: answer with the stored row.
        returning: bool,
    },
    DeleteReservation {
        id: Ulid,
    },
    SelectResources,
    SelectReservations {
        query: ReservationQuery,
    },
    SelectHealth,
}

const RESOURCE_COLUMNS: &[&str] = &["id", "name"];
const RESERVATION_COLUMNS: &[&str] = &["resource_id", "requester_id", "start", "end"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "resources" => {
            let row = InsertRow::new(insert, RESOURCE_COLUMNS)?;
            Ok(Command::InsertResource {
                id: parse_ulid_expr(row.get("id")?)?,
                name: parse_string_expr(row.get("name")?)?,
            })
        }
        "reservations" => {
            let row = InsertRow::new(insert, RESERVATION_COLUMNS)?;
            Ok(Command::InsertReservation {
                resource_id: parse_ulid_expr(row.get("resource_id")?)?,
                requester_id: parse_string_expr(row.get("requester_id")?)?,
                start: parse_i64_expr(row.get("start")?)?,
                end: parse_i64_expr(row.get("end")?)?,
                returning: insert.returning.is_some(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "reservations" => Ok(Command::DeleteReservation { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    match table.as_str() {
        "resources" => Ok(Command::SelectResources),
        "health" => Ok(Command::SelectHealth),
        "reservations" => {
            let mut query = ReservationQuery::default();
            if let Some(selection) = &select.selection {
                extract_reservation_filters(selection, &mut query)?;
            }
            Ok(Command::SelectReservations { query })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `resource_id`, `page` and `page_size` are pseudo-column filters joined by AND.
fn extract_reservation_filters(expr: &Expr, query: &mut ReservationQuery) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_reservation_filters(left, query)?;
                extract_reservation_filters(right, query)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("resource_id") => query.resource_id = Some(parse_ulid_expr(right)?),
                Some("page") => query.page = parse_usize_expr(right)?,
                Some("page_size") | Some("limit") => query.page_size = parse_usize_expr(right)?,
                Some(other) => return Err(SqlError::Unsupported(format!("filter on {other}"))),
                None => return Err(SqlError::Parse(format!("expected column, got {left}"))),
            },
            _ => return Err(SqlError::Unsupported(format!("operator {op}"))),
        },
        Expr::Nested(inner) => extract_reservation_filters(inner, query)?,
        _ => return Err(SqlError::Unsupported(format!("filter {expr}"))),
    }
    Ok(())
}

// ── Validation ────────────────────────────────────────────────

/// Input checks for a new reservation, done before the engine is involved.
/// Returns the interval as a `Span` once it is known to be well formed.
pub fn validate_reservation(
    requester_id: &str,
    start: Ms,
    end: Ms,
    now: Ms,
) -> Result<Span, SqlError> {
    if requester_id.trim().is_empty() {
        return Err(SqlError::Invalid("requester_id must not be empty".into()));
    }
    if requester_id.len() > MAX_REQUESTER_LEN {
        return Err(SqlError::Invalid("requester_id too long".into()));
    }
    if start >= end {
        return Err(SqlError::Invalid("start must be before end".into()));
    }
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&start)
        || !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&end)
    {
        return Err(SqlError::Invalid("timestamp out of range".into()));
    }
    if start < now {
        return Err(SqlError::Invalid("cannot reserve a time slot in the past".into()));
    }
    Ok(Span::new(start, end))
}

// ── Helpers ───────────────────────────────────────────────────

/// One VALUES row keyed by column name. Without an explicit column list the
/// table's canonical column order applies.
struct InsertRow<'a> {
    columns: Vec<String>,
    values: &'a [Expr],
}

impl<'a> InsertRow<'a> {
    fn new(insert: &'a ast::Insert, canonical: &[&str]) -> Result<Self, SqlError> {
        let rows = insert_rows(insert)?;
        if rows.len() != 1 {
            return Err(SqlError::Unsupported("multi-row INSERT".into()));
        }
        let values = rows[0].as_slice();
        let columns: Vec<String> = if insert.columns.is_empty() {
            canonical.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if columns.len() != values.len() {
            return Err(SqlError::WrongArity(columns.len(), values.len()));
        }
        if let Some(unknown) = columns.iter().find(|c| !canonical.contains(&c.as_str())) {
            return Err(SqlError::Unsupported(format!("column {unknown}")));
        }
        Ok(Self { columns, values })
    }

    fn get(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
            .ok_or(SqlError::MissingColumn(column))
    }
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if values.rows.is_empty() => {
            Err(SqlError::Parse("empty VALUES".into()))
        }
        SetExpr::Values(values) => Ok(&values.rows),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_usize_expr(expr: &Expr) -> Result<usize, SqlError> {
    let v = parse_i64_expr(expr)?;
    usize::try_from(v).map_err(|_| SqlError::Invalid(format!("{v} must not be negative")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    /// Column count, value count.
    WrongArity(usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
    /// Well-formed SQL carrying values that can never be admitted.
    Invalid(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(columns, values) => {
                write!(f, "{columns} columns but {values} values")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::Invalid(s) => write!(f, "invalid input: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}
