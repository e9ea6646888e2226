use chrono::DateTime;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;
use thiserror::Error;
use ulid::Ulid;

use crate::limits::PINCODE_LEN;
use crate::model::*;

/// Parsed command from SQL input.
///
/// INSERT values follow the column list when one is given, otherwise the table
/// order: `vehicles (id, name, capacity_kg, tyres)` and
/// `bookings (id, vehicle_id, from_pincode, to_pincode, start_time, customer_id)`.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertVehicle {
        id: Ulid,
        name: String,
        capacity_kg: u32,
        tyres: u32,
    },
    UpdateVehicle {
        id: Ulid,
        patch: ResourcePatch,
    },
    DeleteVehicle {
        id: Ulid,
    },
    SelectVehicles {
        id: Option<Ulid>,
    },
    InsertBooking {
        id: Ulid,
        vehicle_id: Ulid,
        from_pincode: String,
        to_pincode: String,
        start: Ms,
        customer_id: String,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectAvailableVehicles {
        capacity_required: u32,
        from_pincode: String,
        to_pincode: String,
        start: Ms,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingFilter {
    All,
    Id(Ulid),
    Vehicle(Ulid),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.is_empty() || trimmed.chars().all(|c| c == ';' || c.is_whitespace()) {
        return Err(SqlError::Empty);
    }
    let dialect = PostgreSqlDialect {};
    if starts_with_keyword(trimmed, "UPDATE") {
        return parse_update(&dialect, trimmed);
    }

    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements".into()));
    }
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn starts_with_keyword(sql: &str, keyword: &str) -> bool {
    sql.get(..keyword.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(keyword))
        && sql[keyword.len()..]
            .chars()
            .next()
            .is_some_and(char::is_whitespace)
}

const VEHICLE_COLUMNS: [&str; 4] = ["id", "name", "capacity_kg", "tyres"];
const BOOKING_COLUMNS: [&str; 6] = [
    "id",
    "vehicle_id",
    "from_pincode",
    "to_pincode",
    "start_time",
    "customer_id",
];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "vehicles" => {
            let values = values_by_column("vehicles", &VEHICLE_COLUMNS, &insert.columns, values)?;
            Ok(Command::InsertVehicle {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                capacity_kg: parse_u32(&values[2])?,
                tyres: parse_u32(&values[3])?,
            })
        }
        "bookings" => {
            let values = values_by_column("bookings", &BOOKING_COLUMNS, &insert.columns, values)?;
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                vehicle_id: parse_ulid(&values[1])?,
                from_pincode: parse_pincode(&values[2])?,
                to_pincode: parse_pincode(&values[3])?,
                start: parse_timestamp(&values[4])?,
                customer_id: parse_string(&values[5])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Put INSERT values into table column order. Without a column list they are
/// taken as already ordered.
fn values_by_column(
    table: &'static str,
    expected: &[&str],
    columns: &[ast::Ident],
    values: Vec<Expr>,
) -> Result<Vec<Expr>, SqlError> {
    if values.len() != expected.len() {
        return Err(SqlError::WrongArity(table, expected.len(), values.len()));
    }
    if columns.is_empty() {
        return Ok(values);
    }
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }

    let mut slots: Vec<Option<Expr>> = vec![None; expected.len()];
    for (column, value) in columns.iter().zip(values) {
        let name = column.value.to_lowercase();
        let idx = expected
            .iter()
            .position(|c| *c == name)
            .ok_or_else(|| SqlError::UnknownColumn(name.clone()))?;
        if slots[idx].replace(value).is_some() {
            return Err(SqlError::Unsupported(format!("column {name} given twice")));
        }
    }
    // Same length, all known, no repeats: every slot is filled.
    Ok(slots.into_iter().flatten().collect())
}

/// `UPDATE vehicles SET col = value [, ...] WHERE id = '...'`, walked token by
/// token so only the shape we serve is accepted.
fn parse_update(dialect: &PostgreSqlDialect, sql: &str) -> Result<Command, SqlError> {
    let parse_err = |e: sqlparser::parser::ParserError| SqlError::Parse(e.to_string());
    let mut parser = Parser::new(dialect).try_with_sql(sql).map_err(parse_err)?;

    if !parser.parse_keyword(Keyword::UPDATE) {
        return Err(SqlError::Parse("expected UPDATE".into()));
    }
    let table_name = parser.parse_object_name(false).map_err(parse_err)?;
    let table = object_name_last(&table_name)
        .ok_or_else(|| SqlError::Parse("empty table name".into()))?;
    if table != "vehicles" {
        return Err(SqlError::UnknownTable(table));
    }
    if !parser.parse_keyword(Keyword::SET) {
        return Err(SqlError::Parse("expected SET".into()));
    }
    let assignments = parser
        .parse_comma_separated(Parser::parse_assignment)
        .map_err(parse_err)?;
    if !parser.parse_keyword(Keyword::WHERE) {
        return Err(SqlError::MissingFilter("id"));
    }
    let selection = parser.parse_expr().map_err(parse_err)?;
    while parser.consume_token(&Token::SemiColon) {}
    if parser.peek_token().token != Token::EOF {
        return Err(SqlError::Unsupported("trailing input after UPDATE".into()));
    }

    let id = extract_where_id(&Some(selection))?;
    let mut patch = ResourcePatch::default();
    for assignment in &assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        match column.as_str() {
            "name" => patch.name = Some(parse_string(&assignment.value)?),
            "capacity_kg" => patch.capacity_kg = Some(parse_u32(&assignment.value)?),
            "tyres" => patch.tyres = Some(parse_u32(&assignment.value)?),
            "id" => return Err(SqlError::Unsupported("vehicle id cannot change".into())),
            _ => return Err(SqlError::UnknownColumn(column)),
        }
    }
    Ok(Command::UpdateVehicle { id, patch })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "vehicles" => Ok(Command::DeleteVehicle { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
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

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "vehicles" => {
            let id = match filters.as_slice() {
                [] => None,
                [("id", value)] => Some(parse_ulid(value)?),
                _ => return Err(SqlError::Unsupported("vehicles filter: only id".into())),
            };
            Ok(Command::SelectVehicles { id })
        }
        "bookings" => {
            let filter = match filters.as_slice() {
                [] => BookingFilter::All,
                [("id", value)] => BookingFilter::Id(parse_ulid(value)?),
                [("vehicle_id", value)] => BookingFilter::Vehicle(parse_ulid(value)?),
                _ => {
                    return Err(SqlError::Unsupported(
                        "bookings filter: id or vehicle_id".into(),
                    ))
                }
            };
            Ok(Command::SelectBookings { filter })
        }
        "available_vehicles" => {
            let (mut capacity, mut from, mut to, mut start) = (None, None, None, None);
            for (column, value) in &filters {
                match *column {
                    "capacity_required" => capacity = Some(parse_u32(value)?),
                    "from_pincode" => from = Some(parse_pincode(value)?),
                    "to_pincode" => to = Some(parse_pincode(value)?),
                    "start_time" => start = Some(parse_timestamp(value)?),
                    other => return Err(SqlError::UnknownColumn(other.to_string())),
                }
            }
            Ok(Command::SelectAvailableVehicles {
                capacity_required: capacity.ok_or(SqlError::MissingFilter("capacity_required"))?,
                from_pincode: from.ok_or(SqlError::MissingFilter("from_pincode"))?,
                to_pincode: to.ok_or(SqlError::MissingFilter("to_pincode"))?,
                start: start.ok_or(SqlError::MissingFilter("start_time"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = 1 AND b = 2 AND ...` into `(column, value)` pairs.
fn collect_eq_filters<'a>(
    expr: &'a Expr,
    out: &mut Vec<(&'static str, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((known_column(&column)?, &**right));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

/// Columns that may appear in a WHERE clause.
fn known_column(column: &str) -> Result<&'static str, SqlError> {
    const COLUMNS: [&str; 6] = [
        "id",
        "vehicle_id",
        "capacity_required",
        "from_pincode",
        "to_pincode",
        "start_time",
    ];
    COLUMNS
        .into_iter()
        .find(|c| *c == column)
        .ok_or_else(|| SqlError::UnknownColumn(column.to_string()))
}

// ── Helpers ───────────────────────────────────────────────────

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
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
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
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Invalid(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        parse_i64(expr)?
            .checked_neg()
            .ok_or_else(|| SqlError::Invalid("integer out of range".into()))
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Invalid(format!("{v} out of range")))
}

/// Exactly six ASCII digits; numeric literals are accepted as well as strings.
fn parse_pincode(expr: &Expr) -> Result<String, SqlError> {
    let text = match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => s.as_str(),
        Some(value) => return Err(SqlError::Parse(format!("expected pincode, got {value}"))),
        None => return Err(SqlError::Parse(format!("expected value, got {expr}"))),
    };
    if text.len() != PINCODE_LEN || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SqlError::Invalid(format!(
            "pincode must be {PINCODE_LEN} digits, got {text:?}"
        )));
    }
    Ok(text.to_string())
}

/// RFC 3339 string, or integer unix milliseconds (literal or quoted).
fn parse_timestamp(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr) {
        if let Ok(ms) = s.trim().parse::<i64>() {
            return Ok(ms);
        }
        return DateTime::parse_from_rfc3339(s.trim())
            .map(|t| t.timestamp_millis())
            .map_err(|e| SqlError::Invalid(format!("bad timestamp {s:?}: {e}")));
    }
    parse_i64(expr)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    /// Well-formed SQL carrying a value the service rejects.
    #[error("invalid value: {0}")]
    Invalid(String),
}
