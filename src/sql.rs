use std::collections::HashMap;

use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::limits::MAX_SQL_LENGTH;
use crate::model::*;

/// Guest form fields, in column order for positional INSERTs.
pub const GUEST_FIELDS: [&str; 4] = ["first_name", "last_name", "email", "phone"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationSelector {
    All,
    Unprocessed,
    Id(ReservationId),
}

/// Columns set by an admin `UPDATE reservations`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationChanges {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub processed: Option<bool>,
}

impl ReservationChanges {
    pub fn touches_guest(&self) -> bool {
        self.first_name.is_some()
            || self.last_name.is_some()
            || self.email.is_some()
            || self.phone.is_some()
    }

    /// Apply the guest columns on top of the current values.
    pub fn merge_into(&self, guest: &Guest) -> Guest {
        Guest {
            first_name: self.first_name.clone().unwrap_or_else(|| guest.first_name.clone()),
            last_name: self.last_name.clone().unwrap_or_else(|| guest.last_name.clone()),
            email: self.email.clone().unwrap_or_else(|| guest.email.clone()),
            phone: self.phone.clone().unwrap_or_else(|| guest.phone.clone()),
        }
    }
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    // Guest flow
    SelectRooms {
        id: Option<RoomId>,
    },
    SelectAvailability {
        span: Span,
        room_id: Option<RoomId>,
    },
    SelectOpenings {
        room_id: RoomId,
        span: Span,
    },
    InsertDraft {
        room_id: RoomId,
        span: Span,
    },
    UpdateDraft {
        room_id: RoomId,
    },
    SelectDraft,
    InsertReservation {
        fields: HashMap<String, String>,
    },
    SelectSummary,

    // Admin
    InsertRoom {
        id: Option<RoomId>,
        name: String,
    },
    SelectReservations {
        selector: ReservationSelector,
    },
    UpdateReservation {
        id: ReservationId,
        changes: ReservationChanges,
    },
    DeleteReservation {
        id: ReservationId,
    },
    SelectCalendar {
        year: i32,
        month: u32,
    },
    UpdateCalendar {
        year: i32,
        month: u32,
        form: String,
    },
    InsertBlock {
        room_id: RoomId,
        span: Span,
    },
    DeleteBlock {
        id: RestrictionId,
    },
    SelectRestrictions {
        room_id: RoomId,
        window: Option<Span>,
    },
}

impl Command {
    pub fn requires_admin(&self) -> bool {
        matches!(
            self,
            Command::InsertRoom { .. }
                | Command::SelectReservations { .. }
                | Command::UpdateReservation { .. }
                | Command::DeleteReservation { .. }
                | Command::SelectCalendar { .. }
                | Command::UpdateCalendar { .. }
                | Command::InsertBlock { .. }
                | Command::DeleteBlock { .. }
                | Command::SelectRestrictions { .. }
        )
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.len() > MAX_SQL_LENGTH {
        return Err(SqlError::TooLong(sql.len()));
    }
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection.as_ref()),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "rooms" => {
            let row = Row::new(insert, &["id", "name"], &values)?;
            // A lone value is the name.
            let (id, name) = match (row.get("id"), row.get("name")) {
                (Some(id), Some(name)) => (parse_i64_or_null(id)?, parse_string(name)?),
                (Some(only), None) if insert.columns.is_empty() => (None, parse_string(only)?),
                (None, Some(name)) => (None, parse_string(name)?),
                _ => return Err(SqlError::MissingColumn("name")),
            };
            Ok(Command::InsertRoom { id, name })
        }
        "draft" => {
            let row = Row::new(insert, &["room_id", "start_date", "end_date"], &values)?;
            Ok(Command::InsertDraft {
                room_id: parse_i64(row.require("room_id")?)?,
                span: Span::new(
                    parse_date(row.require("start_date")?)?,
                    parse_date(row.require("end_date")?)?,
                ),
            })
        }
        "reservations" => {
            let row = Row::new(insert, &GUEST_FIELDS, &values)?;
            let mut fields = HashMap::new();
            for (column, expr) in row.pairs {
                if !GUEST_FIELDS.contains(&column.as_str()) {
                    return Err(SqlError::UnknownColumn(column));
                }
                fields.insert(column, parse_string_or_null(expr)?.unwrap_or_default());
            }
            Ok(Command::InsertReservation { fields })
        }
        "blocks" => {
            let row = Row::new(insert, &["room_id", "start_date", "end_date"], &values)?;
            let start = parse_date(row.require("start_date")?)?;
            let end = match row.get("end_date") {
                Some(e) => parse_date(e)?,
                None => start
                    .succ_opt()
                    .ok_or_else(|| SqlError::BadDate(start.to_string()))?,
            };
            Ok(Command::InsertBlock {
                room_id: parse_i64(row.require("room_id")?)?,
                span: Span::new(start, end),
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
        "blocks" => Ok(Command::DeleteBlock { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let mut set = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        set.push((column, &assignment.value));
    }
    let filters = Filters::collect(selection)?;

    match table.as_str() {
        "draft" => {
            let value = single_assignment(&set, "room_id")?;
            Ok(Command::UpdateDraft {
                room_id: parse_i64(value)?,
            })
        }
        "reservations" => {
            let id = parse_i64(filters.require("id")?)?;
            let mut changes = ReservationChanges::default();
            for (column, value) in set {
                match column.as_str() {
                    "first_name" => changes.first_name = Some(parse_string(value)?),
                    "last_name" => changes.last_name = Some(parse_string(value)?),
                    "email" => changes.email = Some(parse_string(value)?),
                    "phone" => changes.phone = Some(parse_string(value)?),
                    "processed" => changes.processed = Some(parse_bool(value)?),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::UpdateReservation { id, changes })
        }
        "calendar" => {
            let value = single_assignment(&set, "form")?;
            let (year, month) = month_filters(&filters)?;
            Ok(Command::UpdateCalendar {
                year,
                month,
                form: parse_string(value)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn single_assignment<'a>(
    set: &[(String, &'a Expr)],
    expected: &'static str,
) -> Result<&'a Expr, SqlError> {
    match set {
        [(column, value)] if column == expected => Ok(*value),
        [(column, _)] => Err(SqlError::UnknownColumn(column.clone())),
        _ => Err(SqlError::MissingColumn(expected)),
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
    let filters = Filters::collect(select.selection.as_ref())?;

    match table.as_str() {
        "rooms" => Ok(Command::SelectRooms {
            id: filters.get("id").map(parse_i64).transpose()?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            span: date_filters(&filters)?,
            room_id: filters.get("room_id").map(parse_i64).transpose()?,
        }),
        "openings" => Ok(Command::SelectOpenings {
            room_id: parse_i64(filters.require("room_id")?)?,
            span: date_filters(&filters)?,
        }),
        "draft" => Ok(Command::SelectDraft),
        "reservation_summary" => Ok(Command::SelectSummary),
        "reservations" => {
            let selector = match (filters.get("id"), filters.get("processed")) {
                (Some(id), _) => ReservationSelector::Id(parse_i64(id)?),
                (None, Some(p)) if !parse_bool(p)? => ReservationSelector::Unprocessed,
                _ => ReservationSelector::All,
            };
            Ok(Command::SelectReservations { selector })
        }
        "calendar" => {
            let (year, month) = month_filters(&filters)?;
            Ok(Command::SelectCalendar { year, month })
        }
        "restrictions" => {
            let window = match (filters.get("start_date"), filters.get("end_date")) {
                (None, None) => None,
                _ => Some(date_filters(&filters)?),
            };
            Ok(Command::SelectRestrictions {
                room_id: parse_i64(filters.require("room_id")?)?,
                window,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn date_filters(filters: &Filters<'_>) -> Result<Span, SqlError> {
    Ok(Span::new(
        parse_date(filters.require("start_date")?)?,
        parse_date(filters.require("end_date")?)?,
    ))
}

fn month_filters(filters: &Filters<'_>) -> Result<(i32, u32), SqlError> {
    let year = parse_i64(filters.require("year")?)?;
    let month = parse_i64(filters.require("month")?)?;
    let year = i32::try_from(year).map_err(|_| SqlError::Parse(format!("{year} out of range")))?;
    let month =
        u32::try_from(month).map_err(|_| SqlError::Parse(format!("{month} out of range")))?;
    Ok((year, month))
}

// ── Helpers ───────────────────────────────────────────────────

/// Column = value pairs of one VALUES row. Without a column list, values bind to
/// `defaults` in order.
struct Row<'a> {
    pairs: Vec<(String, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn new(insert: &ast::Insert, defaults: &[&str], values: &'a [Expr]) -> Result<Self, SqlError> {
        let columns: Vec<String> = if insert.columns.is_empty() {
            defaults.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if values.len() > columns.len() {
            return Err(SqlError::WrongArity(columns.len(), values.len()));
        }
        if !insert.columns.is_empty() && values.len() != columns.len() {
            return Err(SqlError::WrongArity(columns.len(), values.len()));
        }
        Ok(Self {
            pairs: columns.into_iter().zip(values.iter()).collect(),
        })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.pairs.iter().find(|(c, _)| c == column).map(|(_, e)| *e)
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }
}

/// `column = value` terms of a WHERE clause joined by AND.
struct Filters<'a> {
    terms: Vec<(String, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn collect(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut terms = Vec::new();
        if let Some(expr) = selection {
            collect_eq_terms(expr, &mut terms)?;
        }
        Ok(Self { terms })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.terms.iter().find(|(c, _)| c == column).map(|(_, e)| *e)
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingFilter(column))
    }
}

fn collect_eq_terms<'a>(expr: &'a Expr, terms: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_terms(inner, terms),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_terms(left, terms)?;
                collect_eq_terms(right, terms)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                terms.push((col, right));
                Ok(())
            }
            _ => Err(SqlError::Unsupported(format!("operator {op}"))),
        },
        _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
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
            _ => Err(SqlError::Unsupported("multi-row VALUES".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<i64, SqlError> {
    let filters = Filters::collect(selection.as_ref())?;
    parse_i64(filters.require("id")?)
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

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => Ok(Some(parse_i64(expr)?)),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n, _)) => Ok(Some(n.clone())),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

/// `'YYYY-MM-DD'`
fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let text = parse_string(expr)?;
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d").map_err(|_| SqlError::BadDate(text))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    TooLong(usize),
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
    BadDate(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::TooLong(n) => write!(f, "query of {n} bytes exceeds {MAX_SQL_LENGTH}"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::BadDate(s) => write!(f, "bad date {s:?}, expected YYYY-MM-DD"),
        }
    }
}

impl std::error::Error for SqlError {}
