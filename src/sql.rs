use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertSpace {
        name: String,
        capacity: u32,
    },
    UpdateSpace {
        id: Ulid,
        name: Option<String>,
        capacity: Option<u32>,
    },
    DeleteSpace {
        id: Ulid,
    },
    SelectSpaces {
        id: Option<Ulid>,
    },
    InsertPass {
        pass: NewPass,
    },
    UpdatePass {
        id: Ulid,
        payment_status: PaymentStatus,
    },
    DeletePass {
        id: Ulid,
    },
    SelectPasses {
        filter: PassFilter,
    },
    InsertReservation {
        client_id: String,
        space_id: Ulid,
        start: Ms,
        end: Ms,
        pass_id: Option<Ulid>,
    },
    MoveReservation {
        id: Ulid,
        start: Ms,
        end: Ms,
    },
    AttendReservation {
        id: Ulid,
    },
    CancelReservation {
        id: Ulid,
    },
    SelectReservations {
        filter: ReservationFilter,
        status: Option<ReservationStatus>,
    },
    InsertAttendance {
        pass_id: Ulid,
        date: Option<Ms>,
    },
    UpdateAttendance {
        id: Ulid,
        date: Ms,
    },
    DeleteAttendance {
        id: Ulid,
    },
    SelectAttendance {
        pass_id: Ulid,
        order: AttendanceOrder,
    },
    SelectOccupancy {
        space_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassFilter {
    All,
    Id(Ulid),
    Client(String),
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationFilter {
    Id(Ulid),
    Space { space_id: Ulid, window: Option<Span> },
    Client(String),
}

const SPACE_COLUMNS: &[&str] = &["name", "capacity"];
const PASS_COLUMNS: &[&str] = &[
    "client_id",
    "total_sessions",
    "session_duration_minutes",
    "payment_status",
    "kind",
    "trainers",
];
const RESERVATION_COLUMNS: &[&str] = &["client_id", "space_id", "start", "end", "pass_id"];
const ATTENDANCE_COLUMNS: &[&str] = &["pass_id", "date"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row keyed by column name. Without a column list the table's
/// default column order applies.
struct Row {
    columns: Vec<String>,
    values: Vec<Expr>,
}

impl Row {
    fn get(&self, column: &str) -> Option<&Expr> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    fn require(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }
}

fn insert_row(
    insert: &ast::Insert,
    table: &'static str,
    defaults: &[&str],
) -> Result<Row, SqlError> {
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        // Trailing columns may be omitted.
        if values.len() > defaults.len() {
            return Err(SqlError::WrongArity(table, defaults.len(), values.len()));
        }
        defaults[..values.len()].iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| ident_text(&c.to_string())).collect()
    };
    if values.len() != columns.len() {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }
    if let Some(unknown) = columns.iter().find(|c| !defaults.contains(&c.as_str())) {
        return Err(SqlError::UnknownColumn(unknown.clone()));
    }
    Ok(Row { columns, values })
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "spaces" => {
            let row = insert_row(insert, "spaces", SPACE_COLUMNS)?;
            Ok(Command::InsertSpace {
                name: parse_string(row.require("name")?)?,
                capacity: parse_u32(row.require("capacity")?)?,
            })
        }
        "passes" => {
            let row = insert_row(insert, "passes", PASS_COLUMNS)?;
            let payment_status = match row.get("payment_status") {
                Some(e) => parse_payment_status(e)?,
                None => PaymentStatus::Pending,
            };
            let kind = match row.get("kind") {
                Some(e) => parse_pass_kind(e)?,
                None => PassKind::SessionBundle,
            };
            let trainers = match row.get("trainers") {
                Some(e) => parse_string_or_null(e)?
                    .map(|s| split_list(&s))
                    .unwrap_or_default(),
                None => Vec::new(),
            };
            Ok(Command::InsertPass {
                pass: NewPass {
                    client_id: parse_string(row.require("client_id")?)?,
                    kind,
                    total_sessions: parse_u32(row.require("total_sessions")?)?,
                    session_duration_minutes: parse_u32(row.require("session_duration_minutes")?)?,
                    payment_status,
                    trainers,
                },
            })
        }
        "reservations" => {
            let row = insert_row(insert, "reservations", RESERVATION_COLUMNS)?;
            let pass_id = match row.get("pass_id") {
                Some(e) => parse_ulid_or_null(e)?,
                None => None,
            };
            Ok(Command::InsertReservation {
                client_id: parse_string(row.require("client_id")?)?,
                space_id: parse_ulid(row.require("space_id")?)?,
                start: parse_i64(row.require("start")?)?,
                end: parse_i64(row.require("end")?)?,
                pass_id,
            })
        }
        "attendance" => {
            let row = insert_row(insert, "attendance", ATTENDANCE_COLUMNS)?;
            let date = match row.get("date") {
                Some(e) => parse_i64_or_null(e)?,
                None => None,
            };
            Ok(Command::InsertAttendance {
                pass_id: parse_ulid(row.require("pass_id")?)?,
                date,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;
    let set: Vec<(String, &Expr)> = assignments
        .iter()
        .map(|a| (ident_text(&a.target.to_string()), &a.value))
        .collect();
    let get = |col: &str| set.iter().find(|(c, _)| c == col).map(|(_, e)| *e);
    let reject_others = |allowed: &[&str]| -> Result<(), SqlError> {
        match set.iter().find(|(c, _)| !allowed.contains(&c.as_str())) {
            Some((c, _)) => Err(SqlError::UnknownColumn(c.clone())),
            None => Ok(()),
        }
    };

    match table.as_str() {
        "spaces" => {
            reject_others(&["name", "capacity"])?;
            let name = get("name").map(parse_string).transpose()?;
            let capacity = get("capacity").map(parse_u32).transpose()?;
            if name.is_none() && capacity.is_none() {
                return Err(SqlError::MissingColumn("capacity"));
            }
            Ok(Command::UpdateSpace { id, name, capacity })
        }
        "passes" => {
            reject_others(&["payment_status"])?;
            let status = get("payment_status").ok_or(SqlError::MissingColumn("payment_status"))?;
            Ok(Command::UpdatePass {
                id,
                payment_status: parse_payment_status(status)?,
            })
        }
        "reservations" => {
            if let Some(attended) = get("attended") {
                reject_others(&["attended"])?;
                if !parse_bool(attended)? {
                    return Err(SqlError::Unsupported(
                        "attendance cannot be unset; delete the attendance entry instead".into(),
                    ));
                }
                return Ok(Command::AttendReservation { id });
            }
            reject_others(&["start", "end"])?;
            Ok(Command::MoveReservation {
                id,
                start: parse_i64(get("start").ok_or(SqlError::MissingColumn("start"))?)?,
                end: parse_i64(get("end").ok_or(SqlError::MissingColumn("end"))?)?,
            })
        }
        "attendance" => {
            reject_others(&["date"])?;
            Ok(Command::UpdateAttendance {
                id,
                date: parse_i64(get("date").ok_or(SqlError::MissingColumn("date"))?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "spaces" => Ok(Command::DeleteSpace { id }),
        "passes" => Ok(Command::DeletePass { id }),
        "reservations" => Ok(Command::CancelReservation { id }),
        "attendance" => Ok(Command::DeleteAttendance { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterOp {
    Eq,
    Gt,
    GtEq,
    Lt,
    LtEq,
}

/// Flattened `col <op> value` conjuncts of a WHERE clause.
struct Filters {
    terms: Vec<(String, FilterOp, Expr)>,
}

impl Filters {
    fn collect(selection: &Option<Expr>) -> Result<Self, SqlError> {
        let mut terms = Vec::new();
        if let Some(expr) = selection {
            collect_terms(expr, &mut terms)?;
        }
        Ok(Self { terms })
    }

    fn find(&self, column: &str, op: FilterOp) -> Option<&Expr> {
        self.terms
            .iter()
            .find(|(c, o, _)| c == column && *o == op)
            .map(|(_, _, e)| e)
    }

    fn eq(&self, column: &str) -> Option<&Expr> {
        self.find(column, FilterOp::Eq)
    }

    fn mentions(&self, column: &str) -> bool {
        self.terms.iter().any(|(c, _, _)| c == column)
    }
}

fn collect_terms(expr: &Expr, terms: &mut Vec<(String, FilterOp, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_terms(inner, terms),
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                ast::BinaryOperator::And => {
                    collect_terms(left, terms)?;
                    return collect_terms(right, terms);
                }
                ast::BinaryOperator::Eq => FilterOp::Eq,
                ast::BinaryOperator::Gt => FilterOp::Gt,
                ast::BinaryOperator::GtEq => FilterOp::GtEq,
                ast::BinaryOperator::Lt => FilterOp::Lt,
                ast::BinaryOperator::LtEq => FilterOp::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            terms.push((column, op, right.as_ref().clone()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
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
    let filters = Filters::collect(&select.selection)?;

    match table.as_str() {
        "spaces" => Ok(Command::SelectSpaces {
            id: filters.eq("id").map(parse_ulid).transpose()?,
        }),
        "passes" => {
            let filter = if let Some(id) = filters.eq("id") {
                PassFilter::Id(parse_ulid(id)?)
            } else if let Some(client) = filters.eq("client_id") {
                PassFilter::Client(parse_string(client)?)
            } else if let Some(min) = filters.find("remaining_sessions", FilterOp::Gt) {
                if parse_i64(min)? != 0 {
                    return Err(SqlError::Unsupported(
                        "only remaining_sessions > 0 is supported".into(),
                    ));
                }
                PassFilter::Active
            } else {
                PassFilter::All
            };
            Ok(Command::SelectPasses { filter })
        }
        "reservations" => {
            let filter = if let Some(id) = filters.eq("id") {
                ReservationFilter::Id(parse_ulid(id)?)
            } else if let Some(space) = filters.eq("space_id") {
                // Overlap with [a, b): start < b AND "end" > a.
                let before = filters.find("start", FilterOp::Lt).map(parse_i64).transpose()?;
                let after = filters.find("end", FilterOp::Gt).map(parse_i64).transpose()?;
                let window = match (after, before) {
                    (Some(a), Some(b)) if a < b => Some(Span::new(a, b)),
                    (None, None) if !filters.mentions("start") && !filters.mentions("end") => None,
                    _ => {
                        return Err(SqlError::Parse(
                            r#"window must be start < b AND "end" > a with a < b"#.into(),
                        ));
                    }
                };
                ReservationFilter::Space {
                    space_id: parse_ulid(space)?,
                    window,
                }
            } else if let Some(client) = filters.eq("client_id") {
                ReservationFilter::Client(parse_string(client)?)
            } else {
                return Err(SqlError::MissingFilter("space_id"));
            };
            let status = filters.eq("status").map(parse_status).transpose()?;
            Ok(Command::SelectReservations { filter, status })
        }
        "attendance" => {
            let pass_id = filters
                .eq("pass_id")
                .ok_or(SqlError::MissingFilter("pass_id"))?;
            let descending = query
                .order_by
                .as_ref()
                .is_some_and(|o| o.to_string().to_uppercase().contains("DESC"));
            Ok(Command::SelectAttendance {
                pass_id: parse_ulid(pass_id)?,
                order: if descending {
                    AttendanceOrder::Newest
                } else {
                    AttendanceOrder::Oldest
                },
            })
        }
        "occupancy" => Ok(Command::SelectOccupancy {
            space_id: parse_ulid(filters.eq("space_id").ok_or(SqlError::MissingFilter("space_id"))?)?,
            start: parse_i64(
                filters
                    .find("start", FilterOp::GtEq)
                    .ok_or(SqlError::MissingFilter("start"))?,
            )?,
            end: parse_i64(
                filters
                    .find("end", FilterOp::LtEq)
                    .ok_or(SqlError::MissingFilter("end"))?,
            )?,
            exclude: filters.eq("exclude_id").map(parse_ulid).transpose()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Helpers ───────────────────────────────────────────────────

/// Normalise a rendered identifier: drop quotes, lowercase.
fn ident_text(rendered: &str) -> String {
    rendered.trim_matches('"').to_lowercase()
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
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
        SetExpr::Values(values) => match values.rows.len() {
            0 => Err(SqlError::Parse("empty VALUES".into())),
            1 => Ok(values.rows[0].clone()),
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
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
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
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_ulid(expr).map(Some),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_i64(expr).map(Some),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_payment_status(expr: &Expr) -> Result<PaymentStatus, SqlError> {
    let s = parse_string(expr)?;
    PaymentStatus::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad payment status: {s}")))
}

fn parse_pass_kind(expr: &Expr) -> Result<PassKind, SqlError> {
    let s = parse_string(expr)?;
    PassKind::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad pass kind: {s}")))
}

fn parse_status(expr: &Expr) -> Result<ReservationStatus, SqlError> {
    let s = parse_string(expr)?;
    match s.to_lowercase().as_str() {
        "confirmed" => Ok(ReservationStatus::Confirmed),
        "cancelled" => Ok(ReservationStatus::Cancelled),
        _ => Err(SqlError::Parse(format!("bad reservation status: {s}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
