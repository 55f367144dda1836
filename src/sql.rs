use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertService {
        id: Ulid,
        name: String,
        modality: Modality,
        visit_phase: VisitPhase,
    },
    SetServiceActive {
        id: Ulid,
        active: bool,
    },
    InsertParticipant {
        id: Ulid,
        email: String,
    },
    InsertSlot {
        id: Ulid,
        service_id: Ulid,
        starts_at: Ms,
        capacity: u32,
    },
    DeleteSlot {
        id: Ulid,
    },
    InsertBooking {
        id: Ulid,
        participant_id: Ulid,
        service_id: Ulid,
        slot_id: Ulid,
    },
    CancelBooking {
        id: Ulid,
    },
    RescheduleBooking {
        id: Ulid,
        slot_id: Ulid,
    },
    SelectAvailableSlots {
        service_id: Ulid,
    },
    /// `active: None` lists every service.
    SelectServices {
        active: Option<bool>,
    },
    SelectBookings {
        participant_id: Ulid,
    },
    SelectProgress {
        participant_id: Ulid,
    },
    SelectSlotOverview,
}

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

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "services" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("services", 4, values.len()));
            }
            let modality = parse_string(&values[2])?;
            let visit_phase = parse_string(&values[3])?;
            Ok(Command::InsertService {
                id: parse_ulid_expr(&values[0])?,
                name: parse_string(&values[1])?,
                modality: Modality::parse(&modality)
                    .ok_or_else(|| SqlError::Parse(format!("bad modality: {modality}")))?,
                visit_phase: VisitPhase::parse(&visit_phase)
                    .ok_or_else(|| SqlError::Parse(format!("bad visit_phase: {visit_phase}")))?,
            })
        }
        "participants" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("participants", 2, values.len()));
            }
            Ok(Command::InsertParticipant {
                id: parse_ulid_expr(&values[0])?,
                email: parse_string(&values[1])?,
            })
        }
        "slots" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("slots", 3, values.len()));
            }
            let capacity = match values.get(3) {
                Some(v) => parse_u32(v)?,
                None => 1,
            };
            Ok(Command::InsertSlot {
                id: parse_ulid_expr(&values[0])?,
                service_id: parse_ulid_expr(&values[1])?,
                starts_at: parse_i64_expr(&values[2])?,
                capacity,
            })
        }
        "bookings" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("bookings", 4, values.len()));
            }
            Ok(Command::InsertBooking {
                id: parse_ulid_expr(&values[0])?,
                participant_id: parse_ulid_expr(&values[1])?,
                service_id: parse_ulid_expr(&values[2])?,
                slot_id: parse_ulid_expr(&values[3])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;
    let [assignment] = assignments else {
        return Err(SqlError::Unsupported("exactly one SET column is supported".into()));
    };
    let column = match &assignment.target {
        AssignmentTarget::ColumnName(name) => object_name_last(name),
        AssignmentTarget::Tuple(_) => None,
    }
    .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
    let value = &assignment.value;

    match (table.as_str(), column.as_str()) {
        ("services", "active") => Ok(Command::SetServiceActive {
            id,
            active: parse_bool(value)?,
        }),
        ("bookings", "status") => {
            let status = parse_string(value)?;
            if status.eq_ignore_ascii_case(BookingStatus::Cancelled.as_str()) {
                Ok(Command::CancelBooking { id })
            } else {
                Err(SqlError::Unsupported(format!("booking status can only be set to CANCELLED, not {status}")))
            }
        }
        ("bookings", "slot_id") => Ok(Command::RescheduleBooking {
            id,
            slot_id: parse_ulid_expr(value)?,
        }),
        ("services" | "bookings", _) => Err(SqlError::Unsupported(format!("UPDATE {table} SET {column}"))),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "slots" => Ok(Command::DeleteSlot { id }),
        "bookings" => Err(SqlError::Unsupported(
            "bookings are cancelled, not deleted: UPDATE bookings SET status = 'CANCELLED'".into(),
        )),
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
        collect_eq_filters(selection, &mut filters);
    }
    let filter = |col: &'static str| {
        filters
            .iter()
            .find(|(name, _)| name == col)
            .map(|(_, expr)| *expr)
            .ok_or(SqlError::MissingFilter(col))
    };

    match table.as_str() {
        "available_slots" => Ok(Command::SelectAvailableSlots {
            service_id: parse_ulid_expr(filter("service_id")?)?,
        }),
        "services" => Ok(Command::SelectServices {
            active: match filter("active") {
                Ok(expr) => Some(parse_bool(expr)?),
                Err(_) => None,
            },
        }),
        "bookings" => Ok(Command::SelectBookings {
            participant_id: parse_ulid_expr(filter("participant_id")?)?,
        }),
        "progress" => Ok(Command::SelectProgress {
            participant_id: parse_ulid_expr(filter("participant_id")?)?,
        }),
        "slot_overview" => Ok(Command::SelectSlotOverview),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col = value` terms joined by AND. Other predicates are ignored.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out);
            collect_eq_filters(right, out);
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if let Some(col) = expr_column_name(left) {
                out.push((col, right.as_ref()));
            }
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        _ => {}
    }
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
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
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
            Value::Number(n, _) => match n.as_str() {
                "1" => Ok(true),
                "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {n}"))),
            },
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
