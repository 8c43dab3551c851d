use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::DEFAULT_SLOT_LEN_MS;
use crate::model::{Ms, ScheduleStatus};

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertOwner {
        id: Ulid,
        name: Option<String>,
        slot_len: Ms,
        auto_confirm: bool,
    },
    UpdateOwner {
        id: Ulid,
        name: Option<String>,
        slot_len: Option<Ms>,
        auto_confirm: Option<bool>,
    },
    DeleteOwner {
        id: Ulid,
    },
    UpsertTemplate {
        owner_id: Ulid,
        day: u8,
        enabled: bool,
        open: Ms,
        close: Ms,
    },
    DeleteTemplate {
        owner_id: Ulid,
        day: u8,
    },
    Materialize {
        owner_id: Ulid,
        from: Ms,
        to: Ms,
    },
    InsertSlot {
        id: Ulid,
        owner_id: Ulid,
        start: Ms,
        duration: Option<Ms>,
    },
    UpdateSlot {
        id: Ulid,
        start: Option<Ms>,
        auto_confirm: Option<bool>,
    },
    DeleteSlot {
        id: Ulid,
    },
    InsertSchedule {
        id: Ulid,
        slot_id: Ulid,
        customer_id: Ulid,
        items: Option<String>,
    },
    UpdateScheduleStatus {
        id: Ulid,
        status: ScheduleStatus,
    },
    MoveSchedule {
        id: Ulid,
        new_slot_id: Ulid,
    },
    SelectOwners,
    SelectTemplates {
        owner_id: Ulid,
    },
    SelectSlots {
        owner_id: Ulid,
        start: Option<Ms>,
        end: Option<Ms>,
        available_only: bool,
    },
    SelectSchedules {
        id: Option<Ulid>,
        owner_id: Option<Ulid>,
        active_only: bool,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';');
    if trimmed
        .get(..12)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("MATERIALIZE "))
    {
        return parse_materialize(trimmed);
    }

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
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// `MATERIALIZE '<owner>' FROM <ms> TO <ms>` — not SQL, pre-parsed like
/// a verb of its own.
fn parse_materialize(input: &str) -> Result<Command, SqlError> {
    let mut parts = input.split_whitespace();
    parts.next(); // MATERIALIZE
    let owner = parts
        .next()
        .ok_or(SqlError::MissingFilter("owner"))?
        .trim_matches('\'');
    let owner_id =
        Ulid::from_string(owner).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))?;
    match (parts.next(), parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(kw_from), Some(from), Some(kw_to), Some(to), None)
            if kw_from.eq_ignore_ascii_case("FROM") && kw_to.eq_ignore_ascii_case("TO") =>
        {
            let from = from
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad range start: {e}")))?;
            let to = to
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad range end: {e}")))?;
            Ok(Command::Materialize { owner_id, from, to })
        }
        _ => Err(SqlError::Parse(
            "expected MATERIALIZE '<owner>' FROM <ms> TO <ms>".into(),
        )),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "owners" => {
            if values.is_empty() {
                return Err(SqlError::WrongArity("owners", 1, 0));
            }
            let id = parse_ulid(&values[0])?;
            let name = if values.len() >= 2 {
                parse_string_or_null(&values[1])?
            } else {
                None
            };
            let slot_len = if values.len() >= 3 {
                parse_i64(&values[2])?
            } else {
                DEFAULT_SLOT_LEN_MS
            };
            let auto_confirm = if values.len() >= 4 {
                parse_bool(&values[3])?
            } else {
                false
            };
            Ok(Command::InsertOwner {
                id,
                name,
                slot_len,
                auto_confirm,
            })
        }
        "templates" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("templates", 5, values.len()));
            }
            Ok(Command::UpsertTemplate {
                owner_id: parse_ulid(&values[0])?,
                day: parse_u8(&values[1])?,
                enabled: parse_bool(&values[2])?,
                open: parse_i64(&values[3])?,
                close: parse_i64(&values[4])?,
            })
        }
        "slots" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("slots", 3, values.len()));
            }
            let duration = if values.len() >= 4 {
                parse_i64_or_null(&values[3])?
            } else {
                None
            };
            Ok(Command::InsertSlot {
                id: parse_ulid(&values[0])?,
                owner_id: parse_ulid(&values[1])?,
                start: parse_i64(&values[2])?,
                duration,
            })
        }
        "schedules" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("schedules", 3, values.len()));
            }
            let items = if values.len() >= 4 {
                parse_string_or_null(&values[3])?
            } else {
                None
            };
            Ok(Command::InsertSchedule {
                id: parse_ulid(&values[0])?,
                slot_id: parse_ulid(&values[1])?,
                customer_id: parse_ulid(&values[2])?,
                items,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    match table.as_str() {
        "owners" => {
            let mut name = None;
            let mut slot_len = None;
            let mut auto_confirm = None;
            for a in assignments {
                match assignment_column(a)?.as_str() {
                    "name" => name = parse_string_or_null(&a.value)?,
                    "slot_len" => slot_len = Some(parse_i64(&a.value)?),
                    "auto_confirm" => auto_confirm = Some(parse_bool(&a.value)?),
                    col => return Err(SqlError::UnknownColumn(col.to_string())),
                }
            }
            Ok(Command::UpdateOwner {
                id,
                name,
                slot_len,
                auto_confirm,
            })
        }
        "slots" => {
            let mut start = None;
            let mut auto_confirm = None;
            for a in assignments {
                match assignment_column(a)?.as_str() {
                    "start" => start = Some(parse_i64(&a.value)?),
                    "auto_confirm" => auto_confirm = Some(parse_bool(&a.value)?),
                    col => return Err(SqlError::UnknownColumn(col.to_string())),
                }
            }
            Ok(Command::UpdateSlot {
                id,
                start,
                auto_confirm,
            })
        }
        "schedules" => {
            if assignments.len() != 1 {
                return Err(SqlError::Unsupported(
                    "schedules accept exactly one of: status, slot_id".into(),
                ));
            }
            let a = &assignments[0];
            match assignment_column(a)?.as_str() {
                "status" => {
                    let raw = parse_string(&a.value)?;
                    let status = ScheduleStatus::parse(&raw)
                        .ok_or_else(|| SqlError::Parse(format!("unknown status: {raw}")))?;
                    Ok(Command::UpdateScheduleStatus { id, status })
                }
                "slot_id" => Ok(Command::MoveSchedule {
                    id,
                    new_slot_id: parse_ulid(&a.value)?,
                }),
                col => Err(SqlError::UnknownColumn(col.to_string())),
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;

    match table.as_str() {
        "owners" => Ok(Command::DeleteOwner {
            id: extract_where_id(&delete.selection)?,
        }),
        "slots" => Ok(Command::DeleteSlot {
            id: extract_where_id(&delete.selection)?,
        }),
        "templates" => {
            let (owner_id, day) = extract_template_key(&delete.selection)?;
            Ok(Command::DeleteTemplate { owner_id, day })
        }
        "schedules" => Err(SqlError::Unsupported(
            "schedules are never deleted; set status = 'cancelled' instead".into(),
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

    match table.as_str() {
        "owners" => Ok(Command::SelectOwners),
        "templates" => {
            let mut owner_id = None;
            if let Some(selection) = &select.selection {
                extract_eq_filters(selection, &mut |col, value| {
                    if col == "owner_id" {
                        owner_id = Some(parse_ulid_expr(value)?);
                    }
                    Ok(())
                })?;
            }
            Ok(Command::SelectTemplates {
                owner_id: owner_id.ok_or(SqlError::MissingFilter("owner_id"))?,
            })
        }
        "slots" => {
            let (mut owner_id, mut start, mut end, mut available_only) = (None, None, None, false);
            if let Some(selection) = &select.selection {
                extract_slot_filters(
                    selection,
                    &mut owner_id,
                    &mut start,
                    &mut end,
                    &mut available_only,
                )?;
            }
            if start.is_some() != end.is_some() {
                return Err(SqlError::MissingFilter("both start and \"end\""));
            }
            Ok(Command::SelectSlots {
                owner_id: owner_id.ok_or(SqlError::MissingFilter("owner_id"))?,
                start,
                end,
                available_only,
            })
        }
        "schedules" => {
            let (mut id, mut owner_id, mut active_only) = (None, None, false);
            if let Some(selection) = &select.selection {
                extract_eq_filters(selection, &mut |col, value| {
                    match col {
                        "id" => id = Some(parse_ulid_expr(value)?),
                        "owner_id" => owner_id = Some(parse_ulid_expr(value)?),
                        "active" => active_only = parse_bool(value)?,
                        _ => {}
                    }
                    Ok(())
                })?;
            }
            if id.is_none() && owner_id.is_none() {
                return Err(SqlError::MissingFilter("owner_id"));
            }
            Ok(Command::SelectSchedules {
                id,
                owner_id,
                active_only,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Walk an AND-joined WHERE clause calling `on_eq(column, value)` for
/// every equality comparison.
fn extract_eq_filters(
    expr: &Expr,
    on_eq: &mut impl FnMut(&str, &Expr) -> Result<(), SqlError>,
) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_eq_filters(left, on_eq)?;
                extract_eq_filters(right, on_eq)?;
            }
            ast::BinaryOperator::Eq => {
                if let Some(col) = expr_column_name(left) {
                    on_eq(&col, right)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn extract_slot_filters(
    expr: &Expr,
    owner_id: &mut Option<Ulid>,
    start: &mut Option<Ms>,
    end: &mut Option<Ms>,
    available_only: &mut bool,
) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_slot_filters(left, owner_id, start, end, available_only)?;
                extract_slot_filters(right, owner_id, start, end, available_only)?;
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left);
                if col.as_deref() == Some("owner_id") {
                    *owner_id = Some(parse_ulid_expr(right)?);
                } else if col.as_deref() == Some("available") {
                    *available_only = parse_bool(right)?;
                }
            }
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    *start = Some(parse_i64_expr(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    *end = Some(parse_i64_expr(right)?);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn extract_template_key(selection: &Option<Expr>) -> Result<(Ulid, u8), SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("owner_id"))?;
    let (mut owner_id, mut day) = (None, None);
    extract_eq_filters(sel, &mut |col, value| {
        match col {
            "owner_id" => owner_id = Some(parse_ulid_expr(value)?),
            "day" => day = Some(parse_u8(value)?),
            _ => {}
        }
        Ok(())
    })?;
    Ok((
        owner_id.ok_or(SqlError::MissingFilter("owner_id"))?,
        day.ok_or(SqlError::MissingFilter("day"))?,
    ))
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

fn assignment_column(a: &ast::Assignment) -> Result<String, SqlError> {
    match &a.target {
        ast::AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))
        }
        _ => Err(SqlError::Parse("unsupported assignment target".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            if values.rows.len() > 1 {
                return Err(SqlError::Unsupported("multi-row INSERT".into()));
            }
            Ok(values.rows[0].clone())
        }
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_expr(expr)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    parse_i64_expr(expr)
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64_expr(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u8 range")))
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    Ok(Some(parse_i64_expr(expr)?))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
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
    UnknownColumn(String),
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
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
