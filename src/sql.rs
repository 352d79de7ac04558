use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertAvailability {
        professional_id: Ulid,
        windows: Vec<NewWindow>,
    },
    DeleteAvailability {
        id: Ulid,
    },
    SelectAvailability {
        filter: AvailabilityFilter,
    },
    InsertAccount {
        id: Ulid,
        name: Option<String>,
        roles: RoleSet,
    },
    GrantRole {
        account_id: Ulid,
        role: Role,
    },
    RevokeRole {
        account_id: Ulid,
        role: Role,
    },
    SelectAccount {
        id: Ulid,
    },
    InsertAttendance {
        id: Ulid,
        patient_id: Ulid,
        professional_id: Option<Ulid>,
        note: Option<String>,
    },
    ReserveAttendance {
        id: Ulid,
        availability_id: Ulid,
    },
    UpdateAttendance {
        id: Ulid,
        changes: AttendanceChanges,
    },
    SelectAttendances {
        filter: AttendanceFilter,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches('"').to_string();
        return Ok(Command::Listen { channel });
    }
    if upper.starts_with("UNLISTEN ") {
        let channel = trimmed[9..].trim().trim_matches('"').to_string();
        if channel == "*" {
            return Ok(Command::UnlistenAll);
        }
        return Ok(Command::Unlisten { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// Column order assumed when an INSERT names no columns.
fn default_columns(table: &str) -> &'static [&'static str] {
    match table {
        "availability" => &["id", "professional_id", "start", "end"],
        "accounts" => &["id", "name", "roles"],
        "account_roles" => &["account_id", "role"],
        "attendances" => &["id", "patient_id", "professional_id", "note"],
        _ => &[],
    }
}

/// One VALUES tuple, addressed by column name.
struct Row<'a> {
    columns: &'a [String],
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }

    /// Optional id column: absent or NULL generates a fresh ULID.
    fn id_or_new(&self, column: &str) -> Result<Ulid, SqlError> {
        match self.get(column) {
            Some(expr) => Ok(parse_ulid_or_null(expr)?.unwrap_or_else(Ulid::new)),
            None => Ok(Ulid::new()),
        }
    }

    fn optional_ulid(&self, column: &str) -> Result<Option<Ulid>, SqlError> {
        self.get(column).map_or(Ok(None), parse_ulid_or_null)
    }

    fn optional_string(&self, column: &str) -> Result<Option<String>, SqlError> {
        self.get(column).map_or(Ok(None), parse_string_or_null)
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_all_insert_rows(insert)?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        default_columns(&table).iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    for (i, row) in rows.iter().enumerate() {
        if row.len() != columns.len() {
            return Err(SqlError::WrongArity(format!("{table} row {i}"), columns.len(), row.len()));
        }
    }
    let rows: Vec<Row> = rows
        .iter()
        .map(|values| Row {
            columns: &columns,
            values,
        })
        .collect();

    match table.as_str() {
        "availability" => parse_insert_availability(&rows),
        "accounts" => {
            let row = single_row(&table, &rows)?;
            let roles = match row.get("roles") {
                Some(expr) => parse_roles(expr)?,
                None => [Role::Patient].into_iter().collect(),
            };
            Ok(Command::InsertAccount {
                id: row.id_or_new("id")?,
                name: row.optional_string("name")?,
                roles,
            })
        }
        "account_roles" => {
            let row = single_row(&table, &rows)?;
            Ok(Command::GrantRole {
                account_id: parse_ulid(row.require("account_id")?)?,
                role: parse_role(row.require("role")?)?,
            })
        }
        "attendances" => {
            let row = single_row(&table, &rows)?;
            Ok(Command::InsertAttendance {
                id: row.id_or_new("id")?,
                patient_id: parse_ulid(row.require("patient_id")?)?,
                professional_id: row.optional_ulid("professional_id")?,
                note: row.optional_string("note")?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Every row of one INSERT becomes one window of a single batch.
fn parse_insert_availability(rows: &[Row]) -> Result<Command, SqlError> {
    let mut professional_id = None;
    let mut windows = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        let at_row = |e: SqlError| SqlError::Parse(format!("row {i}: {e}"));
        let pid = parse_ulid(row.require("professional_id")?).map_err(at_row)?;
        match professional_id {
            None => professional_id = Some(pid),
            Some(first) if first != pid => {
                return Err(SqlError::Parse(
                    "all rows of an availability batch must name the same professional_id".into(),
                ));
            }
            Some(_) => {}
        }
        windows.push(NewWindow {
            id: row.id_or_new("id").map_err(at_row)?,
            start: parse_i64(row.require("start")?).map_err(at_row)?,
            end: parse_i64(row.require("end")?).map_err(at_row)?,
        });
    }
    Ok(Command::InsertAvailability {
        professional_id: professional_id.ok_or_else(|| SqlError::Parse("empty VALUES".into()))?,
        windows,
    })
}

fn single_row<'r, 'a>(table: &str, rows: &'r [Row<'a>]) -> Result<&'r Row<'a>, SqlError> {
    match rows {
        [row] => Ok(row),
        _ => Err(SqlError::Unsupported(format!("multi-row INSERT into {table}"))),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;

    match table.as_str() {
        "availability" => Ok(Command::DeleteAvailability {
            id: extract_where_id(&delete.selection)?,
        }),
        "account_roles" => {
            let (mut account_id, mut role) = (None, None);
            for (column, op, value) in collect_predicates(delete.selection.as_ref())? {
                match (column.as_str(), &op) {
                    ("account_id", BinaryOperator::Eq) => account_id = Some(parse_ulid(value)?),
                    ("role", BinaryOperator::Eq) => role = Some(parse_role(value)?),
                    _ => return Err(SqlError::UnsupportedFilter(column)),
                }
            }
            Ok(Command::RevokeRole {
                account_id: account_id.ok_or(SqlError::MissingFilter("account_id"))?,
                role: role.ok_or(SqlError::MissingFilter("role"))?,
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
    if table != "attendances" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id(selection)?;

    let mut availability_id = None;
    let mut changes = AttendanceChanges::default();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        let value = &assignment.value;
        match column.as_str() {
            "availability_id" => availability_id = Some(parse_ulid(value)?),
            "date_at" => changes.date_at = Some(parse_i64(value)?),
            "duration_minutes" => changes.duration_minutes = Some(parse_u32(value)?),
            "note" => changes.note = Some(parse_string(value)?),
            "feedback" => changes.feedback = Some(parse_string(value)?),
            _ => return Err(SqlError::UnknownColumn(column)),
        }
    }

    match availability_id {
        Some(availability_id) if changes.is_empty() => {
            Ok(Command::ReserveAttendance { id, availability_id })
        }
        Some(_) => Err(SqlError::Unsupported(
            "availability_id cannot be combined with other columns".into(),
        )),
        None => Ok(Command::UpdateAttendance { id, changes }),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let predicates = collect_predicates(select.selection.as_ref())?;

    match table.as_str() {
        "availability" => {
            let mut filter = AvailabilityFilter::default();
            for (column, op, value) in predicates {
                match (column.as_str(), &op) {
                    ("professional_id", BinaryOperator::Eq) => {
                        filter.professional_id = Some(parse_ulid(value)?)
                    }
                    ("booked" | "is_booked", BinaryOperator::Eq) => {
                        filter.booked = Some(parse_bool(value)?)
                    }
                    ("start", BinaryOperator::GtEq) => filter.from = Some(parse_i64(value)?),
                    ("end", BinaryOperator::LtEq) => filter.until = Some(parse_i64(value)?),
                    _ => return Err(SqlError::UnsupportedFilter(column)),
                }
            }
            Ok(Command::SelectAvailability { filter })
        }
        "attendances" => {
            let mut filter = AttendanceFilter::default();
            for (column, op, value) in predicates {
                match (column.as_str(), &op) {
                    ("id", BinaryOperator::Eq) => filter.id = Some(parse_ulid(value)?),
                    ("patient_id", BinaryOperator::Eq) => filter.patient_id = Some(parse_ulid(value)?),
                    ("professional_id", BinaryOperator::Eq) => {
                        filter.professional_id = Some(parse_ulid(value)?)
                    }
                    ("scheduled", BinaryOperator::Eq) => filter.scheduled = Some(parse_bool(value)?),
                    _ => return Err(SqlError::UnsupportedFilter(column)),
                }
            }
            Ok(Command::SelectAttendances { filter })
        }
        "accounts" => Ok(Command::SelectAccount {
            id: extract_where_id(&select.selection)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a op x AND b op y AND ...` into `(column, op, value)` triples.
fn collect_predicates(selection: Option<&Expr>) -> Result<Vec<(String, BinaryOperator, &Expr)>, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect_into(expr, &mut out)?;
    }
    Ok(out)
}

fn collect_into<'e>(expr: &'e Expr, out: &mut Vec<(String, BinaryOperator, &'e Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_into(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_into(left, out)?;
            collect_into(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            out.push((column, op.clone(), right.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
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

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
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

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_ulid(expr).map(Some),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
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
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
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
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_role(expr: &Expr) -> Result<Role, SqlError> {
    let s = parse_string(expr)?;
    Role::parse(&s).ok_or(SqlError::UnknownRole(s))
}

/// `'patient,staff'` → {Patient, Staff}. Empty entries are skipped.
fn parse_roles(expr: &Expr) -> Result<RoleSet, SqlError> {
    let s = parse_string(expr)?;
    s.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| Role::parse(part).ok_or_else(|| SqlError::UnknownRole(part.trim().to_string())))
        .collect()
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    UnknownRole(String),
    WrongArity(String, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
    UnsupportedFilter(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::UnknownRole(r) => write!(f, "unknown role: {r}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::UnsupportedFilter(col) => write!(f, "unsupported filter on {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
