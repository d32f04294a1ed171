use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, LimitClause, ObjectNamePart, SetExpr,
    Statement, TableFactor, TableObject, UnaryOperator, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::clock::parse_rfc3339;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource(ResourceInfo),
    UpdateResource {
        id: Ulid,
        changes: ResourcePatch,
    },
    DeleteResource {
        id: Ulid,
    },
    SelectResources {
        id: Option<Ulid>,
    },
    /// Status is always `Confirmed` here; the handler downgrades it to
    /// `Pending` for resources that require approval.
    InsertBooking(NewBooking),
    UpdateBooking {
        id: Ulid,
        patch: BookingPatch,
    },
    /// `DELETE FROM bookings` cancels; rows are never physically removed.
    CancelBooking {
        id: Ulid,
    },
    SelectBookings {
        id: Option<Ulid>,
        filter: BookingFilter,
        page: Page,
    },
    SelectUserBookings {
        user_id: Ulid,
    },
    SelectTodayBookings,
    SelectConflicts {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        exclude_id: Option<Ulid>,
    },
}

const RESOURCE_COLUMNS: &[&str] = &["id", "name", "category", "capacity", "location", "requires_approval"];
const BOOKING_COLUMNS: &[&str] = &["id", "resource_id", "user_id", "start", "end", "title", "notes"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements".into()));
    }

    match stmt {
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

/// Shape of the rows a statement returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowShape {
    None,
    Resource,
    Booking,
    Conflict,
}

/// Decided from the target table alone, so it also works on prepared
/// statements whose `$n` parameters are not bound yet.
pub fn row_shape(sql: &str) -> RowShape {
    let Ok(stmts) = Parser::parse_sql(&PostgreSqlDialect {}, sql) else {
        return RowShape::None;
    };
    let Some(stmt) = stmts.first() else {
        return RowShape::None;
    };
    let table = match stmt {
        Statement::Insert(insert) => insert_table_name(insert).ok(),
        Statement::Update { table, .. } => table_factor_name(&table.relation).ok(),
        Statement::Delete(delete) => delete_table_name(delete).ok(),
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => select
                .from
                .first()
                .and_then(|f| table_factor_name(&f.relation).ok()),
            _ => None,
        },
        _ => None,
    };
    let is_query = matches!(stmt, Statement::Query(_));
    match table.as_deref() {
        Some("bookings") => RowShape::Booking,
        Some("user_bookings" | "today_bookings") if is_query => RowShape::Booking,
        Some("resources") if is_query => RowShape::Resource,
        Some("conflicts") if is_query => RowShape::Conflict,
        _ => RowShape::None,
    }
}

// ── INSERT ───────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "resources" => {
            let row = insert_row(insert, "resources", RESOURCE_COLUMNS)?;
            resource_from_row(row).map(Command::InsertResource)
        }
        "bookings" => {
            let row = insert_row(insert, "bookings", BOOKING_COLUMNS)?;
            booking_from_row(row).map(Command::InsertBooking)
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn resource_from_row(row: Vec<(String, &Expr)>) -> Result<ResourceInfo, SqlError> {
    let mut id = None;
    let mut name = None;
    let mut category = ResourceCategory::Other;
    let mut capacity = None;
    let mut location = None;
    let mut requires_approval = false;
    for (column, expr) in row {
        match column.as_str() {
            "id" => id = parse_ulid_or_null(expr)?,
            "name" => name = Some(parse_string(expr)?),
            "category" => category = parse_enum(expr)?,
            "capacity" => capacity = parse_u32_or_null(expr)?,
            "location" => location = parse_string_or_null(expr)?,
            "requires_approval" => requires_approval = parse_bool(expr)?,
            _ => return Err(SqlError::UnknownColumn("resources", column)),
        }
    }
    Ok(ResourceInfo {
        id: id.unwrap_or_else(Ulid::new),
        name: name.ok_or(SqlError::MissingColumn("name"))?,
        category,
        capacity,
        location,
        requires_approval,
    })
}

fn booking_from_row(row: Vec<(String, &Expr)>) -> Result<NewBooking, SqlError> {
    let mut id = None;
    let mut resource_id = None;
    let mut user_id = None;
    let mut start = None;
    let mut end = None;
    let mut title = None;
    let mut notes = None;
    for (column, expr) in row {
        match column.as_str() {
            "id" => id = parse_ulid_or_null(expr)?,
            "resource_id" => resource_id = Some(parse_ulid(expr)?),
            "user_id" => user_id = Some(parse_ulid(expr)?),
            "start" => start = Some(parse_timestamp(expr)?),
            "end" => end = Some(parse_timestamp(expr)?),
            "title" => title = Some(parse_string(expr)?),
            "notes" => notes = parse_string_or_null(expr)?,
            _ => return Err(SqlError::UnknownColumn("bookings", column)),
        }
    }
    let mut booking = NewBooking::new(
        resource_id.ok_or(SqlError::MissingColumn("resource_id"))?,
        user_id.ok_or(SqlError::MissingColumn("user_id"))?,
        start.ok_or(SqlError::MissingColumn("start"))?,
        end.ok_or(SqlError::MissingColumn("end"))?,
        title.ok_or(SqlError::MissingColumn("title"))?,
    );
    booking.id = id;
    booking.notes = notes;
    Ok(booking)
}

// ── UPDATE ───────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;
    if assignments.is_empty() {
        return Err(SqlError::Parse("UPDATE without SET".into()));
    }

    match table.as_str() {
        "resources" => {
            let mut changes = ResourcePatch::default();
            for (column, expr) in assignment_pairs(assignments)? {
                match column.as_str() {
                    "name" => changes.name = Some(parse_string(expr)?),
                    "category" => changes.category = Some(parse_enum(expr)?),
                    "capacity" => changes.capacity = Some(parse_u32_or_null(expr)?),
                    "location" => changes.location = Some(parse_string_or_null(expr)?),
                    "requires_approval" => changes.requires_approval = Some(parse_bool(expr)?),
                    _ => return Err(SqlError::UnknownColumn("resources", column)),
                }
            }
            Ok(Command::UpdateResource { id, changes })
        }
        "bookings" => {
            let mut patch = BookingPatch::default();
            for (column, expr) in assignment_pairs(assignments)? {
                match column.as_str() {
                    "resource_id" => patch.resource_id = Some(parse_ulid(expr)?),
                    "start" => patch.start = Some(parse_timestamp(expr)?),
                    "end" => patch.end = Some(parse_timestamp(expr)?),
                    "title" => patch.title = Some(parse_string(expr)?),
                    "notes" => patch.notes = Some(parse_string_or_null(expr)?),
                    _ => return Err(SqlError::UnknownColumn("bookings", column)),
                }
            }
            Ok(Command::UpdateBooking { id, patch })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn assignment_pairs(assignments: &[ast::Assignment]) -> Result<Vec<(String, &Expr)>, SqlError> {
    assignments
        .iter()
        .map(|a| match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .map(|column| (column, &a.value))
                .ok_or_else(|| SqlError::Parse("empty column name".into())),
            AssignmentTarget::Tuple(_) => Err(SqlError::Unsupported("tuple assignment".into())),
        })
        .collect()
}

// ── DELETE ───────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "resources" => Ok(Command::DeleteResource { id }),
        "bookings" => Ok(Command::CancelBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ───────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut predicates = Vec::new();
    if let Some(selection) = &select.selection {
        collect_predicates(selection, &mut predicates)?;
    }

    match table.as_str() {
        "resources" => {
            let mut id = None;
            for p in predicates {
                match (p.column.as_str(), p.op) {
                    ("id", BinaryOperator::Eq) => id = Some(parse_ulid(p.value)?),
                    _ => return Err(p.unsupported()),
                }
            }
            Ok(Command::SelectResources { id })
        }
        "bookings" => {
            let mut id = None;
            let mut filter = BookingFilter::default();
            for p in predicates {
                match (p.column.as_str(), p.op) {
                    ("id", BinaryOperator::Eq) => id = Some(parse_ulid(p.value)?),
                    ("resource_id", BinaryOperator::Eq) => filter.resource_id = Some(parse_ulid(p.value)?),
                    ("user_id", BinaryOperator::Eq) => filter.user_id = Some(parse_ulid(p.value)?),
                    ("status", BinaryOperator::Eq) => filter.status = Some(parse_enum(p.value)?),
                    ("start", BinaryOperator::GtEq) => filter.from = Some(parse_timestamp(p.value)?),
                    ("end", BinaryOperator::LtEq) => filter.until = Some(parse_timestamp(p.value)?),
                    _ => return Err(p.unsupported()),
                }
            }
            let page = parse_page(query)?;
            Ok(Command::SelectBookings { id, filter, page })
        }
        "user_bookings" => {
            let mut user_id = None;
            for p in predicates {
                match (p.column.as_str(), p.op) {
                    ("user_id", BinaryOperator::Eq) => user_id = Some(parse_ulid(p.value)?),
                    _ => return Err(p.unsupported()),
                }
            }
            Ok(Command::SelectUserBookings {
                user_id: user_id.ok_or(SqlError::MissingFilter("user_id"))?,
            })
        }
        "today_bookings" => match predicates.into_iter().next() {
            None => Ok(Command::SelectTodayBookings),
            Some(p) => Err(p.unsupported()),
        },
        "conflicts" => {
            let (mut resource_id, mut start, mut end, mut exclude_id) = (None, None, None, None);
            for p in predicates {
                match (p.column.as_str(), p.op) {
                    ("resource_id", BinaryOperator::Eq) => resource_id = Some(parse_ulid(p.value)?),
                    ("start", BinaryOperator::GtEq) => start = Some(parse_timestamp(p.value)?),
                    ("end", BinaryOperator::LtEq) => end = Some(parse_timestamp(p.value)?),
                    ("exclude_id", BinaryOperator::Eq) => exclude_id = parse_ulid_or_null(p.value)?,
                    _ => return Err(p.unsupported()),
                }
            }
            Ok(Command::SelectConflicts {
                resource_id: resource_id.ok_or(SqlError::MissingFilter("resource_id"))?,
                start: start.ok_or(SqlError::MissingFilter("start"))?,
                end: end.ok_or(SqlError::MissingFilter("end"))?,
                exclude_id,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// One `column <op> value` term of a WHERE clause.
struct Predicate<'a> {
    column: String,
    op: &'a BinaryOperator,
    value: &'a Expr,
}

impl Predicate<'_> {
    fn unsupported(&self) -> SqlError {
        SqlError::Unsupported(format!("filter {} {}", self.column, self.op))
    }
}

/// Flatten a conjunction of simple comparisons. Anything else (OR, functions,
/// column-to-column comparisons) is rejected.
fn collect_predicates<'a>(expr: &'a Expr, out: &mut Vec<Predicate<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_predicates(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_predicates(left, out)?;
            collect_predicates(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
            out.push(Predicate {
                column,
                op,
                value: right,
            });
            Ok(())
        }
        _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
    }
}

fn parse_page(query: &ast::Query) -> Result<Page, SqlError> {
    let mut page = Page::default();
    match &query.limit_clause {
        None => {}
        Some(LimitClause::LimitOffset { limit, offset, .. }) => {
            if let Some(limit) = limit {
                page.limit = parse_usize(limit)?;
            }
            if let Some(offset) = offset {
                page.offset = parse_usize(&offset.value)?;
            }
        }
        Some(LimitClause::OffsetCommaLimit { offset, limit }) => {
            page.offset = parse_usize(offset)?;
            page.limit = parse_usize(limit)?;
        }
    }
    Ok(page)
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

/// The single VALUES row of an INSERT, each value paired with its column.
/// Without a column list, values map onto `default_columns` in order.
fn insert_row<'a>(
    insert: &'a ast::Insert,
    table: &'static str,
    default_columns: &[&str],
) -> Result<Vec<(String, &'a Expr)>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let rows = match body.body.as_ref() {
        SetExpr::Values(values) => &values.rows,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let row = match rows.as_slice() {
        [] => return Err(SqlError::Parse("empty VALUES".into())),
        [row] => row,
        _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
    };

    let columns: Vec<String> = if insert.columns.is_empty() {
        default_columns.iter().take(row.len()).map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if columns.len() != row.len() {
        return Err(SqlError::WrongArity(table, columns.len(), row.len()));
    }
    Ok(columns.into_iter().zip(row.iter()).collect())
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid(expr).map(Some)
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_enum<T>(expr: &Expr) -> Result<T, SqlError>
where
    T: std::str::FromStr<Err = UnknownVariant>,
{
    parse_string(expr)?
        .parse()
        .map_err(|e: UnknownVariant| SqlError::Parse(e.to_string()))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    let v = parse_i64(expr)?;
    u32::try_from(v)
        .map(Some)
        .map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_usize(expr: &Expr) -> Result<usize, SqlError> {
    let v = parse_i64(expr)?;
    usize::try_from(v).map_err(|_| SqlError::Parse(format!("{v} is negative")))
}

/// Unix milliseconds, either as a number or as a string holding a number or
/// an RFC 3339 timestamp.
fn parse_timestamp(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr) {
        if let Ok(ms) = s.trim().parse::<Ms>() {
            return Ok(ms);
        }
        return parse_rfc3339(s.trim()).ok_or_else(|| SqlError::Parse(format!("bad timestamp: {s}")));
    }
    parse_i64(expr)
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
    #[error("unknown column on {0}: {1}")]
    UnknownColumn(&'static str, String),
    #[error("{0}: {1} columns but {2} values")]
    WrongArity(&'static str, usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const RID: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";
    const UID: &str = "01BX5ZZKBKACTAV9WEVGEMMVS0";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn parse_insert_resource() {
        let sql = format!(
            "INSERT INTO resources (id, name, category, capacity, location, requires_approval) \
             VALUES ('{ID}', 'Aurora', 'room', 12, '2nd floor', true)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertResource(info) => {
                assert_eq!(info.id, ulid(ID));
                assert_eq!(info.name, "Aurora");
                assert_eq!(info.category, ResourceCategory::Room);
                assert_eq!(info.capacity, Some(12));
                assert_eq!(info.location.as_deref(), Some("2nd floor"));
                assert!(info.requires_approval);
            }
            cmd => panic!("expected InsertResource, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_resource_defaults() {
        let sql = "INSERT INTO resources (name, capacity) VALUES ('Van 3', NULL)";
        match parse_sql(sql).unwrap() {
            Command::InsertResource(info) => {
                assert_eq!(info.name, "Van 3");
                assert_eq!(info.category, ResourceCategory::Other);
                assert_eq!(info.capacity, None);
                assert!(!info.requires_approval);
            }
            cmd => panic!("expected InsertResource, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_resource_without_name_errors() {
        let sql = format!("INSERT INTO resources (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingColumn("name"))));
    }

    #[test]
    fn parse_insert_resource_bad_category() {
        let sql = "INSERT INTO resources (name, category) VALUES ('Boat', 'yacht')";
        let err = parse_sql(sql).unwrap_err();
        assert!(err.to_string().contains("unknown resource category"));
    }

    #[test]
    fn parse_update_resource() {
        let sql = format!(
            "UPDATE resources SET name = 'Borealis', location = NULL, requires_approval = 'f' WHERE id = '{ID}'"
        );
        match parse_sql(&sql).unwrap() {
            Command::UpdateResource { id, changes } => {
                assert_eq!(id, ulid(ID));
                assert_eq!(changes.name.as_deref(), Some("Borealis"));
                assert_eq!(changes.location, Some(None));
                assert_eq!(changes.requires_approval, Some(false));
                assert_eq!(changes.capacity, None);
            }
            cmd => panic!("expected UpdateResource, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_delete_resource() {
        let sql = format!("DELETE FROM resources WHERE id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteResource { id: ulid(ID) });
    }

    #[test]
    fn parse_select_resources() {
        assert_eq!(
            parse_sql("SELECT * FROM resources").unwrap(),
            Command::SelectResources { id: None }
        );
        let sql = format!("SELECT * FROM resources WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectResources { id: Some(ulid(ID)) }
        );
    }

    #[test]
    fn parse_insert_booking() {
        let sql = format!(
            r#"INSERT INTO bookings (resource_id, user_id, start, "end", title, notes) VALUES ('{RID}', '{UID}', 1000, 2000, 'Standup', NULL)"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking(b) => {
                assert_eq!(b.id, None);
                assert_eq!(b.resource_id, ulid(RID));
                assert_eq!(b.user_id, ulid(UID));
                assert_eq!((b.start, b.end), (1000, 2000));
                assert_eq!(b.title, "Standup");
                assert_eq!(b.notes, None);
                assert_eq!(b.status, BookingStatus::Confirmed);
            }
            cmd => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_booking_rfc3339_and_positional() {
        let sql = format!(
            "INSERT INTO bookings VALUES ('{ID}', '{RID}', '{UID}', '2024-01-01T10:00:00Z', '2024-01-01T11:00:00+01:00', 'Review')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking(b) => {
                assert_eq!(b.id, Some(ulid(ID)));
                assert_eq!(b.start, 1_704_103_200_000);
                assert_eq!(b.end, 1_704_103_200_000);
            }
            cmd => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_booking_string_numbers() {
        // Extended-protocol parameters arrive as quoted text.
        let sql = format!(
            r#"INSERT INTO bookings (resource_id, user_id, start, "end", title) VALUES ('{RID}', '{UID}', '1000', '2000', 'x')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking(b) => assert_eq!((b.start, b.end), (1000, 2000)),
            cmd => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_booking_missing_title() {
        let sql = format!(
            r#"INSERT INTO bookings (resource_id, user_id, start, "end") VALUES ('{RID}', '{UID}', 1000, 2000)"#
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingColumn("title"))));
    }

    #[test]
    fn parse_insert_booking_arity_and_columns() {
        let sql = format!("INSERT INTO bookings (resource_id, user_id) VALUES ('{RID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::WrongArity("bookings", 2, 1))));

        let sql = format!("INSERT INTO bookings (resource_id, status) VALUES ('{RID}', 'PENDING')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn("bookings", _))));
    }

    #[test]
    fn parse_multi_row_insert_unsupported() {
        let sql = "INSERT INTO resources (name) VALUES ('a'), ('b')";
        assert!(matches!(parse_sql(sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_update_booking() {
        let sql = format!(
            r#"UPDATE bookings SET start = 5000, "end" = 6000, notes = NULL WHERE id = '{ID}'"#
        );
        match parse_sql(&sql).unwrap() {
            Command::UpdateBooking { id, patch } => {
                assert_eq!(id, ulid(ID));
                assert_eq!(patch.start, Some(5000));
                assert_eq!(patch.end, Some(6000));
                assert_eq!(patch.notes, Some(None));
                assert_eq!(patch.title, None);
                assert!(patch.touches_schedule());
            }
            cmd => panic!("expected UpdateBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_update_booking_move() {
        let sql = format!("UPDATE bookings SET resource_id = '{RID}', title = 'moved' WHERE id = '{ID}'");
        match parse_sql(&sql).unwrap() {
            Command::UpdateBooking { patch, .. } => {
                assert_eq!(patch.resource_id, Some(ulid(RID)));
                assert_eq!(patch.title.as_deref(), Some("moved"));
            }
            cmd => panic!("expected UpdateBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_update_requires_id() {
        let sql = "UPDATE bookings SET title = 'x'";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("id"))));
        let sql = format!("UPDATE bookings SET status = 'CANCELLED' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn("bookings", _))));
    }

    #[test]
    fn parse_delete_booking_cancels() {
        let sql = format!("DELETE FROM bookings WHERE id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::CancelBooking { id: ulid(ID) });
    }

    #[test]
    fn parse_select_bookings_with_filters_and_page() {
        let sql = format!(
            r#"SELECT * FROM bookings WHERE resource_id = '{RID}' AND status = 'confirmed' AND start >= 1000 AND "end" <= 9000 LIMIT 50 OFFSET 100"#
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectBookings { id, filter, page } => {
                assert_eq!(id, None);
                assert_eq!(filter.resource_id, Some(ulid(RID)));
                assert_eq!(filter.status, Some(BookingStatus::Confirmed));
                assert_eq!(filter.from, Some(1000));
                assert_eq!(filter.until, Some(9000));
                assert_eq!(filter.user_id, None);
                assert_eq!(page, Page { offset: 100, limit: 50 });
            }
            cmd => panic!("expected SelectBookings, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_bookings_defaults() {
        match parse_sql("SELECT * FROM bookings").unwrap() {
            Command::SelectBookings { id, filter, page } => {
                assert_eq!(id, None);
                assert_eq!(filter, BookingFilter::default());
                assert_eq!(page, Page::default());
            }
            cmd => panic!("expected SelectBookings, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_booking_by_id() {
        let sql = format!("SELECT * FROM bookings WHERE (id = '{ID}')");
        match parse_sql(&sql).unwrap() {
            Command::SelectBookings { id, .. } => assert_eq!(id, Some(ulid(ID))),
            cmd => panic!("expected SelectBookings, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_bookings_rejects_or() {
        let sql = format!("SELECT * FROM bookings WHERE user_id = '{UID}' OR user_id = '{RID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_select_bookings_negative_limit() {
        assert!(parse_sql("SELECT * FROM bookings LIMIT -1").is_err());
    }

    #[test]
    fn parse_user_and_today_views() {
        let sql = format!("SELECT * FROM user_bookings WHERE user_id = '{UID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectUserBookings { user_id: ulid(UID) }
        );
        assert!(matches!(
            parse_sql("SELECT * FROM user_bookings"),
            Err(SqlError::MissingFilter("user_id"))
        ));
        assert_eq!(
            parse_sql("SELECT * FROM today_bookings").unwrap(),
            Command::SelectTodayBookings
        );
    }

    #[test]
    fn parse_select_conflicts() {
        let sql = format!(
            r#"SELECT * FROM conflicts WHERE resource_id = '{RID}' AND start >= 1000 AND "end" <= 2000 AND exclude_id = '{ID}'"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectConflicts {
                resource_id: ulid(RID),
                start: 1000,
                end: 2000,
                exclude_id: Some(ulid(ID)),
            }
        );

        let sql = format!("SELECT * FROM conflicts WHERE resource_id = '{RID}' AND start >= 1000");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("end"))));
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
        assert!(matches!(
            parse_sql("SELECT * FROM availability"),
            Err(SqlError::UnknownTable(_))
        ));
    }

    #[test]
    fn parse_bad_ulid_errors() {
        let sql = "DELETE FROM bookings WHERE id = 'not-a-ulid'";
        assert!(matches!(parse_sql(sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn row_shape_from_target_table() {
        assert_eq!(row_shape("SELECT * FROM bookings WHERE id = $1"), RowShape::Booking);
        assert_eq!(row_shape("DELETE FROM bookings WHERE id = $1"), RowShape::Booking);
        assert_eq!(
            row_shape(r#"UPDATE bookings SET "end" = $2 WHERE id = $1"#),
            RowShape::Booking
        );
        assert_eq!(row_shape("SELECT * FROM today_bookings"), RowShape::Booking);
        assert_eq!(row_shape("SELECT * FROM resources"), RowShape::Resource);
        assert_eq!(row_shape("INSERT INTO resources (name) VALUES ($1)"), RowShape::None);
        assert_eq!(
            row_shape("SELECT * FROM conflicts WHERE resource_id = $1"),
            RowShape::Conflict
        );
        assert_eq!(row_shape("not sql at all"), RowShape::None);
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
        assert!(matches!(parse_sql("CREATE TABLE t (a int)"), Err(SqlError::Unsupported(_))));
    }
}
