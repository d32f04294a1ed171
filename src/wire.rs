use std::fmt::Debug;
use std::io;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use chrono_tz::Tz;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::ReservdAuthSource;
use crate::clock::now_ms;
use crate::engine::{Engine, SchedulerError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, RowShape, SqlError};
use crate::tenant::TenantManager;

/// Per-server settings every connection needs.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub user: String,
    pub password: String,
    /// Reference zone for `today_bookings`.
    pub timezone: Tz,
}

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenants: Arc<TenantManager>,
    settings: SessionSettings,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = ReservdFactory::new(tenants, settings);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

pub struct ReservdHandler {
    tenants: Arc<TenantManager>,
    timezone: Tz,
    query_parser: Arc<ReservdQueryParser>,
}

impl ReservdHandler {
    pub fn new(tenants: Arc<TenantManager>, timezone: Tz) -> Self {
        Self {
            tenants,
            timezone,
            query_parser: Arc::new(ReservdQueryParser),
        }
    }

    /// The organization is the database named in the startup packet.
    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenants
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("organization error: {e}")))
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, engine: &Engine, sql: &str, format: &Format) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(|e| {
            metrics::counter!(observability::QUERIES_TOTAL, "command" => "unparsed", "status" => "error")
                .increment(1);
            sql_err(e)
        })?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd, format).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Response> {
        match cmd {
            Command::InsertResource(info) => {
                engine.register_resource(info).await.map_err(scheduler_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateResource { id, changes } => {
                engine.update_resource(id, changes).await.map_err(scheduler_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteResource { id } => {
                engine.remove_resource(id).await.map_err(scheduler_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectResources { id } => {
                let resources = match id {
                    Some(id) => engine.resource(&id).into_iter().collect(),
                    None => engine.list_resources(),
                };
                resource_rows(resources, format)
            }
            Command::InsertBooking(mut new) => {
                let resource = engine
                    .resource(&new.resource_id)
                    .ok_or(SchedulerError::NotFound(new.resource_id))
                    .map_err(scheduler_err)?;
                if resource.requires_approval {
                    new.status = BookingStatus::Pending;
                }
                let booking = engine.create_booking(new).await.map_err(scheduler_err)?;
                let view = BookingView {
                    booking,
                    resource_name: Some(resource.name),
                    resource_category: Some(resource.category),
                };
                booking_rows(vec![view], format)
            }
            Command::UpdateBooking { id, patch } => {
                let booking = engine.update_booking(id, patch).await.map_err(scheduler_err)?;
                booking_rows(vec![joined(engine, booking)], format)
            }
            Command::CancelBooking { id } => {
                let booking = engine.cancel_booking(id).await.map_err(scheduler_err)?;
                booking_rows(vec![joined(engine, booking)], format)
            }
            Command::SelectBookings { id: Some(id), .. } => {
                let view = engine.get_booking(&id).await;
                booking_rows(view.into_iter().collect(), format)
            }
            Command::SelectBookings { id: None, filter, page } => {
                booking_rows(engine.list_bookings(&filter, page).await, format)
            }
            Command::SelectUserBookings { user_id } => {
                booking_rows(engine.user_bookings(user_id).await, format)
            }
            Command::SelectTodayBookings => {
                booking_rows(engine.today_bookings(now_ms(), self.timezone).await, format)
            }
            Command::SelectConflicts {
                resource_id,
                start,
                end,
                exclude_id,
            } => {
                let conflict = engine.check_conflict(resource_id, start, end, exclude_id).await;
                let schema = Arc::new(fields(RowShape::Conflict, format));
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&resource_id.to_string())?;
                encoder.encode_field(&start)?;
                encoder.encode_field(&end)?;
                encoder.encode_field(&conflict)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

fn joined(engine: &Engine, booking: Booking) -> BookingView {
    let resource = engine.resource(&booking.resource_id);
    BookingView {
        resource_name: resource.as_ref().map(|r| r.name.clone()),
        resource_category: resource.map(|r| r.category),
        booking,
    }
}

// ── Row encoding ─────────────────────────────────────────────

const RESOURCE_FIELDS: &[(&str, Type)] = &[
    ("id", Type::VARCHAR),
    ("name", Type::VARCHAR),
    ("category", Type::VARCHAR),
    ("capacity", Type::INT4),
    ("location", Type::VARCHAR),
    ("requires_approval", Type::BOOL),
];

const BOOKING_FIELDS: &[(&str, Type)] = &[
    ("id", Type::VARCHAR),
    ("resource_id", Type::VARCHAR),
    ("user_id", Type::VARCHAR),
    ("start", Type::INT8),
    ("end", Type::INT8),
    ("status", Type::VARCHAR),
    ("title", Type::VARCHAR),
    ("notes", Type::VARCHAR),
    ("created_at", Type::INT8),
    ("updated_at", Type::INT8),
    ("resource_name", Type::VARCHAR),
    ("resource_category", Type::VARCHAR),
];

const CONFLICT_FIELDS: &[(&str, Type)] = &[
    ("resource_id", Type::VARCHAR),
    ("start", Type::INT8),
    ("end", Type::INT8),
    ("conflict", Type::BOOL),
];

fn fields(shape: RowShape, format: &Format) -> Vec<FieldInfo> {
    let columns = match shape {
        RowShape::None => return Vec::new(),
        RowShape::Resource => RESOURCE_FIELDS,
        RowShape::Booking => BOOKING_FIELDS,
        RowShape::Conflict => CONFLICT_FIELDS,
    };
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| {
            FieldInfo::new(name.to_string(), None, None, ty.clone(), format.format_for(i))
        })
        .collect()
}

fn resource_rows(resources: Vec<ResourceInfo>, format: &Format) -> PgWireResult<Response> {
    let schema = Arc::new(fields(RowShape::Resource, format));
    let rows: Vec<PgWireResult<_>> = resources
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.name)?;
            encoder.encode_field(&r.category.as_str())?;
            encoder.encode_field(&r.capacity.map(|c| c as i32))?;
            encoder.encode_field(&r.location)?;
            encoder.encode_field(&r.requires_approval)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn booking_rows(views: Vec<BookingView>, format: &Format) -> PgWireResult<Response> {
    let schema = Arc::new(fields(RowShape::Booking, format));
    let rows: Vec<PgWireResult<_>> = views
        .into_iter()
        .map(|v| {
            let b = &v.booking;
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.resource_id.to_string())?;
            encoder.encode_field(&b.user_id.to_string())?;
            encoder.encode_field(&b.span.start)?;
            encoder.encode_field(&b.span.end)?;
            encoder.encode_field(&b.status.as_str())?;
            encoder.encode_field(&b.title)?;
            encoder.encode_field(&b.notes)?;
            encoder.encode_field(&b.created_at)?;
            encoder.encode_field(&b.updated_at)?;
            encoder.encode_field(&v.resource_name)?;
            encoder.encode_field(&v.resource_category.map(|c| c.as_str()))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

#[async_trait]
impl SimpleQueryHandler for ReservdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let response = self.run(&engine, query, &Format::UnifiedText).await?;
        Ok(vec![response])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

/// Statements are kept as text; `$n` parameters are substituted at execute
/// time and the result is parsed like a simple query.
#[derive(Debug)]
pub struct ReservdQueryParser;

#[async_trait]
impl QueryParser for ReservdQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        let format = column_format.unwrap_or(&Format::UnifiedText);
        Ok(fields(sql::row_shape(stmt), format))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ReservdHandler {
    type Statement = String;
    type QueryParser = ReservdQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.run(&engine, &sql, &portal.result_column_format).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        let schema = fields(sql::row_shape(&target.statement), &Format::UnifiedText);
        Ok(DescribeStatementResponse::new(param_types, schema))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let shape = sql::row_shape(&target.statement.statement);
        Ok(DescribePortalResponse::new(fields(shape, &target.result_column_format)))
    }
}

/// Byte range and number of every `$n` placeholder outside quoted text.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote closes and reopens, which leaves us inside.
            Some(q) => {
                if b == q {
                    quote = None;
                }
                i += 1;
            }
            None if b == b'\'' || b == b'"' => {
                quote = Some(b);
                i += 1;
            }
            None if b == b'$' => {
                let end = i + 1 + bytes[i + 1..].iter().take_while(|d| d.is_ascii_digit()).count();
                if let Ok(n) = sql[i + 1..end].parse::<usize>() {
                    found.push((i..end, n));
                }
                i = end;
            }
            None => i += 1,
        }
    }
    found
}

/// Highest `$n` placeholder number in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Replace `$1`, `$2`, ... with the bound values as quoted text literals, in
/// one pass over the statement. Bound text is never scanned again.
fn substitute_params(sql: &str, params: &[Option<Bytes>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|k| params.get(k)) else {
            continue;
        };
        out.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                out.push('\'');
                out.push_str(&String::from_utf8_lossy(bytes).replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = range.end;
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ReservdFactory {
    handler: Arc<ReservdHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<ReservdAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl ReservdFactory {
    pub fn new(tenants: Arc<TenantManager>, settings: SessionSettings) -> Self {
        let auth_source = ReservdAuthSource::new(settings.user, settings.password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ReservdHandler::new(tenants, settings.timezone)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ReservdFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for each scheduler failure.
pub fn sqlstate(e: &SchedulerError) -> &'static str {
    match e {
        SchedulerError::Validation(_) => "22023",
        SchedulerError::Conflict { .. } => "23P01",
        SchedulerError::NotFound(_) => "P0002",
        SchedulerError::AlreadyExists(_) => "23505",
        SchedulerError::ResourceInUse(_) => "23503",
        SchedulerError::StoreUnavailable(_) => "58030",
    }
}

fn scheduler_err(e: SchedulerError) -> PgWireError {
    if let SchedulerError::StoreUnavailable(msg) = &e {
        tracing::error!("store unavailable: {msg}");
    }
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM bookings"), 0);
        assert_eq!(count_params("SELECT * FROM bookings WHERE id = $1"), 1);
        assert_eq!(
            count_params(r#"SELECT * FROM conflicts WHERE resource_id = $2 AND start >= $10 AND "end" <= $3"#),
            10
        );
    }

    #[test]
    fn substitute_params_quotes_and_nulls() {
        let sql = "UPDATE bookings SET title = $1, notes = $2 WHERE id = $10";
        let mut params: Vec<Option<Bytes>> = vec![None; 10];
        params[0] = Some(Bytes::from_static(b"Bob's sync"));
        params[9] = Some(Bytes::from_static(b"01ARZ3NDEKTSV4RRFFQ69G5FAV"));
        let out = substitute_params(sql, &params);
        assert_eq!(
            out,
            "UPDATE bookings SET title = 'Bob''s sync', notes = NULL WHERE id = '01ARZ3NDEKTSV4RRFFQ69G5FAV'"
        );
    }

    #[test]
    fn count_params_skips_quoted_text() {
        assert_eq!(
            count_params("SELECT * FROM bookings WHERE title = 'costs $9' AND id = $1"),
            1
        );
        assert_eq!(count_params("SELECT '$$' , $"), 0);
    }

    #[test]
    fn bound_text_is_not_rescanned() {
        let rid = Ulid::new();
        let uid = Ulid::new();
        let sql = r#"INSERT INTO bookings (resource_id, user_id, start, "end", title) VALUES ($1, $2, $3, $4, $5)"#;
        let params: Vec<Option<Bytes>> = [
            rid.to_string(),
            uid.to_string(),
            "1000".to_string(),
            "2000".to_string(),
            "Budget $1 review".to_string(),
        ]
        .into_iter()
        .map(|p| Some(Bytes::from(p)))
        .collect();

        match sql::parse_sql(&substitute_params(sql, &params)).unwrap() {
            Command::InsertBooking(new) => {
                assert_eq!(new.resource_id, rid);
                assert_eq!(new.user_id, uid);
                assert_eq!(new.title, "Budget $1 review");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn placeholders_inside_literals_stay() {
        let params = vec![Some(Bytes::from_static(b"x'; --")), None];
        let out = substitute_params(
            "UPDATE bookings SET title = 'costs $1', notes = $2 WHERE id = $1 AND x = $3",
            &params,
        );
        assert_eq!(
            out,
            "UPDATE bookings SET title = 'costs $1', notes = NULL WHERE id = 'x''; --' AND x = $3"
        );
    }

    #[test]
    fn sqlstate_mapping() {
        let id = Ulid::new();
        assert_eq!(sqlstate(&SchedulerError::validation("x")), "22023");
        assert_eq!(
            sqlstate(&SchedulerError::Conflict { resource_id: id, booking_id: id }),
            "23P01"
        );
        assert_eq!(sqlstate(&SchedulerError::NotFound(id)), "P0002");
        assert_eq!(sqlstate(&SchedulerError::AlreadyExists(id)), "23505");
        assert_eq!(sqlstate(&SchedulerError::ResourceInUse(id)), "23503");
        assert_eq!(sqlstate(&SchedulerError::StoreUnavailable("x".into())), "58030");
    }

    #[test]
    fn schema_follows_row_shape() {
        assert!(fields(RowShape::None, &Format::UnifiedText).is_empty());
        let booking = fields(RowShape::Booking, &Format::UnifiedText);
        assert_eq!(booking.len(), BOOKING_FIELDS.len());
        assert_eq!(fields(RowShape::Conflict, &Format::UnifiedBinary).len(), 4);
    }
}
