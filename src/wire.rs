use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat};
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::auth::FleetAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, BookingFilter, Command, SqlError};

pub struct FleetHandler {
    engine: Arc<Engine>,
    query_parser: Arc<FleetQueryParser>,
}

impl FleetHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(FleetQueryParser),
        }
    }

    /// Parse, run and record one statement.
    async fn run(&self, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(|e| {
            debug!("rejected query: {e}");
            metrics::counter!(observability::QUERIES_TOTAL, "command" => "unparsed", "status" => "sql_error")
                .increment(1);
            sql_err(e)
        })?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());

        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        match result {
            Ok(response) => Ok(response),
            Err(e) => {
                match &e {
                    EngineError::Storage(msg) => warn!(command = label, "storage failure: {msg}"),
                    EngineError::Conflict(_) => {
                        metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                        debug!(command = label, "{e}");
                    }
                    _ => debug!(command = label, "{e}"),
                }
                Err(engine_err(e))
            }
        }
    }

    async fn execute_command(&self, cmd: Command) -> Result<Response, EngineError> {
        let engine = &self.engine;
        match cmd {
            Command::InsertVehicle {
                id,
                name,
                capacity_kg,
                tyres,
            } => {
                engine
                    .register_resource(id, name, capacity_kg, tyres)
                    .await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateVehicle { id, patch } => {
                engine.update_resource(id, patch).await?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteVehicle { id } => {
                let cascaded = engine.delete_resource(id).await?;
                info!(vehicle = %id, bookings = cascaded, "vehicle deleted");
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectVehicles { id } => {
                let vehicles = match id {
                    Some(id) => match engine.get_resource(id).await {
                        Ok(v) => vec![v],
                        Err(EngineError::NotFound(_)) => vec![],
                        Err(e) => return Err(e),
                    },
                    None => engine.list_resources().await,
                };
                Ok(vehicle_rows(&vehicles))
            }
            Command::InsertBooking {
                id,
                vehicle_id,
                from_pincode,
                to_pincode,
                start,
                customer_id,
            } => {
                let booking = engine
                    .create_reservation(id, vehicle_id, &from_pincode, &to_pincode, start, &customer_id)
                    .await?;
                debug!(
                    booking = %booking.id,
                    vehicle = %vehicle_id,
                    hours = booking.estimated_hours,
                    "booking created"
                );
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteBooking { id } => {
                engine.cancel_reservation(id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectBookings { filter } => {
                let bookings = match filter {
                    BookingFilter::All => engine.list_reservations().await,
                    BookingFilter::Id(id) => match engine.get_reservation(id).await {
                        Ok(b) => vec![b],
                        Err(EngineError::NotFound(_)) => vec![],
                        Err(e) => return Err(e),
                    },
                    BookingFilter::Vehicle(vehicle_id) => {
                        engine.list_reservations_for(vehicle_id).await?
                    }
                };
                Ok(booking_rows(&bookings))
            }
            Command::SelectAvailableVehicles {
                capacity_required,
                from_pincode,
                to_pincode,
                start,
            } => {
                let available = engine
                    .find_available(capacity_required, &from_pincode, &to_pincode, start)
                    .await?;
                Ok(available_rows(&available))
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn vehicles_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        int_field("capacity_kg"),
        int_field("tyres"),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("vehicle_id"),
        text_field("vehicle_name"),
        int_field("capacity_kg"),
        int_field("tyres"),
        text_field("from_pincode"),
        text_field("to_pincode"),
        text_field("start_time"),
        text_field("end_time"),
        int_field("estimated_hours"),
        text_field("customer_id"),
    ]
}

fn available_vehicles_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        int_field("capacity_kg"),
        int_field("tyres"),
        int_field("estimated_hours"),
    ]
}

/// RFC 3339 in UTC, with sub-second digits only when present.
pub fn format_timestamp(ms: Ms) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        .unwrap_or_else(|| ms.to_string())
}

fn encode_vehicle(encoder: &mut DataRowEncoder, v: &ResourceInfo) -> PgWireResult<()> {
    encoder.encode_field(&v.id.to_string())?;
    encoder.encode_field(&v.name)?;
    encoder.encode_field(&i64::from(v.capacity_kg))?;
    encoder.encode_field(&i64::from(v.tyres))
}

fn vehicle_rows(vehicles: &[ResourceInfo]) -> Response {
    let schema = Arc::new(vehicles_schema());
    let rows: Vec<PgWireResult<_>> = vehicles
        .iter()
        .map(|v| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode_vehicle(&mut encoder, v)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn booking_rows(bookings: &[ReservationInfo]) -> Response {
    let schema = Arc::new(bookings_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encode_vehicle(&mut encoder, &b.resource)?;
            encoder.encode_field(&b.origin.to_string())?;
            encoder.encode_field(&b.destination.to_string())?;
            encoder.encode_field(&format_timestamp(b.start))?;
            encoder.encode_field(&format_timestamp(b.end))?;
            encoder.encode_field(&i64::from(b.estimated_hours))?;
            encoder.encode_field(&b.requester_id)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn available_rows(available: &[AvailableResource]) -> Response {
    let schema = Arc::new(available_vehicles_schema());
    let rows: Vec<PgWireResult<_>> = available
        .iter()
        .map(|a| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode_vehicle(&mut encoder, &a.resource)?;
            encoder.encode_field(&i64::from(a.estimated_hours))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Columns a statement will return, judged from its text alone (parameters
/// may still be unbound).
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.trim_start().starts_with("SELECT") {
        vec![]
    } else if upper.contains("AVAILABLE_VEHICLES") {
        available_vehicles_schema()
    } else if upper.contains("BOOKINGS") {
        bookings_schema()
    } else if upper.contains("VEHICLES") {
        vehicles_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for FleetHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct FleetQueryParser;

#[async_trait]
impl QueryParser for FleetQueryParser {
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
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for FleetHandler {
    type Statement = String;
    type QueryParser = FleetQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.run(&sql).await
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
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder outside string literals.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
                continue;
            }
            b'$' if !in_literal => {}
            _ => {
                i += 1;
                continue;
            }
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Replace each `$N` with the N-th bound value as a quoted text literal.
/// One left-to-right pass: substituted text is never rescanned, and `$N`
/// inside a `'...'` literal of the statement is left alone.
fn substitute_params(sql: &str, params: &[Option<impl AsRef<[u8]>>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    let mut in_literal = false;

    while let Some((i, c)) = chars.next() {
        if c == '\'' {
            // `''` inside a literal toggles twice and stays inside.
            in_literal = !in_literal;
            result.push(c);
            continue;
        }
        if c != '$' || in_literal {
            result.push(c);
            continue;
        }

        let digits_start = i + 1;
        let mut digits_end = digits_start;
        while let Some(&(j, d)) = chars.peek() {
            if !d.is_ascii_digit() {
                break;
            }
            digits_end = j + 1;
            chars.next();
        }
        let bound = sql[digits_start..digits_end]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| params.get(idx));
        match bound {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            Some(None) => result.push_str("NULL"),
            None => result.push_str(&sql[i..digits_end]),
        }
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct FleetFactory {
    handler: Arc<FleetHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<FleetAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl FleetFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = FleetAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(FleetHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for FleetFactory {
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

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = FleetFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for each engine failure.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::NotFound(_) => "P0002",
        EngineError::Conflict(_) => "23P01",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Storage(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match &e {
        SqlError::Invalid(_) => "22023",
        _ => "42601",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM vehicles"), 0);
        assert_eq!(count_params("SELECT * FROM vehicles WHERE id = $1"), 1);
        assert_eq!(count_params("VALUES ($2, $1, $10)"), 10);
        assert_eq!(count_params("costs $ 5"), 0);
        assert_eq!(count_params("VALUES ('$3', $1)"), 1);
    }

    #[test]
    fn substitutes_and_quotes() {
        let params = vec![Some(b"O'Brien".to_vec()), None];
        assert_eq!(
            substitute_params("VALUES ($1, $2)", &params),
            "VALUES ('O''Brien', NULL)"
        );
    }

    #[test]
    fn substitutes_two_digit_placeholders_first() {
        let params: Vec<_> = (1..=10)
            .map(|i| Some(i.to_string().into_bytes()))
            .collect();
        assert_eq!(substitute_params("$1,$10", &params), "'1','10'");
    }

    #[test]
    fn substituted_values_are_not_rescanned() {
        let params = vec![
            Some(b"01ARZ3NDEKTSV4RRFFQ69G5FAV".to_vec()),
            Some(b"cust$1".to_vec()),
        ];
        assert_eq!(
            substitute_params("SELECT $1, $2", &params),
            "SELECT '01ARZ3NDEKTSV4RRFFQ69G5FAV', 'cust$1'"
        );
    }

    #[test]
    fn placeholders_inside_literals_are_kept() {
        let params = vec![Some(b"x".to_vec())];
        assert_eq!(
            substitute_params("VALUES ('$1', 'it''s $1', $1)", &params),
            "VALUES ('$1', 'it''s $1', 'x')"
        );
    }

    #[test]
    fn unbound_placeholders_are_kept() {
        let params = vec![Some(b"x".to_vec())];
        assert_eq!(substitute_params("$0, $2, $", &params), "$0, $2, $");
    }

    #[test]
    fn timestamps_render_as_utc() {
        assert_eq!(format_timestamp(1_698_400_800_000), "2023-10-27T10:00:00Z");
        assert_eq!(format_timestamp(1_698_400_800_250), "2023-10-27T10:00:00.250Z");
    }

    #[test]
    fn schema_follows_target_table() {
        assert_eq!(result_schema("SELECT * FROM vehicles").len(), 4);
        assert_eq!(result_schema("select * from bookings where vehicle_id = $1").len(), 11);
        assert_eq!(
            result_schema("SELECT * FROM available_vehicles WHERE capacity_required = $1").len(),
            5
        );
        assert!(result_schema("DELETE FROM bookings WHERE id = $1").is_empty());
    }

    #[test]
    fn error_codes() {
        let id = ulid::Ulid::nil();
        assert_eq!(sqlstate(&EngineError::Conflict(id)), "23P01");
        assert_eq!(sqlstate(&EngineError::NotFound(id)), "P0002");
        assert_eq!(sqlstate(&EngineError::Validation("x".into())), "22023");
    }
}
