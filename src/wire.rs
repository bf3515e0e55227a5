use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
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

use crate::auth::ReservasAuthSource;
use crate::engine::{AttendanceOutcome, Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, PassFilter, ReservationFilter};
use crate::tenant::TenantManager;

pub struct ReservasHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<ReservasQueryParser>,
}

impl ReservasHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(ReservasQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Parse, execute and record RED metrics for one statement.
    async fn run(&self, engine: &Engine, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            // ── Spaces ──────────────────────────────────────────
            Command::InsertSpace { name, capacity } => {
                let space = engine.create_space(name, capacity).await.map_err(engine_err)?;
                Ok(rows_response(space_schema(), vec![space], encode_space))
            }
            Command::UpdateSpace { id, name, capacity } => {
                let space = engine
                    .update_space(id, name, capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(rows_response(space_schema(), vec![space], encode_space))
            }
            Command::DeleteSpace { id } => {
                engine.delete_space(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectSpaces { id } => {
                let spaces = match id {
                    Some(id) => vec![engine.space_info(id).await.map_err(engine_err)?],
                    None => engine.list_spaces().await,
                };
                Ok(rows_response(space_schema(), spaces, encode_space))
            }

            // ── Passes ──────────────────────────────────────────
            Command::InsertPass { pass } => {
                let pass = engine.issue_pass(pass).await.map_err(engine_err)?;
                Ok(rows_response(pass_schema(), vec![pass], encode_pass))
            }
            Command::UpdatePass { id, payment_status } => {
                let pass = engine
                    .set_payment_status(id, payment_status)
                    .await
                    .map_err(engine_err)?;
                Ok(rows_response(pass_schema(), vec![pass], encode_pass))
            }
            Command::DeletePass { id } => {
                engine.delete_pass(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectPasses { filter } => {
                let passes = match filter {
                    PassFilter::All => engine.list_passes().await,
                    PassFilter::Id(id) => vec![engine.pass_info(id).await.map_err(engine_err)?],
                    PassFilter::Client(client_id) => engine.passes_for_client(&client_id).await,
                    PassFilter::Active => engine.active_passes().await,
                };
                Ok(rows_response(pass_schema(), passes, encode_pass))
            }

            // ── Reservations ────────────────────────────────────
            Command::InsertReservation {
                client_id,
                space_id,
                start,
                end,
                pass_id,
            } => {
                let r = engine
                    .create_reservation(client_id, space_id, start, end, pass_id)
                    .await
                    .map_err(engine_err)?;
                Ok(rows_response(reservation_schema(), vec![r], encode_reservation))
            }
            Command::MoveReservation { id, start, end } => {
                let r = engine
                    .move_reservation(id, start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(rows_response(reservation_schema(), vec![r], encode_reservation))
            }
            Command::AttendReservation { id } => {
                let outcome = engine.register_attendance(id).await.map_err(engine_err)?;
                Ok(rows_response(attend_schema(), vec![outcome], encode_outcome))
            }
            Command::CancelReservation { id } => {
                engine.cancel_reservation(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectReservations { filter, status } => {
                let include_cancelled = status != Some(ReservationStatus::Confirmed);
                let mut reservations = match filter {
                    ReservationFilter::Id(id) => {
                        vec![engine.get_reservation(id).await.map_err(engine_err)?]
                    }
                    ReservationFilter::Space { space_id, window } => engine
                        .reservations_for_space(space_id, window, include_cancelled)
                        .await
                        .map_err(engine_err)?,
                    ReservationFilter::Client(client_id) => {
                        engine
                            .reservations_for_client(&client_id, include_cancelled)
                            .await
                    }
                };
                if let Some(status) = status {
                    reservations.retain(|r| r.status == status);
                }
                Ok(rows_response(reservation_schema(), reservations, encode_reservation))
            }

            // ── Attendance log ──────────────────────────────────
            Command::InsertAttendance { pass_id, date } => {
                let date = date.unwrap_or_else(|| engine.now());
                let id = engine
                    .append_attendance(pass_id, date)
                    .await
                    .map_err(engine_err)?;
                let entry = AttendanceEntry {
                    id,
                    pass_id,
                    date,
                    reservation_id: None,
                };
                Ok(rows_response(attendance_schema(), vec![entry], encode_entry))
            }
            Command::UpdateAttendance { id, date } => {
                let entry = engine
                    .edit_attendance_entry(id, date)
                    .await
                    .map_err(engine_err)?;
                Ok(rows_response(attendance_schema(), vec![entry], encode_entry))
            }
            Command::DeleteAttendance { id } => {
                engine.remove_attendance_entry(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectAttendance { pass_id, order } => {
                let entries = engine
                    .list_attendance(pass_id, order)
                    .await
                    .map_err(engine_err)?;
                Ok(rows_response(attendance_schema(), entries, encode_entry))
            }

            // ── Capacity ────────────────────────────────────────
            Command::SelectOccupancy {
                space_id,
                start,
                end,
                exclude,
            } => {
                let occ = engine
                    .occupancy(space_id, start, end, exclude)
                    .await
                    .map_err(engine_err)?;
                Ok(rows_response(occupancy_schema(), vec![occ], encode_occupancy))
            }
        }
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn space_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("capacity", Type::INT8),
    ]
}

fn pass_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("client_id", Type::VARCHAR),
        field("kind", Type::VARCHAR),
        field("total_sessions", Type::INT8),
        field("remaining_sessions", Type::INT8),
        field("session_duration_minutes", Type::INT8),
        field("payment_status", Type::VARCHAR),
        field("trainers", Type::VARCHAR),
        field("last_attendance_time", Type::INT8),
        field("issued_at", Type::INT8),
    ]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("client_id", Type::VARCHAR),
        field("space_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("status", Type::VARCHAR),
        field("attended", Type::BOOL),
        field("pass_id", Type::VARCHAR),
        field("created_at", Type::INT8),
    ]
}

/// Reservation row plus the credit left on its pass and an optional warning.
fn attend_schema() -> Vec<FieldInfo> {
    let mut fields = reservation_schema();
    fields.push(field("remaining_sessions", Type::INT8));
    fields.push(field("warning", Type::VARCHAR));
    fields
}

fn attendance_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("pass_id", Type::VARCHAR),
        field("date", Type::INT8),
        field("reservation_id", Type::VARCHAR),
    ]
}

fn occupancy_schema() -> Vec<FieldInfo> {
    vec![
        field("space_id", Type::VARCHAR),
        field("capacity", Type::INT8),
        field("overlapping", Type::INT8),
        field("admits", Type::BOOL),
    ]
}

/// Result schema for a statement text, used by Describe before parameters
/// are bound. DELETE returns no rows.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let tokens: Vec<&str> = lower.split_whitespace().collect();
    let Some(verb) = tokens.first().copied() else {
        return vec![];
    };
    if verb == "delete" {
        return vec![];
    }
    let table = tokens
        .windows(2)
        .find(|w| matches!(w[0], "from" | "into" | "update"))
        .map(|w| w[1].trim_matches(|c: char| c == '"' || c == ';' || c == '('));

    match table {
        Some("spaces") => space_schema(),
        Some("passes") => pass_schema(),
        Some("reservations") if verb == "update" && lower.contains("attended") => attend_schema(),
        Some("reservations") => reservation_schema(),
        Some("attendance") => attendance_schema(),
        Some("occupancy") => occupancy_schema(),
        _ => vec![],
    }
}

// ── Row encoders ─────────────────────────────────────────────────

type Encode<T> = fn(&mut DataRowEncoder, &T) -> PgWireResult<()>;

fn rows_response<T>(schema: Vec<FieldInfo>, items: Vec<T>, encode: Encode<T>) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_space(encoder: &mut DataRowEncoder, s: &Space) -> PgWireResult<()> {
    encoder.encode_field(&s.id.to_string())?;
    encoder.encode_field(&s.name)?;
    encoder.encode_field(&i64::from(s.capacity))
}

fn encode_pass(encoder: &mut DataRowEncoder, p: &SessionPass) -> PgWireResult<()> {
    encoder.encode_field(&p.id.to_string())?;
    encoder.encode_field(&p.client_id)?;
    encoder.encode_field(&p.kind.as_str().to_string())?;
    encoder.encode_field(&i64::from(p.total_sessions))?;
    encoder.encode_field(&i64::from(p.remaining_sessions))?;
    encoder.encode_field(&i64::from(p.session_duration_minutes))?;
    encoder.encode_field(&p.payment_status.as_str().to_string())?;
    encoder.encode_field(&p.trainers.join(","))?;
    encoder.encode_field(&p.last_attendance_time)?;
    encoder.encode_field(&p.issued_at)
}

fn encode_reservation(encoder: &mut DataRowEncoder, r: &Reservation) -> PgWireResult<()> {
    encoder.encode_field(&r.id.to_string())?;
    encoder.encode_field(&r.client_id)?;
    encoder.encode_field(&r.space_id.to_string())?;
    encoder.encode_field(&r.span.start)?;
    encoder.encode_field(&r.span.end)?;
    encoder.encode_field(&r.status.as_str().to_string())?;
    encoder.encode_field(&r.attendance_registered)?;
    encoder.encode_field(&r.pass_id.map(|p| p.to_string()))?;
    encoder.encode_field(&r.created_at)
}

fn encode_outcome(encoder: &mut DataRowEncoder, o: &AttendanceOutcome) -> PgWireResult<()> {
    encode_reservation(encoder, &o.reservation)?;
    encoder.encode_field(&o.remaining_sessions.map(i64::from))?;
    encoder.encode_field(&o.warning.as_ref().map(|w| w.to_string()))
}

fn encode_entry(encoder: &mut DataRowEncoder, e: &AttendanceEntry) -> PgWireResult<()> {
    encoder.encode_field(&e.id.to_string())?;
    encoder.encode_field(&e.pass_id.to_string())?;
    encoder.encode_field(&e.date)?;
    encoder.encode_field(&e.reservation_id.map(|r| r.to_string()))
}

fn encode_occupancy(encoder: &mut DataRowEncoder, o: &Occupancy) -> PgWireResult<()> {
    encoder.encode_field(&o.space_id.to_string())?;
    encoder.encode_field(&i64::from(o.capacity))?;
    encoder.encode_field(&(o.overlapping as i64))?;
    encoder.encode_field(&o.admits)
}

// ── Simple Query Protocol ────────────────────────────────────────

#[async_trait]
impl SimpleQueryHandler for ReservasHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        Ok(vec![self.run(&engine, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ReservasQueryParser;

#[async_trait]
impl QueryParser for ReservasQueryParser {
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
impl ExtendedQueryHandler for ReservasHandler {
    type Statement = String;
    type QueryParser = ReservasQueryParser;

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
        let sql = substitute_params(portal);
        self.run(&engine, &sql).await
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

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

/// Replace `$n` placeholders in one left-to-right pass, so text inside a
/// bound value is never scanned again. Indexes with no parameter stay as is.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        result.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let param = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        match param {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            Some(None) => result.push_str("NULL"),
            None => result.push_str(&rest[pos..pos + 1 + digits]),
        }
        rest = &after[digits..];
    }
    result.push_str(rest);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ReservasFactory {
    handler: Arc<ReservasHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<ReservasAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl ReservasFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = ReservasAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ReservasHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ReservasFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(ReservasFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for an engine error. Capacity and credit refusals surface as
/// check violations; lock timeouts as serialization failures so clients retry.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::SpaceFull { .. } | EngineError::PassExhausted(_) => "23514",
        EngineError::ConcurrentConflict => "40001",
        EngineError::SpaceNotFound(_)
        | EngineError::PassNotFound(_)
        | EngineError::ReservationNotFound(_)
        | EngineError::AttendanceNotFound(_) => "P0002",
        EngineError::InvalidInterval { .. }
        | EngineError::PastStartTime { .. }
        | EngineError::InvalidCapacity(_)
        | EngineError::InvalidPass(_) => "22023",
        EngineError::ReservationCancelled(_) | EngineError::AlreadyAttended(_) => "55000",
        EngineError::SpaceInUse { .. } => "23503",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
