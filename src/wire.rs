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

use crate::auth::StudyslotAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, LEDGER_REJECTIONS_TOTAL, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};
use crate::study::StudyManager;

pub struct StudyslotHandler {
    study_manager: Arc<StudyManager>,
    query_parser: Arc<StudyslotQueryParser>,
}

impl StudyslotHandler {
    pub fn new(study_manager: Arc<StudyManager>) -> Self {
        Self {
            study_manager,
            query_parser: Arc::new(StudyslotQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.study_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("study error: {e}"),
            )))
        })
    }

    /// Execute with RED metrics around it. `now` is read here, once per statement.
    async fn run(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd, now_ms()).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command, now: Ms) -> PgWireResult<Response> {
        match cmd {
            Command::InsertService {
                id,
                name,
                modality,
                visit_phase,
            } => {
                engine
                    .create_service(id, name, modality, visit_phase)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SetServiceActive { id, active } => {
                engine.set_service_active(id, active).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::InsertParticipant { id, email } => {
                engine.register_participant(id, email).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertSlot {
                id,
                service_id,
                starts_at,
                capacity,
            } => {
                engine
                    .create_slot(id, service_id, starts_at, capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteSlot { id } => {
                engine.delete_slot(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertBooking {
                id,
                participant_id,
                service_id,
                slot_id,
            } => {
                engine
                    .create_booking(id, participant_id, service_id, slot_id, now)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::CancelBooking { id } => {
                engine.cancel_booking(id, now).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::RescheduleBooking { id, slot_id } => {
                engine
                    .reschedule_booking(id, slot_id, now)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::SelectAvailableSlots { service_id } => {
                let slots = engine.available_slots(service_id, now).await;
                let schema = Arc::new(available_slots_schema());
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&slot.slot_id.to_string())?;
                        encoder.encode_field(&slot.service_id.to_string())?;
                        encoder.encode_field(&slot.start)?;
                        encoder.encode_field(&slot.end)?;
                        encoder.encode_field(&(slot.remaining as i32))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectServices { active } => {
                let services: Vec<ServiceInfo> = engine
                    .list_services(active != Some(true))
                    .await
                    .into_iter()
                    .filter(|s| active.is_none_or(|want| s.active == want))
                    .collect();
                let schema = Arc::new(services_schema());
                let rows: Vec<PgWireResult<_>> = services
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.id.to_string())?;
                        encoder.encode_field(&s.name)?;
                        encoder.encode_field(&s.modality.as_str())?;
                        encoder.encode_field(&s.visit_phase.as_str())?;
                        encoder.encode_field(&s.active)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectBookings { participant_id } => {
                let bookings = engine.participant_bookings(participant_id).await;
                let schema = Arc::new(bookings_schema());
                let rows: Vec<PgWireResult<_>> = bookings
                    .into_iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.booking_id.to_string())?;
                        encoder.encode_field(&b.status.as_str())?;
                        encoder.encode_field(&b.service_id.to_string())?;
                        encoder.encode_field(&b.service_name)?;
                        encoder.encode_field(&b.modality.as_str())?;
                        encoder.encode_field(&b.visit_phase.as_str())?;
                        encoder.encode_field(&b.slot_id.to_string())?;
                        encoder.encode_field(&b.start)?;
                        encoder.encode_field(&b.end)?;
                        encoder.encode_field(&b.reminder_sent_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectProgress { participant_id } => {
                let progress = engine.participant_progress(participant_id).await;
                let schema = Arc::new(progress_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&(progress.booked as i64))?;
                encoder.encode_field(&(progress.total as i64))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectSlotOverview => {
                let overview = engine.slot_overview().await;
                let schema = Arc::new(slot_overview_schema());
                let rows: Vec<PgWireResult<_>> = overview
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.slot_id.to_string())?;
                        encoder.encode_field(&r.service_name)?;
                        encoder.encode_field(&r.modality.as_str())?;
                        encoder.encode_field(&r.visit_phase.as_str())?;
                        encoder.encode_field(&r.start)?;
                        encoder.encode_field(&r.end)?;
                        encoder.encode_field(&(r.capacity as i32))?;
                        encoder.encode_field(&(r.booked as i32))?;
                        encoder.encode_field(&r.holder_emails.join(", "))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn typed(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn available_slots_schema() -> Vec<FieldInfo> {
    vec![
        text("slot_id"),
        text("service_id"),
        typed("start", Type::INT8),
        typed("end", Type::INT8),
        typed("remaining", Type::INT4),
    ]
}

fn services_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("name"),
        text("modality"),
        text("visit_phase"),
        typed("active", Type::BOOL),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("status"),
        text("service_id"),
        text("service_name"),
        text("modality"),
        text("visit_phase"),
        text("slot_id"),
        typed("start", Type::INT8),
        typed("end", Type::INT8),
        typed("reminder_sent_at", Type::INT8),
    ]
}

fn progress_schema() -> Vec<FieldInfo> {
    vec![typed("booked", Type::INT8), typed("total", Type::INT8)]
}

fn slot_overview_schema() -> Vec<FieldInfo> {
    vec![
        text("slot_id"),
        text("service_name"),
        text("modality"),
        text("visit_phase"),
        typed("start", Type::INT8),
        typed("end", Type::INT8),
        typed("capacity", Type::INT4),
        typed("booked", Type::INT4),
        text("holder_emails"),
    ]
}

/// Result columns for a statement, decided from its text so that
/// statements with unbound `$n` placeholders can be described.
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.trim_start().starts_with("SELECT") {
        return vec![];
    }
    if upper.contains("SLOT_OVERVIEW") {
        slot_overview_schema()
    } else if upper.contains("AVAILABLE_SLOTS") {
        available_slots_schema()
    } else if upper.contains("PROGRESS") {
        progress_schema()
    } else if upper.contains("SERVICES") {
        services_schema()
    } else if upper.contains("BOOKINGS") {
        bookings_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for StudyslotHandler {
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
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        Ok(vec![self.run(&engine, cmd).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct StudyslotQueryParser;

#[async_trait]
impl QueryParser for StudyslotQueryParser {
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
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for StudyslotHandler {
    type Statement = String;
    type QueryParser = StudyslotQueryParser;

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
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run(&engine, cmd).await
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
        Ok(DescribeStatementResponse::new(param_types, schema_for(&target.statement)))
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
        Ok(DescribePortalResponse::new(schema_for(&target.statement.statement)))
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
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    max = max.max(n);
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute `$N` placeholders with bound parameter values (text format).
///
/// One left-to-right pass over the statement text: bound values are never
/// rescanned, and `$N` inside a quoted literal is left alone.
fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_literal = false;
    let mut chars = sql.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '\'' {
            in_literal = !in_literal;
        }
        if c != '$' || in_literal {
            out.push(c);
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
        let index = sql[digits_start..digits_end].parse::<usize>().ok();
        match index.and_then(|n| n.checked_sub(1)).and_then(|n| params.get(n)) {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&sql[i..digits_end]),
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct StudyslotFactory {
    handler: Arc<StudyslotHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<StudyslotAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl StudyslotFactory {
    pub fn new(study_manager: Arc<StudyManager>, password: String) -> Self {
        let auth_source = StudyslotAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(StudyslotHandler::new(study_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for StudyslotFactory {
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
    study_manager: Arc<StudyManager>,
    password: String,
    tls_acceptor: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(StudyslotFactory::new(study_manager, password));
    pgwire::tokio::process_socket(socket, tls_acceptor, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

/// SQLSTATE for each ledger outcome, so clients can tell "pick another slot"
/// apart from "refresh and retry" without parsing messages.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::SlotNotAvailable(_) => "23P01",
        EngineError::DuplicateActiveBookingForService { .. } => "23505",
        EngineError::SlotHasActiveBooking(_) => "23503",
        EngineError::BookingNotActive(_) => "55000",
        EngineError::SameSlot(_) => "22023",
        EngineError::NotFound(_) => "02000",
        _ => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if e.is_user_outcome() {
        tracing::debug!("rejected: {e}");
        metrics::counter!(LEDGER_REJECTIONS_TOTAL, "reason" => e.label()).increment(1);
    } else {
        tracing::error!("ledger failure: {e}");
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
