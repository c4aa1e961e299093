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
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::auth::InnkeepAuthSource;
use crate::calendar::{self, BlockForm, CalendarError, MonthWindow, ReconcileAction};
use crate::engine::{Engine, EngineError, Removal, ReservationFilter};
use crate::model::*;
use crate::session::{Draft, Session};
use crate::sql::{self, Command, ReservationSelector, SqlError};
use crate::workflow::{NotificationStatus, Workflow, WorkflowError};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Shared by every connection.
pub struct ServerContext {
    pub engine: Arc<Engine>,
    pub workflow: Arc<Workflow>,
    pub guest_password: String,
    pub admin_user: String,
    pub admin_password: String,
}

/// One per connection. Owns that connection's [`Session`].
pub struct InnkeepHandler {
    ctx: Arc<ServerContext>,
    session: Mutex<Option<Session>>,
    query_parser: Arc<InnkeepQueryParser>,
}

impl InnkeepHandler {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self {
            ctx,
            session: Mutex::new(None),
            query_parser: Arc::new(InnkeepQueryParser),
        }
    }

    async fn run(&self, user: String, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = crate::observability::command_label(&cmd);
        let started = Instant::now();

        let mut guard = self.session.lock().await;
        let session = guard.get_or_insert_with(|| {
            let admin = user == self.ctx.admin_user;
            let session = Session::new(user, admin);
            info!(session = %session.id, user = %session.user, admin, "session opened");
            session
        });

        let result = if cmd.requires_admin() && !session.admin {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            warn!(session = %session.id, user = %session.user, command = label, "admin statement refused");
            Err(user_error("42501", format!("{label} requires the admin user")))
        } else {
            self.execute_command(session, cmd).await
        };

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(crate::observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(crate::observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        debug!(command = label, status, "query");
        result
    }

    async fn execute_command(&self, session: &mut Session, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.ctx.engine;
        let workflow = &self.ctx.workflow;
        match cmd {
            // ── Guest flow ──
            Command::SelectRooms { id } => {
                let rooms = match id {
                    Some(id) => vec![engine.get_room(id).await.map_err(engine_err)?],
                    None => engine.list_rooms().await.map_err(engine_err)?,
                };
                Ok(vec![rooms_response(rooms)])
            }
            Command::SelectAvailability {
                span,
                room_id: Some(room_id),
            } => {
                let free = engine
                    .is_room_free(room_id, span)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(room_availability_schema());
                let row = vec![
                    Cell::Bool(free),
                    Cell::Text(String::new()),
                    Cell::Int(room_id),
                    date(span.start),
                    date(span.end),
                ];
                Ok(vec![query_response(schema, vec![row])])
            }
            Command::SelectAvailability {
                span,
                room_id: None,
            } => {
                let rooms = workflow.search(session, span).await.map_err(workflow_err)?;
                Ok(vec![rooms_response(rooms)])
            }
            Command::SelectOpenings { room_id, span } => {
                let openings = engine
                    .room_openings(room_id, span)
                    .await
                    .map_err(engine_err)?;
                let rows = openings
                    .into_iter()
                    .map(|o| vec![Cell::Int(room_id), date(o.start), date(o.end)])
                    .collect();
                Ok(vec![query_response(Arc::new(openings_schema()), rows)])
            }
            Command::InsertDraft { room_id, span } => {
                workflow
                    .book_room(session, room_id, span)
                    .await
                    .map_err(workflow_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateDraft { room_id } => {
                workflow
                    .choose_room(session, room_id)
                    .await
                    .map_err(workflow_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectDraft => {
                let draft = session
                    .draft()
                    .ok_or_else(|| workflow_err(WorkflowError::NoDraft))?;
                Ok(vec![query_response(
                    Arc::new(draft_schema()),
                    vec![draft_row(draft)],
                )])
            }
            Command::InsertReservation { fields } => {
                let booked = workflow
                    .submit(session, fields)
                    .await
                    .map_err(workflow_err)?;
                let notification = match booked.notification {
                    NotificationStatus::Queued => "queued",
                    NotificationStatus::Failed => "failed",
                };
                let row = vec![
                    Cell::Int(booked.reservation.id),
                    Cell::Int(booked.room.id),
                    Cell::Text(booked.room.name),
                    date(booked.reservation.span.start),
                    date(booked.reservation.span.end),
                    Cell::Text(notification.into()),
                ];
                Ok(vec![query_response(Arc::new(booked_schema()), vec![row])])
            }
            Command::SelectSummary => {
                let draft = workflow.summary(session).map_err(workflow_err)?;
                Ok(vec![query_response(
                    Arc::new(draft_schema()),
                    vec![draft_row(&draft)],
                )])
            }

            // ── Admin ──
            Command::InsertRoom { id, name } => {
                engine.create_room(id, name).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SelectReservations { selector } => {
                let reservations = match selector {
                    ReservationSelector::All => engine.list_reservations(ReservationFilter::All),
                    ReservationSelector::Unprocessed => {
                        engine.list_reservations(ReservationFilter::Unprocessed)
                    }
                    ReservationSelector::Id(id) => {
                        vec![engine.get_reservation(id).map_err(engine_err)?]
                    }
                };
                let rows = reservations.iter().map(reservation_row).collect();
                Ok(vec![query_response(Arc::new(reservation_schema()), rows)])
            }
            Command::UpdateReservation { id, changes } => {
                let current = engine.get_reservation(id).map_err(engine_err)?;
                let guest = changes
                    .touches_guest()
                    .then(|| changes.merge_into(&current.guest));
                let updated = engine
                    .amend_reservation(id, guest, changes.processed)
                    .await
                    .map_err(engine_err)?;
                debug!(reservation_id = updated.id, "reservation updated");
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteReservation { id } => {
                let removal = engine.delete_reservation(id).await.map_err(engine_err)?;
                Ok(vec![deleted(removal)])
            }
            Command::SelectCalendar { year, month } => {
                let window = MonthWindow::new(year, month).map_err(calendar_err)?;
                let grid = calendar::month_grid(engine, &window)
                    .await
                    .map_err(calendar_err)?;
                session.put_block_scratch(&window, grid.block_scratch());

                let mut rows = Vec::new();
                for rm in &grid.rooms {
                    for day in window.days() {
                        let reservation = rm.reservations.get(&day).copied().unwrap_or(calendar::FREE);
                        let block = rm.blocks.get(&day).copied().unwrap_or(calendar::FREE);
                        rows.push(vec![
                            Cell::Int(rm.room.id),
                            Cell::Text(rm.room.name.clone()),
                            date(day),
                            Cell::Text(calendar::day_key(day)),
                            Cell::Int(reservation),
                            Cell::Int(block),
                        ]);
                    }
                }
                Ok(vec![query_response(Arc::new(calendar_schema()), rows)])
            }
            Command::UpdateCalendar { year, month, form } => {
                let window = MonthWindow::new(year, month).map_err(calendar_err)?;
                let form = BlockForm::parse_encoded(&form).map_err(calendar_err)?;
                let scratch = session.take_block_scratch(&window);
                let entries = calendar::submit_blocks(engine, &window, scratch, &form)
                    .await
                    .map_err(calendar_err)?;
                let rows = entries
                    .into_iter()
                    .map(|entry| {
                        let (restriction, detail) = match &entry.action {
                            ReconcileAction::Added(id) => (Some(*id), String::new()),
                            ReconcileAction::Rejected(reason) => (None, reason.clone()),
                            _ => (None, String::new()),
                        };
                        vec![
                            Cell::Int(entry.room_id),
                            date(entry.day),
                            Cell::Text(entry.action.label().into()),
                            Cell::OptInt(restriction),
                            Cell::Text(detail),
                        ]
                    })
                    .collect();
                Ok(vec![query_response(Arc::new(reconcile_schema()), rows)])
            }
            Command::InsertBlock { room_id, span } => {
                let id = engine.add_block(room_id, span).await.map_err(engine_err)?;
                let row = vec![
                    Cell::Int(id),
                    Cell::Int(room_id),
                    Cell::Text(RestrictionKind::Block.tag().into()),
                    Cell::OptInt(None),
                    date(span.start),
                    date(span.end),
                ];
                Ok(vec![query_response(Arc::new(restriction_schema()), vec![row])])
            }
            Command::DeleteBlock { id } => {
                let removal = engine.remove_block(id).await.map_err(engine_err)?;
                Ok(vec![deleted(removal)])
            }
            Command::SelectRestrictions { room_id, window } => {
                let restrictions = match window {
                    Some(window) => engine.restrictions_for_room(room_id, window).await,
                    None => engine.all_restrictions(room_id).await,
                }
                .map_err(engine_err)?;
                let rows = restrictions
                    .iter()
                    .map(|r| {
                        vec![
                            Cell::Int(r.id),
                            Cell::Int(r.room_id),
                            Cell::Text(r.kind.tag().into()),
                            Cell::OptInt(r.kind.reservation_id()),
                            date(r.span.start),
                            date(r.span.end),
                        ]
                    })
                    .collect();
                Ok(vec![query_response(Arc::new(restriction_schema()), rows)])
            }
        }
    }
}

fn deleted(removal: Removal) -> Response {
    let rows = match removal {
        Removal::Removed => 1,
        Removal::AlreadyGone => 0,
    };
    Response::Execution(Tag::new("DELETE").with_rows(rows))
}

// ── Result sets ──────────────────────────────────────────────────

enum Cell {
    Int(i64),
    OptInt(Option<i64>),
    Text(String),
    OptText(Option<String>),
    Bool(bool),
}

fn date(day: chrono::NaiveDate) -> Cell {
    Cell::Text(day.format(DATE_FORMAT).to_string())
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<Vec<Cell>>) -> Response {
    let rows: Vec<PgWireResult<DataRow>> = rows
        .into_iter()
        .map(|cells| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            for cell in cells {
                match cell {
                    Cell::Int(v) => encoder.encode_field(&v)?,
                    Cell::OptInt(v) => encoder.encode_field(&v)?,
                    Cell::Text(v) => encoder.encode_field(&v)?,
                    Cell::OptText(v) => encoder.encode_field(&v)?,
                    Cell::Bool(v) => encoder.encode_field(&v)?,
                }
            }
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn rooms_response(rooms: Vec<Room>) -> Response {
    let rows = rooms
        .into_iter()
        .map(|r| {
            vec![
                Cell::Int(r.id),
                Cell::Text(r.name),
                Cell::Int(r.created_at),
                Cell::Int(r.updated_at),
            ]
        })
        .collect();
    query_response(Arc::new(room_schema()), rows)
}

fn draft_row(draft: &Draft) -> Vec<Cell> {
    vec![
        Cell::Text(draft.stage.as_str().into()),
        date(draft.span.start),
        date(draft.span.end),
        Cell::OptInt(draft.room.as_ref().map(|r| r.id)),
        Cell::OptText(draft.room.as_ref().map(|r| r.name.clone())),
        Cell::OptInt(draft.reservation.as_ref().map(|r| r.id)),
        Cell::OptText(draft.reservation.as_ref().map(|r| r.guest.first_name.clone())),
        Cell::OptText(draft.reservation.as_ref().map(|r| r.guest.last_name.clone())),
        Cell::OptText(draft.reservation.as_ref().map(|r| r.guest.email.clone())),
    ]
}

fn reservation_row(r: &Reservation) -> Vec<Cell> {
    vec![
        Cell::Int(r.id),
        Cell::Int(r.room_id),
        Cell::Text(r.guest.first_name.clone()),
        Cell::Text(r.guest.last_name.clone()),
        Cell::Text(r.guest.email.clone()),
        Cell::Text(r.guest.phone.clone()),
        date(r.span.start),
        date(r.span.end),
        Cell::Bool(r.processed),
        Cell::Int(r.created_at),
        Cell::Int(r.updated_at),
    ]
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn room_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::INT8),
        field("name", Type::VARCHAR),
        field("created_at", Type::INT8),
        field("updated_at", Type::INT8),
    ]
}

fn room_availability_schema() -> Vec<FieldInfo> {
    vec![
        field("ok", Type::BOOL),
        field("message", Type::VARCHAR),
        field("room_id", Type::INT8),
        field("start_date", Type::VARCHAR),
        field("end_date", Type::VARCHAR),
    ]
}

fn openings_schema() -> Vec<FieldInfo> {
    vec![
        field("room_id", Type::INT8),
        field("start_date", Type::VARCHAR),
        field("end_date", Type::VARCHAR),
    ]
}

fn draft_schema() -> Vec<FieldInfo> {
    vec![
        field("stage", Type::VARCHAR),
        field("start_date", Type::VARCHAR),
        field("end_date", Type::VARCHAR),
        field("room_id", Type::INT8),
        field("room_name", Type::VARCHAR),
        field("reservation_id", Type::INT8),
        field("first_name", Type::VARCHAR),
        field("last_name", Type::VARCHAR),
        field("email", Type::VARCHAR),
    ]
}

fn booked_schema() -> Vec<FieldInfo> {
    vec![
        field("reservation_id", Type::INT8),
        field("room_id", Type::INT8),
        field("room_name", Type::VARCHAR),
        field("start_date", Type::VARCHAR),
        field("end_date", Type::VARCHAR),
        field("notification", Type::VARCHAR),
    ]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::INT8),
        field("room_id", Type::INT8),
        field("first_name", Type::VARCHAR),
        field("last_name", Type::VARCHAR),
        field("email", Type::VARCHAR),
        field("phone", Type::VARCHAR),
        field("start_date", Type::VARCHAR),
        field("end_date", Type::VARCHAR),
        field("processed", Type::BOOL),
        field("created_at", Type::INT8),
        field("updated_at", Type::INT8),
    ]
}

fn calendar_schema() -> Vec<FieldInfo> {
    vec![
        field("room_id", Type::INT8),
        field("room_name", Type::VARCHAR),
        field("day", Type::VARCHAR),
        field("day_key", Type::VARCHAR),
        field("reservation_id", Type::INT8),
        field("block_id", Type::INT8),
    ]
}

fn reconcile_schema() -> Vec<FieldInfo> {
    vec![
        field("room_id", Type::INT8),
        field("day", Type::VARCHAR),
        field("action", Type::VARCHAR),
        field("restriction_id", Type::INT8),
        field("detail", Type::VARCHAR),
    ]
}

fn restriction_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::INT8),
        field("room_id", Type::INT8),
        field("kind", Type::VARCHAR),
        field("reservation_id", Type::INT8),
        field("start_date", Type::VARCHAR),
        field("end_date", Type::VARCHAR),
    ]
}

/// Result columns for a statement, found from its verb and table without binding
/// parameters.
fn describe_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|w| !w.is_empty())
        .collect();
    let verb = words.first().copied().unwrap_or("");
    let table = words
        .windows(2)
        .find(|w| matches!(w[0], "from" | "into" | "update"))
        .map(|w| w[1])
        .unwrap_or("");
    match (verb, table) {
        ("select", "rooms") => room_schema(),
        ("select", "availability") if words.contains(&"room_id") => room_availability_schema(),
        ("select", "availability") => room_schema(),
        ("select", "openings") => openings_schema(),
        ("select", "draft") | ("select", "reservation_summary") => draft_schema(),
        ("select", "reservations") => reservation_schema(),
        ("select", "calendar") => calendar_schema(),
        ("select", "restrictions") | ("insert", "blocks") => restriction_schema(),
        ("insert", "reservations") => booked_schema(),
        ("update", "calendar") => reconcile_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for InnkeepHandler {
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
        self.run(login_user(client), query).await
    }
}

fn login_user<C: ClientInfo>(client: &C) -> String {
    client.metadata().get("user").cloned().unwrap_or_default()
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct InnkeepQueryParser;

#[async_trait]
impl QueryParser for InnkeepQueryParser {
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
        Ok(describe_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for InnkeepHandler {
    type Statement = String;
    type QueryParser = InnkeepQueryParser;

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
        let sql = substitute_params(portal);
        let mut responses = self.run(login_user(client), &sql).await?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
        Ok(responses.remove(0))
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
            describe_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(describe_schema(
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
            if let Ok(n) = sql[start..i].parse::<usize>() {
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
    let mut result = portal.statement.statement.to_string();
    // Highest index first, so $1 never clobbers the prefix of $10.
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct InnkeepFactory {
    handler: Arc<InnkeepHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<InnkeepAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl InnkeepFactory {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        let auth_source = InnkeepAuthSource::new(
            ctx.guest_password.clone(),
            ctx.admin_user.clone(),
            ctx.admin_password.clone(),
        );
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(InnkeepHandler::new(ctx)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for InnkeepFactory {
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

/// Serve one client. Each connection gets its own handler, and so its own session.
pub async fn process_connection(
    socket: TcpStream,
    ctx: Arc<ServerContext>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(InnkeepFactory::new(ctx));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn engine_err(e: EngineError) -> PgWireError {
    let code = match &e {
        EngineError::RoomNotFound(_)
        | EngineError::ReservationNotFound(_)
        | EngineError::RestrictionNotFound(_) => "P0002",
        EngineError::RoomExists(_) => "23505",
        EngineError::SlotTaken { .. } => "23P01",
        EngineError::InvalidRange(_) | EngineError::NotABlock(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Timeout(_) | EngineError::WalError(_) => {
            error!("storage failure: {e}");
            return user_error(
                "58030",
                "storage temporarily unavailable, please try again".into(),
            );
        }
    };
    user_error(code, e.to_string())
}

fn workflow_err(e: WorkflowError) -> PgWireError {
    match e {
        WorkflowError::Engine(e) => engine_err(e),
        WorkflowError::Validation(errors) => user_error("23514", errors.to_string()),
        other => user_error("55000", other.to_string()),
    }
}

fn calendar_err(e: CalendarError) -> PgWireError {
    match e {
        CalendarError::Storage(e) => engine_err(e),
        CalendarError::InvalidMonth { .. } | CalendarError::MalformedField(_) => {
            user_error("22023", e.to_string())
        }
        CalendarError::TooManyFields => user_error("54000", e.to_string()),
    }
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::TooLong(_) => "54000",
        _ => "42601",
    };
    user_error(code, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn code_of(e: PgWireError) -> String {
        let debug = format!("{e:?}");
        let start = debug.find("code: \"").expect("no code in error") + 7;
        debug[start..start + 5].to_string()
    }

    #[test]
    fn engine_errors_map_to_sqlstate() {
        assert_eq!(code_of(engine_err(EngineError::RoomNotFound(1))), "P0002");
        assert_eq!(
            code_of(engine_err(EngineError::SlotTaken {
                room_id: 1,
                conflicting: 2
            })),
            "23P01"
        );
        assert_eq!(
            code_of(engine_err(EngineError::LimitExceeded("stay too long"))),
            "54000"
        );
    }

    #[test]
    fn storage_errors_hide_detail() {
        let err = engine_err(EngineError::WalError("disk /dev/sda1 full".into()));
        assert!(!format!("{err:?}").contains("sda1"));
        assert_eq!(code_of(err), "58030");
        assert_eq!(
            code_of(engine_err(EngineError::Timeout(Duration::from_secs(3)))),
            "58030"
        );
    }

    #[test]
    fn workflow_errors_map_to_sqlstate() {
        let mut errors = crate::forms::FieldErrors::default();
        errors.add("email", crate::forms::INVALID_EMAIL);
        assert_eq!(code_of(workflow_err(WorkflowError::Validation(errors))), "23514");
        assert_eq!(code_of(workflow_err(WorkflowError::NoDraft)), "55000");
        assert_eq!(
            code_of(workflow_err(WorkflowError::Engine(EngineError::InvalidRange(
                span("2024-03-10", "2024-03-10")
            )))),
            "22023"
        );
    }

    #[test]
    fn sql_errors_map_to_sqlstate() {
        assert_eq!(code_of(sql_err(SqlError::Empty)), "42601");
        assert_eq!(code_of(sql_err(SqlError::TooLong(1 << 20))), "54000");
    }

    #[test]
    fn describe_schema_by_table() {
        let described = |sql: &str| format!("{:?}", describe_schema(sql));
        assert_eq!(describe_schema("SELECT * FROM rooms").len(), 4);
        assert!(
            described("SELECT * FROM availability WHERE room_id = $1 AND start_date = $2 AND end_date = $3")
                .contains("\"ok\"")
        );
        assert!(!described("SELECT * FROM availability WHERE start_date = $1 AND end_date = $2").contains("\"ok\""));
        assert!(described("UPDATE calendar SET form = $1 WHERE year = $2 AND month = $3").contains("\"action\""));
        assert!(describe_schema("DELETE FROM blocks WHERE id = $1").is_empty());
    }

    #[test]
    fn counts_placeholders() {
        assert_eq!(count_params("SELECT * FROM rooms"), 0);
        assert_eq!(count_params("SELECT * FROM rooms WHERE id = $1"), 1);
        assert_eq!(count_params("INSERT INTO draft VALUES ($2, $1, $10)"), 10);
    }
}
