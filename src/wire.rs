use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
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
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::auth::CareSlotAuthSource;
use crate::authz::Actor;
use crate::engine::{Engine, EngineError, ErrorKind};
use crate::model::*;
use crate::notify::{self, NotifyHub};
use crate::observability;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

// ── LISTEN state ─────────────────────────────────────────────────

/// One connection's LISTEN subscriptions, keyed by professional.
struct Subscriptions {
    hub: Arc<NotifyHub>,
    receivers: HashMap<Ulid, broadcast::Receiver<Event>>,
}

impl Subscriptions {
    fn new(hub: Arc<NotifyHub>) -> Self {
        Self {
            hub,
            receivers: HashMap::new(),
        }
    }

    /// Subscribing twice to the same channel is a no-op.
    fn listen(&mut self, professional_id: Ulid) {
        self.receivers
            .entry(professional_id)
            .or_insert_with(|| self.hub.subscribe(professional_id));
    }

    fn unlisten(&mut self, professional_id: Ulid) {
        if self.receivers.remove(&professional_id).is_some() {
            self.hub.prune(&professional_id);
        }
    }

    fn unlisten_all(&mut self) {
        let ids: Vec<Ulid> = self.receivers.keys().copied().collect();
        for id in ids {
            self.unlisten(id);
        }
    }

    /// Take every queued event as `(channel, payload)`.
    fn drain(&mut self) -> Vec<(String, String)> {
        let mut pending = Vec::new();
        for (professional_id, rx) in self.receivers.iter_mut() {
            loop {
                match rx.try_recv() {
                    Ok(event) => {
                        pending.push((notify::channel_name(*professional_id), notify::payload(&event)))
                    }
                    Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                        tracing::warn!(professional = %professional_id, skipped, "listener lagged, notifications dropped");
                    }
                    Err(_) => break,
                }
            }
        }
        pending
    }
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        self.unlisten_all();
    }
}

// ── Handler ──────────────────────────────────────────────────────

/// Per-connection query handler.
pub struct CareSlotHandler {
    tenant_manager: Arc<TenantManager>,
    admin_user: String,
    query_parser: Arc<CareSlotQueryParser>,
    subscriptions: Mutex<Option<Subscriptions>>,
}

impl CareSlotHandler {
    pub fn new(tenant_manager: Arc<TenantManager>, admin_user: String) -> Self {
        Self {
            tenant_manager,
            admin_user,
            query_parser: Arc::new(CareSlotQueryParser),
            subscriptions: Mutex::new(None),
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

    /// The login user is either the configured admin or an account ULID.
    /// Roles are looked up per command.
    async fn resolve_actor<C: ClientInfo>(&self, client: &C, engine: &Engine) -> PgWireResult<Actor> {
        let user = client.metadata().get("user").cloned().unwrap_or_default();
        if user == self.admin_user {
            return Ok(Actor::system());
        }
        let resolved = match Ulid::from_string(&user) {
            Ok(id) => engine.resolve_actor(id).await,
            Err(_) => Err(EngineError::Forbidden),
        };
        resolved.map_err(|e| {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            tracing::debug!(user = %user, "login has no account in this tenant");
            engine_err(e)
        })
    }

    fn with_subscriptions<R>(&self, engine: &Engine, f: impl FnOnce(&mut Subscriptions) -> R) -> R {
        let mut guard = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        let subs = guard.get_or_insert_with(|| Subscriptions::new(engine.notify.clone()));
        f(subs)
    }

    fn pending_notifications(&self) -> Vec<(String, String)> {
        let mut guard = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_mut().map(Subscriptions::drain).unwrap_or_default()
    }

    /// Deliver queued notifications ahead of the command's own response.
    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        for (channel, payload) in self.pending_notifications() {
            client
                .send(PgWireBackendMessage::NotificationResponse(NotificationResponse::new(
                    0, channel, payload,
                )))
                .await?;
        }
        Ok(())
    }

    /// Parse, authorize, execute and record metrics for one statement.
    async fn run<C>(&self, client: &C, query: &str) -> PgWireResult<Response>
    where
        C: ClientInfo,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();

        let result = match self.resolve_actor(client, &engine).await {
            Ok(actor) => self.execute_command(&engine, &actor, cmd).await,
            Err(e) => Err(e),
        };

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        engine: &Arc<Engine>,
        actor: &Actor,
        cmd: Command,
    ) -> PgWireResult<Response> {
        match cmd {
            Command::InsertAvailability {
                professional_id,
                windows,
            } => {
                let created = engine
                    .create_availability_batch(actor, professional_id, windows)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(created.len())))
            }
            Command::DeleteAvailability { id } => {
                engine.delete_availability(actor, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectAvailability { filter } => {
                let windows = engine
                    .list_availability(actor, &filter)
                    .await
                    .map_err(engine_err)?;
                window_rows(windows)
            }
            Command::InsertAccount { id, name, roles } => {
                engine
                    .register_account(actor, id, name, roles)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::GrantRole { account_id, role } => {
                engine
                    .grant_role(actor, account_id, role)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::RevokeRole { account_id, role } => {
                engine
                    .revoke_role(actor, account_id, role)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectAccount { id } => {
                let account = engine.account(actor, id).await.map_err(engine_err)?;
                account_rows(vec![account])
            }
            Command::InsertAttendance {
                id,
                patient_id,
                professional_id,
                note,
            } => {
                engine
                    .open_attendance(actor, id, patient_id, professional_id, note)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::ReserveAttendance { id, availability_id } => {
                engine
                    .reserve_availability(actor, id, availability_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::UpdateAttendance { id, changes } => {
                engine
                    .update_attendance_details(actor, id, changes)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::SelectAttendances { filter } => {
                let attendances = engine.list_attendances(actor, &filter).await;
                attendance_rows(attendances)
            }
            Command::Listen { channel } => {
                let professional_id = parse_listen_channel(&channel)?;
                actor.require_schedule_feed(professional_id).map_err(engine_err)?;
                self.with_subscriptions(engine, |subs| subs.listen(professional_id));
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { channel } => {
                let professional_id = parse_listen_channel(&channel)?;
                self.with_subscriptions(engine, |subs| subs.unlisten(professional_id));
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::UnlistenAll => {
                self.with_subscriptions(engine, Subscriptions::unlisten_all);
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
        }
    }
}

fn parse_listen_channel(channel: &str) -> PgWireResult<Ulid> {
    notify::parse_channel(channel).ok_or_else(|| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "22023".into(),
            format!("invalid channel: {channel} (expected professional_{{id}})"),
        )))
    })
}

// ── Row encoding ─────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn typed_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("professional_id"),
        typed_field("start", Type::INT8),
        typed_field("end", Type::INT8),
        typed_field("is_booked", Type::BOOL),
    ]
}

fn attendance_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("patient_id"),
        text_field("professional_id"),
        text_field("availability_id"),
        typed_field("date_at", Type::INT8),
        typed_field("duration_minutes", Type::INT4),
        text_field("note"),
        text_field("feedback"),
    ]
}

fn account_schema() -> Vec<FieldInfo> {
    vec![text_field("id"), text_field("name"), text_field("roles")]
}

/// Row description for a statement, judged from its text.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if !upper.starts_with("SELECT") {
        return vec![];
    }
    if upper.contains("ATTENDANCES") {
        attendance_schema()
    } else if upper.contains("ACCOUNTS") {
        account_schema()
    } else if upper.contains("AVAILABILITY") {
        availability_schema()
    } else {
        vec![]
    }
}

fn window_rows(windows: Vec<AvailabilityWindow>) -> PgWireResult<Response> {
    let schema = Arc::new(availability_schema());
    let rows: Vec<PgWireResult<_>> = windows
        .into_iter()
        .map(|w| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&w.id.to_string())?;
            encoder.encode_field(&w.professional_id.to_string())?;
            encoder.encode_field(&w.span.start)?;
            encoder.encode_field(&w.span.end)?;
            encoder.encode_field(&w.is_booked)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn attendance_rows(attendances: Vec<PendingAttendance>) -> PgWireResult<Response> {
    let schema = Arc::new(attendance_schema());
    let rows: Vec<PgWireResult<_>> = attendances
        .into_iter()
        .map(|a| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&a.id.to_string())?;
            encoder.encode_field(&a.patient_id.to_string())?;
            encoder.encode_field(&a.professional_id.map(|id| id.to_string()))?;
            encoder.encode_field(&a.availability_id.map(|id| id.to_string()))?;
            encoder.encode_field(&a.date_at)?;
            encoder.encode_field(&a.duration_minutes.map(|m| m as i32))?;
            encoder.encode_field(&a.note)?;
            encoder.encode_field(&a.feedback)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn account_rows(accounts: Vec<Account>) -> PgWireResult<Response> {
    let schema = Arc::new(account_schema());
    let rows: Vec<PgWireResult<_>> = accounts
        .into_iter()
        .map(|acc| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&acc.id.to_string())?;
            encoder.encode_field(&acc.name)?;
            encoder.encode_field(&acc.roles_label())?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

// ── Simple Query Protocol ────────────────────────────────────────

#[async_trait]
impl SimpleQueryHandler for CareSlotHandler {
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
        let result = self.run(client, query).await;
        self.flush_notifications(client).await?;
        Ok(vec![result?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CareSlotQueryParser;

#[async_trait]
impl QueryParser for CareSlotQueryParser {
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
impl ExtendedQueryHandler for CareSlotHandler {
    type Statement = String;
    type QueryParser = CareSlotQueryParser;

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
        let result = self.run(client, &sql).await;
        self.flush_notifications(client).await?;
        result
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
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
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

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    // Highest index first so `$1` doesn't clobber the prefix of `$10`.
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

pub struct CareSlotFactory {
    handler: Arc<CareSlotHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<CareSlotAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl CareSlotFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String, admin_user: String) -> Self {
        let auth_source = CareSlotAuthSource::new(password, admin_user.clone());
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(CareSlotHandler::new(tenant_manager, admin_user)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CareSlotFactory {
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

/// Serve one client connection until it closes. Each connection gets its own
/// handler, so LISTEN subscriptions die with the socket.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    admin_user: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(CareSlotFactory::new(tenant_manager, password, admin_user));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e.kind() {
        ErrorKind::Validation => "22023",
        ErrorKind::Authorization => "42501",
        ErrorKind::NotFound => "P0002",
        ErrorKind::Conflict => match e {
            EngineError::Overlap(_) => "23P01",
            _ => "23505",
        },
        ErrorKind::Internal => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    metrics::counter!(observability::ERRORS_TOTAL, "kind" => e.kind().label()).increment(1);
    if e.kind() == ErrorKind::Internal {
        tracing::error!("internal error: {e}");
    }
    if let Some(kind) = observability::conflict_label(&e) {
        tracing::debug!("conflict: {e}");
        metrics::counter!(observability::CONFLICTS_TOTAL, "kind" => kind).increment(1);
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
