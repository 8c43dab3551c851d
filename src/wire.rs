use std::fmt::Debug;
use std::io;
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

use crate::auth::AtelierAuthSource;
use crate::engine::Engine;
use crate::model::*;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

/// Handle one client connection for its whole lifetime.
pub async fn process_connection(
    socket: TcpStream,
    tenants: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> Result<(), io::Error> {
    let factory = Arc::new(AtelierFactory::new(tenants, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

pub struct AtelierHandler {
    tenants: Arc<TenantManager>,
    query_parser: Arc<AtelierQueryParser>,
}

impl AtelierHandler {
    pub fn new(tenants: Arc<TenantManager>) -> Self {
        Self {
            tenants,
            query_parser: Arc::new(AtelierQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenants.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// The verified (caller, role) pair comes from the authenticated
    /// startup exchange: `user` must be `owner_<ulid>` or
    /// `customer_<ulid>`.
    fn resolve_actor<C: ClientInfo>(&self, client: &C) -> PgWireResult<Actor> {
        let user = client
            .metadata()
            .get("user")
            .cloned()
            .unwrap_or_default();
        Actor::from_login(&user).ok_or_else(|| {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "28000".into(),
                format!("login name must be owner_<ulid> or customer_<ulid>, got: {user}"),
            )))
        })
    }

    async fn dispatch(
        &self,
        engine: &Engine,
        actor: &Actor,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        let label = crate::observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, actor, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(
            crate::observability::QUERIES_TOTAL,
            "command" => label,
            "status" => status
        )
        .increment(1);
        metrics::histogram!(crate::observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        actor: &Actor,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertOwner {
                id,
                name,
                slot_len,
                auto_confirm,
            } => {
                engine
                    .create_owner(actor, id, name, slot_len, auto_confirm)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateOwner {
                id,
                name,
                slot_len,
                auto_confirm,
            } => {
                engine
                    .update_owner(actor, id, name, slot_len, auto_confirm)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteOwner { id } => {
                engine.delete_owner(actor, id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::UpsertTemplate {
                owner_id,
                day,
                enabled,
                open,
                close,
            } => {
                engine
                    .set_template(actor, owner_id, day, enabled, open, close)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteTemplate { owner_id, day } => {
                engine
                    .clear_template(actor, owner_id, day)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::Materialize { owner_id, from, to } => {
                let created = engine
                    .materialize(actor, owner_id, from, to)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(
                    Tag::new("MATERIALIZE").with_rows(created),
                )])
            }
            Command::InsertSlot {
                id,
                owner_id,
                start,
                duration,
            } => {
                engine
                    .create_slot(actor, id, owner_id, start, duration)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateSlot {
                id,
                start,
                auto_confirm,
            } => {
                engine
                    .update_slot(actor, id, start, auto_confirm)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteSlot { id } => {
                engine.delete_slot(actor, id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertSchedule {
                id,
                slot_id,
                customer_id,
                items,
            } => {
                engine
                    .reserve(actor, id, slot_id, customer_id, items)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateScheduleStatus { id, status } => {
                engine
                    .transition(actor, id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::MoveSchedule { id, new_slot_id } => {
                engine
                    .reschedule(actor, id, new_slot_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectOwners => {
                let owners = engine.list_owners();
                let schema = Arc::new(owners_schema());
                let rows: Vec<PgWireResult<_>> = owners
                    .into_iter()
                    .map(|o| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&o.id.to_string())?;
                        encoder.encode_field(&o.name)?;
                        encoder.encode_field(&o.slot_len)?;
                        encoder.encode_field(&o.auto_confirm)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectTemplates { owner_id } => {
                let templates = engine.list_templates(owner_id).await.map_err(engine_err)?;
                let schema = Arc::new(templates_schema());
                let rows: Vec<PgWireResult<_>> = templates
                    .into_iter()
                    .map(|t| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&t.owner_id.to_string())?;
                        encoder.encode_field(&(t.day as i64))?;
                        encoder.encode_field(&t.enabled)?;
                        encoder.encode_field(&t.open)?;
                        encoder.encode_field(&t.close)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectSlots {
                owner_id,
                start,
                end,
                available_only,
            } => {
                let range = match (start, end) {
                    (Some(from), Some(to)) => Some((from, to)),
                    _ => None,
                };
                let slots = engine
                    .list_slots(owner_id, range, available_only)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(slots_schema());
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.id.to_string())?;
                        encoder.encode_field(&s.owner_id.to_string())?;
                        encoder.encode_field(&s.start)?;
                        encoder.encode_field(&s.duration)?;
                        encoder.encode_field(&s.booked)?;
                        encoder.encode_field(&s.auto_confirm)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectSchedules {
                id,
                owner_id,
                active_only,
            } => {
                let schedules = match (id, owner_id) {
                    (Some(id), _) => match engine.get_schedule(id).await {
                        Ok(info) => vec![info],
                        Err(crate::engine::EngineError::NotFound(_)) => vec![],
                        Err(e) => return Err(engine_err(e)),
                    },
                    (None, Some(owner_id)) if active_only => engine
                        .list_active_schedules(owner_id)
                        .await
                        .map_err(engine_err)?,
                    (None, Some(owner_id)) => {
                        engine.list_schedules(owner_id).await.map_err(engine_err)?
                    }
                    (None, None) => unreachable!("parser requires id or owner_id"),
                };
                let schema = Arc::new(schedules_schema());
                let rows: Vec<PgWireResult<_>> = schedules
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.id.to_string())?;
                        encoder.encode_field(&s.owner_id.to_string())?;
                        encoder.encode_field(&s.slot_id.to_string())?;
                        encoder.encode_field(&s.customer_id.to_string())?;
                        encoder.encode_field(&s.status.as_str())?;
                        encoder.encode_field(&s.items)?;
                        encoder.encode_field(&s.created_at)?;
                        encoder.encode_field(&s.updated_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
        }
    }
}

fn owners_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("name".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("slot_len".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("auto_confirm".into(), None, None, Type::BOOL, FieldFormat::Text),
    ]
}

fn templates_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("owner_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("day".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("enabled".into(), None, None, Type::BOOL, FieldFormat::Text),
        FieldInfo::new("open".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("close".into(), None, None, Type::INT8, FieldFormat::Text),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("owner_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("start".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("duration".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("booked".into(), None, None, Type::BOOL, FieldFormat::Text),
        FieldInfo::new("auto_confirm".into(), None, None, Type::BOOL, FieldFormat::Text),
    ]
}

fn schedules_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("owner_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("slot_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("customer_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("status".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("items".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("created_at".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("updated_at".into(), None, None, Type::INT8, FieldFormat::Text),
    ]
}

/// Result schema for a SELECT statement, for Describe responses.
fn select_schema(stmt: &str) -> Vec<FieldInfo> {
    let upper = stmt.to_uppercase();
    if !upper.trim_start().starts_with("SELECT") {
        return vec![];
    }
    if upper.contains("SCHEDULES") {
        schedules_schema()
    } else if upper.contains("SLOTS") {
        slots_schema()
    } else if upper.contains("TEMPLATES") {
        templates_schema()
    } else if upper.contains("OWNERS") {
        owners_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for AtelierHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let actor = self.resolve_actor(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.dispatch(&engine, &actor, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct AtelierQueryParser;

#[async_trait]
impl QueryParser for AtelierQueryParser {
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
        Ok(select_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for AtelierHandler {
    type Statement = String;
    type QueryParser = AtelierQueryParser;

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
        let actor = self.resolve_actor(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.dispatch(&engine, &actor, cmd).await?;
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
            select_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(select_schema(
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
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    if n > max {
                        max = n;
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
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

pub struct AtelierFactory {
    handler: Arc<AtelierHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<AtelierAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl AtelierFactory {
    pub fn new(tenants: Arc<TenantManager>, password: String) -> Self {
        let auth_source = AtelierAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(AtelierHandler::new(tenants)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for AtelierFactory {
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

/// One SQLSTATE per error kind so clients can tell `AlreadyBooked`
/// (refresh availability) apart from everything else.
fn engine_err(e: crate::engine::EngineError) -> PgWireError {
    use crate::engine::EngineError::*;
    let code = match &e {
        NotFound(_) => "P0002",
        AlreadyExists(_) => "23505",
        AlreadyBooked(_) => "55006",
        Contended(_) => "55P03",
        SlotInPast(_) | Validation(_) => "22023",
        Forbidden(_) => "42501",
        InvalidTransition { .. } => "P0001",
        LimitExceeded(_) => "54000",
        Wal(_) => "58030",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
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
