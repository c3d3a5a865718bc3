use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
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
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::StaffAuthSource;
use crate::engine::{Engine, EngineError, ErrorKind};
use crate::model::*;
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

pub struct HotelierHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<HotelierQueryParser>,
}

impl HotelierHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(HotelierQueryParser),
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

    /// The authenticated user acts as the owner of whatever it creates.
    fn actor<C: ClientInfo>(client: &C) -> String {
        client
            .metadata()
            .get("user")
            .cloned()
            .unwrap_or_else(|| "anonymous".to_string())
    }

    async fn run_sql<C: ClientInfo>(
        &self,
        client: &C,
        sql: &str,
        format: &Format,
    ) -> PgWireResult<Response> {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(sql).map_err(sql_err)?.with_actor(&Self::actor(client));

        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = execute_command(&engine, cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }
}

fn tag(verb: &str) -> Response {
    Response::Execution(Tag::new(verb).with_rows(1))
}

async fn execute_command(engine: &Engine, cmd: Command, format: &Format) -> PgWireResult<Response> {
    match cmd {
        // ── Rooms ────────────────────────────────────────
        Command::InsertRoom(req) => {
            engine.create_room(req).await.map_err(engine_err)?;
            Ok(tag("INSERT"))
        }
        Command::UpdateRoom { id, patch } => {
            engine.update_room(id, patch).await.map_err(engine_err)?;
            Ok(tag("UPDATE"))
        }
        Command::DeleteRoom { id } => {
            engine.delete_room(id).await.map_err(engine_err)?;
            Ok(tag("DELETE"))
        }
        Command::SelectRooms { id: Some(id), .. } => {
            let room = engine.room_info(id).await.map_err(engine_err)?;
            rows(room_schema(format), &[room], encode_room)
        }
        Command::SelectRooms { id: None, filter } => {
            let rooms = engine.list_rooms(&filter).await;
            rows(room_schema(format), &rooms, encode_room)
        }
        Command::SelectRoomTypes => {
            let types = engine.room_types().await;
            rows(fields(&[("type", Type::VARCHAR)], format), &types, |enc, t| {
                enc.encode_field(t)
            })
        }
        Command::SelectAvailableRooms {
            room_type,
            check_in,
            check_out,
        } => {
            let rooms = engine
                .available_rooms(&room_type, check_in, check_out)
                .await
                .map_err(engine_err)?;
            rows(room_schema(format), &rooms, encode_room)
        }
        Command::SelectAvailability { room_id, start, end } => {
            let windows = engine
                .room_free_windows(room_id, start, end)
                .await
                .map_err(engine_err)?;
            let rid = room_id.to_string();
            rows(availability_schema(format), &windows, |enc, w| {
                enc.encode_field(&rid)?;
                enc.encode_field(&w.start)?;
                enc.encode_field(&w.end)
            })
        }

        // ── Bookings ─────────────────────────────────────
        Command::InsertBooking(req) => {
            engine.create_booking(req).await.map_err(engine_err)?;
            Ok(tag("INSERT"))
        }
        Command::UpdateBooking { id, patch } => {
            engine.update_booking(id, patch).await.map_err(engine_err)?;
            Ok(tag("UPDATE"))
        }
        Command::CancelOwnBooking { id, actor } => {
            engine.cancel_own_booking(id, &actor).await.map_err(engine_err)?;
            Ok(tag("UPDATE"))
        }
        Command::DeleteBooking { id } => {
            engine.delete_booking(id).await.map_err(engine_err)?;
            Ok(tag("DELETE"))
        }
        Command::SelectBookings { id: Some(id), .. } => {
            let booking = engine.get_booking_by_id(id).await.map_err(engine_err)?;
            rows(booking_schema(format), &[booking], encode_booking)
        }
        Command::SelectBookings { id: None, filter } => {
            let bookings = engine.get_all_bookings(&filter).await;
            rows(booking_schema(format), &bookings, encode_booking)
        }

        // ── Payments ─────────────────────────────────────
        Command::InsertPayment(req) => {
            engine.create_payment(req).await.map_err(engine_err)?;
            Ok(tag("INSERT"))
        }
        Command::ConfirmPayment { id, req } => {
            engine.confirm_payment(id, req).await.map_err(engine_err)?;
            Ok(tag("UPDATE"))
        }
        Command::CancelPayment { id, reason } => {
            engine.cancel_payment(id, reason).await.map_err(engine_err)?;
            Ok(tag("UPDATE"))
        }
        Command::RefundPayment { id, req } => {
            engine.refund_payment(id, req).await.map_err(engine_err)?;
            Ok(tag("UPDATE"))
        }
        Command::DeletePayment { id } => {
            engine.delete_payment(id).await.map_err(engine_err)?;
            Ok(tag("DELETE"))
        }
        Command::SelectPayments { id: Some(id), .. } => {
            let payment = engine.get_payment_by_id(id).await.map_err(engine_err)?;
            rows(payment_schema(format), &[payment], encode_payment)
        }
        Command::SelectPayments { id: None, status } => {
            let payments = engine.get_all_payments(status).await;
            rows(payment_schema(format), &payments, encode_payment)
        }
        Command::BeginGatewayPayment {
            id,
            booking_id,
            payment_ref,
            user_id,
        } => {
            engine
                .begin_gateway_payment(booking_id, id, &payment_ref, user_id)
                .await
                .map_err(engine_err)?;
            Ok(tag("INSERT"))
        }
        Command::GatewayCallback {
            payment_ref,
            success,
            message,
        } => {
            engine
                .apply_gateway_result(&payment_ref, success, message)
                .await
                .map_err(engine_err)?;
            Ok(tag("INSERT"))
        }

        Command::SelectDashboard => {
            let stats = engine.dashboard().await;
            rows(dashboard_schema(format), &[stats], encode_dashboard)
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn fields(columns: &[(&str, Type)], format: &Format) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| {
            FieldInfo::new((*name).into(), None, None, ty.clone(), format.format_for(i))
        })
        .collect()
}

fn room_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("type", Type::VARCHAR),
            ("price", Type::INT8),
            ("capacity", Type::INT4),
            ("status", Type::VARCHAR),
        ],
        format,
    )
}

fn availability_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("room_id", Type::VARCHAR),
            ("start", Type::INT8),
            ("end", Type::INT8),
        ],
        format,
    )
}

fn booking_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("room_id", Type::VARCHAR),
            ("room_name", Type::VARCHAR),
            ("room_type", Type::VARCHAR),
            ("user_id", Type::VARCHAR),
            ("guest_name", Type::VARCHAR),
            ("guest_phone", Type::VARCHAR),
            ("guest_email", Type::VARCHAR),
            ("guest_count", Type::INT4),
            ("check_in", Type::INT8),
            ("check_out", Type::INT8),
            ("nights", Type::INT8),
            ("total_price", Type::INT8),
            ("status", Type::VARCHAR),
            ("special_request", Type::VARCHAR),
            ("payment_id", Type::VARCHAR),
            ("payment_status", Type::VARCHAR),
            ("created_at", Type::INT8),
            ("updated_at", Type::INT8),
        ],
        format,
    )
}

fn payment_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("booking_id", Type::VARCHAR),
            ("room_id", Type::VARCHAR),
            ("room_name", Type::VARCHAR),
            ("guest_name", Type::VARCHAR),
            ("booking_status", Type::VARCHAR),
            ("amount", Type::INT8),
            ("method", Type::VARCHAR),
            ("status", Type::VARCHAR),
            ("payment_ref", Type::VARCHAR),
            ("paid_at", Type::INT8),
            ("refund_amount", Type::INT8),
            ("note", Type::VARCHAR),
            ("user_id", Type::VARCHAR),
            ("created_at", Type::INT8),
        ],
        format,
    )
}

fn dashboard_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("room_count", Type::INT8),
            ("booking_count", Type::INT8),
            ("guest_count", Type::INT8),
            ("total_revenue", Type::INT8),
            ("bookings_by_status", Type::VARCHAR),
            ("recent_bookings", Type::VARCHAR),
        ],
        format,
    )
}

/// Schema of a SELECT, for Describe before any parameter is bound.
fn result_schema(stmt: &str, format: &Format) -> Vec<FieldInfo> {
    match sql::select_table(stmt).as_deref() {
        Some("rooms" | "available_rooms") => room_schema(format),
        Some("room_types") => fields(&[("type", Type::VARCHAR)], format),
        Some("availability") => availability_schema(format),
        Some("bookings") => booking_schema(format),
        Some("payments") => payment_schema(format),
        Some("dashboard") => dashboard_schema(format),
        _ => vec![],
    }
}

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema);
    let mut out: Vec<PgWireResult<DataRow>> = Vec::with_capacity(items.len());
    for item in items {
        let mut encoder = DataRowEncoder::new(schema.clone());
        encode(&mut encoder, item)?;
        out.push(Ok(encoder.take_row()));
    }
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(out))))
}

fn encode_room(enc: &mut DataRowEncoder, room: &RoomInfo) -> PgWireResult<()> {
    enc.encode_field(&room.id.to_string())?;
    enc.encode_field(&room.name)?;
    enc.encode_field(&room.room_type)?;
    enc.encode_field(&room.price)?;
    enc.encode_field(&(room.capacity as i32))?;
    enc.encode_field(&room.status.as_str().to_string())
}

fn encode_booking(enc: &mut DataRowEncoder, view: &BookingView) -> PgWireResult<()> {
    let b = &view.booking;
    enc.encode_field(&b.id.to_string())?;
    enc.encode_field(&b.room_id.to_string())?;
    enc.encode_field(&view.room_name)?;
    enc.encode_field(&view.room_type)?;
    enc.encode_field(&b.user_id)?;
    enc.encode_field(&b.guest_name)?;
    enc.encode_field(&b.guest_phone)?;
    enc.encode_field(&b.guest_email)?;
    enc.encode_field(&(b.guest_count as i32))?;
    enc.encode_field(&b.stay.start)?;
    enc.encode_field(&b.stay.end)?;
    enc.encode_field(&view.nights())?;
    enc.encode_field(&b.total_price)?;
    enc.encode_field(&b.status.as_str().to_string())?;
    enc.encode_field(&b.special_request)?;
    enc.encode_field(&view.payment.as_ref().map(|p| p.id.to_string()))?;
    enc.encode_field(&view.payment.as_ref().map(|p| p.status.as_str().to_string()))?;
    enc.encode_field(&b.created_at)?;
    enc.encode_field(&b.updated_at)
}

fn encode_payment(enc: &mut DataRowEncoder, view: &PaymentView) -> PgWireResult<()> {
    let p = &view.payment;
    enc.encode_field(&p.id.to_string())?;
    enc.encode_field(&p.booking_id.to_string())?;
    enc.encode_field(&view.room_id.to_string())?;
    enc.encode_field(&view.room_name)?;
    enc.encode_field(&view.guest_name)?;
    enc.encode_field(&view.booking_status.as_str().to_string())?;
    enc.encode_field(&p.amount)?;
    enc.encode_field(&p.method.as_str().to_string())?;
    enc.encode_field(&p.status.as_str().to_string())?;
    enc.encode_field(&p.payment_ref)?;
    enc.encode_field(&p.paid_at)?;
    enc.encode_field(&p.refund_amount)?;
    enc.encode_field(&p.note)?;
    enc.encode_field(&p.user_id)?;
    enc.encode_field(&p.created_at)
}

fn encode_dashboard(enc: &mut DataRowEncoder, stats: &DashboardStats) -> PgWireResult<()> {
    let by_status: serde_json::Map<String, serde_json::Value> = stats
        .bookings_by_status
        .iter()
        .map(|(s, n)| (s.as_str().to_string(), (*n).into()))
        .collect();
    let recent: Vec<serde_json::Value> = stats
        .recent_bookings
        .iter()
        .map(|v| {
            serde_json::json!({
                "id": v.booking.id.to_string(),
                "room_name": v.room_name,
                "guest_name": v.booking.guest_name,
                "check_in": v.booking.stay.start,
                "check_out": v.booking.stay.end,
                "status": v.booking.status.as_str(),
                "total_price": v.booking.total_price,
            })
        })
        .collect();

    enc.encode_field(&(stats.room_count as i64))?;
    enc.encode_field(&(stats.booking_count as i64))?;
    enc.encode_field(&(stats.guest_count as i64))?;
    enc.encode_field(&stats.total_revenue)?;
    enc.encode_field(&serde_json::Value::Object(by_status).to_string())?;
    enc.encode_field(&serde_json::Value::Array(recent).to_string())
}

#[async_trait]
impl SimpleQueryHandler for HotelierHandler {
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
        if query.trim().trim_matches(';').trim().is_empty() {
            return Ok(vec![Response::EmptyQuery]);
        }
        let response = self.run_sql(client, query, &Format::UnifiedText).await?;
        Ok(vec![response])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct HotelierQueryParser;

#[async_trait]
impl QueryParser for HotelierQueryParser {
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
        Ok(result_schema(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for HotelierHandler {
    type Statement = String;
    type QueryParser = HotelierQueryParser;

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
        self.run_sql(client, &sql, &portal.result_column_format).await
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
            result_schema(&target.statement, &Format::UnifiedText),
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
            &target.result_column_format,
        )))
    }
}

/// Walks `sql` once, handing each `$N` found outside quoted text to `param`.
/// Everything else is copied through unchanged.
fn rewrite_placeholders(sql: &str, mut param: impl FnMut(usize, &mut String)) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut chars = sql.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match (quote, c) {
            (Some(q), _) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '$') => {
                let start = i + 1;
                let mut end = start;
                while let Some(&(j, d)) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    end = j + 1;
                    chars.next();
                }
                if let Ok(n) = sql[start..end].parse::<usize>() {
                    param(n, &mut out);
                    continue;
                }
            }
            _ => {}
        }
        out.push(c);
    }
    out
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    rewrite_placeholders(sql, |n, _| max = max.max(n));
    max
}

/// Inline bound parameters (text format) as quoted literals in a single pass,
/// so a bound value is never scanned for placeholders itself.
fn inline_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    rewrite_placeholders(sql, |n, out| match n.checked_sub(1).and_then(|i| params.get(i)) {
        Some(Some(bytes)) => {
            out.push('\'');
            out.push_str(&String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''"));
            out.push('\'');
        }
        Some(None) => out.push_str("NULL"),
        None => {
            out.push('$');
            out.push_str(&n.to_string());
        }
    })
}

fn substitute_params(portal: &Portal<String>) -> String {
    inline_params(&portal.statement.statement, portal.parameters.as_slice())
}

// ── Factory ──────────────────────────────────────────────────────

pub struct HotelierFactory {
    handler: Arc<HotelierHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<StaffAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl HotelierFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, auth_source: StaffAuthSource) -> Self {
        Self {
            handler: Arc::new(HotelierHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for HotelierFactory {
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
    factory: Arc<HotelierFactory>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Validation => "22023",
        ErrorKind::Conflict => "P0001",
        ErrorKind::NotFound => "P0002",
        ErrorKind::Forbidden => "42501",
        ErrorKind::Infrastructure => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(e.kind()).into(),
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
