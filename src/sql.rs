use std::collections::HashMap;

use chrono::{DateTime, NaiveDate};
use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, UnaryOperator, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRoom(NewRoom),
    UpdateRoom {
        id: Ulid,
        patch: RoomPatch,
    },
    DeleteRoom {
        id: Ulid,
    },
    /// `id` selects a single room and ignores the filter.
    SelectRooms {
        id: Option<Ulid>,
        filter: RoomFilter,
    },
    SelectRoomTypes,
    SelectAvailableRooms {
        room_type: String,
        check_in: Ms,
        check_out: Ms,
    },
    SelectAvailability {
        room_id: Ulid,
        start: Ms,
        end: Ms,
    },
    /// `user_id` is empty when the statement did not name an owner.
    InsertBooking(NewBooking),
    UpdateBooking {
        id: Ulid,
        patch: BookingPatch,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBookings {
        id: Option<Ulid>,
        filter: BookingFilter,
    },
    /// Guest-side cancel. `actor` is always the session user.
    CancelOwnBooking {
        id: Ulid,
        actor: String,
    },
    InsertPayment(NewPayment),
    ConfirmPayment {
        id: Ulid,
        req: ConfirmPayment,
    },
    CancelPayment {
        id: Ulid,
        reason: Option<String>,
    },
    RefundPayment {
        id: Ulid,
        req: RefundPayment,
    },
    DeletePayment {
        id: Ulid,
    },
    SelectPayments {
        id: Option<Ulid>,
        status: Option<PaymentStatus>,
    },
    BeginGatewayPayment {
        id: Ulid,
        booking_id: Ulid,
        payment_ref: String,
        user_id: Option<String>,
    },
    GatewayCallback {
        payment_ref: String,
        success: bool,
        message: Option<String>,
    },
    SelectDashboard,
}

impl Command {
    /// Fill in the session user wherever the statement left the owner out.
    pub fn with_actor(mut self, actor: &str) -> Self {
        match &mut self {
            Command::InsertBooking(req) if req.user_id.trim().is_empty() => {
                req.user_id = actor.to_string();
            }
            Command::InsertPayment(req) if req.user_id.is_none() => {
                req.user_id = Some(actor.to_string());
            }
            Command::BeginGatewayPayment { user_id, .. } if user_id.is_none() => {
                *user_id = Some(actor.to_string());
            }
            Command::CancelOwnBooking { actor: who, .. } => {
                *who = actor.to_string();
            }
            _ => {}
        }
        self
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [one] => one,
        _ => return Err(SqlError::Unsupported("multiple statements".into())),
    };

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

/// Table named in a SELECT's FROM clause. Placeholders are allowed, so this
/// works on statements that have not been bound yet.
pub fn select_table(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let Some(Statement::Query(query)) = stmts.first() else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    table_factor_name(&select.from.first()?.relation).ok()
}

// ── INSERT ────────────────────────────────────────────────────

const ROOM_COLUMNS: &[&str] = &["id", "name", "type", "price", "capacity", "status"];
const BOOKING_COLUMNS: &[&str] = &[
    "id",
    "room_id",
    "guest_name",
    "guest_phone",
    "guest_count",
    "check_in",
    "check_out",
    "guest_email",
    "special_request",
    "user_id",
    "type",
];
const PAYMENT_COLUMNS: &[&str] = &["id", "booking_id", "method", "user_id"];
const GATEWAY_PAYMENT_COLUMNS: &[&str] = &["id", "booking_id", "payment_ref", "user_id"];
const GATEWAY_CALLBACK_COLUMNS: &[&str] = &["payment_ref", "result_code", "message"];

/// One INSERT row keyed by column name.
struct Row<'a> {
    table: &'static str,
    values: HashMap<String, &'a Expr>,
}

impl<'a> Row<'a> {
    fn build(
        table: &'static str,
        known: &[&str],
        columns: &[ast::Ident],
        exprs: &'a [Expr],
    ) -> Result<Self, SqlError> {
        let names: Vec<String> = if columns.is_empty() {
            if exprs.len() > known.len() {
                return Err(SqlError::WrongArity {
                    table,
                    expected: known.len(),
                    got: exprs.len(),
                });
            }
            known.iter().map(|c| c.to_string()).collect()
        } else {
            if columns.len() != exprs.len() {
                return Err(SqlError::WrongArity {
                    table,
                    expected: columns.len(),
                    got: exprs.len(),
                });
            }
            columns.iter().map(|c| c.value.to_lowercase()).collect()
        };

        let mut values = HashMap::new();
        for (name, expr) in names.into_iter().zip(exprs) {
            if !known.contains(&name.as_str()) {
                return Err(SqlError::UnknownColumn { table, column: name });
            }
            values.insert(name, expr);
        }
        Ok(Self { table, values })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.values.get(column).copied()
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn {
            table: self.table,
            column,
        })
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid(column, self.required(column)?)
    }

    fn text(&self, column: &'static str) -> Result<String, SqlError> {
        parse_text(column, self.required(column)?)
    }

    fn opt_text(&self, column: &'static str) -> Result<Option<String>, SqlError> {
        self.get(column).map_or(Ok(None), |e| parse_opt_text(column, e))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;
    let [exprs] = rows else {
        return Err(SqlError::Unsupported("multi-row INSERT".into()));
    };
    let columns = &insert.columns;

    match table.as_str() {
        "rooms" => {
            let row = Row::build("rooms", ROOM_COLUMNS, columns, exprs)?;
            Ok(Command::InsertRoom(NewRoom {
                id: row.ulid("id")?,
                name: row.text("name")?,
                room_type: row.text("type")?,
                price: parse_i64("price", row.required("price")?)?,
                capacity: parse_u32("capacity", row.required("capacity")?)?,
                status: row
                    .get("status")
                    .map(|e| parse_enum("status", e))
                    .transpose()?
                    .flatten(),
            }))
        }
        "bookings" => {
            let row = Row::build("bookings", BOOKING_COLUMNS, columns, exprs)?;
            Ok(Command::InsertBooking(NewBooking {
                id: row.ulid("id")?,
                room_id: row.ulid("room_id")?,
                user_id: row.opt_text("user_id")?.unwrap_or_default(),
                guest_name: row.text("guest_name")?,
                guest_phone: row.text("guest_phone")?,
                guest_email: row.opt_text("guest_email")?,
                guest_count: parse_u32("guest_count", row.required("guest_count")?)?,
                check_in: parse_instant("check_in", row.required("check_in")?)?,
                check_out: parse_instant("check_out", row.required("check_out")?)?,
                special_request: row.opt_text("special_request")?,
                room_type: row.opt_text("type")?,
            }))
        }
        "payments" => {
            let row = Row::build("payments", PAYMENT_COLUMNS, columns, exprs)?;
            Ok(Command::InsertPayment(NewPayment {
                id: row.ulid("id")?,
                booking_id: row.ulid("booking_id")?,
                method: parse_enum("method", row.required("method")?)?
                    .ok_or(SqlError::MissingColumn {
                        table: "payments",
                        column: "method",
                    })?,
                user_id: row.opt_text("user_id")?,
            }))
        }
        "gateway_payments" => {
            let row = Row::build("gateway_payments", GATEWAY_PAYMENT_COLUMNS, columns, exprs)?;
            Ok(Command::BeginGatewayPayment {
                id: row.ulid("id")?,
                booking_id: row.ulid("booking_id")?,
                payment_ref: row.text("payment_ref")?,
                user_id: row.opt_text("user_id")?,
            })
        }
        "gateway_callbacks" => {
            let row = Row::build("gateway_callbacks", GATEWAY_CALLBACK_COLUMNS, columns, exprs)?;
            Ok(Command::GatewayCallback {
                payment_ref: row.text("payment_ref")?,
                success: parse_i64("result_code", row.required("result_code")?)? == 0,
                message: row.opt_text("message")?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(table)?;
    let id = extract_where_id(selection)?;
    let mut sets = Vec::with_capacity(assignments.len());
    for a in assignments {
        let column = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        sets.push((column, &a.value));
    }

    match table.as_str() {
        "rooms" => {
            let mut patch = RoomPatch::default();
            for (column, value) in sets {
                match column.as_str() {
                    "name" => patch.name = Some(parse_text("name", value)?),
                    "type" => patch.room_type = Some(parse_text("type", value)?),
                    "price" => patch.price = Some(parse_i64("price", value)?),
                    "capacity" => patch.capacity = Some(parse_u32("capacity", value)?),
                    "status" => patch.status = parse_enum("status", value)?,
                    _ => return Err(SqlError::UnknownColumn { table: "rooms", column }),
                }
            }
            Ok(Command::UpdateRoom { id, patch })
        }
        "bookings" => {
            let mut patch = BookingPatch::default();
            for (column, value) in sets {
                match column.as_str() {
                    "guest_name" => patch.guest_name = Some(parse_text("guest_name", value)?),
                    "guest_phone" => patch.guest_phone = Some(parse_text("guest_phone", value)?),
                    "guest_email" => patch.guest_email = Some(parse_opt_text("guest_email", value)?),
                    "guest_count" => patch.guest_count = Some(parse_u32("guest_count", value)?),
                    "room_id" => patch.room_id = Some(parse_ulid("room_id", value)?),
                    "check_in" => patch.check_in = Some(parse_instant("check_in", value)?),
                    "check_out" => patch.check_out = Some(parse_instant("check_out", value)?),
                    "special_request" => {
                        patch.special_request = Some(parse_opt_text("special_request", value)?)
                    }
                    "status" => patch.status = parse_enum("status", value)?,
                    _ => return Err(SqlError::UnknownColumn { table: "bookings", column }),
                }
            }
            Ok(Command::UpdateBooking { id, patch })
        }
        "my_bookings" => {
            let mut cancel = false;
            for (column, value) in sets {
                match column.as_str() {
                    "status" => match parse_enum::<BookingStatus>("status", value)? {
                        Some(BookingStatus::Cancelled) => cancel = true,
                        _ => {
                            return Err(SqlError::BadValue {
                                column,
                                reason: "guests can only set CANCELLED".into(),
                            });
                        }
                    },
                    _ => return Err(SqlError::UnknownColumn { table: "my_bookings", column }),
                }
            }
            if !cancel {
                return Err(SqlError::MissingColumn {
                    table: "my_bookings",
                    column: "status",
                });
            }
            Ok(Command::CancelOwnBooking {
                id,
                actor: String::new(),
            })
        }
        "payments" => parse_payment_update(id, sets),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `UPDATE payments` is a state change: the target status picks the operation.
fn parse_payment_update(id: Ulid, sets: Vec<(String, &Expr)>) -> Result<Command, SqlError> {
    let mut status: Option<PaymentStatus> = None;
    let mut extra = Vec::new();
    for (column, value) in sets {
        if column == "status" {
            status = parse_enum("status", value)?;
        } else {
            extra.push((column, value));
        }
    }
    let status = status.ok_or(SqlError::MissingColumn {
        table: "payments",
        column: "status",
    })?;

    let not_for = |column: String| SqlError::BadValue {
        column,
        reason: format!("cannot be set when moving a payment to {status}"),
    };

    match status {
        PaymentStatus::Success => {
            let mut req = ConfirmPayment::default();
            for (column, value) in extra {
                match column.as_str() {
                    "method" => req.method = parse_enum("method", value)?,
                    "payment_ref" => req.payment_ref = parse_opt_text("payment_ref", value)?,
                    "paid_at" => req.paid_at = parse_opt_instant("paid_at", value)?,
                    _ => return Err(not_for(column)),
                }
            }
            Ok(Command::ConfirmPayment { id, req })
        }
        PaymentStatus::Failed => {
            let mut reason = None;
            for (column, value) in extra {
                match column.as_str() {
                    "reason" => reason = parse_opt_text("reason", value)?,
                    _ => return Err(not_for(column)),
                }
            }
            Ok(Command::CancelPayment { id, reason })
        }
        PaymentStatus::Refunded => {
            let mut reason = None;
            let mut amount = None;
            for (column, value) in extra {
                match column.as_str() {
                    "reason" => reason = parse_opt_text("reason", value)?,
                    "refund_amount" => {
                        amount = match literal("refund_amount", value)? {
                            Literal::Null => None,
                            _ => Some(parse_i64("refund_amount", value)?),
                        }
                    }
                    _ => return Err(not_for(column)),
                }
            }
            Ok(Command::RefundPayment {
                id,
                req: RefundPayment {
                    reason: reason.unwrap_or_default(),
                    amount,
                },
            })
        }
        PaymentStatus::Pending => Err(SqlError::BadValue {
            column: "status".into(),
            reason: "a payment cannot be moved back to PENDING".into(),
        }),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "rooms" => Ok(Command::DeleteRoom { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        "payments" => Ok(Command::DeletePayment { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

/// A `column <op> value` term from a conjunctive WHERE clause.
struct Filter<'a> {
    column: String,
    op: BinaryOperator,
    value: &'a Expr,
}

fn collect_filters<'a>(expr: &'a Expr, out: &mut Vec<Filter<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_filters(left, out)?;
            collect_filters(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push(Filter {
                column,
                op: op.clone(),
                value: right,
            });
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }
    let unsupported = |f: &Filter<'_>| {
        SqlError::Unsupported(format!("filter {} {} on {table}", f.column, f.op))
    };

    match table.as_str() {
        "rooms" => {
            let mut id = None;
            let mut filter = RoomFilter::default();
            for f in &filters {
                match (f.column.as_str(), &f.op) {
                    ("id", BinaryOperator::Eq) => id = Some(parse_ulid("id", f.value)?),
                    ("type", BinaryOperator::Eq) => filter.room_type = Some(parse_text("type", f.value)?),
                    ("capacity", BinaryOperator::GtEq) => {
                        filter.min_capacity = Some(parse_u32("capacity", f.value)?)
                    }
                    _ => return Err(unsupported(f)),
                }
            }
            Ok(Command::SelectRooms { id, filter })
        }
        "room_types" => match filters.first() {
            None => Ok(Command::SelectRoomTypes),
            Some(f) => Err(unsupported(f)),
        },
        "available_rooms" => {
            let (mut room_type, mut check_in, mut check_out) = (None, None, None);
            for f in &filters {
                match (f.column.as_str(), &f.op) {
                    ("type", BinaryOperator::Eq) => room_type = Some(parse_text("type", f.value)?),
                    ("check_in", BinaryOperator::Eq) => {
                        check_in = Some(parse_instant("check_in", f.value)?)
                    }
                    ("check_out", BinaryOperator::Eq) => {
                        check_out = Some(parse_instant("check_out", f.value)?)
                    }
                    _ => return Err(unsupported(f)),
                }
            }
            Ok(Command::SelectAvailableRooms {
                room_type: room_type.ok_or(SqlError::MissingFilter("type"))?,
                check_in: check_in.ok_or(SqlError::MissingFilter("check_in"))?,
                check_out: check_out.ok_or(SqlError::MissingFilter("check_out"))?,
            })
        }
        "availability" => {
            let (mut room_id, mut start, mut end) = (None, None, None);
            for f in &filters {
                match (f.column.as_str(), &f.op) {
                    ("room_id", BinaryOperator::Eq) => room_id = Some(parse_ulid("room_id", f.value)?),
                    ("start", BinaryOperator::GtEq) => start = Some(parse_instant("start", f.value)?),
                    ("end", BinaryOperator::LtEq) => end = Some(parse_instant("end", f.value)?),
                    _ => return Err(unsupported(f)),
                }
            }
            Ok(Command::SelectAvailability {
                room_id: room_id.ok_or(SqlError::MissingFilter("room_id"))?,
                start: start.ok_or(SqlError::MissingFilter("start"))?,
                end: end.ok_or(SqlError::MissingFilter("end"))?,
            })
        }
        "bookings" => {
            let mut id = None;
            let mut filter = BookingFilter::default();
            for f in &filters {
                match (f.column.as_str(), &f.op) {
                    ("id", BinaryOperator::Eq) => id = Some(parse_ulid("id", f.value)?),
                    ("status", BinaryOperator::Eq) => filter.status = parse_enum("status", f.value)?,
                    ("user_id", BinaryOperator::Eq) => {
                        filter.user_id = Some(parse_text("user_id", f.value)?)
                    }
                    _ => return Err(unsupported(f)),
                }
            }
            Ok(Command::SelectBookings { id, filter })
        }
        "payments" => {
            let (mut id, mut status) = (None, None);
            for f in &filters {
                match (f.column.as_str(), &f.op) {
                    ("id", BinaryOperator::Eq) => id = Some(parse_ulid("id", f.value)?),
                    ("status", BinaryOperator::Eq) => status = parse_enum("status", f.value)?,
                    _ => return Err(unsupported(f)),
                }
            }
            Ok(Command::SelectPayments { id, status })
        }
        "dashboard" => match filters.first() {
            None => Ok(Command::SelectDashboard),
            Some(f) => Err(unsupported(f)),
        },
        _ => Err(SqlError::UnknownTable(table)),
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if values.rows.is_empty() => {
            Err(SqlError::Parse("empty VALUES".into()))
        }
        SetExpr::Values(values) => Ok(&values.rows),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection {
        Some(Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid("id", right),
        Some(Expr::Nested(inner)) => extract_where_id(&Some(inner.as_ref().clone())),
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

enum Literal {
    Null,
    Text(String),
    Number(String),
    Bool(bool),
}

fn literal(column: &str, expr: &Expr) -> Result<Literal, SqlError> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => match value {
            Value::Null => Ok(Literal::Null),
            Value::Boolean(b) => Ok(Literal::Bool(*b)),
            Value::Number(n, _) => Ok(Literal::Number(n.clone())),
            Value::SingleQuotedString(s) | Value::DoubleQuotedString(s) => Ok(Literal::Text(s.clone())),
            other => Err(bad(column, format!("unsupported literal {other}"))),
        },
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match literal(column, expr)? {
            Literal::Number(n) => Ok(Literal::Number(format!("-{n}"))),
            _ => Err(bad(column, "expected a number after '-'")),
        },
        Expr::Nested(inner) => literal(column, inner),
        other => Err(bad(column, format!("expected a literal, got {other}"))),
    }
}

fn bad(column: &str, reason: impl Into<String>) -> SqlError {
    SqlError::BadValue {
        column: column.to_string(),
        reason: reason.into(),
    }
}

fn parse_ulid(column: &str, expr: &Expr) -> Result<Ulid, SqlError> {
    match literal(column, expr)? {
        Literal::Text(s) | Literal::Number(s) => {
            Ulid::from_string(s.trim()).map_err(|e| bad(column, format!("bad ULID: {e}")))
        }
        _ => Err(bad(column, "expected a ULID string")),
    }
}

fn parse_text(column: &str, expr: &Expr) -> Result<String, SqlError> {
    match literal(column, expr)? {
        Literal::Text(s) | Literal::Number(s) => Ok(s),
        Literal::Null => Err(bad(column, "cannot be NULL")),
        Literal::Bool(_) => Err(bad(column, "expected text")),
    }
}

fn parse_opt_text(column: &str, expr: &Expr) -> Result<Option<String>, SqlError> {
    match literal(column, expr)? {
        Literal::Null => Ok(None),
        _ => parse_text(column, expr).map(Some),
    }
}

fn parse_i64(column: &str, expr: &Expr) -> Result<i64, SqlError> {
    match literal(column, expr)? {
        Literal::Number(s) | Literal::Text(s) => s
            .trim()
            .parse()
            .map_err(|e| bad(column, format!("bad integer {s:?}: {e}"))),
        _ => Err(bad(column, "expected an integer")),
    }
}

fn parse_u32(column: &str, expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(column, expr)?;
    u32::try_from(v).map_err(|_| bad(column, format!("{v} out of range")))
}

/// `Ok(None)` for NULL.
fn parse_enum<T>(column: &str, expr: &Expr) -> Result<Option<T>, SqlError>
where
    T: std::str::FromStr<Err = ParseEnumError>,
{
    match literal(column, expr)? {
        Literal::Null => Ok(None),
        Literal::Text(s) => s.parse().map(Some).map_err(|e: ParseEnumError| bad(column, e.to_string())),
        _ => Err(bad(column, "expected a quoted name")),
    }
}

/// Unix milliseconds, `YYYY-MM-DD` (UTC midnight) or RFC 3339.
pub fn parse_instant_text(s: &str) -> Option<Ms> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<i64>() {
        return Some(ms);
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp_millis());
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

fn parse_instant(column: &str, expr: &Expr) -> Result<Ms, SqlError> {
    match literal(column, expr)? {
        Literal::Number(s) | Literal::Text(s) => parse_instant_text(&s)
            .ok_or_else(|| bad(column, format!("{s:?} is not a date, RFC 3339 time or ms"))),
        _ => Err(bad(column, "expected a date")),
    }
}

fn parse_opt_instant(column: &str, expr: &Expr) -> Result<Option<Ms>, SqlError> {
    match literal(column, expr)? {
        Literal::Null => Ok(None),
        _ => parse_instant(column, expr).map(Some),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{table}: unknown column {column}")]
    UnknownColumn { table: &'static str, column: String },
    #[error("{table}: expected {expected} values, got {got}")]
    WrongArity {
        table: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("{table}: missing column {column}")]
    MissingColumn {
        table: &'static str,
        column: &'static str,
    },
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("bad value for {column}: {reason}")]
    BadValue { column: String, reason: String },
}
