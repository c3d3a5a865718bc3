use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds.
pub type Ms = i64;

/// Smallest currency unit (e.g. đồng). Prices and totals are whole amounts.
pub type Money = i64;

/// Half-open interval `[start, end)`. A stay is `[check_in, check_out)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Declares a SCREAMING_SNAKE_CASE enum with `Display`, `FromStr` and `ALL`.
macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_uppercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(ParseEnumError { kind: $kind, value: s.to_string() }),
                }
            }
        }
    };
}

wire_enum!(
    /// Cached occupancy flag of a room.
    RoomStatus, "room status" {
        Available => "AVAILABLE",
        Booked => "BOOKED",
        Cleaning => "CLEANING",
        Maintenance => "MAINTENANCE",
    }
);

wire_enum!(
    BookingStatus, "booking status" {
        Pending => "PENDING",
        Confirmed => "CONFIRMED",
        CheckedIn => "CHECKED_IN",
        CheckedOut => "CHECKED_OUT",
        Cancelled => "CANCELLED",
    }
);

wire_enum!(
    PaymentStatus, "payment status" {
        Pending => "PENDING",
        Success => "SUCCESS",
        Failed => "FAILED",
        Refunded => "REFUNDED",
    }
);

wire_enum!(
    PaymentMethod, "payment method" {
        Cash => "CASH",
        CreditCard => "CREDIT_CARD",
        BankTransfer => "BANK_TRANSFER",
        MobilePayment => "MOBILE_PAYMENT",
    }
);

impl BookingStatus {
    /// CONFIRMED and CHECKED_IN bookings hold their room and block availability.
    pub fn is_active(&self) -> bool {
        matches!(self, BookingStatus::Confirmed | BookingStatus::CheckedIn)
    }

    pub fn is_deletable(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub room_id: Ulid,
    pub user_id: String,
    pub guest_name: String,
    pub guest_phone: String,
    pub guest_email: Option<String>,
    pub guest_count: u32,
    pub stay: Span,
    pub total_price: Money,
    pub status: BookingStatus,
    pub special_request: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub amount: Money,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    /// Reference handed out by the payment gateway (order id).
    pub payment_ref: Option<String>,
    pub paid_at: Option<Ms>,
    pub refund_amount: Option<Money>,
    /// Cancellation / refund reason or gateway message.
    pub note: Option<String>,
    pub user_id: Option<String>,
    pub created_at: Ms,
}

#[derive(Debug, Clone)]
pub struct RoomState {
    pub id: Ulid,
    pub name: String,
    pub room_type: String,
    pub price: Money,
    pub capacity: u32,
    pub status: RoomStatus,
    /// Every booking placed on this room, sorted by `stay.start`.
    pub bookings: Vec<Booking>,
    /// Payments of this room's bookings, keyed by booking id.
    pub payments: HashMap<Ulid, Payment>,
}

impl RoomState {
    pub fn new(
        id: Ulid,
        name: String,
        room_type: String,
        price: Money,
        capacity: u32,
        status: RoomStatus,
    ) -> Self {
        Self {
            id,
            name,
            room_type,
            price,
            capacity,
            status,
            bookings: Vec::new(),
            payments: HashMap::new(),
        }
    }

    /// Insert booking maintaining sort order by stay.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.stay.start, |b| b.stay.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    /// Bookings whose stay overlaps the query window.
    /// Binary search skips everything checking in at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.stay.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.stay.end > query.start)
    }

    /// Whether an active booking other than those in `leaving` still holds the room.
    pub fn has_active_booking_except(&self, leaving: &[Ulid]) -> bool {
        self.bookings
            .iter()
            .any(|b| b.status.is_active() && !leaving.contains(&b.id))
    }

    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            id: self.id,
            name: self.name.clone(),
            room_type: self.room_type.clone(),
            price: self.price,
            capacity: self.capacity,
            status: self.status,
        }
    }
}

/// WAL events. A WAL frame holds every event of one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated {
        id: Ulid,
        name: String,
        room_type: String,
        price: Money,
        capacity: u32,
        status: RoomStatus,
    },
    RoomUpdated {
        id: Ulid,
        name: String,
        room_type: String,
        price: Money,
        capacity: u32,
    },
    RoomStatusSet {
        id: Ulid,
        status: RoomStatus,
    },
    RoomDeleted {
        id: Ulid,
    },
    BookingPlaced {
        booking: Booking,
    },
    /// Full replacement of a booking; `from_room` differs from `booking.room_id` on a move.
    BookingRevised {
        booking: Booking,
        from_room: Ulid,
    },
    BookingRemoved {
        id: Ulid,
        room_id: Ulid,
    },
    /// Create or replace the payment of `payment.booking_id`.
    PaymentRecorded {
        room_id: Ulid,
        payment: Payment,
    },
    PaymentRemoved {
        id: Ulid,
        booking_id: Ulid,
        room_id: Ulid,
    },
}

impl Event {
    /// Existing rooms whose state this event reads or changes.
    pub fn room_ids(&self) -> Vec<Ulid> {
        match self {
            Event::RoomUpdated { id, .. }
            | Event::RoomStatusSet { id, .. }
            | Event::RoomDeleted { id } => vec![*id],
            Event::BookingPlaced { booking } => vec![booking.room_id],
            Event::BookingRevised { booking, from_room } => {
                if booking.room_id == *from_room {
                    vec![*from_room]
                } else {
                    vec![*from_room, booking.room_id]
                }
            }
            Event::BookingRemoved { room_id, .. }
            | Event::PaymentRecorded { room_id, .. }
            | Event::PaymentRemoved { room_id, .. } => vec![*room_id],
            Event::RoomCreated { .. } => vec![],
        }
    }
}

// ── Inputs ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRoom {
    pub id: Ulid,
    pub name: String,
    pub room_type: String,
    pub price: Money,
    pub capacity: u32,
    pub status: Option<RoomStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomPatch {
    pub name: Option<String>,
    pub room_type: Option<String>,
    pub price: Option<Money>,
    pub capacity: Option<u32>,
    pub status: Option<RoomStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub id: Ulid,
    pub room_id: Ulid,
    pub user_id: String,
    pub guest_name: String,
    pub guest_phone: String,
    pub guest_email: Option<String>,
    pub guest_count: u32,
    pub check_in: Ms,
    pub check_out: Ms,
    pub special_request: Option<String>,
    /// Room type the client picked; must match the room when present.
    pub room_type: Option<String>,
}

/// Partial booking update. `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingPatch {
    pub guest_name: Option<String>,
    pub guest_phone: Option<String>,
    pub guest_email: Option<Option<String>>,
    pub guest_count: Option<u32>,
    pub room_id: Option<Ulid>,
    pub check_in: Option<Ms>,
    pub check_out: Option<Ms>,
    pub special_request: Option<Option<String>>,
    pub status: Option<BookingStatus>,
}

impl BookingPatch {
    pub fn status(status: BookingStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPayment {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub method: PaymentMethod,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfirmPayment {
    pub method: Option<PaymentMethod>,
    pub payment_ref: Option<String>,
    pub paid_at: Option<Ms>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundPayment {
    pub reason: String,
    pub amount: Option<Money>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub status: Option<BookingStatus>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomFilter {
    pub room_type: Option<String>,
    pub min_capacity: Option<u32>,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub id: Ulid,
    pub name: String,
    pub room_type: String,
    pub price: Money,
    pub capacity: u32,
    pub status: RoomStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingView {
    pub booking: Booking,
    pub room_name: String,
    pub room_type: String,
    pub payment: Option<Payment>,
}

impl BookingView {
    pub fn nights(&self) -> i64 {
        crate::engine::calculate_nights(self.booking.stay.start, self.booking.stay.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentView {
    pub payment: Payment,
    pub room_id: Ulid,
    pub room_name: String,
    pub guest_name: String,
    pub booking_status: BookingStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DashboardStats {
    pub room_count: usize,
    pub booking_count: usize,
    pub guest_count: usize,
    pub total_revenue: Money,
    pub bookings_by_status: Vec<(BookingStatus, usize)>,
    pub recent_bookings: Vec<BookingView>,
}
