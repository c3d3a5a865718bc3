use ulid::Ulid;

use crate::model::{BookingStatus, Money, PaymentStatus};

/// Coarse classification used to pick a SQLSTATE at the wire edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    Forbidden,
    Infrastructure,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("check-in date cannot be in the past")]
    CheckInInPast,
    #[error("check-out must be after check-in")]
    CheckOutNotAfterCheckIn,
    #[error("stay must span at least one night")]
    NonPositiveNights,
    #[error("stay of {0} nights exceeds the {max} night maximum", max = crate::limits::MAX_STAY_NIGHTS)]
    StayTooLong(i64),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("room {0} is under maintenance")]
    RoomUnderMaintenance(Ulid),
    #[error("room holds at most {capacity} guests, {requested} requested")]
    CapacityExceeded { capacity: u32, requested: u32 },
    #[error("room is of type {actual}, not {requested}")]
    RoomTypeMismatch { requested: String, actual: String },
    #[error("room {room} is not available for the selected dates (conflicts with booking {conflict})")]
    RoomUnavailable { room: Ulid, conflict: Ulid },
    #[error("cannot change booking status from {from} to {to}")]
    InvalidTransition { from: BookingStatus, to: BookingStatus },
    #[error("booking with status {0} cannot be deleted")]
    BookingNotDeletable(BookingStatus),
    #[error("booking {0} already has a payment")]
    DuplicatePayment(Ulid),
    #[error("payment reference already in use: {0}")]
    DuplicatePaymentRef(String),
    #[error("booking {0} is cancelled")]
    BookingCancelled(Ulid),
    #[error("cannot {action} a payment with status {status}")]
    InvalidPaymentState { action: &'static str, status: PaymentStatus },
    #[error("booking has status {0}; payment can no longer be cancelled")]
    AlreadyCheckedIn(BookingStatus),
    #[error("refund of {requested} exceeds payment total {total}")]
    RefundExceedsTotal { requested: Money, total: Money },
    #[error("room {0} still has bookings")]
    RoomHasBookings(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("only PENDING bookings can be cancelled by their guest; this one is {0}")]
    NotGuestCancellable(BookingStatus),

    #[error("booking {0} belongs to another user")]
    NotBookingOwner(Ulid),

    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("no payment with reference {0}")]
    PaymentRefNotFound(String),

    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        use EngineError::*;
        match self {
            MissingField(_)
            | InvalidField { .. }
            | CheckInInPast
            | CheckOutNotAfterCheckIn
            | NonPositiveNights
            | StayTooLong(_)
            | LimitExceeded(_) => ErrorKind::Validation,
            RoomUnderMaintenance(_)
            | CapacityExceeded { .. }
            | RoomTypeMismatch { .. }
            | RoomUnavailable { .. }
            | InvalidTransition { .. }
            | BookingNotDeletable(_)
            | DuplicatePayment(_)
            | DuplicatePaymentRef(_)
            | BookingCancelled(_)
            | InvalidPaymentState { .. }
            | AlreadyCheckedIn(_)
            | RefundExceedsTotal { .. }
            | RoomHasBookings(_)
            | AlreadyExists(_)
            | NotGuestCancellable(_) => ErrorKind::Conflict,
            NotFound(_) | PaymentRefNotFound(_) => ErrorKind::NotFound,
            NotBookingOwner(_) => ErrorKind::Forbidden,
            WalError(_) => ErrorKind::Infrastructure,
        }
    }

    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        EngineError::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}
