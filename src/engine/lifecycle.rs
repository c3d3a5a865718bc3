use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Per-tenant switches for the booking status table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionPolicy {
    /// Enables CHECKED_OUT → CONFIRMED and CANCELLED → PENDING.
    pub allow_reopen: bool,
}

impl TransitionPolicy {
    pub fn allows(&self, from: BookingStatus, to: BookingStatus) -> bool {
        use BookingStatus::*;
        match (from, to) {
            (Pending, Confirmed | Cancelled) => true,
            (Confirmed, CheckedIn | Cancelled) => true,
            (CheckedIn, CheckedOut) => true,
            (CheckedOut, Confirmed) | (Cancelled, Pending) => self.allow_reopen,
            _ => false,
        }
    }

    /// Re-setting the current status is accepted and changes nothing.
    pub fn check(&self, from: BookingStatus, to: BookingStatus) -> Result<(), EngineError> {
        if from == to || self.allows(from, to) {
            Ok(())
        } else {
            Err(EngineError::InvalidTransition { from, to })
        }
    }
}

/// What a booking change means for the room's cached status.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RoomAction<'a> {
    /// A booking now holds the room.
    Claim,
    /// The listed bookings stop holding the room.
    Release { leaving: &'a [Ulid] },
}

/// The one place that derives room status from booking changes.
///
/// `rs` is the room as it was before the operation's events are applied.
/// A release only ever turns BOOKED into AVAILABLE; staff-set CLEANING and
/// MAINTENANCE stay put.
pub(crate) fn reconcile_room(rs: &RoomState, action: RoomAction<'_>) -> Option<Event> {
    let next = match action {
        RoomAction::Claim => match rs.status {
            RoomStatus::Booked | RoomStatus::Maintenance => return None,
            _ => RoomStatus::Booked,
        },
        RoomAction::Release { leaving } => {
            if rs.status != RoomStatus::Booked || rs.has_active_booking_except(leaving) {
                return None;
            }
            RoomStatus::Available
        }
    };
    Some(Event::RoomStatusSet { id: rs.id, status: next })
}

/// Active bookings whose check-out has passed.
pub(crate) fn expired_bookings(rs: &RoomState, now: Ms) -> Vec<Ulid> {
    rs.bookings
        .iter()
        .filter(|b| b.status.is_active() && b.stay.end < now)
        .map(|b| b.id)
        .collect()
}
