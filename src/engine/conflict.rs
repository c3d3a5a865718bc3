use crate::limits::{
    DAY_MS, MAX_QUERY_WINDOW_MS, MAX_STAY_NIGHTS, MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS,
};
use crate::model::*;
use ulid::Ulid;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// UTC calendar day index of a timestamp.
pub fn day_of(ms: Ms) -> i64 {
    ms.div_euclid(DAY_MS)
}

/// Whole nights billed for a stay: partial days round up, negative spans count zero.
pub fn calculate_nights(check_in: Ms, check_out: Ms) -> i64 {
    let diff = (check_out - check_in).max(0);
    (diff + DAY_MS - 1) / DAY_MS
}

fn check_timestamp(ms: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&ms) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// Validate a requested stay and return its night count.
///
/// The past-date rule compares calendar days, so checking in later today is fine.
/// Admin edits pass `allow_past` to move bookings that already started.
pub fn validate_stay(
    check_in: Ms,
    check_out: Ms,
    now: Ms,
    allow_past: bool,
) -> Result<i64, EngineError> {
    check_timestamp(check_in)?;
    check_timestamp(check_out)?;
    if !allow_past && day_of(check_in) < day_of(now) {
        return Err(EngineError::CheckInInPast);
    }
    if check_out <= check_in {
        return Err(EngineError::CheckOutNotAfterCheckIn);
    }
    let nights = calculate_nights(check_in, check_out);
    if nights <= 0 {
        return Err(EngineError::NonPositiveNights);
    }
    if nights > MAX_STAY_NIGHTS {
        return Err(EngineError::StayTooLong(nights));
    }
    Ok(nights)
}

pub(crate) fn validate_query_window(span: &Span) -> Result<(), EngineError> {
    check_timestamp(span.start)?;
    check_timestamp(span.end)?;
    if span.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

/// First active booking on the room overlapping `stay`, ignoring `exclude`.
pub(crate) fn find_conflict<'a>(
    rs: &'a RoomState,
    stay: &Span,
    exclude: Option<Ulid>,
) -> Option<&'a Booking> {
    rs.overlapping(stay)
        .find(|b| b.status.is_active() && Some(b.id) != exclude)
}

pub fn is_room_available(rs: &RoomState, stay: &Span, exclude: Option<Ulid>) -> bool {
    find_conflict(rs, stay, exclude).is_none()
}

pub(crate) fn check_no_conflict(
    rs: &RoomState,
    stay: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(rs, stay, exclude) {
        Some(b) => Err(EngineError::RoomUnavailable {
            room: rs.id,
            conflict: b.id,
        }),
        None => Ok(()),
    }
}
