use std::collections::{BTreeMap, BTreeSet, HashSet};

use ulid::Ulid;

use crate::model::*;

use super::availability::free_windows;
use super::conflict::{is_room_available, validate_query_window, validate_stay};
use super::{Engine, EngineError, SharedRoomState};

const RECENT_BOOKINGS: usize = 5;

fn view(rs: &RoomState, booking: &Booking) -> BookingView {
    BookingView {
        booking: booking.clone(),
        room_name: rs.name.clone(),
        room_type: rs.room_type.clone(),
        payment: rs.payments.get(&booking.id).cloned(),
    }
}

fn newest_first(a: &BookingView, b: &BookingView) -> std::cmp::Ordering {
    b.booking
        .created_at
        .cmp(&a.booking.created_at)
        .then(b.booking.id.cmp(&a.booking.id))
}

impl Engine {
    /// Arcs of every room, detached from the map so no shard lock is held across awaits.
    fn all_rooms(&self) -> Vec<SharedRoomState> {
        self.state.iter().map(|e| e.value().clone()).collect()
    }

    // ── Rooms ────────────────────────────────────────────

    pub async fn list_rooms(&self, filter: &RoomFilter) -> Vec<RoomInfo> {
        let mut out = Vec::new();
        for arc in self.all_rooms() {
            let rs = arc.read().await;
            if filter.room_type.as_ref().is_some_and(|t| *t != rs.room_type) {
                continue;
            }
            if filter.min_capacity.is_some_and(|c| rs.capacity < c) {
                continue;
            }
            out.push(rs.info());
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    pub async fn room_info(&self, id: Ulid) -> Result<RoomInfo, EngineError> {
        let arc = self.get_room(&id).ok_or(EngineError::NotFound(id))?;
        let rs = arc.read().await;
        Ok(rs.info())
    }

    /// Distinct room types that can currently be offered (maintenance excluded).
    pub async fn room_types(&self) -> Vec<String> {
        let mut types = BTreeSet::new();
        for arc in self.all_rooms() {
            let rs = arc.read().await;
            if rs.status != RoomStatus::Maintenance {
                types.insert(rs.room_type.clone());
            }
        }
        types.into_iter().collect()
    }

    /// Rooms of `room_type` that can take a new booking for the stay.
    pub async fn available_rooms(
        &self,
        room_type: &str,
        check_in: Ms,
        check_out: Ms,
    ) -> Result<Vec<RoomInfo>, EngineError> {
        validate_stay(check_in, check_out, self.now(), false)?;
        let stay = Span::new(check_in, check_out);
        let room_type = room_type.trim();
        let mut out = Vec::new();
        for arc in self.all_rooms() {
            let rs = arc.read().await;
            if rs.room_type == room_type
                && rs.status != RoomStatus::Maintenance
                && is_room_available(&rs, &stay, None)
            {
                out.push(rs.info());
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    /// Open sub-ranges of `[start, end)` on one room.
    pub async fn room_free_windows(
        &self,
        room_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<Span>, EngineError> {
        if end <= start {
            return Err(EngineError::invalid("end", "must be after start"));
        }
        let query = Span::new(start, end);
        validate_query_window(&query)?;
        let arc = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let rs = arc.read().await;
        Ok(free_windows(&rs, &query))
    }

    // ── Bookings ─────────────────────────────────────────

    /// All bookings matching the filter, newest first.
    pub async fn get_all_bookings(&self, filter: &BookingFilter) -> Vec<BookingView> {
        let mut out = Vec::new();
        for arc in self.all_rooms() {
            let rs = arc.read().await;
            for b in &rs.bookings {
                if filter.status.is_some_and(|s| s != b.status) {
                    continue;
                }
                if filter.user_id.as_ref().is_some_and(|u| *u != b.user_id) {
                    continue;
                }
                out.push(view(&rs, b));
            }
        }
        out.sort_by(newest_first);
        out
    }

    pub async fn get_booking_by_id(&self, id: Ulid) -> Result<BookingView, EngineError> {
        let room_id = self.room_of_booking(&id).ok_or(EngineError::NotFound(id))?;
        let arc = self.get_room(&room_id).ok_or(EngineError::NotFound(id))?;
        let rs = arc.read().await;
        let booking = rs.booking(&id).ok_or(EngineError::NotFound(id))?;
        Ok(view(&rs, booking))
    }

    // ── Payments ─────────────────────────────────────────

    pub async fn get_all_payments(&self, status: Option<PaymentStatus>) -> Vec<PaymentView> {
        let mut out = Vec::new();
        for arc in self.all_rooms() {
            let rs = arc.read().await;
            for p in rs.payments.values() {
                if status.is_some_and(|s| s != p.status) {
                    continue;
                }
                if let Some(b) = rs.booking(&p.booking_id) {
                    out.push(PaymentView {
                        payment: p.clone(),
                        room_id: rs.id,
                        room_name: rs.name.clone(),
                        guest_name: b.guest_name.clone(),
                        booking_status: b.status,
                    });
                }
            }
        }
        out.sort_by(|a, b| {
            b.payment
                .created_at
                .cmp(&a.payment.created_at)
                .then(b.payment.id.cmp(&a.payment.id))
        });
        out
    }

    pub async fn get_payment_by_id(&self, id: Ulid) -> Result<PaymentView, EngineError> {
        let booking_id = self
            .payment_bookings
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let room_id = self.room_of_booking(&booking_id).ok_or(EngineError::NotFound(id))?;
        let arc = self.get_room(&room_id).ok_or(EngineError::NotFound(id))?;
        let rs = arc.read().await;
        let payment = rs
            .payments
            .get(&booking_id)
            .filter(|p| p.id == id)
            .ok_or(EngineError::NotFound(id))?;
        let booking = rs.booking(&booking_id).ok_or(EngineError::NotFound(booking_id))?;
        Ok(PaymentView {
            payment: payment.clone(),
            room_id: rs.id,
            room_name: rs.name.clone(),
            guest_name: booking.guest_name.clone(),
            booking_status: booking.status,
        })
    }

    // ── Dashboard ────────────────────────────────────────

    pub async fn dashboard(&self) -> DashboardStats {
        let mut room_count = 0;
        let mut owners = HashSet::new();
        let mut revenue: Money = 0;
        let mut by_status: BTreeMap<BookingStatus, usize> =
            BookingStatus::ALL.iter().map(|s| (*s, 0)).collect();
        let mut all = Vec::new();

        for arc in self.all_rooms() {
            let rs = arc.read().await;
            room_count += 1;
            for b in &rs.bookings {
                owners.insert(b.user_id.clone());
                *by_status.entry(b.status).or_default() += 1;
                all.push(view(&rs, b));
            }
            revenue = rs
                .payments
                .values()
                .filter(|p| p.status == PaymentStatus::Success)
                .fold(revenue, |acc, p| acc.saturating_add(p.amount));
        }

        let booking_count = all.len();
        all.sort_by(newest_first);
        all.truncate(RECENT_BOOKINGS);
        DashboardStats {
            room_count,
            booking_count,
            guest_count: owners.len(),
            total_revenue: revenue,
            bookings_by_status: by_status.into_iter().collect(),
            recent_bookings: all,
        }
    }
}
