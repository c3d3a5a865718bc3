use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_no_conflict, validate_stay};
use super::lifecycle::{RoomAction, expired_bookings, reconcile_room};
use super::{Engine, EngineError, LockedRooms, WalCommand};

/// Trimmed, non-empty, bounded text.
pub(super) fn required_text(
    field: &'static str,
    value: &str,
    max_len: usize,
) -> Result<String, EngineError> {
    let v = value.trim();
    if v.is_empty() {
        return Err(EngineError::MissingField(field));
    }
    if v.len() > max_len {
        return Err(EngineError::invalid(field, format!("longer than {max_len} bytes")));
    }
    Ok(v.to_string())
}

/// Blank optional text collapses to `None`.
pub(super) fn optional_text(
    field: &'static str,
    value: Option<String>,
    max_len: usize,
) -> Result<Option<String>, EngineError> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(v) if v.len() > max_len => Err(EngineError::invalid(
            field,
            format!("longer than {max_len} bytes"),
        )),
        Some(v) => Ok(Some(v.to_string())),
    }
}

fn guest_count(count: u32) -> Result<u32, EngineError> {
    if count == 0 {
        return Err(EngineError::invalid("guest_count", "at least one guest is required"));
    }
    if count > MAX_GUESTS {
        return Err(EngineError::LimitExceeded("too many guests"));
    }
    Ok(count)
}

fn check_price(price: Money) -> Result<(), EngineError> {
    if price < 0 {
        return Err(EngineError::invalid("price", "must not be negative"));
    }
    if price > MAX_PRICE {
        return Err(EngineError::LimitExceeded("room price too large"));
    }
    Ok(())
}

pub(super) fn stay_price(nights: i64, price: Money) -> Result<Money, EngineError> {
    nights
        .checked_mul(price)
        .ok_or(EngineError::LimitExceeded("total price overflows"))
}

fn check_room_accepts(rs: &RoomState, guests: u32) -> Result<(), EngineError> {
    if rs.status == RoomStatus::Maintenance {
        return Err(EngineError::RoomUnderMaintenance(rs.id));
    }
    if guests > rs.capacity {
        return Err(EngineError::CapacityExceeded {
            capacity: rs.capacity,
            requested: guests,
        });
    }
    Ok(())
}

pub(super) fn record_transition(from: BookingStatus, to: BookingStatus) {
    if from != to {
        metrics::counter!(
            observability::BOOKING_TRANSITIONS_TOTAL,
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);
    }
}

impl Engine {
    // ── Room catalog ─────────────────────────────────────

    pub async fn create_room(&self, req: NewRoom) -> Result<RoomInfo, EngineError> {
        let name = required_text("name", &req.name, MAX_NAME_LEN)?;
        let room_type = required_text("type", &req.room_type, MAX_NAME_LEN)?;
        check_price(req.price)?;
        if req.capacity == 0 {
            return Err(EngineError::invalid("capacity", "must be at least 1"));
        }
        if req.capacity > MAX_GUESTS {
            return Err(EngineError::LimitExceeded("room capacity too large"));
        }

        let _catalog = self.catalog.lock().await;
        if self.state.len() >= MAX_ROOMS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if self.state.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }

        let status = req.status.unwrap_or(RoomStatus::Available);
        let event = Event::RoomCreated {
            id: req.id,
            name: name.clone(),
            room_type: room_type.clone(),
            price: req.price,
            capacity: req.capacity,
            status,
        };
        self.commit(&mut LockedRooms::empty(), vec![event]).await?;
        info!(room = %req.id, %name, %room_type, "room created");
        Ok(RoomInfo {
            id: req.id,
            name,
            room_type,
            price: req.price,
            capacity: req.capacity,
            status,
        })
    }

    pub async fn update_room(&self, id: Ulid, patch: RoomPatch) -> Result<RoomInfo, EngineError> {
        let name = patch
            .name
            .as_deref()
            .map(|n| required_text("name", n, MAX_NAME_LEN))
            .transpose()?;
        let room_type = patch
            .room_type
            .as_deref()
            .map(|t| required_text("type", t, MAX_NAME_LEN))
            .transpose()?;
        if let Some(price) = patch.price {
            check_price(price)?;
        }
        if let Some(c) = patch.capacity {
            if c == 0 {
                return Err(EngineError::invalid("capacity", "must be at least 1"));
            }
            if c > MAX_GUESTS {
                return Err(EngineError::LimitExceeded("room capacity too large"));
            }
        }

        let mut rooms = self.lock_rooms(&[id]).await?;
        let rs = rooms.require(&id)?;
        let mut events = Vec::new();
        if name.is_some() || room_type.is_some() || patch.price.is_some() || patch.capacity.is_some() {
            events.push(Event::RoomUpdated {
                id,
                name: name.unwrap_or_else(|| rs.name.clone()),
                room_type: room_type.unwrap_or_else(|| rs.room_type.clone()),
                price: patch.price.unwrap_or(rs.price),
                capacity: patch.capacity.unwrap_or(rs.capacity),
            });
        }
        if let Some(status) = patch.status
            && status != rs.status
        {
            events.push(Event::RoomStatusSet { id, status });
        }
        self.commit(&mut rooms, events).await?;
        let info = rooms.require(&id)?.info();
        info!(room = %id, status = %info.status, "room updated");
        Ok(info)
    }

    /// Rooms with any booking on record cannot be removed.
    pub async fn delete_room(&self, id: Ulid) -> Result<(), EngineError> {
        let mut rooms = self.lock_rooms(&[id]).await?;
        if !rooms.require(&id)?.bookings.is_empty() {
            return Err(EngineError::RoomHasBookings(id));
        }
        self.commit(&mut rooms, vec![Event::RoomDeleted { id }]).await?;
        info!(room = %id, "room deleted");
        Ok(())
    }

    // ── Bookings ─────────────────────────────────────────

    /// Place a PENDING booking after validating dates, room fit and availability.
    pub async fn create_booking(&self, req: NewBooking) -> Result<Booking, EngineError> {
        let guest_name = required_text("guest_name", &req.guest_name, MAX_NAME_LEN)?;
        let guest_phone = required_text("guest_phone", &req.guest_phone, MAX_PHONE_LEN)?;
        let user_id = required_text("user_id", &req.user_id, MAX_NAME_LEN)?;
        let guest_email = optional_text("guest_email", req.guest_email, MAX_NAME_LEN)?;
        let special_request = optional_text("special_request", req.special_request, MAX_TEXT_LEN)?;
        let requested_type = optional_text("type", req.room_type, MAX_NAME_LEN)?;
        let guests = guest_count(req.guest_count)?;

        let now = self.now();
        let nights = validate_stay(req.check_in, req.check_out, now, false)?;
        let stay = Span::new(req.check_in, req.check_out);

        let mut rooms = self.lock_rooms(&[req.room_id]).await?;
        let rs = rooms.require(&req.room_id)?;
        let reservation = self.reserve_booking_id(req.id, req.room_id)?;
        if rs.bookings.len() >= MAX_BOOKINGS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many bookings on room"));
        }
        if let Some(t) = requested_type
            && t != rs.room_type
        {
            return Err(EngineError::RoomTypeMismatch {
                requested: t,
                actual: rs.room_type.clone(),
            });
        }
        check_room_accepts(rs, guests)?;
        check_no_conflict(rs, &stay, None)?;

        let booking = Booking {
            id: req.id,
            room_id: req.room_id,
            user_id,
            guest_name,
            guest_phone,
            guest_email,
            guest_count: guests,
            stay,
            total_price: stay_price(nights, rs.price)?,
            status: BookingStatus::Pending,
            special_request,
            created_at: now,
            updated_at: now,
        };
        let mut events = vec![Event::BookingPlaced {
            booking: booking.clone(),
        }];
        events.extend(reconcile_room(rs, RoomAction::Claim));
        self.commit(&mut rooms, events).await?;
        reservation.keep();

        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
        info!(
            booking = %booking.id,
            room = %booking.room_id,
            nights,
            total = booking.total_price,
            "booking created"
        );
        Ok(booking)
    }

    /// Admin edit: fields, dates, room and status in one atomic step.
    pub async fn update_booking(&self, id: Ulid, patch: BookingPatch) -> Result<Booking, EngineError> {
        let guest_name = patch
            .guest_name
            .as_deref()
            .map(|v| required_text("guest_name", v, MAX_NAME_LEN))
            .transpose()?;
        let guest_phone = patch
            .guest_phone
            .as_deref()
            .map(|v| required_text("guest_phone", v, MAX_PHONE_LEN))
            .transpose()?;
        let guest_email = patch
            .guest_email
            .map(|v| optional_text("guest_email", v, MAX_NAME_LEN))
            .transpose()?;
        let special_request = patch
            .special_request
            .map(|v| optional_text("special_request", v, MAX_TEXT_LEN))
            .transpose()?;
        let guests = patch.guest_count.map(guest_count).transpose()?;

        let (mut rooms, from_room) = self.lock_booking(id, patch.room_id).await?;
        let from = rooms.require(&from_room)?;
        let current = from.booking(&id).cloned().ok_or(EngineError::NotFound(id))?;

        let mut next = current.clone();
        if let Some(status) = patch.status {
            self.policy.check(current.status, status)?;
            next.status = status;
        }
        if let Some(v) = guest_name {
            next.guest_name = v;
        }
        if let Some(v) = guest_phone {
            next.guest_phone = v;
        }
        if let Some(v) = guest_email {
            next.guest_email = v;
        }
        if let Some(v) = special_request {
            next.special_request = v;
        }
        if let Some(v) = guests {
            next.guest_count = v;
        }

        let now = self.now();
        let target_room = patch.room_id.unwrap_or(from_room);
        let room_changed = target_room != from_room;
        let check_in = patch.check_in.unwrap_or(current.stay.start);
        let check_out = patch.check_out.unwrap_or(current.stay.end);
        let dates_changed = check_in != current.stay.start || check_out != current.stay.end;
        let status_changed = next.status != current.status;
        let entering_active = next.status.is_active() && !current.status.is_active();

        let target = rooms.require(&target_room)?;
        if dates_changed {
            validate_stay(check_in, check_out, now, true)?;
            next.stay = Span::new(check_in, check_out);
        }
        if room_changed {
            if target.bookings.len() >= MAX_BOOKINGS_PER_ROOM {
                return Err(EngineError::LimitExceeded("too many bookings on room"));
            }
            check_room_accepts(target, next.guest_count)?;
        } else if guests.is_some() && next.guest_count > target.capacity {
            return Err(EngineError::CapacityExceeded {
                capacity: target.capacity,
                requested: next.guest_count,
            });
        }
        if dates_changed || room_changed || entering_active {
            check_no_conflict(target, &next.stay, Some(id))?;
        }
        if dates_changed || room_changed {
            let nights = super::conflict::calculate_nights(next.stay.start, next.stay.end);
            next.total_price = stay_price(nights, target.price)?;
        }
        next.room_id = target_room;
        next.updated_at = now;

        let mut events = vec![Event::BookingRevised {
            booking: next.clone(),
            from_room,
        }];
        // An open payment follows the booking's price.
        if next.total_price != current.total_price
            && let Some(p) = rooms.require(&from_room)?.payments.get(&id)
            && p.status == PaymentStatus::Pending
        {
            events.push(Event::PaymentRecorded {
                room_id: target_room,
                payment: Payment {
                    amount: next.total_price,
                    ..p.clone()
                },
            });
        }
        if status_changed || room_changed {
            let vacating = room_changed
                || matches!(next.status, BookingStatus::Cancelled | BookingStatus::CheckedOut);
            if vacating {
                events.extend(reconcile_room(
                    rooms.require(&from_room)?,
                    RoomAction::Release { leaving: &[id] },
                ));
            }
            if next.status.is_active() {
                events.extend(reconcile_room(target, RoomAction::Claim));
            }
        }
        self.commit(&mut rooms, events).await?;

        record_transition(current.status, next.status);
        info!(
            booking = %id,
            room = %next.room_id,
            from = %current.status,
            to = %next.status,
            "booking updated"
        );
        Ok(next)
    }

    /// Only PENDING and CANCELLED bookings can be removed; their payment goes with them.
    pub async fn delete_booking(&self, id: Ulid) -> Result<(), EngineError> {
        let (mut rooms, room_id) = self.lock_booking(id, None).await?;
        let rs = rooms.require(&room_id)?;
        let booking = rs.booking(&id).ok_or(EngineError::NotFound(id))?;
        if !booking.status.is_deletable() {
            return Err(EngineError::BookingNotDeletable(booking.status));
        }

        let mut events = Vec::new();
        if let Some(p) = rs.payments.get(&id) {
            events.push(Event::PaymentRemoved {
                id: p.id,
                booking_id: id,
                room_id,
            });
        }
        events.push(Event::BookingRemoved { id, room_id });
        events.extend(reconcile_room(rs, RoomAction::Release { leaving: &[id] }));
        self.commit(&mut rooms, events).await?;
        info!(booking = %id, room = %room_id, "booking deleted");
        Ok(())
    }

    // ── Housekeeping ─────────────────────────────────────

    /// Rooms holding an active booking whose check-out passed. Skips rooms
    /// that are locked right now; the next sweep picks them up.
    pub fn collect_rooms_with_expired_stays(&self, now: Ms) -> Vec<Ulid> {
        let mut found = Vec::new();
        for entry in self.state.iter() {
            if let Ok(guard) = entry.value().try_read()
                && !expired_bookings(&guard, now).is_empty()
            {
                found.push(guard.id);
            }
        }
        found
    }

    /// Force every expired CONFIRMED/CHECKED_IN booking to CHECKED_OUT and free
    /// its room. One frame per room. Returns the bookings it moved.
    pub async fn auto_check_out_expired_bookings(&self, now: Ms) -> Result<Vec<Ulid>, EngineError> {
        let mut moved = Vec::new();
        for room_id in self.collect_rooms_with_expired_stays(now) {
            let mut rooms = match self.lock_rooms(&[room_id]).await {
                Ok(rooms) => rooms,
                Err(EngineError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let rs = rooms.require(&room_id)?;
            let expired = expired_bookings(rs, now);
            if expired.is_empty() {
                debug!(room = %room_id, "expired stays already handled");
                continue;
            }

            let mut events: Vec<Event> = rs
                .bookings
                .iter()
                .filter(|b| expired.contains(&b.id))
                .map(|b| {
                    record_transition(b.status, BookingStatus::CheckedOut);
                    Event::BookingRevised {
                        booking: Booking {
                            status: BookingStatus::CheckedOut,
                            updated_at: now,
                            ..b.clone()
                        },
                        from_room: room_id,
                    }
                })
                .collect();
            events.extend(reconcile_room(rs, RoomAction::Release { leaving: &expired }));
            self.commit(&mut rooms, events).await?;

            metrics::counter!(observability::AUTO_CHECKOUTS_TOTAL).increment(expired.len() as u64);
            info!(room = %room_id, count = expired.len(), "auto checked out expired stays");
            moved.extend(expired);
        }
        Ok(moved)
    }

    /// Rewrite the WAL as one frame per room describing its current state.
    ///
    /// Holds the catalog lock and a read lock on every room until the new log
    /// is in place, so no commit can land between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;
        let mut ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        ids.sort();

        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(arc) = self.get_room(&id) else { continue };
            let guard = arc.clone().read_owned().await;
            if self.state.get(&id).is_some_and(|e| std::sync::Arc::ptr_eq(e.value(), &arc)) {
                guards.push(guard);
            }
        }

        let frames: Vec<Vec<Event>> = guards
            .iter()
            .map(|rs| {
                let mut frame = Vec::with_capacity(1 + rs.bookings.len() + rs.payments.len());
                frame.push(Event::RoomCreated {
                    id: rs.id,
                    name: rs.name.clone(),
                    room_type: rs.room_type.clone(),
                    price: rs.price,
                    capacity: rs.capacity,
                    status: rs.status,
                });
                frame.extend(rs.bookings.iter().map(|b| Event::BookingPlaced { booking: b.clone() }));
                frame.extend(rs.payments.values().map(|p| Event::PaymentRecorded {
                    room_id: rs.id,
                    payment: p.clone(),
                }));
                frame
            })
            .collect();
        let room_count = frames.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { frames, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!(rooms = room_count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
