use tracing::info;
use ulid::Ulid;

use crate::limits::{MAX_NAME_LEN, MAX_REF_LEN, MAX_TEXT_LEN};
use crate::model::*;
use crate::observability;

use super::conflict::check_no_conflict;
use super::lifecycle::{RoomAction, reconcile_room};
use super::mutations::{optional_text, record_transition, required_text};
use super::{Engine, EngineError};

fn record_outcome(outcome: &'static str) {
    metrics::counter!(observability::PAYMENTS_TOTAL, "outcome" => outcome).increment(1);
}

fn payment_of(rs: &RoomState, booking_id: &Ulid) -> Result<Payment, EngineError> {
    rs.payments
        .get(booking_id)
        .cloned()
        .ok_or(EngineError::NotFound(*booking_id))
}

fn booking_of(rs: &RoomState, booking_id: &Ulid) -> Result<Booking, EngineError> {
    rs.booking(booking_id)
        .cloned()
        .ok_or(EngineError::NotFound(*booking_id))
}

/// Events that mark `payment` successful. A PENDING booking is promoted to
/// CONFIRMED, which needs the stay to still be free.
fn settle(rs: &RoomState, booking: &Booking, payment: Payment, now: Ms) -> Result<Vec<Event>, EngineError> {
    if booking.status == BookingStatus::Cancelled {
        return Err(EngineError::BookingCancelled(booking.id));
    }
    let mut events = vec![Event::PaymentRecorded {
        room_id: rs.id,
        payment,
    }];
    if booking.status == BookingStatus::Pending {
        check_no_conflict(rs, &booking.stay, Some(booking.id))?;
        events.push(Event::BookingRevised {
            booking: Booking {
                status: BookingStatus::Confirmed,
                updated_at: now,
                ..booking.clone()
            },
            from_room: rs.id,
        });
        events.extend(reconcile_room(rs, RoomAction::Claim));
        record_transition(booking.status, BookingStatus::Confirmed);
    }
    Ok(events)
}

/// Events that cancel the booking behind a failed or refunded payment.
fn cancel_booking_events(rs: &RoomState, booking: &Booking, now: Ms) -> Vec<Event> {
    if booking.status == BookingStatus::Cancelled {
        return Vec::new();
    }
    record_transition(booking.status, BookingStatus::Cancelled);
    let mut events = vec![Event::BookingRevised {
        booking: Booking {
            status: BookingStatus::Cancelled,
            updated_at: now,
            ..booking.clone()
        },
        from_room: rs.id,
    }];
    events.extend(reconcile_room(rs, RoomAction::Release { leaving: &[booking.id] }));
    events
}

impl Engine {
    /// A guest withdraws their own booking. Only the owner may do it and only
    /// while the booking is PENDING; an open payment is failed along with it.
    pub async fn cancel_own_booking(&self, id: Ulid, actor: &str) -> Result<Booking, EngineError> {
        let (mut rooms, room_id) = self.lock_booking(id, None).await?;
        let rs = rooms.require(&room_id)?;
        let booking = booking_of(rs, &id)?;
        if booking.user_id != actor {
            return Err(EngineError::NotBookingOwner(id));
        }
        if booking.status != BookingStatus::Pending {
            return Err(EngineError::NotGuestCancellable(booking.status));
        }

        let now = self.now();
        let mut events = cancel_booking_events(rs, &booking, now);
        let failed = rs
            .payments
            .get(&id)
            .filter(|p| p.status == PaymentStatus::Pending)
            .map(|p| Payment {
                status: PaymentStatus::Failed,
                note: Some("CANCELLED: by guest".to_string()),
                ..p.clone()
            });
        if let Some(payment) = &failed {
            events.push(Event::PaymentRecorded {
                room_id,
                payment: payment.clone(),
            });
        }
        self.commit(&mut rooms, events).await?;
        if failed.is_some() {
            record_outcome("cancelled");
        }
        info!(booking = %id, room = %room_id, user = actor, "booking cancelled by guest");
        Ok(Booking {
            status: BookingStatus::Cancelled,
            updated_at: now,
            ..booking
        })
    }

    /// Open the 1:1 payment of a booking for its full total.
    pub async fn create_payment(&self, req: NewPayment) -> Result<Payment, EngineError> {
        let user_id = optional_text("user_id", req.user_id, MAX_NAME_LEN)?;
        let (mut rooms, room_id) = self.lock_booking(req.booking_id, None).await?;
        let rs = rooms.require(&room_id)?;
        if rs.payments.contains_key(&req.booking_id) {
            return Err(EngineError::DuplicatePayment(req.booking_id));
        }
        let booking = booking_of(rs, &req.booking_id)?;
        if booking.status == BookingStatus::Cancelled {
            return Err(EngineError::BookingCancelled(booking.id));
        }

        let payment = Payment {
            id: req.id,
            booking_id: booking.id,
            amount: booking.total_price,
            method: req.method,
            status: PaymentStatus::Pending,
            payment_ref: None,
            paid_at: None,
            refund_amount: None,
            note: None,
            user_id,
            created_at: self.now(),
        };
        let reservation = self.reserve_payment_id(payment.id, booking.id)?;
        self.commit(
            &mut rooms,
            vec![Event::PaymentRecorded {
                room_id,
                payment: payment.clone(),
            }],
        )
        .await?;
        reservation.keep();
        record_outcome("created");
        info!(payment = %payment.id, booking = %booking.id, amount = payment.amount, "payment created");
        Ok(payment)
    }

    /// PENDING → SUCCESS, confirming the booking when it is still PENDING.
    pub async fn confirm_payment(&self, id: Ulid, req: ConfirmPayment) -> Result<Payment, EngineError> {
        let payment_ref = optional_text("payment_ref", req.payment_ref, MAX_REF_LEN)?;
        let (mut rooms, room_id, booking_id) = self.lock_payment(id).await?;
        let rs = rooms.require(&room_id)?;
        let current = payment_of(rs, &booking_id)?;
        if current.status != PaymentStatus::Pending {
            return Err(EngineError::InvalidPaymentState {
                action: "confirm",
                status: current.status,
            });
        }
        let ref_claim = payment_ref
            .as_deref()
            .map(|r| self.reserve_payment_ref(r, id))
            .transpose()?;

        let now = self.now();
        let next = Payment {
            status: PaymentStatus::Success,
            method: req.method.unwrap_or(current.method),
            payment_ref: payment_ref.or(current.payment_ref.clone()),
            paid_at: Some(req.paid_at.unwrap_or(now)),
            ..current
        };
        let events = settle(rs, &booking_of(rs, &booking_id)?, next.clone(), now)?;
        self.commit(&mut rooms, events).await?;
        if let Some(claim) = ref_claim {
            claim.keep();
        }
        record_outcome("success");
        info!(payment = %id, booking = %booking_id, "payment confirmed");
        Ok(next)
    }

    /// PENDING → FAILED; the booking is cancelled and the room released.
    pub async fn cancel_payment(&self, id: Ulid, reason: Option<String>) -> Result<Payment, EngineError> {
        let reason = optional_text("reason", reason, MAX_TEXT_LEN)?;
        let (mut rooms, room_id, booking_id) = self.lock_payment(id).await?;
        let rs = rooms.require(&room_id)?;
        let current = payment_of(rs, &booking_id)?;
        let booking = booking_of(rs, &booking_id)?;
        if current.status != PaymentStatus::Pending {
            return Err(EngineError::InvalidPaymentState {
                action: "cancel",
                status: current.status,
            });
        }
        if matches!(booking.status, BookingStatus::CheckedIn | BookingStatus::CheckedOut) {
            return Err(EngineError::AlreadyCheckedIn(booking.status));
        }

        let now = self.now();
        let next = Payment {
            status: PaymentStatus::Failed,
            note: Some(match reason {
                Some(r) => format!("CANCELLED: {r}"),
                None => "CANCELLED".to_string(),
            }),
            ..current
        };
        let mut events = vec![Event::PaymentRecorded {
            room_id,
            payment: next.clone(),
        }];
        events.extend(cancel_booking_events(rs, &booking, now));
        self.commit(&mut rooms, events).await?;
        record_outcome("cancelled");
        info!(payment = %id, booking = %booking_id, "payment cancelled");
        Ok(next)
    }

    /// SUCCESS → REFUNDED; the booking is cancelled and the room released.
    pub async fn refund_payment(&self, id: Ulid, req: RefundPayment) -> Result<Payment, EngineError> {
        let reason = required_text("reason", &req.reason, MAX_TEXT_LEN)?;
        let (mut rooms, room_id, booking_id) = self.lock_payment(id).await?;
        let rs = rooms.require(&room_id)?;
        let current = payment_of(rs, &booking_id)?;
        if current.status != PaymentStatus::Success {
            return Err(EngineError::InvalidPaymentState {
                action: "refund",
                status: current.status,
            });
        }
        let amount = req.amount.unwrap_or(current.amount);
        if amount <= 0 {
            return Err(EngineError::invalid("refund_amount", "must be positive"));
        }
        if amount > current.amount {
            return Err(EngineError::RefundExceedsTotal {
                requested: amount,
                total: current.amount,
            });
        }

        let now = self.now();
        let booking = booking_of(rs, &booking_id)?;
        let next = Payment {
            status: PaymentStatus::Refunded,
            refund_amount: Some(amount),
            note: Some(reason),
            ..current
        };
        let mut events = vec![Event::PaymentRecorded {
            room_id,
            payment: next.clone(),
        }];
        events.extend(cancel_booking_events(rs, &booking, now));
        self.commit(&mut rooms, events).await?;
        record_outcome("refunded");
        info!(payment = %id, booking = %booking_id, amount, "payment refunded");
        Ok(next)
    }

    /// Only PENDING and FAILED payments can be removed.
    pub async fn delete_payment(&self, id: Ulid) -> Result<(), EngineError> {
        let (mut rooms, room_id, booking_id) = self.lock_payment(id).await?;
        let current = payment_of(rooms.require(&room_id)?, &booking_id)?;
        if !matches!(current.status, PaymentStatus::Pending | PaymentStatus::Failed) {
            return Err(EngineError::InvalidPaymentState {
                action: "delete",
                status: current.status,
            });
        }
        self.commit(
            &mut rooms,
            vec![Event::PaymentRemoved {
                id,
                booking_id,
                room_id,
            }],
        )
        .await?;
        info!(payment = %id, booking = %booking_id, "payment deleted");
        Ok(())
    }

    // ── Gateway hand-off ─────────────────────────────────

    /// Create or reset the booking's payment as a PENDING mobile payment
    /// carrying the gateway's order reference.
    pub async fn begin_gateway_payment(
        &self,
        booking_id: Ulid,
        payment_id: Ulid,
        payment_ref: &str,
        user_id: Option<String>,
    ) -> Result<Payment, EngineError> {
        let payment_ref = required_text("payment_ref", payment_ref, MAX_REF_LEN)?;
        let user_id = optional_text("user_id", user_id, MAX_NAME_LEN)?;
        let (mut rooms, room_id) = self.lock_booking(booking_id, None).await?;
        let rs = rooms.require(&room_id)?;
        let booking = booking_of(rs, &booking_id)?;
        if booking.status == BookingStatus::Cancelled {
            return Err(EngineError::BookingCancelled(booking_id));
        }
        let existing = rs.payments.get(&booking_id).cloned();
        if let Some(p) = &existing
            && !matches!(p.status, PaymentStatus::Pending | PaymentStatus::Failed)
        {
            return Err(EngineError::InvalidPaymentState {
                action: "restart",
                status: p.status,
            });
        }
        let id = existing.as_ref().map_or(payment_id, |p| p.id);
        let id_claim = if existing.is_some() {
            None
        } else {
            Some(self.reserve_payment_id(id, booking_id)?)
        };
        let ref_claim = self.reserve_payment_ref(&payment_ref, id)?;

        let payment = Payment {
            id,
            booking_id,
            amount: booking.total_price,
            method: PaymentMethod::MobilePayment,
            status: PaymentStatus::Pending,
            payment_ref: Some(payment_ref.clone()),
            paid_at: None,
            refund_amount: None,
            note: None,
            user_id: user_id.or_else(|| existing.as_ref().and_then(|p| p.user_id.clone())),
            created_at: existing.as_ref().map_or_else(|| self.now(), |p| p.created_at),
        };
        self.commit(
            &mut rooms,
            vec![Event::PaymentRecorded {
                room_id,
                payment: payment.clone(),
            }],
        )
        .await?;
        if let Some(claim) = id_claim {
            claim.keep();
        }
        ref_claim.keep();
        record_outcome("gateway_started");
        info!(payment = %id, booking = %booking_id, %payment_ref, "gateway payment started");
        Ok(payment)
    }

    /// Apply the gateway's verdict for an order reference. Repeated deliveries
    /// of the same verdict return the payment unchanged.
    pub async fn apply_gateway_result(
        &self,
        payment_ref: &str,
        success: bool,
        message: Option<String>,
    ) -> Result<Payment, EngineError> {
        let message = optional_text("message", message, MAX_TEXT_LEN)?;
        let not_found = || EngineError::PaymentRefNotFound(payment_ref.to_string());
        let payment_id = self
            .payment_refs
            .get(payment_ref)
            .map(|e| *e.value())
            .ok_or_else(not_found)?;
        let (mut rooms, room_id, booking_id) = match self.lock_payment(payment_id).await {
            Ok(found) => found,
            Err(EngineError::NotFound(_)) => return Err(not_found()),
            Err(e) => return Err(e),
        };
        let rs = rooms.require(&room_id)?;
        let current = payment_of(rs, &booking_id)?;
        if current.payment_ref.as_deref() != Some(payment_ref) {
            return Err(not_found());
        }

        let now = self.now();
        let (next, events) = match (success, current.status) {
            (true, PaymentStatus::Success) | (false, PaymentStatus::Failed) => return Ok(current),
            (true, PaymentStatus::Pending) => {
                let next = Payment {
                    status: PaymentStatus::Success,
                    paid_at: Some(now),
                    note: message,
                    ..current
                };
                let events = settle(rs, &booking_of(rs, &booking_id)?, next.clone(), now)?;
                (next, events)
            }
            (false, PaymentStatus::Pending) => {
                let next = Payment {
                    status: PaymentStatus::Failed,
                    note: message,
                    ..current
                };
                let events = vec![Event::PaymentRecorded {
                    room_id,
                    payment: next.clone(),
                }];
                (next, events)
            }
            (success, status) => {
                return Err(EngineError::InvalidPaymentState {
                    action: if success { "confirm" } else { "fail" },
                    status,
                });
            }
        };
        self.commit(&mut rooms, events).await?;
        record_outcome(if success { "success" } else { "failed" });
        info!(payment = %payment_id, booking = %booking_id, success, "gateway result applied");
        Ok(next)
    }
}
