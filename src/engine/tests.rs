use std::sync::atomic::{AtomicI64, Ordering};

use super::*;
use crate::limits::DAY_MS as D;

const H: Ms = 3_600_000;
/// 2025-02-20T10:00:00Z
const FEB_20_10AM: Ms = 1_740_045_600_000;
/// 2025-03-01T00:00:00Z
const MAR_1: Ms = 1_740_787_200_000;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("hotelier_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn open_engine(path: &PathBuf, policy: TransitionPolicy, clock: &Arc<AtomicI64>) -> Engine {
    let c = clock.clone();
    Engine::with_clock(path.clone(), policy, Arc::new(move || c.load(Ordering::SeqCst))).unwrap()
}

fn engine_with(name: &str, policy: TransitionPolicy) -> (Engine, Arc<AtomicI64>, PathBuf) {
    let path = test_wal_path(name);
    let clock = Arc::new(AtomicI64::new(FEB_20_10AM));
    (open_engine(&path, policy, &clock), clock, path)
}

fn engine(name: &str) -> (Engine, Arc<AtomicI64>) {
    let (engine, clock, _) = engine_with(name, TransitionPolicy::default());
    (engine, clock)
}

async fn seed_room(engine: &Engine, name: &str, room_type: &str, price: Money, capacity: u32) -> Ulid {
    let id = Ulid::new();
    engine
        .create_room(NewRoom {
            id,
            name: name.into(),
            room_type: room_type.into(),
            price,
            capacity,
            status: None,
        })
        .await
        .unwrap();
    id
}

fn stay(room_id: Ulid, check_in: Ms, check_out: Ms) -> NewBooking {
    NewBooking {
        id: Ulid::new(),
        room_id,
        user_id: "guest-1".into(),
        guest_name: "Tran Thi B".into(),
        guest_phone: "0912345678".into(),
        guest_email: Some("b@example.com".into()),
        guest_count: 2,
        check_in,
        check_out,
        special_request: None,
        room_type: None,
    }
}

async fn room_status(engine: &Engine, id: Ulid) -> RoomStatus {
    engine.room_info(id).await.unwrap().status
}

async fn booking_status(engine: &Engine, id: Ulid) -> BookingStatus {
    engine.get_booking_by_id(id).await.unwrap().booking.status
}

async fn set_status(engine: &Engine, id: Ulid, status: BookingStatus) -> Result<Booking, EngineError> {
    engine.update_booking(id, BookingPatch::status(status)).await
}

fn payment_req(booking_id: Ulid) -> NewPayment {
    NewPayment {
        id: Ulid::new(),
        booking_id,
        method: PaymentMethod::Cash,
        user_id: Some("staff".into()),
    }
}

// ── Creating bookings ────────────────────────────────────

#[tokio::test]
async fn create_booking_prices_nights_and_claims_room() {
    let (engine, _) = engine("create_prices.wal");
    let room = seed_room(&engine, "101", "Deluxe", 500_000, 2).await;

    let b = engine.create_booking(stay(room, MAR_1, MAR_1 + 2 * D)).await.unwrap();
    assert_eq!(b.status, BookingStatus::Pending);
    assert_eq!(b.total_price, 1_000_000);
    assert_eq!(b.created_at, FEB_20_10AM);
    assert_eq!(room_status(&engine, room).await, RoomStatus::Booked);

    let view = engine.get_booking_by_id(b.id).await.unwrap();
    assert_eq!(view.nights(), 2);
    assert_eq!(view.room_name, "101");
    assert!(view.payment.is_none());
}

#[tokio::test]
async fn create_booking_partial_day_bills_a_night() {
    let (engine, _) = engine("partial_day.wal");
    let room = seed_room(&engine, "102", "Standard", 300_000, 2).await;
    let b = engine
        .create_booking(stay(room, MAR_1 + 14 * H, MAR_1 + D + 12 * H))
        .await
        .unwrap();
    assert_eq!(b.total_price, 300_000);
}

#[tokio::test]
async fn create_booking_rejects_bad_input() {
    let (engine, _) = engine("create_rejects.wal");
    let room = seed_room(&engine, "103", "Standard", 300_000, 2).await;

    let mut req = stay(room, MAR_1, MAR_1 + D);
    req.guest_name = "   ".into();
    assert!(matches!(engine.create_booking(req).await, Err(EngineError::MissingField("guest_name"))));

    let mut req = stay(room, MAR_1, MAR_1 + D);
    req.guest_phone = String::new();
    assert!(matches!(engine.create_booking(req).await, Err(EngineError::MissingField("guest_phone"))));

    let mut req = stay(room, MAR_1, MAR_1 + D);
    req.guest_count = 0;
    assert!(matches!(engine.create_booking(req).await, Err(EngineError::InvalidField { field: "guest_count", .. })));

    let mut req = stay(room, MAR_1, MAR_1 + D);
    req.guest_count = 3;
    assert!(matches!(
        engine.create_booking(req).await,
        Err(EngineError::CapacityExceeded { capacity: 2, requested: 3 })
    ));

    assert!(matches!(
        engine.create_booking(stay(room, MAR_1, MAR_1)).await,
        Err(EngineError::CheckOutNotAfterCheckIn)
    ));
    assert!(matches!(
        engine.create_booking(stay(room, FEB_20_10AM - D, MAR_1)).await,
        Err(EngineError::CheckInInPast)
    ));
    assert!(matches!(
        engine.create_booking(stay(room, MAR_1, MAR_1 + 400 * D)).await,
        Err(EngineError::StayTooLong(400))
    ));
    assert!(matches!(
        engine.create_booking(stay(Ulid::new(), MAR_1, MAR_1 + D)).await,
        Err(EngineError::NotFound(_))
    ));

    // Nothing was written for any of the rejected requests.
    assert!(engine.get_all_bookings(&BookingFilter::default()).await.is_empty());
    assert_eq!(room_status(&engine, room).await, RoomStatus::Available);
}

#[tokio::test]
async fn create_booking_earlier_today_is_allowed() {
    let (engine, _) = engine("earlier_today.wal");
    let room = seed_room(&engine, "104", "Standard", 300_000, 2).await;
    let midnight = FEB_20_10AM - 10 * H;
    assert!(engine.create_booking(stay(room, midnight, midnight + D)).await.is_ok());
}

#[tokio::test]
async fn create_booking_checks_room_fit() {
    let (engine, _) = engine("room_fit.wal");
    let room = seed_room(&engine, "105", "Suite", 2_000_000, 4).await;

    let mut req = stay(room, MAR_1, MAR_1 + D);
    req.room_type = Some("Standard".into());
    assert!(matches!(
        engine.create_booking(req).await,
        Err(EngineError::RoomTypeMismatch { .. })
    ));

    let mut req = stay(room, MAR_1, MAR_1 + D);
    req.room_type = Some("Suite".into());
    let first = engine.create_booking(req.clone()).await.unwrap();
    assert!(matches!(
        engine.create_booking(NewBooking { id: first.id, check_in: MAR_1 + 5 * D, check_out: MAR_1 + 6 * D, ..req }).await,
        Err(EngineError::AlreadyExists(_))
    ));

    engine
        .update_room(room, RoomPatch { status: Some(RoomStatus::Maintenance), ..Default::default() })
        .await
        .unwrap();
    assert!(matches!(
        engine.create_booking(stay(room, MAR_1 + 10 * D, MAR_1 + 11 * D)).await,
        Err(EngineError::RoomUnderMaintenance(_))
    ));
}

// ── Availability ─────────────────────────────────────────

#[tokio::test]
async fn pending_does_not_block_confirmed_does() {
    let (engine, _) = engine("pending_blocks.wal");
    let room = seed_room(&engine, "201", "Deluxe", 500_000, 2).await;

    let first = engine.create_booking(stay(room, MAR_1, MAR_1 + 3 * D)).await.unwrap();
    let second = engine.create_booking(stay(room, MAR_1 + D, MAR_1 + 2 * D)).await.unwrap();
    assert_ne!(first.id, second.id);

    set_status(&engine, first.id, BookingStatus::Confirmed).await.unwrap();
    let err = engine.create_booking(stay(room, MAR_1 + 2 * D, MAR_1 + 4 * D)).await.unwrap_err();
    assert!(matches!(err, EngineError::RoomUnavailable { conflict, .. } if conflict == first.id));

    // The overlapping PENDING booking can no longer be confirmed either.
    assert!(matches!(
        set_status(&engine, second.id, BookingStatus::Confirmed).await,
        Err(EngineError::RoomUnavailable { .. })
    ));
    assert_eq!(booking_status(&engine, second.id).await, BookingStatus::Pending);
}

#[tokio::test]
async fn same_day_turnover_is_allowed() {
    let (engine, _) = engine("turnover.wal");
    let room = seed_room(&engine, "202", "Deluxe", 500_000, 2).await;
    let first = engine.create_booking(stay(room, MAR_1, MAR_1 + 2 * D)).await.unwrap();
    set_status(&engine, first.id, BookingStatus::Confirmed).await.unwrap();

    let next = engine.create_booking(stay(room, MAR_1 + 2 * D, MAR_1 + 4 * D)).await.unwrap();
    set_status(&engine, next.id, BookingStatus::Confirmed).await.unwrap();
    let before = engine.create_booking(stay(room, MAR_1 - 2 * D, MAR_1)).await.unwrap();
    set_status(&engine, before.id, BookingStatus::Confirmed).await.unwrap();
}

#[tokio::test]
async fn free_windows_follow_active_bookings() {
    let (engine, _) = engine("free_windows.wal");
    let room = seed_room(&engine, "203", "Deluxe", 500_000, 2).await;
    let held = engine.create_booking(stay(room, MAR_1 + 2 * D, MAR_1 + 4 * D)).await.unwrap();
    engine.create_booking(stay(room, MAR_1 + 5 * D, MAR_1 + 6 * D)).await.unwrap();
    set_status(&engine, held.id, BookingStatus::Confirmed).await.unwrap();

    let free = engine.room_free_windows(room, MAR_1, MAR_1 + 7 * D).await.unwrap();
    assert_eq!(free, vec![Span::new(MAR_1, MAR_1 + 2 * D), Span::new(MAR_1 + 4 * D, MAR_1 + 7 * D)]);

    assert!(matches!(
        engine.room_free_windows(room, MAR_1, MAR_1 + 800 * D).await,
        Err(EngineError::LimitExceeded(_))
    ));
    assert!(matches!(
        engine.room_free_windows(room, MAR_1, MAR_1).await,
        Err(EngineError::InvalidField { .. })
    ));
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn full_lifecycle_reconciles_room() {
    let (engine, _) = engine("full_lifecycle.wal");
    let room = seed_room(&engine, "301", "Deluxe", 500_000, 2).await;
    let b = engine.create_booking(stay(room, MAR_1, MAR_1 + 2 * D)).await.unwrap();

    for next in [BookingStatus::Confirmed, BookingStatus::CheckedIn] {
        set_status(&engine, b.id, next).await.unwrap();
        assert_eq!(room_status(&engine, room).await, RoomStatus::Booked);
    }
    set_status(&engine, b.id, BookingStatus::CheckedOut).await.unwrap();
    assert_eq!(room_status(&engine, room).await, RoomStatus::Available);

    assert!(matches!(
        set_status(&engine, b.id, BookingStatus::Pending).await,
        Err(EngineError::InvalidTransition { from: BookingStatus::CheckedOut, to: BookingStatus::Pending })
    ));
    assert!(matches!(
        set_status(&engine, b.id, BookingStatus::Confirmed).await,
        Err(EngineError::InvalidTransition { .. })
    ));
    // Re-setting the current status is a no-op.
    assert_eq!(set_status(&engine, b.id, BookingStatus::CheckedOut).await.unwrap().status, BookingStatus::CheckedOut);
}

#[tokio::test]
async fn skipping_confirmation_is_rejected() {
    let (engine, _) = engine("skip_confirm.wal");
    let room = seed_room(&engine, "302", "Deluxe", 500_000, 2).await;
    let b = engine.create_booking(stay(room, MAR_1, MAR_1 + D)).await.unwrap();
    assert!(matches!(
        set_status(&engine, b.id, BookingStatus::CheckedIn).await,
        Err(EngineError::InvalidTransition { from: BookingStatus::Pending, to: BookingStatus::CheckedIn })
    ));
}

#[tokio::test]
async fn reopen_requires_policy() {
    let (engine, _, _) = engine_with("reopen.wal", TransitionPolicy { allow_reopen: true });
    let room = seed_room(&engine, "303", "Deluxe", 500_000, 2).await;
    let b = engine.create_booking(stay(room, MAR_1, MAR_1 + D)).await.unwrap();
    set_status(&engine, b.id, BookingStatus::Confirmed).await.unwrap();
    set_status(&engine, b.id, BookingStatus::CheckedIn).await.unwrap();
    set_status(&engine, b.id, BookingStatus::CheckedOut).await.unwrap();
    assert_eq!(room_status(&engine, room).await, RoomStatus::Available);

    set_status(&engine, b.id, BookingStatus::Confirmed).await.unwrap();
    assert_eq!(room_status(&engine, room).await, RoomStatus::Booked);

    let c = engine.create_booking(stay(room, MAR_1 + 3 * D, MAR_1 + 4 * D)).await.unwrap();
    set_status(&engine, c.id, BookingStatus::Cancelled).await.unwrap();
    set_status(&engine, c.id, BookingStatus::Pending).await.unwrap();
    assert_eq!(booking_status(&engine, c.id).await, BookingStatus::Pending);
}

#[tokio::test]
async fn release_keeps_staff_status_and_other_holders() {
    let (engine, _) = engine("release_rules.wal");
    let room = seed_room(&engine, "304", "Deluxe", 500_000, 2).await;
    let a = engine.create_booking(stay(room, MAR_1, MAR_1 + D)).await.unwrap();
    let b = engine.create_booking(stay(room, MAR_1 + 2 * D, MAR_1 + 3 * D)).await.unwrap();
    set_status(&engine, a.id, BookingStatus::Confirmed).await.unwrap();
    set_status(&engine, b.id, BookingStatus::Confirmed).await.unwrap();

    // Another active booking still holds the room.
    set_status(&engine, a.id, BookingStatus::Cancelled).await.unwrap();
    assert_eq!(room_status(&engine, room).await, RoomStatus::Booked);

    engine
        .update_room(room, RoomPatch { status: Some(RoomStatus::Cleaning), ..Default::default() })
        .await
        .unwrap();
    set_status(&engine, b.id, BookingStatus::Cancelled).await.unwrap();
    assert_eq!(room_status(&engine, room).await, RoomStatus::Cleaning);
}

#[tokio::test]
async fn update_moves_booking_with_its_payment() {
    let (engine, _) = engine("move_room.wal");
    let old_room = seed_room(&engine, "401", "Deluxe", 500_000, 2).await;
    let new_room = seed_room(&engine, "402", "Suite", 800_000, 3).await;
    let b = engine.create_booking(stay(old_room, MAR_1, MAR_1 + 2 * D)).await.unwrap();
    set_status(&engine, b.id, BookingStatus::Confirmed).await.unwrap();
    let payment = engine.create_payment(payment_req(b.id)).await.unwrap();

    let moved = engine
        .update_booking(
            b.id,
            BookingPatch { room_id: Some(new_room), guest_count: Some(3), ..Default::default() },
        )
        .await
        .unwrap();
    assert_eq!(moved.room_id, new_room);
    assert_eq!(moved.total_price, 1_600_000);
    assert_eq!(room_status(&engine, old_room).await, RoomStatus::Available);
    assert_eq!(room_status(&engine, new_room).await, RoomStatus::Booked);

    let view = engine.get_booking_by_id(b.id).await.unwrap();
    assert_eq!(view.room_name, "402");
    assert_eq!(view.payment.map(|p| p.id), Some(payment.id));
    assert_eq!(engine.get_payment_by_id(payment.id).await.unwrap().room_id, new_room);
}

#[tokio::test]
async fn open_payment_follows_booking_price() {
    let (engine, clock, path) = engine_with("reprice.wal", TransitionPolicy::default());
    let room = seed_room(&engine, "406", "Deluxe", 500_000, 2).await;
    let b = engine.create_booking(stay(room, MAR_1, MAR_1 + 2 * D)).await.unwrap();
    let payment = engine.create_payment(payment_req(b.id)).await.unwrap();
    assert_eq!(payment.amount, 1_000_000);

    let longer = engine
        .update_booking(b.id, BookingPatch { check_out: Some(MAR_1 + 3 * D), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(longer.total_price, 1_500_000);
    assert_eq!(engine.get_payment_by_id(payment.id).await.unwrap().payment.amount, 1_500_000);

    // Settled payments keep what was paid.
    engine.confirm_payment(payment.id, ConfirmPayment::default()).await.unwrap();
    engine
        .update_booking(b.id, BookingPatch { check_out: Some(MAR_1 + 4 * D), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(engine.get_payment_by_id(payment.id).await.unwrap().payment.amount, 1_500_000);
    assert!(matches!(
        engine
            .refund_payment(payment.id, RefundPayment { reason: "early leave".into(), amount: Some(1_500_001) })
            .await,
        Err(EngineError::RefundExceedsTotal { total: 1_500_000, .. })
    ));
    drop(engine);

    let reopened = open_engine(&path, TransitionPolicy::default(), &clock);
    assert_eq!(reopened.get_payment_by_id(payment.id).await.unwrap().payment.amount, 1_500_000);
}

#[tokio::test]
async fn update_checks_target_room() {
    let (engine, _) = engine("move_checks.wal");
    let small = seed_room(&engine, "403", "Single", 200_000, 1).await;
    let home = seed_room(&engine, "404", "Deluxe", 500_000, 2).await;
    let busy = seed_room(&engine, "405", "Deluxe", 500_000, 2).await;
    let b = engine.create_booking(stay(home, MAR_1, MAR_1 + 2 * D)).await.unwrap();
    let other = engine.create_booking(stay(busy, MAR_1 + D, MAR_1 + 3 * D)).await.unwrap();
    set_status(&engine, other.id, BookingStatus::Confirmed).await.unwrap();

    assert!(matches!(
        engine.update_booking(b.id, BookingPatch { room_id: Some(small), ..Default::default() }).await,
        Err(EngineError::CapacityExceeded { capacity: 1, requested: 2 })
    ));
    assert!(matches!(
        engine.update_booking(b.id, BookingPatch { room_id: Some(busy), ..Default::default() }).await,
        Err(EngineError::RoomUnavailable { .. })
    ));
    assert!(matches!(
        engine.update_booking(b.id, BookingPatch { guest_count: Some(5), ..Default::default() }).await,
        Err(EngineError::CapacityExceeded { .. })
    ));
    assert!(matches!(
        engine.update_booking(b.id, BookingPatch { room_id: Some(Ulid::new()), ..Default::default() }).await,
        Err(EngineError::NotFound(_))
    ));
    assert_eq!(engine.get_booking_by_id(b.id).await.unwrap().booking.room_id, home);
}

#[tokio::test]
async fn update_dates_reprices_and_allows_past() {
    let (engine, clock) = engine("redate.wal");
    let room = seed_room(&engine, "406", "Deluxe", 500_000, 2).await;
    let b = engine.create_booking(stay(room, MAR_1, MAR_1 + 2 * D)).await.unwrap();
    clock.store(MAR_1 + D, Ordering::SeqCst);

    let revised = engine
        .update_booking(
            b.id,
            BookingPatch {
                check_out: Some(MAR_1 + 4 * D),
                guest_email: Some(None),
                special_request: Some(Some("late arrival".into())),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(revised.stay, Span::new(MAR_1, MAR_1 + 4 * D));
    assert_eq!(revised.total_price, 2_000_000);
    assert_eq!(revised.guest_email, None);
    assert_eq!(revised.special_request.as_deref(), Some("late arrival"));
    assert_eq!(revised.updated_at, MAR_1 + D);

    assert!(matches!(
        engine.update_booking(b.id, BookingPatch { check_out: Some(MAR_1), ..Default::default() }).await,
        Err(EngineError::CheckOutNotAfterCheckIn)
    ));
}

#[tokio::test]
async fn delete_only_pending_or_cancelled() {
    let (engine, _) = engine("delete_rules.wal");
    let room = seed_room(&engine, "501", "Deluxe", 500_000, 2).await;
    let b = engine.create_booking(stay(room, MAR_1, MAR_1 + D)).await.unwrap();
    set_status(&engine, b.id, BookingStatus::Confirmed).await.unwrap();
    assert!(matches!(
        engine.delete_booking(b.id).await,
        Err(EngineError::BookingNotDeletable(BookingStatus::Confirmed))
    ));

    let p = engine.create_booking(stay(room, MAR_1 + 3 * D, MAR_1 + 4 * D)).await.unwrap();
    let payment = engine.create_payment(payment_req(p.id)).await.unwrap();
    engine.delete_booking(p.id).await.unwrap();
    assert!(matches!(engine.get_booking_by_id(p.id).await, Err(EngineError::NotFound(_))));
    assert!(matches!(engine.get_payment_by_id(payment.id).await, Err(EngineError::NotFound(_))));
    assert!(matches!(engine.delete_booking(p.id).await, Err(EngineError::NotFound(_))));

    set_status(&engine, b.id, BookingStatus::Cancelled).await.unwrap();
    engine.delete_booking(b.id).await.unwrap();
    assert_eq!(room_status(&engine, room).await, RoomStatus::Available);
}

#[tokio::test]
async fn deleting_last_pending_booking_frees_room() {
    let (engine, _) = engine("delete_frees.wal");
    let room = seed_room(&engine, "502", "Deluxe", 500_000, 2).await;
    let b = engine.create_booking(stay(room, MAR_1, MAR_1 + D)).await.unwrap();
    assert_eq!(room_status(&engine, room).await, RoomStatus::Booked);
    engine.delete_booking(b.id).await.unwrap();
    assert_eq!(room_status(&engine, room).await, RoomStatus::Available);
}

// ── Payments ─────────────────────────────────────────────

#[tokio::test]
async fn payment_confirm_then_refund() {
    let (engine, _) = engine("pay_refund.wal");
    let room = seed_room(&engine, "601", "Deluxe", 500_000, 2).await;
    let b = engine.create_booking(stay(room, MAR_1, MAR_1 + 2 * D)).await.unwrap();

    let payment = engine.create_payment(payment_req(b.id)).await.unwrap();
    assert_eq!(payment.amount, 1_000_000);
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert!(matches!(
        engine.create_payment(payment_req(b.id)).await,
        Err(EngineError::DuplicatePayment(id)) if id == b.id
    ));

    let confirmed = engine
        .confirm_payment(
            payment.id,
            ConfirmPayment {
                method: Some(PaymentMethod::CreditCard),
                payment_ref: Some("TXN-1".into()),
                paid_at: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(confirmed.status, PaymentStatus::Success);
    assert_eq!(confirmed.method, PaymentMethod::CreditCard);
    assert_eq!(confirmed.paid_at, Some(FEB_20_10AM));
    assert_eq!(booking_status(&engine, b.id).await, BookingStatus::Confirmed);
    assert_eq!(room_status(&engine, room).await, RoomStatus::Booked);
    assert!(matches!(
        engine.confirm_payment(payment.id, ConfirmPayment::default()).await,
        Err(EngineError::InvalidPaymentState { action: "confirm", status: PaymentStatus::Success })
    ));

    assert!(matches!(
        engine
            .refund_payment(payment.id, RefundPayment { reason: "overcharge".into(), amount: Some(1_000_001) })
            .await,
        Err(EngineError::RefundExceedsTotal { requested: 1_000_001, total: 1_000_000 })
    ));
    assert!(matches!(
        engine.refund_payment(payment.id, RefundPayment { reason: " ".into(), amount: None }).await,
        Err(EngineError::MissingField("reason"))
    ));

    let refunded = engine
        .refund_payment(payment.id, RefundPayment { reason: "trip cancelled".into(), amount: Some(400_000) })
        .await
        .unwrap();
    assert_eq!(refunded.status, PaymentStatus::Refunded);
    assert_eq!(refunded.refund_amount, Some(400_000));
    assert_eq!(refunded.note.as_deref(), Some("trip cancelled"));
    assert_eq!(booking_status(&engine, b.id).await, BookingStatus::Cancelled);
    assert_eq!(room_status(&engine, room).await, RoomStatus::Available);
    assert!(matches!(
        engine.delete_payment(payment.id).await,
        Err(EngineError::InvalidPaymentState { action: "delete", .. })
    ));
}

#[tokio::test]
async fn confirm_payment_fails_when_stay_taken() {
    let (engine, _) = engine("pay_conflict.wal");
    let room = seed_room(&engine, "602", "Deluxe", 500_000, 2).await;
    let a = engine.create_booking(stay(room, MAR_1, MAR_1 + 2 * D)).await.unwrap();
    let b = engine.create_booking(stay(room, MAR_1 + D, MAR_1 + 3 * D)).await.unwrap();
    let pa = engine.create_payment(payment_req(a.id)).await.unwrap();
    let pb = engine.create_payment(payment_req(b.id)).await.unwrap();

    engine.confirm_payment(pa.id, ConfirmPayment::default()).await.unwrap();
    assert!(matches!(
        engine.confirm_payment(pb.id, ConfirmPayment::default()).await,
        Err(EngineError::RoomUnavailable { conflict, .. }) if conflict == a.id
    ));
    let pb_now = engine.get_payment_by_id(pb.id).await.unwrap();
    assert_eq!(pb_now.payment.status, PaymentStatus::Pending);
    assert_eq!(pb_now.booking_status, BookingStatus::Pending);
}

#[tokio::test]
async fn cancel_payment_cascades_until_check_in() {
    let (engine, _) = engine("pay_cancel.wal");
    let room = seed_room(&engine, "603", "Deluxe", 500_000, 2).await;
    let b = engine.create_booking(stay(room, MAR_1, MAR_1 + D)).await.unwrap();
    let payment = engine.create_payment(payment_req(b.id)).await.unwrap();

    let cancelled = engine.cancel_payment(payment.id, Some("changed plans".into())).await.unwrap();
    assert_eq!(cancelled.status, PaymentStatus::Failed);
    assert_eq!(cancelled.note.as_deref(), Some("CANCELLED: changed plans"));
    assert_eq!(booking_status(&engine, b.id).await, BookingStatus::Cancelled);
    assert_eq!(room_status(&engine, room).await, RoomStatus::Available);
    assert!(matches!(
        engine.create_payment(payment_req(b.id)).await,
        Err(EngineError::DuplicatePayment(_))
    ));
    engine.delete_payment(payment.id).await.unwrap();
    assert!(matches!(
        engine.create_payment(payment_req(b.id)).await,
        Err(EngineError::BookingCancelled(_))
    ));

    let c = engine.create_booking(stay(room, MAR_1 + 2 * D, MAR_1 + 3 * D)).await.unwrap();
    set_status(&engine, c.id, BookingStatus::Confirmed).await.unwrap();
    set_status(&engine, c.id, BookingStatus::CheckedIn).await.unwrap();
    let late = engine.create_payment(payment_req(c.id)).await.unwrap();
    assert!(matches!(
        engine.cancel_payment(late.id, None).await,
        Err(EngineError::AlreadyCheckedIn(BookingStatus::CheckedIn))
    ));
}

#[tokio::test]
async fn payment_listing_and_filters() {
    let (engine, clock) = engine("pay_list.wal");
    let room = seed_room(&engine, "604", "Deluxe", 500_000, 2).await;
    let a = engine.create_booking(stay(room, MAR_1, MAR_1 + D)).await.unwrap();
    let b = engine.create_booking(stay(room, MAR_1 + 2 * D, MAR_1 + 3 * D)).await.unwrap();
    let pa = engine.create_payment(payment_req(a.id)).await.unwrap();
    clock.fetch_add(1_000, Ordering::SeqCst);
    let pb = engine.create_payment(payment_req(b.id)).await.unwrap();
    engine.confirm_payment(pb.id, ConfirmPayment::default()).await.unwrap();

    let all = engine.get_all_payments(None).await;
    assert_eq!(all.iter().map(|v| v.payment.id).collect::<Vec<_>>(), vec![pb.id, pa.id]);
    let pending = engine.get_all_payments(Some(PaymentStatus::Pending)).await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].payment.id, pa.id);
    assert_eq!(pending[0].guest_name, "Tran Thi B");
}

// ── Gateway ──────────────────────────────────────────────

#[tokio::test]
async fn gateway_success_is_idempotent() {
    let (engine, _) = engine("gateway_ok.wal");
    let room = seed_room(&engine, "701", "Deluxe", 500_000, 2).await;
    let b = engine.create_booking(stay(room, MAR_1, MAR_1 + D)).await.unwrap();

    let started = engine
        .begin_gateway_payment(b.id, Ulid::new(), "MOMO-1", Some("guest-1".into()))
        .await
        .unwrap();
    assert_eq!(started.method, PaymentMethod::MobilePayment);
    assert_eq!(started.status, PaymentStatus::Pending);
    assert_eq!(started.payment_ref.as_deref(), Some("MOMO-1"));

    let done = engine.apply_gateway_result("MOMO-1", true, Some("Successful.".into())).await.unwrap();
    assert_eq!(done.status, PaymentStatus::Success);
    assert_eq!(booking_status(&engine, b.id).await, BookingStatus::Confirmed);

    let again = engine.apply_gateway_result("MOMO-1", true, None).await.unwrap();
    assert_eq!(again, done);
    assert!(matches!(
        engine.apply_gateway_result("MOMO-1", false, None).await,
        Err(EngineError::InvalidPaymentState { action: "fail", .. })
    ));
    assert!(matches!(
        engine.apply_gateway_result("MOMO-404", true, None).await,
        Err(EngineError::PaymentRefNotFound(_))
    ));
    assert!(matches!(
        engine.begin_gateway_payment(b.id, Ulid::new(), "MOMO-2", None).await,
        Err(EngineError::InvalidPaymentState { action: "restart", .. })
    ));
}

#[tokio::test]
async fn gateway_failure_then_retry() {
    let (engine, _) = engine("gateway_retry.wal");
    let room = seed_room(&engine, "702", "Deluxe", 500_000, 2).await;
    let b = engine.create_booking(stay(room, MAR_1, MAR_1 + D)).await.unwrap();
    let other = engine.create_booking(stay(room, MAR_1 + 2 * D, MAR_1 + 3 * D)).await.unwrap();

    let first = engine.begin_gateway_payment(b.id, Ulid::new(), "MOMO-10", None).await.unwrap();
    let failed = engine
        .apply_gateway_result("MOMO-10", false, Some("Transaction denied".into()))
        .await
        .unwrap();
    assert_eq!(failed.status, PaymentStatus::Failed);
    assert_eq!(failed.note.as_deref(), Some("Transaction denied"));
    assert_eq!(booking_status(&engine, b.id).await, BookingStatus::Pending);

    assert!(matches!(
        engine.begin_gateway_payment(other.id, Ulid::new(), "MOMO-10", None).await,
        Err(EngineError::DuplicatePaymentRef(_))
    ));

    let retry = engine.begin_gateway_payment(b.id, Ulid::new(), "MOMO-11", None).await.unwrap();
    assert_eq!(retry.id, first.id);
    assert_eq!(retry.status, PaymentStatus::Pending);
    assert!(matches!(
        engine.apply_gateway_result("MOMO-10", true, None).await,
        Err(EngineError::PaymentRefNotFound(_))
    ));
    engine.apply_gateway_result("MOMO-11", true, None).await.unwrap();
    assert_eq!(booking_status(&engine, b.id).await, BookingStatus::Confirmed);
}

// ── Housekeeping ─────────────────────────────────────────

#[tokio::test]
async fn sweep_checks_out_expired_stays() {
    let (engine, clock) = engine("sweep.wal");
    let room = seed_room(&engine, "801", "Deluxe", 500_000, 2).await;
    let spare = seed_room(&engine, "802", "Deluxe", 500_000, 2).await;
    let expired = engine.create_booking(stay(room, MAR_1, MAR_1 + D)).await.unwrap();
    let pending = engine.create_booking(stay(spare, MAR_1, MAR_1 + D)).await.unwrap();
    let future = engine.create_booking(stay(room, MAR_1 + 5 * D, MAR_1 + 6 * D)).await.unwrap();
    set_status(&engine, expired.id, BookingStatus::Confirmed).await.unwrap();
    set_status(&engine, expired.id, BookingStatus::CheckedIn).await.unwrap();

    let now = MAR_1 + 2 * D;
    clock.store(now, Ordering::SeqCst);
    assert_eq!(engine.collect_rooms_with_expired_stays(now), vec![room]);
    let moved = engine.auto_check_out_expired_bookings(now).await.unwrap();
    assert_eq!(moved, vec![expired.id]);
    assert_eq!(booking_status(&engine, expired.id).await, BookingStatus::CheckedOut);
    assert_eq!(booking_status(&engine, pending.id).await, BookingStatus::Pending);
    assert_eq!(booking_status(&engine, future.id).await, BookingStatus::Pending);
    assert_eq!(room_status(&engine, room).await, RoomStatus::Available);

    assert!(engine.auto_check_out_expired_bookings(now).await.unwrap().is_empty());
}

#[tokio::test]
async fn sweep_leaves_room_held_by_later_stay() {
    let (engine, _) = engine("sweep_held.wal");
    let room = seed_room(&engine, "803", "Deluxe", 500_000, 2).await;
    let old = engine.create_booking(stay(room, MAR_1, MAR_1 + D)).await.unwrap();
    let next = engine.create_booking(stay(room, MAR_1 + D, MAR_1 + 3 * D)).await.unwrap();
    set_status(&engine, old.id, BookingStatus::Confirmed).await.unwrap();
    set_status(&engine, next.id, BookingStatus::Confirmed).await.unwrap();

    let moved = engine.auto_check_out_expired_bookings(MAR_1 + D + H).await.unwrap();
    assert_eq!(moved, vec![old.id]);
    assert_eq!(room_status(&engine, room).await, RoomStatus::Booked);
}

#[tokio::test]
async fn guest_cancels_own_pending_booking() {
    let (engine, _) = engine("guest_cancel.wal");
    let room = seed_room(&engine, "801", "Deluxe", 500_000, 2).await;
    let b = engine.create_booking(stay(room, MAR_1, MAR_1 + 2 * D)).await.unwrap();
    let payment = engine.create_payment(payment_req(b.id)).await.unwrap();

    assert!(matches!(
        engine.cancel_own_booking(b.id, "guest-2").await,
        Err(EngineError::NotBookingOwner(id)) if id == b.id
    ));
    assert_eq!(booking_status(&engine, b.id).await, BookingStatus::Pending);

    let cancelled = engine.cancel_own_booking(b.id, "guest-1").await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(room_status(&engine, room).await, RoomStatus::Available);
    let p = engine.get_payment_by_id(payment.id).await.unwrap();
    assert_eq!(p.payment.status, PaymentStatus::Failed);
    assert_eq!(p.booking_status, BookingStatus::Cancelled);

    assert!(matches!(
        engine.cancel_own_booking(b.id, "guest-1").await,
        Err(EngineError::NotGuestCancellable(BookingStatus::Cancelled))
    ));
    assert!(matches!(
        engine.cancel_own_booking(Ulid::new(), "guest-1").await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn guest_cannot_cancel_after_confirmation() {
    let (engine, _) = engine("guest_cancel_confirmed.wal");
    let room = seed_room(&engine, "802", "Deluxe", 500_000, 2).await;
    let b = engine.create_booking(stay(room, MAR_1, MAR_1 + D)).await.unwrap();
    let payment = engine.create_payment(payment_req(b.id)).await.unwrap();
    engine.confirm_payment(payment.id, ConfirmPayment::default()).await.unwrap();

    assert!(matches!(
        engine.cancel_own_booking(b.id, "guest-1").await,
        Err(EngineError::NotGuestCancellable(BookingStatus::Confirmed))
    ));
    assert_eq!(booking_status(&engine, b.id).await, BookingStatus::Confirmed);
    assert_eq!(
        engine.get_payment_by_id(payment.id).await.unwrap().payment.status,
        PaymentStatus::Success
    );
}

#[tokio::test]
async fn guest_cancel_without_payment() {
    let (engine, _) = engine("guest_cancel_unpaid.wal");
    let room = seed_room(&engine, "803", "Deluxe", 500_000, 2).await;
    let b = engine.create_booking(stay(room, MAR_1, MAR_1 + D)).await.unwrap();

    engine.cancel_own_booking(b.id, "guest-1").await.unwrap();
    let view = engine.get_booking_by_id(b.id).await.unwrap();
    assert_eq!(view.booking.status, BookingStatus::Cancelled);
    assert!(view.payment.is_none());
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_confirms_admit_one() {
    let (engine, _) = engine("race_confirm.wal");
    let engine = Arc::new(engine);
    let room = seed_room(&engine, "901", "Deluxe", 500_000, 2).await;

    let mut ids = Vec::new();
    for i in 0..8 {
        let b = engine
            .create_booking(stay(room, MAR_1 + i * H, MAR_1 + 2 * D))
            .await
            .unwrap();
        ids.push(b.id);
    }

    let handles: Vec<_> = ids
        .iter()
        .map(|id| {
            let engine = engine.clone();
            let id = *id;
            tokio::spawn(async move { set_status(&engine, id, BookingStatus::Confirmed).await })
        })
        .collect();

    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::RoomUnavailable { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    let confirmed = engine
        .get_all_bookings(&BookingFilter { status: Some(BookingStatus::Confirmed), user_id: None })
        .await;
    assert_eq!(confirmed.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cross_moves_do_not_deadlock() {
    let (engine, _) = engine("race_moves.wal");
    let engine = Arc::new(engine);
    let a = seed_room(&engine, "902", "Deluxe", 500_000, 2).await;
    let b = seed_room(&engine, "903", "Deluxe", 500_000, 2).await;
    let in_a = engine.create_booking(stay(a, MAR_1, MAR_1 + D)).await.unwrap();
    let in_b = engine.create_booking(stay(b, MAR_1 + 5 * D, MAR_1 + 6 * D)).await.unwrap();

    let e1 = engine.clone();
    let e2 = engine.clone();
    let t1 = tokio::spawn(async move {
        e1.update_booking(in_a.id, BookingPatch { room_id: Some(b), ..Default::default() }).await
    });
    let t2 = tokio::spawn(async move {
        e2.update_booking(in_b.id, BookingPatch { room_id: Some(a), ..Default::default() }).await
    });
    let (r1, r2) = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        (t1.await.unwrap(), t2.await.unwrap())
    })
    .await
    .expect("moves deadlocked");
    assert_eq!(r1.unwrap().room_id, b);
    assert_eq!(r2.unwrap().room_id, a);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_booking_id_on_two_rooms_commits_once() {
    let (engine, _) = engine("race_dup_id.wal");
    let engine = Arc::new(engine);
    let rooms = [
        seed_room(&engine, "904", "Deluxe", 500_000, 2).await,
        seed_room(&engine, "905", "Deluxe", 500_000, 2).await,
        seed_room(&engine, "906", "Deluxe", 500_000, 2).await,
        seed_room(&engine, "907", "Deluxe", 500_000, 2).await,
    ];

    for _ in 0..10 {
        let id = Ulid::new();
        let handles: Vec<_> = rooms
            .iter()
            .map(|room| {
                let engine = engine.clone();
                let req = NewBooking { id, ..stay(*room, MAR_1, MAR_1 + D) };
                tokio::spawn(async move { engine.create_booking(req).await })
            })
            .collect();

        let mut placed = Vec::new();
        for h in handles {
            match h.await.unwrap() {
                Ok(b) => placed.push(b.room_id),
                Err(EngineError::AlreadyExists(_)) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(placed.len(), 1);
        assert_eq!(engine.get_booking_by_id(id).await.unwrap().booking.room_id, placed[0]);
    }
    let all = engine.get_all_bookings(&BookingFilter::default()).await;
    assert_eq!(all.len(), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_payment_id_on_two_bookings_commits_once() {
    let (engine, _) = engine("race_dup_payment.wal");
    let engine = Arc::new(engine);
    let mut bookings = Vec::new();
    for name in ["908", "909", "910", "911"] {
        let room = seed_room(&engine, name, "Deluxe", 500_000, 2).await;
        bookings.push(engine.create_booking(stay(room, MAR_1, MAR_1 + D)).await.unwrap().id);
    }

    let id = Ulid::new();
    let handles: Vec<_> = bookings
        .iter()
        .map(|booking| {
            let engine = engine.clone();
            let req = NewPayment { id, ..payment_req(*booking) };
            tokio::spawn(async move { engine.create_payment(req).await })
        })
        .collect();

    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::AlreadyExists(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    engine.get_payment_by_id(id).await.unwrap();
}

#[tokio::test]
async fn failed_create_releases_its_id() {
    let (engine, _) = engine("release_id.wal");
    let room = seed_room(&engine, "912", "Deluxe", 500_000, 2).await;
    let mut req = stay(room, MAR_1, MAR_1 + D);
    req.guest_count = 9;
    assert!(matches!(engine.create_booking(req.clone()).await, Err(EngineError::CapacityExceeded { .. })));

    req.guest_count = 2;
    engine.create_booking(req).await.unwrap();
}

// ── Persistence ──────────────────────────────────────────

async fn snapshot(engine: &Engine) -> (Vec<RoomInfo>, Vec<BookingView>) {
    (
        engine.list_rooms(&RoomFilter::default()).await,
        engine.get_all_bookings(&BookingFilter::default()).await,
    )
}

async fn build_history(engine: &Engine) {
    let a = seed_room(engine, "A1", "Deluxe", 500_000, 2).await;
    let b = seed_room(engine, "B1", "Suite", 900_000, 4).await;
    let gone = seed_room(engine, "C1", "Single", 100_000, 1).await;
    engine.delete_room(gone).await.unwrap();

    let x = engine.create_booking(stay(a, MAR_1, MAR_1 + 2 * D)).await.unwrap();
    let y = engine.create_booking(stay(a, MAR_1 + 4 * D, MAR_1 + 5 * D)).await.unwrap();
    let z = engine.create_booking(stay(b, MAR_1, MAR_1 + D)).await.unwrap();
    let px = engine.create_payment(payment_req(x.id)).await.unwrap();
    engine.confirm_payment(px.id, ConfirmPayment::default()).await.unwrap();
    engine.update_booking(y.id, BookingPatch { room_id: Some(b), check_in: Some(MAR_1 + 3 * D), ..Default::default() }).await.unwrap();
    engine.begin_gateway_payment(z.id, Ulid::new(), "MOMO-R", None).await.unwrap();
    set_status(engine, z.id, BookingStatus::Cancelled).await.unwrap();
}

#[tokio::test]
async fn replay_restores_state_and_indexes() {
    let (engine, clock, path) = engine_with("replay.wal", TransitionPolicy::default());
    build_history(&engine).await;
    let before = snapshot(&engine).await;
    drop(engine);

    let reopened = open_engine(&path, TransitionPolicy::default(), &clock);
    let after = snapshot(&reopened).await;
    assert_eq!(before, after);
    assert_eq!(after.0.len(), 2);
    assert_eq!(after.1.len(), 3);

    // Indexes are rebuilt: lookups by booking, payment and reference work.
    for v in &after.1 {
        reopened.get_booking_by_id(v.booking.id).await.unwrap();
        if let Some(p) = &v.payment {
            reopened.get_payment_by_id(p.id).await.unwrap();
        }
    }
    assert!(matches!(
        reopened.apply_gateway_result("MOMO-R", true, None).await,
        Err(EngineError::BookingCancelled(_))
    ));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let (engine, clock, path) = engine_with("compact.wal", TransitionPolicy::default());
    build_history(&engine).await;
    assert!(engine.wal_appends_since_compact().await > 5);
    let size_before = std::fs::metadata(&path).unwrap().len();
    let before = snapshot(&engine).await;

    engine.compact_wal().await.unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 0);
    assert!(std::fs::metadata(&path).unwrap().len() < size_before);

    // Writes after compaction land after the snapshot.
    let extra = seed_room(&engine, "D1", "Deluxe", 500_000, 2).await;
    drop(engine);

    let reopened = open_engine(&path, TransitionPolicy::default(), &clock);
    let (rooms, bookings) = snapshot(&reopened).await;
    assert_eq!(bookings, before.1);
    assert_eq!(rooms.len(), before.0.len() + 1);
    assert!(rooms.iter().any(|r| r.id == extra));
}

#[tokio::test]
async fn commits_after_crash_recovery_survive_next_restart() {
    use std::io::Write;

    let (engine, clock, path) = engine_with("torn_restart.wal", TransitionPolicy::default());
    let first = seed_room(&engine, "201", "Standard", 300_000, 2).await;
    drop(engine);

    // Crash mid-write: a few bytes of a frame that never completed.
    std::fs::OpenOptions::new()
        .append(true)
        .open(&path)
        .unwrap()
        .write_all(&[40, 0, 0, 0, 7, 7])
        .unwrap();

    let recovered = open_engine(&path, TransitionPolicy::default(), &clock);
    let second = seed_room(&recovered, "202", "Standard", 300_000, 2).await;
    drop(recovered);

    let reopened = open_engine(&path, TransitionPolicy::default(), &clock);
    reopened.room_info(first).await.unwrap();
    reopened.room_info(second).await.unwrap();
}

// ── Catalog and projections ──────────────────────────────

#[tokio::test]
async fn room_catalog_operations() {
    let (engine, _) = engine("catalog.wal");
    let deluxe = seed_room(&engine, "110", "Deluxe", 500_000, 2).await;
    let family = seed_room(&engine, "120", "Family", 900_000, 4).await;
    let broken = seed_room(&engine, "130", "Penthouse", 5_000_000, 2).await;
    engine
        .update_room(broken, RoomPatch { status: Some(RoomStatus::Maintenance), ..Default::default() })
        .await
        .unwrap();

    assert_eq!(engine.room_types().await, vec!["Deluxe".to_string(), "Family".to_string()]);
    let big = engine.list_rooms(&RoomFilter { room_type: None, min_capacity: Some(3) }).await;
    assert_eq!(big.iter().map(|r| r.id).collect::<Vec<_>>(), vec![family]);

    let updated = engine
        .update_room(deluxe, RoomPatch { price: Some(550_000), name: Some("110A".into()), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(updated.price, 550_000);
    assert_eq!(updated.room_type, "Deluxe");

    let b = engine.create_booking(stay(deluxe, MAR_1, MAR_1 + D)).await.unwrap();
    assert_eq!(b.total_price, 550_000);
    assert!(matches!(engine.delete_room(deluxe).await, Err(EngineError::RoomHasBookings(_))));
    engine.delete_room(family).await.unwrap();
    assert!(matches!(engine.room_info(family).await, Err(EngineError::NotFound(_))));

    assert!(matches!(
        engine
            .create_room(NewRoom {
                id: deluxe,
                name: "dup".into(),
                room_type: "Deluxe".into(),
                price: 1,
                capacity: 1,
                status: None,
            })
            .await,
        Err(EngineError::AlreadyExists(_))
    ));
    assert!(matches!(
        engine
            .create_room(NewRoom {
                id: Ulid::new(),
                name: "bad".into(),
                room_type: "Deluxe".into(),
                price: 1,
                capacity: 0,
                status: None,
            })
            .await,
        Err(EngineError::InvalidField { field: "capacity", .. })
    ));
}

#[tokio::test]
async fn available_rooms_for_stay() {
    let (engine, _) = engine("available.wal");
    let r1 = seed_room(&engine, "210", "Deluxe", 500_000, 2).await;
    let r2 = seed_room(&engine, "220", "Deluxe", 500_000, 2).await;
    let r3 = seed_room(&engine, "230", "Deluxe", 500_000, 2).await;
    seed_room(&engine, "240", "Family", 900_000, 4).await;
    engine
        .update_room(r3, RoomPatch { status: Some(RoomStatus::Maintenance), ..Default::default() })
        .await
        .unwrap();
    let taken = engine.create_booking(stay(r1, MAR_1, MAR_1 + 2 * D)).await.unwrap();
    set_status(&engine, taken.id, BookingStatus::Confirmed).await.unwrap();

    let free = engine.available_rooms("Deluxe", MAR_1 + D, MAR_1 + 3 * D).await.unwrap();
    assert_eq!(free.iter().map(|r| r.id).collect::<Vec<_>>(), vec![r2]);
    let later = engine.available_rooms("Deluxe", MAR_1 + 2 * D, MAR_1 + 3 * D).await.unwrap();
    assert_eq!(later.len(), 2);
    assert!(matches!(
        engine.available_rooms("Deluxe", FEB_20_10AM - 2 * D, MAR_1).await,
        Err(EngineError::CheckInInPast)
    ));
}

#[tokio::test]
async fn booking_listing_filters_newest_first() {
    let (engine, clock) = engine("listing.wal");
    let room = seed_room(&engine, "310", "Deluxe", 500_000, 2).await;
    let first = engine.create_booking(stay(room, MAR_1, MAR_1 + D)).await.unwrap();
    clock.fetch_add(1_000, Ordering::SeqCst);
    let mut req = stay(room, MAR_1 + 2 * D, MAR_1 + 3 * D);
    req.user_id = "guest-2".into();
    let second = engine.create_booking(req).await.unwrap();

    let all = engine.get_all_bookings(&BookingFilter::default()).await;
    assert_eq!(all.iter().map(|v| v.booking.id).collect::<Vec<_>>(), vec![second.id, first.id]);
    let mine = engine
        .get_all_bookings(&BookingFilter { status: None, user_id: Some("guest-1".into()) })
        .await;
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].booking.id, first.id);
    set_status(&engine, first.id, BookingStatus::Cancelled).await.unwrap();
    let cancelled = engine
        .get_all_bookings(&BookingFilter { status: Some(BookingStatus::Cancelled), user_id: None })
        .await;
    assert_eq!(cancelled.len(), 1);
}

#[tokio::test]
async fn dashboard_totals() {
    let (engine, clock) = engine("dashboard.wal");
    let room = seed_room(&engine, "410", "Deluxe", 500_000, 2).await;
    seed_room(&engine, "420", "Family", 900_000, 4).await;

    let mut ids = Vec::new();
    for i in 0..6 {
        clock.fetch_add(1_000, Ordering::SeqCst);
        let mut req = stay(room, MAR_1 + i * 2 * D, MAR_1 + (i * 2 + 1) * D);
        req.user_id = format!("guest-{}", i % 3);
        ids.push(engine.create_booking(req).await.unwrap().id);
    }
    let paid = engine.create_payment(payment_req(ids[0])).await.unwrap();
    engine.confirm_payment(paid.id, ConfirmPayment::default()).await.unwrap();
    engine.create_payment(payment_req(ids[1])).await.unwrap();
    set_status(&engine, ids[2], BookingStatus::Cancelled).await.unwrap();

    let stats = engine.dashboard().await;
    assert_eq!(stats.room_count, 2);
    assert_eq!(stats.booking_count, 6);
    assert_eq!(stats.guest_count, 3);
    assert_eq!(stats.total_revenue, 500_000);
    let count = |s: BookingStatus| stats.bookings_by_status.iter().find(|(k, _)| *k == s).map(|(_, n)| *n);
    assert_eq!(count(BookingStatus::Pending), Some(4));
    assert_eq!(count(BookingStatus::Confirmed), Some(1));
    assert_eq!(count(BookingStatus::Cancelled), Some(1));
    assert_eq!(count(BookingStatus::CheckedOut), Some(0));
    assert_eq!(stats.recent_bookings.len(), 5);
    assert_eq!(stats.recent_bookings[0].booking.id, ids[5]);
}

#[tokio::test]
async fn room_prices_are_bounded() {
    let (engine, _) = engine("price_bound.wal");
    let over = NewRoom {
        id: Ulid::new(),
        name: "PH".into(),
        room_type: "Penthouse".into(),
        price: crate::limits::MAX_PRICE + 1,
        capacity: 2,
        status: None,
    };
    assert!(matches!(engine.create_room(over).await, Err(EngineError::LimitExceeded(_))));

    let room = seed_room(&engine, "PH1", "Penthouse", crate::limits::MAX_PRICE, 2).await;
    assert!(matches!(
        engine
            .update_room(room, RoomPatch { price: Some(i64::MAX), ..Default::default() })
            .await,
        Err(EngineError::LimitExceeded(_))
    ));
}

#[tokio::test]
async fn dashboard_revenue_at_price_ceiling() {
    let (engine, _) = engine("revenue_ceiling.wal");
    let a = seed_room(&engine, "PH1", "Penthouse", crate::limits::MAX_PRICE, 2).await;
    let b = seed_room(&engine, "PH2", "Penthouse", crate::limits::MAX_PRICE, 2).await;
    for room in [a, b] {
        let booking = engine.create_booking(stay(room, MAR_1, MAR_1 + D)).await.unwrap();
        let payment = engine.create_payment(payment_req(booking.id)).await.unwrap();
        engine.confirm_payment(payment.id, ConfirmPayment::default()).await.unwrap();
    }

    assert_eq!(engine.dashboard().await.total_revenue, 2 * crate::limits::MAX_PRICE);
}
