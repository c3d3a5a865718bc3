mod availability;
mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod payments;
mod queries;
#[cfg(test)]
mod tests;

pub use availability::{free_windows, merge_overlapping, subtract_intervals};
pub use conflict::{calculate_nights, day_of, is_room_available, validate_stay};
pub use error::{EngineError, ErrorKind};
pub use lifecycle::TransitionPolicy;

use std::hash::Hash;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::limits::MAX_LOCK_RETRIES;
use crate::model::*;
use crate::wal::{Frame, Wal};

pub type SharedRoomState = Arc<RwLock<RoomState>>;

/// Source of "now". Tests pin it; production reads the system clock.
pub type Clock = Arc<dyn Fn() -> Ms + Send + Sync>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        frame: Frame,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        frames: Vec<Frame>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Frame, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Each wake-up takes every append already queued and commits
/// them with one fsync; compaction and stats requests are served in order.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (frame, response) = match cmd {
            WalCommand::Append { frame, response } => (frame, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(frame, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { frame, response }) => batch.push((frame, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!(path = %wal.path().display(), frames = batch.len(), "WAL flush failed: {e}");
        }
        respond_batch(batch, &result);

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err = None;
    for (frame, _) in batch {
        if let Err(e) = wal.append_buffered(frame) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so stray bytes do not ride along with the next batch.
    let flush_err = wal.flush_sync().err();
    match append_err.or(flush_err) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { frames, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &frames).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {
            tracing::error!("append routed to the non-append handler; dropped");
        }
    }
}

// ── Locked room sets ─────────────────────────────────────

/// Write guards for every room an operation touches, acquired in id order.
pub(crate) struct LockedRooms {
    guards: Vec<OwnedRwLockWriteGuard<RoomState>>,
}

impl LockedRooms {
    fn empty() -> Self {
        Self { guards: Vec::new() }
    }

    pub(crate) fn get(&self, id: &Ulid) -> Option<&RoomState> {
        self.guards.iter().map(|g| &**g).find(|rs| rs.id == *id)
    }

    pub(crate) fn get_mut(&mut self, id: &Ulid) -> Option<&mut RoomState> {
        self.guards.iter_mut().map(|g| &mut **g).find(|rs| rs.id == *id)
    }

    pub(crate) fn require(&self, id: &Ulid) -> Result<&RoomState, EngineError> {
        self.get(id).ok_or(EngineError::NotFound(*id))
    }
}

// ── Index reservations ───────────────────────────────────

/// A key claimed in one of the engine's unique indexes ahead of its commit.
/// Room locks alone do not cover ids and references that span rooms; the
/// claim is dropped again unless the operation commits and calls `keep`.
pub(super) struct Reservation<'a, K: Eq + Hash> {
    index: &'a DashMap<K, Ulid>,
    key: Option<K>,
}

impl<'a, K: Eq + Hash + Clone> Reservation<'a, K> {
    /// Claim an unused `key` for `owner`. `None` when the key is taken.
    fn claim_new(index: &'a DashMap<K, Ulid>, key: K, owner: Ulid) -> Option<Self> {
        match index.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(v) => {
                v.insert(owner);
                Some(Self { index, key: Some(key) })
            }
        }
    }

    /// Like `claim_new`, but a key `owner` already holds is accepted as is.
    fn claim_for(index: &'a DashMap<K, Ulid>, key: K, owner: Ulid) -> Option<Self> {
        if index.get(&key).is_some_and(|e| *e.value() == owner) {
            return Some(Self { index, key: None });
        }
        Self::claim_new(index, key, owner)
    }

    pub(super) fn keep(mut self) {
        self.key = None;
    }
}

impl<K: Eq + Hash> Drop for Reservation<'_, K> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.index.remove(&key);
        }
    }
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedRoomState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// booking id → room id
    pub(super) booking_rooms: DashMap<Ulid, Ulid>,
    /// payment id → booking id
    pub(super) payment_bookings: DashMap<Ulid, Ulid>,
    /// gateway reference → payment id
    pub(super) payment_refs: DashMap<String, Ulid>,
    /// Serializes room creation against compaction snapshots.
    pub(super) catalog: Mutex<()>,
    pub(super) policy: TransitionPolicy,
    clock: Clock,
}

impl Engine {
    pub fn new(wal_path: PathBuf, policy: TransitionPolicy) -> io::Result<Self> {
        Self::with_clock(wal_path, policy, Arc::new(conflict::now_ms))
    }

    pub fn with_clock(wal_path: PathBuf, policy: TransitionPolicy, clock: Clock) -> io::Result<Self> {
        let frames = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            booking_rooms: DashMap::new(),
            payment_bookings: DashMap::new(),
            payment_refs: DashMap::new(),
            catalog: Mutex::new(()),
            policy,
            clock,
        };

        // Sole owner of every Arc here, so try_write_owned never contends. Blocking
        // locks are off limits: lazy tenant creation runs this inside the runtime.
        let frame_count = frames.len();
        for event in frames.into_iter().flatten() {
            let mut rooms = LockedRooms::empty();
            for id in event.room_ids() {
                if let Some(arc) = engine.get_room(&id) {
                    let guard = arc
                        .try_write_owned()
                        .map_err(|_| io::Error::other("replay: room lock contended"))?;
                    rooms.guards.push(guard);
                }
            }
            engine.apply(&mut rooms, &event);
        }
        if frame_count > 0 {
            tracing::info!(
                path = %wal_path.display(),
                frames = frame_count,
                rooms = engine.state.len(),
                bookings = engine.booking_rooms.len(),
                "replayed WAL"
            );
        }

        Ok(engine)
    }

    pub fn now(&self) -> Ms {
        (self.clock)()
    }

    pub fn policy(&self) -> TransitionPolicy {
        self.policy
    }

    pub fn get_room(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    /// Claim a new booking id for `room_id`.
    pub(super) fn reserve_booking_id(&self, id: Ulid, room_id: Ulid) -> Result<Reservation<'_, Ulid>, EngineError> {
        Reservation::claim_new(&self.booking_rooms, id, room_id).ok_or(EngineError::AlreadyExists(id))
    }

    /// Claim a new payment id for `booking_id`.
    pub(super) fn reserve_payment_id(&self, id: Ulid, booking_id: Ulid) -> Result<Reservation<'_, Ulid>, EngineError> {
        Reservation::claim_new(&self.payment_bookings, id, booking_id).ok_or(EngineError::AlreadyExists(id))
    }

    /// Claim a gateway reference for `payment_id`. Succeeds without a new
    /// claim when the payment already holds it.
    pub(super) fn reserve_payment_ref(
        &self,
        payment_ref: &str,
        payment_id: Ulid,
    ) -> Result<Reservation<'_, String>, EngineError> {
        Reservation::claim_for(&self.payment_refs, payment_ref.to_string(), payment_id)
            .ok_or_else(|| EngineError::DuplicatePaymentRef(payment_ref.to_string()))
    }

    pub fn room_of_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_rooms.get(booking_id).map(|e| *e.value())
    }

    /// Write a frame through the group-commit writer and wait until it is durable.
    async fn wal_append(&self, frame: Frame) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { frame, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Persist one operation's events as a single frame, then apply them.
    /// Callers hold the write locks of every room the events touch.
    pub(super) async fn commit(
        &self,
        rooms: &mut LockedRooms,
        events: Vec<Event>,
    ) -> Result<(), EngineError> {
        if events.is_empty() {
            return Ok(());
        }
        self.wal_append(events.clone()).await?;
        for event in &events {
            self.apply(rooms, event);
        }
        Ok(())
    }

    fn apply(&self, rooms: &mut LockedRooms, event: &Event) {
        match event {
            Event::RoomCreated {
                id,
                name,
                room_type,
                price,
                capacity,
                status,
            } => {
                let rs = RoomState::new(*id, name.clone(), room_type.clone(), *price, *capacity, *status);
                self.state.insert(*id, Arc::new(RwLock::new(rs)));
            }
            Event::RoomDeleted { id } => {
                if let Some(rs) = rooms.get(id) {
                    for b in &rs.bookings {
                        self.booking_rooms.remove(&b.id);
                    }
                    for p in rs.payments.values() {
                        self.unindex_payment(p);
                    }
                }
                self.state.remove(id);
            }
            Event::RoomUpdated {
                id,
                name,
                room_type,
                price,
                capacity,
            } => {
                if let Some(rs) = room_mut(rooms, id) {
                    rs.name = name.clone();
                    rs.room_type = room_type.clone();
                    rs.price = *price;
                    rs.capacity = *capacity;
                }
            }
            Event::RoomStatusSet { id, status } => {
                if let Some(rs) = room_mut(rooms, id) {
                    rs.status = *status;
                }
            }
            Event::BookingPlaced { booking } => {
                if let Some(rs) = room_mut(rooms, &booking.room_id) {
                    rs.insert_booking(booking.clone());
                    self.booking_rooms.insert(booking.id, booking.room_id);
                }
            }
            Event::BookingRevised { booking, from_room } => {
                let payment = room_mut(rooms, from_room).and_then(|rs| {
                    rs.remove_booking(booking.id);
                    if *from_room != booking.room_id {
                        rs.payments.remove(&booking.id)
                    } else {
                        None
                    }
                });
                if let Some(rs) = room_mut(rooms, &booking.room_id) {
                    rs.insert_booking(booking.clone());
                    if let Some(p) = payment {
                        rs.payments.insert(booking.id, p);
                    }
                    self.booking_rooms.insert(booking.id, booking.room_id);
                }
            }
            Event::BookingRemoved { id, room_id } => {
                if let Some(rs) = room_mut(rooms, room_id) {
                    rs.remove_booking(*id);
                    if let Some(p) = rs.payments.remove(id) {
                        self.unindex_payment(&p);
                    }
                }
                self.booking_rooms.remove(id);
            }
            Event::PaymentRecorded { room_id, payment } => {
                if let Some(rs) = room_mut(rooms, room_id) {
                    if let Some(old) = rs.payments.insert(payment.booking_id, payment.clone()) {
                        self.unindex_payment(&old);
                    }
                    self.payment_bookings.insert(payment.id, payment.booking_id);
                    if let Some(r) = &payment.payment_ref {
                        self.payment_refs.insert(r.clone(), payment.id);
                    }
                }
            }
            Event::PaymentRemoved {
                booking_id,
                room_id,
                ..
            } => {
                if let Some(rs) = room_mut(rooms, room_id)
                    && let Some(p) = rs.payments.remove(booking_id)
                {
                    self.unindex_payment(&p);
                }
            }
        }
    }

    fn unindex_payment(&self, payment: &Payment) {
        self.payment_bookings.remove(&payment.id);
        if let Some(r) = &payment.payment_ref {
            self.payment_refs.remove_if(r, |_, pid| *pid == payment.id);
        }
    }

    /// Lock rooms in ascending id order and confirm none was deleted while waiting.
    pub(super) async fn lock_rooms(&self, ids: &[Ulid]) -> Result<LockedRooms, EngineError> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();
        let mut rooms = LockedRooms::empty();
        for id in ids {
            let arc = self.get_room(&id).ok_or(EngineError::NotFound(id))?;
            let guard = arc.clone().write_owned().await;
            let still_present = self
                .state
                .get(&id)
                .is_some_and(|e| Arc::ptr_eq(e.value(), &arc));
            if !still_present {
                return Err(EngineError::NotFound(id));
            }
            rooms.guards.push(guard);
        }
        Ok(rooms)
    }

    /// Lock the room holding `booking_id` (plus `extra_room`, if any).
    /// Retries when the booking moved rooms between lookup and lock.
    pub(super) async fn lock_booking(
        &self,
        booking_id: Ulid,
        extra_room: Option<Ulid>,
    ) -> Result<(LockedRooms, Ulid), EngineError> {
        for _ in 0..MAX_LOCK_RETRIES {
            let room_id = self
                .room_of_booking(&booking_id)
                .ok_or(EngineError::NotFound(booking_id))?;
            let mut ids = vec![room_id];
            ids.extend(extra_room);
            let rooms = self.lock_rooms(&ids).await?;
            if rooms.get(&room_id).is_some_and(|rs| rs.booking(&booking_id).is_some()) {
                return Ok((rooms, room_id));
            }
        }
        Err(EngineError::NotFound(booking_id))
    }

    /// Lock the room holding `payment_id`; returns (rooms, room id, booking id).
    pub(super) async fn lock_payment(
        &self,
        payment_id: Ulid,
    ) -> Result<(LockedRooms, Ulid, Ulid), EngineError> {
        for _ in 0..MAX_LOCK_RETRIES {
            let booking_id = self
                .payment_bookings
                .get(&payment_id)
                .map(|e| *e.value())
                .ok_or(EngineError::NotFound(payment_id))?;
            let (rooms, room_id) = match self.lock_booking(booking_id, None).await {
                Ok(found) => found,
                Err(EngineError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let current = rooms
                .get(&room_id)
                .and_then(|rs| rs.payments.get(&booking_id))
                .is_some_and(|p| p.id == payment_id);
            if current {
                return Ok((rooms, room_id, booking_id));
            }
        }
        Err(EngineError::NotFound(payment_id))
    }
}

fn room_mut<'a>(rooms: &'a mut LockedRooms, id: &Ulid) -> Option<&'a mut RoomState> {
    let rs = rooms.get_mut(id);
    if rs.is_none() {
        tracing::warn!(room = %id, "event for a room that is not locked or no longer exists");
    }
    rs
}
