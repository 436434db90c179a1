//! Shared harness for the booking integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::panic)]

use chrono::Duration as ChronoDuration;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use teetime_booking::capacity::{CapacityFuture, CapacityStore, InMemoryCapacityStore, ReleaseOutcome, ReserveRequest};
use teetime_booking::error::{CapacityError, GatewayError};
use teetime_booking::idempotency::InMemoryIdempotencyStore;
use teetime_booking::payment::{ChargeOutcome, ChargeStatus, GatewayFuture, MockPaymentGateway, PaymentGateway, RefundReceipt};
use teetime_booking::repository::InMemoryBookingRepository;
use teetime_booking::types::{
    Booking, BookingId, BookingStatus, CapacityReservation, GameId, Money, ReservationId, SlotStatus, TimeSlot,
    TimeSlotId, UserId,
};
use teetime_booking::{BookingService, Config, StartBookingRequest, Stores, Watchdog, WatchdogSettings};
use teetime_testing::{test_instant, ManualClock};
use tokio::sync::Semaphore;

pub const PRICE_PER_PLAYER: i64 = 40_000;

pub fn config(pairs: &[(&str, &str)]) -> Config {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    Config::from_lookup(|key| map.get(key).cloned())
}

/// A booking service on in-memory stores with a manual clock.
pub struct Harness {
    pub service: Arc<BookingService>,
    pub capacity: Arc<InMemoryCapacityStore>,
    pub repository: Arc<InMemoryBookingRepository>,
    pub idempotency: Arc<InMemoryIdempotencyStore>,
    pub payments: Arc<MockPaymentGateway>,
    pub clock: Arc<ManualClock>,
    pub config: Config,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let capacity = Arc::new(InMemoryCapacityStore::new());
        let payments = Arc::new(MockPaymentGateway::new());
        Self::build(config, capacity.clone(), capacity, payments.clone(), payments)
    }

    /// Route payments through `gateway` while keeping the mock for inspection.
    pub fn with_gateway(config: Config, payments: Arc<MockPaymentGateway>, gateway: Arc<dyn PaymentGateway>) -> Self {
        let capacity = Arc::new(InMemoryCapacityStore::new());
        Self::build(config, capacity.clone(), capacity, payments, gateway)
    }

    /// Route capacity calls through `wrap(inner)`; returns the wrapper too.
    pub fn with_capacity<C: CapacityStore + 'static>(
        config: Config,
        wrap: impl FnOnce(Arc<InMemoryCapacityStore>) -> C,
    ) -> (Self, Arc<C>) {
        let capacity = Arc::new(InMemoryCapacityStore::new());
        let wrapper = Arc::new(wrap(capacity.clone()));
        let payments = Arc::new(MockPaymentGateway::new());
        let harness = Self::build(config, capacity, wrapper.clone(), payments.clone(), payments);
        (harness, wrapper)
    }

    fn build(
        config: Config,
        capacity: Arc<InMemoryCapacityStore>,
        capacity_port: Arc<dyn CapacityStore>,
        payments: Arc<MockPaymentGateway>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        let repository = Arc::new(InMemoryBookingRepository::new());
        let idempotency = Arc::new(InMemoryIdempotencyStore::new());
        let clock = Arc::new(ManualClock::new(test_instant()));
        let stores = Stores {
            capacity: capacity_port,
            catalog: capacity.clone(),
            repository: repository.clone(),
            idempotency: idempotency.clone(),
            payments: gateway,
        };
        let service = Arc::new(BookingService::new(stores, clock.clone(), &config));
        Self {
            service,
            capacity,
            repository,
            idempotency,
            payments,
            clock,
            config,
        }
    }

    pub fn watchdog(&self) -> Watchdog {
        Watchdog::new(
            self.service.saga_environment(),
            self.service.idempotency_guard(),
            WatchdogSettings::from(&self.config.watchdog),
        )
    }

    /// Publish a slot starting five days from the test instant.
    pub async fn publish(&self, max_players: u32) -> TimeSlotId {
        self.publish_at(ChronoDuration::days(5), max_players).await
    }

    pub async fn publish_at(&self, starts_in: ChronoDuration, max_players: u32) -> TimeSlotId {
        let starts_at = test_instant() + starts_in;
        let slot = TimeSlot::new(
            GameId::new(),
            starts_at,
            starts_at + ChronoDuration::hours(2),
            max_players,
            Money::won(PRICE_PER_PLAYER),
        );
        self.service.publish_slot(slot).await.unwrap().id
    }

    pub async fn booked(&self, time_slot_id: TimeSlotId) -> u32 {
        self.capacity.slot(time_slot_id).await.unwrap().booked_players
    }

    pub async fn slot_status(&self, time_slot_id: TimeSlotId) -> SlotStatus {
        self.capacity.slot(time_slot_id).await.unwrap().status
    }

    pub async fn booking(&self, booking_id: BookingId) -> Booking {
        self.service.get_booking(booking_id).await.unwrap()
    }

    /// Poll until the booking reaches `status` (real time, bounded).
    pub async fn wait_for_status(&self, booking_id: BookingId, status: BookingStatus) -> Booking {
        for _ in 0..500 {
            let booking = self.booking(booking_id).await;
            if booking.status == status {
                return booking;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("booking {booking_id} never reached {status}");
    }

    /// Poll until every detached saga of the service has settled.
    pub async fn wait_for_idle_sagas(&self) {
        for _ in 0..500 {
            if self.service.running_sagas() == 0 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("sagas still running");
    }
}

/// Poll until the gateway has captured a charge for the booking.
pub async fn wait_for_capture(payments: &MockPaymentGateway, booking_id: BookingId) -> Money {
    for _ in 0..500 {
        if let Some(amount) = payments.captured(booking_id) {
            return amount;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("booking {booking_id} was never charged");
}

pub fn request(time_slot_id: TimeSlotId, user_id: UserId, player_count: u32, key: &str) -> StartBookingRequest {
    StartBookingRequest {
        user_id,
        time_slot_id,
        player_count,
        idempotency_key: key.to_string(),
    }
}

/// Payment gateway whose charges block until the gate opens.
pub struct GatedGateway {
    inner: Arc<MockPaymentGateway>,
    gate: Semaphore,
    hold_replies: bool,
}

impl GatedGateway {
    pub fn new(inner: Arc<MockPaymentGateway>) -> Self {
        Self {
            inner,
            gate: Semaphore::new(0),
            hold_replies: false,
        }
    }

    /// Charges reach the gateway at once; only the answer waits for the gate.
    pub fn holding_replies(inner: Arc<MockPaymentGateway>) -> Self {
        Self {
            hold_replies: true,
            ..Self::new(inner)
        }
    }

    pub fn open(&self) {
        self.gate.add_permits(1_000);
    }
}

impl PaymentGateway for GatedGateway {
    fn charge(&self, booking_id: BookingId, amount: Money) -> GatewayFuture<'_, ChargeOutcome> {
        Box::pin(async move {
            if self.hold_replies {
                let reply = self.inner.charge(booking_id, amount).await;
                let _permit = self
                    .gate
                    .acquire()
                    .await
                    .map_err(|err| GatewayError::Transient(err.to_string()))?;
                return reply;
            }
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|err| GatewayError::Transient(err.to_string()))?;
            self.inner.charge(booking_id, amount).await
        })
    }

    fn refund(&self, booking_id: BookingId, amount: Money) -> GatewayFuture<'_, RefundReceipt> {
        self.inner.refund(booking_id, amount)
    }

    fn charge_status(&self, booking_id: BookingId) -> GatewayFuture<'_, ChargeStatus> {
        self.inner.charge_status(booking_id)
    }
}

/// Capacity store that fails selected operations a set number of times.
pub struct FlakyCapacity {
    inner: Arc<InMemoryCapacityStore>,
    reserve_failures: AtomicU32,
    release_failures: AtomicU32,
    pub reserve_calls: AtomicU32,
    pub release_calls: AtomicU32,
}

impl FlakyCapacity {
    pub fn new(inner: Arc<InMemoryCapacityStore>, reserve_failures: u32, release_failures: u32) -> Self {
        Self {
            inner,
            reserve_failures: AtomicU32::new(reserve_failures),
            release_failures: AtomicU32::new(release_failures),
            reserve_calls: AtomicU32::new(0),
            release_calls: AtomicU32::new(0),
        }
    }

    fn should_fail(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

impl CapacityStore for FlakyCapacity {
    fn publish(&self, slot: TimeSlot) -> CapacityFuture<'_, TimeSlot> {
        self.inner.publish(slot)
    }

    fn slot(&self, time_slot_id: TimeSlotId) -> CapacityFuture<'_, TimeSlot> {
        self.inner.slot(time_slot_id)
    }

    fn set_status(&self, time_slot_id: TimeSlotId, status: SlotStatus) -> CapacityFuture<'_, TimeSlot> {
        self.inner.set_status(time_slot_id, status)
    }

    fn reserve(&self, request: ReserveRequest) -> CapacityFuture<'_, CapacityReservation> {
        self.reserve_calls.fetch_add(1, Ordering::SeqCst);
        if Self::should_fail(&self.reserve_failures) {
            return Box::pin(async { Err(CapacityError::Unavailable("connection reset".to_string())) });
        }
        self.inner.reserve(request)
    }

    fn commit(&self, reservation_id: ReservationId) -> CapacityFuture<'_, CapacityReservation> {
        self.inner.commit(reservation_id)
    }

    fn release(&self, reservation_id: ReservationId) -> CapacityFuture<'_, ReleaseOutcome> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        if Self::should_fail(&self.release_failures) {
            return Box::pin(async { Err(CapacityError::Unavailable("connection reset".to_string())) });
        }
        self.inner.release(reservation_id)
    }

    fn release_for_booking(&self, booking_id: BookingId) -> CapacityFuture<'_, ReleaseOutcome> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        if Self::should_fail(&self.release_failures) {
            return Box::pin(async { Err(CapacityError::Unavailable("connection reset".to_string())) });
        }
        self.inner.release_for_booking(booking_id)
    }

    fn cancel_committed(&self, booking_id: BookingId) -> CapacityFuture<'_, ReleaseOutcome> {
        self.inner.cancel_committed(booking_id)
    }

    fn reservation_for_booking(&self, booking_id: BookingId) -> CapacityFuture<'_, Option<CapacityReservation>> {
        self.inner.reservation_for_booking(booking_id)
    }

    fn ping(&self) -> CapacityFuture<'_, ()> {
        self.inner.ping()
    }
}
