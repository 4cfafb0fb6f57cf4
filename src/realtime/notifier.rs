use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

use super::events::{RealtimeEvent, Room};

/// Delivery failures towards the relay. These never become [`AppError`]s:
/// a write that committed stays committed.
///
/// [`AppError`]: crate::error::AppError
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay is not connected")]
    NotConnected,
    #[error("relay outbound queue is full")]
    Backpressure,
    #[error("relay connection is closed")]
    Closed,
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("relay transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn emit(&self, room: &Room, event: &RealtimeEvent) -> Result<(), RelayError>;
}

/// How many addressed emissions reached the relay and how many were lost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub sent: usize,
    pub failed: usize,
}

impl DeliveryReport {
    pub fn merge(self, other: DeliveryReport) -> Self {
        Self {
            sent: self.sent + other.sent,
            failed: self.failed + other.failed,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

/// A value whose store writes are durable, paired with what happened to the
/// realtime notifications about it.
#[derive(Debug, Clone, Serialize)]
pub struct Committed<T> {
    #[serde(flatten)]
    pub value: T,
    pub delivery: DeliveryReport,
}

impl<T> Committed<T> {
    pub fn new(value: T, delivery: DeliveryReport) -> Self {
        Self { value, delivery }
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

/// Emits every `(room, event)` pair concurrently. No ordering is implied
/// between rooms.
pub async fn fan_out(
    notifier: &dyn Notifier,
    emissions: &[(Room, RealtimeEvent)],
) -> DeliveryReport {
    let results = join_all(
        emissions
            .iter()
            .map(|(room, event)| notifier.emit(room, event)),
    )
    .await;

    let mut report = DeliveryReport::default();
    for ((room, event), result) in emissions.iter().zip(results) {
        match result {
            Ok(()) => report.sent += 1,
            Err(e) => {
                report.failed += 1;
                tracing::warn!("Failed to emit {} to {}: {}", event.name(), room, e);
            }
        }
    }
    report
}

/// Records emissions in memory. Can be switched offline to simulate an
/// unreachable relay.
#[derive(Default)]
pub struct MemoryNotifier {
    emitted: Mutex<Vec<(Room, RealtimeEvent)>>,
    offline: AtomicBool,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub async fn emitted(&self) -> Vec<(Room, RealtimeEvent)> {
        self.emitted.lock().await.clone()
    }

    pub async fn emitted_to(&self, room: &Room) -> Vec<RealtimeEvent> {
        self.emitted
            .lock()
            .await
            .iter()
            .filter(|(r, _)| r == room)
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Rooms that received an event with the given name, in emission order.
    pub async fn rooms_for(&self, event_name: &str) -> Vec<Room> {
        self.emitted
            .lock()
            .await
            .iter()
            .filter(|(_, event)| event.name() == event_name)
            .map(|(room, _)| room.clone())
            .collect()
    }

    pub async fn clear(&self) {
        self.emitted.lock().await.clear();
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn emit(&self, room: &Room, event: &RealtimeEvent) -> Result<(), RelayError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RelayError::NotConnected);
        }
        event.validate().map_err(|e| RelayError::Transport(e.to_string()))?;
        self.emitted.lock().await.push((room.clone(), event.clone()));
        Ok(())
    }
}
