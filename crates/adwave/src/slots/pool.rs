//! Slot pool: admission control for voice-cloning capacity.
//!
//! Capacity never exceeds N even under racing requests. Reservations are
//! capacity-gated too, so at most N tickets are outstanding at once. The
//! reserve-then-acquire split lets the slow external clone call run between
//! ticket grant and slot commit without holding pool capacity hostage.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::store::{SlotStore, StoreError, StoreOp};
use super::{ReservationId, ReservationMeta, SlotMeta, SlotStatus, slot_key};

#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    #[error("reservation missing, expired, or already consumed")]
    InvalidReservation,
    #[error("no slot capacity available")]
    Exhausted,
    #[error("slot acquisition timed out under contention")]
    Timeout,
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct SlotPool {
    store: Arc<dyn SlotStore>,
    max_slots: usize,
    slot_ttl: Duration,
}

impl SlotPool {
    pub fn new(store: Arc<dyn SlotStore>, max_slots: usize, slot_ttl: Duration) -> Self {
        Self {
            store,
            max_slots,
            slot_ttl,
        }
    }

    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    /// With a ticket: true iff the reservation still exists and is unexpired.
    /// Without: true iff slot count is below capacity after lazy reclamation.
    ///
    /// Store errors read as unavailable.
    pub async fn has_available_slot(&self, reservation: Option<&ReservationId>) -> bool {
        if let Some(reservation) = reservation {
            return match self.store.get(&reservation.store_key()).await {
                Ok(entry) => entry.is_some(),
                Err(e) => {
                    tracing::error!(error = %e, "Error validating reservation");
                    false
                }
            };
        }

        self.cleanup_expired().await;
        match self.store.slot_ids().await {
            Ok(slots) => slots.len() < self.max_slots,
            Err(e) => {
                tracing::error!(error = %e, "Error checking slot availability");
                false
            }
        }
    }

    /// Slots still free after lazy reclamation.
    pub async fn available_slots(&self) -> usize {
        self.cleanup_expired().await;
        match self.store.slot_ids().await {
            Ok(slots) => self.max_slots.saturating_sub(slots.len()),
            Err(e) => {
                tracing::error!(error = %e, "Error counting slots");
                0
            }
        }
    }

    /// True iff a reservation could currently be granted: active slots plus
    /// outstanding tickets below capacity, after lazy reclamation.
    pub async fn can_reserve(&self) -> bool {
        self.cleanup_expired().await;
        let counts = async {
            let slots = self.store.slot_ids().await?.len();
            let outstanding = self.store.reservation_count().await?;
            Ok::<_, StoreError>(slots + outstanding)
        };
        match counts.await {
            Ok(used) => used < self.max_slots,
            Err(e) => {
                tracing::error!(error = %e, "Error checking reservation capacity");
                false
            }
        }
    }

    /// Issue a reservation ticket if capacity currently appears available.
    ///
    /// Check-then-act: reclaim, take a watch token, re-verify capacity
    /// (active slots plus outstanding tickets), conditionally commit. Returns
    /// `None` on contention, exhaustion, or store error - the caller decides
    /// whether to retry.
    pub async fn reserve(&self, ttl: Duration) -> Option<ReservationId> {
        self.cleanup_expired().await;

        let result: Result<Option<ReservationId>, StoreError> = async {
            let watched = self.store.watch().await?;

            let slots = self.store.slot_ids().await?;
            let outstanding = self.store.reservation_count().await?;
            if slots.len() + outstanding >= self.max_slots {
                return Ok(None);
            }

            let reservation_id = ReservationId::generate();
            let now = chrono::Utc::now().timestamp();
            let meta = ReservationMeta {
                reservation_id: reservation_id.clone(),
                created_at: now,
                expires_at: now + ttl.as_secs() as i64,
            };
            let value = encode_meta(&meta)?;

            let committed = self
                .store
                .txn(
                    watched,
                    vec![StoreOp::SetEx {
                        key: reservation_id.store_key(),
                        value,
                        ttl,
                    }],
                )
                .await?;
            if !committed {
                tracing::debug!("Reservation aborted on concurrent mutation");
                return Ok(None);
            }

            tracing::info!(reservation = %reservation_id, "Created reservation");
            Ok(Some(reservation_id))
        }
        .await;

        match result {
            Ok(ticket) => ticket,
            Err(e) => {
                tracing::error!(error = %e, "Error reserving slot");
                None
            }
        }
    }

    /// Consume a ticket and commit a slot for `voice_id`, atomically.
    ///
    /// One transaction inserts the slot-set member, deletes the ticket, and
    /// writes slot metadata with the slot TTL. Observed concurrent mutation
    /// retries the check-then-commit loop until `timeout`, failing closed.
    ///
    /// The returned guard releases the slot on every exit path.
    pub async fn acquire(
        &self,
        voice_id: &str,
        reservation: &ReservationId,
        timeout: Duration,
    ) -> Result<SlotGuard, AcquireError> {
        let deadline = Instant::now() + timeout;
        let reservation_key = reservation.store_key();

        loop {
            self.cleanup_expired().await;
            let watched = self.store.watch().await?;

            if self.store.get(&reservation_key).await?.is_none() {
                return Err(AcquireError::InvalidReservation);
            }

            let slots = self.store.slot_ids().await?;
            if slots.len() >= self.max_slots {
                return Err(AcquireError::Exhausted);
            }

            let now = chrono::Utc::now().timestamp();
            let meta = SlotMeta {
                voice_id: voice_id.to_string(),
                status: SlotStatus::Pending,
                created_at: now,
                expires_at: now + self.slot_ttl.as_secs() as i64,
                reservation_id: reservation.clone(),
                updated_at: None,
            };
            let value = encode_meta(&meta)?;

            let ops = vec![
                StoreOp::SlotAdd(voice_id.to_string()),
                StoreOp::Delete(reservation_key.clone()),
                StoreOp::SetEx {
                    key: slot_key(voice_id),
                    value,
                    ttl: self.slot_ttl,
                },
            ];
            if self.store.txn(watched, ops).await? {
                tracing::info!(voice_id, reservation = %reservation, "Acquired slot");
                return Ok(SlotGuard::new(Arc::clone(&self.store), voice_id.to_string()));
            }

            if Instant::now() >= deadline {
                return Err(AcquireError::Timeout);
            }
            tracing::debug!(voice_id, "Slot commit conflicted, retrying");
            tokio::task::yield_now().await;
        }
    }

    /// Idempotent status transition; refreshes the slot TTL.
    pub async fn update_status(&self, voice_id: &str, status: SlotStatus) {
        let key = slot_key(voice_id);
        let value = match self.store.get(&key).await {
            Ok(Some(value)) => value,
            Ok(None) => {
                tracing::warn!(voice_id, "Slot not found for status update");
                return;
            }
            Err(e) => {
                tracing::error!(voice_id, error = %e, "Error updating slot status");
                return;
            }
        };

        let mut meta: SlotMeta = match serde_json::from_str(&value) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(voice_id, error = %e, "Unparsable slot metadata");
                return;
            }
        };

        let now = chrono::Utc::now().timestamp();
        meta.status = status;
        meta.updated_at = Some(now);
        meta.expires_at = now + self.slot_ttl.as_secs() as i64;

        match serde_json::to_string(&meta) {
            Ok(value) => {
                if let Err(e) = self.store.set_ex(&key, &value, self.slot_ttl).await {
                    tracing::error!(voice_id, error = %e, "Error writing slot status");
                }
            }
            Err(e) => tracing::error!(voice_id, error = %e, "Error encoding slot metadata"),
        }
    }

    /// Remove slots whose metadata is missing or past expiry. Invoked lazily
    /// from capacity checks. Returns the number reclaimed; idempotent.
    pub async fn cleanup_expired(&self) -> usize {
        let slot_ids = match self.store.slot_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(error = %e, "Error listing slots during cleanup");
                return 0;
            }
        };

        let now = chrono::Utc::now().timestamp();
        let mut expired = Vec::new();
        for voice_id in slot_ids {
            match self.store.get(&slot_key(&voice_id)).await {
                Ok(Some(value)) => match serde_json::from_str::<SlotMeta>(&value) {
                    Ok(meta) if meta.expires_at > now => {}
                    _ => expired.push(voice_id),
                },
                Ok(None) => expired.push(voice_id),
                Err(e) => {
                    // Fail closed: never reclaim on a store error.
                    tracing::error!(error = %e, "Error reading slot metadata during cleanup");
                    return 0;
                }
            }
        }

        if expired.is_empty() {
            return 0;
        }

        let ops = expired
            .iter()
            .flat_map(|id| [StoreOp::SlotRemove(id.clone()), StoreOp::Delete(slot_key(id))])
            .collect();
        match self.store.apply(ops).await {
            Ok(()) => {
                tracing::info!(count = expired.len(), "Cleaned up expired slots");
                expired.len()
            }
            Err(e) => {
                tracing::error!(error = %e, "Error removing expired slots");
                0
            }
        }
    }
}

fn encode_meta<T: serde::Serialize>(meta: &T) -> Result<String, StoreError> {
    serde_json::to_string(meta)
        .map_err(|e| StoreError::Unavailable(format!("metadata encode failed: {e}")))
}

/// Scoped capability over one acquired slot.
///
/// Explicit [`release`](SlotGuard::release) removes the slot-set entry and
/// its metadata. If the guard is dropped without releasing (panic, client
/// disconnect), the release is spawned onto the runtime so the slot never
/// outlives its owner.
#[must_use = "dropping the guard releases the slot"]
pub struct SlotGuard {
    store: Arc<dyn SlotStore>,
    voice_id: String,
    released: bool,
}

impl SlotGuard {
    fn new(store: Arc<dyn SlotStore>, voice_id: String) -> Self {
        Self {
            store,
            voice_id,
            released: false,
        }
    }

    pub fn voice_id(&self) -> &str {
        &self.voice_id
    }

    pub async fn release(mut self) {
        self.released = true;
        release_slot(&self.store, &self.voice_id).await;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = Arc::clone(&self.store);
        let voice_id = std::mem::take(&mut self.voice_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(voice_id, "SlotGuard dropped without explicit release");
                handle.spawn(async move {
                    release_slot(&store, &voice_id).await;
                });
            }
            Err(_) => {
                tracing::error!(voice_id, "SlotGuard dropped outside a runtime - slot held until TTL");
            }
        }
    }
}

async fn release_slot(store: &Arc<dyn SlotStore>, voice_id: &str) {
    let ops = vec![
        StoreOp::SlotRemove(voice_id.to_string()),
        StoreOp::Delete(slot_key(voice_id)),
    ];
    match store.apply(ops).await {
        Ok(()) => tracing::info!(voice_id, "Released slot"),
        Err(e) => tracing::error!(voice_id, error = %e, "Error releasing slot"),
    }
}
